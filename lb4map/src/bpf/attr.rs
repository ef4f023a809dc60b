//! Request records for the `bpf(2)` commands used on maps.
//!
//! The kernel takes a `union bpf_attr`; each command reads its own anonymous
//! struct out of it. A [`Request`] names one command and the buffers it
//! refers to, and [`Request::encode`] flattens it into a zeroed [`Attr`].

use std::ffi::CStr;
use std::marker::PhantomData;
use std::mem::size_of;
use std::os::fd::RawFd;

use bitflags::bitflags;

/// Size of the request record passed to the kernel. Covers the map element
/// and object commands; the kernel zero-extends anything shorter than its
/// own `union bpf_attr`.
pub const ATTR_SIZE: usize = 32;

// BPF_MAP_*_ELEM / BPF_MAP_GET_NEXT_KEY
const MAP_FD_OFFSET: usize = 0;
const KEY_OFFSET: usize = 8;
const VALUE_OFFSET: usize = 16;
const NEXT_KEY_OFFSET: usize = 16;
const FLAGS_OFFSET: usize = 24;

// BPF_OBJ_GET
const PATHNAME_OFFSET: usize = 0;

// BPF_OBJ_GET_INFO_BY_FD
const INFO_FD_OFFSET: usize = 0;
const INFO_LEN_OFFSET: usize = 4;
const INFO_OFFSET: usize = 8;

const _: () = assert!(FLAGS_OFFSET + size_of::<u64>() == ATTR_SIZE);
const _: () = assert!(size_of::<usize>() <= size_of::<u64>());

/// Command codes as numbered by the kernel's `enum bpf_cmd`.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Command {
    MapLookupElem = 1,
    MapUpdateElem = 2,
    MapDeleteElem = 3,
    MapGetNextKey = 4,
    ObjGet = 7,
    ObjGetInfoByFd = 15,
}

bitflags! {
    /// Creation policy for `BPF_MAP_UPDATE_ELEM`.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct UpdateFlags: u64 {
        /// Create a new element or update an existing one.
        const ANY = 0;
        /// Create a new element only if it did not exist.
        const NOEXIST = 1;
        /// Update an existing element.
        const EXIST = 2;
        /// Spin-lock the element while updating.
        const LOCK = 4;
    }
}

impl Default for UpdateFlags {
    fn default() -> Self {
        UpdateFlags::ANY
    }
}

/// One `bpf(2)` request. Each variant carries exactly the fields its command
/// reads; everything else in the encoded record stays zero.
#[derive(Debug)]
pub enum Request<'a> {
    ObjGet {
        path: &'a CStr,
    },
    Lookup {
        fd: RawFd,
        key: &'a [u8],
        value: &'a mut [u8],
    },
    Update {
        fd: RawFd,
        key: &'a [u8],
        value: &'a [u8],
        flags: UpdateFlags,
    },
    Delete {
        fd: RawFd,
        key: &'a [u8],
    },
    /// `key: None` asks for the first key of the map.
    GetNextKey {
        fd: RawFd,
        key: Option<&'a [u8]>,
        next_key: &'a mut [u8],
    },
    ObjGetInfo {
        fd: RawFd,
        info: &'a mut [u8],
    },
}

impl<'a> Request<'a> {
    pub fn command(&self) -> Command {
        match self {
            Request::ObjGet { .. } => Command::ObjGet,
            Request::Lookup { .. } => Command::MapLookupElem,
            Request::Update { .. } => Command::MapUpdateElem,
            Request::Delete { .. } => Command::MapDeleteElem,
            Request::GetNextKey { .. } => Command::MapGetNextKey,
            Request::ObjGetInfo { .. } => Command::ObjGetInfoByFd,
        }
    }

    /// Builds the record for this request. The returned [`Attr`] borrows the
    /// request, so every buffer it points into stays alive until the call.
    pub fn encode(&mut self) -> Attr<'_> {
        let mut attr = Attr::zeroed();
        match self {
            Request::ObjGet { path } => {
                attr.put_ptr(PATHNAME_OFFSET, path.as_ptr().cast());
            }
            Request::Lookup { fd, key, value } => {
                attr.put_fd(MAP_FD_OFFSET, *fd);
                attr.put_ptr(KEY_OFFSET, key.as_ptr());
                attr.put_ptr(VALUE_OFFSET, value.as_mut_ptr());
            }
            Request::Update {
                fd,
                key,
                value,
                flags,
            } => {
                attr.put_fd(MAP_FD_OFFSET, *fd);
                attr.put_ptr(KEY_OFFSET, key.as_ptr());
                attr.put_ptr(VALUE_OFFSET, value.as_ptr());
                attr.put_u64(FLAGS_OFFSET, flags.bits());
            }
            Request::Delete { fd, key } => {
                attr.put_fd(MAP_FD_OFFSET, *fd);
                attr.put_ptr(KEY_OFFSET, key.as_ptr());
            }
            Request::GetNextKey { fd, key, next_key } => {
                attr.put_fd(MAP_FD_OFFSET, *fd);
                if let Some(key) = key {
                    attr.put_ptr(KEY_OFFSET, key.as_ptr());
                }
                attr.put_ptr(NEXT_KEY_OFFSET, next_key.as_mut_ptr());
            }
            Request::ObjGetInfo { fd, info } => {
                attr.put_fd(INFO_FD_OFFSET, *fd);
                attr.put_u32(INFO_LEN_OFFSET, info.len() as u32);
                attr.put_ptr(INFO_OFFSET, info.as_mut_ptr());
            }
        }
        attr
    }
}

/// Encoded request record, laid out as the kernel's `union bpf_attr` with
/// fields in native byte order.
#[derive(Debug)]
pub struct Attr<'a> {
    buf: [u8; ATTR_SIZE],
    _borrow: PhantomData<&'a mut [u8]>,
}

impl<'a> Attr<'a> {
    fn zeroed() -> Self {
        Attr {
            buf: [0; ATTR_SIZE],
            _borrow: PhantomData,
        }
    }

    pub fn as_bytes(&self) -> &[u8; ATTR_SIZE] {
        &self.buf
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.buf.as_mut_ptr()
    }

    pub const fn len(&self) -> usize {
        ATTR_SIZE
    }

    pub const fn is_empty(&self) -> bool {
        false
    }

    pub fn u32_at(&self, offset: usize) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.buf[offset..offset + 4]);
        u32::from_ne_bytes(raw)
    }

    pub fn u64_at(&self, offset: usize) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.buf[offset..offset + 8]);
        u64::from_ne_bytes(raw)
    }

    fn put_u32(&mut self, offset: usize, value: u32) {
        self.buf[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
    }

    fn put_u64(&mut self, offset: usize, value: u64) {
        self.buf[offset..offset + 8].copy_from_slice(&value.to_ne_bytes());
    }

    fn put_fd(&mut self, offset: usize, fd: RawFd) {
        self.put_u32(offset, fd as u32);
    }

    // Pointers travel as __aligned_u64 regardless of the native word size.
    fn put_ptr(&mut self, offset: usize, ptr: *const u8) {
        self.put_u64(offset, ptr as usize as u64);
    }
}
