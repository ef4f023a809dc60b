//! In-memory stand-in for the kernel, interpreting encoded request records
//! against a single hash-like table.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::os::fd::IntoRawFd;
use std::slice;

use super::{Attr, Command, Syscall, UpdateFlags, ATTR_SIZE};

pub(crate) const FAKE_MAP_ID: u32 = 42;
pub(crate) const FAKE_MAP_NAME: &str = "cilium_lb4_serv";
pub(crate) const FAKE_MAP_TYPE: u32 = 1;
pub(crate) const FAKE_MAX_ENTRIES: u32 = 65536;

#[derive(Debug)]
pub(crate) struct Call {
    pub cmd: Command,
    pub record: [u8; ATTR_SIZE],
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
}

#[derive(Debug)]
pub(crate) struct FakeKernel {
    key_size: usize,
    value_size: usize,
    pub entries: RefCell<BTreeMap<Vec<u8>, Vec<u8>>>,
    pub calls: RefCell<Vec<Call>>,
    errno: RefCell<i32>,
    fail_with: Option<i32>,
}

impl FakeKernel {
    pub fn new(key_size: usize, value_size: usize) -> Self {
        FakeKernel {
            key_size,
            value_size,
            entries: RefCell::new(BTreeMap::new()),
            calls: RefCell::new(Vec::new()),
            errno: RefCell::new(0),
            fail_with: None,
        }
    }

    /// A kernel that rejects every command with `errno`.
    pub fn failing(key_size: usize, value_size: usize, errno: i32) -> Self {
        FakeKernel {
            fail_with: Some(errno),
            ..FakeKernel::new(key_size, value_size)
        }
    }

    pub fn commands(&self) -> Vec<Command> {
        self.calls.borrow().iter().map(|c| c.cmd).collect()
    }

    fn fail(&self, errno: i32) -> i64 {
        *self.errno.borrow_mut() = errno;
        -1
    }

    unsafe fn read(ptr: u64, len: usize) -> Option<Vec<u8>> {
        if ptr == 0 {
            return None;
        }
        Some(slice::from_raw_parts(ptr as usize as *const u8, len).to_vec())
    }

    unsafe fn write(ptr: u64, data: &[u8]) {
        let out = slice::from_raw_parts_mut(ptr as usize as *mut u8, data.len());
        out.copy_from_slice(data);
    }

    fn map_info(&self) -> [u8; 40] {
        let mut info = [0u8; 40];
        info[0..4].copy_from_slice(&FAKE_MAP_TYPE.to_ne_bytes());
        info[4..8].copy_from_slice(&FAKE_MAP_ID.to_ne_bytes());
        info[8..12].copy_from_slice(&(self.key_size as u32).to_ne_bytes());
        info[12..16].copy_from_slice(&(self.value_size as u32).to_ne_bytes());
        info[16..20].copy_from_slice(&FAKE_MAX_ENTRIES.to_ne_bytes());
        info[24..24 + FAKE_MAP_NAME.len()].copy_from_slice(FAKE_MAP_NAME.as_bytes());
        info
    }
}

impl Syscall for FakeKernel {
    fn bpf(&self, cmd: Command, attr: &mut Attr<'_>) -> i64 {
        let record = *attr.as_bytes();
        let key_ptr = attr.u64_at(8);
        let value_ptr = attr.u64_at(16);
        let (key, value) = match cmd {
            Command::MapLookupElem | Command::MapDeleteElem | Command::MapGetNextKey => {
                (unsafe { Self::read(key_ptr, self.key_size) }, None)
            }
            Command::MapUpdateElem => unsafe {
                (
                    Self::read(key_ptr, self.key_size),
                    Self::read(value_ptr, self.value_size),
                )
            },
            Command::ObjGet | Command::ObjGetInfoByFd => (None, None),
        };
        self.calls.borrow_mut().push(Call {
            cmd,
            record,
            key: key.clone(),
            value: value.clone(),
        });

        if let Some(errno) = self.fail_with {
            return self.fail(errno);
        }

        match cmd {
            Command::ObjGet => match File::open("/dev/null") {
                Ok(file) => i64::from(file.into_raw_fd()),
                Err(_) => self.fail(libc::EMFILE),
            },
            Command::ObjGetInfoByFd => {
                let len = attr.u32_at(4) as usize;
                let info = self.map_info();
                let len = len.min(info.len());
                unsafe { Self::write(attr.u64_at(8), &info[..len]) };
                0
            }
            Command::MapLookupElem => {
                let Some(key) = key else {
                    return self.fail(libc::EFAULT);
                };
                match self.entries.borrow().get(&key) {
                    Some(found) => {
                        unsafe { Self::write(value_ptr, found) };
                        0
                    }
                    None => self.fail(libc::ENOENT),
                }
            }
            Command::MapUpdateElem => {
                let (Some(key), Some(value)) = (key, value) else {
                    return self.fail(libc::EFAULT);
                };
                let flags = UpdateFlags::from_bits_retain(attr.u64_at(24));
                let mut entries = self.entries.borrow_mut();
                let exists = entries.contains_key(&key);
                if flags.contains(UpdateFlags::NOEXIST) && exists {
                    return self.fail(libc::EEXIST);
                }
                if flags.contains(UpdateFlags::EXIST) && !exists {
                    return self.fail(libc::ENOENT);
                }
                entries.insert(key, value);
                0
            }
            Command::MapDeleteElem => {
                let Some(key) = key else {
                    return self.fail(libc::EFAULT);
                };
                match self.entries.borrow_mut().remove(&key) {
                    Some(_) => 0,
                    None => self.fail(libc::ENOENT),
                }
            }
            Command::MapGetNextKey => {
                let entries = self.entries.borrow();
                let next = match &key {
                    Some(key) if entries.contains_key(key) => entries
                        .range::<Vec<u8>, _>((
                            std::ops::Bound::Excluded(key),
                            std::ops::Bound::Unbounded,
                        ))
                        .next(),
                    // Unknown or missing keys restart from the beginning.
                    _ => entries.iter().next(),
                };
                match next {
                    Some((next, _)) => {
                        unsafe { Self::write(value_ptr, next) };
                        0
                    }
                    None => self.fail(libc::ENOENT),
                }
            }
        }
    }

    fn last_error(&self) -> io::Error {
        io::Error::from_raw_os_error(*self.errno.borrow())
    }
}
