//! Dispatch of map commands through the `bpf(2)` system call.
//!
//! Every method builds one fresh [`Request`], issues it exactly once and
//! hands back the kernel's return value untouched: a file descriptor for
//! `BPF_OBJ_GET`, `0` on success otherwise, `-1` on failure with the reason
//! in `errno` (see [`Syscall::last_error`]).

pub mod attr;

#[cfg(test)]
pub(crate) mod fake;

use std::ffi::CStr;
use std::io;
use std::os::fd::RawFd;

pub use attr::{Attr, Command, Request, UpdateFlags, ATTR_SIZE};

/// The kernel entry point. [`Kernel`] is the real one; tests substitute
/// their own.
pub trait Syscall {
    fn bpf(&self, cmd: Command, attr: &mut Attr<'_>) -> i64;

    /// Reason for the most recent failed call on this thread.
    fn last_error(&self) -> io::Error {
        io::Error::last_os_error()
    }
}

#[derive(Debug, Default, Copy, Clone)]
pub struct Kernel;

impl Syscall for Kernel {
    fn bpf(&self, cmd: Command, attr: &mut Attr<'_>) -> i64 {
        let size = attr.len() as libc::c_uint;
        let ret = unsafe {
            libc::syscall(
                libc::SYS_bpf,
                cmd as libc::c_int,
                attr.as_mut_ptr(),
                size,
            )
        };
        i64::from(ret)
    }
}

#[derive(Debug, Default, Clone)]
pub struct Dispatcher<S = Kernel> {
    sys: S,
}

impl Dispatcher<Kernel> {
    pub fn new() -> Self {
        Dispatcher { sys: Kernel }
    }
}

impl<S: Syscall> Dispatcher<S> {
    pub fn with_syscall(sys: S) -> Self {
        Dispatcher { sys }
    }

    pub fn syscall(&self) -> &S {
        &self.sys
    }

    pub fn last_error(&self) -> io::Error {
        self.sys.last_error()
    }

    pub fn dispatch(&self, mut request: Request<'_>) -> i64 {
        let cmd = request.command();
        let mut attr = request.encode();
        self.sys.bpf(cmd, &mut attr)
    }

    /// Opens a pinned object, returning its descriptor or a negative value.
    pub fn obj_get(&self, path: &CStr) -> i64 {
        self.dispatch(Request::ObjGet { path })
    }

    pub fn lookup_elem(&self, fd: RawFd, key: &[u8], value: &mut [u8]) -> i64 {
        self.dispatch(Request::Lookup { fd, key, value })
    }

    pub fn update_elem(&self, fd: RawFd, key: &[u8], value: &[u8], flags: UpdateFlags) -> i64 {
        self.dispatch(Request::Update {
            fd,
            key,
            value,
            flags,
        })
    }

    pub fn delete_elem(&self, fd: RawFd, key: &[u8]) -> i64 {
        self.dispatch(Request::Delete { fd, key })
    }

    /// Writes the key following `key` into `next_key`. With `key: None` the
    /// first key is returned. Exhaustion is reported by the kernel as a
    /// failure with `ENOENT`.
    pub fn get_next_key(&self, fd: RawFd, key: Option<&[u8]>, next_key: &mut [u8]) -> i64 {
        self.dispatch(Request::GetNextKey { fd, key, next_key })
    }

    pub fn obj_get_info(&self, fd: RawFd, info: &mut [u8]) -> i64 {
        self.dispatch(Request::ObjGetInfo { fd, info })
    }
}
