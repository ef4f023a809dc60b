//! Handle on a map pinned in the BPF filesystem.
//!
//! Unlike [`Dispatcher`], which returns raw kernel results, [`Map`] owns its
//! descriptor, checks record sizes and turns failures into [`Error`]s.

use std::ffi::CString;
use std::fmt::{self, Display};
use std::io;
use std::mem::size_of;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::{ptr, slice};

use aya::Pod;
use log::debug;
use thiserror::Error;

use crate::bpf::{Command, Dispatcher, Kernel, Syscall, UpdateFlags};
use crate::codec::PackError;

// Leading part of `struct bpf_map_info`, up to and including `name`.
const MAP_INFO_LEN: usize = 40;
const INFO_TYPE_OFFSET: usize = 0;
const INFO_ID_OFFSET: usize = 4;
const INFO_KEY_SIZE_OFFSET: usize = 8;
const INFO_VALUE_SIZE_OFFSET: usize = 12;
const INFO_MAX_ENTRIES_OFFSET: usize = 16;
const INFO_MAP_FLAGS_OFFSET: usize = 20;
const INFO_NAME_OFFSET: usize = 24;
const INFO_NAME_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid map path {0:?}")]
    InvalidPath(PathBuf),

    #[error("failed to open pinned map {path:?}: {source}")]
    ObjGet {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to query map info: {0}")]
    Info(#[source] io::Error),

    #[error("key size mismatch: map expects {expected} bytes, got {got}")]
    KeySize { expected: usize, got: usize },

    #[error("value size mismatch: map expects {expected} bytes, got {got}")]
    ValueSize { expected: usize, got: usize },

    #[error("{command:?} failed: {source}")]
    Syscall {
        command: Command,
        #[source]
        source: io::Error,
    },

    #[error("too many backends for one service: {0}")]
    TooManyBackends(usize),

    #[error(transparent)]
    Pack(#[from] PackError),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Syscall { source, .. } => source.raw_os_error() == Some(libc::ENOENT),
            _ => false,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MapType {
    Unspec,
    Hash,
    Array,
    ProgArray,
    PerfEventArray,
    PerCpuHash,
    PerCpuArray,
    StackTrace,
    CgroupArray,
    LruHash,
    LruPerCpuHash,
    LpmTrie,
    ArrayOfMaps,
    HashOfMaps,
    Unknown(u32),
}

impl From<u32> for MapType {
    fn from(val: u32) -> MapType {
        use MapType::*;

        match val {
            0 => Unspec,
            1 => Hash,
            2 => Array,
            3 => ProgArray,
            4 => PerfEventArray,
            5 => PerCpuHash,
            6 => PerCpuArray,
            7 => StackTrace,
            8 => CgroupArray,
            9 => LruHash,
            10 => LruPerCpuHash,
            11 => LpmTrie,
            12 => ArrayOfMaps,
            13 => HashOfMaps,
            other => Unknown(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapInfo {
    pub map_type: MapType,
    pub id: u32,
    pub key_size: usize,
    pub value_size: usize,
    pub max_entries: usize,
    pub map_flags: u32,
    pub name: String,
}

impl MapInfo {
    fn parse(raw: &[u8; MAP_INFO_LEN]) -> MapInfo {
        let u32_at = |offset: usize| {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&raw[offset..offset + 4]);
            u32::from_ne_bytes(buf)
        };
        let name = &raw[INFO_NAME_OFFSET..INFO_NAME_OFFSET + INFO_NAME_LEN];
        let name_len = name.iter().position(|b| *b == 0).unwrap_or(INFO_NAME_LEN);

        MapInfo {
            map_type: MapType::from(u32_at(INFO_TYPE_OFFSET)),
            id: u32_at(INFO_ID_OFFSET),
            key_size: u32_at(INFO_KEY_SIZE_OFFSET) as usize,
            value_size: u32_at(INFO_VALUE_SIZE_OFFSET) as usize,
            max_entries: u32_at(INFO_MAX_ENTRIES_OFFSET) as usize,
            map_flags: u32_at(INFO_MAP_FLAGS_OFFSET),
            name: String::from_utf8_lossy(&name[..name_len]).into_owned(),
        }
    }
}

impl Display for MapInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Name:          {}", self.name)?;
        writeln!(f, "Id:            {}", self.id)?;
        writeln!(f, "Type:          {:?}", self.map_type)?;
        writeln!(f, "Key size:      {}", self.key_size)?;
        writeln!(f, "Value size:    {}", self.value_size)?;
        writeln!(f, "Max entries:   {}", self.max_entries)?;
        write!(f, "Flags:         {:#x}", self.map_flags)
    }
}

#[derive(Debug)]
pub struct Map<S: Syscall = Kernel> {
    fd: OwnedFd,
    info: MapInfo,
    dispatcher: Dispatcher<S>,
}

impl Map<Kernel> {
    /// Opens a map pinned at `path`, e.g.
    /// `/sys/fs/bpf/tc/globals/cilium_lb4_services`.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        Map::open_with(Dispatcher::new(), path)
    }
}

impl<S: Syscall> Map<S> {
    pub fn open_with<P: AsRef<Path>>(dispatcher: Dispatcher<S>, path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| Error::InvalidPath(path.to_path_buf()))?;

        let ret = dispatcher.obj_get(&c_path);
        if ret < 0 {
            return Err(Error::ObjGet {
                path: path.to_path_buf(),
                source: dispatcher.last_error(),
            });
        }
        // The kernel handed us a fresh descriptor which nobody else owns.
        let fd = unsafe { OwnedFd::from_raw_fd(ret as RawFd) };

        let mut raw = [0u8; MAP_INFO_LEN];
        if dispatcher.obj_get_info(fd.as_raw_fd(), &mut raw) < 0 {
            return Err(Error::Info(dispatcher.last_error()));
        }
        let info = MapInfo::parse(&raw);
        debug!(
            "opened map {:?} (fd {}, {:?}, key {} bytes, value {} bytes)",
            path,
            fd.as_raw_fd(),
            info.map_type,
            info.key_size,
            info.value_size
        );

        Ok(Map {
            fd,
            info,
            dispatcher,
        })
    }

    pub fn info(&self) -> &MapInfo {
        &self.info
    }

    pub fn key_size(&self) -> usize {
        self.info.key_size
    }

    pub fn value_size(&self) -> usize {
        self.info.value_size
    }

    pub fn dispatcher(&self) -> &Dispatcher<S> {
        &self.dispatcher
    }

    /// Turns a raw dispatcher result into a `Result`.
    pub fn check(&self, command: Command, ret: i64) -> Result<i64, Error> {
        if ret < 0 {
            Err(Error::Syscall {
                command,
                source: self.dispatcher.last_error(),
            })
        } else {
            Ok(ret)
        }
    }

    pub fn check_key(&self, key: &[u8]) -> Result<(), Error> {
        if key.len() != self.info.key_size {
            return Err(Error::KeySize {
                expected: self.info.key_size,
                got: key.len(),
            });
        }
        Ok(())
    }

    pub fn check_value(&self, value: &[u8]) -> Result<(), Error> {
        if value.len() != self.info.value_size {
            return Err(Error::ValueSize {
                expected: self.info.value_size,
                got: value.len(),
            });
        }
        Ok(())
    }

    /// Returns `None` when `key` is not in the map.
    pub fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        self.check_key(key)?;

        let mut value = vec![0u8; self.info.value_size];
        let ret = self
            .dispatcher
            .lookup_elem(self.fd.as_raw_fd(), key, &mut value);
        match self.check(Command::MapLookupElem, ret) {
            Ok(_) => Ok(Some(value)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn update(&self, key: &[u8], value: &[u8], flags: UpdateFlags) -> Result<(), Error> {
        self.check_key(key)?;
        self.check_value(value)?;

        let ret = self
            .dispatcher
            .update_elem(self.fd.as_raw_fd(), key, value, flags);
        self.check(Command::MapUpdateElem, ret).map(|_| ())
    }

    pub fn delete(&self, key: &[u8]) -> Result<(), Error> {
        self.check_key(key)?;

        let ret = self.dispatcher.delete_elem(self.fd.as_raw_fd(), key);
        self.check(Command::MapDeleteElem, ret).map(|_| ())
    }

    /// Key following `key`, the first key with `None`. Returns `None` once
    /// the map is exhausted.
    pub fn next_key(&self, key: Option<&[u8]>) -> Result<Option<Vec<u8>>, Error> {
        if let Some(key) = key {
            self.check_key(key)?;
        }

        let mut next = vec![0u8; self.info.key_size];
        let ret = self
            .dispatcher
            .get_next_key(self.fd.as_raw_fd(), key, &mut next);
        match self.check(Command::MapGetNextKey, ret) {
            Ok(_) => Ok(Some(next)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn keys(&self) -> Keys<'_, S> {
        Keys {
            map: self,
            current: None,
            done: false,
        }
    }

    /// Iterates `(key, value)` pairs. Keys removed while iterating are
    /// skipped.
    pub fn iter(&self) -> Entries<'_, S> {
        Entries { keys: self.keys() }
    }

    pub fn get<K: Pod, V: Pod>(&self, key: &K) -> Result<Option<V>, Error> {
        self.check_value_type::<V>()?;
        Ok(self
            .lookup(pod_bytes(key))?
            .map(|raw| unsafe { ptr::read_unaligned(raw.as_ptr().cast::<V>()) }))
    }

    pub fn insert<K: Pod, V: Pod>(&self, key: &K, value: &V, flags: UpdateFlags) -> Result<(), Error> {
        self.update(pod_bytes(key), pod_bytes(value), flags)
    }

    pub fn remove<K: Pod>(&self, key: &K) -> Result<(), Error> {
        self.delete(pod_bytes(key))
    }

    fn check_value_type<V>(&self) -> Result<(), Error> {
        if size_of::<V>() != self.info.value_size {
            return Err(Error::ValueSize {
                expected: self.info.value_size,
                got: size_of::<V>(),
            });
        }
        Ok(())
    }
}

impl<S: Syscall> AsFd for Map<S> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl<S: Syscall> AsRawFd for Map<S> {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl<'a, S: Syscall> IntoIterator for &'a Map<S> {
    type Item = Result<(Vec<u8>, Vec<u8>), Error>;
    type IntoIter = Entries<'a, S>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

fn pod_bytes<T: Pod>(val: &T) -> &[u8] {
    unsafe { slice::from_raw_parts((val as *const T).cast::<u8>(), size_of::<T>()) }
}

pub struct Keys<'a, S: Syscall = Kernel> {
    map: &'a Map<S>,
    current: Option<Vec<u8>>,
    done: bool,
}

impl<S: Syscall> Iterator for Keys<'_, S> {
    type Item = Result<Vec<u8>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.map.next_key(self.current.as_deref()) {
            Ok(Some(key)) => {
                self.current = Some(key.clone());
                Some(Ok(key))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

pub struct Entries<'a, S: Syscall = Kernel> {
    keys: Keys<'a, S>,
}

impl<S: Syscall> Iterator for Entries<'_, S> {
    type Item = Result<(Vec<u8>, Vec<u8>), Error>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let key = match self.keys.next()? {
                Ok(key) => key,
                Err(e) => return Some(Err(e)),
            };
            match self.keys.map.lookup(&key) {
                Ok(Some(value)) => return Some(Ok((key, value))),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bpf::fake::{FakeKernel, FAKE_MAP_ID, FAKE_MAP_NAME, FAKE_MAX_ENTRIES};
    use lb4map_common::{Lb4Key, Lb4Service};

    fn open(kernel: FakeKernel) -> Map<FakeKernel> {
        Map::open_with(Dispatcher::with_syscall(kernel), "/sys/fs/bpf/tc/globals/test").unwrap()
    }

    #[test]
    fn open_reads_map_info() {
        let map = open(FakeKernel::new(8, 12));
        let info = map.info();

        assert_eq!(info.map_type, MapType::Hash);
        assert_eq!(info.id, FAKE_MAP_ID);
        assert_eq!(info.key_size, 8);
        assert_eq!(info.value_size, 12);
        assert_eq!(info.max_entries, FAKE_MAX_ENTRIES as usize);
        assert_eq!(info.name, FAKE_MAP_NAME);
        assert!(info.to_string().contains("Key size:      8"));
        assert_eq!(
            map.dispatcher().syscall().commands(),
            vec![Command::ObjGet, Command::ObjGetInfoByFd]
        );
    }

    #[test]
    fn open_failure_keeps_errno() {
        let kernel = FakeKernel::failing(8, 12, libc::ENOENT);
        let err = Map::open_with(Dispatcher::with_syscall(kernel), "/sys/fs/bpf/nope").unwrap_err();

        match err {
            Error::ObjGet { path, source } => {
                assert_eq!(path, PathBuf::from("/sys/fs/bpf/nope"));
                assert_eq!(source.raw_os_error(), Some(libc::ENOENT));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn path_with_nul_is_rejected() {
        let err = Map::open_with(
            Dispatcher::with_syscall(FakeKernel::new(8, 12)),
            "/sys/fs/bpf/a\0b",
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidPath(_)));
    }

    #[test]
    fn update_lookup_delete() {
        let map = open(FakeKernel::new(4, 4));

        assert_eq!(map.lookup(&[1, 2, 3, 4]).unwrap(), None);
        map.update(&[1, 2, 3, 4], &[9, 9, 9, 9], UpdateFlags::ANY).unwrap();
        assert_eq!(map.lookup(&[1, 2, 3, 4]).unwrap(), Some(vec![9, 9, 9, 9]));

        map.delete(&[1, 2, 3, 4]).unwrap();
        assert_eq!(map.lookup(&[1, 2, 3, 4]).unwrap(), None);

        let err = map.delete(&[1, 2, 3, 4]).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn update_flags_reach_the_kernel() {
        let map = open(FakeKernel::new(4, 4));

        let err = map
            .update(&[0; 4], &[1; 4], UpdateFlags::EXIST)
            .unwrap_err();
        assert!(err.is_not_found());

        map.update(&[0; 4], &[1; 4], UpdateFlags::NOEXIST).unwrap();
        let err = map
            .update(&[0; 4], &[2; 4], UpdateFlags::NOEXIST)
            .unwrap_err();
        match err {
            Error::Syscall { command, source } => {
                assert_eq!(command, Command::MapUpdateElem);
                assert_eq!(source.raw_os_error(), Some(libc::EEXIST));
            }
            other => panic!("unexpected error: {other}"),
        }

        map.update(&[0; 4], &[3; 4], UpdateFlags::EXIST).unwrap();
        assert_eq!(map.lookup(&[0; 4]).unwrap(), Some(vec![3; 4]));
    }

    #[test]
    fn size_mismatch_is_caught_before_dispatch() {
        let map = open(FakeKernel::new(8, 12));
        let before = map.dispatcher().syscall().calls.borrow().len();

        assert!(matches!(
            map.lookup(&[0; 4]),
            Err(Error::KeySize {
                expected: 8,
                got: 4
            })
        ));
        assert!(matches!(
            map.update(&[0; 8], &[0; 8], UpdateFlags::ANY),
            Err(Error::ValueSize {
                expected: 12,
                got: 8
            })
        ));
        assert!(matches!(
            map.get::<Lb4Key, u32>(&Lb4Key::default()),
            Err(Error::ValueSize { .. })
        ));

        assert_eq!(map.dispatcher().syscall().calls.borrow().len(), before);
    }

    #[test]
    fn iteration_visits_every_entry_once() {
        let map = open(FakeKernel::new(2, 1));
        for i in 0..5u8 {
            map.update(&[0, i], &[i * 10], UpdateFlags::ANY).unwrap();
        }

        let entries: Vec<(Vec<u8>, Vec<u8>)> = map.iter().collect::<Result<_, _>>().unwrap();
        assert_eq!(entries.len(), 5);
        for (i, (key, value)) in entries.iter().enumerate() {
            assert_eq!(key, &vec![0, i as u8]);
            assert_eq!(value, &vec![i as u8 * 10]);
        }

        assert_eq!(map.keys().count(), 5);
    }

    #[test]
    fn empty_map_iterates_nothing() {
        let map = open(FakeKernel::new(8, 12));
        assert_eq!(map.next_key(None).unwrap(), None);
        assert_eq!((&map).into_iter().count(), 0);
    }

    #[test]
    fn iteration_stops_on_error() {
        let map = open(FakeKernel::new(8, 12));
        let failing = Map {
            fd: map.fd.try_clone().unwrap(),
            info: map.info.clone(),
            dispatcher: Dispatcher::with_syscall(FakeKernel::failing(8, 12, libc::EPERM)),
        };

        let mut keys = failing.keys();
        let first = keys.next().unwrap().unwrap_err();
        assert!(!first.is_not_found());
        assert!(keys.next().is_none());
    }

    #[test]
    fn typed_access_uses_pod_layout() {
        let map = open(FakeKernel::new(8, 12));
        let key = Lb4Key::new(0x0a00_0001u32.to_be(), 80, 0);
        let value = Lb4Service::new(0x0a00_0002u32.to_be(), 8080, 2, 0, 0);

        map.insert(&key, &value, UpdateFlags::ANY).unwrap();
        assert_eq!(map.get::<_, Lb4Service>(&key).unwrap(), Some(value));
        assert_eq!(
            map.lookup(key.as_bytes()).unwrap().as_deref(),
            Some(&value.as_bytes()[..])
        );

        map.remove(&key).unwrap();
        assert_eq!(map.get::<_, Lb4Service>(&key).unwrap(), None);
    }

    #[test]
    fn unknown_map_type_is_preserved() {
        assert_eq!(MapType::from(1), MapType::Hash);
        assert_eq!(MapType::from(11), MapType::LpmTrie);
        assert_eq!(MapType::from(99), MapType::Unknown(99));
    }
}
