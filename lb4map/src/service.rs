//! Load-balancer services stored in an `lb4_services` map.
//!
//! A service is one master entry (`slave == 0`) whose value carries the
//! backend count, followed by one entry per backend at `slave` 1..=count.

use std::collections::BTreeMap;
use std::net::SocketAddrV4;
use std::ops::RangeInclusive;
use std::os::fd::{AsRawFd, RawFd};

use lb4map_common::{Lb4Key, Lb4Service};
use log::debug;

use crate::bpf::{Command, Dispatcher, Syscall, UpdateFlags};
use crate::codec::{pack_key, release, unpack_key, unpack_service, ServiceKey, ServiceValue};
use crate::map::{Error, Map};

impl<S: Syscall> Dispatcher<S> {
    /// Writes one service map entry built from scalars with the default
    /// create-or-replace policy. Addresses are in host byte order.
    ///
    /// `port` becomes the key's `dport` and `dport` the value's `port`.
    #[allow(clippy::too_many_arguments)]
    pub fn set_service(
        &self,
        fd: RawFd,
        daddr: u32,
        port: u16,
        slave: u16,
        target: u32,
        dport: u16,
        count: u16,
    ) -> i64 {
        self.set_service_with_flags(fd, daddr, port, slave, target, dport, count, UpdateFlags::ANY)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn set_service_with_flags(
        &self,
        fd: RawFd,
        daddr: u32,
        port: u16,
        slave: u16,
        target: u32,
        dport: u16,
        count: u16,
        flags: UpdateFlags,
    ) -> i64 {
        let key = Lb4Key::new(daddr.to_be(), port, slave);
        let value = Lb4Service::new(target.to_be(), dport, count, 0, 0);
        self.update_elem(fd, key.as_bytes(), value.as_bytes(), flags)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub frontend: ServiceKey,
    /// Value of the master entry, if present in the map.
    pub master: Option<ServiceValue>,
    /// Backends ordered by slave index.
    pub backends: Vec<(u16, ServiceValue)>,
}

impl Service {
    pub fn addr(&self) -> SocketAddrV4 {
        self.frontend.addr()
    }
}

fn check_layout<S: Syscall>(map: &Map<S>) -> Result<(), Error> {
    if map.key_size() != Lb4Key::LEN {
        return Err(Error::KeySize {
            expected: map.key_size(),
            got: Lb4Key::LEN,
        });
    }
    if map.value_size() != Lb4Service::LEN {
        return Err(Error::ValueSize {
            expected: map.value_size(),
            got: Lb4Service::LEN,
        });
    }
    Ok(())
}

fn value_from(raw: &[u8]) -> Result<ServiceValue, Error> {
    let wire = Lb4Service::try_from(raw).map_err(|_| Error::ValueSize {
        expected: Lb4Service::LEN,
        got: raw.len(),
    })?;
    Ok(unpack_service(&wire))
}

/// Looks up a single entry, master or backend.
pub fn lookup_service<S: Syscall>(
    map: &Map<S>,
    key: &ServiceKey,
) -> Result<Option<ServiceValue>, Error> {
    check_layout(map)?;

    let packed = pack_key(key)?;
    let found = map.lookup(packed.as_bytes());
    release(packed);

    found?.map(|raw| value_from(&raw)).transpose()
}

/// Reads every entry and groups backends under their master key.
pub fn list_services<S: Syscall>(map: &Map<S>) -> Result<Vec<Service>, Error> {
    check_layout(map)?;

    let mut services: BTreeMap<ServiceKey, Service> = BTreeMap::new();
    for entry in map {
        let (key, value) = entry?;
        let key = unpack_key(&Lb4Key::try_from(key.as_slice()).map_err(|_| Error::KeySize {
            expected: Lb4Key::LEN,
            got: key.len(),
        })?);
        let value = value_from(&value)?;

        let service = services.entry(key.master()).or_insert_with(|| Service {
            frontend: key.master(),
            master: None,
            backends: Vec::new(),
        });
        if key.is_master() {
            service.master = Some(value);
        } else {
            service.backends.push((key.slave, value));
        }
    }

    let mut services: Vec<Service> = services.into_values().collect();
    for service in &mut services {
        service.backends.sort_by_key(|(slave, _)| *slave);
    }
    Ok(services)
}

/// Installs `frontend` with `backends` at slaves 1..=n, then the master
/// entry carrying the count. Slots left over from an earlier, larger
/// installation are removed afterwards.
pub fn add_service<S: Syscall>(
    map: &Map<S>,
    frontend: SocketAddrV4,
    backends: &[SocketAddrV4],
) -> Result<(), Error> {
    check_layout(map)?;

    let front = ServiceKey::new(frontend);
    let count =
        u16::try_from(backends.len()).map_err(|_| Error::TooManyBackends(backends.len()))?;
    let old_count = lookup_service(map, &front)?.map_or(0, |master| master.count);
    let dispatcher = map.dispatcher();

    for (slave, backend) in (1..=count).zip(backends) {
        let target = ServiceValue::new(*backend, 0);
        let ret = dispatcher.set_service(
            map.as_raw_fd(),
            front.address,
            front.dport,
            slave,
            target.target,
            target.port,
            0,
        );
        map.check(Command::MapUpdateElem, ret)?;
        debug!("{} slave {} -> {}", frontend, slave, backend);
    }

    let ret = dispatcher.set_service(
        map.as_raw_fd(),
        front.address,
        front.dport,
        0,
        0,
        0,
        count,
    );
    map.check(Command::MapUpdateElem, ret)?;
    debug!("{} master with {} backends", frontend, count);

    if old_count > count {
        let pruned = remove_slaves(map, &front, count + 1..=old_count)?;
        debug!("{} pruned {} stale backends", frontend, pruned);
    }

    Ok(())
}

/// Deletes the given backend slots of `front`. Slots that are already gone
/// are skipped; returns how many entries were removed.
fn remove_slaves<S: Syscall>(
    map: &Map<S>,
    front: &ServiceKey,
    slaves: RangeInclusive<u16>,
) -> Result<u16, Error> {
    let mut removed = 0;
    for slave in slaves {
        match map.remove(&front.with_slave(slave).to_wire()) {
            Ok(()) => removed += 1,
            Err(e) if e.is_not_found() => debug!("{} slave {} already gone", front.addr(), slave),
            Err(e) => return Err(e),
        }
    }
    Ok(removed)
}

/// Removes the backends announced by the master entry, then the master.
/// Returns the number of backends removed, or `None` when the service does
/// not exist.
pub fn delete_service<S: Syscall>(
    map: &Map<S>,
    frontend: SocketAddrV4,
) -> Result<Option<u16>, Error> {
    check_layout(map)?;

    let front = ServiceKey::new(frontend);
    let Some(master) = lookup_service(map, &front)? else {
        return Ok(None);
    };
    let removed = remove_slaves(map, &front, 1..=master.count)?;
    map.remove(&front.to_wire())?;
    debug!("removed {} with {} backends", frontend, removed);

    Ok(Some(removed))
}
