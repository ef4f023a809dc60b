//! Conversion between host-order service records and the packed records
//! stored in the kernel map.
//!
//! Only the 32-bit addresses change byte order; ports, counts and indices
//! are copied as they are.

use std::collections::TryReserveError;
use std::net::{Ipv4Addr, SocketAddrV4};

use lb4map_common::{Lb4Key, Lb4Service, LB4_KEY_LEN};
use thiserror::Error;

/// Frontend of a service, or one of its backend slots when `slave > 0`.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceKey {
    /// Host byte order.
    pub address: u32,
    pub dport: u16,
    pub slave: u16,
}

impl ServiceKey {
    pub fn new<A: Into<SocketAddrV4>>(addr: A) -> Self {
        let addr = addr.into();
        ServiceKey {
            address: u32::from(*addr.ip()),
            dport: addr.port(),
            slave: 0,
        }
    }

    pub fn with_slave(self, slave: u16) -> Self {
        ServiceKey { slave, ..self }
    }

    /// The master entry of the service this key belongs to.
    pub fn master(&self) -> Self {
        self.with_slave(0)
    }

    pub fn is_master(&self) -> bool {
        self.slave == 0
    }

    pub fn addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::from(self.address), self.dport)
    }

    pub fn to_wire(&self) -> Lb4Key {
        Lb4Key::new(self.address.to_be(), self.dport, self.slave)
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct ServiceValue {
    /// Host byte order.
    pub target: u32,
    pub port: u16,
    pub count: u16,
    pub rev_nat_index: u16,
    pub weight: u16,
}

impl ServiceValue {
    pub fn new<A: Into<SocketAddrV4>>(addr: A, count: u16) -> Self {
        let addr = addr.into();
        ServiceValue {
            target: u32::from(*addr.ip()),
            port: addr.port(),
            count,
            ..ServiceValue::default()
        }
    }

    pub fn target(&self) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::from(self.target), self.port)
    }

    pub fn to_wire(&self) -> Lb4Service {
        pack_service(self)
    }
}

#[derive(Debug, Error)]
pub enum PackError {
    #[error("failed to allocate packed key: {0}")]
    Alloc(#[from] TryReserveError),
}

/// Heap-allocated packed key handed out by [`pack_key`]. Dropping it, or
/// passing it to [`release`], frees it.
#[derive(Debug, PartialEq, Eq)]
pub struct PackedKey {
    buf: Box<[u8]>,
}

impl PackedKey {
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn wire(&self) -> Lb4Key {
        let mut raw = [0u8; LB4_KEY_LEN];
        raw.copy_from_slice(&self.buf);
        Lb4Key::from_bytes(raw)
    }
}

pub fn pack_key(key: &ServiceKey) -> Result<PackedKey, PackError> {
    let wire = key.to_wire();
    let mut buf = Vec::new();
    buf.try_reserve_exact(LB4_KEY_LEN)?;
    buf.extend_from_slice(wire.as_bytes());
    Ok(PackedKey {
        buf: buf.into_boxed_slice(),
    })
}

pub fn unpack_key(wire: &Lb4Key) -> ServiceKey {
    ServiceKey {
        address: u32::from_be(wire.address()),
        dport: wire.dport(),
        slave: wire.slave(),
    }
}

pub fn pack_service(value: &ServiceValue) -> Lb4Service {
    Lb4Service::new(
        value.target.to_be(),
        value.port,
        value.count,
        value.rev_nat_index,
        value.weight,
    )
}

pub fn unpack_service(wire: &Lb4Service) -> ServiceValue {
    ServiceValue {
        target: u32::from_be(wire.target()),
        port: wire.port(),
        count: wire.count(),
        rev_nat_index: wire.rev_nat_index(),
        weight: wire.weight(),
    }
}

pub fn release(key: PackedKey) {
    drop(key);
}
