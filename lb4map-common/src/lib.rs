#![cfg_attr(not(test), no_std)]

//! Packed record layouts of the IPv4 load-balancer service map.
//!
//! Both records are plain byte arrays with fixed field offsets. The kernel
//! compares keys by their raw bytes, so the layout below is the contract:
//!
//! ```text
//! Lb4Key (8 bytes):
//! +-----------+---------+---------+
//! | address:4 | dport:2 | slave:2 |
//! +-----------+---------+---------+
//!
//! Lb4Service (12 bytes):
//! +----------+--------+---------+-----------------+----------+
//! | target:4 | port:2 | count:2 | rev_nat_index:2 | weight:2 |
//! +----------+--------+---------+-----------------+----------+
//! ```
//!
//! Field accessors read and write the stored value as-is. `address` and
//! `target` hold network byte order values; every 16-bit field is stored
//! without conversion.

#[cfg(feature = "user")]
use aya::Pod;

use core::array::TryFromSliceError;
use core::mem::size_of;

pub const LB4_KEY_LEN: usize = 8;
pub const KEY_ADDRESS_OFFSET: usize = 0;
pub const KEY_DPORT_OFFSET: usize = 4;
pub const KEY_SLAVE_OFFSET: usize = 6;

pub const LB4_SERVICE_LEN: usize = 12;
pub const SVC_TARGET_OFFSET: usize = 0;
pub const SVC_PORT_OFFSET: usize = 4;
pub const SVC_COUNT_OFFSET: usize = 6;
pub const SVC_REV_NAT_INDEX_OFFSET: usize = 8;
pub const SVC_WEIGHT_OFFSET: usize = 10;

const _: () = assert!(KEY_SLAVE_OFFSET + size_of::<u16>() == LB4_KEY_LEN);
const _: () = assert!(SVC_WEIGHT_OFFSET + size_of::<u16>() == LB4_SERVICE_LEN);
const _: () = assert!(size_of::<Lb4Key>() == LB4_KEY_LEN);
const _: () = assert!(size_of::<Lb4Service>() == LB4_SERVICE_LEN);

#[inline]
fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_ne_bytes(raw)
}

#[inline]
fn read_u16(buf: &[u8], offset: usize) -> u16 {
    let mut raw = [0u8; 2];
    raw.copy_from_slice(&buf[offset..offset + 2]);
    u16::from_ne_bytes(raw)
}

#[inline]
fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
}

#[inline]
fn write_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_ne_bytes());
}

/// Key of the service map: frontend address, destination port and backend
/// slot (0 is the master entry of a service).
#[repr(transparent)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct Lb4Key([u8; LB4_KEY_LEN]);

#[cfg(feature = "user")]
unsafe impl Pod for Lb4Key {}

impl Lb4Key {
    pub const LEN: usize = LB4_KEY_LEN;

    /// `address` must already be in network byte order.
    pub fn new(address: u32, dport: u16, slave: u16) -> Self {
        let mut key = Lb4Key([0; LB4_KEY_LEN]);
        key.set_address(address);
        key.set_dport(dport);
        key.set_slave(slave);
        key
    }

    pub const fn from_bytes(bytes: [u8; LB4_KEY_LEN]) -> Self {
        Lb4Key(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; LB4_KEY_LEN] {
        &self.0
    }

    pub fn address(&self) -> u32 {
        read_u32(&self.0, KEY_ADDRESS_OFFSET)
    }

    pub fn dport(&self) -> u16 {
        read_u16(&self.0, KEY_DPORT_OFFSET)
    }

    pub fn slave(&self) -> u16 {
        read_u16(&self.0, KEY_SLAVE_OFFSET)
    }

    pub fn set_address(&mut self, address: u32) {
        write_u32(&mut self.0, KEY_ADDRESS_OFFSET, address);
    }

    pub fn set_dport(&mut self, dport: u16) {
        write_u16(&mut self.0, KEY_DPORT_OFFSET, dport);
    }

    pub fn set_slave(&mut self, slave: u16) {
        write_u16(&mut self.0, KEY_SLAVE_OFFSET, slave);
    }
}

impl TryFrom<&[u8]> for Lb4Key {
    type Error = TryFromSliceError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        Ok(Lb4Key(bytes.try_into()?))
    }
}

/// Value of the service map. On the master entry `count` is the number of
/// backends; on a slave entry `target`/`port` name the backend.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct Lb4Service([u8; LB4_SERVICE_LEN]);

#[cfg(feature = "user")]
unsafe impl Pod for Lb4Service {}

impl Lb4Service {
    pub const LEN: usize = LB4_SERVICE_LEN;

    /// `target` must already be in network byte order.
    pub fn new(target: u32, port: u16, count: u16, rev_nat_index: u16, weight: u16) -> Self {
        let mut svc = Lb4Service([0; LB4_SERVICE_LEN]);
        write_u32(&mut svc.0, SVC_TARGET_OFFSET, target);
        write_u16(&mut svc.0, SVC_PORT_OFFSET, port);
        write_u16(&mut svc.0, SVC_COUNT_OFFSET, count);
        write_u16(&mut svc.0, SVC_REV_NAT_INDEX_OFFSET, rev_nat_index);
        write_u16(&mut svc.0, SVC_WEIGHT_OFFSET, weight);
        svc
    }

    pub const fn from_bytes(bytes: [u8; LB4_SERVICE_LEN]) -> Self {
        Lb4Service(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; LB4_SERVICE_LEN] {
        &self.0
    }

    pub fn target(&self) -> u32 {
        read_u32(&self.0, SVC_TARGET_OFFSET)
    }

    pub fn port(&self) -> u16 {
        read_u16(&self.0, SVC_PORT_OFFSET)
    }

    pub fn count(&self) -> u16 {
        read_u16(&self.0, SVC_COUNT_OFFSET)
    }

    pub fn rev_nat_index(&self) -> u16 {
        read_u16(&self.0, SVC_REV_NAT_INDEX_OFFSET)
    }

    pub fn weight(&self) -> u16 {
        read_u16(&self.0, SVC_WEIGHT_OFFSET)
    }
}

impl TryFrom<&[u8]> for Lb4Service {
    type Error = TryFromSliceError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        Ok(Lb4Service(bytes.try_into()?))
    }
}
