use serde::Deserialize;

use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;

#[derive(Debug, PartialEq, Deserialize, Eq, Hash, Clone, Copy)]
pub struct RealServer {
    pub addr: Ipv4Addr,
    pub port: u16,
}

impl From<RealServer> for SocketAddrV4 {
    fn from(real: RealServer) -> Self {
        SocketAddrV4::new(real.addr, real.port)
    }
}

#[derive(Debug, PartialEq, Deserialize)]
pub struct Vip {
    pub vip: Ipv4Addr,
    pub port: u16,
    #[serde(default)]
    pub real_servers: Vec<RealServer>,
}

impl Vip {
    pub fn frontend(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.vip, self.port)
    }

    pub fn backends(&self) -> Vec<SocketAddrV4> {
        self.real_servers.iter().copied().map(Into::into).collect()
    }
}

#[derive(Debug, PartialEq, Deserialize)]
pub struct Config {
    /// Used when `apply` is run without `--map`.
    pub map: Option<PathBuf>,
    pub services: Vec<Vip>,
}
