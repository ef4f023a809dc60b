//! Access to the IPv4 load-balancer service map pinned in the BPF
//! filesystem.
//!
//! [`bpf::Dispatcher`] issues single `bpf(2)` map commands and returns the
//! kernel's raw result. [`codec`] converts between host-order records and
//! the packed records stored in the map. [`Map`] and the [`service`]
//! helpers build typed, error-checked access on top.
//!
//! ## Example
//!
//! ```rust,no_run
//! let map = lb4map::Map::from_path("/sys/fs/bpf/tc/globals/cilium_lb4_services").unwrap();
//! for service in lb4map::service::list_services(&map).unwrap() {
//!     println!("{} -> {} backends", service.addr(), service.backends.len());
//! }
//! ```

pub mod bpf;
pub mod codec;
pub mod map;
pub mod service;

pub use bpf::{Command, Dispatcher, Kernel, Request, Syscall, UpdateFlags};
pub use codec::{
    pack_key, pack_service, release, unpack_key, unpack_service, PackError, PackedKey, ServiceKey,
    ServiceValue,
};
pub use lb4map_common::{Lb4Key, Lb4Service};
pub use map::{Error, Map, MapInfo, MapType};
