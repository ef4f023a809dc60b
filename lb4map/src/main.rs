mod config;
mod hexdump;

use std::fs::File;
use std::io::Read;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use config::Config;
use hexdump::HexDump;
use lb4map::service::{add_service, delete_service, list_services};
use lb4map::{Map, UpdateFlags};
use log::{debug, info};

const DEFAULT_SERVICES_MAP: &str = "/sys/fs/bpf/tc/globals/cilium_lb4_services";

#[derive(Debug, Parser)]
#[command(name = "lb4map", about = "Inspect and edit pinned IPv4 load-balancer maps")]
struct Opt {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print metadata of a pinned map
    Info { map: PathBuf },
    /// Hex dump every entry of a pinned map
    Dump { map: PathBuf },
    /// List services and their backends
    List {
        #[arg(short, long, default_value = DEFAULT_SERVICES_MAP)]
        map: PathBuf,
    },
    /// Write a single service map entry
    Set {
        #[arg(short, long, default_value = DEFAULT_SERVICES_MAP)]
        map: PathBuf,
        /// Frontend address
        #[arg(long)]
        daddr: Ipv4Addr,
        /// Frontend port (stored in the key)
        #[arg(long)]
        port: u16,
        /// Backend slot, 0 for the master entry
        #[arg(long, default_value_t = 0)]
        slave: u16,
        /// Backend address
        #[arg(long, default_value_t = Ipv4Addr::UNSPECIFIED)]
        target: Ipv4Addr,
        /// Backend port (stored in the value)
        #[arg(long, default_value_t = 0)]
        dport: u16,
        /// Number of backends, meaningful on the master entry
        #[arg(long, default_value_t = 0)]
        count: u16,
        #[arg(long, value_enum, default_value_t = Policy::Any)]
        policy: Policy,
    },
    /// Install the services described in a YAML file
    Apply {
        /// Map to write; takes precedence over `map` in the config file
        #[arg(short, long)]
        map: Option<PathBuf>,
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Delete a service and all of its backends
    Del {
        #[arg(short, long, default_value = DEFAULT_SERVICES_MAP)]
        map: PathBuf,
        #[arg(long)]
        vip: Ipv4Addr,
        #[arg(long)]
        port: u16,
    },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
enum Policy {
    /// Create or replace
    Any,
    /// Only create
    Noexist,
    /// Only replace
    Exist,
}

impl From<Policy> for UpdateFlags {
    fn from(policy: Policy) -> Self {
        match policy {
            Policy::Any => UpdateFlags::ANY,
            Policy::Noexist => UpdateFlags::NOEXIST,
            Policy::Exist => UpdateFlags::EXIST,
        }
    }
}

fn load_config(path: &Path) -> Result<Config, anyhow::Error> {
    let mut config_file = File::open(path)?;
    let mut config_contents = String::new();
    config_file.read_to_string(&mut config_contents)?;
    let config: Config = serde_yaml::from_str(&config_contents)?;
    Ok(config)
}

/// Command line first, then the config file, then the default map.
fn apply_target(cli: Option<PathBuf>, from_config: Option<&Path>) -> PathBuf {
    cli.or_else(|| from_config.map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SERVICES_MAP))
}

fn open(path: &Path) -> Result<Map, anyhow::Error> {
    let map = Map::from_path(path).with_context(|| format!("failed to open map {:?}", path))?;
    debug!("{:?}: {}", path, map.info().name);
    Ok(map)
}

fn dump(map: &Map) -> Result<(), anyhow::Error> {
    for entry in map {
        let (key, value) = entry.context("failed to read map entry")?;
        println!("Key:");
        print!("{}", HexDump(&key));
        println!("Value:");
        print!("{}", HexDump(&value));
        println!();
    }
    Ok(())
}

fn list(map: &Map) -> Result<(), anyhow::Error> {
    for service in list_services(map).context("failed to read services")? {
        match service.master {
            Some(master) => println!("{} ({} backends) ->", service.addr(), master.count),
            None => println!("{} (no master entry) ->", service.addr()),
        }
        for (slave, backend) in &service.backends {
            println!("    ({}) {}", slave, backend.target());
        }
    }
    Ok(())
}

fn main() -> Result<(), anyhow::Error> {
    env_logger::init();

    let opt = Opt::parse();

    match opt.command {
        Commands::Info { map } => {
            let map = open(&map)?;
            println!("{}", map.info());
        }
        Commands::Dump { map } => dump(&open(&map)?)?,
        Commands::List { map } => list(&open(&map)?)?,
        Commands::Set {
            map,
            daddr,
            port,
            slave,
            target,
            dport,
            count,
            policy,
        } => {
            let map = open(&map)?;
            let ret = map.dispatcher().set_service_with_flags(
                map.as_raw_fd(),
                u32::from(daddr),
                port,
                slave,
                u32::from(target),
                dport,
                count,
                policy.into(),
            );
            if ret < 0 {
                bail!(
                    "failed to set {} slave {}: {}",
                    SocketAddrV4::new(daddr, port),
                    slave,
                    map.dispatcher().last_error()
                );
            }
            info!("set {} slave {}", SocketAddrV4::new(daddr, port), slave);
        }
        Commands::Apply { map, config } => {
            let config = load_config(&config).context("failed to load config")?;
            let map = open(&apply_target(map, config.map.as_deref()))?;
            for vip in &config.services {
                add_service(&map, vip.frontend(), &vip.backends())
                    .with_context(|| format!("failed to install {}", vip.frontend()))?;
                info!(
                    "installed {} with {} backends",
                    vip.frontend(),
                    vip.real_servers.len()
                );
            }
        }
        Commands::Del { map, vip, port } => {
            let map = open(&map)?;
            let frontend = SocketAddrV4::new(vip, port);
            match delete_service(&map, frontend)
                .with_context(|| format!("failed to delete {}", frontend))?
            {
                Some(removed) => info!("deleted {} and {} backends", frontend, removed),
                None => bail!("no service {}", frontend),
            }
        }
    }

    Ok(())
}
