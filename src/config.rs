//! Daemon configuration: hard defaults overridable from a `name = value`
//! config file. The parsed tree is owned by the `Daemon` and passed down by
//! reference; nothing in the crate reads configuration ambiently.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, ErrorKind, Result};

pub const CONFIG_PATH: &str = "/etc/portod.conf";

/// Settings for the daemon itself.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Unix socket the RPC listener binds.
    pub rpc_socket: PathBuf,
    /// Where cgroup hierarchies are mounted.
    pub sysfs_root: PathBuf,
    /// Directory for persistent container records.
    pub containers_kv: PathBuf,
    /// Directory for persistent volume records.
    pub volumes_kv: PathBuf,
    /// Worker threads serving client requests.
    pub workers: usize,
    /// Seconds to wait for a freezer state change.
    pub freezer_wait_timeout_s: u64,
    /// Retries per second while waiting on the freezer.
    pub freezer_wait_hz: u64,
    /// Seconds allowed for emptying and removing a cgroup.
    pub cgroup_remove_timeout_s: u64,
    /// Optional memory limit for the daemon's own cgroup, bytes.
    pub memory_limit: u64,
}

/// Settings applied to containers.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Milliseconds the parent waits on each launch-relay read.
    pub start_timeout_ms: u64,
    /// Milliseconds allowed for a single Stop before escalation.
    pub stop_timeout_ms: u64,
    /// Default seconds a dead container lingers before aging out.
    pub aging_time_s: u64,
    /// Default respawn ceiling; negative means unlimited.
    pub max_respawns: i64,
    /// Default stdout/stderr byte cap for the data slots.
    pub stdout_limit: u64,
    /// Bytes reserved for the host when validating memory guarantees.
    pub memory_guarantee_reserve: u64,
    /// blkio.weight written for io_policy=batch.
    pub batch_io_weight: u64,
    /// Name length cap for unprivileged callers.
    pub max_name_len: usize,
    /// Name length cap for the superuser.
    pub max_name_len_privileged: usize,
    /// Seconds the child waits for addresses on autoconf interfaces.
    pub autoconf_timeout_s: u64,
}

/// Settings for the traffic-control trees.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Manage these devices only; empty means every suitable link.
    pub devices: Vec<String>,
    /// Devices never managed.
    pub unmanaged_devices: Vec<String>,
    /// Device groups (numeric) never managed.
    pub unmanaged_groups: Vec<i32>,
    /// Per-device rate for class 1:1, bytes/s; key "default" is the fallback.
    pub device_rate: BTreeMap<String, u64>,
    /// Per-device ceil for class 1:1, bytes/s.
    pub device_ceil: BTreeMap<String, u64>,
    /// Rate for the default class 1:2.
    pub default_rate: BTreeMap<String, u64>,
    /// Rate for the porto root class 1:3.
    pub porto_rate: BTreeMap<String, u64>,
    /// Default rate for per-container leaf classes.
    pub container_rate: BTreeMap<String, u64>,
    /// Packet limit of the leaf pfifo, per device.
    pub container_qdisc_limit: BTreeMap<String, u64>,
    /// Packet limit of the default-class pfifo, per device.
    pub default_qdisc_limit: BTreeMap<String, u64>,
    /// NAT pool base addresses and size.
    pub nat_first_ipv4: Option<std::net::Ipv4Addr>,
    pub nat_first_ipv6: Option<std::net::Ipv6Addr>,
    pub nat_count: u32,
}

/// Settings for volumes and layers.
#[derive(Debug, Clone)]
pub struct VolumesConfig {
    /// Root of the volume storage tree ("place").
    pub volume_dir: PathBuf,
    /// Layer store below the place.
    pub layers_dir: PathBuf,
    /// Whether the ext4 project-quota backend may be chosen.
    pub enable_quota: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub daemon: DaemonConfig,
    pub container: ContainerConfig,
    pub network: NetworkConfig,
    pub volumes: VolumesConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            daemon: DaemonConfig {
                rpc_socket: PathBuf::from("/run/portod.socket"),
                sysfs_root: PathBuf::from("/sys/fs/cgroup"),
                containers_kv: PathBuf::from("/run/porto/kvs"),
                volumes_kv: PathBuf::from("/run/porto/pkvs"),
                workers: 4,
                freezer_wait_timeout_s: 120,
                freezer_wait_hz: 10,
                cgroup_remove_timeout_s: 5,
                memory_limit: 0,
            },
            container: ContainerConfig {
                start_timeout_ms: 300_000,
                stop_timeout_ms: 5_000,
                aging_time_s: 60 * 60 * 24,
                max_respawns: -1,
                stdout_limit: 8 << 20,
                memory_guarantee_reserve: 2 << 30,
                batch_io_weight: 10,
                max_name_len: 66,
                max_name_len_privileged: 128,
                autoconf_timeout_s: 120,
            },
            network: NetworkConfig {
                devices: vec![],
                unmanaged_devices: vec![],
                unmanaged_groups: vec![],
                device_rate: BTreeMap::new(),
                device_ceil: BTreeMap::new(),
                default_rate: btree(&[("default", 10_000_000)]),
                porto_rate: btree(&[("default", 10_000_000)]),
                container_rate: btree(&[("default", 1_250_000)]),
                container_qdisc_limit: BTreeMap::new(),
                default_qdisc_limit: BTreeMap::new(),
                nat_first_ipv4: None,
                nat_first_ipv6: None,
                nat_count: 0,
            },
            volumes: VolumesConfig {
                volume_dir: PathBuf::from("/place/porto_volumes"),
                layers_dir: PathBuf::from("/place/porto_layers"),
                enable_quota: true,
            },
        }
    }
}

fn btree(items: &[(&str, u64)]) -> BTreeMap<String, u64> {
    items
        .iter()
        .map(|(k, v)| (k.to_string(), *v))
        .collect()
}

impl Config {
    /// Load defaults and apply overrides from `path` if it exists.
    pub fn load(path: &Path) -> Result<Config> {
        let mut cfg = Config::default();
        if !path.exists() {
            return Ok(cfg);
        }
        let text = fs::read_to_string(path)?;
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut split = line.splitn(2, '=');
            let key = split.next().unwrap_or("").trim();
            let value = match split.next() {
                Some(v) => v.trim(),
                None => {
                    return Err(Error::new(
                        ErrorKind::InvalidValue,
                        format!("{}:{}: expected name = value", path.display(), lineno + 1),
                    ))
                }
            };
            cfg.apply(key, value).map_err(|e| {
                e.context(format!("{}:{}", path.display(), lineno + 1))
            })?;
        }
        Ok(cfg)
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "daemon.rpc_socket" => self.daemon.rpc_socket = PathBuf::from(value),
            "daemon.sysfs_root" => self.daemon.sysfs_root = PathBuf::from(value),
            "daemon.containers_kv" => self.daemon.containers_kv = PathBuf::from(value),
            "daemon.volumes_kv" => self.daemon.volumes_kv = PathBuf::from(value),
            "daemon.workers" => self.daemon.workers = parse(key, value)?,
            "daemon.freezer_wait_timeout_s" => {
                self.daemon.freezer_wait_timeout_s = parse(key, value)?
            }
            "daemon.cgroup_remove_timeout_s" => {
                self.daemon.cgroup_remove_timeout_s = parse(key, value)?
            }
            "daemon.memory_limit" => self.daemon.memory_limit = parse(key, value)?,
            "container.start_timeout_ms" => self.container.start_timeout_ms = parse(key, value)?,
            "container.stop_timeout_ms" => self.container.stop_timeout_ms = parse(key, value)?,
            "container.aging_time_s" => self.container.aging_time_s = parse(key, value)?,
            "container.max_respawns" => self.container.max_respawns = parse(key, value)?,
            "container.stdout_limit" => self.container.stdout_limit = parse(key, value)?,
            "container.memory_guarantee_reserve" => {
                self.container.memory_guarantee_reserve = parse(key, value)?
            }
            "container.batch_io_weight" => self.container.batch_io_weight = parse(key, value)?,
            "container.autoconf_timeout_s" => {
                self.container.autoconf_timeout_s = parse(key, value)?
            }
            "network.devices" => self.network.devices = list(value),
            "network.unmanaged_devices" => self.network.unmanaged_devices = list(value),
            "network.default_rate" => self.network.default_rate = rate_map(key, value)?,
            "network.porto_rate" => self.network.porto_rate = rate_map(key, value)?,
            "network.container_rate" => self.network.container_rate = rate_map(key, value)?,
            "network.device_rate" => self.network.device_rate = rate_map(key, value)?,
            "network.device_ceil" => self.network.device_ceil = rate_map(key, value)?,
            "network.nat_first_ipv4" => {
                self.network.nat_first_ipv4 = Some(parse(key, value)?)
            }
            "network.nat_first_ipv6" => {
                self.network.nat_first_ipv6 = Some(parse(key, value)?)
            }
            "network.nat_count" => self.network.nat_count = parse(key, value)?,
            "volumes.volume_dir" => self.volumes.volume_dir = PathBuf::from(value),
            "volumes.layers_dir" => self.volumes.layers_dir = PathBuf::from(value),
            "volumes.enable_quota" => self.volumes.enable_quota = parse(key, value)?,
            _ => {
                return Err(Error::new(
                    ErrorKind::InvalidValue,
                    format!("unknown config key {}", key),
                ))
            }
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| {
        Error::new(
            ErrorKind::InvalidValue,
            format!("cannot parse {} value {:?}", key, value),
        )
    })
}

fn list(value: &str) -> Vec<String> {
    value
        .split(|c| c == ',' || c == ' ')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// Parse "eth0: 10000000; default: 1000000" style maps.
fn rate_map(key: &str, value: &str) -> Result<BTreeMap<String, u64>> {
    let mut map = BTreeMap::new();
    for item in value.split(';') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let mut split = item.splitn(2, ':');
        let name = split.next().unwrap_or("").trim();
        let rate = split.next().unwrap_or("").trim();
        if name.is_empty() || rate.is_empty() {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                format!("cannot parse {} entry {:?}", key, item),
            ));
        }
        map.insert(name.to_string(), parse(key, rate)?);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.container.max_name_len, 66);
        assert!(cfg.network.container_rate.contains_key("default"));
    }

    #[test]
    fn file_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# comment").unwrap();
        writeln!(file, "daemon.workers = 8").unwrap();
        writeln!(file, "container.aging_time_s = 60").unwrap();
        writeln!(file, "network.container_rate = eth0: 2500000; default: 1250000").unwrap();
        let cfg = Config::load(file.path()).unwrap();
        assert_eq!(cfg.daemon.workers, 8);
        assert_eq!(cfg.container.aging_time_s, 60);
        assert_eq!(cfg.network.container_rate["eth0"], 2_500_000);
    }

    #[test]
    fn unknown_key_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "daemon.does_not_exist = 1").unwrap();
        assert!(Config::load(file.path()).is_err());
    }
}
