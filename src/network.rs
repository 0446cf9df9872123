//! Per-namespace network management: device discovery, the HTB class tree
//! with one leaf per running container, the cgroup classifier and the NAT
//! address pool. One `Network` exists per distinct network namespace inode;
//! a registry of weak references keeps them shared between containers in
//! the same namespace.
//!
//! The class tree on every managed device:
//!
//! ```text
//! 1:0 qdisc
//!  |
//! 1:1 root class
//!  |
//!  +- 1:2 default class (unclassified traffic)
//!  |
//!  +- 1:3 porto class
//!      |
//!      +- 1:4 container a
//!      |   |
//!      |   +- 1:5 container a/b
//!      |
//!      +- 1:6 container b
//! ```

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, Weak};

use log::{info, warn};

use crate::config::Config;
use crate::container::Container;
use crate::error::{Error, ErrorKind, Result};
use crate::idmap::IdMap;
use crate::netlink::{tc_handle, NetlinkSocket, TC_H_ROOT};
use crate::property;

pub const ROOT_TC_MAJOR: u16 = 1;
/// Class minor of the whole-device root class; also the root container id.
pub const ROOT_CONTAINER_ID: u32 = 1;
/// Class minor of the default class for unclassified traffic.
pub const DEFAULT_TC_MINOR: u32 = 2;
/// Class minor of the porto subtree root; also the porto root container id.
pub const PORTO_ROOT_CONTAINER_ID: u32 = 3;

/// Unbounded rate: the 32-bit ratespec ceiling.
pub const NET_MAX_RATE: u64 = u32::MAX as u64;

/// Device name prefixes owned by the daemon; its own veth pairs are never
/// managed as uplinks.
const OWN_VETH_PREFIXES: &[&str] = &["portove-", "L3-"];

pub fn container_classid(id: u32) -> u32 {
    tc_handle(ROOT_TC_MAJOR, id as u16)
}

/// Traffic statistics kinds resolvable from tc class counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrafficStat {
    Bytes,
    Packets,
    Drops,
    Overlimits,
}

#[derive(Debug, Clone)]
pub struct NetDevice {
    pub name: String,
    pub index: u32,
    pub mtu: u32,
    pub kind: String,
    pub group: u32,
    /// The daemon shapes traffic on this device.
    pub managed: bool,
    /// The HTB tree has been installed.
    pub prepared: bool,
    /// Line rate in bytes/s, from sysfs or config.
    pub rate: u64,
    pub ceil: u64,
    missing: bool,
}

impl NetDevice {
    /// Config maps are keyed by device name with a "default" fallback.
    pub fn config_value(&self, map: &std::collections::BTreeMap<String, u64>, def: u64) -> u64 {
        map.get(&self.name)
            .or_else(|| map.get("default"))
            .copied()
            .unwrap_or(def)
    }
}

struct NetworkState {
    devices: Vec<NetDevice>,
    new_managed_devices: bool,
    iface_seq: u32,
}

pub struct Network {
    sock: Mutex<NetlinkSocket>,
    state: Mutex<NetworkState>,
    nat: Mutex<IdMap>,
    /// True for a namespace created and fully owned by the daemon; every
    /// device inside is managed and unbounded.
    pub managed_namespace: bool,
    pub netns_inode: u64,
}

/// Weak map from netns inode to its Network, owned by the daemon.
pub struct NetworkRegistry {
    networks: Mutex<HashMap<u64, Weak<Network>>>,
}

pub fn netns_inode(pid: u32) -> Result<u64> {
    use std::os::linux::fs::MetadataExt;
    let meta = std::fs::metadata(format!("/proc/{}/ns/net", pid))
        .map_err(|e| Error::from(e).context("stat netns"))?;
    Ok(meta.st_ino())
}

impl NetworkRegistry {
    pub fn new() -> NetworkRegistry {
        NetworkRegistry {
            networks: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, inode: u64) -> Option<Arc<Network>> {
        let networks = self.networks.lock().unwrap();
        networks.get(&inode).and_then(|w| w.upgrade())
    }

    pub fn add(&self, net: &Arc<Network>) {
        let mut networks = self.networks.lock().unwrap();
        networks.insert(net.netns_inode, Arc::downgrade(net));
        networks.retain(|_, w| w.upgrade().is_some());
    }

    pub fn all(&self) -> Vec<Arc<Network>> {
        let networks = self.networks.lock().unwrap();
        networks.values().filter_map(|w| w.upgrade()).collect()
    }
}

impl Network {
    /// Open the host network: connect rtnetlink in the daemon's namespace.
    pub fn open_host(config: &Config) -> Result<Arc<Network>> {
        let sock = NetlinkSocket::connect()?;
        let net = Arc::new(Network {
            sock: Mutex::new(sock),
            state: Mutex::new(NetworkState {
                devices: vec![],
                new_managed_devices: false,
                iface_seq: 0,
            }),
            nat: Mutex::new(IdMap::new(0, config.network.nat_count.max(1))),
            managed_namespace: false,
            netns_inode: netns_inode(std::process::id())?,
        });
        net.refresh_devices(config)?;
        Ok(net)
    }

    /// Enumerate links and merge into the device list. Newly seen managed
    /// devices whose root qdisc disagrees with ours get their queue set up.
    pub fn refresh_devices(&self, config: &Config) -> Result<()> {
        let sock = self.sock.lock().unwrap();
        let links = sock.dump_links()?;
        let mut state = self.state.lock().unwrap();

        for dev in state.devices.iter_mut() {
            dev.missing = true;
        }

        for link in links {
            if link.loopback {
                continue;
            }
            // queues are only set up on live uplinks in the host namespace
            if !self.managed_namespace && !link.running {
                continue;
            }
            if link.kind == "veth"
                && OWN_VETH_PREFIXES.iter().any(|p| link.name.starts_with(p))
            {
                continue;
            }

            let managed = self.managed_namespace || self.device_is_managed(&link.name, link.group, config);
            let mut dev = NetDevice {
                name: link.name.clone(),
                index: link.index,
                mtu: link.mtu,
                kind: link.kind.clone(),
                group: link.group,
                managed,
                prepared: false,
                rate: 0,
                ceil: 0,
                missing: false,
            };

            match state
                .devices
                .iter_mut()
                .find(|d| d.name == dev.name && d.index == dev.index)
            {
                Some(existing) => {
                    dev.prepared = existing.prepared;
                    if dev.managed && link.qdisc != "htb" {
                        info!("device {} lost its qdisc", dev.name);
                        dev.prepared = false;
                    }
                    dev.rate = existing.rate;
                    dev.ceil = existing.ceil;
                    *existing = dev;
                }
                None => {
                    info!(
                        "new network device {} index {}{}",
                        dev.name,
                        dev.index,
                        if dev.managed { "" } else { " (unmanaged)" }
                    );
                    state.devices.push(dev);
                }
            }
        }

        state.devices.retain(|d| {
            if d.missing {
                info!("network device {} is gone", d.name);
            }
            !d.missing
        });

        let mut pending: Vec<usize> = vec![];
        for (i, dev) in state.devices.iter().enumerate() {
            if dev.managed && !dev.prepared {
                pending.push(i);
            }
        }
        for i in pending {
            let mut dev = state.devices[i].clone();
            self.detect_speed(&mut dev, config);
            self.setup_queue(&sock, &mut dev, config)?;
            state.devices[i] = dev;
            state.new_managed_devices = true;
        }
        Ok(())
    }

    fn device_is_managed(&self, name: &str, group: u32, config: &Config) -> bool {
        if config
            .network
            .unmanaged_devices
            .iter()
            .any(|d| d == name)
        {
            return false;
        }
        if config
            .network
            .unmanaged_groups
            .iter()
            .any(|g| *g as u32 == group)
        {
            return false;
        }
        if !config.network.devices.is_empty() {
            return config.network.devices.iter().any(|d| d == name);
        }
        true
    }

    /// Line speed from sysfs, then the config override. Mbit/s to bytes/s;
    /// the rate gets a 10% safety margin below the ceil.
    fn detect_speed(&self, dev: &mut NetDevice, config: &Config) {
        let (mut rate, mut ceil) = (NET_MAX_RATE, NET_MAX_RATE);
        if !self.managed_namespace {
            let knob = format!("/sys/class/net/{}/speed", dev.name);
            if let Ok(text) = std::fs::read_to_string(&knob) {
                if let Ok(speed) = text.trim().parse::<i64>() {
                    if speed >= 100 {
                        ceil = speed as u64 * 125_000;
                        rate = speed as u64 * 112_500;
                    }
                }
            }
        }
        dev.ceil = dev.config_value(&config.network.device_ceil, ceil);
        dev.rate = dev.config_value(&config.network.device_rate, rate);
    }

    /// Install the HTB tree on one device: root qdisc, cgroup filter, root
    /// class, default class with its fifo, porto class.
    fn setup_queue(&self, sock: &NetlinkSocket, dev: &mut NetDevice, config: &Config) -> Result<()> {
        info!("setup queue on network device {}", dev.name);

        let root_handle = tc_handle(ROOT_TC_MAJOR, 0);
        let default_class = tc_handle(ROOT_TC_MAJOR, DEFAULT_TC_MINOR as u16);

        if sock.root_qdisc_kind(dev.index)? != "htb" {
            let _ = sock.del_qdisc(dev.index, TC_H_ROOT, root_handle);
        }
        sock.add_htb_qdisc(dev.index, root_handle, default_class)
            .map_err(|e| e.context(format!("root qdisc on {}", dev.name)))?;

        let _ = sock.del_cgroup_filter(dev.index, root_handle, 10);
        sock.add_cgroup_filter(dev.index, root_handle, 10)
            .map_err(|e| e.context(format!("cgroup filter on {}", dev.name)))?;

        // 1:1, the whole-device budget
        sock.add_htb_class(
            dev.index,
            root_handle,
            tc_handle(ROOT_TC_MAJOR, ROOT_CONTAINER_ID as u16),
            0,
            dev.ceil,
            dev.ceil,
            (dev.mtu * 2) as u32,
            (dev.mtu * 10) as u64,
            (dev.mtu * 10) as u64,
        )?;

        // 1:2, unclassified traffic
        sock.add_htb_class(
            dev.index,
            tc_handle(ROOT_TC_MAJOR, ROOT_CONTAINER_ID as u16),
            default_class,
            0,
            dev.config_value(&config.network.default_rate, dev.rate),
            dev.ceil,
            (dev.mtu * 2) as u32,
            (dev.mtu * 10) as u64,
            (dev.mtu * 10) as u64,
        )?;

        if !self.managed_namespace {
            let limit = dev.config_value(&config.network.default_qdisc_limit, (dev.mtu * 20) as u64);
            sock.add_pfifo_qdisc(
                dev.index,
                default_class,
                tc_handle(DEFAULT_TC_MINOR as u16, 0),
                limit as u32,
            )?;
        }

        // 1:3, everything below the porto root
        sock.add_htb_class(
            dev.index,
            tc_handle(ROOT_TC_MAJOR, ROOT_CONTAINER_ID as u16),
            tc_handle(ROOT_TC_MAJOR, PORTO_ROOT_CONTAINER_ID as u16),
            0,
            dev.config_value(&config.network.porto_rate, dev.rate),
            dev.ceil,
            (dev.mtu * 2) as u32,
            (dev.mtu * 10) as u64,
            (dev.mtu * 10) as u64,
        )?;

        dev.prepared = true;
        Ok(())
    }

    /// Create the leaf class (and its fifo) for a container on every managed
    /// device. Rates come from the container's net_* maps, keyed by device
    /// name with a "default" fallback.
    pub fn create_container_classes(
        &self,
        id: u32,
        parent_classid: u32,
        container: &Container,
        config: &Config,
    ) -> Result<()> {
        let guarantee = container
            .get_property(property::P_NET_GUARANTEE, config)
            .ok()
            .and_then(|v| v.as_uint_map().cloned())
            .unwrap_or_default();
        let limit = container
            .get_property(property::P_NET_LIMIT, config)
            .ok()
            .and_then(|v| v.as_uint_map().cloned())
            .unwrap_or_default();
        let prio = container
            .get_property(property::P_NET_PRIO, config)
            .ok()
            .and_then(|v| v.as_uint_map().cloned())
            .unwrap_or_default();

        let handle = container_classid(id);
        let sock = self.sock.lock().unwrap();
        let state = self.state.lock().unwrap();
        let mut first_error = None;
        for dev in state.devices.iter().filter(|d| d.managed && d.prepared) {
            let def_rate = dev.config_value(&config.network.container_rate, NET_MAX_RATE);
            let rate = dev.config_value(&guarantee, def_rate);
            let ceil = dev.config_value(&limit, dev.ceil);
            let prio = dev.config_value(&prio, 3);
            if let Err(e) = sock.add_htb_class(
                dev.index,
                parent_classid,
                handle,
                prio as u32,
                rate,
                ceil,
                (dev.mtu * 2) as u32,
                (dev.mtu * 10) as u64,
                (dev.mtu * 10) as u64,
            ) {
                warn!("cannot add tc class on {}: {}", dev.name, e);
                first_error.get_or_insert(e);
                continue;
            }
            let limit =
                dev.config_value(&config.network.container_qdisc_limit, (dev.mtu * 20) as u64);
            if let Err(e) = sock.add_pfifo_qdisc(
                dev.index,
                handle,
                tc_handle(id as u16, 0),
                limit as u32,
            ) {
                warn!("cannot add container qdisc on {}: {}", dev.name, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Remove a container's leaf qdisc and class from every managed device.
    pub fn destroy_container_classes(&self, id: u32) -> Result<()> {
        let handle = container_classid(id);
        let sock = self.sock.lock().unwrap();
        let state = self.state.lock().unwrap();
        let mut first_error = None;
        for dev in state.devices.iter().filter(|d| d.managed) {
            let _ = sock.del_qdisc(dev.index, handle, tc_handle(id as u16, 0));
            if let Err(e) = sock.del_class(dev.index, handle) {
                warn!("cannot del tc class on {}: {}", dev.name, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Re-enumerate devices; report whether containers should reissue their
    /// classes (new managed devices appeared or the caller insists).
    pub fn refresh_classes(&self, force: bool, config: &Config) -> Result<bool> {
        self.refresh_devices(config)?;
        let mut state = self.state.lock().unwrap();
        let refresh = force || state.new_managed_devices;
        state.new_managed_devices = false;
        Ok(refresh)
    }

    /// Per-device counters of one class. HFSC statistics are not
    /// hierarchical, so child classes are summed recursively there.
    pub fn get_traffic_stat(
        &self,
        handle: u32,
        kind: TrafficStat,
    ) -> Result<HashMap<String, u64>> {
        let sock = self.sock.lock().unwrap();
        let state = self.state.lock().unwrap();
        let mut stat = HashMap::new();
        for dev in state.devices.iter().filter(|d| d.managed && d.prepared) {
            let classes = sock.dump_classes(dev.index)?;
            let pick = |c: &crate::netlink::ClassStat| match kind {
                TrafficStat::Bytes => c.bytes,
                TrafficStat::Packets => c.packets,
                TrafficStat::Drops => c.drops,
                TrafficStat::Overlimits => c.overlimits,
            };
            let cls = match classes.iter().find(|c| c.handle == handle) {
                Some(cls) => cls,
                None => {
                    warn!("cannot find tc class {:x} on {}", handle, dev.name);
                    continue;
                }
            };
            let mut total = pick(cls);
            if cls.kind == "hfsc" {
                let mut handles = vec![handle];
                let mut i = 0;
                while i < handles.len() {
                    for c in classes.iter().filter(|c| c.parent == handles[i]) {
                        total += pick(c);
                        handles.push(c.handle);
                    }
                    i += 1;
                }
            }
            stat.insert(dev.name.clone(), total);
        }
        Ok(stat)
    }

    /// Allocate one NAT offset and derive the v4/v6 addresses from it.
    pub fn get_nat_address(&self, config: &Config) -> Result<Vec<IpAddr>> {
        let offset = self
            .nat
            .lock()
            .unwrap()
            .get()
            .map_err(|e| e.context("cannot allocate NAT address"))?;
        let mut addrs = vec![];
        if let Some(base) = config.network.nat_first_ipv4 {
            let addr = u32::from(base).wrapping_add(offset);
            addrs.push(IpAddr::V4(addr.into()));
        }
        if let Some(base) = config.network.nat_first_ipv6 {
            let addr = u128::from(base).wrapping_add(offset as u128);
            addrs.push(IpAddr::V6(addr.into()));
        }
        Ok(addrs)
    }

    pub fn put_nat_address(&self, addrs: &[IpAddr], config: &Config) {
        for addr in addrs {
            match addr {
                IpAddr::V4(v4) => {
                    if let Some(base) = config.network.nat_first_ipv4 {
                        let offset = u32::from(*v4).wrapping_sub(u32::from(base));
                        self.nat.lock().unwrap().put(offset);
                        return;
                    }
                }
                IpAddr::V6(v6) => {
                    if let Some(base) = config.network.nat_first_ipv6 {
                        let offset = u128::from(*v6).wrapping_sub(u128::from(base)) as u32;
                        self.nat.lock().unwrap().put(offset);
                        return;
                    }
                }
            }
        }
    }

    /// A free device name with the given prefix.
    pub fn new_device_name(&self, prefix: &str) -> String {
        let mut state = self.state.lock().unwrap();
        for _ in 0..100 {
            let name = format!("{}{}", prefix, state.iface_seq);
            state.iface_seq += 1;
            if !state.devices.iter().any(|d| d.name == name) {
                return name;
            }
        }
        format!("{}0", prefix)
    }

    pub fn devices(&self) -> Vec<NetDevice> {
        self.state.lock().unwrap().devices.clone()
    }
}

/// Parsed `net` property.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetCfg {
    /// Create a fresh empty namespace (the default for `none`).
    pub new_netns: bool,
    /// Share the parent's namespace.
    pub inherited: bool,
    /// Share the host namespace.
    pub host: bool,
    /// Devices moved wholesale into the container.
    pub steal: Vec<String>,
    /// veth pairs: (name inside, bridge).
    pub veth: Vec<(String, String)>,
    /// macvlan: (master, name inside).
    pub macvlan: Vec<(String, String)>,
    /// ipvlan: (master, name inside).
    pub ipvlan: Vec<(String, String)>,
    /// Join a named namespace under /var/run/netns.
    pub netns_name: Option<String>,
    /// Interfaces whose addresses appear asynchronously; the task waits.
    pub autoconf: Vec<String>,
}

impl NetCfg {
    pub fn parse(lines: &[String]) -> Result<NetCfg> {
        let mut cfg = NetCfg {
            new_netns: true,
            ..NetCfg::default()
        };
        if lines.is_empty() {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                "network configuration is not specified",
            ));
        }
        for line in lines {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            match tokens.as_slice() {
                ["none"] => {
                    cfg.new_netns = true;
                }
                ["inherited"] => {
                    cfg.inherited = true;
                    cfg.new_netns = false;
                }
                ["host"] => {
                    cfg.host = true;
                    cfg.new_netns = false;
                }
                ["host", device] | ["steal", device] => {
                    cfg.steal.push(device.to_string());
                }
                ["netns", name] => {
                    cfg.netns_name = Some(name.to_string());
                    cfg.new_netns = false;
                }
                ["veth", name, bridge] => {
                    cfg.veth.push((name.to_string(), bridge.to_string()));
                }
                ["macvlan", master, name] => {
                    cfg.macvlan.push((master.to_string(), name.to_string()));
                }
                ["ipvlan", master, name] => {
                    cfg.ipvlan.push((master.to_string(), name.to_string()));
                }
                ["autoconf", name] => {
                    cfg.autoconf.push(name.to_string());
                }
                _ => {
                    return Err(Error::new(
                        ErrorKind::InvalidValue,
                        format!("invalid net configuration {:?}", line),
                    ))
                }
            }
        }
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classid_uses_the_root_major() {
        assert_eq!(container_classid(4), 0x0001_0004);
        assert_eq!(
            container_classid(PORTO_ROOT_CONTAINER_ID),
            0x0001_0003
        );
    }

    #[test]
    fn netcfg_parses_variants() {
        let cfg = NetCfg::parse(&["inherited".to_string()]).unwrap();
        assert!(cfg.inherited);
        assert!(!cfg.new_netns);

        let cfg = NetCfg::parse(&["none".to_string()]).unwrap();
        assert!(cfg.new_netns);

        let cfg = NetCfg::parse(&[
            "veth eth0 br0".to_string(),
            "autoconf eth0".to_string(),
        ])
        .unwrap();
        assert_eq!(cfg.veth, vec![("eth0".to_string(), "br0".to_string())]);
        assert_eq!(cfg.autoconf, vec!["eth0".to_string()]);

        assert!(NetCfg::parse(&[]).is_err());
        assert!(NetCfg::parse(&["bogus junk here".to_string()]).is_err());
    }

    #[test]
    fn device_config_fallback() {
        let dev = NetDevice {
            name: "eth0".to_string(),
            index: 2,
            mtu: 1500,
            kind: String::new(),
            group: 0,
            managed: true,
            prepared: false,
            rate: 0,
            ceil: 0,
            missing: false,
        };
        let mut map = std::collections::BTreeMap::new();
        map.insert("default".to_string(), 10u64);
        assert_eq!(dev.config_value(&map, 99), 10);
        map.insert("eth0".to_string(), 20u64);
        assert_eq!(dev.config_value(&map, 99), 20);
        assert_eq!(dev.config_value(&std::collections::BTreeMap::new(), 99), 99);
    }

    #[test]
    fn registry_drops_dead_networks() {
        let registry = NetworkRegistry::new();
        assert!(registry.get(42).is_none());
        assert!(registry.all().is_empty());
    }
}
