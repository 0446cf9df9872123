//! Read-only data slots: derivations over the live container (cgroup
//! counters, tc statistics, task identity, exit information). They share the
//! value model with properties but have no storage of their own.

use std::collections::BTreeMap;

use crate::config::Config;
use crate::container::{Container, State};
use crate::cpuacct::CpuAcctController;
use crate::error::{Error, ErrorKind, Result};
use crate::memory::MemController;
use crate::network::{self, TrafficStat};
use crate::property;
use crate::value::{Value, ValueKind};

pub const D_STATE: &str = "state";
pub const D_OOM_KILLED: &str = "oom_killed";
pub const D_ABSOLUTE_NAME: &str = "absolute_name";
pub const D_PARENT: &str = "parent";
pub const D_RESPAWN_COUNT: &str = "respawn_count";
pub const D_ROOT_PID: &str = "root_pid";
pub const D_EXIT_STATUS: &str = "exit_status";
pub const D_START_ERRNO: &str = "start_errno";
pub const D_STDOUT: &str = "stdout";
pub const D_STDERR: &str = "stderr";
pub const D_CPU_USAGE: &str = "cpu_usage";
pub const D_MEMORY_USAGE: &str = "memory_usage";
pub const D_MINOR_FAULTS: &str = "minor_faults";
pub const D_MAJOR_FAULTS: &str = "major_faults";
pub const D_NET_BYTES: &str = "net_bytes";
pub const D_NET_PACKETS: &str = "net_packets";
pub const D_NET_DROPS: &str = "net_drops";
pub const D_NET_OVERLIMITS: &str = "net_overlimits";
pub const D_IO_READ: &str = "io_read";
pub const D_IO_WRITE: &str = "io_write";
pub const D_TIME: &str = "time";

const ANY: u32 = 0;
const DEAD: u32 = 1 << 5;
const STOPPED: u32 = 1 << 0;
const WITH_CGROUP: u32 = (1 << 2) | (1 << 3) | (1 << 4) | (1 << 5); // running|paused|meta|dead
const WITH_OUTPUT: u32 = (1 << 2) | (1 << 3) | (1 << 5); // running|paused|dead

pub struct DataSlot {
    pub name: &'static str,
    pub desc: &'static str,
    pub kind: ValueKind,
    /// States in which the slot may be read; 0 means any.
    pub read_states: u32,
    pub get: fn(&mut Container, &Config) -> Result<Value>,
}

fn get_state(c: &mut Container, _cfg: &Config) -> Result<Value> {
    Ok(Value::Str(c.state.name().to_string()))
}

fn get_oom_killed(c: &mut Container, _cfg: &Config) -> Result<Value> {
    Ok(Value::Bool(c.oom_killed))
}

fn get_absolute_name(c: &mut Container, _cfg: &Config) -> Result<Value> {
    Ok(Value::Str(c.name.clone()))
}

fn get_parent(c: &mut Container, _cfg: &Config) -> Result<Value> {
    let parent = match c.name.rfind('/') {
        Some(0) => "/".to_string(),
        Some(idx) => c.name[..idx].to_string(),
        None => crate::PORTO_ROOT_CONTAINER.to_string(),
    };
    Ok(Value::Str(parent))
}

fn get_respawn_count(c: &mut Container, _cfg: &Config) -> Result<Value> {
    Ok(Value::Uint(c.respawn_count))
}

fn get_root_pid(c: &mut Container, _cfg: &Config) -> Result<Value> {
    Ok(Value::Int(c.task_pid as i64))
}

fn get_exit_status(c: &mut Container, _cfg: &Config) -> Result<Value> {
    Ok(Value::Int(c.exit_status as i64))
}

fn get_start_errno(c: &mut Container, _cfg: &Config) -> Result<Value> {
    Ok(Value::Int(c.start_errno as i64))
}

fn get_stdout(c: &mut Container, cfg: &Config) -> Result<Value> {
    let limit = c.get_property(property::P_STDOUT_LIMIT, cfg)?.as_uint();
    match c.stdout.as_mut() {
        Some(stream) => Ok(Value::Str(stream.read_tail(limit)?)),
        None => Ok(Value::Str(String::new())),
    }
}

fn get_stderr(c: &mut Container, cfg: &Config) -> Result<Value> {
    let limit = c.get_property(property::P_STDOUT_LIMIT, cfg)?.as_uint();
    match c.stderr.as_mut() {
        Some(stream) => Ok(Value::Str(stream.read_tail(limit)?)),
        None => Ok(Value::Str(String::new())),
    }
}

fn mem_controller(c: &Container) -> Result<&MemController> {
    c.cgroup
        .as_ref()
        .and_then(|cg| cg.controller_of::<MemController>())
        .ok_or_else(|| Error::new(ErrorKind::NotSupported, "memory cgroup is not available"))
}

fn get_cpu_usage(c: &mut Container, _cfg: &Config) -> Result<Value> {
    let acct = c
        .cgroup
        .as_ref()
        .and_then(|cg| cg.controller_of::<CpuAcctController>())
        .ok_or_else(|| Error::new(ErrorKind::NotSupported, "cpuacct cgroup is not available"))?;
    Ok(Value::Uint(acct.usage()?))
}

fn get_memory_usage(c: &mut Container, _cfg: &Config) -> Result<Value> {
    Ok(Value::Uint(mem_controller(c)?.usage()?))
}

fn get_minor_faults(c: &mut Container, _cfg: &Config) -> Result<Value> {
    let stat = mem_controller(c)?.stat_map()?;
    let total = stat.get("total_pgfault").copied().unwrap_or(0);
    let major = stat.get("total_pgmajfault").copied().unwrap_or(0);
    Ok(Value::Uint(total.saturating_sub(major)))
}

fn get_major_faults(c: &mut Container, _cfg: &Config) -> Result<Value> {
    let stat = mem_controller(c)?.stat_map()?;
    Ok(Value::Uint(stat.get("total_pgmajfault").copied().unwrap_or(0)))
}

fn traffic(c: &mut Container, kind: TrafficStat) -> Result<Value> {
    let net = c
        .network
        .clone()
        .ok_or_else(|| Error::new(ErrorKind::NotSupported, "network is not configured"))?;
    let stat = net.get_traffic_stat(network::container_classid(c.id), kind)?;
    Ok(Value::UintMap(stat.into_iter().collect::<BTreeMap<_, _>>()))
}

fn get_net_bytes(c: &mut Container, _cfg: &Config) -> Result<Value> {
    traffic(c, TrafficStat::Bytes)
}

fn get_net_packets(c: &mut Container, _cfg: &Config) -> Result<Value> {
    traffic(c, TrafficStat::Packets)
}

fn get_net_drops(c: &mut Container, _cfg: &Config) -> Result<Value> {
    traffic(c, TrafficStat::Drops)
}

fn get_net_overlimits(c: &mut Container, _cfg: &Config) -> Result<Value> {
    traffic(c, TrafficStat::Overlimits)
}

fn blkio_stat(c: &mut Container, write: bool) -> Result<Value> {
    let blkio = c
        .cgroup
        .as_ref()
        .and_then(|cg| cg.controller_of::<crate::blkio::BlkIoController>())
        .ok_or_else(|| Error::new(ErrorKind::NotSupported, "blkio cgroup is not available"))?;
    let mut map = BTreeMap::new();
    for stat in blkio.statistics("blkio.io_service_bytes_recursive")? {
        map.insert(stat.device, if write { stat.write } else { stat.read });
    }
    Ok(Value::UintMap(map))
}

fn get_io_read(c: &mut Container, _cfg: &Config) -> Result<Value> {
    blkio_stat(c, false)
}

fn get_io_write(c: &mut Container, _cfg: &Config) -> Result<Value> {
    blkio_stat(c, true)
}

fn get_time(c: &mut Container, _cfg: &Config) -> Result<Value> {
    let end = if c.state == State::Dead {
        c.death_time_ms
    } else {
        crate::container::now_ms()
    };
    Ok(Value::Uint(end.saturating_sub(c.start_time_ms) / 1000))
}

static TABLE: &[DataSlot] = &[
    DataSlot {
        name: D_STATE,
        desc: "Container state",
        kind: ValueKind::Str,
        read_states: ANY,
        get: get_state,
    },
    DataSlot {
        name: D_OOM_KILLED,
        desc: "Whether the container task was killed by the oom killer",
        kind: ValueKind::Bool,
        read_states: DEAD,
        get: get_oom_killed,
    },
    DataSlot {
        name: D_ABSOLUTE_NAME,
        desc: "Full container name",
        kind: ValueKind::Str,
        read_states: ANY,
        get: get_absolute_name,
    },
    DataSlot {
        name: D_PARENT,
        desc: "Name of the parent container",
        kind: ValueKind::Str,
        read_states: ANY,
        get: get_parent,
    },
    DataSlot {
        name: D_RESPAWN_COUNT,
        desc: "How many times the container was respawned",
        kind: ValueKind::Uint,
        read_states: ANY,
        get: get_respawn_count,
    },
    DataSlot {
        name: D_ROOT_PID,
        desc: "Pid of the container root task",
        kind: ValueKind::Int,
        read_states: (1 << 2) | (1 << 3) | (1 << 4), // running|paused|meta
        get: get_root_pid,
    },
    DataSlot {
        name: D_EXIT_STATUS,
        desc: "Raw wait status of the dead container task",
        kind: ValueKind::Int,
        read_states: DEAD,
        get: get_exit_status,
    },
    DataSlot {
        name: D_START_ERRNO,
        desc: "Errno of the last failed start",
        kind: ValueKind::Int,
        read_states: STOPPED,
        get: get_start_errno,
    },
    DataSlot {
        name: D_STDOUT,
        desc: "Tail of the container standard output",
        kind: ValueKind::Str,
        read_states: WITH_OUTPUT,
        get: get_stdout,
    },
    DataSlot {
        name: D_STDERR,
        desc: "Tail of the container standard error",
        kind: ValueKind::Str,
        read_states: WITH_OUTPUT,
        get: get_stderr,
    },
    DataSlot {
        name: D_CPU_USAGE,
        desc: "Consumed cpu time, nanoseconds",
        kind: ValueKind::Uint,
        read_states: WITH_CGROUP,
        get: get_cpu_usage,
    },
    DataSlot {
        name: D_MEMORY_USAGE,
        desc: "Consumed memory, bytes",
        kind: ValueKind::Uint,
        read_states: WITH_CGROUP,
        get: get_memory_usage,
    },
    DataSlot {
        name: D_MINOR_FAULTS,
        desc: "Minor page faults",
        kind: ValueKind::Uint,
        read_states: WITH_CGROUP,
        get: get_minor_faults,
    },
    DataSlot {
        name: D_MAJOR_FAULTS,
        desc: "Major page faults",
        kind: ValueKind::Uint,
        read_states: WITH_CGROUP,
        get: get_major_faults,
    },
    DataSlot {
        name: D_NET_BYTES,
        desc: "Bytes sent per network device",
        kind: ValueKind::UintMap,
        read_states: WITH_CGROUP,
        get: get_net_bytes,
    },
    DataSlot {
        name: D_NET_PACKETS,
        desc: "Packets sent per network device",
        kind: ValueKind::UintMap,
        read_states: WITH_CGROUP,
        get: get_net_packets,
    },
    DataSlot {
        name: D_NET_DROPS,
        desc: "Dropped packets per network device",
        kind: ValueKind::UintMap,
        read_states: WITH_CGROUP,
        get: get_net_drops,
    },
    DataSlot {
        name: D_NET_OVERLIMITS,
        desc: "Overlimit packets per network device",
        kind: ValueKind::UintMap,
        read_states: WITH_CGROUP,
        get: get_net_overlimits,
    },
    DataSlot {
        name: D_IO_READ,
        desc: "Bytes read per block device",
        kind: ValueKind::UintMap,
        read_states: WITH_CGROUP,
        get: get_io_read,
    },
    DataSlot {
        name: D_IO_WRITE,
        desc: "Bytes written per block device",
        kind: ValueKind::UintMap,
        read_states: WITH_CGROUP,
        get: get_io_write,
    },
    DataSlot {
        name: D_TIME,
        desc: "Seconds since the container start",
        kind: ValueKind::Uint,
        read_states: WITH_CGROUP,
        get: get_time,
    },
];

pub fn table() -> &'static [DataSlot] {
    TABLE
}

pub fn find(name: &str) -> Option<&'static DataSlot> {
    TABLE.iter().find(|slot| slot.name == name)
}

/// Read one data slot, honoring its state mask.
pub fn get(c: &mut Container, name: &str, cfg: &Config) -> Result<Value> {
    let slot = find(name)
        .ok_or_else(|| Error::new(ErrorKind::InvalidData, format!("invalid data {}", name)))?;
    if slot.read_states != 0 && slot.read_states & c.state.bit() == 0 {
        return Err(Error::new(
            ErrorKind::InvalidState,
            format!("data {} is not available in state {}", name, c.state.name()),
        ));
    }
    (slot.get)(c, cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cred::Cred;

    #[test]
    fn state_masks_are_enforced() {
        let cfg = Config::default();
        let mut c = Container::new(4, "a", Some(3), Cred::root());
        assert_eq!(get(&mut c, D_STATE, &cfg).unwrap().as_str(), "stopped");
        let err = get(&mut c, D_EXIT_STATUS, &cfg).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        c.state = State::Dead;
        c.exit_status = 10752;
        assert_eq!(get(&mut c, D_EXIT_STATUS, &cfg).unwrap().as_int(), 10752);
    }

    #[test]
    fn unknown_data_is_invalid_data() {
        let cfg = Config::default();
        let mut c = Container::new(4, "a", Some(3), Cred::root());
        let err = get(&mut c, "no_such_data", &cfg).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn parent_names() {
        let cfg = Config::default();
        let mut c = Container::new(4, "a/b/c", Some(3), Cred::root());
        assert_eq!(get(&mut c, D_PARENT, &cfg).unwrap().as_str(), "a/b");
        let mut top = Container::new(5, "a", Some(3), Cred::root());
        assert_eq!(
            get(&mut top, D_PARENT, &cfg).unwrap().as_str(),
            crate::PORTO_ROOT_CONTAINER
        );
    }

    #[test]
    fn start_errno_only_when_stopped() {
        let cfg = Config::default();
        let mut c = Container::new(4, "a", Some(3), Cred::root());
        c.start_errno = libc::ENOENT;
        assert_eq!(
            get(&mut c, D_START_ERRNO, &cfg).unwrap().as_int(),
            libc::ENOENT as i64
        );
        c.state = State::Running;
        assert!(get(&mut c, D_START_ERRNO, &cfg).is_err());
    }
}
