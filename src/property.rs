//! The container property table. Each slot is a descriptor: value kind,
//! flags, legal states, a default hook, a validator and an optional hook
//! that maps the value into the task launch environment.

use crate::config::Config;
use crate::container::Container;
use crate::cred;
use crate::env::{BindEntry, CapabilitySet, DeviceEntry, TaskEnv};
use crate::error::{Error, ErrorKind, Result};
use crate::network::NetCfg;
use crate::value::{flags, Slot, Value, ValueKind};

pub const P_COMMAND: &str = "command";
pub const P_USER: &str = "user";
pub const P_GROUP: &str = "group";
pub const P_ENV: &str = "env";
pub const P_ROOT: &str = "root";
pub const P_ROOT_RDONLY: &str = "root_readonly";
pub const P_CWD: &str = "cwd";
pub const P_STDIN_PATH: &str = "stdin_path";
pub const P_STDOUT_PATH: &str = "stdout_path";
pub const P_STDERR_PATH: &str = "stderr_path";
pub const P_STDOUT_LIMIT: &str = "stdout_limit";
pub const P_MEM_GUARANTEE: &str = "memory_guarantee";
pub const P_MEM_LIMIT: &str = "memory_limit";
pub const P_RECHARGE_ON_PGFAULT: &str = "recharge_on_pgfault";
pub const P_CPU_POLICY: &str = "cpu_policy";
pub const P_CPU_LIMIT: &str = "cpu_limit";
pub const P_CPU_GUARANTEE: &str = "cpu_guarantee";
pub const P_IO_POLICY: &str = "io_policy";
pub const P_NET_GUARANTEE: &str = "net_guarantee";
pub const P_NET_LIMIT: &str = "net_limit";
pub const P_NET_PRIO: &str = "net_priority";
pub const P_NET_TOS: &str = "net_tos";
pub const P_RESPAWN: &str = "respawn";
pub const P_MAX_RESPAWNS: &str = "max_respawns";
pub const P_ISOLATE: &str = "isolate";
pub const P_PRIVATE: &str = "private";
pub const P_ULIMIT: &str = "ulimit";
pub const P_HOSTNAME: &str = "hostname";
pub const P_BIND_DNS: &str = "bind_dns";
pub const P_BIND: &str = "bind";
pub const P_IP: &str = "ip";
pub const P_DEFAULT_GW: &str = "default_gw";
pub const P_NET: &str = "net";
pub const P_DEVICES: &str = "devices";
pub const P_ALLOWED_DEVICES: &str = "allowed_devices";
pub const P_CAPABILITIES: &str = "capabilities";
pub const P_VIRT_MODE: &str = "virt_mode";
pub const P_AGING_TIME: &str = "aging_time";
pub const P_ENABLE_PORTO: &str = "enable_porto";
pub const P_PORTO_NAMESPACE: &str = "porto_namespace";
pub const P_UMASK: &str = "umask";

const STOPPED: u32 = 1 << 0; // State::Stopped.bit()
const ANY: u32 = 0;
/// Tunables that may change while the container runs.
const ALIVE: u32 = (1 << 0) | (1 << 2) | (1 << 4) | (1 << 5); // stopped|running|meta|dead

fn def_user(c: &Container, _cfg: &Config) -> Value {
    Value::Str(cred::user_name(c.owner.uid))
}

fn def_group(c: &Container, _cfg: &Config) -> Value {
    Value::Str(cred::group_name(c.owner.gid))
}

fn def_cwd(_c: &Container, _cfg: &Config) -> Value {
    Value::Str("/".to_string())
}

fn def_std_path(c: &Container, cfg: &Config, ext: &str) -> Value {
    let cwd = c
        .get_property(P_CWD, cfg)
        .map(|v| v.as_str().to_string())
        .unwrap_or_else(|_| "/".to_string());
    Value::Str(format!("{}/{}.{}", cwd.trim_end_matches('/'), c.base_name(), ext))
}

fn def_stdout(c: &Container, cfg: &Config) -> Value {
    def_std_path(c, cfg, "stdout")
}

fn def_stderr(c: &Container, cfg: &Config) -> Value {
    def_std_path(c, cfg, "stderr")
}

fn def_stdin(_c: &Container, _cfg: &Config) -> Value {
    Value::Str("/dev/null".to_string())
}

fn def_stdout_limit(_c: &Container, cfg: &Config) -> Value {
    Value::Uint(cfg.container.stdout_limit)
}

fn def_cpu_policy(_c: &Container, _cfg: &Config) -> Value {
    Value::Str("normal".to_string())
}

fn def_cpu_limit(_c: &Container, _cfg: &Config) -> Value {
    Value::Uint(100)
}

fn def_io_policy(_c: &Container, _cfg: &Config) -> Value {
    Value::Str("normal".to_string())
}

fn def_isolate(_c: &Container, _cfg: &Config) -> Value {
    Value::Bool(true)
}

fn def_max_respawns(_c: &Container, cfg: &Config) -> Value {
    Value::Int(cfg.container.max_respawns)
}

fn def_root(_c: &Container, _cfg: &Config) -> Value {
    Value::Str("/".to_string())
}

fn def_virt_mode(_c: &Container, _cfg: &Config) -> Value {
    Value::Str("app".to_string())
}

fn def_aging_time(_c: &Container, cfg: &Config) -> Value {
    Value::Uint(cfg.container.aging_time_s)
}

fn def_enable_porto(_c: &Container, _cfg: &Config) -> Value {
    Value::Bool(true)
}

fn def_umask(_c: &Container, _cfg: &Config) -> Value {
    Value::Uint(0o002)
}

fn def_net(_c: &Container, _cfg: &Config) -> Value {
    Value::List(vec!["inherited".to_string()])
}

fn def_allowed_devices(_c: &Container, _cfg: &Config) -> Value {
    Value::List(vec!["a *:* rwm".to_string()])
}

fn val_user(_c: &Container, _cfg: &Config, v: &Value) -> Result<()> {
    cred::lookup_user(v.as_str()).map(|_| ())
}

fn val_group(_c: &Container, _cfg: &Config, v: &Value) -> Result<()> {
    cred::lookup_group(v.as_str()).map(|_| ())
}

fn val_env(_c: &Container, _cfg: &Config, v: &Value) -> Result<()> {
    for item in v.as_list() {
        if !item.contains('=') {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                format!("invalid environment entry {:?}", item),
            ));
        }
    }
    Ok(())
}

fn val_std_path(_c: &Container, _cfg: &Config, v: &Value) -> Result<()> {
    let s = v.as_str();
    if s.is_empty() || s.starts_with('/') {
        return Ok(());
    }
    Err(Error::new(
        ErrorKind::InvalidValue,
        format!("stream path must be absolute: {:?}", s),
    ))
}

fn val_cpu_policy(_c: &Container, _cfg: &Config, v: &Value) -> Result<()> {
    match v.as_str() {
        "normal" | "rt" => Ok(()),
        "idle" => Err(Error::new(
            ErrorKind::NotSupported,
            "cpu policy idle is not supported",
        )),
        other => Err(Error::new(
            ErrorKind::InvalidValue,
            format!("invalid cpu policy {:?}", other),
        )),
    }
}

fn val_percent(_c: &Container, _cfg: &Config, v: &Value) -> Result<()> {
    if v.as_uint() > 100 {
        return Err(Error::new(
            ErrorKind::InvalidValue,
            "cpu share must be between 0 and 100 percent",
        ));
    }
    Ok(())
}

fn val_io_policy(_c: &Container, _cfg: &Config, v: &Value) -> Result<()> {
    match v.as_str() {
        "normal" | "batch" => Ok(()),
        other => Err(Error::new(
            ErrorKind::InvalidValue,
            format!("invalid io policy {:?}", other),
        )),
    }
}

fn val_net_prio(_c: &Container, _cfg: &Config, v: &Value) -> Result<()> {
    if let Some(map) = v.as_uint_map() {
        for (_, prio) in map {
            if *prio > 7 {
                return Err(Error::new(
                    ErrorKind::InvalidValue,
                    "network priority must be between 0 and 7",
                ));
            }
        }
    }
    Ok(())
}

fn val_net_tos(_c: &Container, _cfg: &Config, v: &Value) -> Result<()> {
    if v.as_uint() > 0xff {
        return Err(Error::new(ErrorKind::InvalidValue, "invalid tos value"));
    }
    Ok(())
}

fn val_private(_c: &Container, _cfg: &Config, v: &Value) -> Result<()> {
    if v.as_str().len() > 4096 {
        return Err(Error::new(ErrorKind::InvalidValue, "private value is too long"));
    }
    Ok(())
}

fn val_ulimit(_c: &Container, _cfg: &Config, v: &Value) -> Result<()> {
    for item in v.as_list() {
        crate::env::parse_rlimit(item)?;
    }
    Ok(())
}

fn val_bind(_c: &Container, _cfg: &Config, v: &Value) -> Result<()> {
    for item in v.as_list() {
        BindEntry::parse(item)?;
    }
    Ok(())
}

fn val_devices(_c: &Container, _cfg: &Config, v: &Value) -> Result<()> {
    for item in v.as_list() {
        DeviceEntry::parse(item)?;
    }
    Ok(())
}

fn val_caps(_c: &Container, _cfg: &Config, v: &Value) -> Result<()> {
    CapabilitySet::parse(v.as_list()).map(|_| ())
}

fn val_virt_mode(_c: &Container, _cfg: &Config, v: &Value) -> Result<()> {
    match v.as_str() {
        "app" | "os" => Ok(()),
        other => Err(Error::new(
            ErrorKind::InvalidValue,
            format!("unsupported virt_mode {:?}", other),
        )),
    }
}

fn val_net(_c: &Container, _cfg: &Config, v: &Value) -> Result<()> {
    NetCfg::parse(v.as_list()).map(|_| ())
}

fn val_ip(_c: &Container, _cfg: &Config, v: &Value) -> Result<()> {
    for item in v.as_list() {
        let tokens: Vec<&str> = item.split_whitespace().collect();
        if tokens.len() != 2 || tokens[1].parse::<std::net::IpAddr>().is_err() && tokens[1].split('/').next().unwrap_or("").parse::<std::net::IpAddr>().is_err() {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                format!("invalid address specification {:?}", item),
            ));
        }
    }
    Ok(())
}

fn val_umask(_c: &Container, _cfg: &Config, v: &Value) -> Result<()> {
    if v.as_uint() > 0o777 {
        return Err(Error::new(ErrorKind::InvalidValue, "invalid umask"));
    }
    Ok(())
}

fn prep_command(_c: &Container, _cfg: &Config, v: &Value, env: &mut TaskEnv) -> Result<()> {
    env.command = v.as_str().to_string();
    Ok(())
}

fn prep_user(_c: &Container, _cfg: &Config, v: &Value, env: &mut TaskEnv) -> Result<()> {
    env.cred.uid = cred::lookup_user(v.as_str())?;
    Ok(())
}

fn prep_group(_c: &Container, _cfg: &Config, v: &Value, env: &mut TaskEnv) -> Result<()> {
    env.cred.gid = cred::lookup_group(v.as_str())?;
    Ok(())
}

fn prep_env(c: &Container, cfg: &Config, v: &Value, env: &mut TaskEnv) -> Result<()> {
    env.set_env("container", "porto");
    env.set_env("HOME", c.get_property(P_CWD, cfg)?.as_str());
    env.set_env("USER", c.get_property(P_USER, cfg)?.as_str());
    env.set_env(
        "PATH",
        "/usr/sbin:/usr/bin:/sbin:/bin:/usr/local/sbin:/usr/local/bin",
    );
    for item in v.as_list() {
        let mut split = item.splitn(2, '=');
        let name = split.next().unwrap_or("");
        let value = split.next().unwrap_or("");
        env.set_env(name, value);
    }
    Ok(())
}

fn prep_root(c: &Container, cfg: &Config, v: &Value, env: &mut TaskEnv) -> Result<()> {
    env.root = v.as_str().into();
    if v.as_str() != "/" {
        env.new_mount_ns = true;
    }
    if c.virt_mode_os(cfg) {
        env.new_mount_ns = true;
        // an os container sharing the host root filesystem would wreck the
        // host; paths differ, devices decide
        if same_filesystem(v.as_str(), "/") {
            return Err(Error::new(
                ErrorKind::Permission,
                "virt_mode=os requires its own root filesystem",
            ));
        }
    }
    Ok(())
}

fn same_filesystem(a: &str, b: &str) -> bool {
    use std::os::linux::fs::MetadataExt;
    match (std::fs::metadata(a), std::fs::metadata(b)) {
        (Ok(a), Ok(b)) => a.st_dev() == b.st_dev(),
        _ => false,
    }
}

fn prep_root_rdonly(_c: &Container, _cfg: &Config, v: &Value, env: &mut TaskEnv) -> Result<()> {
    env.root_rdonly = v.as_bool();
    Ok(())
}

fn prep_cwd(_c: &Container, _cfg: &Config, v: &Value, env: &mut TaskEnv) -> Result<()> {
    env.cwd = v.as_str().into();
    Ok(())
}

fn prep_isolate(_c: &Container, _cfg: &Config, v: &Value, env: &mut TaskEnv) -> Result<()> {
    env.isolate = v.as_bool();
    if v.as_bool() {
        // pid 1 inside its own pid namespace takes the extra fork stage
        env.triple_fork = true;
    }
    Ok(())
}

fn prep_virt_mode(_c: &Container, _cfg: &Config, v: &Value, env: &mut TaskEnv) -> Result<()> {
    if v.as_str() == "os" {
        env.isolate = true;
        env.triple_fork = true;
        env.new_mount_ns = true;
        env.cap_limit = CapabilitySet::default_os();
        if env.command.is_empty() {
            env.command = "/sbin/init".to_string();
        }
    }
    Ok(())
}

fn prep_ulimit(_c: &Container, _cfg: &Config, v: &Value, env: &mut TaskEnv) -> Result<()> {
    for item in v.as_list() {
        env.rlimits.push(crate::env::parse_rlimit(item)?);
    }
    Ok(())
}

fn prep_hostname(_c: &Container, _cfg: &Config, v: &Value, env: &mut TaskEnv) -> Result<()> {
    env.hostname = v.as_str().to_string();
    env.set_etc_hostname = !env.hostname.is_empty();
    Ok(())
}

fn prep_bind_dns(_c: &Container, _cfg: &Config, v: &Value, env: &mut TaskEnv) -> Result<()> {
    if v.as_bool() {
        let text = std::fs::read_to_string("/etc/resolv.conf").unwrap_or_default();
        env.resolv_conf = text.lines().map(|l| l.to_string()).collect();
    }
    Ok(())
}

fn prep_bind(_c: &Container, _cfg: &Config, v: &Value, env: &mut TaskEnv) -> Result<()> {
    for item in v.as_list() {
        env.bind.push(BindEntry::parse(item)?);
    }
    if !env.bind.is_empty() {
        env.new_mount_ns = true;
    }
    Ok(())
}

fn prep_devices(_c: &Container, _cfg: &Config, v: &Value, env: &mut TaskEnv) -> Result<()> {
    for item in v.as_list() {
        env.devices.push(DeviceEntry::parse(item)?);
    }
    Ok(())
}

fn prep_caps(c: &Container, cfg: &Config, v: &Value, env: &mut TaskEnv) -> Result<()> {
    if !v.as_list().is_empty() {
        let set = CapabilitySet::parse(v.as_list())?;
        env.cap_ambient = set.clone();
        env.cap_limit = set;
    } else if c.virt_mode_os(cfg) {
        env.cap_limit = CapabilitySet::default_os();
    }
    Ok(())
}

fn prep_umask(_c: &Container, _cfg: &Config, v: &Value, env: &mut TaskEnv) -> Result<()> {
    env.umask = v.as_uint() as u32;
    Ok(())
}

fn prep_net(_c: &Container, _cfg: &Config, v: &Value, env: &mut TaskEnv) -> Result<()> {
    let cfg = NetCfg::parse(v.as_list())?;
    env.autoconf = cfg.autoconf.clone();
    Ok(())
}

static TABLE: &[Slot] = &[
    Slot {
        name: P_COMMAND,
        desc: "Command executed upon container start",
        kind: ValueKind::Str,
        flags: flags::PERSISTENT | flags::OS_MODE_OVERRIDE,
        read_states: ANY,
        write_states: STOPPED,
        def: None,
        validate: None,
        prepare_task_env: Some(prep_command),
    },
    Slot {
        name: P_USER,
        desc: "Start command with given user",
        kind: ValueKind::Str,
        flags: flags::PERSISTENT,
        read_states: ANY,
        write_states: STOPPED,
        def: Some(def_user),
        validate: Some(val_user),
        prepare_task_env: Some(prep_user),
    },
    Slot {
        name: P_GROUP,
        desc: "Start command with given group",
        kind: ValueKind::Str,
        flags: flags::PERSISTENT,
        read_states: ANY,
        write_states: STOPPED,
        def: Some(def_group),
        validate: Some(val_group),
        prepare_task_env: Some(prep_group),
    },
    Slot {
        name: P_ENV,
        desc: "Container environment variables: NAME=value; ...",
        kind: ValueKind::List,
        flags: flags::PERSISTENT,
        read_states: ANY,
        write_states: STOPPED,
        def: None,
        validate: Some(val_env),
        prepare_task_env: Some(prep_env),
    },
    Slot {
        name: P_ROOT,
        desc: "Container root directory",
        kind: ValueKind::Str,
        flags: flags::PERSISTENT | flags::PATH_VALIDATED,
        read_states: ANY,
        write_states: STOPPED,
        def: Some(def_root),
        validate: None,
        prepare_task_env: Some(prep_root),
    },
    Slot {
        name: P_ROOT_RDONLY,
        desc: "Mount root directory read-only",
        kind: ValueKind::Bool,
        flags: flags::PERSISTENT,
        read_states: ANY,
        write_states: STOPPED,
        def: None,
        validate: None,
        prepare_task_env: Some(prep_root_rdonly),
    },
    Slot {
        name: P_CWD,
        desc: "Container working directory",
        kind: ValueKind::Str,
        flags: flags::PERSISTENT | flags::PATH_VALIDATED | flags::RESTRICTED_ROOT,
        read_states: ANY,
        write_states: STOPPED,
        def: Some(def_cwd),
        validate: None,
        prepare_task_env: Some(prep_cwd),
    },
    Slot {
        name: P_STDIN_PATH,
        desc: "Container standard input path",
        kind: ValueKind::Str,
        flags: flags::PERSISTENT,
        read_states: ANY,
        write_states: STOPPED,
        def: Some(def_stdin),
        validate: Some(val_std_path),
        prepare_task_env: None,
    },
    Slot {
        name: P_STDOUT_PATH,
        desc: "Container standard output path",
        kind: ValueKind::Str,
        flags: flags::PERSISTENT,
        read_states: ANY,
        write_states: STOPPED,
        def: Some(def_stdout),
        validate: Some(val_std_path),
        prepare_task_env: None,
    },
    Slot {
        name: P_STDERR_PATH,
        desc: "Container standard error path",
        kind: ValueKind::Str,
        flags: flags::PERSISTENT,
        read_states: ANY,
        write_states: STOPPED,
        def: Some(def_stderr),
        validate: Some(val_std_path),
        prepare_task_env: None,
    },
    Slot {
        name: P_STDOUT_LIMIT,
        desc: "Bytes of stdout/stderr kept readable",
        kind: ValueKind::Uint,
        flags: flags::PERSISTENT | flags::UINT_HAS_UNIT,
        read_states: ANY,
        write_states: STOPPED,
        def: Some(def_stdout_limit),
        validate: None,
        prepare_task_env: None,
    },
    Slot {
        name: P_MEM_GUARANTEE,
        desc: "Guaranteed amount of memory, bytes",
        kind: ValueKind::Uint,
        flags: flags::PERSISTENT | flags::UINT_HAS_UNIT,
        read_states: ANY,
        write_states: ALIVE,
        def: None,
        validate: None, // the budget check runs against the whole tree
        prepare_task_env: None,
    },
    Slot {
        name: P_MEM_LIMIT,
        desc: "Memory hard limit, bytes",
        kind: ValueKind::Uint,
        flags: flags::PERSISTENT | flags::UINT_HAS_UNIT,
        read_states: ANY,
        write_states: ALIVE,
        def: None,
        validate: None,
        prepare_task_env: None,
    },
    Slot {
        name: P_RECHARGE_ON_PGFAULT,
        desc: "Recharge memory to the faulting cgroup",
        kind: ValueKind::Bool,
        flags: flags::PERSISTENT,
        read_states: ANY,
        write_states: STOPPED,
        def: None,
        validate: None,
        prepare_task_env: None,
    },
    Slot {
        name: P_CPU_POLICY,
        desc: "Cpu policy: normal or rt",
        kind: ValueKind::Str,
        flags: flags::PERSISTENT,
        read_states: ANY,
        write_states: STOPPED,
        def: Some(def_cpu_policy),
        validate: Some(val_cpu_policy),
        prepare_task_env: None,
    },
    Slot {
        name: P_CPU_LIMIT,
        desc: "Cpu limit, percent of the machine",
        kind: ValueKind::Uint,
        flags: flags::PERSISTENT,
        read_states: ANY,
        write_states: ALIVE,
        def: Some(def_cpu_limit),
        validate: Some(val_percent),
        prepare_task_env: None,
    },
    Slot {
        name: P_CPU_GUARANTEE,
        desc: "Cpu guarantee, percent of the machine",
        kind: ValueKind::Uint,
        flags: flags::PERSISTENT,
        read_states: ANY,
        write_states: ALIVE,
        def: None,
        validate: Some(val_percent),
        prepare_task_env: None,
    },
    Slot {
        name: P_IO_POLICY,
        desc: "IO policy: normal or batch",
        kind: ValueKind::Str,
        flags: flags::PERSISTENT,
        read_states: ANY,
        write_states: ALIVE,
        def: Some(def_io_policy),
        validate: Some(val_io_policy),
        prepare_task_env: None,
    },
    Slot {
        name: P_NET_GUARANTEE,
        desc: "Guaranteed network bandwidth per device, bytes/s",
        kind: ValueKind::UintMap,
        flags: flags::PERSISTENT | flags::UINT_HAS_UNIT,
        read_states: ANY,
        write_states: ALIVE,
        def: None,
        validate: None,
        prepare_task_env: None,
    },
    Slot {
        name: P_NET_LIMIT,
        desc: "Network bandwidth limit per device, bytes/s",
        kind: ValueKind::UintMap,
        flags: flags::PERSISTENT | flags::UINT_HAS_UNIT,
        read_states: ANY,
        write_states: ALIVE,
        def: None,
        validate: None,
        prepare_task_env: None,
    },
    Slot {
        name: P_NET_PRIO,
        desc: "Network priority per device: 0-7",
        kind: ValueKind::UintMap,
        flags: flags::PERSISTENT,
        read_states: ANY,
        write_states: ALIVE,
        def: None,
        validate: Some(val_net_prio),
        prepare_task_env: None,
    },
    Slot {
        name: P_NET_TOS,
        desc: "IP type of service for outgoing packets",
        kind: ValueKind::Uint,
        flags: flags::PERSISTENT,
        read_states: ANY,
        write_states: STOPPED,
        def: None,
        validate: Some(val_net_tos),
        prepare_task_env: None,
    },
    Slot {
        name: P_RESPAWN,
        desc: "Restart the container after death",
        kind: ValueKind::Bool,
        flags: flags::PERSISTENT,
        read_states: ANY,
        write_states: ALIVE,
        def: None,
        validate: None,
        prepare_task_env: None,
    },
    Slot {
        name: P_MAX_RESPAWNS,
        desc: "Limit respawns; negative means unlimited",
        kind: ValueKind::Int,
        flags: flags::PERSISTENT,
        read_states: ANY,
        write_states: ALIVE,
        def: Some(def_max_respawns),
        validate: None,
        prepare_task_env: None,
    },
    Slot {
        name: P_ISOLATE,
        desc: "New pid/ipc/uts namespaces",
        kind: ValueKind::Bool,
        flags: flags::PERSISTENT | flags::OS_MODE_OVERRIDE,
        read_states: ANY,
        write_states: STOPPED,
        def: Some(def_isolate),
        validate: None,
        prepare_task_env: Some(prep_isolate),
    },
    Slot {
        name: P_PRIVATE,
        desc: "Free-form user text",
        kind: ValueKind::Str,
        flags: flags::PERSISTENT,
        read_states: ANY,
        write_states: ALIVE,
        def: None,
        validate: Some(val_private),
        prepare_task_env: None,
    },
    Slot {
        name: P_ULIMIT,
        desc: "Resource limits: name: soft hard; ...",
        kind: ValueKind::List,
        flags: flags::PERSISTENT,
        read_states: ANY,
        write_states: STOPPED,
        def: None,
        validate: Some(val_ulimit),
        prepare_task_env: Some(prep_ulimit),
    },
    Slot {
        name: P_HOSTNAME,
        desc: "Hostname inside the container",
        kind: ValueKind::Str,
        flags: flags::PERSISTENT,
        read_states: ANY,
        write_states: STOPPED,
        def: None,
        validate: None,
        prepare_task_env: Some(prep_hostname),
    },
    Slot {
        name: P_BIND_DNS,
        desc: "Bind the host resolv.conf into the container",
        kind: ValueKind::Bool,
        flags: flags::PERSISTENT,
        read_states: ANY,
        write_states: STOPPED,
        def: None,
        validate: None,
        prepare_task_env: Some(prep_bind_dns),
    },
    Slot {
        name: P_BIND,
        desc: "Bind mounts: source destination [ro|rw]; ...",
        kind: ValueKind::List,
        flags: flags::PERSISTENT,
        read_states: ANY,
        write_states: STOPPED,
        def: None,
        validate: Some(val_bind),
        prepare_task_env: Some(prep_bind),
    },
    Slot {
        name: P_IP,
        desc: "Ip addresses: iface addr/prefix; ...",
        kind: ValueKind::List,
        flags: flags::PERSISTENT,
        read_states: ANY,
        write_states: STOPPED,
        def: None,
        validate: Some(val_ip),
        prepare_task_env: None,
    },
    Slot {
        name: P_DEFAULT_GW,
        desc: "Default gateways: iface addr; ...",
        kind: ValueKind::List,
        flags: flags::PERSISTENT,
        read_states: ANY,
        write_states: STOPPED,
        def: None,
        validate: Some(val_ip),
        prepare_task_env: None,
    },
    Slot {
        name: P_NET,
        desc: "Network configuration: inherited|none|host ...",
        kind: ValueKind::List,
        flags: flags::PERSISTENT,
        read_states: ANY,
        write_states: STOPPED,
        def: Some(def_net),
        validate: Some(val_net),
        prepare_task_env: Some(prep_net),
    },
    Slot {
        name: P_DEVICES,
        desc: "Device nodes: path access [inside] [mode] [user] [group]; ...",
        kind: ValueKind::List,
        flags: flags::PERSISTENT,
        read_states: ANY,
        write_states: STOPPED,
        def: None,
        validate: Some(val_devices),
        prepare_task_env: Some(prep_devices),
    },
    Slot {
        name: P_ALLOWED_DEVICES,
        desc: "Raw devices cgroup rules",
        kind: ValueKind::List,
        flags: flags::PERSISTENT | flags::SUPERUSER_ONLY,
        read_states: ANY,
        write_states: STOPPED,
        def: Some(def_allowed_devices),
        validate: None,
        prepare_task_env: None,
    },
    Slot {
        name: P_CAPABILITIES,
        desc: "Limit container capabilities (list without the CAP_ prefix)",
        kind: ValueKind::List,
        flags: flags::PERSISTENT | flags::SUPERUSER_ONLY,
        read_states: ANY,
        write_states: STOPPED,
        def: None,
        validate: Some(val_caps),
        prepare_task_env: Some(prep_caps),
    },
    Slot {
        name: P_VIRT_MODE,
        desc: "Virtualization mode: app or os",
        kind: ValueKind::Str,
        flags: flags::PERSISTENT,
        read_states: ANY,
        write_states: STOPPED,
        def: Some(def_virt_mode),
        validate: Some(val_virt_mode),
        prepare_task_env: Some(prep_virt_mode),
    },
    Slot {
        name: P_AGING_TIME,
        desc: "Seconds a dead container is kept before cleanup",
        kind: ValueKind::Uint,
        flags: flags::PERSISTENT,
        read_states: ANY,
        write_states: ALIVE,
        def: Some(def_aging_time),
        validate: None,
        prepare_task_env: None,
    },
    Slot {
        name: P_ENABLE_PORTO,
        desc: "Allow the container to talk to the daemon",
        kind: ValueKind::Bool,
        flags: flags::PERSISTENT,
        read_states: ANY,
        write_states: STOPPED,
        def: Some(def_enable_porto),
        validate: None,
        prepare_task_env: None,
    },
    Slot {
        name: P_PORTO_NAMESPACE,
        desc: "Name prefix for containers created inside",
        kind: ValueKind::Str,
        flags: flags::PERSISTENT,
        read_states: ANY,
        write_states: STOPPED,
        def: None,
        validate: None,
        prepare_task_env: None,
    },
    Slot {
        name: P_UMASK,
        desc: "Umask of the container task",
        kind: ValueKind::Uint,
        flags: flags::PERSISTENT,
        read_states: ANY,
        write_states: STOPPED,
        def: Some(def_umask),
        validate: Some(val_umask),
        prepare_task_env: Some(prep_umask),
    },
];

pub fn table() -> &'static [Slot] {
    TABLE
}

pub fn find(name: &str) -> Option<&'static Slot> {
    TABLE.iter().find(|slot| slot.name == name)
}

/// Names shown by the Plist request.
pub fn visible_names() -> Vec<&'static str> {
    TABLE
        .iter()
        .filter(|slot| !slot.has_flag(flags::HIDDEN))
        .map(|slot| slot.name)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cred::Cred;

    fn container() -> Container {
        Container::new(4, "a", Some(3), Cred::root())
    }

    #[test]
    fn table_names_are_unique() {
        let mut names: Vec<_> = TABLE.iter().map(|s| s.name).collect();
        let before = names.len();
        names.sort();
        names.dedup();
        assert_eq!(before, names.len());
    }

    #[test]
    fn defaults_follow_state() {
        let cfg = Config::default();
        let c = container();
        assert_eq!(c.get_property(P_ISOLATE, &cfg).unwrap(), Value::Bool(true));
        assert_eq!(
            c.get_property(P_CPU_POLICY, &cfg).unwrap().as_str(),
            "normal"
        );
        assert_eq!(c.get_property(P_CPU_LIMIT, &cfg).unwrap().as_uint(), 100);
        assert_eq!(
            c.get_property(P_STDIN_PATH, &cfg).unwrap().as_str(),
            "/dev/null"
        );
        assert_eq!(
            c.get_property(P_STDOUT_PATH, &cfg).unwrap().as_str(),
            "/a.stdout"
        );
    }

    #[test]
    fn cpu_policy_validation() {
        let cfg = Config::default();
        let mut c = container();
        assert!(c
            .set_property(P_CPU_POLICY, "rt", &Cred::root(), &cfg)
            .is_ok());
        let err = c
            .set_property(P_CPU_POLICY, "idle", &Cred::root(), &cfg)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSupported);
        let err = c
            .set_property(P_CPU_POLICY, "fancy", &Cred::root(), &cfg)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidValue);
    }

    #[test]
    fn superuser_only_properties() {
        let cfg = Config::default();
        let mut c = container();
        c.owner = Cred::new(1000, 1000);
        let err = c
            .set_property(
                P_CAPABILITIES,
                "net_admin",
                &Cred::new(1000, 1000),
                &cfg,
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permission);
    }

    #[test]
    fn memory_units() {
        let cfg = Config::default();
        let mut c = container();
        c.set_property(P_MEM_LIMIT, "16M", &Cred::root(), &cfg)
            .unwrap();
        assert_eq!(
            c.get_property(P_MEM_LIMIT, &cfg).unwrap().as_uint(),
            16 << 20
        );
    }

    #[test]
    fn bad_bind_is_rejected() {
        let cfg = Config::default();
        let mut c = container();
        assert!(c
            .set_property(P_BIND, "/a /b ro; /c /d", &Cred::root(), &cfg)
            .is_ok());
        assert!(c
            .set_property(P_BIND, "/only-source", &Cred::root(), &cfg)
            .is_err());
    }

    #[test]
    fn task_env_collects_hooks() {
        let cfg = Config::default();
        let mut c = container();
        c.set_property(P_COMMAND, "sleep 1000", &Cred::root(), &cfg)
            .unwrap();
        c.set_property(P_ENV, "FOO=bar", &Cred::root(), &cfg).unwrap();
        c.set_property(P_HOSTNAME, "box", &Cred::root(), &cfg)
            .unwrap();
        let env = c.prepare_task_env(&cfg).unwrap();
        assert_eq!(env.command, "sleep 1000");
        assert_eq!(env.get_env("FOO"), Some("bar"));
        assert_eq!(env.hostname, "box");
        assert!(env.isolate);
        assert!(env.triple_fork);
    }

    #[test]
    fn os_mode_supplies_init() {
        let cfg = Config::default();
        let mut c = container();
        c.set_property(P_VIRT_MODE, "os", &Cred::root(), &cfg)
            .unwrap();
        c.set_property(P_ROOT, "/some/root", &Cred::root(), &cfg)
            .unwrap();
        let env = c.prepare_task_env(&cfg).unwrap();
        assert_eq!(env.command, "/sbin/init");
        assert!(env.new_mount_ns);
    }
}
