//! The container object: identity, state machine, property storage and the
//! resource plumbing driven from it. Registry-level concerns (hierarchy
//! checks, restore, recursive operations) live in the holder; everything
//! here operates on one container under its own lock.

use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{info, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::blkio::{BlkIoController, IoPolicy};
use crate::cgroup::Cgroup;
use crate::config::Config;
use crate::cpu::{CpuController, CpuPolicy};
use crate::cred::Cred;
use crate::devices::DevicesController;
use crate::env::{DeviceEntry, TaskEnv};
use crate::error::{Error, ErrorKind, Result};
use crate::freezer::{FreezerController, FreezerState};
use crate::memory::MemController;
use crate::net_cls::NetClsController;
use crate::network::{self, Network};
use crate::property;
use crate::stream::{FdOrigin, StdStream};
use crate::task;
use crate::value::{flags, Value};
use crate::{Hierarchy, PORTO_ROOT_CGROUP, PORTO_ROOT_CONTAINER, ROOT_CONTAINER};

/// Container ids; the range keeps tc class minors valid.
pub const CONTAINER_ID_MAX: u32 = 16383;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Stopped,
    Starting,
    Running,
    Paused,
    Meta,
    Dead,
}

impl State {
    pub fn name(self) -> &'static str {
        match self {
            State::Stopped => "stopped",
            State::Starting => "starting",
            State::Running => "running",
            State::Paused => "paused",
            State::Meta => "meta",
            State::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Option<State> {
        Some(match s {
            "stopped" => State::Stopped,
            "starting" => State::Starting,
            "running" => State::Running,
            "paused" => State::Paused,
            "meta" => State::Meta,
            "dead" => State::Dead,
            _ => return None,
        })
    }

    pub fn bit(self) -> u32 {
        match self {
            State::Stopped => 1 << 0,
            State::Starting => 1 << 1,
            State::Running => 1 << 2,
            State::Paused => 1 << 3,
            State::Meta => 1 << 4,
            State::Dead => 1 << 5,
        }
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub struct Container {
    pub id: u32,
    /// Absolute name; "/" and "/porto" are the implicit roots.
    pub name: String,
    /// Arena id of the parent; None for the root.
    pub parent: Option<u32>,
    /// Arena ids of children, in creation order.
    pub children: Vec<u32>,
    pub state: State,
    pub owner: Cred,
    pub creator: Cred,
    /// Explicitly set property values; defaults are computed on read.
    pub props: BTreeMap<String, Value>,

    /// Pid of the task as the daemon's direct child (wait target).
    pub wait_pid: u32,
    /// Pid of the container's root task in the host namespace.
    pub task_pid: u32,
    /// Pid of the root task as seen inside its pid namespace.
    pub task_vpid: u32,

    pub exit_status: i32,
    pub oom_killed: bool,
    pub start_errno: i32,
    pub start_time_ms: u64,
    pub death_time_ms: u64,
    pub respawn_count: u64,

    pub cgroup: Option<Cgroup>,
    pub network: Option<Arc<Network>>,
    /// Paths of volumes holding a link to this container.
    pub linked_volumes: Vec<PathBuf>,
    pub oom_event_fd: Option<RawFd>,

    pub stdout: Option<StdStream>,
    pub stderr: Option<StdStream>,
    /// Identities of client descriptors handed over as `/dev/fd/N` for
    /// stdin/stdout/stderr, recorded when the property was set.
    pub std_origins: [Option<FdOrigin>; 3],

    /// State to report after Resume (a paused meta stays meta).
    prev_state: State,
}

impl Container {
    pub fn new(id: u32, name: &str, parent: Option<u32>, creator: Cred) -> Container {
        Container {
            id,
            name: name.to_string(),
            parent,
            children: vec![],
            state: State::Stopped,
            owner: creator.clone(),
            creator,
            props: BTreeMap::new(),
            wait_pid: 0,
            task_pid: 0,
            task_vpid: 0,
            exit_status: 0,
            oom_killed: false,
            start_errno: 0,
            start_time_ms: 0,
            death_time_ms: 0,
            respawn_count: 0,
            cgroup: None,
            network: None,
            linked_volumes: vec![],
            oom_event_fd: None,
            stdout: None,
            stderr: None,
            std_origins: [None, None, None],
            prev_state: State::Stopped,
        }
    }

    pub fn is_root(&self) -> bool {
        self.name == ROOT_CONTAINER
    }

    pub fn is_porto_root(&self) -> bool {
        self.name == PORTO_ROOT_CONTAINER
    }

    /// The short name of the container inside its parent.
    pub fn base_name(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }

    /// Relative cgroup path: `porto/<name>`. Both implicit roots own the
    /// subtree itself.
    pub fn cgroup_path(&self) -> PathBuf {
        if self.is_root() || self.is_porto_root() {
            return PathBuf::from(PORTO_ROOT_CGROUP);
        }
        PathBuf::from(PORTO_ROOT_CGROUP).join(&self.name)
    }

    /// A container with no command exists only to host children.
    pub fn is_meta(&self, config: &Config) -> bool {
        !self.virt_mode_os(config) && self.command(config).is_empty()
    }

    pub fn command(&self, config: &Config) -> String {
        self.get_property(property::P_COMMAND, config)
            .map(|v| v.as_str().to_string())
            .unwrap_or_default()
    }

    pub fn isolate(&self, config: &Config) -> bool {
        self.get_property(property::P_ISOLATE, config)
            .map(|v| v.as_bool())
            .unwrap_or(true)
    }

    pub fn virt_mode_os(&self, config: &Config) -> bool {
        self.get_property(property::P_VIRT_MODE, config)
            .map(|v| v.as_str() == "os")
            .unwrap_or(false)
    }

    pub fn aging_time_s(&self, config: &Config) -> u64 {
        self.get_property(property::P_AGING_TIME, config)
            .map(|v| v.as_uint())
            .unwrap_or(config.container.aging_time_s)
    }

    pub fn respawn_enabled(&self, config: &Config) -> bool {
        self.get_property(property::P_RESPAWN, config)
            .map(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn max_respawns(&self, config: &Config) -> i64 {
        self.get_property(property::P_MAX_RESPAWNS, config)
            .map(|v| v.as_int())
            .unwrap_or(config.container.max_respawns)
    }

    pub fn memory_guarantee(&self, config: &Config) -> u64 {
        self.get_property(property::P_MEM_GUARANTEE, config)
            .map(|v| v.as_uint())
            .unwrap_or(0)
    }

    /// Effective value of a property: the stored one, else the default hook.
    pub fn get_property(&self, name: &str, config: &Config) -> Result<Value> {
        let slot = property::find(name)
            .ok_or_else(|| Error::new(ErrorKind::InvalidProperty, format!("invalid property {}", name)))?;
        if slot.read_states != 0 && slot.read_states & self.state.bit() == 0 {
            return Err(Error::new(
                ErrorKind::InvalidState,
                format!("property {} is not available in state {}", name, self.state.name()),
            ));
        }
        if let Some(value) = self.props.get(name) {
            return Ok(value.clone());
        }
        match slot.def {
            Some(def) => Ok(def(self, config)),
            None => Ok(Value::empty(slot.kind)),
        }
    }

    /// Validate and store a property value supplied by `client`.
    pub fn set_property(
        &mut self,
        name: &str,
        raw: &str,
        client: &Cred,
        config: &Config,
    ) -> Result<()> {
        let slot = property::find(name)
            .ok_or_else(|| Error::new(ErrorKind::InvalidProperty, format!("invalid property {}", name)))?;
        if slot.has_flag(flags::READ_ONLY) {
            return Err(Error::new(
                ErrorKind::InvalidProperty,
                format!("property {} is read-only", name),
            ));
        }
        if slot.has_flag(flags::SUPERUSER_ONLY) && !client.is_root() {
            return Err(Error::new(
                ErrorKind::Permission,
                format!("only root can change {}", name),
            ));
        }
        if !client.can_control(&self.owner) {
            return Err(Error::new(
                ErrorKind::Permission,
                format!("{} is not owned by uid {}", self.name, client.uid),
            ));
        }
        if slot.write_states != 0 && slot.write_states & self.state.bit() == 0 {
            return Err(Error::new(
                ErrorKind::InvalidState,
                format!(
                    "property {} cannot be changed in state {}",
                    name,
                    self.state.name()
                ),
            ));
        }
        let value = Value::parse(slot.kind, raw, slot.has_flag(flags::UINT_HAS_UNIT))?;
        if slot.has_flag(flags::PATH_VALIDATED) {
            let path = PathBuf::from(value.as_str());
            if !value.as_str().is_empty() && !path.is_absolute() {
                return Err(Error::new(
                    ErrorKind::InvalidValue,
                    format!("{} must be an absolute path", name),
                ));
            }
        }
        if let Some(validate) = slot.validate {
            validate(self, config, &value)?;
        }
        self.props.insert(name.to_string(), value);
        Ok(())
    }

    /// `/dev/fd/N` stream targets capture the descriptor identity at set
    /// time; Start later refuses to run if the client or fd was replaced.
    pub fn record_std_origin(&mut self, name: &str, client_pid: u32) -> Result<()> {
        let stream_no = match name {
            property::P_STDIN_PATH => 0,
            property::P_STDOUT_PATH => 1,
            property::P_STDERR_PATH => 2,
            _ => return Ok(()),
        };
        let value = self
            .props
            .get(name)
            .map(|v| v.as_str().to_string())
            .unwrap_or_default();
        self.std_origins[stream_no as usize] = match value.strip_prefix("/dev/fd/") {
            Some(fd) => {
                let fd: i32 = fd.parse().map_err(|_| {
                    Error::new(ErrorKind::InvalidValue, format!("invalid fd path {:?}", value))
                })?;
                let stream = StdStream::from_client_fd(stream_no, client_pid, fd)?;
                stream.origin
            }
            None => None,
        };
        Ok(())
    }

    fn build_stream(&self, stream_no: i32, path: &str) -> StdStream {
        if let Some(origin) = self.std_origins[stream_no as usize] {
            let mut stream = StdStream::from_path(stream_no, &PathBuf::from(path), false);
            stream.origin = Some(origin);
            return stream;
        }
        let managed = stream_no != 0 && path != "/dev/null";
        StdStream::from_path(stream_no, &PathBuf::from(path), managed)
    }

    /// Build the launch environment by running every prepare-task-env hook
    /// over the effective property values.
    pub fn prepare_task_env(&self, config: &Config) -> Result<TaskEnv> {
        let mut env = TaskEnv::new(&self.name, self.owner.clone());
        env.is_meta = self.is_meta(config);
        for slot in property::table() {
            if let Some(prep) = slot.prepare_task_env {
                let value = match self.props.get(slot.name) {
                    Some(v) => v.clone(),
                    None => match slot.def {
                        Some(def) => def(self, config),
                        None => continue,
                    },
                };
                prep(self, config, &value, &mut env)
                    .map_err(|e| e.context(format!("prepare {}", slot.name)))?;
            }
        }
        env.stdin = self.build_stream(
            0,
            self.get_property(property::P_STDIN_PATH, config)?.as_str(),
        );
        env.stdout = self.build_stream(
            1,
            self.get_property(property::P_STDOUT_PATH, config)?.as_str(),
        );
        env.stderr = self.build_stream(
            2,
            self.get_property(property::P_STDERR_PATH, config)?.as_str(),
        );
        // the init shim sits between an isolated app task and its command;
        // an os container runs a real init, which needs no shim
        env.quadro_fork = env.isolate && !env.is_meta && !self.virt_mode_os(config);
        env.classid = network::container_classid(self.id);
        Ok(env)
    }

    /// Create cgroup directories and apply every resource property.
    pub fn prepare_cgroups(&mut self, config: &Config, hier: &dyn Hierarchy) -> Result<()> {
        let cgroup = Cgroup::load(hier, self.cgroup_path());
        cgroup.create()?;
        self.apply_resource_properties(config, &cgroup)?;
        self.cgroup = Some(cgroup);
        Ok(())
    }

    pub fn apply_resource_properties(&self, config: &Config, cgroup: &Cgroup) -> Result<()> {
        if let Some(mem) = cgroup.controller_of::<MemController>() {
            mem.set_limit(self.get_property(property::P_MEM_LIMIT, config)?.as_uint())?;
            mem.set_guarantee(self.memory_guarantee(config))?;
            mem.set_recharge_on_pgfault(
                self.get_property(property::P_RECHARGE_ON_PGFAULT, config)?
                    .as_bool(),
            )?;
        }
        if let Some(cpu) = cgroup.controller_of::<CpuController>() {
            let policy = CpuPolicy::parse(
                self.get_property(property::P_CPU_POLICY, config)?.as_str(),
            )?;
            cpu.set_policy(policy)?;
            cpu.set_limit(self.get_property(property::P_CPU_LIMIT, config)?.as_uint())?;
            cpu.set_guarantee(
                self.get_property(property::P_CPU_GUARANTEE, config)?
                    .as_uint(),
            )?;
        }
        if let Some(blkio) = cgroup.controller_of::<BlkIoController>() {
            let policy =
                IoPolicy::parse(self.get_property(property::P_IO_POLICY, config)?.as_str())?;
            blkio.set_policy(policy, config.container.batch_io_weight)?;
        }
        if let Some(devices) = cgroup.controller_of::<DevicesController>() {
            let mut rules: Vec<String> = self
                .get_property(property::P_ALLOWED_DEVICES, config)?
                .as_list()
                .to_vec();
            for spec in self.get_property(property::P_DEVICES, config)?.as_list() {
                rules.push(DeviceEntry::parse(spec)?.cgroup_rule()?);
            }
            devices.allow(&rules)?;
        }
        if let Some(netcls) = cgroup.controller_of::<NetClsController>() {
            netcls.set_classid(network::container_classid(self.id))?;
        }
        Ok(())
    }

    /// Start the container task. The holder has already verified the parent
    /// state and the guarantee budget, and holds this container's lock.
    /// `parent_task_pid` names the namespaces the task launches into; zero
    /// means the parent is a meta container living in the daemon's world.
    pub fn start(
        &mut self,
        config: &Config,
        hier: &dyn Hierarchy,
        parent_task_pid: u32,
    ) -> Result<()> {
        if self.state != State::Stopped && self.state != State::Dead {
            return Err(Error::new(
                ErrorKind::InvalidState,
                format!("cannot start container in state {}", self.state.name()),
            ));
        }
        // no command and not os mode makes this a meta container
        let is_meta = self.is_meta(config);
        self.state = State::Starting;
        self.oom_killed = false;
        self.exit_status = 0;

        let result = (|| -> Result<()> {
            self.prepare_cgroups(config, hier)?;
            let mut env = self.prepare_task_env(config)?;
            if parent_task_pid != 0 {
                env.parent_ns = crate::env::NsSnapshot::open(parent_task_pid)?;
            }
            env.cgroup_paths = self
                .cgroup
                .as_ref()
                .map(|cg| {
                    cg.subsystems()
                        .iter()
                        .map(|s| s.to_controller().path().to_path_buf())
                        .collect()
                })
                .unwrap_or_default();

            if !is_meta {
                let launched = task::start(&mut env, config)?;
                self.wait_pid = launched.wait_pid;
                self.task_pid = launched.task_pid;
                self.task_vpid = launched.task_vpid;
            }

            if let Some(cg) = &self.cgroup {
                if let Some(mem) = cg.controller_of::<MemController>() {
                    match mem.setup_oom_event() {
                        Ok(fd) => self.oom_event_fd = Some(fd),
                        Err(e) => warn!("cannot setup oom event for {}: {}", self.name, e),
                    }
                }
            }

            self.stdout = Some(self.build_stream(
                1,
                self.get_property(property::P_STDOUT_PATH, config)?.as_str(),
            ));
            self.stderr = Some(self.build_stream(
                2,
                self.get_property(property::P_STDERR_PATH, config)?.as_str(),
            ));

            if let Some(net) = self.network.clone() {
                let parent_classid = self.parent_classid();
                net.create_container_classes(self.id, parent_classid, self, config)?;
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                self.state = if is_meta { State::Meta } else { State::Running };
                self.start_time_ms = now_ms();
                self.start_errno = 0;
                info!("started {} pid {}", self.name, self.task_pid);
                Ok(())
            }
            Err(e) => {
                warn!("start of {} failed: {}", self.name, e);
                self.teardown_failed_start(config);
                self.start_errno = if e.errno() != 0 { e.errno() } else { libc::EINVAL };
                self.state = State::Stopped;
                Err(e)
            }
        }
    }

    fn parent_classid(&self) -> u32 {
        match self.parent {
            // top-level containers hang below the porto root class
            None => network::container_classid(network::PORTO_ROOT_CONTAINER_ID),
            Some(id) => network::container_classid(id),
        }
    }

    /// Reverse of a partial start: freeze to stop runaway forks, kill
    /// whatever made it into the cgroups, remove them. Best effort.
    fn teardown_failed_start(&mut self, config: &Config) {
        self.clear_task();
        if let Some(cg) = self.cgroup.take() {
            if let Some(freezer) = cg.controller_of::<FreezerController>() {
                let _ = freezer.freeze();
                let _ = freezer.wait_frozen(
                    config.daemon.freezer_wait_timeout_s,
                    config.daemon.freezer_wait_hz,
                );
                cg.kill_all(Signal::SIGKILL);
                let _ = freezer.thaw();
            }
            if let Err(e) = cg.remove(config.daemon.cgroup_remove_timeout_s) {
                warn!("cannot remove cgroups of {}: {}", self.name, e);
            }
        }
        if let Some(net) = self.network.clone() {
            let _ = net.destroy_container_classes(self.id);
        }
        self.close_oom_event();
    }

    /// Stop the container task and remove its kernel state. Children have
    /// already been stopped by the holder.
    pub fn stop(&mut self, config: &Config) -> Result<()> {
        match self.state {
            State::Stopped => return Ok(()), // idempotent
            State::Running | State::Meta | State::Paused | State::Dead => {}
            State::Starting => {
                return Err(Error::new(ErrorKind::Busy, "container is starting"))
            }
        }

        if self.task_pid != 0 {
            let _ = kill(Pid::from_raw(self.task_pid as i32), Signal::SIGTERM);
        }

        if let Some(cg) = self.cgroup.take() {
            if let Some(freezer) = cg.controller_of::<FreezerController>() {
                // a paused (or externally frozen) subtree cannot die
                cg.kill_all(Signal::SIGTERM);
                if freezer.is_frozen() {
                    let _ = freezer.thaw();
                    if let Err(e) = freezer.wait_thawed(
                        config.daemon.cgroup_remove_timeout_s,
                        config.daemon.freezer_wait_hz,
                    ) {
                        warn!("freezer of {} will not thaw: {}", self.name, e);
                    }
                }
            }
            cg.remove(config.daemon.cgroup_remove_timeout_s)?;
        }

        if let Some(net) = self.network.clone() {
            if let Err(e) = net.destroy_container_classes(self.id) {
                warn!("cannot remove tc classes of {}: {}", self.name, e);
            }
        }

        self.clear_task();
        self.close_oom_event();
        if let Some(mut stream) = self.stdout.take() {
            stream.cleanup();
        }
        if let Some(mut stream) = self.stderr.take() {
            stream.cleanup();
        }
        self.state = State::Stopped;
        info!("stopped {}", self.name);
        Ok(())
    }

    pub fn pause(&mut self, config: &Config) -> Result<()> {
        if self.state != State::Running && self.state != State::Meta {
            return Err(Error::new(
                ErrorKind::InvalidState,
                format!("cannot pause container in state {}", self.state.name()),
            ));
        }
        let cg = self.cgroup.as_ref().ok_or_else(|| {
            Error::new(ErrorKind::Unknown, "running container without cgroups")
        })?;
        let freezer = cg
            .controller_of::<FreezerController>()
            .ok_or_else(|| Error::new(ErrorKind::NotSupported, "freezer is not available"))?;
        freezer.freeze()?;
        freezer.wait_frozen(
            config.daemon.freezer_wait_timeout_s,
            config.daemon.freezer_wait_hz,
        )?;
        self.prev_state = self.state;
        self.state = State::Paused;
        Ok(())
    }

    pub fn resume(&mut self, config: &Config) -> Result<()> {
        if self.state != State::Paused {
            return Err(Error::new(
                ErrorKind::InvalidState,
                format!("cannot resume container in state {}", self.state.name()),
            ));
        }
        let cg = self.cgroup.as_ref().ok_or_else(|| {
            Error::new(ErrorKind::Unknown, "paused container without cgroups")
        })?;
        let freezer = cg
            .controller_of::<FreezerController>()
            .ok_or_else(|| Error::new(ErrorKind::NotSupported, "freezer is not available"))?;
        freezer.thaw()?;
        freezer.wait_thawed(
            config.daemon.freezer_wait_timeout_s,
            config.daemon.freezer_wait_hz,
        )?;
        self.state = self.prev_state;
        Ok(())
    }

    /// A parent was paused: this container's tasks are frozen with it, only
    /// the reported state changes.
    pub fn mark_paused(&mut self) {
        self.prev_state = self.state;
        self.state = State::Paused;
    }

    pub fn unmark_paused(&mut self) {
        if self.state == State::Paused {
            self.state = self.prev_state;
        }
    }

    pub fn kill(&self, signal: i32) -> Result<()> {
        if self.state != State::Running {
            return Err(Error::new(
                ErrorKind::InvalidState,
                format!("cannot kill container in state {}", self.state.name()),
            ));
        }
        let signal = Signal::try_from(signal)
            .map_err(|_| Error::new(ErrorKind::InvalidValue, format!("invalid signal {}", signal)))?;
        kill(Pid::from_raw(self.task_pid as i32), signal)
            .map_err(|e| Error::from(e).context(format!("kill {}", self.task_pid)))
    }

    /// The task died: record how. Called from SIGCHLD reconciliation with
    /// the raw wait status.
    pub fn on_task_exit(&mut self, wait_status: i32) {
        self.exit_status = wait_status;
        self.death_time_ms = now_ms();
        self.oom_killed = self.check_oom();
        self.clear_task();
        self.close_oom_event();
        self.state = State::Dead;
        info!(
            "{} died, status {}{}",
            self.name,
            self.exit_status,
            if self.oom_killed { " (oom)" } else { "" }
        );
    }

    fn check_oom(&self) -> bool {
        if let Some(fd) = self.oom_event_fd {
            let mut buf = [0u8; 8];
            if let Ok(n) = nix::unistd::read(fd, &mut buf) {
                if n == 8 && u64::from_ne_bytes(buf) > 0 {
                    return true;
                }
            }
        }
        if let Some(cg) = &self.cgroup {
            if let Some(mem) = cg.controller_of::<MemController>() {
                return mem.oom_kills().map(|n| n > 0).unwrap_or(false);
            }
        }
        false
    }

    /// Whether a dead container is due for aging or respawn.
    pub fn aged_out(&self, config: &Config) -> bool {
        self.state == State::Dead
            && now_ms().saturating_sub(self.death_time_ms) > self.aging_time_s(config) * 1000
    }

    pub fn may_respawn(&self, config: &Config) -> bool {
        self.state == State::Dead
            && self.respawn_enabled(config)
            && (self.max_respawns(config) < 0
                || self.respawn_count < self.max_respawns(config) as u64)
    }

    fn clear_task(&mut self) {
        self.wait_pid = 0;
        self.task_pid = 0;
        self.task_vpid = 0;
    }

    fn close_oom_event(&mut self) {
        if let Some(fd) = self.oom_event_fd.take() {
            let _ = nix::unistd::close(fd);
        }
    }

    /// Live state of the freezer, used during restore.
    pub fn freezer_state(&self) -> Option<FreezerState> {
        self.cgroup
            .as_ref()
            .and_then(|cg| cg.controller_of::<FreezerController>())
            .and_then(|f| f.state().ok())
    }
}

/// Container name validation: charset, structure and a caller-dependent
/// length cap.
pub fn valid_name(name: &str, superuser: bool, config: &Config) -> Result<()> {
    let max = if superuser {
        config.container.max_name_len_privileged
    } else {
        config.container.max_name_len
    };
    if name.is_empty() {
        return Err(Error::new(ErrorKind::InvalidValue, "container name is empty"));
    }
    if name.len() > max {
        return Err(Error::new(
            ErrorKind::InvalidValue,
            format!("container name is longer than {} characters", max),
        ));
    }
    if name == ROOT_CONTAINER || name == PORTO_ROOT_CONTAINER {
        return Err(Error::new(
            ErrorKind::InvalidValue,
            format!("container name {} is reserved", name),
        ));
    }
    for component in name.split('/') {
        if component.is_empty() {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                format!("invalid container name {:?}", name),
            ));
        }
        if !component
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-@:.".contains(c))
        {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                format!("invalid character in container name {:?}", name),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config::default()
    }

    #[test]
    fn names_are_validated() {
        let cfg = config();
        assert!(valid_name("a", false, &cfg).is_ok());
        assert!(valid_name("a/b-c_d.e:f@g", false, &cfg).is_ok());
        assert!(valid_name("", false, &cfg).is_err());
        assert!(valid_name("/", false, &cfg).is_err());
        assert!(valid_name("a//b", false, &cfg).is_err());
        assert!(valid_name("a b", false, &cfg).is_err());
        let long = "x".repeat(67);
        assert!(valid_name(&long, false, &cfg).is_err());
        assert!(valid_name(&long, true, &cfg).is_ok());
        let very_long = "x".repeat(129);
        assert!(valid_name(&very_long, true, &cfg).is_err());
    }

    #[test]
    fn cgroup_paths() {
        let c = Container::new(4, "a/b", Some(3), Cred::root());
        assert_eq!(c.cgroup_path(), PathBuf::from("porto/a/b"));
        let root = Container::new(1, ROOT_CONTAINER, None, Cred::root());
        assert_eq!(root.cgroup_path(), PathBuf::from("porto"));
    }

    #[test]
    fn state_round_trip() {
        for state in &[
            State::Stopped,
            State::Starting,
            State::Running,
            State::Paused,
            State::Meta,
            State::Dead,
        ] {
            assert_eq!(State::parse(state.name()), Some(*state));
        }
        assert_eq!(State::parse("bogus"), None);
    }

    #[test]
    fn property_permissions() {
        let cfg = config();
        let mut c = Container::new(4, "a", Some(3), Cred::new(1000, 1000));
        let other = Cred::new(1001, 1001);
        let err = c
            .set_property(property::P_COMMAND, "sleep 1", &other, &cfg)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permission);
        c.set_property(property::P_COMMAND, "sleep 1", &Cred::new(1000, 1000), &cfg)
            .unwrap();
        assert_eq!(c.command(&cfg), "sleep 1");
    }

    #[test]
    fn running_properties_are_locked() {
        let cfg = config();
        let mut c = Container::new(4, "a", Some(3), Cred::root());
        c.state = State::Running;
        let err = c
            .set_property(property::P_COMMAND, "sleep 1", &Cred::root(), &cfg)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn stop_of_stopped_is_noop() {
        let cfg = config();
        let mut c = Container::new(4, "a", Some(3), Cred::root());
        assert!(c.stop(&cfg).is_ok());
        assert_eq!(c.state, State::Stopped);
    }

    #[test]
    fn kill_needs_running() {
        let c = Container::new(4, "a", Some(3), Cred::root());
        assert_eq!(c.kill(9).unwrap_err().kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn respawn_accounting() {
        let cfg = config();
        let mut c = Container::new(4, "a", Some(3), Cred::root());
        c.props.insert(
            property::P_RESPAWN.to_string(),
            Value::Bool(true),
        );
        c.props.insert(property::P_MAX_RESPAWNS.to_string(), Value::Int(2));
        c.state = State::Dead;
        assert!(c.may_respawn(&cfg));
        c.respawn_count = 2;
        assert!(!c.may_respawn(&cfg));
    }
}
