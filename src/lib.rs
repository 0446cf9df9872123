//! porto is a Linux container management daemon: it creates, supervises and
//! tears down process containers built on control groups, namespaces, bind
//! mounts, HTB traffic shaping and quota-managed storage volumes.
//!
//! The crate is organized bottom-up: cgroup controllers and kernel plumbing
//! first, then the container/volume/network object models, then the RPC
//! surface and the daemon event loop tying them together.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};

pub mod blkio;
pub mod cgroup;
pub mod config;
pub mod container;
pub mod cpu;
pub mod cpuacct;
pub mod cred;
pub mod daemon;
pub mod data;
pub mod devices;
pub mod env;
pub mod error;
pub mod freezer;
pub mod hierarchies;
pub mod holder;
pub mod idmap;
pub mod kv;
pub mod loopdev;
pub mod memory;
pub mod mount;
pub mod net_cls;
pub mod netlink;
pub mod network;
pub mod property;
pub mod protocol;
pub mod quota;
pub mod rpc;
pub mod stream;
pub mod task;
pub mod value;
pub mod volume;

use blkio::BlkIoController;
use cpu::CpuController;
use cpuacct::CpuAcctController;
use devices::DevicesController;
use error::*;
use freezer::FreezerController;
use memory::MemController;
use net_cls::NetClsController;

pub use cgroup::Cgroup;

/// The cgroup subtree owned by the daemon; containers live under it.
pub const PORTO_ROOT_CGROUP: &str = "porto";
/// Sibling subtree holding the daemon's own processes.
pub const PORTO_DAEMON_CGROUP: &str = "porto-daemon";

/// Name of the implicit root container.
pub const ROOT_CONTAINER: &str = "/";
/// Name of the implicit porto root, parent of all client containers.
pub const PORTO_ROOT_CONTAINER: &str = "/porto";

/// Contains all the subsystems that are available in this crate.
#[derive(Debug)]
pub enum Subsystem {
    /// Controller for the `Mem` subsystem, see `MemController` for more information.
    Mem(MemController),
    /// Controller for the `Freezer` subsystem, see `FreezerController` for more information.
    Freezer(FreezerController),
    /// Controller for the `Cpu` subsystem, see `CpuController` for more information.
    Cpu(CpuController),
    /// Controller for the `CpuAcct` subsystem, see `CpuAcctController` for more information.
    CpuAcct(CpuAcctController),
    /// Controller for the `BlkIo` subsystem, see `BlkIoController` for more information.
    BlkIo(BlkIoController),
    /// Controller for the `Devices` subsystem, see `DevicesController` for more information.
    Devices(DevicesController),
    /// Controller for the `NetCls` subsystem, see `NetClsController` for more information.
    NetCls(NetClsController),
}

#[doc(hidden)]
#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum Controllers {
    Mem,
    Freezer,
    Cpu,
    CpuAcct,
    BlkIo,
    Devices,
    NetCls,
}

impl Controllers {
    pub fn to_string(&self) -> String {
        match self {
            Controllers::Mem => "memory".to_string(),
            Controllers::Freezer => "freezer".to_string(),
            Controllers::Cpu => "cpu".to_string(),
            Controllers::CpuAcct => "cpuacct".to_string(),
            Controllers::BlkIo => "blkio".to_string(),
            Controllers::Devices => "devices".to_string(),
            Controllers::NetCls => "net_cls".to_string(),
        }
    }

    pub fn all() -> &'static [Controllers] {
        &[
            Controllers::Mem,
            Controllers::Freezer,
            Controllers::Cpu,
            Controllers::CpuAcct,
            Controllers::BlkIo,
            Controllers::Devices,
            Controllers::NetCls,
        ]
    }
}

mod sealed {
    use super::*;

    pub trait ControllerInternal {
        // meta stuff
        fn control_type(&self) -> Controllers;
        fn get_path(&self) -> &PathBuf;
        fn get_path_mut(&mut self) -> &mut PathBuf;
        fn get_base(&self) -> &PathBuf;

        fn verify_path(&self) -> Result<()> {
            if self.get_path().starts_with(self.get_base()) {
                Ok(())
            } else {
                Err(Error::new(
                    ErrorKind::InvalidValue,
                    format!("cgroup path escapes its root: {:?}", self.get_path()),
                ))
            }
        }

        fn open_path(&self, p: &str, w: bool) -> Result<File> {
            let mut path = self.get_path().clone();
            path.push(p);

            self.verify_path()?;

            if w {
                File::create(&path)
                    .map_err(|e| Error::from(e).context(format!("write {}", path.display())))
            } else {
                File::open(&path)
                    .map_err(|e| Error::from(e).context(format!("read {}", path.display())))
            }
        }

        #[doc(hidden)]
        fn knob_exists(&self, p: &str) -> bool {
            if self.verify_path().is_err() {
                return false;
            }
            self.get_path().join(p).exists()
        }

        fn read_string_from(&self, knob: &str) -> Result<String> {
            let mut file = self.open_path(knob, false)?;
            let mut string = String::new();
            file.read_to_string(&mut string)?;
            Ok(string.trim().to_string())
        }

        fn read_u64_from(&self, knob: &str) -> Result<u64> {
            let s = self.read_string_from(knob)?;
            s.parse().map_err(|_| {
                Error::new(
                    ErrorKind::Unknown,
                    format!("cannot parse {} value {:?}", knob, s),
                )
            })
        }

        fn read_i64_from(&self, knob: &str) -> Result<i64> {
            let s = self.read_string_from(knob)?;
            s.parse().map_err(|_| {
                Error::new(
                    ErrorKind::Unknown,
                    format!("cannot parse {} value {:?}", knob, s),
                )
            })
        }

        fn read_lines_from(&self, knob: &str) -> Result<Vec<String>> {
            let file = self.open_path(knob, false)?;
            let mut lines = vec![];
            for line in BufReader::new(file).lines() {
                lines.push(line?);
            }
            Ok(lines)
        }

        fn write_value_to<T: ToString>(&self, knob: &str, value: T) -> Result<()> {
            let value = value.to_string();
            log::debug!("set {}/{} = {}", self.get_path().display(), knob, value);
            let mut file = self.open_path(knob, true)?;
            file.write_all(value.as_bytes())
                .map_err(|e| Error::from(e).context(format!("write {} = {}", knob, value)))
        }
    }
}

pub(crate) use sealed::ControllerInternal;

/// A Controller is a subsystem attached to the control group.
///
/// Implementors are able to control certain aspects of a control group.
pub trait Controller {
    #[doc(hidden)]
    fn control_type(&self) -> Controllers;

    /// The file system path to the controller.
    fn path(&self) -> &Path;

    /// Create this controller's directory. Succeeds if it already exists.
    fn create(&self) -> Result<()>;

    /// Does this controller already exist?
    fn exists(&self) -> bool;

    /// Delete the controller directory. Missing directories are fine.
    fn delete(&self) -> Result<()>;

    /// Attach a task to this controller.
    fn attach(&self, pid: CgroupPid) -> Result<()>;

    /// Process ids in this cgroup (thread-group leaders).
    fn procs(&self) -> Vec<CgroupPid>;

    /// All task ids in this cgroup, including threads.
    fn tasks(&self) -> Vec<CgroupPid>;

    /// Whether a knob file exists for this cgroup.
    fn has_knob(&self, knob: &str) -> bool;
}

impl<T> Controller for T
where
    T: ControllerInternal,
{
    fn control_type(&self) -> Controllers {
        ControllerInternal::control_type(self)
    }

    fn path(&self) -> &Path {
        self.get_path()
    }

    fn create(&self) -> Result<()> {
        self.verify_path()?;

        match ::std::fs::create_dir(self.get_path()) {
            Ok(()) => Ok(()),
            Err(ref e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => {
                Err(Error::from(e).context(format!("mkdir {}", self.get_path().display())))
            }
        }
    }

    fn exists(&self) -> bool {
        self.get_path().exists()
    }

    fn delete(&self) -> Result<()> {
        if !self.get_path().exists() {
            return Ok(());
        }
        ::std::fs::remove_dir(self.get_path())
            .map_err(|e| Error::from(e).context(format!("rmdir {}", self.get_path().display())))
    }

    fn attach(&self, pid: CgroupPid) -> Result<()> {
        self.write_value_to("cgroup.procs", pid.pid)
    }

    fn procs(&self) -> Vec<CgroupPid> {
        self.pid_list("cgroup.procs")
    }

    fn tasks(&self) -> Vec<CgroupPid> {
        self.pid_list("tasks")
    }

    fn has_knob(&self, knob: &str) -> bool {
        self.knob_exists(knob)
    }
}

trait PidList {
    fn pid_list(&self, knob: &str) -> Vec<CgroupPid>;
}

impl<T: ControllerInternal> PidList for T {
    fn pid_list(&self, knob: &str) -> Vec<CgroupPid> {
        self.read_lines_from(knob)
            .map(|lines| {
                lines
                    .iter()
                    .filter_map(|line| line.trim().parse::<u64>().ok())
                    .map(CgroupPid::from)
                    .collect()
            })
            .unwrap_or_else(|_| vec![])
    }
}

#[doc(hidden)]
pub trait ControllIdentifier {
    fn controller_type() -> Controllers;
}

/// Control group hierarchy (right now, only V1 is supported).
pub trait Hierarchy {
    /// Returns what subsystems are supported by the hierarchy.
    fn subsystems(&self) -> Vec<Subsystem>;

    /// Returns the mount point of a controller, if it is mounted.
    fn mount_point(&self, sub: Controllers) -> Option<PathBuf>;

    /// Checks whether a certain subsystem is supported in the hierarchy.
    fn check_support(&self, sub: Controllers) -> bool {
        self.mount_point(sub).is_some()
    }
}

/// A structure representing a `pid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CgroupPid {
    /// The process identifier
    pub pid: u64,
}

impl From<u64> for CgroupPid {
    fn from(u: u64) -> CgroupPid {
        CgroupPid { pid: u }
    }
}

impl From<nix::unistd::Pid> for CgroupPid {
    fn from(pid: nix::unistd::Pid) -> CgroupPid {
        CgroupPid {
            pid: pid.as_raw() as u64,
        }
    }
}

impl Subsystem {
    pub(crate) fn enter(self, path: &Path) -> Self {
        match self {
            Subsystem::Mem(cont) => Subsystem::Mem({
                let mut c = cont.clone();
                c.get_path_mut().push(path);
                c
            }),
            Subsystem::Freezer(cont) => Subsystem::Freezer({
                let mut c = cont.clone();
                c.get_path_mut().push(path);
                c
            }),
            Subsystem::Cpu(cont) => Subsystem::Cpu({
                let mut c = cont.clone();
                c.get_path_mut().push(path);
                c
            }),
            Subsystem::CpuAcct(cont) => Subsystem::CpuAcct({
                let mut c = cont.clone();
                c.get_path_mut().push(path);
                c
            }),
            Subsystem::BlkIo(cont) => Subsystem::BlkIo({
                let mut c = cont.clone();
                c.get_path_mut().push(path);
                c
            }),
            Subsystem::Devices(cont) => Subsystem::Devices({
                let mut c = cont.clone();
                c.get_path_mut().push(path);
                c
            }),
            Subsystem::NetCls(cont) => Subsystem::NetCls({
                let mut c = cont.clone();
                c.get_path_mut().push(path);
                c
            }),
        }
    }

    pub fn to_controller(&self) -> &dyn Controller {
        match self {
            Subsystem::Mem(cont) => cont,
            Subsystem::Freezer(cont) => cont,
            Subsystem::Cpu(cont) => cont,
            Subsystem::CpuAcct(cont) => cont,
            Subsystem::BlkIo(cont) => cont,
            Subsystem::Devices(cont) => cont,
            Subsystem::NetCls(cont) => cont,
        }
    }
}
