//! This module handles cgroup operations. Start here!

use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

use log::{debug, info, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::error::*;
use crate::{CgroupPid, ControllIdentifier, Controller, Hierarchy, Subsystem};

/// A control group paired with every controller the container participates
/// in. The handle carries the relative path below each controller mount; the
/// group on disk is created and removed through it.
///
/// Note that if the handle goes out of scope and is dropped, the control
/// group is _not_ destroyed.
pub struct Cgroup {
    /// The list of subsystems that control this cgroup
    subsystems: Vec<Subsystem>,

    /// Path below the controller roots, e.g. `porto/a/b`.
    rel: PathBuf,
}

impl Cgroup {
    /// Create a handle for a control group in the hierarchy `hier`, with
    /// relative path `path`. Nothing is touched on disk.
    pub fn load<P: AsRef<Path>>(hier: &dyn Hierarchy, path: P) -> Cgroup {
        let path = path.as_ref();
        let mut subsystems = hier.subsystems();
        if path.as_os_str() != "" {
            subsystems = subsystems
                .into_iter()
                .map(|x| x.enter(path))
                .collect::<Vec<_>>();
        }

        Cgroup {
            subsystems,
            rel: path.to_path_buf(),
        }
    }

    /// Create the control group in every subsystem. Existing directories are
    /// fine: creation is idempotent.
    pub fn create(&self) -> Result<()> {
        for subsystem in &self.subsystems {
            subsystem.to_controller().create()?;
        }
        Ok(())
    }

    /// The relative path below each controller root.
    pub fn relpath(&self) -> &Path {
        &self.rel
    }

    /// The list of subsystems that this control group supports.
    pub fn subsystems(&self) -> &Vec<Subsystem> {
        &self.subsystems
    }

    /// The group exists if any controller directory exists.
    pub fn exists(&self) -> bool {
        self.subsystems.iter().any(|s| s.to_controller().exists())
    }

    /// Retrieve a controller based on type inference.
    ///
    /// ## Example:
    ///
    /// ```text
    /// let mem: &MemController = cgroup.controller_of()
    ///                             .expect("no memory controller attached");
    /// ```
    pub fn controller_of<'a, T>(&'a self) -> Option<&'a T>
    where
        &'a T: From<&'a Subsystem>,
        T: Controller + ControllIdentifier,
    {
        for i in &self.subsystems {
            if i.to_controller().control_type() == T::controller_type() {
                return Some(i.into());
            }
        }
        None
    }

    /// Attach a task to every controller of the control group.
    pub fn attach(&self, pid: CgroupPid) -> Result<()> {
        self.subsystems
            .iter()
            .try_for_each(|sub| sub.to_controller().attach(pid))
    }

    /// Processes in the control group, collected across subsystems.
    pub fn procs(&self) -> Vec<CgroupPid> {
        let mut v = self
            .subsystems
            .iter()
            .flat_map(|x| x.to_controller().procs())
            .collect::<Vec<_>>();
        v.sort();
        v.dedup();
        v
    }

    /// All tasks (threads included) in the control group.
    pub fn tasks(&self) -> Vec<CgroupPid> {
        let mut v = self
            .subsystems
            .iter()
            .flat_map(|x| x.to_controller().tasks())
            .collect::<Vec<_>>();
        v.sort();
        v.dedup();
        v
    }

    pub fn is_empty(&self) -> bool {
        self.tasks().is_empty()
    }

    /// Send `signal` to every task in the group. ESRCH is not an error: the
    /// task may exit while we iterate.
    pub fn kill_all(&self, signal: Signal) {
        for task in self.tasks() {
            match kill(Pid::from_raw(task.pid as i32), signal) {
                Ok(()) | Err(nix::Error::Sys(nix::errno::Errno::ESRCH)) => {}
                Err(e) => warn!("cannot kill {}: {}", task.pid, e),
            }
        }
    }

    /// Remove the control group from every subsystem.
    ///
    /// The caller has already terminated the container gracefully; anything
    /// still alive here is killed with SIGKILL, with bounded retries, before
    /// the directories are removed. Failures are logged per subsystem and do
    /// not stop the removal of the others.
    pub fn remove(&self, remove_timeout_s: u64) -> Result<()> {
        let retries = remove_timeout_s * 10;
        let mut settled = true;
        for retry in 0..=retries {
            self.kill_all(Signal::SIGKILL);
            if self.is_empty() {
                settled = true;
                break;
            }
            settled = false;
            if retry < retries {
                sleep(Duration::from_millis(100));
            }
        }

        if !settled {
            warn!("cannot kill all tasks in cgroup {}", self.rel.display());
            for pid in self.procs() {
                debug!(
                    "straggler {}: {:?}",
                    pid.pid,
                    std::fs::read_to_string(format!("/proc/{}/status", pid.pid))
                        .unwrap_or_default()
                        .lines()
                        .take(3)
                        .collect::<Vec<_>>()
                );
            }
        }

        info!("remove cgroup {}", self.rel.display());
        let mut first_error = None;
        for sub in &self.subsystems {
            if let Err(e) = sub.to_controller().delete() {
                warn!("cannot remove cgroup directory: {}", e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
