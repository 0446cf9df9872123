//! This module represents the various control group hierarchies the Linux
//! kernel supports.
//!
//! Currently, we only support the cgroupv1 hierarchy. Mount points are
//! discovered from /proc/self/mountinfo at startup; controllers mounted in
//! the same directory (e.g. cpu,cpuacct) share their cgroup tree, which is
//! reflected here by both controllers reporting the same mount point.

use std::path::{Path, PathBuf};

use crate::blkio::BlkIoController;
use crate::cpu::CpuController;
use crate::cpuacct::CpuAcctController;
use crate::devices::DevicesController;
use crate::error::{Error, ErrorKind, Result};
use crate::freezer::FreezerController;
use crate::memory::MemController;
use crate::mount;
use crate::net_cls::NetClsController;
use crate::{Controllers, Hierarchy, Subsystem};

/// The standard, original cgroup implementation. Often referred to as "cgroupv1".
#[derive(Debug)]
pub struct V1 {
    /// One entry per controller we know about, in `Controllers::all()` order.
    mount_points: Vec<(Controllers, PathBuf)>,
}

impl Hierarchy for V1 {
    fn subsystems(&self) -> Vec<Subsystem> {
        let mut subs = vec![];
        for (sub, point) in &self.mount_points {
            let root = point.clone();
            subs.push(match sub {
                Controllers::Mem => Subsystem::Mem(MemController::new(root)),
                Controllers::Freezer => Subsystem::Freezer(FreezerController::new(root)),
                Controllers::Cpu => Subsystem::Cpu(CpuController::new(root)),
                Controllers::CpuAcct => Subsystem::CpuAcct(CpuAcctController::new(root)),
                Controllers::BlkIo => Subsystem::BlkIo(BlkIoController::new(root)),
                Controllers::Devices => Subsystem::Devices(DevicesController::new(root)),
                Controllers::NetCls => Subsystem::NetCls(NetClsController::new(root)),
            });
        }
        subs
    }

    fn mount_point(&self, sub: Controllers) -> Option<PathBuf> {
        self.mount_points
            .iter()
            .find(|(s, _)| *s == sub)
            .map(|(_, p)| p.clone())
    }
}

impl V1 {
    /// Finds where control groups are mounted to and returns a hierarchy in
    /// which control groups can be created.
    pub fn new() -> Result<Self> {
        let mounts = mount::mounts()?;
        Self::from_mounts(&mounts)
    }

    pub(crate) fn from_mounts(mounts: &[mount::MountEntry]) -> Result<Self> {
        let mut mount_points = vec![];
        for sub in Controllers::all() {
            let name = sub.to_string();
            let found = mounts.iter().find(|m| {
                m.fstype == "cgroup" && m.super_options.iter().any(|o| *o == name)
            });
            if let Some(m) = found {
                mount_points.push((*sub, m.mount_point.clone()));
            }
        }
        if mount_points.is_empty() {
            return Err(Error::new(
                ErrorKind::NotSupported,
                "no cgroup hierarchies are mounted",
            ));
        }
        Ok(V1 { mount_points })
    }

    /// The freezer mount point; the freezer tree is the daemon's source of
    /// truth for container membership, so it must be present.
    pub fn freezer_root(&self) -> Result<PathBuf> {
        self.mount_point(Controllers::Freezer).ok_or_else(|| {
            Error::new(ErrorKind::NotSupported, "freezer cgroup is not mounted")
        })
    }

    /// Relative freezer path of a pid, read from /proc/<pid>/cgroup.
    pub fn task_freezer_path(pid: u32) -> Result<PathBuf> {
        let text = std::fs::read_to_string(format!("/proc/{}/cgroup", pid))
            .map_err(|e| Error::from(e).context(format!("read cgroup of {}", pid)))?;
        Self::freezer_path_from(&text).ok_or_else(|| {
            Error::new(
                ErrorKind::Unknown,
                format!("no freezer cgroup for pid {}", pid),
            )
        })
    }

    fn freezer_path_from(text: &str) -> Option<PathBuf> {
        for line in text.lines() {
            // N:controller[,controller]:/path
            let mut fields = line.splitn(3, ':');
            let _ = fields.next()?;
            let controllers = fields.next()?;
            let path = fields.next()?;
            if controllers.split(',').any(|c| c == "freezer") {
                return Some(PathBuf::from(path.trim_start_matches('/')));
            }
        }
        None
    }
}

/// Controllers that happen to be mounted together share one directory; the
/// container cgroup below it must be created only once.
pub fn unique_mount_points(hier: &dyn Hierarchy) -> Vec<PathBuf> {
    let mut points: Vec<PathBuf> = Controllers::all()
        .iter()
        .filter_map(|sub| hier.mount_point(*sub))
        .collect();
    points.sort();
    points.dedup();
    points
}

/// Make sure `path` stays inside `root` after normalization.
pub fn contained(root: &Path, path: &Path) -> bool {
    path.starts_with(root)
        && !path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::MountEntry;

    fn entry(point: &str, opts: &[&str]) -> MountEntry {
        MountEntry {
            mount_point: PathBuf::from(point),
            fstype: "cgroup".to_string(),
            source: "cgroup".to_string(),
            super_options: opts.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn discovers_mounted_controllers() {
        let mounts = vec![
            entry("/sys/fs/cgroup/memory", &["rw", "memory"]),
            entry("/sys/fs/cgroup/freezer", &["rw", "freezer"]),
            entry("/sys/fs/cgroup/cpu,cpuacct", &["rw", "cpu", "cpuacct"]),
        ];
        let hier = V1::from_mounts(&mounts).unwrap();
        assert!(hier.check_support(Controllers::Mem));
        assert!(hier.check_support(Controllers::Freezer));
        assert!(!hier.check_support(Controllers::BlkIo));
        // cpu and cpuacct share the tree
        assert_eq!(
            hier.mount_point(Controllers::Cpu),
            hier.mount_point(Controllers::CpuAcct)
        );
        assert_eq!(unique_mount_points(&hier).len(), 3);
    }

    #[test]
    fn no_cgroups_is_an_error() {
        let mounts = vec![MountEntry {
            mount_point: PathBuf::from("/"),
            fstype: "ext4".to_string(),
            source: "/dev/sda1".to_string(),
            super_options: vec![],
        }];
        assert!(V1::from_mounts(&mounts).is_err());
    }

    #[test]
    fn freezer_path_parse() {
        let text = "12:freezer:/porto/a\n11:cpu,cpuacct:/porto/a\n";
        assert_eq!(
            V1::freezer_path_from(text),
            Some(PathBuf::from("porto/a"))
        );
        assert_eq!(V1::freezer_path_from("3:memory:/porto/a\n"), None);
    }

    #[test]
    fn containment() {
        let root = Path::new("/sys/fs/cgroup/freezer");
        assert!(contained(root, Path::new("/sys/fs/cgroup/freezer/porto/a")));
        assert!(!contained(root, Path::new("/sys/fs/cgroup/memory/porto/a")));
        assert!(!contained(
            root,
            Path::new("/sys/fs/cgroup/freezer/porto/../../../etc")
        ));
    }
}
