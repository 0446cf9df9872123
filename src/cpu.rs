/* CPU controller */
use std::path::PathBuf;

use crate::error::*;
use crate::{ControllIdentifier, ControllerInternal, Controllers, Subsystem};

/// Scheduling policy of a container, applied through the cpu cgroup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuPolicy {
    Normal,
    /// Realtime boost via the `cpu.smart` extension knob.
    Rt,
    Idle,
}

impl CpuPolicy {
    pub fn parse(s: &str) -> Result<CpuPolicy> {
        match s {
            "normal" => Ok(CpuPolicy::Normal),
            "rt" => Ok(CpuPolicy::Rt),
            "idle" => Ok(CpuPolicy::Idle),
            _ => Err(Error::new(
                ErrorKind::InvalidValue,
                format!("invalid cpu policy {:?}", s),
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CpuController {
    base: PathBuf,
    path: PathBuf,
}

impl ControllerInternal for CpuController {
    fn control_type(&self) -> Controllers {
        Controllers::Cpu
    }
    fn get_path(&self) -> &PathBuf {
        &self.path
    }
    fn get_path_mut(&mut self) -> &mut PathBuf {
        &mut self.path
    }
    fn get_base(&self) -> &PathBuf {
        &self.base
    }
}

impl ControllIdentifier for CpuController {
    fn controller_type() -> Controllers {
        Controllers::Cpu
    }
}

impl<'a> From<&'a Subsystem> for &'a CpuController {
    fn from(sub: &'a Subsystem) -> &'a CpuController {
        match sub {
            Subsystem::Cpu(c) => c,
            _ => panic!("not a cpu controller"),
        }
    }
}

impl CpuController {
    pub fn new(root: PathBuf) -> Self {
        Self {
            base: root.clone(),
            path: root,
        }
    }

    /// `rt` requires the `cpu.smart` extension; `idle` is rejected outright.
    pub fn set_policy(&self, policy: CpuPolicy) -> Result<()> {
        match policy {
            CpuPolicy::Normal => {
                if self.supports_smart() {
                    self.write_value_to("cpu.smart", "0")?;
                }
                Ok(())
            }
            CpuPolicy::Rt => {
                if !self.supports_smart() {
                    return Err(Error::new(
                        ErrorKind::NotSupported,
                        "cpu.smart is not present on this kernel",
                    ));
                }
                self.write_value_to("cpu.smart", "1")
            }
            CpuPolicy::Idle => Err(Error::new(
                ErrorKind::NotSupported,
                "cpu policy idle is not supported",
            )),
        }
    }

    /// Limit in percent of the whole machine: translated into a CFS quota
    /// over the configured period. 100 removes the quota.
    pub fn set_limit(&self, limit: u64) -> Result<()> {
        if !self.supports_limit() {
            return Ok(());
        }
        if limit == 100 {
            return self.write_value_to("cpu.cfs_quota_us", "-1");
        }
        let period = self.read_u64_from("cpu.cfs_period_us")?;
        let mut quota = num_cores() * period * limit / 100;
        // the kernel rejects quotas under 1ms
        const MIN_QUOTA: u64 = 1000;
        if quota < MIN_QUOTA {
            quota = MIN_QUOTA;
        }
        self.write_value_to("cpu.cfs_quota_us", quota)
    }

    /// Guarantee in percent, scaled into `cpu.shares` relative to the root
    /// group's shares.
    pub fn set_guarantee(&self, guarantee: u64) -> Result<()> {
        if !self.supports_guarantee() {
            return Ok(());
        }
        let root_shares = self.root().read_u64_from("cpu.shares")?;
        let guarantee = guarantee.max(1);
        self.write_value_to("cpu.shares", guarantee * root_shares)
    }

    pub fn supports_smart(&self) -> bool {
        self.root().knob_exists("cpu.smart")
    }

    pub fn supports_limit(&self) -> bool {
        self.root().knob_exists("cpu.cfs_period_us")
    }

    pub fn supports_guarantee(&self) -> bool {
        self.root().knob_exists("cpu.shares")
    }

    fn root(&self) -> CpuController {
        CpuController::new(self.base.clone())
    }
}

pub fn num_cores() -> u64 {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n < 1 {
        1
    } else {
        n as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_parse() {
        assert_eq!(CpuPolicy::parse("normal").unwrap(), CpuPolicy::Normal);
        assert_eq!(CpuPolicy::parse("rt").unwrap(), CpuPolicy::Rt);
        assert_eq!(CpuPolicy::parse("idle").unwrap(), CpuPolicy::Idle);
        assert!(CpuPolicy::parse("batch").is_err());
    }

    #[test]
    fn idle_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let c = CpuController::new(dir.path().to_path_buf());
        let err = c.set_policy(CpuPolicy::Idle).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSupported);
    }

    #[test]
    fn rt_needs_the_smart_knob() {
        let dir = tempfile::tempdir().unwrap();
        let c = CpuController::new(dir.path().to_path_buf());
        let err = c.set_policy(CpuPolicy::Rt).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSupported);
    }

    #[test]
    fn limit_translates_to_quota() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cpu.cfs_period_us"), "100000\n").unwrap();
        std::fs::write(dir.path().join("cpu.cfs_quota_us"), "-1\n").unwrap();
        let c = CpuController::new(dir.path().to_path_buf());
        c.set_limit(50).unwrap();
        let quota: u64 = std::fs::read_to_string(dir.path().join("cpu.cfs_quota_us"))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert_eq!(quota, num_cores() * 100000 * 50 / 100);
        c.set_limit(100).unwrap();
        let raw = std::fs::read_to_string(dir.path().join("cpu.cfs_quota_us")).unwrap();
        assert_eq!(raw.trim(), "-1");
    }
}
