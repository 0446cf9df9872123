/* Memory controller */
use std::collections::HashMap;
use std::io::Write;
use std::os::unix::io::RawFd;
use std::path::PathBuf;

use crate::error::*;
use crate::{ControllIdentifier, ControllerInternal, Controllers, Subsystem};

/// Knob written by `set_guarantee` when the kernel provides it.
const GUARANTEE_KNOB: &str = "memory.low_limit_in_bytes";

#[derive(Debug, Clone)]
pub struct MemController {
    base: PathBuf,
    path: PathBuf,
}

impl ControllerInternal for MemController {
    fn control_type(&self) -> Controllers {
        Controllers::Mem
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

impl ControllIdentifier for MemController {
    fn controller_type() -> Controllers {
        Controllers::Mem
    }
}

impl<'a> From<&'a Subsystem> for &'a MemController {
    fn from(sub: &'a Subsystem) -> &'a MemController {
        match sub {
            Subsystem::Mem(c) => c,
            _ => panic!("not a memory controller"),
        }
    }
}

impl MemController {
    pub fn new(root: PathBuf) -> Self {
        Self {
            base: root.clone(),
            path: root,
        }
    }

    pub fn usage(&self) -> Result<u64> {
        self.read_u64_from("memory.usage_in_bytes")
    }

    /// Set the hard limit. Zero means "do not limit" and leaves the knobs
    /// alone. When the kernel supports memsw the swap+memory limit follows
    /// the memory limit.
    pub fn set_limit(&self, limit: u64) -> Result<()> {
        if limit == 0 {
            return Ok(());
        }
        self.write_value_to("memory.limit_in_bytes", limit)?;
        if self.supports_swap() {
            self.write_value_to("memory.memsw.limit_in_bytes", limit)?;
        }
        Ok(())
    }

    pub fn set_soft_limit(&self, limit: u64) -> Result<()> {
        self.write_value_to("memory.soft_limit_in_bytes", limit)
    }

    /// Low-limit guarantee; a no-op on kernels without the knob.
    pub fn set_guarantee(&self, guarantee: u64) -> Result<()> {
        if !self.supports_guarantee() {
            return Ok(());
        }
        self.write_value_to(GUARANTEE_KNOB, guarantee)
    }

    pub fn set_recharge_on_pgfault(&self, enable: bool) -> Result<()> {
        if !self.supports_recharge_on_pgfault() {
            return Ok(());
        }
        self.write_value_to("memory.recharge_on_pgfault", if enable { "1" } else { "0" })
    }

    pub fn supports_guarantee(&self) -> bool {
        self.root().knob_exists(GUARANTEE_KNOB)
    }

    pub fn supports_recharge_on_pgfault(&self) -> bool {
        self.root().knob_exists("memory.recharge_on_pgfault")
    }

    pub fn supports_swap(&self) -> bool {
        self.root().knob_exists("memory.memsw.limit_in_bytes")
    }

    /// A named counter out of `memory.stat`.
    pub fn statistics(&self, name: &str) -> Result<u64> {
        let map = self.stat_map()?;
        map.get(name).copied().ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidValue,
                format!("invalid memory cgroup stat: {}", name),
            )
        })
    }

    pub fn stat_map(&self) -> Result<HashMap<String, u64>> {
        let lines = self.read_lines_from("memory.stat")?;
        let mut map = HashMap::new();
        for line in lines {
            let mut tokens = line.split_whitespace();
            if let (Some(name), Some(value)) = (tokens.next(), tokens.next()) {
                if let Ok(value) = value.parse() {
                    map.insert(name.to_string(), value);
                }
            }
        }
        Ok(map)
    }

    /// Number of oom kills in this group, from `memory.oom_control` on
    /// kernels that report it.
    pub fn oom_kills(&self) -> Result<u64> {
        let lines = self.read_lines_from("memory.oom_control")?;
        for line in lines {
            let mut tokens = line.split_whitespace();
            if let (Some("oom_kill"), Some(value)) = (tokens.next(), tokens.next()) {
                return value.parse().map_err(|_| {
                    Error::new(ErrorKind::Unknown, "cannot parse oom_control")
                });
            }
        }
        Ok(0)
    }

    /// Register an eventfd that fires on oom events in this group. The
    /// returned fd is owned by the caller and polled by the event loop.
    pub fn setup_oom_event(&self) -> Result<RawFd> {
        use nix::sys::eventfd::{eventfd, EfdFlags};

        let efd = eventfd(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)
            .map_err(|e| Error::from(e).context("eventfd"))?;

        let result = (|| -> Result<()> {
            let oom = self.open_path("memory.oom_control", false)?;
            let mut control = self.open_path("cgroup.event_control", true)?;
            use std::os::unix::io::AsRawFd;
            control
                .write_all(format!("{} {}", efd, oom.as_raw_fd()).as_bytes())
                .map_err(|e| Error::from(e).context("cgroup.event_control"))?;
            Ok(())
        })();

        if let Err(e) = result {
            let _ = nix::unistd::close(efd);
            return Err(e);
        }
        Ok(efd)
    }

    fn root(&self) -> MemController {
        MemController::new(self.base.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_map_parses_pairs() {
        // parsing only; knob reads are covered by the integration tests
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("memory.stat"),
            "cache 4096\nrss 12288\ntotal_rss 12288\n",
        )
        .unwrap();
        let c = MemController::new(dir.path().to_path_buf());
        let map = c.stat_map().unwrap();
        assert_eq!(map["rss"], 12288);
        assert_eq!(c.statistics("cache").unwrap(), 4096);
        let err = c.statistics("nope").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidValue);
    }
}
