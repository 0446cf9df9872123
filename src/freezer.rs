/* Freezer controller */
use std::path::PathBuf;
use std::thread::sleep;
use std::time::Duration;

use crate::error::*;
use crate::{ControllIdentifier, ControllerInternal, Controllers, Subsystem};

#[derive(Debug, Clone)]
pub struct FreezerController {
    base: PathBuf,
    path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreezerState {
    Thawed,
    Freezing,
    Frozen,
}

impl FreezerState {
    fn knob_value(self) -> &'static str {
        match self {
            FreezerState::Thawed => "THAWED",
            FreezerState::Freezing => "FREEZING",
            FreezerState::Frozen => "FROZEN",
        }
    }
}

impl ControllerInternal for FreezerController {
    fn control_type(&self) -> Controllers {
        Controllers::Freezer
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

impl ControllIdentifier for FreezerController {
    fn controller_type() -> Controllers {
        Controllers::Freezer
    }
}

impl<'a> From<&'a Subsystem> for &'a FreezerController {
    fn from(sub: &'a Subsystem) -> &'a FreezerController {
        match sub {
            Subsystem::Freezer(c) => c,
            _ => panic!("not a freezer controller"),
        }
    }
}

impl FreezerController {
    pub fn new(root: PathBuf) -> Self {
        Self {
            base: root.clone(),
            path: root,
        }
    }

    /// Freezing affects the whole subtree below this cgroup.
    pub fn freeze(&self) -> Result<()> {
        self.write_value_to("freezer.state", "FROZEN")
    }

    pub fn thaw(&self) -> Result<()> {
        self.write_value_to("freezer.state", "THAWED")
    }

    pub fn state(&self) -> Result<FreezerState> {
        let s = self.read_string_from("freezer.state")?;
        match s.as_str() {
            "THAWED" => Ok(FreezerState::Thawed),
            "FREEZING" => Ok(FreezerState::Freezing),
            "FROZEN" => Ok(FreezerState::Frozen),
            _ => Err(Error::new(
                ErrorKind::Unknown,
                format!("unexpected freezer state {:?}", s),
            )),
        }
    }

    pub fn is_frozen(&self) -> bool {
        !matches!(self.state(), Ok(FreezerState::Thawed))
    }

    /// Poll the state knob until it reports `target`. The kernel freezes a
    /// group asynchronously, and a group can stay FREEZING for a while on a
    /// loaded machine. Retries are bounded by `timeout_s * hz` at `1/hz`
    /// intervals.
    pub fn wait_state(&self, target: FreezerState, timeout_s: u64, hz: u64) -> Result<()> {
        let retries = timeout_s * hz;
        let interval = Duration::from_millis(1000 / hz.max(1));
        for retry in 0..=retries {
            match self.state() {
                Ok(state) if state == target => return Ok(()),
                Ok(_) => {}
                Err(e) => log::warn!("cannot read freezer state: {}", e),
            }
            if retry < retries {
                sleep(interval);
            }
        }
        let current = self
            .state()
            .map(|s| s.knob_value().to_string())
            .unwrap_or_else(|_| "?".to_string());
        Err(Error::new(
            ErrorKind::Unknown,
            format!(
                "cannot wait {}s for freezer state {}, current state is {}",
                timeout_s,
                target.knob_value(),
                current
            ),
        ))
    }

    pub fn wait_frozen(&self, timeout_s: u64, hz: u64) -> Result<()> {
        self.wait_state(FreezerState::Frozen, timeout_s, hz)
    }

    pub fn wait_thawed(&self, timeout_s: u64, hz: u64) -> Result<()> {
        self.wait_state(FreezerState::Thawed, timeout_s, hz)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_parses() {
        let dir = tempfile::tempdir().unwrap();
        let c = FreezerController::new(dir.path().to_path_buf());
        std::fs::write(dir.path().join("freezer.state"), "FROZEN\n").unwrap();
        assert_eq!(c.state().unwrap(), FreezerState::Frozen);
        assert!(c.is_frozen());
        std::fs::write(dir.path().join("freezer.state"), "THAWED\n").unwrap();
        assert_eq!(c.state().unwrap(), FreezerState::Thawed);
        assert!(!c.is_frozen());
    }

    #[test]
    fn wait_state_reports_current_on_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let c = FreezerController::new(dir.path().to_path_buf());
        std::fs::write(dir.path().join("freezer.state"), "FREEZING\n").unwrap();
        let err = c.wait_state(FreezerState::Frozen, 0, 10).unwrap_err();
        assert!(err.text().contains("FREEZING"));
    }
}
