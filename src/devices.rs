/* Devices controller */
use std::path::PathBuf;

use crate::error::*;
use crate::{ControllIdentifier, ControllerInternal, Controllers, Subsystem};

#[derive(Debug, Clone)]
pub struct DevicesController {
    base: PathBuf,
    path: PathBuf,
}

impl ControllerInternal for DevicesController {
    fn control_type(&self) -> Controllers {
        Controllers::Devices
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

impl ControllIdentifier for DevicesController {
    fn controller_type() -> Controllers {
        Controllers::Devices
    }
}

impl<'a> From<&'a Subsystem> for &'a DevicesController {
    fn from(sub: &'a Subsystem) -> &'a DevicesController {
        match sub {
            Subsystem::Devices(c) => c,
            _ => panic!("not a devices controller"),
        }
    }
}

impl DevicesController {
    pub fn new(root: PathBuf) -> Self {
        Self {
            base: root.clone(),
            path: root,
        }
    }

    /// Replace the allowed-device rules. `devices.deny a` followed by the
    /// whole allow list races with running tasks opening devices, so the
    /// rewrite is skipped when the current rule set already matches.
    pub fn allow(&self, rules: &[String]) -> Result<()> {
        let current = self.read_lines_from("devices.list")?;
        let unchanged = current.len() == rules.len()
            && current
                .iter()
                .zip(rules.iter())
                .all(|(a, b)| a.trim() == b.trim());
        if unchanged {
            log::debug!("allowed devices already up to date");
            return Ok(());
        }

        self.write_value_to("devices.deny", "a")?;
        for rule in rules {
            self.write_value_to("devices.allow", rule.trim())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unchanged_rules_are_not_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("devices.list"), "a *:* rwm\n").unwrap();
        let c = DevicesController::new(dir.path().to_path_buf());
        // no devices.deny knob exists: a rewrite would fail, a skip succeeds
        c.allow(&["a *:* rwm".to_string()]).unwrap();
    }

    #[test]
    fn changed_rules_rewrite_deny_then_allow() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("devices.list"), "a *:* rwm\n").unwrap();
        std::fs::write(dir.path().join("devices.deny"), "").unwrap();
        std::fs::write(dir.path().join("devices.allow"), "").unwrap();
        let c = DevicesController::new(dir.path().to_path_buf());
        c.allow(&["c 1:3 rwm".to_string(), "c 1:5 rwm".to_string()])
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("devices.deny")).unwrap(),
            "a"
        );
        // plain files do not append like cgroupfs knobs; the last rule wins
        assert_eq!(
            std::fs::read_to_string(dir.path().join("devices.allow")).unwrap(),
            "c 1:5 rwm"
        );
    }
}
