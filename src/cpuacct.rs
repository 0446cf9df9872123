/* CPU accounting controller */
use std::path::PathBuf;

use crate::error::*;
use crate::{ControllIdentifier, ControllerInternal, Controllers, Subsystem};

#[derive(Debug, Clone)]
pub struct CpuAcctController {
    base: PathBuf,
    path: PathBuf,
}

impl ControllerInternal for CpuAcctController {
    fn control_type(&self) -> Controllers {
        Controllers::CpuAcct
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

impl ControllIdentifier for CpuAcctController {
    fn controller_type() -> Controllers {
        Controllers::CpuAcct
    }
}

impl<'a> From<&'a Subsystem> for &'a CpuAcctController {
    fn from(sub: &'a Subsystem) -> &'a CpuAcctController {
        match sub {
            Subsystem::CpuAcct(c) => c,
            _ => panic!("not a cpuacct controller"),
        }
    }
}

impl CpuAcctController {
    pub fn new(root: PathBuf) -> Self {
        Self {
            base: root.clone(),
            path: root,
        }
    }

    /// Accumulated cpu time of the group in nanoseconds.
    pub fn usage(&self) -> Result<u64> {
        self.read_u64_from("cpuacct.usage")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_reads_nanoseconds() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cpuacct.usage"), "123456789\n").unwrap();
        let c = CpuAcctController::new(dir.path().to_path_buf());
        assert_eq!(c.usage().unwrap(), 123456789);
    }
}
