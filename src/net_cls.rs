/* NetCls controller */
use std::path::PathBuf;

use crate::error::*;
use crate::{ControllIdentifier, ControllerInternal, Controllers, Subsystem};

#[derive(Debug, Clone)]
pub struct NetClsController {
    base: PathBuf,
    path: PathBuf,
}

impl ControllerInternal for NetClsController {
    fn control_type(&self) -> Controllers {
        Controllers::NetCls
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

impl ControllIdentifier for NetClsController {
    fn controller_type() -> Controllers {
        Controllers::NetCls
    }
}

impl<'a> From<&'a Subsystem> for &'a NetClsController {
    fn from(sub: &'a Subsystem) -> &'a NetClsController {
        match sub {
            Subsystem::NetCls(c) => c,
            _ => panic!("not a net_cls controller"),
        }
    }
}

impl NetClsController {
    pub fn new(root: PathBuf) -> Self {
        Self {
            base: root.clone(),
            path: root,
        }
    }

    /// The classid the cgroup classifier reads when steering this group's
    /// packets into its HTB leaf. Everything else about classification is
    /// done on the tc side.
    pub fn set_classid(&self, classid: u32) -> Result<()> {
        self.write_value_to("net_cls.classid", classid)
    }

    pub fn get_classid(&self) -> Result<u32> {
        Ok(self.read_u64_from("net_cls.classid")? as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classid_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let c = NetClsController::new(dir.path().to_path_buf());
        c.set_classid(0x0001_0004).unwrap();
        assert_eq!(c.get_classid().unwrap(), 0x0001_0004);
    }
}
