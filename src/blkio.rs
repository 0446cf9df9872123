/* BlkIo controller */
use std::path::{Path, PathBuf};

use crate::error::*;
use crate::{ControllIdentifier, ControllerInternal, Controllers, Subsystem};

#[derive(Debug, Clone)]
pub struct BlkIoController {
    base: PathBuf,
    path: PathBuf,
}

/// Per-device counters out of a blkio statistics knob.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlkIoStat {
    pub device: String,
    pub read: u64,
    pub write: u64,
    pub sync: u64,
    pub r#async: u64,
}

/// How the group competes for io: `normal` inherits the root weight,
/// `batch` gets the configured low weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoPolicy {
    Normal,
    Batch,
}

impl IoPolicy {
    pub fn parse(s: &str) -> Result<IoPolicy> {
        match s {
            "normal" => Ok(IoPolicy::Normal),
            "batch" => Ok(IoPolicy::Batch),
            _ => Err(Error::new(
                ErrorKind::InvalidValue,
                format!("invalid io policy {:?}", s),
            )),
        }
    }
}

impl ControllerInternal for BlkIoController {
    fn control_type(&self) -> Controllers {
        Controllers::BlkIo
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

impl ControllIdentifier for BlkIoController {
    fn controller_type() -> Controllers {
        Controllers::BlkIo
    }
}

impl<'a> From<&'a Subsystem> for &'a BlkIoController {
    fn from(sub: &'a Subsystem) -> &'a BlkIoController {
        match sub {
            Subsystem::BlkIo(c) => c,
            _ => panic!("not a blkio controller"),
        }
    }
}

impl BlkIoController {
    pub fn new(root: PathBuf) -> Self {
        Self {
            base: root.clone(),
            path: root,
        }
    }

    /// Parse one of the per-device statistics knobs
    /// (e.g. `blkio.io_service_bytes`). The knob lists five lines per device:
    /// Read/Write/Sync/Async/Total; the Total stanza has no device field and
    /// is skipped. `maj:min` is resolved to a device name through sysfs.
    pub fn statistics(&self, knob: &str) -> Result<Vec<BlkIoStat>> {
        let lines = self.read_lines_from(knob)?;
        Self::parse_statistics(&lines, |majmin| device_name(majmin))
    }

    fn parse_statistics<F>(lines: &[String], mut resolve: F) -> Result<Vec<BlkIoStat>>
    where
        F: FnMut(&str) -> Result<String>,
    {
        let mut stats = vec![];
        let mut current: Option<BlkIoStat> = None;
        for line in lines {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() != 3 {
                // "Total <n>" finishes a stanza
                if let Some(stat) = current.take() {
                    stats.push(stat);
                }
                continue;
            }
            let value: u64 = tokens[2].parse().map_err(|_| {
                Error::new(
                    ErrorKind::Unknown,
                    format!("unexpected blkio statistics line {:?}", line),
                )
            })?;
            let device = resolve(tokens[0])?;
            if current.as_ref().map(|s| s.device != device).unwrap_or(true) {
                if let Some(stat) = current.take() {
                    stats.push(stat);
                }
                current = Some(BlkIoStat {
                    device,
                    ..Default::default()
                });
            }
            if let Some(stat) = current.as_mut() {
                match tokens[1] {
                    "Read" => stat.read = value,
                    "Write" => stat.write = value,
                    "Sync" => stat.sync = value,
                    "Async" => stat.r#async = value,
                    _ => {}
                }
            }
        }
        if let Some(stat) = current.take() {
            stats.push(stat);
        }
        Ok(stats)
    }

    pub fn set_policy(&self, policy: IoPolicy, batch_weight: u64) -> Result<()> {
        if !self.supports_policy() {
            return Ok(());
        }
        let weight = match policy {
            IoPolicy::Batch => batch_weight,
            IoPolicy::Normal => self.root().read_u64_from("blkio.weight")?,
        };
        self.write_value_to("blkio.weight", weight)
    }

    pub fn supports_policy(&self) -> bool {
        self.root().knob_exists("blkio.weight")
    }

    fn root(&self) -> BlkIoController {
        BlkIoController::new(self.base.clone())
    }
}

/// `maj:min` to device name via the uevent file below /sys/dev/block.
fn device_name(majmin: &str) -> Result<String> {
    let path = Path::new("/sys/dev/block").join(majmin).join("uevent");
    let text = std::fs::read_to_string(&path)
        .map_err(|e| Error::from(e).context(format!("read {}", path.display())))?;
    for line in text.lines() {
        let mut split = line.splitn(2, '=');
        if let (Some("DEVNAME"), Some(name)) = (split.next(), split.next()) {
            return Ok(name.to_string());
        }
    }
    Err(Error::new(
        ErrorKind::Unknown,
        format!("cannot resolve block device {}", majmin),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statistics_parse_stanzas() {
        let lines: Vec<String> = vec![
            "8:0 Read 1024",
            "8:0 Write 2048",
            "8:0 Sync 512",
            "8:0 Async 2560",
            "8:16 Read 1",
            "8:16 Write 2",
            "8:16 Sync 3",
            "8:16 Async 0",
            "Total 6150",
        ]
        .into_iter()
        .map(String::from)
        .collect();

        let stats = BlkIoController::parse_statistics(&lines, |majmin| {
            Ok(match majmin {
                "8:0" => "sda".to_string(),
                "8:16" => "sdb".to_string(),
                other => other.to_string(),
            })
        })
        .unwrap();

        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].device, "sda");
        assert_eq!(stats[0].read, 1024);
        assert_eq!(stats[0].r#async, 2560);
        assert_eq!(stats[1].device, "sdb");
        assert_eq!(stats[1].sync, 3);
    }

    #[test]
    fn io_policy_parse() {
        assert_eq!(IoPolicy::parse("normal").unwrap(), IoPolicy::Normal);
        assert_eq!(IoPolicy::parse("batch").unwrap(), IoPolicy::Batch);
        assert!(IoPolicy::parse("rt").is_err());
    }
}
