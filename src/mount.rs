//! Mount table parsing and the mount operations the daemon performs: bind
//! mounts for volumes, private propagation and chroot plumbing for tasks.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use nix::mount::{MntFlags, MsFlags};

use crate::error::{Error, Result};

/// One line of /proc/self/mountinfo, reduced to what the daemon needs.
#[derive(Debug, Clone)]
pub struct MountEntry {
    pub mount_point: PathBuf,
    pub fstype: String,
    /// Mount source: the backing block device for real filesystems.
    pub source: String,
    /// Superblock options, e.g. the controller list of a cgroup mount.
    pub super_options: Vec<String>,
}

/// Parse mountinfo; the optional-fields block ends at the " - " separator.
pub fn mounts() -> Result<Vec<MountEntry>> {
    parse_mountinfo(Path::new("/proc/self/mountinfo"))
}

pub fn parse_mountinfo(path: &Path) -> Result<Vec<MountEntry>> {
    let file = File::open(path)
        .map_err(|e| Error::from(e).context(format!("open {}", path.display())))?;
    let mut entries = vec![];
    for line in BufReader::new(file).lines() {
        let line = line?;
        let sep = match line.find(" - ") {
            Some(idx) => idx,
            None => continue,
        };
        let head: Vec<&str> = line[..sep].split_whitespace().collect();
        let tail: Vec<&str> = line[sep + 3..].split_whitespace().collect();
        if head.len() < 5 || tail.len() < 3 {
            continue;
        }
        entries.push(MountEntry {
            mount_point: PathBuf::from(unescape(head[4])),
            fstype: tail[0].to_string(),
            source: unescape(tail[1]),
            super_options: tail[2].split(',').map(|s| s.to_string()).collect(),
        });
    }
    Ok(entries)
}

/// Mountinfo escapes space, tab, newline and backslash as octal.
fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let code: String = chars.by_ref().take(3).collect();
        match u8::from_str_radix(&code, 8) {
            Ok(b) => out.push(b as char),
            Err(_) => {
                out.push('\\');
                out.push_str(&code);
            }
        }
    }
    out
}

pub fn bind_mount(source: &Path, target: &Path, read_only: bool) -> Result<()> {
    nix::mount::mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| {
        Error::from(e).context(format!(
            "bind {} -> {}",
            source.display(),
            target.display()
        ))
    })?;
    if read_only {
        remount_read_only(target)?;
    }
    Ok(())
}

/// A bind mount ignores MS_RDONLY at mount time; it takes a remount.
pub fn remount_read_only(target: &Path) -> Result<()> {
    nix::mount::mount(
        None::<&str>,
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
        None::<&str>,
    )
    .map_err(|e| Error::from(e).context(format!("remount ro {}", target.display())))
}

pub fn mount_fs(
    source: &str,
    target: &Path,
    fstype: &str,
    flags: MsFlags,
    data: &str,
) -> Result<()> {
    nix::mount::mount(
        Some(source),
        target,
        Some(fstype),
        flags,
        if data.is_empty() { None } else { Some(data) },
    )
    .map_err(|e| {
        Error::from(e).context(format!("mount {} {} at {}", fstype, source, target.display()))
    })
}

pub fn umount(target: &Path) -> Result<()> {
    nix::mount::umount(target)
        .map_err(|e| Error::from(e).context(format!("umount {}", target.display())))
}

/// Lazy unmount used on teardown paths where the mount may be busy.
pub fn umount_detach(target: &Path) -> Result<()> {
    nix::mount::umount2(target, MntFlags::MNT_DETACH)
        .map_err(|e| Error::from(e).context(format!("umount2 {}", target.display())))
}

/// Stop mount events from propagating out of the new mount namespace.
pub fn make_mounts_private() -> Result<()> {
    nix::mount::mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| Error::from(e).context("remount / private"))
}

/// Bind a private copy of `content` over `path` (resolv.conf, hostname).
pub fn write_private(path: &Path, content: &str) -> Result<()> {
    let tmp = tempdir_file(path)?;
    std::fs::write(&tmp, content)?;
    let res = bind_mount(&tmp, path, false);
    let _ = std::fs::remove_file(&tmp);
    res
}

fn tempdir_file(path: &Path) -> Result<PathBuf> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "private".to_string());
    Ok(std::env::temp_dir().join(format!(".porto.{}.{}", name, nix::unistd::getpid())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_mountinfo_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "25 0 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw,errors=remount-ro"
        )
        .unwrap();
        writeln!(
            file,
            "33 24 0:29 / /sys/fs/cgroup/cpu,cpuacct rw,nosuid master:10 - cgroup cgroup rw,cpu,cpuacct"
        )
        .unwrap();
        let entries = parse_mountinfo(file.path()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].fstype, "ext4");
        assert_eq!(entries[0].source, "/dev/sda1");
        assert_eq!(
            entries[1].mount_point,
            PathBuf::from("/sys/fs/cgroup/cpu,cpuacct")
        );
        assert!(entries[1].super_options.contains(&"cpuacct".to_string()));
    }

    #[test]
    fn unescapes_octal() {
        assert_eq!(unescape("/mnt/with\\040space"), "/mnt/with space");
        assert_eq!(unescape("/plain"), "/plain");
    }

    #[test]
    fn live_mountinfo_parses() {
        let entries = mounts().unwrap();
        assert!(entries.iter().any(|e| e.mount_point == Path::new("/")));
    }
}
