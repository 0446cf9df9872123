//! ext4 project quotas: per-volume space and inode limits attached to an
//! inherited project id. The id is derived deterministically from the inode
//! of the directory so it survives a daemon restart without extra state.

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::error::{Error, ErrorKind, Result};
use crate::mount;

const PRJQUOTA: i32 = 2;
const SUBCMDSHIFT: i32 = 8;
const Q_GETQUOTA: i32 = 0x800007;
const Q_SETQUOTA: i32 = 0x800008;

const QIF_BLIMITS: u32 = 1;
const QIF_ILIMITS: u32 = 4;
const QIF_DQBLK_SIZE: u64 = 1024;

const FS_XFLAG_PROJINHERIT: u32 = 0x0000_0200;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct FsXAttr {
    fsx_xflags: u32,
    fsx_extsize: u32,
    fsx_nextents: u32,
    fsx_projid: u32,
    fsx_cowextsize: u32,
    fsx_pad: [u8; 8],
}

nix::ioctl_read!(fs_ioc_fsgetxattr, b'X', 31, FsXAttr);
nix::ioctl_write_ptr!(fs_ioc_fssetxattr, b'X', 32, FsXAttr);

fn qcmd(cmd: i32, qtype: i32) -> i32 {
    (cmd << SUBCMDSHIFT) | (qtype & ((1 << SUBCMDSHIFT) - 1))
}

/// A project quota bound to one directory tree.
#[derive(Debug)]
pub struct ProjectQuota {
    pub path: PathBuf,
    pub project_id: u32,
    device: PathBuf,
}

impl ProjectQuota {
    pub fn new(path: &Path) -> Result<ProjectQuota> {
        let device = find_device(path)?;
        let project_id = invent_project_id(path)?;
        Ok(ProjectQuota {
            path: path.to_path_buf(),
            project_id,
            device,
        })
    }

    /// Tag the directory with the project id (inherited by new files) and
    /// install the limits.
    pub fn create(&self, space_limit: u64, inode_limit: u64) -> Result<()> {
        self.set_project_id(self.project_id)?;
        self.set_limits(space_limit, inode_limit)
    }

    pub fn resize(&self, space_limit: u64, inode_limit: u64) -> Result<()> {
        self.set_limits(space_limit, inode_limit)
    }

    /// Drop limits and untag the directory.
    pub fn destroy(&self) -> Result<()> {
        self.set_limits(0, 0)?;
        self.set_project_id(0)
    }

    /// (space used, space limit, inodes used, inode limit), bytes and counts.
    pub fn usage(&self) -> Result<(u64, u64, u64, u64)> {
        let mut dqblk: libc::dqblk = unsafe { std::mem::zeroed() };
        let device = path_cstring(&self.device)?;
        let ret = unsafe {
            libc::quotactl(
                qcmd(Q_GETQUOTA, PRJQUOTA),
                device.as_ptr(),
                self.project_id as i32,
                &mut dqblk as *mut _ as *mut libc::c_char,
            )
        };
        if ret != 0 {
            return Err(Error::os("quotactl(Q_GETQUOTA)"));
        }
        Ok((
            dqblk.dqb_curspace,
            dqblk.dqb_bhardlimit * QIF_DQBLK_SIZE,
            dqblk.dqb_curinodes,
            dqblk.dqb_ihardlimit,
        ))
    }

    fn set_limits(&self, space_limit: u64, inode_limit: u64) -> Result<()> {
        let mut dqblk: libc::dqblk = unsafe { std::mem::zeroed() };
        dqblk.dqb_bhardlimit = (space_limit + QIF_DQBLK_SIZE - 1) / QIF_DQBLK_SIZE;
        dqblk.dqb_bsoftlimit = dqblk.dqb_bhardlimit;
        dqblk.dqb_ihardlimit = inode_limit;
        dqblk.dqb_isoftlimit = inode_limit;
        dqblk.dqb_valid = QIF_BLIMITS | QIF_ILIMITS;
        let device = path_cstring(&self.device)?;
        let ret = unsafe {
            libc::quotactl(
                qcmd(Q_SETQUOTA, PRJQUOTA),
                device.as_ptr(),
                self.project_id as i32,
                &mut dqblk as *mut _ as *mut libc::c_char,
            )
        };
        if ret != 0 {
            return Err(Error::os("quotactl(Q_SETQUOTA)"));
        }
        Ok(())
    }

    fn set_project_id(&self, id: u32) -> Result<()> {
        let dir = File::open(&self.path)
            .map_err(|e| Error::from(e).context(format!("open {}", self.path.display())))?;
        let mut attr = FsXAttr::default();
        unsafe {
            fs_ioc_fsgetxattr(dir.as_raw_fd(), &mut attr)
                .map_err(|e| Error::from(e).context("FS_IOC_FSGETXATTR"))?;
        }
        attr.fsx_projid = id;
        if id != 0 {
            attr.fsx_xflags |= FS_XFLAG_PROJINHERIT;
        } else {
            attr.fsx_xflags &= !FS_XFLAG_PROJINHERIT;
        }
        unsafe {
            fs_ioc_fssetxattr(dir.as_raw_fd(), &attr)
                .map_err(|e| Error::from(e).context("FS_IOC_FSSETXATTR"))?;
        }
        Ok(())
    }
}

/// Whether the filesystem under `path` can do project quotas at all.
pub fn supported(path: &Path) -> bool {
    let dir = match File::open(path) {
        Ok(dir) => dir,
        Err(_) => return false,
    };
    let mut attr = FsXAttr::default();
    unsafe { fs_ioc_fsgetxattr(dir.as_raw_fd(), &mut attr).is_ok() }
}

/// The project id is the inode number truncated to 31 bits with the top bit
/// set, keeping clear of administratively assigned ids and stable across
/// restarts.
fn invent_project_id(path: &Path) -> Result<u32> {
    use std::os::linux::fs::MetadataExt;
    let meta = std::fs::metadata(path)
        .map_err(|e| Error::from(e).context(format!("stat {}", path.display())))?;
    Ok((meta.st_ino() as u32 & 0x7fff_ffff) | 0x8000_0000)
}

/// The block device backing the filesystem that holds `path`: the mount
/// entry with the longest matching mount point.
fn find_device(path: &Path) -> Result<PathBuf> {
    let mounts = mount::mounts()?;
    let mut best: Option<&mount::MountEntry> = None;
    for entry in &mounts {
        if !entry.source.starts_with("/dev/") {
            continue;
        }
        if path.starts_with(&entry.mount_point) {
            match best {
                Some(b) if b.mount_point.as_os_str().len() >= entry.mount_point.as_os_str().len() => {}
                _ => best = Some(entry),
            }
        }
    }
    best.map(|e| PathBuf::from(&e.source)).ok_or_else(|| {
        Error::new(
            ErrorKind::NotSupported,
            format!("no backing device for {}", path.display()),
        )
    })
}

fn path_cstring(path: &Path) -> Result<std::ffi::CString> {
    use std::os::unix::ffi::OsStrExt;
    std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::new(ErrorKind::InvalidValue, "path contains NUL"))
}

/// Free space and inodes of the filesystem under `path`.
pub fn stat_fs(path: &Path) -> Result<(u64, u64)> {
    let stat = nix::sys::statvfs::statvfs(path)
        .map_err(|e| Error::from(e).context(format!("statvfs {}", path.display())))?;
    Ok((
        stat.blocks_available() * stat.fragment_size(),
        stat.files_available(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_ids_are_deterministic_and_tagged() {
        let dir = tempfile::tempdir().unwrap();
        let a = invent_project_id(dir.path()).unwrap();
        let b = invent_project_id(dir.path()).unwrap();
        assert_eq!(a, b);
        assert!(a & 0x8000_0000 != 0);
    }

    #[test]
    fn qcmd_packs() {
        assert_eq!(qcmd(Q_GETQUOTA, PRJQUOTA), 0x80000702);
        assert_eq!(qcmd(Q_SETQUOTA, PRJQUOTA), 0x80000802);
    }

    #[test]
    fn statfs_reports_something() {
        let (space, inodes) = stat_fs(Path::new("/")).unwrap();
        assert!(space > 0);
        let _ = inodes;
    }
}
