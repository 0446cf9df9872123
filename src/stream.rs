//! Container stdin/stdout/stderr plumbing. Default streams are files owned
//! by the container owner, created outside the chroot before the launch and
//! rotated on stop; a client may instead hand one of its own descriptors
//! over as `/dev/fd/N`, which is revalidated against pid reuse before use.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::path::{Path, PathBuf};

use crate::cred::Cred;
use crate::error::{Error, ErrorKind, Result};

/// Start time (clock ticks) of a process, used to detect pid reuse.
pub fn proc_start_time(pid: u32) -> Result<u64> {
    let text = std::fs::read_to_string(format!("/proc/{}/stat", pid))
        .map_err(|e| Error::from(e).context(format!("read stat of {}", pid)))?;
    // comm may contain spaces; fields count from after the closing paren
    let after = text
        .rfind(')')
        .map(|idx| &text[idx + 1..])
        .ok_or_else(|| Error::new(ErrorKind::Unknown, "malformed /proc stat"))?;
    after
        .split_whitespace()
        .nth(19) // starttime is field 22 overall
        .and_then(|f| f.parse().ok())
        .ok_or_else(|| Error::new(ErrorKind::Unknown, "malformed /proc stat"))
}

/// Identity of a client descriptor recorded when the property is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdOrigin {
    pub client_pid: u32,
    pub fd: i32,
    pub inode: u64,
    pub client_start_time: u64,
}

#[derive(Debug)]
pub struct StdStream {
    /// 0, 1 or 2.
    pub stream_no: i32,
    /// Target path, or `/dev/fd/N` for a client descriptor.
    pub path: PathBuf,
    /// Whether the daemon created the file and owns its lifetime.
    pub managed: bool,
    /// Recorded identity for `/dev/fd/N` targets.
    pub origin: Option<FdOrigin>,
    /// Descriptor opened on the outside, ready to be dup2'ed in the child.
    outside_fd: Option<RawFd>,
    /// Read offset kept across rotations for the stdout/stderr data slots.
    pub offset: u64,
}

impl StdStream {
    pub fn null() -> StdStream {
        StdStream {
            stream_no: 0,
            path: PathBuf::from("/dev/null"),
            managed: false,
            origin: None,
            outside_fd: None,
            offset: 0,
        }
    }

    pub fn from_path(stream_no: i32, path: &Path, managed: bool) -> StdStream {
        StdStream {
            stream_no,
            path: path.to_path_buf(),
            managed,
            origin: None,
            outside_fd: None,
            offset: 0,
        }
    }

    /// Record the identity of a client's `/dev/fd/N` so a later Start can
    /// verify nothing was swapped underneath.
    pub fn from_client_fd(stream_no: i32, client_pid: u32, fd: i32) -> Result<StdStream> {
        use std::os::linux::fs::MetadataExt;
        let proxied = format!("/proc/{}/fd/{}", client_pid, fd);
        let meta = std::fs::metadata(&proxied)
            .map_err(|e| Error::from(e).context(format!("stat {}", proxied)))?;
        Ok(StdStream {
            stream_no,
            path: PathBuf::from(format!("/dev/fd/{}", fd)),
            managed: false,
            origin: Some(FdOrigin {
                client_pid,
                fd,
                inode: meta.st_ino(),
                client_start_time: proc_start_time(client_pid)?,
            }),
            outside_fd: None,
            offset: 0,
        })
    }

    pub fn is_redirect(&self) -> bool {
        self.origin.is_some()
    }

    /// Open the stream on the daemon side of the launch. Managed files are
    /// created (or truncated) with the owner's credentials; client
    /// descriptors are revalidated and duped.
    pub fn open_outside(&mut self, owner: &Cred) -> Result<()> {
        if let Some(origin) = self.origin {
            self.outside_fd = Some(self.open_client_fd(origin)?);
            return Ok(());
        }
        if !self.managed {
            // opened inside after chroot
            return Ok(());
        }
        let file = OpenOptions::new()
            .read(self.stream_no == 0)
            .write(self.stream_no != 0)
            .create(true)
            .truncate(self.stream_no != 0)
            .mode(0o660)
            .open(&self.path)
            .map_err(|e| Error::from(e).context(format!("open {}", self.path.display())))?;
        nix::unistd::fchown(
            file.as_raw_fd(),
            Some(nix::unistd::Uid::from_raw(owner.uid)),
            Some(nix::unistd::Gid::from_raw(owner.gid)),
        )
        .map_err(|e| Error::from(e).context(format!("chown {}", self.path.display())))?;
        self.outside_fd = Some(file.into_raw_fd());
        Ok(())
    }

    fn open_client_fd(&self, origin: FdOrigin) -> Result<RawFd> {
        use std::os::linux::fs::MetadataExt;

        // Both checks guard the same race: the client pid dying and being
        // reused, or the fd being replaced since SetProperty.
        let now = proc_start_time(origin.client_pid)?;
        if now != origin.client_start_time {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                format!("client process {} was replaced", origin.client_pid),
            ));
        }
        let proxied = format!("/proc/{}/fd/{}", origin.client_pid, origin.fd);
        let meta = std::fs::metadata(&proxied)
            .map_err(|e| Error::from(e).context(format!("stat {}", proxied)))?;
        if meta.st_ino() != origin.inode {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                format!("descriptor {} of client {} was replaced", origin.fd, origin.client_pid),
            ));
        }
        let file = OpenOptions::new()
            .read(self.stream_no == 0)
            .write(self.stream_no != 0)
            .open(&proxied)
            .map_err(|e| Error::from(e).context(format!("open {}", proxied)))?;
        Ok(file.into_raw_fd())
    }

    /// Install the stream as fd 0/1/2 in the task. Paths with no outside
    /// descriptor are opened here, after the chroot.
    pub fn open_inside(&self) -> Result<()> {
        let fd = match self.outside_fd {
            Some(fd) => fd,
            None => {
                let file = OpenOptions::new()
                    .read(self.stream_no == 0)
                    .write(self.stream_no != 0)
                    .create(self.stream_no != 0)
                    .append(self.stream_no != 0)
                    .open(&self.path)
                    .map_err(|e| {
                        Error::from(e).context(format!("open {}", self.path.display()))
                    })?;
                file.into_raw_fd()
            }
        };
        nix::unistd::dup2(fd, self.stream_no).map_err(|e| Error::from(e).context("dup2"))?;
        if fd != self.stream_no {
            let _ = nix::unistd::close(fd);
        }
        Ok(())
    }

    /// Drop the outside descriptor in the daemon after a finished launch.
    pub fn close_outside(&mut self) {
        if let Some(fd) = self.outside_fd.take() {
            let _ = nix::unistd::close(fd);
        }
    }

    /// Read up to `limit` bytes of the newest stream content, remembering
    /// the consumed offset.
    pub fn read_tail(&mut self, limit: u64) -> Result<String> {
        if self.is_redirect() {
            return Ok(String::new());
        }
        let mut file = File::open(&self.path)
            .map_err(|e| Error::from(e).context(format!("open {}", self.path.display())))?;
        let len = file.metadata()?.len();
        let start = if len > self.offset + limit {
            len - limit
        } else {
            self.offset.min(len)
        };
        file.seek(SeekFrom::Start(start))?;
        let mut buf = String::new();
        file.take(limit).read_to_string(&mut buf)?;
        self.offset = start + buf.len() as u64;
        Ok(buf)
    }

    /// Remove a managed file on container stop.
    pub fn cleanup(&mut self) {
        self.close_outside();
        self.offset = 0;
        if self.managed {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("cannot remove {}: {}", self.path.display(), e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_start_time_is_stable() {
        let pid = std::process::id();
        let a = proc_start_time(pid).unwrap();
        let b = proc_start_time(pid).unwrap();
        assert_eq!(a, b);
        assert!(a > 0);
    }

    #[test]
    fn client_fd_records_inode() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let fd = file.as_file().as_raw_fd();
        let stream = StdStream::from_client_fd(1, std::process::id(), fd).unwrap();
        assert!(stream.is_redirect());
        let origin = stream.origin.unwrap();
        assert_eq!(origin.fd, fd);
        assert!(origin.inode > 0);
    }

    #[test]
    fn tail_reads_newest_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stdout");
        std::fs::write(&path, "0123456789").unwrap();
        let mut stream = StdStream::from_path(1, &path, true);
        assert_eq!(stream.read_tail(4).unwrap(), "6789");
        // nothing new
        assert_eq!(stream.read_tail(4).unwrap(), "");
        std::fs::write(&path, "0123456789AB").unwrap();
        assert_eq!(stream.read_tail(4).unwrap(), "AB");
    }
}
