//! Loop device plumbing for the loop volume backend: allocate a device
//! number, back it with an ext4 image sized to the volume's space limit,
//! release it on destroy.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::process::Command;

use log::info;

use crate::error::{Error, ErrorKind, Result};

const LOOP_CTL_GET_FREE: libc::c_ulong = 0x4C82;
const LOOP_SET_FD: libc::c_ulong = 0x4C00;
const LOOP_CLR_FD: libc::c_ulong = 0x4C01;

/// Ask loop-control for a free device number.
pub fn get_free() -> Result<i32> {
    let ctl = File::open("/dev/loop-control")
        .map_err(|e| Error::from(e).context("open /dev/loop-control"))?;
    let nr = unsafe { libc::ioctl(ctl.as_raw_fd(), LOOP_CTL_GET_FREE) };
    if nr < 0 {
        return Err(Error::os("ioctl(LOOP_CTL_GET_FREE)"));
    }
    Ok(nr as i32)
}

/// Create the backing image: preallocate `bytes` and put an ext4 on it.
pub fn alloc_image(image: &Path, bytes: u64) -> Result<()> {
    info!("allocate loop image {} of {} bytes", image.display(), bytes);
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(image)
        .map_err(|e| Error::from(e).context(format!("create {}", image.display())))?;
    let ret = unsafe { libc::fallocate(file.as_raw_fd(), 0, 0, bytes as libc::off_t) };
    if ret != 0 {
        return Err(Error::with_errno(
            ErrorKind::NoSpace,
            nix::errno::errno(),
            format!("fallocate {}", image.display()),
        ));
    }
    drop(file);

    let status = Command::new("mkfs.ext4")
        .arg("-F")
        .arg("-q")
        .arg(image)
        .status()
        .map_err(|e| Error::from(e).context("run mkfs.ext4"))?;
    if !status.success() {
        return Err(Error::new(
            ErrorKind::Unknown,
            format!("mkfs.ext4 failed with {}", status),
        ));
    }
    Ok(())
}

fn device_path(nr: i32) -> String {
    format!("/dev/loop{}", nr)
}

/// Bind the image to the loop device.
pub fn attach(nr: i32, image: &Path) -> Result<()> {
    let device = OpenOptions::new()
        .read(true)
        .write(true)
        .open(device_path(nr))
        .map_err(|e| Error::from(e).context(format!("open /dev/loop{}", nr)))?;
    let backing = OpenOptions::new()
        .read(true)
        .write(true)
        .open(image)
        .map_err(|e| Error::from(e).context(format!("open {}", image.display())))?;
    let ret = unsafe {
        libc::ioctl(
            device.as_raw_fd(),
            LOOP_SET_FD,
            backing.as_raw_fd() as libc::c_ulong,
        )
    };
    if ret != 0 {
        return Err(Error::os("ioctl(LOOP_SET_FD)"));
    }
    Ok(())
}

/// Detach the image; the device number goes back to the kernel pool.
pub fn detach(nr: i32) -> Result<()> {
    let device = OpenOptions::new()
        .read(true)
        .open(device_path(nr))
        .map_err(|e| Error::from(e).context(format!("open /dev/loop{}", nr)))?;
    let ret = unsafe { libc::ioctl(device.as_raw_fd(), LOOP_CLR_FD, 0 as libc::c_ulong) };
    if ret != 0 {
        return Err(Error::os("ioctl(LOOP_CLR_FD)"));
    }
    Ok(())
}

/// Mount the attached loop device at `target`.
pub fn mount(nr: i32, target: &Path, read_only: bool) -> Result<()> {
    let mut flags = nix::mount::MsFlags::empty();
    if read_only {
        flags |= nix::mount::MsFlags::MS_RDONLY;
    }
    crate::mount::mount_fs(&device_path(nr), target, "ext4", flags, "")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_paths() {
        assert_eq!(device_path(0), "/dev/loop0");
        assert_eq!(device_path(17), "/dev/loop17");
    }
}
