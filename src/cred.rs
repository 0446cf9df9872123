//! User credentials: resolution from names, peer credentials of RPC clients,
//! and the uid/gid switch performed in the child before exec.

use std::ffi::CString;
use std::os::unix::io::RawFd;

use nix::unistd::{Gid, Uid};

use crate::error::{Error, ErrorKind, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cred {
    pub uid: u32,
    pub gid: u32,
    pub groups: Vec<u32>,
}

impl Cred {
    pub fn new(uid: u32, gid: u32) -> Self {
        Cred {
            uid,
            gid,
            groups: vec![],
        }
    }

    pub fn root() -> Self {
        Cred::new(0, 0)
    }

    pub fn is_root(&self) -> bool {
        self.uid == 0
    }

    pub fn member_of(&self, gid: u32) -> bool {
        self.gid == gid || self.groups.contains(&gid)
    }

    /// Whether `self` may operate on an entity owned by `owner`.
    pub fn can_control(&self, owner: &Cred) -> bool {
        self.is_root() || self.uid == owner.uid
    }

    /// Resolve user and group names, load supplementary groups.
    pub fn from_names(user: &str, group: &str) -> Result<Cred> {
        let uid = lookup_user(user)?;
        let gid = lookup_group(group)?;
        let mut cred = Cred::new(uid, gid);
        cred.groups = supplementary_groups(user, gid)?;
        Ok(cred)
    }

    /// Switch the current process to these credentials. Must run before exec,
    /// after every privileged setup step.
    pub fn apply(&self) -> Result<()> {
        let groups: Vec<Gid> = self.groups.iter().map(|g| Gid::from_raw(*g)).collect();
        nix::unistd::setgroups(&groups).map_err(|e| Error::from(e).context("setgroups"))?;
        nix::unistd::setgid(Gid::from_raw(self.gid))
            .map_err(|e| Error::from(e).context("setgid"))?;
        nix::unistd::setuid(Uid::from_raw(self.uid))
            .map_err(|e| Error::from(e).context("setuid"))?;
        Ok(())
    }
}

pub fn lookup_user(name: &str) -> Result<u32> {
    if let Ok(uid) = name.parse::<u32>() {
        return Ok(uid);
    }
    let cname = CString::new(name)
        .map_err(|_| Error::new(ErrorKind::InvalidValue, "user name contains NUL"))?;
    // getpwnam is fine here: resolution happens on the daemon side, never
    // between fork and exec.
    let pw = unsafe { libc::getpwnam(cname.as_ptr()) };
    if pw.is_null() {
        return Err(Error::new(
            ErrorKind::InvalidValue,
            format!("invalid user {}", name),
        ));
    }
    Ok(unsafe { (*pw).pw_uid })
}

pub fn lookup_group(name: &str) -> Result<u32> {
    if let Ok(gid) = name.parse::<u32>() {
        return Ok(gid);
    }
    let cname = CString::new(name)
        .map_err(|_| Error::new(ErrorKind::InvalidValue, "group name contains NUL"))?;
    let gr = unsafe { libc::getgrnam(cname.as_ptr()) };
    if gr.is_null() {
        return Err(Error::new(
            ErrorKind::InvalidValue,
            format!("invalid group {}", name),
        ));
    }
    Ok(unsafe { (*gr).gr_gid })
}

pub fn user_name(uid: u32) -> String {
    let pw = unsafe { libc::getpwuid(uid) };
    if pw.is_null() {
        return uid.to_string();
    }
    unsafe { std::ffi::CStr::from_ptr((*pw).pw_name) }
        .to_string_lossy()
        .into_owned()
}

pub fn group_name(gid: u32) -> String {
    let gr = unsafe { libc::getgrgid(gid) };
    if gr.is_null() {
        return gid.to_string();
    }
    unsafe { std::ffi::CStr::from_ptr((*gr).gr_name) }
        .to_string_lossy()
        .into_owned()
}

fn supplementary_groups(user: &str, gid: u32) -> Result<Vec<u32>> {
    let cname = match CString::new(user) {
        Ok(c) => c,
        Err(_) => return Ok(vec![]),
    };
    let mut count: libc::c_int = 32;
    let mut groups: Vec<libc::gid_t> = vec![0; count as usize];
    let ret = unsafe {
        libc::getgrouplist(cname.as_ptr(), gid, groups.as_mut_ptr(), &mut count)
    };
    if ret < 0 {
        // count now holds the required size
        groups.resize(count as usize, 0);
        let ret = unsafe {
            libc::getgrouplist(cname.as_ptr(), gid, groups.as_mut_ptr(), &mut count)
        };
        if ret < 0 {
            return Ok(vec![gid]);
        }
    }
    groups.truncate(count as usize);
    Ok(groups.into_iter().map(|g| g as u32).collect())
}

/// Credentials of the process on the other side of a unix socket.
pub fn peer_cred(fd: RawFd) -> Result<(Cred, u32)> {
    let mut ucred = libc::ucred {
        pid: 0,
        uid: 0,
        gid: 0,
    };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut ucred as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if ret != 0 {
        return Err(Error::os("getsockopt(SO_PEERCRED)"));
    }
    Ok((Cred::new(ucred.uid, ucred.gid), ucred.pid as u32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_ids_resolve_without_nss() {
        assert_eq!(lookup_user("123").unwrap(), 123);
        assert_eq!(lookup_group("456").unwrap(), 456);
    }

    #[test]
    fn root_resolves() {
        assert_eq!(lookup_user("root").unwrap(), 0);
        assert_eq!(lookup_group("root").unwrap(), 0);
        assert_eq!(user_name(0), "root");
    }

    #[test]
    fn control_rules() {
        let root = Cred::root();
        let alice = Cred::new(1000, 1000);
        let bob = Cred::new(1001, 1000);
        assert!(root.can_control(&alice));
        assert!(alice.can_control(&alice));
        assert!(!bob.can_control(&alice));
    }
}
