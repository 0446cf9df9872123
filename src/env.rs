//! Everything the task launcher needs to know, collected from the property
//! hooks before the first fork: credentials, capabilities, resource limits,
//! mounts, devices, namespaces and the command itself.

use std::ffi::CString;
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;

use caps::{CapSet, Capability, CapsHashSet};

use crate::cred::Cred;
use crate::error::{Error, ErrorKind, Result};
use crate::stream::StdStream;

/// A single bind mount requested by the `bind` property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindEntry {
    pub source: PathBuf,
    pub dest: PathBuf,
    pub read_only: bool,
}

impl BindEntry {
    /// `<source> <dest> [ro|rw]`
    pub fn parse(s: &str) -> Result<BindEntry> {
        let tokens: Vec<&str> = s.split_whitespace().collect();
        match tokens.as_slice() {
            [source, dest] => Ok(BindEntry {
                source: PathBuf::from(source),
                dest: PathBuf::from(dest),
                read_only: false,
            }),
            [source, dest, "ro"] => Ok(BindEntry {
                source: PathBuf::from(source),
                dest: PathBuf::from(dest),
                read_only: true,
            }),
            [source, dest, "rw"] => Ok(BindEntry {
                source: PathBuf::from(source),
                dest: PathBuf::from(dest),
                read_only: false,
            }),
            _ => Err(Error::new(
                ErrorKind::InvalidValue,
                format!("invalid bind specification {:?}", s),
            )),
        }
    }
}

/// A device node made available inside the container:
/// `<path> <r|w|m combinations or -> [path inside] [mode] [user] [group]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEntry {
    pub device: PathBuf,
    pub access: String,
    pub inside: PathBuf,
    pub mode: Option<u32>,
    pub user: Option<String>,
    pub group: Option<String>,
}

impl DeviceEntry {
    pub fn parse(s: &str) -> Result<DeviceEntry> {
        let tokens: Vec<&str> = s.split_whitespace().collect();
        if tokens.len() < 2 || tokens.len() > 6 {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                format!("invalid device specification {:?}", s),
            ));
        }
        let access = tokens[1];
        if !access.chars().all(|c| "rwm-".contains(c)) {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                format!("invalid device access {:?}", access),
            ));
        }
        let device = PathBuf::from(tokens[0]);
        if !device.is_absolute() {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                format!("device path must be absolute: {:?}", tokens[0]),
            ));
        }
        Ok(DeviceEntry {
            inside: tokens.get(2).map(PathBuf::from).unwrap_or_else(|| device.clone()),
            device,
            access: access.to_string(),
            mode: match tokens.get(3) {
                Some(m) => Some(u32::from_str_radix(m, 8).map_err(|_| {
                    Error::new(ErrorKind::InvalidValue, format!("invalid mode {:?}", m))
                })?),
                None => None,
            },
            user: tokens.get(4).map(|s| s.to_string()),
            group: tokens.get(5).map(|s| s.to_string()),
        })
    }

    /// The `devices.allow` rule for this node; requires stat on the host.
    pub fn cgroup_rule(&self) -> Result<String> {
        use std::os::linux::fs::MetadataExt;
        let meta = std::fs::metadata(&self.device)
            .map_err(|e| Error::from(e).context(format!("stat {}", self.device.display())))?;
        let mode = meta.st_mode();
        let kind = if mode & libc::S_IFMT == libc::S_IFBLK {
            'b'
        } else if mode & libc::S_IFMT == libc::S_IFCHR {
            'c'
        } else {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                format!("{} is not a device node", self.device.display()),
            ));
        };
        let rdev = meta.st_rdev();
        let access: String = self.access.chars().filter(|c| *c != '-').collect();
        Ok(format!(
            "{} {}:{} {}",
            kind,
            major(rdev),
            minor(rdev),
            if access.is_empty() { "rwm" } else { &access }
        ))
    }
}

pub fn major(rdev: u64) -> u64 {
    (rdev >> 8) & 0xfff | ((rdev >> 32) & !0xfffu64)
}

pub fn minor(rdev: u64) -> u64 {
    (rdev & 0xff) | ((rdev >> 12) & !0xffu64)
}

/// One resource limit from the `ulimit` property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RlimitEntry {
    pub resource: i32,
    pub soft: libc::rlim_t,
    pub hard: libc::rlim_t,
}

fn rlimit_resource(name: &str) -> Option<i32> {
    let res = match name {
        "as" => libc::RLIMIT_AS,
        "core" => libc::RLIMIT_CORE,
        "cpu" => libc::RLIMIT_CPU,
        "data" => libc::RLIMIT_DATA,
        "fsize" => libc::RLIMIT_FSIZE,
        "locks" => libc::RLIMIT_LOCKS,
        "memlock" => libc::RLIMIT_MEMLOCK,
        "msgqueue" => libc::RLIMIT_MSGQUEUE,
        "nice" => libc::RLIMIT_NICE,
        "nofile" => libc::RLIMIT_NOFILE,
        "nproc" => libc::RLIMIT_NPROC,
        "rss" => libc::RLIMIT_RSS,
        "rtprio" => libc::RLIMIT_RTPRIO,
        "rttime" => libc::RLIMIT_RTTIME,
        "sigpending" => libc::RLIMIT_SIGPENDING,
        "stack" => libc::RLIMIT_STACK,
        _ => return None,
    };
    Some(res as i32)
}

/// Parse one `ulimit` item: `<name>: <soft> <hard>`, `unlim`/`unlimited`
/// for RLIM_INFINITY.
pub fn parse_rlimit(item: &str) -> Result<RlimitEntry> {
    let mut split = item.splitn(2, ':');
    let name = split.next().unwrap_or("").trim();
    let values = split.next().unwrap_or("").trim();
    let resource = rlimit_resource(name).ok_or_else(|| {
        Error::new(
            ErrorKind::InvalidValue,
            format!("invalid rlimit name {:?}", name),
        )
    })?;
    let tokens: Vec<&str> = values.split_whitespace().collect();
    if tokens.len() != 2 {
        return Err(Error::new(
            ErrorKind::InvalidValue,
            format!("invalid rlimit {:?}: expected soft and hard values", item),
        ));
    }
    let parse = |tok: &str| -> Result<libc::rlim_t> {
        if tok == "unlim" || tok == "unlimited" {
            Ok(libc::RLIM_INFINITY)
        } else {
            tok.parse().map_err(|_| {
                Error::new(
                    ErrorKind::InvalidValue,
                    format!("invalid rlimit value {:?}", tok),
                )
            })
        }
    };
    Ok(RlimitEntry {
        resource,
        soft: parse(tokens[0])?,
        hard: parse(tokens[1])?,
    })
}

pub fn apply_rlimits(limits: &[RlimitEntry]) -> Result<()> {
    for lim in limits {
        let rl = libc::rlimit {
            rlim_cur: lim.soft,
            rlim_max: lim.hard,
        };
        let ret = unsafe { libc::setrlimit(lim.resource as _, &rl) };
        if ret != 0 {
            return Err(Error::os(format!(
                "setrlimit({}, {}:{})",
                lim.resource, lim.soft, lim.hard
            )));
        }
    }
    Ok(())
}

/// A capability set with the porto application semantics: the set is both
/// the bounding limit and, for non-root tasks, the ambient/effective grant.
#[derive(Debug, Clone)]
pub struct CapabilitySet {
    pub caps: CapsHashSet,
}

impl CapabilitySet {
    pub fn empty() -> Self {
        CapabilitySet {
            caps: CapsHashSet::new(),
        }
    }

    pub fn parse(names: &[String]) -> Result<CapabilitySet> {
        let mut caps = CapsHashSet::new();
        for name in names {
            let full = format!("CAP_{}", name.to_uppercase());
            let cap: Capability = full.parse().map_err(|_| {
                Error::new(
                    ErrorKind::InvalidValue,
                    format!("unknown capability {:?}", name),
                )
            })?;
            caps.insert(cap);
        }
        Ok(CapabilitySet { caps })
    }

    /// Everything a root task may hold by default in app mode.
    pub fn default_app() -> Self {
        CapabilitySet {
            caps: caps::all(),
        }
    }

    /// The restricted set an os-mode container gets even for root.
    pub fn default_os() -> Self {
        let mut caps = CapsHashSet::new();
        for cap in &[
            Capability::CAP_CHOWN,
            Capability::CAP_DAC_OVERRIDE,
            Capability::CAP_FOWNER,
            Capability::CAP_FSETID,
            Capability::CAP_KILL,
            Capability::CAP_SETGID,
            Capability::CAP_SETUID,
            Capability::CAP_SETPCAP,
            Capability::CAP_NET_BIND_SERVICE,
            Capability::CAP_NET_ADMIN,
            Capability::CAP_NET_RAW,
            Capability::CAP_IPC_LOCK,
            Capability::CAP_SYS_CHROOT,
            Capability::CAP_SYS_PTRACE,
            Capability::CAP_SYS_ADMIN,
            Capability::CAP_SYS_BOOT,
            Capability::CAP_SYS_NICE,
            Capability::CAP_SYS_RESOURCE,
            Capability::CAP_MKNOD,
            Capability::CAP_AUDIT_WRITE,
        ] {
            caps.insert(*cap);
        }
        CapabilitySet { caps }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .caps
            .iter()
            .map(|c| c.to_string().trim_start_matches("CAP_").to_lowercase())
            .collect();
        names.sort();
        names
    }

    /// Drop every bounding capability outside the set. Runs in the child.
    pub fn apply_bounding(&self) -> Result<()> {
        for cap in caps::all() {
            if !self.caps.contains(&cap) {
                caps::drop(None, CapSet::Bounding, cap)
                    .map_err(|e| Error::new(ErrorKind::Unknown, format!("capset: {}", e)))?;
            }
        }
        Ok(())
    }

    /// Raise the set as ambient so it survives the uid switch.
    pub fn apply_ambient(&self) -> Result<()> {
        for cap in self.caps.iter() {
            caps::raise(None, CapSet::Inheritable, *cap)
                .map_err(|e| Error::new(ErrorKind::Unknown, format!("capset: {}", e)))?;
            caps::raise(None, CapSet::Ambient, *cap)
                .map_err(|e| Error::new(ErrorKind::Unknown, format!("capset: {}", e)))?;
        }
        Ok(())
    }

    /// Make the set effective for a non-root task after setuid.
    pub fn apply_effective(&self) -> Result<()> {
        caps::set(None, CapSet::Effective, &self.caps)
            .map_err(|e| Error::new(ErrorKind::Unknown, format!("capset: {}", e)))
    }
}

/// File descriptors of the parent container's namespaces, snapshotted on the
/// daemon side before the launcher forks. The helper enters them so the new
/// task starts where its parent lives, not where the daemon lives.
#[derive(Debug, Default)]
pub struct NsSnapshot {
    pub ipc: Option<File>,
    pub uts: Option<File>,
    pub net: Option<File>,
    pub pid: Option<File>,
    pub mnt: Option<File>,
    pub root: Option<File>,
    pub cwd: Option<File>,
}

impl NsSnapshot {
    pub fn open(pid: u32) -> Result<NsSnapshot> {
        let open = |name: &str| -> Option<File> {
            File::open(format!("/proc/{}/{}", pid, name)).ok()
        };
        Ok(NsSnapshot {
            ipc: open("ns/ipc"),
            uts: open("ns/uts"),
            net: open("ns/net"),
            pid: open("ns/pid"),
            mnt: open("ns/mnt"),
            root: open("root"),
            cwd: open("cwd"),
        })
    }

    /// Enter every captured namespace. Order matters: the mount namespace
    /// last, since /proc paths go away with it.
    pub fn enter(&self) -> Result<()> {
        use nix::sched::{setns, CloneFlags};

        if let Some(ref fd) = self.ipc {
            setns(fd.as_raw_fd(), CloneFlags::CLONE_NEWIPC)
                .map_err(|e| Error::from(e).context("setns ipc"))?;
        }
        if let Some(ref fd) = self.uts {
            setns(fd.as_raw_fd(), CloneFlags::CLONE_NEWUTS)
                .map_err(|e| Error::from(e).context("setns uts"))?;
        }
        if let Some(ref fd) = self.net {
            setns(fd.as_raw_fd(), CloneFlags::CLONE_NEWNET)
                .map_err(|e| Error::from(e).context("setns net"))?;
        }
        if let Some(ref fd) = self.pid {
            setns(fd.as_raw_fd(), CloneFlags::CLONE_NEWPID)
                .map_err(|e| Error::from(e).context("setns pid"))?;
        }
        if let Some(ref fd) = self.mnt {
            setns(fd.as_raw_fd(), CloneFlags::CLONE_NEWNS)
                .map_err(|e| Error::from(e).context("setns mnt"))?;
        }
        if let Some(ref fd) = self.root {
            nix::unistd::fchdir(fd.as_raw_fd()).map_err(|e| Error::from(e).context("fchdir root"))?;
            nix::unistd::chroot(".").map_err(|e| Error::from(e).context("chroot"))?;
        }
        if let Some(ref fd) = self.cwd {
            nix::unistd::fchdir(fd.as_raw_fd()).map_err(|e| Error::from(e).context("fchdir cwd"))?;
        }
        Ok(())
    }
}

/// The launch environment, fully assembled before the first fork.
pub struct TaskEnv {
    pub container: String,
    pub command: String,
    pub cwd: PathBuf,
    pub root: PathBuf,
    pub root_rdonly: bool,
    pub env: Vec<(String, String)>,
    pub isolate: bool,
    pub new_mount_ns: bool,
    pub triple_fork: bool,
    pub quadro_fork: bool,
    pub hostname: String,
    pub set_etc_hostname: bool,
    pub resolv_conf: Vec<String>,
    pub bind: Vec<BindEntry>,
    pub devices: Vec<DeviceEntry>,
    pub autoconf: Vec<String>,
    pub rlimits: Vec<RlimitEntry>,
    pub cap_ambient: CapabilitySet,
    pub cap_limit: CapabilitySet,
    pub cred: Cred,
    pub umask: u32,
    pub is_meta: bool,
    pub stdin: StdStream,
    pub stdout: StdStream,
    pub stderr: StdStream,
    pub parent_ns: NsSnapshot,
    /// Absolute cgroup directories the helper attaches itself to.
    pub cgroup_paths: Vec<PathBuf>,
    pub classid: u32,
    pub sched_nice: i32,
}

impl TaskEnv {
    pub fn new(container: &str, cred: Cred) -> TaskEnv {
        TaskEnv {
            container: container.to_string(),
            command: String::new(),
            cwd: PathBuf::from("/"),
            root: PathBuf::from("/"),
            root_rdonly: false,
            env: vec![],
            isolate: true,
            new_mount_ns: false,
            triple_fork: false,
            quadro_fork: false,
            hostname: String::new(),
            set_etc_hostname: false,
            resolv_conf: vec![],
            bind: vec![],
            devices: vec![],
            autoconf: vec![],
            rlimits: vec![],
            cap_ambient: CapabilitySet::empty(),
            cap_limit: CapabilitySet::default_app(),
            cred,
            umask: 0o002,
            is_meta: false,
            stdin: StdStream::null(),
            stdout: StdStream::null(),
            stderr: StdStream::null(),
            parent_ns: NsSnapshot::default(),
            cgroup_paths: vec![],
            classid: 0,
            sched_nice: 0,
        }
    }

    pub fn set_env(&mut self, name: &str, value: &str) {
        if let Some(slot) = self.env.iter_mut().find(|(n, _)| n == name) {
            slot.1 = value.to_string();
        } else {
            self.env.push((name.to_string(), value.to_string()));
        }
    }

    pub fn get_env(&self, name: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn envp(&self) -> Result<Vec<CString>> {
        let mut envp = vec![];
        for (name, value) in &self.env {
            envp.push(
                CString::new(format!("{}={}", name, value)).map_err(|_| {
                    Error::new(
                        ErrorKind::InvalidValue,
                        format!("environment variable {} contains NUL", name),
                    )
                })?,
            );
        }
        Ok(envp)
    }
}

/// Posix shell word expansion, narrowed: whitespace splitting with single and
/// double quotes and backslash escapes, `$VAR`/`${VAR}` expansion against the
/// task environment. Undefined variables, command substitution and the shell
/// control metacharacters are rejected, matching wordexp with
/// WRDE_NOCMD|WRDE_UNDEF.
pub fn expand_command(command: &str, env: &TaskEnv) -> Result<Vec<String>> {
    const METACHARS: &str = "|&;<>(){}\n";

    let mut words: Vec<String> = vec![];
    let mut current = String::new();
    let mut started = false;
    let mut chars = command.chars().peekable();

    fn bad(what: &str) -> Error {
        Error::new(ErrorKind::InvalidValue, format!("wordexp: {}", what))
    }

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                started = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => return Err(bad("unterminated single quote")),
                    }
                }
            }
            '"' => {
                started = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(e) if "$`\"\\".contains(e) => current.push(e),
                            Some(e) => {
                                current.push('\\');
                                current.push(e);
                            }
                            None => return Err(bad("unterminated double quote")),
                        },
                        Some('`') => return Err(bad("command substitution is not supported")),
                        Some('$') => current.push_str(&expand_var(&mut chars, env)?),
                        Some(c) => current.push(c),
                        None => return Err(bad("unterminated double quote")),
                    }
                }
            }
            '\\' => match chars.next() {
                Some(e) => {
                    started = true;
                    current.push(e);
                }
                None => return Err(bad("trailing backslash")),
            },
            '`' => return Err(bad("command substitution is not supported")),
            '$' => {
                started = true;
                current.push_str(&expand_var(&mut chars, env)?);
            }
            c if c == ' ' || c == '\t' => {
                if started {
                    words.push(std::mem::take(&mut current));
                    started = false;
                }
            }
            c if METACHARS.contains(c) => {
                return Err(bad(&format!(
                    "illegal occurrence of {:?}",
                    c
                )))
            }
            c => {
                started = true;
                current.push(c);
            }
        }
    }
    if started {
        words.push(current);
    }
    if words.is_empty() {
        return Err(bad("empty command"));
    }
    Ok(words)
}

fn expand_var(
    chars: &mut std::iter::Peekable<std::str::Chars>,
    env: &TaskEnv,
) -> Result<String> {
    let braced = chars.peek() == Some(&'{');
    if braced {
        chars.next();
    }
    if chars.peek() == Some(&'(') {
        return Err(Error::new(
            ErrorKind::InvalidValue,
            "wordexp: command substitution is not supported",
        ));
    }
    let mut name = String::new();
    while let Some(&c) = chars.peek() {
        if c.is_ascii_alphanumeric() || c == '_' {
            name.push(c);
            chars.next();
        } else {
            break;
        }
    }
    if braced {
        match chars.next() {
            Some('}') => {}
            _ => {
                return Err(Error::new(
                    ErrorKind::InvalidValue,
                    "wordexp: unterminated ${",
                ))
            }
        }
    }
    if name.is_empty() {
        return Err(Error::new(ErrorKind::InvalidValue, "wordexp: bad substitution"));
    }
    env.get_env(&name).map(|v| v.to_string()).ok_or_else(|| {
        Error::new(
            ErrorKind::InvalidValue,
            format!("wordexp: undefined shell variable {:?}", name),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> TaskEnv {
        let mut env = TaskEnv::new("a", Cred::root());
        env.set_env("HOME", "/root");
        env.set_env("NAME", "world");
        env
    }

    #[test]
    fn plain_words_split() {
        let words = expand_command("sleep 1000", &env()).unwrap();
        assert_eq!(words, vec!["sleep", "1000"]);
    }

    #[test]
    fn quotes_and_escapes() {
        let words = expand_command(r#"echo 'a b' "c $NAME" d\ e"#, &env()).unwrap();
        assert_eq!(words, vec!["echo", "a b", "c world", "d e"]);
    }

    #[test]
    fn variables_expand() {
        let words = expand_command("ls ${HOME}/bin $HOME", &env()).unwrap();
        assert_eq!(words, vec!["ls", "/root/bin", "/root"]);
    }

    #[test]
    fn undefined_variable_is_rejected() {
        let err = expand_command("echo $NOPE", &env()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidValue);
        assert!(err.text().contains("undefined"));
    }

    #[test]
    fn metacharacters_are_rejected() {
        for cmd in &["a | b", "a; b", "a > f", "a & b", "a (b)", "echo `id`", "echo $(id)"] {
            assert!(expand_command(cmd, &env()).is_err(), "{}", cmd);
        }
        // quoted metacharacters are data
        assert!(expand_command("echo 'a | b'", &env()).is_ok());
    }

    #[test]
    fn rlimit_parse_works() {
        let lim = parse_rlimit("nofile: 1024 4096").unwrap();
        assert_eq!(lim.resource, libc::RLIMIT_NOFILE as i32);
        assert_eq!(lim.soft, 1024);
        assert_eq!(lim.hard, 4096);
        let lim = parse_rlimit("core: unlim unlimited").unwrap();
        assert_eq!(lim.soft, libc::RLIM_INFINITY);
        assert!(parse_rlimit("bogus: 1 2").is_err());
        assert!(parse_rlimit("nofile: 1").is_err());
    }

    #[test]
    fn bind_parse_works() {
        let bind = BindEntry::parse("/src /dst ro").unwrap();
        assert!(bind.read_only);
        assert_eq!(bind.source, PathBuf::from("/src"));
        assert!(BindEntry::parse("/src").is_err());
        assert!(BindEntry::parse("/src /dst rx").is_err());
    }

    #[test]
    fn device_parse_works() {
        let dev = DeviceEntry::parse("/dev/null rwm /dev/null 0666 root root").unwrap();
        assert_eq!(dev.access, "rwm");
        assert_eq!(dev.mode, Some(0o666));
        let rule = dev.cgroup_rule().unwrap();
        assert_eq!(rule, "c 1:3 rwm");
        assert!(DeviceEntry::parse("dev/null rwm").is_err());
        assert!(DeviceEntry::parse("/dev/null xyz").is_err());
    }

    #[test]
    fn capability_names_parse() {
        let set = CapabilitySet::parse(&["net_admin".to_string(), "SYS_PTRACE".to_string()])
            .unwrap();
        assert!(set.caps.contains(&Capability::CAP_NET_ADMIN));
        assert!(set.caps.contains(&Capability::CAP_SYS_PTRACE));
        assert!(CapabilitySet::parse(&["not_a_cap".to_string()]).is_err());
        assert!(set.names().contains(&"net_admin".to_string()));
    }
}
