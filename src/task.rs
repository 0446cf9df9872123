//! The task launcher: materializes a process in the namespaces, cgroups,
//! credentials, capabilities and filesystem view described by a `TaskEnv`,
//! and reports either the new pids or a precise error back to the daemon.
//!
//! The pipeline is a fork/clone chain. The daemon forks a helper so that
//! namespace entry never touches a daemon thread; the helper (or, when the
//! task must be pid 1 of its own pid namespace, a short-lived intermediate
//! forked inside the parent's pid namespace) clones the target with the
//! requested CLONE flags. A socketpair threads the stages together: stage 0
//! reports the target pid, stage 1 reports it again once the child side is
//! configured, stage 2 carries the terminal error. Aborting at any stage
//! emits placeholder pids for the stages not reached, so the daemon's recv
//! sequence is total no matter where the child failed. Pids are carried as
//! SCM_CREDENTIALS, which the kernel translates between pid namespaces; the
//! message payload carries the sender's own view of its pid.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

use log::{info, warn};
use nix::sched::CloneFlags;
use nix::sys::signal::{self, kill, SigHandler, Signal};
use nix::sys::socket::{
    recvmsg, sendmsg, setsockopt, socketpair, sockopt, AddressFamily, ControlMessage,
    ControlMessageOwned, MsgFlags, SockFlag, SockType, UnixCredentials,
};
use nix::sys::uio::IoVec;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

use crate::config::Config;
use crate::env::{self, TaskEnv};
use crate::error::{Error, ErrorKind, Result};
use crate::mount;

/// Pids recorded after a successful launch.
#[derive(Debug, Clone, Copy)]
pub struct Launched {
    /// The daemon's wait target in the host pid namespace.
    pub wait_pid: u32,
    /// The container root task (signal target) in the host pid namespace.
    pub task_pid: u32,
    /// The root task's pid as seen inside its own pid namespace.
    pub task_vpid: u32,
}

/// One end of the launch relay.
struct RelaySocket {
    fd: RawFd,
}

impl RelaySocket {
    fn pair() -> Result<(RelaySocket, RelaySocket)> {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .map_err(|e| Error::from(e).context("socketpair"))?;
        for fd in &[a, b] {
            setsockopt(*fd, sockopt::PassCred, &true)
                .map_err(|e| Error::from(e).context("setsockopt(SO_PASSCRED)"))?;
        }
        Ok((RelaySocket { fd: a }, RelaySocket { fd: b }))
    }

    fn set_recv_timeout(&self, timeout_ms: u64) -> Result<()> {
        use nix::sys::time::TimeValLike;
        let tv = nix::sys::time::TimeVal::milliseconds(timeout_ms as i64);
        setsockopt(self.fd, sockopt::ReceiveTimeout, &tv)
            .map_err(|e| Error::from(e).context("setsockopt(SO_RCVTIMEO)"))
    }

    /// Send this process's pid: the kernel translates the credentials into
    /// the receiver's pid namespace, the payload carries our own view.
    fn send_pid(&self) -> Result<()> {
        let pid = nix::unistd::getpid().as_raw();
        let ucred = libc::ucred {
            pid,
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
        };
        let cred = UnixCredentials::from(ucred);
        let payload = pid.to_ne_bytes();
        let iov = [IoVec::from_slice(&payload)];
        let cmsg = [ControlMessage::ScmCredentials(&cred)];
        sendmsg(self.fd, &iov, &cmsg, MsgFlags::empty(), None)
            .map_err(|e| Error::from(e).context("sendmsg(pid)"))?;
        Ok(())
    }

    /// Receive a pid report: (pid in our namespace, pid as the sender saw it).
    fn recv_pid(&self) -> Result<(u32, u32)> {
        let mut payload = [0u8; 4];
        let mut cmsg_space = nix::cmsg_space!(UnixCredentials);
        let iov = [IoVec::from_mut_slice(&mut payload)];
        let msg = recvmsg(self.fd, &iov, Some(&mut cmsg_space), MsgFlags::empty())
            .map_err(|e| Error::from(e).context("recvmsg(pid)"))?;
        if msg.bytes != 4 {
            return Err(Error::new(
                ErrorKind::Unknown,
                "short pid report from the launch relay",
            ));
        }
        let vpid = i32::from_ne_bytes(payload);
        for cmsg in msg.cmsgs() {
            if let ControlMessageOwned::ScmCredentials(cred) = cmsg {
                return Ok((cred.pid() as u32, vpid as u32));
            }
        }
        Err(Error::new(
            ErrorKind::Unknown,
            "pid report without credentials",
        ))
    }

    fn send_zero(&self) -> Result<()> {
        nix::unistd::write(self.fd, &[0u8]).map_err(|e| Error::from(e).context("write(ack)"))?;
        Ok(())
    }

    fn recv_zero(&self) -> Result<()> {
        let mut buf = [0u8; 1];
        match nix::unistd::read(self.fd, &mut buf) {
            Ok(1) => Ok(()),
            Ok(_) => Err(Error::new(ErrorKind::Unknown, "relay closed before ack")),
            Err(e) => Err(Error::from(e).context("read(ack)")),
        }
    }

    /// kind, errno, text-length, text.
    fn send_error(&self, error: &Error) -> Result<()> {
        let text = error.text().as_bytes();
        let mut buf = Vec::with_capacity(12 + text.len());
        buf.extend_from_slice(&error.kind().code().to_ne_bytes());
        buf.extend_from_slice(&error.errno().to_ne_bytes());
        buf.extend_from_slice(&(text.len() as u32).to_ne_bytes());
        buf.extend_from_slice(text);
        nix::unistd::write(self.fd, &buf).map_err(|e| Error::from(e).context("write(error)"))?;
        Ok(())
    }

    /// EOF means the relay was closed on exec: success.
    fn recv_error(&self) -> Result<Option<Error>> {
        let mut header = [0u8; 12];
        let mut read = 0;
        while read < header.len() {
            match nix::unistd::read(self.fd, &mut header[read..]) {
                Ok(0) if read == 0 => return Ok(None),
                Ok(0) => {
                    return Err(Error::new(ErrorKind::Unknown, "truncated error report"))
                }
                Ok(n) => read += n,
                Err(e) => return Err(Error::from(e).context("read(error)")),
            }
        }
        let kind = u32::from_ne_bytes([header[0], header[1], header[2], header[3]]);
        let errno = i32::from_ne_bytes([header[4], header[5], header[6], header[7]]);
        let len = u32::from_ne_bytes([header[8], header[9], header[10], header[11]]) as usize;
        let mut text = vec![0u8; len.min(65536)];
        let mut read = 0;
        while read < text.len() {
            match nix::unistd::read(self.fd, &mut text[read..]) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) => return Err(Error::from(e).context("read(error)")),
            }
        }
        let kind = ErrorKind::from_code(kind).unwrap_or(ErrorKind::Unknown);
        Ok(Some(Error::with_errno(
            kind,
            errno,
            String::from_utf8_lossy(&text[..read]).into_owned(),
        )))
    }

    fn close(&self) {
        let _ = nix::unistd::close(self.fd);
    }
}

/// Child-side relay bookkeeping: which report stage we have reached, so an
/// abort can pad the sequence.
struct Relay {
    sock: RelaySocket,
    stage: u32,
}

impl Relay {
    fn report_pid(&mut self) {
        if let Err(e) = self.sock.send_pid() {
            self.abort(e);
        }
        self.stage += 1;
    }

    /// stage 0: pid report, stage 1: pid report, stage 2: error.
    fn abort(&mut self, error: Error) -> ! {
        for _ in self.stage..2 {
            let _ = self.sock.send_pid();
        }
        let _ = self.sock.send_error(&error);
        unsafe { libc::_exit(1) }
    }
}

fn set_die_with_parent() {
    unsafe {
        libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong, 0, 0, 0);
    }
}

fn reset_signals() {
    let mut set = signal::SigSet::all();
    let _ = set.thread_unblock();
    for sig in &[
        Signal::SIGTERM,
        Signal::SIGINT,
        Signal::SIGQUIT,
        Signal::SIGPIPE,
        Signal::SIGCHLD,
        Signal::SIGHUP,
    ] {
        unsafe {
            let _ = signal::signal(*sig, SigHandler::SigDfl);
        }
    }
}

/// Launch the task described by `env`. Runs on a daemon worker thread; the
/// blocking reads are bounded by the container start timeout.
pub fn start(env: &mut TaskEnv, config: &Config) -> Result<Launched> {
    let (master, sock) = RelaySocket::pair()?;

    let helper = match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            master.close();
            let mut relay = Relay { sock, stage: 0 };
            run_helper(env, &mut relay);
        }
        Ok(ForkResult::Parent { child }) => child,
        Err(e) => {
            master.close();
            sock.close();
            return Err(Error::from(e).context("fork helper"));
        }
    };
    sock.close();

    let result = run_parent(&master, helper, config);
    master.close();

    if let Err(ref error) = result {
        // deterministic unwind: nothing half-started survives
        warn!("killing partially constructed container: {}", error);
        for path in &env.cgroup_paths {
            kill_cgroup_procs(path);
        }
        let _ = kill(helper, Signal::SIGKILL);
        let _ = waitpid(helper, None);
    }
    env.stdin.close_outside();
    env.stdout.close_outside();
    env.stderr.close_outside();
    result
}

fn run_parent(master: &RelaySocket, helper: Pid, config: &Config) -> Result<Launched> {
    master.set_recv_timeout(config.container.start_timeout_ms)?;

    // stage 0: the clone has happened
    let (wait_pid, mut task_vpid) = master.recv_pid()?;
    master.send_zero()?;

    // stage 1: the child side is configured
    let (task_pid, vpid) = master.recv_pid()?;
    task_vpid = vpid;

    // the helper has no more work; reap it before waking the target so a
    // failed helper is never mistaken for a running container
    let helper_status = waitpid(helper, None)
        .map_err(|e| Error::from(e).context("waitpid helper"))?;
    match helper_status {
        WaitStatus::Exited(_, 0) => {}
        other => {
            return Err(Error::new(
                ErrorKind::Unknown,
                format!("launch helper failed: {:?}", other),
            ))
        }
    }

    // wakeup: the target may exec now
    master.send_zero()?;

    // stage 2: either an error report or EOF on exec
    if let Some(error) = master.recv_error()? {
        return Err(error);
    }

    Ok(Launched {
        wait_pid,
        task_pid,
        task_vpid,
    })
}

fn kill_cgroup_procs(path: &std::path::Path) {
    if let Ok(text) = std::fs::read_to_string(path.join("cgroup.procs")) {
        for line in text.lines() {
            if let Ok(pid) = line.trim().parse::<i32>() {
                let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
            }
        }
    }
}

/// The helper: enters the parent container's world and clones the target.
/// Never returns.
fn run_helper(env: &mut TaskEnv, relay: &mut Relay) -> ! {
    reset_signals();
    set_die_with_parent();
    let _ = nix::unistd::setsid();

    // join the target cgroups before any child exists, so every descendant
    // is charged from the first instruction
    let my_pid = nix::unistd::getpid();
    for path in &env.cgroup_paths {
        if let Err(e) = std::fs::write(path.join("cgroup.procs"), my_pid.to_string()) {
            relay.abort(Error::from(e).context(format!("attach to {}", path.display())));
        }
    }

    if env.sched_nice != 0 {
        unsafe {
            libc::setpriority(libc::PRIO_PROCESS, 0, env.sched_nice);
        }
    }

    // default streams live outside the container filesystem
    let owner = env.cred.clone();
    if let Err(e) = env.stdin.open_outside(&owner) {
        relay.abort(e);
    }
    if let Err(e) = env.stdout.open_outside(&owner) {
        relay.abort(e);
    }
    if let Err(e) = env.stderr.open_outside(&owner) {
        relay.abort(e);
    }

    if let Err(e) = env.parent_ns.enter() {
        relay.abort(e);
    }

    let mut flags = CloneFlags::empty();
    if env.isolate {
        flags |= CloneFlags::CLONE_NEWPID | CloneFlags::CLONE_NEWIPC;
    }
    if env.new_mount_ns {
        flags |= CloneFlags::CLONE_NEWNS;
    }
    if env.isolate || !env.hostname.is_empty() {
        flags |= CloneFlags::CLONE_NEWUTS;
    }

    if env.triple_fork {
        // an intermediate crosses the parent pid namespace so the target's
        // apparent parent is pid 1 inside, not the helper
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                clone_target(env, relay, flags);
            }
            Ok(ForkResult::Parent { child }) => match waitpid(child, None) {
                Ok(WaitStatus::Exited(_, 0)) => unsafe { libc::_exit(0) },
                other => relay.abort(Error::new(
                    ErrorKind::Unknown,
                    format!("launch intermediate failed: {:?}", other),
                )),
            },
            Err(e) => relay.abort(Error::from(e).context("fork intermediate")),
        }
    } else {
        clone_target(env, relay, flags);
    }
}

/// Clone the target with the assembled flags, then exit the calling process.
fn clone_target(env: &mut TaskEnv, relay: &mut Relay, flags: CloneFlags) -> ! {
    let mut stack = vec![0u8; 256 * 1024];
    // the closure runs in the new process
    let env_ptr: *mut TaskEnv = env;
    let relay_ptr: *mut Relay = relay;
    let cb = Box::new(move || -> isize {
        let env = unsafe { &mut *env_ptr };
        let relay = unsafe { &mut *relay_ptr };
        run_target(env, relay)
    });
    match nix::sched::clone(cb, &mut stack, flags, Some(libc::SIGCHLD)) {
        Ok(_) => unsafe { libc::_exit(0) },
        Err(e) => {
            let kind = if e.as_errno() == Some(nix::errno::Errno::ENOMEM) {
                ErrorKind::ResourceNotAvailable
            } else {
                ErrorKind::Unknown
            };
            relay.abort(Error::with_errno(
                kind,
                e.as_errno().map(|e| e as i32).unwrap_or(0),
                "clone()",
            ))
        }
    }
}

static SHIM_CHILD: AtomicI32 = AtomicI32::new(0);

extern "C" fn shim_forward(sig: libc::c_int) {
    let child = SHIM_CHILD.load(Ordering::SeqCst);
    if child > 0 {
        unsafe {
            libc::kill(child, sig);
        }
    }
}

/// The target process: configure, report, wait for wakeup, exec.
fn run_target(env: &mut TaskEnv, relay: &mut Relay) -> isize {
    // stage 0: we exist; the daemon learns our pid in both namespaces
    relay.report_pid();
    if let Err(e) = relay.sock.recv_zero() {
        relay.abort(e);
    }

    if let Err(e) = configure_child(env, relay) {
        relay.abort(e);
    }

    // stage 1: fully configured
    relay.report_pid();

    // wakeup
    if let Err(e) = relay.sock.recv_zero() {
        relay.abort(e);
    }

    reset_signals();

    if let Err(e) = wait_autoconf(env) {
        relay.abort(e);
    }

    let e = exec_command(env);
    relay.abort(e)
}

/// In-target configuration, in launch order. Everything here still runs with
/// the daemon's privileges; credentials are dropped at the end.
fn configure_child(env: &mut TaskEnv, relay: &mut Relay) -> Result<()> {
    if env.triple_fork {
        set_die_with_parent();
    }

    env::apply_rlimits(&env.rlimits)?;

    nix::unistd::setsid().map_err(|e| Error::from(e).context("setsid"))?;
    nix::sys::stat::umask(nix::sys::stat::Mode::empty());

    if env.new_mount_ns {
        setup_mounts(env)?;
    }

    for dev in &env.devices {
        make_device(env, dev)?;
    }

    if !env.resolv_conf.is_empty() {
        let mut text = env.resolv_conf.join("\n");
        text.push('\n');
        mount::write_private(std::path::Path::new("/etc/resolv.conf"), &text)?;
    }

    if !env.hostname.is_empty() {
        if env.set_etc_hostname && std::path::Path::new("/etc/hostname").exists() {
            mount::write_private(
                std::path::Path::new("/etc/hostname"),
                &format!("{}\n", env.hostname),
            )?;
        }
        nix::unistd::sethostname(&env.hostname)
            .map_err(|e| Error::from(e).context("sethostname"))?;
    }

    nix::unistd::chdir(&env.cwd)
        .map_err(|e| Error::from(e).context(format!("chdir {}", env.cwd.display())))?;

    // app-mode isolation: a tiny init shim stays pid 1 and reaps; the
    // command becomes its child
    if env.quadro_fork {
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                nix::unistd::setsid().map_err(|e| Error::from(e).context("setsid"))?;
            }
            Ok(ForkResult::Parent { child }) => {
                relay.sock.close();
                run_init_shim(child);
            }
            Err(e) => return Err(Error::from(e).context("fork init shim")),
        }
    }

    env.cred.apply()?;

    env.cap_ambient.apply_ambient()?;
    env.cap_limit.apply_bounding()?;
    if !env.cred.is_root() {
        env.cap_ambient.apply_effective()?;
    }

    // streams may point at paths that only exist after the chroot
    env.stdin.open_inside()?;
    env.stdout.open_inside()?;
    env.stderr.open_inside()?;

    nix::sys::stat::umask(nix::sys::stat::Mode::from_bits_truncate(env.umask));

    Ok(())
}

/// Pid 1 of an isolated app container: forward signals, reap orphans, exit
/// the way the command exited.
fn run_init_shim(child: Pid) -> ! {
    SHIM_CHILD.store(child.as_raw(), Ordering::SeqCst);
    for sig in &[Signal::SIGTERM, Signal::SIGINT, Signal::SIGQUIT, Signal::SIGHUP] {
        unsafe {
            let _ = signal::signal(*sig, SigHandler::Handler(shim_forward));
        }
    }
    loop {
        match waitpid(Pid::from_raw(-1), None) {
            Ok(WaitStatus::Exited(pid, status)) if pid == child => unsafe {
                libc::_exit(status)
            },
            Ok(WaitStatus::Signaled(pid, sig, _)) if pid == child => unsafe {
                let _ = signal::signal(sig, SigHandler::SigDfl);
                libc::kill(libc::getpid(), sig as libc::c_int);
                libc::_exit(128 + sig as libc::c_int)
            },
            Ok(_) => {}
            Err(nix::Error::Sys(nix::errno::Errno::EINTR)) => {}
            Err(_) => unsafe { libc::_exit(1) },
        }
    }
}

fn setup_mounts(env: &TaskEnv) -> Result<()> {
    mount::make_mounts_private()?;

    let root = &env.root;
    let in_root = |p: &std::path::Path| -> std::path::PathBuf {
        if root == std::path::Path::new("/") {
            p.to_path_buf()
        } else {
            root.join(p.strip_prefix("/").unwrap_or(p))
        }
    };

    if root != std::path::Path::new("/") {
        // the root must be a mount point before pivoting into it
        mount::bind_mount(root, root, false)?;
    }

    for bind in &env.bind {
        let dest = in_root(&bind.dest);
        if !dest.exists() {
            std::fs::create_dir_all(&dest)
                .map_err(|e| Error::from(e).context(format!("mkdir {}", dest.display())))?;
        }
        mount::bind_mount(&bind.source, &dest, bind.read_only)?;
    }

    if root != std::path::Path::new("/") {
        nix::unistd::chroot(root)
            .map_err(|e| Error::from(e).context(format!("chroot {}", root.display())))?;
        nix::unistd::chdir("/").map_err(|e| Error::from(e).context("chdir /"))?;
        if env.root_rdonly {
            mount::remount_read_only(std::path::Path::new("/"))?;
        }
    }
    Ok(())
}

fn make_device(env: &TaskEnv, dev: &crate::env::DeviceEntry) -> Result<()> {
    use std::os::linux::fs::MetadataExt;

    let meta = std::fs::metadata(&dev.device)
        .map_err(|e| Error::from(e).context(format!("stat {}", dev.device.display())))?;
    let mode = dev.mode.unwrap_or(meta.st_mode() & 0o777);
    let kind = if meta.st_mode() & libc::S_IFMT == libc::S_IFBLK {
        nix::sys::stat::SFlag::S_IFBLK
    } else {
        nix::sys::stat::SFlag::S_IFCHR
    };
    if dev.inside.exists() {
        return Ok(());
    }
    nix::sys::stat::mknod(
        &dev.inside,
        kind,
        nix::sys::stat::Mode::from_bits_truncate(mode),
        meta.st_rdev(),
    )
    .map_err(|e| Error::from(e).context(format!("mknod {}", dev.inside.display())))?;

    let uid = match &dev.user {
        Some(user) => crate::cred::lookup_user(user)?,
        None => env.cred.uid,
    };
    let gid = match &dev.group {
        Some(group) => crate::cred::lookup_group(group)?,
        None => env.cred.gid,
    };
    nix::unistd::chown(
        &dev.inside,
        Some(nix::unistd::Uid::from_raw(uid)),
        Some(nix::unistd::Gid::from_raw(gid)),
    )
    .map_err(|e| Error::from(e).context(format!("chown {}", dev.inside.display())))?;
    Ok(())
}

/// Bounded wait for addresses on interfaces that are configured externally.
fn wait_autoconf(env: &TaskEnv) -> Result<()> {
    if env.autoconf.is_empty() {
        return Ok(());
    }
    let sock = crate::netlink::NetlinkSocket::connect()?;
    for name in &env.autoconf {
        sock.wait_address(name, 120)?;
    }
    Ok(())
}

/// Word-expand and exec. Only returns on failure.
fn exec_command(env: &TaskEnv) -> Error {
    let words = match env::expand_command(&env.command, env) {
        Ok(words) => words,
        Err(e) => return e,
    };
    info!("exec {:?}", words);

    let argv: Vec<std::ffi::CString> = match words
        .iter()
        .map(|w| std::ffi::CString::new(w.as_bytes()))
        .collect::<std::result::Result<_, _>>()
    {
        Ok(argv) => argv,
        Err(_) => return Error::new(ErrorKind::InvalidValue, "command contains NUL"),
    };
    let envp = match env.envp() {
        Ok(envp) => envp,
        Err(e) => return e,
    };

    let argv_refs: Vec<&std::ffi::CStr> = argv.iter().map(|c| c.as_c_str()).collect();
    let envp_refs: Vec<&std::ffi::CStr> = envp.iter().map(|c| c.as_c_str()).collect();
    match nix::unistd::execvpe(&argv[0], &argv_refs, &envp_refs) {
        Ok(void) => match void {},
        Err(e) => {
            let errno = e.as_errno().map(|e| e as i32).unwrap_or(libc::EINVAL);
            Error::with_errno(
                ErrorKind::InvalidValue,
                errno,
                format!("execvpe({}, {})", words[0], words.len()),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_pid_round_trip() {
        let (a, b) = RelaySocket::pair().unwrap();
        b.send_pid().unwrap();
        let (pid, vpid) = a.recv_pid().unwrap();
        assert_eq!(pid, std::process::id());
        assert_eq!(vpid, std::process::id());
        a.close();
        b.close();
    }

    #[test]
    fn relay_error_round_trip() {
        let (a, b) = RelaySocket::pair().unwrap();
        let sent = Error::with_errno(ErrorKind::InvalidValue, libc::ENOENT, "execvpe(nope, 1)");
        b.send_error(&sent).unwrap();
        let got = a.recv_error().unwrap().unwrap();
        assert_eq!(got.kind(), ErrorKind::InvalidValue);
        assert_eq!(got.errno(), libc::ENOENT);
        assert_eq!(got.text(), "execvpe(nope, 1)");
        a.close();
        b.close();
    }

    #[test]
    fn relay_eof_is_success() {
        let (a, b) = RelaySocket::pair().unwrap();
        b.close();
        assert!(a.recv_error().unwrap().is_none());
        a.close();
    }

    #[test]
    fn relay_zero_round_trip() {
        let (a, b) = RelaySocket::pair().unwrap();
        a.send_zero().unwrap();
        b.recv_zero().unwrap();
        a.close();
        b.close();
    }
}
