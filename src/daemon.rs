//! The daemon: owns every subsystem (hierarchy, holders, host network, wait
//! registry), restores state at startup and drives the event loop — a mio
//! poll over the RPC listener, a signalfd and per-container oom eventfds,
//! with a small fixed pool of worker threads serving clients.

use std::collections::HashMap;
use std::io::ErrorKind as IoErrorKind;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token};
use nix::sys::signal::Signal;
use nix::sys::signalfd::{SfdFlags, SigSet, SignalFd};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::cgroup::Cgroup;
use crate::config::Config;
use crate::cred;
use crate::error::{Error, ErrorKind, Result};
use crate::hierarchies::V1;
use crate::holder::ContainerHolder;
use crate::kv::KvStore;
use crate::memory::MemController;
use crate::network::Network;
use crate::protocol::{read_frame, write_frame, Request};
use crate::rpc::{self, WaitRegistry};
use crate::volume::VolumeHolder;
use crate::PORTO_DAEMON_CGROUP;

const TOKEN_LISTENER: Token = Token(0);
const TOKEN_SIGNALS: Token = Token(1);
const TOKEN_OOM_BASE: usize = 1024;

pub struct Daemon {
    pub config: Config,
    pub hier: V1,
    pub holder: ContainerHolder,
    pub volumes: VolumeHolder,
    pub network: Arc<Network>,
    pub waits: WaitRegistry,
    registry: Mutex<Option<Registry>>,
    /// Registered oom eventfds: token -> (fd, container id).
    oom_watches: Mutex<HashMap<usize, (RawFd, u32)>>,
    shutdown: AtomicBool,
}

impl Daemon {
    /// Discover the kernel state, put ourselves into the daemon cgroup and
    /// restore everything the previous instance left behind.
    pub fn new(config: Config) -> Result<Arc<Daemon>> {
        let hier = V1::new()?;

        // the containers subtree and our own
        Cgroup::load(&hier, crate::PORTO_ROOT_CGROUP).create()?;
        let daemon_cg = Cgroup::load(&hier, PORTO_DAEMON_CGROUP);
        daemon_cg.create()?;
        daemon_cg.attach(crate::CgroupPid::from(std::process::id() as u64))?;
        if config.daemon.memory_limit > 0 {
            if let Some(mem) = daemon_cg.controller_of::<MemController>() {
                mem.set_limit(config.daemon.memory_limit)?;
            }
        }

        let holder = ContainerHolder::new(KvStore::open(&config.daemon.containers_kv)?)?;
        let volumes = VolumeHolder::new(KvStore::open(&config.daemon.volumes_kv)?);
        let network = Network::open_host(&config)?;

        holder.restore(&config, &hier, &network)?;
        volumes.restore(&config)?;

        Ok(Arc::new(Daemon {
            config,
            hier,
            holder,
            volumes,
            network,
            waits: WaitRegistry::new(),
            registry: Mutex::new(None),
            oom_watches: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
        }))
    }

    /// Put the started container's oom eventfd under the poll.
    pub fn watch_container_oom(&self, name: &str) {
        let (fd, id) = match self.holder.get(name) {
            Ok(container) => {
                let container = container.lock().unwrap();
                match container.oom_event_fd {
                    Some(fd) => (fd, container.id),
                    None => return,
                }
            }
            Err(_) => return,
        };
        let registry = self.registry.lock().unwrap();
        if let Some(registry) = registry.as_ref() {
            let token = TOKEN_OOM_BASE + id as usize;
            if registry
                .register(&mut SourceFd(&fd), Token(token), Interest::READABLE)
                .is_ok()
            {
                self.oom_watches.lock().unwrap().insert(token, (fd, id));
            }
        }
    }

    fn handle_oom_event(&self, token: usize) {
        let entry = self.oom_watches.lock().unwrap().remove(&token);
        let (fd, id) = match entry {
            Some(entry) => entry,
            None => return,
        };
        if let Some(registry) = self.registry.lock().unwrap().as_ref() {
            let _ = registry.deregister(&mut SourceFd(&fd));
        }
        let mut buf = [0u8; 8];
        let _ = nix::unistd::read(fd, &mut buf);
        if let Some(container) = self.holder.get_by_id(id) {
            let mut container = container.lock().unwrap();
            warn!("oom event in {}", container.name);
            container.oom_killed = true;
        }
    }

    /// Reap dead children and credit the exits. SIGCHLD coalesces, so the
    /// loop drains everything that is ready; ordering is not trusted, the
    /// match is by pid.
    fn reap_children(&self) {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => {
                    self.deliver_exit(pid.as_raw() as u32, code << 8);
                }
                Ok(WaitStatus::Signaled(pid, signal, _)) => {
                    self.deliver_exit(pid.as_raw() as u32, -(signal as i32));
                }
                Ok(WaitStatus::StillAlive) | Err(_) => break,
                Ok(_) => {}
            }
        }
    }

    fn deliver_exit(&self, pid: u32, status: i32) {
        if let Some(name) = self.holder.deliver_exit(pid, status, &self.config) {
            self.waits.deliver(&name);
        } else {
            debug!("reaped unknown child {}", pid);
        }
    }

    /// Aging and respawn, off the poll timeout.
    fn aging_tick(&self) {
        for name in self.holder.aging_pass(&self.config, &self.volumes) {
            info!("respawning {}", name);
            if let Err(e) = self.holder.stop(&name, None, &self.config) {
                warn!("cannot stop {} for respawn: {}", name, e);
                continue;
            }
            if let Ok(container) = self.holder.get(&name) {
                container.lock().unwrap().respawn_count += 1;
            }
            match self.holder.start(
                &name,
                &cred::Cred::root(),
                &self.config,
                &self.hier,
                &self.network,
            ) {
                Ok(()) => self.watch_container_oom(&name),
                Err(e) => warn!("cannot respawn {}: {}", name, e),
            }
        }
    }

    /// Device hotplug handling: if new managed devices appeared, every
    /// running container gets its classes reissued.
    fn refresh_network(&self) {
        match self.network.refresh_classes(false, &self.config) {
            Ok(true) => {
                for name in self.holder.list() {
                    if let Ok(container) = self.holder.get(&name) {
                        let container = container.lock().unwrap();
                        match container.state {
                            crate::container::State::Running
                            | crate::container::State::Meta => {
                                let parent_classid = match container.parent {
                                    Some(id) => crate::network::container_classid(id),
                                    None => crate::network::container_classid(
                                        crate::network::PORTO_ROOT_CONTAINER_ID,
                                    ),
                                };
                                if let Err(e) = self.network.create_container_classes(
                                    container.id,
                                    parent_classid,
                                    &container,
                                    &self.config,
                                ) {
                                    warn!("cannot refresh classes of {}: {}", name, e);
                                }
                            }
                            _ => {}
                        }
                    }
                }
            }
            Ok(false) => {}
            Err(e) => warn!("cannot refresh network devices: {}", e),
        }
    }

    /// The event loop. Returns on SIGTERM/SIGINT; containers keep running
    /// and are reattached by the next daemon instance.
    pub fn run(self: &Arc<Daemon>) -> Result<()> {
        // orphaned container tasks must reparent to us for waitpid
        unsafe {
            libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1, 0, 0, 0);
        }

        let mut sigset = SigSet::empty();
        sigset.add(Signal::SIGCHLD);
        sigset.add(Signal::SIGTERM);
        sigset.add(Signal::SIGINT);
        sigset.add(Signal::SIGPIPE);
        sigset.thread_block().map_err(|e| Error::from(e).context("sigprocmask"))?;
        let mut signal_fd = SignalFd::with_flags(&sigset, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
            .map_err(|e| Error::from(e).context("signalfd"))?;

        let socket_path = &self.config.daemon.rpc_socket;
        if socket_path.exists() {
            let _ = std::fs::remove_file(socket_path);
        }
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(socket_path)
            .map_err(|e| Error::from(e).context(format!("bind {}", socket_path.display())))?;
        listener.set_nonblocking(true)?;
        // clients authenticate via SO_PEERCRED, the socket itself is open
        let _ = std::fs::set_permissions(
            socket_path,
            std::os::unix::fs::PermissionsExt::from_mode(0o666),
        );
        info!("listening on {}", socket_path.display());

        let mut poll = Poll::new().map_err(|e| Error::from(e).context("poll"))?;
        poll.registry()
            .register(
                &mut SourceFd(&listener.as_raw_fd()),
                TOKEN_LISTENER,
                Interest::READABLE,
            )
            .map_err(|e| Error::from(e).context("register listener"))?;
        poll.registry()
            .register(
                &mut SourceFd(&signal_fd.as_raw_fd()),
                TOKEN_SIGNALS,
                Interest::READABLE,
            )
            .map_err(|e| Error::from(e).context("register signalfd"))?;
        *self.registry.lock().unwrap() = Some(
            poll.registry()
                .try_clone()
                .map_err(|e| Error::from(e).context("clone registry"))?,
        );

        let (tx, rx) = crossbeam_channel::unbounded::<UnixStream>();
        let mut workers = vec![];
        for i in 0..self.config.daemon.workers.max(1) {
            let daemon = self.clone();
            let rx = rx.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("porto-worker-{}", i))
                    .spawn(move || {
                        for stream in rx.iter() {
                            daemon.serve_client(stream);
                        }
                    })
                    .map_err(|e| Error::from(e).context("spawn worker"))?,
            );
        }

        let mut events = Events::with_capacity(64);
        while !self.shutdown.load(Ordering::SeqCst) {
            if let Err(e) = poll.poll(&mut events, Some(Duration::from_secs(1))) {
                if e.kind() == IoErrorKind::Interrupted {
                    continue;
                }
                return Err(Error::from(e).context("poll"));
            }

            for event in events.iter() {
                match event.token() {
                    TOKEN_LISTENER => loop {
                        match listener.accept() {
                            Ok((stream, _)) => {
                                let _ = tx.send(stream);
                            }
                            Err(ref e) if e.kind() == IoErrorKind::WouldBlock => break,
                            Err(e) => {
                                warn!("accept: {}", e);
                                break;
                            }
                        }
                    },
                    TOKEN_SIGNALS => {
                        while let Ok(Some(info)) = signal_fd.read_signal() {
                            match info.ssi_signo as i32 {
                                libc::SIGCHLD => self.reap_children(),
                                libc::SIGTERM | libc::SIGINT => {
                                    info!("shutting down, containers stay running");
                                    self.shutdown.store(true, Ordering::SeqCst);
                                }
                                libc::SIGPIPE => {}
                                other => debug!("ignored signal {}", other),
                            }
                        }
                    }
                    Token(token) if token >= TOKEN_OOM_BASE => {
                        self.handle_oom_event(token)
                    }
                    Token(other) => debug!("spurious event on token {}", other),
                }
            }

            self.reap_children();
            self.aging_tick();
            self.refresh_network();
        }

        drop(tx);
        let _ = std::fs::remove_file(socket_path);
        for worker in workers {
            let _ = worker.join();
        }
        Ok(())
    }

    /// One client connection: framed requests in, framed responses out.
    fn serve_client(&self, mut stream: UnixStream) {
        let (client, client_pid) = match cred::peer_cred(stream.as_raw_fd()) {
            Ok(peer) => peer,
            Err(e) => {
                warn!("cannot resolve peer credentials: {}", e);
                return;
            }
        };
        loop {
            let request: Request = match read_frame(&mut stream) {
                Ok(Some(request)) => request,
                Ok(None) => return,
                Err(e) => {
                    debug!("client {}: {}", client_pid, e);
                    let _ = write_frame(
                        &mut stream,
                        &crate::protocol::Response::error(&Error::new(
                            ErrorKind::InvalidMethod,
                            e.text(),
                        )),
                    );
                    return;
                }
            };
            let response = rpc::dispatch(self, &client, client_pid, request);
            if write_frame(&mut stream, &response).is_err() {
                return;
            }
        }
    }
}
