//! Listener and accept loop.
//!
//! The parent alternates strictly between accepting and dispatching: the
//! next connection is not accepted until the current one is with a worker.
//! The restart flag is checked after every accept cycle.

use crate::config::ServerConfig;
use crate::dispatcher::Dispatcher;
use crate::signal::RestartSignal;

use nix::unistd::Pid;
use scgi_core::error::{Result, ScgiError};
use scgi_core::{kerror, kinfo, ConnectionHandler};

use std::mem;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        const SOCKET_TYPE: libc::c_int = libc::SOCK_STREAM | libc::SOCK_CLOEXEC;
    } else {
        const SOCKET_TYPE: libc::c_int = libc::SOCK_STREAM;
    }
}

/// Bind and listen on `config.listen_addr()`.
pub fn bind_listener(config: &ServerConfig) -> Result<TcpListener> {
    let addr = config.listen_addr();
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    let raw = unsafe { libc::socket(domain, SOCKET_TYPE, 0) };
    if raw < 0 {
        return Err(ScgiError::last_os_error());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    cfg_if::cfg_if! {
        if #[cfg(not(any(target_os = "linux", target_os = "android")))] {
            if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
                return Err(ScgiError::last_os_error());
            }
        }
    }

    let opt: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &opt as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(ScgiError::last_os_error());
    }

    let (storage, len) = sockaddr_of(&addr);
    let ret = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
            len,
        )
    };
    if ret < 0 {
        return Err(ScgiError::last_os_error());
    }

    if unsafe { libc::listen(fd.as_raw_fd(), config.backlog) } < 0 {
        return Err(ScgiError::last_os_error());
    }

    Ok(TcpListener::from(fd))
}

fn sockaddr_of(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(a) => {
            // Safety: sockaddr_storage is large and aligned enough for any sockaddr.
            let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = a.port().to_be();
            sin.sin_addr.s_addr = u32::from_ne_bytes(a.ip().octets());
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(a) => {
            let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = a.port().to_be();
            sin6.sin6_flowinfo = a.flowinfo();
            sin6.sin6_addr.s6_addr = a.ip().octets();
            sin6.sin6_scope_id = a.scope_id();
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

/// Accept one connection. `EINTR` is returned, not retried.
///
/// `TcpListener::accept` retries `EINTR` internally, which would hide a
/// SIGHUP until the next client arrives.
fn accept_conn(listener: &TcpListener) -> Result<OwnedFd> {
    let fd = listener.as_raw_fd();
    cfg_if::cfg_if! {
        if #[cfg(any(target_os = "linux", target_os = "android"))] {
            let raw = unsafe {
                libc::accept4(fd, std::ptr::null_mut(), std::ptr::null_mut(), libc::SOCK_CLOEXEC)
            };
        } else {
            let raw = unsafe { libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut()) };
        }
    }
    if raw < 0 {
        return Err(ScgiError::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

/// Result of one accept cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// A connection was accepted and handed to this worker.
    Dispatched(Pid),
    /// `accept` was interrupted by a signal.
    Interrupted,
}

pub struct Server<H: ConnectionHandler> {
    config: ServerConfig,
    dispatcher: Dispatcher<H>,
    restart: RestartSignal,
    /// Listener currently registered with `close_in_workers`.
    listener_fd: Option<RawFd>,
}

impl<H: ConnectionHandler> Server<H> {
    pub fn new(config: ServerConfig, handler: H) -> Result<Self> {
        let dispatcher = Dispatcher::new(&config, handler)?;
        Ok(Self { config, dispatcher, restart: RestartSignal::global(), listener_fd: None })
    }

    pub fn with_restart_signal(mut self, restart: RestartSignal) -> Self {
        self.restart = restart;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Dispatcher<H> {
        &self.dispatcher
    }

    pub fn dispatcher_mut(&mut self) -> &mut Dispatcher<H> {
        &mut self.dispatcher
    }

    pub fn restart_signal(&self) -> RestartSignal {
        self.restart
    }

    /// Install the SIGHUP handler, bind, and serve until accept fails.
    pub fn serve(&mut self) -> Result<()> {
        self.restart = RestartSignal::install()?;
        let listener = bind_listener(&self.config).map_err(|e| {
            kerror!("cannot listen on {}: {}", self.config.listen_addr(), e);
            e
        })?;
        kinfo!(
            "listening on {} (max {} workers)",
            self.config.listen_addr(),
            self.config.max_workers
        );
        self.serve_on(&listener)
    }

    /// Run accept cycles on an already bound listener until one fails.
    pub fn serve_on(&mut self, listener: &TcpListener) -> Result<()> {
        loop {
            if let Err(e) = self.step(listener) {
                kerror!("accept failed: {}", e);
                return Err(e);
            }
        }
    }

    /// One accept cycle: accept, dispatch, then honor a pending restart.
    pub fn step(&mut self, listener: &TcpListener) -> Result<StepOutcome> {
        self.track_listener(listener.as_raw_fd());

        let outcome = match accept_conn(listener) {
            Ok(conn) => StepOutcome::Dispatched(self.dispatcher.dispatch(conn)),
            Err(e) if e.is_interrupted() => StepOutcome::Interrupted,
            Err(e) => return Err(e),
        };

        if self.restart.take() {
            let released = self.dispatcher.restart();
            kinfo!("restart: released {} workers", released);
        }
        Ok(outcome)
    }

    /// Make `fd` the only listener new workers close.
    fn track_listener(&mut self, fd: RawFd) {
        match self.listener_fd.replace(fd) {
            Some(old) if old == fd => return,
            Some(old) => self.dispatcher.forget_in_workers(old),
            None => {}
        }
        self.dispatcher.close_in_workers(fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{drain_children, serial};
    use std::io::{Read, Write};
    use std::net::{IpAddr, Ipv4Addr, TcpStream};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn pid_echo(mut conn: TcpStream) {
        let mut byte = [0u8; 1];
        if conn.read_exact(&mut byte).is_ok() {
            let _ = write!(conn, "{}", std::process::id());
        }
    }

    fn local_config() -> ServerConfig {
        ServerConfig::new()
            .bind_addr(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .port(0)
            .max_workers(2)
            .retry_interval(Duration::from_millis(20))
    }

    fn test_server() -> (Server<fn(TcpStream)>, TcpListener) {
        let config = local_config();
        let listener = bind_listener(&config).unwrap();
        let server = Server::new(config, pid_echo as fn(TcpStream))
            .unwrap()
            .with_restart_signal(RestartSignal::detached());
        (server, listener)
    }

    fn request(listener: &TcpListener) -> TcpStream {
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        client.write_all(b"x").unwrap();
        client
    }

    fn reply(mut client: TcpStream) -> i32 {
        let mut s = String::new();
        client.read_to_string(&mut s).unwrap();
        s.parse().unwrap()
    }

    #[test]
    fn test_bind_ephemeral_port() {
        let listener = bind_listener(&local_config()).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_eq!(addr.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn test_bind_conflict_is_error() {
        let first = bind_listener(&local_config()).unwrap();
        let port = first.local_addr().unwrap().port();
        let err = bind_listener(&local_config().port(port)).unwrap_err();
        assert_eq!(err.errno(), Some(libc::EADDRINUSE));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let err = Server::new(local_config().max_workers(0), pid_echo as fn(TcpStream))
            .err()
            .unwrap();
        assert!(matches!(err, ScgiError::Config(_)));
    }

    #[test]
    fn test_switching_listener_replaces_registration() {
        let (mut server, first) = test_server();
        let second = bind_listener(&local_config()).unwrap();

        server.track_listener(first.as_raw_fd());
        server.track_listener(first.as_raw_fd());
        assert_eq!(server.dispatcher().closed_in_workers(), &[first.as_raw_fd()]);

        server.track_listener(second.as_raw_fd());
        assert_eq!(server.dispatcher().closed_in_workers(), &[second.as_raw_fd()]);
    }

    #[test]
    fn test_step_dispatches_one_connection() {
        let _guard = serial();
        let (mut server, listener) = test_server();

        let client = request(&listener);
        let outcome = server.step(&listener).unwrap();
        let StepOutcome::Dispatched(pid) = outcome else {
            panic!("unexpected outcome {:?}", outcome);
        };
        assert_eq!(reply(client), pid.as_raw());
        assert_eq!(server.dispatcher().pool().pids(), vec![pid]);

        server.dispatcher_mut().restart();
        drain_children();
    }

    #[test]
    fn test_restart_releases_pool_after_cycle() {
        let _guard = serial();
        let (mut server, listener) = test_server();

        let client = request(&listener);
        let first = match server.step(&listener).unwrap() {
            StepOutcome::Dispatched(pid) => pid,
            other => panic!("unexpected outcome {:?}", other),
        };
        assert_eq!(reply(client), first.as_raw());

        // The pending restart is honored after the next dispatch completes.
        server.restart_signal().request();
        let client = request(&listener);
        assert_eq!(server.step(&listener).unwrap(), StepOutcome::Dispatched(first));
        assert_eq!(reply(client), first.as_raw());
        assert!(server.dispatcher().pool().is_empty());
        assert!(!server.restart_signal().is_pending());

        let client = request(&listener);
        let fresh = match server.step(&listener).unwrap() {
            StepOutcome::Dispatched(pid) => pid,
            other => panic!("unexpected outcome {:?}", other),
        };
        assert_ne!(fresh, first);
        assert_eq!(server.dispatcher().pool().pids(), vec![fresh]);
        assert_eq!(reply(client), fresh.as_raw());

        server.dispatcher_mut().restart();
        drain_children();
    }

    #[test]
    fn test_sighup_interrupts_accept() {
        let _guard = serial();
        let config = local_config();
        let listener = bind_listener(&config).unwrap();
        let mut server = Server::new(config, pid_echo as fn(TcpStream))
            .unwrap()
            .with_restart_signal(RestartSignal::install().unwrap());
        server.restart_signal().take();

        let target = unsafe { libc::pthread_self() };
        let done = Arc::new(AtomicBool::new(false));
        let signaller = {
            let done = Arc::clone(&done);
            thread::spawn(move || {
                while !done.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(50));
                    unsafe { libc::pthread_kill(target, libc::SIGHUP) };
                }
            })
        };

        let outcome = server.step(&listener).unwrap();
        done.store(true, Ordering::SeqCst);
        signaller.join().unwrap();

        assert_eq!(outcome, StepOutcome::Interrupted);
        assert!(server.dispatcher().pool().is_empty());
        server.restart_signal().take();
    }
}
