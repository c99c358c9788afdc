//! Readiness dispatcher: hands each accepted connection to one ready worker.
//!
//! # Dispatch loop
//!
//! ```text
//!            ┌──────────────────────────────────────────────────────┐
//!            ▼                                                      │
//!   poll(workers, timeout) ──none──► reap + spawn (if below max) ───┤
//!            │                                  ▲                   │
//!          first readable                       │ stale / dead      │
//!          in pool order                        │                   │
//!            ▼                                  │                   │
//!   try_receive_ready ──Ready──► send_descriptor ──Ok──► done       │
//!                                                                   │
//!   timeout: 0 on the first pass, retry_interval afterwards ────────┘
//! ```
//!
//! The first readable worker in pool order always wins, so under light
//! load the oldest workers take all the traffic and the rest stay idle.
//!
//! A successful `send_descriptor` is the only commit point: the
//! connection reaches exactly one worker. When every worker is busy and
//! the pool is full the loop simply keeps polling; the listen backlog
//! absorbs the excess.

use crate::channel::Readiness;
use crate::config::ServerConfig;
use crate::pool::WorkerPool;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use nix::unistd::Pid;
use scgi_core::error::{Result, ScgiError};
use scgi_core::{kdebug, kerror, kinfo, kwarn, ConnectionHandler, WorkerState};

use std::io::Write;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd, RawFd};

/// Retry passes a single connection may wait before a saturation warning.
pub const SATURATION_WARN_PASSES: u32 = 5;

pub struct Dispatcher<H: ConnectionHandler> {
    pool: WorkerPool,
    handler: H,
    retry_interval_ms: u16,
    /// Parent-only descriptors every new worker closes after fork.
    inherited: Vec<RawFd>,
}

impl<H: ConnectionHandler> Dispatcher<H> {
    /// Build an empty dispatcher. Fails with `ScgiError::Config` when the
    /// config does not validate.
    pub fn new(config: &ServerConfig, handler: H) -> Result<Self> {
        config.validate()?;
        let retry_interval_ms = u16::try_from(config.retry_interval.as_millis())
            .unwrap_or(u16::MAX)
            .max(1);
        Ok(Self {
            pool: WorkerPool::new(config.max_workers),
            handler,
            retry_interval_ms,
            inherited: Vec::new(),
        })
    }

    /// Register a descriptor that workers must not keep open.
    pub fn close_in_workers(&mut self, fd: RawFd) {
        if !self.inherited.contains(&fd) {
            self.inherited.push(fd);
        }
    }

    /// Undo `close_in_workers`. Workers forked afterwards keep `fd`.
    pub fn forget_in_workers(&mut self, fd: RawFd) {
        self.inherited.retain(|&registered| registered != fd);
    }

    /// Descriptors new workers close after fork.
    pub fn closed_in_workers(&self) -> &[RawFd] {
        &self.inherited
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut WorkerPool {
        &mut self.pool
    }

    /// Start a worker ahead of demand.
    pub fn spawn_worker(&mut self) -> Result<Pid> {
        self.pool.spawn_worker(&mut self.handler, None, &self.inherited)
    }

    /// Release every worker. See `WorkerPool::close_all`.
    pub fn restart(&mut self) -> usize {
        self.pool.close_all()
    }

    /// Delegate `conn` to exactly one worker and return its pid.
    ///
    /// Blocks until some worker takes the connection. The parent's copy of
    /// `conn` is closed on return. Transport invariant violations abort
    /// the process.
    pub fn dispatch(&mut self, conn: OwnedFd) -> Pid {
        match self.try_dispatch(conn.as_fd()) {
            Ok(pid) => pid,
            Err(e) => fatal(e),
        }
    }

    /// Dispatch loop. Every `Err` returned is a fatal condition.
    pub fn try_dispatch(&mut self, conn: BorrowedFd<'_>) -> Result<Pid> {
        let mut timeout_ms = 0u16;
        let mut passes = 0u32;
        loop {
            if let Some(index) = self.poll_first_ready(timeout_ms)? {
                if let Some(pid) = self.offer(index, conn)? {
                    return Ok(pid);
                }
            }

            self.recover(conn);
            timeout_ms = self.retry_interval_ms;
            passes += 1;
            if passes == SATURATION_WARN_PASSES {
                kwarn!(
                    "connection still waiting for a worker ({} of {} workers, all busy)",
                    self.pool.len(),
                    self.pool.max_workers()
                );
            }
        }
    }

    /// Index of the first worker in pool order with a readable channel.
    fn poll_first_ready(&self, timeout_ms: u16) -> Result<Option<usize>> {
        let candidates: Vec<usize> = self
            .pool
            .iter()
            .enumerate()
            .filter(|(_, w)| w.state().is_pollable())
            .map(|(i, _)| i)
            .collect();
        let mut fds: Vec<PollFd<'_>> = self
            .pool
            .iter()
            .filter(|w| w.state().is_pollable())
            .map(|w| PollFd::new(w.channel().as_fd(), PollFlags::POLLIN))
            .collect();

        loop {
            match poll(&mut fds, timeout_ms) {
                Ok(0) => return Ok(None),
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(ScgiError::from_errno(e as i32)),
            }
        }

        let first = fds
            .iter()
            .position(|pfd| pfd.revents().map_or(false, |r| !r.is_empty()));
        Ok(first.map(|i| candidates[i]))
    }

    /// Try to hand `conn` to the worker at `index`.
    ///
    /// `Ok(None)` means this worker could not take it (spurious wakeup or
    /// a dying worker); the caller runs a recovery pass and polls again.
    fn offer(&mut self, index: usize, conn: BorrowedFd<'_>) -> Result<Option<Pid>> {
        let Some(worker) = self.pool.get_mut(index) else {
            return Ok(None);
        };
        let pid = worker.pid();

        match worker.channel().try_receive_ready() {
            Ok(Readiness::Ready) => worker.set_state(WorkerState::Ready),
            Ok(Readiness::NotReady) => return Ok(None),
            Err(e @ ScgiError::ProtocolViolation(_)) => {
                kerror!("worker {}: {}", pid, e);
                return Err(e);
            }
            Err(e) => {
                kdebug!("worker {} channel failed: {}", pid, e);
                worker.set_state(WorkerState::Dead);
                return Ok(None);
            }
        }

        debug_assert!(worker.state().accepts_handoff());
        match worker.channel().send_descriptor(conn) {
            Ok(()) => {
                worker.set_state(WorkerState::Busy);
                Ok(Some(pid))
            }
            Err(e) if e.is_peer_gone() => {
                kdebug!("worker {} went away before handoff: {}", pid, e);
                worker.set_state(WorkerState::Dead);
                Ok(None)
            }
            Err(e) => {
                kerror!("handoff to worker {} failed: {}", pid, e);
                Err(e)
            }
        }
    }

    /// Reap exited workers and grow the pool if there is room.
    fn recover(&mut self, conn: BorrowedFd<'_>) {
        self.pool.reap_dead_workers();
        if self.pool.is_full() {
            return;
        }
        match self.pool.spawn_worker(&mut self.handler, Some(conn), &self.inherited) {
            Ok(pid) => kinfo!(
                "worker {} spawned (pool {}/{})",
                pid,
                self.pool.len(),
                self.pool.max_workers()
            ),
            Err(e) => kwarn!("failed to spawn worker: {}", e),
        }
    }
}

fn fatal(err: ScgiError) -> ! {
    kerror!("fatal dispatch error: {}", err);
    let _ = std::io::stderr().flush();
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ControlChannel;
    use crate::pool::Worker;
    use crate::test_support::{drain_children, loopback_pair, serial, wait_until};
    use nix::unistd::{fork, ForkResult};
    use std::io::Read;
    use std::net::TcpStream;
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    /// Reads one byte, then replies with the worker's process id.
    fn pid_echo(mut conn: TcpStream) {
        let mut byte = [0u8; 1];
        if conn.read_exact(&mut byte).is_ok() {
            let _ = write!(conn, "{}", std::process::id());
        }
    }

    fn test_dispatcher(max_workers: usize) -> Dispatcher<fn(TcpStream)> {
        let config = ServerConfig::new()
            .max_workers(max_workers)
            .retry_interval(Duration::from_millis(20));
        Dispatcher::new(&config, pid_echo as fn(TcpStream)).unwrap()
    }

    /// Connected client that has already sent its request byte.
    fn eager_client() -> (TcpStream, OwnedFd) {
        let (mut client, server) = loopback_pair();
        client.write_all(b"x").unwrap();
        (client, OwnedFd::from(server))
    }

    fn reply(mut client: TcpStream) -> i32 {
        let mut s = String::new();
        client.read_to_string(&mut s).unwrap();
        s.parse().unwrap()
    }

    fn channel_events(channel: &ControlChannel) -> PollFlags {
        let mut fds = [PollFd::new(channel.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, 0u16) {
            Ok(n) if n > 0 => fds[0].revents().unwrap_or(PollFlags::empty()),
            _ => PollFlags::empty(),
        }
    }

    /// Fork a stand-in worker that runs `body` on its channel end and exits.
    fn scripted_worker(body: fn(ControlChannel)) -> (Pid, ControlChannel) {
        let (parent_end, child_end) = ControlChannel::pair().unwrap();
        parent_end.set_nonblocking(true).unwrap();
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                drop(parent_end);
                body(child_end);
                unsafe { libc::_exit(0) }
            }
            ForkResult::Parent { child } => {
                drop(child_end);
                (child, parent_end)
            }
        }
    }

    fn shutdown<H: ConnectionHandler>(dispatcher: &mut Dispatcher<H>) {
        dispatcher.restart();
        drain_children();
    }

    #[test]
    fn test_first_dispatch_spawns_and_delegates() {
        let _guard = serial();
        let mut dispatcher = test_dispatcher(4);

        let (client, conn) = eager_client();
        let pid = dispatcher.dispatch(conn);

        assert_eq!(dispatcher.pool().pids(), vec![pid]);
        assert_eq!(dispatcher.pool().state_of(pid), Some(WorkerState::Busy));
        assert_eq!(reply(client), pid.as_raw());

        shutdown(&mut dispatcher);
    }

    #[test]
    fn test_single_worker_serializes_connections() {
        let _guard = serial();
        let mut dispatcher = test_dispatcher(1);

        let (first_client, conn) = eager_client();
        let first = dispatcher.dispatch(conn);
        let (second_client, conn) = eager_client();
        let second = dispatcher.dispatch(conn);

        assert_eq!(first, second);
        assert_eq!(dispatcher.pool().len(), 1);
        assert_eq!(reply(first_client), first.as_raw());
        assert_eq!(reply(second_client), first.as_raw());

        shutdown(&mut dispatcher);
    }

    #[test]
    fn test_worker_dying_after_ready_is_replaced() {
        let _guard = serial();
        let mut dispatcher = test_dispatcher(2);

        // A worker that signals ready and exits before taking anything.
        let (crashed, parent_end) = scripted_worker(|channel| {
            let _ = channel.send_ready();
        });
        assert!(wait_until(Duration::from_secs(5), || {
            channel_events(&parent_end).contains(PollFlags::POLLHUP)
        }));
        dispatcher
            .pool_mut()
            .insert(Worker::new(crashed, parent_end))
            .unwrap();

        let (client, conn) = eager_client();
        let pid = dispatcher.dispatch(conn);

        assert_ne!(pid, crashed);
        assert!(!dispatcher.pool().pids().contains(&crashed));
        assert_eq!(reply(client), pid.as_raw());

        shutdown(&mut dispatcher);
    }

    #[test]
    fn test_unexpected_marker_is_fatal() {
        let _guard = serial();
        let mut dispatcher = test_dispatcher(2);

        let (rogue, parent_end) = scripted_worker(|channel| {
            let raw = channel.as_fd().try_clone_to_owned().unwrap();
            let _ = UnixStream::from(raw).write_all(b"x");
        });
        assert!(wait_until(Duration::from_secs(5), || {
            channel_events(&parent_end).contains(PollFlags::POLLIN)
        }));
        dispatcher
            .pool_mut()
            .insert(Worker::new(rogue, parent_end))
            .unwrap();

        let (_client, conn) = eager_client();
        let err = dispatcher.try_dispatch(conn.as_fd()).unwrap_err();

        assert!(matches!(err, ScgiError::ProtocolViolation(b'x')));
        assert_eq!(dispatcher.pool().pids(), vec![rogue]);
        assert_eq!(dispatcher.pool().state_of(rogue), Some(WorkerState::UnknownReadiness));

        shutdown(&mut dispatcher);
    }

    #[test]
    fn test_unexpected_send_error_is_fatal() {
        let _guard = serial();
        let mut dispatcher = test_dispatcher(2);

        // Ready, then parked until its channel closes.
        let (pid, parent_end) = scripted_worker(|channel| {
            let _ = channel.send_ready();
            let _ = channel.receive_descriptor();
        });
        assert!(wait_until(Duration::from_secs(5), || {
            channel_events(&parent_end).contains(PollFlags::POLLIN)
        }));
        dispatcher
            .pool_mut()
            .insert(Worker::new(pid, parent_end))
            .unwrap();

        // Far above any open descriptor, so SCM_RIGHTS fails with EBADF.
        let bogus = unsafe { BorrowedFd::borrow_raw(libc::c_int::MAX - 1) };
        let err = dispatcher.try_dispatch(bogus).unwrap_err();

        assert_eq!(err.errno(), Some(libc::EBADF));
        assert!(!err.is_peer_gone());
        assert_eq!(dispatcher.pool().pids(), vec![pid]);
        assert_eq!(dispatcher.pool().state_of(pid), Some(WorkerState::Ready));

        shutdown(&mut dispatcher);
    }

    #[test]
    fn test_low_load_prefers_oldest_worker() {
        let _guard = serial();
        let mut dispatcher = test_dispatcher(3);
        let oldest = dispatcher.spawn_worker().unwrap();
        let younger = dispatcher.spawn_worker().unwrap();
        assert_eq!(dispatcher.pool().pids(), vec![oldest, younger]);

        let channel_readable = |d: &Dispatcher<fn(TcpStream)>, pid: Pid| {
            d.pool()
                .iter()
                .find(|w| w.pid() == pid)
                .map_or(false, |w| channel_events(w.channel()).contains(PollFlags::POLLIN))
        };

        // The younger worker's marker is never consumed, so both channels
        // stay readable whenever the oldest has re-signaled.
        for _ in 0..3 {
            assert!(wait_until(Duration::from_secs(5), || {
                channel_readable(&dispatcher, oldest) && channel_readable(&dispatcher, younger)
            }));

            let (client, conn) = eager_client();
            let pid = dispatcher.dispatch(conn);
            assert_eq!(pid, oldest);
            assert_eq!(reply(client), oldest.as_raw());
        }
        assert_eq!(dispatcher.pool().len(), 2);

        shutdown(&mut dispatcher);
    }

    #[test]
    fn test_burst_stays_within_capacity() {
        let _guard = serial();
        let mut dispatcher = test_dispatcher(3);

        let mut delegated = Vec::new();
        for _ in 0..8 {
            let (client, conn) = eager_client();
            let pid = dispatcher.dispatch(conn);
            assert!(dispatcher.pool().len() <= 3);
            assert!(dispatcher.pool().pids().contains(&pid));
            delegated.push((client, pid));
        }

        for (client, pid) in delegated {
            assert_eq!(reply(client), pid.as_raw());
        }

        shutdown(&mut dispatcher);
    }

    #[test]
    fn test_close_in_workers_deduplicates() {
        let mut dispatcher = test_dispatcher(1);
        dispatcher.close_in_workers(7);
        dispatcher.close_in_workers(7);
        dispatcher.close_in_workers(9);
        assert_eq!(dispatcher.closed_in_workers(), &[7, 9]);

        dispatcher.forget_in_workers(7);
        dispatcher.forget_in_workers(11);
        assert_eq!(dispatcher.closed_in_workers(), &[9]);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = ServerConfig::new().max_workers(0);
        let err = Dispatcher::new(&config, pid_echo as fn(TcpStream)).err().unwrap();
        assert!(matches!(err, ScgiError::Config(_)));
    }
}
