//! Worker lifecycle: spawning, tracking and reaping worker processes.
//!
//! The pool is an insertion-ordered `Vec<Worker>`, oldest first. The
//! dispatcher relies on that order to keep preferring the same workers
//! under low load, so records are only ever appended or removed in place.

use crate::channel::ControlChannel;
use crate::runtime;

use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use scgi_core::error::{Result, ScgiError};
use scgi_core::{kdebug, kinfo, kwarn, ConnectionHandler, WorkerState};

use std::os::fd::{AsRawFd, BorrowedFd, RawFd};

/// Parent-side record of one worker process.
#[derive(Debug)]
pub struct Worker {
    pid: Pid,
    channel: ControlChannel,
    state: WorkerState,
}

impl Worker {
    pub(crate) fn new(pid: Pid, channel: ControlChannel) -> Self {
        Self { pid, channel, state: WorkerState::UnknownReadiness }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn channel(&self) -> &ControlChannel {
        &self.channel
    }

    pub(crate) fn set_state(&mut self, state: WorkerState) {
        self.state = state;
    }
}

#[derive(Debug)]
pub struct WorkerPool {
    workers: Vec<Worker>,
    max_workers: usize,
}

impl WorkerPool {
    pub fn new(max_workers: usize) -> Self {
        Self { workers: Vec::with_capacity(max_workers), max_workers }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn is_full(&self) -> bool {
        self.workers.len() >= self.max_workers
    }

    pub fn iter(&self) -> impl Iterator<Item = &Worker> {
        self.workers.iter()
    }

    /// Worker pids in pool order.
    pub fn pids(&self) -> Vec<Pid> {
        self.workers.iter().map(|w| w.pid).collect()
    }

    pub fn state_of(&self, pid: Pid) -> Option<WorkerState> {
        self.workers.iter().find(|w| w.pid == pid).map(|w| w.state)
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut Worker> {
        self.workers.get_mut(index)
    }

    /// Append an already running worker.
    pub(crate) fn insert(&mut self, worker: Worker) -> Result<()> {
        if self.is_full() {
            return Err(ScgiError::PoolFull);
        }
        self.workers.push(worker);
        Ok(())
    }

    /// Fork a new worker bound to a fresh control channel.
    ///
    /// `pending` is the connection the parent is currently dispatching and
    /// `inherited` lists other parent-only descriptors (the listening
    /// socket). The child closes both, along with every sibling's
    /// parent-side channel, before entering the worker loop. Without that,
    /// a sibling's copy would keep a channel open after the parent closes
    /// it on restart.
    ///
    /// On error no record is added.
    pub fn spawn_worker<H: ConnectionHandler>(
        &mut self,
        handler: &mut H,
        pending: Option<BorrowedFd<'_>>,
        inherited: &[RawFd],
    ) -> Result<Pid> {
        if self.is_full() {
            return Err(ScgiError::PoolFull);
        }

        let (parent_end, child_end) = ControlChannel::pair()?;
        parent_end.set_nonblocking(true)?;

        // Safety: the child branch only closes descriptors and then enters
        // run_worker, which catches handler panics and always leaves
        // through _exit. Nothing unwinds back into the parent's frames.
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                drop(child_end);
                self.workers.push(Worker::new(child, parent_end));
                kdebug!("worker {} forked (pool {}/{})", child, self.len(), self.max_workers);
                Ok(child)
            }
            Ok(ForkResult::Child) => {
                drop(parent_end);
                self.workers.clear();
                if let Some(conn) = pending {
                    unsafe { libc::close(conn.as_raw_fd()) };
                }
                for &fd in inherited {
                    unsafe { libc::close(fd) };
                }
                runtime::run_worker(child_end, handler)
            }
            Err(errno) => Err(ScgiError::SpawnFailed(errno as i32)),
        }
    }

    /// Remove every worker whose process has exited.
    ///
    /// Never blocks. Exited pids without a record (workers released by a
    /// restart) are collected and ignored. Returns the number of records
    /// removed.
    pub fn reap_dead_workers(&mut self) -> usize {
        let mut removed = 0;
        loop {
            let status = match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(status) => status,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => break,
                Err(e) => {
                    kwarn!("waitpid failed: {}", e);
                    break;
                }
            };

            let pid = match status {
                WaitStatus::Exited(pid, code) => {
                    kdebug!("worker {} exited with status {}", pid, code);
                    pid
                }
                WaitStatus::Signaled(pid, sig, _) => {
                    kwarn!("worker {} killed by {:?}", pid, sig);
                    pid
                }
                _ => continue,
            };

            match self.workers.iter().position(|w| w.pid == pid) {
                Some(index) => {
                    // Dropping the record closes the parent's channel end.
                    self.workers.remove(index);
                    removed += 1;
                }
                None => kdebug!("reaped released worker {}", pid),
            }
        }
        removed
    }

    /// Close every control channel and forget all workers.
    ///
    /// Workers notice the closed channel on their next receive and exit on
    /// their own; nothing is killed. Returns the number released.
    pub fn close_all(&mut self) -> usize {
        let released = self.workers.len();
        self.workers.clear();
        if released > 0 {
            kinfo!("released {} workers", released);
        }
        released
    }
}
