//! Shared helpers for tests that fork.
//!
//! `waitpid(-1)` collects any child of the test binary, so tests that
//! spawn workers run one at a time behind `serial()`.

use nix::errno::Errno;
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use scgi_core::kprint::{set_log_level, LogLevel};

use std::net::{TcpListener, TcpStream};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

static FORK_LOCK: Mutex<()> = Mutex::new(());

pub fn serial() -> MutexGuard<'static, ()> {
    set_log_level(LogLevel::Off);
    FORK_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn loopback_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (server, _) = listener.accept().unwrap();
    (client, server)
}

/// Block until every child of this process has exited.
pub fn drain_children() {
    loop {
        match waitpid(Pid::from_raw(-1), None) {
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(_) => break,
        }
    }
}

/// Poll `cond` every few milliseconds until it holds or `timeout` passes.
pub fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut cond: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}
