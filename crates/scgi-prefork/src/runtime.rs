//! Worker runtime loop.
//!
//! Runs in the forked child. The loop is strictly sequential:
//!
//! ```text
//! child_init ──► send_ready ──► receive_descriptor ──► handle_connection ─┐
//!                    ▲                                                    │
//!                    └────────────────────────────────────────────────────┘
//! ```
//!
//! A worker never holds more than one connection and never signals
//! readiness while it is servicing one. A panic in the handler ends the
//! worker process; it never unwinds past `run_worker`.

use crate::channel::ControlChannel;

use scgi_core::error::ScgiError;
use scgi_core::{kdebug, kerror, ConnectionHandler};

use std::any::Any;
use std::io::Write;
use std::net::TcpStream;
use std::panic::{self, AssertUnwindSafe};

/// Serve connections until the control channel fails.
///
/// Returns the error that ended the loop. `ChannelClosed` is the normal
/// way out: the parent released this worker or went away.
pub fn serve_connections<H: ConnectionHandler>(
    channel: &ControlChannel,
    handler: &mut H,
) -> ScgiError {
    handler.child_init();
    loop {
        if let Err(e) = channel.send_ready() {
            return e;
        }
        let fd = match channel.receive_descriptor() {
            Ok(fd) => fd,
            Err(e) => return e,
        };
        handler.handle_connection(TcpStream::from(fd));
    }
}

/// Worker process entry point. Never returns.
///
/// Exits through `_exit` so the forked copy of the parent's state (atexit
/// handlers, buffered stdio) is not run or flushed twice. Handler panics are
/// caught here and exit with status 1.
pub fn run_worker<H: ConnectionHandler>(channel: ControlChannel, handler: &mut H) -> ! {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| serve_connections(&channel, handler)));
    let code = match outcome {
        Ok(err) if err.is_peer_gone() => {
            kdebug!("control channel closed, exiting");
            0
        }
        Ok(err) => {
            kerror!("worker loop failed: {}", err);
            1
        }
        Err(payload) => {
            kerror!("worker panicked: {}", panic_message(payload.as_ref()));
            1
        }
    };
    drop(channel);
    let _ = std::io::stdout().flush();
    unsafe { libc::_exit(code) }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string payload"
    }
}
