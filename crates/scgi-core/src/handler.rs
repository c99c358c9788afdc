//! Connection handler contract.
//!
//! The handler is the application side of a worker. The dispatcher never
//! reads or writes connection bytes; once a descriptor lands in a worker,
//! the handler owns it completely.
//!
//! # Implementors
//!
//! - Any `FnMut(TcpStream)` closure.
//! - Application types that also need per-worker setup via `child_init`
//!   (database handles, caches: anything that must not be shared across fork).

use std::net::TcpStream;

/// Services connections inside a worker process.
///
/// **Contract:**
/// - `handle_connection()` is a one-shot call per connection. It must fully
///   service the request; dropping `conn` closes it.
/// - The worker does not signal readiness again until the call returns, so
///   a slow handler simply keeps its worker busy.
/// - A panic in the handler takes the worker process down; the parent reaps
///   and replaces it.
pub trait ConnectionHandler {
    /// Runs once in each freshly forked worker, before its first
    /// ready signal.
    fn child_init(&mut self) {}

    fn handle_connection(&mut self, conn: TcpStream);
}

impl<F> ConnectionHandler for F
where
    F: FnMut(TcpStream),
{
    fn handle_connection(&mut self, conn: TcpStream) {
        self(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    struct Counting {
        inits: usize,
        served: usize,
    }

    impl ConnectionHandler for Counting {
        fn child_init(&mut self) {
            self.inits += 1;
        }

        fn handle_connection(&mut self, mut conn: TcpStream) {
            let _ = conn.write_all(b"hi");
            self.served += 1;
        }
    }

    fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_closure_handler() {
        let mut seen = 0;
        {
            let mut handler = |_conn: TcpStream| seen += 1;
            let (_client, server) = loopback_pair();
            handler.child_init();
            handler.handle_connection(server);
        }
        assert_eq!(seen, 1);
    }

    #[test]
    fn test_struct_handler() {
        let mut h = Counting { inits: 0, served: 0 };
        h.child_init();
        let (mut client, server) = loopback_pair();
        h.handle_connection(server);

        let mut buf = Vec::new();
        client.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"hi");
        assert_eq!((h.inits, h.served), (1, 1));
    }
}
