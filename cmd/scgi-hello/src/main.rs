//! SCGI Hello
//!
//! Minimal SCGI application on top of the prefork dispatcher. Each worker
//! reads the request header block, logs one line and answers with a fixed
//! plain-text body.
//!
//! Usage:
//!     cargo build --release -p scgi-hello
//!     ./target/release/scgi-hello [port] [max_workers]
//!
//! Environment:
//!     SCGI_PORT, SCGI_BIND_ADDR, SCGI_MAX_WORKERS, SCGI_BACKLOG,
//!     SCGI_RETRY_INTERVAL_MS   listener and pool settings
//!     SCGI_LOG_LEVEL           0-5 or off/error/warn/info/debug/trace
//!     SCGI_HELLO_ECHO_ENV=1    append the request variables to the body
//!     SCGI_HELLO_PRESPAWN=N    start N workers before the first request
//!
//! Test behind nginx:
//!     location / { include scgi_params; scgi_pass 127.0.0.1:4000; }
//!
//! Graceful restart:
//!     kill -HUP <pid>

use scgi_core::env::{env_get, env_get_bool};
use scgi_core::{kinfo, kwarn, ConnectionHandler, RequestEnv};
use scgi_prefork::{Server, ServerConfig};

use std::io::{self, BufReader, Read, Write};
use std::net::TcpStream;

const BODY: &str = "Hello from scgi-prefork\n";

struct Hello {
    echo_env: bool,
}

impl ConnectionHandler for Hello {
    fn child_init(&mut self) {
        kinfo!("worker ready");
    }

    fn handle_connection(&mut self, conn: TcpStream) {
        if let Err(e) = self.respond(conn) {
            kwarn!("request failed: {}", e);
        }
    }
}

impl Hello {
    fn respond(&self, conn: TcpStream) -> io::Result<()> {
        let mut reader = BufReader::new(&conn);
        let env = match RequestEnv::read_from(&mut reader) {
            Ok(env) => env,
            Err(e) => {
                kwarn!("bad SCGI header: {}", e);
                return (&conn).write_all(&render("400 Bad Request", "bad request\n"));
            }
        };

        // Drain the body so the front end never sees a reset.
        io::copy(&mut (&mut reader).take(env.content_length() as u64), &mut io::sink())?;

        kinfo!(
            "{} {} {}",
            env.remote_addr().unwrap_or("-"),
            env.request_method().unwrap_or("-"),
            env.request_uri().unwrap_or("-")
        );

        let mut body = String::from(BODY);
        if self.echo_env {
            for (name, value) in env.iter() {
                body.push_str(name);
                body.push('=');
                body.push_str(value);
                body.push('\n');
            }
        }
        (&conn).write_all(&render("200 OK", &body))
    }
}

/// CGI-style response: the front end turns `Status:` into the status line.
fn render(status: &str, body: &str) -> Vec<u8> {
    let mut out = format!(
        "Status: {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n",
        status,
        body.len()
    )
    .into_bytes();
    out.extend_from_slice(body.as_bytes());
    out
}

fn main() {
    scgi_core::kprint::init();

    let args: Vec<String> = std::env::args().collect();
    let mut config = ServerConfig::from_env();
    if let Some(port) = args.get(1).and_then(|s| s.parse().ok()) {
        config = config.port(port);
    }
    if let Some(n) = args.get(2).and_then(|s| s.parse().ok()) {
        config = config.max_workers(n);
    }
    config.print();

    let handler = Hello { echo_env: env_get_bool("SCGI_HELLO_ECHO_ENV", false) };
    let mut server = match Server::new(config, handler) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("scgi-hello: {}", e);
            std::process::exit(2);
        }
    };

    let prespawn: usize = env_get("SCGI_HELLO_PRESPAWN", 0);
    for _ in 0..prespawn.min(server.config().max_workers) {
        if let Err(e) = server.dispatcher_mut().spawn_worker() {
            kwarn!("prespawn failed: {}", e);
            break;
        }
    }

    if let Err(e) = server.serve() {
        eprintln!("scgi-hello: {}", e);
        std::process::exit(1);
    }
}
