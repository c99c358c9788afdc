//! Error types for the dispatcher, its workers and the SCGI header reader.

use std::fmt;

/// Result type for dispatcher operations
pub type Result<T> = std::result::Result<T, ScgiError>;

#[derive(Debug)]
pub enum ScgiError {
    /// Peer end of a control channel is gone (EOF on read).
    ChannelClosed,

    /// A byte other than the ready marker arrived on a control channel.
    ProtocolViolation(u8),

    /// A handoff message arrived without an `SCM_RIGHTS` descriptor.
    MissingDescriptor,

    /// `sendmsg`/`write` accepted fewer bytes than the message holds.
    ShortWrite,

    /// Pool is already at `max_workers`.
    PoolFull,

    /// fork() failed with errno.
    SpawnFailed(i32),

    /// Invalid configuration value.
    Config(&'static str),

    /// OS error with errno.
    Os(i32),
}

impl ScgiError {
    /// Capture `errno` from the last failed libc call.
    pub fn last_os_error() -> Self {
        Self::Os(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
    }

    /// Wrap an errno value reported by a syscall wrapper.
    pub fn from_errno(errno: i32) -> Self {
        Self::Os(errno)
    }

    /// Errno carried by this error, if any.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::Os(e) | Self::SpawnFailed(e) => Some(*e),
            _ => None,
        }
    }

    /// True when the other end of a control channel has gone away.
    ///
    /// These are the expected races with worker death; everything else
    /// seen on a control channel is a transport bug.
    pub fn is_peer_gone(&self) -> bool {
        match self {
            Self::ChannelClosed => true,
            Self::Os(e) => matches!(*e, libc::EPIPE | libc::ECONNRESET | libc::ENOTCONN),
            _ => false,
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Os(libc::EINTR))
    }
}

impl fmt::Display for ScgiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChannelClosed => write!(f, "control channel closed"),
            Self::ProtocolViolation(b) => {
                write!(f, "protocol violation: unexpected byte 0x{:02x} on control channel", b)
            }
            Self::MissingDescriptor => write!(f, "handoff message carried no descriptor"),
            Self::ShortWrite => write!(f, "short write on control channel"),
            Self::PoolFull => write!(f, "worker pool is full"),
            Self::SpawnFailed(e) => {
                write!(f, "worker spawn failed: {}", std::io::Error::from_raw_os_error(*e))
            }
            Self::Config(msg) => write!(f, "invalid config: {}", msg),
            Self::Os(e) => write!(f, "OS error: {}", std::io::Error::from_raw_os_error(*e)),
        }
    }
}

impl std::error::Error for ScgiError {}

impl From<std::io::Error> for ScgiError {
    fn from(e: std::io::Error) -> Self {
        match e.raw_os_error() {
            Some(errno) => Self::Os(errno),
            None if e.kind() == std::io::ErrorKind::UnexpectedEof => Self::ChannelClosed,
            None if e.kind() == std::io::ErrorKind::WriteZero => Self::ShortWrite,
            None => Self::Os(libc::EIO),
        }
    }
}

/// Errors from reading an SCGI request header block.
#[derive(Debug)]
pub enum HeaderError {
    /// Underlying read failed or hit EOF early.
    Io(std::io::Error),
    /// Netstring length prefix is missing, not decimal, or has a leading zero.
    BadLength,
    /// Header block exceeds the configured maximum.
    TooLarge(usize),
    /// Header block is not terminated by ','.
    MissingComma,
    /// Name/value pairs are not NUL-terminated pairs.
    Malformed(&'static str),
    /// First header is not `CONTENT_LENGTH` or its value is not decimal.
    BadContentLength,
    /// `SCGI` header is absent or not "1".
    BadVersion,
}

impl fmt::Display for HeaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "header read failed: {}", e),
            Self::BadLength => write!(f, "bad netstring length"),
            Self::TooLarge(n) => write!(f, "header block too large: {} bytes", n),
            Self::MissingComma => write!(f, "header netstring not terminated by ','"),
            Self::Malformed(why) => write!(f, "malformed header block: {}", why),
            Self::BadContentLength => write!(f, "first header must be a decimal CONTENT_LENGTH"),
            Self::BadVersion => write!(f, "missing or unsupported SCGI version"),
        }
    }
}

impl std::error::Error for HeaderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for HeaderError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
