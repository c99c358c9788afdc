//! Fd-channel transport between the parent and one worker.
//!
//! A `ControlChannel` is one end of a connected `AF_UNIX` stream pair.
//! Two messages travel over it:
//!
//! ```text
//!   worker ──► parent   READY_MARKER ('1')            "I can take a connection"
//!   parent ──► worker   HANDOFF_BYTE ('\0') + SCM_RIGHTS([conn])   "here it is"
//! ```
//!
//! There is no acknowledgment of a handoff: a successful `sendmsg` is the
//! commit point. The parent's end is non-blocking so readiness polling
//! never stalls; the worker's end stays blocking.
//!
//! `SCM_RIGHTS` goes through libc directly. The message is a single
//! descriptor with a one-byte payload, small enough that hand-built
//! `msghdr`s stay readable.

use scgi_core::error::{Result, ScgiError};
use scgi_core::protocol::{HANDOFF_BYTE, READY_MARKER};

use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

const FD_SIZE: libc::c_uint = std::mem::size_of::<RawFd>() as libc::c_uint;

/// Control buffer large enough for one `SCM_RIGHTS` header with a few fds.
const CMSG_BUFFER_LEN: usize = 64;

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        // Report EPIPE instead of raising SIGPIPE; received fds get O_CLOEXEC.
        const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
        const RECV_FLAGS: libc::c_int = libc::MSG_CMSG_CLOEXEC;
    } else {
        const SEND_FLAGS: libc::c_int = 0;
        const RECV_FLAGS: libc::c_int = 0;
    }
}

/// cmsghdr-aligned control buffer.
#[repr(C)]
struct CmsgBuffer {
    _align: [libc::cmsghdr; 0],
    bytes: [u8; CMSG_BUFFER_LEN],
}

impl CmsgBuffer {
    fn new() -> Self {
        Self { _align: [], bytes: [0u8; CMSG_BUFFER_LEN] }
    }
}

/// Result of a non-blocking readiness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// One ready marker was consumed.
    Ready,
    /// Nothing to read yet (spurious wakeup or not signaled).
    NotReady,
}

#[derive(Debug)]
pub struct ControlChannel {
    stream: UnixStream,
}

impl ControlChannel {
    /// Create a connected pair of channel ends (parent, worker).
    pub fn pair() -> Result<(ControlChannel, ControlChannel)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self { stream: a }, Self { stream: b }))
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        self.stream.set_nonblocking(nonblocking)?;
        Ok(())
    }

    /// Worker side: announce readiness with exactly one marker byte.
    pub fn send_ready(&self) -> Result<()> {
        loop {
            match (&self.stream).write(&[READY_MARKER]) {
                Ok(1) => return Ok(()),
                Ok(_) => return Err(ScgiError::ShortWrite),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Parent side: consume one ready marker without blocking.
    ///
    /// EOF maps to `ChannelClosed`. A byte other than the marker means the
    /// stream is corrupt or mis-paired and is returned as
    /// `ProtocolViolation`; callers must treat it as fatal.
    pub fn try_receive_ready(&self) -> Result<Readiness> {
        let mut byte = [0u8; 1];
        loop {
            match (&self.stream).read(&mut byte) {
                Ok(0) => return Err(ScgiError::ChannelClosed),
                Ok(_) if byte[0] == READY_MARKER => return Ok(Readiness::Ready),
                Ok(_) => return Err(ScgiError::ProtocolViolation(byte[0])),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(Readiness::NotReady),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Parent side: pass `fd` to the worker.
    ///
    /// The caller keeps its own copy of `fd` and is responsible for closing
    /// it; the worker receives an independent descriptor.
    pub fn send_descriptor(&self, fd: BorrowedFd<'_>) -> Result<()> {
        let payload = [HANDOFF_BYTE];
        let mut iov = libc::iovec {
            iov_base: payload.as_ptr() as *mut libc::c_void,
            iov_len: payload.len(),
        };
        let mut cmsg = CmsgBuffer::new();
        let space = unsafe { libc::CMSG_SPACE(FD_SIZE) } as usize;
        debug_assert!(space <= CMSG_BUFFER_LEN);

        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg.bytes.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = space as _;

        unsafe {
            // Non-null: msg_controllen covers at least one cmsghdr.
            let hdr = libc::CMSG_FIRSTHDR(&msg);
            (*hdr).cmsg_level = libc::SOL_SOCKET;
            (*hdr).cmsg_type = libc::SCM_RIGHTS;
            (*hdr).cmsg_len = libc::CMSG_LEN(FD_SIZE) as _;
            std::ptr::write_unaligned(libc::CMSG_DATA(hdr) as *mut RawFd, fd.as_raw_fd());
        }

        loop {
            let sent = unsafe { libc::sendmsg(self.stream.as_raw_fd(), &msg, SEND_FLAGS) };
            if sent < 0 {
                let err = ScgiError::last_os_error();
                if err.is_interrupted() {
                    continue;
                }
                return Err(err);
            }
            if sent as usize != payload.len() {
                return Err(ScgiError::ShortWrite);
            }
            return Ok(());
        }
    }

    /// Worker side: block until the parent hands over a connection.
    pub fn receive_descriptor(&self) -> Result<OwnedFd> {
        let mut byte = [0u8; 1];
        let mut iov = libc::iovec {
            iov_base: byte.as_mut_ptr() as *mut libc::c_void,
            iov_len: byte.len(),
        };
        let mut cmsg = CmsgBuffer::new();

        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg.bytes.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = CMSG_BUFFER_LEN as _;

        let received = loop {
            let n = unsafe { libc::recvmsg(self.stream.as_raw_fd(), &mut msg, RECV_FLAGS) };
            if n < 0 {
                let err = ScgiError::last_os_error();
                if err.is_interrupted() {
                    continue;
                }
                return Err(err);
            }
            break n;
        };
        if received == 0 {
            return Err(ScgiError::ChannelClosed);
        }

        // Take ownership of every passed descriptor first so extras are
        // closed rather than leaked, whatever happens next.
        let mut fds: Vec<OwnedFd> = Vec::with_capacity(1);
        unsafe {
            let mut hdr = libc::CMSG_FIRSTHDR(&msg);
            while !hdr.is_null() {
                if (*hdr).cmsg_level == libc::SOL_SOCKET && (*hdr).cmsg_type == libc::SCM_RIGHTS {
                    let data = libc::CMSG_DATA(hdr) as *const RawFd;
                    let data_len = (*hdr).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                    for i in 0..data_len / FD_SIZE as usize {
                        let raw = std::ptr::read_unaligned(data.add(i));
                        fds.push(OwnedFd::from_raw_fd(raw));
                    }
                }
                hdr = libc::CMSG_NXTHDR(&msg, hdr);
            }
        }

        if byte[0] != HANDOFF_BYTE {
            return Err(ScgiError::ProtocolViolation(byte[0]));
        }
        if fds.len() > 1 {
            scgi_core::kwarn!("handoff carried {} descriptors, keeping the first", fds.len());
        }
        fds.into_iter().next().ok_or(ScgiError::MissingDescriptor)
    }
}

impl AsFd for ControlChannel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

impl AsRawFd for ControlChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}
