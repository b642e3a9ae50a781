//! The source of inbound messages.
//!
//! The engine never reads from anything itself, it asks a [`Transport`].
//! Transports are only ever invoked from the poller thread.

use std::{
    io,
    task::{Context, Poll},
};

use nix::errno::Errno;

mod loopback;
mod socket;

pub use loopback::LoopbackTransport;
pub use socket::SocketTransport;

/// Opaque identifier of a receive endpoint, e.g. a socket fd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(pub i32);

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvOutcome {
    /// `n` bytes were copied into the buffer. `Read(0)` means the peer closed.
    Read(usize),
    /// Nothing to read right now.
    WouldBlock,
}

#[derive(Debug, thiserror::Error)]
#[error("transport error: {source}")]
pub struct TransportError {
    #[from]
    source: io::Error,
}

impl TransportError {
    pub fn from_errno(errno: Errno) -> Self {
        TransportError {
            source: io::Error::from_raw_os_error(errno as i32),
        }
    }

    /// The errno reported in the operation's completion.
    pub fn errno(&self) -> Errno {
        self.source
            .raw_os_error()
            .map(Errno::from_i32)
            .unwrap_or(Errno::EIO)
    }

    pub fn into_inner(self) -> io::Error {
        self.source
    }
}

impl From<Errno> for TransportError {
    fn from(errno: Errno) -> Self {
        TransportError::from_errno(errno)
    }
}

pub trait Transport: Send + Sync + 'static {
    /// Copy one inbound message into `buf`, truncating it to `buf.len()`.
    ///
    /// Must not block.
    fn try_receive(&self, handle: Handle, buf: &mut [u8]) -> Result<RecvOutcome, TransportError>;

    /// Resolve once a receive on `handle` may make progress (data, EOF or an
    /// error). When returning `Pending` the transport must arrange for
    /// `cx`'s waker to be woken.
    ///
    /// Spurious readiness is fine, the engine follows up with `try_receive`.
    fn poll_receive_ready(
        &self,
        handle: Handle,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), TransportError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        let err = TransportError::from_errno(Errno::ECONNRESET);
        assert_eq!(err.errno(), Errno::ECONNRESET);
        let err = TransportError::from(io::Error::new(io::ErrorKind::Other, "custom"));
        assert_eq!(err.errno(), Errno::EIO);
        assert_eq!(err.into_inner().kind(), io::ErrorKind::Other);
    }
}
