use std::{
    collections::HashMap,
    os::fd::{AsRawFd, OwnedFd, RawFd},
    sync::Mutex,
    task::{ready, Context, Poll},
};

use nix::{
    errno::Errno,
    fcntl::{fcntl, FcntlArg, OFlag},
    sys::socket::{recv, MsgFlags},
};
use tokio::io::{unix::AsyncFd, Interest};
use tracing::debug;

use super::{Handle, RecvOutcome, Transport, TransportError};

/// Receives from registered sockets.
///
/// Readiness goes through the poller thread's tokio reactor, so one
/// `SocketTransport` serves one engine.
#[derive(Default)]
pub struct SocketTransport {
    sockets: Mutex<HashMap<Handle, Registered>>,
}

struct Registered {
    /// Created on first poll, from the poller's reactor, over a duplicate of
    /// `fd` so that `fd` itself can be handed back.
    readiness: Option<AsyncFd<OwnedFd>>,
    fd: OwnedFd,
}

impl SocketTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of a socket and switch it to non-blocking mode.
    /// The returned handle is the socket's fd number.
    pub fn register(&self, socket: impl Into<OwnedFd>) -> Result<Handle, TransportError> {
        let fd: OwnedFd = socket.into();
        let raw = fd.as_raw_fd();
        let flags = OFlag::from_bits_truncate(fcntl(raw, FcntlArg::F_GETFL)?);
        fcntl(raw, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
        let handle = Handle(raw);
        debug!(%handle, "registered socket");
        self.sockets.lock().unwrap().insert(
            handle,
            Registered {
                readiness: None,
                fd,
            },
        );
        Ok(handle)
    }

    /// Give the socket back. Must not be called while a receive on it is armed.
    pub fn deregister(&self, handle: Handle) -> Option<OwnedFd> {
        let Registered { readiness, fd } = self.sockets.lock().unwrap().remove(&handle)?;
        drop(readiness);
        Some(fd)
    }

    fn raw_fd(&self, handle: Handle) -> Result<RawFd, TransportError> {
        self.sockets
            .lock()
            .unwrap()
            .get(&handle)
            .map(|registered| registered.fd.as_raw_fd())
            .ok_or_else(|| TransportError::from_errno(Errno::EBADF))
    }
}

impl Transport for SocketTransport {
    fn try_receive(&self, handle: Handle, buf: &mut [u8]) -> Result<RecvOutcome, TransportError> {
        let fd = self.raw_fd(handle)?;
        loop {
            match recv(fd, buf, MsgFlags::MSG_DONTWAIT) {
                Ok(n) => return Ok(RecvOutcome::Read(n)),
                Err(Errno::EAGAIN) => return Ok(RecvOutcome::WouldBlock),
                Err(Errno::EINTR) => {}
                Err(errno) => return Err(errno.into()),
            }
        }
    }

    fn poll_receive_ready(
        &self,
        handle: Handle,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), TransportError>> {
        let mut sockets = self.sockets.lock().unwrap();
        let Some(registered) = sockets.get_mut(&handle) else {
            return Poll::Ready(Err(Errno::EBADF.into()));
        };
        let raw = registered.fd.as_raw_fd();
        let readiness = match &mut registered.readiness {
            Some(readiness) => readiness,
            slot @ None => {
                let watched = registered.fd.try_clone()?;
                slot.insert(AsyncFd::with_interest(watched, Interest::READABLE)?)
            }
        };
        loop {
            let mut guard = ready!(readiness.poll_read_ready(cx))?;
            let mut byte = [0u8; 1];
            match recv(raw, &mut byte, MsgFlags::MSG_PEEK | MsgFlags::MSG_DONTWAIT) {
                // stale readiness, re-arm
                Err(Errno::EAGAIN) => guard.clear_ready(),
                // data, EOF or an error that try_receive will report
                _ => return Poll::Ready(Ok(())),
            }
        }
    }
}
