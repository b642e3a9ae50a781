use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicI32, Ordering},
        Mutex,
    },
    task::{Context, Poll, Waker},
};

use nix::errno::Errno;
use tracing::trace;

use super::{Handle, RecvOutcome, Transport, TransportError};

/// In-memory message transport.
///
/// Each handle owns a FIFO of whole messages. Messages that arrive while no
/// receive is armed simply stay queued.
#[derive(Default)]
pub struct LoopbackTransport {
    endpoints: Mutex<HashMap<Handle, Endpoint>>,
    next_handle: AtomicI32,
}

#[derive(Default)]
struct Endpoint {
    queue: VecDeque<Vec<u8>>,
    closed: bool,
    error: Option<Errno>,
    waker: Option<Waker>,
}

impl Endpoint {
    fn is_ready(&self) -> bool {
        self.error.is_some() || self.closed || !self.queue.is_empty()
    }
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new endpoint.
    pub fn open(&self) -> Handle {
        let handle = Handle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.endpoints
            .lock()
            .unwrap()
            .insert(handle, Endpoint::default());
        handle
    }

    /// Queue one message for `handle`.
    ///
    /// Empty messages are rejected with `EINVAL`: a zero-length receive
    /// means end of stream.
    pub fn send(&self, handle: Handle, message: &[u8]) -> Result<(), TransportError> {
        if message.is_empty() {
            return Err(TransportError::from_errno(Errno::EINVAL));
        }
        self.update(handle, |endpoint| {
            if endpoint.closed {
                return Err(TransportError::from_errno(Errno::EPIPE));
            }
            endpoint.queue.push_back(message.to_vec());
            Ok(())
        })?
    }

    /// Mark `handle` as closed by the peer. Queued messages are still
    /// delivered, after them receives report end of stream.
    pub fn close(&self, handle: Handle) -> Result<(), TransportError> {
        self.update(handle, |endpoint| endpoint.closed = true)
    }

    /// Make the next receive on `handle` fail with `errno`.
    pub fn fail(&self, handle: Handle, errno: Errno) -> Result<(), TransportError> {
        self.update(handle, |endpoint| endpoint.error = Some(errno))
    }

    /// Number of messages queued on `handle` and not received yet.
    pub fn queued(&self, handle: Handle) -> usize {
        self.endpoints
            .lock()
            .unwrap()
            .get(&handle)
            .map_or(0, |endpoint| endpoint.queue.len())
    }

    fn update<R>(
        &self,
        handle: Handle,
        f: impl FnOnce(&mut Endpoint) -> R,
    ) -> Result<R, TransportError> {
        let (ret, waker) = {
            let mut endpoints = self.endpoints.lock().unwrap();
            let endpoint = endpoints
                .get_mut(&handle)
                .ok_or_else(|| TransportError::from_errno(Errno::EBADF))?;
            let ret = f(endpoint);
            let waker = if endpoint.is_ready() {
                endpoint.waker.take()
            } else {
                None
            };
            (ret, waker)
        };
        // wake outside the lock
        if let Some(waker) = waker {
            waker.wake();
        }
        Ok(ret)
    }
}

impl Transport for LoopbackTransport {
    fn try_receive(&self, handle: Handle, buf: &mut [u8]) -> Result<RecvOutcome, TransportError> {
        let mut endpoints = self.endpoints.lock().unwrap();
        let endpoint = endpoints
            .get_mut(&handle)
            .ok_or_else(|| TransportError::from_errno(Errno::EBADF))?;
        if let Some(errno) = endpoint.error.take() {
            return Err(TransportError::from_errno(errno));
        }
        match endpoint.queue.pop_front() {
            Some(message) => {
                let n = message.len().min(buf.len());
                buf[..n].copy_from_slice(&message[..n]);
                trace!(%handle, len = message.len(), n, "loopback receive");
                Ok(RecvOutcome::Read(n))
            }
            None if endpoint.closed => Ok(RecvOutcome::Read(0)),
            None => Ok(RecvOutcome::WouldBlock),
        }
    }

    fn poll_receive_ready(
        &self,
        handle: Handle,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), TransportError>> {
        let mut endpoints = self.endpoints.lock().unwrap();
        let Some(endpoint) = endpoints.get_mut(&handle) else {
            return Poll::Ready(Err(TransportError::from_errno(Errno::EBADF)));
        };
        if endpoint.is_ready() {
            return Poll::Ready(Ok(()));
        }
        match &mut endpoint.waker {
            Some(waker) if waker.will_wake(cx.waker()) => {}
            slot => *slot = Some(cx.waker().clone()),
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use std::{future::poll_fn, sync::Arc};

    use super::*;

    #[test]
    fn messages_are_fifo_and_truncated() {
        let transport = LoopbackTransport::new();
        let h = transport.open();
        transport.send(h, b"hello").unwrap();
        transport.send(h, b"x").unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(transport.try_receive(h, &mut buf).unwrap(), RecvOutcome::Read(3));
        assert_eq!(&buf, b"hel");
        assert_eq!(transport.try_receive(h, &mut buf).unwrap(), RecvOutcome::Read(1));
        assert_eq!(
            transport.try_receive(h, &mut buf).unwrap(),
            RecvOutcome::WouldBlock
        );
    }

    #[test]
    fn close_and_fail() {
        let transport = LoopbackTransport::new();
        let h = transport.open();
        transport.send(h, b"a").unwrap();
        transport.close(h).unwrap();
        assert_eq!(
            transport.send(h, b"b").unwrap_err().errno(),
            Errno::EPIPE
        );
        let mut buf = [0u8; 8];
        assert_eq!(transport.try_receive(h, &mut buf).unwrap(), RecvOutcome::Read(1));
        assert_eq!(transport.try_receive(h, &mut buf).unwrap(), RecvOutcome::Read(0));

        let h2 = transport.open();
        assert_eq!(transport.send(h2, b"").unwrap_err().errno(), Errno::EINVAL);
        transport.fail(h2, Errno::ECONNRESET).unwrap();
        assert_eq!(
            transport.try_receive(h2, &mut buf).unwrap_err().errno(),
            Errno::ECONNRESET
        );
        assert_eq!(
            transport.try_receive(Handle(-1), &mut buf).unwrap_err().errno(),
            Errno::EBADF
        );
    }

    #[tokio::test]
    async fn send_wakes_readiness() {
        let transport = Arc::new(LoopbackTransport::new());
        let h = transport.open();
        let sender = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                transport.send(h, b"ping").unwrap();
            })
        };
        poll_fn(|cx| transport.poll_receive_ready(h, cx))
            .await
            .unwrap();
        assert_eq!(transport.queued(h), 1);
        sender.await.unwrap();
    }
}
