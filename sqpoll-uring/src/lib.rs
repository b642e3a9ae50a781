//! A completion-queue receive engine with a polling submission thread,
//! provided buffer rings, and multishot receives, modeled on io_uring's
//! `IORING_SETUP_SQPOLL`, `IORING_REGISTER_PBUF_RING` and
//! `IORING_RECV_MULTISHOT`.
//!
//! # Usage
//!
//! 1. Create a [`ProvidedBufferPool`] for a buffer group and register its
//!    [`BufferSelector`] with a launched [`Engine`].
//! 2. Submit a [`SubmissionEntry::recv_multishot`] for a transport [`Handle`].
//!    The engine's poller thread picks it up without further signalling.
//! 3. Read [`CompletionEntry`]s. Each one with [`CqeFlags::BUFFER`] names a
//!    buffer that now belongs to the application: read it through the pool
//!    and [`release`](ProvidedBufferPool::release) it when done.
//! 4. A completion without [`CqeFlags::MORE`] ends the operation.
//!
//! ```rust
//! use std::{sync::Arc, time::Duration};
//! use sqpoll_uring::{Engine, EngineConfig, LoopbackTransport, ProvidedBufferPool, SubmissionEntry};
//!
//! #[tokio::main]
//! async fn main() {
//!     let transport = Arc::new(LoopbackTransport::new());
//!     let handle = transport.open();
//!     let config = EngineConfig::default().sq_thread_idle(Duration::from_millis(50));
//!     let mut engine = Engine::launch(config, transport.clone()).unwrap();
//!
//!     let (mut pool, selector) = ProvidedBufferPool::new(0, 2, 2048).unwrap();
//!     pool.provide_all().unwrap();
//!     engine.register_buffers(selector).unwrap();
//!
//!     engine.submit(SubmissionEntry::recv_multishot(handle, 0).user_tag(1)).unwrap();
//!     transport.send(handle, b"hello").unwrap();
//!
//!     engine.wait_completions(1).await.unwrap();
//!     let cqe = engine.next_completion().unwrap();
//!     assert!(cqe.is_more());
//!     assert_eq!(pool.buffer(&cqe).unwrap(), b"hello");
//!     pool.release(cqe.buffer_id.unwrap()).unwrap();
//!     engine.shutdown();
//! }
//! ```

pub mod buf_ring;
pub mod config;
pub mod metrics;
mod ops;
pub mod ring;
mod system;
pub mod transport;

pub use buf_ring::{BufferDescriptor, BufferSelector, PoolError, ProvidedBufferPool};
pub use config::{ConfigError, EngineConfig, OverflowPolicy};
pub use system::completion::{CompletionEntry, CompletionError, CqeBatch, CqeFlags};
pub use system::lifecycle::{Engine, LaunchError, SystemError};
pub use system::sq_flags;
pub use system::submission::{Opcode, SqeFlags, SubmissionEntry, SubmitError};
pub use transport::{
    Handle, LoopbackTransport, RecvOutcome, SocketTransport, Transport, TransportError,
};

#[doc(hidden)]
pub mod env_tunables {
    pub(crate) static SQ_THREAD_IDLE_MS: once_cell::sync::Lazy<u64> =
        once_cell::sync::Lazy::new(|| parse("SQPOLL_URING_SQ_THREAD_IDLE_MS", 1000));
    pub(crate) static SQ_ENTRIES: once_cell::sync::Lazy<u32> = once_cell::sync::Lazy::new(|| {
        parse("SQPOLL_URING_SQ_ENTRIES", crate::system::RING_SIZE)
    });

    fn parse<T: std::str::FromStr>(var: &str, default: T) -> T {
        match std::env::var(var) {
            Ok(v) => v
                .parse()
                .unwrap_or_else(|_| panic!("{var} must be an unsigned integer, got {v:?}")),
            Err(std::env::VarError::NotPresent) => default,
            Err(std::env::VarError::NotUnicode(_)) => panic!("{var} must be a unicode string"),
        }
    }

    pub fn assert_no_unknown_env_vars() {
        std::env::vars()
            .filter_map(|(v, _)| {
                if v.starts_with("SQPOLL_URING_") {
                    Some(v)
                } else {
                    None
                }
            })
            .for_each(|v| match v.as_str() {
                "SQPOLL_URING_SQ_THREAD_IDLE_MS" | "SQPOLL_URING_SQ_ENTRIES" => {}
                x => panic!("env var starts with SQPOLL_URING but is not an env_tunable: {x:?}"),
            });
    }
}
