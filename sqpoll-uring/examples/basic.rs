use std::{os::unix::net::UnixDatagram, sync::Arc, time::Duration};

use sqpoll_uring::{
    CompletionError, Engine, EngineConfig, ProvidedBufferPool, SocketTransport, SubmissionEntry,
};

const RECV_TAG: u64 = 1;
const CANCEL_TAG: u64 = 2;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_file(true)
        .with_line_number(true)
        .init();
    tracing::info!("starting");

    let transport = Arc::new(SocketTransport::new());
    let (tx, rx) = UnixDatagram::pair().unwrap();
    let handle = transport.register(rx).unwrap();

    let config = EngineConfig::default().sq_thread_idle(Duration::from_millis(10));
    let mut engine = Engine::launch(config, transport.clone()).unwrap();
    let (mut pool, selector) = ProvidedBufferPool::new(7, 4, 1024).unwrap();
    pool.provide_all().unwrap();
    engine.register_buffers(selector).unwrap();

    engine
        .submit(SubmissionEntry::recv_multishot(handle, 7).user_tag(RECV_TAG))
        .unwrap();
    for msg in [&b"one"[..], b"two", b"three"] {
        tx.send(msg).unwrap();
    }

    let mut received = Vec::new();
    while received.len() < 3 {
        engine.wait_completions(1).await.unwrap();
        while let Some(cqe) = engine.next_completion() {
            assert!(cqe.is_more());
            received.push(String::from_utf8_lossy(pool.buffer(&cqe).unwrap()).into_owned());
            pool.release(cqe.buffer_id.unwrap()).unwrap();
        }
    }
    tracing::info!(?received, "received");
    assert_eq!(received, ["one", "two", "three"]);

    engine
        .submit(SubmissionEntry::async_cancel(RECV_TAG).user_tag(CANCEL_TAG))
        .unwrap();
    engine.wait_completions(2).await.unwrap();
    let canceled = engine.next_completion().unwrap();
    assert_eq!(canceled.user_tag, RECV_TAG);
    assert_eq!(canceled.outcome(), Err(CompletionError::Canceled));
    let cancel = engine.next_completion().unwrap();
    assert_eq!(cancel.user_tag, CANCEL_TAG);
    assert_eq!(cancel.outcome(), Ok(0));

    tracing::info!(metrics = ?engine.metrics(), "done");
    engine.shutdown();
}
