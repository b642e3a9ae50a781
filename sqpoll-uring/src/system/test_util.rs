use std::{sync::Arc, time::Duration};

use crate::{CompletionEntry, Engine, EngineConfig, ProvidedBufferPool, Transport};

/// Upper bound for anything a test waits on.
pub(crate) const TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub(crate) fn launch(config: EngineConfig, transport: Arc<dyn Transport>) -> Engine {
    init_tracing();
    Engine::launch(config, transport).unwrap()
}

/// Register a fully provided group of `count` buffers of `len` bytes.
pub(crate) fn provide(engine: &Engine, group: u16, count: u16, len: u32) -> ProvidedBufferPool {
    let (mut pool, selector) = ProvidedBufferPool::new(group, count, len).unwrap();
    pool.provide_all().unwrap();
    engine.register_buffers(selector).unwrap();
    pool
}

pub(crate) async fn wait_cqes(engine: &mut Engine, nr: usize) {
    tokio::time::timeout(TIMEOUT, engine.wait_completions(nr))
        .await
        .unwrap_or_else(|_| {
            panic!(
                "timed out waiting for {nr} completions, {} ready",
                engine.completion_queue_pending_count()
            )
        })
        .unwrap();
}

/// Wait for `nr` more completions and consume them.
pub(crate) async fn take_cqes(engine: &mut Engine, nr: usize) -> Vec<CompletionEntry> {
    let mut got = Vec::with_capacity(nr);
    while got.len() < nr {
        wait_cqes(engine, 1).await;
        let mut batch = engine.peek_completions(nr - got.len());
        got.extend(batch.by_ref());
        batch.ack();
    }
    got
}

pub(crate) async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let polled = async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    };
    tokio::time::timeout(TIMEOUT, polled)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}
