use std::{
    sync::{atomic::Ordering, Arc, Barrier},
    time::{Duration, Instant},
};

use sqpoll_uring::{
    CompletionError, Engine, EngineConfig, Handle, LoopbackTransport, ProvidedBufferPool,
    SubmissionEntry,
};
use tracing::{debug, error, info};

use crate::{Args, ReceiveMode, ReceiverResult, StatsState};

const BUF_GROUP: u16 = 0;

#[derive(serde::Serialize)]
pub(crate) struct EngineSummary {
    sqes_consumed: u64,
    cqes_posted: u64,
    cq_overflows: u64,
    buffers_selected: u64,
    poller_wakeups: u64,
    idle_transitions: u64,
    /// Receives that ended with `-ENOBUFS` and were submitted again.
    no_buffer_rearms: u64,
    undelivered_at_shutdown: usize,
}

fn arm(mode: ReceiveMode, handle: Handle, client_num: usize) -> SubmissionEntry {
    let sqe = match mode {
        ReceiveMode::Multishot => SubmissionEntry::recv_multishot(handle, BUF_GROUP),
        ReceiveMode::SingleShot => SubmissionEntry::recv(handle, BUF_GROUP),
    };
    sqe.user_tag(client_num as u64)
}

/// Receive on every handle until all senders have closed theirs.
pub(crate) fn run(
    args: &Args,
    transport: Arc<LoopbackTransport>,
    handles: &[Handle],
    epoch: Instant,
    ready: &Barrier,
    stats_state: &StatsState,
) -> ReceiverResult {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let mode = args.receive_mode;
    let config = EngineConfig::default()
        .sq_entries(u32::try_from(handles.len()).unwrap().max(128))
        .sq_thread_idle(args.sq_thread_idle)
        .overflow(args.overflow.into());
    let mut engine = Engine::launch(config, transport).unwrap();
    let (mut pool, selector) =
        ProvidedBufferPool::new(BUF_GROUP, args.buffers.get(), args.buffer_len.get()).unwrap();
    pool.provide_all().unwrap();
    engine.register_buffers(selector).unwrap();

    let initial: Vec<_> = handles
        .iter()
        .enumerate()
        .map(|(i, &handle)| arm(mode, handle, i))
        .collect();
    engine.submit_batch(&initial).unwrap();

    ready.wait();
    let start = Instant::now();
    let mut client_run_times: Vec<Option<Duration>> = vec![None; handles.len()];
    let mut live = handles.len();
    let mut no_buffer_rearms = 0;
    let mut rearm = Vec::new();

    rt.block_on(async {
        while live > 0 {
            if let Err(e) = engine.wait_completions(1).await {
                error!("receiver stopping early: {e}");
                break;
            }
            let mut batch = engine.peek_completions(usize::MAX);
            for cqe in &mut batch {
                let client_num = cqe.user_tag as usize;
                match cqe.outcome() {
                    Ok(len) if cqe.buffer_id.is_some() => {
                        let buf = pool.buffer(&cqe).unwrap();
                        let sent_at = u64::from_le_bytes(buf[..8].try_into().unwrap());
                        let latency = epoch.elapsed().saturating_sub(Duration::from_nanos(sent_at));
                        debug_assert_eq!(len, args.msg_size.get() as usize);
                        stats_state.record_msg_latency(client_num, latency);
                        stats_state.msgs_in_last_second[client_num].fetch_add(1, Ordering::Relaxed);
                        pool.release(cqe.buffer_id.unwrap()).unwrap();
                        if !cqe.is_more() {
                            rearm.push(arm(mode, handles[client_num], client_num));
                        }
                    }
                    Ok(_) => {
                        debug!("Client {client_num} closed");
                        client_run_times[client_num] = Some(start.elapsed());
                        live -= 1;
                    }
                    Err(CompletionError::NoBuffers) => {
                        no_buffer_rearms += 1;
                        rearm.push(arm(mode, handles[client_num], client_num));
                    }
                    Err(e) => {
                        error!("Client {client_num} receive failed: {e}");
                        client_run_times[client_num] = Some(start.elapsed());
                        live -= 1;
                    }
                }
            }
            batch.ack();
            if !rearm.is_empty() {
                engine.submit_batch(&rearm).unwrap();
                rearm.clear();
            }
        }
    });

    let metrics = engine.metrics();
    let undelivered = engine.shutdown();
    info!(undelivered = undelivered.len(), "receiver done");
    ReceiverResult {
        client_run_times: client_run_times
            .into_iter()
            .map(|t| t.unwrap_or_else(|| start.elapsed()))
            .collect(),
        summary: EngineSummary {
            sqes_consumed: metrics.sqes_consumed,
            cqes_posted: metrics.cqes_posted,
            cq_overflows: metrics.cq_overflows,
            buffers_selected: metrics.buffers_selected,
            poller_wakeups: metrics.poller_wakeups,
            idle_transitions: metrics.idle_transitions,
            no_buffer_rearms,
            undelivered_at_shutdown: undelivered.len(),
        },
    }
}
