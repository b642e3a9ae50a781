use std::{
    num::{NonZeroU16, NonZeroU32, NonZeroU64, NonZeroUsize},
    ops::ControlFlow,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use clap::Parser;
use crossbeam_utils::CachePadded;
use sqpoll_uring::{Handle, LoopbackTransport, OverflowPolicy};
use tracing::{error, info};

mod monitor;
mod receiver;
mod sender;

#[derive(serde::Serialize, clap::Parser, Clone)]
struct Args {
    num_clients: NonZeroU64,
    /// Message size in bytes, at least 8 for the send timestamp.
    msg_size: NonZeroU32,
    #[clap(long, default_value = "until-ctrl-c")]
    run_duration: RunDuration,
    #[clap(long, default_value = "64")]
    buffers: NonZeroU16,
    #[clap(long, default_value = "4096")]
    buffer_len: NonZeroU32,
    /// Senders back off while this many messages wait on their handle.
    #[clap(long, default_value = "1024")]
    max_queued_per_client: NonZeroUsize,
    #[clap(long, default_value = "10ms", value_parser = humantime::parse_duration)]
    sq_thread_idle: Duration,
    #[clap(long, value_enum, default_value = "backlog")]
    overflow: OverflowMode,
    #[clap(subcommand)]
    receive_mode: ReceiveMode,
}

#[derive(Clone, serde::Serialize)]
enum RunDuration {
    UntilCtrlC,
    FixedDuration(Duration),
    FixedTotalMsgCount(u64),
    FixedPerClientMsgCount(u64),
}

fn parse_count(s: &str, suffix: &str) -> Option<Result<u64, String>> {
    let stripped = s.strip_suffix(suffix)?;
    let (stripped, multiplier) = if let Some(n) = stripped.strip_suffix("k-") {
        (n, 1000)
    } else if let Some(n) = stripped.strip_suffix("m-") {
        (n, 1000 * 1000)
    } else if let Some(n) = stripped.strip_suffix("g-") {
        (n, 1000 * 1000 * 1000)
    } else {
        (stripped.trim_end_matches('-'), 1)
    };
    Some(match stripped.parse::<NonZeroU64>() {
        Ok(n) => Ok(n.get() * multiplier),
        Err(e) => Err(format!("invalid message count: {e}: {s:?}")),
    })
}

impl FromStr for RunDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "until-ctrl-c" {
            return Ok(RunDuration::UntilCtrlC);
        }
        if let Some(n) = parse_count(s, "msgs-total") {
            return n.map(RunDuration::FixedTotalMsgCount);
        }
        if let Some(n) = parse_count(s, "msgs-per-client") {
            return n.map(RunDuration::FixedPerClientMsgCount);
        }
        match humantime::parse_duration(s) {
            Ok(d) => Ok(RunDuration::FixedDuration(d)),
            Err(e) => Err(format!("invalid duration: {e}: {s:?}")),
        }
    }
}

#[derive(Clone, Copy, clap::ValueEnum, serde::Serialize)]
enum OverflowMode {
    Backlog,
    Block,
}

impl From<OverflowMode> for OverflowPolicy {
    fn from(mode: OverflowMode) -> Self {
        match mode {
            OverflowMode::Backlog => OverflowPolicy::Backlog,
            OverflowMode::Block => OverflowPolicy::Block,
        }
    }
}

#[derive(Clone, Copy, clap::Subcommand, serde::Serialize)]
enum ReceiveMode {
    /// One multishot receive per client, re-armed when the pool runs dry.
    Multishot,
    /// A single-shot receive per client, re-submitted after every message.
    SingleShot,
}

struct StatsState {
    msgs_in_last_second: Vec<CachePadded<AtomicU64>>,
    latencies_histo: Vec<CachePadded<Mutex<hdrhistogram::Histogram<u64>>>>,
}

impl StatsState {
    fn make_latency_histogram() -> hdrhistogram::Histogram<u64> {
        hdrhistogram::Histogram::new_with_bounds(1, 1_000_000_000, 3).unwrap()
    }
    fn record_msg_latency(&self, client_num: usize, latency: Duration) {
        let mut h = self.latencies_histo[client_num].lock().unwrap();
        h.saturating_record(u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX));
    }
}

/// What the receiver reports back once every client has finished.
struct ReceiverResult {
    client_run_times: Vec<Duration>,
    summary: receiver::EngineSummary,
}

fn main() {
    tracing_subscriber::fmt()
        .with_file(true)
        .with_line_number(true)
        .with_env_filter({
            tracing_subscriber::EnvFilter::try_from_default_env()
                .expect("must set RUST_LOG variable")
        })
        .init();

    let args: Arc<Args> = Arc::new(Args::parse());
    assert!(
        args.msg_size.get() >= 8 && args.msg_size <= args.buffer_len,
        "msg_size must hold the 8-byte timestamp and fit into one buffer"
    );

    let stop = Arc::new(AtomicBool::new(false));
    let (stop_monitor_tx, stop_monitor_rx) = tokio::sync::oneshot::channel::<ReceiverResult>();

    let transport = Arc::new(LoopbackTransport::new());
    let handles: Vec<Handle> = (0..args.num_clients.get())
        .map(|_| transport.open())
        .collect();
    let num_clients = handles.len();

    let stats_state = Arc::new(StatsState {
        msgs_in_last_second: (0..num_clients)
            .map(|_| CachePadded::new(AtomicU64::new(0)))
            .collect(),
        latencies_histo: (0..num_clients)
            .map(|_| CachePadded::new(Mutex::new(StatsState::make_latency_histogram())))
            .collect(),
    });

    match args.run_duration {
        RunDuration::UntilCtrlC => {}
        RunDuration::FixedDuration(duration) => {
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                std::thread::sleep(duration);
                info!("configured runtime expired, setting stop flag");
                stop.store(true, Ordering::Relaxed);
            });
        }
        RunDuration::FixedTotalMsgCount(_) | RunDuration::FixedPerClientMsgCount(_) => {
            // senders count down their OpsLeft
        }
    }

    ctrlc::set_handler({
        let stop = Arc::clone(&stop);
        move || {
            info!("ctrl-c, setting stop flag");
            if stop.fetch_or(true, Ordering::Relaxed) {
                error!("stop flag was already set, aborting");
                std::process::abort();
            } else {
                info!("first ctrl-c, stop flag set");
            }
        }
    })
    .unwrap();

    // senders, receiver, monitor
    let ready = Arc::new(std::sync::Barrier::new(num_clients + 2));

    let monitor = std::thread::Builder::new()
        .name("monitor".to_owned())
        .spawn({
            let monitor = monitor::Monitor {
                args: Arc::clone(&args),
                stats: Arc::clone(&stats_state),
            };
            let ready = Arc::clone(&ready);
            move || monitor.run(&ready, stop_monitor_rx)
        })
        .unwrap();

    let epoch = Instant::now();
    let senders: Vec<_> = handles
        .iter()
        .zip(sender::ops_left_per_client(&args))
        .enumerate()
        .map(|(i, (&handle, ops_left))| {
            let sender = sender::Sender {
                client_num: i,
                handle,
                transport: Arc::clone(&transport),
                ops_left,
                epoch,
            };
            let args = Arc::clone(&args);
            let stop = Arc::clone(&stop);
            let ready = Arc::clone(&ready);
            std::thread::Builder::new()
                .name(format!("sender-{i}"))
                .spawn(move || {
                    ready.wait();
                    sender.run(&args, &stop)
                })
                .unwrap()
        })
        .collect();

    let res = receiver::run(
        &args,
        Arc::clone(&transport),
        &handles,
        epoch,
        &ready,
        &stats_state,
    );
    for sender in senders {
        sender.join().unwrap();
    }
    stop_monitor_tx
        .send(res)
        .ok()
        .expect("monitor must not exit by itself");
    monitor.join().unwrap();
}

#[derive(Clone)]
struct OpsLeft(Option<Arc<AtomicI64>>);

impl OpsLeft {
    fn take_one_op(&self) -> ControlFlow<()> {
        match &self.0 {
            None => (),
            Some(ops_left) => {
                let ops_left = ops_left.fetch_sub(1, Ordering::Relaxed);
                if ops_left <= 0 {
                    return ControlFlow::Break(());
                }
            }
        }
        ControlFlow::Continue(())
    }
}
