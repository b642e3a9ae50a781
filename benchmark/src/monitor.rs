//! Folds the receiver's per-client counters and latency histograms into a
//! report every [`MONITOR_PERIOD`], and writes the whole run out as JSON
//! once the receiver is done.

use std::{
    sync::{atomic::Ordering, Arc, Barrier},
    time::{Duration, Instant},
};

use hdrhistogram::Histogram;
use itertools::Itertools;
use serde_with::{serde_as, DurationMicroSeconds};
use tokio::sync::oneshot;
use tracing::info;

use crate::{receiver, Args, ReceiverResult, StatsState};

const MONITOR_PERIOD: Duration = Duration::from_secs(1);
const OUTPUT_PATH: &str = "benchmark.output.json";

/// Delivery latency of the messages received in some time span.
#[serde_as]
#[derive(serde::Serialize)]
struct LatencyReport {
    #[serde_as(as = "DurationMicroSeconds")]
    min_us: Duration,
    #[serde_as(as = "DurationMicroSeconds")]
    p50_us: Duration,
    #[serde_as(as = "DurationMicroSeconds")]
    p99_us: Duration,
    #[serde_as(as = "DurationMicroSeconds")]
    p99_9_us: Duration,
    #[serde_as(as = "DurationMicroSeconds")]
    max_us: Duration,
}

impl LatencyReport {
    /// `latencies` holds nanoseconds.
    fn of(latencies: &Histogram<u64>) -> Self {
        let at = |quantile| Duration::from_nanos(latencies.value_at_quantile(quantile));
        LatencyReport {
            min_us: Duration::from_nanos(latencies.min()),
            p50_us: at(0.5),
            p99_us: at(0.99),
            p99_9_us: at(0.999),
            max_us: Duration::from_nanos(latencies.max()),
        }
    }
}

#[serde_as]
#[derive(serde::Serialize)]
struct WindowReport {
    #[serde_as(as = "DurationMicroSeconds")]
    length_us: Duration,
    msgs: u64,
    msgs_per_sec: f64,
    mib_per_sec: f64,
    latency: LatencyReport,
}

impl std::fmt::Display for WindowReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let l = &self.latency;
        write!(
            f,
            "{:>10.0} msgs/s {:>8.2} MiB/s | latency p50={:?} p99={:?} p99.9={:?} max={:?}",
            self.msgs_per_sec, self.mib_per_sec, l.p50_us, l.p99_us, l.p99_9_us, l.max_us,
        )
    }
}

/// Messages and their latencies since `opened`.
struct Window {
    opened: Instant,
    msgs: u64,
    latencies: Histogram<u64>,
}

impl Window {
    fn open() -> Self {
        Window {
            opened: Instant::now(),
            msgs: 0,
            latencies: StatsState::make_latency_histogram(),
        }
    }

    fn report(&self, msg_size: u64) -> WindowReport {
        let length = self.opened.elapsed();
        let secs = length.as_secs_f64();
        WindowReport {
            length_us: length,
            msgs: self.msgs,
            msgs_per_sec: self.msgs as f64 / secs,
            mib_per_sec: (self.msgs * msg_size) as f64 / f64::from(1 << 20) / secs,
            latency: LatencyReport::of(&self.latencies),
        }
    }
}

#[derive(serde::Serialize)]
struct RunReport<'a> {
    args: &'a Args,
    engine: receiver::EngineSummary,
    /// Sorted, so that an uneven spread across clients is easy to spot.
    per_client_msgs: Vec<u64>,
    per_client_runtime_secs: Vec<f64>,
    overall: WindowReport,
    windows: Vec<WindowReport>,
}

pub(crate) struct Monitor {
    pub(crate) args: Arc<Args>,
    pub(crate) stats: Arc<StatsState>,
}

impl Monitor {
    /// Report every period until `done` delivers the receiver's result.
    pub(crate) fn run(self, ready: &Barrier, mut done: oneshot::Receiver<ReceiverResult>) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let msg_size = u64::from(self.args.msg_size.get());
        let mut per_client_msgs = vec![0u64; self.stats.msgs_in_last_second.len()];
        let mut windows = Vec::new();

        ready.wait();
        let mut overall = Window::open();
        let mut ticker = {
            let _rt = rt.enter();
            tokio::time::interval_at(tokio::time::Instant::now() + MONITOR_PERIOD, MONITOR_PERIOD)
        };
        let result = loop {
            let mut window = Window::open();
            let finished = rt.block_on(async {
                tokio::select! {
                    _ = ticker.tick() => None,
                    result = &mut done => Some(result),
                }
            });
            self.collect(&mut window, &mut overall, &mut per_client_msgs);
            let report = window.report(msg_size);
            info!("{report}");
            windows.push(report);
            if let Some(result) = finished {
                break result.expect("receiver result is sent before the sender is dropped");
            }
        };
        info!("monitor shutting down");

        let overall = overall.report(msg_size);
        info!("overall: {overall}");
        let report = RunReport {
            args: &self.args,
            engine: result.summary,
            per_client_msgs: per_client_msgs.into_iter().sorted().collect(),
            per_client_runtime_secs: result
                .client_run_times
                .iter()
                .sorted()
                .map(Duration::as_secs_f64)
                .collect(),
            overall,
            windows,
        };
        info!("writing results to {OUTPUT_PATH}");
        std::fs::write(OUTPUT_PATH, serde_json::to_string(&report).unwrap()).unwrap();
    }

    /// Move what the receiver recorded since the last call into `window`
    /// and `overall`.
    fn collect(&self, window: &mut Window, overall: &mut Window, per_client_msgs: &mut [u64]) {
        for (client, counter) in self.stats.msgs_in_last_second.iter().enumerate() {
            let msgs = counter.swap(0, Ordering::Relaxed);
            per_client_msgs[client] += msgs;
            window.msgs += msgs;
        }
        overall.msgs += window.msgs;
        for histo in &self.stats.latencies_histo {
            let mut histo = histo.lock().unwrap();
            window.latencies += &*histo;
            histo.clear();
        }
        overall.latencies += &window.latencies;
    }
}
