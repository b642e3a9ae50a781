use std::{
    ops::ControlFlow,
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc,
    },
    time::Instant,
};

use rand::RngCore;
use sqpoll_uring::{Handle, LoopbackTransport};
use tracing::{info, warn};

use crate::{Args, OpsLeft, RunDuration};

pub(crate) fn ops_left_per_client(args: &Args) -> Vec<OpsLeft> {
    let mut fixed_total_msg_count_ops_left = None;
    (0..args.num_clients.get())
        .map(|_| match args.run_duration {
            RunDuration::UntilCtrlC | RunDuration::FixedDuration(_) => OpsLeft(None),
            RunDuration::FixedTotalMsgCount(total) => {
                let shared = fixed_total_msg_count_ops_left.get_or_insert_with(|| {
                    Arc::new(AtomicI64::new(i64::try_from(total).unwrap()))
                });
                OpsLeft(Some(Arc::clone(shared)))
            }
            RunDuration::FixedPerClientMsgCount(per_client) => OpsLeft(Some(Arc::new(
                AtomicI64::new(i64::try_from(per_client).unwrap()),
            ))),
        })
        .collect()
}

/// Feeds one loopback handle with timestamped messages.
pub(crate) struct Sender {
    pub(crate) client_num: usize,
    pub(crate) handle: Handle,
    pub(crate) transport: Arc<LoopbackTransport>,
    pub(crate) ops_left: OpsLeft,
    pub(crate) epoch: Instant,
}

impl Sender {
    /// Send until stopped or out of ops, then close the handle so the
    /// receiver sees end of stream.
    pub(crate) fn run(self, args: &Args, stop: &AtomicBool) {
        info!("Client {} starting", self.client_num);
        let mut msg = vec![0u8; args.msg_size.get() as usize];
        rand::thread_rng().fill_bytes(&mut msg[8..]);
        let mut sent = 0u64;
        while !stop.load(Ordering::Relaxed) {
            if self.transport.queued(self.handle) >= args.max_queued_per_client.get() {
                std::thread::yield_now();
                continue;
            }
            let ControlFlow::Continue(()) = self.ops_left.take_one_op() else {
                break;
            };
            let sent_at = u64::try_from(self.epoch.elapsed().as_nanos()).unwrap();
            msg[..8].copy_from_slice(&sent_at.to_le_bytes());
            if let Err(e) = self.transport.send(self.handle, &msg) {
                warn!("Client {} send failed: {e}", self.client_num);
                break;
            }
            sent += 1;
        }
        if let Err(e) = self.transport.close(self.handle) {
            warn!("Client {} close failed: {e}", self.client_num);
        }
        info!("Client {} stopping after {sent} messages", self.client_num);
    }
}
