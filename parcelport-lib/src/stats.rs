use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Receive-side counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ParcelportStats {
    /// Receive completions, messages and acks alike.
    pub messages_handled: u64,
    pub acks_received: u64,
    /// Messages decoded straight out of the receive buffer.
    pub msg_plain: u64,
    /// Messages that needed RDMA reads.
    pub msg_rma: u64,
    pub sent_ack: u64,
    pub rma_reads: u64,
    /// Inbound messages whose resources were released.
    pub recv_deletes: u64,
}

#[derive(Default)]
pub(crate) struct Stats {
    pub messages_handled: AtomicU64,
    pub acks_received: AtomicU64,
    pub msg_plain: AtomicU64,
    pub msg_rma: AtomicU64,
    pub sent_ack: AtomicU64,
    pub rma_reads: AtomicU64,
    pub recv_deletes: AtomicU64,
}

impl Stats {
    pub fn incr(counter: &AtomicU64) {
        Self::add(counter, 1);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ParcelportStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        ParcelportStats {
            messages_handled: load(&self.messages_handled),
            acks_received: load(&self.acks_received),
            msg_plain: load(&self.msg_plain),
            msg_rma: load(&self.msg_rma),
            sent_ack: load(&self.sent_ack),
            rma_reads: load(&self.rma_reads),
            recv_deletes: load(&self.recv_deletes),
        }
    }
}
