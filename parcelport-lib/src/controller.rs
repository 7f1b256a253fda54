use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
};

use crossbeam_queue::SegQueue;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::{
    api::{FabricAddr, Locality},
    config::ParcelportConfig,
    error::{FabricError, Result},
    interface::ParcelDecoder,
    memory_pool::MemoryPool,
    provider::{FabricEndpoint, post_with_backoff},
    receiver::ReceiverSlot,
    rma_receiver::RmaReceiver,
    sender::Sender,
    stats::Stats,
    utils::slot_pool::SlotPool,
};

/// State shared between the parcelport handle, polling threads and
/// outstanding parcel buffers.
pub(crate) struct Controller {
    pub config: ParcelportConfig,
    pub endpoint: Arc<dyn FabricEndpoint>,
    pub pool: MemoryPool,
    pub decoder: Arc<dyn ParcelDecoder>,
    pub senders: SlotPool<Sender>,
    pub receivers: Box<[ReceiverSlot]>,
    pub rma_in_flight: DashMap<u64, Arc<RmaReceiver>>,
    pub rma_free: SegQueue<Arc<RmaReceiver>>,
    pub rma_next_id: AtomicU64,
    /// RMA receivers between their first read and the release of the
    /// decoded buffer.
    pub rma_active: AtomicUsize,
    pub stats: Stats,
    pub peers: DashMap<Locality, FabricAddr>,
    pub stopped: AtomicBool,
    pub(crate) tx_poll_lock: Mutex<()>,
    pub(crate) rx_poll_lock: Mutex<()>,
}

impl Controller {
    pub fn new(
        config: ParcelportConfig,
        endpoint: Arc<dyn FabricEndpoint>,
        decoder: Arc<dyn ParcelDecoder>,
    ) -> Result<Arc<Self>> {
        let pool = MemoryPool::new(endpoint.domain(), &config)?;
        let senders = SlotPool::new(config.num_senders, |_| Sender::new());
        let receivers = (0..config.num_receivers).map(|_| ReceiverSlot::new()).collect();
        debug!(
            locality = %endpoint.locality(),
            num_senders = config.num_senders,
            num_receivers = config.num_receivers,
            header_size = config.header_size,
            "Controller::new"
        );
        Ok(Arc::new(Self {
            config,
            endpoint,
            pool,
            decoder,
            senders,
            receivers,
            rma_in_flight: DashMap::new(),
            rma_free: SegQueue::new(),
            rma_next_id: AtomicU64::new(1),
            rma_active: AtomicUsize::new(0),
            stats: Stats::default(),
            peers: DashMap::new(),
            stopped: AtomicBool::new(false),
            tx_poll_lock: Mutex::new(()),
            rx_poll_lock: Mutex::new(()),
        }))
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Senders and RMA receivers still owned by an in-flight message.
    pub fn active(&self) -> usize {
        self.senders.in_use() + self.rma_active.load(Ordering::Acquire)
    }

    pub fn insert_address(&self, locality: &Locality) -> Result<FabricAddr> {
        if let Some(addr) = self.peers.get(locality) {
            return Ok(*addr);
        }
        let addr = self.endpoint.insert_address(locality)?;
        self.peers.insert(*locality, addr);
        Ok(addr)
    }

    /// Forgets every peer and reports how many in-flight objects remain.
    pub fn disconnect_all(&self) -> usize {
        self.peers.clear();
        self.active()
    }

    /// Posts a transmit operation, draining the send queue while the
    /// provider is out of transmit credits.
    pub(crate) fn post_tx(
        self: &Arc<Self>,
        context: &'static str,
        mut post: impl FnMut() -> std::result::Result<(), FabricError>,
    ) -> Result<()> {
        post_with_backoff(context, || {
            let result = post();
            if result.as_ref().is_err_and(|e| e.is_again()) {
                self.poll_send_queue();
            }
            result
        })
    }

    pub fn background_work(self: &Arc<Self>) -> usize {
        let mut total = 0;
        loop {
            let n = self.poll_endpoints();
            if n == 0 {
                return total;
            }
            total += n;
        }
    }
}
