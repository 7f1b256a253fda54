use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::{
    api::{FabricAddr, SmallVec},
    controller::Controller,
    error::{FabricError, Result},
    header::{ChunkKind, RdmaTarget},
    mr::MemoryRegion,
    parcel_buffer::{ParcelBuffer, ParcelLayout},
    provider::{CompletionContext, ReadOp},
    stats::Stats,
};

/// Inbound message waiting for its RDMA reads.
///
/// `pending` holds the number of reads not yet completed. Whoever takes it
/// from one to zero finishes the message.
pub(crate) struct RmaReceiver {
    pending: AtomicUsize,
    failed: AtomicBool,
    state: Mutex<RmaState>,
}

#[derive(Default)]
pub(crate) struct RmaState {
    pub source: Option<FabricAddr>,
    pub layout: ParcelLayout,
    pub header: Option<MemoryRegion>,
    pub payload: Option<MemoryRegion>,
    pub chunk_regions: Vec<MemoryRegion>,
}

impl RmaReceiver {
    fn new() -> Self {
        Self {
            pending: AtomicUsize::new(0),
            failed: AtomicBool::new(false),
            state: Mutex::new(RmaState::default()),
        }
    }
}

impl Controller {
    /// Allocates local regions for every zero-copy chunk and, when not
    /// piggybacked, the payload, rewrites the descriptors to the local
    /// copies and posts one read per region.
    pub(crate) fn start_rma(
        self: &Arc<Self>,
        src: FabricAddr,
        header: MemoryRegion,
        layout: ParcelLayout,
        payload_target: Option<RdmaTarget>,
    ) {
        let receiver = self.rma_free.pop().unwrap_or_else(|| Arc::new(RmaReceiver::new()));
        let id = self.rma_next_id.fetch_add(1, Ordering::Relaxed);
        self.rma_active.fetch_add(1, Ordering::AcqRel);
        receiver.failed.store(false, Ordering::Release);

        let mut state =
            RmaState { source: Some(src), layout, header: Some(header), ..Default::default() };
        let reads = match self.prepare_reads(&mut state, payload_target) {
            Ok(reads) => reads,
            Err(e) => {
                error!(tag = state.layout.tag, ?src, error = %e, "cannot fetch message, dropping it");
                self.release_rma(receiver, state);
                return;
            }
        };

        let count = reads.len();
        let tag = state.layout.tag;
        receiver.pending.store(count, Ordering::Release);
        *receiver.state.lock() = state;
        self.rma_in_flight.insert(id, receiver.clone());
        Stats::add(&self.stats.rma_reads, count as u64);
        debug!(id, tag, count, ?src, "issuing rdma reads");

        for (i, op) in reads.iter().enumerate() {
            let posted = self.post_tx("fi_read", || {
                self.endpoint.post_read(*op, src, CompletionContext::RmaRead(id))
            });
            if let Err(e) = posted {
                error!(id, tag, error = %e, "failed to post rdma read");
                receiver.failed.store(true, Ordering::Release);
                for _ in i..count {
                    self.read_done(id, &receiver);
                }
                return;
            }
        }
    }

    fn prepare_reads(
        &self,
        state: &mut RmaState,
        payload_target: Option<RdmaTarget>,
    ) -> Result<SmallVec<ReadOp>> {
        let mut reads = SmallVec::new();
        for chunk in state.layout.chunks.iter_mut().filter(|c| c.kind == ChunkKind::Pointer) {
            let region = self.pool.allocate_region(chunk.size as usize)?;
            reads.push(ReadOp {
                ptr: region.ptr(),
                len: chunk.size as usize,
                desc: region.desc(),
                remote_addr: chunk.addr,
                rkey: chunk.rkey,
            });
            chunk.addr = region.addr();
            chunk.rkey = region.rkey();
            state.chunk_regions.push(region);
        }
        if let Some(target) = payload_target {
            let region = self.pool.allocate_region(target.len as usize)?;
            reads.push(ReadOp {
                ptr: region.ptr(),
                len: target.len as usize,
                desc: region.desc(),
                remote_addr: target.addr,
                rkey: target.rkey,
            });
            state.payload = Some(region);
        }
        Ok(reads)
    }

    pub(crate) fn handle_read_completion(self: &Arc<Self>, id: u64) {
        let receiver = self.rma_receiver(id);
        trace!(id, "rdma read completed");
        self.read_done(id, &receiver);
    }

    pub(crate) fn handle_read_error(self: &Arc<Self>, id: u64, error: FabricError) {
        let receiver = self.rma_receiver(id);
        error!(id, %error, "rdma read failed");
        receiver.failed.store(true, Ordering::Release);
        self.read_done(id, &receiver);
    }

    fn rma_receiver(&self, id: u64) -> Arc<RmaReceiver> {
        match self.rma_in_flight.get(&id) {
            Some(receiver) => receiver.value().clone(),
            None => panic!("rdma read completion for unknown receiver {}", id),
        }
    }

    fn read_done(self: &Arc<Self>, id: u64, receiver: &Arc<RmaReceiver>) {
        if receiver.pending.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        self.rma_in_flight.remove(&id);
        let state = std::mem::take(&mut *receiver.state.lock());
        let Some(source) = state.source else {
            panic!("rdma receiver {} finished without a source", id);
        };
        if receiver.failed.load(Ordering::Acquire) {
            error!(id, tag = state.layout.tag, "dropping message after failed reads");
            self.release_rma(receiver.clone(), state);
            return;
        }
        debug!(id, tag = state.layout.tag, size = state.layout.size, "message assembled");
        let buffer = ParcelBuffer::rma(self.clone(), source, receiver.clone(), state);
        self.decoder.decode(source, buffer);
    }

    /// Returns the regions of a finished message to the pool and the
    /// receiver to the free list.
    pub(crate) fn release_rma(&self, receiver: Arc<RmaReceiver>, state: RmaState) {
        if let Some(header) = state.header {
            self.pool.deallocate(header);
        }
        if let Some(payload) = state.payload {
            self.pool.deallocate(payload);
        }
        for region in state.chunk_regions {
            self.pool.deallocate(region);
        }
        self.rma_free.push(receiver);
        self.rma_active.fetch_sub(1, Ordering::AcqRel);
    }
}
