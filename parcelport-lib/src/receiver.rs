use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, trace};

use crate::{
    api::FabricAddr,
    controller::Controller,
    error::{FabricError, Result},
    header::HeaderView,
    mr::MemoryRegion,
    parcel_buffer::{ParcelBuffer, ParcelLayout},
    provider::{CompletionContext, RecvOp, post_with_backoff},
    stats::Stats,
};

/// Receives of this length or shorter carry an ack tag, not a header.
pub const ACK_LEN: usize = 8;

/// A preposted receive buffer. The region is present while the receive is
/// posted and taken out when its completion is handled.
pub(crate) struct ReceiverSlot {
    region: Mutex<Option<MemoryRegion>>,
}

impl ReceiverSlot {
    pub fn new() -> Self {
        Self { region: Mutex::new(None) }
    }

    fn take(&self, slot: usize) -> MemoryRegion {
        match self.region.lock().take() {
            Some(region) => region,
            None => panic!("completion for receive slot {} that has no posted buffer", slot),
        }
    }
}

impl Controller {
    pub(crate) fn post_initial_receives(&self) -> Result<()> {
        for slot in 0..self.receivers.len() {
            let region = self.pool.allocate_region(self.config.header_size)?;
            self.post_receive(slot, region)?;
        }
        Ok(())
    }

    pub(crate) fn post_receive(&self, slot: usize, mut region: MemoryRegion) -> Result<()> {
        let len = self.config.header_size;
        region.set_message_length(0);
        let op = RecvOp { ptr: region.ptr(), len, desc: region.desc() };
        *self.receivers[slot].region.lock() = Some(region);
        trace!(slot, len, "posting receive");
        post_with_backoff("fi_recv", || {
            self.endpoint.post_recv(op, CompletionContext::Receiver(slot))
        })
    }

    fn repost(&self, slot: usize, region: MemoryRegion) {
        if let Err(e) = self.post_receive(slot, region) {
            error!(slot, error = %e, "failed to repost receive");
        }
    }

    pub(crate) fn handle_recv_completion(self: &Arc<Self>, slot: usize, len: usize, src: FabricAddr) {
        let mut region = self.receivers[slot].take(slot);
        Stats::incr(&self.stats.messages_handled);

        if len <= ACK_LEN {
            let mut tag = [0u8; ACK_LEN];
            tag[..len].copy_from_slice(&region.as_slice()[..len]);
            self.repost(slot, region);
            Stats::incr(&self.stats.acks_received);
            self.handle_message_completion_ack(u64::from_le_bytes(tag));
            return;
        }

        region.set_message_length(len);
        let (layout, payload_target) = match HeaderView::parse(region.message()) {
            Ok(view) => {
                trace!(slot, len, header = ?view, "message received");
                (ParcelLayout::from_view(&view), view.message_rdma())
            }
            Err(e) => {
                error!(slot, len, ?src, error = %e, "dropping malformed message");
                self.repost(slot, region);
                return;
            }
        };

        let rma_count = layout.num_chunks.0 as usize + usize::from(payload_target.is_some());
        if rma_count == 0 {
            Stats::incr(&self.stats.msg_plain);
            let buffer = ParcelBuffer::plain(self.clone(), src, slot, region, layout);
            self.decoder.decode(src, buffer);
            return;
        }

        // Free the slot before the reads complete.
        let fresh = match self.pool.allocate_region(self.config.header_size) {
            Ok(fresh) => fresh,
            Err(e) => {
                error!(
                    slot,
                    tag = layout.tag,
                    ?src,
                    error = %e,
                    "no region to repost receive slot, dropping message"
                );
                self.repost(slot, region);
                return;
            }
        };
        Stats::incr(&self.stats.msg_rma);
        self.repost(slot, fresh);
        self.start_rma(src, region, layout, payload_target);
    }

    pub(crate) fn handle_recv_error(&self, slot: usize, error: FabricError) {
        let region = self.receivers[slot].take(slot);
        error!(slot, %error, "receive failed, reposting");
        self.repost(slot, region);
    }

    /// Number of receive slots with a posted buffer.
    pub fn posted_receives(&self) -> usize {
        self.receivers.iter().filter(|r| r.region.lock().is_some()).count()
    }
}
