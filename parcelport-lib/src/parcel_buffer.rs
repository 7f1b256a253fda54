use std::sync::Arc;

use tracing::{debug, error};

use crate::{
    api::FabricAddr,
    controller::Controller,
    error::Result,
    header::{ChunkDescriptor, ChunkKind, HeaderView},
    mr::MemoryRegion,
    provider::CompletionContext,
    rma_receiver::{RmaReceiver, RmaState},
    stats::Stats,
};

/// Header fields an inbound message needs after its header region is no
/// longer parsed.
#[derive(Debug, Clone, Default)]
pub(crate) struct ParcelLayout {
    pub tag: u64,
    pub size: usize,
    pub data_offset: usize,
    pub num_chunks: (u32, u32),
    pub chunks: Vec<ChunkDescriptor>,
}

impl ParcelLayout {
    pub fn from_view(view: &HeaderView<'_>) -> Self {
        Self {
            tag: view.tag(),
            size: view.size() as usize,
            data_offset: view.header_length(),
            num_chunks: view.num_chunks(),
            chunks: view.chunks().collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParcelChunk<'a> {
    /// Zero-copy chunk, now in local memory.
    ZeroCopy(&'a [u8]),
    /// Chunk stored in the payload at `offset`.
    Index { offset: usize, data: &'a [u8] },
    /// Small chunk carried in the header.
    Inline(&'a [u8]),
}

impl<'a> ParcelChunk<'a> {
    pub fn data(&self) -> &'a [u8] {
        match *self {
            Self::ZeroCopy(data) | Self::Inline(data) => data,
            Self::Index { data, .. } => data,
        }
    }
}

enum Origin {
    /// Decoded in place; the region goes back to this receive slot.
    Slot(usize),
    /// Assembled by RDMA reads; needs an ack.
    Rma(Arc<RmaReceiver>),
}

/// Inbound parcel handed to the decoder.
///
/// All memory stays valid while the buffer lives. Releasing it acks RMA
/// messages, returns the regions to the pool and reposts the receive.
pub struct ParcelBuffer {
    controller: Arc<Controller>,
    source: FabricAddr,
    layout: ParcelLayout,
    header: Option<MemoryRegion>,
    payload: Option<MemoryRegion>,
    chunk_regions: Vec<MemoryRegion>,
    origin: Option<Origin>,
}

impl ParcelBuffer {
    pub(crate) fn plain(
        controller: Arc<Controller>,
        source: FabricAddr,
        slot: usize,
        header: MemoryRegion,
        layout: ParcelLayout,
    ) -> Self {
        Self {
            controller,
            source,
            layout,
            header: Some(header),
            payload: None,
            chunk_regions: Vec::new(),
            origin: Some(Origin::Slot(slot)),
        }
    }

    pub(crate) fn rma(
        controller: Arc<Controller>,
        source: FabricAddr,
        receiver: Arc<RmaReceiver>,
        state: RmaState,
    ) -> Self {
        Self {
            controller,
            source,
            layout: state.layout,
            header: state.header,
            payload: state.payload,
            chunk_regions: state.chunk_regions,
            origin: Some(Origin::Rma(receiver)),
        }
    }

    pub fn source(&self) -> FabricAddr {
        self.source
    }

    pub fn size(&self) -> usize {
        self.layout.size
    }

    /// (zero-copy, normal) chunk counts.
    pub fn num_chunks(&self) -> (u32, u32) {
        self.layout.num_chunks
    }

    /// Whether the payload was fetched by RDMA read.
    pub fn is_rma(&self) -> bool {
        matches!(self.origin, Some(Origin::Rma(_)))
    }

    pub fn data(&self) -> &[u8] {
        match (&self.payload, &self.header) {
            (Some(payload), _) => payload.message(),
            (None, Some(header)) => {
                let start = self.layout.data_offset;
                &header.as_slice()[start..start + self.layout.size]
            }
            (None, None) => &[],
        }
    }

    /// Chunk descriptors. Zero-copy entries carry the local address and key.
    pub fn descriptors(&self) -> &[ChunkDescriptor] {
        &self.layout.chunks
    }

    pub fn chunks(&self) -> impl Iterator<Item = ParcelChunk<'_>> + '_ {
        let mut zero_copy = self.chunk_regions.iter();
        let data = self.data();
        let header = self.header.as_ref().map(|h| h.as_slice()).unwrap_or(&[]);
        self.layout.chunks.iter().map(move |chunk| {
            let start = chunk.addr as usize;
            let end = start + chunk.size as usize;
            match chunk.kind {
                ChunkKind::Pointer => {
                    ParcelChunk::ZeroCopy(zero_copy.next().map(|r| r.message()).unwrap_or(&[]))
                }
                ChunkKind::Index => ParcelChunk::Index { offset: start, data: &data[start..end] },
                ChunkKind::Inline => ParcelChunk::Inline(&header[start..end]),
            }
        })
    }

    /// Releases the buffer now instead of on drop, reporting failures.
    pub fn release(mut self) -> Result<()> {
        self.release_resources()
    }

    fn release_resources(&mut self) -> Result<()> {
        let Some(origin) = self.origin.take() else {
            return Ok(());
        };
        let controller = &self.controller;
        Stats::incr(&controller.stats.recv_deletes);
        match origin {
            Origin::Slot(slot) => match self.header.take() {
                Some(region) => controller.post_receive(slot, region),
                None => Ok(()),
            },
            Origin::Rma(receiver) => {
                let tag = self.layout.tag;
                debug!(tag, source = ?self.source, "sending ack");
                let bytes = tag.to_le_bytes();
                let ack = controller.post_tx("fi_inject", || {
                    controller.endpoint.inject(&bytes, self.source, CompletionContext::Ack(tag))
                });
                let state = RmaState {
                    source: Some(self.source),
                    layout: std::mem::take(&mut self.layout),
                    header: self.header.take(),
                    payload: self.payload.take(),
                    chunk_regions: std::mem::take(&mut self.chunk_regions),
                };
                controller.release_rma(receiver, state);
                ack
            }
        }
    }
}

impl std::fmt::Debug for ParcelBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParcelBuffer")
            .field("source", &self.source)
            .field("tag", &format_args!("{:#x}", self.layout.tag))
            .field("size", &self.layout.size)
            .field("num_chunks", &self.layout.num_chunks)
            .field("rma", &self.is_rma())
            .finish()
    }
}

impl Drop for ParcelBuffer {
    fn drop(&mut self) {
        let tag = self.layout.tag;
        if let Err(e) = self.release_resources() {
            error!(tag, error = %e, "failed to release parcel buffer");
        }
    }
}
