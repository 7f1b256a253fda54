use std::{ptr::NonNull, sync::Arc};

use bitflags::bitflags;
use thread_lib::Backoff;
use tracing::trace;

use crate::{
    api::{
        FabricAddr, Locality, MemoryRegionLocalDescriptor, MemoryRegionRemoteKey,
        SmallVec,
    },
    error::{FabricError, Result},
    utils::slot_pool::Handle,
};

/// What a peer may do with a registered region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MrAccess {
    /// Local send/receive plus remote read and write.
    ReadWrite,
    /// Local send plus remote read. Used for caller-owned zero-copy chunks.
    RemoteRead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub desc: MemoryRegionLocalDescriptor,
    pub rkey: MemoryRegionRemoteKey,
}

pub trait FabricDomain: Send + Sync {
    fn name(&self) -> &str;

    fn register(&self, ptr: NonNull<u8>, len: usize, access: MrAccess)
    -> Result<Registration>;
    fn deregister(&self, registration: &Registration);
}

/// Operations reference memory by raw pointer. The memory must stay valid and
/// registered until the completion for the operation has been read.
#[derive(Clone, Copy)]
pub struct RecvOp {
    pub ptr: NonNull<u8>,
    pub len: usize,
    pub desc: MemoryRegionLocalDescriptor,
}

#[derive(Clone, Copy)]
pub struct SendSegment {
    pub ptr: NonNull<u8>,
    pub len: usize,
    pub desc: MemoryRegionLocalDescriptor,
}

/// A gathered send. The header segment comes first, an optional piggybacked
/// payload second.
#[derive(Clone)]
pub struct SendOp {
    pub segments: SmallVec<SendSegment>,
}

impl SendOp {
    pub fn total_len(&self) -> usize {
        self.segments.iter().map(|s| s.len).sum()
    }
}

#[derive(Clone, Copy)]
pub struct ReadOp {
    pub ptr: NonNull<u8>,
    pub len: usize,
    pub desc: MemoryRegionLocalDescriptor,
    pub remote_addr: u64,
    pub rkey: MemoryRegionRemoteKey,
}

unsafe impl Send for RecvOp {}
unsafe impl Send for SendOp {}
unsafe impl Send for ReadOp {}

/// Identifies the object that posted an operation. Carried alongside every
/// posted operation and handed back in its completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionContext {
    /// Header send of a pooled sender.
    Sender(Handle),
    /// Preposted receive buffer, by slot index.
    Receiver(usize),
    /// RDMA read issued on behalf of an in-flight inbound message.
    RmaRead(u64),
    /// Acknowledgement carrying the given tag back to its origin.
    Ack(u64),
}

bitflags! {
    /// Operation kind reported with a completion.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CompletionFlags: u64 {
        const MSG = 1 << 1;
        const RMA = 1 << 2;
        const READ = 1 << 8;
        const SEND = 1 << 10;
        const RECV = 1 << 11;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CompletionEntry {
    pub context: CompletionContext,
    pub flags: CompletionFlags,
    pub len: usize,
    /// Source of a receive, `None` when the sender is not in the local
    /// address vector.
    pub src: Option<FabricAddr>,
}

#[derive(Debug)]
pub enum CqEvent {
    Completion(CompletionEntry),
    Error {
        context: CompletionContext,
        flags: CompletionFlags,
        error: FabricError,
    },
}

pub trait FabricEndpoint: Send + Sync {
    fn locality(&self) -> Locality;
    fn domain(&self) -> Arc<dyn FabricDomain>;

    fn insert_address(&self, locality: &Locality) -> Result<FabricAddr>;

    fn post_recv(
        &self,
        op: RecvOp,
        context: CompletionContext,
    ) -> std::result::Result<(), FabricError>;
    fn post_send(
        &self,
        op: SendOp,
        dest: FabricAddr,
        context: CompletionContext,
    ) -> std::result::Result<(), FabricError>;
    /// Sends a small buffer that is copied before returning.
    fn inject(
        &self,
        data: &[u8],
        dest: FabricAddr,
        context: CompletionContext,
    ) -> std::result::Result<(), FabricError>;
    fn post_read(
        &self,
        op: ReadOp,
        src: FabricAddr,
        context: CompletionContext,
    ) -> std::result::Result<(), FabricError>;

    fn read_tx_cq(&self) -> Option<CqEvent>;
    fn read_rx_cq(&self) -> Option<CqEvent>;
}

/// Retries `post` with cooperative backoff while the provider reports EAGAIN.
/// Any other error is returned.
pub(crate) fn post_with_backoff(
    context: &'static str,
    mut post: impl FnMut() -> std::result::Result<(), FabricError>,
) -> Result<()> {
    let mut backoff = Backoff::new();
    loop {
        match post() {
            Ok(()) => return Ok(()),
            Err(e) if e.is_again() => {
                trace!(context, retries = backoff.retries(), "provider busy, reposting");
                backoff.snooze();
            }
            Err(e) => return Err(e.into()),
        }
    }
}
