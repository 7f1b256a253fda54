use bytes::Bytes;
use mockall::automock;

use crate::{
    api::{FabricAddr, SmallVec},
    error::Result,
    memory_pool::MemoryPool,
    mr::MemoryRegion,
    parcel_buffer::ParcelBuffer,
};

pub type CallbackResult = std::result::Result<(), String>;

/// Invoked exactly once per `async_write`, with the outcome of the message.
pub type SendCallback = Box<dyn FnOnce(Result<()>) -> CallbackResult + Send + Sync>;

/// Consumer of inbound parcels.
///
/// The buffer keeps the receive resources alive. Dropping it (or calling
/// [`ParcelBuffer::release`]) acknowledges the message to the sender and
/// recycles the memory.
#[automock]
pub trait ParcelDecoder: Send + Sync {
    fn decode(&self, source: FabricAddr, buffer: ParcelBuffer);
}

/// A chunk referenced by a serialized parcel.
#[derive(Debug, Clone)]
pub enum Chunk {
    /// Bytes inside the payload.
    Index { offset: usize, len: usize },
    /// Caller-owned bytes transferred by RDMA read, or copied when small.
    Pointer(Bytes),
}

/// Outbound message: a payload in a pool region plus its chunk list.
pub struct SendBuffer {
    pub(crate) payload: MemoryRegion,
    pub(crate) chunks: SmallVec<Chunk>,
}

impl SendBuffer {
    /// `payload` must come from the pool of the parcelport it is written to.
    pub fn new(payload: MemoryRegion) -> Self {
        Self { payload, chunks: SmallVec::new() }
    }

    /// Copies `data` into a region allocated from `pool`.
    pub fn from_slice(pool: &MemoryPool, data: &[u8]) -> Result<Self> {
        let mut payload = pool.allocate_region(data.len())?;
        payload.as_mut_slice()?[..data.len()].copy_from_slice(data);
        Ok(Self::new(payload))
    }

    pub fn with_chunk(mut self, chunk: Chunk) -> Self {
        self.chunks.push(chunk);
        self
    }

    pub fn payload(&self) -> &[u8] {
        self.payload.message()
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }
}
