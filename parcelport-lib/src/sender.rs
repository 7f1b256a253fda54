use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::{
    api::{FabricAddr, Locality, SmallVec},
    controller::Controller,
    error::{FabricError, ParcelportError, Result},
    header::{self, ChunkDescriptor, ChunkKind, HeaderSpec, RdmaTarget},
    interface::{Chunk, SendBuffer, SendCallback},
    memory_pool::MemoryPool,
    mr::MemoryRegion,
    provider::{CompletionContext, SendOp, SendSegment},
    utils::slot_pool::Handle,
};

/// Outbound message state of one pooled sender.
///
/// `completions` counts the events still required before cleanup: the local
/// send completion, plus the receiver's ack when the receiver has to read
/// from our memory.
pub(crate) struct Sender {
    state: Mutex<SenderState>,
    completions: AtomicUsize,
}

#[derive(Default)]
struct SenderState {
    dest: Option<FabricAddr>,
    header: Option<MemoryRegion>,
    payload: Option<MemoryRegion>,
    chunk_regions: SmallVec<MemoryRegion>,
    callback: Option<SendCallback>,
    needs_ack: bool,
}

impl Sender {
    pub fn new() -> Self {
        Self { state: Mutex::new(SenderState::default()), completions: AtomicUsize::new(0) }
    }
}

/// A sender reserved for one message to `locality`.
///
/// Dropping an unused connection returns the sender to the pool.
pub struct Connection {
    controller: Arc<Controller>,
    handle: Handle,
    locality: Locality,
    dest: FabricAddr,
    armed: bool,
}

impl Connection {
    pub fn locality(&self) -> Locality {
        self.locality
    }

    /// Correlation tag carried by the message header.
    pub fn tag(&self) -> u64 {
        self.handle.to_tag()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.armed
            && let Err(e) = self.controller.senders.release(self.handle)
        {
            error!(tag = self.handle.to_tag(), error = %e, "failed to release unused connection");
        }
    }
}

/// Regions held by a message between preparation and cleanup.
struct Prepared {
    header: Option<MemoryRegion>,
    payload: MemoryRegion,
    chunk_regions: SmallVec<MemoryRegion>,
    piggyback: bool,
    needs_ack: bool,
}

impl Prepared {
    fn send_op(&self) -> Result<SendOp> {
        let header = self.header.as_ref().ok_or(ParcelportError::Custom("header not built"))?;
        let mut segments = SmallVec::new();
        segments.push(SendSegment {
            ptr: header.ptr(),
            len: header.message_length(),
            desc: header.desc(),
        });
        if self.piggyback && self.payload.message_length() > 0 {
            segments.push(SendSegment {
                ptr: self.payload.ptr(),
                len: self.payload.message_length(),
                desc: self.payload.desc(),
            });
        }
        Ok(SendOp { segments })
    }

    fn release_into(self, pool: &MemoryPool) {
        if let Some(header) = self.header {
            pool.deallocate(header);
        }
        pool.deallocate(self.payload);
        for region in self.chunk_regions {
            pool.deallocate(region);
        }
    }
}

fn invoke(callback: SendCallback, result: Result<()>) {
    if let Err(e) = callback(result) {
        error!(error = %e, "send callback failed");
    }
}

impl Controller {
    pub fn get_connection(self: &Arc<Self>, locality: &Locality) -> Result<Option<Connection>> {
        if self.is_stopped() {
            return Ok(None);
        }
        let dest = self
            .peers
            .get(locality)
            .map(|addr| *addr)
            .ok_or(ParcelportError::UnknownLocality(*locality))?;
        let handle = match self.senders.acquire() {
            Some((handle, _)) => Some(handle),
            None => {
                self.background_work();
                self.senders.acquire().map(|(handle, _)| handle)
            }
        };
        Ok(handle.map(|handle| Connection {
            controller: self.clone(),
            handle,
            locality: *locality,
            dest,
            armed: true,
        }))
    }

    /// Sends `buffer` on `conn`. `callback` runs exactly once: with the
    /// error if this call fails, otherwise when the message has completed.
    pub fn async_write(
        self: &Arc<Self>,
        mut conn: Connection,
        buffer: SendBuffer,
        callback: SendCallback,
    ) -> Result<()> {
        if !Arc::ptr_eq(&conn.controller, self) {
            let e = ParcelportError::Custom("connection belongs to another parcelport");
            invoke(callback, Err(e.clone()));
            return Err(e);
        }
        conn.armed = false;
        let handle = conn.handle;
        let dest = conn.dest;
        drop(conn);

        let sender = match self.senders.get(handle) {
            Ok(sender) => sender,
            Err(e) => {
                invoke(callback, Err(e.clone()));
                return Err(e);
            }
        };
        let (prepared, op) = match self.prepare(handle, buffer) {
            Ok(prepared) => prepared,
            Err(e) => {
                invoke(callback, Err(e.clone()));
                if let Err(release_err) = self.senders.release(handle) {
                    error!(tag = handle.to_tag(), error = %release_err, "failed to release sender");
                }
                return Err(e);
            }
        };

        let completions = 1 + usize::from(prepared.needs_ack);
        debug!(
            tag = handle.to_tag(),
            ?dest,
            header_length = op.segments[0].len,
            total_length = op.total_len(),
            piggyback = prepared.piggyback,
            chunk_regions = prepared.chunk_regions.len(),
            completions,
            "posting message"
        );
        sender.completions.store(completions, Ordering::Release);
        *sender.state.lock() = SenderState {
            dest: Some(dest),
            header: prepared.header,
            payload: Some(prepared.payload),
            chunk_regions: prepared.chunk_regions,
            callback: Some(callback),
            needs_ack: prepared.needs_ack,
        };

        let posted = self.post_tx("fi_sendmsg", || {
            self.endpoint.post_send(op.clone(), dest, CompletionContext::Sender(handle))
        });
        if let Err(e) = posted {
            let callback = sender.state.lock().callback.take();
            if let Some(callback) = callback {
                invoke(callback, Err(e.clone()));
            }
            self.force_sender_cleanup(handle, sender);
            return Err(e);
        }
        Ok(())
    }

    fn prepare(&self, handle: Handle, buffer: SendBuffer) -> Result<(Prepared, SendOp)> {
        let SendBuffer { payload, chunks } = buffer;
        let mut prepared = Prepared {
            header: None,
            payload,
            chunk_regions: SmallVec::new(),
            piggyback: false,
            needs_ack: false,
        };
        let built = self.build_message(handle, &chunks, &mut prepared);
        match built.and_then(|()| prepared.send_op()) {
            Ok(op) => Ok((prepared, op)),
            Err(e) => {
                prepared.release_into(&self.pool);
                Err(e)
            }
        }
    }

    fn build_message(
        &self,
        handle: Handle,
        chunks: &[Chunk],
        prepared: &mut Prepared,
    ) -> Result<()> {
        let budget = self.config.header_size;
        header::check_chunk_table(chunks.len(), budget)?;
        let payload_len = prepared.payload.message_length();
        for chunk in chunks {
            if let Chunk::Index { offset, len } = chunk
                && offset.checked_add(*len).is_none_or(|end| end > payload_len)
            {
                return Err(ParcelportError::Custom("index chunk outside the payload"));
            }
        }

        let mut inline_room = budget - header::header_length(chunks.len(), []);
        let mut descriptors: SmallVec<ChunkDescriptor> = SmallVec::with_capacity(chunks.len());
        let mut inline_data: SmallVec<&[u8]> = SmallVec::new();
        for chunk in chunks {
            let desc = match chunk {
                Chunk::Index { offset, len } => {
                    ChunkDescriptor::index(*offset as u64, *len as u64)
                }
                Chunk::Pointer(bytes) => {
                    let len = bytes.len();
                    let aligned = len.next_multiple_of(8);
                    if len <= self.config.inline_chunk_threshold && aligned <= inline_room {
                        inline_room -= aligned;
                        inline_data.push(bytes.as_ref());
                        ChunkDescriptor::inline(len as u64)
                    } else {
                        let region = if len <= self.config.memory_copy_threshold {
                            let mut region = self.pool.allocate_region(len)?;
                            match region.as_mut_slice() {
                                Ok(dst) => dst[..len].copy_from_slice(bytes),
                                Err(e) => {
                                    self.pool.deallocate(region);
                                    return Err(e);
                                }
                            }
                            region
                        } else {
                            self.pool.register_bytes(bytes.clone())?
                        };
                        let desc =
                            ChunkDescriptor::pointer(region.addr(), len as u64, region.rkey());
                        trace!(len, rkey = region.rkey().0, "zero-copy chunk");
                        prepared.chunk_regions.push(region);
                        desc
                    }
                }
            };
            descriptors.push(desc);
        }

        let header = prepared.header.insert(self.pool.allocate_region(budget)?);
        let payload = &prepared.payload;
        let spec = HeaderSpec {
            tag: handle.to_tag(),
            payload: payload.message(),
            payload_target: RdmaTarget {
                addr: payload.addr(),
                rkey: payload.rkey(),
                len: payload_len as u64,
            },
            chunks: &descriptors,
            inline_data: &inline_data,
        };
        let encoded = header::encode(&mut header.as_mut_slice()?[..budget], &spec)?;
        header.set_message_length(encoded.header_length);
        prepared.piggyback = encoded.piggyback;
        prepared.needs_ack =
            !encoded.piggyback || descriptors.iter().any(|d| d.kind == ChunkKind::Pointer);
        Ok(())
    }

    pub(crate) fn handle_send_completion(&self, handle: Handle) {
        let sender = match self.senders.get(handle) {
            Ok(sender) => sender,
            Err(e) => {
                warn!(tag = handle.to_tag(), error = %e, "send completion for a recycled sender");
                return;
            }
        };
        let callback = {
            let mut state = sender.state.lock();
            if state.needs_ack { None } else { state.callback.take() }
        };
        trace!(tag = handle.to_tag(), "send completion");
        if let Some(callback) = callback {
            invoke(callback, Ok(()));
        }
        self.sender_event_done(handle, sender);
    }

    /// Handles the ack a receiver sends once it finished reading our memory.
    pub(crate) fn handle_message_completion_ack(&self, tag: u64) {
        let handle = Handle::from_tag(tag);
        let sender = match self.senders.get(handle) {
            Ok(sender) => sender,
            Err(e) => {
                warn!(tag, error = %e, "dropping ack for a recycled sender");
                return;
            }
        };
        let callback = {
            let mut state = sender.state.lock();
            if !state.needs_ack {
                warn!(tag, "dropping ack for a message that did not request one");
                return;
            }
            state.callback.take()
        };
        debug!(tag, "ack received");
        if let Some(callback) = callback {
            invoke(callback, Ok(()));
        }
        self.sender_event_done(handle, sender);
    }

    pub(crate) fn handle_send_error(&self, handle: Handle, error: FabricError) {
        let Ok(sender) = self.senders.get(handle) else {
            warn!(tag = handle.to_tag(), %error, "send error for a recycled sender");
            return;
        };
        error!(tag = handle.to_tag(), %error, "send failed");
        let callback = sender.state.lock().callback.take();
        if let Some(callback) = callback {
            invoke(callback, Err(ParcelportError::Completion(error)));
        }
        self.force_sender_cleanup(handle, sender);
    }

    /// Fails every posted message with `Stopped` and frees its sender.
    /// Returns how many were abandoned.
    pub(crate) fn abandon_senders(&self) -> usize {
        let mut abandoned = 0;
        for (handle, sender) in self.senders.entries() {
            if sender.completions.load(Ordering::Acquire) == 0 {
                continue;
            }
            let callback = sender.state.lock().callback.take();
            warn!(tag = handle.to_tag(), "abandoning in-flight message");
            if let Some(callback) = callback {
                invoke(callback, Err(ParcelportError::Stopped));
            }
            self.force_sender_cleanup(handle, sender);
            abandoned += 1;
        }
        abandoned
    }

    fn sender_event_done(&self, handle: Handle, sender: &Sender) {
        // Events after a forced cleanup find the count at zero.
        let prev = sender.completions.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
            n.checked_sub(1)
        });
        if prev == Ok(1) {
            self.cleanup_sender(handle, sender);
        }
    }

    fn force_sender_cleanup(&self, handle: Handle, sender: &Sender) {
        if sender.completions.swap(0, Ordering::AcqRel) > 0 {
            self.cleanup_sender(handle, sender);
        }
    }

    fn cleanup_sender(&self, handle: Handle, sender: &Sender) {
        let state = std::mem::take(&mut *sender.state.lock());
        if let Some(callback) = state.callback {
            invoke(callback, Ok(()));
        }
        if let Some(header) = state.header {
            self.pool.deallocate(header);
        }
        if let Some(payload) = state.payload {
            self.pool.deallocate(payload);
        }
        for region in state.chunk_regions {
            self.pool.deallocate(region);
        }
        debug!(tag = handle.to_tag(), dest = ?state.dest, "sender cleanup");
        if let Err(e) = self.senders.release(handle) {
            error!(tag = handle.to_tag(), error = %e, "failed to return sender to the pool");
        }
    }
}
