use std::{
    collections::{HashMap, VecDeque},
    ptr::NonNull,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use parking_lot::Mutex;
use tracing::trace;

use super::{LoopbackConfig, LoopbackDomain, LoopbackFabric};
use crate::{
    api::{FabricAddr, Locality},
    error::{FI_ENOENT, FI_ETRUNC, FabricError, Result},
    provider::{
        CompletionContext, CompletionEntry, CompletionFlags, CqEvent, FabricDomain,
        FabricEndpoint, ReadOp, RecvOp, SendOp,
    },
};

struct PostedRecv {
    ptr: NonNull<u8>,
    len: usize,
    context: CompletionContext,
}

unsafe impl Send for PostedRecv {}

struct Unexpected {
    data: Vec<u8>,
    from: Locality,
}

#[derive(Default)]
struct RxQueue {
    posted: VecDeque<PostedRecv>,
    unexpected: VecDeque<Unexpected>,
}

#[derive(Default)]
struct AddressVector {
    peers: Vec<Locality>,
    index: HashMap<Locality, FabricAddr>,
}

/// Endpoint state reachable from peers through the fabric.
///
/// At most one of these locks is held at any time.
pub(crate) struct EndpointShared {
    locality: Locality,
    domain: Arc<LoopbackDomain>,
    config: LoopbackConfig,
    av: Mutex<AddressVector>,
    rx: Mutex<RxQueue>,
    tx_cq: Mutex<VecDeque<CqEvent>>,
    /// Parked transmit completions, `Some` while holding.
    tx_held: Mutex<Option<VecDeque<CqEvent>>>,
    rx_cq: Mutex<VecDeque<CqEvent>>,
    tx_in_flight: AtomicUsize,
    rx_in_flight: AtomicUsize,
    again_budget: AtomicUsize,
}

impl EndpointShared {
    pub(crate) fn new(locality: Locality, config: LoopbackConfig) -> Self {
        Self {
            locality,
            domain: Arc::new(LoopbackDomain::new(format!("loopback-{}", locality))),
            again_budget: AtomicUsize::new(config.again_budget),
            config,
            av: Mutex::new(AddressVector::default()),
            rx: Mutex::new(RxQueue::default()),
            tx_cq: Mutex::new(VecDeque::new()),
            tx_held: Mutex::new(None),
            rx_cq: Mutex::new(VecDeque::new()),
            tx_in_flight: AtomicUsize::new(0),
            rx_in_flight: AtomicUsize::new(0),
        }
    }

    fn source_of(&self, from: &Locality) -> Option<FabricAddr> {
        self.av.lock().index.get(from).copied()
    }

    /// Delivers a message, either into the oldest posted receive or onto the
    /// unexpected queue.
    fn deliver(&self, from: Locality, data: &[u8]) {
        let posted = {
            let mut rx = self.rx.lock();
            match rx.posted.pop_front() {
                Some(posted) => posted,
                None => {
                    rx.unexpected.push_back(Unexpected { data: data.to_vec(), from });
                    return;
                }
            }
        };
        self.complete_recv(posted, from, data);
    }

    fn complete_recv(&self, posted: PostedRecv, from: Locality, data: &[u8]) {
        let flags = CompletionFlags::MSG | CompletionFlags::RECV;
        let copied = data.len().min(posted.len);
        // SAFETY: the receive buffer is registered and stays valid until its
        // completion is read.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), posted.ptr.as_ptr(), copied);
        }
        let event = if data.len() > posted.len {
            CqEvent::Error {
                context: posted.context,
                flags,
                error: FabricError::new(FI_ETRUNC, "fi_recv: message truncated"),
            }
        } else {
            CqEvent::Completion(CompletionEntry {
                context: posted.context,
                flags,
                len: data.len(),
                src: self.source_of(&from),
            })
        };
        trace!(locality = %self.locality, from = %from, len = data.len(), "loopback recv");
        self.rx_cq.lock().push_back(event);
    }

    fn take_again(&self) -> bool {
        self.again_budget
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    fn acquire_credit(
        &self,
        in_flight: &AtomicUsize,
        depth: usize,
        context: &'static str,
    ) -> std::result::Result<(), FabricError> {
        if self.take_again() {
            return Err(FabricError::again(context));
        }
        in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < depth).then_some(n + 1))
            .map(|_| ())
            .map_err(|_| FabricError::again(context))
    }

    fn push_tx(&self, event: CqEvent) {
        if let Some(held) = self.tx_held.lock().as_mut() {
            held.push_back(event);
            return;
        }
        self.tx_cq.lock().push_back(event);
    }
}

pub struct LoopbackEndpoint {
    fabric: Arc<LoopbackFabric>,
    shared: Arc<EndpointShared>,
}

impl LoopbackEndpoint {
    pub(crate) fn new(fabric: Arc<LoopbackFabric>, shared: Arc<EndpointShared>) -> Self {
        Self { fabric, shared }
    }

    pub fn loopback_domain(&self) -> &Arc<LoopbackDomain> {
        &self.shared.domain
    }

    /// Makes the next `n` posts fail with EAGAIN.
    pub fn inject_again(&self, n: usize) {
        self.shared.again_budget.fetch_add(n, Ordering::AcqRel);
    }

    /// Parks every following transmit completion until released.
    pub fn hold_tx_completions(&self) {
        self.shared.tx_held.lock().get_or_insert_with(VecDeque::new);
    }

    pub fn held_tx_completions(&self) -> usize {
        self.shared.tx_held.lock().as_ref().map_or(0, VecDeque::len)
    }

    /// Moves the `n` most recently parked completions onto the CQ, newest
    /// first. Holding continues.
    pub fn release_newest_tx_completions(&self, n: usize) {
        let released: Vec<CqEvent> = match self.shared.tx_held.lock().as_mut() {
            Some(held) => {
                let keep = held.len().saturating_sub(n);
                held.drain(keep..).rev().collect()
            }
            None => Vec::new(),
        };
        self.shared.tx_cq.lock().extend(released);
    }

    /// Stops holding and moves everything parked onto the CQ in posting order.
    pub fn release_tx_completions(&self) {
        let released = self.shared.tx_held.lock().take().unwrap_or_default();
        self.shared.tx_cq.lock().extend(released);
    }

    pub fn posted_receives(&self) -> usize {
        self.shared.rx.lock().posted.len()
    }

    pub fn unexpected_messages(&self) -> usize {
        self.shared.rx.lock().unexpected.len()
    }

    fn resolve(
        &self,
        addr: FabricAddr,
        context: &'static str,
    ) -> std::result::Result<Arc<EndpointShared>, FabricError> {
        let locality = self
            .shared
            .av
            .lock()
            .peers
            .get(addr.0 as usize)
            .copied()
            .ok_or(FabricError::new(FI_ENOENT, context))?;
        self.fabric.lookup(&locality).ok_or(FabricError::new(FI_ENOENT, context))
    }
}

impl FabricEndpoint for LoopbackEndpoint {
    fn locality(&self) -> Locality {
        self.shared.locality
    }

    fn domain(&self) -> Arc<dyn FabricDomain> {
        self.shared.domain.clone()
    }

    fn insert_address(&self, locality: &Locality) -> Result<FabricAddr> {
        let mut av = self.shared.av.lock();
        if let Some(addr) = av.index.get(locality) {
            return Ok(*addr);
        }
        let addr = FabricAddr(av.peers.len() as u64);
        av.peers.push(*locality);
        av.index.insert(*locality, addr);
        Ok(addr)
    }

    fn post_recv(
        &self,
        op: RecvOp,
        context: CompletionContext,
    ) -> std::result::Result<(), FabricError> {
        let shared = &self.shared;
        shared.domain.check_local(op.desc, op.ptr, op.len, true, "fi_recv: bad descriptor")?;
        shared.acquire_credit(&shared.rx_in_flight, shared.config.rx_depth, "fi_recv")?;
        let posted = PostedRecv { ptr: op.ptr, len: op.len, context };
        let unexpected = {
            let mut rx = shared.rx.lock();
            match rx.unexpected.pop_front() {
                Some(msg) => msg,
                None => {
                    rx.posted.push_back(posted);
                    return Ok(());
                }
            }
        };
        shared.complete_recv(posted, unexpected.from, &unexpected.data);
        Ok(())
    }

    fn post_send(
        &self,
        op: SendOp,
        dest: FabricAddr,
        context: CompletionContext,
    ) -> std::result::Result<(), FabricError> {
        let shared = &self.shared;
        for seg in &op.segments {
            shared.domain.check_local(
                seg.desc,
                seg.ptr,
                seg.len,
                false,
                "fi_sendmsg: bad descriptor",
            )?;
        }
        let remote = self.resolve(dest, "fi_sendmsg: unknown destination")?;
        shared.acquire_credit(&shared.tx_in_flight, shared.config.tx_depth, "fi_sendmsg")?;

        let mut data = Vec::with_capacity(op.total_len());
        for seg in &op.segments {
            // SAFETY: segments are registered and valid until completion.
            data.extend_from_slice(unsafe {
                std::slice::from_raw_parts(seg.ptr.as_ptr(), seg.len)
            });
        }
        remote.deliver(shared.locality, &data);
        shared.push_tx(CqEvent::Completion(CompletionEntry {
            context,
            flags: CompletionFlags::MSG | CompletionFlags::SEND,
            len: data.len(),
            src: None,
        }));
        Ok(())
    }

    fn inject(
        &self,
        data: &[u8],
        dest: FabricAddr,
        context: CompletionContext,
    ) -> std::result::Result<(), FabricError> {
        let shared = &self.shared;
        let remote = self.resolve(dest, "fi_inject: unknown destination")?;
        shared.acquire_credit(&shared.tx_in_flight, shared.config.tx_depth, "fi_inject")?;
        remote.deliver(shared.locality, data);
        shared.push_tx(CqEvent::Completion(CompletionEntry {
            context,
            flags: CompletionFlags::MSG | CompletionFlags::SEND,
            len: data.len(),
            src: None,
        }));
        Ok(())
    }

    fn post_read(
        &self,
        op: ReadOp,
        src: FabricAddr,
        context: CompletionContext,
    ) -> std::result::Result<(), FabricError> {
        let shared = &self.shared;
        shared.domain.check_local(op.desc, op.ptr, op.len, true, "fi_read: bad descriptor")?;
        let remote = self.resolve(src, "fi_read: unknown source")?;
        shared.acquire_credit(&shared.tx_in_flight, shared.config.tx_depth, "fi_read")?;
        let flags = CompletionFlags::RMA | CompletionFlags::READ;
        let event = match remote.domain.resolve_remote_read(op.rkey, op.remote_addr, op.len) {
            Ok(source) => {
                // SAFETY: the source lies within a live remote registration
                // and the destination within a local one.
                unsafe {
                    std::ptr::copy_nonoverlapping(source.as_ptr(), op.ptr.as_ptr(), op.len);
                }
                CqEvent::Completion(CompletionEntry { context, flags, len: op.len, src: None })
            }
            Err(error) => CqEvent::Error { context, flags, error },
        };
        trace!(locality = %shared.locality, rkey = op.rkey.0, len = op.len, "loopback read");
        shared.push_tx(event);
        Ok(())
    }

    fn read_tx_cq(&self) -> Option<CqEvent> {
        let event = self.shared.tx_cq.lock().pop_front()?;
        self.shared.tx_in_flight.fetch_sub(1, Ordering::AcqRel);
        Some(event)
    }

    fn read_rx_cq(&self) -> Option<CqEvent> {
        let event = self.shared.rx_cq.lock().pop_front()?;
        self.shared.rx_in_flight.fetch_sub(1, Ordering::AcqRel);
        Some(event)
    }
}

impl Drop for LoopbackEndpoint {
    fn drop(&mut self) {
        self.fabric.remove(&self.shared.locality);
    }
}
