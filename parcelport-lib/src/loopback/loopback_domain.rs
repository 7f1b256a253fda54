use std::{
    ptr::NonNull,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};

use dashmap::DashMap;
use tracing::trace;

use crate::{
    api::{MemoryRegionLocalDescriptor, MemoryRegionRemoteKey},
    error::{FI_EACCES, FI_EINVAL, FabricError, ParcelportError, Result},
    provider::{FabricDomain, MrAccess, Registration},
};

#[derive(Debug, Clone, Copy)]
struct MrEntry {
    addr: u64,
    len: usize,
    access: MrAccess,
}

/// Memory registration table of one loopback endpoint.
///
/// Keys are unique within the domain and never reused, so a read against a
/// deregistered region fails instead of touching recycled memory.
pub struct LoopbackDomain {
    name: String,
    mrs: DashMap<u64, MrEntry>,
    next_key: AtomicU64,
    fail_budget: AtomicUsize,
}

impl LoopbackDomain {
    pub(crate) fn new(name: String) -> Self {
        Self {
            name,
            mrs: DashMap::new(),
            next_key: AtomicU64::new(1),
            fail_budget: AtomicUsize::new(0),
        }
    }

    /// Makes the next `n` registrations fail.
    pub fn fail_registrations(&self, n: usize) {
        self.fail_budget.fetch_add(n, Ordering::AcqRel);
    }

    /// Number of currently registered regions.
    pub fn live_registrations(&self) -> usize {
        self.mrs.len()
    }

    /// Resolves a remote read of `len` bytes at `addr` under `rkey` to a
    /// source pointer.
    pub(crate) fn resolve_remote_read(
        &self,
        rkey: MemoryRegionRemoteKey,
        addr: u64,
        len: usize,
    ) -> std::result::Result<NonNull<u8>, FabricError> {
        let entry = self
            .mrs
            .get(&rkey.0)
            .map(|e| *e)
            .ok_or(FabricError::new(FI_EACCES, "fi_read: unknown rkey"))?;
        let end = addr.checked_add(len as u64);
        let mr_end = entry.addr + entry.len as u64;
        if addr < entry.addr || end.is_none_or(|end| end > mr_end) {
            return Err(FabricError::new(FI_EACCES, "fi_read: out of registered bounds"));
        }
        NonNull::new(addr as *mut u8).ok_or(FabricError::new(FI_EINVAL, "fi_read: null address"))
    }

    /// Checks that `[ptr, ptr + len)` lies within the region behind `desc`
    /// and, if the fabric writes into it, that the region is writable.
    pub(crate) fn check_local(
        &self,
        desc: MemoryRegionLocalDescriptor,
        ptr: NonNull<u8>,
        len: usize,
        write: bool,
        context: &'static str,
    ) -> std::result::Result<(), FabricError> {
        let entry = self
            .mrs
            .get(&desc.0)
            .map(|e| *e)
            .ok_or(FabricError::new(FI_EINVAL, context))?;
        let addr = ptr.as_ptr() as u64;
        if addr < entry.addr || addr + len as u64 > entry.addr + entry.len as u64 {
            return Err(FabricError::new(FI_EINVAL, context));
        }
        if write && entry.access != MrAccess::ReadWrite {
            return Err(FabricError::new(FI_EACCES, context));
        }
        Ok(())
    }
}

impl FabricDomain for LoopbackDomain {
    fn name(&self) -> &str {
        &self.name
    }

    fn register(
        &self,
        ptr: NonNull<u8>,
        len: usize,
        access: MrAccess,
    ) -> Result<Registration> {
        if len == 0 {
            return Err(ParcelportError::Registration("zero-length region".to_string()));
        }
        if self
            .fail_budget
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ParcelportError::Registration("injected failure".to_string()));
        }
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let addr = ptr.as_ptr() as u64;
        self.mrs.insert(key, MrEntry { addr, len, access });
        trace!(domain = %self.name, key, addr, len, ?access, "fi_mr_reg");
        Ok(Registration {
            desc: MemoryRegionLocalDescriptor(key),
            rkey: MemoryRegionRemoteKey(key),
        })
    }

    fn deregister(&self, registration: &Registration) {
        self.mrs.remove(&registration.desc.0);
    }
}
