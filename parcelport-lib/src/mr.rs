use std::{ptr::NonNull, sync::Arc};

use bytes::Bytes;

use crate::{
    api::{MemoryRegionLocalDescriptor, MemoryRegionRemoteKey},
    error::{ParcelportError, Result},
    provider::{FabricDomain, MrAccess, Registration},
};

enum Storage {
    /// Heap block owned by the region. Held as a raw pointer because the
    /// fabric writes into it behind our back while a receive or read is posted.
    Owned { ptr: NonNull<u8>, len: usize },
    /// Caller-owned zero-copy buffer, registered in place for remote reads.
    Borrowed(Bytes),
}

/// A block of memory registered with a fabric domain.
///
/// Dropping the region deregisters it. Pooled regions are recycled through
/// [`MemoryPool::deallocate`](crate::MemoryPool::deallocate) instead.
pub struct MemoryRegion {
    storage: Storage,
    registration: Registration,
    domain: Arc<dyn FabricDomain>,
    class: Option<usize>,
    message_length: usize,
}

unsafe impl Send for MemoryRegion {}
unsafe impl Sync for MemoryRegion {}

impl MemoryRegion {
    pub(crate) fn allocate(
        domain: Arc<dyn FabricDomain>,
        len: usize,
        class: Option<usize>,
    ) -> Result<Self> {
        let len = len.max(1);
        let block = vec![0u8; len].into_boxed_slice();
        // SAFETY: Box::into_raw never returns null.
        let ptr = unsafe { NonNull::new_unchecked(Box::into_raw(block) as *mut u8) };
        let storage = Storage::Owned { ptr, len };
        let registration = match domain.register(ptr, len, MrAccess::ReadWrite) {
            Ok(r) => r,
            Err(e) => {
                free_owned(ptr, len);
                return Err(e);
            }
        };
        Ok(Self { storage, registration, domain, class, message_length: 0 })
    }

    pub(crate) fn register_bytes(domain: Arc<dyn FabricDomain>, bytes: Bytes) -> Result<Self> {
        if bytes.is_empty() {
            return Err(ParcelportError::Registration(
                "cannot register an empty buffer".to_string(),
            ));
        }
        // SAFETY: non-empty Bytes always point at valid memory.
        let ptr = unsafe { NonNull::new_unchecked(bytes.as_ptr() as *mut u8) };
        let registration = domain.register(ptr, bytes.len(), MrAccess::RemoteRead)?;
        let message_length = bytes.len();
        Ok(Self {
            storage: Storage::Borrowed(bytes),
            registration,
            domain,
            class: None,
            message_length,
        })
    }

    pub fn ptr(&self) -> NonNull<u8> {
        match &self.storage {
            Storage::Owned { ptr, .. } => *ptr,
            // SAFETY: registered Bytes are never empty.
            Storage::Borrowed(b) => unsafe { NonNull::new_unchecked(b.as_ptr() as *mut u8) },
        }
    }

    pub fn addr(&self) -> u64 {
        self.ptr().as_ptr() as u64
    }

    /// Capacity in bytes.
    pub fn len(&self) -> usize {
        match &self.storage {
            Storage::Owned { len, .. } => *len,
            Storage::Borrowed(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn desc(&self) -> MemoryRegionLocalDescriptor {
        self.registration.desc
    }

    pub fn rkey(&self) -> MemoryRegionRemoteKey {
        self.registration.rkey
    }

    /// Size of the logical payload, which may be below the capacity.
    pub fn message_length(&self) -> usize {
        self.message_length
    }

    pub fn set_message_length(&mut self, len: usize) {
        debug_assert!(len <= self.len(), "message length {} > capacity {}", len, self.len());
        self.message_length = len;
    }

    pub(crate) fn domain(&self) -> &Arc<dyn FabricDomain> {
        &self.domain
    }

    /// Pool class the region belongs to, `None` for ad hoc regions.
    pub fn class(&self) -> Option<usize> {
        self.class
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the region owns or borrows `len` valid bytes.
        unsafe { std::slice::from_raw_parts(self.ptr().as_ptr(), self.len()) }
    }

    /// The first `message_length` bytes.
    pub fn message(&self) -> &[u8] {
        &self.as_slice()[..self.message_length]
    }

    pub fn as_mut_slice(&mut self) -> Result<&mut [u8]> {
        match &self.storage {
            // SAFETY: `&mut self` guarantees no other access from Rust.
            Storage::Owned { ptr, len } => {
                Ok(unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), *len) })
            }
            Storage::Borrowed(_) => Err(ParcelportError::Custom("region is read-only")),
        }
    }
}

impl std::fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("len", &self.len())
            .field("message_length", &self.message_length)
            .field("rkey", &self.registration.rkey)
            .field("class", &self.class)
            .finish()
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        self.domain.deregister(&self.registration);
        if let Storage::Owned { ptr, len } = self.storage {
            free_owned(ptr, len);
        }
    }
}

fn free_owned(ptr: NonNull<u8>, len: usize) {
    // SAFETY: `ptr` came from Box::into_raw of a boxed slice of `len` bytes.
    unsafe {
        drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(ptr.as_ptr(), len)));
    }
}
