use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use bytes::Bytes;
use crossbeam_queue::SegQueue;
use tracing::{debug, warn};

use crate::{
    config::ParcelportConfig,
    error::{ParcelportError, Result},
    mr::MemoryRegion,
    provider::FabricDomain,
};

struct SizeClass {
    capacity: usize,
    free: SegQueue<MemoryRegion>,
    registered: AtomicUsize,
    outstanding: AtomicUsize,
    high_water: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassStats {
    pub capacity: usize,
    /// Regions of this class currently registered, free or handed out.
    pub registered: usize,
    pub outstanding: usize,
    /// Most regions of this class ever handed out at the same time.
    pub high_water: usize,
}

/// Pool of registered regions.
///
/// Requests are rounded up to the smallest class that fits and served from
/// that class's free list, registering `refill_batch` new regions when the
/// list is empty. Requests above the largest class get an exact-size region
/// that is deregistered again on `deallocate`.
pub struct MemoryPool {
    domain: Arc<dyn FabricDomain>,
    classes: Box<[SizeClass]>,
    refill_batch: usize,
    ad_hoc_outstanding: AtomicUsize,
}

impl MemoryPool {
    pub fn new(domain: Arc<dyn FabricDomain>, config: &ParcelportConfig) -> Result<Self> {
        config.validate().map_err(ParcelportError::Custom)?;
        let classes = config
            .size_classes
            .iter()
            .map(|&capacity| SizeClass {
                capacity,
                free: SegQueue::new(),
                registered: AtomicUsize::new(0),
                outstanding: AtomicUsize::new(0),
                high_water: AtomicUsize::new(0),
            })
            .collect();
        let pool = Self {
            domain,
            classes,
            refill_batch: config.refill_batch,
            ad_hoc_outstanding: AtomicUsize::new(0),
        };
        for (index, &count) in config.regions_per_class.iter().enumerate() {
            for _ in 0..count {
                let region = pool.register_class_region(index)?;
                pool.classes[index].free.push(region);
            }
        }
        debug!(
            domain = pool.domain.name(),
            classes = ?config.size_classes,
            prealloc = ?config.regions_per_class,
            "MemoryPool::new"
        );
        Ok(pool)
    }

    /// Capacity of the smallest class.
    pub fn small_chunk_size(&self) -> usize {
        self.classes[0].capacity
    }

    pub fn domain(&self) -> &Arc<dyn FabricDomain> {
        &self.domain
    }

    /// Returns a region with capacity of at least `size` and its message
    /// length set to `size`.
    pub fn allocate_region(&self, size: usize) -> Result<MemoryRegion> {
        let Some(index) = self.classes.iter().position(|c| c.capacity >= size) else {
            let mut region = MemoryRegion::allocate(self.domain.clone(), size, None)?;
            region.set_message_length(size);
            self.ad_hoc_outstanding.fetch_add(1, Ordering::Relaxed);
            debug!(size, addr = region.addr(), "allocated ad hoc region");
            return Ok(region);
        };

        let class = &self.classes[index];
        let mut region = match class.free.pop() {
            Some(region) => region,
            None => self.refill(index)?,
        };
        region.set_message_length(size);
        let outstanding = class.outstanding.fetch_add(1, Ordering::AcqRel) + 1;
        class.high_water.fetch_max(outstanding, Ordering::AcqRel);
        Ok(region)
    }

    /// Registers a caller-owned buffer in place. The region counts as ad hoc
    /// and is deregistered on `deallocate`.
    pub fn register_bytes(&self, bytes: Bytes) -> Result<MemoryRegion> {
        let region = MemoryRegion::register_bytes(self.domain.clone(), bytes)?;
        self.ad_hoc_outstanding.fetch_add(1, Ordering::Relaxed);
        Ok(region)
    }

    pub fn deallocate(&self, mut region: MemoryRegion) {
        if !std::ptr::addr_eq(Arc::as_ptr(region.domain()), Arc::as_ptr(&self.domain)) {
            warn!(?region, "deallocating a region from a different domain, dropping it");
            return;
        }
        match region.class() {
            Some(index) if index < self.classes.len() => {
                let class = &self.classes[index];
                region.set_message_length(0);
                class.free.push(region);
                class.outstanding.fetch_sub(1, Ordering::AcqRel);
            }
            Some(_) => {
                warn!(?region, "region class out of range, dropping it");
            }
            None => {
                self.ad_hoc_outstanding.fetch_sub(1, Ordering::Relaxed);
                drop(region);
            }
        }
    }

    pub fn class_stats(&self) -> Vec<ClassStats> {
        self.classes
            .iter()
            .map(|c| ClassStats {
                capacity: c.capacity,
                registered: c.registered.load(Ordering::Acquire),
                outstanding: c.outstanding.load(Ordering::Acquire),
                high_water: c.high_water.load(Ordering::Acquire),
            })
            .collect()
    }

    pub fn ad_hoc_outstanding(&self) -> usize {
        self.ad_hoc_outstanding.load(Ordering::Relaxed)
    }

    /// Total regions handed out and not yet returned.
    pub fn outstanding(&self) -> usize {
        self.classes.iter().map(|c| c.outstanding.load(Ordering::Acquire)).sum::<usize>()
            + self.ad_hoc_outstanding()
    }

    fn refill(&self, index: usize) -> Result<MemoryRegion> {
        let first = self.register_class_region(index)?;
        for _ in 1..self.refill_batch {
            match self.register_class_region(index) {
                Ok(region) => self.classes[index].free.push(region),
                // The first region already satisfies the request.
                Err(e) => {
                    warn!(error = %e, class = index, "partial refill");
                    break;
                }
            }
        }
        debug!(
            class = index,
            capacity = self.classes[index].capacity,
            registered = self.classes[index].registered.load(Ordering::Relaxed),
            "refilled size class"
        );
        Ok(first)
    }

    fn register_class_region(&self, index: usize) -> Result<MemoryRegion> {
        let class = &self.classes[index];
        let region = MemoryRegion::allocate(self.domain.clone(), class.capacity, Some(index))?;
        class.registered.fetch_add(1, Ordering::AcqRel);
        Ok(region)
    }
}
