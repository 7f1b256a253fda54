//! In-process fabric provider.
//!
//! Endpoints opened on the same [`LoopbackFabric`] exchange messages and
//! serve RDMA reads out of each other's registered memory. Everything the
//! engine relies on from a real provider is reproduced: posted receives are
//! matched in FIFO order, queue depth is bounded (posts beyond it return
//! EAGAIN until completions are read), and bad keys or short buffers surface
//! as completion queue error entries.

mod loopback_domain;
mod loopback_endpoint;

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use dashmap::DashMap;
use serde::Deserialize;
use tracing::debug;

pub use loopback_domain::LoopbackDomain;
pub use loopback_endpoint::LoopbackEndpoint;
use loopback_endpoint::EndpointShared;

use crate::api::{LOCALITY_LEN, Locality};

static FABRIC_IDS: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoopbackConfig {
    /// Send, inject and read operations in flight before posts return EAGAIN.
    pub tx_depth: usize,
    /// Receives posted before further posts return EAGAIN.
    pub rx_depth: usize,
    /// Number of posts that fail with EAGAIN right after the endpoint opens.
    pub again_budget: usize,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self { tx_depth: 256, rx_depth: 256, again_budget: 0 }
    }
}

impl LoopbackConfig {
    pub fn with_tx_depth(mut self, depth: usize) -> Self {
        self.tx_depth = depth;
        self
    }

    pub fn with_rx_depth(mut self, depth: usize) -> Self {
        self.rx_depth = depth;
        self
    }

    pub fn with_again_budget(mut self, budget: usize) -> Self {
        self.again_budget = budget;
        self
    }
}

pub struct LoopbackFabric {
    id: u64,
    endpoints: DashMap<Locality, Arc<EndpointShared>>,
    next_endpoint: AtomicU64,
}

impl LoopbackFabric {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: FABRIC_IDS.fetch_add(1, Ordering::Relaxed),
            endpoints: DashMap::new(),
            next_endpoint: AtomicU64::new(0),
        })
    }

    pub fn open_endpoint(self: &Arc<Self>, config: LoopbackConfig) -> Arc<LoopbackEndpoint> {
        let index = self.next_endpoint.fetch_add(1, Ordering::Relaxed);
        let mut bytes = [0u8; LOCALITY_LEN];
        bytes[..8].copy_from_slice(&self.id.to_le_bytes());
        bytes[8..].copy_from_slice(&index.to_le_bytes());
        let locality = Locality::from_bytes(bytes);

        let shared = Arc::new(EndpointShared::new(locality, config));
        self.endpoints.insert(locality, shared.clone());
        debug!(%locality, "opened loopback endpoint");
        Arc::new(LoopbackEndpoint::new(self.clone(), shared))
    }

    /// Number of endpoints currently open.
    pub fn num_endpoints(&self) -> usize {
        self.endpoints.len()
    }

    fn lookup(&self, locality: &Locality) -> Option<Arc<EndpointShared>> {
        self.endpoints.get(locality).map(|e| e.value().clone())
    }

    fn remove(&self, locality: &Locality) {
        self.endpoints.remove(locality);
    }
}
