pub mod api;
mod config;
mod controller;
mod error;
pub mod header;
mod interface;
pub mod loopback;
mod memory_pool;
mod mr;
mod parcel_buffer;
mod parcelport;
mod poller;
pub mod provider;
mod receiver;
mod rma_receiver;
mod sender;
mod stats;
mod utils;

pub use config::ParcelportConfig;
pub use error::*;
pub use interface::{CallbackResult, Chunk, ParcelDecoder, SendBuffer, SendCallback};
pub use memory_pool::{ClassStats, MemoryPool};
pub use mr::MemoryRegion;
pub use parcel_buffer::{ParcelBuffer, ParcelChunk};
pub use parcelport::Parcelport;
pub use receiver::ACK_LEN;
pub use sender::Connection;
pub use stats::ParcelportStats;
pub use utils::slot_pool::{Handle, SlotPool};

pub use interface::MockParcelDecoder;
