pub mod hex;
pub mod slot_pool;
