//! Types used in public API

use serde::{Deserialize, Serialize};

use crate::{
    error::ParcelportError,
    utils::hex::{decode_hex_into, fmt_hex},
};

pub type SmallVec<T> = ::smallvec::SmallVec<[T; 4]>;

/// Size of the raw fabric address blob of an endpoint.
pub const LOCALITY_LEN: usize = 16;

/// Fabric address of an endpoint as exchanged during bootstrap.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Locality([u8; LOCALITY_LEN]);

impl Locality {
    pub fn from_bytes(bytes: [u8; LOCALITY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; LOCALITY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for Locality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt_hex(f, &self.0)
    }
}

impl std::fmt::Display for Locality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt_hex(f, &self.0)
    }
}

impl std::str::FromStr for Locality {
    type Err = ParcelportError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut bytes = [0u8; LOCALITY_LEN];
        decode_hex_into(s, &mut bytes)
            .ok_or(ParcelportError::Custom("Invalid locality"))?;
        Ok(Self(bytes))
    }
}

/// Opaque per-peer handle returned by the address vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FabricAddr(pub u64);

/// A remote key for a memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct MemoryRegionRemoteKey(pub u64);

/// A local descriptor for a memory region, passed with every operation that
/// touches the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct MemoryRegionLocalDescriptor(pub u64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locality_hex() {
        let mut raw = [0u8; LOCALITY_LEN];
        raw[0] = 0xab;
        raw[15] = 0x01;
        let loc = Locality::from_bytes(raw);
        let s = loc.to_string();
        assert_eq!(s, "ab000000000000000000000000000001");
        assert_eq!(s.parse::<Locality>().unwrap(), loc);
    }

    #[test]
    fn test_locality_rejects_bad_input() {
        assert!("abc".parse::<Locality>().is_err());
        assert!("zz000000000000000000000000000001".parse::<Locality>().is_err());
        assert!("".parse::<Locality>().is_err());
    }
}
