//! Binary layout of the message header placed at the start of a send buffer.
//!
//! ```text
//! 0   size           u64  payload length
//! 8   num_zero_copy  u32
//! 12  num_normal     u32
//! 16  header_length  u32  fixed part + chunk table + inline chunk bytes
//! 20  flags          u32  HAS_CHUNK_TABLE | PIGGYBACK
//! 24  tag            u64  sender correlation tag
//! 32  rdma_addr      u64  payload address when not piggybacked
//! 40  rdma_rkey      u64
//! 48  rdma_len       u64
//! 56  chunk table    32 bytes per chunk
//!     inline bytes   8-byte aligned
//!     payload        only when piggybacked
//! ```
//!
//! All fields are little endian.

use crate::{
    api::MemoryRegionRemoteKey,
    error::{ParcelportError, Result},
};

const OFF_SIZE: usize = 0;
const OFF_NUM_ZERO_COPY: usize = 8;
const OFF_NUM_NORMAL: usize = 12;
const OFF_HEADER_LEN: usize = 16;
const OFF_FLAGS: usize = 20;
const OFF_TAG: usize = 24;
const OFF_RDMA_ADDR: usize = 32;
const OFF_RDMA_RKEY: usize = 40;
const OFF_RDMA_LEN: usize = 48;

pub const HEADER_FIXED_LEN: usize = 56;
pub const CHUNK_DESCRIPTOR_LEN: usize = 32;

const CHUNK_OFF_KIND: usize = 0;
const CHUNK_OFF_SIZE: usize = 8;
const CHUNK_OFF_RKEY: usize = 16;
const CHUNK_OFF_ADDR: usize = 24;

const FLAG_HAS_CHUNK_TABLE: u32 = 1 << 0;
const FLAG_PIGGYBACK: u32 = 1 << 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ChunkKind {
    /// Normal chunk stored in the payload. `addr` is the payload offset.
    Index = 0,
    /// Zero-copy chunk fetched by RDMA read. `addr` is the remote address on
    /// the wire and the local address after the receiver rewrites it.
    Pointer = 1,
    /// Normal chunk whose bytes follow the chunk table. `addr` is the offset
    /// from the start of the header.
    Inline = 2,
}

impl ChunkKind {
    fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Index),
            1 => Some(Self::Pointer),
            2 => Some(Self::Inline),
            _ => None,
        }
    }

    pub fn is_zero_copy(self) -> bool {
        self == Self::Pointer
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub kind: ChunkKind,
    pub size: u64,
    pub rkey: MemoryRegionRemoteKey,
    pub addr: u64,
}

impl ChunkDescriptor {
    pub fn index(offset: u64, size: u64) -> Self {
        Self { kind: ChunkKind::Index, size, rkey: MemoryRegionRemoteKey(0), addr: offset }
    }

    pub fn pointer(addr: u64, size: u64, rkey: MemoryRegionRemoteKey) -> Self {
        Self { kind: ChunkKind::Pointer, size, rkey, addr }
    }

    /// `addr` is filled in by [`encode`].
    pub fn inline(size: u64) -> Self {
        Self { kind: ChunkKind::Inline, size, rkey: MemoryRegionRemoteKey(0), addr: 0 }
    }
}

/// Where the receiver fetches a payload that was not piggybacked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RdmaTarget {
    pub addr: u64,
    pub rkey: MemoryRegionRemoteKey,
    pub len: u64,
}

pub struct HeaderSpec<'a> {
    pub tag: u64,
    pub payload: &'a [u8],
    /// Used when the payload does not fit behind the header.
    pub payload_target: RdmaTarget,
    pub chunks: &'a [ChunkDescriptor],
    /// Bytes of each `Inline` chunk, in table order.
    pub inline_data: &'a [&'a [u8]],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodedHeader {
    pub header_length: usize,
    pub piggyback: bool,
}

fn align8(n: usize) -> usize {
    n.next_multiple_of(8)
}

/// Bytes occupied by a header with `num_chunks` descriptors and the given
/// inline chunk sizes, excluding a piggybacked payload.
pub fn header_length(num_chunks: usize, inline_sizes: impl IntoIterator<Item = usize>) -> usize {
    HEADER_FIXED_LEN
        + num_chunks * CHUNK_DESCRIPTOR_LEN
        + inline_sizes.into_iter().map(align8).sum::<usize>()
}

/// Checks that the chunk table for `num_chunks` descriptors fits `budget`.
pub fn check_chunk_table(num_chunks: usize, budget: usize) -> Result<()> {
    let needed = header_length(num_chunks, []);
    if needed > budget {
        return Err(ParcelportError::HeaderOverflow { num_chunks, needed, budget });
    }
    Ok(())
}

/// Writes the header into `buf`, deciding whether the payload is
/// piggybacked. `buf.len()` is the header budget. The payload bytes are not
/// copied; a piggybacked payload is sent as a second segment right behind
/// the header.
pub fn encode(buf: &mut [u8], spec: &HeaderSpec<'_>) -> Result<EncodedHeader> {
    let budget = buf.len();
    check_chunk_table(spec.chunks.len(), budget)?;

    let inline_count = spec.chunks.iter().filter(|c| c.kind == ChunkKind::Inline).count();
    if inline_count != spec.inline_data.len() {
        return Err(ParcelportError::Custom("inline chunk count mismatch"));
    }
    let header_len =
        header_length(spec.chunks.len(), spec.inline_data.iter().map(|d| d.len()));
    if header_len > budget {
        return Err(ParcelportError::HeaderOverflow {
            num_chunks: spec.chunks.len(),
            needed: header_len,
            budget,
        });
    }
    let piggyback = header_len + spec.payload.len() <= budget;

    let num_zero_copy = spec.chunks.iter().filter(|c| c.kind.is_zero_copy()).count();
    let num_normal = spec.chunks.len() - num_zero_copy;
    let mut flags = 0;
    if !spec.chunks.is_empty() {
        flags |= FLAG_HAS_CHUNK_TABLE;
    }
    if piggyback {
        flags |= FLAG_PIGGYBACK;
    }

    put_u64(buf, OFF_SIZE, spec.payload.len() as u64);
    put_u32(buf, OFF_NUM_ZERO_COPY, num_zero_copy as u32);
    put_u32(buf, OFF_NUM_NORMAL, num_normal as u32);
    put_u32(buf, OFF_HEADER_LEN, header_len as u32);
    put_u32(buf, OFF_FLAGS, flags);
    put_u64(buf, OFF_TAG, spec.tag);
    let target = if piggyback {
        RdmaTarget { addr: 0, rkey: MemoryRegionRemoteKey(0), len: 0 }
    } else {
        spec.payload_target
    };
    put_u64(buf, OFF_RDMA_ADDR, target.addr);
    put_u64(buf, OFF_RDMA_RKEY, target.rkey.0);
    put_u64(buf, OFF_RDMA_LEN, target.len);

    let mut inline_off = header_length(spec.chunks.len(), []);
    let mut inline_data = spec.inline_data.iter();
    for (i, chunk) in spec.chunks.iter().enumerate() {
        let mut chunk = *chunk;
        if chunk.kind == ChunkKind::Inline {
            let data = inline_data.next().ok_or(ParcelportError::Custom("missing inline data"))?;
            buf[inline_off..inline_off + data.len()].copy_from_slice(data);
            chunk.addr = inline_off as u64;
            chunk.size = data.len() as u64;
            inline_off += align8(data.len());
        }
        write_chunk(buf, HEADER_FIXED_LEN + i * CHUNK_DESCRIPTOR_LEN, &chunk);
    }

    Ok(EncodedHeader { header_length: header_len, piggyback })
}

fn write_chunk(buf: &mut [u8], off: usize, chunk: &ChunkDescriptor) {
    put_u32(buf, off + CHUNK_OFF_KIND, chunk.kind as u32);
    put_u32(buf, off + CHUNK_OFF_KIND + 4, 0);
    put_u64(buf, off + CHUNK_OFF_SIZE, chunk.size);
    put_u64(buf, off + CHUNK_OFF_RKEY, chunk.rkey.0);
    put_u64(buf, off + CHUNK_OFF_ADDR, chunk.addr);
}

/// Read-only view over a received header.
#[derive(Clone, Copy)]
pub struct HeaderView<'a> {
    buf: &'a [u8],
}

impl<'a> HeaderView<'a> {
    /// Validates the received bytes in `buf` as a header.
    pub fn parse(buf: &'a [u8]) -> Result<Self> {
        if buf.len() < HEADER_FIXED_LEN {
            return Err(ParcelportError::Custom("truncated header"));
        }
        let view = Self { buf };
        let header_len = view.header_length();
        let num_chunks = view.num_chunks_total();
        if header_len > buf.len() || header_length(num_chunks, []) > header_len {
            return Err(ParcelportError::Custom("header length out of bounds"));
        }
        if view.is_piggyback() {
            let end = usize::try_from(view.size()).ok().and_then(|n| header_len.checked_add(n));
            if end.is_none_or(|end| end > buf.len()) {
                return Err(ParcelportError::Custom("piggybacked payload out of bounds"));
            }
        } else if get_u64(buf, OFF_RDMA_LEN) != view.size() {
            return Err(ParcelportError::Custom("rdma length does not match payload size"));
        }
        for i in 0..num_chunks {
            let off = HEADER_FIXED_LEN + i * CHUNK_DESCRIPTOR_LEN;
            let kind = ChunkKind::from_u32(get_u32(buf, off + CHUNK_OFF_KIND))
                .ok_or(ParcelportError::Custom("unknown chunk type"))?;
            let start = get_u64(buf, off + CHUNK_OFF_ADDR);
            let size = get_u64(buf, off + CHUNK_OFF_SIZE);
            let end = start.checked_add(size);
            match kind {
                ChunkKind::Inline if end.is_none_or(|end| end > header_len as u64) => {
                    return Err(ParcelportError::Custom("inline chunk out of bounds"));
                }
                ChunkKind::Index if end.is_none_or(|end| end > view.size()) => {
                    return Err(ParcelportError::Custom("index chunk out of bounds"));
                }
                _ => {}
            }
        }
        let zero_copy = view.num_chunks().0 as usize;
        if view.chunks().filter(|c| c.kind.is_zero_copy()).count() != zero_copy {
            return Err(ParcelportError::Custom("zero-copy count mismatch"));
        }
        Ok(view)
    }

    pub fn size(&self) -> u64 {
        get_u64(self.buf, OFF_SIZE)
    }

    /// (zero-copy, normal) chunk counts.
    pub fn num_chunks(&self) -> (u32, u32) {
        (get_u32(self.buf, OFF_NUM_ZERO_COPY), get_u32(self.buf, OFF_NUM_NORMAL))
    }

    fn num_chunks_total(&self) -> usize {
        let (z, n) = self.num_chunks();
        z as usize + n as usize
    }

    pub fn header_length(&self) -> usize {
        get_u32(self.buf, OFF_HEADER_LEN) as usize
    }

    pub fn tag(&self) -> u64 {
        get_u64(self.buf, OFF_TAG)
    }

    pub fn has_chunk_table(&self) -> bool {
        get_u32(self.buf, OFF_FLAGS) & FLAG_HAS_CHUNK_TABLE != 0
    }

    pub fn is_piggyback(&self) -> bool {
        get_u32(self.buf, OFF_FLAGS) & FLAG_PIGGYBACK != 0
    }

    pub fn piggyback(&self) -> Option<&'a [u8]> {
        if !self.is_piggyback() {
            return None;
        }
        let start = self.header_length();
        Some(&self.buf[start..start + self.size() as usize])
    }

    pub fn message_rdma(&self) -> Option<RdmaTarget> {
        if self.is_piggyback() {
            return None;
        }
        Some(RdmaTarget {
            addr: get_u64(self.buf, OFF_RDMA_ADDR),
            rkey: MemoryRegionRemoteKey(get_u64(self.buf, OFF_RDMA_RKEY)),
            len: get_u64(self.buf, OFF_RDMA_LEN),
        })
    }

    /// Descriptor `i` of the chunk table, `None` past the end.
    pub fn chunk(&self, i: usize) -> Option<ChunkDescriptor> {
        if i >= self.num_chunks_total() {
            return None;
        }
        let off = HEADER_FIXED_LEN + i * CHUNK_DESCRIPTOR_LEN;
        Some(ChunkDescriptor {
            kind: ChunkKind::from_u32(get_u32(self.buf, off + CHUNK_OFF_KIND))?,
            size: get_u64(self.buf, off + CHUNK_OFF_SIZE),
            rkey: MemoryRegionRemoteKey(get_u64(self.buf, off + CHUNK_OFF_RKEY)),
            addr: get_u64(self.buf, off + CHUNK_OFF_ADDR),
        })
    }

    pub fn chunks(&self) -> impl Iterator<Item = ChunkDescriptor> + '_ {
        (0..self.num_chunks_total()).filter_map(|i| self.chunk(i))
    }

    /// Bytes of an `Inline` chunk.
    pub fn inline_data(&self, chunk: &ChunkDescriptor) -> &'a [u8] {
        let start = chunk.addr as usize;
        &self.buf[start..start + chunk.size as usize]
    }
}

impl std::fmt::Debug for HeaderView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Header")
            .field("size", &self.size())
            .field("num_chunks", &self.num_chunks())
            .field("header_length", &self.header_length())
            .field("piggyback", &self.is_piggyback())
            .field("tag", &format_args!("{:#x}", self.tag()))
            .finish()
    }
}

fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

fn get_u32(buf: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[off..off + 4]);
    u32::from_le_bytes(b)
}

fn get_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}
