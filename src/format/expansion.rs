//! Compact-to-expanded vertex mapping for skinned segments.
//!
//! Skinned segments store each distinct vertex once ("compact") and
//! duplicate it at seams when expanding into the output vertex buffer. Each
//! entry packs the duplication count with the first output slot:
//! `(count << 24) | write_offset`.

use byteorder::{ByteOrder, LittleEndian};

use crate::util::{Error, Result};

/// Largest output slot representable in an entry.
pub const MAX_WRITE_OFFSET: u32 = 0x00FF_FFFF;

#[inline]
pub const fn pack_entry(count: u8, write_offset: u32) -> u32 {
    ((count as u32) << 24) | (write_offset & MAX_WRITE_OFFSET)
}

/// `(count, write_offset)` of a packed entry.
#[inline]
pub const fn unpack_entry(entry: u32) -> (u32, u32) {
    (entry >> 24, entry & MAX_WRITE_OFFSET)
}

/// Materialised expansion table, one entry per compact vertex.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExpansionTable {
    entries: Vec<u32>,
}

impl ExpansionTable {
    /// Build from per-vertex duplication counts (legacy run-length list).
    ///
    /// Fails if the running offset outgrows the 24-bit field.
    pub fn from_run_lengths(counts: &[u8]) -> Result<Self> {
        let mut entries = Vec::with_capacity(counts.len());
        let mut write_location = 0u32;
        for &count in counts {
            if write_location > MAX_WRITE_OFFSET {
                return Err(Error::invalid(format!(
                    "expansion write offset {write_location} exceeds 24 bits"
                )));
            }
            entries.push(pack_entry(count, write_location));
            write_location += count as u32;
        }
        Ok(Self { entries })
    }

    /// Wrap already packed entries.
    pub fn from_entries(entries: Vec<u32>) -> Self {
        Self { entries }
    }

    /// Read packed little-endian entries from a write table.
    pub fn from_le_bytes(bytes: &[u8]) -> Self {
        let mut entries = vec![0u32; bytes.len() / 4];
        LittleEndian::read_u32_into(&bytes[..entries.len() * 4], &mut entries);
        Self { entries }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn entries(&self) -> &[u32] {
        &self.entries
    }

    /// `(count, write_offset)` for compact vertex `v`.
    #[inline]
    pub fn entry(&self, v: usize) -> Option<(u32, u32)> {
        self.entries.get(v).copied().map(unpack_entry)
    }

    /// Number of output vertices the table writes.
    pub fn expanded_len(&self) -> u64 {
        self.entries
            .iter()
            .map(|&e| {
                let (count, offset) = unpack_entry(e);
                offset as u64 + count as u64
            })
            .max()
            .unwrap_or(0)
    }

    /// Serialise as a little-endian write table.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.entries.len() * 4];
        LittleEndian::write_u32_into(&self.entries, &mut out);
        out
    }

    /// Output slots written for every compact vertex, in compact order.
    pub fn write_offsets(&self) -> Vec<u32> {
        let mut out = Vec::new();
        for &e in &self.entries {
            let (count, offset) = unpack_entry(e);
            out.extend(offset..offset + count);
        }
        out
    }
}

/// Check that a write table stays inside `vertex_count` output slots.
pub(crate) fn validate_table_entries(
    bytes: &[u8],
    vertex_count: u32,
) -> Result<()> {
    for chunk in bytes.chunks_exact(4) {
        let (count, offset) = unpack_entry(LittleEndian::read_u32(chunk));
        if offset as u64 + count as u64 > vertex_count as u64 {
            return Err(Error::invalid(format!(
                "expansion entry writes {count} vertices at {offset}, segment has {vertex_count}"
            )));
        }
    }
    Ok(())
}
