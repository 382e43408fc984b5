//! Checksum utilities for the tinyblob engine
//!
//! The index and repair wire formats carry IEEE CRC32 checksums of object
//! payloads; this module wraps the one implementation everything shares.

/// Compute the IEEE CRC32 of a byte slice
#[inline]
#[must_use]
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Verify a byte slice against an expected IEEE CRC32
#[inline]
#[must_use]
pub fn verify_crc32(data: &[u8], expected: u32) -> bool {
    crc32fast::hash(data) == expected
}

/// Streaming CRC32 calculator
///
/// Used where the checksummed bytes are produced incrementally, e.g. the
/// per-chunk checksum aggregate in store snapshots.
pub struct Crc32Builder {
    hasher: crc32fast::Hasher,
}

impl Crc32Builder {
    /// Create a new calculator
    #[must_use]
    pub fn new() -> Self {
        Self {
            hasher: crc32fast::Hasher::new(),
        }
    }

    /// Update the calculator with more data
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Finalize and return the computed checksum
    #[must_use]
    pub fn finalize(self) -> u32 {
        self.hasher.finalize()
    }
}

impl Default for Crc32Builder {
    fn default() -> Self {
        Self::new()
    }
}
