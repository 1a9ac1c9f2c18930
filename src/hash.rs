//! FNV1a Hashing
//!
//! All cache identities in this crate (pipeline state signature IDs, shader
//! combination IDs, program cache IDs, property IDs, asset IDs) are 32-bit
//! FNV1a hashes. FNV1a is stable across platforms and process restarts, which
//! makes the IDs usable as keys in the persisted cache blob. Content hashes of
//! generated shader source code use xxh3 instead (see
//! [`crate::cache::shader::ShaderSourceCodeId`]).
//!
//! The 32-bit width is a deliberate hash-cache tradeoff inherited from the
//! cache key space: collisions are possible and are not resolved by a
//! secondary equality check on the hot path. Debug builds assert full
//! signature equality on cache hits.

/// FNV1a 32-bit offset basis.
pub const FNV1A_32_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV1A_32_PRIME: u32 = 0x0100_0193;

/// FNV1a 64-bit offset basis.
pub const FNV1A_64_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV1A_64_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Incremental 32-bit FNV1a hasher.
///
/// Used wherever an ID folds several inputs together (e.g. a pipeline state
/// signature folds the material blueprint ID, the serialized state hash and
/// every shader property pair).
#[derive(Debug, Clone, Copy)]
pub struct Fnv1a32(u32);

impl Fnv1a32 {
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self(FNV1A_32_OFFSET_BASIS)
    }

    #[inline]
    pub fn write(&mut self, bytes: &[u8]) {
        let mut hash = self.0;
        for &byte in bytes {
            hash ^= u32::from(byte);
            hash = hash.wrapping_mul(FNV1A_32_PRIME);
        }
        self.0 = hash;
    }

    #[inline]
    pub fn write_u32(&mut self, value: u32) {
        self.write(&value.to_le_bytes());
    }

    #[inline]
    pub fn write_i32(&mut self, value: i32) {
        self.write(&value.to_le_bytes());
    }

    #[inline]
    #[must_use]
    pub const fn finish(self) -> u32 {
        self.0
    }
}

impl Default for Fnv1a32 {
    fn default() -> Self {
        Self::new()
    }
}

/// Incremental 64-bit FNV1a hasher (combined asset file hashes).
#[derive(Debug, Clone, Copy)]
pub struct Fnv1a64(u64);

impl Fnv1a64 {
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self(FNV1A_64_OFFSET_BASIS)
    }

    #[inline]
    pub fn write(&mut self, bytes: &[u8]) {
        let mut hash = self.0;
        for &byte in bytes {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(FNV1A_64_PRIME);
        }
        self.0 = hash;
    }

    #[inline]
    pub fn write_u64(&mut self, value: u64) {
        self.write(&value.to_le_bytes());
    }

    #[inline]
    #[must_use]
    pub const fn finish(self) -> u64 {
        self.0
    }
}

impl Default for Fnv1a64 {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot 32-bit FNV1a of a byte slice.
#[inline]
#[must_use]
pub fn fnv1a_32(bytes: &[u8]) -> u32 {
    let mut hasher = Fnv1a32::new();
    hasher.write(bytes);
    hasher.finish()
}

/// One-shot 64-bit FNV1a of a byte slice.
#[inline]
#[must_use]
pub fn fnv1a_64(bytes: &[u8]) -> u64 {
    let mut hasher = Fnv1a64::new();
    hasher.write(bytes);
    hasher.finish()
}
