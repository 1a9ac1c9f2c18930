//! Cache Blob Serialization Helpers
//!
//! Little-endian binary readers/writers plus the shared section header used
//! by the shader cache and the pipeline state cache. Only the *key space*
//! (signature / combination / program / shader-cache IDs) is contractual; the
//! record layout itself may change between format versions, which is why the
//! header carries a format version, the crate version hash and the shader
//! language name hash — any mismatch marks the whole blob stale.

use std::io::{Read, Write};

use crate::error::{CrucibleError, Result};
use crate::hash::fnv1a_32;

/// Bumped whenever a record layout changes.
pub(crate) const CACHE_FORMAT_VERSION: u32 = 2;

/// Records per section are sanity-capped while reading so a corrupt length
/// field cannot trigger a huge allocation.
const MAX_RECORD_BYTES: u32 = 64 * 1024 * 1024;

pub(crate) fn crate_version_hash() -> u32 {
    fnv1a_32(env!("CARGO_PKG_VERSION").as_bytes())
}

pub(crate) struct BlobWriter<'a> {
    inner: &'a mut dyn Write,
}

impl<'a> BlobWriter<'a> {
    pub fn new(inner: &'a mut dyn Write) -> Self {
        Self { inner }
    }

    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.inner.write_all(&[value])?;
        Ok(())
    }

    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.inner.write_all(&value.to_le_bytes())?;
        Ok(())
    }

    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.inner.write_all(&value.to_le_bytes())?;
        Ok(())
    }

    pub fn write_i32(&mut self, value: i32) -> Result<()> {
        self.inner.write_all(&value.to_le_bytes())?;
        Ok(())
    }

    /// Length-prefixed byte blob.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_u32(bytes.len() as u32)?;
        self.inner.write_all(bytes)?;
        Ok(())
    }

    /// Section header: magic, format version, crate version hash, shader
    /// language name hash.
    pub fn write_header(&mut self, magic: [u8; 4], shader_language_name: &str) -> Result<()> {
        self.inner.write_all(&magic)?;
        self.write_u32(CACHE_FORMAT_VERSION)?;
        self.write_u32(crate_version_hash())?;
        self.write_u32(fnv1a_32(shader_language_name.as_bytes()))?;
        Ok(())
    }
}

pub(crate) struct BlobReader<'a> {
    inner: &'a mut dyn Read,
}

impl<'a> BlobReader<'a> {
    pub fn new(inner: &'a mut dyn Read) -> Self {
        Self { inner }
    }

    fn read_exact(&mut self, buffer: &mut [u8]) -> Result<()> {
        self.inner
            .read_exact(buffer)
            .map_err(|e| CrucibleError::CorruptCacheBlob(format!("unexpected end of blob: {e}")))
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let mut buffer = [0u8; 1];
        self.read_exact(&mut buffer)?;
        Ok(buffer[0])
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let mut buffer = [0u8; 4];
        self.read_exact(&mut buffer)?;
        Ok(u32::from_le_bytes(buffer))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let mut buffer = [0u8; 8];
        self.read_exact(&mut buffer)?;
        Ok(u64::from_le_bytes(buffer))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        let mut buffer = [0u8; 4];
        self.read_exact(&mut buffer)?;
        Ok(i32::from_le_bytes(buffer))
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let length = self.read_u32()?;
        if length > MAX_RECORD_BYTES {
            return Err(CrucibleError::CorruptCacheBlob(format!(
                "record length {length} exceeds sanity limit"
            )));
        }
        let mut buffer = vec![0u8; length as usize];
        self.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    /// Validate a section header.
    ///
    /// Returns `Ok(true)` when the section is usable, `Ok(false)` when it is
    /// stale (format/crate version or shader language changed — caller skips
    /// the section and rebuilds from scratch), and an error when the magic is
    /// wrong, i.e. this is not a cache blob at all.
    pub fn read_header(&mut self, magic: [u8; 4], shader_language_name: &str) -> Result<bool> {
        let mut found = [0u8; 4];
        self.read_exact(&mut found)?;
        if found != magic {
            return Err(CrucibleError::CorruptCacheBlob(format!(
                "bad section magic {found:?}, expected {magic:?}"
            )));
        }
        let format_version = self.read_u32()?;
        let version_hash = self.read_u32()?;
        let language_hash = self.read_u32()?;
        Ok(format_version == CACHE_FORMAT_VERSION
            && version_hash == crate_version_hash()
            && language_hash == fnv1a_32(shader_language_name.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_scalars_and_bytes() {
        let mut blob = Vec::new();
        {
            let mut writer = BlobWriter::new(&mut blob);
            writer.write_u8(7).unwrap();
            writer.write_u32(70_000).unwrap();
            writer.write_u64(u64::MAX - 1).unwrap();
            writer.write_i32(-42).unwrap();
            writer.write_bytes(b"bytecode").unwrap();
        }
        let mut cursor = blob.as_slice();
        let mut reader = BlobReader::new(&mut cursor);
        assert_eq!(reader.read_u8().unwrap(), 7);
        assert_eq!(reader.read_u32().unwrap(), 70_000);
        assert_eq!(reader.read_u64().unwrap(), u64::MAX - 1);
        assert_eq!(reader.read_i32().unwrap(), -42);
        assert_eq!(reader.read_bytes().unwrap(), b"bytecode");
    }

    #[test]
    fn header_detects_language_change() {
        let mut blob = Vec::new();
        BlobWriter::new(&mut blob)
            .write_header(*b"TEST", "hlsl")
            .unwrap();

        let mut cursor = blob.as_slice();
        assert!(BlobReader::new(&mut cursor).read_header(*b"TEST", "hlsl").unwrap());

        let mut cursor = blob.as_slice();
        assert!(!BlobReader::new(&mut cursor).read_header(*b"TEST", "glsl").unwrap());
    }

    #[test]
    fn header_rejects_wrong_magic() {
        let mut blob = Vec::new();
        BlobWriter::new(&mut blob)
            .write_header(*b"AAAA", "hlsl")
            .unwrap();
        let mut cursor = blob.as_slice();
        assert!(matches!(
            BlobReader::new(&mut cursor).read_header(*b"BBBB", "hlsl"),
            Err(CrucibleError::CorruptCacheBlob(_))
        ));
    }

    #[test]
    fn truncated_blob_is_corrupt_not_panic() {
        let mut cursor: &[u8] = &[1, 2];
        assert!(BlobReader::new(&mut cursor).read_u32().is_err());
    }
}
