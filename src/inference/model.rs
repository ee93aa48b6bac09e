//! Model file checks
//!
//! Setup rejects files that are obviously not GGUF models before handing the
//! path to the runtime, so the caller gets a precise reason instead of a
//! generic load failure.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use thiserror::Error;

/// GGUF magic bytes (little-endian: "GGUF")
pub const GGUF_MAGIC: u32 = 0x46554747;

/// magic(4) + version(4) + tensor_count(8) + metadata_kv_count(8)
const HEADER_LEN: usize = 24;

/// Errors found while inspecting a model file
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Failed to open file: {0}")]
    FileOpen(#[from] std::io::Error),

    #[error("Invalid GGUF file: magic bytes mismatch (expected 0x{:08X}, got 0x{:08X})", GGUF_MAGIC, .0)]
    InvalidMagic(u32),

    #[error("Unsupported GGUF version: {0}")]
    UnsupportedVersion(u32),

    #[error("File too small to be valid GGUF")]
    FileTooSmall,
}

/// Fields of a GGUF header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GgufHeader {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_kv_count: u64,
}

/// Reads and checks the GGUF header of `path`.
pub fn read_gguf_header<P: AsRef<Path>>(path: P) -> Result<GgufHeader, ModelError> {
    let mut file = File::open(path)?;

    if file.metadata()?.len() < HEADER_LEN as u64 {
        return Err(ModelError::FileTooSmall);
    }

    let mut header = [0u8; HEADER_LEN];
    file.read_exact(&mut header)?;

    let u32_at = |at: usize| u32::from_le_bytes([header[at], header[at + 1], header[at + 2], header[at + 3]]);
    let u64_at = |at: usize| {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&header[at..at + 8]);
        u64::from_le_bytes(bytes)
    };

    let magic = u32_at(0);
    if magic != GGUF_MAGIC {
        return Err(ModelError::InvalidMagic(magic));
    }

    // v2 and v3 only
    let version = u32_at(4);
    if !(2..=3).contains(&version) {
        return Err(ModelError::UnsupportedVersion(version));
    }

    Ok(GgufHeader {
        version,
        tensor_count: u64_at(8),
        metadata_kv_count: u64_at(16),
    })
}

/// Header check run before a model load.
///
/// Paths that do not exist on disk are left for the runtime to report, since
/// some loaders resolve model names themselves.
pub fn preflight<P: AsRef<Path>>(path: P) -> Result<Option<GgufHeader>, ModelError> {
    let path = path.as_ref();
    if !path.is_file() {
        return Ok(None);
    }

    let header = read_gguf_header(path)?;
    tracing::debug!(
        "GGUF v{} header ok for {:?}: {} tensors, {} metadata entries",
        header.version,
        path,
        header.tensor_count,
        header.metadata_kv_count
    );
    Ok(Some(header))
}
