//! Compression Envelope
//!
//! Values whose serialized size exceeds the threshold are gzip-compressed and
//! base64-encoded for transport; everything else is stored as plain text.
//! Decoding first attempts base64 + gunzip and falls back to treating the
//! payload as plain serialized data, so entries written before compression was
//! enabled stay readable.

use crate::error::{Error, Result};
use crate::store::entry::Payload;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

// =============================================================================
// Compression Configuration
// =============================================================================

/// Configuration for compression
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Serialized values strictly larger than this are compressed
    pub threshold_bytes: u64,
    /// Gzip level (0-9)
    pub level: u32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            threshold_bytes: 1024,
            level: 6,
        }
    }
}

// =============================================================================
// Gzip Primitives
// =============================================================================

/// Gzip-compress raw bytes
pub fn gzip(data: &[u8], level: u32) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::new(level));
    encoder
        .write_all(data)
        .map_err(|e| Error::Internal(format!("gzip compression failed: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| Error::Internal(format!("gzip compression failed: {}", e)))
}

/// Decompress gzip bytes
pub fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::with_capacity(data.len() * 2);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| Error::Internal(format!("gzip decompression failed: {}", e)))?;
    Ok(out)
}

// =============================================================================
// Compression Manager
// =============================================================================

/// Applies the compression envelope to serialized values
#[derive(Debug, Clone, Default)]
pub struct CompressionManager {
    config: CompressionConfig,
}

impl CompressionManager {
    /// Create with custom config
    pub fn with_config(config: CompressionConfig) -> Self {
        Self { config }
    }

    /// Whether a value of `size` bytes gets compressed
    #[inline]
    pub fn should_compress(&self, size: u64) -> bool {
        size > self.config.threshold_bytes
    }

    /// Build the in-memory payload for serialized text
    pub fn pack(&self, text: String) -> Result<Payload> {
        let original_size = text.len() as u64;
        if !self.should_compress(original_size) {
            return Ok(Payload::Plain(text));
        }
        let compressed = gzip(text.as_bytes(), self.config.level)?;
        Ok(Payload::Compressed {
            bytes: Bytes::from(compressed),
            original_size,
        })
    }

    /// Recover the serialized text from a payload
    pub fn unpack(&self, payload: &Payload) -> Result<String> {
        match payload {
            Payload::Plain(text) => Ok(text.clone()),
            Payload::Compressed { bytes, .. } => {
                let raw = gunzip(bytes)?;
                String::from_utf8(raw)
                    .map_err(|e| Error::Internal(format!("decompressed payload is not UTF-8: {}", e)))
            }
        }
    }

    /// Encode a payload into its transport form
    pub fn encode(&self, payload: &Payload) -> String {
        match payload {
            Payload::Plain(text) => text.clone(),
            Payload::Compressed { bytes, .. } => STANDARD.encode(bytes),
        }
    }

    /// Decode a transport value back into a payload.
    ///
    /// Anything that does not decode as base64-wrapped gzip is plain text.
    pub fn decode(&self, wire: String) -> Payload {
        if let Ok(bytes) = STANDARD.decode(wire.as_bytes()) {
            if let Ok(raw) = gunzip(&bytes) {
                if std::str::from_utf8(&raw).is_ok() {
                    return Payload::Compressed {
                        original_size: raw.len() as u64,
                        bytes: Bytes::from(bytes),
                    };
                }
            }
        }
        Payload::Plain(wire)
    }

    /// Compress serialized text straight into its transport form
    pub fn encode_text(&self, text: String) -> Result<(String, Payload)> {
        let payload = self.pack(text)?;
        Ok((self.encode(&payload), payload))
    }

    /// Decode a transport value straight into serialized text
    pub fn decode_text(&self, wire: String) -> Result<String> {
        let payload = self.decode(wire);
        self.unpack(&payload)
    }

    /// Get configuration
    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }
}
