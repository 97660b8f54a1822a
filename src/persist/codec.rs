//! Blob encodings applied between the JSON snapshot and durable storage.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use color_eyre::{eyre::eyre, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::sync::Arc;

/// Reversible byte transformation.
pub trait Codec: Send + Sync {
  fn name(&self) -> &'static str;
  fn encode(&self, bytes: &[u8]) -> Result<Vec<u8>>;
  fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>>;
}

/// Plain JSON bytes.
pub struct IdentityCodec;

impl Codec for IdentityCodec {
  fn name(&self) -> &'static str {
    "identity"
  }

  fn encode(&self, bytes: &[u8]) -> Result<Vec<u8>> {
    Ok(bytes.to_vec())
  }

  fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>> {
    Ok(bytes.to_vec())
  }
}

pub struct GzipCodec {
  level: Compression,
}

impl Default for GzipCodec {
  fn default() -> Self {
    Self {
      level: Compression::default(),
    }
  }
}

impl GzipCodec {
  /// `level` from 0 (store) to 9 (best).
  pub fn with_level(level: u32) -> Self {
    Self {
      level: Compression::new(level.min(9)),
    }
  }
}

impl Codec for GzipCodec {
  fn name(&self) -> &'static str {
    "gzip"
  }

  fn encode(&self, bytes: &[u8]) -> Result<Vec<u8>> {
    let mut enc = GzEncoder::new(Vec::new(), self.level);
    enc
      .write_all(bytes)
      .map_err(|e| eyre!("Failed to compress cache blob: {}", e))?;
    enc
      .finish()
      .map_err(|e| eyre!("Failed to compress cache blob: {}", e))
  }

  fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(bytes)
      .read_to_end(&mut out)
      .map_err(|e| eyre!("Failed to decompress cache blob: {}", e))?;
    Ok(out)
  }
}

/// Standard base64 text, for stores that only accept strings.
pub struct Base64Codec;

impl Codec for Base64Codec {
  fn name(&self) -> &'static str {
    "base64"
  }

  fn encode(&self, bytes: &[u8]) -> Result<Vec<u8>> {
    Ok(STANDARD.encode(bytes).into_bytes())
  }

  fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>> {
    STANDARD
      .decode(bytes)
      .map_err(|e| eyre!("Failed to decode base64 cache blob: {}", e))
  }
}

/// Codec selection as written in configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
  #[default]
  Identity,
  Gzip,
  Base64,
}

impl CodecKind {
  pub fn build(self) -> Arc<dyn Codec> {
    match self {
      CodecKind::Identity => Arc::new(IdentityCodec),
      CodecKind::Gzip => Arc::new(GzipCodec::default()),
      CodecKind::Base64 => Arc::new(Base64Codec),
    }
  }
}
