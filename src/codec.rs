//! Entry encoding and chunk compression.
//!
//! A flushed batch becomes one chunk: every entry is encoded, followed by
//! the configured delimiter, and the concatenation is compressed as a whole.

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::Arc;

/// Encodes one entry into bytes.
pub type EncoderFn<E> = Arc<dyn Fn(&E) -> Vec<u8> + Send + Sync>;

/// User-supplied whole-chunk compressor.
pub type CompressFn = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// Built-in chunk compression formats.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Snappy,
    /// lzma2 container (xz).
    Xz,
    Zstd,
}

impl Compression {
    /// Human-readable name of this codec (for logging/debugging).
    pub fn name(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Snappy => "snappy",
            Compression::Xz => "xz",
            Compression::Zstd => "zstd",
        }
    }

    /// Compress a chunk.
    pub fn compress(&self, data: &[u8]) -> std::io::Result<Vec<u8>> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Gzip => {
                let mut encoder =
                    flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(data)?;
                encoder.finish()
            }
            Compression::Snappy => {
                let mut encoder = snap::read::FrameEncoder::new(data);
                let mut out = Vec::new();
                std::io::Read::read_to_end(&mut encoder, &mut out)?;
                Ok(out)
            }
            Compression::Xz => {
                let mut encoder = xz2::write::XzEncoder::new(Vec::new(), 6);
                encoder.write_all(data)?;
                encoder.finish()
            }
            Compression::Zstd => zstd::encode_all(data, 3),
        }
    }
}

/// Chunk compressor: a built-in codec or a user closure.
#[derive(Clone)]
pub enum Compressor {
    Builtin(Compression),
    Custom(CompressFn),
}

impl Compressor {
    pub fn compress(&self, data: &[u8]) -> std::io::Result<Vec<u8>> {
        match self {
            Compressor::Builtin(compression) => compression.compress(data),
            Compressor::Custom(f) => Ok(f(data)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Compressor::Builtin(compression) => compression.name(),
            Compressor::Custom(_) => "custom",
        }
    }
}

impl std::fmt::Debug for Compressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Compressor<{}>", self.name())
    }
}

/// One compressed byte run produced from a flushed batch.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub bytes: Vec<u8>,
    pub entries: u64,
}

/// Encode a batch into a chunk: `entry, delimiter` pairs, then compress.
pub fn build_chunk<E>(
    batch: &[E],
    encoder: &EncoderFn<E>,
    delimiter: &[u8],
    compressor: &Compressor,
) -> std::io::Result<Chunk> {
    let mut buf = Vec::new();
    for entry in batch {
        buf.extend_from_slice(&encoder(entry));
        buf.extend_from_slice(delimiter);
    }
    let bytes = compressor.compress(&buf)?;
    Ok(Chunk {
        bytes,
        entries: batch.len() as u64,
    })
}
