//! Per-connection compression.
//!
//! Encoders produce one complete, independently decodable unit per call, so
//! every payload is self-delimited on the wire. Decoders are chosen by the
//! leading magic bytes of the received data, never by configuration.

use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use std::io::{Error, ErrorKind::Other, Read, Result, Write};
use std::str::FromStr;

/// Gzip member header.
pub const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
/// Zlib header at default compression.
pub const ZLIB_MAGIC: &[u8] = &[0x78, 0x9c];
/// Zstandard frame magic.
pub const ZSTD_MAGIC: &[u8] = &[0x28, 0xb5, 0x2f, 0xfd];

/// Supported wire compression formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Zlib,
    Zstd,
}

impl Compression {
    /// Classify a payload by its leading bytes.
    ///
    /// Data that merely happens to start with a magic sequence is
    /// indistinguishable from compressed data; the wire format has no
    /// envelope to say otherwise.
    pub fn detect(data: &[u8]) -> Compression {
        if data.starts_with(GZIP_MAGIC) {
            Compression::Gzip
        } else if data.starts_with(ZLIB_MAGIC) {
            Compression::Zlib
        } else if data.starts_with(ZSTD_MAGIC) {
            Compression::Zstd
        } else {
            Compression::None
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Zlib => "zlib",
            Compression::Zstd => "zstd",
        }
    }
}

impl FromStr for Compression {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Compression::None),
            "gzip" => Ok(Compression::Gzip),
            "zlib" => Ok(Compression::Zlib),
            "zstd" => Ok(Compression::Zstd),
            _ => Err(Error::new(Other, format!("unsupported compression type {}", s))),
        }
    }
}

/// Compressor bound to one connection.
pub struct Encoder {
    codec: Compression,
    level: u32,
}

impl Encoder {
    pub fn new(codec: Compression, level: u32) -> Self {
        Self {
            codec,
            level: level.clamp(1, 9),
        }
    }

    pub fn codec(&self) -> Compression {
        self.codec
    }

    /// Compress `data` into one complete unit.
    pub fn encode(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        match self.codec {
            Compression::None => Ok(data.to_vec()),
            Compression::Gzip => {
                let mut w = GzEncoder::new(Vec::new(), flate2::Compression::new(self.level));
                w.write_all(data)?;
                w.finish()
            }
            Compression::Zlib => {
                let mut w = ZlibEncoder::new(Vec::new(), flate2::Compression::new(self.level));
                w.write_all(data)?;
                w.finish()
            }
            Compression::Zstd => zstd::stream::encode_all(data, self.level as i32),
        }
    }
}

/// Decompressor bound to one connection, created from sniffed magic bytes.
pub struct Decoder {
    codec: Compression,
}

impl Decoder {
    pub fn new(codec: Compression) -> Self {
        Self { codec }
    }

    pub fn codec(&self) -> Compression {
        self.codec
    }

    /// Decompress one complete unit.
    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        match self.codec {
            Compression::None => Ok(data.to_vec()),
            Compression::Gzip => {
                let mut out = Vec::new();
                GzDecoder::new(data).read_to_end(&mut out)?;
                Ok(out)
            }
            Compression::Zlib => {
                let mut out = Vec::new();
                ZlibDecoder::new(data).read_to_end(&mut out)?;
                Ok(out)
            }
            Compression::Zstd => zstd::stream::decode_all(data),
        }
    }
}
