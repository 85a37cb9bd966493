//! Per-block compression codecs
//!
//! The codec is recorded in each file header by name, so a reader can decode
//! blocks without knowing the writer's configuration.

use std::borrow::Cow;
use std::fmt;
use std::io::Read;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::format::FileFormatError;
use crate::common::{EncodingError, MAX_RECORD_SIZE};

/// zstd level used when none is given
pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

/// Compression applied to each record block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Codec {
    #[default]
    None,
    /// lz4 block format with the uncompressed size prepended
    Lz4,
    Zstd {
        level: i32,
    },
}

impl Codec {
    pub fn name(&self) -> &'static str {
        match self {
            Codec::None => "none",
            Codec::Lz4 => "lz4",
            Codec::Zstd { .. } => "zstd",
        }
    }

    /// Encode one record payload into its on-disk block
    pub fn encode<'a>(&self, data: &'a [u8]) -> Result<Cow<'a, [u8]>, EncodingError> {
        match self {
            Codec::None => Ok(Cow::Borrowed(data)),
            Codec::Lz4 => Ok(Cow::Owned(lz4_flex::compress_prepend_size(data))),
            Codec::Zstd { level } => zstd::bulk::compress(data, *level)
                .map(Cow::Owned)
                .map_err(|e| EncodingError::Compression(e.to_string())),
        }
    }

    /// Decode one on-disk block back into the record payload
    ///
    /// Output is capped at `MAX_RECORD_SIZE`, the largest payload a writer
    /// accepts.
    pub fn decode<'a>(&self, block: &'a [u8]) -> Result<Cow<'a, [u8]>, FileFormatError> {
        match self {
            Codec::None => Ok(Cow::Borrowed(block)),
            Codec::Lz4 => {
                // Check the declared size before lz4_flex allocates for it
                let declared = block
                    .get(..4)
                    .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize)
                    .ok_or_else(|| {
                        FileFormatError::Decompression("lz4 block shorter than its size prefix".into())
                    })?;
                if declared > MAX_RECORD_SIZE {
                    return Err(oversized(declared));
                }
                lz4_flex::decompress_size_prepended(block)
                    .map(Cow::Owned)
                    .map_err(|e| FileFormatError::Decompression(e.to_string()))
            }
            Codec::Zstd { .. } => {
                let decoder = zstd::stream::read::Decoder::with_buffer(block)
                    .map_err(|e| FileFormatError::Decompression(e.to_string()))?;
                let mut out = Vec::new();
                decoder
                    .take(MAX_RECORD_SIZE as u64 + 1)
                    .read_to_end(&mut out)
                    .map_err(|e| FileFormatError::Decompression(e.to_string()))?;
                if out.len() > MAX_RECORD_SIZE {
                    return Err(oversized(out.len()));
                }
                Ok(Cow::Owned(out))
            }
        }
    }
}

fn oversized(size: usize) -> FileFormatError {
    FileFormatError::Decompression(format!(
        "decoded block of {} bytes exceeds the {} byte record limit",
        size, MAX_RECORD_SIZE
    ))
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Codec::Zstd { level } => write!(f, "zstd:{}", level),
            other => f.write_str(other.name()),
        }
    }
}

impl FromStr for Codec {
    type Err = FileFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "none" | "" => Ok(Codec::None),
            "lz4" => Ok(Codec::Lz4),
            "zstd" => Ok(Codec::Zstd {
                level: DEFAULT_ZSTD_LEVEL,
            }),
            other => match other.strip_prefix("zstd:") {
                Some(level) => level
                    .parse()
                    .map(|level| Codec::Zstd { level })
                    .map_err(|_| FileFormatError::UnknownCodec(s.to_string())),
                None => Err(FileFormatError::UnknownCodec(s.to_string())),
            },
        }
    }
}

impl TryFrom<String> for Codec {
    type Error = FileFormatError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Codec> for String {
    fn from(codec: Codec) -> Self {
        codec.to_string()
    }
}
