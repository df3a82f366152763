use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::config::{CompressionAlgorithm, CompressionConfig};
use crate::error::{Result, VbkError};

const TAG_NONE: u8 = 0x00;
const TAG_LZ4: u8 = 0x01;
const TAG_ZSTD: u8 = 0x02;

/// Maximum decompressed output size, equal to the largest configurable block.
const MAX_DECOMPRESS_SIZE: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Compression {
    None,
    #[default]
    Lz4,
    Zstd {
        level: i32,
    },
}

impl Compression {
    pub fn from_algorithm(algorithm: CompressionAlgorithm, zstd_level: i32) -> Self {
        match algorithm {
            CompressionAlgorithm::None => Compression::None,
            CompressionAlgorithm::Lz4 => Compression::Lz4,
            CompressionAlgorithm::Zstd => Compression::Zstd { level: zstd_level },
        }
    }

    pub fn from_config(config: &CompressionConfig) -> Self {
        Self::from_algorithm(config.algorithm, config.zstd_level)
    }

    /// Whether stored blocks are flagged as compressed.
    pub fn is_enabled(self) -> bool {
        !matches!(self, Compression::None)
    }
}

/// Compress `data` into `out` (cleared first), prefixed by a 1-byte codec tag.
pub fn compress_into(compression: Compression, data: &[u8], out: &mut Vec<u8>) -> Result<()> {
    out.clear();
    match compression {
        Compression::None => {
            out.reserve(1 + data.len());
            out.push(TAG_NONE);
            out.extend_from_slice(data);
            Ok(())
        }
        Compression::Lz4 => {
            let compressed = lz4_flex::compress_prepend_size(data);
            out.reserve(1 + compressed.len());
            out.push(TAG_LZ4);
            out.extend_from_slice(&compressed);
            Ok(())
        }
        Compression::Zstd { level } => {
            use std::cell::RefCell;
            thread_local! {
                static ZSTD_CX: RefCell<Option<(i32, zstd::bulk::Compressor<'static>)>> =
                    const { RefCell::new(None) };
            }

            ZSTD_CX.with(|cell| {
                let mut slot = cell.borrow_mut();

                // Lazily init or reinit if the compression level changed.
                let mut cx = match slot.take() {
                    Some((l, cx)) if l == level => cx,
                    _ => zstd::bulk::Compressor::new(level)
                        .map_err(|e| VbkError::Other(format!("zstd init: {e}")))?,
                };

                let compressed = cx.compress(data);
                *slot = Some((level, cx));
                let compressed =
                    compressed.map_err(|e| VbkError::Other(format!("zstd compress: {e}")))?;
                out.reserve(1 + compressed.len());
                out.push(TAG_ZSTD);
                out.extend_from_slice(&compressed);
                Ok(())
            })
        }
    }
}

pub fn compress(compression: Compression, data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    compress_into(compression, data, &mut out)?;
    Ok(out)
}

/// Decompress data by reading the 1-byte tag prefix and dispatching.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    decompress_with_hint(data, None)
}

/// Like [`decompress`], pre-sizing the output buffer.
///
/// `expected_size` is a capacity hint, capped by `MAX_DECOMPRESS_SIZE`.
pub fn decompress_with_hint(data: &[u8], expected_size: Option<usize>) -> Result<Vec<u8>> {
    let Some((&tag, payload)) = data.split_first() else {
        return Err(VbkError::Decompression("empty data".into()));
    };
    match tag {
        TAG_NONE => Ok(payload.to_vec()),
        TAG_LZ4 => {
            let Some(prefix) = payload.get(..4) else {
                return Err(VbkError::Decompression("lz4: payload too short".into()));
            };
            let uncompressed_size =
                u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as u64;
            if uncompressed_size > MAX_DECOMPRESS_SIZE {
                return Err(VbkError::Decompression(format!(
                    "lz4: decompressed size ({uncompressed_size}) exceeds limit of {MAX_DECOMPRESS_SIZE} bytes"
                )));
            }
            lz4_flex::decompress_size_prepended(payload)
                .map_err(|e| VbkError::Decompression(format!("lz4: {e}")))
        }
        TAG_ZSTD => {
            let mut decoder = zstd::stream::Decoder::new(std::io::Cursor::new(payload))
                .map_err(|e| VbkError::Decompression(format!("zstd init: {e}")))?;
            let hinted_capacity = expected_size
                .unwrap_or(0)
                .min(MAX_DECOMPRESS_SIZE as usize);
            let mut output = Vec::with_capacity(hinted_capacity);
            decoder
                .by_ref()
                .take(MAX_DECOMPRESS_SIZE + 1)
                .read_to_end(&mut output)
                .map_err(|e| VbkError::Decompression(format!("zstd: {e}")))?;
            if output.len() as u64 > MAX_DECOMPRESS_SIZE {
                return Err(VbkError::Decompression(format!(
                    "zstd: decompressed size exceeds limit of {MAX_DECOMPRESS_SIZE} bytes"
                )));
            }
            Ok(output)
        }
        other => Err(VbkError::Decompression(format!(
            "unknown compression tag: {other}"
        ))),
    }
}
