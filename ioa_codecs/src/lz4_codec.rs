use ioa_core::codec::{Codec, CodecId};
use lz4::block::{self, CompressionMode};

/// LZ4 high-compression block codec.
///
/// Levels are HC levels: higher is smaller output and slower compression.
/// Decompression speed is the same at every level.
///
/// Best for: data written once and read often.
pub struct Lz4Codec {
    levels: Vec<i32>,
}

impl Default for Lz4Codec {
    fn default() -> Self {
        Self {
            levels: vec![12, 9, 6, 3, 1],
        }
    }
}

impl Lz4Codec {
    pub fn with_levels(levels: Vec<i32>) -> Self {
        Self { levels }
    }
}

impl Codec for Lz4Codec {
    fn id(&self) -> CodecId {
        CodecId::Lz4
    }

    fn levels(&self) -> &[i32] {
        &self.levels
    }

    fn bound(&self, len: usize) -> usize {
        lz4_bound(len)
    }

    fn compress(&self, src: &[u8], dst: &mut [u8], level: i32) -> anyhow::Result<usize> {
        let mode = Some(CompressionMode::HIGHCOMPRESSION(level));
        let n = block::compress_to_buffer(src, mode, false, dst)
            .map_err(|e| anyhow::anyhow!("lz4 hc compress error: {}", e))?;
        Ok(n)
    }

    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> anyhow::Result<usize> {
        lz4_decompress(src, dst)
    }
}

/// LZ4 default block codec with an acceleration factor.
///
/// Levels are acceleration values: higher trades ratio for speed.
///
/// Best for: hot data, low-latency writes.
pub struct Lz4FastCodec {
    levels: Vec<i32>,
}

impl Default for Lz4FastCodec {
    fn default() -> Self {
        Self { levels: vec![1, 7, 17] }
    }
}

impl Lz4FastCodec {
    pub fn with_levels(levels: Vec<i32>) -> Self {
        Self { levels }
    }
}

impl Codec for Lz4FastCodec {
    fn id(&self) -> CodecId {
        CodecId::Lz4Fast
    }

    fn levels(&self) -> &[i32] {
        &self.levels
    }

    fn bound(&self, len: usize) -> usize {
        lz4_bound(len)
    }

    fn compress(&self, src: &[u8], dst: &mut [u8], level: i32) -> anyhow::Result<usize> {
        let n = block::compress_to_buffer(src, Some(CompressionMode::FAST(level)), false, dst)
            .map_err(|e| anyhow::anyhow!("lz4 compress error: {}", e))?;
        Ok(n)
    }

    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> anyhow::Result<usize> {
        lz4_decompress(src, dst)
    }
}

/// Worst case for one block. Inputs above the LZ4 block limit get a bound of
/// zero and are rejected at compression time.
fn lz4_bound(len: usize) -> usize {
    block::compress_bound(len).unwrap_or(0)
}

fn lz4_decompress(src: &[u8], dst: &mut [u8]) -> anyhow::Result<usize> {
    let expected = i32::try_from(dst.len())
        .map_err(|_| anyhow::anyhow!("lz4 output of {} bytes is too large", dst.len()))?;
    let n = block::decompress_to_buffer(src, Some(expected), dst)
        .map_err(|e| anyhow::anyhow!("lz4 decompress error: {}", e))?;
    Ok(n)
}
