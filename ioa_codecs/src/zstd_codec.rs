use ioa_core::codec::{Codec, CodecId};

/// Zstandard codec over the bulk (single-frame) API.
///
/// Levels run from 1 (fast, larger) to 22 (slow, smallest).
///
/// Best for: general text, JSON, logs, mixed structured data.
pub struct ZstdCodec {
    levels: Vec<i32>,
}

impl Default for ZstdCodec {
    fn default() -> Self {
        Self {
            levels: vec![22, 10, 3, 1],
        }
    }
}

impl ZstdCodec {
    pub fn with_levels(levels: Vec<i32>) -> Self {
        Self { levels }
    }
}

impl Codec for ZstdCodec {
    fn id(&self) -> CodecId {
        CodecId::Zstd
    }

    fn levels(&self) -> &[i32] {
        &self.levels
    }

    fn bound(&self, len: usize) -> usize {
        zstd::zstd_safe::compress_bound(len)
    }

    fn compress(&self, src: &[u8], dst: &mut [u8], level: i32) -> anyhow::Result<usize> {
        let n = zstd::bulk::compress_to_buffer(src, dst, level)?;
        Ok(n)
    }

    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> anyhow::Result<usize> {
        let n = zstd::bulk::decompress_to_buffer(src, dst)?;
        Ok(n)
    }
}
