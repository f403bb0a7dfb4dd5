use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use ioa_core::codec::{Codec, CodecId};

/// zlib (deflate with zlib header and checksum) codec.
///
/// Levels run from 1 to 9. Slowest of the bundled codecs on both sides.
pub struct ZlibCodec {
    levels: Vec<i32>,
}

impl Default for ZlibCodec {
    fn default() -> Self {
        Self {
            levels: vec![9, 6, 3, 1],
        }
    }
}

impl ZlibCodec {
    pub fn with_levels(levels: Vec<i32>) -> Self {
        Self { levels }
    }
}

impl Codec for ZlibCodec {
    fn id(&self) -> CodecId {
        CodecId::Zlib
    }

    fn levels(&self) -> &[i32] {
        &self.levels
    }

    /// zlib's `compressBound`.
    fn bound(&self, len: usize) -> usize {
        len + (len >> 12) + (len >> 14) + (len >> 25) + 13
    }

    fn compress(&self, src: &[u8], dst: &mut [u8], level: i32) -> anyhow::Result<usize> {
        let level = u32::try_from(level)
            .ok()
            .filter(|l| *l <= 9)
            .ok_or_else(|| anyhow::anyhow!("zlib level {} out of range 0..=9", level))?;
        let mut z = Compress::new(Compression::new(level), true);
        match z.compress(src, dst, FlushCompress::Finish)? {
            Status::StreamEnd => Ok(z.total_out() as usize),
            status => anyhow::bail!(
                "zlib compress stopped early ({:?}) after {} bytes",
                status,
                z.total_out()
            ),
        }
    }

    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> anyhow::Result<usize> {
        let mut z = Decompress::new(true);
        match z.decompress(src, dst, FlushDecompress::Finish)? {
            Status::StreamEnd => Ok(z.total_out() as usize),
            status => anyhow::bail!(
                "zlib decompress stopped early ({:?}) after {} bytes",
                status,
                z.total_out()
            ),
        }
    }
}
