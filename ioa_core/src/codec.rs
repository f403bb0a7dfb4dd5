use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::ConfigError;

/// Identity of a compression algorithm in the registry.
///
/// The set is closed: every codec the engine can benchmark, and every label
/// a classifier can emit, is one of these variants. The display name is the
/// exact string stored in trace datasets and label resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CodecId {
    Lz4,
    Lz4Fast,
    Zstd,
    Zlib,
}

impl CodecId {
    pub const ALL: [CodecId; 4] = [CodecId::Lz4, CodecId::Lz4Fast, CodecId::Zstd, CodecId::Zlib];

    pub fn name(self) -> &'static str {
        match self {
            CodecId::Lz4 => "LZ4",
            CodecId::Lz4Fast => "LZ4-fast",
            CodecId::Zstd => "ZSTD",
            CodecId::Zlib => "ZLIB",
        }
    }
}

impl fmt::Display for CodecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CodecId {
    type Err = ConfigError;

    /// Exact, case-sensitive match against the display names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CodecId::ALL
            .into_iter()
            .find(|id| id.name() == s)
            .ok_or_else(|| ConfigError::UnknownCodec(s.to_string()))
    }
}

/// Compression capability exposed by every registry entry.
///
/// Implementations work on caller-provided buffers so the engine can reuse a
/// single scratch allocation sized by [`Codec::bound`] across repetitions.
///
/// A return of `Ok(0)` or `Err(_)` from [`Codec::compress`] or
/// [`Codec::decompress`] means the codec rejected the input. The engine
/// treats both the same way: the candidate is skipped, never fatal.
pub trait Codec: Send + Sync {
    fn id(&self) -> CodecId;

    fn name(&self) -> &'static str {
        self.id().name()
    }

    /// Quality levels benchmarked for this codec, in evaluation order.
    fn levels(&self) -> &[i32];

    /// Worst-case compressed size for `len` input bytes.
    fn bound(&self, len: usize) -> usize;

    /// Compress `src` into `dst` at `level`, returning the number of bytes written.
    fn compress(&self, src: &[u8], dst: &mut [u8], level: i32) -> anyhow::Result<usize>;

    /// Decompress `src` into `dst`, returning the number of bytes produced.
    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> anyhow::Result<usize>;
}

/// Ordered, read-only table of codecs evaluated by the engine.
#[derive(Clone, Default)]
pub struct Registry {
    codecs: Vec<Arc<dyn Codec>>,
}

impl Registry {
    pub fn new(codecs: Vec<Arc<dyn Codec>>) -> Self {
        Self { codecs }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Codec>> {
        self.codecs.iter()
    }

    /// First codec registered under `id`.
    pub fn get(&self, id: CodecId) -> Option<&Arc<dyn Codec>> {
        self.codecs.iter().find(|c| c.id() == id)
    }

    pub fn len(&self) -> usize {
        self.codecs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }

    /// Number of (codec, level) candidates a full sweep visits.
    pub fn candidate_count(&self) -> usize {
        self.codecs.iter().map(|c| c.levels().len()).sum()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.codecs.iter().map(|c| (c.name(), c.levels().to_vec())))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_names_parse_exactly() {
        for id in CodecId::ALL {
            assert_eq!(id.name().parse::<CodecId>().unwrap(), id);
        }
        assert!("zstd".parse::<CodecId>().is_err());
        assert!("LZ4 ".parse::<CodecId>().is_err());
    }
}
