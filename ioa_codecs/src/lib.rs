mod lz4_codec;
mod zlib_codec;
mod zstd_codec;

pub use lz4_codec::{Lz4Codec, Lz4FastCodec};
pub use zlib_codec::ZlibCodec;
pub use zstd_codec::ZstdCodec;

use std::sync::Arc;

use ioa_core::codec::{Codec, CodecId, Registry};

/// Codec for `id` with its default level list.
pub fn codec_by_id(id: CodecId) -> Arc<dyn Codec> {
    match id {
        CodecId::Lz4 => Arc::new(Lz4Codec::default()),
        CodecId::Lz4Fast => Arc::new(Lz4FastCodec::default()),
        CodecId::Zstd => Arc::new(ZstdCodec::default()),
        CodecId::Zlib => Arc::new(ZlibCodec::default()),
    }
}

/// Every bundled codec, in [`CodecId::ALL`] order.
pub fn registry() -> Registry {
    Registry::new(CodecId::ALL.into_iter().map(codec_by_id).collect())
}
