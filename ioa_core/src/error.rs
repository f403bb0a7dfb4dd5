use std::path::PathBuf;

use thiserror::Error;

use crate::codec::CodecId;

/// Startup failures. Any of these keeps the interceptor from being armed.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not parse options: {0}")]
    Options(String),

    #[error("--meta-path has to be specified when tracing, benchmarking or inferencing")]
    MissingMetaPath,

    #[error("--repeat must be at least 1, got {0}")]
    InvalidRepeat(u32),

    #[error("--store-chunks requires --chunk-path")]
    MissingChunkPath,

    #[error("chunk path {0:?} does not exist or is not a directory")]
    ChunkPathNotDir(PathBuf),

    #[error("model file {0:?} does not exist")]
    ModelNotFound(PathBuf),

    #[error("label resource {0:?} does not exist")]
    LabelsNotFound(PathBuf),

    #[error("inferencing requires a model and a label resource (--model-path, --settings-path)")]
    InferenceWithoutModel,

    #[error("unknown metric name {0:?}")]
    UnknownMetric(String),

    #[error("unknown codec name {0:?}")]
    UnknownCodec(String),

    #[error("invalid feature width {0:?}")]
    InvalidWidth(String),

    #[error("malformed label on line {line}: {text:?}")]
    MalformedLabel { line: usize, text: String },

    #[error("label resource lists no classes")]
    NoLabels,

    #[error("label {codec}:{level} names a codec that is not registered")]
    UnregisteredLabel { codec: CodecId, level: i32 },

    #[error("model shape mismatch: {0}")]
    ModelShape(String),
}
