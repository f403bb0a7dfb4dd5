pub mod codec;
pub mod collective;
pub mod engine;
pub mod error;
pub mod format;
pub mod inference;
pub mod intercept;
pub mod io;
pub mod metric;
pub mod reader;
pub mod record;
pub mod settings;
pub mod trace;
pub mod writer;

pub use codec::{Codec, CodecId, Registry};
pub use collective::{Communicator, LocalGroup, SingleProcess};
pub use engine::{
    Benchmark, ChunkStore, CompressionEngine, CompressionRun, CompressionSample, EngineOptions,
};
pub use error::ConfigError;
pub use format::{CompressionTraceRow, EvaluationRow, IoTraceRow, Table, MAGIC};
pub use inference::{Classifier, Label, LabelTable, LinearClassifier, Predictor};
pub use intercept::{Interceptor, Runtime, TracingState};
pub use io::{Datatype, FileHandle, IoLayer, LocalFiles, WriteCall, WriteOp};
pub use metric::Metric;
pub use reader::DatasetReader;
pub use record::{EvaluationRecord, IoFields, IoObject, TraceRecord};
pub use settings::{Modes, Settings};
pub use trace::TraceLog;
pub use writer::DatasetWriter;
