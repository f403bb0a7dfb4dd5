//! In-memory trace records and their dataset rows.

use crate::engine::{CompressionRun, CompressionSample};
use crate::format::{CompressionTraceRow, EvaluationRow, IoTraceRow};
use crate::io::FileHandle;
use crate::metric::{self, Metric};

/// A file opened while tracing was active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoObject {
    pub handle: FileHandle,
    pub filename: String,
}

/// Fields common to every observed write.
#[derive(Debug, Clone, PartialEq)]
pub struct IoFields {
    pub handle: FileHandle,
    pub operation: &'static str,
    /// Seconds since the Unix epoch.
    pub timestamp: i64,
    /// Zero when the write itself was not timed.
    pub duration_us: i64,
    pub datatype: String,
    pub count: i32,
    pub size: u64,
    pub offset: i64,
    pub rank: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TraceRecord {
    /// The real write, timed.
    Io(IoFields),
    /// One benchmark run over the buffer of a write.
    Compression { io: IoFields, run: CompressionRun },
}

impl TraceRecord {
    pub fn io(&self) -> &IoFields {
        match self {
            TraceRecord::Io(io) => io,
            TraceRecord::Compression { io, .. } => io,
        }
    }

    pub fn is_compression(&self) -> bool {
        matches!(self, TraceRecord::Compression { .. })
    }
}

/// Predicted (codec, level) vs. the best alternative found by sweeping.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationRecord {
    pub timestamp: i64,
    pub rank: i32,
    pub size: u64,
    pub metric: Metric,
    pub predicted: CompressionSample,
    /// Present only when the alternative strictly beat the prediction.
    pub tested: Option<CompressionSample>,
}

impl EvaluationRecord {
    /// Build a record from the two scores. `best` is kept only if it is
    /// strictly better than `predicted`.
    pub fn compare(
        rank: i32,
        size: u64,
        metric: Metric,
        predicted: CompressionSample,
        best: Option<CompressionSample>,
    ) -> Self {
        Self {
            timestamp: metric::unix_timestamp(),
            rank,
            size,
            metric,
            predicted,
            tested: best.filter(|b| b.value > predicted.value),
        }
    }

    /// The prediction was at least as good as anything else tried.
    pub fn prediction_held(&self) -> bool {
        self.tested.is_none()
    }
}

// ── Row conversion ─────────────────────────────────────────────────────────

impl From<&IoFields> for IoTraceRow {
    fn from(io: &IoFields) -> Self {
        IoTraceRow {
            operation: io.operation.to_string(),
            timestamp: io.timestamp,
            duration_us: io.duration_us,
            datatype: io.datatype.clone(),
            offset: io.offset,
            count: io.count,
            size: io.size,
            rank: io.rank,
        }
    }
}

impl CompressionTraceRow {
    pub fn from_run(io: &IoFields, run: &CompressionRun) -> Self {
        CompressionTraceRow {
            operation: io.operation.to_string(),
            timestamp: io.timestamp,
            chunk: run.chunk_id.clone(),
            duration_us: metric::micros(run.duration),
            datatype: io.datatype.clone(),
            offset: io.offset,
            count: io.count,
            size: io.size,
            rank: io.rank,
            codec: run.codec.name().to_string(),
            level: run.level,
            metric: run.metric.name().to_string(),
            value: run.value,
        }
    }
}

impl From<&EvaluationRecord> for EvaluationRow {
    fn from(rec: &EvaluationRecord) -> Self {
        let (tested_codec, tested_level, tested_value, tested_size) = match &rec.tested {
            Some(t) => (t.codec.name().to_string(), t.level, t.value, t.compressed_size as u64),
            None => (String::new(), 0, 0.0, 0),
        };
        EvaluationRow {
            timestamp: rec.timestamp,
            rank: rec.rank,
            size: rec.size,
            metric: rec.metric.name().to_string(),
            predicted_codec: rec.predicted.codec.name().to_string(),
            predicted_level: rec.predicted.level,
            predicted_value: rec.predicted.value,
            predicted_size: rec.predicted.compressed_size as u64,
            tested_codec,
            tested_level,
            tested_value,
            tested_size,
        }
    }
}
