use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::ConfigError;

/// Elapsed times below this are clamped before dividing, so a codec that
/// finishes faster than the clock resolution still yields a finite metric.
pub const MIN_ELAPSED: Duration = Duration::from_micros(1);

/// What a benchmark run measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    /// input size / compressed size
    CompressionRatio,
    /// compression ratio / compression seconds
    RatioPerSecond,
    /// input bytes / compression seconds
    CompressionSpeed,
    /// input bytes / decompression seconds
    DecompressionSpeed,
}

impl Metric {
    pub const ALL: [Metric; 4] = [
        Metric::CompressionRatio,
        Metric::RatioPerSecond,
        Metric::CompressionSpeed,
        Metric::DecompressionSpeed,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Metric::CompressionRatio => "Compression Rate",
            Metric::RatioPerSecond => "Compression Rate per Time",
            Metric::CompressionSpeed => "Compression Speed",
            Metric::DecompressionSpeed => "Decompression Speed",
        }
    }

    /// Only decompression speed needs a decompression pass on top of the
    /// compression pass.
    pub fn needs_decompression(self) -> bool {
        self == Metric::DecompressionSpeed
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Metric {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Metric::ALL
            .into_iter()
            .find(|m| m.name() == s)
            .ok_or_else(|| ConfigError::UnknownMetric(s.to_string()))
    }
}

/// One averaged compression pass over a buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub input_size: usize,
    pub compressed_size: usize,
    pub elapsed: Duration,
}

impl Measurement {
    pub fn ratio(&self) -> f64 {
        self.input_size as f64 / self.compressed_size as f64
    }

    pub fn ratio_per_second(&self) -> f64 {
        self.ratio() / seconds(self.elapsed)
    }

    pub fn throughput(&self) -> f64 {
        throughput(self.input_size, self.elapsed)
    }

    /// Value of a compression-side metric. `None` for decompression speed,
    /// which needs a separate timed pass.
    pub fn value(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::CompressionRatio => Some(self.ratio()),
            Metric::RatioPerSecond => Some(self.ratio_per_second()),
            Metric::CompressionSpeed => Some(self.throughput()),
            Metric::DecompressionSpeed => None,
        }
    }
}

/// Bytes per second, with the elapsed floor applied.
pub fn throughput(bytes: usize, elapsed: Duration) -> f64 {
    bytes as f64 / seconds(elapsed)
}

fn seconds(elapsed: Duration) -> f64 {
    elapsed.max(MIN_ELAPSED).as_secs_f64()
}

/// Microseconds, saturating into the signed column type of the dataset.
pub fn micros(d: Duration) -> i64 {
    i64::try_from(d.as_micros()).unwrap_or(i64::MAX)
}

/// Wall-clock seconds since the epoch, as stored in every record.
pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
