//! Compression evaluation engine.
//!
//! Three entry points share one measuring routine:
//! - [`CompressionEngine::benchmark_all`] sweeps every (codec, level) pair and
//!   reports every metric, for offline training data.
//! - [`CompressionEngine::select_best`] sweeps the same pairs but keeps only
//!   the winner for one metric.
//! - [`CompressionEngine::evaluate_one`] scores a single pre-chosen pair.
//!
//! Codec rejections (`Err` or zero-length output) are logged and skip the
//! candidate. They never abort a sweep.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{debug, warn};
use uuid::Uuid;

use crate::codec::{Codec, CodecId, Registry};
use crate::metric::{self, Measurement, Metric};

/// One metric for one (codec, level) pair over one buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressionRun {
    pub codec: CodecId,
    pub level: i32,
    pub metric: Metric,
    pub value: f32,
    /// Averaged duration of the pass the metric was derived from.
    pub duration: Duration,
    pub input_size: usize,
    /// Name of the persisted training chunk this run was measured on.
    pub chunk_id: String,
}

/// Result of a full sweep over one buffer.
#[derive(Debug, Clone)]
pub struct Benchmark {
    pub chunk_id: String,
    pub runs: Vec<CompressionRun>,
}

/// A single scored candidate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompressionSample {
    pub codec: CodecId,
    pub level: i32,
    pub metric: Metric,
    pub value: f32,
    pub compressed_size: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    /// Timed repetitions averaged per measurement. Values below 1 are treated as 1.
    pub repeat: u32,
    /// Also time decompression in [`CompressionEngine::benchmark_all`].
    pub measure_decompression: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            repeat: 1,
            measure_decompression: false,
        }
    }
}

/// Directory receiving raw copies of benchmarked buffers as `<uuid>.data`.
#[derive(Debug, Clone)]
pub struct ChunkStore {
    dir: PathBuf,
}

impl ChunkStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Fresh chunk identifier; also the file name the chunk is stored under.
    pub fn new_chunk_id() -> String {
        format!("{}.data", Uuid::new_v4())
    }

    pub fn persist(&self, chunk_id: &str, buf: &[u8]) -> io::Result<()> {
        fs::write(self.dir.join(chunk_id), buf)
    }
}

pub struct CompressionEngine {
    registry: Registry,
    options: EngineOptions,
    chunks: Option<ChunkStore>,
}

impl CompressionEngine {
    pub fn new(registry: Registry, options: EngineOptions) -> Self {
        Self {
            registry,
            options,
            chunks: None,
        }
    }

    /// Persist every benchmarked buffer into `store`.
    pub fn with_chunk_store(mut self, store: ChunkStore) -> Self {
        self.chunks = Some(store);
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn options(&self) -> EngineOptions {
        self.options
    }

    /// Measure every metric for every (codec, level) pair.
    ///
    /// Emits three runs per pair, four when decompression is measured, in
    /// [`Metric::ALL`] order. All runs share one chunk identifier, and the
    /// buffer is persisted once under it when a chunk store is configured.
    pub fn benchmark_all(&self, buf: &[u8]) -> Benchmark {
        let chunk_id = ChunkStore::new_chunk_id();
        let mut runs = Vec::with_capacity(self.registry.candidate_count() * 4);

        for codec in self.registry.iter() {
            let mut scratch = vec![0u8; codec.bound(buf.len())];
            for &level in codec.levels() {
                let Some(m) = self.measure_compression(codec.as_ref(), level, buf, &mut scratch)
                else {
                    continue;
                };

                for metric in [
                    Metric::CompressionRatio,
                    Metric::RatioPerSecond,
                    Metric::CompressionSpeed,
                ] {
                    runs.push(CompressionRun {
                        codec: codec.id(),
                        level,
                        metric,
                        value: m.value(metric).unwrap_or_default() as f32,
                        duration: m.elapsed,
                        input_size: buf.len(),
                        chunk_id: chunk_id.clone(),
                    });
                }

                if self.options.measure_decompression {
                    let compressed = &scratch[..m.compressed_size];
                    let elapsed = self.measure_decompression(codec.as_ref(), compressed, buf.len());
                    if let Some(elapsed) = elapsed {
                        runs.push(CompressionRun {
                            codec: codec.id(),
                            level,
                            metric: Metric::DecompressionSpeed,
                            value: metric::throughput(buf.len(), elapsed) as f32,
                            duration: elapsed,
                            input_size: buf.len(),
                            chunk_id: chunk_id.clone(),
                        });
                    }
                }
            }
        }

        if let Some(store) = &self.chunks {
            if let Err(e) = store.persist(&chunk_id, buf) {
                warn!("could not store chunk {} in {:?}: {}", chunk_id, store.dir(), e);
            }
        }

        debug!("benchmarked {} bytes: {} runs (chunk {})", buf.len(), runs.len(), chunk_id);
        Benchmark { chunk_id, runs }
    }

    /// Best (codec, level) for `metric`, skipping `exclude`.
    ///
    /// Comparison is strictly greater, so the first candidate seen wins ties.
    /// Returns `None` only when every candidate was skipped or rejected.
    pub fn select_best(
        &self,
        buf: &[u8],
        metric: Metric,
        exclude: Option<(CodecId, i32)>,
    ) -> Option<CompressionSample> {
        let mut best: Option<CompressionSample> = None;

        for codec in self.registry.iter() {
            let mut scratch = vec![0u8; codec.bound(buf.len())];
            for &level in codec.levels() {
                if exclude == Some((codec.id(), level)) {
                    continue;
                }
                let scored = self.score(codec.as_ref(), level, buf, metric, &mut scratch);
                let Some(sample) = scored else {
                    continue;
                };
                if best.map_or(true, |b| sample.value > b.value) {
                    best = Some(sample);
                }
            }
        }
        best
    }

    /// Score one pre-chosen candidate on `metric`.
    ///
    /// A codec that rejects the buffer scores zero with a compressed size of
    /// zero, so any working alternative beats it. Errors only if `codec` is not
    /// in the registry.
    pub fn evaluate_one(
        &self,
        codec: CodecId,
        level: i32,
        buf: &[u8],
        metric: Metric,
    ) -> anyhow::Result<CompressionSample> {
        let entry = self
            .registry
            .get(codec)
            .ok_or_else(|| anyhow::anyhow!("codec {} is not registered", codec))?;
        let mut scratch = vec![0u8; entry.bound(buf.len())];

        let sample = self
            .score(entry.as_ref(), level, buf, metric, &mut scratch)
            .unwrap_or(CompressionSample {
                codec,
                level,
                metric,
                value: 0.0,
                compressed_size: 0,
            });
        debug!(
            "predicted {}({}) scored {:.6} on {} | input {} -> output {}",
            codec, level, sample.value, metric, buf.len(), sample.compressed_size
        );
        Ok(sample)
    }

    fn score(
        &self,
        codec: &dyn Codec,
        level: i32,
        buf: &[u8],
        metric: Metric,
        scratch: &mut [u8],
    ) -> Option<CompressionSample> {
        let m = self.measure_compression(codec, level, buf, scratch)?;
        let value = if metric.needs_decompression() {
            let compressed = &scratch[..m.compressed_size];
            let elapsed = self.measure_decompression(codec, compressed, buf.len())?;
            metric::throughput(buf.len(), elapsed)
        } else {
            m.value(metric)?
        };
        Some(CompressionSample {
            codec: codec.id(),
            level,
            metric,
            value: value as f32,
            compressed_size: m.compressed_size,
        })
    }

    /// Average of the successful repetitions. Rejected repetitions are
    /// discarded; `None` if none succeeded.
    fn measure_compression(
        &self,
        codec: &dyn Codec,
        level: i32,
        buf: &[u8],
        scratch: &mut [u8],
    ) -> Option<Measurement> {
        let mut total = Duration::ZERO;
        let mut succeeded = 0u32;
        let mut compressed_size = 0;

        for _ in 0..self.options.repeat.max(1) {
            let start = Instant::now();
            match codec.compress(buf, scratch, level) {
                Ok(n) if n > 0 => {
                    total += start.elapsed();
                    succeeded += 1;
                    compressed_size = n;
                }
                Ok(_) => debug!(
                    "{}({}) produced no output for {} bytes",
                    codec.name(),
                    level,
                    buf.len()
                ),
                Err(e) => warn!(
                    "compression error: {}({}) | src size {}: {:#}",
                    codec.name(),
                    level,
                    buf.len(),
                    e
                ),
            }
        }

        if succeeded == 0 {
            warn!("skipping {}({}): codec rejected {} bytes", codec.name(), level, buf.len());
            return None;
        }
        Some(Measurement {
            input_size: buf.len(),
            compressed_size,
            elapsed: total / succeeded,
        })
    }

    fn measure_decompression(
        &self,
        codec: &dyn Codec,
        compressed: &[u8],
        raw_len: usize,
    ) -> Option<Duration> {
        let mut out = vec![0u8; raw_len];
        let mut total = Duration::ZERO;
        let mut succeeded = 0u32;

        for _ in 0..self.options.repeat.max(1) {
            let start = Instant::now();
            match codec.decompress(compressed, &mut out) {
                Ok(n) if n == raw_len => {
                    total += start.elapsed();
                    succeeded += 1;
                }
                Ok(n) => warn!(
                    "decompression error: {} produced {} of {} bytes",
                    codec.name(),
                    n,
                    raw_len
                ),
                Err(e) => warn!(
                    "decompression error: {} | compressed size {}: {:#}",
                    codec.name(),
                    compressed.len(),
                    e
                ),
            }
        }

        (succeeded > 0).then(|| total / succeeded)
    }
}
