//! Interception dispatcher.
//!
//! [`Interceptor`] wraps an [`IoLayer`] and implements it again, so the
//! application keeps calling the same operation set. Every call is
//! forwarded to the inner layer with its original arguments and its result
//! is returned unchanged. Around that, depending on the active modes, the
//! write buffer is benchmarked, the call is timed, or a classifier
//! prediction is scored against the alternatives.
//!
//! Recording stops at the first `finalize`, which flushes every rank's
//! records into one dataset before the inner layer shuts down.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use log::{debug, info};

use crate::codec::Registry;
use crate::collective::Communicator;
use crate::engine::CompressionEngine;
use crate::error::ConfigError;
use crate::inference::Predictor;
use crate::io::{FileHandle, IoLayer, WriteCall};
use crate::metric;
use crate::record::{EvaluationRecord, IoFields, TraceRecord};
use crate::settings::{Modes, Settings};
use crate::trace::TraceLog;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracingState {
    Active,
    /// Entered once, at the first finalize. Never left.
    Stopped,
}

/// Everything the dispatcher keeps between calls on one rank.
pub struct Runtime {
    engine: CompressionEngine,
    predictor: Option<Predictor>,
    log: TraceLog,
    state: TracingState,
    modes: Modes,
    min_size: u64,
    dataset_path: Option<PathBuf>,
}

impl Runtime {
    pub fn new(engine: CompressionEngine, modes: Modes) -> Self {
        Self {
            engine,
            predictor: None,
            log: TraceLog::new(),
            state: TracingState::Active,
            modes,
            min_size: 0,
            dataset_path: None,
        }
    }

    /// Build from validated settings: chunk store, repeat count and the
    /// classifier all come from `settings`.
    pub fn from_settings(settings: &Settings, registry: Registry) -> anyhow::Result<Self> {
        settings.validate()?;

        let mut engine = CompressionEngine::new(registry.clone(), settings.engine_options());
        if let Some(store) = settings.chunk_store() {
            engine = engine.with_chunk_store(store);
        }
        let mut runtime = Self::new(engine, settings.modes()).with_min_size(settings.min_size);
        if let Some(path) = &settings.meta_path {
            runtime = runtime.with_dataset_path(path);
        }
        if settings.inferencing {
            if let (Some(model), Some(labels)) = (&settings.model_path, &settings.settings_path) {
                let predictor = Predictor::load(model, labels).context("loading classifier")?;
                predictor.table().check_registry(&registry)?;
                info!(
                    "classifier loaded: {} classes, width {}, metric {}",
                    predictor.table().labels.len(),
                    predictor.table().width,
                    predictor.metric()
                );
                runtime = runtime.with_predictor(predictor);
            }
        }
        Ok(runtime)
    }

    pub fn with_min_size(mut self, min_size: u64) -> Self {
        self.min_size = min_size;
        self
    }

    pub fn with_dataset_path(mut self, path: impl AsRef<Path>) -> Self {
        self.dataset_path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_predictor(mut self, predictor: Predictor) -> Self {
        self.predictor = Some(predictor);
        self
    }

    pub fn modes(&self) -> Modes {
        self.modes
    }

    pub fn state(&self) -> TracingState {
        self.state
    }

    pub fn engine(&self) -> &CompressionEngine {
        &self.engine
    }

    fn check(&self) -> Result<(), ConfigError> {
        if self.modes.any() && self.dataset_path.is_none() {
            return Err(ConfigError::MissingMetaPath);
        }
        if self.modes.inference && self.predictor.is_none() {
            return Err(ConfigError::InferenceWithoutModel);
        }
        Ok(())
    }

    fn recording(&self) -> bool {
        self.state == TracingState::Active && self.modes.any()
    }

    fn admits(&self, size: u64) -> bool {
        size >= self.min_size
    }
}

pub struct Interceptor<L, C> {
    inner: L,
    comm: C,
    runtime: Runtime,
}

impl<L: IoLayer, C: Communicator> Interceptor<L, C> {
    pub fn new(inner: L, comm: C, runtime: Runtime) -> Result<Self, ConfigError> {
        runtime.check()?;
        debug!(
            "rank {}/{} armed: {:?}, min size {}",
            comm.rank(),
            comm.size(),
            runtime.modes,
            runtime.min_size
        );
        Ok(Self { inner, comm, runtime })
    }

    /// Arm from the `IOA_OPTIONS` environment variable.
    pub fn from_env(inner: L, comm: C, registry: Registry) -> anyhow::Result<Self> {
        let settings = Settings::from_env()?;
        let runtime = Runtime::from_settings(&settings, registry)?;
        Ok(Self::new(inner, comm, runtime)?)
    }

    pub fn trace_log(&self) -> &TraceLog {
        &self.runtime.log
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn io(&self) -> &L {
        &self.inner
    }

    pub fn io_mut(&mut self) -> &mut L {
        &mut self.inner
    }

    pub fn into_inner(self) -> L {
        self.inner
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    pub fn size(&self) -> usize {
        self.comm.size()
    }

    pub fn is_stopped(&self) -> bool {
        self.runtime.state == TracingState::Stopped
    }

    fn io_fields(&mut self, call: &WriteCall<'_>) -> IoFields {
        let offset = call.offset.unwrap_or_else(|| self.inner.position(call.handle));
        IoFields {
            handle: call.handle,
            operation: call.op.name(),
            timestamp: metric::unix_timestamp(),
            duration_us: 0,
            datatype: call.datatype.display_name().to_string(),
            count: call.count,
            size: call.byte_size() as u64,
            offset,
            rank: self.comm.rank() as i32,
        }
    }

    /// Score the classifier's pick for `buf` against every other candidate.
    fn evaluate_prediction(&mut self, buf: &[u8]) {
        let Runtime {
            engine,
            predictor,
            log,
            ..
        } = &mut self.runtime;
        let comm = &self.comm;
        let Some(predictor) = predictor.as_ref() else {
            return;
        };

        let metric = predictor.metric();
        let label = predictor
            .predict(buf)
            .unwrap_or_else(|e| comm.abort(&e.context("classification failed")));
        let predicted = engine
            .evaluate_one(label.codec, label.level, buf, metric)
            .unwrap_or_else(|e| comm.abort(&e));
        let best = engine.select_best(buf, metric, Some((label.codec, label.level)));

        let rank = comm.rank() as i32;
        let record = EvaluationRecord::compare(rank, buf.len() as u64, metric, predicted, best);
        debug!(
            "evaluated {}({}) on {} bytes: {}",
            label.codec,
            label.level,
            buf.len(),
            match &record.tested {
                Some(t) => format!(
                    "beaten by {}({}) {:.6} > {:.6}",
                    t.codec, t.level, t.value, predicted.value
                ),
                None => "held".to_string(),
            }
        );
        log.push_evaluation(record);
    }
}

impl<L: IoLayer, C: Communicator> IoLayer for Interceptor<L, C> {
    type Completion = L::Completion;
    type Error = L::Error;

    fn open(&mut self, path: &str) -> Result<FileHandle, L::Error> {
        let handle = self.inner.open(path)?;
        if self.runtime.recording() {
            self.runtime.log.register_object(handle, path);
        }
        Ok(handle)
    }

    fn write(&mut self, call: &WriteCall<'_>) -> Result<L::Completion, L::Error> {
        if !self.runtime.recording() {
            return self.inner.write(call);
        }
        let size = call.byte_size() as u64;
        let admitted = self.runtime.admits(size);

        if self.runtime.modes.inference && admitted {
            self.evaluate_prediction(call.payload());
            return self.inner.write(call);
        }

        let io = self.io_fields(call);
        debug!(
            "rank {} {} on handle {}: {} bytes{}{}",
            io.rank,
            io.operation,
            io.handle.0,
            size,
            if call.op.is_collective() { ", collective" } else { "" },
            if call.op.is_nonblocking() { ", nonblocking" } else { "" }
        );

        if self.runtime.modes.benchmark && admitted {
            let bench = self.runtime.engine.benchmark_all(call.payload());
            for run in bench.runs {
                self.runtime.log.push(TraceRecord::Compression { io: io.clone(), run });
            }
        }

        if self.runtime.modes.tracing {
            let start = Instant::now();
            let result = self.inner.write(call);
            let duration_us = metric::micros(start.elapsed());
            self.runtime.log.push(TraceRecord::Io(IoFields { duration_us, ..io }));
            return result;
        }

        self.inner.write(call)
    }

    fn position(&mut self, handle: FileHandle) -> i64 {
        self.inner.position(handle)
    }

    fn finalize(&mut self) -> Result<(), L::Error> {
        if self.runtime.state == TracingState::Active {
            self.runtime.state = TracingState::Stopped;
            if self.runtime.modes.any() {
                if let Some(path) = self.runtime.dataset_path.clone() {
                    let counts = self.runtime.log.counts();
                    debug!("rank {} flushing {:?} to {:?}", self.comm.rank(), counts, path);
                    if let Err(e) = self.runtime.log.flush(&self.comm, &path) {
                        self.comm.abort(&e.context(format!("writing trace dataset {:?}", path)));
                    }
                }
            }
        }
        self.inner.finalize()
    }
}
