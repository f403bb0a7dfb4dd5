//! Process-wide options, read once before any call is intercepted.

use std::path::PathBuf;

use clap::{Args, Parser};

use crate::engine::{ChunkStore, EngineOptions};
use crate::error::ConfigError;

/// Environment variable holding the interceptor options as a command line.
pub const OPTIONS_ENV: &str = "IOA_OPTIONS";

#[derive(Args, Debug, Clone, PartialEq)]
pub struct Settings {
    /// Only benchmark or infer on writes of at least this many bytes
    #[arg(short, long, default_value_t = 0)]
    pub min_size: u64,

    /// Timed repetitions averaged per measurement
    #[arg(short, long, default_value_t = 1)]
    pub repeat: u32,

    /// Trace dataset written at shutdown
    #[arg(short = 'p', long)]
    pub meta_path: Option<PathBuf>,

    /// Record every write call with its duration
    #[arg(short, long)]
    pub tracing: bool,

    /// Keep a raw copy of every benchmarked buffer
    #[arg(short, long)]
    pub store_chunks: bool,

    /// Directory receiving stored chunks
    #[arg(short, long)]
    pub chunk_path: Option<PathBuf>,

    /// Benchmark every codec and level on each write
    #[arg(short = 'e', long)]
    pub test_compression: bool,

    /// Classifier model (JSON)
    #[arg(short = 'x', long)]
    pub model_path: Option<PathBuf>,

    /// Label resource matching the model's classes
    #[arg(short = 'o', long)]
    pub settings_path: Option<PathBuf>,

    /// Predict a codec per write and evaluate the prediction
    #[arg(short, long)]
    pub inferencing: bool,

    /// Also measure decompression speed
    #[arg(short, long)]
    pub decompression: bool,

    /// Debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            min_size: 0,
            repeat: 1,
            meta_path: None,
            tracing: false,
            store_chunks: false,
            chunk_path: None,
            test_compression: false,
            model_path: None,
            settings_path: None,
            inferencing: false,
            decompression: false,
            verbose: false,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "ioa",
    no_binary_name = true,
    disable_help_flag = true,
    disable_version_flag = true
)]
struct EnvOptions {
    #[command(flatten)]
    settings: Settings,
}

/// Which branches of the dispatcher are active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Modes {
    pub tracing: bool,
    pub benchmark: bool,
    pub inference: bool,
}

impl Modes {
    /// Anything to record at all.
    pub fn any(&self) -> bool {
        self.tracing || self.benchmark || self.inference
    }
}

impl Settings {
    /// Read [`OPTIONS_ENV`]. Unset means every mode is off.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var(OPTIONS_ENV) {
            Ok(line) => Self::parse_options(&line),
            Err(std::env::VarError::NotPresent) => Ok(Self::default()),
            Err(e) => Err(ConfigError::Options(format!("{}: {}", OPTIONS_ENV, e))),
        }
    }

    /// Parse a whitespace-separated option line.
    pub fn parse_options(line: &str) -> Result<Self, ConfigError> {
        EnvOptions::try_parse_from(line.split_whitespace())
            .map(|opts| opts.settings)
            .map_err(|e| ConfigError::Options(e.to_string().trim().to_string()))
    }

    pub fn modes(&self) -> Modes {
        Modes {
            tracing: self.tracing,
            benchmark: self.test_compression,
            inference: self.inferencing,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.repeat < 1 {
            return Err(ConfigError::InvalidRepeat(self.repeat));
        }
        if self.modes().any() && self.meta_path.is_none() {
            return Err(ConfigError::MissingMetaPath);
        }
        if self.store_chunks && self.chunk_path.is_none() {
            return Err(ConfigError::MissingChunkPath);
        }
        if let Some(dir) = &self.chunk_path {
            if !dir.is_dir() {
                return Err(ConfigError::ChunkPathNotDir(dir.clone()));
            }
        }
        if let Some(model) = &self.model_path {
            if !model.is_file() {
                return Err(ConfigError::ModelNotFound(model.clone()));
            }
        }
        if let Some(labels) = &self.settings_path {
            if !labels.is_file() {
                return Err(ConfigError::LabelsNotFound(labels.clone()));
            }
        }
        if self.inferencing && (self.model_path.is_none() || self.settings_path.is_none()) {
            return Err(ConfigError::InferenceWithoutModel);
        }
        Ok(())
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            repeat: self.repeat,
            measure_decompression: self.decompression,
        }
    }

    /// Chunks are stored whenever a chunk directory is configured.
    pub fn chunk_store(&self) -> Option<ChunkStore> {
        self.chunk_path.as_deref().map(|dir| ChunkStore::new(dir))
    }
}
