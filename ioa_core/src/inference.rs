//! Classifier-driven codec selection.
//!
//! The label resource is line oriented:
//!
//! ```text
//! Compression Rate        <- metric the model was trained for
//! 1024                    <- feature width
//! ZSTD:3                  <- class 0
//! LZ4-fast:17             <- class 1
//! ```
//!
//! Blank lines among the labels are skipped and do not consume a class index.

use std::fs;
use std::path::Path;

use anyhow::Context;
use log::debug;
use rayon::prelude::*;
use serde::Deserialize;

use crate::codec::{CodecId, Registry};
use crate::error::ConfigError;
use crate::metric::Metric;

/// A (codec, level) pair as emitted by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label {
    pub codec: CodecId,
    pub level: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LabelTable {
    pub metric: Metric,
    pub width: usize,
    pub labels: Vec<Label>,
}

impl LabelTable {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading label resource {:?}", path))?;
        Ok(Self::parse(&text)?)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut lines = text.lines();

        let metric = lines.next().unwrap_or_default().parse::<Metric>()?;
        let width_line = lines.next().unwrap_or_default();
        let width = width_line
            .trim()
            .parse::<usize>()
            .ok()
            .filter(|w| *w > 0)
            .ok_or_else(|| ConfigError::InvalidWidth(width_line.to_string()))?;

        let mut labels = Vec::new();
        for (idx, line) in lines.enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let malformed = || ConfigError::MalformedLabel {
                line: idx + 3,
                text: line.to_string(),
            };
            let (name, level) = line.split_once(':').ok_or_else(malformed)?;
            let codec = name.parse::<CodecId>()?;
            let level = level.trim().parse::<i32>().map_err(|_| malformed())?;
            labels.push(Label { codec, level });
        }

        if labels.is_empty() {
            return Err(ConfigError::NoLabels);
        }
        Ok(Self { metric, width, labels })
    }

    /// Every label has to name a codec `registry` can run.
    pub fn check_registry(&self, registry: &Registry) -> Result<(), ConfigError> {
        match self.labels.iter().find(|l| registry.get(l.codec).is_none()) {
            Some(l) => Err(ConfigError::UnregisteredLabel {
                codec: l.codec,
                level: l.level,
            }),
            None => Ok(()),
        }
    }
}

/// External classification capability: features in, one score per class out.
pub trait Classifier {
    fn classify(&self, features: &[f32]) -> anyhow::Result<Vec<f32>>;
}

/// Dense single-layer classifier: `scores = weights · features + bias`.
///
/// Stored as JSON: `{"weights": [[f32; width]; classes], "bias": [f32; classes]}`.
#[derive(Debug, Clone, Deserialize)]
pub struct LinearClassifier {
    weights: Vec<Vec<f32>>,
    bias: Vec<f32>,
}

impl LinearClassifier {
    pub fn new(weights: Vec<Vec<f32>>, bias: Vec<f32>) -> anyhow::Result<Self> {
        let model = Self { weights, bias };
        model.check_shape()?;
        Ok(model)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|| format!("reading model {:?}", path))?;
        let model: Self =
            serde_json::from_str(&text).with_context(|| format!("parsing model {:?}", path))?;
        model.check_shape()?;
        Ok(model)
    }

    pub fn classes(&self) -> usize {
        self.weights.len()
    }

    pub fn width(&self) -> usize {
        self.weights.first().map_or(0, Vec::len)
    }

    fn check_shape(&self) -> Result<(), ConfigError> {
        if self.weights.is_empty() {
            return Err(ConfigError::ModelShape("no classes".into()));
        }
        if self.bias.len() != self.weights.len() {
            return Err(ConfigError::ModelShape(format!(
                "{} weight rows but {} biases",
                self.weights.len(),
                self.bias.len()
            )));
        }
        let width = self.width();
        if self.weights.iter().any(|row| row.len() != width) {
            return Err(ConfigError::ModelShape("weight rows differ in length".into()));
        }
        Ok(())
    }
}

impl Classifier for LinearClassifier {
    fn classify(&self, features: &[f32]) -> anyhow::Result<Vec<f32>> {
        if features.len() != self.width() {
            anyhow::bail!(
                "model expects {} features, got {}",
                self.width(),
                features.len()
            );
        }
        Ok(self
            .weights
            .iter()
            .zip(&self.bias)
            .map(|(row, b)| row.iter().zip(features).map(|(w, x)| w * x).sum::<f32>() + b)
            .collect())
    }
}

/// Label table plus the model that scores against it.
pub struct Predictor {
    table: LabelTable,
    model: Box<dyn Classifier + Send>,
}

impl Predictor {
    pub fn new(table: LabelTable, model: Box<dyn Classifier + Send>) -> Self {
        Self { table, model }
    }

    /// Load a [`LinearClassifier`] and check it against the label table.
    pub fn load(
        model_path: impl AsRef<Path>,
        labels_path: impl AsRef<Path>,
    ) -> anyhow::Result<Self> {
        let table = LabelTable::load(labels_path)?;
        let model = LinearClassifier::load(model_path)?;
        if model.width() != table.width || model.classes() != table.labels.len() {
            return Err(ConfigError::ModelShape(format!(
                "model is {}x{} but labels declare {} classes of width {}",
                model.classes(),
                model.width(),
                table.labels.len(),
                table.width
            ))
            .into());
        }
        Ok(Self::new(table, Box::new(model)))
    }

    /// Metric the model was trained to optimize.
    pub fn metric(&self) -> Metric {
        self.table.metric
    }

    pub fn table(&self) -> &LabelTable {
        &self.table
    }

    /// Predicted (codec, level) for `buf`.
    pub fn predict(&self, buf: &[u8]) -> anyhow::Result<Label> {
        let features = feature_view(buf, self.table.width);
        let scores = self.model.classify(&features).context("classifier failed")?;
        let probabilities = softmax(&scores);
        let winner = arg_max(&probabilities).context("classifier returned no scores")?;
        debug!("predicted class {} of {}", winner, probabilities.len());
        self.table
            .labels
            .get(winner)
            .copied()
            .with_context(|| {
                format!(
                    "class {} has no label ({} labels)",
                    winner,
                    self.table.labels.len()
                )
            })
    }
}

/// Reinterpret the buffer as little-endian `f32`s, truncated or zero-padded
/// to `width`, with every non-finite value replaced by zero.
pub fn feature_view(buf: &[u8], width: usize) -> Vec<f32> {
    let mut features: Vec<f32> = buf
        .chunks_exact(4)
        .take(width)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    features.resize(width, 0.0);
    features.par_iter_mut().for_each(|x| {
        if !x.is_finite() {
            *x = 0.0;
        }
    });
    features
}

/// Softmax with the maximum subtracted first, so large scores cannot overflow.
pub fn softmax(scores: &[f32]) -> Vec<f32> {
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Index of the first maximum.
pub fn arg_max(values: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &v) in values.iter().enumerate() {
        if best.map_or(true, |(_, b)| v > b) {
            best = Some((i, v));
        }
    }
    best.map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LABELS: &str = "Compression Rate\n4\nZSTD:3\n\nLZ4-fast:17\nZLIB:9\n";

    #[test]
    fn parses_label_resource_skipping_blank_lines() {
        let table = LabelTable::parse(LABELS).unwrap();
        assert_eq!(table.metric, Metric::CompressionRatio);
        assert_eq!(table.width, 4);
        assert_eq!(
            table.labels,
            vec![
                Label { codec: CodecId::Zstd, level: 3 },
                Label { codec: CodecId::Lz4Fast, level: 17 },
                Label { codec: CodecId::Zlib, level: 9 },
            ]
        );
    }

    #[test]
    fn rejects_unknown_names_and_bad_lines() {
        assert!(matches!(
            LabelTable::parse("Compression rate\n4\nZSTD:3\n"),
            Err(ConfigError::UnknownMetric(_))
        ));
        assert!(matches!(
            LabelTable::parse("Compression Rate\n4\nGZIP:3\n"),
            Err(ConfigError::UnknownCodec(_))
        ));
        assert!(matches!(
            LabelTable::parse("Compression Rate\n4\nZSTD\n"),
            Err(ConfigError::MalformedLabel { line: 3, .. })
        ));
        assert!(matches!(
            LabelTable::parse("Compression Rate\nwide\nZSTD:3\n"),
            Err(ConfigError::InvalidWidth(_))
        ));
        assert!(matches!(LabelTable::parse("Compression Rate\n4\n\n"), Err(ConfigError::NoLabels)));
    }

    #[test]
    fn labels_must_name_registered_codecs() {
        let table = LabelTable::parse(LABELS).unwrap();
        assert!(matches!(
            table.check_registry(&Registry::default()),
            Err(ConfigError::UnregisteredLabel {
                codec: CodecId::Zstd,
                level: 3
            })
        ));
    }

    #[test]
    fn softmax_is_stable_for_large_scores() {
        let p = softmax(&[1000.0, 1001.0, 999.0]);
        assert!(p.iter().all(|x| x.is_finite()));
        assert!((p.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        assert_eq!(arg_max(&p), Some(1));
    }

    #[test]
    fn arg_max_prefers_first_on_ties() {
        assert_eq!(arg_max(&[0.2, 0.4, 0.4]), Some(1));
        assert_eq!(arg_max(&[]), None);
    }

    #[test]
    fn feature_view_pads_truncates_and_sanitizes() {
        let mut buf = Vec::new();
        for v in [1.5f32, f32::NAN, f32::INFINITY, -2.0, 7.0] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        assert_eq!(feature_view(&buf, 4), vec![1.5, 0.0, 0.0, -2.0]);
        assert_eq!(feature_view(&buf[..8], 3), vec![1.5, 0.0, 0.0]);
        assert_eq!(feature_view(&[], 2), vec![0.0, 0.0]);
    }

    #[test]
    fn predictor_maps_winning_class_to_label() {
        let table = LabelTable::parse(LABELS).unwrap();
        // class 2 responds to the first feature
        let model = LinearClassifier::new(
            vec![vec![0.0; 4], vec![0.0; 4], vec![1.0, 0.0, 0.0, 0.0]],
            vec![0.1, 0.0, 0.0],
        )
        .unwrap();
        let predictor = Predictor::new(table, Box::new(model));

        let buf = 5.0f32.to_le_bytes();
        assert_eq!(predictor.predict(&buf).unwrap(), Label { codec: CodecId::Zlib, level: 9 });
        assert_eq!(predictor.predict(&[]).unwrap(), Label { codec: CodecId::Zstd, level: 3 });
    }

    #[test]
    fn classifier_failure_surfaces_as_error() {
        struct Broken;
        impl Classifier for Broken {
            fn classify(&self, _: &[f32]) -> anyhow::Result<Vec<f32>> {
                anyhow::bail!("session lost")
            }
        }
        let predictor = Predictor::new(LabelTable::parse(LABELS).unwrap(), Box::new(Broken));
        assert!(predictor.predict(&[0u8; 16]).is_err());
    }
}
