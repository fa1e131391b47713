//! ONNX image classifier.
//!
use std::{
    fs::File,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use smallvec::SmallVec;
use thiserror::Error;
use tract_onnx::prelude::*;

use crate::frame::FrameBuffer;

type NnModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;
type NnOut = SmallVec<[TValue; 4]>;

/// File name of the model weights/topology descriptor inside the bundle.
pub const WEIGHTS_FILE: &str = "model.onnx";
/// File name of the metadata descriptor inside the bundle.
pub const METADATA_FILE: &str = "metadata.json";

/// Network input edge length used when the metadata does not specify one.
const DEFAULT_INPUT_SIZE: u32 = 224;

/// Sum tolerance when deciding whether scores are already probabilities.
const PROBABILITY_SUM_TOLERANCE: f32 = 1.0e-3;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("missing model asset: {}", .0.display())]
    MissingAsset(PathBuf),
    #[error("failed to read model asset: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed model metadata: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error("metadata contains no class labels")]
    EmptyLabels,
    #[error("failed to build model plan: {0}")]
    Plan(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("model emitted {got} scores for {expected} labels")]
    LabelMismatch { expected: usize, got: usize },
    #[error("classification requested on an empty frame buffer")]
    EmptyFrame,
    #[error("model load task failed: {0}")]
    Internal(String),
}

/// A ranked classification result.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub label: String,
    /// Confidence in [0, 1].
    pub probability: f32,
}

/// Inference seam between the model gateway and a concrete network.
pub trait ImageClassifier: Send + Sync {
    /// Number of classes, fixed at load time.
    fn class_count(&self) -> usize;

    /// Classify the current frame buffer contents.
    fn classify(&self, frame: &FrameBuffer) -> Result<Vec<Prediction>, ModelError>;
}

/// Metadata descriptor shipped next to the weights.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelMetadata {
    labels: Vec<String>,
    #[serde(default)]
    image_size: Option<u32>,
}

/// Classifier backed by a tract-onnx plan and the bundle's class labels.
#[derive(Debug)]
pub struct OnnxClassifier {
    model: NnModel,
    labels: Vec<String>,
    input_size: u32,
}

impl OnnxClassifier {
    /// Load the two-file bundle from `base`.
    ///
    /// Both files are required; a missing or malformed one fails the load
    /// without leaving any partial state behind.
    pub fn load(base: &Path) -> Result<Self, ModelError> {
        let weights = base.join(WEIGHTS_FILE);
        let metadata_path = base.join(METADATA_FILE);
        for path in [&weights, &metadata_path] {
            if !path.is_file() {
                return Err(ModelError::MissingAsset(path.clone()));
            }
        }

        let metadata: ModelMetadata = serde_json::from_reader(File::open(&metadata_path)?)?;
        if metadata.labels.is_empty() {
            return Err(ModelError::EmptyLabels);
        }
        let input_size = metadata.image_size.unwrap_or(DEFAULT_INPUT_SIZE);

        let model =
            build_plan(&weights, input_size).map_err(|err| ModelError::Plan(err.to_string()))?;
        log::debug!(
            "Built model plan from {} with {}x{} input",
            weights.display(),
            input_size,
            input_size
        );

        Ok(Self {
            model,
            labels: metadata.labels,
            input_size,
        })
    }

    fn preproc(&self, frame: &FrameBuffer) -> Tensor {
        let resized = image::imageops::resize(
            &frame.as_view(),
            self.input_size,
            self.input_size,
            image::imageops::FilterType::Triangle,
        );

        let side = self.input_size as usize;
        let tensor: Tensor =
            tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
                // Note: MobileNet normalization, which the exported bundles
                // are trained against
                let mean = [0.485, 0.456, 0.406][c];
                let std = [0.229, 0.224, 0.225][c];
                (resized[(x as _, y as _)][c] as f32 / 255.0 - mean) / std
            })
            .into();

        tensor
    }

    fn postproc(&self, raw_nn_out: NnOut) -> Result<Vec<Prediction>, ModelError> {
        let scores = raw_nn_out.first().ok_or(ModelError::LabelMismatch {
            expected: self.labels.len(),
            got: 0,
        })?;
        let scores: Vec<f32> = scores
            .to_array_view::<f32>()
            .map_err(|err| ModelError::Inference(err.to_string()))?
            .iter()
            .copied()
            .collect();

        scores_to_predictions(&self.labels, scores)
    }
}

impl ImageClassifier for OnnxClassifier {
    fn class_count(&self) -> usize {
        self.labels.len()
    }

    fn classify(&self, frame: &FrameBuffer) -> Result<Vec<Prediction>, ModelError> {
        if frame.width() == 0 || frame.height() == 0 {
            return Err(ModelError::EmptyFrame);
        }
        let valid_input = tvec!(self.preproc(frame).into());
        let raw_nn_out = self
            .model
            .run(valid_input)
            .map_err(|err| ModelError::Inference(err.to_string()))?;
        self.postproc(raw_nn_out)
    }
}

fn build_plan(weights: &Path, input_size: u32) -> TractResult<NnModel> {
    let side = input_size as usize;
    let input_fact = InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, side, side));
    tract_onnx::onnx()
        .model_for_path(weights)?
        .with_input_fact(0, input_fact)?
        .into_optimized()?
        .into_runnable()
}

/// Pair one score per label, normalizing logit-like outputs with softmax.
///
/// A final softmax layer is common but not guaranteed in exported bundles;
/// scores that already form a probability vector pass through untouched so
/// they are not flattened by a second softmax.
fn scores_to_predictions(
    labels: &[String],
    mut scores: Vec<f32>,
) -> Result<Vec<Prediction>, ModelError> {
    if scores.len() != labels.len() {
        return Err(ModelError::LabelMismatch {
            expected: labels.len(),
            got: scores.len(),
        });
    }

    if !looks_like_probabilities(&scores) {
        softmax(&mut scores);
    }

    Ok(labels
        .iter()
        .zip(scores)
        .map(|(label, probability)| Prediction {
            label: label.clone(),
            probability,
        })
        .collect())
}

fn looks_like_probabilities(scores: &[f32]) -> bool {
    let sum: f32 = scores.iter().sum();
    scores.iter().all(|s| (0.0..=1.0).contains(s))
        && (sum - 1.0).abs() <= PROBABILITY_SUM_TOLERANCE
}

fn softmax(scores: &mut [f32]) {
    let max = scores.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for score in scores.iter_mut() {
        *score = (*score - max).exp();
        sum += *score;
    }
    for score in scores.iter_mut() {
        *score /= sum;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn labels(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn probability_scores_pass_through() {
        let predictions = scores_to_predictions(&labels(&["a", "b"]), vec![0.25, 0.75]).unwrap();
        assert_eq!(predictions[0].probability, 0.25);
        assert_eq!(predictions[1].probability, 0.75);
    }

    #[test]
    fn logit_scores_are_softmaxed() {
        let predictions = scores_to_predictions(&labels(&["a", "b"]), vec![3.0, -1.0]).unwrap();
        let sum: f32 = predictions.iter().map(|p| p.probability).sum();
        assert!((sum - 1.0).abs() < 1.0e-5);
        assert!(predictions[0].probability > predictions[1].probability);
    }

    #[test]
    fn equal_logits_split_evenly() {
        let mut scores = vec![0.0, 0.0];
        softmax(&mut scores);
        assert_eq!(scores, vec![0.5, 0.5]);
    }

    #[test]
    fn score_count_must_match_labels() {
        let err = scores_to_predictions(&labels(&["a", "b", "c"]), vec![0.5, 0.5]).unwrap_err();
        match err {
            ModelError::LabelMismatch { expected, got } => {
                assert_eq!((expected, got), (3, 2));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn metadata_parses_labels_and_input_size() {
        let metadata: ModelMetadata =
            serde_json::from_str(r#"{"labels": ["cat", "dog"], "imageSize": 96}"#).unwrap();
        assert_eq!(metadata.labels, labels(&["cat", "dog"]));
        assert_eq!(metadata.image_size, Some(96));
    }

    #[test]
    fn metadata_without_labels_is_rejected() {
        let result: Result<ModelMetadata, _> = serde_json::from_str(r#"{"imageSize": 96}"#);
        assert!(result.is_err());
    }

    #[test]
    fn load_reports_missing_bundle() {
        let err = OnnxClassifier::load(Path::new("does/not/exist")).unwrap_err();
        assert!(matches!(err, ModelError::MissingAsset(_)));
    }
}
