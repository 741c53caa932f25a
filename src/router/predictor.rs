//! Feature extraction and the predictors behind the decision router

use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PredictorError {
    #[error("feature {0:?} missing from context payload")]
    MissingFeature(String),

    #[error("feature {name:?} is not numeric: {found}")]
    NonNumericFeature { name: String, found: String },

    #[error("failed to load {path}: {detail}")]
    Load { path: String, detail: String },

    #[error("invalid model: {0}")]
    Invalid(String),
}

/// Ordered list of payload fields the predictor consumes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureSet {
    names: Vec<String>,
}

impl FeatureSet {
    pub fn new<I, S>(names: I) -> Result<Self, PredictorError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        if names.is_empty() {
            return Err(PredictorError::Invalid("feature set is empty".to_string()));
        }

        let mut seen = HashSet::new();
        for name in &names {
            if !seen.insert(name.as_str()) {
                return Err(PredictorError::Invalid(format!("duplicate feature {name:?}")));
            }
        }

        Ok(Self { names })
    }

    /// Load a JSON array of feature names
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, PredictorError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| load_error(path, e))?;
        let names: Vec<String> = serde_json::from_str(&text).map_err(|e| load_error(path, e))?;
        Self::new(names)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Pull the named fields out of a context payload, in set order.
    /// Booleans count as 0/1.
    pub fn extract(&self, payload: &Value) -> Result<FeatureVector, PredictorError> {
        let mut entries = Vec::with_capacity(self.names.len());
        for name in &self.names {
            let value = match payload.get(name) {
                None | Some(Value::Null) => {
                    return Err(PredictorError::MissingFeature(name.clone()));
                }
                Some(Value::Bool(b)) => f64::from(u8::from(*b)),
                Some(Value::Number(n)) => n.as_f64().ok_or_else(|| {
                    PredictorError::NonNumericFeature {
                        name: name.clone(),
                        found: n.to_string(),
                    }
                })?,
                Some(other) => {
                    return Err(PredictorError::NonNumericFeature {
                        name: name.clone(),
                        found: other.to_string(),
                    });
                }
            };
            entries.push((name.clone(), value));
        }
        Ok(FeatureVector { entries })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    entries: Vec<(String, f64)>,
}

impl FeatureVector {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot carried on the decision message
    pub fn to_map(&self) -> BTreeMap<String, f64> {
        self.entries.iter().cloned().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub label: bool,
    /// Probability of the predicted class, in `[0, 1]`
    pub confidence: f64,
}

/// Binary classifier over a feature vector
pub trait Predictor: Send + Sync {
    fn infer(&self, features: &FeatureVector) -> Result<Prediction, PredictorError>;

    fn name(&self) -> &'static str;
}

/// Rule classifier: positive when any feature exceeds its limit
///
/// Confidence grows with the distance of the most extreme feature from its
/// limit, saturating at 1.0 once a feature is 50% past (or below) it.
pub struct ThresholdPredictor {
    limits: Vec<(String, f64)>,
}

impl ThresholdPredictor {
    pub fn new(limits: Vec<(String, f64)>) -> Self {
        Self { limits }
    }

    pub fn with_defaults() -> Self {
        Self::new(vec![
            ("avg_temperature_c_5min".to_string(), 60.0),
            ("max_vibration_g_1min".to_string(), 2.0),
            ("power_consumption_avg_10min".to_string(), 35.0),
        ])
    }
}

impl Predictor for ThresholdPredictor {
    fn infer(&self, features: &FeatureVector) -> Result<Prediction, PredictorError> {
        let mut worst_ratio: f64 = 0.0;
        for (name, limit) in &self.limits {
            let value = features
                .get(name)
                .ok_or_else(|| PredictorError::MissingFeature(name.clone()))?;
            if *limit > 0.0 {
                worst_ratio = worst_ratio.max(value / limit);
            }
        }

        let label = worst_ratio > 1.0;
        let margin = (worst_ratio - 1.0).abs();
        let confidence = (0.5 + margin).clamp(0.5, 1.0);

        Ok(Prediction { label, confidence })
    }

    fn name(&self) -> &'static str {
        "threshold"
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum TreeNode {
    Split {
        feature: String,
        threshold: f64,
        left: usize,
        right: usize,
    },
    /// Class weights `[negative, positive]` of the training samples at this leaf
    Leaf { value: [f64; 2] },
}

#[derive(Debug, Deserialize)]
struct TreeDocument {
    features: Vec<String>,
    nodes: Vec<TreeNode>,
}

/// Binary decision tree exported as JSON; node 0 is the root
///
/// ```json
/// {"features": ["avg_temperature_c_5min"],
///  "nodes": [{"feature": "avg_temperature_c_5min", "threshold": 60.0, "left": 1, "right": 2},
///            {"value": [90, 10]}, {"value": [5, 95]}]}
/// ```
///
/// A sample goes left when `x <= threshold`.
#[derive(Debug)]
pub struct TreePredictor {
    features: Vec<String>,
    nodes: Vec<TreeNode>,
}

impl TreePredictor {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, PredictorError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| load_error(path, e))?;
        Self::from_json_str(&text).map_err(|e| match e {
            PredictorError::Invalid(detail) => PredictorError::Load {
                path: path.display().to_string(),
                detail,
            },
            other => other,
        })
    }

    pub fn from_json_str(text: &str) -> Result<Self, PredictorError> {
        let doc: TreeDocument =
            serde_json::from_str(text).map_err(|e| PredictorError::Invalid(e.to_string()))?;
        let tree = Self {
            features: doc.features,
            nodes: doc.nodes,
        };
        tree.check()?;
        Ok(tree)
    }

    /// Features the tree was trained on
    pub fn features(&self) -> &[String] {
        &self.features
    }

    fn check(&self) -> Result<(), PredictorError> {
        if self.nodes.is_empty() {
            return Err(PredictorError::Invalid("tree has no nodes".to_string()));
        }

        let known: HashSet<&str> = self.features.iter().map(String::as_str).collect();
        for (i, node) in self.nodes.iter().enumerate() {
            match node {
                TreeNode::Split {
                    feature,
                    left,
                    right,
                    ..
                } => {
                    if !known.contains(feature.as_str()) {
                        return Err(PredictorError::Invalid(format!(
                            "node {i} splits on undeclared feature {feature:?}"
                        )));
                    }
                    // Children strictly after the parent rules out cycles
                    for child in [*left, *right] {
                        if child <= i || child >= self.nodes.len() {
                            return Err(PredictorError::Invalid(format!(
                                "node {i} has bad child index {child}"
                            )));
                        }
                    }
                }
                TreeNode::Leaf { value } => {
                    let negative = value.iter().any(|w| !w.is_finite() || *w < 0.0);
                    if negative || value.iter().sum::<f64>() <= 0.0 {
                        return Err(PredictorError::Invalid(format!(
                            "leaf {i} has invalid class weights"
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

impl Predictor for TreePredictor {
    fn infer(&self, features: &FeatureVector) -> Result<Prediction, PredictorError> {
        let mut index = 0;
        loop {
            match &self.nodes[index] {
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    let x = features
                        .get(feature)
                        .ok_or_else(|| PredictorError::MissingFeature(feature.clone()))?;
                    index = if x <= *threshold { *left } else { *right };
                }
                TreeNode::Leaf { value } => {
                    let total = value[0] + value[1];
                    let positive = value[1] / total;
                    let label = value[1] > value[0];
                    let confidence = if label { positive } else { 1.0 - positive };
                    return Ok(Prediction { label, confidence });
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "decision_tree"
    }
}

fn load_error(path: &Path, e: impl std::fmt::Display) -> PredictorError {
    PredictorError::Load {
        path: path.display().to_string(),
        detail: e.to_string(),
    }
}
