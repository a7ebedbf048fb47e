//! Move classification
//!
//! Applies the fitted scaler, model and label encoder to a feature vector.
//! Artifacts are JSON exports of the fitted objects and are loaded once:
//!
//! - `scaler.json`: `{"kind": "robust", "center": [..], "scale": [..]}`
//! - `label_encoder.json`: `{"classes": ["..", ..]}`
//! - `model.json`: `{"kind": "random_forest", "trees": [..]}` (also `decision_tree`, `linear`)
//!
//! Compatibility with the [`FeatureSchema`] is checked at load time, so a
//! mismatched export fails startup instead of the first prediction.

use crate::error::{ArtifactLoadError, ModelInputError};
use crate::features::{FeatureSchema, FeatureVector};
use crate::types::Label;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub const SCALER_FILE: &str = "scaler.json";
pub const ENCODER_FILE: &str = "label_encoder.json";
pub const MODEL_FILE: &str = "model.json";

/// Leaf marker in array-encoded trees
const TREE_LEAF: i64 = -1;

/// Fitted per-feature scaling transform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Scaler {
    /// `(x - median) / iqr`
    Robust {
        center: Vec<f64>,
        scale: Vec<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        feature_names: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        schema_version: Option<String>,
    },
    /// `(x - mean) / std`
    Standard {
        mean: Vec<f64>,
        scale: Vec<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        feature_names: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        schema_version: Option<String>,
    },
}

impl Scaler {
    fn parts(&self) -> (&[f64], &[f64]) {
        match self {
            Scaler::Robust { center, scale, .. } => (center, scale),
            Scaler::Standard { mean, scale, .. } => (mean, scale),
        }
    }

    pub fn feature_names(&self) -> Option<&[String]> {
        match self {
            Scaler::Robust { feature_names, .. } | Scaler::Standard { feature_names, .. } => {
                feature_names.as_deref()
            }
        }
    }

    pub fn schema_version(&self) -> Option<&str> {
        match self {
            Scaler::Robust { schema_version, .. } | Scaler::Standard { schema_version, .. } => {
                schema_version.as_deref()
            }
        }
    }

    /// Input dimensionality the scaler was fitted on
    pub fn n_features(&self) -> usize {
        self.parts().0.len()
    }

    /// Scale a vector; a zero scale leaves the centered value unscaled
    pub fn transform(&self, values: &[f64]) -> Vec<f64> {
        let (offset, scale) = self.parts();
        values
            .iter()
            .zip(offset.iter().zip(scale))
            .map(|(x, (o, s))| {
                let s = if *s == 0.0 { 1.0 } else { *s };
                (x - o) / s
            })
            .collect()
    }
}

/// Maps class indices to labels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelEncoder {
    pub classes: Vec<String>,
}

impl LabelEncoder {
    pub fn inverse_transform(&self, index: usize) -> Option<Label> {
        self.classes.get(index).cloned().map(Label)
    }
}

/// Array-encoded decision tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeModel {
    pub children_left: Vec<i64>,
    pub children_right: Vec<i64>,
    pub feature: Vec<i64>,
    pub threshold: Vec<f64>,
    /// Per-node class counts or weights
    pub value: Vec<Vec<f64>>,
}

impl TreeModel {
    fn validate(&self, n_features: usize) -> Result<usize, ArtifactLoadError> {
        let nodes = self.children_left.len();
        if nodes == 0 {
            return Err(ArtifactLoadError::Invalid("tree has no nodes".into()));
        }
        if [
            self.children_right.len(),
            self.feature.len(),
            self.threshold.len(),
            self.value.len(),
        ]
        .iter()
        .any(|&len| len != nodes)
        {
            return Err(ArtifactLoadError::Invalid(
                "tree arrays have different lengths".into(),
            ));
        }

        let n_classes = self.value[0].len();
        for node in 0..nodes {
            if self.value[node].len() != n_classes {
                return Err(ArtifactLoadError::Invalid(format!(
                    "node {node} has {} class values, expected {n_classes}",
                    self.value[node].len()
                )));
            }
            let (left, right) = (self.children_left[node], self.children_right[node]);
            if left == TREE_LEAF {
                continue;
            }
            for child in [left, right] {
                if child <= node as i64 || child >= nodes as i64 {
                    return Err(ArtifactLoadError::Invalid(format!(
                        "node {node} has invalid child {child}"
                    )));
                }
            }
            let feature = self.feature[node];
            if feature < 0 || feature as usize >= n_features {
                return Err(ArtifactLoadError::Dimension {
                    artifact: "model",
                    expected: n_features,
                    found: feature.max(0) as usize + 1,
                });
            }
        }
        Ok(n_classes)
    }

    /// Normalized class distribution of the leaf reached by `x`
    ///
    /// Children always have larger indices than their parent (checked on
    /// load), so the walk terminates.
    fn leaf_distribution(&self, x: &[f64]) -> Vec<f64> {
        let mut node = 0usize;
        while self.children_left[node] != TREE_LEAF {
            let feature = self.feature[node] as usize;
            node = if x[feature] <= self.threshold[node] {
                self.children_left[node] as usize
            } else {
                self.children_right[node] as usize
            };
        }
        let counts = &self.value[node];
        let total: f64 = counts.iter().sum();
        if total > 0.0 {
            counts.iter().map(|c| c / total).collect()
        } else {
            counts.clone()
        }
    }
}

/// Fitted classifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Model {
    /// One-vs-rest linear decision function; a single row is a binary model
    Linear {
        coef: Vec<Vec<f64>>,
        intercept: Vec<f64>,
    },
    DecisionTree(TreeModel),
    /// Averages per-tree leaf distributions
    RandomForest { trees: Vec<TreeModel> },
}

impl Model {
    /// Check the model against the input width; returns its class count
    fn validate(&self, n_features: usize) -> Result<usize, ArtifactLoadError> {
        match self {
            Model::Linear { coef, intercept } => {
                if coef.is_empty() || coef.len() != intercept.len() {
                    return Err(ArtifactLoadError::Invalid(
                        "linear model needs one intercept per coefficient row".into(),
                    ));
                }
                if let Some(row) = coef.iter().find(|row| row.len() != n_features) {
                    return Err(ArtifactLoadError::Dimension {
                        artifact: "model",
                        expected: n_features,
                        found: row.len(),
                    });
                }
                Ok(if coef.len() == 1 { 2 } else { coef.len() })
            }
            Model::DecisionTree(tree) => tree.validate(n_features),
            Model::RandomForest { trees } => {
                let mut classes = None;
                for tree in trees {
                    let n = tree.validate(n_features)?;
                    if *classes.get_or_insert(n) != n {
                        return Err(ArtifactLoadError::Invalid(
                            "forest trees disagree on class count".into(),
                        ));
                    }
                }
                classes.ok_or_else(|| ArtifactLoadError::Invalid("forest has no trees".into()))
            }
        }
    }

    /// Class index for an already scaled vector
    pub fn predict(&self, x: &[f64]) -> usize {
        match self {
            Model::Linear { coef, intercept } => {
                let scores: Vec<f64> = coef
                    .iter()
                    .zip(intercept)
                    .map(|(row, b)| row.iter().zip(x).map(|(w, v)| w * v).sum::<f64>() + b)
                    .collect();
                if scores.len() == 1 {
                    usize::from(scores[0] > 0.0)
                } else {
                    argmax(&scores)
                }
            }
            Model::DecisionTree(tree) => argmax(&tree.leaf_distribution(x)),
            Model::RandomForest { trees } => {
                let mut total: Vec<f64> = Vec::new();
                for tree in trees {
                    let dist = tree.leaf_distribution(x);
                    if total.is_empty() {
                        total = vec![0.0; dist.len()];
                    }
                    for (acc, p) in total.iter_mut().zip(dist) {
                        *acc += p;
                    }
                }
                argmax(&total)
            }
        }
    }
}

/// First index of the maximum value
fn argmax(values: &[f64]) -> usize {
    let mut best = 0;
    for (i, v) in values.iter().enumerate() {
        if *v > values[best] {
            best = i;
        }
    }
    best
}

/// The three fitted objects plus the layout they were checked against
#[derive(Debug, Clone)]
pub struct ClassifierArtifacts {
    pub scaler: Scaler,
    pub encoder: LabelEncoder,
    pub model: Model,
    schema: FeatureSchema,
}

impl ClassifierArtifacts {
    /// Load `scaler.json`, `label_encoder.json` and `model.json` from a directory
    pub fn load_dir(dir: &Path, schema: &FeatureSchema) -> Result<Self, ArtifactLoadError> {
        let scaler: Scaler = read_artifact(&dir.join(SCALER_FILE))?;
        let encoder: LabelEncoder = read_artifact(&dir.join(ENCODER_FILE))?;
        let model: Model = read_artifact(&dir.join(MODEL_FILE))?;
        let artifacts = Self::from_parts(scaler, encoder, model, schema)?;

        info!(
            path = %dir.display(),
            features = artifacts.n_features(),
            classes = artifacts.encoder.classes.len(),
            "loaded classifier artifacts"
        );
        Ok(artifacts)
    }

    /// Assemble and cross-check already parsed artifacts
    pub fn from_parts(
        scaler: Scaler,
        encoder: LabelEncoder,
        model: Model,
        schema: &FeatureSchema,
    ) -> Result<Self, ArtifactLoadError> {
        let (offset, scale) = scaler.parts();
        if offset.len() != scale.len() {
            return Err(ArtifactLoadError::Dimension {
                artifact: "scaler",
                expected: offset.len(),
                found: scale.len(),
            });
        }
        if scaler.n_features() != schema.len() {
            return Err(ArtifactLoadError::Dimension {
                artifact: "scaler",
                expected: schema.len(),
                found: scaler.n_features(),
            });
        }
        if let Some(version) = scaler.schema_version() {
            if version != schema.version {
                return Err(ArtifactLoadError::SchemaVersion {
                    expected: schema.version.clone(),
                    found: version.to_string(),
                });
            }
        }
        if let Some(names) = scaler.feature_names() {
            for (position, (expected, found)) in schema.names().into_iter().zip(names).enumerate() {
                if &expected != found {
                    return Err(ArtifactLoadError::FeatureName {
                        position,
                        expected,
                        found: found.clone(),
                    });
                }
            }
            if names.len() != schema.len() {
                return Err(ArtifactLoadError::Dimension {
                    artifact: "scaler feature_names",
                    expected: schema.len(),
                    found: names.len(),
                });
            }
        }

        let n_classes = model.validate(schema.len())?;
        if encoder.classes.is_empty() || n_classes > encoder.classes.len() {
            return Err(ArtifactLoadError::Dimension {
                artifact: "label_encoder",
                expected: n_classes,
                found: encoder.classes.len(),
            });
        }

        Ok(Self {
            scaler,
            encoder,
            model,
            schema: schema.clone(),
        })
    }

    pub fn n_features(&self) -> usize {
        self.scaler.n_features()
    }

    pub fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    pub fn labels(&self) -> &[String] {
        &self.encoder.classes
    }
}

fn read_artifact<T: DeserializeOwned>(path: &Path) -> Result<T, ArtifactLoadError> {
    let raw = fs::read_to_string(path).map_err(|source| ArtifactLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ArtifactLoadError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Stateless predictor over shared, read-only artifacts
#[derive(Debug, Clone)]
pub struct Classifier {
    artifacts: Arc<ClassifierArtifacts>,
}

impl Classifier {
    pub fn new(artifacts: ClassifierArtifacts) -> Self {
        Self {
            artifacts: Arc::new(artifacts),
        }
    }

    pub fn from_shared(artifacts: Arc<ClassifierArtifacts>) -> Self {
        Self { artifacts }
    }

    pub fn artifacts(&self) -> &ClassifierArtifacts {
        &self.artifacts
    }

    /// Scale, classify and decode one feature vector
    pub fn predict(&self, features: &FeatureVector) -> Result<Label, ModelInputError> {
        let expected = self.artifacts.n_features();
        if features.len() != expected {
            return Err(ModelInputError::DimensionMismatch {
                expected,
                actual: features.len(),
            });
        }
        if features.schema_version != self.artifacts.schema.version {
            return Err(ModelInputError::SchemaMismatch {
                expected: self.artifacts.schema.version.clone(),
                actual: features.schema_version.clone(),
            });
        }
        if let Some(idx) = features.values.iter().position(|v| !v.is_finite()) {
            return Err(ModelInputError::NonFinite(idx));
        }

        let scaled = self.artifacts.scaler.transform(&features.values);
        let index = self.artifacts.model.predict(&scaled);
        self.artifacts
            .encoder
            .inverse_transform(index)
            .ok_or(ModelInputError::UnknownClass {
                index,
                classes: self.artifacts.encoder.classes.len(),
            })
    }
}
