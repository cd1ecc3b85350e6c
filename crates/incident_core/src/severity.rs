use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Local};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{IncidentError, Result};
use crate::eval::{evaluate, stratified_split, Evaluation};
use crate::gbdt::{argmax, GbdtParams, GradientBoostedTrees};
use crate::model::{Incident, Severity};
use crate::storage::{load_json, save_json};
use crate::tfidf::{SparseRow, TfidfVectorizer};

pub const MODEL_FILE: &str = "severity_model.json";
pub const METADATA_FILE: &str = "model_metadata.json";
pub const MODEL_TYPE: &str = "Gradient Boosted Trees";
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const TEST_SIZE: f64 = 0.2;
const SPLIT_SEED: u64 = 42;
const TOP_FEATURES: usize = 10;

/// Vectorizer and classifier, persisted together.
#[derive(Debug, Serialize, Deserialize)]
struct SeverityModel {
    vectorizer: TfidfVectorizer,
    classifier: GradientBoostedTrees,
}

impl SeverityModel {
    fn probabilities(&self, row: &SparseRow) -> Vec<f32> {
        self.classifier.predict_proba(row)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub last_trained: String,
    pub model_type: String,
    pub num_classes: usize,
    pub classes: Vec<String>,
    pub accuracy: f64,
    pub test_accuracy: f64,
    pub f1_score: f64,
    pub training_samples: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainReport {
    pub status: String,
    #[serde(flatten)]
    pub evaluation: Option<Evaluation>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub top_features: Vec<(String, f32)>,
    pub training_samples: usize,
    pub test_samples: usize,
}

impl TrainReport {
    fn already_trained() -> Self {
        Self {
            status: "already_trained".to_string(),
            evaluation: None,
            top_features: Vec::new(),
            training_samples: 0,
            test_samples: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub severity: String,
    pub confidence: f32,
    pub probabilities: BTreeMap<String, f32>,
    pub model: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_classes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classes: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_features: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_path: Option<PathBuf>,
    pub accuracy: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_accuracy: Option<f64>,
    pub training_samples: usize,
    pub last_trained: String,
}

fn class_names() -> Vec<String> {
    Severity::ALL.iter().map(|s| s.as_str().to_string()).collect()
}

/// Predicts incident severity from free-text descriptions.
pub struct SeverityPredictor {
    model_dir: PathBuf,
    model: RwLock<Option<Arc<SeverityModel>>>,
}

impl SeverityPredictor {
    /// Loads a saved model from `model_dir` when one exists. An unreadable
    /// model is logged and treated as untrained.
    pub fn open(model_dir: &Path) -> Self {
        let path = model_dir.join(MODEL_FILE);
        let model = if path.exists() {
            match load_json::<SeverityModel>(&path) {
                Ok(m) => {
                    info!(path = %path.display(), "loaded severity model");
                    Some(Arc::new(m))
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed to load severity model");
                    None
                }
            }
        } else {
            None
        };

        Self {
            model_dir: model_dir.to_path_buf(),
            model: RwLock::new(model),
        }
    }

    pub fn is_trained(&self) -> bool {
        self.model.read().is_some()
    }

    pub fn model_path(&self) -> PathBuf {
        self.model_dir.join(MODEL_FILE)
    }

    fn metadata_path(&self) -> PathBuf {
        self.model_dir.join(METADATA_FILE)
    }

    pub fn train(&self, incidents: &[Incident], retrain: bool) -> Result<TrainReport> {
        if self.is_trained() && !retrain {
            info!("severity model already trained, pass retrain to rebuild it");
            return Ok(TrainReport::already_trained());
        }

        let (texts, labels): (Vec<&str>, Vec<usize>) = incidents
            .iter()
            .filter_map(|i| Severity::parse(&i.severity).map(|s| (i.description.as_str(), s.index())))
            .unzip();
        let skipped = incidents.len() - texts.len();
        if skipped > 0 {
            warn!(skipped, "incidents with unknown severity left out of training");
        }
        if texts.len() < 2 {
            return Err(IncidentError::NotEnoughData(format!(
                "need at least 2 labelled incidents to train, got {}",
                texts.len()
            )));
        }
        info!(incidents = texts.len(), "training severity model");

        let mut vectorizer = TfidfVectorizer::new(200, (1, 2));
        let rows = vectorizer.fit_transform(&texts);
        let (train_idx, test_idx) = stratified_split(&labels, TEST_SIZE, SPLIT_SEED);
        info!(train = train_idx.len(), test = test_idx.len(), "split dataset");

        let train_rows: Vec<SparseRow> = train_idx.iter().map(|&i| rows[i].clone()).collect();
        let train_labels: Vec<usize> = train_idx.iter().map(|&i| labels[i]).collect();

        let params = GbdtParams {
            num_class: Severity::ALL.len(),
            ..GbdtParams::default()
        };
        let classifier = GradientBoostedTrees::fit(
            params,
            &train_rows,
            vectorizer.num_features(),
            &train_labels,
        )?;

        let y_true: Vec<usize> = test_idx.iter().map(|&i| labels[i]).collect();
        let y_pred: Vec<usize> = test_idx
            .iter()
            .map(|&i| classifier.predict(&rows[i]))
            .collect();
        let names = class_names();
        let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let evaluation = evaluate(&y_true, &y_pred, &name_refs);

        let feature_names = vectorizer.feature_names();
        let mut ranked: Vec<(String, f32)> = classifier
            .feature_importance()
            .iter()
            .enumerate()
            .map(|(i, &imp)| (feature_names[i].clone(), imp))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        ranked.truncate(TOP_FEATURES);

        info!(
            accuracy = evaluation.accuracy,
            f1 = evaluation.f1_score,
            "severity model trained"
        );

        let model = SeverityModel {
            vectorizer,
            classifier,
        };
        let metadata = ModelMetadata {
            last_trained: Local::now().format(TIME_FORMAT).to_string(),
            model_type: MODEL_TYPE.to_string(),
            num_classes: Severity::ALL.len(),
            classes: names,
            accuracy: evaluation.accuracy,
            test_accuracy: evaluation.accuracy,
            f1_score: evaluation.f1_score,
            training_samples: train_idx.len(),
        };
        self.save(&model, &metadata)?;
        *self.model.write() = Some(Arc::new(model));

        Ok(TrainReport {
            status: "trained".to_string(),
            evaluation: Some(evaluation),
            top_features: ranked,
            training_samples: train_idx.len(),
            test_samples: test_idx.len(),
        })
    }

    fn save(&self, model: &SeverityModel, metadata: &ModelMetadata) -> Result<()> {
        std::fs::create_dir_all(&self.model_dir)?;
        save_json(&self.model_path(), model)?;
        save_json(&self.metadata_path(), metadata)?;
        info!(path = %self.model_path().display(), "saved severity model");
        Ok(())
    }

    fn loaded(&self) -> Result<Arc<SeverityModel>> {
        self.model.read().clone().ok_or(IncidentError::NotTrained)
    }

    pub fn predict(&self, description: &str) -> Result<Prediction> {
        let model = self.loaded()?;
        let row = model.vectorizer.transform_one(description);
        Ok(to_prediction(&model.probabilities(&row)))
    }

    pub fn predict_batch(&self, descriptions: &[&str]) -> Result<Vec<Prediction>> {
        let model = self.loaded()?;
        Ok(model
            .vectorizer
            .transform(descriptions)
            .iter()
            .map(|row| to_prediction(&model.probabilities(row)))
            .collect())
    }

    pub fn model_info(&self) -> ModelInfo {
        let Ok(model) = self.loaded() else {
            return ModelInfo {
                status: "not_trained".to_string(),
                model_type: None,
                num_classes: None,
                classes: None,
                num_features: None,
                model_path: None,
                accuracy: 0.0,
                test_accuracy: None,
                training_samples: 0,
                last_trained: "Unknown".to_string(),
            };
        };

        let metadata = self.read_metadata();
        let last_trained = metadata
            .as_ref()
            .map(|m| m.last_trained.clone())
            .or_else(|| self.model_mtime())
            .unwrap_or_else(|| "Unknown".to_string());

        ModelInfo {
            status: "trained".to_string(),
            model_type: Some(MODEL_TYPE.to_string()),
            num_classes: Some(model.classifier.num_class()),
            classes: Some(class_names()),
            num_features: Some(model.vectorizer.max_features),
            model_path: Some(self.model_path()),
            accuracy: metadata.as_ref().map_or(0.0, |m| m.accuracy),
            test_accuracy: Some(metadata.as_ref().map_or(0.0, |m| m.test_accuracy)),
            training_samples: metadata.as_ref().map_or(0, |m| m.training_samples),
            last_trained,
        }
    }

    fn read_metadata(&self) -> Option<ModelMetadata> {
        let path = self.metadata_path();
        if !path.exists() {
            return None;
        }
        load_json(&path)
            .map_err(|err| warn!(path = %path.display(), error = %err, "could not load model metadata"))
            .ok()
    }

    fn model_mtime(&self) -> Option<String> {
        let modified = std::fs::metadata(self.model_path()).ok()?.modified().ok()?;
        Some(DateTime::<Local>::from(modified).format(TIME_FORMAT).to_string())
    }
}

fn to_prediction(probs: &[f32]) -> Prediction {
    let best = argmax(probs);
    let severity = Severity::from_index(best).map_or("Unknown", Severity::as_str);
    Prediction {
        severity: severity.to_string(),
        confidence: probs.get(best).copied().unwrap_or(0.0),
        probabilities: Severity::ALL
            .iter()
            .zip(probs)
            .map(|(s, p)| (s.as_str().to_string(), *p))
            .collect(),
        model: "xgboost".to_string(),
    }
}
