//! On-disk layout of a trained context.
//!
//! Every file of one training run carries the same `run_id`; [`ClassifierArtifacts::load`]
//! refuses a directory whose files disagree.

use std::{
    fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use intentflow_routing::{directory::INFO_DIR, WILDCARD_CONTEXT};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{ClassifierError, Result},
    label_encoder::LabelEncoder,
    model::{HashedModel, ModelKind},
    thresholds::{PipelineThresholds, ThresholdChoice},
    trainer::EpochReport,
};

/// Artifact directory used for the wildcard context.
pub const GLOBAL_ARTIFACT_DIR: &str = "global";
/// Weight file inside a model directory.
pub const MODEL_FILE: &str = "model.json";
/// Label encoder file.
pub const LABEL_ENCODER_FILE: &str = "label_encoder.pkl";
/// Primary threshold file.
pub const THRESHOLD_FILE: &str = "threshold.json";
/// Tiny-model ambiguous threshold file.
pub const TINY_AMBIGUOUS_FILE: &str = "tiny_ambiguous_threshold.json";
/// Large-model ambiguous threshold file.
pub const LARGE_AMBIGUOUS_FILE: &str = "large_ambiguous_threshold.json";
/// Optional report written next to the artifacts.
pub const SUMMARY_FILE: &str = "training_summary.json";

/// Directory name of `context`'s artifacts.
#[must_use]
pub fn artifact_dir_name(context: &str) -> &str {
    if context == WILDCARD_CONTEXT {
        GLOBAL_ARTIFACT_DIR
    } else {
        context
    }
}

/// `<root>/___command_info/<context or "global">`.
#[must_use]
pub fn artifact_dir(root: &Path, context: &str) -> PathBuf {
    root.join(INFO_DIR).join(artifact_dir_name(context))
}

/// Path of `kind`'s weights inside `dir`.
#[must_use]
pub fn model_path(dir: &Path, kind: ModelKind) -> PathBuf {
    dir.join(kind.directory()).join(MODEL_FILE)
}

#[derive(Serialize, Deserialize)]
struct ModelFile {
    run_id: Uuid,
    model: HashedModel,
}

#[derive(Serialize, Deserialize)]
struct EncoderFile {
    run_id: Uuid,
    encoder: LabelEncoder,
}

#[derive(Serialize, Deserialize)]
struct ThresholdFile {
    run_id: Uuid,
    confidence_threshold: f32,
}

#[derive(Serialize, Deserialize)]
struct AmbiguousFile {
    run_id: Uuid,
    ambiguous_threshold: f32,
}

/// Everything one training run produces for a context.
#[derive(Debug, Clone)]
pub struct ClassifierArtifacts {
    /// Training run identifier.
    pub run_id: Uuid,
    /// Primary model.
    pub tiny: HashedModel,
    /// Escalation model.
    pub large: HashedModel,
    /// Label mapping shared by both models.
    pub encoder: LabelEncoder,
    /// Learned cutoffs.
    pub thresholds: PipelineThresholds,
}

impl ClassifierArtifacts {
    /// Writes every artifact file into `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        for kind in [ModelKind::Tiny, ModelKind::Large] {
            let model = match kind {
                ModelKind::Tiny => &self.tiny,
                ModelKind::Large => &self.large,
            };
            write_json(
                &model_path(dir, kind),
                &ModelFile {
                    run_id: self.run_id,
                    model: model.clone(),
                },
            )?;
        }
        write_json(
            &dir.join(LABEL_ENCODER_FILE),
            &EncoderFile {
                run_id: self.run_id,
                encoder: self.encoder.clone(),
            },
        )?;
        write_json(
            &dir.join(THRESHOLD_FILE),
            &ThresholdFile {
                run_id: self.run_id,
                confidence_threshold: self.thresholds.confidence,
            },
        )?;
        write_json(
            &dir.join(TINY_AMBIGUOUS_FILE),
            &AmbiguousFile {
                run_id: self.run_id,
                ambiguous_threshold: self.thresholds.tiny_ambiguous,
            },
        )?;
        write_json(
            &dir.join(LARGE_AMBIGUOUS_FILE),
            &AmbiguousFile {
                run_id: self.run_id,
                ambiguous_threshold: self.thresholds.large_ambiguous,
            },
        )
    }

    /// Reads a complete, consistent artifact set from `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        let tiny_path = model_path(dir, ModelKind::Tiny);
        let tiny: ModelFile = read_json(&tiny_path)?;
        let run_id = tiny.run_id;
        let check = |path: &Path, found: Uuid| {
            if found == run_id {
                Ok(())
            } else {
                Err(ClassifierError::InconsistentArtifacts {
                    path: path.to_path_buf(),
                    expected: run_id.to_string(),
                    found: found.to_string(),
                })
            }
        };

        let large_path = model_path(dir, ModelKind::Large);
        let large: ModelFile = read_json(&large_path)?;
        check(&large_path, large.run_id)?;
        let encoder_path = dir.join(LABEL_ENCODER_FILE);
        let encoder: EncoderFile = read_json(&encoder_path)?;
        check(&encoder_path, encoder.run_id)?;
        let threshold_path = dir.join(THRESHOLD_FILE);
        let threshold: ThresholdFile = read_json(&threshold_path)?;
        check(&threshold_path, threshold.run_id)?;
        let tiny_ambiguous_path = dir.join(TINY_AMBIGUOUS_FILE);
        let tiny_ambiguous: AmbiguousFile = read_json(&tiny_ambiguous_path)?;
        check(&tiny_ambiguous_path, tiny_ambiguous.run_id)?;
        let large_ambiguous_path = dir.join(LARGE_AMBIGUOUS_FILE);
        let large_ambiguous: AmbiguousFile = read_json(&large_ambiguous_path)?;
        check(&large_ambiguous_path, large_ambiguous.run_id)?;

        Ok(Self {
            run_id,
            tiny: tiny.model,
            large: large.model,
            encoder: encoder.encoder,
            thresholds: PipelineThresholds {
                confidence: threshold.confidence_threshold,
                tiny_ambiguous: tiny_ambiguous.ambiguous_threshold,
                large_ambiguous: large_ambiguous.ambiguous_threshold,
            },
        })
    }
}

/// Human-readable record of a training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSummary {
    /// Training run identifier.
    pub run_id: Uuid,
    /// Context the run belongs to.
    pub context: String,
    /// Completion time.
    pub trained_at: DateTime<Utc>,
    /// Labels in id order.
    pub classes: Vec<String>,
    /// Training split size.
    pub train_examples: usize,
    /// Validation split size.
    pub validation_examples: usize,
    /// Selected primary threshold and its score.
    pub threshold: ThresholdChoice,
    /// Tiny-model ambiguous threshold.
    pub tiny_ambiguous: f32,
    /// Large-model ambiguous threshold.
    pub large_ambiguous: f32,
    /// Tiny-model epochs.
    pub tiny_history: Vec<EpochReport>,
    /// Large-model epochs.
    pub large_history: Vec<EpochReport>,
}

impl TrainingSummary {
    /// Writes `training_summary.json` into `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        write_json(&dir.join(SUMMARY_FILE), self)
    }

    /// Reads the summary of `dir`, if one was written.
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(SUMMARY_FILE);
        if !path.exists() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| ClassifierError::io(parent, err))?;
    }
    let data = serde_json::to_vec_pretty(value).map_err(|err| ClassifierError::json(path, err))?;
    fs::write(path, data).map_err(|err| ClassifierError::io(path, err))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Err(ClassifierError::MissingArtifact(path.to_path_buf()));
    }
    let raw = fs::read_to_string(path).map_err(|err| ClassifierError::io(path, err))?;
    serde_json::from_str(&raw).map_err(|err| ClassifierError::json(path, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{features::FeatureConfig, model::Network};

    fn artifacts() -> ClassifierArtifacts {
        let tiny =
            HashedModel::new(ModelKind::Tiny, FeatureConfig::words(8), Network::linear(8, 2))
                .unwrap();
        let large =
            HashedModel::new(ModelKind::Large, FeatureConfig::words(16), Network::linear(16, 2))
                .unwrap();
        ClassifierArtifacts {
            run_id: Uuid::new_v4(),
            tiny,
            large,
            encoder: LabelEncoder::fit(["Order/cancel", "wildcard"]),
            thresholds: PipelineThresholds {
                confidence: 0.75,
                tiny_ambiguous: 0.4,
                large_ambiguous: 0.35,
            },
        }
    }

    #[test]
    fn directory_names_follow_context() {
        let root = Path::new("/wf");
        assert_eq!(artifact_dir(root, "Order"), root.join("___command_info/Order"));
        assert_eq!(artifact_dir(root, "*"), root.join("___command_info/global"));
    }

    #[test]
    fn saved_set_loads_back() {
        let tmp = tempfile::tempdir().unwrap();
        let saved = artifacts();
        saved.save(tmp.path()).unwrap();
        assert!(tmp.path().join("tinymodel.pth/model.json").exists());
        let raw = fs::read_to_string(tmp.path().join(THRESHOLD_FILE)).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!((json["confidence_threshold"].as_f64().unwrap() - 0.75).abs() < 1e-6);

        let loaded = ClassifierArtifacts::load(tmp.path()).unwrap();
        assert_eq!(loaded.run_id, saved.run_id);
        assert_eq!(loaded.thresholds, saved.thresholds);
        assert_eq!(loaded.encoder, saved.encoder);
        assert_eq!(loaded.large, saved.large);
    }

    #[test]
    fn missing_file_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        artifacts().save(tmp.path()).unwrap();
        fs::remove_file(tmp.path().join(LARGE_AMBIGUOUS_FILE)).unwrap();
        match ClassifierArtifacts::load(tmp.path()) {
            Err(ClassifierError::MissingArtifact(path)) => {
                assert!(path.ends_with(LARGE_AMBIGUOUS_FILE));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn mixed_runs_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        artifacts().save(tmp.path()).unwrap();
        let other = tempfile::tempdir().unwrap();
        artifacts().save(other.path()).unwrap();
        fs::copy(other.path().join(THRESHOLD_FILE), tmp.path().join(THRESHOLD_FILE)).unwrap();
        assert!(matches!(
            ClassifierArtifacts::load(tmp.path()),
            Err(ClassifierError::InconsistentArtifacts { .. })
        ));
    }
}
