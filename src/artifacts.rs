//! The serialized {classifier, scaler, feature-name list} triple.
//!
//! All three files carry the same `bundle_id`. Publishing writes every file
//! to a temporary sibling first and only renames once all writes succeeded.
//! A failed rename puts the previous files back. Loading rejects a triple that is incomplete or mixes bundle ids.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use clap::Args;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Result, TurnoverError};
use crate::forest::RandomForest;
use crate::models::FeatureVector;
use crate::scaler::StandardScaler;

#[derive(Debug, Clone, Args)]
pub struct ArtifactPaths {
    /// Serialized classifier
    #[arg(long, env = "MODEL_PATH", default_value = "models/turnover_rf_model.json")]
    pub model_path: PathBuf,
    /// Serialized feature scaler
    #[arg(long, env = "SCALER_PATH", default_value = "models/scaler.json")]
    pub scaler_path: PathBuf,
    /// Ordered feature-name list
    #[arg(long, env = "FEATURES_PATH", default_value = "models/feature_names.json")]
    pub features_path: PathBuf,
}

impl ArtifactPaths {
    #[cfg(test)]
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            model_path: dir.join("turnover_rf_model.json"),
            scaler_path: dir.join("scaler.json"),
            features_path: dir.join("feature_names.json"),
        }
    }

    fn all(&self) -> [&Path; 3] {
        [&self.model_path, &self.scaler_path, &self.features_path]
    }
}

#[derive(Serialize, Deserialize)]
struct ModelFile {
    bundle_id: Uuid,
    trained_at: DateTime<Utc>,
    model: RandomForest,
}

#[derive(Serialize, Deserialize)]
struct ScalerFile {
    bundle_id: Uuid,
    scaler: StandardScaler,
}

#[derive(Serialize, Deserialize)]
struct FeaturesFile {
    bundle_id: Uuid,
    feature_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactBundle {
    pub bundle_id: Uuid,
    pub trained_at: DateTime<Utc>,
    pub model: RandomForest,
    pub scaler: StandardScaler,
    pub feature_names: Vec<String>,
}

impl ArtifactBundle {
    pub fn new(model: RandomForest, scaler: StandardScaler, feature_names: Vec<String>) -> Self {
        Self {
            bundle_id: Uuid::new_v4(),
            trained_at: Utc::now(),
            model,
            scaler,
            feature_names,
        }
    }

    /// The three members must agree on width and the names must be servable.
    pub fn check_consistency(&self) -> Result<()> {
        let width = self.feature_names.len();
        if self.scaler.width() != width || self.model.n_features != width {
            return Err(TurnoverError::configuration(format!(
                "artifact widths disagree: {} feature names, scaler {}, model {}",
                width,
                self.scaler.width(),
                self.model.n_features
            )));
        }
        self.model.validate()?;
        FeatureVector::validate_schema(&self.feature_names)
    }

    pub fn save(&self, paths: &ArtifactPaths) -> Result<()> {
        self.check_consistency()?;
        let payloads = [
            serde_json::to_vec(&ModelFile {
                bundle_id: self.bundle_id,
                trained_at: self.trained_at,
                model: self.model.clone(),
            })?,
            serde_json::to_vec(&ScalerFile {
                bundle_id: self.bundle_id,
                scaler: self.scaler.clone(),
            })?,
            serde_json::to_vec(&FeaturesFile {
                bundle_id: self.bundle_id,
                feature_names: self.feature_names.clone(),
            })?,
        ];

        let staged: Vec<(PathBuf, &Path)> = paths
            .all()
            .into_iter()
            .map(|path| (sibling(path, "tmp"), path))
            .collect();
        let written = staged
            .iter()
            .zip(&payloads)
            .try_for_each(|((tmp, target), payload)| {
                if let Some(dir) = target.parent().filter(|d| !d.as_os_str().is_empty()) {
                    fs::create_dir_all(dir)?;
                }
                fs::write(tmp, payload)
            });
        if let Err(err) = written {
            for (tmp, _) in &staged {
                let _ = fs::remove_file(tmp);
            }
            return Err(err.into());
        }

        publish(&staged)?;
        info!(bundle_id = %self.bundle_id, model = %paths.model_path.display(), "published artifact bundle");
        Ok(())
    }

    pub fn load(paths: &ArtifactPaths) -> Result<Self> {
        let missing: Vec<String> = paths
            .all()
            .iter()
            .filter(|path| !path.exists())
            .map(|path| path.display().to_string())
            .collect();
        if !missing.is_empty() {
            return Err(TurnoverError::configuration(format!(
                "missing artifacts: {}",
                missing.join(", ")
            )));
        }

        let model: ModelFile = read_json(&paths.model_path)?;
        let scaler: ScalerFile = read_json(&paths.scaler_path)?;
        let features: FeaturesFile = read_json(&paths.features_path)?;
        if scaler.bundle_id != model.bundle_id || features.bundle_id != model.bundle_id {
            warn!(
                model = %model.bundle_id,
                scaler = %scaler.bundle_id,
                features = %features.bundle_id,
                "artifact bundle ids disagree"
            );
            return Err(TurnoverError::configuration(
                "artifacts come from different training runs",
            ));
        }

        let bundle = Self {
            bundle_id: model.bundle_id,
            trained_at: model.trained_at,
            model: model.model,
            scaler: scaler.scaler,
            feature_names: features.feature_names,
        };
        bundle.check_consistency()?;
        Ok(bundle)
    }
}

fn sibling(path: &Path, extension: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(extension);
    path.with_file_name(name)
}

/// Moves staged files over their targets. If any rename fails, the targets
/// already replaced are put back so the previous bundle stays loadable.
fn publish(staged: &[(PathBuf, &Path)]) -> io::Result<()> {
    let mut backups = Vec::new();
    let mut placed = Vec::new();
    match swap_in(staged, &mut backups, &mut placed) {
        Ok(()) => {
            for (backup, _) in &backups {
                let _ = fs::remove_file(backup);
            }
            Ok(())
        }
        Err(err) => {
            for target in placed {
                let _ = fs::remove_file(target);
            }
            for (backup, target) in &backups {
                if let Err(restore) = fs::rename(backup, target) {
                    warn!(target = %target.display(), error = %restore, "could not restore previous artifact");
                }
            }
            for (tmp, _) in staged {
                let _ = fs::remove_file(tmp);
            }
            Err(err)
        }
    }
}

fn swap_in<'a>(
    staged: &[(PathBuf, &'a Path)],
    backups: &mut Vec<(PathBuf, &'a Path)>,
    placed: &mut Vec<&'a Path>,
) -> io::Result<()> {
    for (tmp, target) in staged {
        if target.exists() {
            let backup = sibling(target, "bak");
            fs::rename(target, &backup)?;
            backups.push((backup, *target));
        }
        fs::rename(tmp, target)?;
        placed.push(*target);
    }
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path)?;
    serde_json::from_slice(&bytes).map_err(|err| {
        TurnoverError::configuration(format!("cannot decode {}: {err}", path.display()))
    })
}
