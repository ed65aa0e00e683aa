//! Online scoring against a loaded artifact bundle.

use serde::Serialize;
use tracing::{error, info};

use crate::artifacts::{ArtifactBundle, ArtifactPaths};
use crate::error::{Result, TurnoverError};
use crate::explain::TreeExplainer;
use crate::models::{FeatureVector, PredictionResult};
use crate::risk::{self, RiskLevel, RuleInputs};

pub const TOP_DRIVERS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub model_loaded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Holds either a consistent bundle or the reason loading failed.
///
/// The state is fixed at construction; requests never mutate it.
pub struct InferenceService {
    state: std::result::Result<ArtifactBundle, String>,
}

impl InferenceService {
    /// Never fails: a broken bundle leaves the service up but not ready.
    pub fn load(paths: &ArtifactPaths) -> Self {
        match ArtifactBundle::load(paths) {
            Ok(bundle) => {
                info!(
                    bundle_id = %bundle.bundle_id,
                    features = bundle.feature_names.len(),
                    trees = bundle.model.trees.len(),
                    "model artifacts loaded"
                );
                Self::from_bundle(bundle)
            }
            Err(err) => {
                error!(error = %err, "model artifacts not loaded");
                Self {
                    state: Err(err.to_string()),
                }
            }
        }
    }

    pub fn from_bundle(bundle: ArtifactBundle) -> Self {
        Self { state: Ok(bundle) }
    }

    pub fn is_ready(&self) -> bool {
        self.state.is_ok()
    }

    pub fn health(&self) -> Health {
        match &self.state {
            Ok(bundle) => Health {
                status: "healthy",
                model_loaded: true,
                bundle_id: Some(bundle.bundle_id.to_string()),
                detail: None,
            },
            Err(reason) => Health {
                status: "unhealthy",
                model_loaded: false,
                bundle_id: None,
                detail: Some(reason.clone()),
            },
        }
    }

    pub fn predict(&self, features: &FeatureVector) -> Result<PredictionResult> {
        let bundle = self
            .state
            .as_ref()
            .map_err(|reason| TurnoverError::NotReady(reason.clone()))?;

        let row = features.to_row(&bundle.feature_names)?;
        let scaled = bundle.scaler.transform_row(&row)?;
        let attribution = TreeExplainer::new(&bundle.model).explain(&scaled);
        let risk_score = attribution.output.clamp(0.0, 1.0);

        Ok(PredictionResult {
            risk_score,
            risk_level: RiskLevel::from_score(risk_score),
            top_drivers: attribution.top_drivers(&bundle.feature_names, TOP_DRIVERS),
            suggested_actions: risk::suggest(&RuleInputs::from(features), risk_score),
        })
    }
}
