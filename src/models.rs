use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TurnoverError};
use crate::risk::{Action, RiskLevel};

pub const ITEM_COUNT: usize = 25;
pub const ITEMS_PER_THEME: usize = 5;
pub const LOCATION_PREFIX: &str = "location_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FormType {
    ActiveSurvey,
    ExitInterview,
}

impl FormType {
    pub fn as_str(self) -> &'static str {
        match self {
            FormType::ActiveSurvey => "active-survey",
            FormType::ExitInterview => "exit-interview",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "active-survey" => Some(FormType::ActiveSurvey),
            "exit-interview" => Some(FormType::ExitInterview),
            _ => None,
        }
    }

    /// Label implied by the form when the upstream row carries none.
    pub fn default_label(self) -> u8 {
        match self {
            FormType::ActiveSurvey => 0,
            FormType::ExitInterview => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityFlag {
    #[default]
    Ok,
    Suspicious,
}

impl QualityFlag {
    pub fn as_str(self) -> &'static str {
        match self {
            QualityFlag::Ok => "ok",
            QualityFlag::Suspicious => "suspicious",
        }
    }

    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("suspicious") {
            QualityFlag::Suspicious
        } else {
            QualityFlag::Ok
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SurveyResponse {
    pub response_id: String,
    pub employee_id: Option<String>,
    pub form_type: FormType,
    pub items: [Option<u8>; ITEM_COUNT],
    pub location: Option<String>,
    pub role: Option<String>,
    pub age_range: Option<String>,
    pub tenure_months: Option<u32>,
    pub target: Option<u8>,
    pub quality: QualityFlag,
}

impl SurveyResponse {
    pub fn answered(&self) -> impl Iterator<Item = u8> + '_ {
        self.items.iter().flatten().copied()
    }

    pub fn label(&self) -> u8 {
        self.target.unwrap_or_else(|| self.form_type.default_label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Theme {
    Satisfaction,
    Reward,
    Manager,
    WorkLifeBalance,
    Environment,
}

impl Theme {
    pub const ALL: [Theme; 5] = [
        Theme::Satisfaction,
        Theme::Reward,
        Theme::Manager,
        Theme::WorkLifeBalance,
        Theme::Environment,
    ];

    /// Zero-based item indices owned by the theme.
    pub fn items(self) -> Range<usize> {
        let start = self.index() * ITEMS_PER_THEME;
        start..start + ITEMS_PER_THEME
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Mean and sample standard deviation over the present items of a group.
///
/// Both are `None` when the group has no data; `std` is also `None` with a
/// single present item.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Summary {
    pub mean: Option<f64>,
    pub std: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ThemeScores {
    summaries: [Summary; 5],
}

impl ThemeScores {
    pub fn from_fn(mut f: impl FnMut(Theme) -> Summary) -> Self {
        Self {
            summaries: Theme::ALL.map(&mut f),
        }
    }

    pub fn get(&self, theme: Theme) -> Summary {
        self.summaries[theme.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (Theme, Summary)> + '_ {
        Theme::ALL.iter().map(|&theme| (theme, self.get(theme)))
    }
}

/// One scoring request: the fixed base columns plus `location_*` indicators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub satisfaction_mean: f64,
    pub satisfaction_std: f64,
    pub reward_mean: f64,
    pub reward_std: f64,
    pub manager_mean: f64,
    pub manager_std: f64,
    pub wlb_mean: f64,
    pub wlb_std: f64,
    pub environment_mean: f64,
    pub environment_std: f64,
    pub overall_mean: f64,
    pub overall_std: f64,
    pub red_flag_count: u32,
    pub yellow_flag_count: u32,
    pub interaction_manager_reward: f64,
    pub interaction_wlb_satisfaction: f64,
    pub role_encoded: i32,
    pub age_encoded: u8,
    pub tenure_normalized: f64,
    #[serde(flatten)]
    pub locations: BTreeMap<String, f64>,
}

impl FeatureVector {
    pub const BASE_COLUMNS: [&'static str; 19] = [
        "satisfaction_mean",
        "satisfaction_std",
        "reward_mean",
        "reward_std",
        "manager_mean",
        "manager_std",
        "wlb_mean",
        "wlb_std",
        "environment_mean",
        "environment_std",
        "overall_mean",
        "overall_std",
        "red_flag_count",
        "yellow_flag_count",
        "interaction_manager_reward",
        "interaction_wlb_satisfaction",
        "role_encoded",
        "age_encoded",
        "tenure_normalized",
    ];

    pub fn get(&self, column: &str) -> Option<f64> {
        let value = match column {
            "satisfaction_mean" => self.satisfaction_mean,
            "satisfaction_std" => self.satisfaction_std,
            "reward_mean" => self.reward_mean,
            "reward_std" => self.reward_std,
            "manager_mean" => self.manager_mean,
            "manager_std" => self.manager_std,
            "wlb_mean" => self.wlb_mean,
            "wlb_std" => self.wlb_std,
            "environment_mean" => self.environment_mean,
            "environment_std" => self.environment_std,
            "overall_mean" => self.overall_mean,
            "overall_std" => self.overall_std,
            "red_flag_count" => f64::from(self.red_flag_count),
            "yellow_flag_count" => f64::from(self.yellow_flag_count),
            "interaction_manager_reward" => self.interaction_manager_reward,
            "interaction_wlb_satisfaction" => self.interaction_wlb_satisfaction,
            "role_encoded" => f64::from(self.role_encoded),
            "age_encoded" => f64::from(self.age_encoded),
            "tenure_normalized" => self.tenure_normalized,
            other => return self.locations.get(other).copied(),
        };
        Some(value)
    }

    /// Checks that a persisted feature-name list can be served by this record.
    pub fn validate_schema(feature_names: &[String]) -> Result<()> {
        if feature_names.is_empty() {
            return Err(TurnoverError::configuration("feature-name list is empty"));
        }
        for base in Self::BASE_COLUMNS {
            if !feature_names.iter().any(|name| name == base) {
                return Err(TurnoverError::configuration(format!(
                    "feature-name list is missing base column {base}"
                )));
            }
        }
        if let Some(unknown) = feature_names
            .iter()
            .find(|name| !Self::BASE_COLUMNS.contains(&name.as_str()) && !name.starts_with(LOCATION_PREFIX))
        {
            return Err(TurnoverError::configuration(format!(
                "feature-name list has unknown column {unknown}"
            )));
        }
        Ok(())
    }

    /// Selects values in `feature_names` order; any absent or non-finite
    /// field rejects the request.
    pub fn to_row(&self, feature_names: &[String]) -> Result<Vec<f64>> {
        if let Some(stray) = self
            .locations
            .keys()
            .find(|key| !key.starts_with(LOCATION_PREFIX))
        {
            return Err(TurnoverError::validation(format!("unknown field {stray}")));
        }
        let flagged = self.red_flag_count.checked_add(self.yellow_flag_count);
        if flagged.map_or(true, |n| n > ITEM_COUNT as u32) {
            return Err(TurnoverError::validation(format!(
                "flag counts exceed {ITEM_COUNT} items"
            )));
        }

        feature_names
            .iter()
            .map(|name| {
                let value = self
                    .get(name)
                    .ok_or_else(|| TurnoverError::validation(format!("missing field {name}")))?;
                if value.is_finite() {
                    Ok(value)
                } else {
                    Err(TurnoverError::validation(format!("field {name} is not finite")))
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Driver {
    pub feature: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    pub top_drivers: Vec<Driver>,
    pub suggested_actions: Vec<Action>,
}

impl fmt::Display for PredictionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "risk {:.3} ({})", self.risk_score, self.risk_level)
    }
}
