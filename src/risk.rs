use std::fmt;

use serde::{Deserialize, Serialize};

use crate::models::FeatureVector;

pub const MEDIUM_RISK_FROM: f64 = 0.30;
pub const HIGH_RISK_FROM: f64 = 0.70;
const THEME_CONCERN_BELOW: f64 = 2.5;
const THEME_RISK_FROM: f64 = 0.5;
const RED_FLAG_LIMIT: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn from_score(score: f64) -> Self {
        if score < MEDIUM_RISK_FROM {
            RiskLevel::Low
        } else if score < HIGH_RISK_FROM {
            RiskLevel::Medium
        } else {
            RiskLevel::High
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    #[serde(rename = "manager-relationship review")]
    ManagerReview,
    #[serde(rename = "compensation review")]
    CompensationReview,
    #[serde(rename = "workload/relocation review")]
    WorkloadReview,
    #[serde(rename = "urgent retention conversation")]
    RetentionConversation,
    #[serde(rename = "HR-partner/leadership escalation")]
    LeadershipEscalation,
    #[serde(rename = "monitor regularly")]
    Monitor,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::ManagerReview => "manager-relationship review",
            Action::CompensationReview => "compensation review",
            Action::WorkloadReview => "workload/relocation review",
            Action::RetentionConversation => "urgent retention conversation",
            Action::LeadershipEscalation => "HR-partner/leadership escalation",
            Action::Monitor => "monitor regularly",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs the rules read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuleInputs {
    pub manager_mean: f64,
    pub reward_mean: f64,
    pub wlb_mean: f64,
    pub red_flag_count: u32,
}

impl From<&FeatureVector> for RuleInputs {
    fn from(features: &FeatureVector) -> Self {
        Self {
            manager_mean: features.manager_mean,
            reward_mean: features.reward_mean,
            wlb_mean: features.wlb_mean,
            red_flag_count: features.red_flag_count,
        }
    }
}

type Rule = (fn(&RuleInputs, f64) -> bool, Action);

const RULES: [Rule; 5] = [
    (
        |f, risk| f.manager_mean < THEME_CONCERN_BELOW && risk >= THEME_RISK_FROM,
        Action::ManagerReview,
    ),
    (
        |f, risk| f.reward_mean < THEME_CONCERN_BELOW && risk >= THEME_RISK_FROM,
        Action::CompensationReview,
    ),
    (
        |f, risk| f.wlb_mean < THEME_CONCERN_BELOW && risk >= THEME_RISK_FROM,
        Action::WorkloadReview,
    ),
    (
        |f, _| f.red_flag_count > RED_FLAG_LIMIT,
        Action::RetentionConversation,
    ),
    (|_, risk| risk >= HIGH_RISK_FROM, Action::LeadershipEscalation),
];

/// Every rule that fires, in rule order; never empty.
pub fn suggest(features: &RuleInputs, risk_score: f64) -> Vec<Action> {
    let actions: Vec<Action> = RULES
        .iter()
        .filter(|(applies, _)| applies(features, risk_score))
        .map(|(_, action)| *action)
        .collect();
    if actions.is_empty() {
        vec![Action::Monitor]
    } else {
        actions
    }
}
