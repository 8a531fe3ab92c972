pub mod repository;
pub mod repository_sqlx;
pub mod resolver;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ConfigId, SurveyId, TenantId};

/// The remainder action a matched approval rule resolves to, applied at
/// seal time once the sample's approval rate is known (spec.md §4.E).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    AutoApprove,
    SendToQc,
    RejectAll,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::AutoApprove => "auto_approve",
            Action::SendToQc => "send_to_qc",
            Action::RejectAll => "reject_all",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto_approve" => Some(Action::AutoApprove),
            "send_to_qc" => Some(Action::SendToQc),
            "reject_all" => Some(Action::RejectAll),
            _ => None,
        }
    }
}

/// One row of the approval-rule table: `min_rate <= rate <= max_rate =>
/// action`, first match wins, both bounds inclusive (spec.md §4.E step
/// 4 / §8 boundary behaviors). `approval_rate` is on the spec's 0-100
/// percentage scale, not a 0-1 fraction.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ApprovalRule {
    pub min_rate: f64,
    pub max_rate: f64,
    pub action: Action,
}

impl ApprovalRule {
    pub fn matches(&self, rate: f64) -> bool {
        rate >= self.min_rate && rate <= self.max_rate
    }
}

/// Tenant/survey-scoped Quality Control policy: the sample percentage and
/// approval-rule table a survey's batches are sealed against (spec.md
/// §3/§4.C).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QcConfig {
    pub id: ConfigId,
    pub tenant_id: TenantId,
    /// `None` means this is the tenant-wide default, applied when no
    /// survey-specific config is active (spec.md §4.C step 2).
    pub survey_id: Option<SurveyId>,
    pub active: bool,
    pub sample_percentage: u8,
    pub approval_rules: Vec<ApprovalRule>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The action a rule table resolves to for `rate` (0-100 scale). If no
/// rule covers the rate, falls back to the spec's default: `>= 50 ->
/// auto_approve`, else `send_to_qc` (spec.md §4.E step 4). Free function
/// so the Sampling & Remainder Processor can resolve against a batch's
/// frozen `config_snapshot.approval_rules` without reconstructing a
/// full `QcConfig`.
pub fn resolve_action(rules: &[ApprovalRule], rate: f64) -> Action {
    rules
        .iter()
        .find(|r| r.matches(rate))
        .map(|r| r.action)
        .unwrap_or(if rate >= 50.0 {
            Action::AutoApprove
        } else {
            Action::SendToQc
        })
}

impl QcConfig {
    /// The action the rule table resolves to for `rate` (0-100 scale).
    /// If no rule covers the rate, falls back to the spec's default:
    /// `>= 50 -> auto_approve`, else `send_to_qc` (spec.md §4.E step 4).
    pub fn resolve_action(&self, rate: f64) -> Action {
        resolve_action(&self.approval_rules, rate)
    }

    /// Rejects rule tables that overlap in range or are empty while
    /// `sample_percentage < 100` (spec.md §8 boundary behaviors:
    /// "Empty approvalRules with samplePercentage < 100: config rejected
    /// at creation").
    pub fn validate(&self) -> Result<(), String> {
        if self.approval_rules.is_empty() && self.sample_percentage < 100 {
            return Err("approval_rules must not be empty when sample_percentage < 100".into());
        }

        let mut sorted = self.approval_rules.clone();
        sorted.sort_by(|a, b| a.min_rate.partial_cmp(&b.min_rate).unwrap());
        for pair in sorted.windows(2) {
            if pair[0].max_rate > pair[1].min_rate {
                return Err(format!(
                    "overlapping approval rules: [{}, {}] and [{}, {}]",
                    pair[0].min_rate, pair[0].max_rate, pair[1].min_rate, pair[1].max_rate
                ));
            }
        }

        for rule in &self.approval_rules {
            if rule.min_rate > rule.max_rate {
                return Err(format!(
                    "rule with min_rate {} greater than max_rate {}",
                    rule.min_rate, rule.max_rate
                ));
            }
        }

        Ok(())
    }
}
