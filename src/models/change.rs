// Rule-change notifications

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::rule::RuleId;

/// Something changed about a rule; caches keyed on rules must be dropped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleChange {
    Created { rule_id: RuleId, at: DateTime<Utc> },
    Updated { rule_id: RuleId, at: DateTime<Utc> },
    Deleted { rule_id: RuleId, at: DateTime<Utc> },
    Activated { rule_id: RuleId, at: DateTime<Utc> },
    Deactivated { rule_id: RuleId, at: DateTime<Utc> },
    DependenciesChanged { rule_id: RuleId, at: DateTime<Utc> },
}

impl RuleChange {
    pub fn created(rule_id: impl Into<RuleId>) -> Self {
        RuleChange::Created { rule_id: rule_id.into(), at: Utc::now() }
    }

    pub fn updated(rule_id: impl Into<RuleId>) -> Self {
        RuleChange::Updated { rule_id: rule_id.into(), at: Utc::now() }
    }

    pub fn deleted(rule_id: impl Into<RuleId>) -> Self {
        RuleChange::Deleted { rule_id: rule_id.into(), at: Utc::now() }
    }

    pub fn activated(rule_id: impl Into<RuleId>) -> Self {
        RuleChange::Activated { rule_id: rule_id.into(), at: Utc::now() }
    }

    pub fn deactivated(rule_id: impl Into<RuleId>) -> Self {
        RuleChange::Deactivated { rule_id: rule_id.into(), at: Utc::now() }
    }

    pub fn dependencies_changed(rule_id: impl Into<RuleId>) -> Self {
        RuleChange::DependenciesChanged { rule_id: rule_id.into(), at: Utc::now() }
    }

    pub fn rule_id(&self) -> &RuleId {
        match self {
            RuleChange::Created { rule_id, .. }
            | RuleChange::Updated { rule_id, .. }
            | RuleChange::Deleted { rule_id, .. }
            | RuleChange::Activated { rule_id, .. }
            | RuleChange::Deactivated { rule_id, .. }
            | RuleChange::DependenciesChanged { rule_id, .. } => rule_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RuleChange::Created { .. } => "created",
            RuleChange::Updated { .. } => "updated",
            RuleChange::Deleted { .. } => "deleted",
            RuleChange::Activated { .. } => "activated",
            RuleChange::Deactivated { .. } => "deactivated",
            RuleChange::DependenciesChanged { .. } => "dependencies_changed",
        }
    }
}
