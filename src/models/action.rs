// Rule actions, reusable action templates and execution results

//! # Action Model
//!
//! A matched rule runs its [`RuleAction`]s in `execution_order`. An action
//! may point at an [`ActionTemplate`] that supplies a default configuration
//! and, when the action leaves it empty, the action type. The two
//! configurations are combined with [`merge_config`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::rule::RuleId;

/// One step of a rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleAction {
    pub id: String,
    pub rule_id: RuleId,
    #[serde(default)]
    pub name: String,

    /// Falls back to the template's type when absent
    #[serde(default)]
    pub action_type: Option<String>,

    #[serde(default)]
    pub execution_order: i32,

    #[serde(default)]
    pub action_config: Value,

    #[serde(default)]
    pub template_id: Option<String>,

    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl RuleAction {
    pub fn new(
        id: impl Into<String>,
        rule_id: impl Into<RuleId>,
        action_type: impl Into<String>,
        execution_order: i32,
        action_config: Value,
    ) -> Self {
        let action_type = action_type.into();
        Self {
            id: id.into(),
            rule_id: rule_id.into(),
            name: action_type.clone(),
            action_type: Some(action_type),
            execution_order,
            action_config,
            template_id: None,
            is_active: true,
        }
    }

    /// An action driven entirely by a template
    pub fn from_template(
        id: impl Into<String>,
        rule_id: impl Into<RuleId>,
        template_id: impl Into<String>,
        execution_order: i32,
        action_config: Value,
    ) -> Self {
        let template_id = template_id.into();
        Self {
            id: id.into(),
            rule_id: rule_id.into(),
            name: template_id.clone(),
            action_type: None,
            execution_order,
            action_config,
            template_id: Some(template_id),
            is_active: true,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }
}

/// Reusable defaults for actions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionTemplate {
    pub id: String,
    pub name: String,
    pub action_type: String,
    #[serde(default)]
    pub default_config: Value,
}

impl ActionTemplate {
    pub fn new(
        id: impl Into<String>,
        action_type: impl Into<String>,
        default_config: Value,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            action_type: action_type.into(),
            default_config,
        }
    }
}

/// Shallow merge of a template's defaults with an action's own config
///
/// Top-level action keys win and nested objects are replaced wholesale, never
/// merged. A missing or non-object config on either side counts as empty.
pub fn merge_config(defaults: Option<&Value>, overrides: Option<&Value>) -> Value {
    let mut merged = Map::new();

    if let Some(Value::Object(defaults)) = defaults {
        merged.extend(defaults.clone());
    }
    if let Some(Value::Object(overrides)) = overrides {
        merged.extend(overrides.clone());
    }

    Value::Object(merged)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Success,
    Failed,
    Skipped,
}

/// Outcome of one action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionExecutionResult {
    pub action_id: String,
    pub action_name: String,
    pub action_type: Option<String>,
    pub status: ActionStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
    /// Handler invocations made; 0 when the handler was never called
    pub attempts: u32,
    /// Template warnings (missing variables, unknown filters)
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Template errors (strict-mode misses, expression failures)
    #[serde(default)]
    pub template_errors: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl ActionExecutionResult {
    pub fn skipped(action: &RuleAction, reason: impl Into<String>) -> Self {
        Self {
            action_id: action.id.clone(),
            action_name: action.name.clone(),
            action_type: action.action_type.clone(),
            status: ActionStatus::Skipped,
            output: None,
            error: Some(reason.into()),
            attempts: 0,
            warnings: Vec::new(),
            template_errors: Vec::new(),
            started_at: Utc::now(),
            duration_ms: 0,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == ActionStatus::Failed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleStatus {
    Completed,
    Failed,
}

/// Outcome of one rule's action sequence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleExecutionResult {
    pub rule_id: RuleId,
    pub rule_name: String,
    pub status: RuleStatus,
    pub action_results: Vec<ActionExecutionResult>,
    pub error: Option<String>,
    /// Set when a halting action failure stopped the sequence
    pub halted: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl RuleExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.status == RuleStatus::Completed
    }

    pub fn executed_actions(&self) -> usize {
        self.action_results
            .iter()
            .filter(|result| result.status != ActionStatus::Skipped)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_is_shallow() {
        let defaults = json!({"a": 1, "b": {"c": 2}});
        let overrides = json!({"b": {"d": 3}});

        assert_eq!(
            merge_config(Some(&defaults), Some(&overrides)),
            json!({"a": 1, "b": {"d": 3}})
        );
    }

    #[test]
    fn test_merge_treats_missing_sides_as_empty() {
        let config = json!({"to": "ops@example.com"});

        assert_eq!(merge_config(None, Some(&config)), config);
        assert_eq!(merge_config(Some(&config), Some(&Value::Null)), config);
        assert_eq!(merge_config(None, None), json!({}));
    }

    #[test]
    fn test_action_from_template_has_no_type() {
        let action = RuleAction::from_template("a1", "r1", "notify", 1, json!({}));
        assert!(action.action_type.is_none());
        assert_eq!(action.template_id.as_deref(), Some("notify"));
    }
}
