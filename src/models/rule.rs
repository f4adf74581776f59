// Automation rules - stored "when X happens to entity Y" definitions

//! # Automation Rule Model
//!
//! An [`AutomationRule`] pairs an entity and an event type with a list of
//! field conditions. Matched rules are ordered by the dependency resolver and
//! their actions are run by the action executor.
//!
//! ## Rust Learning Notes:
//!
//! ### Newtype Identifiers
//! `RuleId` wraps a `String` so a rule id can never be passed where an
//! action id or entity id is expected. `#[serde(transparent)]` keeps the JSON
//! form a plain string.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::condition::{evaluate_conditions, ConditionSetOutcome, FieldCondition};
use super::event::{EventType, TriggerEvent};

/// Unique identifier of an automation rule
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(pub String);

impl RuleId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RuleId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for RuleId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RuleId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A stored automation rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationRule {
    pub id: RuleId,
    pub name: String,

    /// Entity definition the rule is attached to
    #[serde(default)]
    pub entity_id: String,
    pub entity_name: String,
    #[serde(default)]
    pub entity_type_id: Option<String>,
    #[serde(default)]
    pub trigger_type_id: Option<String>,
    pub trigger_type: EventType,

    /// Serialized list of [`FieldCondition`]
    ///
    /// Kept as raw JSON so a malformed list is reported when the rule is
    /// evaluated rather than when it is loaded.
    #[serde(default = "empty_conditions")]
    pub trigger_conditions: serde_json::Value,

    #[serde(default = "default_active")]
    pub is_active: bool,

    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn empty_conditions() -> serde_json::Value {
    serde_json::Value::Array(Vec::new())
}

fn default_active() -> bool {
    true
}

impl AutomationRule {
    pub fn new(
        id: impl Into<RuleId>,
        name: impl Into<String>,
        entity_name: impl Into<String>,
        trigger_type: EventType,
    ) -> Self {
        let now = Utc::now();
        let entity_name = entity_name.into();
        Self {
            id: id.into(),
            name: name.into(),
            entity_id: entity_name.clone(),
            entity_name,
            entity_type_id: None,
            trigger_type_id: None,
            trigger_type,
            trigger_conditions: empty_conditions(),
            is_active: true,
            created_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_conditions(mut self, conditions: Vec<FieldCondition>) -> Self {
        self.trigger_conditions = serde_json::to_value(conditions).unwrap_or_else(|_| empty_conditions());
        self
    }

    pub fn with_raw_conditions(mut self, conditions: serde_json::Value) -> Self {
        self.trigger_conditions = conditions;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    /// Parse the stored condition list; `null` counts as empty
    pub fn conditions(&self) -> Result<Vec<FieldCondition>, serde_json::Error> {
        if self.trigger_conditions.is_null() {
            return Ok(Vec::new());
        }
        serde_json::from_value(self.trigger_conditions.clone())
    }

    /// Cheap pre-filter applied before any condition is evaluated
    pub fn applies_to(&self, event: &TriggerEvent) -> bool {
        self.is_active
            && self.trigger_type == event.event_type
            && self.entity_name.eq_ignore_ascii_case(&event.entity_name)
    }

    /// Evaluate this rule's conditions against an event
    pub fn evaluate(&self, event: &TriggerEvent) -> Result<ConditionSetOutcome, serde_json::Error> {
        let conditions = self.conditions()?;
        Ok(evaluate_conditions(&conditions, event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rule_id_is_transparent() {
        let id = RuleId::from("rule-1");
        assert_eq!(serde_json::to_value(&id).unwrap(), json!("rule-1"));
        assert_eq!(id.to_string(), "rule-1");
    }

    #[test]
    fn test_applies_to_filters_entity_and_type() {
        let rule = AutomationRule::new("r1", "Ship", "order", EventType::OnUpdate);

        assert!(rule.applies_to(&TriggerEvent::updated("Order", "1")));
        assert!(!rule.applies_to(&TriggerEvent::created("order", "1")));
        assert!(!rule.applies_to(&TriggerEvent::updated("invoice", "1")));
        assert!(!rule.clone().inactive().applies_to(&TriggerEvent::updated("order", "1")));
    }

    #[test]
    fn test_malformed_conditions_surface_on_evaluate() {
        let rule = AutomationRule::new("r1", "Broken", "order", EventType::OnCreate)
            .with_raw_conditions(json!({"not": "a list"}));

        assert!(rule.evaluate(&TriggerEvent::created("order", "1")).is_err());
    }

    #[test]
    fn test_rule_deserializes_with_defaults() {
        let rule: AutomationRule = serde_json::from_value(json!({
            "id": "r1",
            "name": "Large order",
            "entity_name": "order",
            "trigger_type": "on_create",
            "trigger_conditions": [
                {"field_name": "total", "operator": "greater_than", "value": 1000}
            ]
        }))
        .unwrap();

        assert!(rule.is_active);
        let event = TriggerEvent::created("order", "1").with_data("total", json!(1500));
        assert!(rule.evaluate(&event).unwrap().matched);
    }
}
