// Trigger events - normalized entity change descriptions

//! # Trigger Event Model
//!
//! A [`TriggerEvent`] is the matching input for the whole pipeline. It is
//! produced by collaborators (CRUD bridges, schedulers, the queue consumer)
//! and consumed by the trigger processor and the action executor. Events are
//! treated as immutable once constructed; the builder-style `with_*` methods
//! consume `self` and are meant for construction only.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::AutomationError;

/// Kind of entity change that produced an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    OnCreate,
    OnUpdate,
    OnDelete,
    Scheduled,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::OnCreate => "on_create",
            EventType::OnUpdate => "on_update",
            EventType::OnDelete => "on_delete",
            EventType::Scheduled => "scheduled",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EventType {
    type Err = AutomationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "on_create" => Ok(EventType::OnCreate),
            "on_update" => Ok(EventType::OnUpdate),
            "on_delete" => Ok(EventType::OnDelete),
            "scheduled" => Ok(EventType::Scheduled),
            other => Err(AutomationError::InvalidEvent(format!(
                "unsupported event type '{}'",
                other
            ))),
        }
    }
}

/// Old and new value of a single changed field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub old_value: serde_json::Value,
    pub new_value: serde_json::Value,
}

impl FieldChange {
    pub fn new(old_value: serde_json::Value, new_value: serde_json::Value) -> Self {
        Self {
            old_value,
            new_value,
        }
    }

    /// A change only counts as a transition when the value actually moved
    pub fn is_transition(&self) -> bool {
        self.old_value != self.new_value
    }
}

/// Normalized description of an entity create/update/delete
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub event_type: EventType,
    pub entity_name: String,
    pub entity_id: String,

    /// Present only for updates
    #[serde(default)]
    pub field_changes: HashMap<String, FieldChange>,

    /// Required; `None` fails validation
    pub timestamp: Option<DateTime<Utc>>,

    /// Flat key/value snapshot of the entity
    #[serde(default)]
    pub raw_data: HashMap<String, serde_json::Value>,

    #[serde(default)]
    pub user_id: Option<String>,
}

/// Result of validating an event before matching
#[derive(Debug, Clone, Default)]
pub struct EventValidation {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl EventValidation {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

impl TriggerEvent {
    /// Create an event stamped with the current time
    pub fn new(
        event_type: EventType,
        entity_name: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            entity_name: entity_name.into(),
            entity_id: entity_id.into(),
            field_changes: HashMap::new(),
            timestamp: Some(Utc::now()),
            raw_data: HashMap::new(),
            user_id: None,
        }
    }

    pub fn created(entity_name: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self::new(EventType::OnCreate, entity_name, entity_id)
    }

    pub fn updated(entity_name: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self::new(EventType::OnUpdate, entity_name, entity_id)
    }

    pub fn deleted(entity_name: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self::new(EventType::OnDelete, entity_name, entity_id)
    }

    pub fn with_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.raw_data.insert(key.into(), value);
        self
    }

    pub fn with_change(
        mut self,
        field: impl Into<String>,
        old_value: serde_json::Value,
        new_value: serde_json::Value,
    ) -> Self {
        let field = field.into();
        // The snapshot always reflects the post-change value
        self.raw_data.insert(field.clone(), new_value.clone());
        self.field_changes
            .insert(field, FieldChange::new(old_value, new_value));
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: Option<DateTime<Utc>>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Check required fields; update events without changes only warn
    pub fn validate(&self) -> EventValidation {
        let mut validation = EventValidation::default();

        if self.entity_name.trim().is_empty() {
            validation.errors.push("entity name is required".to_string());
        }
        if self.entity_id.trim().is_empty() {
            validation.errors.push("entity id is required".to_string());
        }
        if self.timestamp.is_none() {
            validation.errors.push("timestamp is required".to_string());
        }
        if self.event_type == EventType::OnUpdate && self.field_changes.is_empty() {
            validation.warnings.push(format!(
                "update event for {} {} carries no field changes",
                self.entity_name, self.entity_id
            ));
        }

        validation
    }

    /// The value a non-transition operator should look at
    ///
    /// For updates the changed (new) value wins; otherwise the snapshot is
    /// consulted.
    pub fn current_value(&self, field: &str) -> Option<&serde_json::Value> {
        self.field_changes
            .get(field)
            .map(|change| &change.new_value)
            .or_else(|| self.raw_data.get(field))
    }
}
