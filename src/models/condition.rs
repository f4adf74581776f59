// Field conditions for rule trigger matching

//! # Condition Evaluator
//!
//! A rule's trigger conditions are a flat list of [`FieldCondition`]s that
//! must all hold (AND semantics) for the rule to match an event. Evaluation
//! is pure: no I/O, no panics, and a malformed condition never aborts the
//! evaluation of its siblings.
//!
//! ## Operators
//!
//! | operator       | looks at                | matches when                        |
//! |----------------|-------------------------|-------------------------------------|
//! | `equals`       | new value, else raw data | values are equal                    |
//! | `not_equals`   | new value, else raw data | values differ, or field is missing |
//! | `changed_from` | field changes only      | a transition whose old value equals |
//! | `changed_to`   | field changes only      | a transition whose new value equals |
//! | `greater_than` | new value, else raw data | numeric (or lexical) `>`            |
//! | `less_than`    | new value, else raw data | numeric (or lexical) `<`            |
//! | `contains`     | new value, else raw data | substring or array element          |
//! | `in`           | new value, else raw data | equal to any element of the list    |
//!
//! ## Rust Learning Notes:
//!
//! ### Operators as Strings on the Wire
//! `FieldCondition::operator` stays a `String` so a stored rule with an
//! operator this build does not know still deserializes. It is parsed into
//! [`ConditionOperator`] through `FromStr` at evaluation time, and a parse
//! failure becomes an evaluation error for that one condition.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::event::{EventType, TriggerEvent};

/// Comparison applied by a [`FieldCondition`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    ChangedFrom,
    ChangedTo,
    GreaterThan,
    LessThan,
    Contains,
    In,
}

impl ConditionOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionOperator::Equals => "equals",
            ConditionOperator::NotEquals => "not_equals",
            ConditionOperator::ChangedFrom => "changed_from",
            ConditionOperator::ChangedTo => "changed_to",
            ConditionOperator::GreaterThan => "greater_than",
            ConditionOperator::LessThan => "less_than",
            ConditionOperator::Contains => "contains",
            ConditionOperator::In => "in",
        }
    }

    /// Transition operators only ever look at `field_changes`
    pub fn is_transition(&self) -> bool {
        matches!(self, ConditionOperator::ChangedFrom | ConditionOperator::ChangedTo)
    }
}

impl fmt::Display for ConditionOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ConditionOperator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "equals" => Ok(ConditionOperator::Equals),
            "not_equals" => Ok(ConditionOperator::NotEquals),
            "changed_from" => Ok(ConditionOperator::ChangedFrom),
            "changed_to" => Ok(ConditionOperator::ChangedTo),
            "greater_than" => Ok(ConditionOperator::GreaterThan),
            "less_than" => Ok(ConditionOperator::LessThan),
            "contains" => Ok(ConditionOperator::Contains),
            "in" => Ok(ConditionOperator::In),
            other => Err(format!("unknown operator '{}'", other)),
        }
    }
}

/// One predicate over an event field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldCondition {
    pub field_name: String,

    /// Parsed lazily into [`ConditionOperator`]
    pub operator: String,

    #[serde(default)]
    pub value: Value,

    /// Only consulted by `changed_to`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_value: Option<Value>,
}

/// Outcome of a single condition
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionOutcome {
    pub matched: bool,
    pub reason: String,
    pub error: Option<String>,
}

impl ConditionOutcome {
    fn matched(reason: String) -> Self {
        Self {
            matched: true,
            reason,
            error: None,
        }
    }

    fn unmatched(reason: String) -> Self {
        Self {
            matched: false,
            reason,
            error: None,
        }
    }

    fn error(error: String) -> Self {
        Self {
            matched: false,
            reason: error.clone(),
            error: Some(error),
        }
    }
}

/// Outcome of a full condition list
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConditionSetOutcome {
    pub matched: bool,
    pub reasons: Vec<String>,
    pub errors: Vec<String>,
}

impl FieldCondition {
    pub fn new(field_name: impl Into<String>, operator: ConditionOperator, value: Value) -> Self {
        Self {
            field_name: field_name.into(),
            operator: operator.as_str().to_string(),
            value,
            previous_value: None,
        }
    }

    pub fn equals(field_name: impl Into<String>, value: Value) -> Self {
        Self::new(field_name, ConditionOperator::Equals, value)
    }

    pub fn not_equals(field_name: impl Into<String>, value: Value) -> Self {
        Self::new(field_name, ConditionOperator::NotEquals, value)
    }

    pub fn changed_from(field_name: impl Into<String>, value: Value) -> Self {
        Self::new(field_name, ConditionOperator::ChangedFrom, value)
    }

    pub fn changed_to(field_name: impl Into<String>, value: Value) -> Self {
        Self::new(field_name, ConditionOperator::ChangedTo, value)
    }

    pub fn greater_than(field_name: impl Into<String>, value: Value) -> Self {
        Self::new(field_name, ConditionOperator::GreaterThan, value)
    }

    pub fn less_than(field_name: impl Into<String>, value: Value) -> Self {
        Self::new(field_name, ConditionOperator::LessThan, value)
    }

    pub fn contains(field_name: impl Into<String>, value: Value) -> Self {
        Self::new(field_name, ConditionOperator::Contains, value)
    }

    pub fn one_of(field_name: impl Into<String>, values: Vec<Value>) -> Self {
        Self::new(field_name, ConditionOperator::In, Value::Array(values))
    }

    pub fn with_previous_value(mut self, previous_value: Value) -> Self {
        self.previous_value = Some(previous_value);
        self
    }

    pub fn parsed_operator(&self) -> Result<ConditionOperator, String> {
        self.operator.parse()
    }

    /// Evaluate this condition against an event
    pub fn evaluate(&self, event: &TriggerEvent) -> ConditionOutcome {
        let operator = match self.parsed_operator() {
            Ok(operator) => operator,
            Err(e) => {
                return ConditionOutcome::error(format!("field '{}': {}", self.field_name, e))
            }
        };

        if operator.is_transition() {
            return self.evaluate_transition(operator, event);
        }

        let field = &self.field_name;
        let actual = match event.current_value(field) {
            Some(actual) => actual,
            None if operator == ConditionOperator::NotEquals => {
                return ConditionOutcome::matched(format!("'{}' is not present", field))
            }
            None => return ConditionOutcome::unmatched(format!("'{}' is not present", field)),
        };

        match operator {
            ConditionOperator::Equals => {
                if values_equal(actual, &self.value) {
                    ConditionOutcome::matched(format!("'{}' equals {}", field, self.value))
                } else {
                    ConditionOutcome::unmatched(format!(
                        "'{}' ({}) does not equal {}",
                        field, actual, self.value
                    ))
                }
            }
            ConditionOperator::NotEquals => {
                if values_equal(actual, &self.value) {
                    ConditionOutcome::unmatched(format!("'{}' equals {}", field, self.value))
                } else {
                    ConditionOutcome::matched(format!(
                        "'{}' ({}) does not equal {}",
                        field, actual, self.value
                    ))
                }
            }
            ConditionOperator::GreaterThan | ConditionOperator::LessThan => {
                let wanted = if operator == ConditionOperator::GreaterThan {
                    Ordering::Greater
                } else {
                    Ordering::Less
                };
                match compare_values(actual, &self.value) {
                    Some(ordering) if ordering == wanted => ConditionOutcome::matched(format!(
                        "'{}' ({}) {} {}",
                        field, actual, operator, self.value
                    )),
                    Some(_) => ConditionOutcome::unmatched(format!(
                        "'{}' ({}) is not {} {}",
                        field, actual, operator, self.value
                    )),
                    None => ConditionOutcome::unmatched(format!(
                        "'{}' ({}) is not comparable with {}",
                        field, actual, self.value
                    )),
                }
            }
            ConditionOperator::Contains => {
                if value_contains(actual, &self.value) {
                    ConditionOutcome::matched(format!("'{}' contains {}", field, self.value))
                } else {
                    ConditionOutcome::unmatched(format!(
                        "'{}' does not contain {}",
                        field, self.value
                    ))
                }
            }
            ConditionOperator::In => {
                let candidates = match self.value.as_array() {
                    Some(candidates) => candidates,
                    None => {
                        return ConditionOutcome::error(format!(
                            "field '{}': operator 'in' requires a list value, got {}",
                            field, self.value
                        ))
                    }
                };
                if candidates.iter().any(|candidate| values_equal(actual, candidate)) {
                    ConditionOutcome::matched(format!("'{}' ({}) is in {}", field, actual, self.value))
                } else {
                    ConditionOutcome::unmatched(format!(
                        "'{}' ({}) is not in {}",
                        field, actual, self.value
                    ))
                }
            }
            ConditionOperator::ChangedFrom | ConditionOperator::ChangedTo => {
                self.evaluate_transition(operator, event)
            }
        }
    }

    fn evaluate_transition(&self, operator: ConditionOperator, event: &TriggerEvent) -> ConditionOutcome {
        let field = &self.field_name;

        if event.event_type != EventType::OnUpdate {
            return ConditionOutcome::unmatched(format!(
                "{} only applies to update events",
                operator
            ));
        }

        let change = match event.field_changes.get(field) {
            Some(change) if change.is_transition() => change,
            Some(_) => {
                return ConditionOutcome::unmatched(format!("'{}' did not change value", field))
            }
            None => return ConditionOutcome::unmatched(format!("'{}' did not change", field)),
        };

        let matched = match operator {
            ConditionOperator::ChangedFrom => values_equal(&change.old_value, &self.value),
            _ => {
                values_equal(&change.new_value, &self.value)
                    && self
                        .previous_value
                        .as_ref()
                        .map_or(true, |previous| values_equal(&change.old_value, previous))
            }
        };

        let reason = format!(
            "'{}' changed from {} to {}",
            field, change.old_value, change.new_value
        );
        if matched {
            ConditionOutcome::matched(reason)
        } else {
            ConditionOutcome::unmatched(reason)
        }
    }
}

/// Evaluate a condition list with AND semantics
///
/// Every condition is evaluated even after a miss so that all errors are
/// reported. An empty list matches.
pub fn evaluate_conditions(conditions: &[FieldCondition], event: &TriggerEvent) -> ConditionSetOutcome {
    let mut outcome = ConditionSetOutcome {
        matched: true,
        ..Default::default()
    };

    if conditions.is_empty() {
        outcome.reasons.push("no conditions".to_string());
        return outcome;
    }

    for condition in conditions {
        let result = condition.evaluate(event);
        outcome.matched &= result.matched;
        outcome.reasons.push(result.reason);
        if let Some(error) = result.error {
            outcome.errors.push(error);
        }
    }

    outcome
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// JSON equality with a scalar fallback, so `"5"` equals `5`
pub(crate) fn values_equal(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return x == y;
    }
    match (scalar_string(a), scalar_string(b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return x.partial_cmp(&y);
    }
    match (scalar_string(a), scalar_string(b)) {
        (Some(x), Some(y)) => Some(x.cmp(&y)),
        _ => None,
    }
}

fn value_contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::String(s) => scalar_string(needle).map_or(false, |n| s.contains(&n)),
        Value::Array(items) => items.iter().any(|item| values_equal(item, needle)),
        _ => false,
    }
}
