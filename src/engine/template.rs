// Template substitution for action configurations

//! # Template Engine
//!
//! Action configurations may reference the triggering event:
//!
//! ```text
//! "Order {{ entity_id }} for {{ data.customer | upper }}"
//! "Total: {{ total | currency:'€':2 }}"
//! "Line total: {{expr: quantity * unit_price}}"
//! "{{ tags }}"          <- a lone placeholder keeps the JSON type (array)
//! ```
//!
//! ## Fail-Open Resolution
//!
//! Templating never aborts an action. Unknown filters and filter failures
//! leave the value unchanged and add a warning; a missing variable becomes
//! the configured default plus a warning, or in strict mode an error with
//! the placeholder left literal. A failing `{{expr: ...}}` block is left
//! literal with a warning. Callers get everything back in a
//! [`TemplateOutput`].
//!
//! ## Path Resolution
//!
//! Context keys may themselves contain dots (`data.total`,
//! `changes.status.old`). A path is resolved by trying the longest dotted
//! prefix that exists as a literal key, then descending into the rest of the
//! path through object keys or array indices.

use std::fmt::Write as _;

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use serde_json::{Map, Value};

use super::expression::{self, number_to_value};
use crate::{AutomationError, Result};

const PLACEHOLDER_PATTERN: &str = r"\{\{(.+?)\}\}";

#[derive(Debug, Clone)]
pub struct TemplateOptions {
    /// Missing variables become errors and stay literal
    pub strict: bool,
    /// Substituted for missing variables in non-strict mode
    pub default_value: String,
}

impl Default for TemplateOptions {
    fn default() -> Self {
        Self {
            strict: false,
            default_value: String::new(),
        }
    }
}

/// A resolved value plus everything that went wrong on the way
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateOutput<T = Value> {
    pub value: T,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Default)]
struct Diagnostics {
    warnings: Vec<String>,
    errors: Vec<String>,
}

impl Diagnostics {
    fn into_output<T>(self, value: T) -> TemplateOutput<T> {
        TemplateOutput {
            value,
            warnings: self.warnings,
            errors: self.errors,
        }
    }
}

struct FilterCall {
    name: String,
    args: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct TemplateEngine {
    options: TemplateOptions,
    placeholder: Regex,
}

impl TemplateEngine {
    pub fn new(options: TemplateOptions) -> Result<Self> {
        let placeholder = Regex::new(PLACEHOLDER_PATTERN)
            .map_err(|e| AutomationError::Internal(format!("Invalid placeholder pattern: {}", e)))?;
        Ok(Self {
            options,
            placeholder,
        })
    }

    pub fn options(&self) -> &TemplateOptions {
        &self.options
    }

    /// True if the string contains at least one placeholder
    pub fn has_placeholders(&self, template: &str) -> bool {
        self.placeholder.is_match(template)
    }

    /// Substitute every placeholder in a string
    pub fn resolve_string(&self, template: &str, context: &Map<String, Value>) -> TemplateOutput<String> {
        let mut diagnostics = Diagnostics::default();
        let rendered = self.render(template, context, &mut diagnostics);
        diagnostics.into_output(rendered)
    }

    /// Walk a JSON value and resolve every string inside it
    ///
    /// A string that is exactly one placeholder is replaced by the resolved
    /// JSON value, so `"{{ tags }}"` stays an array.
    pub fn process_value(&self, value: &Value, context: &Map<String, Value>) -> TemplateOutput<Value> {
        let mut diagnostics = Diagnostics::default();
        let processed = self.process(value, context, &mut diagnostics);
        diagnostics.into_output(processed)
    }

    fn process(&self, value: &Value, context: &Map<String, Value>, diagnostics: &mut Diagnostics) -> Value {
        match value {
            Value::String(s) => {
                if let Some(inner) = self.single_placeholder(s) {
                    return match self.resolve_placeholder(inner, context, diagnostics) {
                        Some(resolved) => resolved,
                        None => value.clone(),
                    };
                }
                Value::String(self.render(s, context, diagnostics))
            }
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.process(item, context, diagnostics))
                    .collect(),
            ),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.process(v, context, diagnostics)))
                    .collect(),
            ),
            _ => value.clone(),
        }
    }

    fn single_placeholder<'t>(&self, s: &'t str) -> Option<&'t str> {
        let trimmed = s.trim();
        let captures = self.placeholder.captures(trimmed)?;
        let whole = captures.get(0)?;
        if whole.start() == 0 && whole.end() == trimmed.len() {
            captures.get(1).map(|m| m.as_str())
        } else {
            None
        }
    }

    fn render(&self, template: &str, context: &Map<String, Value>, diagnostics: &mut Diagnostics) -> String {
        let mut rendered = String::with_capacity(template.len());
        let mut last = 0;

        for captures in self.placeholder.captures_iter(template) {
            let (whole, inner) = match (captures.get(0), captures.get(1)) {
                (Some(whole), Some(inner)) => (whole, inner),
                _ => continue,
            };
            rendered.push_str(&template[last..whole.start()]);
            match self.resolve_placeholder(inner.as_str(), context, diagnostics) {
                Some(value) => rendered.push_str(&render_value(&value)),
                None => rendered.push_str(whole.as_str()),
            }
            last = whole.end();
        }

        rendered.push_str(&template[last..]);
        rendered
    }

    /// Resolve one `{{ ... }}` body; `None` leaves the placeholder literal
    fn resolve_placeholder(
        &self,
        inner: &str,
        context: &Map<String, Value>,
        diagnostics: &mut Diagnostics,
    ) -> Option<Value> {
        let inner = inner.trim();
        let mut parts = split_outside_quotes(inner, '|').into_iter();
        let head = parts.next().unwrap_or_default();
        let filters: Vec<FilterCall> = parts.map(|p| parse_filter(&p)).collect();

        let value = if let Some(expr) = head.trim().strip_prefix("expr:") {
            let resolve = |name: &str| resolve_path(context, name);
            match expression::evaluate(expr, &resolve) {
                Ok(n) => number_to_value(n),
                Err(e) => {
                    diagnostics
                        .warnings
                        .push(format!("Expression '{}' failed: {}", expr.trim(), e));
                    return None;
                }
            }
        } else {
            let path = head.trim();
            match resolve_path(context, path) {
                Some(value) => value,
                None => {
                    if let Some(default) = filters.iter().find(|f| f.name == "default") {
                        Value::String(default.args.first().cloned().unwrap_or_default())
                    } else if self.options.strict {
                        diagnostics
                            .errors
                            .push(format!("Variable '{}' not found", path));
                        return None;
                    } else {
                        diagnostics.warnings.push(format!(
                            "Variable '{}' not found, using default value",
                            path
                        ));
                        Value::String(self.options.default_value.clone())
                    }
                }
            }
        };

        let mut value = value;
        for filter in &filters {
            match apply_filter(&filter.name, &filter.args, &value) {
                Ok(filtered) => value = filtered,
                Err(e) => diagnostics
                    .warnings
                    .push(format!("Filter '{}' skipped: {}", filter.name, e)),
            }
        }
        Some(value)
    }
}

/// Resolve a dotted path against a context with possibly dotted keys
pub fn resolve_path(context: &Map<String, Value>, path: &str) -> Option<Value> {
    let path = path.trim();
    if path.is_empty() {
        return None;
    }
    let segments: Vec<&str> = path.split('.').collect();

    for split in (1..=segments.len()).rev() {
        let key = segments[..split].join(".");
        if let Some(root) = context.get(&key) {
            if let Some(found) = descend(root, &segments[split..]) {
                return Some(found.clone());
            }
        }
    }
    None
}

fn descend<'v>(root: &'v Value, segments: &[&str]) -> Option<&'v Value> {
    let mut current = root;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(*segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Text form of a value as it appears inside a larger string
pub fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

fn split_outside_quotes(input: &str, separator: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in input.chars() {
        match quote {
            Some(q) if c == q => {
                quote = None;
                current.push(c);
            }
            Some(_) => current.push(c),
            None if c == '\'' || c == '"' => {
                quote = Some(c);
                current.push(c);
            }
            None if c == separator => parts.push(std::mem::take(&mut current)),
            None => current.push(c),
        }
    }
    parts.push(current);
    parts
}

fn unquote(arg: &str) -> String {
    let arg = arg.trim();
    let quoted = arg.len() >= 2
        && ((arg.starts_with('\'') && arg.ends_with('\'')) || (arg.starts_with('"') && arg.ends_with('"')));
    if quoted {
        arg[1..arg.len() - 1].to_string()
    } else {
        arg.to_string()
    }
}

fn parse_filter(raw: &str) -> FilterCall {
    let mut pieces = split_outside_quotes(raw.trim(), ':').into_iter();
    let name = pieces.next().unwrap_or_default().trim().to_string();
    FilterCall {
        name,
        args: pieces.map(|p| unquote(&p)).collect(),
    }
}

fn numeric(value: &Value) -> std::result::Result<f64, String> {
    match value {
        Value::Number(n) => n.as_f64().ok_or_else(|| format!("{} is not a finite number", n)),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| format!("'{}' is not numeric", s)),
        other => Err(format!("{} is not numeric", other)),
    }
}

fn parse_arg<T: std::str::FromStr>(args: &[String], index: usize, fallback: T) -> std::result::Result<T, String> {
    match args.get(index) {
        Some(raw) if !raw.is_empty() => raw
            .parse::<T>()
            .map_err(|_| format!("invalid argument '{}'", raw)),
        _ => Ok(fallback),
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(|c| c.to_lowercase())).collect(),
        None => String::new(),
    }
}

fn group_thousands(digits: &str) -> String {
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    grouped
}

fn to_datetime(value: &Value) -> std::result::Result<DateTime<Utc>, String> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Ok(dt.with_timezone(&Utc));
            }
            if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
                return Ok(Utc.from_utc_datetime(&naive));
            }
            if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
                if let Some(naive) = date.and_hms_opt(0, 0, 0) {
                    return Ok(Utc.from_utc_datetime(&naive));
                }
            }
            Err(format!("'{}' is not a date", s))
        }
        Value::Number(n) => n
            .as_i64()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .ok_or_else(|| format!("{} is not a unix timestamp", n)),
        other => Err(format!("{} is not a date", other)),
    }
}

/// Apply one filter; an error leaves the value to the caller unchanged
fn apply_filter(name: &str, args: &[String], value: &Value) -> std::result::Result<Value, String> {
    match name {
        "upper" => Ok(Value::String(render_value(value).to_uppercase())),
        "lower" => Ok(Value::String(render_value(value).to_lowercase())),
        "trim" => Ok(Value::String(render_value(value).trim().to_string())),
        "capitalize" => Ok(Value::String(capitalize(&render_value(value)))),
        "title" => Ok(Value::String(
            render_value(value)
                .split_whitespace()
                .map(capitalize)
                .collect::<Vec<_>>()
                .join(" "),
        )),
        "truncate" => {
            let length: usize = parse_arg(args, 0, 50)?;
            let suffix = args.get(1).cloned().unwrap_or_else(|| "...".to_string());
            let text = render_value(value);
            if text.chars().count() <= length {
                Ok(Value::String(text))
            } else {
                let mut truncated: String = text.chars().take(length).collect();
                truncated.push_str(&suffix);
                Ok(Value::String(truncated))
            }
        }
        "currency" => {
            let amount = numeric(value)?;
            let symbol = args.first().cloned().unwrap_or_else(|| "$".to_string());
            let decimals: usize = parse_arg(args, 1, 2)?;
            let formatted = format!("{:.*}", decimals, amount.abs());
            let (whole, fraction) = match formatted.split_once('.') {
                Some((whole, fraction)) => (whole.to_string(), Some(fraction.to_string())),
                None => (formatted.clone(), None),
            };
            let mut out = String::new();
            if amount < 0.0 {
                out.push('-');
            }
            out.push_str(&symbol);
            out.push_str(&group_thousands(&whole));
            if let Some(fraction) = fraction {
                out.push('.');
                out.push_str(&fraction);
            }
            Ok(Value::String(out))
        }
        "round" => {
            let amount = numeric(value)?;
            let decimals: i32 = parse_arg(args, 0, 0)?;
            let factor = 10f64.powi(decimals);
            Ok(number_to_value((amount * factor).round() / factor))
        }
        "date" => {
            let format = args.first().map(String::as_str).unwrap_or("%Y-%m-%d");
            let items: Vec<Item> = StrftimeItems::new(format).collect();
            if items.iter().any(|item| matches!(item, Item::Error)) {
                return Err(format!("invalid date format '{}'", format));
            }
            let datetime = to_datetime(value)?;
            let mut out = String::new();
            write!(out, "{}", datetime.format_with_items(items.iter()))
                .map_err(|_| format!("could not format date with '{}'", format))?;
            Ok(Value::String(out))
        }
        "join" => {
            let separator = args.first().cloned().unwrap_or_else(|| ", ".to_string());
            match value {
                Value::Array(items) => Ok(Value::String(
                    items.iter().map(render_value).collect::<Vec<_>>().join(&separator),
                )),
                other => Err(format!("{} is not a list", other)),
            }
        }
        "first" | "last" => match value {
            Value::Array(items) => {
                let item = if name == "first" { items.first() } else { items.last() };
                Ok(item.cloned().unwrap_or(Value::Null))
            }
            Value::String(s) => {
                let c = if name == "first" { s.chars().next() } else { s.chars().last() };
                Ok(c.map(|c| Value::String(c.to_string())).unwrap_or(Value::Null))
            }
            other => Err(format!("{} has no elements", other)),
        },
        "length" => match value {
            Value::Array(items) => Ok(Value::from(items.len())),
            Value::Object(map) => Ok(Value::from(map.len())),
            Value::String(s) => Ok(Value::from(s.chars().count())),
            other => Err(format!("{} has no length", other)),
        },
        "default" => {
            let empty = value.is_null() || matches!(value, Value::String(s) if s.is_empty());
            if empty {
                Ok(Value::String(args.first().cloned().unwrap_or_default()))
            } else {
                Ok(value.clone())
            }
        }
        other => Err(format!("unknown filter '{}'", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn engine() -> TemplateEngine {
        TemplateEngine::new(TemplateOptions::default()).unwrap()
    }

    fn context() -> Map<String, Value> {
        let value = json!({
            "entity_id": "o-42",
            "customer": "acme corp",
            "total": 1234.5,
            "tags": ["rush", "vip"],
            "quantity": 3,
            "unit_price": "2.5",
            "created": "2024-03-05T10:30:00Z",
            "data": {"customer": "acme corp", "address": {"city": "Oslo"}},
            "data.total": 1234.5,
            "changes.status.old": "pending",
            "changes.status.new": "shipped"
        });
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_simple_substitution_and_filters() {
        let output = engine().resolve_string(
            "Order {{ entity_id }} for {{ customer | title }} ({{ changes.status.old | upper }})",
            &context(),
        );

        assert_eq!(output.value, "Order o-42 for Acme Corp (PENDING)");
        assert!(output.warnings.is_empty());
    }

    #[test]
    fn test_path_resolution_prefers_literal_keys() {
        let ctx = context();
        assert_eq!(resolve_path(&ctx, "data.total"), Some(json!(1234.5)));
        assert_eq!(resolve_path(&ctx, "data.address.city"), Some(json!("Oslo")));
        assert_eq!(resolve_path(&ctx, "tags.1"), Some(json!("vip")));
        assert_eq!(resolve_path(&ctx, "data.missing"), None);
    }

    #[test]
    fn test_formatting_filters() {
        let ctx = context();
        let engine = engine();

        assert_eq!(engine.resolve_string("{{ total | currency }}", &ctx).value, "$1,234.50");
        assert_eq!(engine.resolve_string("{{ total | currency:'€':1 }}", &ctx).value, "€1,234.5");
        assert_eq!(engine.resolve_string("{{ total | round }}", &ctx).value, "1235");
        assert_eq!(engine.resolve_string("{{ tags | join:' / ' }}", &ctx).value, "rush / vip");
        assert_eq!(engine.resolve_string("{{ tags | last | upper }}", &ctx).value, "VIP");
        assert_eq!(engine.resolve_string("{{ customer | truncate:4 }}", &ctx).value, "acme...");
        assert_eq!(engine.resolve_string("{{ created | date:'%d/%m/%Y' }}", &ctx).value, "05/03/2024");
    }

    #[test]
    fn test_unknown_filter_fails_open() {
        let output = engine().resolve_string("{{ customer | shout | upper }}", &context());

        assert_eq!(output.value, "ACME CORP");
        assert_eq!(output.warnings.len(), 1);
        assert!(output.warnings[0].contains("shout"));
    }

    #[test]
    fn test_filter_failure_leaves_value() {
        let output = engine().resolve_string("{{ customer | currency }}", &context());

        assert_eq!(output.value, "acme corp");
        assert_eq!(output.warnings.len(), 1);
    }

    #[test]
    fn test_missing_variable_modes() {
        let output = engine().resolve_string("Hi {{ nobody }}!", &context());
        assert_eq!(output.value, "Hi !");
        assert_eq!(output.warnings.len(), 1);

        let silent = engine().resolve_string("Hi {{ nobody | default:'there' }}!", &context());
        assert_eq!(silent.value, "Hi there!");
        assert!(silent.warnings.is_empty());

        let strict = TemplateEngine::new(TemplateOptions {
            strict: true,
            ..Default::default()
        })
        .unwrap();
        let output = strict.resolve_string("Hi {{ nobody }}!", &context());
        assert_eq!(output.value, "Hi {{ nobody }}!");
        assert_eq!(output.errors.len(), 1);
    }

    #[test]
    fn test_expression_blocks() {
        let ctx = context();
        let engine = engine();

        assert_eq!(engine.resolve_string("{{expr: quantity * unit_price}}", &ctx).value, "7.5");
        assert_eq!(engine.resolve_string("{{expr: quantity * 2}}", &ctx).value, "6");

        let failed = engine.resolve_string("x={{expr: quantity / 0}}", &ctx);
        assert_eq!(failed.value, "x={{expr: quantity / 0}}");
        assert_eq!(failed.warnings.len(), 1);

        let unknown = engine.resolve_string("y={{expr: discount * 2}}", &ctx);
        assert_eq!(unknown.value, "y={{expr: discount * 2}}");
        assert_eq!(unknown.warnings.len(), 1);
        assert!(unknown.warnings[0].contains("discount"));
    }

    #[test]
    fn test_process_value_keeps_types() {
        let config = json!({
            "recipients": "{{ tags }}",
            "amount": "{{expr: quantity * 10}}",
            "subject": "Order {{ entity_id }}",
            "nested": {"city": "{{ data.address.city }}"},
            "retries": 3
        });

        let output = engine().process_value(&config, &context());
        assert_eq!(
            output.value,
            json!({
                "recipients": ["rush", "vip"],
                "amount": 30,
                "subject": "Order o-42",
                "nested": {"city": "Oslo"},
                "retries": 3
            })
        );
    }
}
