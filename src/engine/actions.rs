// Action execution - running a matched rule's actions through handlers

//! # Action Executor
//!
//! Runs one rule's actions strictly in `execution_order`:
//!
//! ```text
//! RuleAction ─┬─ template defaults ─▶ merge_config ─▶ handler.validate
//!             │                                          │
//!             └─ action type (own, else template's)      ▼
//!                                      template context ─▶ process_value
//!                                                            │
//!                                      handler.execute ◀─────┘  (with retries)
//! ```
//!
//! Action implementations live outside this crate and plug in through the
//! [`ActionHandler`] trait, registered by type string in a
//! [`HandlerRegistry`]. A [`LogActionHandler`] ships as the reference
//! handler used by the worker binary.
//!
//! ## Failure Semantics
//!
//! A failed action is recorded and the rule moves on to the next action,
//! unless the failed action's type is one of the configured halting types
//! (`seek_approval` by default). Then every remaining action is recorded as
//! `skipped` with the halt reason.
//!
//! ## Rust Learning Notes:
//!
//! ### Trait Objects in a Concurrent Map
//! Handlers are stored as `Arc<dyn ActionHandler>` inside a `DashMap`, so
//! handlers can be registered at runtime while workflows are executing
//! without a global lock around the whole registry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::storage::AutomationStorage;
use super::template::{TemplateEngine, TemplateOptions};
use crate::models::{
    merge_config, ActionExecutionResult, ActionStatus, ActionTemplate, AutomationRule, RuleAction,
    RuleExecutionResult, RuleStatus, TriggerEvent,
};
use crate::{AutomationError, Result};

/// Keys the event's raw data may never shadow in the template context
const RESERVED_CONTEXT_KEYS: &[&str] = &[
    "entity_id",
    "entity_name",
    "event_type",
    "timestamp",
    "user_id",
    "rule_id",
    "rule_name",
    "execution_id",
    "action_id",
    "now",
    "data",
];

/// What a handler knows about the action it is running
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub event: Arc<TriggerEvent>,
    pub rule_id: String,
    pub rule_name: String,
    pub execution_id: String,
    pub action_id: String,
    /// 1-based attempt number
    pub attempt: u32,
}

impl ActionContext {
    /// Variables available to `{{ ... }}` placeholders
    pub fn template_context(&self) -> Map<String, Value> {
        let event = &self.event;
        let mut context = Map::new();

        context.insert("entity_id".into(), Value::String(event.entity_id.clone()));
        context.insert("entity_name".into(), Value::String(event.entity_name.clone()));
        context.insert("event_type".into(), Value::String(event.event_type.to_string()));
        context.insert(
            "timestamp".into(),
            event
                .timestamp
                .map(|ts| Value::String(ts.to_rfc3339()))
                .unwrap_or(Value::Null),
        );
        context.insert(
            "user_id".into(),
            event.user_id.clone().map(Value::String).unwrap_or(Value::Null),
        );
        context.insert("rule_id".into(), Value::String(self.rule_id.clone()));
        context.insert("rule_name".into(), Value::String(self.rule_name.clone()));
        context.insert("execution_id".into(), Value::String(self.execution_id.clone()));
        context.insert("action_id".into(), Value::String(self.action_id.clone()));
        context.insert("now".into(), Value::String(Utc::now().to_rfc3339()));

        let data: Map<String, Value> = event
            .raw_data
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, value) in &data {
            if !RESERVED_CONTEXT_KEYS.contains(&key.as_str()) {
                context.insert(key.clone(), value.clone());
            }
            context.insert(format!("data.{}", key), value.clone());
        }
        context.insert("data".into(), Value::Object(data));

        for (field, change) in &event.field_changes {
            context.insert(format!("changes.{}.old", field), change.old_value.clone());
            context.insert(format!("changes.{}.new", field), change.new_value.clone());
        }

        context
    }
}

/// Pluggable implementation of one action type
#[async_trait::async_trait]
pub trait ActionHandler: Send + Sync {
    /// Registry key, e.g. `send_email`
    fn action_type(&self) -> &str;

    /// Check a merged configuration before any templating or execution
    fn validate(&self, _config: &Value) -> Result<()> {
        Ok(())
    }

    async fn execute(&self, config: &Value, context: &ActionContext) -> Result<Value>;
}

/// Handlers keyed by action type
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<DashMap<String, Arc<dyn ActionHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the same type
    pub fn register(&self, handler: Arc<dyn ActionHandler>) {
        let action_type = handler.action_type().to_string();
        if self.handlers.insert(action_type.clone(), handler).is_some() {
            warn!(%action_type, "Replaced existing action handler");
        } else {
            debug!(%action_type, "Registered action handler");
        }
    }

    pub fn unregister(&self, action_type: &str) -> bool {
        self.handlers.remove(action_type).is_some()
    }

    pub fn get(&self, action_type: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(action_type).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, action_type: &str) -> bool {
        self.handlers.contains_key(action_type)
    }

    pub fn action_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        types.sort();
        types
    }
}

/// Writes the action to the log and echoes the resolved configuration
#[derive(Debug, Clone)]
pub struct LogActionHandler {
    action_type: String,
}

impl LogActionHandler {
    pub fn new() -> Self {
        Self::for_type("log")
    }

    /// Log under another action type, e.g. to stand in for `send_email`
    pub fn for_type(action_type: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
        }
    }
}

impl Default for LogActionHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ActionHandler for LogActionHandler {
    fn action_type(&self) -> &str {
        &self.action_type
    }

    fn validate(&self, config: &Value) -> Result<()> {
        match config.get("message") {
            None | Some(Value::String(_)) => Ok(()),
            Some(other) => Err(AutomationError::InvalidConfig {
                action_id: self.action_type.clone(),
                reason: format!("'message' must be a string, got {}", other),
            }),
        }
    }

    async fn execute(&self, config: &Value, context: &ActionContext) -> Result<Value> {
        let message = config
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("action executed");

        info!(
            action_type = %self.action_type,
            rule_id = %context.rule_id,
            action_id = %context.action_id,
            execution_id = %context.execution_id,
            entity = %context.event.entity_name,
            entity_id = %context.event.entity_id,
            "{}",
            message
        );

        Ok(serde_json::json!({
            "logged": true,
            "message": message,
            "config": config,
        }))
    }
}

#[derive(Debug, Clone)]
pub struct ActionExecutorConfig {
    pub retry_failed_actions: bool,
    /// Total attempts per action, at least 1
    pub max_retries: u32,
    /// Wait before attempt `n + 1` is `n * retry_base_delay`
    pub retry_base_delay: Duration,
    /// Process-wide cap on concurrently running handlers
    pub max_parallel_actions: usize,
    /// Failures of these types stop the rule's remaining actions
    pub halting_action_types: Vec<String>,
    pub template: TemplateOptions,
}

impl Default for ActionExecutorConfig {
    fn default() -> Self {
        Self {
            retry_failed_actions: true,
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            max_parallel_actions: 10,
            halting_action_types: vec!["seek_approval".to_string()],
            template: TemplateOptions::default(),
        }
    }
}

/// Identifies the workflow run an action belongs to
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub execution_id: String,
    pub event: Arc<TriggerEvent>,
}

pub struct ActionExecutor {
    storage: Arc<dyn AutomationStorage>,
    registry: HandlerRegistry,
    templates: TemplateEngine,
    config: ActionExecutorConfig,
    permits: Arc<Semaphore>,
}

impl ActionExecutor {
    pub fn new(
        storage: Arc<dyn AutomationStorage>,
        registry: HandlerRegistry,
        config: ActionExecutorConfig,
    ) -> Result<Self> {
        let templates = TemplateEngine::new(config.template.clone())?;
        let permits = Arc::new(Semaphore::new(config.max_parallel_actions.max(1)));
        Ok(Self {
            storage,
            registry,
            templates,
            config,
            permits,
        })
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn config(&self) -> &ActionExecutorConfig {
        &self.config
    }

    fn is_halting(&self, action_type: Option<&str>) -> bool {
        action_type.map_or(false, |t| self.config.halting_action_types.iter().any(|h| h == t))
    }

    /// Run every action of a rule in order
    pub async fn execute_rule_actions(&self, rule: &AutomationRule, context: &ExecutionContext) -> RuleExecutionResult {
        let started_at = Utc::now();
        let timer = Instant::now();

        let actions = match self.storage.list_actions_for_rule(&rule.id).await {
            Ok(actions) => actions,
            Err(e) => {
                warn!(rule_id = %rule.id, error = %e, "Failed to load rule actions");
                return RuleExecutionResult {
                    rule_id: rule.id.clone(),
                    rule_name: rule.name.clone(),
                    status: RuleStatus::Failed,
                    action_results: Vec::new(),
                    error: Some(format!("Failed to load actions: {}", e)),
                    halted: false,
                    started_at,
                    completed_at: Utc::now(),
                    duration_ms: timer.elapsed().as_millis() as u64,
                };
            }
        };

        let mut action_results = Vec::with_capacity(actions.len());
        let mut halt_reason: Option<String> = None;

        for action in &actions {
            if let Some(reason) = &halt_reason {
                action_results.push(ActionExecutionResult::skipped(action, reason.clone()));
                continue;
            }
            if !action.is_active {
                action_results.push(ActionExecutionResult::skipped(action, "action is inactive"));
                continue;
            }

            let result = self.execute_action(action, rule, context).await;
            if result.is_failed() && self.is_halting(result.action_type.as_deref()) {
                let reason = format!(
                    "halted after action {} ({}) failed",
                    action.id,
                    result.action_type.as_deref().unwrap_or_default()
                );
                warn!(rule_id = %rule.id, action_id = %action.id, "Halting rule: {}", reason);
                halt_reason = Some(reason);
            }
            action_results.push(result);
        }

        let failed = action_results.iter().filter(|r| r.is_failed()).count();
        let status = if failed == 0 {
            RuleStatus::Completed
        } else {
            RuleStatus::Failed
        };
        let error = if let Some(reason) = &halt_reason {
            Some(reason.clone())
        } else if failed > 0 {
            Some(format!("{} of {} action(s) failed", failed, action_results.len()))
        } else {
            None
        };

        debug!(
            rule_id = %rule.id,
            actions = action_results.len(),
            failed,
            halted = halt_reason.is_some(),
            "Rule actions finished"
        );

        RuleExecutionResult {
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            status,
            action_results,
            error,
            halted: halt_reason.is_some(),
            started_at,
            completed_at: Utc::now(),
            duration_ms: timer.elapsed().as_millis() as u64,
        }
    }

    async fn load_template(&self, action: &RuleAction) -> std::result::Result<Option<ActionTemplate>, String> {
        let template_id = match &action.template_id {
            Some(id) if !id.is_empty() => id,
            _ => return Ok(None),
        };
        match self.storage.get_template(template_id).await {
            Ok(Some(template)) => Ok(Some(template)),
            Ok(None) => Err(format!("Action template '{}' not found", template_id)),
            Err(e) => Err(format!("Failed to load action template '{}': {}", template_id, e)),
        }
    }

    /// Resolve, validate, template and run one action
    pub async fn execute_action(
        &self,
        action: &RuleAction,
        rule: &AutomationRule,
        context: &ExecutionContext,
    ) -> ActionExecutionResult {
        let started_at = Utc::now();
        let timer = Instant::now();
        let mut result = ActionExecutionResult {
            action_id: action.id.clone(),
            action_name: action.name.clone(),
            action_type: action.action_type.clone(),
            status: ActionStatus::Failed,
            output: None,
            error: None,
            attempts: 0,
            warnings: Vec::new(),
            template_errors: Vec::new(),
            started_at,
            duration_ms: 0,
        };

        let fail = |mut result: ActionExecutionResult, error: String| {
            warn!(rule_id = %rule.id, action_id = %action.id, "{}", error);
            result.status = ActionStatus::Failed;
            result.error = Some(error);
            result.duration_ms = timer.elapsed().as_millis() as u64;
            result
        };

        let template = match self.load_template(action).await {
            Ok(template) => template,
            Err(e) => return fail(result, e),
        };

        let merged = merge_config(
            template.as_ref().map(|t| &t.default_config),
            Some(&action.action_config),
        );

        let action_type = action
            .action_type
            .clone()
            .filter(|t| !t.is_empty())
            .or_else(|| template.as_ref().map(|t| t.action_type.clone()));
        let action_type = match action_type {
            Some(action_type) => action_type,
            None => {
                return fail(
                    result,
                    format!("Action {} has no action type and no template supplies one", action.id),
                )
            }
        };
        result.action_type = Some(action_type.clone());

        let handler = match self.registry.get(&action_type) {
            Some(handler) => handler,
            None => return fail(result, AutomationError::HandlerNotFound(action_type).to_string()),
        };

        if let Err(e) = handler.validate(&merged) {
            let error = match e {
                AutomationError::InvalidConfig { reason, .. } => AutomationError::InvalidConfig {
                    action_id: action.id.clone(),
                    reason,
                },
                other => AutomationError::InvalidConfig {
                    action_id: action.id.clone(),
                    reason: other.to_string(),
                },
            };
            return fail(result, error.to_string());
        }

        let mut action_context = ActionContext {
            event: context.event.clone(),
            rule_id: rule.id.to_string(),
            rule_name: rule.name.clone(),
            execution_id: context.execution_id.clone(),
            action_id: action.id.clone(),
            attempt: 0,
        };

        let resolved = self
            .templates
            .process_value(&merged, &action_context.template_context());
        for warning in &resolved.warnings {
            debug!(action_id = %action.id, "Template warning: {}", warning);
        }
        result.warnings = resolved.warnings;
        result.template_errors = resolved.errors;
        let config = resolved.value;

        let max_attempts = if self.config.retry_failed_actions {
            self.config.max_retries.max(1)
        } else {
            1
        };

        let mut last_error = String::new();
        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let delay = self.config.retry_base_delay * (attempt - 1);
                debug!(action_id = %action.id, attempt, delay_ms = delay.as_millis() as u64, "Retrying action");
                tokio::time::sleep(delay).await;
            }

            action_context.attempt = attempt;
            result.attempts = attempt;

            let outcome = match self.permits.acquire().await {
                Ok(_permit) => handler.execute(&config, &action_context).await,
                Err(_) => Err(AutomationError::Internal("action semaphore closed".to_string())),
            };

            match outcome {
                Ok(output) => {
                    result.status = ActionStatus::Success;
                    result.output = Some(output);
                    result.error = None;
                    result.duration_ms = timer.elapsed().as_millis() as u64;
                    return result;
                }
                Err(e) => {
                    warn!(
                        action_id = %action.id,
                        action_type = %action_type,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Action attempt failed"
                    );
                    last_error = e.to_string();
                }
            }
        }

        fail(result, last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::storage::InMemoryStorage;
    use crate::models::EventType;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Records every config it is called with
    #[derive(Default)]
    struct RecordingHandler {
        action_type: String,
        calls: Mutex<Vec<Value>>,
    }

    impl RecordingHandler {
        fn new(action_type: &str) -> Arc<Self> {
            Arc::new(Self {
                action_type: action_type.to_string(),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<Value> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl ActionHandler for RecordingHandler {
        fn action_type(&self) -> &str {
            &self.action_type
        }

        fn validate(&self, config: &Value) -> Result<()> {
            if config.get("invalid").is_some() {
                return Err(AutomationError::InvalidConfig {
                    action_id: String::new(),
                    reason: "invalid flag set".to_string(),
                });
            }
            Ok(())
        }

        async fn execute(&self, config: &Value, _context: &ActionContext) -> Result<Value> {
            self.calls.lock().unwrap().push(config.clone());
            Ok(json!({"ok": true}))
        }
    }

    /// Fails a fixed number of times before succeeding
    struct FlakyHandler {
        action_type: String,
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    impl FlakyHandler {
        fn new(action_type: &str, failures: u32) -> Arc<Self> {
            Arc::new(Self {
                action_type: action_type.to_string(),
                failures_left: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl ActionHandler for FlakyHandler {
        fn action_type(&self) -> &str {
            &self.action_type
        }

        async fn execute(&self, _config: &Value, _context: &ActionContext) -> Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(AutomationError::ActionFailed {
                    action_type: self.action_type.clone(),
                    reason: "temporarily unavailable".to_string(),
                });
            }
            Ok(json!({"ok": true}))
        }
    }

    fn test_config() -> ActionExecutorConfig {
        ActionExecutorConfig {
            retry_base_delay: Duration::from_millis(1),
            ..Default::default()
        }
    }

    fn rule() -> AutomationRule {
        AutomationRule::new("r1", "Notify on ship", "order", EventType::OnUpdate)
    }

    fn context() -> ExecutionContext {
        let event = TriggerEvent::updated("order", "o-7")
            .with_data("customer", json!("acme"))
            .with_data("entity_id", json!("shadowed"))
            .with_change("status", json!("pending"), json!("shipped"))
            .with_user("u-1");
        ExecutionContext {
            execution_id: "exec-1".to_string(),
            event: Arc::new(event),
        }
    }

    async fn executor_with(
        actions: Vec<RuleAction>,
        handlers: Vec<Arc<dyn ActionHandler>>,
        config: ActionExecutorConfig,
    ) -> (Arc<InMemoryStorage>, ActionExecutor) {
        let storage = Arc::new(InMemoryStorage::new());
        for action in actions {
            storage.save_action(action).await.unwrap();
        }
        let registry = HandlerRegistry::new();
        for handler in handlers {
            registry.register(handler);
        }
        let executor = ActionExecutor::new(storage.clone(), registry, config).unwrap();
        (storage, executor)
    }

    #[test]
    fn test_template_context_keys() {
        let ctx = context();
        let action_context = ActionContext {
            event: ctx.event.clone(),
            rule_id: "r1".to_string(),
            rule_name: "Rule".to_string(),
            execution_id: ctx.execution_id.clone(),
            action_id: "a1".to_string(),
            attempt: 1,
        };
        let vars = action_context.template_context();

        assert_eq!(vars["entity_id"], json!("o-7"));
        assert_eq!(vars["event_type"], json!("on_update"));
        assert_eq!(vars["user_id"], json!("u-1"));
        assert_eq!(vars["customer"], json!("acme"));
        assert_eq!(vars["data.customer"], json!("acme"));
        assert_eq!(vars["data.entity_id"], json!("shadowed"));
        assert_eq!(vars["data"]["status"], json!("shipped"));
        assert_eq!(vars["changes.status.old"], json!("pending"));
        assert_eq!(vars["changes.status.new"], json!("shipped"));
    }

    #[tokio::test]
    async fn test_template_defaults_merge_and_resolve() {
        let handler = RecordingHandler::new("send_email");
        let (storage, executor) = executor_with(
            vec![RuleAction::from_template(
                "a1",
                "r1",
                "shipping_email",
                1,
                json!({"subject": "Order {{ entity_id }} shipped to {{ customer | upper }}"}),
            )],
            vec![handler.clone() as Arc<dyn ActionHandler>],
            test_config(),
        )
        .await;
        storage
            .save_template(ActionTemplate::new(
                "shipping_email",
                "send_email",
                json!({"to": "ops@example.com", "subject": "default"}),
            ))
            .await
            .unwrap();

        let result = executor.execute_rule_actions(&rule(), &context()).await;

        assert!(result.succeeded());
        assert_eq!(result.action_results[0].action_type.as_deref(), Some("send_email"));
        assert_eq!(
            handler.calls(),
            vec![json!({"to": "ops@example.com", "subject": "Order o-7 shipped to ACME"})]
        );
    }

    #[tokio::test]
    async fn test_missing_handler_fails_action() {
        let (_, executor) = executor_with(
            vec![RuleAction::new("a1", "r1", "send_sms", 1, json!({}))],
            vec![],
            test_config(),
        )
        .await;

        let result = executor.execute_rule_actions(&rule(), &context()).await;

        assert!(!result.succeeded());
        assert_eq!(result.action_results[0].status, ActionStatus::Failed);
        assert_eq!(result.action_results[0].attempts, 0);
        assert!(result.action_results[0].error.as_deref().unwrap().contains("send_sms"));
    }

    #[tokio::test]
    async fn test_invalid_config_never_reaches_handler() {
        let handler = RecordingHandler::new("send_email");
        let (_, executor) = executor_with(
            vec![RuleAction::new("a1", "r1", "send_email", 1, json!({"invalid": true}))],
            vec![handler.clone() as Arc<dyn ActionHandler>],
            test_config(),
        )
        .await;

        let result = executor.execute_rule_actions(&rule(), &context()).await;

        assert_eq!(result.action_results[0].status, ActionStatus::Failed);
        assert!(handler.calls().is_empty());
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let handler = FlakyHandler::new("webhook", 2);
        let (_, executor) = executor_with(
            vec![RuleAction::new("a1", "r1", "webhook", 1, json!({}))],
            vec![handler.clone() as Arc<dyn ActionHandler>],
            test_config(),
        )
        .await;

        let result = executor.execute_rule_actions(&rule(), &context()).await;

        assert!(result.succeeded());
        assert_eq!(result.action_results[0].attempts, 3);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_disabled_means_single_attempt() {
        let handler = FlakyHandler::new("webhook", 1);
        let (_, executor) = executor_with(
            vec![RuleAction::new("a1", "r1", "webhook", 1, json!({}))],
            vec![handler.clone() as Arc<dyn ActionHandler>],
            ActionExecutorConfig {
                retry_failed_actions: false,
                ..test_config()
            },
        )
        .await;

        let result = executor.execute_rule_actions(&rule(), &context()).await;

        assert!(!result.succeeded());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_only_halting_types_stop_the_rule() {
        let recorder = RecordingHandler::new("log");
        let (_, executor) = executor_with(
            vec![
                RuleAction::new("a1", "r1", "webhook", 1, json!({})),
                RuleAction::new("a2", "r1", "log", 2, json!({})),
                RuleAction::new("a3", "r1", "seek_approval", 3, json!({})),
                RuleAction::new("a4", "r1", "log", 4, json!({})),
                RuleAction::new("a5", "r1", "log", 5, json!({})).inactive(),
            ],
            vec![
                FlakyHandler::new("webhook", 10) as Arc<dyn ActionHandler>,
                FlakyHandler::new("seek_approval", 10),
                recorder.clone(),
            ],
            test_config(),
        )
        .await;

        let result = executor.execute_rule_actions(&rule(), &context()).await;
        let statuses: Vec<ActionStatus> = result.action_results.iter().map(|r| r.status).collect();

        assert_eq!(
            statuses,
            vec![
                ActionStatus::Failed,
                ActionStatus::Success,
                ActionStatus::Failed,
                ActionStatus::Skipped,
                ActionStatus::Skipped,
            ]
        );
        assert!(result.halted);
        assert_eq!(recorder.calls().len(), 1);
        assert!(result.action_results[3].error.as_deref().unwrap().contains("a3"));
    }
}
