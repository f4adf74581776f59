// Rule Automation - Rust Edition
// A rule-driven workflow automation engine for entity change events

//! # Rule Automation Library
//!
//! This is the library root for the rule automation engine. External entity
//! change events (create / update / delete / scheduled) are matched against
//! stored automation rules, matched rules are ordered into dependency batches,
//! and each rule's actions run through pluggable handlers with templated
//! configuration and retries.
//!
//! ## Pipeline
//!
//! ```text
//! TriggerEvent
//!   ↓ QueueManager (circuit breaker gate, NATS JetStream)
//! WorkflowEngine
//!   ↓ TriggerProcessor      → matched rules (condition evaluation)
//!   ↓ DependencyResolver    → batches ordered by dependency level
//!   ↓ ActionExecutor        → templates, handlers, retries
//! WorkflowExecution (status, batch/rule/action results)
//! ```
//!
//! ## Core Components
//!
//! ### Domain Models (`models`)
//! - [`TriggerEvent`]: normalized description of an entity change
//! - [`AutomationRule`] / [`FieldCondition`]: stored rules and their conditions
//! - [`RuleDependency`] / [`DependencyGraph`]: ordering constraints between rules
//! - [`RuleAction`] / [`ActionTemplate`]: what a matched rule does
//! - [`ExecutionPlan`] / [`WorkflowExecution`]: one run of the pipeline
//!
//! ### Engine (`engine`)
//! - [`WorkflowEngine`]: the long-lived orchestrator
//! - [`TriggerProcessor`], [`DependencyResolver`], [`ActionExecutor`]
//! - [`TemplateEngine`]: `{{ path | filter }}` and `{{expr: ...}}` substitution
//! - [`QueueManager`] + [`CircuitBreaker`]: decoupled ingestion
//!
//! ## Rust Learning Notes:
//!
//! ### Re-exports
//! `pub use` statements create shortcuts so users don't need to know the
//! internal module structure. Instead of
//! `use rule_automation::engine::orchestrator::WorkflowEngine`, users can
//! write `use rule_automation::WorkflowEngine`.

// Core domain models (pure data + pure evaluation logic)
pub mod models;

// Engine implementations (storage, matching, ordering, execution, queue)
pub mod engine;

// Layered settings (defaults, file, environment)
pub mod settings;

// Re-export core domain types for easy access
pub use models::{
    ActionExecutionResult, ActionStatus, ActionTemplate, AutomationRule, BatchResult,
    BatchStatus, ConditionOperator, DependencyGraph, EventType, ExecutionBatch,
    ExecutionPlan, ExecutionQuery, FieldChange, FieldCondition, RuleAction, RuleChange,
    RuleDependency, RuleExecutionResult, RuleId, TriggerEvent, WorkflowExecution, WorkflowStatus,
};

// Re-export engine types for convenience
pub use engine::{
    actions::{
        ActionContext, ActionExecutor, ActionExecutorConfig, ActionHandler, ExecutionContext,
        HandlerRegistry, LogActionHandler,
    },
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState},
    dependencies::{BatchOrder, DependencyResolver, ResolverConfig},
    events::RuleChangeBus,
    nats_queue::{NatsQueueConfig, NatsQueueTransport},
    orchestrator::{EngineConfig, EngineStats, WorkflowEngine},
    queue::{
        EventProcessor, InMemoryQueueTransport, QueueCategory, QueueConfig, QueueManager,
        QueueMessage, QueueTransport,
    },
    storage::{AutomationStorage, InMemoryStorage, StorageSeed},
    template::{TemplateEngine, TemplateOptions, TemplateOutput},
    triggers::{MatchedRule, TriggerMatchResult, TriggerProcessor},
};

pub use models::dependency::DependencyValidationError;

// Core error types
// Using the `thiserror` crate to make error handling easier
use thiserror::Error;

/// Custom error types for rule automation operations
///
/// Every variant carries enough structure (type plus affected identifiers)
/// to render an actionable message. Expected failure modes never panic;
/// they surface as one of these variants or as a recorded status.
///
/// ## Rust Learning Notes:
///
/// ### The `thiserror` Crate
/// - `#[derive(Error)]` implements the `std::error::Error` trait
/// - `#[error("...")]` provides human-readable error messages
/// - `#[from]` enables automatic conversion from other error types
#[derive(Error, Debug)]
pub enum AutomationError {
    /// Malformed trigger event (rejected synchronously, never retried)
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// Invalid action configuration for the resolved handler
    #[error("Invalid configuration for action {action_id}: {reason}")]
    InvalidConfig { action_id: String, reason: String },

    /// One or more proposed dependency edges were rejected
    #[error("Dependency validation failed with {} error(s)", .0.len())]
    DependencyValidation(Vec<DependencyValidationError>),

    /// A handler reported a failure while executing an action
    #[error("Action {action_type} failed: {reason}")]
    ActionFailed { action_type: String, reason: String },

    /// No handler is registered for the resolved action type
    #[error("No handler registered for action type '{0}'")]
    HandlerNotFound(String),

    /// The queue circuit breaker is open; submissions fail fast
    #[error("Circuit open: {0}")]
    CircuitOpen(String),

    /// Queue transport failure (publish, subscribe, ack)
    #[error("Queue error: {0}")]
    Queue(String),

    /// An operation exceeded its deadline
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Error when an entity cannot be found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Storage-related errors
    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Settings could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AutomationError {
    /// Input validation errors are never retried by queue consumers
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            AutomationError::InvalidEvent(_)
                | AutomationError::InvalidConfig { .. }
                | AutomationError::Serialization(_)
        )
    }
}

/// Type alias for Results that use our custom error type
pub type Result<T> = std::result::Result<T, AutomationError>;
