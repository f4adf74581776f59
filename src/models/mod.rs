// Core domain models for the rule automation engine
// These are the plain data structures plus pure evaluation logic

//! # Domain Models Module
//!
//! This module contains the core domain models. Nothing in here performs
//! I/O: events, rules and conditions, the dependency graph, actions, and
//! execution records are all plain data with pure methods on top.
//!
//! ## Rust Learning Notes:
//!
//! ### Module Organization
//! This `mod.rs` file serves as the **module root** for the `models`
//! directory. Each `pub mod` declaration includes a sibling `.rs` file as a
//! submodule, and the `pub use` statements at the bottom flatten the API.

// Trigger events produced by collaborators (CRUD bridges, schedulers)
pub mod event;

// Field conditions and the pure condition evaluator
pub mod condition;

// Automation rules and their identifiers
pub mod rule;

// Rule dependencies and the derived dependency graph
pub mod dependency;

// Rule actions, action templates and per-action results
pub mod action;

// Execution plans, workflow executions and read-side queries
pub mod execution;

// Rule-change notifications used for cache invalidation
pub mod change;

pub use event::{EventType, EventValidation, FieldChange, TriggerEvent};

pub use condition::{
    evaluate_conditions, ConditionOperator, ConditionOutcome, ConditionSetOutcome,
    FieldCondition,
};

pub use rule::{AutomationRule, RuleId};

pub use dependency::{
    CycleReport, DependencyGraph, DependencyValidationError, GraphNode, RuleDependency,
    ValidationErrorType,
};

pub use action::{
    merge_config, ActionExecutionResult, ActionStatus, ActionTemplate, RuleAction,
    RuleExecutionResult, RuleStatus,
};

pub use execution::{
    BatchResult, BatchStatus, ExecutionBatch, ExecutionOrder, ExecutionPage, ExecutionPlan,
    ExecutionQuery, WorkflowExecution, WorkflowStatus,
};

pub use change::RuleChange;
