// Rule Automation Engine
// This contains the matching, ordering, execution and ingestion layers

//! # Rule Automation Engine Module
//!
//! This module contains everything that acts on the domain models in
//! `models/`: persistence, trigger matching, dependency ordering, action
//! execution, templating and queue-based ingestion.
//!
//! ## Engine Components
//!
//! ### Storage (`storage` module)
//! - `AutomationStorage` trait: the persistence boundary
//! - In-memory implementation for development, tests and embedded mode
//! - JSON seed loading for the binaries
//!
//! ### Trigger Processor (`triggers` module)
//! - Validates events and matches them against cached active rules
//!
//! ### Dependency Resolver (`dependencies` module)
//! - Cached dependency graph, cycle detection, simulate-then-commit validation
//! - Groups matched rules into execution batches
//!
//! ### Action Executor (`actions` module)
//! - Handler registry, config merging, templating, retries, halting types
//!
//! ### Templates (`template` and `expression` modules)
//! - `{{ path | filter }}` substitution and `{{expr: ...}}` arithmetic
//!
//! ### Orchestrator (`orchestrator` module)
//! - `WorkflowEngine`: runs batches, tracks executions and statistics
//!
//! ### Ingestion (`queue`, `nats_queue` and `circuit_breaker` modules)
//! - Category routing, consumers with timeouts, broker transports
//! - Circuit breaker shared by producers and consumers
//!
//! ### Rule Changes (`events` module)
//! - Broadcast bus that tells the engine to drop its caches
//!
//! ## Rust Learning Notes:
//!
//! ### Module Organization Pattern
//! 1. Create a directory with the module name (`engine/`)
//! 2. Add a `mod.rs` file as the module root
//! 3. Declare submodules in `mod.rs`
//! 4. Re-export important types for clean API

pub mod actions;
pub mod circuit_breaker;
pub mod dependencies;
pub mod events;
pub mod expression;
pub mod nats_queue;
pub mod orchestrator;
pub mod queue;
pub mod storage;
pub mod template;
pub mod triggers;

pub use actions::{ActionExecutor, ActionExecutorConfig, ActionHandler, ExecutionContext, HandlerRegistry};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use dependencies::{BatchOrder, DependencyResolver, ResolverConfig};
pub use events::RuleChangeBus;
pub use orchestrator::{EngineConfig, EngineStats, WorkflowEngine};
pub use queue::{EventProcessor, QueueManager, QueueTransport};
pub use storage::{AutomationStorage, InMemoryStorage, StorageSeed};
