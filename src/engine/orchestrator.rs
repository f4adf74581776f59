// Workflow orchestration - event in, ordered rule execution out

//! # Workflow Engine
//!
//! The long-lived coordinator that turns one [`TriggerEvent`] into one
//! [`WorkflowExecution`]:
//!
//! 1. the [`TriggerProcessor`] finds the rules the event satisfies
//! 2. the [`DependencyResolver`] groups them into batches by dependency level
//! 3. batches run one after another; rules within a batch run concurrently
//!    (bounded by `max_parallel_rules`)
//! 4. each rule's actions run through the [`ActionExecutor`]
//!
//! A batch whose rules all failed halts the workflow when
//! `stop_on_critical_failure` is set. The time budget (`default_timeout`) and
//! cancellation are checked between batches; a rule that already started
//! always runs to completion.
//!
//! Construct one engine at startup and share it behind an `Arc`. Every piece
//! of mutable state (active executions, history, statistics) lives on the
//! instance, each behind its own lock.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::actions::{ActionExecutor, ActionExecutorConfig, ExecutionContext, HandlerRegistry};
use super::dependencies::{DependencyResolver, ResolverConfig};
use super::events::RuleChangeBus;
use super::queue::EventProcessor;
use super::storage::AutomationStorage;
use super::template::TemplateOptions;
use super::triggers::{TriggerProcessor, DEFAULT_RULE_CACHE_TTL};
use crate::models::{
    AutomationRule, BatchResult, BatchStatus, ExecutionBatch, ExecutionPage, ExecutionPlan,
    ExecutionQuery, RuleChange, RuleExecutionResult, RuleId, RuleStatus, TriggerEvent,
    WorkflowExecution, WorkflowStatus,
};
use crate::{AutomationError, Result};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on concurrently running rules within one batch
    pub max_parallel_rules: usize,
    /// Process-wide cap on concurrently running actions
    pub max_parallel_actions: usize,
    /// Time budget for one workflow, checked between batches
    pub default_timeout: Duration,
    pub retry_failed_actions: bool,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    /// Halt the workflow after a batch in which every rule failed
    pub stop_on_critical_failure: bool,
    /// Finished executions kept in memory
    pub history_limit: usize,
    pub halting_action_types: Vec<String>,
    pub rule_cache_ttl: Duration,
    pub resolver: ResolverConfig,
    pub template: TemplateOptions,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_rules: 5,
            max_parallel_actions: 10,
            default_timeout: Duration::from_secs(300),
            retry_failed_actions: true,
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            stop_on_critical_failure: true,
            history_limit: 1000,
            halting_action_types: vec!["seek_approval".to_string()],
            rule_cache_ttl: DEFAULT_RULE_CACHE_TTL,
            resolver: ResolverConfig::default(),
            template: TemplateOptions::default(),
        }
    }
}

impl EngineConfig {
    pub fn executor_config(&self) -> ActionExecutorConfig {
        ActionExecutorConfig {
            retry_failed_actions: self.retry_failed_actions,
            max_retries: self.max_retries,
            retry_base_delay: self.retry_base_delay,
            max_parallel_actions: self.max_parallel_actions,
            halting_action_types: self.halting_action_types.clone(),
            template: self.template.clone(),
        }
    }
}

/// Running totals over finished executions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    pub total_executions: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub rules_executed: u64,
    pub actions_executed: u64,
    pub average_duration_ms: f64,
    pub last_execution_at: Option<DateTime<Utc>>,
}

impl EngineStats {
    fn record(&mut self, execution: &WorkflowExecution) {
        self.total_executions += 1;
        match execution.status {
            WorkflowStatus::Completed => self.completed += 1,
            WorkflowStatus::Failed => self.failed += 1,
            WorkflowStatus::Cancelled => self.cancelled += 1,
            WorkflowStatus::Pending | WorkflowStatus::Running => {}
        }
        self.rules_executed += execution.rules_executed() as u64;
        self.actions_executed += execution.actions_executed() as u64;

        let duration = execution.duration_ms.unwrap_or_default() as f64;
        self.average_duration_ms += (duration - self.average_duration_ms) / self.total_executions as f64;
        self.last_execution_at = execution.completed_at.or(Some(Utc::now()));
    }
}

pub struct WorkflowEngine {
    storage: Arc<dyn AutomationStorage>,
    triggers: TriggerProcessor,
    resolver: DependencyResolver,
    executor: ActionExecutor,
    config: EngineConfig,
    active: RwLock<HashMap<String, WorkflowExecution>>,
    history: RwLock<VecDeque<WorkflowExecution>>,
    stats: RwLock<EngineStats>,
}

impl WorkflowEngine {
    pub fn new(storage: Arc<dyn AutomationStorage>, registry: HandlerRegistry, config: EngineConfig) -> Result<Self> {
        let triggers = TriggerProcessor::with_ttl(storage.clone(), config.rule_cache_ttl);
        let resolver = DependencyResolver::new(storage.clone(), config.resolver.clone());
        let executor = ActionExecutor::new(storage.clone(), registry, config.executor_config())?;

        Ok(Self {
            storage,
            triggers,
            resolver,
            executor,
            config,
            active: RwLock::new(HashMap::new()),
            history: RwLock::new(VecDeque::new()),
            stats: RwLock::new(EngineStats::default()),
        })
    }

    /// Warm the rule cache and the dependency graph
    pub async fn initialize(&self) -> Result<()> {
        self.triggers.initialize().await?;
        let graph = self.resolver.build_graph().await?;
        info!(
            rules = graph.len(),
            dependencies = graph.edge_count(),
            handlers = ?self.executor.registry().action_types(),
            "Workflow engine initialized"
        );
        Ok(())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn AutomationStorage> {
        &self.storage
    }

    pub fn triggers(&self) -> &TriggerProcessor {
        &self.triggers
    }

    pub fn resolver(&self) -> &DependencyResolver {
        &self.resolver
    }

    pub fn registry(&self) -> &HandlerRegistry {
        self.executor.registry()
    }

    /// Match and order rules for an event without running anything
    pub async fn plan_workflow(&self, event: &TriggerEvent) -> Result<ExecutionPlan> {
        let matched = self.triggers.process_event(event).await?;
        if matched.matched_rules.is_empty() {
            return Ok(ExecutionPlan::empty(event.clone()));
        }
        let order = self.resolver.calculate_batch_order(&matched.rule_ids()).await?;
        Ok(ExecutionPlan::new(event.clone(), matched.matched_rules.len(), order.batches))
    }

    /// Run the full pipeline for one event
    ///
    /// Invalid events are rejected with [`AutomationError::InvalidEvent`];
    /// everything that goes wrong past that point is recorded in the
    /// returned execution's statuses.
    pub async fn execute_workflow(&self, event: TriggerEvent) -> Result<WorkflowExecution> {
        let timer = Instant::now();
        let matched = self.triggers.process_event(&event).await?;

        if matched.matched_rules.is_empty() {
            let mut execution = WorkflowExecution::new(event.clone(), ExecutionPlan::empty(event));
            execution.notes.push("no rules matched".to_string());
            execution.finish(WorkflowStatus::Completed);
            debug!(execution_id = %execution.id, "No rules matched, nothing to execute");
            self.record_finished(&execution).await;
            return Ok(execution);
        }

        let order = self.resolver.calculate_batch_order(&matched.rule_ids()).await?;
        let plan = ExecutionPlan::new(event.clone(), matched.matched_rules.len(), order.batches);
        let rules: HashMap<RuleId, AutomationRule> = matched
            .matched_rules
            .into_iter()
            .map(|m| (m.rule.id.clone(), m.rule))
            .collect();

        let mut execution = WorkflowExecution::new(event.clone(), plan);
        execution.status = WorkflowStatus::Running;
        for error in &matched.errors {
            execution.notes.push(error.clone());
        }
        self.active.write().await.insert(execution.id.clone(), execution.clone());

        info!(
            execution_id = %execution.id,
            entity = %event.entity_name,
            entity_id = %event.entity_id,
            rules = rules.len(),
            batches = execution.plan.batches.len(),
            "Workflow started"
        );

        let context = ExecutionContext {
            execution_id: execution.id.clone(),
            event: Arc::new(event),
        };

        let batches = execution.plan.batches.clone();
        let mut halted = false;
        let mut timed_out = false;
        let mut cancelled = false;

        for (index, batch) in batches.iter().enumerate() {
            if !self.active.read().await.contains_key(&execution.id) {
                cancelled = true;
                break;
            }
            if timer.elapsed() > self.config.default_timeout {
                timed_out = true;
                execution.notes.push(format!(
                    "time budget of {}s exceeded before batch {}; {} batch(es) not executed",
                    self.config.default_timeout.as_secs(),
                    batch.batch_number,
                    batches.len() - index
                ));
                break;
            }

            let result = self.run_batch(batch, &rules, &context).await;
            let batch_failed = result.status == BatchStatus::Failed;
            execution.batch_results.push(result);

            if let Some(entry) = self.active.write().await.get_mut(&execution.id) {
                entry.batch_results = execution.batch_results.clone();
            }

            if batch_failed && self.config.stop_on_critical_failure {
                halted = true;
                let remaining = batches.len() - index - 1;
                execution.notes.push(format!(
                    "halted after batch {} failed; {} batch(es) not executed",
                    batch.batch_number, remaining
                ));
                warn!(execution_id = %execution.id, batch = batch.batch_number, remaining, "Workflow halted");
                break;
            }
        }

        let still_active = self.active.write().await.remove(&execution.id).is_some();
        if cancelled || !still_active {
            return Ok(self.finish_cancelled(execution).await);
        }

        let any_failed = execution
            .batch_results
            .iter()
            .any(|b| b.status == BatchStatus::Failed);
        let status = if halted || timed_out || any_failed {
            WorkflowStatus::Failed
        } else {
            WorkflowStatus::Completed
        };
        execution.finish(status);
        self.record_finished(&execution).await;

        info!(
            execution_id = %execution.id,
            status = %execution.status,
            rules = execution.rules_executed(),
            actions = execution.actions_executed(),
            duration_ms = execution.duration_ms.unwrap_or_default(),
            "Workflow finished"
        );
        Ok(execution)
    }

    async fn run_batch(
        &self,
        batch: &ExecutionBatch,
        rules: &HashMap<RuleId, AutomationRule>,
        context: &ExecutionContext,
    ) -> BatchResult {
        let started_at = Utc::now();
        let timer = Instant::now();

        let rule_results = if batch.rule_ids.len() <= 1 {
            let mut results = Vec::with_capacity(1);
            for rule_id in &batch.rule_ids {
                results.push(self.run_rule(rule_id, rules, context).await);
            }
            results
        } else {
            let permits = self.config.max_parallel_rules.min(batch.rule_ids.len()).max(1);
            let semaphore = Arc::new(Semaphore::new(permits));
            let runs = batch.rule_ids.iter().map(|rule_id| {
                let semaphore = semaphore.clone();
                async move {
                    let _permit = semaphore.acquire().await.ok();
                    self.run_rule(rule_id, rules, context).await
                }
            });
            futures::future::join_all(runs).await
        };

        let status = BatchStatus::aggregate(&rule_results);
        debug!(
            execution_id = %context.execution_id,
            batch = batch.batch_number,
            level = batch.dependency_level,
            rules = rule_results.len(),
            status = ?status,
            "Batch finished"
        );

        BatchResult {
            batch_number: batch.batch_number,
            status,
            rule_results,
            started_at,
            duration_ms: timer.elapsed().as_millis() as u64,
        }
    }

    async fn run_rule(
        &self,
        rule_id: &RuleId,
        rules: &HashMap<RuleId, AutomationRule>,
        context: &ExecutionContext,
    ) -> RuleExecutionResult {
        match rules.get(rule_id) {
            Some(rule) => self.executor.execute_rule_actions(rule, context).await,
            None => {
                error!(rule_id = %rule_id, "Planned rule missing from matched set");
                let now = Utc::now();
                RuleExecutionResult {
                    rule_id: rule_id.clone(),
                    rule_name: String::new(),
                    status: RuleStatus::Failed,
                    action_results: Vec::new(),
                    error: Some("rule not found in matched set".to_string()),
                    halted: false,
                    started_at: now,
                    completed_at: now,
                    duration_ms: 0,
                }
            }
        }
    }

    /// Stop an active execution between batches
    pub async fn cancel_workflow(&self, execution_id: &str) -> Result<WorkflowExecution> {
        let mut execution = self
            .active
            .write()
            .await
            .remove(execution_id)
            .ok_or_else(|| AutomationError::NotFound(format!("active execution {}", execution_id)))?;

        execution.notes.push("cancelled by request".to_string());
        execution.finish(WorkflowStatus::Cancelled);
        self.record_finished(&execution).await;

        info!(execution_id = %execution_id, "Workflow cancelled");
        Ok(execution)
    }

    /// Reconcile the running copy with the snapshot `cancel_workflow` stored
    async fn finish_cancelled(&self, mut execution: WorkflowExecution) -> WorkflowExecution {
        let mut history = self.history.write().await;
        match history.iter_mut().find(|e| e.id == execution.id) {
            Some(snapshot) => {
                for note in &snapshot.notes {
                    if !execution.notes.contains(note) {
                        execution.notes.push(note.clone());
                    }
                }
                execution.status = WorkflowStatus::Cancelled;
                execution.completed_at = snapshot.completed_at;
                execution.duration_ms = snapshot.duration_ms;
                *snapshot = execution.clone();
            }
            None => execution.finish(WorkflowStatus::Cancelled),
        }
        drop(history);

        self.persist(&execution).await;
        info!(
            execution_id = %execution.id,
            batches_run = execution.batch_results.len(),
            "Cancelled workflow stopped"
        );
        execution
    }

    async fn record_finished(&self, execution: &WorkflowExecution) {
        {
            let mut history = self.history.write().await;
            history.push_back(execution.clone());
            while history.len() > self.config.history_limit {
                history.pop_front();
            }
        }
        self.stats.write().await.record(execution);
        self.persist(execution).await;
    }

    async fn persist(&self, execution: &WorkflowExecution) {
        if let Err(e) = self.storage.save_execution(execution).await {
            error!(execution_id = %execution.id, error = %e, "Failed to persist execution");
        }
    }

    /// Active or recently finished execution
    pub async fn get_execution(&self, execution_id: &str) -> Option<WorkflowExecution> {
        if let Some(execution) = self.active.read().await.get(execution_id) {
            return Some(execution.clone());
        }
        self.history
            .read()
            .await
            .iter()
            .rev()
            .find(|e| e.id == execution_id)
            .cloned()
    }

    pub async fn active_executions(&self) -> Vec<WorkflowExecution> {
        let mut active: Vec<_> = self.active.read().await.values().cloned().collect();
        active.sort_by_key(|e| e.started_at);
        active
    }

    /// Finished executions, newest first
    pub async fn history(&self, limit: Option<usize>) -> Vec<WorkflowExecution> {
        let history = self.history.read().await;
        let limit = limit.unwrap_or(history.len());
        history.iter().rev().take(limit).cloned().collect()
    }

    pub async fn stats(&self) -> EngineStats {
        self.stats.read().await.clone()
    }

    pub async fn query_executions(&self, query: &ExecutionQuery) -> Result<ExecutionPage> {
        self.storage.query_executions(query).await
    }

    /// Clear executions, history and statistics, and drop caches
    pub async fn reset_for_tests(&self) {
        self.active.write().await.clear();
        self.history.write().await.clear();
        *self.stats.write().await = EngineStats::default();
        self.triggers.invalidate();
        self.resolver.invalidate();
    }

    pub fn handle_rule_change(&self, change: &RuleChange) {
        debug!(rule_id = %change.rule_id(), kind = change.kind(), "Rule changed, dropping caches");
        self.triggers.invalidate();
        self.resolver.invalidate();
    }

    /// Invalidate caches whenever the bus reports a rule change
    pub fn spawn_rule_change_listener(self: &Arc<Self>, bus: &RuleChangeBus) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let mut receiver = bus.subscribe();
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(change) => engine.handle_rule_change(&change),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Rule change listener lagged, dropping caches");
                        engine.triggers.invalidate();
                        engine.resolver.invalidate();
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Rule change bus closed");
                        break;
                    }
                }
            }
        })
    }
}

#[async_trait]
impl EventProcessor for WorkflowEngine {
    async fn process(&self, event: TriggerEvent) -> Result<()> {
        let execution = self.execute_workflow(event).await?;
        if execution.status == WorkflowStatus::Failed {
            // Redelivery would re-run rules that already succeeded
            warn!(execution_id = %execution.id, "Workflow failed; not requesting redelivery");
        }
        Ok(())
    }
}
