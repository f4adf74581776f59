// Execution plans, workflow executions and read-side queries

//! # Execution Model
//!
//! The resolver turns matched rules into an [`ExecutionPlan`]; the engine
//! runs the plan and records everything in a [`WorkflowExecution`]:
//!
//! ```text
//! WorkflowExecution
//!   └── BatchResult (one per executed batch, ascending level)
//!         └── RuleExecutionResult (one per rule in the batch)
//!               └── ActionExecutionResult (one per action, execution_order)
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::action::RuleExecutionResult;
use super::event::TriggerEvent;
use super::rule::RuleId;

/// Rules that may run together
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionBatch {
    pub batch_number: usize,
    pub rule_ids: Vec<RuleId>,
    pub can_run_parallel: bool,
    pub dependency_level: usize,
    pub estimated_duration_ms: u64,
}

impl ExecutionBatch {
    pub fn new(batch_number: usize, dependency_level: usize, rule_ids: Vec<RuleId>, estimated_duration_ms: u64) -> Self {
        Self {
            batch_number,
            can_run_parallel: rule_ids.len() > 1,
            rule_ids,
            dependency_level,
            estimated_duration_ms,
        }
    }
}

/// Ordered batches for one event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub event: TriggerEvent,
    pub matched_rule_count: usize,
    pub batches: Vec<ExecutionBatch>,
    pub total_estimated_duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

impl ExecutionPlan {
    pub fn new(event: TriggerEvent, matched_rule_count: usize, batches: Vec<ExecutionBatch>) -> Self {
        let total_estimated_duration_ms = batches.iter().map(|b| b.estimated_duration_ms).sum();
        Self {
            event,
            matched_rule_count,
            batches,
            total_estimated_duration_ms,
            created_at: Utc::now(),
        }
    }

    pub fn empty(event: TriggerEvent) -> Self {
        Self::new(event, 0, Vec::new())
    }

    pub fn contains_rule(&self, rule_id: &RuleId) -> bool {
        self.batches.iter().any(|b| b.rule_ids.contains(rule_id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Every rule succeeded
    Completed,
    /// Every rule failed
    Failed,
    /// Some rules failed
    Partial,
}

impl BatchStatus {
    /// Aggregate rule outcomes; an empty batch counts as completed
    pub fn aggregate(results: &[RuleExecutionResult]) -> Self {
        let failed = results.iter().filter(|r| !r.succeeded()).count();
        if failed == 0 {
            BatchStatus::Completed
        } else if failed == results.len() {
            BatchStatus::Failed
        } else {
            BatchStatus::Partial
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub batch_number: usize,
    pub status: BatchStatus,
    pub rule_results: Vec<RuleExecutionResult>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", name)
    }
}

/// One run of the pipeline for one event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: String,
    pub event: TriggerEvent,
    pub plan: ExecutionPlan,
    pub status: WorkflowStatus,
    pub batch_results: Vec<BatchResult>,
    pub notes: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

impl WorkflowExecution {
    pub fn new(event: TriggerEvent, plan: ExecutionPlan) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event,
            plan,
            status: WorkflowStatus::Pending,
            batch_results: Vec::new(),
            notes: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
        }
    }

    /// Stamp completion time and duration
    pub fn finish(&mut self, status: WorkflowStatus) {
        let now = Utc::now();
        self.status = status;
        self.completed_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds().max(0) as u64);
    }

    pub fn rule_results(&self) -> impl Iterator<Item = &RuleExecutionResult> {
        self.batch_results.iter().flat_map(|b| b.rule_results.iter())
    }

    pub fn rules_executed(&self) -> usize {
        self.rule_results().count()
    }

    pub fn actions_executed(&self) -> usize {
        self.rule_results().map(|r| r.executed_actions()).sum()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOrder {
    #[default]
    NewestFirst,
    OldestFirst,
}

/// Read-side filter over persisted executions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionQuery {
    pub execution_id: Option<String>,
    pub rule_id: Option<RuleId>,
    pub status: Option<WorkflowStatus>,
    /// Trigger source, matched against the event's entity name
    pub entity_name: Option<String>,
    pub started_after: Option<DateTime<Utc>>,
    pub started_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub offset: usize,
    pub limit: Option<usize>,
    #[serde(default)]
    pub order: ExecutionOrder,
}

impl ExecutionQuery {
    pub fn matches(&self, execution: &WorkflowExecution) -> bool {
        if let Some(id) = &self.execution_id {
            if &execution.id != id {
                return false;
            }
        }
        if let Some(rule_id) = &self.rule_id {
            if !execution.plan.contains_rule(rule_id) {
                return false;
            }
        }
        if let Some(status) = self.status {
            if execution.status != status {
                return false;
            }
        }
        if let Some(entity_name) = &self.entity_name {
            if !execution.event.entity_name.eq_ignore_ascii_case(entity_name) {
                return false;
            }
        }
        if let Some(after) = self.started_after {
            if execution.started_at < after {
                return false;
            }
        }
        if let Some(before) = self.started_before {
            if execution.started_at > before {
                return false;
            }
        }
        true
    }

    /// Filter, order and paginate an unordered set of executions
    pub fn apply<'a>(&self, executions: impl IntoIterator<Item = &'a WorkflowExecution>) -> ExecutionPage {
        let mut matching: Vec<WorkflowExecution> = executions
            .into_iter()
            .filter(|e| self.matches(e))
            .cloned()
            .collect();

        matching.sort_by_key(|e| e.started_at);
        if self.order == ExecutionOrder::NewestFirst {
            matching.reverse();
        }

        let total = matching.len();
        let executions = matching
            .into_iter()
            .skip(self.offset)
            .take(self.limit.unwrap_or(usize::MAX))
            .collect();

        ExecutionPage {
            executions,
            total,
            offset: self.offset,
            limit: self.limit,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPage {
    pub executions: Vec<WorkflowExecution>,
    /// Matching executions before pagination
    pub total: usize,
    pub offset: usize,
    pub limit: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn execution(entity: &str, status: WorkflowStatus, minutes_ago: i64) -> WorkflowExecution {
        let event = TriggerEvent::created(entity, "1");
        let plan = ExecutionPlan::new(
            event.clone(),
            1,
            vec![ExecutionBatch::new(1, 0, vec![RuleId::from("r1")], 100)],
        );
        let mut execution = WorkflowExecution::new(event, plan);
        execution.started_at = Utc::now() - Duration::minutes(minutes_ago);
        execution.status = status;
        execution
    }

    #[test]
    fn test_batch_parallel_flag() {
        assert!(!ExecutionBatch::new(1, 0, vec!["a".into()], 0).can_run_parallel);
        assert!(ExecutionBatch::new(1, 0, vec!["a".into(), "b".into()], 0).can_run_parallel);
    }

    #[test]
    fn test_query_filters_and_paginates() {
        let executions = vec![
            execution("order", WorkflowStatus::Completed, 30),
            execution("order", WorkflowStatus::Failed, 20),
            execution("order", WorkflowStatus::Completed, 10),
            execution("invoice", WorkflowStatus::Completed, 5),
        ];

        let query = ExecutionQuery {
            entity_name: Some("order".to_string()),
            status: Some(WorkflowStatus::Completed),
            ..Default::default()
        };
        let page = query.apply(&executions);
        assert_eq!(page.total, 2);
        assert_eq!(page.executions[0].id, executions[2].id);

        let query = ExecutionQuery {
            rule_id: Some("r1".into()),
            order: ExecutionOrder::OldestFirst,
            offset: 1,
            limit: Some(2),
            ..Default::default()
        };
        let page = query.apply(&executions);
        assert_eq!(page.total, 4);
        assert_eq!(page.executions.len(), 2);
        assert_eq!(page.executions[0].id, executions[1].id);
    }
}
