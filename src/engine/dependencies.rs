// Dependency resolution - turning matched rules into ordered batches

//! # Dependency Resolver
//!
//! Owns the cached [`DependencyGraph`] and everything that writes
//! dependencies:
//!
//! - **Reads**: [`DependencyResolver::calculate_batch_order`] groups matched
//!   rules by graph level. The graph is cached behind an `Arc` and replaced
//!   wholesale on rebuild, never mutated, so readers can keep using an old
//!   snapshot while a rebuild runs.
//! - **Writes**: [`DependencyResolver::add_dependencies`] validates a
//!   candidate set against a simulated copy of the current graph and only
//!   then commits it with one atomic storage call. Writes are serialized so
//!   two concurrent batches cannot form a cycle together.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::storage::AutomationStorage;
use crate::models::{
    CycleReport, DependencyGraph, DependencyValidationError, ExecutionBatch, RuleDependency, RuleId,
};
use crate::{AutomationError, Result};

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// How long a built graph is trusted
    pub cache_ttl: Duration,
    /// Baseline estimate for one rule
    pub per_rule_baseline_ms: u64,
    /// Discount applied to batch estimates
    pub parallel_efficiency: f64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(300),
            per_rule_baseline_ms: 100,
            parallel_efficiency: 0.7,
        }
    }
}

/// Matched rules grouped into level-ordered batches
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchOrder {
    pub batches: Vec<ExecutionBatch>,
    pub total_estimated_duration_ms: u64,
    /// Matched rules the graph does not know; scheduled at level 0
    pub unknown_rules: Vec<RuleId>,
}

struct CachedGraph {
    graph: Arc<DependencyGraph>,
    built_at: Instant,
}

pub struct DependencyResolver {
    storage: Arc<dyn AutomationStorage>,
    config: ResolverConfig,
    cache: RwLock<Option<CachedGraph>>,
    stale: AtomicBool,
    write_lock: Mutex<()>,
}

impl DependencyResolver {
    pub fn new(storage: Arc<dyn AutomationStorage>, config: ResolverConfig) -> Self {
        Self {
            storage,
            config,
            cache: RwLock::new(None),
            stale: AtomicBool::new(true),
            write_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    async fn load_graph(&self) -> Result<DependencyGraph> {
        let rules = self.storage.list_active_rules().await?;
        let dependencies = self.storage.list_dependencies().await?;
        Ok(DependencyGraph::build(
            rules.into_iter().map(|rule| rule.id),
            &dependencies,
        ))
    }

    /// Rebuild the graph from storage and replace the cached one
    ///
    /// The stale flag is cleared before loading, so an invalidation that
    /// lands while storage is being read keeps the new snapshot stale.
    pub async fn build_graph(&self) -> Result<Arc<DependencyGraph>> {
        self.stale.store(false, Ordering::SeqCst);
        let graph = match self.load_graph().await {
            Ok(graph) => Arc::new(graph),
            Err(e) => {
                self.invalidate();
                return Err(e);
            }
        };

        *self.cache.write().await = Some(CachedGraph {
            graph: graph.clone(),
            built_at: Instant::now(),
        });

        info!(
            rules = graph.len(),
            edges = graph.edge_count(),
            "Dependency graph built"
        );
        Ok(graph)
    }

    /// The cached graph, rebuilt when stale or expired
    pub async fn graph(&self) -> Result<Arc<DependencyGraph>> {
        if !self.stale.load(Ordering::SeqCst) {
            if let Some(cached) = self.cache.read().await.as_ref() {
                if cached.built_at.elapsed() < self.config.cache_ttl {
                    return Ok(cached.graph.clone());
                }
            }
        }
        self.build_graph().await
    }

    /// Mark the cached graph stale without touching storage
    pub fn invalidate(&self) {
        self.stale.store(true, Ordering::SeqCst);
    }

    /// Scan the persisted dependencies for cycles
    pub async fn detect_cycles(&self) -> Result<CycleReport> {
        let report = self.load_graph().await?.detect_cycles();
        if report.has_cycles {
            warn!(cycles = report.cycles.len(), affected = ?report.affected_rules, "Dependency cycles found");
        }
        Ok(report)
    }

    /// Validate candidates against the current persisted graph
    pub async fn validate_dependencies(&self, candidates: &[RuleDependency]) -> Result<Vec<DependencyValidationError>> {
        Ok(self.load_graph().await?.validate(candidates))
    }

    /// Validate and persist a batch of dependencies, all or nothing
    pub async fn add_dependencies(&self, candidates: Vec<RuleDependency>) -> Result<Vec<RuleDependency>> {
        let _guard = self.write_lock.lock().await;

        let errors = self.validate_dependencies(&candidates).await?;
        if !errors.is_empty() {
            for error in &errors {
                warn!(
                    parent = %error.parent_rule_id,
                    child = %error.child_rule_id,
                    error_type = ?error.error_type,
                    "{}",
                    error.message
                );
            }
            return Err(AutomationError::DependencyValidation(errors));
        }

        let created = self.storage.create_dependencies(candidates).await?;
        self.invalidate();
        info!(created = created.len(), "Dependencies added");
        Ok(created)
    }

    pub async fn remove_dependency(&self, parent: &RuleId, child: &RuleId) -> Result<bool> {
        let _guard = self.write_lock.lock().await;

        let removed = self.storage.delete_dependency(parent, child).await?;
        if removed {
            self.invalidate();
            info!(%parent, %child, "Dependency removed");
        }
        Ok(removed)
    }

    /// Group matched rules into batches by dependency level
    ///
    /// Levels come from the full active graph, so a rule whose parent did
    /// not match still waits for the parent's level. Empty levels are
    /// skipped and matched order is kept within a batch.
    pub async fn calculate_batch_order(&self, matched: &[RuleId]) -> Result<BatchOrder> {
        let graph = self.graph().await?;
        let mut levels: BTreeMap<usize, Vec<RuleId>> = BTreeMap::new();
        let mut unknown_rules = Vec::new();

        for rule_id in matched {
            if levels.values().any(|ids| ids.contains(rule_id)) {
                continue;
            }
            let level = match graph.level(rule_id) {
                Some(level) => level,
                None => {
                    unknown_rules.push(rule_id.clone());
                    0
                }
            };
            levels.entry(level).or_default().push(rule_id.clone());
        }

        if !unknown_rules.is_empty() {
            debug!(rules = ?unknown_rules, "Matched rules missing from dependency graph");
        }

        let batches: Vec<ExecutionBatch> = levels
            .into_iter()
            .enumerate()
            .map(|(index, (level, rule_ids))| {
                let estimate = self.estimate_duration_ms(rule_ids.len());
                ExecutionBatch::new(index + 1, level, rule_ids, estimate)
            })
            .collect();

        Ok(BatchOrder {
            total_estimated_duration_ms: batches.iter().map(|b| b.estimated_duration_ms).sum(),
            batches,
            unknown_rules,
        })
    }

    fn estimate_duration_ms(&self, rule_count: usize) -> u64 {
        let raw = rule_count as f64 * self.config.per_rule_baseline_ms as f64 * self.config.parallel_efficiency;
        raw.round().max(0.0) as u64
    }

    pub async fn rule_level(&self, rule_id: &RuleId) -> Result<Option<usize>> {
        Ok(self.graph().await?.level(rule_id))
    }

    pub async fn dependents(&self, rule_id: &RuleId) -> Result<Vec<RuleId>> {
        Ok(self.graph().await?.dependents(rule_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::storage::InMemoryStorage;
    use crate::models::{AutomationRule, EventType, ValidationErrorType};

    async fn resolver_with(rules: &[&str]) -> (Arc<InMemoryStorage>, DependencyResolver) {
        let storage = Arc::new(InMemoryStorage::new());
        for id in rules {
            storage
                .save_rule(AutomationRule::new(*id, *id, "order", EventType::OnCreate))
                .await
                .unwrap();
        }
        let resolver = DependencyResolver::new(storage.clone(), ResolverConfig::default());
        (storage, resolver)
    }

    fn ids(names: &[&str]) -> Vec<RuleId> {
        names.iter().map(|n| RuleId::from(*n)).collect()
    }

    #[tokio::test]
    async fn test_batches_follow_levels() {
        let (_, resolver) = resolver_with(&["A", "B", "C", "D"]).await;
        resolver
            .add_dependencies(vec![RuleDependency::new("A", "B"), RuleDependency::new("B", "C")])
            .await
            .unwrap();

        let order = resolver.calculate_batch_order(&ids(&["C", "D", "B", "A"])).await.unwrap();
        let batches: Vec<Vec<RuleId>> = order.batches.iter().map(|b| b.rule_ids.clone()).collect();

        assert_eq!(batches, vec![ids(&["D", "A"]), ids(&["B"]), ids(&["C"])]);
        assert!(order.batches[0].can_run_parallel);
        assert_eq!(order.batches[2].batch_number, 3);
        assert_eq!(order.batches[0].estimated_duration_ms, 140);
    }

    #[tokio::test]
    async fn test_empty_levels_are_skipped_and_unknown_rules_run_first() {
        let (_, resolver) = resolver_with(&["A", "B", "C"]).await;
        resolver
            .add_dependencies(vec![RuleDependency::new("A", "B"), RuleDependency::new("B", "C")])
            .await
            .unwrap();

        let order = resolver.calculate_batch_order(&ids(&["C", "ghost"])).await.unwrap();

        assert_eq!(order.batches.len(), 2);
        assert_eq!(order.batches[0].rule_ids, ids(&["ghost"]));
        assert_eq!(order.batches[1].dependency_level, 2);
        assert_eq!(order.unknown_rules, ids(&["ghost"]));
    }

    #[tokio::test]
    async fn test_rejected_batch_persists_nothing() {
        let (storage, resolver) = resolver_with(&["A", "B", "C"]).await;
        resolver
            .add_dependencies(vec![RuleDependency::new("A", "B"), RuleDependency::new("B", "C")])
            .await
            .unwrap();

        let err = resolver
            .add_dependencies(vec![RuleDependency::new("A", "C"), RuleDependency::new("C", "A")])
            .await
            .unwrap_err();

        match err {
            AutomationError::DependencyValidation(errors) => {
                assert_eq!(errors.len(), 1);
                assert_eq!(errors[0].error_type, ValidationErrorType::Cycle);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(storage.list_dependencies().await.unwrap().len(), 2);
        assert!(!resolver.detect_cycles().await.unwrap().has_cycles);
    }

    #[tokio::test]
    async fn test_inactive_rules_cannot_be_linked() {
        let (storage, resolver) = resolver_with(&["A"]).await;
        storage
            .save_rule(AutomationRule::new("B", "B", "order", EventType::OnCreate).inactive())
            .await
            .unwrap();

        let errors = resolver
            .validate_dependencies(&[RuleDependency::new("A", "B")])
            .await
            .unwrap();
        assert_eq!(errors[0].error_type, ValidationErrorType::MissingRule);
    }

    #[tokio::test]
    async fn test_graph_cache_invalidation() {
        let (storage, resolver) = resolver_with(&["A", "B"]).await;
        assert_eq!(resolver.rule_level(&"B".into()).await.unwrap(), Some(0));

        // Written behind the resolver's back: the cache does not see it yet
        storage
            .create_dependencies(vec![RuleDependency::new("A", "B")])
            .await
            .unwrap();
        assert_eq!(resolver.rule_level(&"B".into()).await.unwrap(), Some(0));

        resolver.invalidate();
        assert_eq!(resolver.rule_level(&"B".into()).await.unwrap(), Some(1));
        assert_eq!(resolver.dependents(&"A".into()).await.unwrap(), ids(&["B"]));

        assert!(resolver.remove_dependency(&"A".into(), &"B".into()).await.unwrap());
        assert_eq!(resolver.rule_level(&"B".into()).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_invalidation_during_rebuild_is_kept() {
        use crate::engine::storage::gated::GatedStorage;

        let storage = Arc::new(GatedStorage::new());
        for id in ["A", "B"] {
            storage
                .save_rule(AutomationRule::new(id, id, "order", EventType::OnCreate))
                .await
                .unwrap();
        }
        let resolver = Arc::new(DependencyResolver::new(storage.clone(), ResolverConfig::default()));

        // A reader loads the edge-less graph and is parked before installing it
        storage.hold_next_dependency_read();
        let reader = {
            let resolver = resolver.clone();
            tokio::spawn(async move { resolver.graph().await.map(|graph| graph.edge_count()) })
        };
        storage.read_held().await;

        resolver
            .add_dependencies(vec![RuleDependency::new("A", "B")])
            .await
            .unwrap();
        storage.release();
        assert_eq!(reader.await.unwrap().unwrap(), 0);

        let order = resolver.calculate_batch_order(&ids(&["A", "B"])).await.unwrap();
        let batches: Vec<Vec<RuleId>> = order.batches.iter().map(|b| b.rule_ids.clone()).collect();
        assert_eq!(batches, vec![ids(&["A"]), ids(&["B"])]);
    }
}
