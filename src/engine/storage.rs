// Storage abstraction for the automation engine
// This defines the interface for persisting rules, actions and executions

//! # Storage Abstraction Layer
//!
//! The engine never talks to a database directly. Everything it reads or
//! writes goes through [`AutomationStorage`], and [`InMemoryStorage`] is the
//! implementation used by tests, the admin dry-run commands and the embedded
//! worker.
//!
//! ## Atomic Dependency Writes
//!
//! `create_dependencies` is all-or-nothing. The dependency resolver validates
//! a whole candidate set against a simulated graph and then commits it with a
//! single call, so a backend must never leave half of a batch behind.
//!
//! ## Rust Learning Notes:
//!
//! ### tokio::sync::RwLock
//! The in-memory maps sit behind `tokio::sync::RwLock`. Unlike the std lock
//! it cannot be poisoned, so no `unwrap()` is needed on `read()`/`write()`,
//! and waiting for it yields to the runtime instead of blocking a thread.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::models::{
    ActionTemplate, AutomationRule, ExecutionPage, ExecutionQuery, RuleAction, RuleDependency,
    RuleId, WorkflowExecution,
};
use crate::Result;

/// Persistence boundary for everything the engine reads or writes
#[async_trait::async_trait]
pub trait AutomationStorage: Send + Sync {
    /// Insert or replace a rule
    async fn save_rule(&self, rule: AutomationRule) -> Result<AutomationRule>;

    async fn get_rule(&self, id: &RuleId) -> Result<Option<AutomationRule>>;

    /// Returns `false` when the rule did not exist
    async fn delete_rule(&self, id: &RuleId) -> Result<bool>;

    async fn list_rules(&self) -> Result<Vec<AutomationRule>>;

    async fn list_active_rules(&self) -> Result<Vec<AutomationRule>>;

    async fn save_action(&self, action: RuleAction) -> Result<RuleAction>;

    /// Actions of a rule, ascending `execution_order`
    async fn list_actions_for_rule(&self, rule_id: &RuleId) -> Result<Vec<RuleAction>>;

    async fn save_template(&self, template: ActionTemplate) -> Result<ActionTemplate>;

    async fn get_template(&self, id: &str) -> Result<Option<ActionTemplate>>;

    async fn list_dependencies(&self) -> Result<Vec<RuleDependency>>;

    /// Persist a batch of dependencies atomically
    ///
    /// Edges that already exist are skipped; the newly stored ones are
    /// returned.
    async fn create_dependencies(&self, dependencies: Vec<RuleDependency>) -> Result<Vec<RuleDependency>>;

    /// Returns `false` when the edge did not exist
    async fn delete_dependency(&self, parent: &RuleId, child: &RuleId) -> Result<bool>;

    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<()>;

    async fn get_execution(&self, id: &str) -> Result<Option<WorkflowExecution>>;

    async fn query_executions(&self, query: &ExecutionQuery) -> Result<ExecutionPage>;
}

/// In-memory storage for development, tests and embedded mode
#[derive(Default)]
pub struct InMemoryStorage {
    rules: RwLock<HashMap<RuleId, AutomationRule>>,
    actions: RwLock<HashMap<String, RuleAction>>,
    templates: RwLock<HashMap<String, ActionTemplate>>,
    dependencies: RwLock<Vec<RuleDependency>>,
    executions: RwLock<HashMap<String, WorkflowExecution>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl AutomationStorage for InMemoryStorage {
    async fn save_rule(&self, rule: AutomationRule) -> Result<AutomationRule> {
        let mut rules = self.rules.write().await;
        rules.insert(rule.id.clone(), rule.clone());
        Ok(rule)
    }

    async fn get_rule(&self, id: &RuleId) -> Result<Option<AutomationRule>> {
        Ok(self.rules.read().await.get(id).cloned())
    }

    async fn delete_rule(&self, id: &RuleId) -> Result<bool> {
        let removed = self.rules.write().await.remove(id).is_some();
        if removed {
            // Rule-owned rows go with the rule
            self.actions.write().await.retain(|_, action| &action.rule_id != id);
            self.dependencies
                .write()
                .await
                .retain(|dep| &dep.parent_rule_id != id && &dep.child_rule_id != id);
        }
        Ok(removed)
    }

    async fn list_rules(&self) -> Result<Vec<AutomationRule>> {
        let mut rules: Vec<AutomationRule> = self.rules.read().await.values().cloned().collect();
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(rules)
    }

    async fn list_active_rules(&self) -> Result<Vec<AutomationRule>> {
        let mut rules: Vec<AutomationRule> = self
            .rules
            .read()
            .await
            .values()
            .filter(|rule| rule.is_active)
            .cloned()
            .collect();
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(rules)
    }

    async fn save_action(&self, action: RuleAction) -> Result<RuleAction> {
        self.actions.write().await.insert(action.id.clone(), action.clone());
        Ok(action)
    }

    async fn list_actions_for_rule(&self, rule_id: &RuleId) -> Result<Vec<RuleAction>> {
        let mut actions: Vec<RuleAction> = self
            .actions
            .read()
            .await
            .values()
            .filter(|action| &action.rule_id == rule_id)
            .cloned()
            .collect();
        actions.sort_by(|a, b| a.execution_order.cmp(&b.execution_order).then_with(|| a.id.cmp(&b.id)));
        Ok(actions)
    }

    async fn save_template(&self, template: ActionTemplate) -> Result<ActionTemplate> {
        self.templates.write().await.insert(template.id.clone(), template.clone());
        Ok(template)
    }

    async fn get_template(&self, id: &str) -> Result<Option<ActionTemplate>> {
        Ok(self.templates.read().await.get(id).cloned())
    }

    async fn list_dependencies(&self) -> Result<Vec<RuleDependency>> {
        Ok(self.dependencies.read().await.clone())
    }

    async fn create_dependencies(&self, dependencies: Vec<RuleDependency>) -> Result<Vec<RuleDependency>> {
        // One write guard for the whole batch
        let mut stored = self.dependencies.write().await;
        let mut created = Vec::with_capacity(dependencies.len());

        for dependency in dependencies {
            let exists = stored.iter().any(|d| d.same_edge(&dependency))
                || created.iter().any(|d: &RuleDependency| d.same_edge(&dependency));
            if !exists {
                created.push(dependency);
            }
        }

        stored.extend(created.iter().cloned());
        Ok(created)
    }

    async fn delete_dependency(&self, parent: &RuleId, child: &RuleId) -> Result<bool> {
        let mut stored = self.dependencies.write().await;
        let before = stored.len();
        stored.retain(|d| !(&d.parent_rule_id == parent && &d.child_rule_id == child));
        Ok(stored.len() != before)
    }

    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<()> {
        self.executions
            .write()
            .await
            .insert(execution.id.clone(), execution.clone());
        Ok(())
    }

    async fn get_execution(&self, id: &str) -> Result<Option<WorkflowExecution>> {
        Ok(self.executions.read().await.get(id).cloned())
    }

    async fn query_executions(&self, query: &ExecutionQuery) -> Result<ExecutionPage> {
        let executions = self.executions.read().await;
        Ok(query.apply(executions.values()))
    }
}

/// Rules, actions, templates and dependencies loaded from a JSON file
///
/// Used by the binaries to populate an [`InMemoryStorage`]. Dependencies are
/// handed back instead of stored so the caller can push them through the
/// dependency resolver's validation.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct StorageSeed {
    #[serde(default)]
    pub rules: Vec<AutomationRule>,
    #[serde(default)]
    pub actions: Vec<RuleAction>,
    #[serde(default)]
    pub templates: Vec<ActionTemplate>,
    #[serde(default)]
    pub dependencies: Vec<RuleDependency>,
}

impl StorageSeed {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read seed file {}: {}", path.display(), e))?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Store rules, actions and templates; return the dependencies
    pub async fn load_into(self, storage: &dyn AutomationStorage) -> Result<Vec<RuleDependency>> {
        for rule in self.rules {
            storage.save_rule(rule).await?;
        }
        for template in self.templates {
            storage.save_template(template).await?;
        }
        for action in self.actions {
            storage.save_action(action).await?;
        }
        Ok(self.dependencies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EventType;
    use serde_json::json;

    #[tokio::test]
    async fn test_actions_are_ordered() {
        let storage = InMemoryStorage::new();
        storage.save_action(RuleAction::new("a3", "r1", "log", 3, json!({}))).await.unwrap();
        storage.save_action(RuleAction::new("a1", "r1", "log", 1, json!({}))).await.unwrap();
        storage.save_action(RuleAction::new("a2", "r1", "log", 2, json!({}))).await.unwrap();
        storage.save_action(RuleAction::new("b1", "r2", "log", 0, json!({}))).await.unwrap();

        let actions = storage.list_actions_for_rule(&"r1".into()).await.unwrap();
        let ids: Vec<&str> = actions.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["a1", "a2", "a3"]);
    }

    #[tokio::test]
    async fn test_active_rule_listing() {
        let storage = InMemoryStorage::new();
        storage
            .save_rule(AutomationRule::new("r1", "One", "order", EventType::OnCreate))
            .await
            .unwrap();
        storage
            .save_rule(AutomationRule::new("r2", "Two", "order", EventType::OnCreate).inactive())
            .await
            .unwrap();

        assert_eq!(storage.list_rules().await.unwrap().len(), 2);
        let active = storage.list_active_rules().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, RuleId::from("r1"));
    }

    #[tokio::test]
    async fn test_create_dependencies_skips_existing_edges() {
        let storage = InMemoryStorage::new();
        storage
            .create_dependencies(vec![RuleDependency::new("a", "b")])
            .await
            .unwrap();

        let created = storage
            .create_dependencies(vec![
                RuleDependency::new("a", "b"),
                RuleDependency::new("b", "c"),
                RuleDependency::new("b", "c"),
            ])
            .await
            .unwrap();

        assert_eq!(created.len(), 1);
        assert_eq!(storage.list_dependencies().await.unwrap().len(), 2);
        assert!(storage.delete_dependency(&"a".into(), &"b".into()).await.unwrap());
        assert!(!storage.delete_dependency(&"a".into(), &"b".into()).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_rule_cascades() {
        let storage = InMemoryStorage::new();
        storage
            .save_rule(AutomationRule::new("r1", "One", "order", EventType::OnCreate))
            .await
            .unwrap();
        storage.save_action(RuleAction::new("a1", "r1", "log", 1, json!({}))).await.unwrap();
        storage
            .create_dependencies(vec![RuleDependency::new("r1", "r2")])
            .await
            .unwrap();

        assert!(storage.delete_rule(&"r1".into()).await.unwrap());
        assert!(storage.list_actions_for_rule(&"r1".into()).await.unwrap().is_empty());
        assert!(storage.list_dependencies().await.unwrap().is_empty());
    }

    #[test]
    fn test_seed_returns_dependencies_unstored() {
        let seed: StorageSeed = serde_json::from_value(json!({
            "rules": [
                {"id": "r1", "name": "One", "entity_name": "order", "trigger_type": "on_create"},
                {"id": "r2", "name": "Two", "entity_name": "order", "trigger_type": "on_create", "is_active": false}
            ],
            "actions": [
                {"id": "a1", "rule_id": "r1", "action_type": "log", "action_config": {"message": "hi"}}
            ],
            "dependencies": [
                {"parent_rule_id": "r1", "child_rule_id": "r2"}
            ]
        }))
        .unwrap();

        tokio_test::block_on(async {
            let storage = InMemoryStorage::new();
            let dependencies = seed.load_into(&storage).await.unwrap();

            assert_eq!(dependencies.len(), 1);
            assert!(!dependencies[0].id.is_empty());
            assert!(storage.list_dependencies().await.unwrap().is_empty());
            assert_eq!(storage.list_rules().await.unwrap().len(), 2);
            assert_eq!(storage.list_active_rules().await.unwrap().len(), 1);
            assert_eq!(storage.list_actions_for_rule(&"r1".into()).await.unwrap().len(), 1);
        });
    }
}
