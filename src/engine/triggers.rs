// Trigger processing - which rules does an event wake up?

//! # Trigger Processor
//!
//! Matches a [`TriggerEvent`] against the active rules:
//!
//! 1. validate the event (entity name, entity id and timestamp are required)
//! 2. refresh the rule cache if it expired or was invalidated
//! 3. keep rules for the same entity and event type
//! 4. evaluate each candidate's conditions (AND semantics)
//!
//! Active rules are cached for `cache_ttl` (5 minutes by default). A
//! rule-change notification calls [`TriggerProcessor::invalidate`], which only
//! flips a flag; the next event pays for the reload.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::storage::AutomationStorage;
use crate::models::{AutomationRule, TriggerEvent};
use crate::{AutomationError, Result};

pub const DEFAULT_RULE_CACHE_TTL: Duration = Duration::from_secs(300);

/// A rule that matched, with the reasons its conditions gave
#[derive(Debug, Clone)]
pub struct MatchedRule {
    pub rule: AutomationRule,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TriggerMatchResult {
    pub matched_rules: Vec<MatchedRule>,
    /// Candidates whose conditions were evaluated
    pub evaluated_count: usize,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl TriggerMatchResult {
    pub fn rule_ids(&self) -> Vec<crate::models::RuleId> {
        self.matched_rules.iter().map(|m| m.rule.id.clone()).collect()
    }
}

#[derive(Default)]
struct RuleCache {
    rules: Arc<Vec<AutomationRule>>,
    loaded_at: Option<Instant>,
}

pub struct TriggerProcessor {
    storage: Arc<dyn AutomationStorage>,
    cache: RwLock<RuleCache>,
    stale: AtomicBool,
    cache_ttl: Duration,
}

impl TriggerProcessor {
    pub fn new(storage: Arc<dyn AutomationStorage>) -> Self {
        Self::with_ttl(storage, DEFAULT_RULE_CACHE_TTL)
    }

    pub fn with_ttl(storage: Arc<dyn AutomationStorage>, cache_ttl: Duration) -> Self {
        Self {
            storage,
            cache: RwLock::new(RuleCache::default()),
            stale: AtomicBool::new(true),
            cache_ttl,
        }
    }

    /// Warm the cache
    pub async fn initialize(&self) -> Result<()> {
        let count = self.refresh_rules().await?;
        info!(rules = count, "Trigger processor initialized");
        Ok(())
    }

    /// Drop the cache and reload active rules now
    ///
    /// An invalidation that arrives while storage is being read leaves the
    /// cache stale for the next caller.
    pub async fn refresh_rules(&self) -> Result<usize> {
        self.stale.store(false, Ordering::SeqCst);
        let rules = match self.storage.list_active_rules().await {
            Ok(rules) => rules,
            Err(e) => {
                self.invalidate();
                return Err(e);
            }
        };
        let count = rules.len();

        let mut cache = self.cache.write().await;
        cache.rules = Arc::new(rules);
        cache.loaded_at = Some(Instant::now());

        debug!(rules = count, "Rule cache refreshed");
        Ok(count)
    }

    /// Mark the cache stale without touching storage
    pub fn invalidate(&self) {
        self.stale.store(true, Ordering::SeqCst);
    }

    async fn active_rules(&self) -> Result<Arc<Vec<AutomationRule>>> {
        {
            let cache = self.cache.read().await;
            let fresh = !self.stale.load(Ordering::SeqCst)
                && cache
                    .loaded_at
                    .map_or(false, |loaded| loaded.elapsed() < self.cache_ttl);
            if fresh {
                return Ok(cache.rules.clone());
            }
        }

        self.refresh_rules().await?;
        Ok(self.cache.read().await.rules.clone())
    }

    /// Find every active rule the event satisfies
    pub async fn process_event(&self, event: &TriggerEvent) -> Result<TriggerMatchResult> {
        let validation = event.validate();
        if !validation.is_valid() {
            return Err(AutomationError::InvalidEvent(validation.errors.join("; ")));
        }

        let mut result = TriggerMatchResult {
            warnings: validation.warnings,
            ..Default::default()
        };
        for warning in &result.warnings {
            warn!(entity = %event.entity_name, entity_id = %event.entity_id, "{}", warning);
        }

        let rules = self.active_rules().await?;
        for rule in rules.iter().filter(|rule| rule.applies_to(event)) {
            result.evaluated_count += 1;

            match rule.evaluate(event) {
                Ok(outcome) => {
                    for error in &outcome.errors {
                        result.errors.push(format!("Rule {}: {}", rule.id, error));
                    }
                    if outcome.matched {
                        result.matched_rules.push(MatchedRule {
                            rule: rule.clone(),
                            reasons: outcome.reasons,
                        });
                    }
                }
                Err(e) => {
                    warn!(rule_id = %rule.id, error = %e, "Rule has malformed trigger conditions");
                    result
                        .errors
                        .push(format!("Rule {} has malformed trigger conditions: {}", rule.id, e));
                }
            }
        }

        debug!(
            entity = %event.entity_name,
            event_type = %event.event_type,
            evaluated = result.evaluated_count,
            matched = result.matched_rules.len(),
            "Processed trigger event"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::storage::InMemoryStorage;
    use crate::models::{EventType, FieldCondition, RuleId};
    use serde_json::json;

    async fn processor_with_rules(rules: Vec<AutomationRule>) -> (Arc<InMemoryStorage>, TriggerProcessor) {
        let storage = Arc::new(InMemoryStorage::new());
        for rule in rules {
            storage.save_rule(rule).await.unwrap();
        }
        let processor = TriggerProcessor::new(storage.clone());
        processor.initialize().await.unwrap();
        (storage, processor)
    }

    #[tokio::test]
    async fn test_matches_by_entity_type_and_conditions() {
        let (_, processor) = processor_with_rules(vec![
            AutomationRule::new("shipped", "Shipped", "order", EventType::OnUpdate)
                .with_conditions(vec![FieldCondition::changed_to("status", json!("shipped"))]),
            AutomationRule::new("cancelled", "Cancelled", "order", EventType::OnUpdate)
                .with_conditions(vec![FieldCondition::changed_to("status", json!("cancelled"))]),
            AutomationRule::new("created", "Created", "order", EventType::OnCreate),
            AutomationRule::new("invoice", "Invoice", "invoice", EventType::OnUpdate),
        ])
        .await;

        let event = TriggerEvent::updated("order", "o-1").with_change("status", json!("pending"), json!("shipped"));
        let result = processor.process_event(&event).await.unwrap();

        assert_eq!(result.evaluated_count, 2);
        assert_eq!(result.rule_ids(), vec![RuleId::from("shipped")]);
        assert!(!result.matched_rules[0].reasons.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_event_is_rejected() {
        let (_, processor) = processor_with_rules(vec![]).await;
        let event = TriggerEvent::created("order", "").with_timestamp(None);

        let err = processor.process_event(&event).await.unwrap_err();
        assert!(matches!(err, AutomationError::InvalidEvent(_)));
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_malformed_conditions_do_not_match() {
        let (_, processor) = processor_with_rules(vec![
            AutomationRule::new("broken", "Broken", "order", EventType::OnCreate)
                .with_raw_conditions(json!("not a list")),
            AutomationRule::new("ok", "Ok", "order", EventType::OnCreate),
        ])
        .await;

        let result = processor.process_event(&TriggerEvent::created("order", "1")).await.unwrap();
        assert_eq!(result.rule_ids(), vec![RuleId::from("ok")]);
        assert_eq!(result.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_picks_up_new_rules() {
        let (storage, processor) = processor_with_rules(vec![]).await;
        storage
            .save_rule(AutomationRule::new("late", "Late", "order", EventType::OnCreate))
            .await
            .unwrap();

        let event = TriggerEvent::created("order", "1");
        assert!(processor.process_event(&event).await.unwrap().matched_rules.is_empty());

        processor.invalidate();
        assert_eq!(processor.process_event(&event).await.unwrap().matched_rules.len(), 1);
    }

    #[tokio::test]
    async fn test_invalidation_during_refresh_is_kept() {
        use crate::engine::storage::gated::GatedStorage;

        let storage = Arc::new(GatedStorage::new());
        let processor = Arc::new(TriggerProcessor::new(storage.clone()));

        // A refresh reads the empty rule set and is parked before caching it
        storage.hold_next_rule_read();
        let refresh = {
            let processor = processor.clone();
            tokio::spawn(async move { processor.refresh_rules().await })
        };
        storage.read_held().await;

        storage
            .save_rule(AutomationRule::new("late", "Late", "order", EventType::OnCreate))
            .await
            .unwrap();
        processor.invalidate();
        storage.release();
        assert_eq!(refresh.await.unwrap().unwrap(), 0);

        let result = processor.process_event(&TriggerEvent::created("order", "1")).await.unwrap();
        assert_eq!(result.rule_ids(), vec![RuleId::from("late")]);
    }
}
