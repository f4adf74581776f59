// Rule dependencies and the derived dependency graph

//! # Dependency Graph
//!
//! A [`RuleDependency`] says "the parent rule runs before the child rule".
//! The [`DependencyGraph`] is derived from the persisted dependencies plus the
//! set of active rules and is never edited in place by the engine: the
//! resolver rebuilds it and swaps it wholesale.
//!
//! ## Levels
//!
//! A node without parents is level 0, any other node is
//! `1 + max(level(parent))`. Rules are batched by level, so a rule always
//! lands in a later batch than each of its parents.
//!
//! ```text
//!   A (0) ──▶ B (1) ──▶ D (2)
//!   C (0) ──────────────▲
//! ```
//!
//! ## Rust Learning Notes:
//!
//! ### BTreeSet for Stable Output
//! Parents and children are kept in `BTreeSet`s so traversals, cycle reports
//! and error messages come out in the same order on every run.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use super::rule::RuleId;

/// Ordering constraint between two rules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDependency {
    #[serde(default = "new_dependency_id")]
    pub id: String,
    pub parent_rule_id: RuleId,
    pub child_rule_id: RuleId,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn new_dependency_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl RuleDependency {
    pub fn new(parent_rule_id: impl Into<RuleId>, child_rule_id: impl Into<RuleId>) -> Self {
        Self {
            id: new_dependency_id(),
            parent_rule_id: parent_rule_id.into(),
            child_rule_id: child_rule_id.into(),
            created_at: Utc::now(),
        }
    }

    /// True when this dependency describes the same edge as `other`
    pub fn same_edge(&self, other: &RuleDependency) -> bool {
        self.parent_rule_id == other.parent_rule_id && self.child_rule_id == other.child_rule_id
    }
}

/// A rule's position in the graph
#[derive(Debug, Clone, Default, Serialize)]
pub struct GraphNode {
    pub rule_id: RuleId,
    pub parents: BTreeSet<RuleId>,
    pub children: BTreeSet<RuleId>,
    pub level: usize,
}

/// Result of a full cycle scan
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub has_cycles: bool,
    /// Each cycle lists the rules from the re-entered rule to the rule that closed it
    pub cycles: Vec<Vec<RuleId>>,
    pub affected_rules: Vec<RuleId>,
}

/// Why a proposed dependency was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationErrorType {
    SelfDependency,
    MissingRule,
    Cycle,
}

/// A rejected dependency with enough detail to explain the rejection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyValidationError {
    pub error_type: ValidationErrorType,
    pub parent_rule_id: RuleId,
    pub child_rule_id: RuleId,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycle_path: Option<Vec<RuleId>>,
}

impl fmt::Display for DependencyValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

fn render_path(path: &[RuleId]) -> String {
    path.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Directed graph of active rules
#[derive(Debug, Clone, Default, Serialize)]
pub struct DependencyGraph {
    nodes: HashMap<RuleId, GraphNode>,
    pub built_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, PartialEq)]
enum Visit {
    InProgress,
    Done(usize),
}

impl DependencyGraph {
    /// Build a graph over `rule_ids`, keeping only edges between known rules
    pub fn build(
        rule_ids: impl IntoIterator<Item = RuleId>,
        dependencies: &[RuleDependency],
    ) -> Self {
        let mut graph = Self {
            nodes: rule_ids
                .into_iter()
                .map(|rule_id| {
                    let node = GraphNode {
                        rule_id: rule_id.clone(),
                        ..Default::default()
                    };
                    (rule_id, node)
                })
                .collect(),
            built_at: Some(Utc::now()),
        };

        for dependency in dependencies {
            graph.add_edge(&dependency.parent_rule_id, &dependency.child_rule_id);
        }
        graph.compute_levels();
        graph
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, rule_id: &RuleId) -> bool {
        self.nodes.contains_key(rule_id)
    }

    pub fn node(&self, rule_id: &RuleId) -> Option<&GraphNode> {
        self.nodes.get(rule_id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.values()
    }

    pub fn level(&self, rule_id: &RuleId) -> Option<usize> {
        self.nodes.get(rule_id).map(|node| node.level)
    }

    /// Direct children of a rule
    pub fn dependents(&self, rule_id: &RuleId) -> Vec<RuleId> {
        self.nodes
            .get(rule_id)
            .map(|node| node.children.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn edge_count(&self) -> usize {
        self.nodes.values().map(|node| node.children.len()).sum()
    }

    /// Add an edge between two known rules; returns false when it was ignored
    ///
    /// Levels are not recomputed; call [`DependencyGraph::compute_levels`]
    /// after a series of edits.
    pub fn add_edge(&mut self, parent: &RuleId, child: &RuleId) -> bool {
        if parent == child || !self.contains(parent) || !self.contains(child) {
            return false;
        }
        if let Some(node) = self.nodes.get_mut(parent) {
            node.children.insert(child.clone());
        }
        if let Some(node) = self.nodes.get_mut(child) {
            node.parents.insert(parent.clone());
        }
        true
    }

    /// Recompute every node's level with a memoized DFS over parents
    pub fn compute_levels(&mut self) {
        let mut visits: HashMap<RuleId, Visit> = HashMap::with_capacity(self.nodes.len());
        let mut ids: Vec<RuleId> = self.nodes.keys().cloned().collect();
        ids.sort();

        for id in &ids {
            self.level_of(id, &mut visits);
        }

        for (id, visit) in visits {
            if let (Some(node), Visit::Done(level)) = (self.nodes.get_mut(&id), visit) {
                node.level = level;
            }
        }
    }

    fn level_of(&self, id: &RuleId, visits: &mut HashMap<RuleId, Visit>) -> usize {
        match visits.get(id) {
            Some(Visit::Done(level)) => return *level,
            Some(Visit::InProgress) => {
                // Only reachable if a cycle slipped past write-time validation
                error!(
                    rule_id = %id,
                    "Dependency cycle detected while computing levels; assigning level 0"
                );
                return 0;
            }
            None => {}
        }

        visits.insert(id.clone(), Visit::InProgress);
        let level = match self.nodes.get(id) {
            Some(node) if !node.parents.is_empty() => {
                let mut max_parent = 0;
                for parent in &node.parents {
                    max_parent = max_parent.max(self.level_of(parent, visits));
                }
                max_parent + 1
            }
            _ => 0,
        };
        visits.insert(id.clone(), Visit::Done(level));
        level
    }

    /// Group rule ids by level, ascending
    pub fn levels(&self) -> BTreeMap<usize, Vec<RuleId>> {
        let mut levels: BTreeMap<usize, Vec<RuleId>> = BTreeMap::new();
        for node in self.nodes.values() {
            levels.entry(node.level).or_default().push(node.rule_id.clone());
        }
        for ids in levels.values_mut() {
            ids.sort();
        }
        levels
    }

    /// Scan the whole graph for cycles
    ///
    /// DFS over children keeping a recursion stack and the current path. A
    /// child found on the stack closes a cycle, reported as the path from that
    /// child to the current node.
    pub fn detect_cycles(&self) -> CycleReport {
        let mut visited: HashSet<RuleId> = HashSet::new();
        let mut on_stack: HashSet<RuleId> = HashSet::new();
        let mut path: Vec<RuleId> = Vec::new();
        let mut cycles: Vec<Vec<RuleId>> = Vec::new();

        let mut ids: Vec<&RuleId> = self.nodes.keys().collect();
        ids.sort();

        for id in ids {
            if !visited.contains(id) {
                self.cycle_dfs(id, &mut visited, &mut on_stack, &mut path, &mut cycles);
            }
        }

        let affected: BTreeSet<RuleId> = cycles.iter().flatten().cloned().collect();
        CycleReport {
            has_cycles: !cycles.is_empty(),
            cycles,
            affected_rules: affected.into_iter().collect(),
        }
    }

    fn cycle_dfs(
        &self,
        id: &RuleId,
        visited: &mut HashSet<RuleId>,
        on_stack: &mut HashSet<RuleId>,
        path: &mut Vec<RuleId>,
        cycles: &mut Vec<Vec<RuleId>>,
    ) {
        visited.insert(id.clone());
        on_stack.insert(id.clone());
        path.push(id.clone());

        if let Some(node) = self.nodes.get(id) {
            for child in &node.children {
                if on_stack.contains(child) {
                    if let Some(start) = path.iter().position(|p| p == child) {
                        cycles.push(path[start..].to_vec());
                    }
                } else if !visited.contains(child) {
                    self.cycle_dfs(child, visited, on_stack, path, cycles);
                }
            }
        }

        path.pop();
        on_stack.remove(id);
    }

    /// Path `from -> ... -> to` following child edges, if one exists
    fn find_path(&self, from: &RuleId, to: &RuleId) -> Option<Vec<RuleId>> {
        let mut visited: HashSet<&RuleId> = HashSet::new();
        let mut stack: Vec<(&RuleId, Vec<RuleId>)> = vec![(from, vec![from.clone()])];

        while let Some((current, trail)) = stack.pop() {
            if current == to {
                return Some(trail);
            }
            if !visited.insert(current) {
                continue;
            }
            if let Some(node) = self.nodes.get(current) {
                for child in node.children.iter().rev() {
                    if !visited.contains(child) {
                        let mut next = trail.clone();
                        next.push(child.clone());
                        stack.push((child, next));
                    }
                }
            }
        }
        None
    }

    /// Validate proposed dependencies against this graph
    ///
    /// Candidates are applied one by one to a clone, so a batch that only
    /// forms a cycle together is still rejected. The graph itself is not
    /// touched.
    pub fn validate(&self, candidates: &[RuleDependency]) -> Vec<DependencyValidationError> {
        let mut simulated = self.clone();
        let mut errors = Vec::new();

        for candidate in candidates {
            let parent = &candidate.parent_rule_id;
            let child = &candidate.child_rule_id;

            if parent == child {
                errors.push(DependencyValidationError {
                    error_type: ValidationErrorType::SelfDependency,
                    parent_rule_id: parent.clone(),
                    child_rule_id: child.clone(),
                    message: format!("Rule {} cannot depend on itself", parent),
                    cycle_path: None,
                });
                continue;
            }

            let missing: Vec<&RuleId> = [parent, child]
                .into_iter()
                .filter(|id| !simulated.contains(id))
                .collect();
            if !missing.is_empty() {
                errors.push(DependencyValidationError {
                    error_type: ValidationErrorType::MissingRule,
                    parent_rule_id: parent.clone(),
                    child_rule_id: child.clone(),
                    message: format!(
                        "Dependency {} -> {} references missing or inactive rule(s): {}",
                        parent,
                        child,
                        missing
                            .iter()
                            .map(|id| id.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    ),
                    cycle_path: None,
                });
                continue;
            }

            // The new edge closes a cycle iff the child already reaches the parent
            if let Some(back_path) = simulated.find_path(child, parent) {
                let mut cycle = vec![parent.clone()];
                cycle.extend(back_path);
                errors.push(DependencyValidationError {
                    error_type: ValidationErrorType::Cycle,
                    parent_rule_id: parent.clone(),
                    child_rule_id: child.clone(),
                    message: format!(
                        "Dependency {} -> {} would create a cycle: {}",
                        parent,
                        child,
                        render_path(&cycle)
                    ),
                    cycle_path: Some(cycle),
                });
                continue;
            }

            simulated.add_edge(parent, child);
        }

        errors
    }
}
