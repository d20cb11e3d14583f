// =============================================================================
// Strategy — immutable, versioned condition-tree definitions (spec §4.3)
// =============================================================================
//
// Replaces the teacher's single hard-coded `StrategyEngine::evaluate_symbol`
// weighted ensemble with a data model: a `Strategy` is an ordered list of
// entry and exit `Rule`s, each carrying a condition tree (`ConditionNode`,
// see `evaluator.rs`), a cooldown, and a daily execution cap. Per the
// cyclic-reference REDESIGN FLAG, bots reference strategies by
// `strategy_id` only; a strategy once deployed is immutable, and edits
// produce a new version under the same id rather than mutating in place —
// a running bot's in-flight evaluation always sees one consistent snapshot.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::evaluator::ConditionNode;

/// What a rule does when its condition tree evaluates true.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Buy,
    Sell,
    /// Add to an existing same-side position; bypasses the duplicate-position
    /// check in the risk pipeline (spec §4.5 check 5).
    ScaleIn,
    /// Close the currently held position (either side).
    Close,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    pub tree: ConditionNode,
    pub action: RuleAction,
    pub cooldown_minutes: i64,
    pub max_executions_per_day: u32,
}

impl Rule {
    pub fn new(
        name: impl Into<String>,
        tree: ConditionNode,
        action: RuleAction,
        cooldown_minutes: i64,
        max_executions_per_day: u32,
    ) -> Self {
        Self {
            name: name.into(),
            tree,
            action,
            cooldown_minutes,
            max_executions_per_day,
        }
    }
}

/// One immutable version of a strategy. `strategy_id` is stable across
/// versions; `version` increments on every edit after deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    pub strategy_id: Uuid,
    pub version: u32,
    pub name: String,
    pub entry_rules: Vec<Rule>,
    pub exit_rules: Vec<Rule>,
    pub deployed: bool,
    pub created_at: DateTime<Utc>,
}

impl Strategy {
    pub fn new(name: impl Into<String>, entry_rules: Vec<Rule>, exit_rules: Vec<Rule>) -> Self {
        Self {
            strategy_id: Uuid::new_v4(),
            version: 1,
            name: name.into(),
            entry_rules,
            exit_rules,
            deployed: false,
            created_at: Utc::now(),
        }
    }

    /// Derive the next version of this strategy with replacement rule sets.
    /// The new version is undeployed until `deploy` is called explicitly.
    fn next_version(&self, entry_rules: Vec<Rule>, exit_rules: Vec<Rule>) -> Self {
        Self {
            strategy_id: self.strategy_id,
            version: self.version + 1,
            name: self.name.clone(),
            entry_rules,
            exit_rules,
            deployed: false,
            created_at: Utc::now(),
        }
    }
}

/// In-memory store of strategies, keyed by id, retaining every version ever
/// created. Bots always resolve to the latest *deployed* version at the
/// moment a scheduler cycle snapshots bot config, never a version created
/// mid-cycle (spec §4.4: "changes take effect at the next cycle boundary").
pub struct StrategyRegistry {
    versions: parking_lot::RwLock<std::collections::HashMap<Uuid, Vec<Strategy>>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self {
            versions: parking_lot::RwLock::new(std::collections::HashMap::new()),
        }
    }

    /// Register a brand-new strategy (version 1, undeployed).
    pub fn create(&self, strategy: Strategy) -> Uuid {
        let id = strategy.strategy_id;
        self.versions.write().entry(id).or_default().push(strategy);
        id
    }

    /// Mark the latest version of `strategy_id` as deployed.
    pub fn deploy(&self, strategy_id: Uuid) -> Option<()> {
        let mut map = self.versions.write();
        let versions = map.get_mut(&strategy_id)?;
        versions.last_mut()?.deployed = true;
        Some(())
    }

    /// Propose a new version with edited rule sets. Never mutates an
    /// existing deployed version in place.
    pub fn revise(&self, strategy_id: Uuid, entry_rules: Vec<Rule>, exit_rules: Vec<Rule>) -> Option<u32> {
        let mut map = self.versions.write();
        let versions = map.get_mut(&strategy_id)?;
        let latest = versions.last()?.clone();
        let revised = latest.next_version(entry_rules, exit_rules);
        let version = revised.version;
        versions.push(revised);
        Some(version)
    }

    /// Latest *deployed* version, the one live bots should evaluate against.
    pub fn current(&self, strategy_id: Uuid) -> Option<Strategy> {
        self.versions
            .read()
            .get(&strategy_id)?
            .iter()
            .rev()
            .find(|s| s.deployed)
            .cloned()
    }

    pub fn version(&self, strategy_id: Uuid, version: u32) -> Option<Strategy> {
        self.versions
            .read()
            .get(&strategy_id)?
            .iter()
            .find(|s| s.version == version)
            .cloned()
    }

    pub fn all_ids(&self) -> Vec<Uuid> {
        self.versions.read().keys().copied().collect()
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::{ConditionNode, Logic};
    use crate::indicators::IndicatorKind;

    fn sample_leaf() -> ConditionNode {
        ConditionNode::IndicatorBelow {
            indicator: IndicatorKind::Rsi,
            period: 14,
            value: 30.0,
        }
    }

    fn sample_strategy() -> Strategy {
        let entry = Rule::new(
            "RSI_OVERSOLD_BOUNCE",
            ConditionNode::Group {
                logic: Logic::And,
                children: vec![sample_leaf()],
            },
            RuleAction::Buy,
            30,
            10,
        );
        Strategy::new("mean-reversion", vec![entry], vec![])
    }

    #[test]
    fn deploy_marks_latest_version() {
        let registry = StrategyRegistry::new();
        let id = registry.create(sample_strategy());
        assert!(registry.current(id).is_none());
        registry.deploy(id);
        let current = registry.current(id).unwrap();
        assert_eq!(current.version, 1);
        assert!(current.deployed);
    }

    #[test]
    fn revise_creates_new_version_without_mutating_deployed_one() {
        let registry = StrategyRegistry::new();
        let id = registry.create(sample_strategy());
        registry.deploy(id);
        let new_version = registry.revise(id, vec![], vec![]).unwrap();
        assert_eq!(new_version, 2);
        // Current deployed version is still v1 until v2 is explicitly deployed.
        assert_eq!(registry.current(id).unwrap().version, 1);
        registry.deploy(id);
        assert_eq!(registry.current(id).unwrap().version, 2);
    }

    #[test]
    fn version_lookup_returns_specific_snapshot() {
        let registry = StrategyRegistry::new();
        let id = registry.create(sample_strategy());
        registry.revise(id, vec![], vec![]);
        let v1 = registry.version(id, 1).unwrap();
        assert_eq!(v1.entry_rules.len(), 1);
        let v2 = registry.version(id, 2).unwrap();
        assert_eq!(v2.entry_rules.len(), 0);
    }
}
