// =============================================================================
// Knowledge Base — pattern -> outcome statistics that scale signal confidence
// =============================================================================
//
// Maintains a Welford-style running mean/variance of trade P&L% bucketed by
// `pattern_key` (the triggering rule's identity, e.g. `RSI_OVERSOLD_BOUNCE`).
// The confidence modifier `clip(1 + mean_pct/100, 0.5, 1.5)` is read once per
// evaluator tick and handed to the caller as a plain value — never a live
// reference — so KB updates that land mid-tick can never race with the
// evaluation that already snapshotted it (spec §4.9).
//
// Guarded the same way `risk.rs`'s `RwLock<Inner>` guards its daily counters:
// one lock around a plain struct, no per-field locking.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

const MIN_MODIFIER: f64 = 0.5;
const MAX_MODIFIER: f64 = 1.5;

/// Welford running mean/variance accumulator for one pattern's trade outcomes.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct OutcomeStats {
    pub wins: u64,
    pub losses: u64,
    pub count: u64,
    mean_pct: f64,
    m2: f64,
}

impl OutcomeStats {
    fn observe(&mut self, pnl_pct: f64) {
        self.count += 1;
        if pnl_pct >= 0.0 {
            self.wins += 1;
        } else {
            self.losses += 1;
        }
        let delta = pnl_pct - self.mean_pct;
        self.mean_pct += delta / self.count as f64;
        let delta2 = pnl_pct - self.mean_pct;
        self.m2 += delta * delta2;
    }

    pub fn avg_pct(&self) -> f64 {
        self.mean_pct
    }

    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    /// Confidence modifier applied on top of a signal's base confidence,
    /// clipped to `[0.5, 1.5]` (spec §4.9).
    pub fn confidence_modifier(&self) -> f64 {
        (1.0 + self.mean_pct / 100.0).clamp(MIN_MODIFIER, MAX_MODIFIER)
    }
}

/// Thread-safe `pattern_key -> OutcomeStats` map, updated by the Ledger on
/// every closed trade and read (snapshotted) by the Strategy Evaluator.
pub struct KnowledgeBase {
    patterns: RwLock<HashMap<String, OutcomeStats>>,
}

impl KnowledgeBase {
    pub fn new() -> Self {
        Self {
            patterns: RwLock::new(HashMap::new()),
        }
    }

    /// Record one closed trade's P&L percentage against `pattern_key`.
    pub fn record_outcome(&self, pattern_key: &str, pnl_pct: f64) {
        let mut map = self.patterns.write();
        map.entry(pattern_key.to_string()).or_default().observe(pnl_pct);
    }

    /// Snapshot the current modifier for `pattern_key`. Returns `1.0`
    /// (neutral) for patterns with no trade history yet.
    pub fn confidence_modifier(&self, pattern_key: &str) -> f64 {
        self.patterns
            .read()
            .get(pattern_key)
            .map(|s| s.confidence_modifier())
            .unwrap_or(1.0)
    }

    pub fn stats(&self, pattern_key: &str) -> Option<OutcomeStats> {
        self.patterns.read().get(pattern_key).copied()
    }

    pub fn all_patterns(&self) -> HashMap<String, OutcomeStats> {
        self.patterns.read().clone()
    }

    /// Restore a pattern's stats directly — used by ledger replay.
    pub fn restore(&self, pattern_key: &str, stats: OutcomeStats) {
        self.patterns.write().insert(pattern_key.to_string(), stats);
    }
}

impl Default for KnowledgeBase {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neutral_modifier_for_unknown_pattern() {
        let kb = KnowledgeBase::new();
        assert_eq!(kb.confidence_modifier("UNKNOWN"), 1.0);
    }

    #[test]
    fn winning_pattern_boosts_confidence() {
        let kb = KnowledgeBase::new();
        for _ in 0..10 {
            kb.record_outcome("RSI_OVERSOLD_BOUNCE", 5.0);
        }
        let modifier = kb.confidence_modifier("RSI_OVERSOLD_BOUNCE");
        assert!(modifier > 1.0);
        assert!(modifier <= MAX_MODIFIER);
    }

    #[test]
    fn losing_pattern_reduces_confidence() {
        let kb = KnowledgeBase::new();
        for _ in 0..10 {
            kb.record_outcome("MACD_FAKEOUT", -10.0);
        }
        let modifier = kb.confidence_modifier("MACD_FAKEOUT");
        assert!(modifier < 1.0);
        assert!(modifier >= MIN_MODIFIER);
    }

    #[test]
    fn modifier_clipped_at_extremes() {
        let kb = KnowledgeBase::new();
        kb.record_outcome("EXTREME_WIN", 1000.0);
        assert_eq!(kb.confidence_modifier("EXTREME_WIN"), MAX_MODIFIER);
        kb.record_outcome("EXTREME_LOSS", -1000.0);
        assert_eq!(kb.confidence_modifier("EXTREME_LOSS"), MIN_MODIFIER);
    }

    #[test]
    fn win_loss_counts_tracked() {
        let kb = KnowledgeBase::new();
        kb.record_outcome("P1", 2.0);
        kb.record_outcome("P1", -1.0);
        kb.record_outcome("P1", 3.0);
        let stats = kb.stats("P1").unwrap();
        assert_eq!(stats.wins, 2);
        assert_eq!(stats.losses, 1);
        assert_eq!(stats.count, 3);
    }
}
