// =============================================================================
// Signal — the Strategy Evaluator's output for one (bot, symbol, tick)
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::strategy::RuleAction;
use crate::types::{Side, SignalStatus};

/// Produced atomically per evaluator tick. May lead to an Order once it
/// clears the Risk & Execution Pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub signal_id: Uuid,
    pub bot_id: Uuid,
    pub asset_id: String,
    pub side: Side,
    /// The rule action that produced this signal. `ScaleIn` bypasses the
    /// duplicate-position check in the risk pipeline (spec §4.5 check 5).
    pub action: RuleAction,
    /// In `[0.0, 1.0]`; signals below the 0.70 floor after KB adjustment
    /// are dropped before this struct is even constructed (spec §4.3).
    pub confidence: f64,
    /// `"<rule_name> | <indicator snapshot> | KB:<pattern_key>+<modifier>"`.
    pub rationale: String,
    pub created_at: DateTime<Utc>,
    pub status: SignalStatus,
}

impl Signal {
    pub fn new(
        bot_id: Uuid,
        asset_id: impl Into<String>,
        side: Side,
        action: RuleAction,
        confidence: f64,
        rationale: impl Into<String>,
    ) -> Self {
        Self {
            signal_id: Uuid::new_v4(),
            bot_id,
            asset_id: asset_id.into(),
            side,
            action,
            confidence,
            rationale: rationale.into(),
            created_at: Utc::now(),
            status: SignalStatus::Pending,
        }
    }
}
