// =============================================================================
// Position Manager — per-user, per-asset holdings
// =============================================================================
//
// A position tracks one user's holding of one tokenized asset: running
// weighted-average cost basis, realised P&L, and any yield accrued but not
// yet claimed. Positions are created on the first buy fill and removed on
// full sell, per the data-model invariant that `tokens == 0` implies no
// position record survives.
// =============================================================================

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::Side;

/// Key identifying a unique position: one user holding one asset.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct PositionKey {
    pub user_id: String,
    pub asset_id: String,
}

/// A user's holding of a single tokenized asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub position_id: Uuid,
    pub user_id: String,
    pub asset_id: String,
    /// Token quantity held. Invariant: `tokens >= 0`.
    pub tokens: Decimal,
    /// Running weighted-average cost per token. Invariant: `cost_basis >= 0`.
    pub cost_basis: Decimal,
    pub realized_pnl: Decimal,
    /// Yield credited but not yet claimed via `claim()`.
    pub pending_yield: Decimal,
    /// Whether future yield distributions auto-reinvest for this position.
    pub reinvest: bool,
    pub opened_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl Position {
    fn new(user_id: impl Into<String>, asset_id: impl Into<String>) -> Self {
        let now = chrono::Utc::now();
        Self {
            position_id: Uuid::new_v4(),
            user_id: user_id.into(),
            asset_id: asset_id.into(),
            tokens: Decimal::ZERO,
            cost_basis: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            pending_yield: Decimal::ZERO,
            reinvest: false,
            opened_at: now,
            updated_at: now,
        }
    }

    /// Current ownership percentage of `total_supply` this position represents.
    pub fn ownership_pct(&self, total_supply: Decimal) -> Decimal {
        if total_supply.is_zero() {
            Decimal::ZERO
        } else {
            self.tokens / total_supply
        }
    }
}

/// Thread-safe registry of positions, indexed by `(user_id, asset_id)` and
/// secondarily by user so portfolio queries are O(positions_for_user), per
/// spec §9's REDESIGN FLAGS ("typed concurrent maps... per-user indexed
/// table").
pub struct PositionManager {
    inner: parking_lot::RwLock<HashMap<PositionKey, Position>>,
}

impl PositionManager {
    pub fn new() -> Self {
        Self {
            inner: parking_lot::RwLock::new(HashMap::new()),
        }
    }

    /// Apply a buy fill: increases `tokens`, updates the weighted-average
    /// `cost_basis`. Creates the position if it does not yet exist.
    pub fn apply_buy(
        &self,
        user_id: &str,
        asset_id: &str,
        qty: Decimal,
        fill_price: Decimal,
    ) -> Position {
        let key = PositionKey {
            user_id: user_id.to_string(),
            asset_id: asset_id.to_string(),
        };
        let mut map = self.inner.write();
        let pos = map
            .entry(key)
            .or_insert_with(|| Position::new(user_id, asset_id));

        let existing_cost = pos.cost_basis * pos.tokens;
        let new_cost = fill_price * qty;
        let new_tokens = pos.tokens + qty;

        pos.cost_basis = if new_tokens.is_zero() {
            Decimal::ZERO
        } else {
            (existing_cost + new_cost) / new_tokens
        };
        pos.tokens = new_tokens;
        pos.updated_at = chrono::Utc::now();
        pos.clone()
    }

    /// Apply a sell fill: decreases `tokens`, realises P&L against the
    /// current weighted-average cost basis. Returns the realised P&L for
    /// this fill and the position after the sell (`None` if fully closed —
    /// the record is removed, per the data-model invariant).
    pub fn apply_sell(
        &self,
        user_id: &str,
        asset_id: &str,
        qty: Decimal,
        fill_price: Decimal,
    ) -> (Decimal, Option<Position>) {
        let key = PositionKey {
            user_id: user_id.to_string(),
            asset_id: asset_id.to_string(),
        };
        let mut map = self.inner.write();
        let Some(pos) = map.get_mut(&key) else {
            return (Decimal::ZERO, None);
        };

        let sell_qty = qty.min(pos.tokens);
        let realized = (fill_price - pos.cost_basis) * sell_qty;

        pos.tokens -= sell_qty;
        pos.realized_pnl += realized;
        pos.updated_at = chrono::Utc::now();

        if pos.tokens.is_zero() {
            map.remove(&key);
            (realized, None)
        } else {
            (realized, Some(pos.clone()))
        }
    }

    /// Credit yield to a holder's pending balance (non-reinvest path).
    pub fn credit_yield(&self, user_id: &str, asset_id: &str, amount: Decimal) {
        let key = PositionKey {
            user_id: user_id.to_string(),
            asset_id: asset_id.to_string(),
        };
        if let Some(pos) = self.inner.write().get_mut(&key) {
            pos.pending_yield += amount;
        }
    }

    /// Debit all pending yield for a user/asset to zero and return the
    /// amount claimed. Zero is returned if there is no pending yield
    /// (caller surfaces `no_yield`).
    pub fn claim_yield(&self, user_id: &str, asset_id: &str) -> Decimal {
        let key = PositionKey {
            user_id: user_id.to_string(),
            asset_id: asset_id.to_string(),
        };
        match self.inner.write().get_mut(&key) {
            Some(pos) if !pos.pending_yield.is_zero() => {
                let amount = pos.pending_yield;
                pos.pending_yield = Decimal::ZERO;
                amount
            }
            _ => Decimal::ZERO,
        }
    }

    pub fn get(&self, user_id: &str, asset_id: &str) -> Option<Position> {
        let key = PositionKey {
            user_id: user_id.to_string(),
            asset_id: asset_id.to_string(),
        };
        self.inner.read().get(&key).cloned()
    }

    /// Toggle whether future yield distributions auto-reinvest for this
    /// position (spec §4.7). No-op if the position does not exist.
    pub fn set_reinvest(&self, user_id: &str, asset_id: &str, reinvest: bool) {
        let key = PositionKey {
            user_id: user_id.to_string(),
            asset_id: asset_id.to_string(),
        };
        if let Some(pos) = self.inner.write().get_mut(&key) {
            pos.reinvest = reinvest;
        }
    }

    pub fn has_open_position(&self, user_id: &str, asset_id: &str) -> bool {
        self.get(user_id, asset_id)
            .map(|p| !p.tokens.is_zero())
            .unwrap_or(false)
    }

    /// All positions for a user, for portfolio queries.
    pub fn positions_for_user(&self, user_id: &str) -> Vec<Position> {
        self.inner
            .read()
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect()
    }

    /// Every open position across all users, for the admin dashboard's
    /// aggregate positions view.
    pub fn all(&self) -> Vec<Position> {
        self.inner.read().values().cloned().collect()
    }

    /// All holders of an asset with `tokens > 0`, for yield distribution.
    pub fn holders_of(&self, asset_id: &str) -> Vec<Position> {
        self.inner
            .read()
            .values()
            .filter(|p| p.asset_id == asset_id && !p.tokens.is_zero())
            .cloned()
            .collect()
    }

    /// Directly insert/replace a position — used by ledger replay.
    pub fn restore(&self, position: Position) {
        let key = PositionKey {
            user_id: position.user_id.clone(),
            asset_id: position.asset_id.clone(),
        };
        self.inner.write().insert(key, position);
    }

    pub fn side_of(&self, user_id: &str, asset_id: &str) -> Option<Side> {
        self.get(user_id, asset_id).map(|p| {
            if p.tokens > Decimal::ZERO {
                Side::Buy
            } else {
                Side::Sell
            }
        })
    }
}

impl Default for PositionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn buy_creates_position_with_weighted_cost() {
        let pm = PositionManager::new();
        pm.apply_buy("u1", "A1", dec!(10), dec!(100));
        pm.apply_buy("u1", "A1", dec!(10), dec!(200));
        let pos = pm.get("u1", "A1").unwrap();
        assert_eq!(pos.tokens, dec!(20));
        assert_eq!(pos.cost_basis, dec!(150));
    }

    #[test]
    fn sell_realizes_pnl_against_cost_basis() {
        let pm = PositionManager::new();
        pm.apply_buy("u1", "A1", dec!(10), dec!(100));
        let (realized, remaining) = pm.apply_sell("u1", "A1", dec!(4), dec!(120));
        assert_eq!(realized, dec!(80));
        assert_eq!(remaining.unwrap().tokens, dec!(6));
    }

    #[test]
    fn full_sell_removes_position() {
        let pm = PositionManager::new();
        pm.apply_buy("u1", "A1", dec!(5), dec!(100));
        let (_, remaining) = pm.apply_sell("u1", "A1", dec!(5), dec!(110));
        assert!(remaining.is_none());
        assert!(pm.get("u1", "A1").is_none());
    }

    #[test]
    fn sell_clamped_to_held_quantity() {
        let pm = PositionManager::new();
        pm.apply_buy("u1", "A1", dec!(5), dec!(100));
        let (realized, remaining) = pm.apply_sell("u1", "A1", dec!(100), dec!(110));
        assert_eq!(realized, dec!(50));
        assert!(remaining.is_none());
    }

    #[test]
    fn yield_credit_and_claim() {
        let pm = PositionManager::new();
        pm.apply_buy("u1", "A1", dec!(10), dec!(100));
        pm.credit_yield("u1", "A1", dec!(5));
        assert_eq!(pm.get("u1", "A1").unwrap().pending_yield, dec!(5));
        let claimed = pm.claim_yield("u1", "A1");
        assert_eq!(claimed, dec!(5));
        assert_eq!(pm.get("u1", "A1").unwrap().pending_yield, Decimal::ZERO);
    }

    #[test]
    fn claim_with_no_pending_yield_returns_zero() {
        let pm = PositionManager::new();
        pm.apply_buy("u1", "A1", dec!(10), dec!(100));
        assert_eq!(pm.claim_yield("u1", "A1"), Decimal::ZERO);
    }

    #[test]
    fn holders_of_excludes_zero_balance() {
        let pm = PositionManager::new();
        pm.apply_buy("u1", "A1", dec!(10), dec!(100));
        pm.apply_buy("u2", "A1", dec!(5), dec!(100));
        pm.apply_sell("u2", "A1", dec!(5), dec!(100));
        let holders = pm.holders_of("A1");
        assert_eq!(holders.len(), 1);
        assert_eq!(holders[0].user_id, "u1");
    }
}
