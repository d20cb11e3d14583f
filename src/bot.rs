// =============================================================================
// Bot Registry — per-bot config, rolling performance, and daily counters
// =============================================================================
//
// A `Bot` bundles the static config a user set (risk envelope, symbols,
// cadence) with the dynamic counters the scheduler and risk pipeline mutate
// every cycle (daily trade count, consecutive losses, missed ticks). Kept as
// one struct behind a single `RwLock` per bot, the same "one lock guards one
// logical entity" shape `risk.rs`'s `RwLock<Inner>` uses for its daily
// counters — generalised from one global entity to N per-bot entities.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::BotStatus;

/// Cadence between full scheduler cycles (spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Aggressive,
    Balanced,
    Conservative,
}

impl Mode {
    pub fn cycle_period(self) -> std::time::Duration {
        match self {
            Mode::Aggressive => std::time::Duration::from_secs(1),
            Mode::Balanced => std::time::Duration::from_secs(5),
            Mode::Conservative => std::time::Duration::from_secs(10),
        }
    }
}

/// A bot's risk envelope, set at activation and mutable via `update_config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskEnvelope {
    pub risk_per_trade: Decimal,
    pub max_position_size: Decimal,
    pub max_daily_trades: u32,
    pub max_daily_loss: Decimal,
    pub correlation_limit: f64,
    pub var_limit: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bot {
    pub bot_id: Uuid,
    pub owner: String,
    pub status: BotStatus,
    pub strategy_id: Uuid,
    pub symbols: Vec<String>,
    pub timeframes: Vec<String>,
    pub mode: Mode,
    pub auto_execute: bool,
    pub risk: RiskEnvelope,

    // Rolling performance (spec §3 Bot).
    pub win_rate: f64,
    pub profit_factor: f64,
    pub sharpe: f64,
    pub max_drawdown: f64,
    pub total_trades: u64,
    pub total_pnl: Decimal,

    // Daily counters, reset at UTC midnight.
    pub daily_trades_count: u32,
    pub daily_pnl: Decimal,
    pub consecutive_losses: u32,
    pub consecutive_wins: u32,
    pub missed_ticks: u64,
    pub paused_for_daily_trip: bool,
    pub current_date: NaiveDate,

    /// `rule_name -> last_fired_at`, for cooldown enforcement (spec §4.3).
    #[serde(default)]
    pub rule_last_fired: HashMap<String, DateTime<Utc>>,
    /// `rule_name -> fire count today`, for `maxExecutionsPerDay`.
    #[serde(default)]
    pub rule_fires_today: HashMap<String, u32>,
}

impl Bot {
    pub fn new(
        owner: impl Into<String>,
        strategy_id: Uuid,
        symbols: Vec<String>,
        timeframes: Vec<String>,
        mode: Mode,
        risk: RiskEnvelope,
    ) -> Self {
        Self {
            bot_id: Uuid::new_v4(),
            owner: owner.into(),
            status: BotStatus::Draft,
            strategy_id,
            symbols,
            timeframes,
            mode,
            auto_execute: true,
            risk,
            win_rate: 0.0,
            profit_factor: 0.0,
            sharpe: 0.0,
            max_drawdown: 0.0,
            total_trades: 0,
            total_pnl: Decimal::ZERO,
            daily_trades_count: 0,
            daily_pnl: Decimal::ZERO,
            consecutive_losses: 0,
            consecutive_wins: 0,
            missed_ticks: 0,
            paused_for_daily_trip: false,
            current_date: Utc::now().date_naive(),
            rule_last_fired: HashMap::new(),
            rule_fires_today: HashMap::new(),
        }
    }

    pub fn is_tradable(&self) -> bool {
        matches!(self.status, BotStatus::Active) && self.auto_execute && !self.paused_for_daily_trip
    }

    /// Reset daily counters when the UTC calendar date rolls over.
    pub fn maybe_reset_daily(&mut self, today: NaiveDate) {
        if self.current_date != today {
            self.current_date = today;
            self.daily_trades_count = 0;
            self.daily_pnl = Decimal::ZERO;
            self.paused_for_daily_trip = false;
            self.rule_fires_today.clear();
        }
    }

    pub fn record_trade_result(&mut self, pnl: Decimal) {
        self.total_trades += 1;
        self.total_pnl += pnl;
        self.daily_pnl += pnl;
        self.daily_trades_count += 1;
        if pnl >= Decimal::ZERO {
            self.consecutive_wins += 1;
            self.consecutive_losses = 0;
        } else {
            self.consecutive_losses += 1;
            self.consecutive_wins = 0;
        }
    }

    /// Cooldown + daily-cap check for a named rule. Returns `Err(reason)`
    /// when the rule may not fire right now.
    pub fn check_rule_budget(
        &self,
        rule_name: &str,
        cooldown_minutes: i64,
        max_per_day: u32,
        now: DateTime<Utc>,
    ) -> Result<(), &'static str> {
        if let Some(last) = self.rule_last_fired.get(rule_name) {
            if now.signed_duration_since(*last) < chrono::Duration::minutes(cooldown_minutes) {
                return Err("cooldown");
            }
        }
        if self.rule_fires_today.get(rule_name).copied().unwrap_or(0) >= max_per_day {
            return Err("cap");
        }
        Ok(())
    }

    pub fn record_rule_fire(&mut self, rule_name: &str, now: DateTime<Utc>) {
        self.rule_last_fired.insert(rule_name.to_string(), now);
        *self.rule_fires_today.entry(rule_name.to_string()).or_insert(0) += 1;
    }
}

/// Thread-safe collection of bots, one lock per bot so a slow evaluation on
/// one bot never blocks lifecycle commands on another.
pub struct BotRegistry {
    inner: parking_lot::RwLock<HashMap<Uuid, parking_lot::RwLock<Bot>>>,
}

impl BotRegistry {
    pub fn new() -> Self {
        Self {
            inner: parking_lot::RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, bot: Bot) -> Uuid {
        let id = bot.bot_id;
        self.inner.write().insert(id, parking_lot::RwLock::new(bot));
        id
    }

    pub fn get(&self, bot_id: Uuid) -> Option<Bot> {
        self.inner.read().get(&bot_id).map(|b| b.read().clone())
    }

    pub fn with_bot<R>(&self, bot_id: Uuid, f: impl FnOnce(&mut Bot) -> R) -> Option<R> {
        self.inner.read().get(&bot_id).map(|b| f(&mut b.write()))
    }

    pub fn active_bot_ids(&self) -> Vec<Uuid> {
        self.inner
            .read()
            .iter()
            .filter(|(_, b)| b.read().is_tradable())
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn all_ids(&self) -> Vec<Uuid> {
        self.inner.read().keys().copied().collect()
    }

    /// Pause every bot for the rest of the UTC day (spec §4.4 daily trip).
    pub fn pause_all_for_daily_trip(&self) {
        for bot in self.inner.read().values() {
            bot.write().paused_for_daily_trip = true;
        }
    }

    pub fn bots_for_owner(&self, owner: &str) -> Vec<Bot> {
        self.inner
            .read()
            .values()
            .map(|b| b.read().clone())
            .filter(|b| b.owner == owner)
            .collect()
    }

    /// Every bot in the registry, for the admin dashboard's aggregate view.
    pub fn all(&self) -> Vec<Bot> {
        self.inner.read().values().map(|b| b.read().clone()).collect()
    }
}

impl Default for BotRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_bot() -> Bot {
        Bot::new(
            "u1",
            Uuid::new_v4(),
            vec!["A1".into()],
            vec!["5m".into()],
            Mode::Balanced,
            RiskEnvelope {
                risk_per_trade: Decimal::new(15, 3),
                max_position_size: Decimal::new(10000, 0),
                max_daily_trades: 50,
                max_daily_loss: Decimal::new(500, 0),
                correlation_limit: 0.7,
                var_limit: Decimal::new(1000, 0),
            },
        )
    }

    #[test]
    fn daily_reset_clears_counters_on_date_change() {
        let mut bot = sample_bot();
        bot.record_trade_result(Decimal::new(-50, 0));
        assert_eq!(bot.daily_trades_count, 1);
        let tomorrow = bot.current_date.succ_opt().unwrap();
        bot.maybe_reset_daily(tomorrow);
        assert_eq!(bot.daily_trades_count, 0);
        assert_eq!(bot.daily_pnl, Decimal::ZERO);
    }

    #[test]
    fn cooldown_blocks_rapid_refire() {
        let mut bot = sample_bot();
        let now = Utc::now();
        bot.record_rule_fire("RSI_OVERSOLD", now);
        assert_eq!(
            bot.check_rule_budget("RSI_OVERSOLD", 30, 10, now + chrono::Duration::minutes(5)),
            Err("cooldown")
        );
        assert!(bot
            .check_rule_budget("RSI_OVERSOLD", 30, 10, now + chrono::Duration::minutes(31))
            .is_ok());
    }

    #[test]
    fn daily_cap_blocks_additional_fires() {
        let mut bot = sample_bot();
        let now = Utc::now();
        for _ in 0..3 {
            bot.record_rule_fire("MACD_CROSS", now - chrono::Duration::hours(1));
        }
        assert_eq!(bot.check_rule_budget("MACD_CROSS", 1, 3, now), Err("cap"));
    }
}
