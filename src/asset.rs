// =============================================================================
// Asset Registry — tokenized-asset metadata, shared read with the API layer
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{AssetStatus, YieldFrequency};

/// Market this asset trades on, for `isMarketOpen` gating and REST filtering
/// (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetClass {
    Stocks,
    Options,
    Forex,
    Crypto,
    Commodities,
}

impl std::fmt::Display for AssetClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stocks => "stocks",
            Self::Options => "options",
            Self::Forex => "forex",
            Self::Crypto => "crypto",
            Self::Commodities => "commodities",
        };
        write!(f, "{s}")
    }
}

impl AssetClass {
    /// Whether this market is open for trading at `now` (UTC), per spec §6:
    /// stocks/options Mon-Fri 14:30-21:00 UTC; forex 24/5 (closed Fri 22:00
    /// UTC through Sun 22:00 UTC); crypto 24/7; commodities Mon-Fri.
    pub fn is_market_open(&self, now: DateTime<Utc>) -> bool {
        use chrono::{Timelike, Weekday};
        let weekday = now.date_naive().weekday();
        let minute_of_day = now.hour() * 60 + now.minute();

        match self {
            Self::Crypto => true,
            Self::Stocks | Self::Options => {
                let open = 14 * 60 + 30;
                let close = 21 * 60;
                !matches!(weekday, Weekday::Sat | Weekday::Sun) && (open..close).contains(&minute_of_day)
            }
            Self::Commodities => !matches!(weekday, Weekday::Sat | Weekday::Sun),
            Self::Forex => {
                let closed_from = 22 * 60;
                match weekday {
                    Weekday::Fri => minute_of_day < closed_from,
                    Weekday::Sat => false,
                    Weekday::Sun => minute_of_day >= closed_from,
                    _ => true,
                }
            }
        }
    }
}

/// A tokenized asset: an in-system accounting unit representing fractional
/// ownership. Invariant: `price > 0`; `sum(positions.tokens) <= total_supply`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub asset_id: String,
    pub symbol: String,
    pub class: AssetClass,
    pub status: AssetStatus,
    pub min_invest: Decimal,
    pub min_trade: Decimal,
    pub total_supply: Decimal,
    pub decimals: u32,
    pub price: Decimal,
    pub nav: Decimal,
    /// Accredited-investor-only compliance gate (spec §4.5 check 4).
    pub accredited_only: bool,
    pub annual_yield_pct: Decimal,
    pub yield_frequency: YieldFrequency,
    pub next_distribution: DateTime<Utc>,
    pub volume_24h: Decimal,
    pub ath: Decimal,
    pub atl: Decimal,
}

impl Asset {
    pub fn market_cap(&self) -> Decimal {
        self.price * self.total_supply
    }

    pub fn is_tradable(&self) -> bool {
        matches!(self.status, AssetStatus::Active)
    }
}

/// Shared-read registry of asset metadata. Writers go through the engine;
/// readers (HTTP layer) take copy-on-read snapshots, per spec §3's ownership
/// rule ("Asset metadata is shared-read with the HTTP layer").
pub struct AssetRegistry {
    inner: parking_lot::RwLock<HashMap<String, Asset>>,
}

impl AssetRegistry {
    pub fn new() -> Self {
        Self {
            inner: parking_lot::RwLock::new(HashMap::new()),
        }
    }

    pub fn upsert(&self, asset: Asset) {
        self.inner.write().insert(asset.asset_id.clone(), asset);
    }

    pub fn get(&self, asset_id: &str) -> Option<Asset> {
        self.inner.read().get(asset_id).cloned()
    }

    pub fn list(&self) -> Vec<Asset> {
        self.inner.read().values().cloned().collect()
    }

    /// Record a trade print against the asset's rolling 24h volume and
    /// all-time high/low, atomically with the fill that produced it
    /// (spec §4.6 invariant: "asset stats... update atomically with the
    /// Fill record").
    pub fn record_trade(&self, asset_id: &str, notional: Decimal, price: Decimal) {
        if let Some(asset) = self.inner.write().get_mut(asset_id) {
            asset.volume_24h += notional;
            asset.price = price;
            if price > asset.ath {
                asset.ath = price;
            }
            if asset.atl.is_zero() || price < asset.atl {
                asset.atl = price;
            }
        }
    }

    pub fn due_for_distribution(&self, now: DateTime<Utc>) -> Vec<Asset> {
        self.inner
            .read()
            .values()
            .filter(|a| a.next_distribution <= now && a.annual_yield_pct > Decimal::ZERO)
            .cloned()
            .collect()
    }

    pub fn advance_distribution(&self, asset_id: &str, next: DateTime<Utc>) {
        if let Some(asset) = self.inner.write().get_mut(asset_id) {
            asset.next_distribution = next;
        }
    }
}

impl Default for AssetRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample(id: &str) -> Asset {
        Asset {
            asset_id: id.to_string(),
            symbol: "REIT1".to_string(),
            class: AssetClass::Stocks,
            status: AssetStatus::Active,
            min_invest: dec!(10),
            min_trade: dec!(1),
            total_supply: dec!(100000),
            decimals: 2,
            price: dec!(52.30),
            nav: dec!(52.30),
            accredited_only: false,
            annual_yield_pct: dec!(0.085),
            yield_frequency: YieldFrequency::Weekly,
            next_distribution: Utc::now(),
            volume_24h: Decimal::ZERO,
            ath: dec!(52.30),
            atl: dec!(52.30),
        }
    }

    #[test]
    fn market_cap_computation() {
        let a = sample("A1");
        assert_eq!(a.market_cap(), dec!(52.30) * dec!(100000));
    }

    #[test]
    fn record_trade_updates_ath_atl_and_volume() {
        let reg = AssetRegistry::new();
        reg.upsert(sample("A1"));
        reg.record_trade("A1", dec!(1000), dec!(60));
        let a = reg.get("A1").unwrap();
        assert_eq!(a.ath, dec!(60));
        assert_eq!(a.volume_24h, dec!(1000));
        reg.record_trade("A1", dec!(500), dec!(40));
        let a = reg.get("A1").unwrap();
        assert_eq!(a.atl, dec!(40));
        assert_eq!(a.volume_24h, dec!(1500));
    }

    #[test]
    fn inactive_asset_not_tradable() {
        let mut a = sample("A1");
        a.status = AssetStatus::Halted;
        assert!(!a.is_tradable());
    }

    #[test]
    fn crypto_market_always_open() {
        let now = Utc::now();
        assert!(AssetClass::Crypto.is_market_open(now));
    }

    #[test]
    fn stocks_closed_outside_session_window() {
        let midnight = chrono::DateTime::parse_from_rfc3339("2024-01-08T03:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert!(!AssetClass::Stocks.is_market_open(midnight));
        let mid_session = chrono::DateTime::parse_from_rfc3339("2024-01-08T16:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert!(AssetClass::Stocks.is_market_open(mid_session));
    }

    #[test]
    fn forex_closed_saturday() {
        let saturday = chrono::DateTime::parse_from_rfc3339("2024-01-06T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert!(!AssetClass::Forex.is_market_open(saturday));
    }
}
