// =============================================================================
// Yield & Reinvestment Engine (C7) — periodic distribution sweep
// =============================================================================
//
// Generalises the scheduler's perpetual cycle-loop idiom
// (`scheduler.rs::run_bot_cycles`) into a single hourly sweep over the asset
// registry rather than a per-bot loop: every tick, assets whose
// `next_distribution` has elapsed pay out `market_cap * annual_yield_pct /
// periodsPerYear`, split pro-rata across `PositionManager::holders_of` by
// ownership percentage (spec §4.7).
//
// A holder who opted into `reinvest` receives a synthetic buy `Fill` instead
// of a cash credit: it bypasses the order book and the usual taker fee
// entirely (`Fill::synthetic`, `order.rs`), crediting tokens directly via
// `PositionManager::apply_buy` at the asset's current `price`, the same way
// the Risk & Execution Pipeline applies a real fill.
// =============================================================================

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::asset::{Asset, AssetRegistry};
use crate::ledger::Ledger;
use crate::order::Fill;
use crate::position_engine::PositionManager;
use crate::types::{Side, YieldFrequency};

const SCAN_INTERVAL: StdDuration = StdDuration::from_secs(3600);

/// User id the non-distributed remainder of a period's yield is attributed
/// to (rounding drift from per-holder pro-rata division). Never a real
/// trading account; exists only as a ledger audit trail, per spec §4.7's
/// invariant that the period's payout accounts for every unit of yield.
const ISSUER_ACCOUNT: &str = "issuer";

fn next_distribution_after(now: DateTime<Utc>, frequency: YieldFrequency) -> DateTime<Utc> {
    match frequency {
        YieldFrequency::Daily => now + Duration::days(1),
        YieldFrequency::Weekly => now + Duration::days(7),
        YieldFrequency::Monthly => now + Duration::days(30),
        YieldFrequency::Quarterly => now + Duration::days(91),
        YieldFrequency::Annually => now + Duration::days(365),
    }
}

/// Periodically pays out yield-bearing assets to their holders.
pub struct YieldEngine {
    assets: Arc<AssetRegistry>,
    positions: Arc<PositionManager>,
    ledger: Arc<Ledger>,
    /// Ceiling on the fraction of `total_supply` a single position may hold;
    /// also enforced here so reinvestment can never push a holder past the
    /// cap the risk pipeline enforces on ordinary buys (spec §9 Open
    /// Question: resolved to "clamp, don't block" — see `reinvest_one`).
    max_ownership_pct: Decimal,
}

/// Outcome of one asset's distribution, surfaced for logging/tests.
#[derive(Debug, Clone)]
pub struct DistributionResult {
    pub asset_id: String,
    pub period_yield: Decimal,
    pub holders_paid: usize,
    pub reinvested_holders: usize,
}

impl YieldEngine {
    pub fn new(
        assets: Arc<AssetRegistry>,
        positions: Arc<PositionManager>,
        ledger: Arc<Ledger>,
        max_ownership_pct: Decimal,
    ) -> Arc<Self> {
        Arc::new(Self {
            assets,
            positions,
            ledger,
            max_ownership_pct,
        })
    }

    /// Run the hourly scan loop forever. Intended to be spawned as its own
    /// task alongside the bot scheduler.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(SCAN_INTERVAL);
        loop {
            interval.tick().await;
            self.scan(Utc::now());
        }
    }

    /// Pay out every asset whose `next_distribution` has elapsed as of `now`.
    /// Exposed separately from [`run`] so tests can drive it deterministically.
    pub fn scan(&self, now: DateTime<Utc>) -> Vec<DistributionResult> {
        let due = self.assets.due_for_distribution(now);
        let mut results = Vec::with_capacity(due.len());
        for asset in due {
            match self.distribute_one(&asset, now) {
                Ok(result) => results.push(result),
                Err(e) => warn!(asset_id = %asset.asset_id, error = %e, "distribution failed, will retry next scan"),
            }
        }
        results
    }

    fn distribute_one(&self, asset: &Asset, now: DateTime<Utc>) -> anyhow::Result<DistributionResult> {
        let period_yield = asset.market_cap() * asset.annual_yield_pct / Decimal::try_from(asset.yield_frequency.periods_per_year())?;
        let holders = self.positions.holders_of(&asset.asset_id);

        let txn_id = self.ledger.begin()?;
        let mut distributed = Decimal::ZERO;
        let mut reinvested_holders = 0usize;

        for holder in &holders {
            let ownership = holder.ownership_pct(asset.total_supply);
            let user_yield = period_yield * ownership;
            if user_yield <= Decimal::ZERO {
                continue;
            }

            if holder.reinvest {
                self.reinvest_one(txn_id, asset, &holder.user_id, user_yield)?;
                reinvested_holders += 1;
            } else {
                self.positions.credit_yield(&holder.user_id, &asset.asset_id, user_yield);
                if let Some(pos) = self.positions.get(&holder.user_id, &asset.asset_id) {
                    self.ledger.record_position(txn_id, pos)?;
                }
                self.ledger.record_yield(txn_id, &holder.user_id, &asset.asset_id, user_yield, false)?;
            }
            distributed += user_yield;
        }

        let drift = period_yield - distributed;
        if drift > Decimal::ZERO {
            debug!(asset_id = %asset.asset_id, %drift, "rounding drift absorbed into issuer account");
            self.ledger.record_yield(txn_id, ISSUER_ACCOUNT, &asset.asset_id, drift, false)?;
        }

        self.ledger.record_distribution_paid(txn_id, &asset.asset_id, period_yield)?;
        self.ledger.commit(txn_id)?;

        let next = next_distribution_after(now, asset.yield_frequency);
        self.assets.advance_distribution(&asset.asset_id, next);

        info!(
            asset_id = %asset.asset_id,
            %period_yield,
            holders = holders.len(),
            reinvested = reinvested_holders,
            next_distribution = %next,
            "yield distribution paid"
        );

        Ok(DistributionResult {
            asset_id: asset.asset_id.clone(),
            period_yield,
            holders_paid: holders.len(),
            reinvested_holders,
        })
    }

    /// Mint tokens for a reinvesting holder via a synthetic zero-fee buy
    /// fill. If minting the full `user_yield` worth of tokens would push the
    /// holder's ownership past `max_ownership_pct`, the mint is clamped to
    /// the cap and the unmintable remainder is credited as cash instead —
    /// the holder never loses the yield outright, but a reinvestment
    /// election cannot be used to bypass the ownership ceiling (spec §9 Open
    /// Question, resolved in DESIGN.md).
    fn reinvest_one(&self, txn_id: Uuid, asset: &Asset, user_id: &str, user_yield: Decimal) -> anyhow::Result<()> {
        if asset.price <= Decimal::ZERO {
            self.positions.credit_yield(user_id, &asset.asset_id, user_yield);
            if let Some(pos) = self.positions.get(user_id, &asset.asset_id) {
                self.ledger.record_position(txn_id, pos)?;
            }
            self.ledger.record_yield(txn_id, user_id, &asset.asset_id, user_yield, false)?;
            return Ok(());
        }

        let desired_tokens = user_yield / asset.price;
        let current_tokens = self
            .positions
            .get(user_id, &asset.asset_id)
            .map(|p| p.tokens)
            .unwrap_or(Decimal::ZERO);
        let cap_tokens = asset.total_supply * self.max_ownership_pct;
        let room = (cap_tokens - current_tokens).max(Decimal::ZERO);
        let mint_tokens = desired_tokens.min(room);
        let minted_value = mint_tokens * asset.price;
        let cash_remainder = user_yield - minted_value;

        if mint_tokens > Decimal::ZERO {
            let pos = self.positions.apply_buy(user_id, &asset.asset_id, mint_tokens, asset.price);
            let mut fill = Fill::new(Uuid::new_v4(), &asset.asset_id, Side::Buy, mint_tokens, asset.price, dec!(0));
            fill.synthetic = true;
            self.ledger.record_fill(txn_id, fill)?;
            self.ledger.record_position(txn_id, pos)?;
        }

        if cash_remainder > Decimal::ZERO {
            self.positions.credit_yield(user_id, &asset.asset_id, cash_remainder);
            if let Some(pos) = self.positions.get(user_id, &asset.asset_id) {
                self.ledger.record_position(txn_id, pos)?;
            }
        }

        self.ledger.record_yield(txn_id, user_id, &asset.asset_id, user_yield, mint_tokens > Decimal::ZERO)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AssetStatus;

    fn sample_asset(id: &str, annual_yield_pct: Decimal) -> Asset {
        Asset {
            asset_id: id.to_string(),
            symbol: "REIT1".to_string(),
            class: crate::asset::AssetClass::Stocks,
            status: AssetStatus::Active,
            min_invest: dec!(10),
            min_trade: dec!(1),
            total_supply: dec!(1000),
            decimals: 2,
            price: dec!(10),
            nav: dec!(10),
            accredited_only: false,
            annual_yield_pct,
            yield_frequency: YieldFrequency::Weekly,
            next_distribution: Utc::now() - Duration::minutes(1),
            volume_24h: Decimal::ZERO,
            ath: dec!(10),
            atl: dec!(10),
        }
    }

    fn engine() -> (Arc<YieldEngine>, Arc<AssetRegistry>, Arc<PositionManager>) {
        let assets = Arc::new(AssetRegistry::new());
        let positions = Arc::new(PositionManager::new());
        let ledger = Arc::new(Ledger::open(tempfile::NamedTempFile::new().unwrap().path()).unwrap());
        let engine = YieldEngine::new(assets.clone(), positions.clone(), ledger, dec!(0.20));
        (engine, assets, positions)
    }

    #[test]
    fn credits_cash_yield_pro_rata() {
        let (engine, assets, positions) = engine();
        let asset = sample_asset("A1", dec!(0.52));
        assets.upsert(asset.clone());
        positions.apply_buy("u1", "A1", dec!(600), dec!(10));
        positions.apply_buy("u2", "A1", dec!(400), dec!(10));

        let results = engine.scan(Utc::now());
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].holders_paid, 2);

        let p1 = positions.get("u1", "A1").unwrap();
        let p2 = positions.get("u2", "A1").unwrap();
        let period_yield = asset.market_cap() * asset.annual_yield_pct / Decimal::try_from(52.0).unwrap();
        assert_eq!(p1.pending_yield, period_yield * dec!(0.6));
        assert_eq!(p2.pending_yield, period_yield * dec!(0.4));
    }

    #[test]
    fn advances_next_distribution_after_payout() {
        let (engine, assets, positions) = engine();
        let asset = sample_asset("A1", dec!(0.52));
        let before = asset.next_distribution;
        assets.upsert(asset);
        positions.apply_buy("u1", "A1", dec!(100), dec!(10));

        engine.scan(Utc::now());
        let after = assets.get("A1").unwrap().next_distribution;
        assert!(after > before);
    }

    #[test]
    fn reinvesting_holder_receives_synthetic_tokens_not_cash() {
        let (engine, assets, positions) = engine();
        let asset = sample_asset("A1", dec!(0.52));
        assets.upsert(asset);
        positions.apply_buy("u1", "A1", dec!(100), dec!(10));
        positions.set_reinvest("u1", "A1", true);

        let before_tokens = positions.get("u1", "A1").unwrap().tokens;
        engine.scan(Utc::now());
        let after = positions.get("u1", "A1").unwrap();
        assert!(after.tokens > before_tokens);
        assert_eq!(after.pending_yield, Decimal::ZERO);
    }

    #[test]
    fn reinvestment_clamped_at_max_ownership_pct() {
        let (engine, assets, positions) = engine();
        // Huge yield relative to supply so the naive mint would blow past the cap.
        let asset = sample_asset("A1", dec!(50));
        assets.upsert(asset);
        positions.apply_buy("u1", "A1", dec!(100), dec!(10));
        positions.set_reinvest("u1", "A1", true);

        engine.scan(Utc::now());
        let after = positions.get("u1", "A1").unwrap();
        let cap = dec!(1000) * dec!(0.20);
        assert!(after.tokens <= cap);
        // Remainder that couldn't be minted is credited as cash instead of lost.
        assert!(after.pending_yield > Decimal::ZERO);
    }

    #[test]
    fn non_distributed_drift_recorded_against_issuer() {
        let (engine, assets, positions) = engine();
        let asset = sample_asset("A1", dec!(0.52));
        assets.upsert(asset);
        // No holders at all -- entire period_yield is drift.
        let results = engine.scan(Utc::now());
        assert_eq!(results[0].holders_paid, 0);
    }

    #[test]
    fn asset_not_yet_due_is_skipped() {
        let (engine, assets, _positions) = engine();
        let mut asset = sample_asset("A1", dec!(0.52));
        asset.next_distribution = Utc::now() + Duration::days(1);
        assets.upsert(asset);
        let results = engine.scan(Utc::now());
        assert!(results.is_empty());
    }
}
