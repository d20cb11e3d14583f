// =============================================================================
// Risk & Execution Pipeline (C5) — seven fail-fast pre-trade checks, position
// sizing, fee model, and idempotent signal -> order routing
// =============================================================================
//
// Directly generalises `risk.rs`'s `can_trade() -> (bool, Option<String>)`
// fail-fast sequential-check pattern — already structurally a miniature of
// this pipeline — into the full seven checks from spec §4.5: engine brake,
// bot state, asset state, compliance, duplicate position, correlation cap,
// VaR cap. Position sizing and the idempotent signal->order mapping are new
// logic layered on top, backed by the Ledger (C8). Execution routing reuses
// `execution.rs`'s `Blocked`/`Placed`/`Error` shape, widened into
// [`PipelineOutcome`] to also distinguish a resting limit from an immediate
// fill.
//
// Correlation and VaR are left to the implementer by spec §9's open
// questions. This pipeline estimates both from the Indicator Cache's closed
// series rather than stubbing them: correlation is the Pearson coefficient
// of daily-bar returns between the proposed asset and each currently open
// position; VaR is parametric, 1-day 99% (`z = 2.33`), with sigma taken from
// `ATR(14) / price` the same way the Strategy Evaluator's `volatility_above`
// leaf reads volatility (`evaluator.rs::atr_over_price`).
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{info, warn};
use uuid::Uuid;

use crate::asset::{AssetClass, AssetRegistry};
use crate::bot::BotRegistry;
use crate::errors::{EngineError, ErrorCode};
use crate::indicator_cache::IndicatorCache;
use crate::indicators::IndicatorKind;
use crate::ledger::{Ledger, ReplayState};
use crate::market_data::Quote;
use crate::order::{Fill, Order};
use crate::orderbook::BookManager;
use crate::position_engine::PositionManager;
use crate::signal::Signal;
use crate::strategy::RuleAction;
use crate::types::{OrderType, Side};

/// 1-day 99% parametric VaR z-score.
const VAR_Z_99: f64 = 2.33;
/// ATR lookback used for the correlation/VaR volatility proxy.
const VOL_PERIOD: u32 = 14;
/// Lookback window (closed bars) for the correlation estimate.
const CORRELATION_LOOKBACK: usize = 30;
/// Flat taker fee, in basis points of notional (spec §4.5).
const DEFAULT_FEE_BPS: u32 = 10;

/// Extra, caller-supplied facts the pipeline cannot derive from engine state
/// alone: which user this signal trades for, whether they are accredited,
/// and whether they are a whitelisted operator account (exempt from the
/// platform fee). Whether scaling into an existing position is permitted is
/// read from `signal.action` (`RuleAction::ScaleIn`) rather than duplicated
/// here.
pub struct SignalContext<'a> {
    pub user_id: &'a str,
    pub account_balance: Decimal,
    pub user_accredited: bool,
    pub is_whitelisted_operator: bool,
    pub quote: Quote,
    pub timeframe: &'a str,
}

/// Result of routing one signal through the pipeline.
#[derive(Debug, Clone)]
pub enum PipelineOutcome {
    /// Order fully or partially filled immediately.
    Filled { order: Order, fills: Vec<Fill> },
    /// Order rested on the book (limit order with no marketable match).
    Resting { order: Order },
    /// Rejected before reaching the book; never touches positions or fees.
    Rejected { code: ErrorCode, reason: String },
}

/// Idempotent `signal_id -> order_id` map plus the order store itself, so a
/// retried signal returns the order already on file instead of double-
/// booking (spec §4.5 "Idempotency").
pub struct OrderRegistry {
    orders: RwLock<HashMap<Uuid, Order>>,
    signal_to_order: RwLock<HashMap<Uuid, Uuid>>,
}

impl OrderRegistry {
    pub fn new() -> Self {
        Self {
            orders: RwLock::new(HashMap::new()),
            signal_to_order: RwLock::new(HashMap::new()),
        }
    }

    /// Rehydrate from a ledger replay at startup.
    pub fn restore(&self, state: &ReplayState) {
        *self.orders.write() = state.orders.clone();
        *self.signal_to_order.write() = state.signal_to_order.clone();
    }

    pub fn existing_for_signal(&self, signal_id: Uuid) -> Option<Order> {
        let order_id = *self.signal_to_order.read().get(&signal_id)?;
        self.orders.read().get(&order_id).cloned()
    }

    fn insert(&self, signal_id: Option<Uuid>, order: Order) {
        let order_id = order.order_id;
        if let Some(sig) = signal_id {
            self.signal_to_order.write().insert(sig, order_id);
        }
        self.orders.write().insert(order_id, order);
    }

    fn update(&self, order: Order) {
        self.orders.write().insert(order.order_id, order);
    }

    pub fn get(&self, order_id: Uuid) -> Option<Order> {
        self.orders.read().get(&order_id).cloned()
    }
}

impl Default for OrderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Pearson correlation of period-over-period returns between two symbols'
/// closed-bar series. Returns `0.0` (uncorrelated, i.e. permissive) when
/// either series lacks enough history — a fresh listing should not itself
/// block trading on an unrelated asset.
fn estimate_correlation(indicators: &IndicatorCache, a: &str, b: &str, timeframe: &str) -> f64 {
    let ca = indicators.closes(a, timeframe);
    let cb = indicators.closes(b, timeframe);
    let n = ca.len().min(cb.len());
    if n < 3 {
        return 0.0;
    }
    let ra: Vec<f64> = ca[ca.len() - n..].windows(2).map(|w| w[1] / w[0] - 1.0).collect();
    let rb: Vec<f64> = cb[cb.len() - n..].windows(2).map(|w| w[1] / w[0] - 1.0).collect();
    let len = ra.len().min(rb.len()).min(CORRELATION_LOOKBACK);
    if len < 2 {
        return 0.0;
    }
    let ra = &ra[ra.len() - len..];
    let rb = &rb[rb.len() - len..];
    let mean_a = ra.iter().sum::<f64>() / len as f64;
    let mean_b = rb.iter().sum::<f64>() / len as f64;
    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for i in 0..len {
        let da = ra[i] - mean_a;
        let db = rb[i] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    if var_a <= 0.0 || var_b <= 0.0 {
        return 0.0;
    }
    (cov / (var_a.sqrt() * var_b.sqrt())).clamp(-1.0, 1.0)
}

/// `ATR(14) / price`, the same volatility proxy the Strategy Evaluator's
/// `volatility_above/below` leaves read. Falls back to a conservative 2%
/// daily sigma when the series is stale or too short, rather than letting a
/// cold-start asset bypass the VaR check entirely.
fn sigma_pct(indicators: &IndicatorCache, symbol: &str, timeframe: &str, price: f64) -> f64 {
    if price <= 0.0 {
        return 0.02;
    }
    indicators
        .get(symbol, timeframe, IndicatorKind::Atr, VOL_PERIOD)
        .map(|atr| atr / price)
        .unwrap_or(0.02)
}

fn to_f64(d: Decimal) -> f64 {
    d.to_f64().unwrap_or(0.0)
}

fn parametric_var(notional: Decimal, sigma_pct: f64) -> Decimal {
    let notional_f = to_f64(notional);
    Decimal::try_from((notional_f * sigma_pct * VAR_Z_99).max(0.0)).unwrap_or(Decimal::ZERO)
}

/// The full Risk & Execution Pipeline: seven fail-fast pre-trade checks,
/// position sizing, fee application, and routing through the order book.
pub struct RiskPipeline {
    /// `Some(reason)` while the global emergency brake is engaged (spec
    /// §4.5 check 1, §9 "Emergency Brake"). Release requires the exact
    /// confirmation phrase at the REST layer; this struct only tracks state.
    brake: RwLock<Option<String>>,
    bots: Arc<BotRegistry>,
    assets: Arc<AssetRegistry>,
    positions: Arc<PositionManager>,
    books: Arc<BookManager>,
    ledger: Arc<Ledger>,
    indicators: Arc<IndicatorCache>,
    pub orders: Arc<OrderRegistry>,
    fee_bps: Decimal,
    platform_fee_pct: Decimal,
}

impl RiskPipeline {
    pub fn new(
        bots: Arc<BotRegistry>,
        assets: Arc<AssetRegistry>,
        positions: Arc<PositionManager>,
        books: Arc<BookManager>,
        ledger: Arc<Ledger>,
        indicators: Arc<IndicatorCache>,
    ) -> Self {
        Self {
            brake: RwLock::new(None),
            bots,
            assets,
            positions,
            books,
            ledger,
            indicators,
            orders: Arc::new(OrderRegistry::new()),
            fee_bps: Decimal::from(DEFAULT_FEE_BPS),
            platform_fee_pct: dec!(0.10),
        }
    }

    pub fn engage_brake(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(reason = %reason, "emergency brake engaged");
        *self.brake.write() = Some(reason);
    }

    /// Release requires the caller (REST layer) to have already validated
    /// the `RELEASE_EMERGENCY_BRAKE` confirmation phrase (spec §6).
    pub fn release_brake(&self) {
        info!("emergency brake released");
        *self.brake.write() = None;
    }

    pub fn brake_active(&self) -> bool {
        self.brake.read().is_some()
    }

    /// Route one signal through the full pipeline. Idempotent: a second call
    /// with the same `signal.signal_id` returns the previously-placed order
    /// without re-running checks or touching the book again.
    pub fn process_signal(&self, signal: &Signal, ctx: &SignalContext) -> PipelineOutcome {
        if let Some(existing) = self.orders.existing_for_signal(signal.signal_id) {
            return match existing.status {
                crate::types::OrderStatus::Rejected => PipelineOutcome::Rejected {
                    code: ErrorCode::DuplicatePosition,
                    reason: "signal already processed".to_string(),
                },
                _ => PipelineOutcome::Resting { order: existing },
            };
        }

        let txn = match self.ledger.begin() {
            Ok(t) => t,
            Err(e) => {
                return PipelineOutcome::Rejected {
                    code: ErrorCode::LedgerWriteFailure,
                    reason: e.to_string(),
                }
            }
        };
        let _ = self.ledger.record_signal_emitted(txn, signal.clone());

        match self.check_and_size(signal, ctx) {
            Ok((bot_id, qty, order_type)) => {
                let order = Order::new(
                    ctx.user_id,
                    &signal.asset_id,
                    signal.side,
                    order_type,
                    qty,
                    None,
                    None,
                    Some(signal.signal_id),
                );
                let _ = self.ledger.record_order_placed(txn, order.clone());
                self.orders.insert(Some(signal.signal_id), order.clone());
                let outcome = self.route_to_book(txn, order, ctx, bot_id);
                let _ = self.ledger.commit(txn);
                outcome
            }
            Err((code, reason)) => {
                let _ = self
                    .ledger
                    .record_order_rejected(txn, signal.signal_id, code.to_string(), reason.clone());
                let _ = self.ledger.commit(txn);
                PipelineOutcome::Rejected { code, reason }
            }
        }
    }

    /// Checks 1-7 plus position sizing. Returns `(bot_id, qty, order_type)`
    /// on success or `(code, reason)` on the first failing check.
    fn check_and_size(
        &self,
        signal: &Signal,
        ctx: &SignalContext,
    ) -> Result<(Uuid, Decimal, OrderType), (ErrorCode, String)> {
        // 1. Engine state.
        if let Some(reason) = self.brake.read().clone() {
            return Err((ErrorCode::BrakeActive, reason));
        }

        // 2. Bot state.
        let bot = self
            .bots
            .get(signal.bot_id)
            .ok_or((ErrorCode::MalformedRequest, "unknown bot".to_string()))?;
        if !bot.is_tradable() {
            return Err((ErrorCode::CapReached, "bot is not active or paused for daily trip".to_string()));
        }
        if bot.daily_trades_count >= bot.risk.max_daily_trades {
            return Err((ErrorCode::CapReached, "bot daily trade cap reached".to_string()));
        }

        // 3. Asset state.
        let asset = self
            .assets
            .get(&signal.asset_id)
            .ok_or((ErrorCode::UnknownSymbol, format!("unknown asset {}", signal.asset_id)))?;
        if !asset.is_tradable() {
            return Err((ErrorCode::AssetInactive, format!("{} is not active", signal.asset_id)));
        }

        // 4. Compliance.
        if asset.accredited_only && !ctx.user_accredited {
            return Err((ErrorCode::ComplianceDenied, "asset restricted to accredited investors".to_string()));
        }

        // 5. Duplicate position.
        let held_side = self.positions.side_of(ctx.user_id, &signal.asset_id);
        if held_side == Some(signal.side) && signal.action != RuleAction::ScaleIn {
            return Err((
                ErrorCode::DuplicatePosition,
                "bot already holds an open position on this side".to_string(),
            ));
        }

        // 6. Correlation cap.
        let open_positions = self.positions.positions_for_user(ctx.user_id);
        for pos in &open_positions {
            if pos.asset_id == signal.asset_id {
                continue;
            }
            let corr = estimate_correlation(&self.indicators, &signal.asset_id, &pos.asset_id, ctx.timeframe);
            if corr.abs() > bot.risk.correlation_limit {
                return Err((
                    ErrorCode::CorrelationCapExceeded,
                    format!("correlation {corr:.2} with {} exceeds limit {:.2}", pos.asset_id, bot.risk.correlation_limit),
                ));
            }
        }

        // Position sizing.
        let risk_amount = ctx.account_balance * bot.risk.risk_per_trade * Decimal::try_from(signal.confidence).unwrap_or(Decimal::ONE);
        let exec_price = match signal.side {
            Side::Buy => Decimal::try_from(ctx.quote.ask).unwrap_or(asset.price),
            Side::Sell => Decimal::try_from(ctx.quote.bid).unwrap_or(asset.price),
        };
        if exec_price <= Decimal::ZERO {
            return Err((ErrorCode::MalformedRequest, "non-positive execution price".to_string()));
        }
        let fee_adjusted_price = exec_price * (Decimal::ONE + self.fee_bps / Decimal::from(10_000));
        let mut qty = risk_amount / fee_adjusted_price;
        qty = qty.min(bot.risk.max_position_size);
        if qty < asset.min_trade {
            return Err((
                ErrorCode::BelowMinimum,
                format!("sized qty {qty} below asset minimum {}", asset.min_trade),
            ));
        }

        // 7. VaR cap.
        let proposed_notional = qty * exec_price;
        let proposed_sigma = sigma_pct(&self.indicators, &signal.asset_id, ctx.timeframe, to_f64(exec_price));
        let mut total_var = parametric_var(proposed_notional, proposed_sigma);
        for pos in &open_positions {
            let pos_price = self.assets.get(&pos.asset_id).map(|a| a.price).unwrap_or(pos.cost_basis);
            let pos_notional = pos.tokens * pos_price;
            let pos_sigma = sigma_pct(&self.indicators, &pos.asset_id, ctx.timeframe, to_f64(pos_price));
            total_var += parametric_var(pos_notional, pos_sigma);
        }
        if total_var > bot.risk.var_limit {
            return Err((
                ErrorCode::VarCapExceeded,
                format!("portfolio VaR {total_var} exceeds limit {}", bot.risk.var_limit),
            ));
        }

        Ok((bot.bot_id, qty, OrderType::Market))
    }

    /// Submit the sized order to the asset's book, apply fills to positions
    /// and asset stats atomically with the Fill record (spec §4.6), and
    /// charge the flat taker fee plus any platform fee on a realised gain.
    fn route_to_book(&self, txn: Uuid, mut order: Order, ctx: &SignalContext, bot_id: Uuid) -> PipelineOutcome {
        let match_result = self.books.with_book(&order.asset_id, |book| {
            book.submit_market(order.order_id, ctx.user_id, order.side, order.qty)
        });

        let outcome = match match_result {
            Ok(o) => o,
            Err(e) => {
                order.status = crate::types::OrderStatus::Rejected;
                self.orders.update(order.clone());
                let _ = self.ledger.record_order_rejected(txn, order.signal_id.unwrap_or(order.order_id), e.code.to_string(), e.message.clone());
                return PipelineOutcome::Rejected { code: e.code, reason: e.message };
            }
        };

        let mut fills = Vec::new();
        for mf in outcome.fills.iter().filter(|f| f.user_id == ctx.user_id) {
            let fee = if order.order_type == OrderType::Market || order.limit_price.is_some() {
                mf.qty * mf.price * self.fee_bps / Decimal::from(10_000)
            } else {
                Decimal::ZERO
            };
            let fill = Fill::new(order.order_id, &order.asset_id, mf.side, mf.qty, mf.price, fee);
            order.apply_fill(mf.qty, mf.price);
            let _ = self.ledger.record_fill(txn, fill.clone());
            let _ = self.ledger.record_fee_charged(txn, ctx.user_id, &order.asset_id, fee, "taker");
            self.assets.record_trade(&order.asset_id, fill.notional(), mf.price);

            match mf.side {
                Side::Buy => {
                    let pos = self.positions.apply_buy(ctx.user_id, &order.asset_id, mf.qty, mf.price);
                    let _ = self.ledger.record_position(txn, pos);
                }
                Side::Sell => {
                    let (realized, remaining) = self.positions.apply_sell(ctx.user_id, &order.asset_id, mf.qty, mf.price);
                    if let Some(pos) = remaining {
                        let _ = self.ledger.record_position(txn, pos);
                    }
                    // Platform fee: 10% of a realised gain only, never on a
                    // loss, and waived for whitelisted operator accounts
                    // (spec §4.5).
                    if realized > Decimal::ZERO && !ctx.is_whitelisted_operator {
                        let platform_fee = realized * self.platform_fee_pct;
                        let _ = self.ledger.record_fee_charged(txn, ctx.user_id, &order.asset_id, platform_fee, "platform");
                    }
                    self.bots.with_bot(bot_id, |b| b.record_trade_result(realized));
                }
            }
            fills.push(fill);
        }

        self.orders.update(order.clone());

        if outcome.resting {
            PipelineOutcome::Resting { order }
        } else {
            PipelineOutcome::Filled { order, fills }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::Asset;
    use crate::bot::{Bot, Mode, RiskEnvelope};
    use crate::types::{AssetStatus, BotStatus, YieldFrequency};
    use tempfile::NamedTempFile;

    fn pipeline() -> (RiskPipeline, Uuid, String) {
        let bots = Arc::new(BotRegistry::new());
        let assets = Arc::new(AssetRegistry::new());
        let positions = Arc::new(PositionManager::new());
        let books = Arc::new(BookManager::new());
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path().to_path_buf();
        drop(tmp);
        let ledger = Arc::new(Ledger::open(&path).unwrap());
        let indicators = Arc::new(IndicatorCache::new());

        let mut bot = Bot::new(
            "owner1",
            Uuid::new_v4(),
            vec!["A1".into()],
            vec!["5m".into()],
            Mode::Balanced,
            RiskEnvelope {
                risk_per_trade: dec!(0.02),
                max_position_size: dec!(1000),
                max_daily_trades: 50,
                max_daily_loss: dec!(500),
                correlation_limit: 0.9,
                var_limit: dec!(100000),
            },
        );
        bot.status = BotStatus::Active;
        let bot_id = bot.bot_id;
        bots.insert(bot);

        assets.upsert(Asset {
            asset_id: "A1".to_string(),
            symbol: "A1".to_string(),
            class: AssetClass::Crypto,
            status: AssetStatus::Active,
            min_invest: dec!(10),
            min_trade: dec!(1),
            total_supply: dec!(1_000_000),
            decimals: 2,
            price: dec!(100),
            nav: dec!(100),
            accredited_only: false,
            annual_yield_pct: Decimal::ZERO,
            yield_frequency: YieldFrequency::Monthly,
            next_distribution: chrono::Utc::now(),
            volume_24h: Decimal::ZERO,
            ath: dec!(100),
            atl: dec!(100),
        });

        let pipeline = RiskPipeline::new(bots, assets, positions, books, ledger, indicators);
        (pipeline, bot_id, "user1".to_string())
    }

    fn sample_quote() -> Quote {
        Quote { bid: 99.9, ask: 100.1, last: 100.0, volume_24h: 10_000.0, ts: 0 }
    }

    #[test]
    fn market_buy_fills_against_seeded_liquidity() {
        let (pipeline, bot_id, user) = pipeline();
        pipeline.books.with_book("A1", |book| {
            book.submit_limit(
                Uuid::new_v4(),
                "maker",
                Side::Sell,
                dec!(100),
                dec!(100),
                chrono::Utc::now() + chrono::Duration::days(7),
            )
        });

        let signal = Signal::new(bot_id, "A1", Side::Buy, RuleAction::Buy, 0.9, "TEST_RULE");
        let ctx = SignalContext {
            user_id: &user,
            account_balance: dec!(10_000),
            user_accredited: false,
            is_whitelisted_operator: false,
            quote: sample_quote(),
            timeframe: "5m",
        };
        match pipeline.process_signal(&signal, &ctx) {
            PipelineOutcome::Filled { order, fills } => {
                assert!(!fills.is_empty());
                assert_eq!(order.status, crate::types::OrderStatus::Filled);
            }
            other => panic!("expected a fill, got {other:?}"),
        }
    }

    #[test]
    fn retrying_same_signal_id_does_not_double_book() {
        let (pipeline, bot_id, user) = pipeline();
        pipeline.books.with_book("A1", |book| {
            book.submit_limit(
                Uuid::new_v4(),
                "maker",
                Side::Sell,
                dec!(100),
                dec!(100),
                chrono::Utc::now() + chrono::Duration::days(7),
            )
        });
        let signal = Signal::new(bot_id, "A1", Side::Buy, RuleAction::Buy, 0.9, "TEST_RULE");
        let ctx = SignalContext {
            user_id: &user,
            account_balance: dec!(10_000),
            user_accredited: false,
            is_whitelisted_operator: false,
            quote: sample_quote(),
            timeframe: "5m",
        };
        let first = pipeline.process_signal(&signal, &ctx);
        let second = pipeline.process_signal(&signal, &ctx);
        let (PipelineOutcome::Filled { order: o1, .. } | PipelineOutcome::Resting { order: o1 }) = first else {
            panic!("expected order from first call");
        };
        let (PipelineOutcome::Filled { order: o2, .. } | PipelineOutcome::Resting { order: o2 }) = second else {
            panic!("expected order from second call");
        };
        assert_eq!(o1.order_id, o2.order_id);
    }

    #[test]
    fn inactive_asset_rejected() {
        let (pipeline, bot_id, user) = pipeline();
        pipeline.assets.upsert(Asset {
            asset_id: "A1".to_string(),
            symbol: "A1".to_string(),
            class: AssetClass::Crypto,
            status: AssetStatus::Halted,
            min_invest: dec!(10),
            min_trade: dec!(1),
            total_supply: dec!(1_000_000),
            decimals: 2,
            price: dec!(100),
            nav: dec!(100),
            accredited_only: false,
            annual_yield_pct: Decimal::ZERO,
            yield_frequency: YieldFrequency::Monthly,
            next_distribution: chrono::Utc::now(),
            volume_24h: Decimal::ZERO,
            ath: dec!(100),
            atl: dec!(100),
        });
        let signal = Signal::new(bot_id, "A1", Side::Buy, RuleAction::Buy, 0.9, "TEST_RULE");
        let ctx = SignalContext {
            user_id: &user,
            account_balance: dec!(10_000),
            user_accredited: false,
            is_whitelisted_operator: false,
            quote: sample_quote(),
            timeframe: "5m",
        };
        match pipeline.process_signal(&signal, &ctx) {
            PipelineOutcome::Rejected { code, .. } => assert_eq!(code, ErrorCode::AssetInactive),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn realized_pnl_from_a_sell_feeds_the_bots_daily_pnl() {
        let (pipeline, bot_id, user) = pipeline();

        // Fill a buy at 100.1 (the seeded ask) to open a position.
        pipeline.books.with_book("A1", |book| {
            book.submit_limit(Uuid::new_v4(), "maker", Side::Sell, dec!(100), dec!(100), chrono::Utc::now() + chrono::Duration::days(7))
        });
        let buy_signal = Signal::new(bot_id, "A1", Side::Buy, RuleAction::Buy, 0.9, "TEST_RULE");
        let buy_ctx = SignalContext {
            user_id: &user,
            account_balance: dec!(10_000),
            user_accredited: false,
            is_whitelisted_operator: false,
            quote: sample_quote(),
            timeframe: "5m",
        };
        match pipeline.process_signal(&buy_signal, &buy_ctx) {
            PipelineOutcome::Filled { .. } => {}
            other => panic!("expected buy fill, got {other:?}"),
        }

        // Fill a sell at a lower price than the cost basis, booking a loss.
        pipeline.books.with_book("A1", |book| {
            book.submit_limit(Uuid::new_v4(), "maker", Side::Buy, dec!(100), dec!(50), chrono::Utc::now() + chrono::Duration::days(7))
        });
        let sell_ctx = SignalContext {
            user_id: &user,
            account_balance: dec!(10_000),
            user_accredited: false,
            is_whitelisted_operator: false,
            quote: Quote { bid: 50.0, ask: 50.2, last: 50.0, volume_24h: 10_000.0, ts: 0 },
            timeframe: "5m",
        };
        let sell_signal = Signal::new(bot_id, "A1", Side::Sell, RuleAction::Sell, 0.9, "TEST_RULE");
        match pipeline.process_signal(&sell_signal, &sell_ctx) {
            PipelineOutcome::Filled { .. } => {}
            other => panic!("expected sell fill, got {other:?}"),
        }

        let bot = pipeline.bots.get(bot_id).unwrap();
        assert!(bot.daily_pnl < Decimal::ZERO, "daily_pnl should reflect the realised loss, got {}", bot.daily_pnl);
        assert_eq!(bot.total_trades, 1);
    }

    #[test]
    fn brake_active_rejects_before_any_other_check() {
        let (pipeline, bot_id, user) = pipeline();
        pipeline.engage_brake("operator halt");
        let signal = Signal::new(bot_id, "A1", Side::Buy, RuleAction::Buy, 0.9, "TEST_RULE");
        let ctx = SignalContext {
            user_id: &user,
            account_balance: dec!(10_000),
            user_accredited: false,
            is_whitelisted_operator: false,
            quote: sample_quote(),
            timeframe: "5m",
        };
        match pipeline.process_signal(&signal, &ctx) {
            PipelineOutcome::Rejected { code, .. } => assert_eq!(code, ErrorCode::BrakeActive),
            other => panic!("expected rejection, got {other:?}"),
        }
    }
}
