// =============================================================================
// Central Application State — Trading Execution Core
// =============================================================================
//
// The single Engine aggregate the rest of the system hangs off: every
// subsystem (bots, strategies, positions, assets, the order book, the
// indicator cache, regime detection, the knowledge base, market data, the
// ledger, the risk pipeline, the scheduler, the yield engine) lives behind
// its own `Arc` and owns its own interior mutability; `AppState` just ties
// them together and provides a unified snapshot for the REST/WebSocket
// dashboard feed, the same "one struct, one lock per concern" shape the
// teacher's state object used, generalised from exchange-account state to
// the full multi-subsystem engine.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::info;

use crate::asset::AssetRegistry;
use crate::bot::BotRegistry;
use crate::decision_envelope::DecisionEnvelope;
use crate::execution_pipeline::RiskPipeline;
use crate::indicator_cache::IndicatorCache;
use crate::knowledge_base::KnowledgeBase;
use crate::ledger::Ledger;
use crate::market_data::MarketDataAggregator;
use crate::orderbook::BookManager;
use crate::position_engine::{Position, PositionManager};
use crate::regime::RegimeDetector;
use crate::runtime_config::RuntimeConfig;
use crate::scheduler::Scheduler;
use crate::strategy::StrategyRegistry;
use crate::yield_engine::YieldEngine;

/// Maximum number of recent decisions to retain for the audit-trail endpoint.
const MAX_RECENT_DECISIONS: usize = 200;

/// Subsystems `AppState::new` assembles into the engine. Every field is
/// already fully constructed (config loaded, ledger replayed, scheduler
/// wired) by the time this reaches `AppState` — mirrors the scheduler's own
/// `SchedulerDeps` grouping idiom, one level up.
pub struct AppStateDeps {
    pub runtime_config: RuntimeConfig,
    pub bots: Arc<BotRegistry>,
    pub strategies: Arc<StrategyRegistry>,
    pub positions: Arc<PositionManager>,
    pub assets: Arc<AssetRegistry>,
    pub books: Arc<BookManager>,
    pub indicators: Arc<IndicatorCache>,
    pub regime_detector: Arc<RegimeDetector>,
    pub knowledge_base: Arc<KnowledgeBase>,
    pub market_data: Arc<MarketDataAggregator>,
    pub ledger: Arc<Ledger>,
    pub risk: Arc<RiskPipeline>,
    pub scheduler: Arc<Scheduler>,
    pub yield_engine: Arc<YieldEngine>,
}

/// Central application state shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    /// Monotonically increasing version counter. Incremented on every
    /// meaningful mutation; the WebSocket feed uses this to detect changes
    /// and decide whether to push a fresh snapshot.
    pub state_version: AtomicU64,
    /// WebSocket message sequence number (incremented per message sent).
    pub ws_sequence_number: AtomicU64,

    pub runtime_config: RwLock<RuntimeConfig>,

    pub bots: Arc<BotRegistry>,
    pub strategies: Arc<StrategyRegistry>,
    pub positions: Arc<PositionManager>,
    pub assets: Arc<AssetRegistry>,
    pub books: Arc<BookManager>,
    pub indicators: Arc<IndicatorCache>,
    pub regime_detector: Arc<RegimeDetector>,
    pub knowledge_base: Arc<KnowledgeBase>,
    pub market_data: Arc<MarketDataAggregator>,
    pub ledger: Arc<Ledger>,
    pub risk: Arc<RiskPipeline>,
    pub scheduler: Arc<Scheduler>,
    pub yield_engine: Arc<YieldEngine>,

    /// Bounded ring of recent trade/no-trade decisions, for `/api/v1/decisions`.
    pub recent_decisions: RwLock<Vec<DecisionEnvelope>>,

    /// Last time the user-facing WebSocket connection observed any traffic,
    /// for the dashboard's connection-health indicator.
    pub last_ws_user_event: RwLock<Instant>,
    pub ws_user_connected: RwLock<bool>,

    pub start_time: Instant,
}

impl AppState {
    pub fn new(deps: AppStateDeps) -> Self {
        Self {
            state_version: AtomicU64::new(1),
            ws_sequence_number: AtomicU64::new(0),

            runtime_config: RwLock::new(deps.runtime_config),

            bots: deps.bots,
            strategies: deps.strategies,
            positions: deps.positions,
            assets: deps.assets,
            books: deps.books,
            indicators: deps.indicators,
            regime_detector: deps.regime_detector,
            knowledge_base: deps.knowledge_base,
            market_data: deps.market_data,
            ledger: deps.ledger,
            risk: deps.risk,
            scheduler: deps.scheduler,
            yield_engine: deps.yield_engine,

            recent_decisions: RwLock::new(Vec::new()),
            last_ws_user_event: RwLock::new(Instant::now()),
            ws_user_connected: RwLock::new(false),

            start_time: Instant::now(),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Start every background task the engine owns: one per-bot cycle loop
    /// per `self.bots.all_ids()` at call time, plus the hourly yield sweep.
    /// Returns the `JoinSet` driving them so the caller (`main`) can push
    /// additional tasks (e.g. the API server) into the same set and await
    /// `stop()` cooperatively instead of leaving detached, unsupervised
    /// `tokio::spawn` calls scattered through startup.
    pub fn start(self: &Arc<Self>) -> JoinSet<()> {
        let mut join_set: JoinSet<()> = JoinSet::new();
        self.scheduler.spawn_all(&mut join_set);

        let yield_engine = self.yield_engine.clone();
        join_set.spawn(async move { yield_engine.run().await });

        info!("engine started: scheduler cycle loops + yield sweep spawned");
        join_set
    }

    /// Stop the engine: trip the scheduler's cancellation flag so cycle
    /// loops exit at their next tick boundary, then drain every task in
    /// `join_set` to completion.
    pub async fn stop(&self, mut join_set: JoinSet<()>) {
        self.scheduler.cancel();
        while join_set.join_next().await.is_some() {}
        info!("engine stopped: all background tasks drained");
    }

    // ── Version Management ──────────────────────────────────────────────

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Decision Audit ──────────────────────────────────────────────────

    /// Record a decision envelope. The ring buffer is capped at
    /// [`MAX_RECENT_DECISIONS`]; oldest entries are evicted when the limit
    /// is reached.
    pub fn push_decision(&self, envelope: DecisionEnvelope) {
        let mut decisions = self.recent_decisions.write();
        decisions.push(envelope);
        while decisions.len() > MAX_RECENT_DECISIONS {
            decisions.remove(0);
        }
        self.increment_version();
    }

    // ── Snapshot Builder ────────────────────────────────────────────────

    /// Build a complete, serialisable snapshot of the entire engine state.
    /// This is the payload sent to the dashboard via `GET /api/v1/state`
    /// and the WebSocket push feed.
    pub fn build_snapshot(&self) -> StateSnapshot {
        let now = Utc::now();
        let config = self.runtime_config.read();
        let version = self.current_state_version();

        let ws_user_event_age_ms = self.last_ws_user_event.read().elapsed().as_millis() as u64;

        let truth = TruthHeader {
            ws_user_connected: *self.ws_user_connected.read(),
            last_ws_user_event_age_ms: ws_user_event_age_ms,
            brake_active: self.risk.brake_active(),
            state_version: version,
            ws_sequence_number: self.ws_sequence_number.load(Ordering::Relaxed),
            trading_mode: config.trading_mode.to_string(),
            account_mode: config.account_mode.to_string(),
            server_time: now.timestamp_millis(),
        };

        let positions = self.positions.all();
        let recent_decisions = self.recent_decisions.read().clone();

        let bots = self
            .bots
            .all()
            .into_iter()
            .map(|b| BotSummary {
                bot_id: b.bot_id,
                owner: b.owner,
                status: b.status.to_string(),
                mode: format!("{:?}", b.mode).to_lowercase(),
                symbols: b.symbols,
                daily_trades_count: b.daily_trades_count,
                daily_pnl: b.daily_pnl,
                total_pnl: b.total_pnl,
                consecutive_losses: b.consecutive_losses,
                paused_for_daily_trip: b.paused_for_daily_trip,
            })
            .collect();

        let regime = self.regime_detector.current_regime().map(|rs| RegimeSnapshot {
            regime: rs.regime.to_string(),
            adx: rs.adx,
            bbw: rs.bbw,
            hurst: rs.hurst,
            entropy: rs.entropy,
            confidence: rs.confidence,
            regime_age_seconds: rs.regime_age_secs,
        });

        let feature_flags = FeatureFlagsSnapshot {
            htf_gate: config.enable_htf_gate,
            score_momentum: config.enable_score_momentum,
            ofip: config.enable_ofip,
            adaptive_threshold: config.enable_adaptive_threshold,
            entropy_graduated: config.enable_entropy_graduated,
            cusum: config.enable_cusum,
            absorption: config.enable_absorption,
            entropy_valley: config.enable_entropy_valley,
        };

        let runtime_config_summary = RuntimeConfigSummary {
            trading_mode: config.trading_mode.to_string(),
            account_mode: config.account_mode.to_string(),
            symbols: config.symbols.clone(),
            max_concurrent_positions: config.max_concurrent_positions,
            max_daily_loss_pct: config.max_daily_loss_pct,
            max_consecutive_losses: config.max_consecutive_losses,
            max_trades_per_day: config.max_trades_per_day,
            auto_execute: config.auto_execute,
        };

        let journal_stats = journal_stats(&positions);

        StateSnapshot {
            state_version: version,
            server_time: now.timestamp_millis(),
            truth,
            bots,
            positions,
            recent_decisions,
            runtime_config: runtime_config_summary,
            regime,
            feature_flags,
            journal_stats,
        }
    }
}

/// Aggregate win-rate/profit-factor stats across currently-open positions'
/// realised P&L, for the trade-journal dashboard tile. A position carries
/// its own `realized_pnl` even while still partially open, so this is a
/// running total rather than a closed-trade-only ledger query.
fn journal_stats(positions: &[Position]) -> JournalStats {
    let total_trades = positions.len();
    let wins = positions.iter().filter(|p| p.realized_pnl > rust_decimal::Decimal::ZERO).count();
    let win_rate = if total_trades > 0 { wins as f64 / total_trades as f64 } else { 0.0 };
    let total_net_pnl: rust_decimal::Decimal = positions.iter().map(|p| p.realized_pnl).sum();
    JournalStats {
        total_trades,
        win_rate,
        total_net_pnl,
    }
}

// =============================================================================
// Serialisable snapshot types
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub truth: TruthHeader,
    pub bots: Vec<BotSummary>,
    pub positions: Vec<Position>,
    pub recent_decisions: Vec<DecisionEnvelope>,
    pub runtime_config: RuntimeConfigSummary,
    pub regime: Option<RegimeSnapshot>,
    pub feature_flags: FeatureFlagsSnapshot,
    pub journal_stats: JournalStats,
}

/// Operational truth header — the dashboard's primary status banner.
#[derive(Debug, Clone, Serialize)]
pub struct TruthHeader {
    pub ws_user_connected: bool,
    pub last_ws_user_event_age_ms: u64,
    pub brake_active: bool,
    pub state_version: u64,
    pub ws_sequence_number: u64,
    pub trading_mode: String,
    pub account_mode: String,
    pub server_time: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BotSummary {
    pub bot_id: uuid::Uuid,
    pub owner: String,
    pub status: String,
    pub mode: String,
    pub symbols: Vec<String>,
    pub daily_trades_count: u32,
    pub daily_pnl: rust_decimal::Decimal,
    pub total_pnl: rust_decimal::Decimal,
    pub consecutive_losses: u32,
    pub paused_for_daily_trip: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuntimeConfigSummary {
    pub trading_mode: String,
    pub account_mode: String,
    pub symbols: Vec<String>,
    pub max_concurrent_positions: u32,
    pub max_daily_loss_pct: f64,
    pub max_consecutive_losses: u32,
    pub max_trades_per_day: u32,
    pub auto_execute: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegimeSnapshot {
    pub regime: String,
    pub adx: f64,
    pub bbw: f64,
    pub hurst: f64,
    pub entropy: f64,
    pub confidence: f64,
    pub regime_age_seconds: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeatureFlagsSnapshot {
    pub htf_gate: bool,
    pub score_momentum: bool,
    pub ofip: bool,
    pub adaptive_threshold: bool,
    pub entropy_graduated: bool,
    pub cusum: bool,
    pub absorption: bool,
    pub entropy_valley: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct JournalStats {
    pub total_trades: usize,
    pub win_rate: f64,
    pub total_net_pnl: rust_decimal::Decimal,
}
