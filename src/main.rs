// =============================================================================
// Trading Execution Core — Main Entry Point
// =============================================================================
//
// The engine starts in Demo + Paused mode for safety. Users must explicitly
// switch to Live mode via the dashboard or API.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod asset;
mod bot;
mod decision_envelope;
mod errors;
mod evaluator;
mod execution_pipeline;
mod indicator_cache;
mod indicators;
mod knowledge_base;
mod ledger;
mod market_data;
mod order;
mod orderbook;
mod position_engine;
mod regime;
mod runtime_config;
mod scheduler;
mod signal;
mod strategy;
mod types;
mod yield_engine;

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::{AppState, AppStateDeps};
use crate::asset::AssetRegistry;
use crate::bot::BotRegistry;
use crate::execution_pipeline::RiskPipeline;
use crate::indicator_cache::IndicatorCache;
use crate::knowledge_base::KnowledgeBase;
use crate::ledger::Ledger;
use crate::market_data::MarketDataAggregator;
use crate::orderbook::BookManager;
use crate::position_engine::PositionManager;
use crate::regime::RegimeDetector;
use crate::runtime_config::RuntimeConfig;
use crate::scheduler::{Scheduler, SchedulerDeps};
use crate::strategy::StrategyRegistry;
use crate::types::{AccountMode, TradingMode};
use crate::yield_engine::YieldEngine;

const CONFIG_PATH: &str = "runtime_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Trading Execution Core — Starting Up              ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    // ── 2. Config ─────────────────────────────────────────────────────────
    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        RuntimeConfig::default()
    });

    // SAFETY: always start Demo + Paused; an operator must explicitly arm live trading.
    config.trading_mode = TradingMode::Paused;
    config.account_mode = AccountMode::Demo;

    if let Ok(syms) = std::env::var("AURORA_SYMBOLS") {
        config.symbols = syms
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }

    info!(symbols = ?config.symbols, "configured tradable assets");
    info!(
        trading_mode = %config.trading_mode,
        account_mode = %config.account_mode,
        "engine starting in SAFE mode (Demo + Paused)"
    );

    // ── 3. Ledger replay ──────────────────────────────────────────────────
    let ledger_path = std::env::var("AURORA_LEDGER_PATH").unwrap_or_else(|_| "ledger.jsonl".to_string());
    let ledger = Arc::new(Ledger::open(&ledger_path)?);
    let replay = Ledger::replay(&ledger_path)?;
    info!(
        orders = replay.orders.len(),
        positions = replay.positions.len(),
        discarded = replay.discarded_incomplete_txns,
        "ledger replay complete"
    );

    // ── 4. Core registries ────────────────────────────────────────────────
    let bots = Arc::new(BotRegistry::new());
    let strategies = Arc::new(StrategyRegistry::new());
    let positions = Arc::new(PositionManager::new());
    for pos in replay.positions {
        positions.restore(pos);
    }
    let assets = Arc::new(AssetRegistry::new());
    let books = Arc::new(BookManager::new());
    let indicators = Arc::new(IndicatorCache::new());
    let regime_detector = RegimeDetector::new();
    let knowledge_base = Arc::new(KnowledgeBase::new());

    // Concrete `MarketDataProvider` integrations (exchange/broker adapters) are
    // out of scope here; the aggregator starts provider-less and accepts
    // registrations the same way it does in tests, via `MarketDataAggregator::new`.
    if !config.providers.is_empty() {
        warn!(providers = ?config.providers, "no MarketDataProvider implementations are registered for the configured providers");
    }
    let market_data = MarketDataAggregator::new(Vec::new());

    // ── 5. Risk pipeline + scheduler ──────────────────────────────────────
    let risk = Arc::new(RiskPipeline::new(
        bots.clone(),
        assets.clone(),
        positions.clone(),
        books.clone(),
        ledger.clone(),
        indicators.clone(),
    ));
    risk.orders.restore(&replay);

    let max_ownership_pct = Decimal::try_from(config.max_ownership_pct).unwrap_or(Decimal::new(20, 2));
    let yield_engine = YieldEngine::new(assets.clone(), positions.clone(), ledger.clone(), max_ownership_pct);

    let scheduler = Arc::new(Scheduler::new(
        SchedulerDeps {
            bots: bots.clone(),
            strategies: strategies.clone(),
            positions: positions.clone(),
            indicators: indicators.clone(),
            regime: regime_detector.clone(),
            knowledge_base: knowledge_base.clone(),
            market_data: market_data.clone(),
            risk: risk.clone(),
            ledger: ledger.clone(),
        },
        None,
    ));

    // ── 6. Assemble the engine ────────────────────────────────────────────
    let state = Arc::new(AppState::new(AppStateDeps {
        runtime_config: config,
        bots,
        strategies,
        positions,
        assets,
        books,
        indicators,
        regime_detector,
        knowledge_base,
        market_data,
        ledger,
        risk,
        scheduler: scheduler.clone(),
        yield_engine: yield_engine.clone(),
    }));

    // ── 7. Start the engine's background tasks (scheduler cycle loops +
    //      yield sweep), then fold the API server into the same JoinSet so
    //      shutdown drains everything cooperatively through `Engine::stop`.
    let mut join_set = state.start();

    let api_state = state.clone();
    let bind_addr = std::env::var("AURORA_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    join_set.spawn(async move {
        let app = api::rest::router(api_state);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .expect("failed to bind API server");
        info!(addr = %bind_addr, "API server listening");
        axum::serve(listener, app).await.expect("API server failed");
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 8. Graceful shutdown ──────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    state.stop(join_set).await;
    if let Err(e) = state.runtime_config.read().save(CONFIG_PATH) {
        error!(error = %e, "failed to save runtime config on shutdown");
    }

    info!("Trading Execution Core shut down complete.");
    Ok(())
}
