// =============================================================================
// Indicator Cache — incrementally maintained SMA/EMA/RSI/MACD/BB/ATR/ADX per
// (symbol, timeframe), pushed by closed candles (spec §4.2)
// =============================================================================
//
// Grounded in `market_data::candle_buffer::CandleBuffer`'s ring-buffer-per-key
// idiom, generalised from raw candle storage into an indicator-result cache
// keyed the same way. On every closed candle the cache appends, recomputes
// every indicator it has subscribers for, and broadcasts `IndicatorsUpdated`
// on a `tokio::sync::broadcast` channel so the Strategy Evaluator (C3) can be
// driven by push rather than polling, per spec's "Evaluator ticks are driven
// by these events" requirement.
//
// A series that receives a candle out of order, or with a gap larger than its
// timeframe, is marked stale and reads are refused with `EngineError::Stale`
// until a backfill (a fresh run of `ingest` catching the series up) clears it.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::errors::{EngineError, ErrorCode};
use crate::indicators::{adx, atr, bollinger, ema, macd, roc, rsi, IndicatorKind};
use crate::market_data::Candle;

/// Ring buffer size multiplier over the largest period any subscriber has
/// asked for (spec §4.2: "N = max required period x 3").
const RETENTION_MULTIPLIER: usize = 3;
/// Largest period this cache ever needs to retain closes for; MACD(26) plus
/// its signal smoothing is the deepest requirement among the indicators we
/// support.
const MAX_PERIOD: usize = 60;

#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct SeriesKey {
    pub symbol: String,
    pub timeframe: String,
}

impl SeriesKey {
    pub fn new(symbol: impl Into<String>, timeframe: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe: timeframe.into(),
        }
    }
}

/// Event pushed to subscribers after a closed candle's indicators have been
/// recomputed.
#[derive(Debug, Clone)]
pub struct IndicatorsUpdated {
    pub symbol: String,
    pub timeframe: String,
    pub ts: DateTime<Utc>,
}

struct Series {
    closes: Vec<f64>,
    volumes: Vec<f64>,
    candles: Vec<Candle>,
    last_close_time: Option<i64>,
    timeframe_ms: i64,
    stale: bool,
    values: HashMap<(IndicatorKind, u32), f64>,
    /// Value as of the previous closed candle, for `crosses_above/below`
    /// leaf conditions (spec §4.3: "true on the tick where the previous bar
    /// was on the other side").
    prev_values: HashMap<(IndicatorKind, u32), f64>,
}

impl Series {
    fn new(timeframe_ms: i64) -> Self {
        Self {
            closes: Vec::new(),
            volumes: Vec::new(),
            candles: Vec::new(),
            last_close_time: None,
            timeframe_ms,
            stale: false,
            values: HashMap::new(),
            prev_values: HashMap::new(),
        }
    }

    fn append(&mut self, candle: Candle) {
        if let Some(last) = self.last_close_time {
            let gap = candle.close_time - last;
            if candle.close_time <= last || gap > self.timeframe_ms * 2 {
                self.stale = true;
                warn!(
                    gap_ms = gap,
                    timeframe_ms = self.timeframe_ms,
                    "candle series gap/out-of-order detected, marking stale"
                );
            }
        }
        self.last_close_time = Some(candle.close_time);
        self.closes.push(candle.close);
        self.volumes.push(candle.volume);
        self.candles.push(candle);

        let cap = MAX_PERIOD * RETENTION_MULTIPLIER;
        if self.closes.len() > cap {
            let drop = self.closes.len() - cap;
            self.closes.drain(0..drop);
            self.volumes.drain(0..drop);
            self.candles.drain(0..drop);
        }
    }

    /// Recompute every indicator this series has ever been asked for.
    fn recompute(&mut self) {
        let closes = &self.closes;
        let mut next = HashMap::new();

        for &(kind, period) in self.values.keys().collect::<Vec<_>>() {
            let p = period as usize;
            let value = match kind {
                IndicatorKind::Sma => sma(closes, p),
                IndicatorKind::Ema => ema::calculate_ema(closes, p).last().copied(),
                IndicatorKind::Rsi => rsi::calculate_rsi(closes, p).last().copied(),
                IndicatorKind::MacdLine => macd::calculate_macd(closes, 12, 26, 9).map(|m| m.macd),
                IndicatorKind::MacdSignal => macd::calculate_macd(closes, 12, 26, 9).map(|m| m.signal),
                IndicatorKind::MacdHistogram => {
                    macd::calculate_macd(closes, 12, 26, 9).map(|m| m.histogram)
                }
                IndicatorKind::BollingerUpper => {
                    bollinger::calculate_bollinger(closes, p, 2.0).map(|b| b.upper)
                }
                IndicatorKind::BollingerMiddle => {
                    bollinger::calculate_bollinger(closes, p, 2.0).map(|b| b.middle)
                }
                IndicatorKind::BollingerLower => {
                    bollinger::calculate_bollinger(closes, p, 2.0).map(|b| b.lower)
                }
                IndicatorKind::Atr => atr::calculate_atr(&self.candles, p),
                IndicatorKind::Adx => adx::calculate_adx(&self.candles, p),
                IndicatorKind::Volume => self.volumes.last().copied(),
            };
            if let Some(v) = value {
                next.insert((kind, period), v);
            }
        }

        self.prev_values = std::mem::take(&mut self.values);
        self.values = next;
    }

    fn ensure_tracked(&mut self, kind: IndicatorKind, period: u32) {
        self.values.entry((kind, period)).or_insert(f64::NAN);
    }
}

fn sma(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period {
        return None;
    }
    let window = &closes[closes.len() - period..];
    Some(window.iter().sum::<f64>() / period as f64)
}

/// Incrementally maintained per-(symbol, timeframe) indicator cache, driven
/// by closed candles and pushing `IndicatorsUpdated` on every recompute.
pub struct IndicatorCache {
    series: RwLock<HashMap<SeriesKey, Series>>,
    updates: broadcast::Sender<IndicatorsUpdated>,
}

impl IndicatorCache {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self {
            series: RwLock::new(HashMap::new()),
            updates: tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IndicatorsUpdated> {
        self.updates.subscribe()
    }

    /// Timeframe string ("1m", "5m", "1h", ...) to milliseconds, used for
    /// gap detection.
    fn timeframe_ms(timeframe: &str) -> i64 {
        let (num, unit) = timeframe.split_at(timeframe.len().saturating_sub(1));
        let n: i64 = num.parse().unwrap_or(1);
        match unit {
            "m" => n * 60_000,
            "h" => n * 3_600_000,
            "d" => n * 86_400_000,
            _ => 60_000,
        }
    }

    /// Pre-register interest in `indicator(period)` for `(symbol, timeframe)`
    /// so subsequent recomputes include it. Evaluators call this once per
    /// distinct (indicator, period) they reference in a condition tree.
    pub fn track(&self, symbol: &str, timeframe: &str, kind: IndicatorKind, period: u32) {
        let key = SeriesKey::new(symbol, timeframe);
        let mut map = self.series.write();
        let series = map
            .entry(key)
            .or_insert_with(|| Series::new(Self::timeframe_ms(timeframe)));
        series.ensure_tracked(kind, period);
    }

    /// Ingest a newly closed candle: append, recompute, emit
    /// `indicators_updated` (spec §4.2 exactly in this order).
    pub fn ingest(&self, symbol: &str, timeframe: &str, candle: Candle) {
        let key = SeriesKey::new(symbol, timeframe);
        let ts = Utc::now();
        {
            let mut map = self.series.write();
            let series = map
                .entry(key.clone())
                .or_insert_with(|| Series::new(Self::timeframe_ms(timeframe)));
            series.append(candle);
            series.recompute();
        }

        debug!(symbol, timeframe, "indicators recomputed");
        let _ = self.updates.send(IndicatorsUpdated {
            symbol: symbol.to_string(),
            timeframe: timeframe.to_string(),
            ts,
        });
    }

    /// Read the latest value of `indicator(period)` for `(symbol, timeframe)`.
    /// Fails with `Stale` if the series has an unresolved gap.
    pub fn get(
        &self,
        symbol: &str,
        timeframe: &str,
        kind: IndicatorKind,
        period: u32,
    ) -> Result<f64, EngineError> {
        let key = SeriesKey::new(symbol, timeframe);
        let map = self.series.read();
        let series = map.get(&key).ok_or_else(|| {
            EngineError::transient(ErrorCode::StaleSeries, format!("no series for {symbol}@{timeframe}"))
        })?;
        if series.stale {
            return Err(EngineError::transient(
                ErrorCode::StaleSeries,
                format!("{symbol}@{timeframe} series is stale, backfill required"),
            ));
        }
        series
            .values
            .get(&(kind, period))
            .copied()
            .filter(|v| v.is_finite())
            .ok_or_else(|| {
                EngineError::transient(
                    ErrorCode::StaleSeries,
                    format!("{kind:?}({period}) not yet available for {symbol}@{timeframe}"),
                )
            })
    }

    /// Read `indicator(period)` as of the previous closed candle, for
    /// `crosses_above`/`crosses_below` leaf conditions. Returns `None` if
    /// there is no prior reading yet (e.g. the very first candle).
    pub fn get_prev(&self, symbol: &str, timeframe: &str, kind: IndicatorKind, period: u32) -> Option<f64> {
        let key = SeriesKey::new(symbol, timeframe);
        let map = self.series.read();
        let series = map.get(&key)?;
        series
            .prev_values
            .get(&(kind, period))
            .copied()
            .filter(|v| v.is_finite())
    }

    /// The last two closed-candle closes `(previous, current)`, used for
    /// `price_crosses_above/below` conditions that compare raw price rather
    /// than an indicator reading.
    pub fn last_two_closes(&self, symbol: &str, timeframe: &str) -> Option<(f64, f64)> {
        let key = SeriesKey::new(symbol, timeframe);
        let map = self.series.read();
        let series = map.get(&key)?;
        if series.closes.len() < 2 {
            return None;
        }
        let n = series.closes.len();
        Some((series.closes[n - 2], series.closes[n - 1]))
    }

    /// Clear the stale flag after a successful backfill.
    pub fn clear_stale(&self, symbol: &str, timeframe: &str) {
        let key = SeriesKey::new(symbol, timeframe);
        if let Some(series) = self.series.write().get_mut(&key) {
            series.stale = false;
        }
    }

    pub fn closes(&self, symbol: &str, timeframe: &str) -> Vec<f64> {
        let key = SeriesKey::new(symbol, timeframe);
        self.series
            .read()
            .get(&key)
            .map(|s| s.closes.clone())
            .unwrap_or_default()
    }
}

impl Default for IndicatorCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(i: i64, close: f64) -> Candle {
        Candle {
            open_time: i * 60_000,
            close_time: i * 60_000 + 60_000,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 100.0,
            quote_volume: 100.0 * close,
            trades_count: 10,
            taker_buy_volume: 50.0,
            taker_buy_quote_volume: 50.0 * close,
            is_closed: true,
        }
    }

    #[test]
    fn tracks_and_computes_sma() {
        let cache = IndicatorCache::new();
        cache.track("BTCUSDT", "1m", IndicatorKind::Sma, 3);
        for i in 0..5 {
            cache.ingest("BTCUSDT", "1m", candle(i, 10.0 + i as f64));
        }
        let v = cache.get("BTCUSDT", "1m", IndicatorKind::Sma, 3).unwrap();
        // last three closes: 12, 13, 14 -> sma = 13
        assert!((v - 13.0).abs() < 1e-9);
    }

    #[test]
    fn untracked_indicator_reads_stale_error() {
        let cache = IndicatorCache::new();
        cache.ingest("BTCUSDT", "1m", candle(0, 10.0));
        let err = cache.get("BTCUSDT", "1m", IndicatorKind::Rsi, 14).unwrap_err();
        assert_eq!(err.code, crate::errors::ErrorCode::StaleSeries);
    }

    #[test]
    fn gap_marks_series_stale() {
        let cache = IndicatorCache::new();
        cache.track("BTCUSDT", "1m", IndicatorKind::Sma, 2);
        cache.ingest("BTCUSDT", "1m", candle(0, 10.0));
        let mut far = candle(100, 20.0); // huge gap
        far.close_time = 100 * 60_000 * 10;
        cache.ingest("BTCUSDT", "1m", far);
        let err = cache.get("BTCUSDT", "1m", IndicatorKind::Sma, 2);
        assert!(err.is_err());
        cache.clear_stale("BTCUSDT", "1m");
        assert!(cache.get("BTCUSDT", "1m", IndicatorKind::Sma, 2).is_ok());
    }

    #[test]
    fn emits_indicators_updated_event() {
        let cache = IndicatorCache::new();
        let mut rx = cache.subscribe();
        cache.ingest("ETHUSDT", "5m", candle(0, 100.0));
        let evt = rx.try_recv().expect("should have an event");
        assert_eq!(evt.symbol, "ETHUSDT");
        assert_eq!(evt.timeframe, "5m");
    }
}
