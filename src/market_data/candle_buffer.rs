// =============================================================================
// Candle — shared OHLCV bar type
// =============================================================================
//
// One closed (or in-progress) bar, independent of provider. Regime detection,
// the indicator cache, and every `MarketDataProvider::fetch_candles`
// implementation all exchange data in this shape.
// =============================================================================

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub quote_volume: f64,
    pub trades_count: u64,
    pub taker_buy_volume: f64,
    pub taker_buy_quote_volume: f64,
    pub is_closed: bool,
}
