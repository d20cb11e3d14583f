// =============================================================================
// Per-asset limit order book with price-time priority
// =============================================================================
//
// Two sides, each a `BTreeMap` keyed by price with a FIFO `VecDeque` of
// individual resting orders per price level. Bids are keyed by
// `Reverse<Decimal>` so the map's natural ascending iteration yields the
// highest bid first — the same trick as the wider pack's
// `Reverse<TimestampedEvent>` min-heap tie-breaking idiom, applied to price
// instead of timestamp, so both sides share one `BTreeMap` shape rather than
// needing two different heap types. FIFO arrival order is tracked with a
// monotonic per-book sequence counter, the same role `EventQueue::next_seq`
// plays for deterministic event ordering in the wider pack.
//
// One writer per book: every mutating call takes `&mut self` and the owning
// task serialises access per asset (spec §5). Readers take an immutable
// snapshot via `snapshot()`.
// =============================================================================

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::errors::{EngineError, ErrorCode};
use crate::types::Side;

/// A single order resting at a price level.
#[derive(Debug, Clone)]
struct RestingOrder {
    order_id: Uuid,
    user_id: String,
    qty_remaining: Decimal,
    arrival_seq: u64,
    expires_at: DateTime<Utc>,
}

/// One fill produced by a match — either the taker's own fill or a resting
/// maker's fill. The caller applies each to its `Order`/`Position` records.
#[derive(Debug, Clone)]
pub struct MatchFill {
    pub order_id: Uuid,
    pub user_id: String,
    pub side: Side,
    pub qty: Decimal,
    pub price: Decimal,
}

/// Result of submitting an order to the book.
#[derive(Debug, Clone, Default)]
pub struct MatchOutcome {
    pub fills: Vec<MatchFill>,
    pub remaining_qty: Decimal,
    pub resting: bool,
    /// Stop orders promoted to market and filled as a side effect of this
    /// match's trade prints.
    pub triggered_stop_fills: Vec<(Uuid, Vec<MatchFill>)>,
}

/// A single price level for snapshot/read purposes.
#[derive(Debug, Clone, Serialize)]
pub struct Level {
    pub price: Decimal,
    pub qty: Decimal,
    pub order_count: usize,
}

/// Read-only top-of-book snapshot, safe to clone out to HTTP callers without
/// holding the book's lock (spec §4.6: "readers never block writers").
#[derive(Debug, Clone, Serialize)]
pub struct BookSnapshot {
    pub asset_id: String,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
    pub best_bid: Option<Decimal>,
    pub best_ask: Option<Decimal>,
}

pub struct OrderBook {
    asset_id: String,
    bids: BTreeMap<Reverse<Decimal>, VecDeque<RestingOrder>>,
    asks: BTreeMap<Decimal, VecDeque<RestingOrder>>,
    stops_buy: BTreeMap<Decimal, Vec<(Uuid, String, Decimal, DateTime<Utc>)>>,
    stops_sell: BTreeMap<Decimal, Vec<(Uuid, String, Decimal, DateTime<Utc>)>>,
    next_seq: u64,
    last_trade_price: Option<Decimal>,
}

impl OrderBook {
    pub fn new(asset_id: impl Into<String>) -> Self {
        Self {
            asset_id: asset_id.into(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            stops_buy: BTreeMap::new(),
            stops_sell: BTreeMap::new(),
            next_seq: 0,
            last_trade_price: None,
        }
    }

    fn next_arrival_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.keys().next().map(|Reverse(p)| *p)
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.keys().next().copied()
    }

    /// Invariant check (spec §8 invariant 1): best bid must never exceed
    /// best ask once matching has settled.
    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => bid > ask,
            _ => false,
        }
    }

    /// Submit a market order. Consumes the opposite side best-price-first
    /// until filled or the book is exhausted; any unfilled remainder is
    /// rejected with `insufficient_liquidity` rather than resting.
    pub fn submit_market(
        &mut self,
        order_id: Uuid,
        user_id: &str,
        side: Side,
        qty: Decimal,
    ) -> Result<MatchOutcome, EngineError> {
        let mut outcome = self.match_against_book(order_id, user_id, side, qty, None);
        if !outcome.remaining_qty.is_zero() {
            return Err(EngineError::state(
                ErrorCode::InsufficientLiquidity,
                format!(
                    "market {} for {} could not fill {} of {} requested",
                    side, self.asset_id, outcome.remaining_qty, qty
                ),
            ));
        }
        self.promote_triggered_stops(&mut outcome);
        Ok(outcome)
    }

    /// Submit a limit order at `limit_price`. Matches against the opposite
    /// side while price is marketable, then rests any remainder at the tail
    /// of its own side's FIFO queue at `limit_price`.
    pub fn submit_limit(
        &mut self,
        order_id: Uuid,
        user_id: &str,
        side: Side,
        qty: Decimal,
        limit_price: Decimal,
        expires_at: DateTime<Utc>,
    ) -> MatchOutcome {
        let mut outcome = self.match_against_book(order_id, user_id, side, qty, Some(limit_price));

        if !outcome.remaining_qty.is_zero() {
            let seq = self.next_arrival_seq();
            let resting = RestingOrder {
                order_id,
                user_id: user_id.to_string(),
                qty_remaining: outcome.remaining_qty,
                arrival_seq: seq,
                expires_at,
            };
            match side {
                Side::Buy => self
                    .bids
                    .entry(Reverse(limit_price))
                    .or_default()
                    .push_back(resting),
                Side::Sell => self
                    .asks
                    .entry(limit_price)
                    .or_default()
                    .push_back(resting),
            }
            outcome.resting = true;
        }

        self.promote_triggered_stops(&mut outcome);
        outcome
    }

    /// Register a stop order. It rests in the side table keyed by trigger
    /// price and is promoted to a market order once a qualifying trade
    /// print occurs.
    pub fn submit_stop(
        &mut self,
        order_id: Uuid,
        user_id: &str,
        side: Side,
        qty: Decimal,
        trigger_price: Decimal,
        expires_at: DateTime<Utc>,
    ) {
        let table = match side {
            Side::Buy => &mut self.stops_buy,
            Side::Sell => &mut self.stops_sell,
        };
        table
            .entry(trigger_price)
            .or_default()
            .push((order_id, user_id.to_string(), qty, expires_at));
    }

    /// Cancel a single resting limit order by id. Returns `true` if found
    /// and removed.
    pub fn cancel(&mut self, order_id: Uuid) -> bool {
        for queue in self.bids.values_mut().chain(self.asks.values_mut()) {
            if let Some(pos) = queue.iter().position(|o| o.order_id == order_id) {
                queue.remove(pos);
                return true;
            }
        }
        false
    }

    /// Sweep expired resting limit orders (`created_at + 7 days`, spec
    /// §4.6). Returns the ids of orders that expired so the caller can
    /// write `OrderCancelled(reason=expired)` ledger entries.
    pub fn sweep_expired(&mut self, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut expired = Vec::new();
        for queue in self.bids.values_mut() {
            queue.retain(|o| {
                let keep = o.expires_at > now;
                if !keep {
                    expired.push(o.order_id);
                }
                keep
            });
        }
        for queue in self.asks.values_mut() {
            queue.retain(|o| {
                let keep = o.expires_at > now;
                if !keep {
                    expired.push(o.order_id);
                }
                keep
            });
        }
        self.bids.retain(|_, q| !q.is_empty());
        self.asks.retain(|_, q| !q.is_empty());
        expired
    }

    fn match_against_book(
        &mut self,
        taker_order_id: Uuid,
        taker_user_id: &str,
        taker_side: Side,
        qty: Decimal,
        limit_price: Option<Decimal>,
    ) -> MatchOutcome {
        let mut remaining = qty;
        let mut fills = Vec::new();

        loop {
            if remaining.is_zero() {
                break;
            }
            let marketable_price = match taker_side {
                Side::Buy => self.best_ask(),
                Side::Sell => self.best_bid(),
            };
            let Some(price) = marketable_price else {
                break;
            };
            if let Some(lp) = limit_price {
                let marketable = match taker_side {
                    Side::Buy => price <= lp,
                    Side::Sell => price >= lp,
                };
                if !marketable {
                    break;
                }
            }

            let queue = match taker_side {
                Side::Buy => self.asks.get_mut(&price),
                Side::Sell => self.bids.get_mut(&Reverse(price)),
            };
            let Some(queue) = queue else { break };

            while remaining > Decimal::ZERO {
                let Some(maker) = queue.front_mut() else { break };
                let fill_qty = remaining.min(maker.qty_remaining);

                fills.push(MatchFill {
                    order_id: taker_order_id,
                    user_id: taker_user_id.to_string(),
                    side: taker_side,
                    qty: fill_qty,
                    price,
                });
                fills.push(MatchFill {
                    order_id: maker.order_id,
                    user_id: maker.user_id.clone(),
                    side: taker_side.opposite(),
                    qty: fill_qty,
                    price,
                });

                maker.qty_remaining -= fill_qty;
                remaining -= fill_qty;
                self.last_trade_price = Some(price);

                if maker.qty_remaining.is_zero() {
                    queue.pop_front();
                } else {
                    break;
                }
            }

            if queue.is_empty() {
                match taker_side {
                    Side::Buy => {
                        self.asks.remove(&price);
                    }
                    Side::Sell => {
                        self.bids.remove(&Reverse(price));
                    }
                }
            }
        }

        MatchOutcome {
            fills,
            remaining_qty: remaining,
            resting: false,
            triggered_stop_fills: Vec::new(),
        }
    }

    /// After any trade print, promote stop orders whose trigger condition
    /// is now satisfied into market orders (spec §4.6: "checked after each
    /// fill"). Recurses implicitly because promoted stops are themselves
    /// matched via `match_against_book`, which may print further trades.
    fn promote_triggered_stops(&mut self, outcome: &mut MatchOutcome) {
        let Some(last_price) = self.last_trade_price else {
            return;
        };

        loop {
            let mut promoted = None;

            if let Some((&trigger, orders)) = self
                .stops_buy
                .iter_mut()
                .find(|(&trigger, _)| trigger <= last_price)
            {
                if let Some((order_id, user_id, qty, _)) = orders.pop() {
                    if orders.is_empty() {
                        self.stops_buy.remove(&trigger);
                    }
                    promoted = Some((order_id, user_id, Side::Buy, qty));
                }
            } else if let Some((&trigger, orders)) = self
                .stops_sell
                .iter_mut()
                .find(|(&trigger, _)| trigger >= last_price)
            {
                if let Some((order_id, user_id, qty, _)) = orders.pop() {
                    if orders.is_empty() {
                        self.stops_sell.remove(&trigger);
                    }
                    promoted = Some((order_id, user_id, Side::Sell, qty));
                }
            }

            let Some((order_id, user_id, side, qty)) = promoted else {
                break;
            };
            let sub_outcome = self.match_against_book(order_id, &user_id, side, qty, None);
            outcome
                .triggered_stop_fills
                .push((order_id, sub_outcome.fills));
        }
    }

    pub fn snapshot(&self, depth: usize) -> BookSnapshot {
        BookSnapshot {
            asset_id: self.asset_id.clone(),
            bids: self
                .bids
                .iter()
                .take(depth)
                .map(|(Reverse(price), q)| Level {
                    price: *price,
                    qty: q.iter().map(|o| o.qty_remaining).sum(),
                    order_count: q.len(),
                })
                .collect(),
            asks: self
                .asks
                .iter()
                .take(depth)
                .map(|(price, q)| Level {
                    price: *price,
                    qty: q.iter().map(|o| o.qty_remaining).sum(),
                    order_count: q.len(),
                })
                .collect(),
            best_bid: self.best_bid(),
            best_ask: self.best_ask(),
        }
    }
}

/// Collection of order books keyed by asset id, one per tradable asset.
pub struct BookManager {
    books: parking_lot::Mutex<HashMap<String, OrderBook>>,
}

impl BookManager {
    pub fn new() -> Self {
        Self {
            books: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Run `f` against the asset's book under its single-writer lock.
    pub fn with_book<R>(&self, asset_id: &str, f: impl FnOnce(&mut OrderBook) -> R) -> R {
        let mut books = self.books.lock();
        let book = books
            .entry(asset_id.to_string())
            .or_insert_with(|| OrderBook::new(asset_id));
        f(book)
    }

    pub fn snapshot(&self, asset_id: &str, depth: usize) -> Option<BookSnapshot> {
        self.books.lock().get(asset_id).map(|b| b.snapshot(depth))
    }

    pub fn asset_ids(&self) -> Vec<String> {
        self.books.lock().keys().cloned().collect()
    }
}

impl Default for BookManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn far_future() -> DateTime<Utc> {
        Utc::now() + chrono::Duration::days(7)
    }

    /// Scenario S1: market buy against a two-level ask book.
    #[test]
    fn s1_market_buy_sufficient_liquidity() {
        let mut book = OrderBook::new("A1");
        book.submit_limit(
            Uuid::new_v4(),
            "maker1",
            Side::Sell,
            dec!(5),
            dec!(100),
            far_future(),
        );
        book.submit_limit(
            Uuid::new_v4(),
            "maker2",
            Side::Sell,
            dec!(10),
            dec!(101),
            far_future(),
        );

        let outcome = book
            .submit_market(Uuid::new_v4(), "taker", Side::Buy, dec!(7))
            .expect("should fill");

        assert!(outcome.remaining_qty.is_zero());
        let taker_fills: Vec<_> = outcome
            .fills
            .iter()
            .filter(|f| f.user_id == "taker")
            .collect();
        assert_eq!(taker_fills.len(), 2);
        assert_eq!(taker_fills[0].qty, dec!(5));
        assert_eq!(taker_fills[0].price, dec!(100));
        assert_eq!(taker_fills[1].qty, dec!(2));
        assert_eq!(taker_fills[1].price, dec!(101));
    }

    /// Scenario S2: limit buy with no marketable asks rests on the book.
    #[test]
    fn s2_limit_buy_rests_when_not_marketable() {
        let mut book = OrderBook::new("A1");
        book.submit_limit(
            Uuid::new_v4(),
            "maker",
            Side::Sell,
            dec!(5),
            dec!(105),
            far_future(),
        );

        let outcome = book.submit_limit(
            Uuid::new_v4(),
            "taker",
            Side::Buy,
            dec!(3),
            dec!(99),
            far_future(),
        );

        assert!(outcome.fills.is_empty());
        assert!(outcome.resting);
        assert_eq!(book.best_bid(), Some(dec!(99)));
    }

    #[test]
    fn market_order_with_insufficient_liquidity_rejects() {
        let mut book = OrderBook::new("A1");
        book.submit_limit(
            Uuid::new_v4(),
            "maker",
            Side::Sell,
            dec!(2),
            dec!(100),
            far_future(),
        );
        let err = book
            .submit_market(Uuid::new_v4(), "taker", Side::Buy, dec!(5))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InsufficientLiquidity);
    }

    #[test]
    fn ties_broken_by_arrival_order_fifo() {
        let mut book = OrderBook::new("A1");
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        book.submit_limit(first, "maker1", Side::Sell, dec!(3), dec!(100), far_future());
        book.submit_limit(second, "maker2", Side::Sell, dec!(3), dec!(100), far_future());

        let outcome = book
            .submit_market(Uuid::new_v4(), "taker", Side::Buy, dec!(3))
            .unwrap();
        let maker_fill = outcome.fills.iter().find(|f| f.user_id == "maker1").unwrap();
        assert_eq!(maker_fill.order_id, first);
        // second maker untouched
        assert!(outcome.fills.iter().all(|f| f.order_id != second));
    }

    #[test]
    fn book_never_crosses_after_limit_rests() {
        let mut book = OrderBook::new("A1");
        book.submit_limit(Uuid::new_v4(), "m1", Side::Buy, dec!(5), dec!(99), far_future());
        book.submit_limit(Uuid::new_v4(), "m2", Side::Sell, dec!(5), dec!(101), far_future());
        assert!(!book.is_crossed());
    }

    #[test]
    fn stop_buy_promotes_on_trade_print_at_or_above_trigger() {
        let mut book = OrderBook::new("A1");
        book.submit_limit(Uuid::new_v4(), "m1", Side::Sell, dec!(10), dec!(100), far_future());
        let stop_id = Uuid::new_v4();
        book.submit_stop(stop_id, "stopper", Side::Buy, dec!(2), dec!(99), far_future());

        // Any trade print >= 99 should promote the resting stop buy.
        let outcome = book
            .submit_market(Uuid::new_v4(), "taker", Side::Buy, dec!(3))
            .unwrap();

        assert_eq!(outcome.triggered_stop_fills.len(), 1);
        assert_eq!(outcome.triggered_stop_fills[0].0, stop_id);
    }

    #[test]
    fn sweep_expired_removes_stale_resting_orders() {
        let mut book = OrderBook::new("A1");
        let id = Uuid::new_v4();
        book.submit_limit(id, "m1", Side::Buy, dec!(5), dec!(99), Utc::now() - chrono::Duration::seconds(1));
        let expired = book.sweep_expired(Utc::now());
        assert_eq!(expired, vec![id]);
        assert_eq!(book.best_bid(), None);
    }
}
