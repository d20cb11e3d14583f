// =============================================================================
// Order & Fill — intention and settlement records
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{OrderStatus, OrderType, Side};

/// An order references the signal that produced it (if any — synthetic
/// reinvestment fills construct an order with `signal_id = None`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_id: Option<Uuid>,
    pub user_id: String,
    pub asset_id: String,
    pub side: Side,
    pub order_type: OrderType,
    pub qty: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<Decimal>,
    pub filled_qty: Decimal,
    pub avg_fill_price: Decimal,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Order {
    pub fn new(
        user_id: impl Into<String>,
        asset_id: impl Into<String>,
        side: Side,
        order_type: OrderType,
        qty: Decimal,
        limit_price: Option<Decimal>,
        stop_price: Option<Decimal>,
        signal_id: Option<Uuid>,
    ) -> Self {
        let now = Utc::now();
        Self {
            order_id: Uuid::new_v4(),
            signal_id,
            user_id: user_id.into(),
            asset_id: asset_id.into(),
            side,
            order_type,
            qty,
            limit_price,
            stop_price,
            filled_qty: Decimal::ZERO,
            avg_fill_price: Decimal::ZERO,
            status: OrderStatus::Pending,
            created_at: now,
            // Limit orders expire after 7 days unless otherwise set (spec §4.6).
            expires_at: now + chrono::Duration::days(7),
        }
    }

    pub fn remaining_qty(&self) -> Decimal {
        self.qty - self.filled_qty
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            OrderStatus::Filled
                | OrderStatus::Cancelled
                | OrderStatus::Rejected
                | OrderStatus::Expired
        )
    }

    /// Fold a new fill's price/qty into the order's running average fill
    /// price and filled quantity, updating status accordingly.
    pub fn apply_fill(&mut self, fill_qty: Decimal, fill_price: Decimal) {
        let prior_notional = self.avg_fill_price * self.filled_qty;
        let new_notional = fill_price * fill_qty;
        self.filled_qty += fill_qty;
        self.avg_fill_price = if self.filled_qty.is_zero() {
            Decimal::ZERO
        } else {
            (prior_notional + new_notional) / self.filled_qty
        };
        self.status = if self.filled_qty >= self.qty {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
    }
}

/// Immutable settlement record. Multiple fills may share an `order_id` for
/// partial fills.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub fill_id: Uuid,
    pub order_id: Uuid,
    pub asset_id: String,
    pub side: Side,
    pub qty: Decimal,
    pub price: Decimal,
    pub fee: Decimal,
    pub ts: DateTime<Utc>,
    /// True for yield-reinvestment fills, which bypass the order book and
    /// carry zero fee (spec §4.7 step 4).
    pub synthetic: bool,
}

impl Fill {
    pub fn new(order_id: Uuid, asset_id: impl Into<String>, side: Side, qty: Decimal, price: Decimal, fee: Decimal) -> Self {
        Self {
            fill_id: Uuid::new_v4(),
            order_id,
            asset_id: asset_id.into(),
            side,
            qty,
            price,
            fee,
            ts: Utc::now(),
            synthetic: false,
        }
    }

    pub fn notional(&self) -> Decimal {
        self.qty * self.price
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn apply_fill_averages_price_across_partials() {
        let mut order = Order::new(
            "u1",
            "A1",
            Side::Buy,
            OrderType::Market,
            dec!(7),
            None,
            None,
            None,
        );
        order.apply_fill(dec!(5), dec!(100));
        order.apply_fill(dec!(2), dec!(101));
        assert_eq!(order.filled_qty, dec!(7));
        assert_eq!(order.status, OrderStatus::Filled);
        let expected_avg = (dec!(100) * dec!(5) + dec!(101) * dec!(2)) / dec!(7);
        assert_eq!(order.avg_fill_price, expected_avg);
    }

    #[test]
    fn partial_fill_keeps_order_resting() {
        let mut order = Order::new(
            "u1",
            "A1",
            Side::Buy,
            OrderType::Limit,
            dec!(10),
            Some(dec!(99)),
            None,
            None,
        );
        order.apply_fill(dec!(4), dec!(99));
        assert_eq!(order.status, OrderStatus::PartiallyFilled);
        assert_eq!(order.remaining_qty(), dec!(6));
    }
}
