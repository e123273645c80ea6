// ===============================
// src/domain.rs
// ===============================
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Millisecond wall clock, the venue's native timestamp unit.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn sign(&self) -> i32 {
        match self {
            Side::Buy => 1,
            Side::Sell => -1,
        }
    }

    pub fn wire(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

/// Position side under long/short dual position mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PosSide {
    Long,
    Short,
}

impl PosSide {
    pub fn wire(&self) -> &'static str {
        match self {
            PosSide::Long => "long",
            PosSide::Short => "short",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "long" => Some(PosSide::Long),
            "short" => Some(PosSide::Short),
            _ => None,
        }
    }
}

/// Contract category of an instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstCategory {
    Spot,
    UsdSwap,
    UsdtSwap,
}

impl InstCategory {
    /// Venue instrument-type tag used by REST queries and broadcast
    /// subscriptions.
    pub fn inst_type(&self) -> &'static str {
        match self {
            InstCategory::Spot => "SPOT",
            InstCategory::UsdSwap | InstCategory::UsdtSwap => "SWAP",
        }
    }

    pub fn is_swap(&self) -> bool {
        !matches!(self, InstCategory::Spot)
    }
}

/// Normalized order status across venues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Locally created, no server ack yet.
    Born,
    /// Acked, resting, nothing filled.
    Alive,
    PartiallyFilled,
    Filled,
    Cancelled,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::Cancelled)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "live" => Some(OrderStatus::Alive),
            "partially_filled" => Some(OrderStatus::PartiallyFilled),
            "filled" => Some(OrderStatus::Filled),
            "canceled" | "cancelled" => Some(OrderStatus::Cancelled),
            _ => None,
        }
    }
}

/// Where an order snapshot came from. Carried for debugging only; the
/// reconciliation rule never branches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotSource {
    Push,
    Poll,
}

/// Full or incremental order state as reported by the venue.
#[derive(Debug, Clone)]
pub struct OrderSnapshot {
    pub order_id: String,
    pub client_id: String,
    pub inst_id: String,
    pub price: Decimal,
    pub size: Decimal,
    pub filled: Decimal,
    pub avg_price: Decimal,
    pub status: OrderStatus,
    pub update_time_ms: i64,
    pub source: SnapshotSource,
}

/// One monotonic fill delta derived from two consecutive accepted order
/// snapshots. `amount` is strictly positive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deal {
    pub inst_id: String,
    pub client_id: String,
    pub side: Side,
    pub price: Decimal,
    pub amount: Decimal,
    pub fill_time_ms: i64,
}

/// Events emitted to order observers. The terminal event is always last.
#[derive(Debug, Clone)]
pub enum OrderEvent {
    Deal(Deal),
    Finished { client_id: String, status: OrderStatus, fatal: bool },
}

/// Fired to depth observers after every accepted book mutation.
#[derive(Debug, Clone, Copy)]
pub struct DepthEvent {
    pub best_bid: Option<(Decimal, Decimal)>,
    pub best_ask: Option<(Decimal, Decimal)>,
    pub update_time_ms: i64,
}

#[derive(Debug, Clone)]
pub struct BalancePush {
    pub ccy: String,
    /// Absent on the wire means unchanged.
    pub rights: Option<Decimal>,
    pub frozen: Option<Decimal>,
    pub update_time_ms: i64,
}

#[derive(Debug, Clone)]
pub struct PositionPush {
    pub inst_id: String,
    pub pos_side: PosSide,
    pub amount: Decimal,
    pub avg_entry: Decimal,
    pub update_time_ms: i64,
}

#[derive(Debug, Clone)]
pub struct MarkPricePush {
    pub inst_id: String,
    pub mark_price: Decimal,
    pub update_time_ms: i64,
}

#[derive(Debug, Clone)]
pub struct FundingRatePush {
    pub inst_id: String,
    pub rate: Decimal,
    pub next_rate: Option<Decimal>,
    pub funding_time_ms: i64,
}

#[derive(Debug, Clone)]
pub struct PriceLimitPush {
    pub inst_id: String,
    pub buy_limit: Decimal,
    pub sell_limit: Decimal,
    pub update_time_ms: i64,
}

/// Market-wide forced liquidation, filtered by instrument category.
#[derive(Debug, Clone)]
pub struct LiquidationPush {
    pub inst_id: String,
    pub side: Side,
    pub size: Decimal,
    pub price: Decimal,
    pub update_time_ms: i64,
}
