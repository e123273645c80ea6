// ===============================
// src/book.rs
// ===============================
//
// Per-market order book mirror. Sorted ladders with incremental updates,
// snapshot rebuild, CRC32 integrity verification and depth-weighted
// queries. One mutex guards the ladders; the cached top-of-book lives
// behind its own lock so hot readers never touch the book mutex.

use std::collections::BTreeMap;

use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;

use crate::domain::DepthEvent;

/// Number of levels per side folded into the integrity checksum.
const CHECKSUM_LEVELS: usize = 25;

#[derive(Default)]
struct BookInner {
    /// Ascending by price.
    asks: BTreeMap<Decimal, Decimal>,
    /// Ascending by price; iterated in reverse for best-first order.
    bids: BTreeMap<Decimal, Decimal>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Top {
    bid: Option<(Decimal, Decimal)>,
    ask: Option<(Decimal, Decimal)>,
}

pub struct OrderBook {
    inst_id: String,
    inner: Mutex<BookInner>,
    top: RwLock<Top>,
}

impl OrderBook {
    pub fn new(inst_id: impl Into<String>) -> Self {
        Self {
            inst_id: inst_id.into(),
            inner: Mutex::new(BookInner::default()),
            top: RwLock::new(Top::default()),
        }
    }

    pub fn inst_id(&self) -> &str {
        &self.inst_id
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.asks.clear();
        inner.bids.clear();
        *self.top.write() = Top::default();
    }

    /// Size 0 deletes the level, anything else inserts or replaces.
    pub fn apply_ask(&self, price: Decimal, size: Decimal) {
        let mut inner = self.inner.lock();
        if size.is_zero() {
            inner.asks.remove(&price);
        } else {
            inner.asks.insert(price, size);
        }
        self.refresh_top(&inner);
    }

    pub fn apply_bid(&self, price: Decimal, size: Decimal) {
        let mut inner = self.inner.lock();
        if size.is_zero() {
            inner.bids.remove(&price);
        } else {
            inner.bids.insert(price, size);
        }
        self.refresh_top(&inner);
    }

    /// Atomic swap after a snapshot frame. Zero-size levels are ignored.
    pub fn rebuild(&self, asks: &[(Decimal, Decimal)], bids: &[(Decimal, Decimal)]) {
        let mut inner = self.inner.lock();
        inner.asks = asks.iter().filter(|(_, s)| !s.is_zero()).copied().collect();
        inner.bids = bids.iter().filter(|(_, s)| !s.is_zero()).copied().collect();
        self.refresh_top(&inner);
    }

    fn refresh_top(&self, inner: &BookInner) {
        let top = Top {
            bid: inner.bids.iter().next_back().map(|(p, s)| (*p, *s)),
            ask: inner.asks.iter().next().map(|(p, s)| (*p, *s)),
        };
        *self.top.write() = top;
    }

    /// Best bid price. Lock-free with respect to the book mutex.
    pub fn buy1(&self) -> Option<Decimal> {
        self.top.read().bid.map(|(p, _)| p)
    }

    /// Best ask price.
    pub fn sell1(&self) -> Option<Decimal> {
        self.top.read().ask.map(|(p, _)| p)
    }

    pub fn best_bid(&self) -> Option<(Decimal, Decimal)> {
        self.top.read().bid
    }

    pub fn best_ask(&self) -> Option<(Decimal, Decimal)> {
        self.top.read().ask
    }

    pub fn middle(&self) -> Option<Decimal> {
        let top = *self.top.read();
        match (top.bid, top.ask) {
            (Some((b, _)), Some((a, _))) => Some((b + a) / Decimal::TWO),
            _ => None,
        }
    }

    pub fn depth_event(&self, update_time_ms: i64) -> DepthEvent {
        let top = *self.top.read();
        DepthEvent { best_bid: top.bid, best_ask: top.ask, update_time_ms }
    }

    /// Size-weighted average price to buy `qty` by walking the ask ladder.
    /// If the book is thinner than `qty`, falls back to top-of-book.
    pub fn vwap_buy(&self, qty: Decimal) -> Option<Decimal> {
        let inner = self.inner.lock();
        Self::vwap(inner.asks.iter().map(|(p, s)| (*p, *s)), qty)
    }

    pub fn vwap_sell(&self, qty: Decimal) -> Option<Decimal> {
        let inner = self.inner.lock();
        Self::vwap(inner.bids.iter().rev().map(|(p, s)| (*p, *s)), qty)
    }

    fn vwap(levels: impl Iterator<Item = (Decimal, Decimal)>, qty: Decimal) -> Option<Decimal> {
        let mut remaining = qty;
        let mut notional = Decimal::ZERO;
        let mut top: Option<Decimal> = None;
        for (px, sz) in levels {
            if top.is_none() {
                top = Some(px);
            }
            if remaining <= Decimal::ZERO {
                break;
            }
            let take = sz.min(remaining);
            notional += take * px;
            remaining -= take;
        }
        if qty.is_zero() {
            return top;
        }
        if remaining > Decimal::ZERO {
            // thinner than qty
            return top;
        }
        Some(notional / qty)
    }

    /// Largest buy size fillable while every touched ask stays within
    /// `slip` of the best ask (price/top - 1 <= slip). Always admits at
    /// least the top level.
    pub fn max_buy_size_within_slip(&self, slip: Decimal) -> Option<Decimal> {
        let inner = self.inner.lock();
        Self::max_within_slip(inner.asks.iter().map(|(p, s)| (*p, *s)), slip, false)
    }

    pub fn max_sell_size_within_slip(&self, slip: Decimal) -> Option<Decimal> {
        let inner = self.inner.lock();
        Self::max_within_slip(inner.bids.iter().rev().map(|(p, s)| (*p, *s)), slip, true)
    }

    fn max_within_slip(
        levels: impl Iterator<Item = (Decimal, Decimal)>,
        slip: Decimal,
        downward: bool,
    ) -> Option<Decimal> {
        let mut top: Option<Decimal> = None;
        let mut total = Decimal::ZERO;
        for (px, sz) in levels {
            let top_px = match top {
                Some(t) => t,
                None => {
                    top = Some(px);
                    total += sz;
                    continue;
                }
            };
            let drift = if downward { Decimal::ONE - px / top_px } else { px / top_px - Decimal::ONE };
            if drift > slip {
                break;
            }
            total += sz;
        }
        top.map(|_| total)
    }

    /// Venue integrity checksum: first 25 levels of each side interleaved
    /// bid:ask per level, `px:sz` fields joined with `:`, CRC32.
    pub fn checksum(&self) -> u32 {
        let inner = self.inner.lock();
        let bids: Vec<(Decimal, Decimal)> =
            inner.bids.iter().rev().take(CHECKSUM_LEVELS).map(|(p, s)| (*p, *s)).collect();
        let asks: Vec<(Decimal, Decimal)> =
            inner.asks.iter().take(CHECKSUM_LEVELS).map(|(p, s)| (*p, *s)).collect();
        drop(inner);

        let mut parts: Vec<String> = Vec::with_capacity((bids.len() + asks.len()) * 2);
        for i in 0..bids.len().max(asks.len()) {
            if let Some((p, s)) = bids.get(i) {
                parts.push(p.normalize().to_string());
                parts.push(s.normalize().to_string());
            }
            if let Some((p, s)) = asks.get(i) {
                parts.push(p.normalize().to_string());
                parts.push(s.normalize().to_string());
            }
        }
        crc32fast::hash(parts.join(":").as_bytes())
    }

    /// Compare against the server value, which arrives as a signed 32-bit.
    pub fn verify_checksum(&self, expected: i32) -> bool {
        self.checksum() as i32 == expected
    }

    pub fn depth(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        (inner.asks.len(), inner.bids.len())
    }

    pub fn is_empty(&self) -> bool {
        let (a, b) = self.depth();
        a == 0 && b == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn seeded() -> OrderBook {
        let book = OrderBook::new("ETH-USDT-SWAP");
        book.rebuild(
            &[
                (dec!(100.1), dec!(5)),
                (dec!(100.2), dec!(10)),
                (dec!(100.3), dec!(20)),
                (dec!(110.0), dec!(50)),
            ],
            &[
                (dec!(100.0), dec!(4)),
                (dec!(99.9), dec!(8)),
                (dec!(99.8), dec!(16)),
                (dec!(90.0), dec!(40)),
            ],
        );
        book
    }

    #[test]
    fn top_matches_extrema_after_updates() {
        let book = seeded();
        assert_eq!(book.buy1(), Some(dec!(100.0)));
        assert_eq!(book.sell1(), Some(dec!(100.1)));
        assert_eq!(book.middle(), Some(dec!(100.05)));

        // removing the touch promotes the next level
        book.apply_bid(dec!(100.0), Decimal::ZERO);
        assert_eq!(book.buy1(), Some(dec!(99.9)));

        // a better ask replaces the cached top
        book.apply_ask(dec!(100.05), dec!(1));
        assert_eq!(book.sell1(), Some(dec!(100.05)));
    }

    #[test]
    fn zero_size_removes_level() {
        let book = seeded();
        book.apply_ask(dec!(100.2), Decimal::ZERO);
        book.apply_ask(dec!(100.2), Decimal::ZERO); // idempotent
        let (asks, _) = book.depth();
        assert_eq!(asks, 3);
    }

    #[test]
    fn rebuild_drops_stale_levels() {
        let book = seeded();
        book.rebuild(&[(dec!(101.0), dec!(1))], &[(dec!(100.9), dec!(2))]);
        assert_eq!(book.sell1(), Some(dec!(101.0)));
        assert_eq!(book.buy1(), Some(dec!(100.9)));
        assert_eq!(book.depth(), (1, 1));
    }

    #[test]
    fn vwap_walks_opposite_side() {
        let book = seeded();
        // buy 15: 5@100.1 + 10@100.2
        let expect = (dec!(5) * dec!(100.1) + dec!(10) * dec!(100.2)) / dec!(15);
        assert_eq!(book.vwap_buy(dec!(15)), Some(expect));
        // sell 12: 4@100.0 + 8@99.9
        let expect = (dec!(4) * dec!(100.0) + dec!(8) * dec!(99.9)) / dec!(12);
        assert_eq!(book.vwap_sell(dec!(12)), Some(expect));
    }

    #[test]
    fn vwap_thin_book_returns_top() {
        let book = seeded();
        assert_eq!(book.vwap_buy(dec!(1000)), Some(dec!(100.1)));
        assert_eq!(book.vwap_sell(dec!(1000)), Some(dec!(100.0)));
    }

    #[test]
    fn vwap_empty_book_is_none_not_panic() {
        let book = OrderBook::new("X");
        assert_eq!(book.vwap_buy(dec!(1)), None);
        assert_eq!(book.max_buy_size_within_slip(dec!(0.01)), None);
        assert_eq!(book.middle(), None);
    }

    #[test]
    fn slip_bounds_accumulation() {
        let book = seeded();
        // 0.15% above 100.1 admits 100.1 and 100.2 but not 100.3
        assert_eq!(book.max_buy_size_within_slip(dec!(0.0015)), Some(dec!(15)));
        // generous bound takes everything
        assert_eq!(book.max_buy_size_within_slip(dec!(1)), Some(dec!(85)));
        // zero bound still admits the top level
        assert_eq!(book.max_buy_size_within_slip(Decimal::ZERO), Some(dec!(5)));
        // mirror for sells: 0.15% below 100.0 admits 100.0 and 99.9
        assert_eq!(book.max_sell_size_within_slip(dec!(0.0015)), Some(dec!(12)));
    }

    #[test]
    fn checksum_roundtrip_after_snapshot() {
        let book = seeded();
        let sum = book.checksum();
        assert!(book.verify_checksum(sum as i32));

        // any mutation changes the sum
        book.apply_bid(dec!(99.95), dec!(3));
        assert!(!book.verify_checksum(sum as i32));
        assert!(book.verify_checksum(book.checksum() as i32));
    }

    #[test]
    fn checksum_interleaves_bid_ask() {
        let book = OrderBook::new("X");
        book.rebuild(&[(dec!(2), dec!(20))], &[(dec!(1), dec!(10))]);
        let expect = crc32fast::hash(b"1:10:2:20");
        assert_eq!(book.checksum(), expect);

        // uneven sides append the remainder
        book.apply_ask(dec!(3), dec!(30));
        let expect = crc32fast::hash(b"1:10:2:20:3:30");
        assert_eq!(book.checksum(), expect);
    }

    #[test]
    fn clear_empties_both_sides() {
        let book = seeded();
        book.clear();
        assert!(book.is_empty());
        assert_eq!(book.buy1(), None);
        assert_eq!(book.sell1(), None);
    }
}
