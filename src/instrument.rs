// ===============================
// src/instrument.rs
// ===============================
//
// Process-wide instrument metadata. Every price quote and order size passes
// through this table before it reaches the wire.

use std::sync::Arc;

use ahash::AHashMap as HashMap;
use parking_lot::RwLock;
use rust_decimal::Decimal;

use crate::domain::{InstCategory, Side};
use crate::errors::{CoreError, Result};

/// Tick-size shape. Standard ticks are a single significant digit
/// (0.1, 0.01, ...); arbitrary ticks (0.025, 0.5) exist on some contracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickKind {
    Standard,
    Arbitrary,
}

impl TickKind {
    pub fn classify(tick: Decimal) -> TickKind {
        let mut m = tick.normalize().mantissa().abs();
        while m >= 10 && m % 10 == 0 {
            m /= 10;
        }
        if m == 1 {
            TickKind::Standard
        } else {
            TickKind::Arbitrary
        }
    }
}

/// Immutable per-instrument metadata, keyed by the venue-native id.
#[derive(Debug, Clone)]
pub struct Instrument {
    pub inst_id: String,
    pub base_ccy: String,
    pub quote_ccy: String,
    pub category: InstCategory,
    /// Contract face value; 1 for spot.
    pub ct_val: Decimal,
    /// Denomination currency of the face value.
    pub ct_val_ccy: String,
    pub settle_ccy: String,
    pub max_leverage: u32,
    pub tick_size: Decimal,
    pub lot_size: Decimal,
    pub min_size: Decimal,
    pub min_notional: Decimal,
    /// Zero for perpetuals.
    pub expiry_ms: i64,
    pub tick_kind: TickKind,
}

impl Instrument {
    /// Round `price` toward the side that is safe for `side` at this
    /// instrument's tick. With `post_only`, a quote that would still cross
    /// the given top-of-book is replaced by the same-side best quote.
    pub fn align_price(
        &self,
        price: Decimal,
        side: Side,
        post_only: bool,
        buy1: Option<Decimal>,
        sell1: Option<Decimal>,
    ) -> Decimal {
        let mut px = match side {
            Side::Buy => (price / self.tick_size).floor() * self.tick_size,
            Side::Sell => (price / self.tick_size).ceil() * self.tick_size,
        };
        if post_only {
            match side {
                Side::Buy => {
                    if let (Some(bid), Some(ask)) = (buy1, sell1) {
                        if px >= ask {
                            px = bid;
                        }
                    }
                }
                Side::Sell => {
                    if let (Some(bid), Some(ask)) = (buy1, sell1) {
                        if px <= bid {
                            px = ask;
                        }
                    }
                }
            }
        }
        px.normalize()
    }

    /// Floor `size` to a whole number of lots.
    pub fn align_size(&self, size: Decimal) -> Decimal {
        ((size / self.lot_size).floor() * self.lot_size).normalize()
    }

    /// Effective minimum order size at the given quote price:
    /// max(min_size, min_notional / price), snapped up to the lot grid.
    pub fn min_size_at(&self, price: Decimal) -> Decimal {
        let mut floor = self.min_size;
        if !self.min_notional.is_zero() && !price.is_zero() {
            let by_notional = self.min_notional / (price * self.ct_val);
            if by_notional > floor {
                floor = by_notional;
            }
        }
        (((floor / self.lot_size).ceil()) * self.lot_size).normalize()
    }

    /// Quote-ccy notional of `size` contracts at `price`.
    pub fn notional(&self, price: Decimal, size: Decimal) -> Decimal {
        price * size * self.ct_val
    }

    pub fn is_perpetual(&self) -> bool {
        self.category.is_swap() && self.expiry_ms == 0
    }
}

/// Read-mostly registry: populated at venue boot, lazily extended when a
/// previously unseen instrument is requested.
#[derive(Default)]
pub struct InstrumentRegistry {
    inner: RwLock<HashMap<String, Arc<Instrument>>>,
}

impl InstrumentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, inst: Instrument) {
        self.inner.write().insert(inst.inst_id.clone(), Arc::new(inst));
    }

    pub fn extend(&self, insts: impl IntoIterator<Item = Instrument>) {
        let mut map = self.inner.write();
        for inst in insts {
            map.insert(inst.inst_id.clone(), Arc::new(inst));
        }
    }

    /// Unknown ids are fatal to the calling operation: callers must
    /// register the instrument first.
    pub fn get(&self, inst_id: &str) -> Result<Arc<Instrument>> {
        self.inner
            .read()
            .get(inst_id)
            .cloned()
            .ok_or_else(|| CoreError::UnknownInstrument(inst_id.to_string()))
    }

    pub fn contains(&self, inst_id: &str) -> bool {
        self.inner.read().contains_key(inst_id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// All registered ids in the given category.
    pub fn ids_in(&self, category: InstCategory) -> Vec<String> {
        self.inner
            .read()
            .values()
            .filter(|i| i.category == category)
            .map(|i| i.inst_id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn swap() -> Instrument {
        Instrument {
            inst_id: "ETH-USDT-SWAP".to_string(),
            base_ccy: "ETH".to_string(),
            quote_ccy: "USDT".to_string(),
            category: InstCategory::UsdtSwap,
            ct_val: dec!(0.01),
            ct_val_ccy: "ETH".to_string(),
            settle_ccy: "USDT".to_string(),
            max_leverage: 75,
            tick_size: dec!(0.01),
            lot_size: dec!(1),
            min_size: dec!(1),
            min_notional: Decimal::ZERO,
            expiry_ms: 0,
            tick_kind: TickKind::Standard,
        }
    }

    fn spot() -> Instrument {
        Instrument {
            inst_id: "ETH-USDT".to_string(),
            base_ccy: "ETH".to_string(),
            quote_ccy: "USDT".to_string(),
            category: InstCategory::Spot,
            ct_val: Decimal::ONE,
            ct_val_ccy: "ETH".to_string(),
            settle_ccy: "USDT".to_string(),
            max_leverage: 1,
            tick_size: dec!(0.025),
            lot_size: dec!(0.0001),
            min_size: dec!(0.001),
            min_notional: dec!(5),
            expiry_ms: 0,
            tick_kind: TickKind::Arbitrary,
        }
    }

    #[test]
    fn price_rounds_toward_safe_side() {
        let inst = swap();
        assert_eq!(inst.align_price(dec!(100.017), Side::Buy, false, None, None), dec!(100.01));
        assert_eq!(inst.align_price(dec!(100.011), Side::Sell, false, None, None), dec!(100.02));
    }

    #[test]
    fn arbitrary_tick_alignment() {
        let inst = spot();
        assert_eq!(inst.align_price(dec!(2000.06), Side::Buy, false, None, None), dec!(2000.05));
        assert_eq!(inst.align_price(dec!(2000.06), Side::Sell, false, None, None), dec!(2000.075));
    }

    #[test]
    fn alignment_is_idempotent() {
        let inst = spot();
        for raw in [dec!(1834.5117), dec!(0.07), dec!(99999.999)] {
            let once = inst.align_price(raw, Side::Buy, false, None, None);
            let twice = inst.align_price(once, Side::Buy, false, None, None);
            assert_eq!(once, twice);
        }
        let s = inst.align_size(dec!(1.23456789));
        assert_eq!(s, inst.align_size(s));
    }

    #[test]
    fn post_only_crossing_buy_rewrites_to_same_side_best() {
        let inst = swap();
        let bid = dec!(100.00);
        let ask = dec!(100.01);
        // at or above best ask -> repriced to best bid
        assert_eq!(inst.align_price(dec!(100.01), Side::Buy, true, Some(bid), Some(ask)), bid);
        assert_eq!(inst.align_price(dec!(105.00), Side::Buy, true, Some(bid), Some(ask)), bid);
        // below best ask stays put
        assert_eq!(inst.align_price(dec!(100.00), Side::Buy, true, Some(bid), Some(ask)), bid);
        assert_eq!(
            inst.align_price(dec!(99.99), Side::Buy, true, Some(bid), Some(ask)),
            dec!(99.99)
        );
    }

    #[test]
    fn post_only_crossing_sell_rewrites_to_same_side_best() {
        let inst = swap();
        let bid = dec!(100.00);
        let ask = dec!(100.01);
        assert_eq!(inst.align_price(dec!(100.00), Side::Sell, true, Some(bid), Some(ask)), ask);
        assert_eq!(inst.align_price(dec!(95.0), Side::Sell, true, Some(bid), Some(ask)), ask);
        assert_eq!(
            inst.align_price(dec!(100.02), Side::Sell, true, Some(bid), Some(ask)),
            dec!(100.02)
        );
    }

    #[test]
    fn size_floors_to_lot() {
        let inst = spot();
        assert_eq!(inst.align_size(dec!(1.23456789)), dec!(1.2345));
        assert_eq!(inst.align_size(dec!(0.00009)), Decimal::ZERO);
    }

    #[test]
    fn effective_minimum_respects_notional() {
        let inst = spot();
        // 5 USDT at 2000 -> 0.0025 ETH, above the 0.001 floor
        assert_eq!(inst.min_size_at(dec!(2000)), dec!(0.0025));
        // at a very high price the static minimum wins
        assert_eq!(inst.min_size_at(dec!(1000000)), dec!(0.001));
    }

    #[test]
    fn registry_lookup() {
        let reg = InstrumentRegistry::new();
        reg.insert(swap());
        assert!(reg.get("ETH-USDT-SWAP").is_ok());
        assert!(matches!(reg.get("BTC-USDT"), Err(CoreError::UnknownInstrument(_))));
        assert_eq!(reg.ids_in(InstCategory::UsdtSwap), vec!["ETH-USDT-SWAP".to_string()]);
    }

    #[test]
    fn tick_kind_classification() {
        assert_eq!(TickKind::classify(dec!(0.01)), TickKind::Standard);
        assert_eq!(TickKind::classify(dec!(10)), TickKind::Standard);
        assert_eq!(TickKind::classify(dec!(0.025)), TickKind::Arbitrary);
        assert_eq!(TickKind::classify(dec!(0.5)), TickKind::Arbitrary);
    }
}
