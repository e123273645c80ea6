// ===============================
// src/ledger.rs
// ===============================
//
// Balance & position ledger. Each record combines the authoritative value
// from server pushes/REST with a bounded list of locally-predicted
// temp-deltas tagged by fill time. A delta is retired when an
// authoritative update covers its timestamp, or discarded after the
// staleness bound, which latches the record not-ready until the next
// authoritative refresh.

use std::sync::Arc;

use ahash::AHashMap as HashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;

use crate::domain::{now_ms, BalancePush, PosSide, PositionPush};
use crate::metrics::LEDGER_NOT_READY;

/// How long a temp-delta may wait for a covering authoritative update.
pub const STALE_BOUND_MS: i64 = 10_000;

#[derive(Debug, Clone, Copy)]
struct TempDelta {
    value: Decimal,
    fill_time_ms: i64,
    recorded_ms: i64,
}

#[derive(Debug, Default)]
struct BalanceRecord {
    rights: Decimal,
    frozen: Decimal,
    update_time_ms: i64,
    deltas: Vec<TempDelta>,
    /// Latched when a delta expired uncovered; cleared by the next
    /// authoritative refresh.
    stale: bool,
}

impl BalanceRecord {
    fn reap(&mut self, now: i64) {
        let before = self.deltas.len();
        self.deltas.retain(|d| now - d.recorded_ms <= STALE_BOUND_MS);
        if self.deltas.len() < before {
            self.stale = true;
        }
    }

    fn total(&self) -> Decimal {
        self.rights + self.deltas.iter().map(|d| d.value).sum::<Decimal>()
    }
}

#[derive(Debug, Default)]
struct PositionSideState {
    amount: Decimal,
    avg_entry: Decimal,
    update_time_ms: i64,
    deltas: Vec<TempDelta>,
    stale: bool,
}

impl PositionSideState {
    fn reap(&mut self, now: i64) {
        let before = self.deltas.len();
        self.deltas.retain(|d| now - d.recorded_ms <= STALE_BOUND_MS);
        if self.deltas.len() < before {
            self.stale = true;
        }
    }

    fn total(&self) -> Decimal {
        self.amount + self.deltas.iter().map(|d| d.value).sum::<Decimal>()
    }
}

#[derive(Debug, Default)]
struct PositionRecord {
    long: PositionSideState,
    short: PositionSideState,
}

impl PositionRecord {
    fn side_mut(&mut self, side: PosSide) -> &mut PositionSideState {
        match side {
            PosSide::Long => &mut self.long,
            PosSide::Short => &mut self.short,
        }
    }
}

/// Snapshot of one currency's balance as seen by strategies.
#[derive(Debug, Clone, Copy)]
pub struct BalanceView {
    pub total: Decimal,
    pub frozen: Decimal,
    pub update_time_ms: i64,
    pub ready: bool,
}

/// Snapshot of one instrument's dual-side position.
#[derive(Debug, Clone, Copy)]
pub struct PositionView {
    pub long: Decimal,
    pub long_avg_entry: Decimal,
    pub short: Decimal,
    pub short_avg_entry: Decimal,
    pub ready: bool,
}

impl PositionView {
    pub fn net(&self) -> Decimal {
        self.long - self.short
    }
}

/// Per-venue ledger. The outer maps only guard record lookup; each record
/// has its own mutex so balance and position updates never contend.
#[derive(Default)]
pub struct Ledger {
    balances: Mutex<HashMap<String, Arc<Mutex<BalanceRecord>>>>,
    positions: Mutex<HashMap<String, Arc<Mutex<PositionRecord>>>>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    fn balance_record(&self, ccy: &str) -> Arc<Mutex<BalanceRecord>> {
        self.balances.lock().entry(ccy.to_string()).or_default().clone()
    }

    fn position_record(&self, inst_id: &str) -> Arc<Mutex<PositionRecord>> {
        self.positions.lock().entry(inst_id.to_string()).or_default().clone()
    }

    /// Append a locally-predicted balance adjustment produced by a fill.
    pub fn record_balance_delta(&self, ccy: &str, value: Decimal, fill_time_ms: i64) {
        self.record_balance_delta_at(ccy, value, fill_time_ms, now_ms());
    }

    pub fn record_balance_delta_at(
        &self,
        ccy: &str,
        value: Decimal,
        fill_time_ms: i64,
        now: i64,
    ) {
        let rec = self.balance_record(ccy);
        let mut rec = rec.lock();
        rec.reap(now);
        rec.deltas.push(TempDelta { value, fill_time_ms, recorded_ms: now });
    }

    /// Authoritative balance refresh. A push sets exactly the fields it
    /// carries; an absent field leaves the previous value. Pushes not newer
    /// than the record are dropped.
    pub fn refresh_balance(&self, push: &BalancePush) {
        self.refresh_balance_at(push, now_ms());
    }

    pub fn refresh_balance_at(&self, push: &BalancePush, now: i64) {
        let rec = self.balance_record(&push.ccy);
        let mut rec = rec.lock();
        if rec.update_time_ms != 0 && push.update_time_ms <= rec.update_time_ms {
            return;
        }
        if let Some(rights) = push.rights {
            rec.rights = rights;
        }
        if let Some(frozen) = push.frozen {
            rec.frozen = frozen;
        }
        rec.update_time_ms = push.update_time_ms;
        rec.deltas.retain(|d| d.fill_time_ms > push.update_time_ms);
        rec.reap(now);
        rec.stale = false;
    }

    pub fn balance(&self, ccy: &str) -> BalanceView {
        self.balance_at(ccy, now_ms())
    }

    pub fn balance_at(&self, ccy: &str, now: i64) -> BalanceView {
        let rec = self.balance_record(ccy);
        let mut rec = rec.lock();
        rec.reap(now);
        LEDGER_NOT_READY.with_label_values(&[ccy]).set(i64::from(rec.stale));
        BalanceView {
            total: rec.total(),
            frozen: rec.frozen,
            update_time_ms: rec.update_time_ms,
            ready: !rec.stale,
        }
    }

    /// Append a locally-predicted position adjustment for one side.
    pub fn record_position_delta(
        &self,
        inst_id: &str,
        side: PosSide,
        value: Decimal,
        fill_time_ms: i64,
    ) {
        self.record_position_delta_at(inst_id, side, value, fill_time_ms, now_ms());
    }

    pub fn record_position_delta_at(
        &self,
        inst_id: &str,
        side: PosSide,
        value: Decimal,
        fill_time_ms: i64,
        now: i64,
    ) {
        let rec = self.position_record(inst_id);
        let mut rec = rec.lock();
        let side = rec.side_mut(side);
        side.reap(now);
        side.deltas.push(TempDelta { value, fill_time_ms, recorded_ms: now });
    }

    /// Authoritative position refresh for one side of one instrument.
    pub fn refresh_position(&self, push: &PositionPush) {
        self.refresh_position_at(push, now_ms());
    }

    pub fn refresh_position_at(&self, push: &PositionPush, now: i64) {
        let rec = self.position_record(&push.inst_id);
        let mut rec = rec.lock();
        let side = rec.side_mut(push.pos_side);
        if side.update_time_ms != 0 && push.update_time_ms <= side.update_time_ms {
            return;
        }
        side.amount = push.amount;
        side.avg_entry = push.avg_entry;
        side.update_time_ms = push.update_time_ms;
        side.deltas.retain(|d| d.fill_time_ms > push.update_time_ms);
        side.reap(now);
        side.stale = false;
    }

    pub fn position(&self, inst_id: &str) -> PositionView {
        self.position_at(inst_id, now_ms())
    }

    pub fn position_at(&self, inst_id: &str, now: i64) -> PositionView {
        let rec = self.position_record(inst_id);
        let mut rec = rec.lock();
        rec.long.reap(now);
        rec.short.reap(now);
        LEDGER_NOT_READY
            .with_label_values(&[inst_id])
            .set(i64::from(rec.long.stale || rec.short.stale));
        PositionView {
            long: rec.long.total(),
            long_avg_entry: rec.long.avg_entry,
            short: rec.short.total(),
            short_avg_entry: rec.short.avg_entry,
            ready: !rec.long.stale && !rec.short.stale,
        }
    }

    /// Re-initialize every locally-known position to flat. Applied before
    /// the first private position push so instruments the server stays
    /// silent about are implicitly zero.
    pub fn reset_positions_zero(&self) {
        let records: Vec<_> = self.positions.lock().values().cloned().collect();
        for rec in records {
            let mut rec = rec.lock();
            let rec = &mut *rec;
            for side in [&mut rec.long, &mut rec.short] {
                side.amount = Decimal::ZERO;
                side.avg_entry = Decimal::ZERO;
                side.update_time_ms = 0;
                side.deltas.clear();
                side.stale = false;
            }
        }
    }

    /// Make sure records exist so `reset_positions_zero` covers them.
    pub fn touch_position(&self, inst_id: &str) {
        let _ = self.position_record(inst_id);
    }

    pub fn touch_balance(&self, ccy: &str) {
        let _ = self.balance_record(ccy);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn push(ccy: &str, rights: Decimal, frozen: Decimal, t: i64) -> BalancePush {
        BalancePush { ccy: ccy.to_string(), rights: Some(rights), frozen: Some(frozen), update_time_ms: t }
    }

    #[test]
    fn totals_are_authoritative_plus_deltas() {
        let ledger = Ledger::new();
        ledger.refresh_balance_at(&push("USDT", dec!(100), dec!(0), 1_000), 1_000);
        ledger.record_balance_delta_at("USDT", dec!(-25), 1_500, 1_500);
        ledger.record_balance_delta_at("USDT", dec!(10), 1_600, 1_600);

        let view = ledger.balance_at("USDT", 2_000);
        assert_eq!(view.total, dec!(85));
        assert!(view.ready);
    }

    #[test]
    fn covering_refresh_retires_delta() {
        // fill at t=0, push with update-time 300 already reflecting it
        let ledger = Ledger::new();
        ledger.record_balance_delta_at("ETH", dec!(1.0), 0, 0);
        ledger.refresh_balance_at(&push("ETH", dec!(3.0), dec!(0), 300), 200);

        let view = ledger.balance_at("ETH", 400);
        assert_eq!(view.total, dec!(3.0));
        assert!(view.ready);
    }

    #[test]
    fn later_fill_survives_earlier_refresh() {
        let ledger = Ledger::new();
        ledger.record_balance_delta_at("ETH", dec!(1.0), 500, 500);
        // authoritative state as of t=300 does not cover the t=500 fill
        ledger.refresh_balance_at(&push("ETH", dec!(2.0), dec!(0), 300), 600);

        let view = ledger.balance_at("ETH", 700);
        assert_eq!(view.total, dec!(3.0));
        assert!(view.ready);
    }

    #[test]
    fn stale_delta_is_discarded_and_latches_not_ready() {
        // no covering refresh ever arrives
        let ledger = Ledger::new();
        ledger.refresh_balance_at(&push("ETH", dec!(2.0), dec!(0), 100), 100);
        ledger.record_balance_delta_at("ETH", dec!(1.0), 200, 200);

        let before = ledger.balance_at("ETH", 200 + STALE_BOUND_MS);
        assert!(before.ready);
        assert_eq!(before.total, dec!(3.0));

        let after = ledger.balance_at("ETH", 201 + STALE_BOUND_MS);
        assert!(!after.ready);
        assert_eq!(after.total, dec!(2.0));

        // next authoritative update clears the latch
        ledger.refresh_balance_at(&push("ETH", dec!(3.0), dec!(0), 20_000), 20_000);
        assert!(ledger.balance_at("ETH", 20_100).ready);
    }

    #[test]
    fn stale_refresh_is_dropped() {
        let ledger = Ledger::new();
        ledger.refresh_balance_at(&push("USDT", dec!(50), dec!(5), 2_000), 2_000);
        ledger.refresh_balance_at(&push("USDT", dec!(99), dec!(9), 1_500), 2_100);

        let view = ledger.balance_at("USDT", 2_200);
        assert_eq!(view.total, dec!(50));
        assert_eq!(view.frozen, dec!(5));
    }

    #[test]
    fn absent_field_means_unchanged() {
        let ledger = Ledger::new();
        ledger.refresh_balance_at(&push("USDT", dec!(50), dec!(5), 1_000), 1_000);
        ledger.refresh_balance_at(
            &BalancePush {
                ccy: "USDT".to_string(),
                rights: Some(dec!(60)),
                frozen: None,
                update_time_ms: 1_100,
            },
            1_100,
        );
        let view = ledger.balance_at("USDT", 1_200);
        assert_eq!(view.total, dec!(60));
        assert_eq!(view.frozen, dec!(5));
    }

    #[test]
    fn position_sides_and_net() {
        let ledger = Ledger::new();
        ledger.refresh_position_at(
            &PositionPush {
                inst_id: "ETH-USDT-SWAP".to_string(),
                pos_side: PosSide::Long,
                amount: dec!(10),
                avg_entry: dec!(101),
                update_time_ms: 1_000,
            },
            1_000,
        );
        ledger.record_position_delta_at("ETH-USDT-SWAP", PosSide::Short, dec!(4), 1_100, 1_100);

        let view = ledger.position_at("ETH-USDT-SWAP", 1_200);
        assert_eq!(view.long, dec!(10));
        assert_eq!(view.short, dec!(4));
        assert_eq!(view.net(), dec!(6));
        assert!(view.ready);
    }

    #[test]
    fn reset_positions_flattens_known_records() {
        let ledger = Ledger::new();
        ledger.refresh_position_at(
            &PositionPush {
                inst_id: "BTC-USDT-SWAP".to_string(),
                pos_side: PosSide::Long,
                amount: dec!(2),
                avg_entry: dec!(30000),
                update_time_ms: 500,
            },
            500,
        );
        ledger.reset_positions_zero();
        let view = ledger.position_at("BTC-USDT-SWAP", 600);
        assert_eq!(view.long, Decimal::ZERO);
        assert_eq!(view.net(), Decimal::ZERO);

        // a fresh push after the reset is accepted even with an older stamp
        ledger.refresh_position_at(
            &PositionPush {
                inst_id: "BTC-USDT-SWAP".to_string(),
                pos_side: PosSide::Long,
                amount: dec!(1),
                avg_entry: dec!(30000),
                update_time_ms: 400,
            },
            700,
        );
        assert_eq!(ledger.position_at("BTC-USDT-SWAP", 800).long, dec!(1));
    }
}
