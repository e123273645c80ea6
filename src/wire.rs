// ===============================
// src/wire.rs
// ===============================
//
// Wire-format models and payload builders. The venue sends every numeric
// field as a string; conversion into typed records happens here and
// nowhere else.

use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;

use crate::domain::{
    BalancePush, FundingRatePush, InstCategory, LiquidationPush, MarkPricePush, OrderSnapshot,
    OrderStatus, PositionPush, PriceLimitPush, PosSide, Side, SnapshotSource,
};
use crate::errors::{CoreError, Result};
use crate::instrument::{Instrument, TickKind};

// ---- venue error codes ----

pub const CODE_OK: &str = "0";
/// Cancel refused because there is nothing left to cancel.
pub const ECODE_NOTHING_TO_CANCEL: &str = "51400";
pub const ECODE_ALREADY_CANCELLED: &str = "51401";
pub const ECODE_ALREADY_FILLED: &str = "51402";
pub const ECODE_CANCEL_IN_PROGRESS: &str = "51410";
/// Amend target does not exist (any more).
pub const ECODE_AMEND_NOT_FOUND: &str = "51503";
pub const ECODE_ORDER_NOT_FOUND: &str = "51603";

/// Codes that mean the server considers the order terminal while we may
/// not: the caller must force an immediate status poll.
pub fn implies_terminal(code: &str) -> bool {
    matches!(
        code,
        ECODE_ALREADY_CANCELLED | ECODE_ALREADY_FILLED | ECODE_AMEND_NOT_FOUND
            | ECODE_ORDER_NOT_FOUND
    )
}

/// Cancel outcomes that need no reaction at all.
pub fn quiet_cancel(code: &str) -> bool {
    matches!(code, ECODE_NOTHING_TO_CANCEL | ECODE_CANCEL_IN_PROGRESS)
}

// ---- string -> decimal helpers ----

pub fn parse_dec(s: &str) -> Decimal {
    s.parse().unwrap_or(Decimal::ZERO)
}

pub fn opt_dec(s: &str) -> Option<Decimal> {
    if s.is_empty() {
        None
    } else {
        s.parse().ok()
    }
}

fn parse_ms(s: &str) -> i64 {
    s.parse().unwrap_or(0)
}

// ---- REST envelope ----

#[derive(Debug, Deserialize)]
pub struct RestEnvelope<T> {
    pub code: String,
    #[serde(default)]
    pub msg: String,
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
}

impl<T> RestEnvelope<T> {
    /// Collapse the venue envelope into a typed result.
    pub fn into_data(self) -> Result<Vec<T>> {
        if self.code == CODE_OK {
            Ok(self.data)
        } else {
            Err(CoreError::venue(self.code, self.msg))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WireServerTime {
    pub ts: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireAccountConfig {
    pub acct_lv: String,
    pub pos_mode: String,
}

impl WireAccountConfig {
    /// Expected operating modes: single-currency margin account,
    /// long/short dual position.
    pub fn check_expected(&self) -> Result<()> {
        if self.acct_lv != "2" {
            return Err(CoreError::Config(format!(
                "account must be in single-currency margin mode, got acctLv={}",
                self.acct_lv
            )));
        }
        if self.pos_mode != "long_short_mode" {
            return Err(CoreError::Config(format!(
                "account must be in long/short position mode, got posMode={}",
                self.pos_mode
            )));
        }
        Ok(())
    }
}

// ---- instruments ----

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireInstrument {
    pub inst_id: String,
    pub inst_type: String,
    #[serde(default)]
    pub base_ccy: String,
    #[serde(default)]
    pub quote_ccy: String,
    #[serde(default)]
    pub ct_val: String,
    #[serde(default)]
    pub ct_val_ccy: String,
    #[serde(default)]
    pub settle_ccy: String,
    #[serde(default)]
    pub ct_type: String,
    #[serde(default)]
    pub lever: String,
    pub tick_sz: String,
    pub lot_sz: String,
    pub min_sz: String,
    #[serde(default)]
    pub min_notional: String,
    #[serde(default)]
    pub exp_time: String,
}

impl WireInstrument {
    pub fn category(&self) -> Option<InstCategory> {
        match self.inst_type.as_str() {
            "SPOT" => Some(InstCategory::Spot),
            "SWAP" => {
                if self.ct_type == "inverse" {
                    Some(InstCategory::UsdSwap)
                } else {
                    Some(InstCategory::UsdtSwap)
                }
            }
            _ => None,
        }
    }

    pub fn into_instrument(self) -> Option<Instrument> {
        let category = self.category()?;
        let tick_size = opt_dec(&self.tick_sz)?;
        let lot_size = opt_dec(&self.lot_sz)?;
        // alignment divides by these
        if tick_size <= Decimal::ZERO || lot_size <= Decimal::ZERO {
            return None;
        }
        let (base_ccy, quote_ccy) = if category == InstCategory::Spot {
            (self.base_ccy.clone(), self.quote_ccy.clone())
        } else {
            // derivative ids are BASE-QUOTE-SWAP
            let mut it = self.inst_id.split('-');
            (it.next().unwrap_or_default().to_string(), it.next().unwrap_or_default().to_string())
        };
        Some(Instrument {
            inst_id: self.inst_id,
            base_ccy,
            quote_ccy,
            category,
            ct_val: opt_dec(&self.ct_val).unwrap_or(Decimal::ONE),
            ct_val_ccy: self.ct_val_ccy,
            settle_ccy: if self.settle_ccy.is_empty() {
                self.quote_ccy
            } else {
                self.settle_ccy
            },
            max_leverage: self.lever.parse().unwrap_or(1),
            tick_kind: TickKind::classify(tick_size),
            tick_size,
            lot_size,
            min_size: parse_dec(&self.min_sz),
            min_notional: parse_dec(&self.min_notional),
            expiry_ms: parse_ms(&self.exp_time),
        })
    }
}

// ---- orders ----

/// Per-order result entry of create/amend/cancel responses.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireOrderAck {
    #[serde(default)]
    pub ord_id: String,
    #[serde(default)]
    pub cl_ord_id: String,
    pub s_code: String,
    #[serde(default)]
    pub s_msg: String,
}

/// Order record as it appears in both the `orders` push and the order
/// detail poll.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireOrder {
    pub inst_id: String,
    pub ord_id: String,
    #[serde(default)]
    pub cl_ord_id: String,
    #[serde(default)]
    pub px: String,
    pub sz: String,
    pub state: String,
    #[serde(default)]
    pub side: String,
    #[serde(default)]
    pub acc_fill_sz: String,
    #[serde(default)]
    pub avg_px: String,
    #[serde(default)]
    pub u_time: String,
}

impl WireOrder {
    pub fn side(&self) -> Option<Side> {
        match self.side.as_str() {
            "buy" => Some(Side::Buy),
            "sell" => Some(Side::Sell),
            _ => None,
        }
    }

    pub fn into_snapshot(self, source: SnapshotSource) -> Option<OrderSnapshot> {
        let status = OrderStatus::parse(&self.state)?;
        Some(OrderSnapshot {
            order_id: self.ord_id,
            client_id: self.cl_ord_id,
            inst_id: self.inst_id,
            price: parse_dec(&self.px),
            size: parse_dec(&self.sz),
            filled: parse_dec(&self.acc_fill_sz),
            avg_price: parse_dec(&self.avg_px),
            status,
            update_time_ms: parse_ms(&self.u_time),
            source,
        })
    }
}

// ---- private pushes ----

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireBalanceDetail {
    pub ccy: String,
    #[serde(default)]
    pub cash_bal: String,
    #[serde(default)]
    pub frozen_bal: String,
    #[serde(default)]
    pub u_time: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireAccountData {
    #[serde(default)]
    pub details: Vec<WireBalanceDetail>,
    #[serde(default)]
    pub u_time: String,
}

impl WireAccountData {
    pub fn pushes(&self) -> Vec<BalancePush> {
        let fallback = parse_ms(&self.u_time);
        self.details
            .iter()
            .map(|d| {
                let t = parse_ms(&d.u_time);
                BalancePush {
                    ccy: d.ccy.clone(),
                    rights: opt_dec(&d.cash_bal),
                    frozen: opt_dec(&d.frozen_bal),
                    update_time_ms: if t != 0 { t } else { fallback },
                }
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WirePosition {
    pub inst_id: String,
    pub pos_side: String,
    #[serde(default)]
    pub pos: String,
    #[serde(default)]
    pub avg_px: String,
    #[serde(default)]
    pub u_time: String,
}

impl WirePosition {
    pub fn into_push(self) -> Option<PositionPush> {
        Some(PositionPush {
            pos_side: PosSide::parse(&self.pos_side)?,
            inst_id: self.inst_id,
            amount: parse_dec(&self.pos),
            avg_entry: parse_dec(&self.avg_px),
            update_time_ms: parse_ms(&self.u_time),
        })
    }
}

// ---- public pushes ----

/// Depth frame payload. Levels are `[px, sz, ...]` string arrays.
#[derive(Debug, Deserialize)]
pub struct WireBookData {
    #[serde(default)]
    pub asks: Vec<Vec<String>>,
    #[serde(default)]
    pub bids: Vec<Vec<String>>,
    #[serde(default)]
    pub ts: String,
    #[serde(default)]
    pub checksum: Option<i64>,
}

impl WireBookData {
    pub fn ts_ms(&self) -> i64 {
        parse_ms(&self.ts)
    }

    pub fn ask_levels(&self) -> Vec<(Decimal, Decimal)> {
        Self::levels(&self.asks)
    }

    pub fn bid_levels(&self) -> Vec<(Decimal, Decimal)> {
        Self::levels(&self.bids)
    }

    fn levels(raw: &[Vec<String>]) -> Vec<(Decimal, Decimal)> {
        raw.iter()
            .filter_map(|l| {
                let px = l.first().and_then(|s| opt_dec(s))?;
                let sz = l.get(1).map(|s| parse_dec(s))?;
                Some((px, sz))
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireTicker {
    pub inst_id: String,
    #[serde(default)]
    pub bid_px: String,
    #[serde(default)]
    pub bid_sz: String,
    #[serde(default)]
    pub ask_px: String,
    #[serde(default)]
    pub ask_sz: String,
    #[serde(default)]
    pub ts: String,
}

impl WireTicker {
    pub fn ts_ms(&self) -> i64 {
        parse_ms(&self.ts)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMarkPrice {
    pub inst_id: String,
    pub mark_px: String,
    #[serde(default)]
    pub ts: String,
}

impl WireMarkPrice {
    pub fn into_push(self) -> MarkPricePush {
        MarkPricePush {
            mark_price: parse_dec(&self.mark_px),
            update_time_ms: parse_ms(&self.ts),
            inst_id: self.inst_id,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireFundingRate {
    pub inst_id: String,
    pub funding_rate: String,
    #[serde(default)]
    pub next_funding_rate: String,
    #[serde(default)]
    pub funding_time: String,
}

impl WireFundingRate {
    pub fn into_push(self) -> FundingRatePush {
        FundingRatePush {
            rate: parse_dec(&self.funding_rate),
            next_rate: opt_dec(&self.next_funding_rate),
            funding_time_ms: parse_ms(&self.funding_time),
            inst_id: self.inst_id,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WirePriceLimit {
    pub inst_id: String,
    pub buy_lmt: String,
    pub sell_lmt: String,
    #[serde(default)]
    pub ts: String,
}

impl WirePriceLimit {
    pub fn into_push(self) -> PriceLimitPush {
        PriceLimitPush {
            buy_limit: parse_dec(&self.buy_lmt),
            sell_limit: parse_dec(&self.sell_lmt),
            update_time_ms: parse_ms(&self.ts),
            inst_id: self.inst_id,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireLiquidation {
    pub inst_id: String,
    #[serde(default)]
    pub details: Vec<WireLiquidationDetail>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireLiquidationDetail {
    pub side: String,
    #[serde(default)]
    pub sz: String,
    #[serde(default)]
    pub bk_px: String,
    #[serde(default)]
    pub ts: String,
}

impl WireLiquidation {
    pub fn pushes(&self) -> Vec<LiquidationPush> {
        self.details
            .iter()
            .filter_map(|d| {
                let side = match d.side.as_str() {
                    "buy" => Side::Buy,
                    "sell" => Side::Sell,
                    _ => return None,
                };
                Some(LiquidationPush {
                    inst_id: self.inst_id.clone(),
                    side,
                    size: parse_dec(&d.sz),
                    price: parse_dec(&d.bk_px),
                    update_time_ms: parse_ms(&d.ts),
                })
            })
            .collect()
    }
}

// ---- inbound frame shell ----

#[derive(Debug, Deserialize)]
pub struct WsArg {
    #[serde(default)]
    pub channel: String,
    #[serde(default, rename = "instId")]
    pub inst_id: String,
    #[serde(default, rename = "instType")]
    pub inst_type: String,
}

#[derive(Debug, Deserialize)]
pub struct WsInbound {
    pub arg: WsArg,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl WsInbound {
    pub fn parse(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn data_as<T: serde::de::DeserializeOwned>(&self) -> Result<Vec<T>> {
        if self.data.is_null() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_value(self.data.clone())?)
    }

    /// Incremental-depth frames carry `action: "snapshot" | "update"`.
    pub fn is_snapshot(&self) -> bool {
        self.action.as_deref() == Some("snapshot")
    }
}

/// Cheap stream identification: scan for the channel tag without parsing
/// the whole frame. Non-data frames (acks, errors, pongs) return None.
pub fn frame_channel(raw: &str) -> Option<&str> {
    const NEEDLE: &str = "\"arg\":{\"channel\":\"";
    let start = raw.find(NEEDLE)? + NEEDLE.len();
    let rest = &raw[start..];
    let end = rest.find('"')?;
    Some(&rest[..end])
}

/// Companion scanner for the frame's instrument id. Broadcast streams
/// keyed by `instType` return None.
pub fn frame_inst_id(raw: &str) -> Option<&str> {
    const NEEDLE: &str = "\"instId\":\"";
    let start = raw.find(NEEDLE)? + NEEDLE.len();
    let rest = &raw[start..];
    let end = rest.find('"')?;
    Some(&rest[..end])
}

// ---- outbound payloads ----

pub fn subscribe_payload(channel: &str, inst_id: &str) -> String {
    json!({"op": "subscribe", "args": [{"channel": channel, "instId": inst_id}]}).to_string()
}

pub fn unsubscribe_payload(channel: &str, inst_id: &str) -> String {
    json!({"op": "unsubscribe", "args": [{"channel": channel, "instId": inst_id}]}).to_string()
}

/// Broadcast streams (e.g. liquidation orders) subscribe by instrument
/// type instead of a single instrument.
pub fn subscribe_inst_type_payload(channel: &str, inst_type: &str) -> String {
    json!({"op": "subscribe", "args": [{"channel": channel, "instType": inst_type}]}).to_string()
}

/// Account-wide streams take the bare channel name.
pub fn subscribe_channel_payload(channel: &str) -> String {
    json!({"op": "subscribe", "args": [{"channel": channel}]}).to_string()
}

pub fn login_payload(api_key: &str, passphrase: &str, ts_secs: &str, sign: &str) -> String {
    json!({
        "op": "login",
        "args": [{
            "apiKey": api_key,
            "passphrase": passphrase,
            "timestamp": ts_secs,
            "sign": sign,
        }]
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn envelope_maps_error_codes() {
        let raw = r#"{"code":"50011","msg":"rate limited","data":[]}"#;
        let env: RestEnvelope<WireServerTime> = serde_json::from_str(raw).unwrap();
        match env.into_data() {
            Err(CoreError::Venue { code, msg }) => {
                assert_eq!(code, "50011");
                assert_eq!(msg, "rate limited");
            }
            other => panic!("expected venue error, got {other:?}"),
        }
    }

    #[test]
    fn instrument_parses_swap() {
        let raw = r#"{
            "instId":"ETH-USDT-SWAP","instType":"SWAP","ctVal":"0.01",
            "ctValCcy":"ETH","settleCcy":"USDT","ctType":"linear","lever":"75",
            "tickSz":"0.01","lotSz":"1","minSz":"1","expTime":""
        }"#;
        let wi: WireInstrument = serde_json::from_str(raw).unwrap();
        let inst = wi.into_instrument().unwrap();
        assert_eq!(inst.category, InstCategory::UsdtSwap);
        assert_eq!(inst.base_ccy, "ETH");
        assert_eq!(inst.quote_ccy, "USDT");
        assert_eq!(inst.ct_val, dec!(0.01));
        assert_eq!(inst.max_leverage, 75);
        assert!(inst.is_perpetual());
    }

    #[test]
    fn zero_tick_or_lot_is_rejected() {
        let raw = r#"{
            "instId":"X-USDT","instType":"SPOT","baseCcy":"X","quoteCcy":"USDT",
            "tickSz":"0","lotSz":"0.1","minSz":"1"
        }"#;
        let wi: WireInstrument = serde_json::from_str(raw).unwrap();
        assert!(wi.into_instrument().is_none());

        let raw = r#"{
            "instId":"X-USDT","instType":"SPOT","baseCcy":"X","quoteCcy":"USDT",
            "tickSz":"0.01","lotSz":"0","minSz":"1"
        }"#;
        let wi: WireInstrument = serde_json::from_str(raw).unwrap();
        assert!(wi.into_instrument().is_none());
    }

    #[test]
    fn order_push_parses_to_snapshot() {
        let raw = r#"{
            "instId":"ETH-USDT-SWAP","ordId":"42","clOrdId":"em00000001",
            "px":"100.0","sz":"5","state":"partially_filled","side":"buy",
            "accFillSz":"2","avgPx":"100.1","uTime":"1700000000123"
        }"#;
        let wo: WireOrder = serde_json::from_str(raw).unwrap();
        assert_eq!(wo.side(), Some(Side::Buy));
        let snap = wo.into_snapshot(SnapshotSource::Push).unwrap();
        assert_eq!(snap.status, OrderStatus::PartiallyFilled);
        assert_eq!(snap.filled, dec!(2));
        assert_eq!(snap.avg_price, dec!(100.1));
        assert_eq!(snap.update_time_ms, 1_700_000_000_123);
    }

    #[test]
    fn account_push_fields_absent_means_unchanged() {
        let raw = r#"{"details":[{"ccy":"USDT","cashBal":"120.5","frozenBal":"","uTime":"1000"}],"uTime":"900"}"#;
        let data: WireAccountData = serde_json::from_str(raw).unwrap();
        let pushes = data.pushes();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].rights, Some(dec!(120.5)));
        assert_eq!(pushes[0].frozen, None);
        assert_eq!(pushes[0].update_time_ms, 1000);
    }

    #[test]
    fn book_frame_levels() {
        let raw = r#"{
            "arg":{"channel":"books","instId":"ETH-USDT-SWAP"},
            "action":"update",
            "data":[{"asks":[["100.1","5","0","2"]],"bids":[["100.0","4","0","1"]],"ts":"1700000000000","checksum":-123456}]
        }"#;
        let inbound = WsInbound::parse(raw).unwrap();
        assert!(!inbound.is_snapshot());
        let books: Vec<WireBookData> = inbound.data_as().unwrap();
        assert_eq!(books[0].ask_levels(), vec![(dec!(100.1), dec!(5))]);
        assert_eq!(books[0].bid_levels(), vec![(dec!(100.0), dec!(4))]);
        assert_eq!(books[0].checksum, Some(-123456));
    }

    #[test]
    fn channel_scan_finds_tag_without_full_parse() {
        let raw = r#"{"arg":{"channel":"books5","instId":"ETH-USDT"},"data":[]}"#;
        assert_eq!(frame_channel(raw), Some("books5"));
        assert_eq!(frame_channel(r#"{"event":"subscribe"}"#), None);
        assert_eq!(frame_channel("pong"), None);
        assert_eq!(frame_inst_id(raw), Some("ETH-USDT"));
        assert_eq!(frame_inst_id(r#"{"arg":{"channel":"liquidation-orders","instType":"SWAP"}}"#), None);
    }

    #[test]
    fn terminal_code_classification() {
        assert!(implies_terminal(ECODE_ALREADY_FILLED));
        assert!(implies_terminal(ECODE_ORDER_NOT_FOUND));
        assert!(!implies_terminal(ECODE_CANCEL_IN_PROGRESS));
        assert!(quiet_cancel(ECODE_CANCEL_IN_PROGRESS));
        assert!(!quiet_cancel(ECODE_ALREADY_FILLED));
    }

    #[test]
    fn subscribe_payload_shape() {
        let p = subscribe_payload("books", "ETH-USDT-SWAP");
        let v: serde_json::Value = serde_json::from_str(&p).unwrap();
        assert_eq!(v["op"], "subscribe");
        assert_eq!(v["args"][0]["channel"], "books");
        assert_eq!(v["args"][0]["instId"], "ETH-USDT-SWAP");

        let p = subscribe_inst_type_payload("liquidation-orders", "SWAP");
        let v: serde_json::Value = serde_json::from_str(&p).unwrap();
        assert_eq!(v["args"][0]["instType"], "SWAP");
    }
}
