// ===============================
// src/market.rs
// ===============================
//
// Per-instrument market mirror: the order book in the configured depth
// mode plus the optional mark-price, funding-rate and price-limit streams.
// A checksum mismatch clears the book and re-arms the depth subscription
// for a fresh snapshot without dropping the connection.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::book::OrderBook;
use crate::config::{DepthMode, ExchangeConfig};
use crate::domain::{DepthEvent, FundingRatePush, MarkPricePush, PriceLimitPush};
use crate::instrument::Instrument;
use crate::metrics::CHECKSUM_FAILURES;
use crate::wire::{
    self, WireBookData, WireFundingRate, WireMarkPrice, WirePriceLimit, WireTicker, WsInbound,
};
use crate::ws::{SubscriptionSpec, WsSession};

const CH_MARK_PRICE: &str = "mark-price";
const CH_FUNDING_RATE: &str = "funding-rate";
const CH_PRICE_LIMIT: &str = "price-limit";

fn sub_key(channel: &str, inst_id: &str) -> String {
    format!("{channel}:{inst_id}")
}

fn ack_keywords(channel: &str, inst_id: &str) -> Vec<String> {
    vec![
        "\"event\":\"subscribe\"".to_string(),
        format!("\"channel\":\"{channel}\""),
        format!("\"instId\":\"{inst_id}\""),
    ]
}

pub struct Market {
    inst: Arc<Instrument>,
    book: Arc<OrderBook>,
    session: Arc<WsSession>,
    depth_mode: DepthMode,
    depth_key: String,
    mark_price: Mutex<Option<MarkPricePush>>,
    funding: Mutex<Option<FundingRatePush>>,
    price_limit: Mutex<Option<PriceLimitPush>>,
    depth_observers: Mutex<Arc<Vec<mpsc::UnboundedSender<DepthEvent>>>>,
    funding_observers: Mutex<Arc<Vec<mpsc::UnboundedSender<FundingRatePush>>>>,
}

impl Market {
    /// Registers this market's subscriptions on the public session and
    /// starts the frame driver.
    pub fn connect(
        inst: Arc<Instrument>,
        session: Arc<WsSession>,
        cfg: &ExchangeConfig,
        depth_mode: DepthMode,
    ) -> Arc<Self> {
        let market = Self::register(inst, session, cfg, depth_mode);
        market.spawn_driver();
        market
    }

    fn register(
        inst: Arc<Instrument>,
        session: Arc<WsSession>,
        cfg: &ExchangeConfig,
        depth_mode: DepthMode,
    ) -> Arc<Self> {
        let inst_id = inst.inst_id.clone();
        let depth_channel = depth_mode.channel();
        let depth_key = sub_key(depth_channel, &inst_id);

        let mut channels = vec![depth_channel];
        if cfg.subscribe_mark_price && inst.category.is_swap() {
            channels.push(CH_MARK_PRICE);
        }
        if cfg.subscribe_funding_rate && inst.is_perpetual() {
            channels.push(CH_FUNDING_RATE);
        }
        if cfg.subscribe_price_limit {
            channels.push(CH_PRICE_LIMIT);
        }
        for ch in &channels {
            session.add_subscription(SubscriptionSpec::fixed(
                sub_key(ch, &inst_id),
                wire::subscribe_payload(ch, &inst_id),
                ack_keywords(ch, &inst_id),
            ));
        }

        Arc::new(Self {
            book: Arc::new(OrderBook::new(&inst_id)),
            inst,
            session,
            depth_mode,
            depth_key,
            mark_price: Mutex::new(None),
            funding: Mutex::new(None),
            price_limit: Mutex::new(None),
            depth_observers: Mutex::new(Arc::new(Vec::new())),
            funding_observers: Mutex::new(Arc::new(Vec::new())),
        })
    }

    fn spawn_driver(self: &Arc<Self>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        // one queue per market keeps per-market frame order
        self.session.add_handler(
            self.depth_mode.channel(),
            Some(self.inst.inst_id.clone()),
            tx.clone(),
        );
        for ch in [CH_MARK_PRICE, CH_FUNDING_RATE, CH_PRICE_LIMIT] {
            self.session.add_handler(ch, Some(self.inst.inst_id.clone()), tx.clone());
        }
        let market = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(inbound) = rx.recv().await {
                market.apply_inbound(inbound);
            }
        });
    }

    pub fn inst(&self) -> &Arc<Instrument> {
        &self.inst
    }

    pub fn book(&self) -> &Arc<OrderBook> {
        &self.book
    }

    /// A market is usable once its mirror holds at least one level.
    pub fn ready(&self) -> bool {
        !self.book.is_empty()
    }

    pub fn mark_price(&self) -> Option<MarkPricePush> {
        self.mark_price.lock().clone()
    }

    pub fn funding_rate(&self) -> Option<FundingRatePush> {
        self.funding.lock().clone()
    }

    pub fn price_limit(&self) -> Option<PriceLimitPush> {
        self.price_limit.lock().clone()
    }

    pub fn add_depth_observer(&self, tx: mpsc::UnboundedSender<DepthEvent>) {
        let mut guard = self.depth_observers.lock();
        let mut next = (**guard).clone();
        next.push(tx);
        *guard = Arc::new(next);
    }

    pub fn add_funding_observer(&self, tx: mpsc::UnboundedSender<FundingRatePush>) {
        let mut guard = self.funding_observers.lock();
        let mut next = (**guard).clone();
        next.push(tx);
        *guard = Arc::new(next);
    }

    pub(crate) fn apply_inbound(&self, inbound: WsInbound) {
        let channel = inbound.arg.channel.as_str();
        if channel == self.depth_mode.channel() {
            self.apply_depth(&inbound);
            return;
        }
        match channel {
            CH_MARK_PRICE => {
                if let Ok(data) = inbound.data_as::<WireMarkPrice>() {
                    if let Some(mp) = data.into_iter().next_back() {
                        *self.mark_price.lock() = Some(mp.into_push());
                    }
                }
            }
            CH_FUNDING_RATE => {
                if let Ok(data) = inbound.data_as::<WireFundingRate>() {
                    for fr in data {
                        let push = fr.into_push();
                        *self.funding.lock() = Some(push.clone());
                        let observers = Arc::clone(&self.funding_observers.lock());
                        for tx in observers.iter() {
                            let _ = tx.send(push.clone());
                        }
                    }
                }
            }
            CH_PRICE_LIMIT => {
                if let Ok(data) = inbound.data_as::<WirePriceLimit>() {
                    if let Some(pl) = data.into_iter().next_back() {
                        *self.price_limit.lock() = Some(pl.into_push());
                    }
                }
            }
            other => debug!(channel = other, "unrouted market frame"),
        }
    }

    fn apply_depth(&self, inbound: &WsInbound) {
        if self.depth_mode == DepthMode::TickerSynth {
            if let Ok(data) = inbound.data_as::<WireTicker>() {
                if let Some(t) = data.into_iter().next_back() {
                    self.apply_ticker(&t);
                }
            }
            return;
        }

        let Ok(frames) = inbound.data_as::<WireBookData>() else {
            warn!(inst_id = %self.inst.inst_id, "undecodable depth frame");
            return;
        };
        for frame in frames {
            let snapshot = inbound.is_snapshot() || !self.depth_mode.is_incremental();
            if snapshot {
                self.book.rebuild(&frame.ask_levels(), &frame.bid_levels());
            } else {
                for (px, sz) in frame.ask_levels() {
                    self.book.apply_ask(px, sz);
                }
                for (px, sz) in frame.bid_levels() {
                    self.book.apply_bid(px, sz);
                }
            }

            if self.depth_mode.has_checksum() {
                if let Some(expected) = frame.checksum {
                    if !self.book.verify_checksum(expected as i32) {
                        CHECKSUM_FAILURES.with_label_values(&[&self.inst.inst_id]).inc();
                        warn!(inst_id = %self.inst.inst_id, "book checksum mismatch, resubscribing");
                        self.book.clear();
                        self.session.re_arm(
                            &self.depth_key,
                            Some(wire::unsubscribe_payload(
                                self.depth_mode.channel(),
                                &self.inst.inst_id,
                            )),
                        );
                        return;
                    }
                }
            }
            self.notify_depth(frame.ts_ms());
        }
    }

    /// Single-level rebuild from a ticker, for ticker-synth depth mode and
    /// the REST bulk-ticker refresher.
    pub(crate) fn apply_ticker(&self, t: &WireTicker) {
        let asks: Vec<_> = wire::opt_dec(&t.ask_px)
            .map(|px| (px, wire::parse_dec(&t.ask_sz)))
            .into_iter()
            .collect();
        let bids: Vec<_> = wire::opt_dec(&t.bid_px)
            .map(|px| (px, wire::parse_dec(&t.bid_sz)))
            .into_iter()
            .collect();
        self.book.rebuild(&asks, &bids);
        self.notify_depth(t.ts_ms());
    }

    fn notify_depth(&self, update_time_ms: i64) {
        let event = self.book.depth_event(update_time_ms);
        let observers = Arc::clone(&self.depth_observers.lock());
        for tx in observers.iter() {
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TickerSource;
    use crate::domain::InstCategory;
    use crate::instrument::TickKind;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn inst() -> Arc<Instrument> {
        Arc::new(Instrument {
            inst_id: "ETH-USDT".to_string(),
            base_ccy: "ETH".to_string(),
            quote_ccy: "USDT".to_string(),
            category: InstCategory::Spot,
            ct_val: Decimal::ONE,
            ct_val_ccy: "ETH".to_string(),
            settle_ccy: "USDT".to_string(),
            max_leverage: 1,
            tick_size: dec!(0.01),
            lot_size: dec!(0.0001),
            min_size: dec!(0.001),
            min_notional: Decimal::ZERO,
            expiry_ms: 0,
            tick_kind: TickKind::Standard,
        })
    }

    fn cfg() -> ExchangeConfig {
        ExchangeConfig {
            rest_url: String::new(),
            ws_public_url: String::new(),
            ws_private_url: String::new(),
            credentials: None,
            strategy_tag: "em".to_string(),
            subscribe_mark_price: false,
            subscribe_price_limit: false,
            subscribe_funding_rate: false,
            depth_mode: DepthMode::FullBook400,
            ticker_source: TickerSource::WebSocket,
            cleanup_on_boot: false,
            instruments: Vec::new(),
            metrics_port: 0,
        }
    }

    fn market(mode: DepthMode) -> Arc<Market> {
        let session = WsSession::new("test", "wss://example.invalid/ws");
        Market::register(inst(), session, &cfg(), mode)
    }

    fn inbound(raw: &str) -> WsInbound {
        WsInbound::parse(raw).expect("frame")
    }

    #[test]
    fn snapshot_then_update_tracks_top() {
        let m = market(DepthMode::FullBook400);
        m.apply_inbound(inbound(
            r#"{"arg":{"channel":"books","instId":"ETH-USDT"},"action":"snapshot",
               "data":[{"asks":[["100.1","5"],["100.2","7"]],
                        "bids":[["100.0","3"],["99.9","4"]],"ts":"1000"}]}"#,
        ));
        assert_eq!(m.book().buy1(), Some(dec!(100.0)));
        assert_eq!(m.book().sell1(), Some(dec!(100.1)));

        // delete best ask, improve best bid
        m.apply_inbound(inbound(
            r#"{"arg":{"channel":"books","instId":"ETH-USDT"},"action":"update",
               "data":[{"asks":[["100.1","0"]],"bids":[["100.05","2"]],"ts":"2000"}]}"#,
        ));
        assert_eq!(m.book().buy1(), Some(dec!(100.05)));
        assert_eq!(m.book().sell1(), Some(dec!(100.2)));
        assert!(m.ready());
    }

    #[test]
    fn checksum_mismatch_clears_book() {
        let m = market(DepthMode::FullBook400);
        m.apply_inbound(inbound(
            r#"{"arg":{"channel":"books","instId":"ETH-USDT"},"action":"snapshot",
               "data":[{"asks":[["2","20"]],"bids":[["1","10"]],"ts":"1000","checksum":-1}]}"#,
        ));
        assert!(m.book().is_empty());
        assert!(!m.ready());
    }

    #[test]
    fn matching_checksum_keeps_book() {
        let m = market(DepthMode::FullBook400);
        let expected = crc32fast::hash(b"1:10:2:20") as i32;
        let raw = format!(
            r#"{{"arg":{{"channel":"books","instId":"ETH-USDT"}},"action":"snapshot",
               "data":[{{"asks":[["2","20"]],"bids":[["1","10"]],"ts":"1000","checksum":{expected}}}]}}"#
        );
        m.apply_inbound(inbound(&raw));
        assert!(m.ready());
        assert_eq!(m.book().buy1(), Some(dec!(1)));
    }

    #[test]
    fn top5_frames_are_full_rebuilds() {
        let m = market(DepthMode::Top5);
        m.apply_inbound(inbound(
            r#"{"arg":{"channel":"books5","instId":"ETH-USDT"},
               "data":[{"asks":[["100.1","5"]],"bids":[["100.0","3"]],"ts":"1000"}]}"#,
        ));
        m.apply_inbound(inbound(
            r#"{"arg":{"channel":"books5","instId":"ETH-USDT"},
               "data":[{"asks":[["101.0","1"]],"bids":[["100.9","1"]],"ts":"2000"}]}"#,
        ));
        // previous levels do not linger
        assert_eq!(m.book().buy1(), Some(dec!(100.9)));
        assert_eq!(m.book().depth(), (1, 1));
    }

    #[test]
    fn ticker_synth_builds_one_level_book() {
        let m = market(DepthMode::TickerSynth);
        let (tx, mut rx) = mpsc::unbounded_channel();
        m.add_depth_observer(tx);
        m.apply_inbound(inbound(
            r#"{"arg":{"channel":"tickers","instId":"ETH-USDT"},
               "data":[{"instId":"ETH-USDT","bidPx":"99.9","bidSz":"2","askPx":"100.0","askSz":"3","ts":"5000"}]}"#,
        ));
        assert_eq!(m.book().buy1(), Some(dec!(99.9)));
        assert_eq!(m.book().sell1(), Some(dec!(100.0)));
        let ev = rx.try_recv().expect("depth event");
        assert_eq!(ev.update_time_ms, 5000);
        assert_eq!(ev.best_ask, Some((dec!(100.0), dec!(3))));
    }

    #[test]
    fn funding_frames_reach_observers() {
        let m = market(DepthMode::Top5);
        let (tx, mut rx) = mpsc::unbounded_channel();
        m.add_funding_observer(tx);
        m.apply_inbound(inbound(
            r#"{"arg":{"channel":"funding-rate","instId":"ETH-USDT"},
               "data":[{"instId":"ETH-USDT","fundingRate":"0.0001","fundingTime":"9000"}]}"#,
        ));
        let push = rx.try_recv().expect("funding push");
        assert_eq!(push.rate, dec!(0.0001));
        assert_eq!(m.funding_rate().map(|f| f.funding_time_ms), Some(9000));
    }
}
