// ===============================
// src/trader.rs
// ===============================
//
// Per-instrument trading handle. Validates and aligns every order before it
// touches the network, mints client ids under the process's strategy tag,
// routes private order pushes to the owning order task, and applies fill
// deltas to the ledger before external observers hear about them.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use ahash::AHashMap as HashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep, Duration};
use tracing::{debug, error, info, warn};

use crate::book::OrderBook;
use crate::domain::{Deal, OrderEvent, OrderSnapshot, PosSide, Side};
use crate::errors::{CoreError, Result};
use crate::instrument::Instrument;
use crate::ledger::Ledger;
use crate::order::{spawn_order, OrderCtx, OrderHandle};
use crate::rest::{PlaceOrderReq, RestClient};
use crate::ws::WsSession;

const GC_PERIOD: Duration = Duration::from_secs(1);
const SET_LEVERAGE_RETRY: Duration = Duration::from_secs(2);

/// True when `client_id` is `tag` followed by this process's numeric
/// sequence. Anything else on our private channel came from outside.
pub fn owns_client_id(tag: &str, client_id: &str) -> bool {
    match client_id.strip_prefix(tag) {
        Some(rest) => !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()),
        None => false,
    }
}

/// New-order parameters as a strategy states them, before alignment.
#[derive(Debug, Clone)]
pub struct OrderIntent {
    pub side: Side,
    /// Required for swaps in dual position mode; ignored for spot.
    pub pos_side: Option<PosSide>,
    pub price: Decimal,
    pub size: Decimal,
    pub post_only: bool,
    pub reduce_only: bool,
}

pub struct Trader {
    inst: Arc<Instrument>,
    book: Arc<OrderBook>,
    ledger: Arc<Ledger>,
    rest: Arc<RestClient>,
    /// Private session; order flow pauses while its subscriptions re-ack.
    private_ws: Arc<WsSession>,
    tag: String,
    seq: Arc<AtomicU64>,
    orders: Mutex<HashMap<String, OrderHandle>>,
    observers: Mutex<Arc<Vec<mpsc::UnboundedSender<OrderEvent>>>>,
    events_tx: mpsc::UnboundedSender<OrderEvent>,
    fatal: mpsc::UnboundedSender<CoreError>,
    /// Latched when a foreign strategy tag shows up on our channel.
    locked: AtomicBool,
}

impl Trader {
    /// Builds the trader. Futures traders first push the requested leverage
    /// to the venue, retrying until it sticks.
    pub async fn connect(
        inst: Arc<Instrument>,
        book: Arc<OrderBook>,
        ledger: Arc<Ledger>,
        rest: Arc<RestClient>,
        private_ws: Arc<WsSession>,
        tag: String,
        seq: Arc<AtomicU64>,
        leverage: u32,
        fatal: mpsc::UnboundedSender<CoreError>,
        stop: watch::Receiver<bool>,
    ) -> Arc<Self> {
        if inst.category.is_swap() {
            loop {
                match rest.set_leverage(&inst.inst_id, leverage).await {
                    Ok(()) => {
                        info!(inst_id = %inst.inst_id, leverage, "leverage set");
                        break;
                    }
                    Err(e) => {
                        warn!(inst_id = %inst.inst_id, error = %e, "set-leverage failed, retrying");
                        sleep(SET_LEVERAGE_RETRY).await;
                    }
                }
            }
            ledger.touch_position(&inst.inst_id);
            ledger.touch_balance(&inst.settle_ccy);
        } else {
            ledger.touch_balance(&inst.base_ccy);
            ledger.touch_balance(&inst.quote_ccy);
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let trader = Arc::new(Self {
            inst,
            book,
            ledger,
            rest,
            private_ws,
            tag,
            seq,
            orders: Mutex::new(HashMap::new()),
            observers: Mutex::new(Arc::new(Vec::new())),
            events_tx,
            fatal,
            locked: AtomicBool::new(false),
        });
        trader.spawn_fanout(events_rx, stop.clone());
        trader.spawn_gc(stop);
        trader
    }

    pub fn inst(&self) -> &Arc<Instrument> {
        &self.inst
    }

    /// Order events, fills first, terminal last.
    pub fn add_order_observer(&self, tx: mpsc::UnboundedSender<OrderEvent>) {
        let mut guard = self.observers.lock();
        let mut next = (**guard).clone();
        next.push(tx);
        *guard = Arc::new(next);
    }

    /// Private session up and all the ledger records this trader depends
    /// on live.
    pub fn ready(&self) -> bool {
        if self.locked.load(Ordering::Relaxed) || !self.private_ws.ready() {
            return false;
        }
        if self.inst.category.is_swap() {
            self.ledger.position(&self.inst.inst_id).ready
                && self.ledger.balance(&self.inst.settle_ccy).ready
        } else {
            self.ledger.balance(&self.inst.base_ccy).ready
                && self.ledger.balance(&self.inst.quote_ccy).ready
        }
    }

    /// Validate, align and submit a new order. Orders that die during
    /// validation never reach the network.
    pub fn place(&self, intent: OrderIntent) -> Result<OrderHandle> {
        if self.locked.load(Ordering::Relaxed) {
            return Err(CoreError::Invariant(format!(
                "trader {} locked after foreign tag", self.inst.inst_id
            )));
        }
        if !self.ready() {
            return Err(CoreError::NotReady);
        }
        if self.inst.category.is_swap() && intent.pos_side.is_none() {
            return Err(CoreError::InvalidOrder("swap order needs a position side".to_string()));
        }

        let price = self.inst.align_price(
            intent.price,
            intent.side,
            intent.post_only,
            self.book.buy1(),
            self.book.sell1(),
        );
        let size = self.inst.align_size(intent.size);
        if price <= Decimal::ZERO {
            return Err(CoreError::InvalidOrder(format!("price {} aligns to zero", intent.price)));
        }
        let min = self.inst.min_size_at(price);
        if size < min {
            return Err(CoreError::InvalidOrder(format!(
                "size {size} below effective minimum {min} at {price}"
            )));
        }

        let client_id = self.next_client_id();
        let req = PlaceOrderReq {
            inst_id: self.inst.inst_id.clone(),
            client_id: client_id.clone(),
            side: intent.side,
            pos_side: self.inst.category.is_swap().then_some(intent.pos_side).flatten(),
            price,
            size,
            post_only: intent.post_only,
            reduce_only: intent.reduce_only,
            td_mode: if self.inst.category.is_swap() { "cross" } else { "cash" },
        };

        let ctx = OrderCtx {
            rest: Arc::clone(&self.rest),
            inst: Arc::clone(&self.inst),
            book: Arc::clone(&self.book),
            post_only: intent.post_only,
            ledger_hook: self.ledger_hook(intent.pos_side),
            events: self.events_tx.clone(),
            fatal: self.fatal.clone(),
        };
        let handle = spawn_order(ctx, req);
        self.orders.lock().insert(client_id, handle.clone());
        Ok(handle)
    }

    pub fn cancel_all(&self) {
        for handle in self.orders.lock().values() {
            if !handle.is_finished() {
                handle.cancel();
            }
        }
    }

    pub fn live_orders(&self) -> Vec<OrderHandle> {
        self.orders.lock().values().filter(|h| !h.is_finished()).cloned().collect()
    }

    /// Route one private order push. Foreign strategy tags lock the trader:
    /// nothing but this process may issue orders under our tag.
    pub fn dispatch_snapshot(&self, snap: OrderSnapshot) {
        if !owns_client_id(&self.tag, &snap.client_id) {
            error!(
                inst_id = %self.inst.inst_id,
                client_id = %snap.client_id,
                "foreign strategy tag on private channel"
            );
            self.locked.store(true, Ordering::Relaxed);
            let _ = self.fatal.send(CoreError::Invariant(format!(
                "foreign client id {} under tag {}", snap.client_id, self.tag
            )));
            return;
        }
        match self.orders.lock().get(&snap.client_id) {
            Some(handle) => handle.push_snapshot(snap),
            None => {
                // ours by tag, but not this run; startup cleanup covers it
                debug!(client_id = %snap.client_id, "push for unknown order");
            }
        }
    }

    fn next_client_id(&self) -> String {
        let n = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}{:08}", self.tag, n)
    }

    /// Predicted ledger adjustment per fill. Spot fills move both currencies;
    /// swap fills move the stated position side by the contract amount.
    fn ledger_hook(&self, pos_side: Option<PosSide>) -> Arc<dyn Fn(&Deal) + Send + Sync> {
        let ledger = Arc::clone(&self.ledger);
        let inst = Arc::clone(&self.inst);
        Arc::new(move |deal: &Deal| {
            if inst.category.is_swap() {
                let Some(ps) = pos_side else { return };
                let opens = match ps {
                    PosSide::Long => deal.side == Side::Buy,
                    PosSide::Short => deal.side == Side::Sell,
                };
                let value = if opens { deal.amount } else { -deal.amount };
                ledger.record_position_delta(&deal.inst_id, ps, value, deal.fill_time_ms);
            } else {
                let base = deal.amount * Decimal::from(deal.side.sign());
                let quote = -deal.amount * deal.price * Decimal::from(deal.side.sign());
                ledger.record_balance_delta(&inst.base_ccy, base, deal.fill_time_ms);
                ledger.record_balance_delta(&inst.quote_ccy, quote, deal.fill_time_ms);
            }
        })
    }

    fn spawn_fanout(
        self: &Arc<Self>,
        mut events_rx: mpsc::UnboundedReceiver<OrderEvent>,
        mut stop: watch::Receiver<bool>,
    ) {
        let trader = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events_rx.recv() => {
                        let Some(event) = event else { return };
                        let observers = Arc::clone(&trader.observers.lock());
                        for tx in observers.iter() {
                            let _ = tx.send(event.clone());
                        }
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            return;
                        }
                    }
                }
            }
        });
    }

    fn spawn_gc(self: &Arc<Self>, mut stop: watch::Receiver<bool>) {
        let trader = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = interval(GC_PERIOD);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        trader.orders.lock().retain(|_, h| !h.is_finished());
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            return;
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_id_ownership() {
        assert!(owns_client_id("em", "em00000001"));
        assert!(owns_client_id("x9", "x912345678"));
        assert!(!owns_client_id("em", "em"));
        assert!(!owns_client_id("em", "other0001"));
        assert!(!owns_client_id("em", "em0001abc"));
        // a tag ending in digits still only owns its own suffixed ids
        assert!(owns_client_id("s1", "s100000007"));
        assert!(!owns_client_id("s1", "s2_0000007"));
    }

    #[test]
    fn sequence_is_strictly_increasing() {
        let seq = Arc::new(AtomicU64::new(0));
        let a = seq.fetch_add(1, Ordering::Relaxed) + 1;
        let b = seq.fetch_add(1, Ordering::Relaxed) + 1;
        assert!(b > a);
        assert_eq!(format!("em{a:08}"), "em00000001");
    }

    #[tokio::test]
    async fn stop_signal_ends_the_event_fanout() {
        use crate::domain::OrderStatus;
        use crate::instrument::TickKind;
        use rust_decimal_macros::dec;

        let inst = Arc::new(Instrument {
            inst_id: "ETH-USDT".to_string(),
            base_ccy: "ETH".to_string(),
            quote_ccy: "USDT".to_string(),
            category: crate::domain::InstCategory::Spot,
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
        });
        let rest = Arc::new(
            crate::rest::RestClient::new("http://127.0.0.1:1", None).expect("rest client"),
        );
        let ws = WsSession::new("test", "wss://example.invalid/ws");
        let (fatal_tx, _fatal_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);

        let trader = Trader::connect(
            inst,
            Arc::new(OrderBook::new("ETH-USDT")),
            Arc::new(Ledger::new()),
            rest,
            ws,
            "em".to_string(),
            Arc::new(AtomicU64::new(0)),
            1,
            fatal_tx,
            stop_rx,
        )
        .await;

        let (obs_tx, mut obs_rx) = mpsc::unbounded_channel();
        trader.add_order_observer(obs_tx);

        let event = OrderEvent::Finished {
            client_id: "em00000001".to_string(),
            status: OrderStatus::Cancelled,
            fatal: false,
        };
        trader.events_tx.send(event.clone()).expect("fanout running");
        assert!(matches!(obs_rx.recv().await, Some(OrderEvent::Finished { .. })));

        stop_tx.send(true).expect("stop");
        sleep(Duration::from_millis(50)).await;
        trader.events_tx.send(event).expect("channel still open");
        let forwarded = tokio::time::timeout(Duration::from_millis(50), obs_rx.recv()).await;
        assert!(forwarded.is_err());
    }
}
