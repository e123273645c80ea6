// ===============================
// src/venue.rs
// ===============================
//
// Outer session for one venue. Boot order is explicit: clock sync, then
// instrument registry, then account-mode check, then the two WebSocket
// sessions with the private dispatchers, then the optional startup order
// cleanup. Market and trader handles are vended from caches afterwards.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use ahash::AHashMap as HashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

use crate::config::{DepthMode, ExchangeConfig, TickerSource};
use crate::domain::{InstCategory, LiquidationPush, SnapshotSource};
use crate::errors::{CoreError, Result};
use crate::instrument::InstrumentRegistry;
use crate::ledger::Ledger;
use crate::market::Market;
use crate::rest::RestClient;
use crate::trader::{owns_client_id, Trader};
use crate::wire::{self, WireAccountData, WireLiquidation, WireOrder, WirePosition, WsInbound};
use crate::ws::{SubPayload, SubscriptionSpec, WsSession};

const WS_READY_TIMEOUT: Duration = Duration::from_secs(30);
const TICKER_POLL: Duration = Duration::from_millis(500);

pub struct VenueSession {
    cfg: ExchangeConfig,
    rest: Arc<RestClient>,
    registry: Arc<InstrumentRegistry>,
    ledger: Arc<Ledger>,
    public_ws: Arc<WsSession>,
    private_ws: Arc<WsSession>,
    markets: Mutex<HashMap<String, Arc<Market>>>,
    traders: Mutex<HashMap<String, Arc<Trader>>>,
    /// Serialize handle vending per kind so concurrent callers for the same
    /// instrument share one build.
    market_gate: tokio::sync::Mutex<()>,
    trader_gate: tokio::sync::Mutex<()>,
    order_seq: Arc<AtomicU64>,
    stop_tx: watch::Sender<bool>,
    fatal_tx: mpsc::UnboundedSender<CoreError>,
    fatal_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<CoreError>>,
    liq_observers: Mutex<Arc<Vec<(InstCategory, mpsc::UnboundedSender<LiquidationPush>)>>>,
    liq_subscribed: Mutex<Vec<&'static str>>,
    ticker_poller_started: AtomicBool,
    synth_markets: Mutex<Vec<Arc<Market>>>,
}

impl VenueSession {
    pub async fn connect(cfg: ExchangeConfig) -> Result<Arc<Self>> {
        let rest = Arc::new(RestClient::new(cfg.rest_url.clone(), cfg.credentials.clone())?);
        rest.sync_clock().await?;
        rest.spawn_clock_sync();

        let registry = Arc::new(InstrumentRegistry::new());
        for inst_type in ["SPOT", "SWAP"] {
            let wires = rest.instruments(inst_type).await?;
            let count = wires.len();
            registry.extend(wires.into_iter().filter_map(|w| w.into_instrument()));
            info!(inst_type, count, "instruments loaded");
        }
        if registry.is_empty() {
            return Err(CoreError::Config("venue returned no instruments".to_string()));
        }

        let private = cfg.credentials.is_some();
        if private {
            rest.account_config().await?.check_expected()?;
        }

        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let (stop_tx, _) = watch::channel(false);

        let public_ws = WsSession::new("public", cfg.ws_public_url.clone());
        let private_ws = WsSession::new("private", cfg.ws_private_url.clone());

        let venue = Arc::new(Self {
            rest,
            registry,
            ledger: Arc::new(Ledger::new()),
            public_ws,
            private_ws,
            markets: Mutex::new(HashMap::new()),
            traders: Mutex::new(HashMap::new()),
            market_gate: tokio::sync::Mutex::new(()),
            trader_gate: tokio::sync::Mutex::new(()),
            order_seq: Arc::new(AtomicU64::new(0)),
            stop_tx,
            fatal_tx,
            fatal_rx: tokio::sync::Mutex::new(fatal_rx),
            liq_observers: Mutex::new(Arc::new(Vec::new())),
            liq_subscribed: Mutex::new(Vec::new()),
            ticker_poller_started: AtomicBool::new(false),
            synth_markets: Mutex::new(Vec::new()),
            cfg,
        });

        venue.public_ws.spawn();
        if private {
            venue.install_login();
            venue.install_private_dispatchers();
            venue.private_ws.spawn();
            if !venue.private_ws.wait_ready(WS_READY_TIMEOUT).await {
                return Err(CoreError::Config("private session did not come up".to_string()));
            }
            if venue.cfg.cleanup_on_boot {
                venue.startup_cleanup().await;
            }
        }
        Ok(venue)
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn registry(&self) -> &Arc<InstrumentRegistry> {
        &self.registry
    }

    pub fn rest(&self) -> &Arc<RestClient> {
        &self.rest
    }

    /// Blocks until something unrecoverable happened anywhere in the core.
    pub async fn wait_fatal(&self) -> CoreError {
        match self.fatal_rx.lock().await.recv().await {
            Some(e) => e,
            None => CoreError::Config("fatal channel closed".to_string()),
        }
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
        self.public_ws.stop();
        self.private_ws.stop();
    }

    /// Cached market mirror for one instrument. Without full depth the
    /// book is synthesized from tickers, fed per the configured source.
    pub async fn use_market(
        self: &Arc<Self>,
        inst_id: &str,
        with_full_depth: bool,
    ) -> Result<Arc<Market>> {
        vend_cached(&self.market_gate, &self.markets, inst_id, || async move {
            let inst = self.resolve_instrument(inst_id).await?;
            let depth_mode =
                if with_full_depth { self.cfg.depth_mode } else { DepthMode::TickerSynth };
            let market =
                Market::connect(inst, Arc::clone(&self.public_ws), &self.cfg, depth_mode);

            if depth_mode == DepthMode::TickerSynth
                && self.cfg.ticker_source == TickerSource::RestPoll500Ms
            {
                self.synth_markets.lock().push(Arc::clone(&market));
                self.spawn_ticker_poller();
            }
            Ok(market)
        })
        .await
    }

    /// Cached trading handle for one instrument.
    pub async fn use_trader(
        self: &Arc<Self>,
        inst_id: &str,
        leverage: u32,
    ) -> Result<Arc<Trader>> {
        vend_cached(&self.trader_gate, &self.traders, inst_id, || async move {
            let market = self.use_market(inst_id, true).await?;
            let inst = self.resolve_instrument(inst_id).await?;
            Ok(Trader::connect(
                inst,
                Arc::clone(market.book()),
                Arc::clone(&self.ledger),
                Arc::clone(&self.rest),
                Arc::clone(&self.private_ws),
                self.cfg.strategy_tag.clone(),
                Arc::clone(&self.order_seq),
                leverage,
                self.fatal_tx.clone(),
                self.stop_tx.subscribe(),
            )
            .await)
        })
        .await
    }

    /// Market-wide forced-liquidation stream, filtered to one category.
    pub fn add_liquidation_observer(
        self: &Arc<Self>,
        category: InstCategory,
        tx: mpsc::UnboundedSender<LiquidationPush>,
    ) {
        let inst_type = category.inst_type();
        {
            let mut subscribed = self.liq_subscribed.lock();
            if !subscribed.contains(&inst_type) {
                subscribed.push(inst_type);
                self.public_ws.add_subscription(SubscriptionSpec::fixed(
                    format!("liquidation-orders:{inst_type}"),
                    wire::subscribe_inst_type_payload("liquidation-orders", inst_type),
                    vec![
                        "\"event\":\"subscribe\"".to_string(),
                        "\"channel\":\"liquidation-orders\"".to_string(),
                        format!("\"instType\":\"{inst_type}\""),
                    ],
                ));
            }
        }
        let mut guard = self.liq_observers.lock();
        if guard.is_empty() {
            self.install_liquidation_dispatcher();
        }
        let mut next = (**guard).clone();
        next.push((category, tx));
        *guard = Arc::new(next);
    }

    async fn resolve_instrument(&self, inst_id: &str) -> Result<Arc<crate::instrument::Instrument>> {
        if let Ok(inst) = self.registry.get(inst_id) {
            return Ok(inst);
        }
        // lazy expansion: a previously unseen listing
        let inst_type = if inst_id.ends_with("-SWAP") { "SWAP" } else { "SPOT" };
        let wires = self.rest.instrument(inst_type, inst_id).await?;
        self.registry.extend(wires.into_iter().filter_map(|w| w.into_instrument()));
        self.registry.get(inst_id)
    }

    fn install_login(&self) {
        let rest = Arc::clone(&self.rest);
        self.private_ws.add_subscription(SubscriptionSpec {
            key: "login".to_string(),
            payload: SubPayload::Generated(Arc::new(move || {
                let (api_key, passphrase, ts, sign) = rest.ws_login_args()?;
                Ok(wire::login_payload(&api_key, &passphrase, &ts, &sign))
            })),
            ack_keywords: vec!["\"event\":\"login\"".to_string(), "\"code\":\"0\"".to_string()],
            login: true,
        });
    }

    fn install_private_dispatchers(self: &Arc<Self>) {
        for (channel, payload) in [
            ("account", wire::subscribe_channel_payload("account")),
            ("positions", wire::subscribe_inst_type_payload("positions", "ANY")),
            ("orders", wire::subscribe_inst_type_payload("orders", "ANY")),
        ] {
            self.private_ws.add_subscription(SubscriptionSpec::fixed(
                channel,
                payload,
                vec![
                    "\"event\":\"subscribe\"".to_string(),
                    format!("\"channel\":\"{channel}\""),
                ],
            ));
        }

        // balances
        let (tx, mut rx) = mpsc::unbounded_channel::<WsInbound>();
        self.private_ws.add_handler("account", None, tx);
        let ledger = Arc::clone(&self.ledger);
        tokio::spawn(async move {
            while let Some(inbound) = rx.recv().await {
                match inbound.data_as::<WireAccountData>() {
                    Ok(data) => {
                        for account in &data {
                            for push in account.pushes() {
                                ledger.refresh_balance(&push);
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "bad account frame"),
                }
            }
        });

        // positions; the first push re-baselines every known record to flat
        let (tx, mut rx) = mpsc::unbounded_channel::<WsInbound>();
        self.private_ws.add_handler("positions", None, tx);
        let ledger = Arc::clone(&self.ledger);
        tokio::spawn(async move {
            let mut first = true;
            while let Some(inbound) = rx.recv().await {
                match inbound.data_as::<WirePosition>() {
                    Ok(data) => {
                        if first {
                            ledger.reset_positions_zero();
                            first = false;
                        }
                        for push in data.into_iter().filter_map(WirePosition::into_push) {
                            ledger.refresh_position(&push);
                        }
                    }
                    Err(e) => warn!(error = %e, "bad position frame"),
                }
            }
        });

        // orders, routed to the owning trader by instrument
        let (tx, mut rx) = mpsc::unbounded_channel::<WsInbound>();
        self.private_ws.add_handler("orders", None, tx);
        let venue = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(inbound) = rx.recv().await {
                match inbound.data_as::<WireOrder>() {
                    Ok(orders) => {
                        for order in orders {
                            venue.dispatch_order(order);
                        }
                    }
                    Err(e) => warn!(error = %e, "bad order frame"),
                }
            }
        });
    }

    fn dispatch_order(&self, order: WireOrder) {
        let Some(snap) = order.into_snapshot(SnapshotSource::Push) else {
            warn!("order push missing required fields");
            return;
        };
        let trader = self.traders.lock().get(&snap.inst_id).cloned();
        match trader {
            Some(t) => t.dispatch_snapshot(snap),
            None => {
                if owns_client_id(&self.cfg.strategy_tag, &snap.client_id) {
                    debug!(inst_id = %snap.inst_id, client_id = %snap.client_id,
                        "order push before trader exists");
                } else {
                    error!(client_id = %snap.client_id, "foreign client id on private channel");
                    let _ = self.fatal_tx.send(CoreError::Invariant(format!(
                        "foreign client id {} under tag {}",
                        snap.client_id, self.cfg.strategy_tag
                    )));
                }
            }
        }
    }

    fn install_liquidation_dispatcher(self: &Arc<Self>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<WsInbound>();
        self.public_ws.add_handler("liquidation-orders", None, tx);
        let venue = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(inbound) = rx.recv().await {
                let Ok(events) = inbound.data_as::<WireLiquidation>() else {
                    continue;
                };
                let observers = Arc::clone(&venue.liq_observers.lock());
                for event in &events {
                    for push in event.pushes() {
                        for (category, tx) in observers.iter() {
                            if category_of(&push.inst_id) == *category {
                                let _ = tx.send(push.clone());
                            }
                        }
                    }
                }
            }
        });
    }

    /// Cancel leftovers from a previous run of this strategy tag.
    async fn startup_cleanup(&self) {
        let pending = match self.rest.pending_orders().await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "startup cleanup: pending-orders fetch failed");
                return;
            }
        };
        for (inst_id, client_id) in cleanup_targets(&pending, &self.cfg.strategy_tag) {
            match self.rest.cancel_order(&inst_id, &client_id).await {
                Ok(ack) if ack.s_code == wire::CODE_OK || wire::quiet_cancel(&ack.s_code) => {
                    info!(client_id = %client_id, "stale order cancelled");
                }
                Ok(ack) => {
                    warn!(client_id = %client_id, code = %ack.s_code, "stale order cancel refused")
                }
                Err(e) => warn!(client_id = %client_id, error = %e, "stale order cancel failed"),
            }
        }
    }

    fn spawn_ticker_poller(self: &Arc<Self>) {
        if self.ticker_poller_started.swap(true, Ordering::Relaxed) {
            return;
        }
        let venue = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                sleep(TICKER_POLL).await;
                let markets = venue.synth_markets.lock().clone();
                if markets.is_empty() {
                    continue;
                }
                let mut types: Vec<&'static str> =
                    markets.iter().map(|m| m.inst().category.inst_type()).collect();
                types.sort_unstable();
                types.dedup();
                for inst_type in types {
                    match venue.rest.tickers(inst_type).await {
                        Ok(tickers) => {
                            for t in &tickers {
                                if let Some(m) =
                                    markets.iter().find(|m| m.inst().inst_id == t.inst_id)
                                {
                                    m.apply_ticker(t);
                                }
                            }
                        }
                        Err(e) => warn!(inst_type, error = %e, "bulk ticker refresh failed"),
                    }
                }
            }
        });
    }
}

/// Check-build-insert under one async gate. Without it two concurrent
/// callers for the same key both pass the cache check during the build's
/// await and one handle ends up orphaned with its subscriptions live.
async fn vend_cached<T, F, Fut>(
    gate: &tokio::sync::Mutex<()>,
    cache: &Mutex<HashMap<String, Arc<T>>>,
    key: &str,
    build: F,
) -> Result<Arc<T>>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<Arc<T>>>,
{
    let _vend = gate.lock().await;
    if let Some(existing) = cache.lock().get(key) {
        return Ok(Arc::clone(existing));
    }
    let built = build().await?;
    cache.lock().insert(key.to_string(), Arc::clone(&built));
    Ok(built)
}

fn category_of(inst_id: &str) -> InstCategory {
    if inst_id.ends_with("-USD-SWAP") {
        InstCategory::UsdSwap
    } else if inst_id.ends_with("-SWAP") {
        InstCategory::UsdtSwap
    } else {
        InstCategory::Spot
    }
}

/// Orders a previous run of this tag left resting.
fn cleanup_targets(pending: &[WireOrder], tag: &str) -> Vec<(String, String)> {
    pending
        .iter()
        .filter(|o| owns_client_id(tag, &o.cl_ord_id))
        .map(|o| (o.inst_id.clone(), o.cl_ord_id.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(inst_id: &str, cl_ord_id: &str) -> WireOrder {
        serde_json::from_str(&format!(
            r#"{{"ordId":"1","clOrdId":"{cl_ord_id}","instId":"{inst_id}","px":"100","sz":"1",
                "accFillSz":"0","avgPx":"","state":"live","side":"buy","uTime":"1000"}}"#
        ))
        .expect("wire order")
    }

    #[test]
    fn cleanup_only_touches_our_tag() {
        let orders = vec![
            pending("ETH-USDT", "em00000001"),
            pending("ETH-USDT", "other0001"),
            pending("BTC-USDT-SWAP", "em00000009"),
            pending("BTC-USDT-SWAP", "manual"),
        ];
        let targets = cleanup_targets(&orders, "em");
        assert_eq!(
            targets,
            vec![
                ("ETH-USDT".to_string(), "em00000001".to_string()),
                ("BTC-USDT-SWAP".to_string(), "em00000009".to_string()),
            ]
        );
    }

    #[test]
    fn category_from_instrument_id() {
        assert_eq!(category_of("ETH-USDT"), InstCategory::Spot);
        assert_eq!(category_of("ETH-USDT-SWAP"), InstCategory::UsdtSwap);
        assert_eq!(category_of("ETH-USD-SWAP"), InstCategory::UsdSwap);
    }

    #[tokio::test]
    async fn concurrent_vends_share_one_build() {
        use std::sync::atomic::AtomicU32;

        let gate = tokio::sync::Mutex::new(());
        let cache: Mutex<HashMap<String, Arc<&str>>> = Mutex::new(HashMap::new());
        let builds = AtomicU32::new(0);
        let builds_ref = &builds;

        let slow = move || async move {
            builds_ref.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            Ok(Arc::new("built"))
        };
        let fast = move || async move {
            builds_ref.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new("built"))
        };

        let (a, b) = tokio::join!(
            vend_cached(&gate, &cache, "ETH-USDT", slow),
            vend_cached(&gate, &cache, "ETH-USDT", fast),
        );
        let a = a.expect("vend");
        let b = b.expect("vend");
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&a, &b));

        let c = vend_cached(&gate, &cache, "BTC-USDT", fast).await.expect("vend");
        assert_eq!(builds.load(Ordering::SeqCst), 2);
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
