// ===============================
// src/ws.rs
// ===============================
//
// Self-healing WebSocket session. One background task owns the socket:
// connect with a handshake deadline, re-issue un-acked subscriptions on a
// 1s scheduler, ping on silence, tear down and reconnect with backoff when
// the venue goes quiet. Data frames are routed to per-channel handlers.

use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep, timeout, Duration};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::domain::now_ms;
use crate::errors::Result;
use crate::metrics::{WS_FRAMES, WS_RECONNECTS, WS_SUB_ACKS};
use crate::wire::{self, WsInbound};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const SCHEDULER_TICK: Duration = Duration::from_secs(1);
/// Minimum gap between two sends of the same un-acked subscription.
const RESEND_AFTER_MS: i64 = 5_000;

/// How a subscription's request text is produced. Login payloads are signed
/// against the current clock, so they are regenerated on every send.
pub enum SubPayload {
    Fixed(String),
    Generated(Arc<dyn Fn() -> Result<String> + Send + Sync>),
}

/// One logical subscription the session keeps alive across reconnects.
pub struct SubscriptionSpec {
    /// Stable identity, e.g. "books:ETH-USDT".
    pub key: String,
    pub payload: SubPayload,
    /// The subscription counts as acked when a frame contains all of these.
    pub ack_keywords: Vec<String>,
    /// Login gates every other subscription on the same session.
    pub login: bool,
}

impl SubscriptionSpec {
    pub fn fixed(key: impl Into<String>, payload: String, ack_keywords: Vec<String>) -> Self {
        Self { key: key.into(), payload: SubPayload::Fixed(payload), ack_keywords, login: false }
    }

    fn render(&self) -> Result<String> {
        match &self.payload {
            SubPayload::Fixed(s) => Ok(s.clone()),
            SubPayload::Generated(f) => f(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubStatus {
    Pending,
    Acked,
}

struct SubState {
    spec: SubscriptionSpec,
    status: SubStatus,
    last_sent_ms: i64,
}

#[derive(Clone)]
struct Handler {
    channel_prefix: String,
    /// None accepts every instrument, used for broadcast streams and the
    /// private order channel.
    inst_id: Option<String>,
    tx: mpsc::UnboundedSender<WsInbound>,
}

pub struct WsSession {
    name: &'static str,
    url: String,
    subs: Mutex<Vec<SubState>>,
    /// (channel prefix, instId filter, sink). Copy-on-write so the read
    /// loop clones the Arc once per frame.
    handlers: Mutex<Arc<Vec<Handler>>>,
    out_tx: mpsc::UnboundedSender<String>,
    out_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    last_rx_ms: AtomicI64,
    ping_outstanding: AtomicBool,
    stopped: AtomicBool,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
    /// Silence before we probe with a ping.
    ping_after_ms: i64,
    /// Silence before we drop the connection.
    reconnect_after_ms: i64,
}

impl WsSession {
    pub fn new(name: &'static str, url: impl Into<String>) -> Arc<Self> {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = watch::channel(false);
        Arc::new(Self {
            name,
            url: url.into(),
            subs: Mutex::new(Vec::new()),
            handlers: Mutex::new(Arc::new(Vec::new())),
            out_tx,
            out_rx: Mutex::new(Some(out_rx)),
            last_rx_ms: AtomicI64::new(now_ms()),
            ping_outstanding: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            ready_tx,
            ready_rx,
            ping_after_ms: 15_000,
            reconnect_after_ms: 25_000,
        })
    }

    pub fn add_subscription(&self, spec: SubscriptionSpec) {
        self.subs.lock().push(SubState { spec, status: SubStatus::Pending, last_sent_ms: 0 });
        let _ = self.ready_tx.send(false);
    }

    /// Route data frames whose channel starts with `prefix` (and whose
    /// instId matches `inst_id`, when given) to `tx`.
    pub fn add_handler(
        &self,
        prefix: impl Into<String>,
        inst_id: Option<String>,
        tx: mpsc::UnboundedSender<WsInbound>,
    ) {
        let mut guard = self.handlers.lock();
        let mut next = (**guard).clone();
        next.push(Handler { channel_prefix: prefix.into(), inst_id, tx });
        *guard = Arc::new(next);
    }

    /// Force a subscription back to pending, optionally sending an
    /// unsubscribe first. Used after a checksum failure to get a fresh
    /// snapshot without dropping the whole connection.
    pub fn re_arm(&self, key: &str, unsubscribe: Option<String>) {
        if let Some(text) = unsubscribe {
            let _ = self.out_tx.send(text);
        }
        let mut subs = self.subs.lock();
        for s in subs.iter_mut() {
            if s.spec.key == key {
                s.status = SubStatus::Pending;
                s.last_sent_ms = 0;
            }
        }
        let _ = self.ready_tx.send(false);
    }

    /// True once connected and every registered subscription is acked.
    pub fn ready(&self) -> bool {
        *self.ready_rx.borrow()
    }

    pub async fn wait_ready(&self, deadline: Duration) -> bool {
        let mut rx = self.ready_rx.clone();
        timeout(deadline, async {
            loop {
                if *rx.borrow_and_update() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await
        .is_ok()
            && self.ready()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }

    pub fn spawn(self: &Arc<Self>) {
        let session = Arc::clone(self);
        tokio::spawn(async move { session.run().await });
    }

    async fn run(self: Arc<Self>) {
        let mut out_rx = match self.out_rx.lock().take() {
            Some(rx) => rx,
            None => return, // already running
        };
        let mut attempt: u32 = 0;
        loop {
            if self.stopped.load(Ordering::Relaxed) {
                return;
            }
            info!(session = self.name, url = %self.url, "ws connecting");
            match timeout(HANDSHAKE_TIMEOUT, connect_async(self.url.as_str())).await {
                Ok(Ok((ws, _resp))) => {
                    info!(session = self.name, "ws connected");
                    attempt = 0;
                    self.on_connected();
                    self.drive(ws, &mut out_rx).await;
                    let _ = self.ready_tx.send(false);
                    WS_RECONNECTS.with_label_values(&[self.name]).inc();
                    info!(session = self.name, "ws disconnected, will reconnect");
                }
                Ok(Err(e)) => {
                    error!(session = self.name, error = %e, "ws connect failed");
                }
                Err(_) => {
                    warn!(session = self.name, "ws handshake timed out");
                }
            }
            if self.stopped.load(Ordering::Relaxed) {
                return;
            }

            // Exponential backoff + jitter, never shorter than the venue's
            // reconnect pause
            attempt = attempt.saturating_add(1);
            let jitter = rand::thread_rng().gen_range(0..=250);
            sleep(Duration::from_millis(reconnect_delay_ms(attempt) + jitter)).await;
        }
    }

    fn on_connected(&self) {
        self.last_rx_ms.store(now_ms(), Ordering::Relaxed);
        self.ping_outstanding.store(false, Ordering::Relaxed);
        let mut subs = self.subs.lock();
        for s in subs.iter_mut() {
            s.status = SubStatus::Pending;
            s.last_sent_ms = 0;
        }
    }

    async fn drive(
        &self,
        ws: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        out_rx: &mut mpsc::UnboundedReceiver<String>,
    ) {
        let (mut write, mut read) = ws.split();
        let mut tick = interval(SCHEDULER_TICK);
        loop {
            tokio::select! {
                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Text(txt))) => {
                            self.touch_rx();
                            self.on_text(&txt);
                        }
                        Some(Ok(Message::Binary(bytes))) => {
                            self.touch_rx();
                            match inflate(&bytes) {
                                Ok(txt) => self.on_text(&txt),
                                Err(e) => warn!(session = self.name, error = %e, "bad deflate frame"),
                            }
                        }
                        Some(Ok(Message::Ping(p))) => {
                            self.touch_rx();
                            let _ = write.send(Message::Pong(p)).await;
                        }
                        Some(Ok(_)) => self.touch_rx(),
                        Some(Err(e)) => {
                            error!(session = self.name, error = %e, "ws read error");
                            return;
                        }
                        None => return,
                    }
                }
                Some(text) = out_rx.recv() => {
                    if write.send(Message::Text(text)).await.is_err() {
                        return;
                    }
                }
                _ = tick.tick() => {
                    if self.stopped.load(Ordering::Relaxed) {
                        let _ = write.send(Message::Close(None)).await;
                        return;
                    }
                    let now = now_ms();
                    let silence = now - self.last_rx_ms.load(Ordering::Relaxed);
                    if silence > self.reconnect_after_ms {
                        warn!(session = self.name, silence_ms = silence, "venue silent, reconnecting");
                        return;
                    }
                    if silence > self.ping_after_ms
                        && !self.ping_outstanding.swap(true, Ordering::Relaxed)
                    {
                        if write.send(Message::Text("ping".to_string())).await.is_err() {
                            return;
                        }
                    }
                    for text in self.collect_due(now) {
                        if write.send(Message::Text(text)).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }

    fn touch_rx(&self) {
        self.last_rx_ms.store(now_ms(), Ordering::Relaxed);
        self.ping_outstanding.store(false, Ordering::Relaxed);
    }

    /// Subscription requests due for (re)send. Login first; everything else
    /// waits until login is acked.
    fn collect_due(&self, now: i64) -> Vec<String> {
        let mut subs = self.subs.lock();
        let login_acked = subs
            .iter()
            .find(|s| s.spec.login)
            .map(|s| s.status == SubStatus::Acked)
            .unwrap_or(true);
        let mut out = Vec::new();
        for s in subs.iter_mut() {
            if s.status == SubStatus::Acked {
                continue;
            }
            if !s.spec.login && !login_acked {
                continue;
            }
            if now - s.last_sent_ms < RESEND_AFTER_MS {
                continue;
            }
            match s.spec.render() {
                Ok(text) => {
                    s.last_sent_ms = now;
                    out.push(text);
                }
                Err(e) => {
                    warn!(session = self.name, key = %s.spec.key, error = %e, "payload build failed");
                }
            }
        }
        out
    }

    fn on_text(&self, text: &str) {
        WS_FRAMES.with_label_values(&[self.name]).inc();
        if text == "pong" {
            return;
        }
        if text.contains("\"event\"") {
            self.on_event(text);
            return;
        }
        let Some(channel) = wire::frame_channel(text) else {
            return;
        };
        let inst_id = wire::frame_inst_id(text);
        let handlers = Arc::clone(&self.handlers.lock());
        for h in handlers.iter() {
            if !channel.starts_with(h.channel_prefix.as_str()) {
                continue;
            }
            if let Some(want) = &h.inst_id {
                if inst_id != Some(want.as_str()) {
                    continue;
                }
            }
            match WsInbound::parse(text) {
                Ok(inbound) => {
                    let _ = h.tx.send(inbound);
                }
                Err(e) => {
                    warn!(session = self.name, channel, error = %e, "undecodable data frame");
                }
            }
            break;
        }
    }

    fn on_event(&self, text: &str) {
        if text.contains("\"event\":\"error\"") {
            warn!(session = self.name, frame = text, "venue event error");
            return;
        }
        let mut subs = self.subs.lock();
        let mut newly_acked = false;
        for s in subs.iter_mut() {
            if s.status == SubStatus::Pending && ack_matches(text, &s.spec.ack_keywords) {
                s.status = SubStatus::Acked;
                newly_acked = true;
                WS_SUB_ACKS.with_label_values(&[self.name]).inc();
                debug!(session = self.name, key = %s.spec.key, "subscription acked");
            }
        }
        if newly_acked && subs.iter().all(|s| s.status == SubStatus::Acked) {
            let _ = self.ready_tx.send(true);
        }
    }
}

fn ack_matches(frame: &str, keywords: &[String]) -> bool {
    !keywords.is_empty() && keywords.iter().all(|k| frame.contains(k.as_str()))
}

/// Raw-DEFLATE decompression for binary frames.
fn inflate(bytes: &[u8]) -> std::io::Result<String> {
    let mut out = String::new();
    flate2::read::DeflateDecoder::new(bytes).read_to_string(&mut out)?;
    Ok(out)
}

/// Pause before reconnect attempt `attempt` (1-based), without jitter.
/// Exponential, floored at the venue's 5 s reconnect pause.
fn reconnect_delay_ms(attempt: u32) -> u64 {
    const FLOOR_MS: u64 = 5_000;
    500u64.saturating_mul(1u64 << attempt.min(6)).max(FLOOR_MS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(key: &str, login: bool) -> SubscriptionSpec {
        SubscriptionSpec {
            key: key.to_string(),
            payload: SubPayload::Fixed(format!("sub-{key}")),
            ack_keywords: vec![format!("\"{key}\"")],
            login,
        }
    }

    #[test]
    fn reconnect_delay_has_a_five_second_floor() {
        assert_eq!(reconnect_delay_ms(1), 5_000);
        assert_eq!(reconnect_delay_ms(3), 5_000);
        assert_eq!(reconnect_delay_ms(4), 8_000);
        assert_eq!(reconnect_delay_ms(6), 32_000);
        assert_eq!(reconnect_delay_ms(60), 32_000);
    }

    #[test]
    fn ack_needs_all_keywords() {
        let kw = vec!["\"event\":\"subscribe\"".to_string(), "\"instId\":\"ETH-USDT\"".to_string()];
        assert!(ack_matches(
            r#"{"event":"subscribe","arg":{"channel":"books","instId":"ETH-USDT"}}"#,
            &kw
        ));
        assert!(!ack_matches(
            r#"{"event":"subscribe","arg":{"channel":"books","instId":"BTC-USDT"}}"#,
            &kw
        ));
        assert!(!ack_matches("anything", &[]));
    }

    #[tokio::test]
    async fn login_gates_other_subscriptions() {
        let s = WsSession::new("test", "wss://example.invalid/ws");
        s.add_subscription(spec("login", true));
        s.add_subscription(spec("orders", false));

        // only login goes out while it is pending
        let due = s.collect_due(10_000);
        assert_eq!(due, vec!["sub-login".to_string()]);

        // not re-sent inside the resend window
        assert!(s.collect_due(12_000).is_empty());
        // re-sent after it
        assert_eq!(s.collect_due(16_000), vec!["sub-login".to_string()]);

        // ack login -> dependent subscription becomes due
        s.on_event(r#"{"event":"login","code":"0","key":"login"}"#);
        assert_eq!(s.collect_due(22_000), vec!["sub-orders".to_string()]);
    }

    #[tokio::test]
    async fn ready_flips_when_all_acked_and_rearm_clears_it() {
        let s = WsSession::new("test", "wss://example.invalid/ws");
        s.add_subscription(spec("books", false));
        assert!(!s.ready());

        let _ = s.collect_due(10_000);
        s.on_event(r#"{"event":"subscribe","key":"books"}"#);
        assert!(s.ready());

        s.re_arm("books", None);
        assert!(!s.ready());
        // due again immediately
        assert_eq!(s.collect_due(20_000), vec!["sub-books".to_string()]);
    }

    #[tokio::test]
    async fn reconnect_resets_acks() {
        let s = WsSession::new("test", "wss://example.invalid/ws");
        s.add_subscription(spec("books", false));
        let _ = s.collect_due(10_000);
        s.on_event(r#"{"event":"subscribe","key":"books"}"#);
        assert!(s.ready());

        s.on_connected();
        assert_eq!(s.collect_due(20_000), vec!["sub-books".to_string()]);
    }

    #[tokio::test]
    async fn data_frames_route_by_channel_and_instrument() {
        let s = WsSession::new("test", "wss://example.invalid/ws");
        let (eth_tx, mut eth_rx) = mpsc::unbounded_channel();
        let (btc_tx, mut btc_rx) = mpsc::unbounded_channel();
        s.add_handler("books", Some("ETH-USDT".to_string()), eth_tx);
        s.add_handler("books", Some("BTC-USDT".to_string()), btc_tx);

        s.on_text(
            r#"{"arg":{"channel":"books","instId":"BTC-USDT"},"action":"update","data":[]}"#,
        );
        assert!(eth_rx.try_recv().is_err());
        let inbound = btc_rx.try_recv().expect("routed frame");
        assert_eq!(inbound.arg.channel, "books");

        // unrelated channel goes nowhere
        s.on_text(r#"{"arg":{"channel":"tickers","instId":"ETH-USDT"},"data":[]}"#);
        assert!(eth_rx.try_recv().is_err());
        assert!(btc_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn wildcard_handler_takes_any_instrument() {
        let s = WsSession::new("test", "wss://example.invalid/ws");
        let (tx, mut rx) = mpsc::unbounded_channel();
        s.add_handler("orders", None, tx);
        s.on_text(r#"{"arg":{"channel":"orders","instId":"ETH-USDT-SWAP"},"data":[]}"#);
        assert!(rx.try_recv().is_ok());
    }
}
