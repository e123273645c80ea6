// ===============================
// src/order.rs
// ===============================
//
// Per-order control loop. Each live order owns one task that serializes
// snapshot ingestion, modify/cancel commands and the idle REST poll.
// Snapshot ingestion is monotone in (update_time, filled); fill deltas are
// derived from the notional difference between consecutive snapshots.

use std::sync::Arc;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::book::OrderBook;
use crate::domain::{Deal, OrderEvent, OrderSnapshot, OrderStatus, Side};
use crate::errors::CoreError;
use crate::instrument::Instrument;
use crate::metrics::{DEALS, ORDERS};
use crate::rest::{PlaceOrderReq, RestClient};
use crate::wire;

const POLL_PERIOD: Duration = Duration::from_secs(10);
const MAX_CONSECUTIVE_POLL_ERRORS: u32 = 3;
const MAX_UNACKED_NOT_FOUND: u32 = 3;

#[derive(Debug, Clone)]
pub enum OrderCmd {
    Modify { new_price: Option<Decimal>, new_size: Option<Decimal> },
    Cancel,
}

#[derive(Debug, Clone)]
struct OrderLocal {
    order_id: Option<String>,
    price: Decimal,
    size: Decimal,
    filled: Decimal,
    avg_price: Decimal,
    status: OrderStatus,
    update_time_ms: i64,
    fatal: bool,
}

/// What ingesting one snapshot produced.
#[derive(Debug)]
enum Ingest {
    /// Older than local state, or filled went backwards. Nothing changed.
    Dropped,
    Applied { deal: Option<Deal>, terminal: bool },
}

/// Snapshot bookkeeping shared by the task and the handle.
struct OrderCore {
    inst_id: String,
    client_id: String,
    side: Side,
    local: Mutex<OrderLocal>,
}

impl OrderCore {
    fn new(req: &PlaceOrderReq) -> Self {
        Self {
            inst_id: req.inst_id.clone(),
            client_id: req.client_id.clone(),
            side: req.side,
            local: Mutex::new(OrderLocal {
                order_id: None,
                price: req.price,
                size: req.size,
                filled: Decimal::ZERO,
                avg_price: Decimal::ZERO,
                status: OrderStatus::Born,
                update_time_ms: 0,
                fatal: false,
            }),
        }
    }

    /// Apply a snapshot iff it is not older than local state on both the
    /// update-time and filled axes. A growing filled amount with a
    /// non-growing notional means the venue's average price regressed,
    /// which local state cannot represent.
    fn ingest(&self, snap: &OrderSnapshot) -> Result<Ingest, CoreError> {
        let mut local = self.local.lock();
        if local.status.is_terminal() {
            return Ok(Ingest::Dropped);
        }
        if snap.update_time_ms < local.update_time_ms || snap.filled < local.filled {
            debug!(
                client_id = %self.client_id,
                snap_time = snap.update_time_ms,
                local_time = local.update_time_ms,
                "stale order snapshot dropped"
            );
            ORDERS.with_label_values(&["snapshot_dropped"]).inc();
            return Ok(Ingest::Dropped);
        }

        let mut deal = None;
        if snap.filled > local.filled {
            let amount = snap.filled - local.filled;
            let notional_delta = snap.filled * snap.avg_price - local.filled * local.avg_price;
            if notional_delta <= Decimal::ZERO {
                return Err(CoreError::Invariant(format!(
                    "order {}: filled grew {} -> {} but notional did not",
                    self.client_id, local.filled, snap.filled
                )));
            }
            deal = Some(Deal {
                inst_id: self.inst_id.clone(),
                client_id: self.client_id.clone(),
                side: self.side,
                price: notional_delta / amount,
                amount,
                fill_time_ms: snap.update_time_ms,
            });
        }

        if local.order_id.is_none() {
            local.order_id = Some(snap.order_id.clone());
        }
        local.price = snap.price;
        local.size = snap.size;
        local.filled = snap.filled;
        local.avg_price = snap.avg_price;
        local.update_time_ms = snap.update_time_ms;
        let terminal = snap.status.is_terminal();
        local.status = if terminal || snap.status != OrderStatus::Born {
            snap.status
        } else {
            local.status
        };
        Ok(Ingest::Applied { deal, terminal })
    }

    fn mark_fatal(&self) {
        self.local.lock().fatal = true;
    }

    fn status(&self) -> OrderStatus {
        self.local.lock().status
    }
}

/// Strategy-facing view of one order. Cloneable; commands are fire-and-forget
/// into the order task.
#[derive(Clone)]
pub struct OrderHandle {
    core: Arc<OrderCore>,
    cmd_tx: mpsc::UnboundedSender<OrderCmd>,
    snap_tx: mpsc::UnboundedSender<OrderSnapshot>,
}

impl OrderHandle {
    pub fn client_id(&self) -> &str {
        &self.core.client_id
    }

    pub fn inst_id(&self) -> &str {
        &self.core.inst_id
    }

    pub fn side(&self) -> Side {
        self.core.side
    }

    pub fn status(&self) -> OrderStatus {
        self.core.status()
    }

    pub fn is_finished(&self) -> bool {
        self.core.status().is_terminal() || self.is_fatal()
    }

    pub fn is_fatal(&self) -> bool {
        self.core.local.lock().fatal
    }

    pub fn filled(&self) -> Decimal {
        self.core.local.lock().filled
    }

    pub fn price(&self) -> Decimal {
        self.core.local.lock().price
    }

    pub fn size(&self) -> Decimal {
        self.core.local.lock().size
    }

    pub fn modify(&self, new_price: Option<Decimal>, new_size: Option<Decimal>) {
        let _ = self.cmd_tx.send(OrderCmd::Modify { new_price, new_size });
    }

    pub fn cancel(&self) {
        let _ = self.cmd_tx.send(OrderCmd::Cancel);
    }

    /// Route a snapshot from the private order channel into the task.
    pub(crate) fn push_snapshot(&self, snap: OrderSnapshot) {
        let _ = self.snap_tx.send(snap);
    }
}

/// Everything an order task needs from its surroundings.
pub struct OrderCtx {
    pub rest: Arc<RestClient>,
    pub inst: Arc<Instrument>,
    pub book: Arc<OrderBook>,
    pub post_only: bool,
    /// Applied to each deal before external observers see it, so the ledger
    /// carries the fill by the time a strategy reacts.
    pub ledger_hook: Arc<dyn Fn(&Deal) + Send + Sync>,
    pub events: mpsc::UnboundedSender<OrderEvent>,
    pub fatal: mpsc::UnboundedSender<CoreError>,
}

pub fn spawn_order(ctx: OrderCtx, req: PlaceOrderReq) -> OrderHandle {
    let core = Arc::new(OrderCore::new(&req));
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (snap_tx, snap_rx) = mpsc::unbounded_channel();
    let handle = OrderHandle { core: Arc::clone(&core), cmd_tx, snap_tx };
    tokio::spawn(run_order(ctx, req, core, cmd_rx, snap_rx));
    handle
}

async fn run_order(
    ctx: OrderCtx,
    req: PlaceOrderReq,
    core: Arc<OrderCore>,
    mut cmd_rx: mpsc::UnboundedReceiver<OrderCmd>,
    mut snap_rx: mpsc::UnboundedReceiver<OrderSnapshot>,
) {
    // Create, exactly once. A per-order refusal is conclusive; a transport
    // error is not, the poll below resolves whether the order exists.
    match ctx.rest.place_order(&req).await {
        Ok(ack) if ack.s_code == wire::CODE_OK => {
            ORDERS.with_label_values(&["created"]).inc();
            info!(client_id = %core.client_id, order_id = %ack.ord_id, "order accepted");
            let mut local = core.local.lock();
            local.order_id = Some(ack.ord_id);
            local.status = OrderStatus::Alive;
        }
        Ok(ack) => {
            ORDERS.with_label_values(&["create_rejected"]).inc();
            error!(
                client_id = %core.client_id,
                code = %ack.s_code,
                msg = %ack.s_msg,
                "order refused by venue"
            );
            core.mark_fatal();
            finish(&ctx, &core, true);
            return;
        }
        Err(e) => {
            warn!(client_id = %core.client_id, error = %e, "order create unresolved");
        }
    }

    let mut poll = interval_at(Instant::now() + POLL_PERIOD, POLL_PERIOD);
    let mut health = PollHealth::default();

    loop {
        tokio::select! {
            snap = snap_rx.recv() => {
                let Some(snap) = snap else { return };
                poll.reset();
                health = PollHealth::default();
                if apply(&ctx, &core, &snap) {
                    return;
                }
            }
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { return };
                if core.status().is_terminal() {
                    continue; // silent no-op
                }
                let resync = match cmd {
                    OrderCmd::Modify { new_price, new_size } => {
                        handle_modify(&ctx, &core, &req, new_price, new_size).await
                    }
                    OrderCmd::Cancel => handle_cancel(&ctx, &core).await,
                };
                if resync {
                    poll.reset();
                    if poll_once(&ctx, &core, &mut health).await {
                        return;
                    }
                }
            }
            _ = poll.tick() => {
                if poll_once(&ctx, &core, &mut health).await {
                    return;
                }
                if health.errors >= MAX_CONSECUTIVE_POLL_ERRORS {
                    error!(client_id = %core.client_id, "order state unreachable over REST");
                    core.mark_fatal();
                    let _ = ctx.fatal.send(CoreError::Invariant(format!(
                        "order {}: {} consecutive REST failures",
                        core.client_id, health.errors
                    )));
                    finish(&ctx, &core, true);
                    return;
                }
            }
        }
    }
}

/// Poll failure tracking, reset by any successful snapshot.
#[derive(Debug, Default)]
struct PollHealth {
    /// Consecutive REST failures, not counting "order does not exist".
    errors: u32,
    /// Consecutive "order does not exist" answers while the create call
    /// never got an ack.
    unacked_not_found: u32,
}

/// The venue reports no such order. Harmless while a freshly accepted order
/// propagates, but when the create call itself died on transport and the
/// venue keeps denying the id, the order never existed; returns true once
/// that is the settled answer, closing the order as cancelled.
fn note_unacked_not_found(core: &OrderCore, health: &mut PollHealth) -> bool {
    if core.local.lock().order_id.is_some() {
        health.unacked_not_found = 0;
        debug!(client_id = %core.client_id, "order not visible to venue yet");
        return false;
    }
    health.unacked_not_found += 1;
    if health.unacked_not_found < MAX_UNACKED_NOT_FOUND {
        return false;
    }
    ORDERS.with_label_values(&["never_created"]).inc();
    warn!(client_id = %core.client_id, "create never reached the venue, order closed");
    core.local.lock().status = OrderStatus::Cancelled;
    true
}

/// Ingest one snapshot; returns true when the order reached terminal state
/// and the task should end.
fn apply(ctx: &OrderCtx, core: &OrderCore, snap: &OrderSnapshot) -> bool {
    match core.ingest(snap) {
        Ok(Ingest::Dropped) => false,
        Ok(Ingest::Applied { deal, terminal }) => {
            if let Some(deal) = deal {
                DEALS.inc();
                (ctx.ledger_hook)(&deal);
                let _ = ctx.events.send(OrderEvent::Deal(deal));
            }
            if terminal {
                finish(ctx, core, false);
            }
            terminal
        }
        Err(e) => {
            core.mark_fatal();
            let _ = ctx.fatal.send(e);
            finish(ctx, core, true);
            true
        }
    }
}

fn finish(ctx: &OrderCtx, core: &OrderCore, fatal: bool) {
    ORDERS.with_label_values(&["finished"]).inc();
    let _ = ctx.events.send(OrderEvent::Finished {
        client_id: core.client_id.clone(),
        status: core.status(),
        fatal,
    });
}

/// Returns true when the amend outcome requires an immediate resync poll.
async fn handle_modify(
    ctx: &OrderCtx,
    core: &OrderCore,
    req: &PlaceOrderReq,
    new_price: Option<Decimal>,
    new_size: Option<Decimal>,
) -> bool {
    let price = new_price.map(|p| {
        ctx.inst.align_price(p, core.side, ctx.post_only, ctx.book.buy1(), ctx.book.sell1())
    });
    let size = new_size.map(|s| ctx.inst.align_size(s));

    let check_price = price.unwrap_or_else(|| core.local.lock().price);
    if let Some(sz) = size {
        if sz < ctx.inst.min_size_at(check_price) {
            info!(client_id = %core.client_id, "modified size below minimum, cancelling");
            return handle_cancel(ctx, core).await;
        }
    }

    match ctx.rest.amend_order(&req.inst_id, &core.client_id, price, size).await {
        Ok(ack) if ack.s_code == wire::CODE_OK => {
            let mut local = core.local.lock();
            if let Some(p) = price {
                local.price = p;
            }
            if let Some(s) = size {
                local.size = s;
            }
            false
        }
        Ok(ack) if wire::implies_terminal(&ack.s_code) => {
            debug!(client_id = %core.client_id, code = %ack.s_code, "amend found order terminal");
            true
        }
        Ok(ack) => {
            warn!(client_id = %core.client_id, code = %ack.s_code, msg = %ack.s_msg, "amend refused");
            false
        }
        Err(e) => {
            warn!(client_id = %core.client_id, error = %e, "amend failed");
            false
        }
    }
}

async fn handle_cancel(ctx: &OrderCtx, core: &OrderCore) -> bool {
    match ctx.rest.cancel_order(&core.inst_id, &core.client_id).await {
        Ok(ack) if ack.s_code == wire::CODE_OK || wire::quiet_cancel(&ack.s_code) => false,
        Ok(ack) if wire::implies_terminal(&ack.s_code) => {
            debug!(client_id = %core.client_id, code = %ack.s_code, "cancel found order terminal");
            true
        }
        Ok(ack) => {
            warn!(client_id = %core.client_id, code = %ack.s_code, msg = %ack.s_msg, "cancel refused");
            false
        }
        Err(e) => {
            warn!(client_id = %core.client_id, error = %e, "cancel failed");
            false
        }
    }
}

/// One REST snapshot fetch; returns true when the order is done.
async fn poll_once(ctx: &OrderCtx, core: &OrderCore, health: &mut PollHealth) -> bool {
    match ctx.rest.order_detail(&core.inst_id, &core.client_id).await {
        Ok(snap) => {
            *health = PollHealth::default();
            apply(ctx, core, &snap)
        }
        Err(CoreError::Venue { ref code, .. }) if code == wire::ECODE_ORDER_NOT_FOUND => {
            // The venue answered; conclusive only for an order whose create
            // was never acknowledged.
            if note_unacked_not_found(core, health) {
                finish(ctx, core, false);
                return true;
            }
            false
        }
        Err(e) => {
            health.errors += 1;
            warn!(client_id = %core.client_id, error = %e, attempt = health.errors, "order poll failed");
            false
        }
    }
}
