// ===============================
// src/rest.rs
// ===============================
//
// Signed REST client. Private calls carry the venue's four auth headers;
// signatures use server-adjusted time. Clock skew is measured at boot and
// refreshed every minute by a background task.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use base64::Engine;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use sha2::Sha256;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

use crate::config::Credentials;
use crate::domain::{now_ms, OrderSnapshot, PosSide, Side, SnapshotSource};
use crate::errors::{CoreError, Result};
use crate::metrics::{REST_CALLS, REST_ERRORS};
use crate::wire::{
    RestEnvelope, WireAccountConfig, WireInstrument, WireOrder, WireOrderAck, WireServerTime,
    WireTicker,
};

const CLOCK_SYNC_INTERVAL: Duration = Duration::from_secs(60);

pub fn hmac_sha256_b64(secret: &str, payload: &str) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(payload.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

/// ISO-8601 with millisecond precision and a literal Z, the venue's REST
/// timestamp form.
pub fn iso_timestamp(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .unwrap_or_default()
        .format("%Y-%m-%dT%H:%M:%S%.3fZ")
        .to_string()
}

/// Signature prehash: `timestamp || method || path-with-query || body`.
pub fn prehash(ts: &str, method: &str, path_with_query: &str, body: &str) -> String {
    format!("{ts}{method}{path_with_query}{body}")
}

/// New-order request. Everything here is already aligned and validated by
/// the trader; this type only shapes the wire body.
#[derive(Debug, Clone)]
pub struct PlaceOrderReq {
    pub inst_id: String,
    pub client_id: String,
    pub side: Side,
    /// Dual position mode: which side the order extends or reduces.
    pub pos_side: Option<PosSide>,
    pub price: Decimal,
    pub size: Decimal,
    pub post_only: bool,
    pub reduce_only: bool,
    /// "cash" for spot, "cross" for swaps.
    pub td_mode: &'static str,
}

impl PlaceOrderReq {
    pub fn body(&self) -> serde_json::Value {
        let mut body = serde_json::json!({
            "instId": self.inst_id,
            "clOrdId": self.client_id,
            "tdMode": self.td_mode,
            "side": self.side.wire(),
            "ordType": if self.post_only { "post_only" } else { "limit" },
            "px": self.price.to_string(),
            "sz": self.size.to_string(),
        });
        if let Some(ps) = self.pos_side {
            body["posSide"] = ps.wire().into();
        }
        if self.reduce_only {
            body["reduceOnly"] = true.into();
        }
        body
    }
}

pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    creds: Option<Credentials>,
    /// server_time - local_time, milliseconds.
    skew_ms: AtomicI64,
}

impl RestClient {
    pub fn new(base_url: impl Into<String>, creds: Option<Credentials>) -> Result<Self> {
        let http = reqwest::Client::builder().user_agent("exmirror/0.5").build()?;
        Ok(Self { http, base_url: base_url.into(), creds, skew_ms: AtomicI64::new(0) })
    }

    pub fn server_now_ms(&self) -> i64 {
        now_ms() + self.skew_ms.load(Ordering::Relaxed)
    }

    fn creds(&self) -> Result<&Credentials> {
        self.creds
            .as_ref()
            .ok_or_else(|| CoreError::Config("private endpoint requires credentials".to_string()))
    }

    /// Measure clock skew against the venue.
    pub async fn sync_clock(&self) -> Result<()> {
        let before = now_ms();
        let times: Vec<WireServerTime> = self.get_public("/api/v5/public/time").await?;
        let after = now_ms();
        let server: i64 = times
            .first()
            .and_then(|t| t.ts.parse().ok())
            .ok_or_else(|| CoreError::venue("-1", "empty server time"))?;
        let skew = server - (before + after) / 2;
        self.skew_ms.store(skew, Ordering::Relaxed);
        debug!(skew_ms = skew, "clock sync");
        Ok(())
    }

    /// Keep the skew fresh for the process lifetime.
    pub fn spawn_clock_sync(self: &Arc<Self>) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                sleep(CLOCK_SYNC_INTERVAL).await;
                if let Err(e) = client.sync_clock().await {
                    warn!(error = %e, "clock sync failed");
                }
            }
        });
    }

    /// WS login arguments signed with the same scheme but unix-second
    /// timestamps.
    pub fn ws_login_args(&self) -> Result<(String, String, String, String)> {
        let creds = self.creds()?;
        let ts_secs = (self.server_now_ms() / 1000).to_string();
        let sign = hmac_sha256_b64(&creds.secret, &prehash(&ts_secs, "GET", "/users/self/verify", ""));
        Ok((creds.api_key.clone(), creds.passphrase.clone(), ts_secs, sign))
    }

    async fn get_public<T: serde::de::DeserializeOwned>(&self, path_q: &str) -> Result<Vec<T>> {
        REST_CALLS.with_label_values(&["get_public"]).inc();
        let url = format!("{}{}", self.base_url, path_q);
        let resp = self.http.get(url).send().await.inspect_err(|_| {
            REST_ERRORS.with_label_values(&["transport"]).inc();
        })?;
        let env: RestEnvelope<T> = resp.json().await?;
        env.into_data().inspect_err(|_| {
            REST_ERRORS.with_label_values(&["venue"]).inc();
        })
    }

    async fn get_private<T: serde::de::DeserializeOwned>(&self, path_q: &str) -> Result<Vec<T>> {
        REST_CALLS.with_label_values(&["get_private"]).inc();
        let env: RestEnvelope<T> = self.send_signed("GET", path_q, None).await?;
        env.into_data().inspect_err(|_| {
            REST_ERRORS.with_label_values(&["venue"]).inc();
        })
    }

    async fn post_private<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<RestEnvelope<T>> {
        REST_CALLS.with_label_values(&["post_private"]).inc();
        self.send_signed("POST", path, Some(body)).await
    }

    async fn send_signed<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        path_q: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<RestEnvelope<T>> {
        let creds = self.creds()?;
        let body_str = body.map(|b| b.to_string()).unwrap_or_default();
        let ts = iso_timestamp(self.server_now_ms());
        let sign = hmac_sha256_b64(&creds.secret, &prehash(&ts, method, path_q, &body_str));

        let url = format!("{}{}", self.base_url, path_q);
        let mut req = match method {
            "POST" => self
                .http
                .post(url)
                .header("Content-Type", "application/json")
                .body(body_str),
            _ => self.http.get(url),
        };
        req = req
            .header("OK-ACCESS-KEY", &creds.api_key)
            .header("OK-ACCESS-SIGN", sign)
            .header("OK-ACCESS-TIMESTAMP", ts)
            .header("OK-ACCESS-PASSPHRASE", &creds.passphrase);

        let resp = req.send().await.inspect_err(|_| {
            REST_ERRORS.with_label_values(&["transport"]).inc();
        })?;
        Ok(resp.json().await?)
    }

    // ---- endpoints ----

    pub async fn instruments(&self, inst_type: &str) -> Result<Vec<WireInstrument>> {
        self.get_public(&format!("/api/v5/public/instruments?instType={inst_type}")).await
    }

    pub async fn instrument(&self, inst_type: &str, inst_id: &str) -> Result<Vec<WireInstrument>> {
        self.get_public(&format!(
            "/api/v5/public/instruments?instType={inst_type}&instId={inst_id}"
        ))
        .await
    }

    pub async fn tickers(&self, inst_type: &str) -> Result<Vec<WireTicker>> {
        self.get_public(&format!("/api/v5/market/tickers?instType={inst_type}")).await
    }

    pub async fn account_config(&self) -> Result<WireAccountConfig> {
        self.get_private("/api/v5/account/config")
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| CoreError::venue("-1", "empty account config"))
    }

    pub async fn set_leverage(&self, inst_id: &str, lever: u32) -> Result<()> {
        let body = serde_json::json!({
            "instId": inst_id,
            "lever": lever.to_string(),
            "mgnMode": "cross",
        });
        let env: RestEnvelope<serde_json::Value> =
            self.post_private("/api/v5/account/set-leverage", &body).await?;
        env.into_data().map(|_| ()).inspect_err(|_| {
            REST_ERRORS.with_label_values(&["venue"]).inc();
        })
    }

    /// Trade endpoints return per-order result entries even when the outer
    /// code is non-zero; the caller inspects `sCode`.
    async fn trade_call(&self, path: &str, body: &serde_json::Value) -> Result<WireOrderAck> {
        let env: RestEnvelope<WireOrderAck> = self.post_private(path, body).await?;
        if let Some(ack) = env.data.into_iter().next() {
            Ok(ack)
        } else if env.code != crate::wire::CODE_OK {
            REST_ERRORS.with_label_values(&["venue"]).inc();
            Err(CoreError::venue(env.code, env.msg))
        } else {
            Err(CoreError::venue("-1", "empty trade response"))
        }
    }

    pub async fn place_order(&self, req: &PlaceOrderReq) -> Result<WireOrderAck> {
        self.trade_call("/api/v5/trade/order", &req.body()).await
    }

    pub async fn amend_order(
        &self,
        inst_id: &str,
        client_id: &str,
        new_price: Option<Decimal>,
        new_size: Option<Decimal>,
    ) -> Result<WireOrderAck> {
        let mut body = serde_json::json!({ "instId": inst_id, "clOrdId": client_id });
        if let Some(px) = new_price {
            body["newPx"] = px.to_string().into();
        }
        if let Some(sz) = new_size {
            body["newSz"] = sz.to_string().into();
        }
        self.trade_call("/api/v5/trade/amend-order", &body).await
    }

    pub async fn cancel_order(&self, inst_id: &str, client_id: &str) -> Result<WireOrderAck> {
        let body = serde_json::json!({ "instId": inst_id, "clOrdId": client_id });
        self.trade_call("/api/v5/trade/cancel-order", &body).await
    }

    /// Authoritative order snapshot by client id.
    pub async fn order_detail(&self, inst_id: &str, client_id: &str) -> Result<OrderSnapshot> {
        let orders: Vec<WireOrder> = self
            .get_private(&format!("/api/v5/trade/order?instId={inst_id}&clOrdId={client_id}"))
            .await?;
        orders
            .into_iter()
            .next()
            .and_then(|o| o.into_snapshot(SnapshotSource::Poll))
            .ok_or_else(|| CoreError::venue(crate::wire::ECODE_ORDER_NOT_FOUND, "order not found"))
    }

    /// All live orders of the account, for startup cleanup.
    pub async fn pending_orders(&self) -> Result<Vec<WireOrder>> {
        self.get_private("/api/v5/trade/orders-pending").await
    }
}
