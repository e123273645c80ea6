// ===============================
// src/config.rs
// ===============================
//
// Environment-driven configuration. All knobs come from ENV (optionally a
// .env file); see `load()` for the recognized variables and defaults.

use std::env;

use dotenvy::dotenv;
use url::Url;

use crate::errors::{CoreError, Result};

/// How the per-market depth mirror is fed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DepthMode {
    /// Full 400-level book with incremental updates and checksums.
    FullBook400,
    /// Top 5 levels, full snapshot per frame.
    Top5,
    /// Top 50 levels, tick-by-tick incremental.
    Top50Tbt,
    /// Synthesize a one-level book from the ticker stream.
    TickerSynth,
}

impl DepthMode {
    pub fn from_env(key: &str, default_mode: DepthMode) -> DepthMode {
        match env::var(key).unwrap_or_default().to_ascii_lowercase().as_str() {
            "books" | "full" => DepthMode::FullBook400,
            "books5" | "top5" => DepthMode::Top5,
            "books50" | "top50" => DepthMode::Top50Tbt,
            "ticker" => DepthMode::TickerSynth,
            _ => default_mode,
        }
    }

    /// Venue channel name for this mode.
    pub fn channel(&self) -> &'static str {
        match self {
            DepthMode::FullBook400 => "books",
            DepthMode::Top5 => "books5",
            DepthMode::Top50Tbt => "books50-l2-tbt",
            DepthMode::TickerSynth => "tickers",
        }
    }

    /// Whether frames on this channel carry an integrity checksum.
    pub fn has_checksum(&self) -> bool {
        matches!(self, DepthMode::FullBook400 | DepthMode::Top50Tbt)
    }

    /// Incremental channels send one snapshot then diffs; the rest send a
    /// full picture per frame.
    pub fn is_incremental(&self) -> bool {
        matches!(self, DepthMode::FullBook400 | DepthMode::Top50Tbt)
    }
}

/// Where ticker (top-of-book) data comes from when depth is ticker-synth.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickerSource {
    WebSocket,
    /// Bulk REST refresh of all tickers every 500 ms.
    RestPoll500Ms,
}

impl TickerSource {
    pub fn from_env(key: &str, default_source: TickerSource) -> TickerSource {
        match env::var(key).unwrap_or_default().to_ascii_lowercase().as_str() {
            "websocket" | "ws" => TickerSource::WebSocket,
            "rest" | "rest_poll" => TickerSource::RestPoll500Ms,
            _ => default_source,
        }
    }
}

/// Private-endpoint credentials.
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    pub secret: String,
    pub passphrase: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never log secrets
        f.debug_struct("Credentials").field("api_key", &self.api_key).finish_non_exhaustive()
    }
}

#[derive(Clone, Debug)]
pub struct ExchangeConfig {
    pub rest_url: String,
    pub ws_public_url: String,
    pub ws_private_url: String,
    pub credentials: Option<Credentials>,

    /// Short alphanumeric prefix for client order ids; also the filter for
    /// startup order cleanup.
    pub strategy_tag: String,

    pub subscribe_mark_price: bool,
    pub subscribe_price_limit: bool,
    pub subscribe_funding_rate: bool,
    pub depth_mode: DepthMode,
    pub ticker_source: TickerSource,

    /// Cancel all live orders carrying our tag at boot.
    pub cleanup_on_boot: bool,

    /// Instruments whose markets are vended at boot.
    pub instruments: Vec<String>,

    pub metrics_port: u16,
}

fn env_bool(key: &str, default_val: bool) -> bool {
    match env::var(key).unwrap_or_default().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default_val,
    }
}

/// Tag rules: 1..=8 chars, alphanumeric only. It is prepended to every
/// client order id and must survive the venue's id charset.
pub fn validate_tag(tag: &str) -> Result<()> {
    if tag.is_empty() || tag.len() > 8 {
        return Err(CoreError::Config(format!("strategy tag '{tag}' must be 1..=8 chars")));
    }
    if !tag.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(CoreError::Config(format!("strategy tag '{tag}' must be alphanumeric")));
    }
    Ok(())
}

pub fn load() -> Result<ExchangeConfig> {
    let _ = dotenv();

    let rest_url =
        env::var("VENUE_REST_URL").unwrap_or_else(|_| "https://www.okx.com".to_string());
    let ws_public_url = env::var("VENUE_WS_PUBLIC_URL")
        .unwrap_or_else(|_| "wss://ws.okx.com:8443/ws/v5/public".to_string());
    let ws_private_url = env::var("VENUE_WS_PRIVATE_URL")
        .unwrap_or_else(|_| "wss://ws.okx.com:8443/ws/v5/private".to_string());
    for (name, value) in [
        ("VENUE_REST_URL", &rest_url),
        ("VENUE_WS_PUBLIC_URL", &ws_public_url),
        ("VENUE_WS_PRIVATE_URL", &ws_private_url),
    ] {
        Url::parse(value)
            .map_err(|e| CoreError::Config(format!("{name} '{value}': {e}")))?;
    }

    let credentials = match (
        env::var("VENUE_API_KEY").ok(),
        env::var("VENUE_API_SECRET").ok(),
        env::var("VENUE_API_PASSPHRASE").ok(),
    ) {
        (Some(api_key), Some(secret), Some(passphrase)) => {
            Some(Credentials { api_key, secret, passphrase })
        }
        (None, None, None) => None,
        _ => {
            return Err(CoreError::Config(
                "VENUE_API_KEY/SECRET/PASSPHRASE must be set together".to_string(),
            ))
        }
    };

    let strategy_tag = env::var("STRATEGY_TAG").unwrap_or_else(|_| "em".to_string());
    validate_tag(&strategy_tag)?;

    let metrics_port =
        env::var("METRICS_PORT").ok().and_then(|s| s.parse().ok()).unwrap_or(9898);

    Ok(ExchangeConfig {
        rest_url,
        ws_public_url,
        ws_private_url,
        credentials,
        strategy_tag,
        subscribe_mark_price: env_bool("SUB_MARK_PRICE", false),
        subscribe_price_limit: env_bool("SUB_PRICE_LIMIT", false),
        subscribe_funding_rate: env_bool("SUB_FUNDING_RATE", false),
        depth_mode: DepthMode::from_env("DEPTH_MODE", DepthMode::FullBook400),
        ticker_source: TickerSource::from_env("TICKER_SOURCE", TickerSource::WebSocket),
        cleanup_on_boot: env_bool("CLEANUP_ON_BOOT", true),
        instruments: env::var("INSTRUMENTS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        metrics_port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_rules() {
        assert!(validate_tag("grid01").is_ok());
        assert!(validate_tag("").is_err());
        assert!(validate_tag("waytoolongtag").is_err());
        assert!(validate_tag("bad-tag").is_err());
    }

    #[test]
    fn depth_mode_channels() {
        assert_eq!(DepthMode::FullBook400.channel(), "books");
        assert_eq!(DepthMode::Top50Tbt.channel(), "books50-l2-tbt");
        assert!(DepthMode::FullBook400.has_checksum());
        assert!(!DepthMode::Top5.has_checksum());
    }
}
