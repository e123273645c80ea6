// ===============================
// src/main.rs
// ===============================
/*
 # liveness
curl -s localhost:9898/metrics | egrep '^ws_(frames|reconnects|subscription_acks)_total'

# order flow
curl -s localhost:9898/metrics | egrep '^(orders|deals)_total'
*/

use std::process::ExitCode;

use tokio::time::{interval, Duration};
use tracing::{error, info};

use exmirror::{config, metrics, VenueSession};

#[tokio::main]
async fn main() -> ExitCode {
    // ---- Logging ----
    tracing_subscriber::fmt().with_env_filter("info").init();

    // ---- Load config ----
    let cfg = match config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "bad configuration");
            return ExitCode::FAILURE;
        }
    };

    // ---- Metrics ----
    metrics::init();
    tokio::spawn(metrics::serve_metrics(cfg.metrics_port));

    info!(
        rest = %cfg.rest_url,
        tag = %cfg.strategy_tag,
        depth = ?cfg.depth_mode,
        private = cfg.credentials.is_some(),
        "session core starting"
    );

    let instruments = cfg.instruments.clone();
    let venue = match VenueSession::connect(cfg).await {
        Ok(v) => v,
        Err(e) => {
            error!(error = %e, "venue boot failed");
            return ExitCode::FAILURE;
        }
    };

    for inst_id in &instruments {
        match venue.use_market(inst_id, true).await {
            Ok(_) => info!(%inst_id, "market mirror up"),
            Err(e) => {
                error!(%inst_id, error = %e, "market mirror failed");
                return ExitCode::FAILURE;
            }
        }
    }

    // ---- Run until something unrecoverable happens ----
    let mut heartbeat = interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            fatal = venue.wait_fatal() => {
                error!(error = %fatal, "fatal error, shutting down");
                venue.stop();
                return ExitCode::FAILURE;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt, shutting down");
                venue.stop();
                return ExitCode::SUCCESS;
            }
            _ = heartbeat.tick() => {
                for inst_id in &instruments {
                    if let Ok(market) = venue.use_market(inst_id, true).await {
                        info!(
                            %inst_id,
                            ready = market.ready(),
                            bid = ?market.book().buy1(),
                            ask = ?market.book().sell1(),
                            "heartbeat"
                        );
                    }
                }
            }
        }
    }
}
