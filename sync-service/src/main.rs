use std::time::Duration;

use anyhow::Result;
use sync_service::{config::AppConfig, metrics_server, observability, trigger::Trigger, SyncController};

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    // Load configuration
    let cfg = AppConfig::load()?;

    // Start metrics server if configured
    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr)?;
    }

    let controller = SyncController::connect(&cfg).await?;
    let trigger = Trigger::new(controller, cfg.sync_timeout(), cfg.backfill_timeout());

    if let Some(bind_addr) = cfg.trigger.http_bind_addr.clone() {
        let http = trigger.clone();
        tokio::spawn(async move {
            if let Err(e) = http.serve(&bind_addr).await {
                tracing::error!(error = %e, "trigger endpoint stopped");
            }
        });
    }

    tracing::info!(
        system_id = cfg.enphase.system_id,
        poll_interval_secs = cfg.sync.poll_interval_secs,
        timer_enabled = cfg.trigger.timer_enabled,
        "sync service started"
    );

    if cfg.trigger.timer_enabled {
        let period = Duration::from_secs(cfg.sync.poll_interval_secs.max(1));
        tokio::select! {
            _ = trigger.run_timer(period) => {}
            res = tokio::signal::ctrl_c() => res?,
        }
    } else {
        tokio::signal::ctrl_c().await?;
    }

    tracing::info!("shutdown signal received, exiting");
    Ok(())
}
