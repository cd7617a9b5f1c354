use std::{env, time::Duration};

use anyhow::{bail, Result};
use sync_service::{
    config::AppConfig,
    observability,
    pipeline::{BackfillRequest, BackfillStatus},
    SyncContext, SyncController,
};

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().skip(1).collect();
    let request = parse_args(&args)?;

    // Load configuration (can point SYNC_CONFIG to a backfill-specific file).
    let cfg = AppConfig::load()?;
    let controller = SyncController::connect(&cfg).await?;

    let ctx = SyncContext::new("backfill").with_timeout(cfg.backfill_timeout());
    let summary = controller.backfill(&ctx, request).await;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    if summary.status == BackfillStatus::Aborted {
        bail!("backfill aborted after {} day(s)", summary.days_processed);
    }
    Ok(())
}

/// `<days> [delay_secs]`; the delay defaults to zero.
fn parse_args(args: &[String]) -> Result<BackfillRequest> {
    let Some(raw_days) = args.first() else {
        bail!("usage: backfill <days> [delay_secs]");
    };
    let days: u32 = raw_days
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid days `{raw_days}`: {e}"))?;
    if days == 0 {
        bail!("days must be positive");
    }

    let delay = match args.get(1) {
        Some(raw) => {
            let secs: f64 = raw
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid delay_secs `{raw}`: {e}"))?;
            if secs < 0.0 {
                bail!("delay_secs must be non-negative, got `{raw}`");
            }
            Duration::try_from_secs_f64(secs)
                .map_err(|e| anyhow::anyhow!("invalid delay_secs `{raw}`: {e}"))?
        }
        None => Duration::ZERO,
    };

    Ok(BackfillRequest { days, delay })
}
