use std::collections::BTreeSet;

use anyhow::Result;
use sqlx::PgPool;

/// Highest `end_at` stored for a system, or `None` when the system has no rows.
pub async fn latest_end_at(pool: &PgPool, system_id: i64) -> Result<Option<i64>> {
    let latest = sqlx::query_scalar::<_, Option<i64>>(
        r#"
        SELECT max(end_at)
        FROM solar_telemetry
        WHERE system_id = $1
        "#,
    )
    .bind(system_id)
    .fetch_optional(pool)
    .await?
    .flatten();

    Ok(latest)
}

/// All `end_at` keys stored for a system in `[start_at, end_at)`.
pub async fn existing_end_ats(
    pool: &PgPool,
    system_id: i64,
    start_at: i64,
    end_at: i64,
) -> Result<BTreeSet<i64>> {
    let keys = sqlx::query_scalar::<_, i64>(
        r#"
        SELECT end_at
        FROM solar_telemetry
        WHERE system_id = $1
          AND end_at >= $2
          AND end_at <  $3
        "#,
    )
    .bind(system_id)
    .bind(start_at)
    .bind(end_at)
    .fetch_all(pool)
    .await?;

    Ok(keys.into_iter().collect())
}
