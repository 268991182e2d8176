//! Campaign aggregate reconciliation.
//!
//! Completed donations are the source of truth for `current_amount` and
//! `donor_count`. A completed donation whose campaign increment failed leaves
//! the aggregate behind; this module finds and repairs such drift.

use std::time::Duration;

use serde::Serialize;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::errors::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct CampaignDrift {
    pub campaign_id: String,
    pub stored_amount: i64,
    pub expected_amount: i64,
    pub stored_donor_count: i64,
    pub expected_donor_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationReport {
    pub campaigns_checked: usize,
    pub drifted: Vec<CampaignDrift>,
    /// Rows rewritten; always 0 for a read-only report.
    pub repaired: u64,
}

const EXPECTED_AMOUNT: &str = r#"
    COALESCE((SELECT SUM(d.net_amount) FROM donations d
              WHERE d.campaign_id = c.id AND d.status = 'completed'), 0)
"#;

const EXPECTED_DONORS: &str = r#"
    (SELECT COUNT(DISTINCT d.donor_id) FROM donations d
     WHERE d.campaign_id = c.id AND d.status = 'completed')
"#;

/// Compare every campaign's aggregates with its completed donations.
pub async fn report(pool: &SqlitePool) -> Result<ReconciliationReport> {
    let rows = sqlx::query_as::<_, CampaignDrift>(&format!(
        r#"
        SELECT c.id AS campaign_id,
               c.current_amount AS stored_amount,
               {EXPECTED_AMOUNT} AS expected_amount,
               c.donor_count AS stored_donor_count,
               {EXPECTED_DONORS} AS expected_donor_count
        FROM   campaigns c
        ORDER  BY c.id
        "#
    ))
    .fetch_all(pool)
    .await?;

    let campaigns_checked = rows.len();
    let drifted = rows
        .into_iter()
        .filter(|r| r.stored_amount != r.expected_amount || r.stored_donor_count != r.expected_donor_count)
        .collect();
    Ok(ReconciliationReport {
        campaigns_checked,
        drifted,
        repaired: 0,
    })
}

/// Rewrite drifting aggregates from completed donations and rebuild the
/// per-donor tally behind `donor_count`.
///
/// Each row is recomputed inside the `UPDATE` itself. Run it while no
/// donation is between completion and its campaign credit, or that credit
/// lands twice.
pub async fn repair(pool: &SqlitePool) -> Result<ReconciliationReport> {
    let mut report = report(pool).await?;
    if report.drifted.is_empty() {
        return Ok(report);
    }

    let mut tx = pool.begin().await?;
    let result = sqlx::query(&format!(
        r#"
        UPDATE campaigns AS c
        SET    current_amount = {EXPECTED_AMOUNT},
               donor_count    = {EXPECTED_DONORS}
        WHERE  c.current_amount <> {EXPECTED_AMOUNT}
           OR  c.donor_count    <> {EXPECTED_DONORS}
        "#
    ))
    .execute(&mut *tx)
    .await?;

    sqlx::query("DELETE FROM campaign_donors")
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        r#"
        INSERT INTO campaign_donors (campaign_id, donor_id, donations)
        SELECT campaign_id, donor_id, COUNT(*) FROM donations
        WHERE  status = 'completed'
        GROUP  BY campaign_id, donor_id
        "#,
    )
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    report.repaired = result.rows_affected();
    for drift in &report.drifted {
        info!(
            campaign_id = %drift.campaign_id,
            from = drift.stored_amount,
            to = drift.expected_amount,
            "Campaign aggregate repaired"
        );
    }
    Ok(report)
}

/// Periodic read-only sweep; drift is logged for an operator to repair.
pub async fn run(pool: SqlitePool, interval: Duration, shutdown: CancellationToken) {
    info!(interval_secs = interval.as_secs(), "Reconciliation sweep starting");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Reconciliation sweep stopped");
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        match report(&pool).await {
            Ok(report) => {
                for drift in &report.drifted {
                    warn!(
                        campaign_id = %drift.campaign_id,
                        stored_amount = drift.stored_amount,
                        expected_amount = drift.expected_amount,
                        stored_donor_count = drift.stored_donor_count,
                        expected_donor_count = drift.expected_donor_count,
                        "Campaign aggregate drift detected"
                    );
                }
            }
            Err(e) => error!("Reconciliation sweep error: {e}"),
        }
    }
}
