//! Campaign aggregates: raised amount, donor count, released milestone total.
//!
//! Amounts move with `UPDATE ... SET col = col + ?`, never read-modify-write.
//! The donor count follows `campaign_donors`, a per-donor tally of credited
//! donations kept in the same transaction as the amount, so it does not
//! depend on the status of other donation rows.

use async_trait::async_trait;
use sqlx::{SqliteConnection, SqliteExecutor, SqlitePool};

use crate::errors::{EngineError, Result};
use crate::models::Campaign;

/// A donation's contribution to a campaign.
#[derive(Debug, Clone, Copy)]
pub struct CampaignCredit<'a> {
    pub campaign_id: &'a str,
    pub donation_id: &'a str,
    pub donor_id: &'a str,
    /// Net amount credited to the campaign.
    pub amount: i64,
}

#[async_trait]
pub trait CampaignLedger: Send + Sync {
    /// Add a completed donation's net amount. The donor count grows only on
    /// the donor's first credited donation to the campaign.
    async fn increment(&self, credit: CampaignCredit<'_>) -> Result<()>;

    /// Reverse a credit. Call after the donation left `completed`; the donor
    /// count drops when it was the donor's last credited donation.
    async fn decrement(&self, credit: CampaignCredit<'_>) -> Result<()>;
}

#[derive(Clone)]
pub struct SqliteCampaignLedger {
    pool: SqlitePool,
}

impl SqliteCampaignLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CampaignLedger for SqliteCampaignLedger {
    async fn increment(&self, credit: CampaignCredit<'_>) -> Result<()> {
        // Opens with a write so the transaction holds the lock from the start.
        let mut tx = self.pool.begin().await?;
        add_amount(&mut tx, credit.campaign_id, credit.amount).await?;

        let (donations,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO campaign_donors (campaign_id, donor_id, donations)
            VALUES (?1, ?2, 1)
            ON CONFLICT (campaign_id, donor_id) DO UPDATE SET donations = donations + 1
            RETURNING donations
            "#,
        )
        .bind(credit.campaign_id)
        .bind(credit.donor_id)
        .fetch_one(&mut *tx)
        .await?;

        if donations == 1 {
            sqlx::query("UPDATE campaigns SET donor_count = donor_count + 1 WHERE id = ?1")
                .bind(credit.campaign_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn decrement(&self, credit: CampaignCredit<'_>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        add_amount(&mut tx, credit.campaign_id, -credit.amount).await?;

        let remaining: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE campaign_donors SET donations = donations - 1
            WHERE  campaign_id = ?1 AND donor_id = ?2 AND donations > 0
            RETURNING donations
            "#,
        )
        .bind(credit.campaign_id)
        .bind(credit.donor_id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some((0,)) = remaining {
            sqlx::query("UPDATE campaigns SET donor_count = MAX(0, donor_count - 1) WHERE id = ?1")
                .bind(credit.campaign_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

async fn add_amount(conn: &mut SqliteConnection, campaign_id: &str, amount: i64) -> Result<()> {
    let result = sqlx::query("UPDATE campaigns SET current_amount = current_amount + ?1 WHERE id = ?2")
        .bind(amount)
        .bind(campaign_id)
        .execute(&mut *conn)
        .await?;

    if result.rows_affected() == 0 {
        return Err(EngineError::NotFound(format!("campaign {campaign_id}")));
    }
    Ok(())
}

/// Add a milestone release to the campaign's released total.
pub async fn add_released(conn: &mut SqliteConnection, campaign_id: &str, amount: i64) -> Result<()> {
    let result = sqlx::query(
        "UPDATE campaigns SET milestone_amount_released = milestone_amount_released + ?1 WHERE id = ?2",
    )
    .bind(amount)
    .bind(campaign_id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(EngineError::NotFound(format!("campaign {campaign_id}")));
    }
    Ok(())
}

pub async fn get_campaign(executor: impl SqliteExecutor<'_>, id: &str) -> Result<Option<Campaign>> {
    let row = sqlx::query_as::<_, Campaign>(
        r#"
        SELECT id, charity_id, title, goal_amount, current_amount, donor_count,
               milestone_amount_released
        FROM   campaigns
        WHERE  id = ?1
        "#,
    )
    .bind(id)
    .fetch_optional(executor)
    .await?;
    Ok(row)
}
