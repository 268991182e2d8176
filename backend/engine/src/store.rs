//! Row access for donations, payment sessions, milestones and proofs.
//!
//! Status transitions are compare-and-set: each `UPDATE` names the statuses
//! it may leave, and callers act on `rows_affected` rather than on a value
//! read earlier.

use sqlx::{SqliteConnection, SqliteExecutor, SqlitePool};
use uuid::Uuid;

use crate::db::now;
use crate::errors::{EngineError, Result};
use crate::fees::FeeBreakdown;
use crate::gateway::Payment;
use crate::models::{
    Donation, FundDisbursement, Milestone, MilestoneProof, PaymentSession, ProofStatus,
};

const SELECT_DONATION: &str = r#"
    SELECT id, donor_id, campaign_id, amount, payment_method, status, provider_payment_id,
           platform_fee, tip_amount, gateway_fee, net_amount, total_charge, donor_covers_fees,
           failure_reason, created_at, updated_at, completed_at
    FROM   donations
"#;

const SELECT_SESSION: &str = r#"
    SELECT id, donation_id, provider, provider_session_id, amount, status, provider_payment_id,
           payment_status, metadata, checkout_url, expires_at, created_at, completed_at
    FROM   payment_sessions
"#;

// ─────────────────────────────────────────────────────────
// Donations
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct NewDonation {
    pub donor_id: String,
    pub campaign_id: String,
    pub amount: i64,
    pub payment_method: String,
}

pub async fn insert_donation(pool: &SqlitePool, new: &NewDonation) -> Result<Donation> {
    let id = Uuid::new_v4().to_string();
    let ts = now();
    sqlx::query(
        r#"
        INSERT INTO donations
            (id, donor_id, campaign_id, amount, payment_method, status, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?6)
        "#,
    )
    .bind(&id)
    .bind(&new.donor_id)
    .bind(&new.campaign_id)
    .bind(new.amount)
    .bind(&new.payment_method)
    .bind(ts)
    .execute(pool)
    .await?;

    let donation = get_donation(pool, &id).await?;
    donation.ok_or_else(|| EngineError::NotFound(format!("donation {id}")))
}

pub async fn get_donation(executor: impl SqliteExecutor<'_>, id: &str) -> Result<Option<Donation>> {
    let row = sqlx::query_as::<_, Donation>(&format!("{SELECT_DONATION} WHERE id = ?1"))
        .bind(id)
        .fetch_optional(executor)
        .await?;
    Ok(row)
}

pub async fn find_donation_by_payment_id(pool: &SqlitePool, payment_id: &str) -> Result<Option<Donation>> {
    let row = sqlx::query_as::<_, Donation>(&format!(
        "{SELECT_DONATION} WHERE provider_payment_id = ?1"
    ))
    .bind(payment_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// `pending | failed → completed`, recording the payment id and fee snapshot.
///
/// Returns `false` when the donation was already completed or refunded.
pub async fn complete_donation(
    pool: &SqlitePool,
    id: &str,
    payment_id: &str,
    fees: &FeeBreakdown,
) -> Result<bool> {
    let ts = now();
    let result = sqlx::query(
        r#"
        UPDATE donations
        SET    status = 'completed', provider_payment_id = ?1,
               platform_fee = ?2, tip_amount = ?3, gateway_fee = ?4, net_amount = ?5,
               total_charge = ?6, donor_covers_fees = ?7, failure_reason = NULL,
               completed_at = ?8, updated_at = ?8
        WHERE  id = ?9 AND status IN ('pending', 'failed')
        "#,
    )
    .bind(payment_id)
    .bind(fees.platform_fee)
    .bind(fees.tip_amount)
    .bind(fees.gateway_fee)
    .bind(fees.net_amount)
    .bind(fees.total_charge)
    .bind(fees.donor_covers_fees)
    .bind(ts)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// `pending → failed`. A completed donation never regresses.
pub async fn fail_donation(pool: &SqlitePool, id: &str, reason: &str) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE donations
        SET    status = 'failed', failure_reason = ?1, updated_at = ?2
        WHERE  id = ?3 AND status = 'pending'
        "#,
    )
    .bind(reason)
    .bind(now())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Note why the last payment attempt for a pending donation went wrong, or
/// clear it. The status is left alone so the donor can retry.
pub async fn set_failure_reason(executor: impl SqliteExecutor<'_>, id: &str, reason: Option<&str>) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE donations SET failure_reason = ?1, updated_at = ?2 WHERE id = ?3 AND status = 'pending'",
    )
    .bind(reason)
    .bind(now())
    .bind(id)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// `completed → refunded`.
pub async fn refund_donation(pool: &SqlitePool, id: &str) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE donations SET status = 'refunded', updated_at = ?1 WHERE id = ?2 AND status = 'completed'",
    )
    .bind(now())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

// ─────────────────────────────────────────────────────────
// Payment sessions
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct NewSession<'a> {
    pub donation_id: &'a str,
    pub provider: &'a str,
    pub provider_session_id: &'a str,
    pub amount: i64,
    pub metadata: &'a str,
    pub checkout_url: Option<&'a str>,
    pub expires_at: i64,
}

/// Cancel any open session for the donation and insert the new one as
/// `pending`. Runs on the caller's transaction. A `processing` session is
/// never cancelled; the insert then fails on the one-active-session index.
pub async fn replace_active_session(conn: &mut SqliteConnection, new: &NewSession<'_>) -> Result<String> {
    let ts = now();
    sqlx::query(
        r#"
        UPDATE payment_sessions SET status = 'cancelled'
        WHERE  donation_id = ?1 AND status IN ('created', 'pending')
        "#,
    )
    .bind(new.donation_id)
    .execute(&mut *conn)
    .await?;

    let id = Uuid::new_v4().to_string();
    sqlx::query(
        r#"
        INSERT INTO payment_sessions
            (id, donation_id, provider, provider_session_id, amount, status, metadata,
             checkout_url, expires_at, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7, ?8, ?9)
        "#,
    )
    .bind(&id)
    .bind(new.donation_id)
    .bind(new.provider)
    .bind(new.provider_session_id)
    .bind(new.amount)
    .bind(new.metadata)
    .bind(new.checkout_url)
    .bind(new.expires_at)
    .bind(ts)
    .execute(&mut *conn)
    .await?;
    Ok(id)
}

pub async fn find_session_by_provider_id(
    pool: &SqlitePool,
    provider: &str,
    provider_session_id: &str,
) -> Result<Option<PaymentSession>> {
    let row = sqlx::query_as::<_, PaymentSession>(&format!(
        "{SELECT_SESSION} WHERE provider = ?1 AND provider_session_id = ?2"
    ))
    .bind(provider)
    .bind(provider_session_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn find_session_by_payment_id(pool: &SqlitePool, payment_id: &str) -> Result<Option<PaymentSession>> {
    let row = sqlx::query_as::<_, PaymentSession>(&format!(
        "{SELECT_SESSION} WHERE provider_payment_id = ?1"
    ))
    .bind(payment_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Most recent session for a donation.
pub async fn latest_session_for_donation(pool: &SqlitePool, donation_id: &str) -> Result<Option<PaymentSession>> {
    let row = sqlx::query_as::<_, PaymentSession>(&format!(
        "{SELECT_SESSION} WHERE donation_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT 1"
    ))
    .bind(donation_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// `created | pending → processing`. Only the caller that wins this may
/// charge the session's source.
pub async fn claim_session(pool: &SqlitePool, id: &str) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE payment_sessions SET status = 'processing' WHERE id = ?1 AND status IN ('created', 'pending')",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Remember the provider payment created for a claimed session.
pub async fn record_session_payment(pool: &SqlitePool, id: &str, payment: &Payment) -> Result<()> {
    let result = sqlx::query(
        "UPDATE payment_sessions SET provider_payment_id = ?1, payment_status = ?2 WHERE id = ?3",
    )
    .bind(&payment.id)
    .bind(&payment.status)
    .bind(id)
    .execute(pool)
    .await?;
    if result.rows_affected() == 0 {
        return Err(EngineError::NotFound(format!("payment session {id}")));
    }
    Ok(())
}

pub async fn succeed_session(pool: &SqlitePool, id: &str) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE payment_sessions SET status = 'succeeded', completed_at = ?1
        WHERE  id = ?2 AND status IN ('created', 'pending', 'processing', 'failed')
        "#,
    )
    .bind(now())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn fail_session(pool: &SqlitePool, id: &str) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE payment_sessions SET status = 'failed', completed_at = ?1
        WHERE  id = ?2 AND status IN ('created', 'pending', 'processing')
        "#,
    )
    .bind(now())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

// ─────────────────────────────────────────────────────────
// Milestones & proofs
// ─────────────────────────────────────────────────────────

pub async fn get_milestone(executor: impl SqliteExecutor<'_>, id: &str) -> Result<Option<Milestone>> {
    let row = sqlx::query_as::<_, Milestone>(
        r#"
        SELECT id, campaign_id, title, target_amount, status, funds_released,
               released_amount, released_at, verified_at
        FROM   milestones
        WHERE  id = ?1
        "#,
    )
    .bind(id)
    .fetch_optional(executor)
    .await?;
    Ok(row)
}

pub async fn get_proof(executor: impl SqliteExecutor<'_>, id: &str) -> Result<Option<MilestoneProof>> {
    let row = sqlx::query_as::<_, MilestoneProof>(
        r#"
        SELECT id, milestone_id, submitted_by, description, evidence_url, verification_status,
               verified_by, verified_at, verification_notes, created_at
        FROM   milestone_proofs
        WHERE  id = ?1
        "#,
    )
    .bind(id)
    .fetch_optional(executor)
    .await?;
    Ok(row)
}

#[derive(Debug, Clone)]
pub struct NewProof {
    pub milestone_id: String,
    pub submitted_by: String,
    pub description: String,
    pub evidence_url: Option<String>,
}

pub async fn insert_proof(pool: &SqlitePool, new: &NewProof) -> Result<MilestoneProof> {
    let id = Uuid::new_v4().to_string();
    sqlx::query(
        r#"
        INSERT INTO milestone_proofs
            (id, milestone_id, submitted_by, description, evidence_url, verification_status, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6)
        "#,
    )
    .bind(&id)
    .bind(&new.milestone_id)
    .bind(&new.submitted_by)
    .bind(&new.description)
    .bind(&new.evidence_url)
    .bind(now())
    .execute(pool)
    .await?;

    get_proof(pool, &id)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("proof {id}")))
}

/// Set a non-approval review outcome. Approved proofs are final.
pub async fn set_proof_review(
    pool: &SqlitePool,
    id: &str,
    status: ProofStatus,
    verifier: &str,
    notes: Option<&str>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE milestone_proofs
        SET    verification_status = ?1, verified_by = ?2, verified_at = ?3, verification_notes = ?4
        WHERE  id = ?5 AND verification_status <> 'approved'
        "#,
    )
    .bind(status)
    .bind(verifier)
    .bind(now())
    .bind(notes)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn disbursement_for_milestone(
    executor: impl SqliteExecutor<'_>,
    milestone_id: &str,
) -> Result<Option<FundDisbursement>> {
    let row = sqlx::query_as::<_, FundDisbursement>(
        r#"
        SELECT id, campaign_id, charity_id, milestone_id, amount, disbursement_type, status,
               approved_by, transaction_reference, created_at, completed_at
        FROM   fund_disbursements
        WHERE  milestone_id = ?1
        "#,
    )
    .bind(milestone_id)
    .fetch_optional(executor)
    .await?;
    Ok(row)
}

/// Distinct donors with a completed donation to the campaign.
pub async fn distinct_donors(pool: &SqlitePool, campaign_id: &str) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        r#"
        SELECT DISTINCT donor_id FROM donations
        WHERE  campaign_id = ?1 AND status = 'completed'
        ORDER  BY donor_id
        "#,
    )
    .bind(campaign_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(d,)| d).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;
    use crate::fees::{calculate, FeeRates};
    use crate::models::DonationStatus;
    use crate::test_support::{seed_campaign, seed_pending_donation};

    #[tokio::test]
    async fn completed_donation_never_regresses_to_failed() {
        let pool = memory_pool().await.unwrap();
        seed_campaign(&pool, "camp-1", "charity-1").await;
        let donation = seed_pending_donation(&pool, "camp-1", "donor-a", 100_000).await;
        let fees = calculate(100_000, 0, false, FeeRates::default());

        assert!(complete_donation(&pool, &donation.id, "pay_1", &fees).await.unwrap());
        assert!(!complete_donation(&pool, &donation.id, "pay_1", &fees).await.unwrap());
        assert!(!fail_donation(&pool, &donation.id, "late failure").await.unwrap());

        let stored = get_donation(&pool, &donation.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DonationStatus::Completed);
        assert_eq!(stored.net_amount, Some(92_500));
        assert_eq!(stored.fee_breakdown(), Some(fees));
        assert!(stored.failure_reason.is_none());
    }

    #[tokio::test]
    async fn failed_donation_may_still_complete() {
        let pool = memory_pool().await.unwrap();
        seed_campaign(&pool, "camp-1", "charity-1").await;
        let donation = seed_pending_donation(&pool, "camp-1", "donor-a", 100_000).await;
        let fees = calculate(100_000, 0, true, FeeRates::default());

        assert!(fail_donation(&pool, &donation.id, "insufficient funds").await.unwrap());
        assert!(complete_donation(&pool, &donation.id, "pay_2", &fees).await.unwrap());
        let stored = find_donation_by_payment_id(&pool, "pay_2").await.unwrap().unwrap();
        assert_eq!(stored.status, DonationStatus::Completed);
    }

    #[tokio::test]
    async fn new_session_cancels_previous_active_one() {
        let pool = memory_pool().await.unwrap();
        seed_campaign(&pool, "camp-1", "charity-1").await;
        let donation = seed_pending_donation(&pool, "camp-1", "donor-a", 100_000).await;

        let mut conn = pool.acquire().await.unwrap();
        let first = replace_active_session(
            &mut conn,
            &NewSession {
                donation_id: &donation.id,
                provider: "paymongo",
                provider_session_id: "src_1",
                amount: 100_000,
                metadata: "{}",
                checkout_url: None,
                expires_at: 0,
            },
        )
        .await
        .unwrap();
        let second = replace_active_session(
            &mut conn,
            &NewSession {
                donation_id: &donation.id,
                provider: "paymongo",
                provider_session_id: "src_2",
                amount: 100_000,
                metadata: "{}",
                checkout_url: None,
                expires_at: 0,
            },
        )
        .await
        .unwrap();
        drop(conn);

        let old = find_session_by_provider_id(&pool, "paymongo", "src_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(old.id, first);
        assert_eq!(old.status, crate::models::SessionStatus::Cancelled);
        let latest = latest_session_for_donation(&pool, &donation.id).await.unwrap().unwrap();
        assert_eq!(latest.id, second);
    }
}
