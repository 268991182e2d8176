//! # Milestone release workflow
//!
//! An admin approving a milestone proof releases the milestone's target
//! amount to the charity. Everything financial happens in one SQLite
//! transaction:
//!
//! 1. proof `→ approved`           (only if not approved yet)
//! 2. milestone `→ verified`, `funds_released = 1`   (only if still 0)
//! 3. `fund_disbursements` row      (`UNIQUE(milestone_id)`)
//! 4. campaign `milestone_amount_released += amount`
//! 5. charity `available_balance`, `total_received += amount`
//!
//! Steps 1 and 2 are conditional updates; if either matches no row the
//! transaction is dropped and nothing is written. The transaction opens with
//! a write, so two concurrent approvals serialize on SQLite's write lock and
//! the second one finds `funds_released = 1`.
//!
//! Notifications go out through the [`EventBus`] after commit.

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::campaign;
use crate::charity;
use crate::db::now;
use crate::errors::{EngineError, Result};
use crate::models::{DisbursementStatus, FundDisbursement, MilestoneProof, ProofStatus};
use crate::notify::{DomainEvent, EventBus};
use crate::store::{self, NewProof};

pub const DISBURSEMENT_TYPE: &str = "milestone_release";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approve,
    Reject,
    RequestResubmission,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReviewOutcome {
    Released { disbursement: FundDisbursement },
    Reviewed { proof_id: String, status: ProofStatus },
}

#[derive(Clone)]
pub struct MilestoneReleaseWorkflow {
    pool: SqlitePool,
    bus: EventBus,
}

impl MilestoneReleaseWorkflow {
    pub fn new(pool: SqlitePool, bus: EventBus) -> Self {
        Self { pool, bus }
    }

    /// Record a charity's evidence for a milestone.
    pub async fn submit_proof(&self, proof: &NewProof) -> Result<MilestoneProof> {
        let milestone = store::get_milestone(&self.pool, &proof.milestone_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("milestone {}", proof.milestone_id)))?;
        if milestone.funds_released {
            return Err(EngineError::BusinessRule(format!(
                "milestone {} funds were already released",
                milestone.id
            )));
        }
        let stored = store::insert_proof(&self.pool, proof).await?;
        info!(proof_id = %stored.id, milestone_id = %milestone.id, "Milestone proof submitted");
        Ok(stored)
    }

    pub async fn review(
        &self,
        proof_id: &str,
        decision: ReviewDecision,
        verifier: &str,
        notes: Option<&str>,
    ) -> Result<ReviewOutcome> {
        let status = match decision {
            ReviewDecision::Approve => {
                let disbursement = self.approve(proof_id, verifier, notes).await?;
                return Ok(ReviewOutcome::Released { disbursement });
            }
            ReviewDecision::Reject => ProofStatus::Rejected,
            ReviewDecision::RequestResubmission => ProofStatus::ResubmissionRequired,
        };

        if !store::set_proof_review(&self.pool, proof_id, status, verifier, notes).await? {
            return Err(self.proof_conflict(proof_id).await);
        }
        let proof = store::get_proof(&self.pool, proof_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("proof {proof_id}")))?;

        info!(proof_id, status = status.as_str(), verifier, "Milestone proof reviewed");
        self.bus.publish(DomainEvent::ProofReviewed {
            proof_id: proof.id.clone(),
            milestone_id: proof.milestone_id,
            status,
            reviewed_by: verifier.to_string(),
        });
        Ok(ReviewOutcome::Reviewed {
            proof_id: proof.id,
            status,
        })
    }

    /// Approve a proof and release its milestone's funds exactly once.
    pub async fn approve(&self, proof_id: &str, verifier: &str, notes: Option<&str>) -> Result<FundDisbursement> {
        let ts = now();
        let mut tx = self.pool.begin().await?;

        let approved: Option<(String,)> = sqlx::query_as(
            r#"
            UPDATE milestone_proofs
            SET    verification_status = 'approved', verified_by = ?1, verified_at = ?2,
                   verification_notes = ?3
            WHERE  id = ?4 AND verification_status <> 'approved'
            RETURNING milestone_id
            "#,
        )
        .bind(verifier)
        .bind(ts)
        .bind(notes)
        .bind(proof_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((milestone_id,)) = approved else {
            drop(tx);
            return Err(self.proof_conflict(proof_id).await);
        };

        let released: Option<(String, i64)> = sqlx::query_as(
            r#"
            UPDATE milestones
            SET    status = 'verified', funds_released = 1, released_amount = target_amount,
                   released_at = ?1, verified_at = ?1
            WHERE  id = ?2 AND funds_released = 0
            RETURNING campaign_id, target_amount
            "#,
        )
        .bind(ts)
        .bind(&milestone_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((campaign_id, amount)) = released else {
            warn!(proof_id, milestone_id = %milestone_id, "Release rejected: funds already released");
            return Err(EngineError::BusinessRule(format!(
                "milestone {milestone_id} funds were already released"
            )));
        };

        let (charity_id,): (String,) = sqlx::query_as("SELECT charity_id FROM campaigns WHERE id = ?1")
            .bind(&campaign_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("campaign {campaign_id}")))?;

        let disbursement = FundDisbursement {
            id: Uuid::new_v4().to_string(),
            campaign_id,
            charity_id,
            milestone_id,
            amount,
            disbursement_type: DISBURSEMENT_TYPE.to_string(),
            status: DisbursementStatus::Completed,
            approved_by: verifier.to_string(),
            transaction_reference: format!("REL-{}", Uuid::new_v4().simple()),
            created_at: ts,
            completed_at: Some(ts),
        };
        let inserted = sqlx::query(
            r#"
            INSERT INTO fund_disbursements
                (id, campaign_id, charity_id, milestone_id, amount, disbursement_type, status,
                 approved_by, transaction_reference, created_at, completed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(&disbursement.id)
        .bind(&disbursement.campaign_id)
        .bind(&disbursement.charity_id)
        .bind(&disbursement.milestone_id)
        .bind(disbursement.amount)
        .bind(&disbursement.disbursement_type)
        .bind(disbursement.status)
        .bind(&disbursement.approved_by)
        .bind(&disbursement.transaction_reference)
        .bind(disbursement.created_at)
        .bind(disbursement.completed_at)
        .execute(&mut *tx)
        .await;
        if let Err(e) = inserted {
            let e = EngineError::from(e);
            return Err(if e.is_unique_violation() {
                EngineError::BusinessRule(format!(
                    "milestone {} already has a disbursement",
                    disbursement.milestone_id
                ))
            } else {
                e
            });
        }

        campaign::add_released(&mut tx, &disbursement.campaign_id, amount).await?;
        charity::credit_release(&mut tx, &disbursement.charity_id, amount).await?;
        tx.commit().await?;

        info!(
            proof_id,
            milestone_id = %disbursement.milestone_id,
            charity_id = %disbursement.charity_id,
            disbursement_id = %disbursement.id,
            amount,
            verifier,
            "Milestone funds released"
        );
        self.bus.publish(DomainEvent::MilestoneReleased {
            milestone_id: disbursement.milestone_id.clone(),
            campaign_id: disbursement.campaign_id.clone(),
            charity_id: disbursement.charity_id.clone(),
            disbursement_id: disbursement.id.clone(),
            amount,
            approved_by: verifier.to_string(),
        });
        Ok(disbursement)
    }

    /// Why a conditional proof update matched nothing.
    async fn proof_conflict(&self, proof_id: &str) -> EngineError {
        match store::get_proof(&self.pool, proof_id).await {
            Ok(Some(_)) => EngineError::BusinessRule(format!("proof {proof_id} was already approved")),
            Ok(None) => EngineError::NotFound(format!("proof {proof_id}")),
            Err(e) => e,
        }
    }
}
