//! Rows owned by the reconciliation and disbursement engine.
//!
//! Amounts are minor units (`i64`); timestamps are unix seconds.

use serde::{Deserialize, Serialize};

use crate::fees::FeeBreakdown;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum DonationStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

impl DonationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Refunded)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Pending,
    /// Claimed by a charge attempt; no other delivery may charge it.
    Processing,
    Succeeded,
    Failed,
    Expired,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum MilestoneStatus {
    Pending,
    InProgress,
    Completed,
    Verified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ProofStatus {
    Pending,
    UnderReview,
    Approved,
    Rejected,
    ResubmissionRequired,
}

impl ProofStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::UnderReview => "under_review",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::ResubmissionRequired => "resubmission_required",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum DisbursementStatus {
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Donation {
    pub id: String,
    pub donor_id: String,
    pub campaign_id: String,
    /// Gross amount the donor intends to give.
    pub amount: i64,
    pub payment_method: String,
    pub status: DonationStatus,
    pub provider_payment_id: Option<String>,
    pub platform_fee: Option<i64>,
    pub tip_amount: Option<i64>,
    pub gateway_fee: Option<i64>,
    pub net_amount: Option<i64>,
    pub total_charge: Option<i64>,
    pub donor_covers_fees: Option<bool>,
    pub failure_reason: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
}

impl Donation {
    /// The fee snapshot merged onto the donation at completion, if any.
    pub fn fee_breakdown(&self) -> Option<FeeBreakdown> {
        Some(FeeBreakdown {
            gross_amount: self.amount,
            platform_fee: self.platform_fee?,
            tip_amount: self.tip_amount.unwrap_or(0),
            net_amount: self.net_amount?,
            total_charge: self.total_charge?,
            gateway_fee: self.gateway_fee.unwrap_or(0),
            donor_covers_fees: self.donor_covers_fees.unwrap_or(false),
        })
    }
}

/// JSON stored in `payment_sessions.metadata`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub donor_id: String,
    pub campaign_id: String,
    pub fee_breakdown: FeeBreakdown,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PaymentSession {
    pub id: String,
    pub donation_id: String,
    pub provider: String,
    pub provider_session_id: String,
    /// Amount the provider will charge (the fee-adjusted total).
    pub amount: i64,
    pub status: SessionStatus,
    /// Set as soon as a charge returns, before the donation is touched.
    pub provider_payment_id: Option<String>,
    /// Provider status of that payment when it was created.
    pub payment_status: Option<String>,
    pub metadata: String,
    pub checkout_url: Option<String>,
    pub expires_at: Option<i64>,
    pub created_at: i64,
    pub completed_at: Option<i64>,
}

impl PaymentSession {
    pub fn metadata(&self) -> Option<SessionMetadata> {
        serde_json::from_str(&self.metadata).ok()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WebhookEventRecord {
    pub id: i64,
    pub provider: String,
    pub event_id: String,
    pub event_type: String,
    pub payload: String,
    pub processed: bool,
    pub processed_at: Option<i64>,
    pub error_message: Option<String>,
    pub retry_count: i64,
    pub received_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Campaign {
    pub id: String,
    pub charity_id: String,
    pub title: String,
    pub goal_amount: i64,
    pub current_amount: i64,
    pub donor_count: i64,
    pub milestone_amount_released: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Milestone {
    pub id: String,
    pub campaign_id: String,
    pub title: String,
    pub target_amount: i64,
    pub status: MilestoneStatus,
    pub funds_released: bool,
    pub released_amount: Option<i64>,
    pub released_at: Option<i64>,
    pub verified_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MilestoneProof {
    pub id: String,
    pub milestone_id: String,
    pub submitted_by: String,
    pub description: String,
    pub evidence_url: Option<String>,
    pub verification_status: ProofStatus,
    pub verified_by: Option<String>,
    pub verified_at: Option<i64>,
    pub verification_notes: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FundDisbursement {
    pub id: String,
    pub campaign_id: String,
    pub charity_id: String,
    pub milestone_id: String,
    pub amount: i64,
    pub disbursement_type: String,
    pub status: DisbursementStatus,
    pub approved_by: String,
    pub transaction_reference: String,
    pub created_at: i64,
    pub completed_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CharityBalances {
    pub available_balance: i64,
    pub total_received: i64,
    pub total_withdrawn: i64,
}
