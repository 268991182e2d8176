//! Post-commit domain events.
//!
//! Financial state changes publish a [`DomainEvent`] only after their own
//! writes committed. Handlers run detached from the request and fail
//! independently; a failure is logged and never touches financial state.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::db::now;
use crate::errors::Result;
use crate::models::ProofStatus;
use crate::store;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    DonationCompleted {
        donation_id: String,
        campaign_id: String,
        donor_id: String,
        net_amount: i64,
    },
    DonationFailed {
        donation_id: String,
        donor_id: String,
        reason: String,
    },
    DonationRefunded {
        donation_id: String,
        campaign_id: String,
        donor_id: String,
        net_amount: i64,
        refunded_by: String,
    },
    MilestoneReleased {
        milestone_id: String,
        campaign_id: String,
        charity_id: String,
        disbursement_id: String,
        amount: i64,
        approved_by: String,
    },
    ProofReviewed {
        proof_id: String,
        milestone_id: String,
        status: ProofStatus,
        reviewed_by: String,
    },
}

impl DomainEvent {
    pub fn action(&self) -> &'static str {
        match self {
            Self::DonationCompleted { .. } => "donation_completed",
            Self::DonationFailed { .. } => "donation_failed",
            Self::DonationRefunded { .. } => "donation_refunded",
            Self::MilestoneReleased { .. } => "milestone_funds_released",
            Self::ProofReviewed { .. } => "milestone_proof_reviewed",
        }
    }

    /// `(entity_type, entity_id)` for the audit trail.
    pub fn entity(&self) -> (&'static str, &str) {
        match self {
            Self::DonationCompleted { donation_id, .. }
            | Self::DonationFailed { donation_id, .. }
            | Self::DonationRefunded { donation_id, .. } => ("donation", donation_id),
            Self::MilestoneReleased { milestone_id, .. } => ("milestone", milestone_id),
            Self::ProofReviewed { proof_id, .. } => ("milestone_proof", proof_id),
        }
    }

    pub fn actor(&self) -> &str {
        match self {
            Self::DonationCompleted { .. } | Self::DonationFailed { .. } => "webhook",
            Self::DonationRefunded { refunded_by, .. } => refunded_by,
            Self::MilestoneReleased { approved_by, .. } => approved_by,
            Self::ProofReviewed { reviewed_by, .. } => reviewed_by,
        }
    }
}

#[async_trait]
pub trait PostCommitHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, event: &DomainEvent) -> Result<()>;
}

#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Vec<Arc<dyn PostCommitHandler>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Audit + notification handlers backed by the database.
    pub fn with_defaults(pool: SqlitePool) -> Self {
        Self::new()
            .with_handler(Arc::new(AuditLogHandler::new(pool.clone())))
            .with_handler(Arc::new(NotificationHandler::new(pool)))
    }

    pub fn with_handler(mut self, handler: Arc<dyn PostCommitHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Run every handler on a detached task.
    pub fn publish(&self, event: DomainEvent) -> JoinHandle<()> {
        let bus = self.clone();
        tokio::spawn(async move { bus.dispatch(&event).await })
    }

    /// Run every handler in turn; one failure does not stop the others.
    pub async fn dispatch(&self, event: &DomainEvent) {
        for handler in &self.handlers {
            match handler.handle(event).await {
                Ok(()) => debug!(handler = handler.name(), action = event.action(), "Post-commit handler done"),
                Err(e) => warn!(
                    handler = handler.name(),
                    action = event.action(),
                    error = %e,
                    "Post-commit handler failed"
                ),
            }
        }
    }
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

pub struct AuditLogHandler {
    pool: SqlitePool,
}

impl AuditLogHandler {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PostCommitHandler for AuditLogHandler {
    fn name(&self) -> &'static str {
        "audit_log"
    }

    async fn handle(&self, event: &DomainEvent) -> Result<()> {
        let (entity_type, entity_id) = event.entity();
        sqlx::query(
            r#"
            INSERT INTO audit_logs (actor, action, entity_type, entity_id, details, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(event.actor())
        .bind(event.action())
        .bind(entity_type)
        .bind(entity_id)
        .bind(serde_json::to_string(event)?)
        .bind(now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

pub struct NotificationHandler {
    pool: SqlitePool,
}

impl NotificationHandler {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn notify(&self, recipient_id: &str, recipient_kind: &str, kind: &str, title: &str, message: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO notifications (recipient_id, recipient_kind, kind, title, message, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(recipient_id)
        .bind(recipient_kind)
        .bind(kind)
        .bind(title)
        .bind(message)
        .bind(now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl PostCommitHandler for NotificationHandler {
    fn name(&self) -> &'static str {
        "notifications"
    }

    async fn handle(&self, event: &DomainEvent) -> Result<()> {
        match event {
            DomainEvent::DonationCompleted { donor_id, net_amount, .. } => {
                self.notify(
                    donor_id,
                    "donor",
                    "donation_completed",
                    "Donation received",
                    &format!("Thank you! {} is on its way to the campaign.", format_php(*net_amount)),
                )
                .await
            }
            DomainEvent::DonationFailed { donor_id, .. } => {
                self.notify(
                    donor_id,
                    "donor",
                    "donation_failed",
                    "Payment failed",
                    "Your payment could not be completed. Please try again.",
                )
                .await
            }
            DomainEvent::DonationRefunded { donor_id, net_amount, .. } => {
                self.notify(
                    donor_id,
                    "donor",
                    "donation_refunded",
                    "Donation refunded",
                    &format!("Your donation of {} was refunded.", format_php(*net_amount)),
                )
                .await
            }
            DomainEvent::MilestoneReleased {
                campaign_id,
                charity_id,
                amount,
                ..
            } => {
                let released = format_php(*amount);
                self.notify(
                    charity_id,
                    "charity",
                    "funds_released",
                    "Milestone funds released",
                    &format!("{released} is now available in your balance."),
                )
                .await?;

                for donor_id in store::distinct_donors(&self.pool, campaign_id).await? {
                    self.notify(
                        &donor_id,
                        "donor",
                        "milestone_verified",
                        "A campaign you support reached a milestone",
                        &format!("A verified milestone released {released} to the charity."),
                    )
                    .await?;
                }
                Ok(())
            }
            DomainEvent::ProofReviewed { .. } => Ok(()),
        }
    }
}

/// `123456` → `₱1,234.56`
pub fn format_php(minor: i64) -> String {
    let sign = if minor < 0 { "-" } else { "" };
    let abs = minor.unsigned_abs();
    let whole = (abs / 100).to_string();
    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (i, ch) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    format!("{sign}₱{grouped}.{:02}", abs % 100)
}
