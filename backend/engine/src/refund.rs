//! Admin refunds: `completed → refunded` and the matching campaign debit.
//!
//! Only the platform's books are touched; returning money through the
//! provider is done out of band.

use std::sync::Arc;

use sqlx::SqlitePool;
use tracing::{error, info};

use crate::campaign::{CampaignCredit, CampaignLedger};
use crate::errors::{EngineError, Result};
use crate::models::{Donation, DonationStatus};
use crate::notify::{DomainEvent, EventBus};
use crate::store;

#[derive(Clone)]
pub struct RefundService {
    pool: SqlitePool,
    campaigns: Arc<dyn CampaignLedger>,
    bus: EventBus,
}

impl RefundService {
    pub fn new(pool: SqlitePool, campaigns: Arc<dyn CampaignLedger>, bus: EventBus) -> Self {
        Self {
            pool,
            campaigns,
            bus,
        }
    }

    pub async fn refund(&self, donation_id: &str, admin_id: &str) -> Result<Donation> {
        let donation = store::get_donation(&self.pool, donation_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("donation {donation_id}")))?;
        if donation.status != DonationStatus::Completed {
            return Err(EngineError::BusinessRule(format!(
                "only completed donations can be refunded; {donation_id} is not completed"
            )));
        }
        let net_amount = donation.net_amount.ok_or_else(|| {
            EngineError::BusinessRule(format!("donation {donation_id} has no recorded net amount"))
        })?;

        if !store::refund_donation(&self.pool, donation_id).await? {
            return Err(EngineError::BusinessRule(format!(
                "donation {donation_id} changed state during refund"
            )));
        }
        info!(donation_id, net_amount, admin_id, "Donation refunded");

        let credit = CampaignCredit {
            campaign_id: &donation.campaign_id,
            donation_id,
            donor_id: &donation.donor_id,
            amount: net_amount,
        };
        if let Err(e) = self.campaigns.decrement(credit).await {
            error!(
                donation_id,
                campaign_id = %donation.campaign_id,
                net_amount,
                error = %e,
                "Campaign decrement failed after refund; reconciliation required"
            );
        }

        self.bus.publish(DomainEvent::DonationRefunded {
            donation_id: donation_id.to_string(),
            campaign_id: donation.campaign_id.clone(),
            donor_id: donation.donor_id.clone(),
            net_amount,
            refunded_by: admin_id.to_string(),
        });

        store::get_donation(&self.pool, donation_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("donation {donation_id}")))
    }
}
