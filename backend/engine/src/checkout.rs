//! Payment-session creation for a pending donation.
//!
//! Validates the request against the effective settings, prices it with the
//! fee calculator, opens a provider source for the fee-adjusted total and
//! records the session together with its fee snapshot. The snapshot is what
//! the webhook side later credits, so checkout and settlement never disagree
//! on the net amount.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::SqlitePool;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::db::now;
use crate::errors::{EngineError, GatewayError, Result, ValidationCode, ValidationError};
use crate::fees::{self, FeeBreakdown, FeeRates};
use crate::gateway::{CreateSource, PaymentGateway};
use crate::models::{DonationStatus, SessionMetadata, SessionStatus};
use crate::settings;
use crate::store::{self, NewSession};

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutRequest {
    pub donor_id: String,
    /// Gross amount as the caller saw it; must match the donation when given.
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub tip_amount: i64,
    #[serde(default)]
    pub cover_fees: bool,
    /// Provider source type; defaults to the donation's payment method.
    #[serde(default)]
    pub payment_method: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutSession {
    pub checkout_url: String,
    pub session_id: String,
    pub fee_breakdown: FeeBreakdown,
}

#[derive(Clone)]
pub struct CheckoutService {
    pool: SqlitePool,
    config: Arc<Config>,
    gateway: Arc<dyn PaymentGateway>,
}

impl CheckoutService {
    pub fn new(pool: SqlitePool, config: Arc<Config>, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self {
            pool,
            config,
            gateway,
        }
    }

    pub async fn create_session(&self, donation_id: &str, request: &CheckoutRequest) -> Result<CheckoutSession> {
        if request.tip_amount < 0 {
            return Err(ValidationError::new(
                ValidationCode::InvalidAmount,
                "tip amount cannot be negative",
            )
            .into());
        }

        let donation = store::get_donation(&self.pool, donation_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("donation {donation_id}")))?;
        if donation.donor_id != request.donor_id {
            return Err(EngineError::Forbidden(
                "donation belongs to another donor".to_string(),
            ));
        }
        if donation.status != DonationStatus::Pending {
            return Err(EngineError::BusinessRule(format!(
                "donation {donation_id} is not pending"
            )));
        }
        if let Some(amount) = request.amount.filter(|a| *a != donation.amount) {
            return Err(ValidationError::new(
                ValidationCode::InvalidRequest,
                format!("amount {amount} does not match the donation amount {}", donation.amount),
            )
            .into());
        }

        let effective = settings::effective(&self.pool, &self.config).await?;
        let gross = donation.amount;
        if gross < effective.minimum_donation {
            return Err(ValidationError::below_minimum("donation amount", effective.minimum_donation, gross).into());
        }

        let breakdown = fees::calculate(
            gross,
            request.tip_amount,
            request.cover_fees,
            FeeRates::with_platform_fee(effective.platform_fee_bps),
        );
        if breakdown.net_amount < self.config.minimum_net_amount {
            return Err(ValidationError::below_minimum(
                "net amount after fees",
                self.config.minimum_net_amount,
                breakdown.net_amount,
            )
            .into());
        }
        if breakdown.total_charge > self.config.max_transaction_amount {
            return Err(ValidationError::new(
                ValidationCode::AmountTooLarge,
                format!(
                    "total charge exceeds the maximum of {}",
                    self.config.max_transaction_amount
                ),
            )
            .with_details(json!({
                "maximumAllowed": self.config.max_transaction_amount,
                "provided": breakdown.total_charge,
            }))
            .into());
        }

        if let Some(open) = store::latest_session_for_donation(&self.pool, donation_id).await? {
            if open.status == SessionStatus::Processing {
                return Err(EngineError::BusinessRule(format!(
                    "a payment for donation {donation_id} is already being processed"
                )));
            }
        }

        let base = &self.config.app_base_url;
        let source = match self
            .gateway
            .create_source(&CreateSource {
                amount: breakdown.total_charge,
                source_type: request
                    .payment_method
                    .clone()
                    .unwrap_or_else(|| donation.payment_method.clone()),
                success_url: format!("{base}/donations/{donation_id}/success"),
                failed_url: format!("{base}/donations/{donation_id}/failed"),
                metadata: json!({
                    "donation_id": donation.id,
                    "donor_id": donation.donor_id,
                    "campaign_id": donation.campaign_id,
                }),
            })
            .await
        {
            Ok(source) => source,
            Err(e) => {
                warn!(donation_id, error = %e, "Creating payment source failed");
                self.note_failure(donation_id, &e).await;
                return Err(e.into());
            }
        };
        let Some(checkout_url) = source.checkout_url else {
            let e = GatewayError::new("provider returned no checkout URL");
            self.note_failure(donation_id, &e).await;
            return Err(e.into());
        };

        let metadata = serde_json::to_string(&SessionMetadata {
            donor_id: donation.donor_id.clone(),
            campaign_id: donation.campaign_id.clone(),
            fee_breakdown: breakdown,
        })?;

        let mut tx = self.pool.begin().await?;
        let session_id = store::replace_active_session(
            &mut tx,
            &NewSession {
                donation_id,
                provider: &self.config.provider,
                provider_session_id: &source.id,
                amount: breakdown.total_charge,
                metadata: &metadata,
                checkout_url: Some(&checkout_url),
                expires_at: now() + self.config.session_ttl_secs,
            },
        )
        .await?;
        store::set_failure_reason(&mut *tx, donation_id, None).await?;
        tx.commit().await?;

        info!(
            donation_id,
            session_id = %session_id,
            source_id = %source.id,
            total_charge = breakdown.total_charge,
            net_amount = breakdown.net_amount,
            "Payment session created"
        );
        Ok(CheckoutSession {
            checkout_url,
            session_id,
            fee_breakdown: breakdown,
        })
    }

    /// The donation stays `pending`; only the reason is kept for the donor.
    async fn note_failure(&self, donation_id: &str, err: &GatewayError) {
        if let Err(e) = store::set_failure_reason(&self.pool, donation_id, Some(&err.to_string())).await {
            error!(donation_id, error = %e, "Failed to record payment failure on donation");
        }
    }
}
