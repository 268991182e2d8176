//! # Webhook processor
//!
//! ```text
//! body ──► verify HMAC ──► decode envelope ──► EventLedger.record
//!              │                                   │
//!             401                          duplicate? ──► ack, no side effects
//!                                                  │
//!                                  ProviderEvent::decode ──► dispatch ──► mark ledger row
//! ```
//!
//! Once a delivery is verified and recorded it is always acknowledged; what
//! happened downstream is written to the ledger row (`error_message`) instead
//! of an HTTP status, since a non-2xx makes the provider redeliver.
//!
//! Every transition is a compare-and-set on the current donation / session
//! status, so replays and out-of-order deliveries converge on the same state:
//! a completed donation never goes back to `failed`, and only the delivery
//! that wins the `→ completed` transition credits the campaign.
//!
//! A source is charged at most once. The session is claimed
//! (`pending → processing`) before the gateway call, and the returned payment
//! is written onto the session before anything else, so a replay of an event
//! that errored after the charge settles that payment instead of charging.

use std::sync::Arc;

use serde_json::Value;
use sqlx::SqlitePool;
use tracing::{debug, error, info, warn};

use crate::campaign::{CampaignCredit, CampaignLedger};
use crate::config::Config;
use crate::errors::{EngineError, Result};
use crate::events::{ChargeableSource, PaymentNotice, ProviderEvent, WebhookEnvelope};
use crate::fees::{self, FeeBreakdown, FeeRates};
use crate::gateway::{ChargeSource, PaymentGateway, PAYMENT_PAID};
use crate::ledger::{EventLedger, NewWebhookEvent, RecordOutcome};
use crate::models::{Donation, DonationStatus, PaymentSession, SessionStatus};
use crate::notify::{DomainEvent, EventBus};
use crate::signature::{SignatureVerifier, Verification};
use crate::store;

/// What the HTTP layer acknowledges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// First delivery; `note` is what was recorded on the ledger row.
    Processed { ledger_id: i64, note: Option<String> },
    /// Already recorded; nothing was applied.
    Duplicate { ledger_id: i64 },
}

pub struct WebhookProcessor {
    pool: SqlitePool,
    provider: String,
    verifier: SignatureVerifier,
    require_signature: bool,
    fallback_rates: FeeRates,
    ledger: Arc<dyn EventLedger>,
    campaigns: Arc<dyn CampaignLedger>,
    gateway: Arc<dyn PaymentGateway>,
    bus: EventBus,
}

impl WebhookProcessor {
    pub fn new(
        pool: SqlitePool,
        config: &Config,
        ledger: Arc<dyn EventLedger>,
        campaigns: Arc<dyn CampaignLedger>,
        gateway: Arc<dyn PaymentGateway>,
        bus: EventBus,
    ) -> Self {
        Self {
            pool,
            provider: config.provider.clone(),
            verifier: SignatureVerifier::new(config.webhook_secret.clone()),
            require_signature: config.webhook_require_signature,
            fallback_rates: FeeRates::with_platform_fee(config.platform_fee_bps),
            ledger,
            campaigns,
            gateway,
            bus,
        }
    }

    pub fn ledger(&self) -> &Arc<dyn EventLedger> {
        &self.ledger
    }

    /// Verify, deduplicate and apply one delivery.
    ///
    /// Errors are only returned before the ledger row exists.
    pub async fn handle(&self, body: &[u8], signature: Option<&str>) -> Result<WebhookOutcome> {
        match self.verifier.verify(body, signature) {
            Verification::Valid => {}
            Verification::Invalid => {
                warn!(body_len = body.len(), "Rejected webhook with invalid signature");
                return Err(EngineError::InvalidSignature);
            }
            Verification::Unchecked if self.require_signature => {
                warn!("Rejected webhook: no signing secret configured and signatures are required");
                return Err(EngineError::InvalidSignature);
            }
            Verification::Unchecked => {
                debug!("Accepting unsigned webhook; no signing secret configured");
            }
        }

        let envelope = WebhookEnvelope::from_bytes(body)?;
        let payload = String::from_utf8_lossy(body);

        let ledger_id = match self
            .ledger
            .record(NewWebhookEvent {
                provider: &self.provider,
                event_id: envelope.event_id(),
                event_type: envelope.event_type(),
                payload: &payload,
            })
            .await?
        {
            RecordOutcome::Recorded(id) => id,
            RecordOutcome::Duplicate(id) => {
                info!(
                    event_id = envelope.event_id(),
                    event_type = envelope.event_type(),
                    ledger_id = id,
                    "Duplicate webhook delivery acknowledged without reprocessing"
                );
                return Ok(WebhookOutcome::Duplicate { ledger_id: id });
            }
        };

        let note = self
            .process_recorded(ledger_id, envelope.event_type(), &envelope.data.attributes.data)
            .await;
        Ok(WebhookOutcome::Processed { ledger_id, note })
    }

    /// Re-run a stored event whose earlier processing errored.
    pub async fn replay(&self, ledger_id: i64) -> Result<Option<String>> {
        let record = self
            .ledger
            .get(ledger_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("webhook event {ledger_id}")))?;
        if record.processed {
            return Err(EngineError::BusinessRule(format!(
                "webhook event {ledger_id} was already processed"
            )));
        }

        self.ledger.bump_retry(ledger_id).await?;
        let envelope = WebhookEnvelope::from_bytes(record.payload.as_bytes())?;
        info!(ledger_id, event_id = %record.event_id, "Replaying webhook event");
        Ok(self
            .process_recorded(ledger_id, envelope.event_type(), &envelope.data.attributes.data)
            .await)
    }

    /// Dispatch and write the result onto the ledger row.
    async fn process_recorded(&self, ledger_id: i64, event_type: &str, resource: &Value) -> Option<String> {
        let result = match ProviderEvent::decode(event_type, resource) {
            Ok(event) => self.dispatch(event).await,
            Err(e) => Ok(Some(format!("invalid {event_type} payload: {e}"))),
        };

        match result {
            Ok(note) => {
                if let Err(e) = self.ledger.mark_processed(ledger_id, note.as_deref()).await {
                    error!(ledger_id, error = %e, "Failed to mark webhook event processed");
                }
                note
            }
            Err(e) => {
                let message = e.to_string();
                error!(ledger_id, event_type, error = %message, "Webhook processing failed");
                if let Err(mark_err) = self.ledger.mark_failed(ledger_id, &message).await {
                    error!(ledger_id, error = %mark_err, "Failed to record webhook processing error");
                }
                Some(message)
            }
        }
    }

    /// `Ok(Some(note))` means handled with something worth recording;
    /// `Err` leaves the row unprocessed for replay.
    async fn dispatch(&self, event: ProviderEvent) -> Result<Option<String>> {
        debug!(kind = event.kind().as_str(), "Dispatching webhook event");
        match event {
            ProviderEvent::SourceChargeable(source) => self.on_source_chargeable(source).await,
            ProviderEvent::PaymentPaid(notice) => self.on_payment_paid(notice).await,
            ProviderEvent::PaymentFailed(notice) => self.on_payment_failed(notice).await,
            ProviderEvent::Unhandled { event_type } => {
                debug!(event_type = %event_type, "Ignoring unhandled webhook event type");
                Ok(Some(format!("unhandled event type '{event_type}'")))
            }
        }
    }

    async fn on_source_chargeable(&self, source: ChargeableSource) -> Result<Option<String>> {
        let Some(session) =
            store::find_session_by_provider_id(&self.pool, &self.provider, &source.source_id).await?
        else {
            warn!(source_id = %source.source_id, "Chargeable source has no payment session");
            return Ok(Some(format!("no payment session for source {}", source.source_id)));
        };
        let Some(donation) = store::get_donation(&self.pool, &session.donation_id).await? else {
            warn!(session_id = %session.id, "Payment session has no donation");
            return Ok(Some(format!("payment session {} has no donation", session.id)));
        };

        if donation.status.is_terminal() {
            return Ok(Some(format!(
                "donation {} already {}",
                donation.id,
                status_str(donation.status)
            )));
        }
        let fees = self.fees_for(&donation, Some(&session));
        match session.status {
            SessionStatus::Succeeded => {
                return Ok(Some(format!("payment session {} already succeeded", session.id)))
            }
            // Superseded by a newer checkout; charging it could pay twice.
            SessionStatus::Cancelled | SessionStatus::Expired => {
                return Ok(Some(format!("payment session {} is no longer active", session.id)))
            }
            SessionStatus::Failed => {
                return Ok(Some(format!("payment session {} already failed", session.id)))
            }
            // Charged earlier but never settled locally: settle, never re-charge.
            SessionStatus::Processing => {
                let Some(payment_id) = session.provider_payment_id.clone() else {
                    warn!(session_id = %session.id, "Chargeable source is already being charged");
                    return Ok(Some(format!("payment session {} is already being charged", session.id)));
                };
                if session.payment_status.as_deref() != Some(PAYMENT_PAID) {
                    return Ok(Some(format!("payment {payment_id} is awaiting settlement")));
                }
                info!(session_id = %session.id, payment_id = %payment_id, "Resuming settlement of an earlier charge");
                return self.settle(&donation, &session, &payment_id, &fees).await;
            }
            SessionStatus::Created | SessionStatus::Pending => {}
        }

        if let Some(amount) = source.amount.filter(|a| *a != fees.total_charge) {
            warn!(
                source_id = %source.source_id,
                source_amount = amount,
                total_charge = fees.total_charge,
                "Source amount differs from the session's total charge"
            );
        }

        if !store::claim_session(&self.pool, &session.id).await? {
            return Ok(Some(format!("payment session {} was claimed concurrently", session.id)));
        }

        let charge = ChargeSource {
            source_id: source.source_id.clone(),
            amount: fees.total_charge,
            description: format!("Donation {}", donation.id),
        };
        let payment = match self.gateway.charge_source(&charge).await {
            Ok(payment) => payment,
            Err(err) => {
                let reason = err.to_string();
                warn!(donation_id = %donation.id, error = %reason, "Charging source failed");
                self.record_failure(&donation, Some(&session), &reason).await?;
                return Ok(Some(format!("charge failed: {reason}")));
            }
        };

        // First write after the charge: a replay finds it and settles instead of charging.
        store::record_session_payment(&self.pool, &session.id, &payment).await?;

        if !payment.is_paid() {
            info!(
                donation_id = %donation.id,
                payment_id = %payment.id,
                status = %payment.status,
                "Charge accepted but not yet paid; waiting for payment.paid"
            );
            return Ok(Some(format!(
                "payment {} is {}; awaiting settlement",
                payment.id, payment.status
            )));
        }
        self.settle(&donation, &session, &payment.id, &fees).await
    }

    /// Complete the donation for a paid charge and credit the campaign.
    async fn settle(
        &self,
        donation: &Donation,
        session: &PaymentSession,
        payment_id: &str,
        fees: &FeeBreakdown,
    ) -> Result<Option<String>> {
        let completed = store::complete_donation(&self.pool, &donation.id, payment_id, fees).await?;
        store::succeed_session(&self.pool, &session.id).await?;
        if !completed {
            return Ok(Some(format!("donation {} was completed concurrently", donation.id)));
        }
        info!(
            donation_id = %donation.id,
            payment_id,
            total_charge = fees.total_charge,
            net_amount = fees.net_amount,
            "Source charged, donation completed"
        );
        Ok(self.credit_campaign(donation, fees).await)
    }

    async fn on_payment_paid(&self, notice: PaymentNotice) -> Result<Option<String>> {
        let Some((donation, session)) = self.locate(&notice).await? else {
            return Ok(Some(format!("no donation for payment {}", notice.payment_id)));
        };
        if donation.status.is_terminal() {
            debug!(donation_id = %donation.id, "Payment paid for an already settled donation");
            return Ok(None);
        }

        let fees = self.fees_for(&donation, session.as_ref());
        let completed =
            store::complete_donation(&self.pool, &donation.id, &notice.payment_id, &fees).await?;
        if let Some(session) = &session {
            store::succeed_session(&self.pool, &session.id).await?;
        }
        if !completed {
            return Ok(Some(format!("donation {} was completed concurrently", donation.id)));
        }
        info!(donation_id = %donation.id, payment_id = %notice.payment_id, "Payment settled, donation completed");
        Ok(self.credit_campaign(&donation, &fees).await)
    }

    async fn on_payment_failed(&self, notice: PaymentNotice) -> Result<Option<String>> {
        let Some((donation, session)) = self.locate(&notice).await? else {
            return Ok(Some(format!("no donation for payment {}", notice.payment_id)));
        };
        if donation.status.is_terminal() {
            info!(
                donation_id = %donation.id,
                payment_id = %notice.payment_id,
                "Ignoring payment failure for a settled donation"
            );
            return Ok(Some(format!(
                "ignored failure: donation {} already {}",
                donation.id,
                status_str(donation.status)
            )));
        }

        self.record_failure(&donation, session.as_ref(), &notice.failure_reason()).await?;
        Ok(None)
    }

    /// Find the donation by payment id (on the donation, then on the session
    /// that was charged), then by the payment's source.
    async fn locate(&self, notice: &PaymentNotice) -> Result<Option<(Donation, Option<PaymentSession>)>> {
        if let Some(donation) = store::find_donation_by_payment_id(&self.pool, &notice.payment_id).await? {
            let session = store::latest_session_for_donation(&self.pool, &donation.id).await?;
            return Ok(Some((donation, session)));
        }
        let session = match store::find_session_by_payment_id(&self.pool, &notice.payment_id).await? {
            Some(session) => session,
            None => {
                let Some(source_id) = notice.source_id.as_deref() else {
                    return Ok(None);
                };
                let Some(session) =
                    store::find_session_by_provider_id(&self.pool, &self.provider, source_id).await?
                else {
                    return Ok(None);
                };
                session
            }
        };
        Ok(store::get_donation(&self.pool, &session.donation_id)
            .await?
            .map(|d| (d, Some(session))))
    }

    /// The persisted snapshot; recomputed only for rows that predate it.
    fn fees_for(&self, donation: &Donation, session: Option<&PaymentSession>) -> FeeBreakdown {
        if let Some(fees) = donation.fee_breakdown() {
            return fees;
        }
        if let Some(meta) = session.and_then(PaymentSession::metadata) {
            return meta.fee_breakdown;
        }
        warn!(donation_id = %donation.id, "No persisted fee breakdown, recomputing");
        fees::calculate(donation.amount, 0, false, self.fallback_rates)
    }

    async fn record_failure(&self, donation: &Donation, session: Option<&PaymentSession>, reason: &str) -> Result<()> {
        let failed = store::fail_donation(&self.pool, &donation.id, reason).await?;
        if let Some(session) = session {
            store::fail_session(&self.pool, &session.id).await?;
        }
        if failed {
            self.bus.publish(DomainEvent::DonationFailed {
                donation_id: donation.id.clone(),
                donor_id: donation.donor_id.clone(),
                reason: reason.to_string(),
            });
        }
        Ok(())
    }

    /// Credit the net amount. A failure here does not undo the completed
    /// donation; it is noted for the reconciliation sweep.
    async fn credit_campaign(&self, donation: &Donation, fees: &FeeBreakdown) -> Option<String> {
        let credit = CampaignCredit {
            campaign_id: &donation.campaign_id,
            donation_id: &donation.id,
            donor_id: &donation.donor_id,
            amount: fees.net_amount,
        };
        let note = match self.campaigns.increment(credit).await {
            Ok(()) => None,
            Err(e) => {
                error!(
                    donation_id = %donation.id,
                    campaign_id = %donation.campaign_id,
                    net_amount = fees.net_amount,
                    error = %e,
                    "Campaign increment failed after donation completed; reconciliation required"
                );
                Some(format!("campaign increment failed: {e}"))
            }
        };

        self.bus.publish(DomainEvent::DonationCompleted {
            donation_id: donation.id.clone(),
            campaign_id: donation.campaign_id.clone(),
            donor_id: donation.donor_id.clone(),
            net_amount: fees.net_amount,
        });
        note
    }
}

fn status_str(status: DonationStatus) -> &'static str {
    match status {
        DonationStatus::Pending => "pending",
        DonationStatus::Completed => "completed",
        DonationStatus::Failed => "failed",
        DonationStatus::Refunded => "refunded",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::campaign::{get_campaign, SqliteCampaignLedger};
    use crate::db::memory_pool;
    use crate::errors::GatewayError;
    use crate::fees::calculate;
    use crate::ledger::SqliteEventLedger;
    use crate::models::SessionMetadata;
    use crate::signature::sign;
    use crate::store::{replace_active_session, NewSession};
    use crate::test_support::{
        file_pool, payment_resource, seed_campaign, seed_pending_donation, source_resource,
        webhook_body, MockGateway,
    };

    const SECRET: &str = "whsk_test";

    struct Harness {
        pool: SqlitePool,
        processor: WebhookProcessor,
        gateway: Arc<MockGateway>,
        donation: Donation,
        fees: FeeBreakdown,
    }

    async fn open_session(pool: &SqlitePool, donation: &Donation, source_id: &str, fees: FeeBreakdown) {
        let metadata = serde_json::to_string(&SessionMetadata {
            donor_id: donation.donor_id.clone(),
            campaign_id: donation.campaign_id.clone(),
            fee_breakdown: fees,
        })
        .unwrap();
        let mut conn = pool.acquire().await.unwrap();
        replace_active_session(
            &mut conn,
            &NewSession {
                donation_id: &donation.id,
                provider: "paymongo",
                provider_session_id: source_id,
                amount: fees.total_charge,
                metadata: &metadata,
                checkout_url: None,
                expires_at: 0,
            },
        )
        .await
        .unwrap();
    }

    fn processor_with(
        pool: &SqlitePool,
        config: &Config,
        gateway: Arc<MockGateway>,
        campaigns: Arc<dyn CampaignLedger>,
    ) -> WebhookProcessor {
        WebhookProcessor::new(
            pool.clone(),
            config,
            Arc::new(SqliteEventLedger::new(pool.clone())),
            campaigns,
            gateway,
            EventBus::new(),
        )
    }

    async fn harness_on(pool: SqlitePool, gateway: MockGateway, cover_fees: bool) -> Harness {
        seed_campaign(&pool, "camp-1", "charity-1").await;
        let donation = seed_pending_donation(&pool, "camp-1", "donor-a", 100_000).await;
        let fees = calculate(100_000, 0, cover_fees, FeeRates::default());
        open_session(&pool, &donation, "src_1", fees).await;

        let gateway = Arc::new(gateway);
        let processor = processor_with(
            &pool,
            &Config::for_tests(),
            gateway.clone(),
            Arc::new(SqliteCampaignLedger::new(pool.clone())),
        );
        Harness {
            pool,
            processor,
            gateway,
            donation,
            fees,
        }
    }

    async fn harness(cover_fees: bool) -> Harness {
        harness_on(memory_pool().await.unwrap(), MockGateway::default(), cover_fees).await
    }

    async fn deliver(processor: &WebhookProcessor, body: &str) -> Result<WebhookOutcome> {
        let sig = sign(SECRET, body.as_bytes());
        processor.handle(body.as_bytes(), Some(&sig)).await
    }

    async fn ledger_rows(pool: &SqlitePool) -> i64 {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM webhook_events")
            .fetch_one(pool)
            .await
            .unwrap();
        n
    }

    #[tokio::test]
    async fn chargeable_source_completes_donation_and_credits_net_once() {
        let h = harness(false).await;
        let body = webhook_body("evt_1", "source.chargeable", source_resource("src_1", 100_000));

        let first = deliver(&h.processor, &body).await.unwrap();
        let WebhookOutcome::Processed { ledger_id, note } = first else {
            panic!("first delivery must be processed");
        };
        assert_eq!(note, None);

        for _ in 0..4 {
            assert_eq!(
                deliver(&h.processor, &body).await.unwrap(),
                WebhookOutcome::Duplicate { ledger_id }
            );
        }

        assert_eq!(h.gateway.charge_count(), 1);
        let donation = store::get_donation(&h.pool, &h.donation.id).await.unwrap().unwrap();
        assert_eq!(donation.status, DonationStatus::Completed);
        assert_eq!(donation.provider_payment_id.as_deref(), Some("pay_src_1"));
        assert_eq!(donation.net_amount, Some(92_500));

        let campaign = get_campaign(&h.pool, "camp-1").await.unwrap().unwrap();
        assert_eq!(campaign.current_amount, 92_500);
        assert_eq!(campaign.donor_count, 1);

        let session = store::latest_session_for_donation(&h.pool, &h.donation.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.status, SessionStatus::Succeeded);
        assert!(session.completed_at.is_some());

        let row = h.processor.ledger().get(ledger_id).await.unwrap().unwrap();
        assert!(row.processed);
        assert_eq!(row.retry_count, 4);
    }

    #[tokio::test]
    async fn charges_the_fee_adjusted_total() {
        let h = harness(true).await;
        let body = webhook_body("evt_1", "source.chargeable", source_resource("src_1", 107_692));
        deliver(&h.processor, &body).await.unwrap();

        let charges = h.gateway.charges.lock().unwrap().clone();
        assert_eq!(charges.len(), 1);
        assert_eq!(charges[0].amount, 107_692);
        assert_eq!(charges[0].source_id, "src_1");

        // Donor covered fees, so the campaign gets the full gross amount.
        let campaign = get_campaign(&h.pool, "camp-1").await.unwrap().unwrap();
        assert_eq!(campaign.current_amount, h.fees.net_amount);
        assert_eq!(campaign.current_amount, 100_000);
    }

    #[tokio::test]
    async fn late_failure_never_reverts_completed_donation() {
        let h = harness(false).await;
        deliver(
            &h.processor,
            &webhook_body("evt_1", "source.chargeable", source_resource("src_1", 100_000)),
        )
        .await
        .unwrap();

        let outcome = deliver(
            &h.processor,
            &webhook_body("evt_2", "payment.failed", payment_resource("pay_src_1", Some("src_1"))),
        )
        .await
        .unwrap();
        let WebhookOutcome::Processed { note, .. } = outcome else {
            panic!("distinct event must be processed");
        };
        assert!(note.unwrap().starts_with("ignored failure"));

        let donation = store::get_donation(&h.pool, &h.donation.id).await.unwrap().unwrap();
        assert_eq!(donation.status, DonationStatus::Completed);
        assert!(donation.failure_reason.is_none());
        let campaign = get_campaign(&h.pool, "camp-1").await.unwrap().unwrap();
        assert_eq!(campaign.current_amount, 92_500);
    }

    #[tokio::test]
    async fn payment_failure_marks_donation_and_session_failed() {
        let h = harness(false).await;
        deliver(
            &h.processor,
            &webhook_body("evt_9", "payment.failed", payment_resource("pay_x", Some("src_1"))),
        )
        .await
        .unwrap();

        let donation = store::get_donation(&h.pool, &h.donation.id).await.unwrap().unwrap();
        assert_eq!(donation.status, DonationStatus::Failed);
        assert_eq!(
            donation.failure_reason.as_deref(),
            Some("Payment declined (generic_decline)")
        );
        let session = store::latest_session_for_donation(&h.pool, &h.donation.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.status, SessionStatus::Failed);
    }

    #[tokio::test]
    async fn declined_charge_records_failure_and_still_acknowledges() {
        let h = harness_on(
            memory_pool().await.unwrap(),
            MockGateway::failing_charges(GatewayError {
                status: Some(400),
                code: Some("insufficient_funds".into()),
                detail: "Insufficient funds".into(),
            }),
            false,
        )
        .await;

        let outcome = deliver(
            &h.processor,
            &webhook_body("evt_1", "source.chargeable", source_resource("src_1", 100_000)),
        )
        .await
        .unwrap();
        let WebhookOutcome::Processed { ledger_id, note } = outcome else {
            panic!("expected processed");
        };
        assert!(note.unwrap().starts_with("charge failed"));

        let donation = store::get_donation(&h.pool, &h.donation.id).await.unwrap().unwrap();
        assert_eq!(donation.status, DonationStatus::Failed);
        assert!(donation.failure_reason.unwrap().contains("Insufficient funds"));
        let campaign = get_campaign(&h.pool, "camp-1").await.unwrap().unwrap();
        assert_eq!(campaign.current_amount, 0);

        let row = h.processor.ledger().get(ledger_id).await.unwrap().unwrap();
        assert!(row.processed);
        assert!(row.error_message.unwrap().contains("Insufficient funds"));
    }

    #[tokio::test]
    async fn unknown_source_is_marked_processed_with_error() {
        let h = harness(false).await;
        let outcome = deliver(
            &h.processor,
            &webhook_body("evt_1", "source.chargeable", source_resource("src_gone", 100_000)),
        )
        .await
        .unwrap();
        let WebhookOutcome::Processed { ledger_id, note } = outcome else {
            panic!("expected processed");
        };
        assert_eq!(note.as_deref(), Some("no payment session for source src_gone"));
        assert_eq!(h.gateway.charge_count(), 0);
        let row = h.processor.ledger().get(ledger_id).await.unwrap().unwrap();
        assert!(row.processed);
    }

    #[tokio::test]
    async fn unhandled_type_is_acknowledged() {
        let h = harness(false).await;
        let outcome = deliver(
            &h.processor,
            &webhook_body("evt_1", "checkout_session.payment.paid", serde_json::json!({})),
        )
        .await
        .unwrap();
        assert!(matches!(
            outcome,
            WebhookOutcome::Processed { note: Some(ref n), .. } if n.contains("unhandled")
        ));
    }

    #[tokio::test]
    async fn bad_signature_is_rejected_without_ledger_row() {
        let h = harness(false).await;
        let body = webhook_body("evt_1", "source.chargeable", source_resource("src_1", 100_000));
        let forged = sign("not-the-secret", body.as_bytes());

        let err = h.processor.handle(body.as_bytes(), Some(&forged)).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidSignature));
        assert!(matches!(
            h.processor.handle(body.as_bytes(), None).await,
            Err(EngineError::InvalidSignature)
        ));

        assert_eq!(ledger_rows(&h.pool).await, 0);
        assert_eq!(h.gateway.charge_count(), 0);
    }

    #[tokio::test]
    async fn missing_secret_fails_open_unless_required() {
        let pool = memory_pool().await.unwrap();
        let mut config = Config::for_tests();
        config.webhook_secret = None;
        let body = webhook_body("evt_1", "payment.paid", payment_resource("pay_1", None));

        let open = processor_with(
            &pool,
            &config,
            Arc::new(MockGateway::default()),
            Arc::new(SqliteCampaignLedger::new(pool.clone())),
        );
        assert!(open.handle(body.as_bytes(), None).await.is_ok());

        config.webhook_require_signature = true;
        let closed = processor_with(
            &pool,
            &config,
            Arc::new(MockGateway::default()),
            Arc::new(SqliteCampaignLedger::new(pool.clone())),
        );
        let other = webhook_body("evt_2", "payment.paid", payment_resource("pay_1", None));
        assert!(matches!(
            closed.handle(other.as_bytes(), None).await,
            Err(EngineError::InvalidSignature)
        ));
        assert_eq!(ledger_rows(&pool).await, 1);
    }

    #[tokio::test]
    async fn malformed_body_fails_before_ledger() {
        let h = harness(false).await;
        let err = deliver(&h.processor, "{\"nope\":true}").await.unwrap_err();
        assert!(matches!(err, EngineError::MalformedPayload(_)));
        assert_eq!(ledger_rows(&h.pool).await, 0);
    }

    #[tokio::test]
    async fn payment_paid_completes_pending_donation_via_source() {
        let h = harness(false).await;
        let mut resource = payment_resource("pay_card_1", Some("src_1"));
        resource["attributes"]["status"] = "paid".into();
        deliver(&h.processor, &webhook_body("evt_1", "payment.paid", resource))
            .await
            .unwrap();

        let donation = store::find_donation_by_payment_id(&h.pool, "pay_card_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(donation.id, h.donation.id);
        assert_eq!(donation.status, DonationStatus::Completed);
        let campaign = get_campaign(&h.pool, "camp-1").await.unwrap().unwrap();
        assert_eq!(campaign.current_amount, 92_500);

        // The chargeable notification arriving afterwards must not charge again.
        deliver(
            &h.processor,
            &webhook_body("evt_2", "source.chargeable", source_resource("src_1", 100_000)),
        )
        .await
        .unwrap();
        assert_eq!(h.gateway.charge_count(), 0);
        let campaign = get_campaign(&h.pool, "camp-1").await.unwrap().unwrap();
        assert_eq!(campaign.current_amount, 92_500);
    }

    struct BrokenCampaigns;

    #[async_trait]
    impl CampaignLedger for BrokenCampaigns {
        async fn increment(&self, _credit: CampaignCredit<'_>) -> Result<()> {
            Err(EngineError::Config("disk I/O error".into()))
        }

        async fn decrement(&self, _credit: CampaignCredit<'_>) -> Result<()> {
            Err(EngineError::Config("disk I/O error".into()))
        }
    }

    #[tokio::test]
    async fn campaign_failure_keeps_donation_completed_and_is_noted() {
        let pool = memory_pool().await.unwrap();
        seed_campaign(&pool, "camp-1", "charity-1").await;
        let donation = seed_pending_donation(&pool, "camp-1", "donor-a", 100_000).await;
        open_session(&pool, &donation, "src_1", calculate(100_000, 0, false, FeeRates::default())).await;
        let processor = processor_with(
            &pool,
            &Config::for_tests(),
            Arc::new(MockGateway::default()),
            Arc::new(BrokenCampaigns),
        );

        let outcome = deliver(
            &processor,
            &webhook_body("evt_1", "source.chargeable", source_resource("src_1", 100_000)),
        )
        .await
        .unwrap();
        let WebhookOutcome::Processed { ledger_id, note } = outcome else {
            panic!("expected processed");
        };
        assert!(note.unwrap().starts_with("campaign increment failed"));

        let stored = store::get_donation(&pool, &donation.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DonationStatus::Completed);
        let row = processor.ledger().get(ledger_id).await.unwrap().unwrap();
        assert!(row.processed);
    }

    #[tokio::test]
    async fn replay_refuses_processed_events() {
        let h = harness(false).await;
        let WebhookOutcome::Processed { ledger_id, .. } = deliver(
            &h.processor,
            &webhook_body("evt_1", "source.chargeable", source_resource("src_1", 100_000)),
        )
        .await
        .unwrap() else {
            panic!("expected processed");
        };
        assert!(matches!(
            h.processor.replay(ledger_id).await,
            Err(EngineError::BusinessRule(_))
        ));
    }

    #[tokio::test]
    async fn replay_reapplies_an_errored_event() {
        let h = harness(false).await;
        let body = webhook_body("evt_1", "source.chargeable", source_resource("src_1", 100_000));
        let RecordOutcome::Recorded(ledger_id) = h
            .processor
            .ledger()
            .record(NewWebhookEvent {
                provider: "paymongo",
                event_id: "evt_1",
                event_type: "source.chargeable",
                payload: &body,
            })
            .await
            .unwrap()
        else {
            panic!("expected recorded");
        };
        h.processor
            .ledger()
            .mark_failed(ledger_id, "database is locked")
            .await
            .unwrap();

        assert_eq!(h.processor.replay(ledger_id).await.unwrap(), None);
        let donation = store::get_donation(&h.pool, &h.donation.id).await.unwrap().unwrap();
        assert_eq!(donation.status, DonationStatus::Completed);
        let row = h.processor.ledger().get(ledger_id).await.unwrap().unwrap();
        assert!(row.processed);
        assert_eq!(row.retry_count, 1);
        assert!(row.error_message.is_none());
    }

    #[tokio::test]
    async fn concurrent_duplicate_deliveries_apply_once() {
        let (pool, _guard) = file_pool().await;
        let h = Arc::new(harness_on(pool, MockGateway::default(), false).await);
        let body = webhook_body("evt_1", "source.chargeable", source_resource("src_1", 100_000));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let h = h.clone();
            let body = body.clone();
            handles.push(tokio::spawn(async move { deliver(&h.processor, &body).await }));
        }
        let mut processed = 0;
        for handle in handles {
            if matches!(handle.await.unwrap().unwrap(), WebhookOutcome::Processed { .. }) {
                processed += 1;
            }
        }

        assert_eq!(processed, 1);
        assert_eq!(h.gateway.charge_count(), 1);
        let campaign = get_campaign(&h.pool, "camp-1").await.unwrap().unwrap();
        assert_eq!(campaign.current_amount, 92_500);
    }

    #[tokio::test]
    async fn replay_after_post_charge_error_settles_without_recharging() {
        let h = harness(false).await;
        // Another donation already holds the payment id, so completing this one fails.
        let other = seed_pending_donation(&h.pool, "camp-1", "donor-b", 100_000).await;
        sqlx::query("UPDATE donations SET provider_payment_id = 'pay_src_1' WHERE id = ?1")
            .bind(&other.id)
            .execute(&h.pool)
            .await
            .unwrap();

        let body = webhook_body("evt_1", "source.chargeable", source_resource("src_1", 100_000));
        let WebhookOutcome::Processed { ledger_id, note } = deliver(&h.processor, &body).await.unwrap() else {
            panic!("expected processed");
        };
        assert!(note.unwrap().contains("UNIQUE"));
        assert_eq!(h.gateway.charge_count(), 1);
        let row = h.processor.ledger().get(ledger_id).await.unwrap().unwrap();
        assert!(!row.processed);

        let session = store::latest_session_for_donation(&h.pool, &h.donation.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.status, SessionStatus::Processing);
        assert_eq!(session.provider_payment_id.as_deref(), Some("pay_src_1"));

        sqlx::query("UPDATE donations SET provider_payment_id = NULL WHERE id = ?1")
            .bind(&other.id)
            .execute(&h.pool)
            .await
            .unwrap();
        assert_eq!(h.processor.replay(ledger_id).await.unwrap(), None);

        assert_eq!(h.gateway.charge_count(), 1);
        let donation = store::get_donation(&h.pool, &h.donation.id).await.unwrap().unwrap();
        assert_eq!(donation.status, DonationStatus::Completed);
        assert_eq!(donation.provider_payment_id.as_deref(), Some("pay_src_1"));
        let campaign = get_campaign(&h.pool, "camp-1").await.unwrap().unwrap();
        assert_eq!(campaign.current_amount, 92_500);
        assert!(h.processor.ledger().get(ledger_id).await.unwrap().unwrap().processed);
    }

    #[tokio::test]
    async fn pending_charge_waits_for_payment_paid() {
        let gateway = MockGateway::default();
        *gateway.payment_status.lock().unwrap() = Some("pending".to_string());
        let h = harness_on(memory_pool().await.unwrap(), gateway, false).await;

        let outcome = deliver(
            &h.processor,
            &webhook_body("evt_1", "source.chargeable", source_resource("src_1", 100_000)),
        )
        .await
        .unwrap();
        let WebhookOutcome::Processed { note, .. } = outcome else {
            panic!("expected processed");
        };
        assert!(note.unwrap().contains("awaiting settlement"));
        let donation = store::get_donation(&h.pool, &h.donation.id).await.unwrap().unwrap();
        assert_eq!(donation.status, DonationStatus::Pending);

        // A second chargeable notification neither charges nor settles.
        deliver(
            &h.processor,
            &webhook_body("evt_2", "source.chargeable", source_resource("src_1", 100_000)),
        )
        .await
        .unwrap();
        assert_eq!(h.gateway.charge_count(), 1);
        let campaign = get_campaign(&h.pool, "camp-1").await.unwrap().unwrap();
        assert_eq!(campaign.current_amount, 0);

        // Settlement arrives without a source reference; the session's payment id finds it.
        let mut resource = payment_resource("pay_src_1", None);
        resource["attributes"]["status"] = "paid".into();
        deliver(&h.processor, &webhook_body("evt_3", "payment.paid", resource))
            .await
            .unwrap();

        let donation = store::get_donation(&h.pool, &h.donation.id).await.unwrap().unwrap();
        assert_eq!(donation.status, DonationStatus::Completed);
        let session = store::latest_session_for_donation(&h.pool, &h.donation.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.status, SessionStatus::Succeeded);
        let campaign = get_campaign(&h.pool, "camp-1").await.unwrap().unwrap();
        assert_eq!(campaign.current_amount, 92_500);
    }

    #[tokio::test]
    async fn distinct_chargeable_events_for_one_source_charge_once() {
        let (pool, _guard) = file_pool().await;
        let h = Arc::new(harness_on(pool, MockGateway::default(), false).await);

        let mut handles = Vec::new();
        for i in 0..8 {
            let h = h.clone();
            let body = webhook_body(&format!("evt_{i}"), "source.chargeable", source_resource("src_1", 100_000));
            handles.push(tokio::spawn(async move { deliver(&h.processor, &body).await }));
        }
        for handle in handles {
            assert!(matches!(
                handle.await.unwrap().unwrap(),
                WebhookOutcome::Processed { .. }
            ));
        }

        assert_eq!(h.gateway.charge_count(), 1);
        let donation = store::get_donation(&h.pool, &h.donation.id).await.unwrap().unwrap();
        assert_eq!(donation.status, DonationStatus::Completed);
        let campaign = get_campaign(&h.pool, "camp-1").await.unwrap().unwrap();
        assert_eq!(campaign.current_amount, 92_500);
        assert_eq!(campaign.donor_count, 1);
    }
}
