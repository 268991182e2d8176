//! Shared fixtures for unit tests.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::SqlitePool;

use crate::db::{init_pool, now};
use crate::errors::GatewayError;
use crate::gateway::{ChargeSource, CreateSource, Payment, PaymentGateway, Source};
use crate::models::{Donation, MilestoneProof};
use crate::store::{self, NewDonation, NewProof};

/// Removes the temporary database files on drop.
pub struct TempDb(PathBuf);

impl Drop for TempDb {
    fn drop(&mut self) {
        for suffix in ["", "-wal", "-shm"] {
            let mut path = self.0.clone().into_os_string();
            path.push(suffix);
            let _ = std::fs::remove_file(path);
        }
    }
}

/// A file-backed pool with several connections, for real write contention.
pub async fn file_pool() -> (SqlitePool, TempDb) {
    let path = std::env::temp_dir().join(format!("engine-test-{}.db", uuid::Uuid::new_v4()));
    let pool = init_pool(path.to_str().unwrap()).await.unwrap();
    (pool, TempDb(path))
}

pub async fn seed_charity(pool: &SqlitePool, id: &str) {
    sqlx::query("INSERT OR IGNORE INTO charities (id, name) VALUES (?1, ?2)")
        .bind(id)
        .bind(format!("Charity {id}"))
        .execute(pool)
        .await
        .unwrap();
}

pub async fn seed_campaign(pool: &SqlitePool, id: &str, charity_id: &str) {
    seed_charity(pool, charity_id).await;
    sqlx::query(
        "INSERT INTO campaigns (id, charity_id, title, goal_amount) VALUES (?1, ?2, ?3, 1000000)",
    )
    .bind(id)
    .bind(charity_id)
    .bind(format!("Campaign {id}"))
    .execute(pool)
    .await
    .unwrap();
}

pub async fn seed_pending_donation(pool: &SqlitePool, campaign_id: &str, donor_id: &str, amount: i64) -> Donation {
    store::insert_donation(
        pool,
        &NewDonation {
            donor_id: donor_id.to_string(),
            campaign_id: campaign_id.to_string(),
            amount,
            payment_method: "gcash".to_string(),
        },
    )
    .await
    .unwrap()
}

/// A completed donation row. Does not touch campaign aggregates.
pub async fn seed_completed_donation(pool: &SqlitePool, id: &str, campaign_id: &str, donor_id: &str, net_amount: i64) {
    let ts = now();
    sqlx::query(
        r#"
        INSERT INTO donations
            (id, donor_id, campaign_id, amount, payment_method, status, net_amount,
             platform_fee, total_charge, created_at, updated_at, completed_at)
        VALUES (?1, ?2, ?3, ?4, 'gcash', 'completed', ?4, 0, ?4, ?5, ?5, ?5)
        "#,
    )
    .bind(id)
    .bind(donor_id)
    .bind(campaign_id)
    .bind(net_amount)
    .bind(ts)
    .execute(pool)
    .await
    .unwrap();
}

pub async fn seed_milestone(pool: &SqlitePool, id: &str, campaign_id: &str, target_amount: i64) {
    sqlx::query(
        "INSERT INTO milestones (id, campaign_id, title, target_amount, status) VALUES (?1, ?2, ?3, ?4, 'completed')",
    )
    .bind(id)
    .bind(campaign_id)
    .bind(format!("Milestone {id}"))
    .bind(target_amount)
    .execute(pool)
    .await
    .unwrap();
}

pub async fn seed_proof(pool: &SqlitePool, milestone_id: &str) -> MilestoneProof {
    store::insert_proof(
        pool,
        &NewProof {
            milestone_id: milestone_id.to_string(),
            submitted_by: "charity-user".to_string(),
            description: "Receipts and photos".to_string(),
            evidence_url: Some("https://files.example/proof.pdf".to_string()),
        },
    )
    .await
    .unwrap()
}

/// Webhook body in the provider's envelope shape.
pub fn webhook_body(event_id: &str, event_type: &str, resource: Value) -> String {
    json!({
        "data": {
            "id": event_id,
            "type": "event",
            "attributes": { "type": event_type, "livemode": false, "data": resource }
        }
    })
    .to_string()
}

pub fn source_resource(source_id: &str, amount: i64) -> Value {
    json!({
        "id": source_id,
        "type": "source",
        "attributes": { "amount": amount, "status": "chargeable", "type": "gcash" }
    })
}

pub fn payment_resource(payment_id: &str, source_id: Option<&str>) -> Value {
    json!({
        "id": payment_id,
        "type": "payment",
        "attributes": {
            "amount": 0,
            "status": "failed",
            "failed_code": "generic_decline",
            "failed_message": "Payment declined",
            "source": source_id.map(|id| json!({ "id": id, "type": "gcash" })),
        }
    })
}

/// Records every call; charges succeed unless a failure is scripted.
#[derive(Default)]
pub struct MockGateway {
    pub sources: Mutex<Vec<CreateSource>>,
    pub charges: Mutex<Vec<ChargeSource>>,
    pub charge_failure: Mutex<Option<GatewayError>>,
    pub source_failure: Mutex<Option<GatewayError>>,
    /// Status reported for successful charges; `paid` when unset.
    pub payment_status: Mutex<Option<String>>,
    counter: AtomicU64,
}

impl MockGateway {
    pub fn failing_charges(error: GatewayError) -> Self {
        let gateway = Self::default();
        *gateway.charge_failure.lock().unwrap() = Some(error);
        gateway
    }

    pub fn charge_count(&self) -> usize {
        self.charges.lock().unwrap().len()
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn create_source(&self, request: &CreateSource) -> Result<Source, GatewayError> {
        if let Some(err) = self.source_failure.lock().unwrap().clone() {
            return Err(err);
        }
        self.sources.lock().unwrap().push(request.clone());
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(Source {
            id: format!("src_mock_{n}"),
            status: "pending".to_string(),
            checkout_url: Some(format!("https://pay.example/checkout/src_mock_{n}")),
        })
    }

    async fn charge_source(&self, request: &ChargeSource) -> Result<Payment, GatewayError> {
        self.charges.lock().unwrap().push(request.clone());
        if let Some(err) = self.charge_failure.lock().unwrap().clone() {
            return Err(err);
        }
        let status = self
            .payment_status
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| "paid".to_string());
        Ok(Payment {
            id: format!("pay_{}", request.source_id),
            status,
        })
    }
}
