//! Donation payment reconciliation and milestone fund disbursement.
//!
//! Provider webhooks settle donations and credit campaigns; admin approval
//! of milestone proofs releases funds to charities. The binary in `main.rs`
//! serves [`build_router`] over a SQLite pool.

pub mod api;
pub mod campaign;
pub mod charity;
pub mod checkout;
pub mod config;
pub mod db;
pub mod errors;
pub mod events;
pub mod fees;
pub mod gateway;
pub mod ledger;
pub mod models;
pub mod notify;
pub mod reconcile;
pub mod refund;
pub mod release;
pub mod settings;
pub mod signature;
pub mod store;
pub mod webhook;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use axum::{
    routing::{get, post, put},
    Router,
};

use api::AppState;

/// Every route, without transport layers.
pub fn build_router(state: Arc<AppState>) -> Router {
    let admin = Router::new()
        .route("/webhook-events", get(api::list_webhook_events))
        .route("/webhook-events/:id/replay", post(api::replay_webhook_event))
        .route("/proofs/:id/review", post(api::review_proof))
        .route("/donations/:id/refund", post(api::refund_donation))
        .route("/reconciliation", get(api::reconciliation_report))
        .route("/reconciliation/repair", post(api::reconciliation_repair))
        .route("/settings/:key", put(api::update_setting));

    Router::new()
        .route("/health", get(api::health))
        .route("/webhooks/payments", post(api::receive_webhook))
        .route("/donations", post(api::create_donation))
        .route("/donations/:id", get(api::get_donation))
        .route("/donations/:id/checkout", post(api::create_checkout))
        .route("/campaigns/:id", get(api::get_campaign))
        .route("/milestones/:id/proofs", post(api::submit_proof))
        .nest("/admin", admin)
        .with_state(state)
}
