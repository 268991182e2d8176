//! Payment provider client — creates chargeable sources and charges them.
//!
//! The engine only depends on [`PaymentGateway`]; [`HttpGateway`] speaks the
//! provider's JSON:API-style REST interface. Calls are never retried here:
//! a charge is not idempotent, and the provider's own redirect and webhook
//! redelivery cover transient failures.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::errors::GatewayError;

pub const CURRENCY: &str = "PHP";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSource {
    pub amount: i64,
    /// Provider source type, e.g. `gcash` or `grab_pay`.
    pub source_type: String,
    pub success_url: String,
    pub failed_url: String,
    pub metadata: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub id: String,
    pub status: String,
    pub checkout_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeSource {
    pub source_id: String,
    pub amount: i64,
    pub description: String,
}

pub const PAYMENT_PAID: &str = "paid";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payment {
    pub id: String,
    pub status: String,
}

impl Payment {
    /// Only a `paid` payment settles a donation; `pending` waits for `payment.paid`.
    pub fn is_paid(&self) -> bool {
        self.status == PAYMENT_PAID
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_source(&self, request: &CreateSource) -> Result<Source, GatewayError>;

    async fn charge_source(&self, request: &ChargeSource) -> Result<Payment, GatewayError>;
}

// ─────────────────────────────────────────────────────────
// Response shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ResourceResponse {
    data: Resource,
}

#[derive(Debug, Deserialize)]
struct Resource {
    id: String,
    #[serde(default)]
    attributes: Value,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    errors: Vec<ProviderErrorItem>,
}

#[derive(Debug, Deserialize)]
struct ProviderErrorItem {
    code: Option<String>,
    detail: Option<String>,
}

// ─────────────────────────────────────────────────────────
// HTTP client
// ─────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct HttpGateway {
    client: Client,
    base_url: String,
    secret_key: String,
}

impl HttpGateway {
    pub fn new(base_url: &str, secret_key: &str, timeout: Duration) -> reqwest::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            secret_key: secret_key.to_string(),
        })
    }

    async fn post(&self, path: &str, body: Value) -> Result<Resource, GatewayError> {
        let url = format!("{}/{path}", self.base_url);
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.secret_key, Some(""))
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::new(format!("request to {path} failed: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| GatewayError::new(format!("reading {path} response failed: {e}")))?;

        if !status.is_success() {
            warn!(%status, path, "Payment provider rejected request");
            return Err(decode_error(status.as_u16(), &text));
        }

        let parsed: ResourceResponse = serde_json::from_str(&text)
            .map_err(|e| GatewayError::new(format!("unexpected {path} response: {e}")))?;
        debug!(path, id = %parsed.data.id, "Payment provider call succeeded");
        Ok(parsed.data)
    }
}

#[async_trait]
impl PaymentGateway for HttpGateway {
    async fn create_source(&self, request: &CreateSource) -> Result<Source, GatewayError> {
        let body = json!({
            "data": {
                "attributes": {
                    "amount": request.amount,
                    "currency": CURRENCY,
                    "type": request.source_type,
                    "redirect": {
                        "success": request.success_url,
                        "failed": request.failed_url,
                    },
                    "metadata": request.metadata,
                }
            }
        });
        let resource = self.post("sources", body).await?;
        Ok(decode_source(resource))
    }

    async fn charge_source(&self, request: &ChargeSource) -> Result<Payment, GatewayError> {
        let body = json!({
            "data": {
                "attributes": {
                    "amount": request.amount,
                    "currency": CURRENCY,
                    "description": request.description,
                    "source": { "id": request.source_id, "type": "source" },
                }
            }
        });
        let resource = self.post("payments", body).await?;
        decode_payment(resource)
    }
}

// ─────────────────────────────────────────────────────────
// Decoding
// ─────────────────────────────────────────────────────────

fn decode_source(resource: Resource) -> Source {
    Source {
        status: str_field(&resource.attributes, "status").unwrap_or_else(|| "pending".to_string()),
        checkout_url: resource
            .attributes
            .get("redirect")
            .and_then(|r| r.get("checkout_url"))
            .and_then(Value::as_str)
            .map(String::from),
        id: resource.id,
    }
}

/// A 2xx response may still describe a failed payment. Anything else,
/// including `pending`, is returned for the caller to check with
/// [`Payment::is_paid`].
fn decode_payment(resource: Resource) -> Result<Payment, GatewayError> {
    let status = str_field(&resource.attributes, "status").unwrap_or_else(|| "pending".to_string());
    if status == "failed" {
        return Err(GatewayError {
            status: None,
            code: str_field(&resource.attributes, "failed_code"),
            detail: str_field(&resource.attributes, "failed_message")
                .unwrap_or_else(|| "payment failed".to_string()),
        });
    }
    Ok(Payment {
        id: resource.id,
        status,
    })
}

fn decode_error(status: u16, body: &str) -> GatewayError {
    let first = serde_json::from_str::<ErrorResponse>(body)
        .ok()
        .and_then(|r| r.errors.into_iter().next());
    match first {
        Some(item) => GatewayError {
            status: Some(status),
            code: item.code,
            detail: item
                .detail
                .unwrap_or_else(|| format!("provider returned HTTP {status}")),
        },
        None => GatewayError {
            status: Some(status),
            code: None,
            detail: format!("provider returned HTTP {status}"),
        },
    }
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(String::from)
}
