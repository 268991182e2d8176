//! Typed payment-provider webhook events.
//!
//! The raw body is decoded in two steps: the [`WebhookEnvelope`] gives the
//! event id and type needed by the ledger, then [`ProviderEvent::decode`]
//! turns the event-specific resource into one of a closed set of variants.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{EngineError, Result};

/// All recognised provider event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// The payer authorised a source; it can now be charged.
    SourceChargeable,
    /// A payment settled.
    PaymentPaid,
    /// A payment was declined or errored.
    PaymentFailed,
    /// Any other event type.
    Unhandled,
}

impl EventKind {
    /// Parse the provider's type string. Both `source.chargeable` and
    /// `source_chargeable` spellings are accepted.
    pub fn from_type(event_type: &str) -> Self {
        match event_type {
            "source.chargeable" | "source_chargeable" => Self::SourceChargeable,
            "payment.paid" | "payment_paid" => Self::PaymentPaid,
            "payment.failed" | "payment_failed" => Self::PaymentFailed,
            _ => Self::Unhandled,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SourceChargeable => "source_chargeable",
            Self::PaymentPaid => "payment_paid",
            Self::PaymentFailed => "payment_failed",
            Self::Unhandled => "unhandled",
        }
    }
}

// ─────────────────────────────────────────────────────────
// Wire envelope
// ─────────────────────────────────────────────────────────

/// `{ data: { id, attributes: { type, data } } }`
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEnvelope {
    pub data: EnvelopeData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnvelopeData {
    pub id: String,
    pub attributes: EnvelopeAttributes,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnvelopeAttributes {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
}

impl WebhookEnvelope {
    pub fn from_bytes(body: &[u8]) -> Result<Self> {
        let envelope: Self = serde_json::from_slice(body)
            .map_err(|e| EngineError::MalformedPayload(e.to_string()))?;
        if envelope.data.id.trim().is_empty() {
            return Err(EngineError::MalformedPayload("empty event id".to_string()));
        }
        Ok(envelope)
    }

    pub fn event_id(&self) -> &str {
        &self.data.id
    }

    pub fn event_type(&self) -> &str {
        &self.data.attributes.event_type
    }
}

// ─────────────────────────────────────────────────────────
// Typed events
// ─────────────────────────────────────────────────────────

/// A chargeable source, referenced by the provider source id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeableSource {
    pub source_id: String,
    pub amount: Option<i64>,
}

/// A payment resource as carried by `payment.*` events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentNotice {
    pub payment_id: String,
    pub source_id: Option<String>,
    pub amount: Option<i64>,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
}

impl PaymentNotice {
    /// Human-readable failure reason for `payment.failed`.
    pub fn failure_reason(&self) -> String {
        match (&self.failure_code, &self.failure_message) {
            (Some(code), Some(msg)) => format!("{msg} ({code})"),
            (None, Some(msg)) => msg.clone(),
            (Some(code), None) => code.clone(),
            (None, None) => "payment failed".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    SourceChargeable(ChargeableSource),
    PaymentPaid(PaymentNotice),
    PaymentFailed(PaymentNotice),
    Unhandled { event_type: String },
}

impl ProviderEvent {
    /// Validate the event-specific resource and convert it to a typed variant.
    pub fn decode(event_type: &str, resource: &Value) -> Result<Self> {
        match EventKind::from_type(event_type) {
            EventKind::SourceChargeable => Ok(Self::SourceChargeable(ChargeableSource {
                source_id: required_id(resource, "source")?,
                amount: attribute(resource, "amount").and_then(Value::as_i64),
            })),
            EventKind::PaymentPaid => Ok(Self::PaymentPaid(decode_payment(resource)?)),
            EventKind::PaymentFailed => Ok(Self::PaymentFailed(decode_payment(resource)?)),
            EventKind::Unhandled => Ok(Self::Unhandled {
                event_type: event_type.to_string(),
            }),
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::SourceChargeable(_) => EventKind::SourceChargeable,
            Self::PaymentPaid(_) => EventKind::PaymentPaid,
            Self::PaymentFailed(_) => EventKind::PaymentFailed,
            Self::Unhandled { .. } => EventKind::Unhandled,
        }
    }
}

fn decode_payment(resource: &Value) -> Result<PaymentNotice> {
    Ok(PaymentNotice {
        payment_id: required_id(resource, "payment")?,
        source_id: attribute(resource, "source")
            .and_then(|s| s.get("id"))
            .and_then(Value::as_str)
            .map(String::from),
        amount: attribute(resource, "amount").and_then(Value::as_i64),
        failure_code: string_attribute(resource, "failed_code"),
        failure_message: string_attribute(resource, "failed_message"),
    })
}

fn required_id(resource: &Value, what: &str) -> Result<String> {
    resource
        .get("id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .ok_or_else(|| EngineError::MalformedPayload(format!("{what} resource has no id")))
}

fn attribute<'a>(resource: &'a Value, key: &str) -> Option<&'a Value> {
    resource.get("attributes").and_then(|a| a.get(key))
}

fn string_attribute(resource: &Value, key: &str) -> Option<String> {
    attribute(resource, key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from)
}
