//! Typed views over the Stripe event objects the billing flow consumes.
//!
//! Only the fields that drive credit and role changes are modelled; the rest
//! of each object is ignored.

use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Deserialize)]
pub struct StripeEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: Value,
}

#[derive(Debug, Clone)]
pub enum WebhookEvent {
    CheckoutCompleted(CheckoutSession),
    InvoicePaid(Invoice),
    InvoicePaymentFailed(Invoice),
    SubscriptionUpdated(Subscription),
    SubscriptionDeleted(Subscription),
    Unhandled(String),
}

impl StripeEvent {
    pub fn classify(&self) -> Result<WebhookEvent, serde_json::Error> {
        let object = || self.data.object.clone();
        Ok(match self.event_type.as_str() {
            "checkout.session.completed" => {
                WebhookEvent::CheckoutCompleted(serde_json::from_value(object())?)
            }
            "invoice.payment_succeeded" | "invoice.paid" => {
                WebhookEvent::InvoicePaid(serde_json::from_value(object())?)
            }
            "invoice.payment_failed" => {
                WebhookEvent::InvoicePaymentFailed(serde_json::from_value(object())?)
            }
            "customer.subscription.updated" => {
                WebhookEvent::SubscriptionUpdated(serde_json::from_value(object())?)
            }
            "customer.subscription.deleted" => {
                WebhookEvent::SubscriptionDeleted(serde_json::from_value(object())?)
            }
            other => WebhookEvent::Unhandled(other.to_string()),
        })
    }
}

/// Accepts either an id string or an expanded object carrying an `id`.
fn expandable_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(id)) => Some(id),
        Some(Value::Object(map)) => map.get("id").and_then(Value::as_str).map(str::to_string),
        _ => None,
    })
}

pub type Metadata = HashMap<String, String>;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CustomerDetails {
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    #[serde(default, deserialize_with = "expandable_id")]
    pub customer: Option<String>,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub customer_details: Option<CustomerDetails>,
    #[serde(default)]
    pub amount_total: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionDetails {
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvoiceParent {
    #[serde(default)]
    pub subscription_details: Option<SubscriptionDetails>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvoiceLine {
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvoiceLines {
    #[serde(default)]
    pub data: Vec<InvoiceLine>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Invoice {
    pub id: String,
    #[serde(default, deserialize_with = "expandable_id")]
    pub customer: Option<String>,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub amount_paid: i64,
    #[serde(default)]
    pub amount_due: i64,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub billing_reason: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub subscription_details: Option<SubscriptionDetails>,
    #[serde(default)]
    pub parent: Option<InvoiceParent>,
    #[serde(default)]
    pub lines: InvoiceLines,
}

impl Invoice {
    /// First non-empty metadata among the subscription details (old and new
    /// API shapes), the invoice itself and its first line item.
    pub fn effective_metadata(&self) -> Metadata {
        let candidates = [
            self.subscription_details.as_ref().map(|d| &d.metadata),
            self.parent
                .as_ref()
                .and_then(|p| p.subscription_details.as_ref())
                .map(|d| &d.metadata),
            Some(&self.metadata),
            self.lines.data.first().map(|line| &line.metadata),
        ];
        candidates
            .into_iter()
            .flatten()
            .find(|metadata| !metadata.is_empty())
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_subscription_creation(&self) -> bool {
        self.billing_reason.as_deref() == Some("subscription_create")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Subscription {
    pub id: String,
    #[serde(default, deserialize_with = "expandable_id")]
    pub customer: Option<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurchaseKind {
    OneTime,
    Subscription,
}

/// The billing fields this service writes into checkout metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BillingMetadata {
    pub kind: Option<PurchaseKind>,
    pub credits: i64,
    pub plan_id: Option<String>,
    pub package_id: Option<String>,
    pub billing_period: Option<String>,
    pub email: Option<String>,
    pub user_id: Option<String>,
}

impl BillingMetadata {
    pub fn from_metadata(metadata: &Metadata) -> Self {
        let get = |key: &str| {
            metadata
                .get(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let kind = match get("type").as_deref() {
            Some("onetime") => Some(PurchaseKind::OneTime),
            Some("subscription") => Some(PurchaseKind::Subscription),
            _ => None,
        };
        Self {
            kind,
            credits: get("credits")
                .and_then(|value| value.parse::<i64>().ok())
                .filter(|credits| *credits > 0)
                .unwrap_or(0),
            plan_id: get("planId"),
            package_id: get("packageId"),
            billing_period: get("billingPeriod"),
            email: get("email"),
            user_id: get("userId"),
        }
    }
}
