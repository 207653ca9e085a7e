use crate::config::STRIPE_API_BASE;
use crate::http::build_client;
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("STRIPE_SECRET_KEY is not set")]
    MissingCredentials,
    #[error("{0}")]
    Api(String),
    #[error("stripe request failed: {0}")]
    Request(String),
    #[error("invalid stripe response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Payment,
    Subscription,
}

impl SessionMode {
    fn as_str(&self) -> &'static str {
        match self {
            SessionMode::Payment => "payment",
            SessionMode::Subscription => "subscription",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSessionRequest {
    pub mode: SessionMode,
    pub customer_id: String,
    pub client_reference_id: String,
    pub product_name: String,
    pub unit_amount_cents: i64,
    pub currency: String,
    /// Stripe `recurring.interval`, only for subscriptions.
    pub interval: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub success_url: String,
    pub cancel_url: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CreatedSession {
    pub id: String,
    #[serde(default)]
    pub url: Option<String>,
}

/// The payment-provider operations the billing flow depends on.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Customer keyed by our user id, falling back to an email match, created when absent.
    async fn find_or_create_customer(
        &self,
        user_id: Uuid,
        email: &str,
    ) -> Result<String, ProviderError>;

    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> Result<CreatedSession, ProviderError>;

    async fn customer_email(&self, customer_id: &str) -> Result<Option<String>, ProviderError>;
}

pub struct StripeClient {
    http: Client,
    secret_key: String,
    api_base: String,
}

#[derive(Deserialize)]
struct CustomerList {
    #[serde(default)]
    data: Vec<Customer>,
}

#[derive(Deserialize)]
struct Customer {
    id: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    deleted: bool,
}

#[derive(Deserialize)]
struct StripeErrorBody {
    error: StripeErrorDetail,
}

#[derive(Deserialize)]
struct StripeErrorDetail {
    #[serde(default)]
    message: Option<String>,
}

impl StripeClient {
    pub fn from_env() -> Self {
        Self::new(
            std::env::var("STRIPE_SECRET_KEY").unwrap_or_default(),
            STRIPE_API_BASE.as_str(),
        )
    }

    pub fn new(secret_key: impl Into<String>, api_base: impl Into<String>) -> Self {
        Self {
            http: build_client(),
            secret_key: secret_key.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{path}", self.api_base)
    }

    fn key(&self) -> Result<&str, ProviderError> {
        if self.secret_key.trim().is_empty() {
            Err(ProviderError::MissingCredentials)
        } else {
            Ok(&self.secret_key)
        }
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, ProviderError> {
        let response = self
            .http
            .get(self.url(path))
            .bearer_auth(self.key()?)
            .query(query)
            .send()
            .await
            .map_err(|err| ProviderError::Request(err.to_string()))?;
        decode(response).await
    }

    async fn post_form<T: DeserializeOwned>(
        &self,
        path: &str,
        form: &[(String, String)],
    ) -> Result<T, ProviderError> {
        let response = self
            .http
            .post(self.url(path))
            .bearer_auth(self.key()?)
            .header("Idempotency-Key", Uuid::new_v4().to_string())
            .form(form)
            .send()
            .await
            .map_err(|err| ProviderError::Request(err.to_string()))?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ProviderError> {
    let status = response.status();
    if !status.is_success() {
        let message = response
            .json::<StripeErrorBody>()
            .await
            .ok()
            .and_then(|body| body.error.message)
            .unwrap_or_else(|| format!("HTTP {status}"));
        return Err(ProviderError::Api(message));
    }
    response
        .json()
        .await
        .map_err(|err| ProviderError::InvalidResponse(err.to_string()))
}

/// Form body for `POST /v1/checkout/sessions`.
pub fn checkout_form(request: &CheckoutSessionRequest) -> Vec<(String, String)> {
    let mut form: Vec<(String, String)> = vec![
        ("mode".into(), request.mode.as_str().into()),
        ("customer".into(), request.customer_id.clone()),
        ("client_reference_id".into(), request.client_reference_id.clone()),
        ("success_url".into(), request.success_url.clone()),
        ("cancel_url".into(), request.cancel_url.clone()),
        ("line_items[0][quantity]".into(), "1".into()),
        (
            "line_items[0][price_data][currency]".into(),
            request.currency.clone(),
        ),
        (
            "line_items[0][price_data][unit_amount]".into(),
            request.unit_amount_cents.to_string(),
        ),
        (
            "line_items[0][price_data][product_data][name]".into(),
            request.product_name.clone(),
        ),
    ];
    if let Some(interval) = &request.interval {
        form.push((
            "line_items[0][price_data][recurring][interval]".into(),
            interval.clone(),
        ));
    }
    for (key, value) in &request.metadata {
        form.push((format!("metadata[{key}]"), value.clone()));
        if request.mode == SessionMode::Subscription {
            form.push((format!("subscription_data[metadata][{key}]"), value.clone()));
        }
    }
    form
}

#[async_trait]
impl PaymentProvider for StripeClient {
    async fn find_or_create_customer(
        &self,
        user_id: Uuid,
        email: &str,
    ) -> Result<String, ProviderError> {
        let query = format!("metadata['userId']:'{user_id}'");
        let by_user: CustomerList = self
            .get("customers/search", &[("query", query.as_str()), ("limit", "1")])
            .await?;
        if let Some(customer) = by_user.data.into_iter().find(|c| !c.deleted) {
            return Ok(customer.id);
        }

        let by_email: CustomerList = self
            .get("customers", &[("email", email), ("limit", "1")])
            .await?;
        if let Some(customer) = by_email.data.into_iter().find(|c| !c.deleted) {
            return Ok(customer.id);
        }

        let created: Customer = self
            .post_form(
                "customers",
                &[
                    ("email".into(), email.to_string()),
                    ("metadata[userId]".into(), user_id.to_string()),
                ],
            )
            .await?;
        info!(
            target = "pixelift.checkout",
            user_id = %user_id,
            customer = %created.id,
            "stripe customer created"
        );
        Ok(created.id)
    }

    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> Result<CreatedSession, ProviderError> {
        self.post_form("checkout/sessions", &checkout_form(request))
            .await
    }

    async fn customer_email(&self, customer_id: &str) -> Result<Option<String>, ProviderError> {
        let customer: Customer = self.get(&format!("customers/{customer_id}"), &[]).await?;
        Ok(customer.email.filter(|_| !customer.deleted))
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-process provider that records every call.
    #[derive(Default)]
    pub struct FakeProvider {
        pub customer_emails: HashMap<String, String>,
        pub fail_with: Option<String>,
        pub customer_calls: Mutex<Vec<(Uuid, String)>>,
        pub sessions: Mutex<Vec<CheckoutSessionRequest>>,
    }

    impl FakeProvider {
        pub fn with_customer(mut self, customer_id: &str, email: &str) -> Self {
            self.customer_emails
                .insert(customer_id.to_string(), email.to_string());
            self
        }

        pub fn session_count(&self) -> usize {
            self.sessions.lock().map(|s| s.len()).unwrap_or_default()
        }
    }

    #[async_trait]
    impl PaymentProvider for FakeProvider {
        async fn find_or_create_customer(
            &self,
            user_id: Uuid,
            email: &str,
        ) -> Result<String, ProviderError> {
            self.customer_calls
                .lock()
                .expect("lock")
                .push((user_id, email.to_string()));
            Ok(format!("cus_{}", user_id.simple()))
        }

        async fn create_checkout_session(
            &self,
            request: &CheckoutSessionRequest,
        ) -> Result<CreatedSession, ProviderError> {
            if let Some(message) = &self.fail_with {
                return Err(ProviderError::Api(message.clone()));
            }
            let mut sessions = self.sessions.lock().expect("lock");
            sessions.push(request.clone());
            let id = format!("cs_test_{}", sessions.len());
            Ok(CreatedSession {
                url: Some(format!("https://checkout.stripe.com/c/pay/{id}")),
                id,
            })
        }

        async fn customer_email(
            &self,
            customer_id: &str,
        ) -> Result<Option<String>, ProviderError> {
            Ok(self.customer_emails.get(customer_id).cloned())
        }
    }
}
