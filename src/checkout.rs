//! Stripe Checkout session creation for plan subscriptions and credit packages.

use crate::catalog::{self, BillingPeriod, PackageDefinition, PlanDefinition};
use crate::config::{cancel_url, success_url};
use crate::error::AppError;
use crate::security::AuthSession;
use crate::stripe::{
    CheckoutSessionRequest, CreatedSession, PaymentProvider, ProviderError, SessionMode,
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, time::Instant};
use tracing::{error, info};

const CURRENCY: &str = "usd";
const FALLBACK_ERROR: &str = "Failed to create checkout session";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub plan_id: Option<String>,
    #[serde(default)]
    pub package_id: Option<String>,
    #[serde(default)]
    pub billing_period: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutResponse {
    pub session_id: String,
    pub url: Option<String>,
}

/// A validated purchase.
#[derive(Debug, Clone, Copy)]
pub enum Selection {
    Plan(&'static PlanDefinition, BillingPeriod),
    Package(&'static PackageDefinition),
}

impl Selection {
    fn kind(&self) -> &'static str {
        match self {
            Selection::Plan(..) => "subscription",
            Selection::Package(_) => "onetime",
        }
    }
}

/// Checks the body against the catalog. Runs before any provider call.
pub fn validate(request: &CheckoutRequest) -> Result<Selection, AppError> {
    match request.kind.as_deref() {
        Some("subscription") => {
            let plan = request
                .plan_id
                .as_deref()
                .and_then(catalog::find_plan)
                .ok_or(AppError::BadRequest("Invalid plan"))?;
            let period = match request.billing_period.as_deref() {
                None => BillingPeriod::default(),
                Some(raw) => {
                    BillingPeriod::parse(raw).ok_or(AppError::BadRequest("Invalid billing period"))?
                }
            };
            Ok(Selection::Plan(plan, period))
        }
        Some("onetime") => request
            .package_id
            .as_deref()
            .and_then(catalog::find_package)
            .map(Selection::Package)
            .ok_or(AppError::BadRequest("Invalid package")),
        _ => Err(AppError::BadRequest("Invalid checkout type")),
    }
}

fn session_request(
    selection: Selection,
    session: &AuthSession,
    customer_id: String,
    app_url: &str,
) -> CheckoutSessionRequest {
    let mut metadata = BTreeMap::new();
    metadata.insert("type".to_string(), selection.kind().to_string());
    metadata.insert("userId".to_string(), session.user_id.to_string());
    metadata.insert("email".to_string(), session.email.clone());

    let (mode, product_name, unit_amount_cents, interval) = match selection {
        Selection::Plan(plan, period) => {
            metadata.insert("credits".to_string(), plan.credits.to_string());
            metadata.insert("planId".to_string(), plan.id.to_string());
            metadata.insert("billingPeriod".to_string(), period.as_str().to_string());
            (
                SessionMode::Subscription,
                format!("Pixelift {} ({})", plan.name, period.as_str()),
                plan.price_cents(period),
                Some(period.interval().to_string()),
            )
        }
        Selection::Package(package) => {
            metadata.insert("credits".to_string(), package.credits.to_string());
            metadata.insert("packageId".to_string(), package.id.to_string());
            (
                SessionMode::Payment,
                format!("Pixelift {}", package.name),
                package.price_cents,
                None,
            )
        }
    };

    CheckoutSessionRequest {
        mode,
        customer_id,
        client_reference_id: session.user_id.to_string(),
        product_name,
        unit_amount_cents,
        currency: CURRENCY.to_string(),
        interval,
        metadata,
        success_url: success_url(app_url),
        cancel_url: cancel_url(app_url),
    }
}

async fn open_session(
    provider: &dyn PaymentProvider,
    selection: Selection,
    session: &AuthSession,
    app_url: &str,
) -> Result<CreatedSession, ProviderError> {
    let customer_id = provider
        .find_or_create_customer(session.user_id, &session.email)
        .await?;
    let request = session_request(selection, session, customer_id, app_url);
    provider.create_checkout_session(&request).await
}

pub async fn create_session(
    provider: &dyn PaymentProvider,
    session: &AuthSession,
    request: &CheckoutRequest,
    app_url: &str,
) -> Result<CheckoutResponse, AppError> {
    let started = Instant::now();
    let selection = validate(request)?;

    match open_session(provider, selection, session, app_url).await {
        Ok(created) => {
            info!(
                target = "pixelift.checkout",
                user_id = %session.user_id,
                kind = selection.kind(),
                session_id = %created.id,
                "checkout session created"
            );
            crate::metrics::checkout_created(selection.kind(), started.elapsed().as_millis());
            Ok(CheckoutResponse {
                session_id: created.id,
                url: created.url,
            })
        }
        Err(err) => {
            error!(
                target = "pixelift.checkout",
                user_id = %session.user_id,
                error = %err,
                "checkout session failed"
            );
            let message = err.to_string();
            Err(AppError::Internal(if message.trim().is_empty() {
                FALLBACK_ERROR.to_string()
            } else {
                message
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stripe::client::testing::FakeProvider;
    use uuid::Uuid;

    fn session() -> AuthSession {
        AuthSession {
            user_id: Uuid::new_v4(),
            email: "buyer@pixelift.ai".into(),
        }
    }

    fn body(kind: &str) -> CheckoutRequest {
        CheckoutRequest {
            kind: Some(kind.into()),
            ..Default::default()
        }
    }

    #[test]
    fn rejects_unknown_type_plan_period_and_package() {
        let bad = |request: CheckoutRequest| match validate(&request) {
            Err(AppError::BadRequest(message)) => message,
            other => panic!("expected 400, got {other:?}"),
        };
        assert_eq!(bad(body("lifetime")), "Invalid checkout type");
        assert_eq!(bad(CheckoutRequest::default()), "Invalid checkout type");

        let mut sub = body("subscription");
        sub.plan_id = Some("enterprise".into());
        assert_eq!(bad(sub.clone()), "Invalid plan");
        sub.plan_id = Some("pro".into());
        sub.billing_period = Some("weekly".into());
        assert_eq!(bad(sub), "Invalid billing period");

        let mut once = body("onetime");
        assert_eq!(bad(once.clone()), "Invalid package");
        once.package_id = Some("credits_42".into());
        assert_eq!(bad(once), "Invalid package");
    }

    #[test]
    fn billing_period_defaults_to_monthly() {
        let mut request = body("subscription");
        request.plan_id = Some("starter".into());
        let Selection::Plan(plan, period) = validate(&request).expect("valid") else {
            panic!("expected plan");
        };
        assert_eq!(plan.id, "starter");
        assert_eq!(period, BillingPeriod::Monthly);
    }

    #[tokio::test]
    async fn invalid_request_never_reaches_provider() {
        let provider = FakeProvider::default();
        let mut request = body("onetime");
        request.package_id = Some("credits_9999".into());
        let err = create_session(&provider, &session(), &request, "https://pixelift.ai")
            .await
            .expect_err("invalid package");
        assert!(matches!(err, AppError::BadRequest("Invalid package")));
        assert_eq!(provider.session_count(), 0);
        assert!(provider.customer_calls.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn yearly_subscription_session_carries_metadata() {
        let provider = FakeProvider::default();
        let session = session();
        let mut request = body("subscription");
        request.plan_id = Some("pro".into());
        request.billing_period = Some("yearly".into());

        let response = create_session(&provider, &session, &request, "https://pixelift.ai")
            .await
            .expect("session");
        assert_eq!(response.session_id, "cs_test_1");
        assert!(response.url.is_some());

        let sent = provider.sessions.lock().expect("lock");
        let sent = &sent[0];
        assert_eq!(sent.mode, SessionMode::Subscription);
        assert_eq!(sent.unit_amount_cents, 29_000);
        assert_eq!(sent.interval.as_deref(), Some("year"));
        assert_eq!(sent.customer_id, format!("cus_{}", session.user_id.simple()));
        assert_eq!(sent.metadata["type"], "subscription");
        assert_eq!(sent.metadata["planId"], "pro");
        assert_eq!(sent.metadata["credits"], "1000");
        assert_eq!(sent.metadata["billingPeriod"], "yearly");
        assert_eq!(sent.metadata["userId"], session.user_id.to_string());
        assert_eq!(
            sent.success_url,
            "https://pixelift.ai/dashboard?session_id={CHECKOUT_SESSION_ID}&success=true"
        );
        assert_eq!(sent.cancel_url, "https://pixelift.ai/pricing?canceled=true");
    }

    #[tokio::test]
    async fn package_session_is_a_one_time_payment() {
        let provider = FakeProvider::default();
        let mut request = body("onetime");
        request.package_id = Some("credits_500".into());
        create_session(&provider, &session(), &request, "http://localhost:3000")
            .await
            .expect("session");

        let sent = provider.sessions.lock().expect("lock");
        assert_eq!(sent[0].mode, SessionMode::Payment);
        assert_eq!(sent[0].unit_amount_cents, 4_900);
        assert_eq!(sent[0].interval, None);
        assert_eq!(sent[0].metadata["packageId"], "credits_500");
        assert_eq!(sent[0].metadata["credits"], "500");
        assert!(!sent[0].metadata.contains_key("billingPeriod"));
    }

    #[tokio::test]
    async fn provider_failures_surface_their_message() {
        let provider = FakeProvider {
            fail_with: Some("Your card was declined".into()),
            ..Default::default()
        };
        let mut request = body("onetime");
        request.package_id = Some("credits_100".into());
        let err = create_session(&provider, &session(), &request, "http://localhost:3000")
            .await
            .expect_err("provider failure");
        assert!(matches!(err, AppError::Internal(ref m) if m == "Your card was declined"));

        let blank = FakeProvider {
            fail_with: Some(" ".into()),
            ..Default::default()
        };
        let err = create_session(&blank, &session(), &request, "http://localhost:3000")
            .await
            .expect_err("provider failure");
        assert!(matches!(err, AppError::Internal(ref m) if m == FALLBACK_ERROR));
    }
}
