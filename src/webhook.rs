//! Stripe webhook processing: signature check, de-duplication and the
//! credit/role/transaction effects of each billing event.
//!
//! A failure up to and including the credit grant releases the event id so
//! Stripe's retry is processed. Failures in the follow-up writes (transaction
//! row, referral conversion, email) are logged and the delivery is
//! acknowledged, so a retry never grants twice.

use crate::catalog;
use crate::idempotency::ProcessedEvents;
use crate::models::{
    CreditGrant, NewTransaction, ReferralAction, Role, TransactionKind, TransactionStatus, User,
};
use crate::notify::{MailQueue, Notification};
use crate::store::{BillingStore, StoreError};
use crate::stripe::event::{CheckoutSession, Invoice, Subscription};
use crate::stripe::signature::{self, DEFAULT_TOLERANCE_SECS};
use crate::stripe::{
    BillingMetadata, PaymentProvider, ProviderError, PurchaseKind, SignatureError, StripeEvent,
    WebhookEvent,
};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// Effects were applied; the label names what happened.
    Processed(&'static str),
    Duplicate,
    /// Nothing to do: unknown type, unknown user or a status we do not act on.
    Ignored(&'static str),
}

impl IntoResponse for WebhookOutcome {
    fn into_response(self) -> Response {
        match self {
            WebhookOutcome::Duplicate => {
                Json(json!({ "received": true, "duplicate": true })).into_response()
            }
            _ => Json(json!({ "received": true })).into_response(),
        }
    }
}

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("missing stripe-signature header")]
    MissingSignature,
    #[error("invalid signature: {0}")]
    InvalidSignature(#[from] SignatureError),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            WebhookError::MissingSignature => (StatusCode::BAD_REQUEST, "Missing signature"),
            WebhookError::InvalidSignature(_) => (StatusCode::BAD_REQUEST, "Invalid signature"),
            WebhookError::InvalidPayload(_) => (StatusCode::BAD_REQUEST, "Invalid payload"),
            WebhookError::Store(_) | WebhookError::Provider(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Webhook handler failed")
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[derive(Clone)]
pub struct WebhookHandler {
    store: Arc<dyn BillingStore>,
    provider: Arc<dyn PaymentProvider>,
    mail: MailQueue,
    events: ProcessedEvents,
    secret: String,
    tolerance_secs: i64,
}

/// Everything one billing event does to a user.
struct Settlement {
    event_id: String,
    object_id: String,
    user: User,
    grant: CreditGrant,
    transaction: Option<NewTransaction>,
    conversion_cents: Option<i64>,
    notification: Option<Notification>,
    action: &'static str,
}

impl WebhookHandler {
    pub fn new(
        store: Arc<dyn BillingStore>,
        provider: Arc<dyn PaymentProvider>,
        mail: MailQueue,
        events: ProcessedEvents,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            store,
            provider,
            mail,
            events,
            secret: secret.into(),
            tolerance_secs: DEFAULT_TOLERANCE_SECS,
        }
    }

    /// Verifies, de-duplicates and applies one delivery. Nothing is written
    /// before the signature has been checked.
    pub async fn handle(
        &self,
        signature_header: Option<&str>,
        payload: &[u8],
        now: i64,
    ) -> Result<WebhookOutcome, WebhookError> {
        let header = signature_header
            .map(str::trim)
            .filter(|header| !header.is_empty())
            .ok_or(WebhookError::MissingSignature)?;
        signature::verify(payload, header, &self.secret, now, self.tolerance_secs)?;

        let event: StripeEvent = serde_json::from_slice(payload)
            .map_err(|err| WebhookError::InvalidPayload(err.to_string()))?;
        let parsed = event
            .classify()
            .map_err(|err| WebhookError::InvalidPayload(err.to_string()))?;
        if let WebhookEvent::Unhandled(kind) = &parsed {
            debug!(target = "pixelift.webhook", event_type = %kind, "unhandled event type");
            crate::metrics::webhook_event(kind, "ignored");
            return Ok(WebhookOutcome::Ignored("unhandled_type"));
        }

        if !self.events.claim(&event.id).await {
            info!(target = "pixelift.webhook", event_id = %event.id, "duplicate delivery");
            crate::metrics::webhook_event(&event.event_type, "duplicate");
            return Ok(WebhookOutcome::Duplicate);
        }

        match self.dispatch(&event.id, parsed).await {
            Ok(outcome) => {
                let label = match &outcome {
                    WebhookOutcome::Processed(action) | WebhookOutcome::Ignored(action) => *action,
                    WebhookOutcome::Duplicate => "duplicate",
                };
                info!(
                    target = "pixelift.webhook",
                    event_id = %event.id,
                    event_type = %event.event_type,
                    outcome = label,
                    "webhook handled"
                );
                crate::metrics::webhook_event(&event.event_type, label);
                Ok(outcome)
            }
            Err(err) => {
                error!(
                    target = "pixelift.webhook",
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %err,
                    "webhook handler failed"
                );
                self.events.release(&event.id).await;
                crate::metrics::webhook_event(&event.event_type, "failed");
                Err(err)
            }
        }
    }

    async fn dispatch(
        &self,
        event_id: &str,
        event: WebhookEvent,
    ) -> Result<WebhookOutcome, WebhookError> {
        match event {
            WebhookEvent::CheckoutCompleted(session) => self.checkout_completed(event_id, session).await,
            WebhookEvent::InvoicePaid(invoice) => self.invoice_paid(event_id, invoice).await,
            WebhookEvent::InvoicePaymentFailed(invoice) => {
                self.invoice_failed(event_id, invoice).await
            }
            WebhookEvent::SubscriptionUpdated(subscription) => {
                self.subscription_updated(event_id, subscription).await
            }
            WebhookEvent::SubscriptionDeleted(subscription) => {
                self.subscription_deleted(event_id, subscription).await
            }
            WebhookEvent::Unhandled(_) => Ok(WebhookOutcome::Ignored("unhandled_type")),
        }
    }

    async fn checkout_completed(
        &self,
        event_id: &str,
        session: CheckoutSession,
    ) -> Result<WebhookOutcome, WebhookError> {
        let meta = BillingMetadata::from_metadata(&session.metadata);
        let Some(kind) = meta.kind else {
            return Ok(WebhookOutcome::Ignored("not_a_billing_checkout"));
        };
        let email = session
            .customer_details
            .as_ref()
            .and_then(|details| details.email.clone())
            .or_else(|| session.customer_email.clone());
        let Some(user) = self
            .resolve_user(email, &meta, session.customer.as_deref())
            .await?
        else {
            return Ok(WebhookOutcome::Ignored("unknown_user"));
        };

        let amount_cents = session.amount_total.unwrap_or_default();
        let currency = currency(session.currency.as_deref());
        let settlement = match kind {
            PurchaseKind::OneTime => {
                one_time(event_id, &session.id, user, &meta, amount_cents, currency)
            }
            PurchaseKind::Subscription => {
                let credits = plan_credits(&meta);
                let plan = plan_name(&meta);
                Settlement {
                    event_id: event_id.to_string(),
                    object_id: session.id.clone(),
                    grant: CreditGrant::credits(credits).with_role(Role::Premium),
                    transaction: Some(transaction(
                        &user,
                        TransactionKind::Subscription,
                        TransactionStatus::Completed,
                        amount_cents,
                        currency,
                        credits,
                        &meta,
                    )),
                    user,
                    conversion_cents: Some(amount_cents),
                    notification: Some(Notification::SubscriptionActivated { plan, credits }),
                    action: "subscription_started",
                }
            }
        };
        self.settle(settlement).await
    }

    async fn invoice_paid(
        &self,
        event_id: &str,
        invoice: Invoice,
    ) -> Result<WebhookOutcome, WebhookError> {
        let meta = BillingMetadata::from_metadata(&invoice.effective_metadata());
        let Some(kind) = meta.kind else {
            return Ok(WebhookOutcome::Ignored("not_a_billing_invoice"));
        };
        let Some(user) = self
            .resolve_user(
                invoice.customer_email.clone(),
                &meta,
                invoice.customer.as_deref(),
            )
            .await?
        else {
            return Ok(WebhookOutcome::Ignored("unknown_user"));
        };
        let currency = currency(invoice.currency.as_deref());

        let settlement = match kind {
            PurchaseKind::OneTime => one_time(
                event_id,
                &invoice.id,
                user,
                &meta,
                invoice.amount_paid,
                currency,
            ),
            // The checkout event already granted the first period.
            PurchaseKind::Subscription if invoice.is_subscription_creation() => Settlement {
                event_id: event_id.to_string(),
                object_id: invoice.id.clone(),
                user,
                grant: CreditGrant::role(Role::Premium),
                transaction: None,
                conversion_cents: None,
                notification: None,
                action: "subscription_confirmed",
            },
            PurchaseKind::Subscription => {
                let credits = plan_credits(&meta);
                let plan = plan_name(&meta);
                Settlement {
                    event_id: event_id.to_string(),
                    object_id: invoice.id.clone(),
                    grant: CreditGrant::credits(credits).with_role(Role::Premium),
                    transaction: Some(transaction(
                        &user,
                        TransactionKind::Subscription,
                        TransactionStatus::Completed,
                        invoice.amount_paid,
                        currency,
                        credits,
                        &meta,
                    )),
                    user,
                    conversion_cents: Some(invoice.amount_paid),
                    notification: Some(Notification::SubscriptionRenewed { plan, credits }),
                    action: "subscription_renewed",
                }
            }
        };
        self.settle(settlement).await
    }

    async fn invoice_failed(
        &self,
        event_id: &str,
        invoice: Invoice,
    ) -> Result<WebhookOutcome, WebhookError> {
        let meta = BillingMetadata::from_metadata(&invoice.effective_metadata());
        let Some(user) = self
            .resolve_user(
                invoice.customer_email.clone(),
                &meta,
                invoice.customer.as_deref(),
            )
            .await?
        else {
            return Ok(WebhookOutcome::Ignored("unknown_user"));
        };
        let kind = match meta.kind {
            Some(PurchaseKind::OneTime) => TransactionKind::Purchase,
            _ => TransactionKind::Subscription,
        };
        let settlement = Settlement {
            event_id: event_id.to_string(),
            object_id: invoice.id.clone(),
            transaction: Some(transaction(
                &user,
                kind,
                TransactionStatus::Failed,
                invoice.amount_due,
                currency(invoice.currency.as_deref()),
                0,
                &meta,
            )),
            user,
            grant: CreditGrant::default(),
            conversion_cents: None,
            notification: Some(Notification::PaymentFailed {
                amount_cents: invoice.amount_due,
            }),
            action: "payment_failed",
        };
        self.settle(settlement).await
    }

    async fn subscription_updated(
        &self,
        event_id: &str,
        subscription: Subscription,
    ) -> Result<WebhookOutcome, WebhookError> {
        let (role, action) = match subscription.status.as_str() {
            "active" => (Role::Premium, "subscription_active"),
            "canceled" => (Role::User, "subscription_canceled"),
            _ => return Ok(WebhookOutcome::Ignored("status_unchanged")),
        };
        let Some(user) = self.subscription_user(&subscription).await? else {
            return Ok(WebhookOutcome::Ignored("unknown_user"));
        };
        self.settle(role_change(event_id, &subscription, user, role, None, action))
            .await
    }

    async fn subscription_deleted(
        &self,
        event_id: &str,
        subscription: Subscription,
    ) -> Result<WebhookOutcome, WebhookError> {
        let Some(user) = self.subscription_user(&subscription).await? else {
            return Ok(WebhookOutcome::Ignored("unknown_user"));
        };
        self.settle(role_change(
            event_id,
            &subscription,
            user,
            Role::User,
            Some(Notification::SubscriptionCanceled),
            "subscription_deleted",
        ))
        .await
    }

    async fn subscription_user(
        &self,
        subscription: &Subscription,
    ) -> Result<Option<User>, WebhookError> {
        let meta = BillingMetadata::from_metadata(&subscription.metadata);
        self.resolve_user(None, &meta, subscription.customer.as_deref())
            .await
    }

    /// Looks the user up by the `userId` written at checkout, falling back to
    /// the first email available on the object, then metadata, then the
    /// provider's customer record.
    async fn resolve_user(
        &self,
        email: Option<String>,
        meta: &BillingMetadata,
        customer_id: Option<&str>,
    ) -> Result<Option<User>, WebhookError> {
        let user_id = meta
            .user_id
            .as_deref()
            .and_then(|id| Uuid::parse_str(id.trim()).ok());
        if let Some(user_id) = user_id {
            if let Some(user) = self.store.find_user(user_id).await? {
                return Ok(Some(user));
            }
            debug!(target = "pixelift.webhook", user_id = %user_id, "metadata user id not found");
        }
        let mut email = email
            .filter(|email| !email.trim().is_empty())
            .or_else(|| meta.email.clone());
        if email.is_none() {
            if let Some(customer_id) = customer_id {
                email = self.provider.customer_email(customer_id).await?;
            }
        }
        let Some(email) = email else {
            warn!(target = "pixelift.webhook", "event carries no customer email");
            return Ok(None);
        };
        let user = self.store.find_user_by_email(email.trim()).await?;
        if user.is_none() {
            warn!(target = "pixelift.webhook", email = %email, "no user for event email");
        }
        Ok(user)
    }

    async fn settle(&self, settlement: Settlement) -> Result<WebhookOutcome, WebhookError> {
        let Settlement {
            event_id,
            object_id,
            user,
            grant,
            transaction,
            conversion_cents,
            notification,
            action,
        } = settlement;

        let mut applied = false;
        if grant != CreditGrant::default() {
            let updated = self.store.apply_grant(user.id, grant).await?;
            applied = true;
            if grant.credits > 0 {
                crate::metrics::credits_granted(grant.credits);
            }
            info!(
                target = "pixelift.webhook",
                event_id = %event_id,
                user_id = %updated.id,
                credits = updated.credits,
                role = updated.role.as_str(),
                "account updated"
            );
        }

        if let Some(mut transaction) = transaction {
            transaction.stripe_event_id = event_id.clone();
            transaction.stripe_object_id = Some(object_id.clone());
            match self.store.record_transaction(transaction).await {
                Ok(_) => {}
                Err(err) if !applied => return Err(err.into()),
                Err(err) => error!(
                    target = "pixelift.webhook",
                    event_id = %event_id,
                    object_id = %object_id,
                    error = %err,
                    "transaction record failed after account update"
                ),
            }
        }

        if let (Some(amount_cents), Some(code)) = (conversion_cents, user.referred_by.as_deref()) {
            match self
                .store
                .record_referral(code, ReferralAction::Conversion { amount_cents })
                .await
            {
                Ok(Some(_)) => debug!(target = "pixelift.webhook", code = %code, "referral conversion"),
                Ok(None) => warn!(target = "pixelift.webhook", code = %code, "referrer code not found"),
                Err(err) => error!(
                    target = "pixelift.webhook",
                    code = %code,
                    error = %err,
                    "referral conversion failed"
                ),
            }
        }

        if let Some(notification) = notification {
            if let Err(err) = self.mail.enqueue(&user.email, &notification) {
                warn!(target = "pixelift.webhook", error = %err, "email not queued");
            }
        }

        Ok(WebhookOutcome::Processed(action))
    }
}

fn one_time(
    event_id: &str,
    object_id: &str,
    user: User,
    meta: &BillingMetadata,
    amount_cents: i64,
    currency: String,
) -> Settlement {
    let credits = package_credits(meta);
    Settlement {
        event_id: event_id.to_string(),
        object_id: object_id.to_string(),
        grant: CreditGrant::credits(credits),
        transaction: Some(transaction(
            &user,
            TransactionKind::Purchase,
            TransactionStatus::Completed,
            amount_cents,
            currency,
            credits,
            meta,
        )),
        user,
        conversion_cents: Some(amount_cents),
        notification: Some(Notification::PurchaseConfirmed {
            credits,
            amount_cents,
        }),
        action: "credits_purchased",
    }
}

fn role_change(
    event_id: &str,
    subscription: &Subscription,
    user: User,
    role: Role,
    notification: Option<Notification>,
    action: &'static str,
) -> Settlement {
    Settlement {
        event_id: event_id.to_string(),
        object_id: subscription.id.clone(),
        user,
        grant: CreditGrant::role(role),
        transaction: None,
        conversion_cents: None,
        notification,
        action,
    }
}

fn transaction(
    user: &User,
    kind: TransactionKind,
    status: TransactionStatus,
    amount_cents: i64,
    currency: String,
    credits: i64,
    meta: &BillingMetadata,
) -> NewTransaction {
    NewTransaction {
        user_id: user.id,
        kind,
        amount_cents,
        currency,
        status,
        credits,
        plan_id: meta.plan_id.clone(),
        package_id: meta.package_id.clone(),
        billing_period: meta.billing_period.clone(),
        stripe_event_id: String::new(),
        stripe_object_id: None,
    }
}

/// `metadata.credits`, else the catalog entry the metadata names.
fn package_credits(meta: &BillingMetadata) -> i64 {
    if meta.credits > 0 {
        return meta.credits;
    }
    meta.package_id
        .as_deref()
        .and_then(catalog::find_package)
        .map(|package| package.credits)
        .unwrap_or(0)
}

fn plan_credits(meta: &BillingMetadata) -> i64 {
    if meta.credits > 0 {
        return meta.credits;
    }
    meta.plan_id
        .as_deref()
        .and_then(catalog::find_plan)
        .map(|plan| plan.credits)
        .unwrap_or(0)
}

fn plan_name(meta: &BillingMetadata) -> String {
    meta.plan_id
        .as_deref()
        .map(|id| catalog::find_plan(id).map(|plan| plan.name).unwrap_or(id))
        .unwrap_or("Premium")
        .to_string()
}

fn currency(raw: Option<&str>) -> String {
    raw.map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("usd")
        .to_ascii_lowercase()
}
