use crate::config::env_u64;
use crate::http::build_client;
use async_trait::async_trait;
use rand::Rng;
use reqwest::Client;
use serde_json::json;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tracing::{error, info, warn};

const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum MailError {
    #[error("mail request failed: {0}")]
    Request(String),
    #[error("mail queue closed")]
    QueueClosed,
    #[error("mail queue full")]
    QueueFull,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    PurchaseConfirmed { credits: i64, amount_cents: i64 },
    SubscriptionActivated { plan: String, credits: i64 },
    SubscriptionRenewed { plan: String, credits: i64 },
    PaymentFailed { amount_cents: i64 },
    SubscriptionCanceled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email {
    pub to: String,
    pub subject: String,
    pub text: String,
}

fn dollars(cents: i64) -> String {
    format!("${}.{:02}", cents / 100, (cents % 100).abs())
}

impl Notification {
    pub fn render(&self, to: &str) -> Email {
        let (subject, text) = match self {
            Notification::PurchaseConfirmed {
                credits,
                amount_cents,
            } => (
                "Your Pixelift credits are ready".to_string(),
                format!(
                    "Thanks for your purchase of {credits} credits ({}). They are available in your dashboard now.",
                    dollars(*amount_cents)
                ),
            ),
            Notification::SubscriptionActivated { plan, credits } => (
                format!("Welcome to Pixelift {plan}"),
                format!(
                    "Your {plan} subscription is active. {credits} credits have been added to your account."
                ),
            ),
            Notification::SubscriptionRenewed { plan, credits } => (
                "Your Pixelift subscription renewed".to_string(),
                format!("Your {plan} plan renewed and {credits} credits were added."),
            ),
            Notification::PaymentFailed { amount_cents } => (
                "Payment failed".to_string(),
                format!(
                    "We could not collect your payment of {}. Please update your payment method to keep your plan.",
                    dollars(*amount_cents)
                ),
            ),
            Notification::SubscriptionCanceled => (
                "Your Pixelift subscription was canceled".to_string(),
                "Your subscription has ended. Purchased credits stay in your account.".to_string(),
            ),
        };
        Email {
            to: to.to_string(),
            subject,
            text,
        }
    }
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, email: &Email) -> Result<(), MailError>;
}

/// Writes emails to the log instead of delivering them.
pub struct LogMailer;

#[async_trait]
impl EmailSender for LogMailer {
    async fn send(&self, email: &Email) -> Result<(), MailError> {
        info!(
            target = "pixelift.mail",
            to = %email.to,
            subject = %email.subject,
            "email (log only)"
        );
        Ok(())
    }
}

pub struct ResendMailer {
    http: Client,
    api_key: String,
    from: String,
}

impl ResendMailer {
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("RESEND_API_KEY").ok()?;
        let from = std::env::var("EMAIL_FROM")
            .unwrap_or_else(|_| "Pixelift <billing@pixelift.ai>".to_string());
        Some(Self {
            http: build_client(),
            api_key,
            from,
        })
    }
}

#[async_trait]
impl EmailSender for ResendMailer {
    async fn send(&self, email: &Email) -> Result<(), MailError> {
        let response = self
            .http
            .post("https://api.resend.com/emails")
            .bearer_auth(&self.api_key)
            .json(&json!({
                "from": self.from,
                "to": [email.to],
                "subject": email.subject,
                "text": email.text,
            }))
            .send()
            .await
            .map_err(|err| MailError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(MailError::Request(format!("HTTP {}", response.status())));
        }
        Ok(())
    }
}

pub fn sender_from_env() -> Arc<dyn EmailSender> {
    match ResendMailer::from_env() {
        Some(mailer) => Arc::new(mailer),
        None => {
            warn!(
                target = "pixelift.mail",
                "RESEND_API_KEY not set; emails will only be logged"
            );
            Arc::new(LogMailer)
        }
    }
}

/// Background delivery so a slow mail provider never delays a webhook response.
#[derive(Clone)]
pub struct MailQueue {
    tx: mpsc::Sender<Email>,
}

impl MailQueue {
    pub fn spawn(sender: Arc<dyn EmailSender>) -> (Self, JoinHandle<()>) {
        let capacity = env_u64("MAIL_QUEUE_CAPACITY", 256) as usize;
        Self::spawn_with(sender, capacity, Duration::from_millis(500))
    }

    fn spawn_with(
        sender: Arc<dyn EmailSender>,
        capacity: usize,
        base_backoff: Duration,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Email>(capacity);
        let handle = tokio::spawn(async move {
            while let Some(email) = rx.recv().await {
                deliver(sender.as_ref(), &email, base_backoff).await;
            }
        });
        (Self { tx }, handle)
    }

    /// Never waits: a full queue drops the email and reports `QueueFull`.
    pub fn enqueue(&self, to: &str, notification: &Notification) -> Result<(), MailError> {
        self.tx
            .try_send(notification.render(to))
            .map_err(|err| match err {
                TrySendError::Full(_) => MailError::QueueFull,
                TrySendError::Closed(_) => MailError::QueueClosed,
            })
    }
}

async fn deliver(sender: &dyn EmailSender, email: &Email, base_backoff: Duration) {
    for attempt in 1..=MAX_ATTEMPTS {
        match sender.send(email).await {
            Ok(()) => return,
            Err(err) if attempt < MAX_ATTEMPTS => {
                let jitter = rand::rng().random_range(0..=base_backoff.as_millis() as u64);
                let delay = base_backoff * attempt + Duration::from_millis(jitter);
                warn!(
                    target = "pixelift.mail",
                    attempt,
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "email delivery failed; retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => error!(
                target = "pixelift.mail",
                to = %email.to,
                error = %err,
                "email delivery gave up"
            ),
        }
    }
}
