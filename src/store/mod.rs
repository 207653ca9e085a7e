//! User, transaction and referral persistence.
//!
//! Every backend implements [`BillingStore`]. Credit changes go through
//! [`BillingStore::apply_grant`], which updates credits and role in a single
//! atomic step so concurrent webhook deliveries for one user cannot lose an
//! increment.

mod json_file;
mod memory;
mod supabase;

pub use json_file::JsonFileStore;
pub use memory::MemoryStore;
pub use supabase::SupabaseStore;

use crate::models::{
    CreditGrant, NewTransaction, Referral, ReferralAction, Transaction, User,
};
use async_trait::async_trait;
use chrono::Utc;
use rand::{Rng, distr::Alphanumeric};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("storage io failed: {0}")]
    Io(String),
    #[error("serialization failed: {0}")]
    Serialization(String),
    #[error("request failed: {0}")]
    Request(String),
    /// The backend rejected a write that collides with an existing row.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("unexpected response: {0}")]
    Deserialize(String),
}

/// Result of attaching a signed-up user to a referral code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    Linked(Referral),
    AlreadyLinked,
    SelfReferral,
    UnknownCode,
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn find_user(&self, id: Uuid) -> Result<Option<User>, StoreError>;

    /// Case-insensitive lookup.
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;

    async fn apply_grant(&self, user_id: Uuid, grant: CreditGrant) -> Result<User, StoreError>;

    async fn record_transaction(&self, tx: NewTransaction) -> Result<Transaction, StoreError>;

    /// Newest first.
    async fn list_transactions(&self, user_id: Uuid) -> Result<Vec<Transaction>, StoreError>;

    /// Returns the user's referral record, creating one with a fresh code if needed.
    async fn ensure_referral(&self, user_id: Uuid) -> Result<Referral, StoreError>;

    /// `None` when no referral carries `code`.
    async fn record_referral(
        &self,
        code: &str,
        action: ReferralAction,
    ) -> Result<Option<Referral>, StoreError>;

    async fn link_referrer(&self, user_id: Uuid, code: &str) -> Result<LinkOutcome, StoreError>;
}

/// In-process state shared by the memory and JSON-file backends.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Ledger {
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub transactions: Vec<Transaction>,
    #[serde(default)]
    pub referrals: Vec<Referral>,
}

impl Ledger {
    fn user(&self, id: Uuid) -> Option<&User> {
        self.users.iter().find(|user| user.id == id)
    }

    fn user_by_email(&self, email: &str) -> Option<&User> {
        let email = email.trim();
        self.users
            .iter()
            .find(|user| user.email.eq_ignore_ascii_case(email))
    }

    fn apply_grant(&mut self, user_id: Uuid, grant: CreditGrant) -> Result<User, StoreError> {
        let user = self
            .users
            .iter_mut()
            .find(|user| user.id == user_id)
            .ok_or_else(|| StoreError::NotFound(format!("user {user_id}")))?;
        user.credits = user.credits.saturating_add(grant.credits).max(0);
        if let Some(role) = grant.role {
            user.role = user.resolve_role(role);
        }
        Ok(user.clone())
    }

    fn push_transaction(&mut self, tx: NewTransaction) -> Transaction {
        let tx = tx.into_transaction();
        self.transactions.push(tx.clone());
        tx
    }

    fn transactions_for(&self, user_id: Uuid) -> Vec<Transaction> {
        let mut found: Vec<Transaction> = self
            .transactions
            .iter()
            .filter(|tx| tx.user_id == user_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        found
    }

    /// Returns the referral and whether it was newly created.
    fn ensure_referral(&mut self, user_id: Uuid) -> Result<(Referral, bool), StoreError> {
        if let Some(existing) = self.referrals.iter().find(|r| r.user_id == user_id) {
            return Ok((existing.clone(), false));
        }
        if self.user(user_id).is_none() {
            return Err(StoreError::NotFound(format!("user {user_id}")));
        }
        let mut code = generate_referral_code();
        while self.referrals.iter().any(|r| r.code == code) {
            code = generate_referral_code();
        }
        let referral = Referral {
            user_id,
            code,
            clicks: 0,
            signups: 0,
            conversions: 0,
            commission_cents: 0,
            updated_at: Utc::now(),
        };
        self.referrals.push(referral.clone());
        Ok((referral, true))
    }

    fn record_referral(&mut self, code: &str, action: ReferralAction) -> Option<Referral> {
        let referral = self.referrals.iter_mut().find(|r| r.code == code)?;
        referral.apply(action);
        Some(referral.clone())
    }

    fn link_referrer(&mut self, user_id: Uuid, code: &str) -> Result<LinkOutcome, StoreError> {
        let user = self
            .user(user_id)
            .ok_or_else(|| StoreError::NotFound(format!("user {user_id}")))?;
        if user.referred_by.is_some() {
            return Ok(LinkOutcome::AlreadyLinked);
        }
        let Some(referral) = self.referrals.iter().find(|r| r.code == code) else {
            return Ok(LinkOutcome::UnknownCode);
        };
        if referral.user_id == user_id {
            return Ok(LinkOutcome::SelfReferral);
        }
        if let Some(user) = self.users.iter_mut().find(|user| user.id == user_id) {
            user.referred_by = Some(code.to_string());
        }
        let linked = self
            .record_referral(code, ReferralAction::Signup)
            .ok_or_else(|| StoreError::NotFound(format!("referral {code}")))?;
        Ok(LinkOutcome::Linked(linked))
    }
}

pub fn generate_referral_code() -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(8)
        .map(char::from)
        .collect::<String>()
        .to_ascii_uppercase()
}
