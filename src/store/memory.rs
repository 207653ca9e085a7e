use super::{BillingStore, Ledger, LinkOutcome, StoreError};
use crate::models::{CreditGrant, NewTransaction, Referral, ReferralAction, Transaction, User};
use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Process-local store. State is lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    ledger: Mutex<Ledger>,
}

impl MemoryStore {
    pub fn with_users(users: Vec<User>) -> Self {
        Self {
            ledger: Mutex::new(Ledger {
                users,
                ..Ledger::default()
            }),
        }
    }
}

#[async_trait]
impl BillingStore for MemoryStore {
    async fn find_user(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.ledger.lock().await.user(id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        Ok(self.ledger.lock().await.user_by_email(email).cloned())
    }

    async fn apply_grant(&self, user_id: Uuid, grant: CreditGrant) -> Result<User, StoreError> {
        self.ledger.lock().await.apply_grant(user_id, grant)
    }

    async fn record_transaction(&self, tx: NewTransaction) -> Result<Transaction, StoreError> {
        Ok(self.ledger.lock().await.push_transaction(tx))
    }

    async fn list_transactions(&self, user_id: Uuid) -> Result<Vec<Transaction>, StoreError> {
        Ok(self.ledger.lock().await.transactions_for(user_id))
    }

    async fn ensure_referral(&self, user_id: Uuid) -> Result<Referral, StoreError> {
        let (referral, _) = self.ledger.lock().await.ensure_referral(user_id)?;
        Ok(referral)
    }

    async fn record_referral(
        &self,
        code: &str,
        action: ReferralAction,
    ) -> Result<Option<Referral>, StoreError> {
        Ok(self.ledger.lock().await.record_referral(code, action))
    }

    async fn link_referrer(&self, user_id: Uuid, code: &str) -> Result<LinkOutcome, StoreError> {
        self.ledger.lock().await.link_referrer(user_id, code)
    }
}
