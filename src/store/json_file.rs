use super::{BillingStore, Ledger, LinkOutcome, StoreError};
use crate::models::{CreditGrant, NewTransaction, Referral, ReferralAction, Transaction, User};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

/// Flat-file fallback used when no database is configured.
///
/// The whole ledger lives in one JSON document. Each mutation is applied to a
/// copy, written to `<path>.tmp` and renamed over the original; the in-memory
/// state only advances once the write has landed.
pub struct JsonFileStore {
    path: PathBuf,
    ledger: Mutex<Ledger>,
}

impl JsonFileStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let ledger = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ledger::default(),
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|err| StoreError::Serialization(err.to_string()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ledger::default(),
            Err(err) => return Err(StoreError::Io(err.to_string())),
        };
        info!(
            target = "pixelift.store",
            path = %path.display(),
            users = ledger.users.len(),
            transactions = ledger.transactions.len(),
            "json store opened"
        );
        Ok(Self {
            path,
            ledger: Mutex::new(ledger),
        })
    }

    async fn mutate<T>(
        &self,
        change: impl FnOnce(&mut Ledger) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.ledger.lock().await;
        let mut next = guard.clone();
        let out = change(&mut next)?;
        persist(&self.path, &next).await?;
        *guard = next;
        Ok(out)
    }
}

async fn persist(path: &Path, ledger: &Ledger) -> Result<(), StoreError> {
    let bytes =
        serde_json::to_vec_pretty(ledger).map_err(|err| StoreError::Serialization(err.to_string()))?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| StoreError::Io(err.to_string()))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|err| StoreError::Io(err.to_string()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|err| StoreError::Io(err.to_string()))
}

#[async_trait]
impl BillingStore for JsonFileStore {
    async fn find_user(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.ledger.lock().await.user(id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        Ok(self.ledger.lock().await.user_by_email(email).cloned())
    }

    async fn apply_grant(&self, user_id: Uuid, grant: CreditGrant) -> Result<User, StoreError> {
        self.mutate(|ledger| ledger.apply_grant(user_id, grant)).await
    }

    async fn record_transaction(&self, tx: NewTransaction) -> Result<Transaction, StoreError> {
        self.mutate(|ledger| Ok(ledger.push_transaction(tx))).await
    }

    async fn list_transactions(&self, user_id: Uuid) -> Result<Vec<Transaction>, StoreError> {
        Ok(self.ledger.lock().await.transactions_for(user_id))
    }

    async fn ensure_referral(&self, user_id: Uuid) -> Result<Referral, StoreError> {
        // Avoid rewriting the file when the referral already exists.
        if let Some(existing) = self
            .ledger
            .lock()
            .await
            .referrals
            .iter()
            .find(|r| r.user_id == user_id)
        {
            return Ok(existing.clone());
        }
        let (referral, _) = self.mutate(|ledger| ledger.ensure_referral(user_id)).await?;
        Ok(referral)
    }

    async fn record_referral(
        &self,
        code: &str,
        action: ReferralAction,
    ) -> Result<Option<Referral>, StoreError> {
        if !self.ledger.lock().await.referrals.iter().any(|r| r.code == code) {
            return Ok(None);
        }
        self.mutate(|ledger| Ok(ledger.record_referral(code, action)))
            .await
    }

    async fn link_referrer(&self, user_id: Uuid, code: &str) -> Result<LinkOutcome, StoreError> {
        self.mutate(|ledger| ledger.link_referrer(user_id, code)).await
    }
}
