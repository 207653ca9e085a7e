use super::{BillingStore, LinkOutcome, StoreError, generate_referral_code};
use crate::http::build_client;
use crate::models::{CreditGrant, NewTransaction, Referral, ReferralAction, Transaction, User};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;
use urlencoding::encode;
use uuid::Uuid;

/// A first-time insert can race another request for the same user or draw a
/// code that is already taken; both come back as 409.
const REFERRAL_INSERT_ATTEMPTS: usize = 3;

/// Postgres-backed store reached through Supabase's PostgREST API.
///
/// Credit grants and referral counters go through SQL functions
/// (`apply_credit_grant`, `record_referral_action`, `link_referrer`, see
/// `sql/supabase.sql`) so each mutation is a single statement.
#[derive(Clone)]
pub struct SupabaseStore {
    base_url: String,
    service_key: String,
    http: Client,
}

impl SupabaseStore {
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("SUPABASE_URL").ok()?;
        let service_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .or_else(|_| std::env::var("SUPABASE_SERVICE_KEY"))
            .or_else(|_| std::env::var("SUPABASE_KEY"))
            .ok()?;
        Some(Self::new(base_url, service_key))
    }

    pub fn new(base_url: impl Into<String>, service_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            service_key: service_key.into(),
            http: build_client(),
        }
    }

    fn table_url(&self, table: &str, query: &str) -> String {
        format!("{}/rest/v1/{table}?{query}", self.base_url)
    }

    fn rpc_url(&self, function: &str) -> String {
        format!("{}/rest/v1/rpc/{function}", self.base_url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
    }

    async fn fetch_rows<T: DeserializeOwned>(&self, url: String) -> Result<Vec<T>, StoreError> {
        let response = self
            .authorize(self.http.get(url))
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;
        decode(response).await
    }

    async fn rpc<T: DeserializeOwned>(
        &self,
        function: &str,
        args: &impl Serialize,
    ) -> Result<Vec<T>, StoreError> {
        let response = self
            .authorize(self.http.post(self.rpc_url(function)))
            .json(args)
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;
        decode(response).await
    }

    async fn find_referral(&self, user_id: Uuid) -> Result<Option<Referral>, StoreError> {
        let mut rows: Vec<Referral> = self
            .fetch_rows(self.table_url(
                "referrals",
                &format!("user_id=eq.{user_id}&select=*&limit=1"),
            ))
            .await?;
        Ok(rows.pop())
    }

    async fn insert_referral(&self, referral: &Referral) -> Result<Vec<Referral>, StoreError> {
        let response = self
            .authorize(self.http.post(self.table_url("referrals", "select=*")))
            .header("Prefer", "return=representation")
            .json(referral)
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;
        decode(response).await
    }
}

fn status_error(status: StatusCode) -> StoreError {
    if status == StatusCode::CONFLICT {
        StoreError::Conflict(format!("HTTP {status}"))
    } else {
        StoreError::Request(format!("HTTP {status}"))
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<Vec<T>, StoreError> {
    if !response.status().is_success() {
        return Err(status_error(response.status()));
    }
    response
        .json()
        .await
        .map_err(|err| StoreError::Deserialize(err.to_string()))
}

#[async_trait]
impl BillingStore for SupabaseStore {
    async fn find_user(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let mut rows: Vec<User> = self
            .fetch_rows(self.table_url("users", &format!("id=eq.{id}&select=*&limit=1")))
            .await?;
        Ok(rows.pop())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        // `email` is a citext column, so equality is case-insensitive.
        let query = format!("email=eq.{}&select=*&limit=1", encode(email.trim()));
        let mut rows: Vec<User> = self.fetch_rows(self.table_url("users", &query)).await?;
        Ok(rows.pop())
    }

    async fn apply_grant(&self, user_id: Uuid, grant: CreditGrant) -> Result<User, StoreError> {
        let args = json!({
            "p_user_id": user_id,
            "p_credits": grant.credits,
            "p_role": grant.role.map(|role| role.as_str()),
        });
        let mut rows: Vec<User> = self.rpc("apply_credit_grant", &args).await?;
        rows.pop()
            .ok_or_else(|| StoreError::NotFound(format!("user {user_id}")))
    }

    async fn record_transaction(&self, tx: NewTransaction) -> Result<Transaction, StoreError> {
        let tx = tx.into_transaction();
        let response = self
            .authorize(self.http.post(self.table_url("transactions", "select=*")))
            .header("Prefer", "return=representation")
            .json(&tx)
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;
        let mut rows: Vec<Transaction> = decode(response).await?;
        Ok(rows.pop().unwrap_or(tx))
    }

    async fn list_transactions(&self, user_id: Uuid) -> Result<Vec<Transaction>, StoreError> {
        self.fetch_rows(self.table_url(
            "transactions",
            &format!("user_id=eq.{user_id}&select=*&order=created_at.desc"),
        ))
        .await
    }

    async fn ensure_referral(&self, user_id: Uuid) -> Result<Referral, StoreError> {
        for attempt in 1..=REFERRAL_INSERT_ATTEMPTS {
            if let Some(existing) = self.find_referral(user_id).await? {
                return Ok(existing);
            }
            let referral = Referral {
                user_id,
                code: generate_referral_code(),
                clicks: 0,
                signups: 0,
                conversions: 0,
                commission_cents: 0,
                updated_at: chrono::Utc::now(),
            };
            match self.insert_referral(&referral).await {
                Ok(mut created) => return Ok(created.pop().unwrap_or(referral)),
                Err(StoreError::Conflict(detail)) => debug!(
                    target = "pixelift.store",
                    user_id = %user_id,
                    attempt,
                    detail = %detail,
                    "referral insert conflicted"
                ),
                Err(err) => return Err(err),
            }
        }
        self.find_referral(user_id)
            .await?
            .ok_or_else(|| StoreError::Conflict(format!("referral for user {user_id}")))
    }

    async fn record_referral(
        &self,
        code: &str,
        action: ReferralAction,
    ) -> Result<Option<Referral>, StoreError> {
        let args = json!({
            "p_code": code,
            "p_action": action.name(),
            "p_amount_cents": action.amount_cents(),
        });
        let mut rows: Vec<Referral> = self.rpc("record_referral_action", &args).await?;
        Ok(rows.pop())
    }

    async fn link_referrer(&self, user_id: Uuid, code: &str) -> Result<LinkOutcome, StoreError> {
        #[derive(serde::Deserialize)]
        struct LinkRow {
            outcome: String,
            #[serde(flatten)]
            referral: Option<Referral>,
        }

        let args = json!({ "p_user_id": user_id, "p_code": code });
        let mut rows: Vec<LinkRow> = self.rpc("link_referrer", &args).await?;
        let row = rows
            .pop()
            .ok_or_else(|| StoreError::Deserialize("link_referrer returned no rows".into()))?;
        match (row.outcome.as_str(), row.referral) {
            ("linked", Some(referral)) => Ok(LinkOutcome::Linked(referral)),
            ("already_linked", _) => Ok(LinkOutcome::AlreadyLinked),
            ("self_referral", _) => Ok(LinkOutcome::SelfReferral),
            ("unknown_code", _) => Ok(LinkOutcome::UnknownCode),
            ("user_not_found", _) => Err(StoreError::NotFound(format!("user {user_id}"))),
            (other, _) => Err(StoreError::Deserialize(format!(
                "unexpected link outcome `{other}`"
            ))),
        }
    }
}
