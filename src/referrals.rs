//! Referral codes: the caller's own record, click tracking and signup linking.
//! Conversions are recorded by the webhook when a referred user pays.

use crate::error::AppError;
use crate::models::{Referral, ReferralAction, User};
use crate::security::AuthSession;
use crate::store::{BillingStore, LinkOutcome};
use tracing::info;

fn normalize(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

async fn signed_in_user(store: &dyn BillingStore, session: &AuthSession) -> Result<User, AppError> {
    store
        .find_user(session.user_id)
        .await?
        .ok_or(AppError::NotFound("User not found"))
}

/// The caller's referral record, created with a fresh code on first access.
pub async fn my_referral(
    store: &dyn BillingStore,
    session: &AuthSession,
) -> Result<Referral, AppError> {
    let user = signed_in_user(store, session).await?;
    Ok(store.ensure_referral(user.id).await?)
}

pub async fn record_click(store: &dyn BillingStore, code: &str) -> Result<Referral, AppError> {
    store
        .record_referral(&normalize(code), ReferralAction::Click)
        .await?
        .ok_or(AppError::NotFound("Referral not found"))
}

pub async fn link_signup(
    store: &dyn BillingStore,
    session: &AuthSession,
    code: &str,
) -> Result<Referral, AppError> {
    let user = signed_in_user(store, session).await?;
    let code = normalize(code);
    match store.link_referrer(user.id, &code).await? {
        LinkOutcome::Linked(referral) => {
            info!(
                target = "pixelift.api",
                user_id = %user.id,
                code = %code,
                "referral linked"
            );
            Ok(referral)
        }
        LinkOutcome::AlreadyLinked => Err(AppError::BadRequest("Referral already applied")),
        LinkOutcome::SelfReferral => Err(AppError::BadRequest("Cannot use your own referral code")),
        LinkOutcome::UnknownCode => Err(AppError::NotFound("Referral not found")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use uuid::Uuid;

    fn session_for(user: &User) -> AuthSession {
        AuthSession {
            user_id: user.id,
            email: user.email.clone(),
        }
    }

    #[tokio::test]
    async fn own_referral_is_stable_across_calls() {
        let owner = User::new("owner@pixelift.ai");
        let store = MemoryStore::with_users(vec![owner.clone()]);
        let first = my_referral(&store, &session_for(&owner)).await.expect("referral");
        let second = my_referral(&store, &session_for(&owner)).await.expect("referral");
        assert_eq!(first.code, second.code);
        assert_eq!(first.user_id, owner.id);
    }

    #[tokio::test]
    async fn missing_user_is_not_found() {
        let store = MemoryStore::default();
        let ghost = AuthSession {
            user_id: Uuid::new_v4(),
            email: "ghost@pixelift.ai".into(),
        };
        let err = my_referral(&store, &ghost).await.expect_err("no user");
        assert!(matches!(err, AppError::NotFound("User not found")));
    }

    #[tokio::test]
    async fn clicks_count_against_known_codes_only() {
        let owner = User::new("owner@pixelift.ai");
        let store = MemoryStore::with_users(vec![owner.clone()]);
        let code = my_referral(&store, &session_for(&owner)).await.expect("referral").code;

        let clicked = record_click(&store, &code.to_lowercase()).await.expect("click");
        assert_eq!(clicked.clicks, 1);
        let err = record_click(&store, "NOPE1234").await.expect_err("unknown");
        assert!(matches!(err, AppError::NotFound("Referral not found")));
    }

    #[tokio::test]
    async fn signup_links_once_and_never_to_self() {
        let owner = User::new("owner@pixelift.ai");
        let friend = User::new("friend@pixelift.ai");
        let store = MemoryStore::with_users(vec![owner.clone(), friend.clone()]);
        let code = my_referral(&store, &session_for(&owner)).await.expect("referral").code;

        let err = link_signup(&store, &session_for(&owner), &code)
            .await
            .expect_err("self");
        assert!(matches!(err, AppError::BadRequest("Cannot use your own referral code")));

        let linked = link_signup(&store, &session_for(&friend), &code)
            .await
            .expect("linked");
        assert_eq!(linked.signups, 1);

        let err = link_signup(&store, &session_for(&friend), &code)
            .await
            .expect_err("twice");
        assert!(matches!(err, AppError::BadRequest("Referral already applied")));

        let err = link_signup(&store, &session_for(&friend), "ZZZZZZZZ")
            .await
            .expect_err("already linked wins");
        assert!(matches!(err, AppError::BadRequest(_)));
    }
}
