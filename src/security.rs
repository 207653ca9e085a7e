use crate::error::AppError;
use crate::models::ApiError;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode, header::HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD as BASE64};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::{collections::HashMap, convert::Infallible, env, sync::Arc, time::Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Identity of the signed-in dashboard user, inserted into request extensions.
#[derive(Clone, Debug)]
pub struct AuthSession {
    pub user_id: Uuid,
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: Uuid,
    pub email: String,
    pub exp: i64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("malformed session token")]
    Malformed,
    #[error("bad session signature")]
    BadSignature,
    #[error("session expired")]
    Expired,
    #[error("session has no email")]
    MissingEmail,
    #[error("session secret rejected")]
    InvalidSecret,
}

#[derive(Clone)]
pub struct AuthState {
    secret: Arc<Vec<u8>>,
    limiter: Arc<TokenBuckets>,
}

impl AuthState {
    pub fn from_env() -> Self {
        let secret = env::var("SESSION_SECRET").unwrap_or_else(|_| {
            warn!(
                target = "pixelift.api",
                "SESSION_SECRET not set; generating an ephemeral secret"
            );
            Uuid::new_v4().to_string()
        });
        Self::new(secret.into_bytes(), TokenBuckets::from_env())
    }

    pub fn new(secret: Vec<u8>, limiter: TokenBuckets) -> Self {
        Self {
            secret: Arc::new(secret),
            limiter: Arc::new(limiter),
        }
    }

    fn mac(&self) -> Result<HmacSha256, SessionError> {
        HmacSha256::new_from_slice(&self.secret).map_err(|_| SessionError::InvalidSecret)
    }

    /// Tokens are minted by the web app; this mirrors its format for tests.
    #[cfg(test)]
    pub fn issue(&self, claims: &SessionClaims) -> String {
        let payload = BASE64.encode(serde_json::to_vec(claims).expect("claims serialize"));
        let mut mac = self.mac().expect("hmac key");
        mac.update(payload.as_bytes());
        format!("{payload}.{}", hex::encode(mac.finalize().into_bytes()))
    }

    pub fn verify(&self, token: &str, now: i64) -> Result<AuthSession, SessionError> {
        let (payload, signature) = token.split_once('.').ok_or(SessionError::Malformed)?;
        let signature = hex::decode(signature).map_err(|_| SessionError::Malformed)?;
        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| SessionError::BadSignature)?;

        let raw = BASE64.decode(payload).map_err(|_| SessionError::Malformed)?;
        let claims: SessionClaims =
            serde_json::from_slice(&raw).map_err(|_| SessionError::Malformed)?;
        if claims.exp <= now {
            return Err(SessionError::Expired);
        }
        let email = claims.email.trim();
        if email.is_empty() {
            return Err(SessionError::MissingEmail);
        }
        Ok(AuthSession {
            user_id: claims.sub,
            email: email.to_string(),
        })
    }
}

pub async fn require_session(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(token) = bearer_token(request.headers()) else {
        return Ok(AppError::Unauthorized.into_response());
    };
    match state.verify(&token, chrono::Utc::now().timestamp()) {
        Ok(session) => {
            request.extensions_mut().insert(session);
            Ok(next.run(request).await)
        }
        Err(err) => {
            debug!(target = "pixelift.api", error = %err, "session rejected");
            Ok(AppError::Unauthorized.into_response())
        }
    }
}

/// Per-user token bucket; layered inside `require_session`.
pub async fn rate_limit(
    State(state): State<AuthState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(user_id) = request
        .extensions()
        .get::<AuthSession>()
        .map(|session| session.user_id.to_string())
    else {
        return Ok(AppError::Unauthorized.into_response());
    };

    match state.limiter.consume(&user_id).await {
        Ok(()) => Ok(next.run(request).await),
        Err(retry_after_secs) => {
            debug!(target = "pixelift.api", user_id = %user_id, "rate limited");
            let mut response = (
                StatusCode::TOO_MANY_REQUESTS,
                Json(ApiError::new("Too many requests")),
            )
                .into_response();
            response.headers_mut().insert(
                http::header::RETRY_AFTER,
                HeaderValue::from(retry_after_secs.max(1)),
            );
            Ok(response)
        }
    }
}

fn bearer_token(headers: &http::HeaderMap) -> Option<String> {
    let raw = headers.get(http::header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = raw.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    Some(token.trim().to_string()).filter(|token| !token.is_empty())
}

const PRUNE_AT: usize = 1_024;

/// Per-key token bucket. Buckets that have refilled completely are
/// indistinguishable from new ones and are dropped once the map grows.
pub struct TokenBuckets {
    rate_per_sec: f64,
    capacity: f64,
    prune_at: usize,
    buckets: Mutex<HashMap<String, (f64, Instant)>>,
}

impl TokenBuckets {
    pub fn new(rate_per_sec: f64, capacity: f64) -> Self {
        Self {
            rate_per_sec,
            capacity,
            prune_at: PRUNE_AT,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    fn with_prune_at(mut self, prune_at: usize) -> Self {
        self.prune_at = prune_at;
        self
    }

    pub fn from_env() -> Self {
        let read = |name: &str, default: f64, min: f64| {
            env::var(name)
                .ok()
                .and_then(|value| value.parse::<f64>().ok())
                .filter(|value| *value >= min)
                .unwrap_or(default)
        };
        Self::new(
            read("RATE_LIMIT_PER_SEC", 2.0, f64::MIN_POSITIVE),
            read("RATE_LIMIT_CAPACITY", 10.0, 1.0),
        )
    }

    /// Takes one token, or returns the whole seconds until one is available.
    async fn consume(&self, key: &str) -> Result<(), u64> {
        let mut guard = self.buckets.lock().await;
        let now = Instant::now();
        if guard.len() >= self.prune_at {
            let (rate, capacity) = (self.rate_per_sec, self.capacity);
            guard.retain(|_, (tokens, last_refill)| {
                *tokens + now.duration_since(*last_refill).as_secs_f64() * rate < capacity
            });
        }
        let (tokens, last_refill) = guard
            .entry(key.to_string())
            .or_insert((self.capacity, now));

        let elapsed = now.duration_since(*last_refill).as_secs_f64();
        *tokens = (*tokens + elapsed * self.rate_per_sec).min(self.capacity);
        *last_refill = now;

        if *tokens >= 1.0 {
            *tokens -= 1.0;
            Ok(())
        } else {
            Err(((1.0 - *tokens) / self.rate_per_sec).ceil() as u64)
        }
    }
}
