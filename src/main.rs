mod catalog;
mod checkout;
mod config;
mod error;
mod http;
mod idempotency;
mod metrics;
mod models;
mod notify;
mod referrals;
mod security;
mod store;
mod stripe;
mod webhook;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Extension, Path, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use checkout::{CheckoutRequest, CheckoutResponse};
use config::{APP_URL, DATA_FILE, StoreBackend, env_u64};
use error::AppError;
use eyre::eyre;
use idempotency::ProcessedEvents;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{Referral, Role, Transaction};
use notify::MailQueue;
use security::{AuthSession, AuthState, rate_limit, require_session};
use serde::Serialize;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use store::{BillingStore, JsonFileStore, MemoryStore, SupabaseStore};
use stripe::{PaymentProvider, StripeClient};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;
use webhook::WebhookHandler;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "pixelift.api", "server crashed: {err:#}");
    }
}

async fn run() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let store = open_store().await?;
    let provider: Arc<dyn PaymentProvider> = Arc::new(StripeClient::from_env());
    let (mail, mail_worker) = MailQueue::spawn(notify::sender_from_env());

    let redis = std::env::var("REDIS_URL")
        .ok()
        .and_then(|url| redis::Client::open(url).ok());
    let events = ProcessedEvents::new(
        redis,
        Duration::from_secs(env_u64("IDEMPOTENCY_TTL_SECS", 86_400)),
    );
    let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET").unwrap_or_default();
    if webhook_secret.is_empty() {
        warn!(
            target = "pixelift.webhook",
            "STRIPE_WEBHOOK_SECRET not set; every webhook will be rejected"
        );
    }

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|err| eyre!("prometheus recorder: {err}"))?;

    let state = AppState {
        store: store.clone(),
        provider: provider.clone(),
        webhook: WebhookHandler::new(store, provider, mail, events, webhook_secret),
        openapi: Arc::new(load_openapi()),
        prometheus_handle,
        app_url: APP_URL.clone(),
    };
    let app = build_router(state, AuthState::from_env());

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "pixelift.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // The router owned the last queue handle; let queued emails drain.
    if tokio::time::timeout(Duration::from_secs(10), mail_worker)
        .await
        .is_err()
    {
        warn!(target = "pixelift.mail", "mail queue did not drain before exit");
    }
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
    info!(target = "pixelift.api", "shutdown requested");
}

async fn open_store() -> eyre::Result<Arc<dyn BillingStore>> {
    let backend = StoreBackend::from_env();
    info!(target = "pixelift.store", backend = ?backend, "opening store");
    let store: Arc<dyn BillingStore> = match backend {
        StoreBackend::Supabase => Arc::new(SupabaseStore::from_env().ok_or_else(|| {
            eyre!("supabase store needs SUPABASE_URL and SUPABASE_SERVICE_ROLE_KEY")
        })?),
        StoreBackend::Json => Arc::new(JsonFileStore::open(DATA_FILE.as_str()).await?),
        StoreBackend::Memory => Arc::new(MemoryStore::default()),
    };
    Ok(store)
}

fn load_openapi() -> serde_json::Value {
    serde_yaml::from_str(include_str!("../docs/openapi.yaml"))
        .unwrap_or_else(|_| json!({ "openapi": "3.0.3" }))
}

#[derive(Clone)]
struct AppState {
    store: Arc<dyn BillingStore>,
    provider: Arc<dyn PaymentProvider>,
    webhook: WebhookHandler,
    openapi: Arc<serde_json::Value>,
    prometheus_handle: PrometheusHandle,
    app_url: String,
}

fn build_router(state: AppState, auth_state: AuthState) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let checkout = Router::new()
        .route("/api/stripe/checkout", post(create_checkout))
        .route_layer(middleware::from_fn_with_state(auth_state.clone(), rate_limit));

    let protected = Router::new()
        .merge(checkout)
        .route("/api/account", get(account))
        .route("/api/account/transactions", get(account_transactions))
        .route("/api/referrals/me", get(my_referral))
        .route("/api/referrals/{code}/signup", post(referral_signup))
        .route_layer(middleware::from_fn_with_state(auth_state, require_session));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
        .route("/api/stripe/webhook", post(stripe_webhook))
        .route("/api/referrals/{code}/click", post(referral_click))
        .merge(protected)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()))
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "pixelift-billing",
    }))
}

async fn openapi_json(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json((*state.openapi).clone())
}

async fn swagger_ui() -> Response {
    let html = r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>Pixelift Billing API</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui' });
    };
  </script>
</body>
</html>"#;
    (
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        html,
    )
        .into_response()
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(256 * 1024)
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

/// Stripe event receiver.
///
/// - Method: `POST`
/// - Path: `/api/stripe/webhook`
/// - Auth: `stripe-signature` header over the raw body
/// - Response: `{"received": true}`, plus `"duplicate": true` for a redelivery
async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    crate::metrics::inc_requests("/api/stripe/webhook");
    let signature = headers
        .get("stripe-signature")
        .and_then(|value| value.to_str().ok());
    match state
        .webhook
        .handle(signature, &body, chrono::Utc::now().timestamp())
        .await
    {
        Ok(outcome) => outcome.into_response(),
        Err(err) => err.into_response(),
    }
}

/// Start a Stripe Checkout for a plan or a credit package.
///
/// - Method: `POST`
/// - Path: `/api/stripe/checkout`
/// - Auth: `Authorization: Bearer <session token>`
/// - Body: `{"type": "subscription"|"onetime", "planId"?, "packageId"?, "billingPeriod"?}`
/// - Response: `{"sessionId", "url"}`
async fn create_checkout(
    State(state): State<AppState>,
    Extension(session): Extension<AuthSession>,
    payload: Result<Json<CheckoutRequest>, JsonRejection>,
) -> Result<Json<CheckoutResponse>, AppError> {
    crate::metrics::inc_requests("/api/stripe/checkout");
    let Json(request) = payload.map_err(|_| AppError::BadRequest("Invalid request body"))?;
    let response =
        checkout::create_session(state.provider.as_ref(), &session, &request, &state.app_url)
            .await?;
    Ok(Json(response))
}

#[derive(Debug, Serialize)]
struct AccountResponse {
    id: Uuid,
    email: String,
    credits: i64,
    role: Role,
}

async fn account(
    State(state): State<AppState>,
    Extension(session): Extension<AuthSession>,
) -> Result<Json<AccountResponse>, AppError> {
    crate::metrics::inc_requests("/api/account");
    let user = state
        .store
        .find_user(session.user_id)
        .await?
        .ok_or(AppError::NotFound("User not found"))?;
    Ok(Json(AccountResponse {
        id: user.id,
        email: user.email,
        credits: user.credits,
        role: user.role,
    }))
}

async fn account_transactions(
    State(state): State<AppState>,
    Extension(session): Extension<AuthSession>,
) -> Result<Json<Vec<Transaction>>, AppError> {
    crate::metrics::inc_requests("/api/account/transactions");
    Ok(Json(state.store.list_transactions(session.user_id).await?))
}

async fn my_referral(
    State(state): State<AppState>,
    Extension(session): Extension<AuthSession>,
) -> Result<Json<Referral>, AppError> {
    crate::metrics::inc_requests("/api/referrals/me");
    Ok(Json(
        referrals::my_referral(state.store.as_ref(), &session).await?,
    ))
}

async fn referral_signup(
    State(state): State<AppState>,
    Extension(session): Extension<AuthSession>,
    Path(code): Path<String>,
) -> Result<Json<Referral>, AppError> {
    crate::metrics::inc_requests("/api/referrals/signup");
    Ok(Json(
        referrals::link_signup(state.store.as_ref(), &session, &code).await?,
    ))
}

async fn referral_click(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    crate::metrics::inc_requests("/api/referrals/click");
    referrals::record_click(state.store.as_ref(), &code).await?;
    Ok(Json(json!({ "ok": true })))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::User;
    use crate::notify::testing::RecordingSender;
    use crate::security::{SessionClaims, TokenBuckets};
    use crate::stripe::client::testing::FakeProvider;
    use crate::stripe::signature::sign_header;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    const WEBHOOK_SECRET: &str = "whsec_router_test";

    struct TestApp {
        router: Router,
        store: Arc<MemoryStore>,
        auth: AuthState,
    }

    impl TestApp {
        fn new(users: Vec<User>) -> Self {
            Self::with_limiter(users, TokenBuckets::new(100.0, 100.0))
        }

        fn with_limiter(users: Vec<User>, limiter: TokenBuckets) -> Self {
            let store = Arc::new(MemoryStore::with_users(users));
            let provider: Arc<dyn PaymentProvider> = Arc::new(FakeProvider::default());
            let (mail, _worker) =
                crate::notify::testing::queue(Arc::new(RecordingSender::default()));
            let events = ProcessedEvents::in_memory(Duration::from_secs(60));
            let state = AppState {
                store: store.clone(),
                provider: provider.clone(),
                webhook: WebhookHandler::new(
                    store.clone(),
                    provider,
                    mail,
                    events,
                    WEBHOOK_SECRET,
                ),
                openapi: Arc::new(load_openapi()),
                prometheus_handle: PrometheusBuilder::new().build_recorder().handle(),
                app_url: "https://pixelift.ai".into(),
            };
            let auth = AuthState::new(b"router-secret".to_vec(), limiter);
            Self {
                router: build_router(state, auth.clone()),
                store,
                auth,
            }
        }

        fn token(&self, user: &User) -> String {
            self.auth.issue(&SessionClaims {
                sub: user.id,
                email: user.email.clone(),
                exp: chrono::Utc::now().timestamp() + 3_600,
            })
        }

        async fn send(&self, request: Request<Body>) -> (StatusCode, serde_json::Value) {
            let response = self
                .router
                .clone()
                .oneshot(request)
                .await
                .expect("router");
            let status = response.status();
            let bytes = to_bytes(response.into_body(), usize::MAX)
                .await
                .expect("body");
            let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
            (status, body)
        }
    }

    fn post_json(uri: &str, token: Option<&str>, body: &str) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::from(body.to_string())).expect("request")
    }

    fn get_authed(uri: &str, token: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .expect("request")
    }

    fn webhook_request(body: &[u8], signature: Option<String>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/api/stripe/webhook");
        if let Some(signature) = signature {
            builder = builder.header("stripe-signature", signature);
        }
        builder.body(Body::from(body.to_vec())).expect("request")
    }

    #[tokio::test]
    async fn health_and_openapi_are_public() {
        let app = TestApp::new(vec![]);
        let (status, body) = app
            .send(Request::builder().uri("/health").body(Body::empty()).expect("request"))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = app
            .send(Request::builder().uri("/openapi.json").body(Body::empty()).expect("request"))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["paths"]["/api/stripe/webhook"].is_object());
    }

    #[tokio::test]
    async fn checkout_requires_a_session() {
        let app = TestApp::new(vec![]);
        let (status, body) = app
            .send(post_json("/api/stripe/checkout", None, r#"{"type":"onetime"}"#))
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, json!({ "error": "Unauthorized" }));

        let (status, _) = app
            .send(post_json("/api/stripe/checkout", Some("forged.token"), "{}"))
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn checkout_validates_and_creates_sessions() {
        let buyer = User::new("buyer@pixelift.ai");
        let app = TestApp::new(vec![buyer.clone()]);
        let token = app.token(&buyer);

        let (status, body) = app
            .send(post_json(
                "/api/stripe/checkout",
                Some(&token),
                r#"{"type":"subscription","planId":"platinum"}"#,
            ))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid plan");

        let (status, body) = app
            .send(post_json("/api/stripe/checkout", Some(&token), "{not json"))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid request body");

        let (status, body) = app
            .send(post_json(
                "/api/stripe/checkout",
                Some(&token),
                r#"{"type":"onetime","packageId":"credits_500"}"#,
            ))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sessionId"], "cs_test_1");
        assert!(body["url"].as_str().is_some());
    }

    #[tokio::test]
    async fn webhook_round_trip_updates_account() {
        let buyer = User::new("buyer@pixelift.ai");
        let app = TestApp::new(vec![buyer.clone()]);
        let event = serde_json::to_vec(&json!({
            "id": "evt_router",
            "type": "checkout.session.completed",
            "data": { "object": {
                "id": "cs_router",
                "customer_details": { "email": "buyer@pixelift.ai" },
                "amount_total": 4900,
                "currency": "usd",
                "metadata": { "type": "onetime", "credits": "500" }
            } }
        }))
        .expect("event");

        let (status, body) = app.send(webhook_request(&event, None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Missing signature");

        let forged = sign_header(&event, "whsec_wrong", chrono::Utc::now().timestamp());
        let (status, body) = app.send(webhook_request(&event, Some(forged))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid signature");

        let signed = sign_header(&event, WEBHOOK_SECRET, chrono::Utc::now().timestamp());
        let (status, body) = app.send(webhook_request(&event, Some(signed.clone()))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "received": true }));

        let (status, body) = app.send(webhook_request(&event, Some(signed))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "received": true, "duplicate": true }));

        let token = app.token(&buyer);
        let (status, body) = app.send(get_authed("/api/account", &token)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["credits"], 500);
        assert_eq!(body["role"], "user");

        let (status, body) = app
            .send(get_authed("/api/account/transactions", &token))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["type"], "purchase");
        assert_eq!(body[0]["amount_cents"], 4900);
        assert_eq!(body[0]["status"], "completed");
        assert_eq!(app.store.list_transactions(buyer.id).await.expect("store").len(), 1);
    }

    #[tokio::test]
    async fn referral_routes() {
        let owner = User::new("owner@pixelift.ai");
        let friend = User::new("friend@pixelift.ai");
        let app = TestApp::new(vec![owner.clone(), friend.clone()]);

        let (status, body) = app
            .send(get_authed("/api/referrals/me", &app.token(&owner)))
            .await;
        assert_eq!(status, StatusCode::OK);
        let code = body["code"].as_str().expect("code").to_string();

        let (status, _) = app
            .send(post_json(&format!("/api/referrals/{code}/click"), None, ""))
            .await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = app
            .send(post_json("/api/referrals/MISSING1/click", None, ""))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Referral not found");

        let (status, body) = app
            .send(post_json(
                &format!("/api/referrals/{code}/signup"),
                Some(&app.token(&friend)),
                "",
            ))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["clicks"], 1);
        assert_eq!(body["signups"], 1);
    }

    #[tokio::test]
    async fn only_checkout_is_rate_limited() {
        let buyer = User::new("buyer@pixelift.ai");
        let app = TestApp::with_limiter(vec![buyer.clone()], TokenBuckets::new(0.001, 1.0));
        let token = app.token(&buyer);
        let body = r#"{"type":"onetime","packageId":"credits_100"}"#;

        let (status, _) = app
            .send(post_json("/api/stripe/checkout", Some(&token), body))
            .await;
        assert_eq!(status, StatusCode::OK);

        let response = app
            .router
            .clone()
            .oneshot(post_json("/api/stripe/checkout", Some(&token), body))
            .await
            .expect("router");
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key(header::RETRY_AFTER));

        for _ in 0..3 {
            let (status, body) = app.send(get_authed("/api/account", &token)).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["email"], "buyer@pixelift.ai");
        }
    }

    #[tokio::test]
    async fn rate_limit_never_runs_before_authentication() {
        let app = TestApp::with_limiter(vec![], TokenBuckets::new(0.001, 1.0));
        for _ in 0..2 {
            let (status, body) = app
                .send(post_json("/api/stripe/checkout", None, "{}"))
                .await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
            assert_eq!(body, json!({ "error": "Unauthorized" }));
        }
    }
}
