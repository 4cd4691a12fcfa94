//! Axum-based HTTP gateway for accounts, access tokens and token usage.
//!
//! - Request body size limits (64KB max)
//! - Request timeouts from `[server] request_timeout_secs`
//! - Bearer JWT authentication, `{"detail": ...}` error bodies
//! - Per-request tracing spans

pub mod usage;
pub mod users;

use crate::auth::{AccountError, AccountStore, JwtHandler, NewUser, User};
use crate::billing::{RateTable, UsageLedger};
use crate::config::Config;
use crate::db::Database;
use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Maximum request body size (64KB)
pub const MAX_BODY_SIZE: usize = 65_536;

/// Shared state for all axum handlers
#[derive(Clone)]
pub struct AppState {
    pub accounts: Arc<AccountStore>,
    pub ledger: Arc<UsageLedger>,
    pub tokens: Arc<JwtHandler>,
    /// Whether `POST /auth/register` accepts new accounts.
    pub allow_registration: bool,
}

impl AppState {
    /// Wire stores over one open database.
    pub fn from_config(config: &Config, db: Arc<Database>) -> Result<Self> {
        let tokens = JwtHandler::new(
            &config.auth.jwt_secret,
            config.auth.access_token_expire_minutes,
        )
        .context("Refusing to start: set [auth] jwt_secret or QUOTAKEEPER_JWT_SECRET")?;
        let rates = Arc::new(RateTable::from_config(&config.rates));

        Ok(Self {
            accounts: Arc::new(AccountStore::new(db.clone(), config.quota.clone())),
            ledger: Arc::new(UsageLedger::new(db, rates)),
            tokens: Arc::new(tokens),
            allow_registration: config.auth.allow_registration,
        })
    }
}

/// Handler result: a status with a JSON body, or an [`ApiError`].
pub type ApiResult = Result<(StatusCode, Json<Value>), ApiError>;

/// Errors returned to HTTP clients as `{"detail": "..."}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthorized(&'static str),
    #[error("{0}")]
    Forbidden(&'static str),
    #[error("{0}")]
    NotFound(&'static str),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let detail = match &self {
            Self::Internal(e) => {
                tracing::error!("Request failed: {e:#}");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        let mut response = (status, Json(json!({ "detail": detail }))).into_response();
        if status == StatusCode::UNAUTHORIZED {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        response
    }
}

impl From<AccountError> for ApiError {
    fn from(err: AccountError) -> Self {
        match err {
            AccountError::Storage(e) => Self::Internal(e),
            other => Self::BadRequest(other.to_string()),
        }
    }
}

/// Unwrap a JSON body, turning extractor rejections into 400s.
fn parse_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    body.map(|Json(b)| b)
        .map_err(|e| ApiError::BadRequest(format!("Invalid request: {}", e.body_text())))
}

/// Run bcrypt-heavy store work off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("Blocking task failed: {e}")))?
}

/// Build the router with all middleware layers.
pub fn router(state: AppState, request_timeout: Duration) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PUT,
            axum::http::Method::DELETE,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .max_age(Duration::from_secs(3600));

    Router::new()
        .route("/", get(handle_root))
        .route("/health", get(handle_health))
        .route("/auth/register", post(handle_register))
        .route("/auth/token", post(handle_token))
        .route("/auth/me", get(handle_me))
        .route("/auth/protected", get(handle_protected))
        .route(
            "/users",
            get(users::handle_list_users).post(users::handle_create_user),
        )
        .route(
            "/users/{id}",
            get(users::handle_get_user)
                .put(users::handle_update_user)
                .delete(users::handle_delete_user),
        )
        .route("/users/{id}/usage/reset", post(users::handle_reset_usage))
        .route("/usage/me", get(usage::handle_usage_me))
        .route("/usage/check", post(usage::handle_usage_check))
        .route("/usage/llm", post(usage::handle_record_llm))
        .route("/usage/embedding", post(usage::handle_record_embedding))
        .route("/usage/events", get(usage::handle_usage_events))
        .with_state(state)
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
        .layer(TraceLayer::new_for_http())
}

/// Open the database and serve the gateway until Ctrl-C.
pub async fn run_gateway(host: &str, port: u16, config: Config) -> Result<()> {
    let db_path = config.database_path();
    let db = Arc::new(Database::open(&db_path)?);
    let state = AppState::from_config(&config, db)?;

    let accounts = state.accounts.user_count()?;
    if accounts == 0 {
        tracing::warn!("No accounts yet; create an admin with `quotakeeper user create --admin`");
    }

    let app = router(
        state,
        Duration::from_secs(config.server.request_timeout_secs),
    );

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    let local = listener.local_addr()?;

    tracing::info!(
        addr = %local,
        db = %db_path.display(),
        accounts,
        allow_registration = config.auth.allow_registration,
        "Gateway listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await?;

    Ok(())
}

// ══════════════════════════════════════════════════════════════════════════════
// AUTH HELPERS
// ══════════════════════════════════════════════════════════════════════════════

/// Extract bearer token from Authorization header.
fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Resolve the calling account from its bearer token.
pub(crate) fn require_user(state: &AppState, headers: &HeaderMap) -> Result<User, ApiError> {
    let token = extract_bearer_token(headers).ok_or(ApiError::Unauthorized("Not authenticated"))?;

    let claims = state.tokens.validate_token(token).map_err(|e| {
        tracing::debug!("Rejected bearer token: {e:#}");
        ApiError::Unauthorized("Could not validate credentials")
    })?;

    let user = state
        .accounts
        .get_user_by_email(&claims.sub)?
        .ok_or(ApiError::Unauthorized("Could not validate credentials"))?;

    if !user.is_active {
        return Err(ApiError::BadRequest("Inactive user".into()));
    }
    Ok(user)
}

/// Like [`require_user`], but only for administrators.
pub(crate) fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<User, ApiError> {
    let user = require_user(state, headers)?;
    if !user.is_admin {
        return Err(ApiError::Forbidden("Not enough permissions"));
    }
    Ok(user)
}

// ══════════════════════════════════════════════════════════════════════════════
// AXUM HANDLERS
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
pub struct RegisterBody {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct TokenBody {
    pub username: String,
    pub password: String,
}

/// GET /: welcome message
async fn handle_root() -> Json<Value> {
    Json(json!({
        "message": "Welcome to quotakeeper",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// GET /health: always public
async fn handle_health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// POST /auth/register: create a regular account.
async fn handle_register(
    State(state): State<AppState>,
    body: Result<Json<RegisterBody>, JsonRejection>,
) -> ApiResult {
    if !state.allow_registration {
        return Err(ApiError::Forbidden("Registration is disabled"));
    }
    let body = parse_body(body)?;

    let accounts = state.accounts.clone();
    let user = blocking(move || {
        accounts
            .create_user(NewUser::regular(body.email, body.password))
            .map_err(ApiError::from)
    })
    .await?;

    Ok((StatusCode::CREATED, Json(json!(user))))
}

/// POST /auth/token: exchange credentials for an access token.
async fn handle_token(
    State(state): State<AppState>,
    body: Result<Json<TokenBody>, JsonRejection>,
) -> ApiResult {
    let body = parse_body(body)?;

    let accounts = state.accounts.clone();
    let user = blocking(move || {
        accounts
            .authenticate(&body.username, &body.password)
            .map_err(ApiError::from)
    })
    .await?;

    let access_token = state.tokens.generate_token(&user.email, user.id)?;
    tracing::info!(user_id = user.id, "Access token issued");

    Ok((
        StatusCode::OK,
        Json(json!({
            "access_token": access_token,
            "token_type": "bearer",
            "expires_in": state.tokens.expires_in_secs(),
        })),
    ))
}

/// GET /auth/me: the calling account.
async fn handle_me(State(state): State<AppState>, headers: HeaderMap) -> ApiResult {
    let user = require_user(&state, &headers)?;
    Ok((
        StatusCode::OK,
        Json(json!({
            "id": user.id,
            "email": user.email,
            "is_active": user.is_active,
            "is_admin": user.is_admin,
            "rag_settings": user.rag_settings,
            "timestamp": chrono::Utc::now(),
        })),
    ))
}

/// GET /auth/protected: token smoke test.
async fn handle_protected(State(state): State<AppState>, headers: HeaderMap) -> ApiResult {
    let user = require_user(&state, &headers)?;
    Ok((
        StatusCode::OK,
        Json(json!({
            "message": format!("Hello {}, you have access to this protected endpoint", user.email),
            "status": "authenticated",
            "timestamp": chrono::Utc::now(),
        })),
    ))
}

// ══════════════════════════════════════════════════════════════════════════════
// TEST SUPPORT
// ══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::config::QuotaConfig;
    use http_body_util::BodyExt;

    pub const PASSWORD: &str = "securepassword123";

    pub fn test_state() -> AppState {
        let db = Arc::new(Database::open_in_memory().unwrap());
        AppState {
            accounts: Arc::new(AccountStore::new(db.clone(), QuotaConfig::default())),
            ledger: Arc::new(UsageLedger::new(db, Arc::new(RateTable::default()))),
            tokens: Arc::new(JwtHandler::new("test-secret", 30).unwrap()),
            allow_registration: true,
        }
    }

    /// Create an account and return it with auth headers for it.
    pub fn login(state: &AppState, email: &str, admin: bool) -> (User, HeaderMap) {
        let mut new_user = NewUser::regular(email, PASSWORD);
        new_user.is_admin = admin;
        let user = state.accounts.create_user(new_user).unwrap();
        let token = state.tokens.generate_token(&user.email, user.id).unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        (user, headers)
    }

    pub async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }
}
