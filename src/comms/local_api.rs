use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware::from_fn_with_state,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::cache::{InMemoryCache, RedisCache, SharedCache};
use crate::config::Config;
use crate::security::auth::{
    require_auth, require_dual_auth, require_trusted_proxy, AuthError, CredentialResolver,
};
use crate::security::credentials::{ApiKeyRegistry, CredentialVerifier};
use crate::security::idempotency::{idempotency_guard, IdempotencyGuard};
use crate::security::principal::Principal;
use crate::security::session_store::{EncryptedSessionStore, SessionError, SessionRecord};
use crate::security::token_service::{TokenError, TokenService};

pub type SharedState = Arc<AppState>;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub resolver: CredentialResolver,
    pub idempotency: IdempotencyGuard,
}

impl AppState {
    /// Wires the components over `cache`, using the API keys from `config`.
    pub fn new(config: Arc<Config>, cache: Arc<dyn SharedCache>) -> Result<Self> {
        let registry = ApiKeyRegistry::from_config(&config.api_keys, config.signature_max_skew_secs);
        debug!(api_keys = registry.len(), "credential registry loaded");
        Self::with_verifier(config, cache, Arc::new(registry))
    }

    pub fn with_verifier(
        config: Arc<Config>,
        cache: Arc<dyn SharedCache>,
        verifier: Arc<dyn CredentialVerifier>,
    ) -> Result<Self> {
        let tokens = Arc::new(TokenService::new(
            &config.jwt_secret,
            config.access_ttl(),
            config.refresh_ttl(),
        ));
        let sessions = EncryptedSessionStore::new(cache.clone(), &config.session_encryption_key)
            .context("initialising session store")?;
        let resolver = CredentialResolver::new(
            tokens,
            sessions,
            verifier,
            config.internal_proxy_secret.clone(),
        );
        let idempotency = IdempotencyGuard::with_ttls(
            cache,
            config.idempotency_lock_ttl(),
            config.idempotency_retention(),
        );
        Ok(Self {
            config,
            resolver,
            idempotency,
        })
    }

    /// Connects the configured cache backend and builds the state.
    pub async fn connect(config: Config) -> Result<Self> {
        let cache: Arc<dyn SharedCache> = match config.redis_url.as_deref() {
            Some(url) => Arc::new(
                RedisCache::connect(url, config.cache_timeout())
                    .await
                    .context("connecting to redis")?,
            ),
            None => {
                warn!("REDIS_URL not set; idempotency and sessions use an in-process cache");
                Arc::new(InMemoryCache::new())
            }
        };
        Self::new(Arc::new(config), cache)
    }

    /// Dual authentication followed by the idempotency guard.
    pub fn guard_mutating(&self, router: Router) -> Router {
        router
            .layer(from_fn_with_state(self.idempotency.clone(), idempotency_guard))
            .layer(from_fn_with_state(self.resolver.clone(), require_dual_auth))
    }

    /// Single-credential authentication for lower-trust routes.
    pub fn guard_authenticated(&self, router: Router) -> Router {
        router.layer(from_fn_with_state(self.resolver.clone(), require_auth))
    }
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, msg: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: msg.to_string(),
        }),
    )
}

#[derive(Deserialize)]
pub struct CreateSessionRequest {
    pub session_id: String,
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

#[derive(Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

async fn health(State(state): State<SharedState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "strict_session_mode": state.resolver.strict_session_mode(),
    }))
}

// Proxy registers a session it has established for an end user
async fn create_session(
    State(state): State<SharedState>,
    Json(req): Json<CreateSessionRequest>,
) -> impl IntoResponse {
    if req.session_id.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "session_id is required").into_response();
    }
    if let Err(e) = state.resolver.tokens().validate_token(&req.access_token) {
        return AuthError::from(e).into_response();
    }
    let ttl = req
        .ttl_secs
        .filter(|t| *t > 0)
        .map(Duration::from_secs)
        .unwrap_or_else(|| state.config.session_ttl());
    let record = SessionRecord {
        access_token: req.access_token,
        refresh_token: req.refresh_token,
    };
    match state
        .resolver
        .sessions()
        .create_session(&req.session_id, &record, ttl)
        .await
    {
        Ok(()) => {
            debug!(ttl_secs = ttl.as_secs(), "proxy session registered");
            (StatusCode::CREATED, Json(json!({ "session_id": req.session_id }))).into_response()
        }
        Err(e) => session_failure(e).into_response(),
    }
}

async fn delete_session(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    match state.resolver.sessions().delete_session(&session_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => session_failure(e).into_response(),
    }
}

fn session_failure(e: SessionError) -> (StatusCode, Json<ErrorResponse>) {
    match e {
        SessionError::Store(_) => {
            error!(error = %e, "session store unavailable");
            error_response(StatusCode::SERVICE_UNAVAILABLE, "Session store unavailable")
        }
        _ => {
            error!(error = %e, "session operation failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        }
    }
}

async fn refresh_tokens(
    State(state): State<SharedState>,
    Json(req): Json<RefreshRequest>,
) -> impl IntoResponse {
    match state.resolver.tokens().refresh(&req.refresh_token) {
        Ok(pair) => Json(pair).into_response(),
        Err(TokenError::Signing(e)) => {
            error!(error = %e, "token signing failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
        }
        Err(e) => AuthError::from(e).into_response(),
    }
}

async fn whoami(principal: Principal) -> impl IntoResponse {
    Json(principal)
}

/// Core admission routes plus `mutating`, which is wrapped in dual
/// authentication and the idempotency guard.
pub fn create_router(state: SharedState, mutating: Router) -> Router {
    let resolver = state.resolver.clone();

    let internal = Router::new()
        .route("/internal/sessions", post(create_session))
        .route("/internal/sessions/{session_id}", delete(delete_session))
        .route_layer(from_fn_with_state(resolver.clone(), require_trusted_proxy));

    let authenticated = Router::new()
        .route("/api/v1/me", get(whoami))
        .route_layer(from_fn_with_state(resolver.clone(), require_auth));

    let signed = Router::new()
        .route("/api/v1/signed/me", get(whoami))
        .route_layer(from_fn_with_state(resolver, require_dual_auth));

    Router::new()
        .route("/health", get(health))
        .route("/api/v1/auth/refresh", post(refresh_tokens))
        .merge(internal)
        .merge(authenticated)
        .merge(signed)
        .with_state(state.clone())
        .merge(state.guard_mutating(mutating))
        .layer(TraceLayer::new_for_http())
}

pub async fn serve(config: Config, port: u16) -> Result<()> {
    let strict = config.strict_session_mode();
    let state = Arc::new(AppState::connect(config).await?);
    let app = create_router(state, Router::new());

    if strict {
        info!("strict session mode: identity only via proxy-vouched sessions");
    } else {
        info!("legacy mode: bearer tokens accepted (no proxy secret configured)");
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);
    axum::serve(listener, app).into_future().await?;
    Ok(())
}
