//! Credential resolution for inbound requests.
//!
//! Two entry points share one resolver:
//! - [`require_auth`]: session-or-bearer, used on lower-trust routes.
//! - [`require_dual_auth`]: API key + signature, or session/bearer with a
//!   request signature; used on payment-mutating routes.
//!
//! Strict session mode is on whenever a proxy secret is configured. In that
//! mode identity comes only from sessions vouched for by the trusted proxy and
//! bare bearer tokens are never accepted.

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::debug;

use super::audit_log::AuditLogger;
use super::credentials::{CredentialError, CredentialVerifier};
use super::principal::Principal;
use super::request_signer::{hash_and_restore_body, SignedRequest};
use super::session_store::{EncryptedSessionStore, SessionError};
use super::token_service::{TokenClaims, TokenError, TokenService, TokenType};

pub const HEADER_SESSION_ID: &str = "x-session-id";
pub const HEADER_PROXY_SECRET: &str = "x-internal-proxy-secret";
pub const HEADER_API_KEY: &str = "x-api-key";
pub const HEADER_SIGNATURE: &str = "x-signature";
pub const HEADER_TIMESTAMP: &str = "x-timestamp";
pub const HEADER_REQUEST_ID: &str = "x-request-id";

/// Rejections produced while resolving credentials. Messages never say
/// which part of a credential was wrong.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("Authentication required")]
    AuthRequired,
    #[error("Invalid token")]
    InvalidToken,
    #[error("Token has expired")]
    ExpiredToken,
    #[error("Invalid API Key or Signature")]
    InvalidApiKey,
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Authentication required")]
    UntrustedOrigin,
    #[error("Invalid request body")]
    BadRequest,
}

impl AuthError {
    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::BadRequest => StatusCode::BAD_REQUEST,
            _ => StatusCode::UNAUTHORIZED,
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<TokenError> for AuthError {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::Expired => AuthError::ExpiredToken,
            TokenError::Invalid | TokenError::Signing(_) => AuthError::InvalidToken,
        }
    }
}

/// Which credential established the principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialPath {
    ApiKey,
    Session,
    Bearer,
}

impl CredentialPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialPath::ApiKey => "api_key",
            CredentialPath::Session => "session",
            CredentialPath::Bearer => "bearer",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub principal: Principal,
    pub path: CredentialPath,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignaturePolicy {
    Required,
    IfPresent,
}

/// Credential-bearing headers of one request, trimmed; empty values count as absent.
#[derive(Debug, Clone, Default)]
pub struct CredentialHeaders {
    pub bearer: Option<String>,
    pub session_id: Option<String>,
    pub proxy_secret: Option<String>,
    pub api_key: Option<String>,
    pub signature: Option<String>,
    pub timestamp: Option<String>,
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = header_value(headers, header::AUTHORIZATION.as_str())?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

pub fn request_id(headers: &HeaderMap) -> Option<String> {
    header_value(headers, HEADER_REQUEST_ID)
}

impl CredentialHeaders {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            bearer: bearer_token(headers),
            session_id: header_value(headers, HEADER_SESSION_ID),
            proxy_secret: header_value(headers, HEADER_PROXY_SECRET),
            api_key: header_value(headers, HEADER_API_KEY),
            signature: header_value(headers, HEADER_SIGNATURE),
            timestamp: header_value(headers, HEADER_TIMESTAMP),
        }
    }

    fn has_signature(&self) -> bool {
        self.signature.is_some() && self.timestamp.is_some()
    }
}

#[derive(Clone)]
pub struct CredentialResolver {
    tokens: Arc<TokenService>,
    sessions: EncryptedSessionStore,
    verifier: Arc<dyn CredentialVerifier>,
    proxy_secret: Option<String>,
    audit: AuditLogger,
}

impl CredentialResolver {
    pub fn new(
        tokens: Arc<TokenService>,
        sessions: EncryptedSessionStore,
        verifier: Arc<dyn CredentialVerifier>,
        proxy_secret: Option<String>,
    ) -> Self {
        Self {
            tokens,
            sessions,
            verifier,
            proxy_secret: proxy_secret.filter(|s| !s.is_empty()),
            audit: AuditLogger::new(),
        }
    }

    pub fn strict_session_mode(&self) -> bool {
        self.proxy_secret.is_some()
    }

    pub fn sessions(&self) -> &EncryptedSessionStore {
        &self.sessions
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    /// True only when a proxy secret is configured and the presented one matches.
    pub fn is_trusted_proxy(&self, presented: Option<&str>) -> bool {
        match (self.proxy_secret.as_deref(), presented) {
            (Some(expected), Some(given)) => {
                expected.as_bytes().ct_eq(given.as_bytes()).unwrap_u8() == 1
            }
            _ => false,
        }
    }

    /// Session-or-bearer resolution used by [`require_auth`].
    pub async fn resolve(
        &self,
        creds: &CredentialHeaders,
        request_id: Option<&str>,
    ) -> Result<Resolved, AuthError> {
        let (token, path) = self.session_or_bearer(creds, request_id).await?;
        let claims = self.access_claims(&token)?;
        Ok(Resolved {
            principal: claims.principal(),
            path,
        })
    }

    /// Full precedence used by [`require_dual_auth`]: API key, then trusted
    /// session, then bearer. `signed` must be present whenever the request
    /// carries a signature and timestamp.
    pub async fn resolve_dual(
        &self,
        creds: &CredentialHeaders,
        signed: Option<&SignedRequest>,
        request_id: Option<&str>,
    ) -> Result<Resolved, AuthError> {
        if let (Some(key), Some(sig), Some(ts)) = (
            creds.api_key.as_deref(),
            creds.signature.as_deref(),
            creds.timestamp.as_deref(),
        ) {
            let signed = signed.ok_or(AuthError::BadRequest)?;
            return match self.verifier.validate_api_key(key, sig, ts, signed).await {
                Ok(principal) => Ok(Resolved {
                    principal,
                    path: CredentialPath::ApiKey,
                }),
                Err(CredentialError::Rejected) => {
                    self.audit.signature_invalid(None, request_id);
                    Err(AuthError::InvalidApiKey)
                }
                Err(CredentialError::Unavailable(e)) => {
                    self.audit.storage_degraded("credentials", request_id, &e);
                    Err(AuthError::AuthRequired)
                }
            };
        }

        let (token, path) = self.session_or_bearer(creds, request_id).await?;
        let claims = self.access_claims(&token)?;
        let policy = match path {
            CredentialPath::Session => SignaturePolicy::IfPresent,
            _ => SignaturePolicy::Required,
        };
        self.check_signature(policy, &claims, creds, signed, request_id)
            .await?;
        Ok(Resolved {
            principal: claims.principal(),
            path,
        })
    }

    async fn session_or_bearer(
        &self,
        creds: &CredentialHeaders,
        request_id: Option<&str>,
    ) -> Result<(String, CredentialPath), AuthError> {
        if let Some(session_id) = creds.session_id.as_deref() {
            if self.is_trusted_proxy(creds.proxy_secret.as_deref()) {
                let token = self.token_from_session(session_id, request_id).await?;
                return Ok((token, CredentialPath::Session));
            }
            if self.strict_session_mode() {
                self.audit.untrusted_proxy(request_id);
                return Err(AuthError::UntrustedOrigin);
            }
        }
        if self.strict_session_mode() {
            return Err(AuthError::AuthRequired);
        }
        creds
            .bearer
            .clone()
            .map(|t| (t, CredentialPath::Bearer))
            .ok_or(AuthError::AuthRequired)
    }

    async fn token_from_session(
        &self,
        session_id: &str,
        request_id: Option<&str>,
    ) -> Result<String, AuthError> {
        match self.sessions.get_session(session_id).await {
            Ok(record) => Ok(record.access_token),
            Err(SessionError::NotFound) => Err(AuthError::AuthRequired),
            Err(SessionError::Store(e)) => {
                self.audit
                    .storage_degraded("session_store", request_id, &e.to_string());
                Err(AuthError::AuthRequired)
            }
            Err(e) => {
                debug!(error = %e, "session payload rejected");
                Err(AuthError::InvalidToken)
            }
        }
    }

    fn access_claims(&self, token: &str) -> Result<TokenClaims, AuthError> {
        let claims = self.tokens.validate_token(token)?;
        if claims.token_type != TokenType::Access {
            return Err(AuthError::InvalidToken);
        }
        Ok(claims)
    }

    async fn check_signature(
        &self,
        policy: SignaturePolicy,
        claims: &TokenClaims,
        creds: &CredentialHeaders,
        signed: Option<&SignedRequest>,
        request_id: Option<&str>,
    ) -> Result<(), AuthError> {
        let (sig, ts) = match (creds.signature.as_deref(), creds.timestamp.as_deref()) {
            (Some(sig), Some(ts)) => (sig, ts),
            _ => {
                return match policy {
                    SignaturePolicy::Required => Err(AuthError::AuthRequired),
                    SignaturePolicy::IfPresent => Ok(()),
                }
            }
        };
        let signed = signed.ok_or(AuthError::BadRequest)?;
        match self
            .verifier
            .validate_signature_for_jwt(&claims.user_id, sig, ts, signed)
            .await
        {
            Ok(()) => Ok(()),
            Err(CredentialError::Rejected) => {
                self.audit
                    .signature_invalid(Some(&claims.user_id), request_id);
                Err(AuthError::InvalidSignature)
            }
            Err(CredentialError::Unavailable(e)) => {
                self.audit.storage_degraded("credentials", request_id, &e);
                Err(AuthError::AuthRequired)
            }
        }
    }
}

/// Single-credential middleware: trusted session, or bearer in legacy mode.
pub async fn require_auth(
    State(resolver): State<CredentialResolver>,
    mut req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let creds = CredentialHeaders::from_headers(req.headers());
    let rid = request_id(req.headers());
    match resolver.resolve(&creds, rid.as_deref()).await {
        Ok(resolved) => {
            resolver
                .audit
                .auth_success(&resolved.principal.user_id, rid.as_deref(), resolved.path.as_str());
            req.extensions_mut().insert(resolved.principal);
            Ok(next.run(req).await)
        }
        Err(e) => {
            resolver.audit.auth_failure(rid.as_deref(), &e.to_string());
            Err(e)
        }
    }
}

/// Dual-credential middleware for mutating routes.
pub async fn require_dual_auth(
    State(resolver): State<CredentialResolver>,
    req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let creds = CredentialHeaders::from_headers(req.headers());
    let rid = request_id(req.headers());

    let (mut req, signed) = if creds.has_signature() {
        let (req, signed) = hash_and_restore_body(req).await.map_err(|e| {
            debug!(error = %e, "request body unreadable");
            AuthError::BadRequest
        })?;
        (req, Some(signed))
    } else {
        (req, None)
    };

    match resolver.resolve_dual(&creds, signed.as_ref(), rid.as_deref()).await {
        Ok(resolved) => {
            resolver
                .audit
                .auth_success(&resolved.principal.user_id, rid.as_deref(), resolved.path.as_str());
            req.extensions_mut().insert(resolved.principal);
            Ok(next.run(req).await)
        }
        Err(e) => {
            resolver.audit.auth_failure(rid.as_deref(), &e.to_string());
            Err(e)
        }
    }
}

/// Admits only callers presenting the configured proxy secret.
pub async fn require_trusted_proxy(
    State(resolver): State<CredentialResolver>,
    req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let presented = header_value(req.headers(), HEADER_PROXY_SECRET);
    if resolver.is_trusted_proxy(presented.as_deref()) {
        Ok(next.run(req).await)
    } else {
        resolver
            .audit
            .untrusted_proxy(request_id(req.headers()).as_deref());
        Err(AuthError::UntrustedOrigin)
    }
}
