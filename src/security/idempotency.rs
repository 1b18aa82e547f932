//! At-most-once execution for mutating routes keyed by `Idempotency-Key`.
//!
//! Record lifecycle under `idempotency:<owner>:<key>`:
//! absent -> "processing" (SET NX, short TTL) -> captured 2xx response (long TTL),
//! or back to absent when the handler did not succeed. Once the handler has
//! returned 2xx the key is never released; if the response cannot be retained
//! the sentinel simply expires after the lock TTL.

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::{engine::general_purpose, Engine};
use futures_util::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::audit_log::AuditLogger;
use super::auth::request_id;
use super::principal::Principal;
use crate::cache::{CacheLookup, SharedCache};

pub const HEADER_IDEMPOTENCY_KEY: &str = "idempotency-key";
/// Set to `true` on responses served from a stored result.
pub const HEADER_IDEMPOTENT_REPLAY: &str = "x-idempotent-replay";
pub const PROCESSING: &str = "processing";

pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30);
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Responses larger than this are streamed to the client but not retained.
pub const MAX_CAPTURED_BODY_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdempotencyError {
    #[error("A request with this Idempotency-Key is already in progress")]
    Conflict,
}

impl IntoResponse for IdempotencyError {
    fn into_response(self) -> Response {
        (StatusCode::CONFLICT, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Retained form of a successful response: its content type and the exact
/// body bytes, base64-encoded so any payload survives a string-valued cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedResponse {
    #[serde(default)]
    pub content_type: Option<String>,
    pub body: String,
}

impl CapturedResponse {
    pub fn new(content_type: Option<String>, body: &[u8]) -> Self {
        Self {
            content_type,
            body: general_purpose::STANDARD.encode(body),
        }
    }

    pub fn decode(raw: &str) -> Option<(Option<String>, Vec<u8>)> {
        let record: CapturedResponse = serde_json::from_str(raw).ok()?;
        let body = general_purpose::STANDARD.decode(record.body).ok()?;
        Some((record.content_type, body))
    }
}

#[derive(Clone)]
pub struct IdempotencyGuard {
    cache: Arc<dyn SharedCache>,
    lock_ttl: Duration,
    retention: Duration,
    audit: AuditLogger,
}

impl IdempotencyGuard {
    pub fn new(cache: Arc<dyn SharedCache>) -> Self {
        Self::with_ttls(cache, DEFAULT_LOCK_TTL, DEFAULT_RETENTION)
    }

    pub fn with_ttls(cache: Arc<dyn SharedCache>, lock_ttl: Duration, retention: Duration) -> Self {
        Self {
            cache,
            lock_ttl,
            retention,
            audit: AuditLogger::new(),
        }
    }

    pub fn storage_key(owner_id: &str, client_key: &str) -> String {
        format!("idempotency:{owner_id}:{client_key}")
    }

    async fn release(&self, storage_key: &str) {
        if let Err(e) = self.cache.delete(storage_key).await {
            // the lock TTL still bounds how long retries stay blocked
            warn!(error = %e, "failed to release idempotency lock");
        }
    }
}

fn replay(content_type: Option<String>, body: Vec<u8>) -> Response {
    let mut response = (StatusCode::OK, body).into_response();
    let headers = response.headers_mut();
    match content_type.and_then(|ct| HeaderValue::from_str(&ct).ok()) {
        Some(ct) => {
            headers.insert(header::CONTENT_TYPE, ct);
        }
        None => {
            headers.remove(header::CONTENT_TYPE);
        }
    }
    headers.insert(HEADER_IDEMPOTENT_REPLAY, HeaderValue::from_static("true"));
    response
}

/// Bytes mirrored from a successful response on their way to the client.
struct Capture {
    guard: IdempotencyGuard,
    storage_key: String,
    request_id: Option<String>,
    content_type: Option<String>,
    buf: Vec<u8>,
    overflowed: bool,
}

impl Capture {
    fn record(&mut self, chunk: &Bytes) {
        if self.overflowed {
            return;
        }
        if self.buf.len() + chunk.len() > MAX_CAPTURED_BODY_BYTES {
            self.overflowed = true;
            self.buf = Vec::new();
            return;
        }
        self.buf.extend_from_slice(chunk);
    }

    async fn finish(self) {
        if self.overflowed {
            warn!(
                limit = MAX_CAPTURED_BODY_BYTES,
                "response too large to retain; key stays locked until the lock TTL"
            );
            return;
        }
        let record = CapturedResponse::new(self.content_type, &self.buf);
        let value = match serde_json::to_string(&record) {
            Ok(value) => value,
            Err(e) => {
                self.guard.audit.internal_error(
                    self.request_id.as_deref(),
                    &format!("failed to encode captured response: {e}"),
                );
                return;
            }
        };
        if let Err(e) = self
            .guard
            .cache
            .set_ex(&self.storage_key, &value, self.guard.retention)
            .await
        {
            self.guard.audit.storage_degraded(
                "idempotency",
                self.request_id.as_deref(),
                &e.to_string(),
            );
        }
    }
}

/// Forwards `body` unchanged while mirroring it into `capture`, which is
/// stored once the stream ends.
fn tee(body: Body, capture: Capture) -> Body {
    let mirrored = stream::unfold(
        Some((body.into_data_stream(), capture)),
        |state| async move {
            let (mut inner, mut capture) = state?;
            match inner.next().await {
                Some(Ok(chunk)) => {
                    capture.record(&chunk);
                    Some((Ok(chunk), Some((inner, capture))))
                }
                Some(Err(e)) => {
                    // key stays locked until the lock TTL
                    capture.guard.audit.internal_error(
                        capture.request_id.as_deref(),
                        &format!("response stream failed: {e}"),
                    );
                    Some((Err(e), None))
                }
                None => {
                    capture.finish().await;
                    None
                }
            }
        },
    );
    Body::from_stream(mirrored)
}

pub async fn idempotency_guard(
    State(guard): State<IdempotencyGuard>,
    req: Request,
    next: Next,
) -> Response {
    let client_key = req
        .headers()
        .get(HEADER_IDEMPOTENCY_KEY)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string);
    let Some(client_key) = client_key else {
        return next.run(req).await;
    };
    let Some(principal) = req.extensions().get::<Principal>().cloned() else {
        return next.run(req).await;
    };
    let rid = request_id(req.headers());
    let storage_key = IdempotencyGuard::storage_key(&principal.user_id, &client_key);

    match guard.cache.get(&storage_key).await {
        CacheLookup::Found(value) if value == PROCESSING => {
            guard
                .audit
                .idempotency_conflict(&principal.user_id, rid.as_deref());
            return IdempotencyError::Conflict.into_response();
        }
        CacheLookup::Found(value) => {
            return match CapturedResponse::decode(&value) {
                Some((content_type, body)) => {
                    guard
                        .audit
                        .idempotency_replay(&principal.user_id, rid.as_deref());
                    replay(content_type, body)
                }
                None => {
                    // unreadable record: the operation may have run, so do not re-run it
                    guard.audit.storage_degraded(
                        "idempotency",
                        rid.as_deref(),
                        "stored response is unreadable",
                    );
                    IdempotencyError::Conflict.into_response()
                }
            };
        }
        CacheLookup::NotFound => {}
        CacheLookup::Unavailable(e) => {
            // read path fails open
            guard
                .audit
                .storage_degraded("idempotency", rid.as_deref(), &e.to_string());
            return next.run(req).await;
        }
    }

    match guard
        .cache
        .set_nx_ex(&storage_key, PROCESSING, guard.lock_ttl)
        .await
    {
        Ok(true) => {}
        Ok(false) => {
            guard
                .audit
                .idempotency_conflict(&principal.user_id, rid.as_deref());
            return IdempotencyError::Conflict.into_response();
        }
        Err(e) => {
            // lock path fails closed
            guard
                .audit
                .storage_degraded("idempotency", rid.as_deref(), &e.to_string());
            return IdempotencyError::Conflict.into_response();
        }
    }

    let response = next.run(req).await;
    let (parts, body) = response.into_parts();

    if !parts.status.is_success() {
        debug!(status = parts.status.as_u16(), "handler failed; releasing idempotency key");
        guard.release(&storage_key).await;
        return Response::from_parts(parts, body);
    }

    let content_type = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let capture = Capture {
        guard,
        storage_key,
        request_id: rid,
        content_type,
        buf: Vec::new(),
        overflowed: false,
    };
    Response::from_parts(parts, tee(body, capture))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::security::principal::Role;
    use axum::middleware::{from_fn, from_fn_with_state};
    use axum::routing::post;
    use axum::Router;
    use http_body_util::BodyExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    async fn attach_principal(mut req: Request, next: Next) -> Response {
        req.extensions_mut()
            .insert(Principal::new("owner-1", "o@example.com", Role::Merchant));
        next.run(req).await
    }

    fn app(cache: InMemoryCache, counter: Arc<AtomicUsize>, status: StatusCode) -> Router {
        let guard = IdempotencyGuard::new(Arc::new(cache));
        Router::new()
            .route(
                "/pay",
                post(move || {
                    let counter = counter.clone();
                    async move {
                        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                        (status, Json(json!({ "id": n })))
                    }
                }),
            )
            .layer(from_fn_with_state(guard, idempotency_guard))
            .layer(from_fn(attach_principal))
    }

    async fn call(app: &Router, key: Option<&str>) -> (StatusCode, Option<String>, String) {
        let mut builder = Request::builder().method("POST").uri("/pay");
        if let Some(k) = key {
            builder = builder.header(HEADER_IDEMPOTENCY_KEY, k);
        }
        let res = app
            .clone()
            .oneshot(builder.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = res.status();
        let marker = res
            .headers()
            .get(HEADER_IDEMPOTENT_REPLAY)
            .map(|v| v.to_str().unwrap().to_string());
        let body = res.into_body().collect().await.unwrap().to_bytes();
        (status, marker, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_replays_successful_response() {
        let cache = InMemoryCache::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let app = app(cache.clone(), counter.clone(), StatusCode::CREATED);

        let (s1, m1, b1) = call(&app, Some("k1")).await;
        assert_eq!(s1, StatusCode::CREATED);
        assert_eq!(m1, None);
        assert_eq!(b1, r#"{"id":1}"#);

        let (s2, m2, b2) = call(&app, Some("k1")).await;
        assert_eq!(s2, StatusCode::OK);
        assert_eq!(m2.as_deref(), Some("true"));
        assert_eq!(b2, r#"{"id":1}"#);
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        match cache.get("idempotency:owner-1:k1").await {
            CacheLookup::Found(v) => {
                let (content_type, body) = CapturedResponse::decode(&v).unwrap();
                assert_eq!(content_type.as_deref(), Some("application/json"));
                assert_eq!(body, br#"{"id":1}"#);
            }
            other => panic!("unexpected lookup: {:?}", other),
        }
    }

    fn raw_app(
        cache: InMemoryCache,
        counter: Arc<AtomicUsize>,
        content_type: &'static str,
        payload: Vec<u8>,
    ) -> Router {
        let guard = IdempotencyGuard::new(Arc::new(cache));
        Router::new()
            .route(
                "/pay",
                post(move || {
                    let counter = counter.clone();
                    let payload = payload.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        (
                            StatusCode::CREATED,
                            [(header::CONTENT_TYPE, content_type)],
                            payload,
                        )
                    }
                }),
            )
            .layer(from_fn_with_state(guard, idempotency_guard))
            .layer(from_fn(attach_principal))
    }

    async fn call_raw(app: &Router, key: &str) -> (StatusCode, Option<String>, Bytes) {
        let req = Request::builder()
            .method("POST")
            .uri("/pay")
            .header(HEADER_IDEMPOTENCY_KEY, key)
            .body(Body::empty())
            .unwrap();
        let res = app.clone().oneshot(req).await.unwrap();
        let status = res.status();
        let content_type = res
            .headers()
            .get(header::CONTENT_TYPE)
            .map(|v| v.to_str().unwrap().to_string());
        let body = res.into_body().collect().await.unwrap().to_bytes();
        (status, content_type, body)
    }

    #[tokio::test]
    async fn test_binary_response_replays_exact_bytes() {
        let counter = Arc::new(AtomicUsize::new(0));
        let payload = vec![0xff, 0xfe, 0x00];
        let app = raw_app(
            InMemoryCache::new(),
            counter.clone(),
            "application/octet-stream",
            payload.clone(),
        );

        let (s1, _, b1) = call_raw(&app, "k1").await;
        assert_eq!(s1, StatusCode::CREATED);
        assert_eq!(b1.as_ref(), payload.as_slice());

        let (s2, ct2, b2) = call_raw(&app, "k1").await;
        assert_eq!(s2, StatusCode::OK);
        assert_eq!(ct2.as_deref(), Some("application/octet-stream"));
        assert_eq!(b2.as_ref(), payload.as_slice());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_oversized_success_keeps_key_locked() {
        let cache = InMemoryCache::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let payload = vec![b'a'; MAX_CAPTURED_BODY_BYTES + 1024];
        let app = raw_app(cache.clone(), counter.clone(), "text/plain", payload.clone());

        let (s1, _, b1) = call_raw(&app, "k1").await;
        assert_eq!(s1, StatusCode::CREATED);
        assert_eq!(b1.len(), payload.len());

        let (s2, _, _) = call_raw(&app, "k1").await;
        assert_eq!(s2, StatusCode::CONFLICT);
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        match cache.get("idempotency:owner-1:k1").await {
            CacheLookup::Found(v) => assert_eq!(v, PROCESSING),
            other => panic!("unexpected lookup: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreadable_record_is_not_rerun() {
        let cache = InMemoryCache::new();
        cache
            .set_ex("idempotency:owner-1:k1", "{not a record", DEFAULT_RETENTION)
            .await
            .unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let app = app(cache, counter.clone(), StatusCode::CREATED);

        let (status, _, _) = call(&app, Some("k1")).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_no_key_means_no_guard() {
        let cache = InMemoryCache::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let app = app(cache.clone(), counter.clone(), StatusCode::CREATED);
        call(&app, None).await;
        call(&app, None).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_in_flight_key_conflicts() {
        let cache = InMemoryCache::new();
        cache
            .set_ex("idempotency:owner-1:k1", PROCESSING, DEFAULT_LOCK_TTL)
            .await
            .unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let app = app(cache, counter.clone(), StatusCode::CREATED);

        let (status, _, body) = call(&app, Some("k1")).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body.contains("error"));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failure_releases_key() {
        let cache = InMemoryCache::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let app = app(cache.clone(), counter.clone(), StatusCode::UNPROCESSABLE_ENTITY);

        let (s1, _, _) = call(&app, Some("k1")).await;
        assert_eq!(s1, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(cache.is_empty().await);

        let (s2, _, _) = call(&app, Some("k1")).await;
        assert_eq!(s2, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_keys_are_scoped_per_owner() {
        assert_eq!(
            IdempotencyGuard::storage_key("owner-1", "k1"),
            "idempotency:owner-1:k1"
        );
        assert_ne!(
            IdempotencyGuard::storage_key("owner-1", "k1"),
            IdempotencyGuard::storage_key("owner-2", "k1")
        );
    }

    #[tokio::test]
    async fn test_degraded_cache_fails_open() {
        let cache = InMemoryCache::new();
        cache.set_unavailable(true);
        let counter = Arc::new(AtomicUsize::new(0));
        let app = app(cache, counter.clone(), StatusCode::CREATED);

        let (status, _, _) = call(&app, Some("k1")).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
