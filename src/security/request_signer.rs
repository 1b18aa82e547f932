use axum::body::{to_bytes, Body};
use axum::extract::Request;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

// signature = hex(HMAC-SHA256(secret, timestamp || method || uri || hex(sha256(body))))

type HmacSha256 = Hmac<Sha256>;

/// Upper bound on a body buffered for hashing.
pub const MAX_SIGNED_BODY_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("invalid timestamp")]
    InvalidTimestamp,
    #[error("stale request (timestamp skew)")]
    Stale,
    #[error("invalid signature encoding")]
    Encoding,
    #[error("signature mismatch")]
    Mismatch,
    #[error("invalid hmac key")]
    Key,
    #[error("request body could not be read")]
    Body,
}

/// The request attributes covered by a signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedRequest {
    pub method: String,
    pub uri: String,
    pub body_hash: String,
}

impl SignedRequest {
    pub fn new(method: impl Into<String>, uri: impl Into<String>, body: &[u8]) -> Self {
        Self {
            method: method.into(),
            uri: uri.into(),
            body_hash: sha256_hex(body),
        }
    }

    pub fn string_to_sign(&self, timestamp: &str) -> String {
        string_to_sign(timestamp, &self.method, &self.uri, &self.body_hash)
    }
}

/// Lowercase hex SHA-256. An empty body hashes to the digest of zero bytes.
pub fn sha256_hex(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

pub fn string_to_sign(timestamp: &str, method: &str, uri: &str, body_hash: &str) -> String {
    let mut s = String::with_capacity(timestamp.len() + method.len() + uri.len() + body_hash.len());
    s.push_str(timestamp);
    s.push_str(method);
    s.push_str(uri);
    s.push_str(body_hash);
    s
}

pub fn compute_signature_hex(secret: &str, message: &str) -> Result<String, SignatureError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::Key)?;
    mac.update(message.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Checks timestamp freshness, then compares the provided hex signature with
/// the expected one in constant time.
pub fn verify_signature(
    secret: &str,
    provided_hex: &str,
    timestamp: &str,
    request: &SignedRequest,
    now: i64,
    max_skew_secs: i64,
) -> Result<(), SignatureError> {
    let ts_val: i64 = timestamp
        .parse()
        .map_err(|_| SignatureError::InvalidTimestamp)?;
    if (now - ts_val).abs() > max_skew_secs {
        return Err(SignatureError::Stale);
    }

    let provided = hex::decode(provided_hex.trim()).map_err(|_| SignatureError::Encoding)?;

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::Key)?;
    mac.update(request.string_to_sign(timestamp).as_bytes());
    let expected = mac.finalize().into_bytes();

    if provided.ct_eq(expected.as_slice()).unwrap_u8() == 1 {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

/// Buffers the body once, hashes it, and hands back a request whose body
/// replays the same bytes for downstream handlers.
pub async fn hash_and_restore_body(req: Request) -> Result<(Request, SignedRequest), SignatureError> {
    let (parts, body) = req.into_parts();
    let bytes = to_bytes(body, MAX_SIGNED_BODY_BYTES)
        .await
        .map_err(|_| SignatureError::Body)?;
    let uri = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());
    let signed = SignedRequest::new(parts.method.as_str(), uri, &bytes);
    Ok((Request::from_parts(parts, Body::from(bytes)), signed))
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;
    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    fn sign(secret: &str, ts: &str, req: &SignedRequest) -> String {
        compute_signature_hex(secret, &req.string_to_sign(ts)).unwrap()
    }

    #[test]
    fn test_empty_body_hash() {
        assert_eq!(sha256_hex(b""), EMPTY_SHA256);
    }

    #[test]
    fn test_string_to_sign_is_plain_concatenation() {
        let req = SignedRequest::new("POST", "/api/v1/payments?dry_run=1", b"");
        assert_eq!(
            req.string_to_sign("1700000000"),
            format!("1700000000POST/api/v1/payments?dry_run=1{EMPTY_SHA256}")
        );
    }

    #[test]
    fn test_known_hmac_vector() {
        // RFC 4231 test case 2
        let sig = compute_signature_hex("Jefe", "what do ya want for nothing?").unwrap();
        assert_eq!(
            sig,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_verify_ok() {
        let req = SignedRequest::new("POST", "/pay", br#"{"amount":10}"#);
        let ts = NOW.to_string();
        let sig = sign("s3cret", &ts, &req);
        assert_eq!(verify_signature("s3cret", &sig, &ts, &req, NOW, 300), Ok(()));
        // uppercase hex is accepted
        assert_eq!(
            verify_signature("s3cret", &sig.to_uppercase(), &ts, &req, NOW, 300),
            Ok(())
        );
    }

    #[test]
    fn test_verify_rejects_changed_inputs() {
        let req = SignedRequest::new("POST", "/pay", br#"{"amount":10}"#);
        let ts = NOW.to_string();
        let sig = sign("s3cret", &ts, &req);

        let other_body = SignedRequest::new("POST", "/pay", br#"{"amount":11}"#);
        let other_method = SignedRequest::new("PUT", "/pay", br#"{"amount":10}"#);
        let other_uri = SignedRequest::new("POST", "/pay?x=1", br#"{"amount":10}"#);
        for r in [&other_body, &other_method, &other_uri] {
            assert_eq!(
                verify_signature("s3cret", &sig, &ts, r, NOW, 300),
                Err(SignatureError::Mismatch)
            );
        }
        assert_eq!(
            verify_signature("wrong", &sig, &ts, &req, NOW, 300),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_verify_timestamp_rules() {
        let req = SignedRequest::new("GET", "/me", b"");
        let stale = (NOW - 301).to_string();
        let sig = sign("k", &stale, &req);
        assert_eq!(
            verify_signature("k", &sig, &stale, &req, NOW, 300),
            Err(SignatureError::Stale)
        );
        assert_eq!(
            verify_signature("k", &sig, "yesterday", &req, NOW, 300),
            Err(SignatureError::InvalidTimestamp)
        );
        assert_eq!(
            verify_signature("k", "zz-not-hex", &NOW.to_string(), &req, NOW, 300),
            Err(SignatureError::Encoding)
        );
    }

    #[tokio::test]
    async fn test_hash_and_restore_body() {
        let req = Request::builder()
            .method("POST")
            .uri("/api/v1/payments?currency=usdc")
            .body(Body::from(r#"{"amount":5}"#))
            .unwrap();
        let (req, signed) = hash_and_restore_body(req).await.unwrap();
        assert_eq!(signed.method, "POST");
        assert_eq!(signed.uri, "/api/v1/payments?currency=usdc");
        assert_eq!(signed.body_hash, sha256_hex(br#"{"amount":5}"#));

        let replayed = to_bytes(req.into_body(), 1024).await.unwrap();
        assert_eq!(&replayed[..], br#"{"amount":5}"#);
    }
}
