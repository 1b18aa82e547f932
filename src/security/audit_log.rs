use tracing::{error, info, warn};

/// Structured security events, emitted under the `audit` target.
///
/// Only identifiers are logged. Tokens, secrets, signatures and session
/// payloads never reach this logger.
#[derive(Debug, Clone, Default)]
pub struct AuditLogger;

impl AuditLogger {
    pub fn new() -> Self {
        Self
    }

    pub fn auth_success(&self, user_id: &str, request_id: Option<&str>, method: &str) {
        info!(target: "audit", event = "auth_success", user_id, request_id = request_id.unwrap_or(""), method);
    }

    pub fn auth_failure(&self, request_id: Option<&str>, reason: &str) {
        warn!(target: "audit", event = "auth_failure", request_id = request_id.unwrap_or(""), reason);
    }

    pub fn signature_invalid(&self, subject: Option<&str>, request_id: Option<&str>) {
        warn!(target: "audit", event = "signature_invalid", subject = subject.unwrap_or(""), request_id = request_id.unwrap_or(""));
    }

    pub fn untrusted_proxy(&self, request_id: Option<&str>) {
        warn!(target: "audit", event = "untrusted_proxy", request_id = request_id.unwrap_or(""));
    }

    pub fn idempotency_conflict(&self, user_id: &str, request_id: Option<&str>) {
        warn!(target: "audit", event = "idempotency_conflict", user_id, request_id = request_id.unwrap_or(""));
    }

    pub fn idempotency_replay(&self, user_id: &str, request_id: Option<&str>) {
        info!(target: "audit", event = "idempotency_replay", user_id, request_id = request_id.unwrap_or(""));
    }

    pub fn storage_degraded(&self, component: &str, request_id: Option<&str>, error_msg: &str) {
        warn!(target: "audit", event = "storage_degraded", component, request_id = request_id.unwrap_or(""), error = error_msg);
    }

    pub fn internal_error(&self, request_id: Option<&str>, error_msg: &str) {
        error!(target: "audit", event = "internal_error", request_id = request_id.unwrap_or(""), error = error_msg);
    }
}
