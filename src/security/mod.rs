pub mod audit_log;
pub mod auth;
pub mod credentials;
pub mod idempotency;
pub mod principal;
pub mod request_signer;
pub mod session_store;
pub mod token_service;

pub use auth::{AuthError, CredentialResolver};
pub use idempotency::IdempotencyGuard;
pub use principal::{Principal, Role};
pub use session_store::{EncryptedSessionStore, SessionRecord};
pub use token_service::{TokenClaims, TokenPair, TokenService};
