//! Bearer-token authentication and scope checks.
//!
//! The token comparison is constant-time (`subtle`): the control plane
//! faces untrusted networks in typical deployments, and a byte-by-byte
//! short-circuit comparison leaks prefix length.

use std::collections::HashSet;

use axum::http::HeaderMap;
use subtle::ConstantTimeEq;

use crate::error::{E2castError, E2castResult};

/// Token + scope policy, snapshotted from configuration at startup.
pub struct AuthPolicy {
    token: String,
    scopes: HashSet<String>,
}

impl AuthPolicy {
    /// Creates the policy. An empty token disables authentication
    /// (development only; the server logs a warning at startup).
    pub fn new(token: String, scopes: Vec<String>) -> Self {
        Self {
            token,
            scopes: scopes.into_iter().collect(),
        }
    }

    /// Whether authentication is enabled at all.
    #[must_use]
    pub fn enabled(&self) -> bool {
        !self.token.is_empty()
    }

    /// Authenticates the request and authorizes `required_scope`.
    ///
    /// `remote` and the user agent are logged on failures; the response
    /// carries no detail beyond the status.
    pub fn authorize(
        &self,
        headers: &HeaderMap,
        remote: &str,
        required_scope: &'static str,
    ) -> E2castResult<()> {
        if !self.enabled() {
            return Ok(());
        }

        let presented = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "));

        let Some(presented) = presented else {
            self.log_rejection(headers, remote, "missing or malformed bearer token");
            return Err(E2castError::Unauthorized);
        };

        if !token_matches(presented.as_bytes(), self.token.as_bytes()) {
            self.log_rejection(headers, remote, "invalid token");
            return Err(E2castError::Unauthorized);
        }

        if !self.scopes.contains(required_scope) {
            self.log_rejection(headers, remote, "missing scope");
            return Err(E2castError::Forbidden(required_scope));
        }
        Ok(())
    }

    fn log_rejection(&self, headers: &HeaderMap, remote: &str, why: &str) {
        let user_agent = headers
            .get(axum::http::header::USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("-");
        log::warn!(
            "[Auth] Rejected request from {} (ua={:?}): {}",
            remote,
            user_agent,
            why
        );
    }
}

/// Constant-time equality. Length mismatch still fails, but the byte
/// comparison itself never short-circuits.
fn token_matches(presented: &[u8], expected: &[u8]) -> bool {
    if presented.len() != expected.len() {
        // Burn a comparison anyway so the rejection path stays flat.
        let _ = expected.ct_eq(expected);
        return false;
    }
    presented.ct_eq(expected).into()
}
