//! Mutation guard: rate limit plus anti-forgery checks
//!
//! Every state-mutating entry point passes through here before touching
//! the database. The rate limit is evaluated first; forgery validation
//! never runs for an already-denied request. Anti-forgery enforcement is
//! a configuration flag so deployments can roll it out incrementally.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::ratelimit::{FixedWindowLimiter, Quota, RateDecision};

/// Rejection reasons, structured so the API layer can map them straight
/// to HTTP statuses (429 with Retry-After, 403).
#[derive(Debug, Error)]
pub enum GuardError {
    #[error("rate limit exceeded, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: i64 },

    #[error("forbidden: {reason}")]
    Forbidden { reason: &'static str },
}

/// Anti-forgery policy, threaded in explicitly at construction so the
/// behavior is testable without ambient configuration.
#[derive(Debug, Clone)]
pub struct GuardPolicy {
    pub enforce_antiforgery: bool,
    /// The service's own origin, e.g. "https://tickwatch.example".
    pub canonical_origin: Option<String>,
}

/// Request metadata a mutation endpoint hands to the guard.
#[derive(Debug, Clone, Copy)]
pub struct MutationRequest<'a> {
    /// Operation bucket, e.g. "snapshot" or "changes"
    pub bucket: &'a str,
    /// Authenticated caller identity (token name)
    pub identity: &'a str,
    /// Remote socket address the request arrived from
    pub source_addr: &'a str,
    pub antiforgery_token: Option<&'a str>,
    pub origin: Option<&'a str>,
}

pub struct MutationGuard {
    limiter: FixedWindowLimiter,
    policy: GuardPolicy,
    secret: [u8; 32],
}

impl MutationGuard {
    pub fn new(limiter: FixedWindowLimiter, policy: GuardPolicy, secret: [u8; 32]) -> Self {
        Self {
            limiter,
            policy,
            secret,
        }
    }

    /// The anti-forgery token bound to a caller: a digest of the process
    /// secret and the caller identity. Clients fetch it once and replay
    /// it on every mutation.
    pub fn token_for(&self, identity: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.secret);
        hasher.update([0u8]);
        hasher.update(identity.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Gate one mutation. Rate limit first; the forgery and origin checks
    /// only run for requests that made it past the limiter.
    pub fn check(
        &self,
        request: &MutationRequest<'_>,
        quota: Quota,
        now: DateTime<Utc>,
    ) -> Result<(), GuardError> {
        let identity = format!("{}@{}", request.identity, request.source_addr);
        match self.limiter.hit(request.bucket, &identity, quota, now) {
            RateDecision::Denied { retry_after_secs } => {
                return Err(GuardError::RateLimited { retry_after_secs });
            }
            RateDecision::Allowed { .. } => {}
        }

        if !self.policy.enforce_antiforgery {
            return Ok(());
        }

        let expected = self.token_for(request.identity);
        if request.antiforgery_token != Some(expected.as_str()) {
            tracing::warn!(
                identity = request.identity,
                bucket = request.bucket,
                "mutation rejected: missing or invalid anti-forgery token"
            );
            return Err(GuardError::Forbidden {
                reason: "missing or invalid anti-forgery token",
            });
        }

        if let Some(canonical) = self.policy.canonical_origin.as_deref()
            && request.origin != Some(canonical)
        {
            tracing::warn!(
                identity = request.identity,
                origin = ?request.origin,
                "mutation rejected: origin mismatch"
            );
            return Err(GuardError::Forbidden {
                reason: "request origin does not match canonical origin",
            });
        }

        Ok(())
    }

    /// Drop expired rate-limit windows; called opportunistically.
    pub fn prune(&self, now: DateTime<Utc>) {
        self.limiter.prune(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: [u8; 32] = [7u8; 32];

    fn guard(enforce: bool) -> MutationGuard {
        MutationGuard::new(
            FixedWindowLimiter::in_memory(),
            GuardPolicy {
                enforce_antiforgery: enforce,
                canonical_origin: Some("https://tickwatch.example".to_string()),
            },
            SECRET,
        )
    }

    fn request<'a>(token: Option<&'a str>, origin: Option<&'a str>) -> MutationRequest<'a> {
        MutationRequest {
            bucket: "snapshot",
            identity: "ci-bot",
            source_addr: "10.0.0.9",
            antiforgery_token: token,
            origin,
        }
    }

    #[test]
    fn valid_request_passes_both_checks() {
        let guard = guard(true);
        let token = guard.token_for("ci-bot");
        let req = request(Some(&token), Some("https://tickwatch.example"));
        assert!(guard.check(&req, Quota::per_minute(5), Utc::now()).is_ok());
    }

    #[test]
    fn token_is_stable_per_identity_and_differs_between_identities() {
        let guard = guard(true);
        assert_eq!(guard.token_for("ci-bot"), guard.token_for("ci-bot"));
        assert_ne!(guard.token_for("ci-bot"), guard.token_for("laptop"));
    }

    #[test]
    fn invalid_token_is_forbidden_when_enforced() {
        let guard = guard(true);
        let req = request(Some("bogus"), Some("https://tickwatch.example"));
        let err = guard.check(&req, Quota::per_minute(5), Utc::now()).unwrap_err();
        assert!(matches!(err, GuardError::Forbidden { .. }));
    }

    #[test]
    fn origin_mismatch_is_forbidden_when_enforced() {
        let guard = guard(true);
        let token = guard.token_for("ci-bot");
        let req = request(Some(&token), Some("https://evil.example"));
        let err = guard.check(&req, Quota::per_minute(5), Utc::now()).unwrap_err();
        assert!(matches!(err, GuardError::Forbidden { .. }));

        let missing = request(Some(&token), None);
        let err = guard
            .check(&missing, Quota::per_minute(5), Utc::now())
            .unwrap_err();
        assert!(matches!(err, GuardError::Forbidden { .. }));
    }

    #[test]
    fn enforcement_disabled_skips_forgery_checks() {
        let guard = guard(false);
        let req = request(None, Some("https://evil.example"));
        assert!(guard.check(&req, Quota::per_minute(5), Utc::now()).is_ok());
    }

    #[test]
    fn rate_limit_denial_short_circuits_the_forgery_check() {
        let guard = guard(true);
        let now = Utc::now();
        let quota = Quota::per_minute(1);
        let token = guard.token_for("ci-bot");

        let good = request(Some(&token), Some("https://tickwatch.example"));
        assert!(guard.check(&good, quota, now).is_ok());

        // Deliberately invalid origin: if the forgery check ran, this
        // would be a 403. The reported failure must be the rate limit.
        let bad_origin = request(Some(&token), Some("https://evil.example"));
        let err = guard.check(&bad_origin, quota, now).unwrap_err();
        match err {
            GuardError::RateLimited { retry_after_secs } => assert!(retry_after_secs > 0),
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn rate_limit_keys_include_source_address() {
        let guard = guard(false);
        let now = Utc::now();
        let quota = Quota::per_minute(1);

        let from_a = request(None, None);
        assert!(guard.check(&from_a, quota, now).is_ok());
        assert!(guard.check(&from_a, quota, now).is_err());

        // Same caller from another address gets its own window.
        let mut from_b = request(None, None);
        from_b.source_addr = "10.0.0.10";
        assert!(guard.check(&from_b, quota, now).is_ok());
    }
}
