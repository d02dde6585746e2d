// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the oidc-gatekeeper project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Error taxonomy for the authentication core
//!
//! Every failure surfaced to a caller is one of the typed variants below.
//! Verification and authorization failures are never collapsed into a generic
//! "unauthenticated" outcome: callers and audit logs need the specific reason.

use thiserror::Error;

/// Why the Flow Manager's refresh grant failed
///
/// The distinction matters to callers: a rejected refresh token means the user
/// must re-authenticate, while a transient failure may be retried by an outer
/// retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshErrorKind {
    /// The provider rejected the grant (`invalid_grant`): the refresh token is
    /// expired, revoked, or already consumed by a rotation.
    Rejected,
    /// The token endpoint could not be reached or returned a non-protocol error.
    Transient,
}

/// Why the Authorization Rule Engine denied access
///
/// Denials are data, not faults: a broken rule surfaces as
/// [`AuthError::RuleEvaluationFailed`] instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenialReason {
    /// The configured roles claim path is absent from the token entirely.
    ///
    /// This is the identity-provider misconfiguration case: the user presented
    /// a perfectly valid token but the IdP never added the roles mapping. It is
    /// kept distinct from [`DenialReason::RoleNotGranted`] so operators can
    /// diagnose IdP setup separately from least-privilege denials.
    NoRolesClaim,
    /// The roles claim exists but does not contain the required role.
    RoleNotGranted { role: String },
    /// A caller-supplied rule evaluated to something other than literal `true`.
    RuleRejected,
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenialReason::NoRolesClaim => {
                write!(f, "token is valid but carries no roles claim (check the IdP claims mapping)")
            }
            DenialReason::RoleNotGranted { role } => {
                write!(f, "token roles do not include '{}'", role)
            }
            DenialReason::RuleRejected => write!(f, "access rule evaluated to a non-true result"),
        }
    }
}

/// Typed failures of the authentication/authorization core
#[derive(Error, Debug)]
pub enum AuthError {
    /// The raw token is not a parsable JWT (missing or undecodable header).
    #[error("malformed token: {reason}")]
    MalformedToken { reason: String },

    /// No signing key could be resolved for the token's key identifier.
    #[error("signing key resolution failed: {reason}")]
    KeyResolutionFailed { reason: String },

    /// The token's algorithm is `none` or absent from the policy allow-list.
    #[error("token algorithm '{algorithm}' is not allowed by the verification policy")]
    UnsupportedAlgorithm { algorithm: String },

    /// The cryptographic signature did not verify against the resolved key.
    #[error("token signature is invalid")]
    InvalidSignature,

    /// The token's `exp` is in the past, beyond the clock-skew tolerance.
    #[error("token expired")]
    TokenExpired,

    /// The token's `iss` claim does not exactly equal the configured issuer.
    #[error("issuer mismatch: expected '{expected}', token carries '{found}'")]
    IssuerMismatch { expected: String, found: String },

    /// None of the token's `aud` values is a configured audience.
    #[error("audience mismatch: token audiences {found:?} share no value with the policy")]
    AudienceMismatch { found: Vec<String> },

    /// The authorization-code exchange was rejected by the provider.
    ///
    /// Wraps the provider's error detail; the client secret is never included.
    #[error("authorization code exchange failed: {detail}")]
    Exchange { detail: String },

    /// The refresh grant failed; see [`RefreshErrorKind`] for whether a
    /// re-login is required or the failure is transient.
    #[error("token refresh failed ({kind:?}): {detail}")]
    Refresh {
        detail: String,
        kind: RefreshErrorKind,
    },

    /// Terminal outcome: no usable credentials remain and the caller must
    /// redirect to the login flow. Never retryable.
    #[error("re-authentication required")]
    ReauthenticationRequired,

    /// A caller-supplied rule raised an internal fault during evaluation.
    ///
    /// This is a server/policy fault, not a user credential problem, and must
    /// be distinguishable from a denial.
    #[error("access rule evaluation failed: {source}")]
    RuleEvaluationFailed {
        #[source]
        source: anyhow::Error,
    },

    /// The rule engine denied access for the given reason.
    #[error("access denied: {reason}")]
    AccessDenied { reason: DenialReason },

    /// The identity provider could not be reached.
    #[error("identity provider unreachable: {detail}")]
    ProviderUnreachable { detail: String },

    /// A network operation exceeded its configured timeout.
    #[error("timed out during {operation}")]
    Timeout { operation: &'static str },
}

impl AuthError {
    /// Map a transport-level error onto the taxonomy.
    ///
    /// Timeouts get their own variant so callers can bound retry policies;
    /// everything else is `ProviderUnreachable`.
    pub(crate) fn from_transport(err: reqwest::Error, operation: &'static str) -> Self {
        if err.is_timeout() {
            AuthError::Timeout { operation }
        } else {
            AuthError::ProviderUnreachable {
                detail: err.to_string(),
            }
        }
    }

    /// True when the caller should treat the session as unauthenticated and
    /// redirect to the login flow.
    ///
    /// [`AuthError::RuleEvaluationFailed`] is deliberately excluded: it is a
    /// policy fault, not a credential problem.
    pub fn requires_login(&self) -> bool {
        !matches!(
            self,
            AuthError::RuleEvaluationFailed { .. }
                | AuthError::ProviderUnreachable { .. }
                | AuthError::Timeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_faults_are_not_login_redirects() {
        let err = AuthError::RuleEvaluationFailed {
            source: anyhow::anyhow!("boom"),
        };
        assert!(!err.requires_login());
        assert!(AuthError::TokenExpired.requires_login());
        assert!(AuthError::ReauthenticationRequired.requires_login());
    }

    #[test]
    fn denial_reasons_name_the_missing_role() {
        let reason = DenialReason::RoleNotGranted {
            role: "aerie-admin".into(),
        };
        assert!(reason.to_string().contains("aerie-admin"));
    }
}
