// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the oidc-gatekeeper project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Shared token data model
//!
//! This module defines the raw (opaque, cookie-carried) and decoded (verified)
//! token representations, the short-lived PKCE session, and the cookie naming
//! contract with the calling web layer.
//!
//! ## Invariants
//!
//! * A [`DecodedClaims`] value can only be constructed inside this crate,
//!   after every verification gate has passed.
//! * The refresh token is opaque: it is never decoded, never verified, and
//!   never printed. Its expiry is known only from the token endpoint's own
//!   response metadata.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};

/// Cookie name for the access token.
pub const ACCESS_TOKEN_COOKIE: &str = "access_token";
/// Cookie name for the OIDC ID token.
pub const ID_TOKEN_COOKIE: &str = "id_token";
/// Cookie name for the refresh token.
///
/// This cookie MUST be HTTP-only and MUST carry `Secure` plus a
/// `SameSite=Strict` or `SameSite=Lax` attribute: the refresh token is the one
/// secret that must never reach client script.
pub const REFRESH_TOKEN_COOKIE: &str = "refresh_token";
/// Cookie names a logout must clear, in addition to any PKCE flow cookies.
pub const SESSION_COOKIES: [&str; 3] =
    [ACCESS_TOKEN_COOKIE, ID_TOKEN_COOKIE, REFRESH_TOKEN_COOKIE];

/// Opaque token material as carried by cookies
///
/// Created on a successful code exchange or refresh, destroyed on logout.
/// The optional expiry timestamps are the provider's own `expires_in` /
/// `refresh_expires_in` response metadata converted to absolute instants; they
/// are advisory and never a substitute for signature verification.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RawTokenSet {
    /// Raw access token, if present.
    pub access: Option<String>,
    /// Raw ID token, if present.
    pub id: Option<String>,
    /// Raw refresh token, if present. Opaque: never decoded or verified.
    pub refresh: Option<String>,
    /// Provider-reported access token expiry.
    pub access_expires_at: Option<DateTime<Utc>>,
    /// Provider-reported refresh token expiry.
    pub refresh_expires_at: Option<DateTime<Utc>>,
}

/// Debug must never print raw token values.
impl std::fmt::Debug for RawTokenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn mark(t: &Option<String>) -> &'static str {
            if t.is_some() {
                "<present>"
            } else {
                "<absent>"
            }
        }
        f.debug_struct("RawTokenSet")
            .field("access", &mark(&self.access))
            .field("id", &mark(&self.id))
            .field("refresh", &mark(&self.refresh))
            .field("access_expires_at", &self.access_expires_at)
            .field("refresh_expires_at", &self.refresh_expires_at)
            .finish()
    }
}

impl RawTokenSet {
    /// True when no credential of any kind is present.
    pub fn is_empty(&self) -> bool {
        self.access.is_none() && self.id.is_none() && self.refresh.is_none()
    }
}

/// Verified JWT payload
///
/// Produced only by the Token Verifier after signature, issuer, audience and
/// expiry checks all passed; there is no public constructor. Unverified
/// decoding must never produce one of these.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedClaims(Map<String, Value>);

impl DecodedClaims {
    /// Crate-internal constructor, called by the verifier once all gates pass.
    pub(crate) fn from_verified(claims: Map<String, Value>) -> Self {
        DecodedClaims(claims)
    }

    /// Look up a top-level claim.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Walk a nested claim path, e.g. `["resource_access", "client", "roles"]`.
    ///
    /// Returns `None` as soon as any segment is absent or the intermediate
    /// value is not an object.
    pub fn claim_path(&self, path: &[&str]) -> Option<&Value> {
        let mut cursor: Option<&Value> = None;
        for segment in path {
            cursor = match cursor {
                None => self.0.get(*segment),
                Some(Value::Object(map)) => map.get(*segment),
                Some(_) => return None,
            };
            cursor?;
        }
        cursor
    }

    /// The `sub` claim, if present.
    pub fn subject(&self) -> Option<&str> {
        self.get("sub").and_then(Value::as_str)
    }

    /// The `iss` claim, if present.
    pub fn issuer(&self) -> Option<&str> {
        self.get("iss").and_then(Value::as_str)
    }

    /// The `exp` claim as a unix timestamp, if present.
    pub fn expires_at(&self) -> Option<i64> {
        self.get("exp").and_then(Value::as_i64)
    }

    /// All claims, for callers that need to hand the payload onward.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

/// Verified claims for the tokens of one session
///
/// The refresh token has no decoded form by design.
#[derive(Debug, Clone, Default)]
pub struct DecodedTokenSet {
    /// Claims of the verified access token.
    pub access: Option<DecodedClaims>,
    /// Claims of the verified ID token.
    pub id: Option<DecodedClaims>,
}

/// Short-lived PKCE state carried between the login redirect and the callback
///
/// Cookie-carried and single-use: the callback must delete it whether the
/// exchange succeeds or fails.
#[derive(Clone)]
pub struct PkceSession {
    /// The PKCE code verifier (high-entropy, base64url).
    pub code_verifier: String,
    /// The CSRF state value that must round-trip exactly.
    pub state: String,
    /// When the session was issued.
    pub created_at: DateTime<Utc>,
}

impl std::fmt::Debug for PkceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PkceSession")
            .field("code_verifier", &"<redacted>")
            .field("state", &"<redacted>")
            .field("created_at", &self.created_at)
            .finish()
    }
}

impl PkceSession {
    /// True once the session is older than `max_age` and must be rejected.
    pub fn is_expired(&self, max_age: Duration) -> bool {
        Utc::now() - self.created_at > max_age
    }
}

/// Peek at a JWT's `exp` claim without verifying anything.
///
/// Used solely for staleness decisions by the Refresh Orchestrator. The result
/// is untrusted and must never be used as evidence of validity.
pub(crate) fn unverified_expiry(token: &str) -> Option<i64> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
    let value: Value = serde_json::from_slice(&bytes).ok()?;
    value.get("exp")?.as_i64()
}
