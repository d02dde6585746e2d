// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the oidc-gatekeeper project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Bearer token verification
//!
//! [`Verifier::verify`] runs six ordered hard gates; there is no partial
//! success and no gate is skipped:
//!
//! 1. Header decode, failing as `MalformedToken`
//! 2. Algorithm allow-list (rejects `none` and anything not explicitly
//!    allowed), failing as `UnsupportedAlgorithm`
//! 3. Key resolution via the [`KeyResolver`], failing as `KeyResolutionFailed`
//! 4. Signature plus `exp` with clock-skew leeway, failing as
//!    `InvalidSignature` or `TokenExpired`
//! 5. Exact `iss` equality, failing as `IssuerMismatch`
//! 6. `aud` intersection with the configured audiences, failing as
//!    `AudienceMismatch`
//!
//! A [`DecodedClaims`] value exists only when every gate passed. The verifier
//! never mutates shared state and is safe to call concurrently.
//!
//! Note the gate order places the algorithm check before key resolution: an
//! `alg: none` token must be reported as `UnsupportedAlgorithm` even when it
//! carries no resolvable key id.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, Validation};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::str::FromStr;
use std::sync::Arc;

use crate::config::VerificationPolicy;
use crate::error::AuthError;
use crate::keys::KeyResolver;
use crate::token::DecodedClaims;

/// The unverified JWT header fields this crate consumes.
///
/// Parsed manually rather than through `jsonwebtoken::decode_header` so that
/// an unknown or `none` algorithm surfaces as `UnsupportedAlgorithm` instead
/// of a generic decode failure.
#[derive(Debug, Deserialize)]
struct RawHeader {
    alg: String,
    #[serde(default)]
    kid: Option<String>,
}

/// Decode the header segment without verifying anything.
fn decode_raw_header(token: &str) -> Result<RawHeader, AuthError> {
    let mut parts = token.split('.');
    let header_segment = parts.next().filter(|s| !s.is_empty()).ok_or_else(|| {
        AuthError::MalformedToken {
            reason: "no header segment".to_string(),
        }
    })?;
    if parts.count() != 2 {
        return Err(AuthError::MalformedToken {
            reason: "token is not a three-segment JWT".to_string(),
        });
    }
    let bytes = URL_SAFE_NO_PAD
        .decode(header_segment)
        .map_err(|e| AuthError::MalformedToken {
            reason: format!("header is not base64url: {}", e),
        })?;
    serde_json::from_slice::<RawHeader>(&bytes).map_err(|e| AuthError::MalformedToken {
        reason: format!("header is not a JSON object: {}", e),
    })
}

/// Token verifier bound to one policy and one key resolver
pub struct Verifier {
    resolver: Arc<KeyResolver>,
    policy: VerificationPolicy,
}

impl Verifier {
    /// Create a verifier. The policy is read-only for the verifier's lifetime.
    pub fn new(resolver: Arc<KeyResolver>, policy: VerificationPolicy) -> Self {
        Verifier { resolver, policy }
    }

    /// The verification policy this verifier enforces.
    pub fn policy(&self) -> &VerificationPolicy {
        &self.policy
    }

    /// Verify a raw token and return its claims.
    ///
    /// See the module documentation for the gate order. The returned
    /// [`DecodedClaims`] is the only way this crate produces trusted claims.
    pub async fn verify(&self, token: &str) -> Result<DecodedClaims, AuthError> {
        // Gate 1: header decode.
        let header = decode_raw_header(token)?;

        // Gate 2: strict algorithm allow-list. `none` never parses as an
        // Algorithm, so it falls out here too.
        let algorithm =
            Algorithm::from_str(&header.alg).map_err(|_| AuthError::UnsupportedAlgorithm {
                algorithm: header.alg.clone(),
            })?;
        if !self.policy.allows_algorithm(algorithm) {
            return Err(AuthError::UnsupportedAlgorithm {
                algorithm: header.alg.clone(),
            });
        }

        // Gate 3: key resolution.
        let key = self.resolver.resolve(header.kid.as_deref()).await?;

        // A key that declares its own algorithm must agree with the token
        // header; a mismatch is the classic confusion attack shape.
        if let Some(key_algorithm) = key.algorithm {
            if key_algorithm != algorithm {
                return Err(AuthError::UnsupportedAlgorithm {
                    algorithm: header.alg.clone(),
                });
            }
        }

        // Gate 4: signature and expiry. Issuer and audience are checked
        // manually below to keep the gate order exact.
        let mut validation = Validation::new(algorithm);
        validation.leeway = self.policy.clock_skew.as_secs();
        validation.validate_exp = true;
        validation.validate_aud = false;
        let data = jsonwebtoken::decode::<Map<String, Value>>(token, key.decoding_key(), &validation)
            .map_err(map_decode_error)?;
        let claims = data.claims;

        // Gate 5: exact issuer equality.
        let issuer = claims.get("iss").and_then(Value::as_str).unwrap_or("");
        if issuer != self.policy.issuer {
            return Err(AuthError::IssuerMismatch {
                expected: self.policy.issuer.clone(),
                found: issuer.to_string(),
            });
        }

        // Gate 6: at least one configured audience must be present.
        if !self.policy.audiences.is_empty() {
            let found = audiences_of(&claims);
            if !found.iter().any(|aud| self.policy.audiences.contains(aud)) {
                return Err(AuthError::AudienceMismatch { found });
            }
        }

        Ok(DecodedClaims::from_verified(claims))
    }
}

/// Collect the token's `aud` claim as a list, whether string or array.
fn audiences_of(claims: &Map<String, Value>) -> Vec<String> {
    match claims.get("aud") {
        Some(Value::String(aud)) => vec![aud.clone()],
        Some(Value::Array(entries)) => entries
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_owned)
            .collect(),
        _ => Vec::new(),
    }
}

/// Map `jsonwebtoken` decode failures onto the error taxonomy.
fn map_decode_error(err: jsonwebtoken::errors::Error) -> AuthError {
    match err.kind() {
        ErrorKind::ExpiredSignature => AuthError::TokenExpired,
        ErrorKind::InvalidSignature => AuthError::InvalidSignature,
        ErrorKind::InvalidAlgorithm | ErrorKind::InvalidAlgorithmName => {
            AuthError::UnsupportedAlgorithm {
                algorithm: "<key/algorithm mismatch>".to_string(),
            }
        }
        _ => AuthError::MalformedToken {
            reason: err.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fake_token(header: Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header).unwrap());
        let payload = URL_SAFE_NO_PAD.encode(b"{}");
        format!("{}.{}.signature", header, payload)
    }

    #[test]
    fn header_decoding_extracts_alg_and_kid() {
        let token = fake_token(json!({"alg": "RS256", "kid": "key-1"}));
        let header = decode_raw_header(&token).unwrap();
        assert_eq!(header.alg, "RS256");
        assert_eq!(header.kid.as_deref(), Some("key-1"));
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            decode_raw_header("definitely-not-a-jwt"),
            Err(AuthError::MalformedToken { .. })
        ));
        assert!(matches!(
            decode_raw_header(""),
            Err(AuthError::MalformedToken { .. })
        ));
        assert!(matches!(
            decode_raw_header("a.b"),
            Err(AuthError::MalformedToken { .. })
        ));
    }

    #[test]
    fn aud_claim_accepts_string_or_array() {
        let mut claims = Map::new();
        claims.insert("aud".into(), json!("aerie"));
        assert_eq!(audiences_of(&claims), vec!["aerie".to_string()]);
        claims.insert("aud".into(), json!(["aerie", "gateway"]));
        assert_eq!(
            audiences_of(&claims),
            vec!["aerie".to_string(), "gateway".to_string()]
        );
        claims.remove("aud");
        assert!(audiences_of(&claims).is_empty());
    }
}
