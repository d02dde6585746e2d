// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the oidc-gatekeeper project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! PKCE material generation
//!
//! Code verifier and state values carry 256 bits of entropy each (32 random
//! bytes, base64url without padding). The code challenge is the S256
//! transform from RFC 7636: `BASE64URL(SHA256(ASCII(verifier)))`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::token::PkceSession;

/// Bytes of entropy behind each generated value.
const ENTROPY_BYTES: usize = 32;

fn random_urlsafe() -> String {
    let mut bytes = [0u8; ENTROPY_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Generate a PKCE code verifier.
pub fn generate_code_verifier() -> String {
    random_urlsafe()
}

/// Generate a CSRF state value.
pub fn generate_state() -> String {
    random_urlsafe()
}

/// Derive the S256 code challenge for a verifier.
pub fn code_challenge_s256(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// Create a fresh single-use PKCE session.
pub fn new_session() -> PkceSession {
    PkceSession {
        code_verifier: generate_code_verifier(),
        state: generate_state(),
        created_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_matches_the_rfc7636_vector() {
        // RFC 7636 appendix B.
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        assert_eq!(
            code_challenge_s256(verifier),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn generated_values_are_long_and_distinct() {
        let a = generate_code_verifier();
        let b = generate_code_verifier();
        // 32 bytes base64url-encode to 43 characters.
        assert_eq!(a.len(), 43);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }
}
