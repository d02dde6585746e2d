// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the oidc-gatekeeper project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! # Signing Key Resolution
//!
//! This module resolves a token's key identifier to a verification key, with
//! support for both static keys and remote JWKS endpoints.
//!
//! ## Features
//!
//! * Static symmetric keys (HMAC) for shared-secret deployments
//! * Static asymmetric RSA / EC public keys from PEM data
//! * Remote JWKS fetching with a TTL cache and single-flight coalescing
//! * Algorithm-family validation for key types
//!
//! In static mode, [`KeyResolver::resolve`] is a constant-time lookup with no
//! network path at all.

pub mod jwks;

use anyhow::{anyhow, Result};
use jsonwebtoken::{Algorithm, DecodingKey};
use std::str::FromStr;
use std::time::Duration;

use crate::config::JwtSecret;
use crate::error::AuthError;
pub use jwks::{HttpJwksFetcher, JwksCache, JwksFetcher};

/// A verification key resolved for one key identifier
///
/// Immutable once fetched; owned by the resolver's cache in JWKS mode.
#[derive(Clone)]
pub struct SigningKey {
    /// The key identifier (`kid`) this key was resolved for.
    pub kid: String,
    /// The algorithm the JWKS document declares for this key, when it does.
    pub algorithm: Option<Algorithm>,
    /// The verification key itself.
    pub(crate) decoding_key: DecodingKey,
}

/// Debug must never expose key material.
impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("kid", &self.kid)
            .field("algorithm", &self.algorithm)
            .field("decoding_key", &"<DecodingKey>")
            .finish()
    }
}

impl SigningKey {
    /// The verification key for use with `jsonwebtoken`.
    pub fn decoding_key(&self) -> &DecodingKey {
        &self.decoding_key
    }
}

/// Pre-configured key material for deployments without a JWKS endpoint
///
/// Validates that the algorithm matches the key family, the same guard the
/// symmetric/asymmetric constructors need everywhere.
#[derive(Clone)]
pub struct StaticKeys {
    key: DecodingKey,
    algorithm: Algorithm,
}

impl std::fmt::Debug for StaticKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticKeys")
            .field("algorithm", &self.algorithm)
            .field("key", &"<DecodingKey>")
            .finish()
    }
}

impl StaticKeys {
    /// Create a static key from a symmetric HMAC secret.
    ///
    /// The algorithm must be one of HS256, HS384, HS512.
    pub fn from_secret(secret: &[u8], algorithm: Algorithm) -> Result<Self> {
        match algorithm {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => (),
            _ => {
                return Err(anyhow!(
                    "Algorithm {:?} is not valid for symmetric keys",
                    algorithm
                ))
            }
        }
        Ok(StaticKeys {
            key: DecodingKey::from_secret(secret),
            algorithm,
        })
    }

    /// Create a static key from a PEM encoded RSA public key.
    ///
    /// The algorithm must be one of RS256, RS384, RS512, PS256, PS384, PS512.
    pub fn from_rsa_pem(public_key: &[u8], algorithm: Algorithm) -> Result<Self> {
        match algorithm {
            Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::PS256
            | Algorithm::PS384
            | Algorithm::PS512 => (),
            _ => {
                return Err(anyhow!(
                    "Algorithm {:?} is not valid for RSA keys",
                    algorithm
                ))
            }
        }
        Ok(StaticKeys {
            key: DecodingKey::from_rsa_pem(public_key)?,
            algorithm,
        })
    }

    /// Create a static key from a PEM encoded EC public key.
    ///
    /// The algorithm must be ES256 or ES384.
    pub fn from_ec_pem(public_key: &[u8], algorithm: Algorithm) -> Result<Self> {
        match algorithm {
            Algorithm::ES256 | Algorithm::ES384 => (),
            _ => {
                return Err(anyhow!("Algorithm {:?} is not valid for EC keys", algorithm))
            }
        }
        Ok(StaticKeys {
            key: DecodingKey::from_ec_pem(public_key)?,
            algorithm,
        })
    }

    /// The key as a [`SigningKey`], the form the verifier consumes.
    pub fn signing_key(&self) -> SigningKey {
        SigningKey {
            kid: "static".to_string(),
            algorithm: Some(self.algorithm),
            decoding_key: self.key.clone(),
        }
    }
}

/// Resolves key identifiers to verification keys
///
/// The only component with cross-request state: its JWKS cache is read-mostly
/// and safe for concurrent access from many simultaneously handled requests.
pub enum KeyResolver {
    /// Pre-configured key, no network path.
    Static(StaticKeys),
    /// Remote JWKS endpoint with TTL cache and single-flight fetch.
    Jwks(JwksCache),
}

impl KeyResolver {
    /// Build a resolver from a parsed static-key / JWKS-URL secret blob.
    pub fn from_jwt_secret(secret: &JwtSecret, http_timeout: Duration) -> Result<Self> {
        let algorithm = Algorithm::from_str(&secret.key_type)
            .map_err(|_| anyhow!("Unknown JWT secret type '{}'", secret.key_type))?;
        if let Some(url) = &secret.jwk_url {
            let fetcher = HttpJwksFetcher::new(url.clone(), http_timeout)?;
            return Ok(KeyResolver::Jwks(JwksCache::new(Box::new(fetcher))));
        }
        let key = secret
            .key
            .as_ref()
            .ok_or_else(|| anyhow!("JWT secret carries neither a key nor a jwk_url"))?;
        let keys = match algorithm {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
                StaticKeys::from_secret(key.as_bytes(), algorithm)?
            }
            Algorithm::ES256 | Algorithm::ES384 => {
                StaticKeys::from_ec_pem(key.as_bytes(), algorithm)?
            }
            _ => StaticKeys::from_rsa_pem(key.as_bytes(), algorithm)?,
        };
        Ok(KeyResolver::Static(keys))
    }

    /// Build a JWKS-backed resolver for the given endpoint.
    pub fn from_jwks_uri(uri: impl Into<String>, http_timeout: Duration) -> Result<Self> {
        let fetcher = HttpJwksFetcher::new(uri.into(), http_timeout)?;
        Ok(KeyResolver::Jwks(JwksCache::new(Box::new(fetcher))))
    }

    /// Resolve a key identifier to a verification key.
    ///
    /// Static mode ignores the `kid` and returns the configured key. JWKS
    /// mode requires a `kid` and consults the cache, fetching the key set on
    /// a miss; concurrent misses coalesce into one outstanding fetch.
    pub async fn resolve(&self, kid: Option<&str>) -> Result<SigningKey, AuthError> {
        match self {
            KeyResolver::Static(keys) => Ok(keys.signing_key()),
            KeyResolver::Jwks(cache) => {
                let kid = kid.ok_or_else(|| AuthError::KeyResolutionFailed {
                    reason: "token header carries no key id (kid)".to_string(),
                })?;
                cache.resolve(kid).await
            }
        }
    }
}
