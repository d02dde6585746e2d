// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the oidc-gatekeeper project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! JWKS cache with single-flight fetching
//!
//! The cache holds the provider's published key set, keyed by `kid`, for a
//! configurable TTL. A resolution miss (unknown `kid`, or TTL expired)
//! triggers a fetch of the full JWKS document; concurrent misses collapse
//! into a single outstanding fetch and every waiter observes that fetch's
//! result, success or failure. A transient transport failure is retried once
//! before surfacing as `KeyResolutionFailed`.

use async_trait::async_trait;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, DecodingKey};
use log::{debug, warn};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

use super::SigningKey;
use crate::error::AuthError;

/// Default lifetime of a fetched key set.
const DEFAULT_TTL: Duration = Duration::from_secs(600);

/// Transport seam for fetching the JWKS document.
///
/// Tests inject counting or failing fetchers here; production uses
/// [`HttpJwksFetcher`].
#[async_trait]
pub trait JwksFetcher: Send + Sync {
    /// Fetch and parse the provider's full JWKS document.
    async fn fetch(&self) -> Result<JwkSet, AuthError>;
}

/// Reqwest-backed JWKS fetcher with a bounded request timeout.
pub struct HttpJwksFetcher {
    client: reqwest::Client,
    uri: String,
}

impl HttpJwksFetcher {
    /// Build a fetcher for the given JWKS endpoint.
    pub fn new(uri: String, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(HttpJwksFetcher { client, uri })
    }
}

#[async_trait]
impl JwksFetcher for HttpJwksFetcher {
    async fn fetch(&self) -> Result<JwkSet, AuthError> {
        debug!("Fetching JWKS document from {}", self.uri);
        let response = self
            .client
            .get(&self.uri)
            .send()
            .await
            .map_err(|e| AuthError::from_transport(e, "JWKS fetch"))?;
        let response = response.error_for_status().map_err(|e| {
            AuthError::KeyResolutionFailed {
                reason: format!("JWKS endpoint returned an error status: {}", e),
            }
        })?;
        response
            .json::<JwkSet>()
            .await
            .map_err(|e| AuthError::KeyResolutionFailed {
                reason: format!("JWKS document is not a valid key set: {}", e),
            })
    }
}

/// Cache contents plus the bookkeeping the single-flight protocol needs.
struct CacheState {
    keys: HashMap<String, SigningKey>,
    fetched_at: Option<Instant>,
    /// Bumped on every completed fetch, success or failure. Waiters compare
    /// generations to detect that someone else already fetched for them.
    generation: u64,
    /// Failure detail of the most recent fetch, shared with coalesced waiters.
    last_error: Option<String>,
}

impl CacheState {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.fetched_at
            .map(|at| at.elapsed() < ttl)
            .unwrap_or(false)
    }
}

/// TTL cache over a remote JWKS endpoint
///
/// Read-mostly: lookups take a read lock; only a completed fetch takes the
/// write lock. The fetch mutex is the one place this crate serializes work.
pub struct JwksCache {
    fetcher: Box<dyn JwksFetcher>,
    ttl: Duration,
    state: RwLock<CacheState>,
    fetch_lock: Mutex<()>,
}

impl JwksCache {
    /// Create a cache with the default TTL.
    pub fn new(fetcher: Box<dyn JwksFetcher>) -> Self {
        Self::with_ttl(fetcher, DEFAULT_TTL)
    }

    /// Create a cache with an explicit TTL.
    pub fn with_ttl(fetcher: Box<dyn JwksFetcher>, ttl: Duration) -> Self {
        JwksCache {
            fetcher,
            ttl,
            state: RwLock::new(CacheState {
                keys: HashMap::new(),
                fetched_at: None,
                generation: 0,
                last_error: None,
            }),
            fetch_lock: Mutex::new(()),
        }
    }

    /// Resolve a `kid`, fetching the key set on a miss.
    pub async fn resolve(&self, kid: &str) -> Result<SigningKey, AuthError> {
        // Fast path: fresh cache hit under the read lock.
        let seen_generation = {
            let state = self.state.read().await;
            if state.is_fresh(self.ttl) {
                if let Some(key) = state.keys.get(kid) {
                    return Ok(key.clone());
                }
            }
            state.generation
        };

        // Miss (or expired): at most one fetch may be outstanding.
        let _fetch_guard = self.fetch_lock.lock().await;

        // A fetch completed while we waited for the lock; its result is ours.
        {
            let state = self.state.read().await;
            if state.generation != seen_generation {
                return Self::lookup(&state, kid);
            }
        }

        // We are the fetching task. One retry on transport failure only.
        let fetched = match self.fetcher.fetch().await {
            Ok(set) => Ok(set),
            Err(AuthError::ProviderUnreachable { detail }) => {
                warn!("JWKS fetch failed ({}), retrying once", detail);
                self.fetcher.fetch().await
            }
            Err(AuthError::Timeout { operation }) => {
                warn!("JWKS fetch timed out during {}, retrying once", operation);
                self.fetcher.fetch().await
            }
            Err(other) => Err(other),
        };

        let mut state = self.state.write().await;
        state.generation += 1;
        match fetched {
            Ok(set) => {
                state.keys = index_key_set(&set);
                state.fetched_at = Some(Instant::now());
                state.last_error = None;
                debug!("JWKS cache refreshed: {} usable keys", state.keys.len());
                Self::lookup(&state, kid)
            }
            Err(err) => {
                state.last_error = Some(err.to_string());
                Err(AuthError::KeyResolutionFailed {
                    reason: err.to_string(),
                })
            }
        }
    }

    /// Resolve against the current state after a completed fetch.
    ///
    /// A failed fetch poisons the whole generation: waiters must see the
    /// failure rather than a stale entry from the previous key set.
    fn lookup(state: &CacheState, kid: &str) -> Result<SigningKey, AuthError> {
        if let Some(detail) = &state.last_error {
            return Err(AuthError::KeyResolutionFailed {
                reason: format!("JWKS fetch failed: {}", detail),
            });
        }
        if let Some(key) = state.keys.get(kid) {
            return Ok(key.clone());
        }
        Err(AuthError::KeyResolutionFailed {
            reason: format!("key id '{}' not present in the provider's key set", kid),
        })
    }
}

/// Index a parsed JWKS document by `kid`, skipping unusable entries.
fn index_key_set(set: &JwkSet) -> HashMap<String, SigningKey> {
    let mut keys = HashMap::new();
    for jwk in &set.keys {
        let Some(kid) = jwk.common.key_id.clone() else {
            warn!("Skipping JWKS entry without a kid");
            continue;
        };
        let decoding_key = match DecodingKey::from_jwk(jwk) {
            Ok(key) => key,
            Err(err) => {
                warn!("Skipping unusable JWKS entry '{}': {}", kid, err);
                continue;
            }
        };
        let algorithm = jwk
            .common
            .key_algorithm
            .and_then(|alg| Algorithm::from_str(&alg.to_string()).ok());
        keys.insert(
            kid.clone(),
            SigningKey {
                kid,
                algorithm,
                decoding_key,
            },
        );
    }
    keys
}
