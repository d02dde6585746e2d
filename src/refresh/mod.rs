// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the oidc-gatekeeper project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Refresh orchestration
//!
//! Decides, per request, whether a token set is stale and must be refreshed
//! before use, and performs that refresh exactly once per stale window.
//!
//! Providers that rotate refresh tokens invalidate the old token on first
//! use, so two concurrent requests carrying the same stale refresh token must
//! not both post the refresh grant. The orchestrator serializes refreshes per
//! refresh token and caches the rotation result: whichever request wins
//! performs the exchange, and every other holder of that token receives the
//! same rotated set.
//!
//! The refresh token itself stays opaque throughout: its expiry is known only
//! from the provider's own response metadata, never by decoding it.

use chrono::{Duration as ChronoDuration, Utc};
use log::{debug, warn};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::error::{AuthError, RefreshErrorKind};
use crate::flow::OAuthFlow;
use crate::token::{unverified_expiry, RawTokenSet};

/// How long a rotation result stays available to concurrent holders of the
/// pre-rotation refresh token.
const SLOT_RETENTION: Duration = Duration::from_secs(600);

/// When the orchestrator refreshes
///
/// Both reactive and eager refresh exist in the wild; the choice is left to
/// configuration rather than resolved here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RefreshMode {
    /// Never refresh; verification only.
    Never,
    /// Refresh only when the access token is absent or near expiry.
    WhenStale,
    /// Refresh on every request.
    Always,
}

impl FromStr for RefreshMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "never" => Ok(RefreshMode::Never),
            // "auto" is the historical spelling of reactive refresh.
            "whenStale" | "when_stale" | "auto" => Ok(RefreshMode::WhenStale),
            "always" => Ok(RefreshMode::Always),
            other => Err(format!("unknown refresh mode '{}'", other)),
        }
    }
}

/// One in-flight or completed rotation for a specific refresh token.
struct RotationSlot {
    rotated: Option<RawTokenSet>,
    created: Instant,
}

/// Per-request refresh decision point
///
/// Shared across requests; the slot map is the only mutable state and exists
/// purely to serialize rotations.
pub struct RefreshOrchestrator {
    flow: Arc<OAuthFlow>,
    /// Lead time before expiry at which a token counts as stale.
    lead: Duration,
    /// Keyed by the SHA-256 digest of the refresh token: collision-resistant,
    /// so two sessions can never share a slot, and the raw token never sits
    /// in a map key.
    slots: Mutex<HashMap<[u8; 32], Arc<Mutex<RotationSlot>>>>,
}

impl RefreshOrchestrator {
    /// Create an orchestrator over a flow manager.
    pub fn new(flow: Arc<OAuthFlow>, lead: Duration) -> Self {
        RefreshOrchestrator {
            flow,
            lead,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Return a token set that is safe to verify and use.
    ///
    /// Fresh input comes back unchanged with no network call. Stale input
    /// with a usable refresh token triggers exactly one refresh grant per
    /// stale window. Stale input without a usable refresh token is terminal:
    /// `ReauthenticationRequired`, and the token endpoint is never called.
    ///
    /// The caller is responsible for persisting a returned rotated set back
    /// to its cookie boundary.
    pub async fn ensure_fresh(
        &self,
        tokens: &RawTokenSet,
        mode: RefreshMode,
    ) -> Result<RawTokenSet, AuthError> {
        match mode {
            RefreshMode::Never => return Ok(tokens.clone()),
            RefreshMode::WhenStale => {
                if !self.is_stale(tokens) {
                    return Ok(tokens.clone());
                }
            }
            RefreshMode::Always => {}
        }

        let Some(refresh_token) = tokens.refresh.as_deref() else {
            debug!("Token set is stale and carries no refresh token");
            return Err(AuthError::ReauthenticationRequired);
        };
        if let Some(expires_at) = tokens.refresh_expires_at {
            if expires_at <= Utc::now() {
                debug!("Refresh token is past its provider-reported expiry");
                return Err(AuthError::ReauthenticationRequired);
            }
        }

        let slot = self.slot_for(refresh_token).await;
        let mut guard = slot.lock().await;

        // Another request already rotated this refresh token; reuse its result
        // instead of consuming a token the provider has invalidated.
        if let Some(rotated) = &guard.rotated {
            debug!("Reusing rotation performed by a concurrent request");
            return Ok(rotated.clone());
        }

        match self.flow.refresh_tokens(refresh_token).await {
            Ok(new_set) => {
                guard.rotated = Some(new_set.clone());
                Ok(new_set)
            }
            Err(AuthError::Refresh {
                kind: RefreshErrorKind::Rejected,
                detail,
            }) => {
                warn!("Refresh token rejected by provider: {}", detail);
                Err(AuthError::ReauthenticationRequired)
            }
            Err(other) => Err(other),
        }
    }

    /// Stale means: no access token, or its (unverified) `exp` is within the
    /// lead time of now. The provider-reported expiry is the fallback when
    /// the token carries no readable `exp`.
    pub fn is_stale(&self, tokens: &RawTokenSet) -> bool {
        let Some(access) = tokens.access.as_deref() else {
            return true;
        };
        let deadline = Utc::now() + ChronoDuration::seconds(self.lead.as_secs() as i64);
        if let Some(exp) = unverified_expiry(access) {
            return chrono::DateTime::from_timestamp(exp, 0)
                .map(|at| at <= deadline)
                .unwrap_or(true);
        }
        if let Some(at) = tokens.access_expires_at {
            return at <= deadline;
        }
        // No expiry information at all: treat as stale rather than trusting it.
        true
    }

    /// Fetch or create the serialization slot for one refresh token.
    async fn slot_for(&self, refresh_token: &str) -> Arc<Mutex<RotationSlot>> {
        let key: [u8; 32] = Sha256::digest(refresh_token.as_bytes()).into();

        let mut slots = self.slots.lock().await;
        slots.retain(|_, slot| match slot.try_lock() {
            Ok(guard) => guard.created.elapsed() < SLOT_RETENTION,
            Err(_) => true, // in use right now
        });
        slots
            .entry(key)
            .or_insert_with(|| {
                Arc::new(Mutex::new(RotationSlot {
                    rotated: None,
                    created: Instant::now(),
                }))
            })
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_mode_parses_historical_spellings() {
        assert_eq!(RefreshMode::from_str("auto").unwrap(), RefreshMode::WhenStale);
        assert_eq!(
            RefreshMode::from_str("whenStale").unwrap(),
            RefreshMode::WhenStale
        );
        assert_eq!(RefreshMode::from_str("always").unwrap(), RefreshMode::Always);
        assert_eq!(RefreshMode::from_str("never").unwrap(), RefreshMode::Never);
        assert!(RefreshMode::from_str("sometimes").is_err());
    }
}
