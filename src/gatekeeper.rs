// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the oidc-gatekeeper project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Request pipeline facade
//!
//! One call per protected request: the caller's cookie boundary hands over
//! the raw token strings, and [`Gatekeeper::authorize`] runs the whole gated
//! chain (refresh decision, verification of access and ID tokens, then rule
//! evaluation), returning verified claims plus the possibly rotated token
//! set, or the typed failure the caller maps to a redirect or error status.
//!
//! When `refreshed` is set on the outcome, the caller must persist the new
//! token set back to its cookies; this core never touches per-request
//! storage itself.

use std::sync::Arc;

use crate::config::VerificationPolicy;
use crate::error::AuthError;
use crate::flow::OAuthFlow;
use crate::keys::KeyResolver;
use crate::refresh::{RefreshMode, RefreshOrchestrator};
use crate::rules::{self, AccessRule, Decision};
use crate::token::{DecodedTokenSet, RawTokenSet};
use crate::verify::Verifier;

/// Result of a successfully authenticated (and authorized) request.
#[derive(Debug)]
pub struct AuthOutcome {
    /// Verified claims for the session's tokens.
    pub claims: DecodedTokenSet,
    /// The token set to keep using; rotated when `refreshed` is true.
    pub tokens: RawTokenSet,
    /// True when a refresh ran and the caller must persist `tokens`.
    pub refreshed: bool,
}

/// The assembled authentication core
///
/// Built once at startup from injected configuration; every component is
/// shared by reference and safe for concurrent requests.
pub struct Gatekeeper {
    verifier: Verifier,
    orchestrator: RefreshOrchestrator,
    refresh_mode: RefreshMode,
}

impl Gatekeeper {
    /// Assemble the core from its components.
    pub fn new(
        flow: Arc<OAuthFlow>,
        resolver: Arc<KeyResolver>,
        policy: VerificationPolicy,
        refresh_mode: RefreshMode,
    ) -> Self {
        let lead = policy.refresh_lead;
        Gatekeeper {
            verifier: Verifier::new(resolver, policy),
            orchestrator: RefreshOrchestrator::new(flow, lead),
            refresh_mode,
        }
    }

    /// The verifier, for callers that need to check a single token directly.
    pub fn verifier(&self) -> &Verifier {
        &self.verifier
    }

    /// The orchestrator, for callers driving refresh explicitly.
    pub fn orchestrator(&self) -> &RefreshOrchestrator {
        &self.orchestrator
    }

    /// Refresh as configured, then verify the access and ID tokens.
    ///
    /// Guarantees that the returned claims passed every verification gate.
    /// The refresh token is passed through opaquely and is never decoded.
    pub async fn authenticate(&self, raw: &RawTokenSet) -> Result<AuthOutcome, AuthError> {
        if raw.is_empty() {
            return Err(AuthError::ReauthenticationRequired);
        }
        let tokens = self.orchestrator.ensure_fresh(raw, self.refresh_mode).await?;
        let refreshed = tokens != *raw;

        let access_raw = tokens
            .access
            .as_deref()
            .ok_or(AuthError::ReauthenticationRequired)?;
        let access = self.verifier.verify(access_raw).await?;
        let id = match tokens.id.as_deref() {
            Some(raw_id) => Some(self.verifier.verify(raw_id).await?),
            None => None,
        };

        Ok(AuthOutcome {
            claims: DecodedTokenSet {
                access: Some(access),
                id,
            },
            tokens,
            refreshed,
        })
    }

    /// Authenticate, then evaluate the route's access rule.
    ///
    /// A denial becomes [`AuthError::AccessDenied`] carrying the specific
    /// reason; a faulting rule stays [`AuthError::RuleEvaluationFailed`] so
    /// callers can report a policy fault instead of bouncing the user to
    /// login.
    pub async fn authorize(
        &self,
        raw: &RawTokenSet,
        rule: &dyn AccessRule,
    ) -> Result<AuthOutcome, AuthError> {
        let outcome = self.authenticate(raw).await?;
        match rules::authorize(&outcome.claims, rule)? {
            Decision::Allowed => Ok(outcome),
            Decision::Denied(reason) => Err(AuthError::AccessDenied { reason }),
        }
    }
}
