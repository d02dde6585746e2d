// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the oidc-gatekeeper project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Token verification policy
//!
//! Process-wide, read-only after startup. Every verification gate reads from
//! this policy: expected issuer, accepted audiences, the signing algorithm
//! allow-list, and the clock-skew tolerance applied to `exp`.

use anyhow::{anyhow, Context, Result};
use jsonwebtoken::Algorithm;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Default clock-skew tolerance applied to expiry checks.
const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(30);

/// Default lead time before expiry at which a token counts as stale.
const DEFAULT_REFRESH_LEAD: Duration = Duration::from_secs(60);

/// Verification policy for bearer tokens
///
/// The algorithm list is a strict allow-list: `none` and anything not listed
/// is rejected before signature verification, closing algorithm-confusion
/// attacks.
#[derive(Debug, Clone)]
pub struct VerificationPolicy {
    /// Expected `iss` value, compared for exact equality.
    pub issuer: String,

    /// Accepted `aud` values; the token must carry at least one of them.
    ///
    /// An empty list disables the audience gate (the original deployment
    /// treats the audience as optional configuration).
    pub audiences: Vec<String>,

    /// Allowed signing algorithms.
    pub algorithms: Vec<Algorithm>,

    /// Tolerance subtracted from "now" when checking `exp`.
    pub clock_skew: Duration,

    /// How long before expiry an access token is considered stale and
    /// eligible for refresh.
    pub refresh_lead: Duration,
}

impl VerificationPolicy {
    /// A policy accepting RS256 only, the conventional OIDC default.
    pub fn new(issuer: impl Into<String>) -> Self {
        VerificationPolicy {
            issuer: issuer.into(),
            audiences: Vec::new(),
            algorithms: vec![Algorithm::RS256],
            clock_skew: DEFAULT_CLOCK_SKEW,
            refresh_lead: DEFAULT_REFRESH_LEAD,
        }
    }

    /// Replace the accepted audiences.
    pub fn with_audiences(mut self, audiences: Vec<String>) -> Self {
        self.audiences = audiences;
        self
    }

    /// Replace the algorithm allow-list.
    pub fn with_algorithms(mut self, algorithms: Vec<Algorithm>) -> Self {
        self.algorithms = algorithms;
        self
    }

    /// Replace the clock-skew tolerance.
    pub fn with_clock_skew(mut self, skew: Duration) -> Self {
        self.clock_skew = skew;
        self
    }

    /// Replace the refresh lead time.
    pub fn with_refresh_lead(mut self, lead: Duration) -> Self {
        self.refresh_lead = lead;
        self
    }

    /// True when the algorithm is in the allow-list.
    pub fn allows_algorithm(&self, algorithm: Algorithm) -> bool {
        self.algorithms.contains(&algorithm)
    }

    /// Load the policy from environment variables.
    ///
    /// `OIDC_ISSUER` is required. `OIDC_AUDIENCE` is either a JSON array or a
    /// single audience string (the original accepts both spellings).
    /// `OIDC_ALLOWED_ALGS` is a space-separated list of algorithm names;
    /// `OIDC_CLOCK_SKEW_SECS` and `OIDC_REFRESH_LEAD_SECS` are integers.
    pub fn from_env() -> Result<Self> {
        let issuer =
            env::var("OIDC_ISSUER").map_err(|_| anyhow!("Missing required OIDC_ISSUER"))?;
        let mut policy = VerificationPolicy::new(issuer);

        if let Ok(raw) = env::var("OIDC_AUDIENCE") {
            if !raw.is_empty() {
                policy.audiences = parse_audiences(&raw)?;
            }
        }
        if let Ok(raw) = env::var("OIDC_ALLOWED_ALGS") {
            if !raw.is_empty() {
                policy.algorithms = raw
                    .split_whitespace()
                    .map(|name| {
                        Algorithm::from_str(name)
                            .map_err(|_| anyhow!("Unknown algorithm '{}' in OIDC_ALLOWED_ALGS", name))
                    })
                    .collect::<Result<Vec<_>>>()?;
            }
        }
        if let Ok(raw) = env::var("OIDC_CLOCK_SKEW_SECS") {
            policy.clock_skew = Duration::from_secs(
                raw.parse::<u64>()
                    .context("OIDC_CLOCK_SKEW_SECS must be an integer number of seconds")?,
            );
        }
        if let Ok(raw) = env::var("OIDC_REFRESH_LEAD_SECS") {
            policy.refresh_lead = Duration::from_secs(
                raw.parse::<u64>()
                    .context("OIDC_REFRESH_LEAD_SECS must be an integer number of seconds")?,
            );
        }
        Ok(policy)
    }
}

/// Parse either a JSON array of audiences or a bare audience string.
fn parse_audiences(raw: &str) -> Result<Vec<String>> {
    if raw.trim_start().starts_with('[') {
        serde_json::from_str::<Vec<String>>(raw)
            .context("OIDC_AUDIENCE looks like JSON but is not a string array")
    } else {
        Ok(vec![raw.to_string()])
    }
}
