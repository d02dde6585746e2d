// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the oidc-gatekeeper project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! # OIDC Gatekeeper
//!
//! Framework-agnostic OIDC authentication and authorization core: the
//! Authorization Code + PKCE flow against a configured provider, JWKS-backed
//! bearer token verification, refresh token rotation, and a role-based rule
//! engine over verified claims. The HTTP server framework, cookie handling
//! and session storage stay on the caller's side; this crate owns everything
//! between "raw token strings in" and "verified, authorized claims out".
//!
//! ## Module structure
//!
//! - [`config`]: provider endpoints (explicit or via OIDC discovery) and the
//!   verification policy (issuer, audiences, algorithm allow-list, skew)
//! - [`keys`]: signing key resolution, either static key material or a
//!   TTL-cached JWKS endpoint with single-flight fetching
//! - [`verify`]: the ordered token verification gates
//! - [`flow`]: PKCE material, authorization URL construction, callback
//!   validation and the token endpoint grants
//! - [`refresh`]: staleness decisions and rotation-safe refresh serialization
//! - [`rules`]: declarative access rules evaluated against verified claims
//! - [`token`]: raw and decoded token set types shared across modules
//! - [`error`]: the crate-wide error taxonomy
//!
//! ## Typical flow
//!
//! At login, [`OAuthFlow::begin_authorization`] produces the redirect URL and
//! a [`PkceSession`] to persist; the callback goes through
//! [`OAuthFlow::validate_callback`] and [`OAuthFlow::exchange_code`]. On each
//! protected request, [`Gatekeeper::authorize`] refreshes when needed,
//! verifies the access and ID tokens and evaluates the route's rule.
//!
//! ```no_run
//! use std::sync::Arc;
//! use oidc_gatekeeper::{
//!     Gatekeeper, KeyResolver, OAuthFlow, ProviderConfig, RefreshMode,
//!     VerificationPolicy,
//! };
//!
//! # async fn setup() -> anyhow::Result<()> {
//! let config = ProviderConfig::from_env()?;
//! let policy = VerificationPolicy::from_env()?;
//! let resolver = Arc::new(KeyResolver::from_jwks_uri(
//!     config.jwks_uri.clone().unwrap_or_default(),
//!     config.http_timeout,
//! )?);
//! let flow = Arc::new(OAuthFlow::discover(config).await?);
//! let gatekeeper = Gatekeeper::new(flow, resolver, policy, RefreshMode::WhenStale);
//! # let _ = gatekeeper;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod flow;
mod gatekeeper;
pub mod keys;
pub mod refresh;
pub mod rules;
pub mod token;
pub mod verify;

pub use config::{DiscoveryDocument, JwtSecret, ProviderConfig, VerificationPolicy};
pub use error::{AuthError, DenialReason, RefreshErrorKind};
pub use flow::{
    AuthorizationRequest, HttpTokenTransport, OAuthFlow, TokenTransport, TransportReply,
};
pub use gatekeeper::{AuthOutcome, Gatekeeper};
pub use keys::jwks::{HttpJwksFetcher, JwksCache, JwksFetcher};
pub use keys::{KeyResolver, SigningKey, StaticKeys};
pub use refresh::{RefreshMode, RefreshOrchestrator};
pub use rules::{all_present, always_allow, rule, AccessRule, Decision, FnRule, RoleRule};
pub use token::{
    DecodedClaims, DecodedTokenSet, PkceSession, RawTokenSet, ACCESS_TOKEN_COOKIE,
    ID_TOKEN_COOKIE, REFRESH_TOKEN_COOKIE, SESSION_COOKIES,
};
pub use verify::Verifier;
