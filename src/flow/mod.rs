// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the oidc-gatekeeper project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! # OAuth2 Authorization-Code + PKCE flow
//!
//! The Flow Manager drives the three provider interactions of an OIDC relying
//! party:
//!
//! 1. [`OAuthFlow::begin_authorization`] - build the authorization URL and the
//!    single-use PKCE session backing it
//! 2. [`OAuthFlow::exchange_code`] - trade the callback's authorization code
//!    for a token set
//! 3. [`OAuthFlow::refresh_tokens`] - obtain a fresh token set from a refresh
//!    token
//!
//! Provider configuration is injected and resolved once at construction,
//! optionally via the discovery document; if discovery fails the manager
//! falls back to the explicitly configured endpoints. The token endpoint is
//! reached through the [`TokenTransport`] seam so tests can run the whole
//! flow without a live provider.

pub mod pkce;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use log::{debug, warn};
use serde::Deserialize;
use url::Url;

use crate::config::ProviderConfig;
use crate::error::{AuthError, RefreshErrorKind};
use crate::token::{PkceSession, RawTokenSet};

/// How long a PKCE session stays valid between login redirect and callback.
const CALLBACK_MAX_AGE_SECS: i64 = 300;

/// Everything the caller needs to start a login
///
/// The session goes into short-lived HTTP-only cookies; the URL is the
/// redirect target.
#[derive(Debug)]
pub struct AuthorizationRequest {
    /// Single-use PKCE state to persist until the callback.
    pub session: PkceSession,
    /// Fully assembled provider authorization URL.
    pub authorization_url: Url,
}

/// Successful token endpoint response body.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_expires_in: Option<i64>,
}

impl TokenResponse {
    fn into_token_set(self) -> RawTokenSet {
        let now = Utc::now();
        RawTokenSet {
            access: self.access_token,
            id: self.id_token,
            refresh: self.refresh_token,
            access_expires_at: self.expires_in.map(|s| now + ChronoDuration::seconds(s)),
            refresh_expires_at: self
                .refresh_expires_in
                .map(|s| now + ChronoDuration::seconds(s)),
        }
    }
}

/// OAuth2 error response body (RFC 6749 §5.2).
#[derive(Debug, Deserialize)]
struct ProviderErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

/// Raw reply from the token endpoint before protocol interpretation.
#[derive(Debug, Clone)]
pub struct TransportReply {
    /// HTTP status code.
    pub status: u16,
    /// Response body, expected to be JSON either way.
    pub body: String,
}

/// Transport seam for token endpoint POSTs.
///
/// Production uses [`HttpTokenTransport`]; tests inject canned or counting
/// transports.
#[async_trait]
pub trait TokenTransport: Send + Sync {
    /// POST a urlencoded form to the token endpoint.
    async fn post_form(
        &self,
        endpoint: &str,
        form: &[(&str, String)],
    ) -> Result<TransportReply, AuthError>;
}

/// Reqwest-backed transport with a bounded request timeout.
pub struct HttpTokenTransport {
    client: reqwest::Client,
}

impl HttpTokenTransport {
    /// Build a transport with the given per-request timeout.
    pub fn new(timeout: std::time::Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client for the token endpoint")?;
        Ok(HttpTokenTransport { client })
    }
}

#[async_trait]
impl TokenTransport for HttpTokenTransport {
    async fn post_form(
        &self,
        endpoint: &str,
        form: &[(&str, String)],
    ) -> Result<TransportReply, AuthError> {
        let response = self
            .client
            .post(endpoint)
            .form(form)
            .send()
            .await
            .map_err(|e| AuthError::from_transport(e, "token endpoint request"))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| AuthError::from_transport(e, "token endpoint response"))?;
        Ok(TransportReply { status, body })
    }
}

/// OAuth2 Flow Manager for one configured provider
///
/// Construct once at startup and share; all methods take `&self`.
pub struct OAuthFlow {
    config: ProviderConfig,
    authorization_url: Url,
    token_endpoint: String,
    transport: Box<dyn TokenTransport>,
}

impl OAuthFlow {
    /// Create a flow manager over the default HTTP transport.
    ///
    /// Fails when the configuration (after any discovery merge) still lacks
    /// an authorization or token endpoint, so a misconfigured provider is
    /// caught at startup rather than on the first login.
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let transport = HttpTokenTransport::new(config.http_timeout)?;
        Self::with_transport(config, Box::new(transport))
    }

    /// Create a flow manager, fetching the discovery document first.
    ///
    /// Discovery failure falls back to the explicitly configured endpoints;
    /// only a configuration that is incomplete even after the fallback is an
    /// error.
    pub async fn discover(config: ProviderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .context("Failed to build HTTP client for discovery")?;
        let config = config.discover(&client).await;
        Self::new(config)
    }

    /// Create a flow manager with an injected transport.
    pub fn with_transport(config: ProviderConfig, transport: Box<dyn TokenTransport>) -> Result<Self> {
        let authorization_url = Url::parse(config.authorization_endpoint()?)
            .context("Authorization endpoint is not a valid URL")?;
        let token_endpoint = config.token_endpoint()?.to_string();
        Ok(OAuthFlow {
            config,
            authorization_url,
            token_endpoint,
            transport,
        })
    }

    /// The provider configuration this flow was built from.
    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Start an authorization-code login.
    ///
    /// Generates a fresh code verifier and state (256 bits of entropy each),
    /// derives the S256 challenge, and assembles the provider authorization
    /// URL. The returned session must round-trip to the callback and is
    /// single-use.
    pub fn begin_authorization(&self) -> AuthorizationRequest {
        let session = pkce::new_session();
        let challenge = pkce::code_challenge_s256(&session.code_verifier);

        let mut url = self.authorization_url.clone();
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.config.redirect_uri)
            .append_pair("scope", &self.config.scopes.join(" "))
            .append_pair("state", &session.state)
            .append_pair("code_challenge", &challenge)
            .append_pair("code_challenge_method", "S256");

        debug!("Assembled authorization URL for client {}", self.config.client_id);
        AuthorizationRequest {
            session,
            authorization_url: url,
        }
    }

    /// Validate the provider callback against the stored PKCE session.
    ///
    /// The state must match exactly, a code must be present, and the session
    /// must not have outlived its maximum age. Any failure aborts the flow;
    /// the caller must delete the session either way, since it is single-use.
    pub fn validate_callback(
        &self,
        session: &PkceSession,
        returned_state: Option<&str>,
        code: Option<&str>,
    ) -> Result<String, AuthError> {
        let mut problems: Vec<&str> = Vec::new();
        if session.code_verifier.is_empty() {
            problems.push("missing code verifier");
        }
        if session.state.is_empty() {
            problems.push("missing expected state");
        }
        match returned_state {
            None => problems.push("missing returned state"),
            Some(returned) if returned != session.state => problems.push("state parameter mismatch"),
            Some(_) => {}
        }
        if code.map_or(true, str::is_empty) {
            problems.push("missing authorization code");
        }
        if session.is_expired(ChronoDuration::seconds(CALLBACK_MAX_AGE_SECS)) {
            problems.push("authorization session expired");
        }
        if !problems.is_empty() {
            warn!("OAuth callback rejected: {}", problems.join(", "));
            return Err(AuthError::Exchange {
                detail: format!("callback validation failed: {}", problems.join(", ")),
            });
        }
        Ok(code.unwrap_or_default().to_string())
    }

    /// Exchange an authorization code for a token set.
    pub async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
    ) -> Result<RawTokenSet, AuthError> {
        let mut form: Vec<(&str, String)> = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("redirect_uri", self.config.redirect_uri.clone()),
            ("client_id", self.config.client_id.clone()),
            ("code_verifier", code_verifier.to_string()),
        ];
        if let Some(secret) = &self.config.client_secret {
            form.push(("client_secret", secret.clone()));
        }

        let reply = self.transport.post_form(&self.token_endpoint, &form).await?;
        if !(200..300).contains(&reply.status) {
            // The provider's error detail is surfaced; the client secret is not.
            return Err(AuthError::Exchange {
                detail: provider_error_detail(reply.status, &reply.body),
            });
        }
        parse_token_response(&reply.body).map_err(|detail| AuthError::Exchange { detail })
    }

    /// Obtain a fresh token set with the refresh grant.
    ///
    /// Only `invalid_grant` (an expired, revoked or already-rotated refresh
    /// token) is reported as [`RefreshErrorKind::Rejected`]; every other
    /// failure, including client misconfiguration errors like
    /// `invalid_client`, is [`RefreshErrorKind::Transient`]. A re-login is
    /// forced only when the token itself is dead, never because the
    /// deployment is misconfigured.
    pub async fn refresh_tokens(&self, refresh_token: &str) -> Result<RawTokenSet, AuthError> {
        let mut form: Vec<(&str, String)> = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_string()),
            ("client_id", self.config.client_id.clone()),
            ("scope", self.config.scopes.join(" ")),
        ];
        if let Some(secret) = &self.config.client_secret {
            form.push(("client_secret", secret.clone()));
        }

        let reply = self.transport.post_form(&self.token_endpoint, &form).await?;
        if !(200..300).contains(&reply.status) {
            let parsed: ProviderErrorBody =
                serde_json::from_str(&reply.body).unwrap_or(ProviderErrorBody {
                    error: None,
                    error_description: None,
                });
            let kind = match parsed.error.as_deref() {
                Some("invalid_grant") => RefreshErrorKind::Rejected,
                _ => RefreshErrorKind::Transient,
            };
            return Err(AuthError::Refresh {
                detail: provider_error_detail(reply.status, &reply.body),
                kind,
            });
        }
        parse_token_response(&reply.body).map_err(|detail| AuthError::Refresh {
            detail,
            kind: RefreshErrorKind::Transient,
        })
    }
}

/// Render the provider's error body without echoing anything sensitive.
fn provider_error_detail(status: u16, body: &str) -> String {
    match serde_json::from_str::<ProviderErrorBody>(body) {
        Ok(parsed) => {
            let error = parsed.error.unwrap_or_else(|| "unknown_error".to_string());
            match parsed.error_description {
                Some(description) => format!("{} ({}): {}", error, status, description),
                None => format!("{} ({})", error, status),
            }
        }
        Err(_) => format!("provider returned HTTP {}", status),
    }
}

fn parse_token_response(body: &str) -> Result<RawTokenSet, String> {
    let response: TokenResponse = serde_json::from_str(body)
        .map_err(|e| format!("token endpoint returned unparsable JSON: {}", e))?;
    if response.access_token.is_none() {
        return Err("token endpoint response carries no access token".to_string());
    }
    Ok(response.into_token_set())
}
