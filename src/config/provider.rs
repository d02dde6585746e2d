// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the oidc-gatekeeper project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Identity provider configuration
//!
//! Endpoints, client credentials and key material sources for one OIDC
//! provider. Values come from the environment (`OIDC_*`) or are constructed
//! directly; an optional discovery document fills in any endpoint left unset,
//! and explicit values always win over discovery when both exist.

use anyhow::{anyhow, Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Default HTTP timeout for provider calls (JWKS, discovery, token endpoint).
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

fn default_http_timeout() -> Duration {
    DEFAULT_HTTP_TIMEOUT
}

/// Default OIDC scopes requested during authorization.
fn default_scopes() -> Vec<String> {
    vec!["openid".into(), "profile".into(), "email".into()]
}

/// Static key material configuration
///
/// JSON blob of the form `{"type": "HS256", "key": "..."}` or
/// `{"type": "RS256", "jwk_url": "https://..."}`: either an inline key for
/// symmetric-secret deployments or a JWKS URL for asymmetric ones. Exactly one
/// of `key` / `jwk_url` must be set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtSecret {
    /// Signing algorithm name, e.g. `HS256` or `RS256`.
    #[serde(rename = "type")]
    pub key_type: String,
    /// Inline key material: the HMAC secret, or a PEM public key.
    #[serde(default)]
    pub key: Option<String>,
    /// JWKS endpoint to fetch keys from instead of an inline key.
    #[serde(default)]
    pub jwk_url: Option<String>,
}

impl JwtSecret {
    /// Parse the JSON blob and reject blobs that configure neither source.
    pub fn parse(raw: &str) -> Result<Self> {
        let secret: JwtSecret =
            serde_json::from_str(raw).context("Failed to parse JWT secret JSON")?;
        if secret.key.is_none() && secret.jwk_url.is_none() {
            return Err(anyhow!(
                "Misconfigured JWT secret: specify a jwk_url or a key"
            ));
        }
        Ok(secret)
    }

    /// Read the blob from `OIDC_JWT_SECRET`, when set.
    pub fn from_env() -> Result<Option<Self>> {
        match env::var("OIDC_JWT_SECRET") {
            Ok(raw) if !raw.is_empty() => Ok(Some(Self::parse(&raw)?)),
            _ => Ok(None),
        }
    }
}

/// OIDC discovery document (the well-known configuration endpoint)
///
/// Only the fields this core consumes are modeled; unknown fields are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryDocument {
    #[serde(default)]
    pub issuer: Option<String>,
    #[serde(default)]
    pub authorization_endpoint: Option<String>,
    #[serde(default)]
    pub token_endpoint: Option<String>,
    #[serde(default)]
    pub jwks_uri: Option<String>,
}

/// Identity provider configuration for the OAuth2 flow and key resolution
///
/// Resolved once at startup and treated as immutable afterwards. Components
/// receive it by injection; nothing in this crate reads the environment after
/// construction.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Expected token issuer, compared exactly during verification.
    pub issuer: String,

    /// Authorization endpoint the login redirect targets.
    #[serde(default)]
    pub authorization_endpoint: Option<String>,

    /// Token endpoint for the code exchange and refresh grants.
    #[serde(default)]
    pub token_endpoint: Option<String>,

    /// JWKS endpoint publishing the provider's signing keys.
    #[serde(default)]
    pub jwks_uri: Option<String>,

    /// Discovery document URL; when set, missing endpoints are filled from it.
    #[serde(default)]
    pub discovery_url: Option<String>,

    /// Redirect URI registered for this client.
    pub redirect_uri: String,

    /// OAuth2 client identifier.
    pub client_id: String,

    /// OAuth2 client secret, absent for public clients.
    #[serde(default)]
    pub client_secret: Option<String>,

    /// Scopes requested during authorization.
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,

    /// Timeout applied to every outbound provider call.
    #[serde(default = "default_http_timeout", with = "timeout_secs")]
    pub http_timeout: Duration,
}

/// Serialize the timeout as plain seconds.
mod timeout_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Debug must never print the client secret.
impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("issuer", &self.issuer)
            .field("authorization_endpoint", &self.authorization_endpoint)
            .field("token_endpoint", &self.token_endpoint)
            .field("jwks_uri", &self.jwks_uri)
            .field("discovery_url", &self.discovery_url)
            .field("redirect_uri", &self.redirect_uri)
            .field("client_id", &self.client_id)
            .field(
                "client_secret",
                &self.client_secret.as_ref().map(|_| "<redacted>"),
            )
            .field("scopes", &self.scopes)
            .field("http_timeout", &self.http_timeout)
            .finish()
    }
}

impl ProviderConfig {
    /// Load the provider configuration from `OIDC_*` environment variables.
    ///
    /// Required: `OIDC_ISSUER`, `OIDC_REDIRECT_URI`, `OIDC_CLIENT_ID`.
    /// Optional: `OIDC_AUTHORIZATION_URL`, `OIDC_TOKEN_URL`, `OIDC_JWKS_URL`,
    /// `OIDC_WELL_KNOWN_URL`, `OIDC_CLIENT_PASSWORD`, `OIDC_SCOPES`
    /// (space-separated), `OIDC_HTTP_TIMEOUT_SECS`.
    pub fn from_env() -> Result<Self> {
        let required = |name: &str| {
            env::var(name).map_err(|_| anyhow!("Missing required environment variable {}", name))
        };
        let optional = |name: &str| env::var(name).ok().filter(|v| !v.is_empty());

        let scopes = optional("OIDC_SCOPES")
            .map(|raw| raw.split_whitespace().map(str::to_owned).collect())
            .unwrap_or_else(default_scopes);
        let http_timeout = optional("OIDC_HTTP_TIMEOUT_SECS")
            .map(|raw| {
                raw.parse::<u64>()
                    .map(Duration::from_secs)
                    .context("OIDC_HTTP_TIMEOUT_SECS must be an integer number of seconds")
            })
            .transpose()?
            .unwrap_or(DEFAULT_HTTP_TIMEOUT);

        Ok(ProviderConfig {
            issuer: required("OIDC_ISSUER")?,
            authorization_endpoint: optional("OIDC_AUTHORIZATION_URL"),
            token_endpoint: optional("OIDC_TOKEN_URL"),
            jwks_uri: optional("OIDC_JWKS_URL"),
            discovery_url: optional("OIDC_WELL_KNOWN_URL"),
            redirect_uri: required("OIDC_REDIRECT_URI")?,
            client_id: required("OIDC_CLIENT_ID")?,
            client_secret: optional("OIDC_CLIENT_PASSWORD"),
            scopes,
            http_timeout,
        })
    }

    /// Fill endpoints left unset from the provider's discovery document.
    ///
    /// Explicitly configured values always win. When the discovery fetch
    /// fails, the configuration is returned unchanged so the manager falls
    /// back to the explicit endpoint values instead of becoming unusable.
    pub async fn discover(mut self, client: &reqwest::Client) -> Self {
        let Some(url) = self.discovery_url.clone() else {
            return self;
        };
        let document = match Self::fetch_discovery(client, &url).await {
            Ok(doc) => doc,
            Err(err) => {
                warn!(
                    "OIDC discovery fetch failed, falling back to configured endpoints: {}",
                    err
                );
                return self;
            }
        };
        self.merge_discovery(document);
        self
    }

    async fn fetch_discovery(client: &reqwest::Client, url: &str) -> Result<DiscoveryDocument> {
        let response = client
            .get(url)
            .send()
            .await
            .context("discovery request failed")?;
        let response = response
            .error_for_status()
            .context("discovery endpoint returned an error status")?;
        response
            .json::<DiscoveryDocument>()
            .await
            .context("discovery document is not valid JSON")
    }

    /// Apply a discovery document, keeping any explicitly configured value.
    pub fn merge_discovery(&mut self, document: DiscoveryDocument) {
        if self.authorization_endpoint.is_none() {
            self.authorization_endpoint = document.authorization_endpoint;
        }
        if self.token_endpoint.is_none() {
            self.token_endpoint = document.token_endpoint;
        }
        if self.jwks_uri.is_none() {
            self.jwks_uri = document.jwks_uri;
        }
        if self.issuer.is_empty() {
            if let Some(issuer) = document.issuer {
                self.issuer = issuer;
            }
        }
    }

    /// The authorization endpoint, required by [`begin_authorization`].
    ///
    /// [`begin_authorization`]: crate::flow::OAuthFlow::begin_authorization
    pub fn authorization_endpoint(&self) -> Result<&str> {
        self.authorization_endpoint
            .as_deref()
            .ok_or_else(|| anyhow!("No authorization endpoint configured or discovered"))
    }

    /// The token endpoint, required by the code exchange and refresh grants.
    pub fn token_endpoint(&self) -> Result<&str> {
        self.token_endpoint
            .as_deref()
            .ok_or_else(|| anyhow!("No token endpoint configured or discovered"))
    }
}
