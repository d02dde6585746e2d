// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the oidc-gatekeeper project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Configuration for the authentication core
//!
//! All configuration is loaded once at process startup and injected into the
//! components explicitly; there is no lazily constructed global client. The
//! environment surface follows the conventional `OIDC_*` variables.
//!
//! ## Module Structure
//!
//! - [`provider`] - identity provider endpoints, client credentials, discovery
//! - [`policy`] - token verification policy (issuer, audiences, algorithms)

pub mod policy;
pub mod provider;

pub use policy::VerificationPolicy;
pub use provider::{DiscoveryDocument, JwtSecret, ProviderConfig};
