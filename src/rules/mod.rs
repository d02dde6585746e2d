// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the oidc-gatekeeper project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Authorization rule engine
//!
//! Rules are pure predicates over verified claims, evaluated once per
//! request. The posture is strict: a caller-supplied boolean rule allows
//! access only on a literal `true`; anything else is a denial, never a
//! truthy coercion. A rule that faults during evaluation surfaces as
//! [`AuthError::RuleEvaluationFailed`], distinct from any denial, so
//! operators can tell "user lacks access" from "policy is broken".
//!
//! The built-in [`RoleRule`] checks membership in a roles array found at a
//! configurable claim path, and distinguishes a missing claim path
//! ([`DenialReason::NoRolesClaim`], an IdP misconfiguration signal) from a
//! present path lacking the role ([`DenialReason::RoleNotGranted`]).

use serde_json::Value;

use crate::error::{AuthError, DenialReason};
use crate::token::DecodedTokenSet;

/// Outcome of evaluating a rule against verified claims.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The rule allowed access.
    Allowed,
    /// The rule denied access for the given reason.
    Denied(DenialReason),
}

impl Decision {
    /// True when access was allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

/// A declarative access rule, supplied per protected route
///
/// Rules are stateless and must be safe to evaluate concurrently. An `Err`
/// return means the rule itself is broken, not that the user lacks access.
pub trait AccessRule: Send + Sync {
    /// Evaluate the rule against one session's verified claims.
    fn evaluate(&self, tokens: &DecodedTokenSet) -> Result<Decision, anyhow::Error>;
}

/// Adapter turning a boolean closure into an [`AccessRule`]
///
/// Only a literal `Ok(true)` allows; `Ok(false)` denies with
/// [`DenialReason::RuleRejected`].
pub struct FnRule<F>(F);

impl<F> AccessRule for FnRule<F>
where
    F: Fn(&DecodedTokenSet) -> Result<bool, anyhow::Error> + Send + Sync,
{
    fn evaluate(&self, tokens: &DecodedTokenSet) -> Result<Decision, anyhow::Error> {
        match (self.0)(tokens)? {
            true => Ok(Decision::Allowed),
            false => Ok(Decision::Denied(DenialReason::RuleRejected)),
        }
    }
}

/// Wrap a boolean predicate as a strict rule.
pub fn rule<F>(predicate: F) -> FnRule<F>
where
    F: Fn(&DecodedTokenSet) -> Result<bool, anyhow::Error> + Send + Sync,
{
    FnRule(predicate)
}

/// A rule that allows every verified session.
pub fn always_allow() -> impl AccessRule {
    rule(|_| Ok(true))
}

/// A rule requiring both an access and an ID token to be present.
pub fn all_present() -> impl AccessRule {
    rule(|tokens| Ok(tokens.access.is_some() && tokens.id.is_some()))
}

/// Role-membership rule over a configurable claim path
///
/// The claim path names a nested claims property holding an array of granted
/// role names, e.g. `resource_access.<client>.roles` for Keycloak-shaped
/// tokens.
#[derive(Debug, Clone)]
pub struct RoleRule {
    claim_path: Vec<String>,
    role: String,
}

impl RoleRule {
    /// Require `role` inside the roles array found at `claim_path`.
    pub fn new(claim_path: Vec<String>, role: impl Into<String>) -> Self {
        RoleRule {
            claim_path,
            role: role.into(),
        }
    }

    /// Keycloak-shaped path: `resource_access.<client_id>.roles`.
    pub fn keycloak_client(client_id: &str, role: impl Into<String>) -> Self {
        RoleRule::new(
            vec![
                "resource_access".to_string(),
                client_id.to_string(),
                "roles".to_string(),
            ],
            role,
        )
    }

    /// Hasura-shaped path: `https://hasura.io/jwt/claims.x-hasura-allowed-roles`.
    pub fn hasura(role: impl Into<String>) -> Self {
        RoleRule::new(
            vec![
                "https://hasura.io/jwt/claims".to_string(),
                "x-hasura-allowed-roles".to_string(),
            ],
            role,
        )
    }
}

impl AccessRule for RoleRule {
    fn evaluate(&self, tokens: &DecodedTokenSet) -> Result<Decision, anyhow::Error> {
        let Some(claims) = tokens.access.as_ref() else {
            // No verified access token means no roles claim to consult.
            return Ok(Decision::Denied(DenialReason::NoRolesClaim));
        };
        let path: Vec<&str> = self.claim_path.iter().map(String::as_str).collect();
        match claims.claim_path(&path) {
            // A roles claim that is not an array is an IdP mapping problem,
            // reported the same way as an absent claim.
            None => Ok(Decision::Denied(DenialReason::NoRolesClaim)),
            Some(Value::Array(roles)) => {
                let granted = roles
                    .iter()
                    .filter_map(Value::as_str)
                    .any(|granted| granted == self.role);
                if granted {
                    Ok(Decision::Allowed)
                } else {
                    Ok(Decision::Denied(DenialReason::RoleNotGranted {
                        role: self.role.clone(),
                    }))
                }
            }
            Some(_) => Ok(Decision::Denied(DenialReason::NoRolesClaim)),
        }
    }
}

/// Evaluate a rule, converting rule faults into the typed error.
pub fn authorize(tokens: &DecodedTokenSet, rule: &dyn AccessRule) -> Result<Decision, AuthError> {
    rule.evaluate(tokens)
        .map_err(|source| AuthError::RuleEvaluationFailed { source })
}
