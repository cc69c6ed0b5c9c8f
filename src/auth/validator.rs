//! Bearer token validation — signature, issuer, audience, lifetime.
//!
//! # Validation flow
//!
//! 1. Decode the JWT header (no verification) to extract `kid` and `alg`.
//! 2. Resolve the signing key from the metadata cache; an unknown `kid`
//!    triggers exactly one forced refresh (a new key may have been rotated
//!    in) before failing.
//! 3. Verify the signature.
//! 4. Check `iss` against the accepted issuer set (three URL variants per
//!    tenant — v2.0, legacy, and managed-identity forms).
//! 5. Check `aud` against the accepted audience set (bare client id and
//!    `api://` resource forms refer to the same application).
//! 6. Check the token lifetime with a clock-skew allowance.
//!
//! Each failure returns its own [`AuthError`] kind; no partial
//! [`ValidatedClaims`] is ever produced.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use jsonwebtoken::{
    Algorithm, DecodingKey, Validation, decode, decode_header,
    errors::ErrorKind,
    jwk::{AlgorithmParameters, JwkSet},
};
use serde_json::{Map, Value};
use tracing::debug;

use super::claims::{self, CLAIM_AUDIENCE, ValidatedClaims};
use super::{AuthError, MetadataCache};
use crate::config::AzureAdConfig;

/// Validates bearer tokens against the tenant's published signing keys and
/// the configured issuer/audience sets.
pub struct TokenValidator {
    metadata: Arc<MetadataCache>,
    accepted_issuers: Vec<String>,
    accepted_audiences: Vec<String>,
    leeway_secs: i64,
}

impl TokenValidator {
    /// Create a validator over the shared metadata cache.
    #[must_use]
    pub fn new(metadata: Arc<MetadataCache>, azure: &AzureAdConfig) -> Self {
        Self {
            metadata,
            accepted_issuers: azure.issuers(),
            accepted_audiences: azure.audiences(),
            leeway_secs: azure.clock_skew.as_secs() as i64,
        }
    }

    /// Validate a compact JWT and extract its claims.
    ///
    /// # Errors
    ///
    /// Returns a distinct [`AuthError`] kind for each failed check:
    /// `Malformed`, `UnknownSigningKey`, `SignatureInvalid`,
    /// `IssuerMismatch`, `AudienceMismatch`, `Expired`, `NotYetValid`, or
    /// `MetadataUnavailable` when signing keys cannot be obtained.
    pub async fn validate(&self, token: &str) -> Result<ValidatedClaims, AuthError> {
        let header = decode_header(token).map_err(|e| AuthError::Malformed(e.to_string()))?;

        let algorithm = match header.alg {
            alg @ (Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512) => alg,
            other => {
                return Err(AuthError::Malformed(format!(
                    "unsupported signing algorithm {other:?}"
                )));
            }
        };

        let kid = header
            .kid
            .ok_or_else(|| AuthError::Malformed("token header carries no key id".to_string()))?;
        let key = self.signing_key(&kid).await?;

        let mut validation = Validation::new(algorithm);
        // Audience and lifetime are checked manually below so each failure
        // carries its own error kind; decode() verifies the signature only.
        validation.validate_aud = false;
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.required_spec_claims.clear();

        let data =
            decode::<Map<String, Value>>(token, &key, &validation).map_err(|e| match e.kind() {
                ErrorKind::InvalidSignature => AuthError::SignatureInvalid,
                _ => AuthError::Malformed(e.to_string()),
            })?;
        let raw = data.claims;

        let issuer = raw
            .get("iss")
            .and_then(Value::as_str)
            .ok_or_else(|| AuthError::Malformed("token carries no iss claim".to_string()))?
            .to_string();
        if !self.accepted_issuers.contains(&issuer) {
            return Err(AuthError::IssuerMismatch(issuer));
        }

        let audience = match_audience(&self.accepted_audiences, &raw)?;
        check_lifetime(&raw, self.leeway_secs, Utc::now().timestamp())?;

        let subject = raw
            .get("sub")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        debug!(subject = %subject, issuer = %issuer, "Token validated");

        Ok(ValidatedClaims {
            subject,
            issuer,
            audience,
            scopes: claims::scopes_from(&raw),
            roles: claims::roles_from(&raw),
            claims: raw,
        })
    }

    /// Resolve a decoding key by `kid`, forcing one metadata refresh if the
    /// cached key set does not contain it.
    async fn signing_key(&self, kid: &str) -> Result<DecodingKey, AuthError> {
        let metadata = self.metadata.get().await?;
        if let Some(key) = find_key(&metadata.keys, kid) {
            return Ok(key);
        }

        debug!(kid = %kid, "Key id not in cached set, refreshing metadata");
        let metadata = self.metadata.refresh().await?;
        find_key(&metadata.keys, kid).ok_or_else(|| AuthError::UnknownSigningKey(kid.to_string()))
    }
}

/// Find a JWK by `kid` and convert it to a `DecodingKey`.
fn find_key(jwks: &JwkSet, kid: &str) -> Option<DecodingKey> {
    for jwk in &jwks.keys {
        if jwk.common.key_id.as_deref() != Some(kid) {
            continue;
        }
        return match &jwk.algorithm {
            AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e).ok(),
            _ => None,
        };
    }
    None
}

/// Match the token's `aud` claim (string or array form) against the
/// accepted set, returning the matched value.
fn match_audience(accepted: &[String], raw: &Map<String, Value>) -> Result<String, AuthError> {
    let aud = raw.get(CLAIM_AUDIENCE);
    let matched = match aud {
        Some(Value::String(s)) => accepted.iter().any(|a| a == s).then(|| s.clone()),
        Some(Value::Array(values)) => values
            .iter()
            .filter_map(Value::as_str)
            .find(|s| accepted.iter().any(|a| a == s))
            .map(str::to_string),
        _ => None,
    };
    matched.ok_or_else(|| {
        let rendered = aud.map_or_else(|| "<absent>".to_string(), ToString::to_string);
        AuthError::AudienceMismatch(rendered)
    })
}

/// Check `exp` (required) and `nbf` (optional) against `now` with leeway.
fn check_lifetime(raw: &Map<String, Value>, leeway_secs: i64, now: i64) -> Result<(), AuthError> {
    let exp = raw
        .get("exp")
        .and_then(Value::as_i64)
        .ok_or_else(|| AuthError::Malformed("token carries no exp claim".to_string()))?;
    if now > exp + leeway_secs {
        return Err(AuthError::Expired(timestamp(exp)));
    }

    if let Some(nbf) = raw.get("nbf").and_then(Value::as_i64) {
        if now + leeway_secs < nbf {
            return Err(AuthError::NotYetValid(timestamp(nbf)));
        }
    }

    Ok(())
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or(DateTime::UNIX_EPOCH)
}
