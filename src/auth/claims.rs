//! Validated claims and the scope/role authorization policy.
//!
//! The recognized claim names are enumerated below; any other claim in a
//! token is carried in the raw claim set but ignored by every check.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::{Map, Value};

use super::AuthError;

/// Delegated-user scope claim (space-separated values).
pub const CLAIM_SCOPE: &str = "scp";
/// Legacy URI form of the scope claim, stamped by some token versions.
pub const CLAIM_SCOPE_LEGACY: &str = "http://schemas.microsoft.com/identity/claims/scope";
/// Application role claim (array of strings).
pub const CLAIM_ROLES: &str = "roles";
/// Authorized party — the client id of the calling application.
pub const CLAIM_AUTHORIZED_PARTY: &str = "azp";
/// Application id — v1.0 form of the calling application's client id.
pub const CLAIM_APP_ID: &str = "appid";
/// Audience the token was issued for.
pub const CLAIM_AUDIENCE: &str = "aud";

/// Claims extracted from a token that passed signature, issuer, audience,
/// and lifetime checks. Never constructed for a raw unvalidated token, and
/// never mutated after creation.
#[derive(Debug, Clone)]
pub struct ValidatedClaims {
    /// Subject (`sub`) claim.
    pub subject: String,
    /// Issuer that minted the token.
    pub issuer: String,
    /// The accepted audience the token matched.
    pub audience: String,
    /// Scope claim values, in token order. Empty for application tokens.
    pub scopes: Vec<String>,
    /// Role claim values. Empty for delegated tokens without app roles.
    pub roles: Vec<String>,
    /// The full raw claim set.
    pub claims: Map<String, Value>,
}

/// Outcome of the scope/role policy check. Pure value, no identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationDecision {
    /// Whether the token is accepted.
    pub accepted: bool,
    /// The scope or role that satisfied the policy, when one did.
    pub matched: Option<String>,
    /// Human-readable rejection reason, when rejected.
    pub reason: Option<String>,
}

impl AuthorizationDecision {
    fn accept(matched: Option<String>) -> Self {
        Self {
            accepted: true,
            matched,
            reason: None,
        }
    }

    fn reject(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            matched: None,
            reason: Some(reason.into()),
        }
    }
}

/// Apply the scope/role allow-list policy to validated claims.
///
/// The policy is deliberately permissive when unconfigured:
///
/// 1. A token with scopes is decided on scopes alone — accepted if the
///    allow-list is empty or intersects, rejected otherwise. It never falls
///    through to the role check.
/// 2. A token with roles (and no scopes) is decided the same way on roles.
/// 3. A token with neither passes only when neither allow-list is
///    configured (bare-validation mode).
#[must_use]
pub fn authorize(
    claims: &ValidatedClaims,
    accepted_scopes: &[String],
    accepted_roles: &[String],
) -> AuthorizationDecision {
    if !claims.scopes.is_empty() {
        if accepted_scopes.is_empty() {
            return AuthorizationDecision::accept(None);
        }
        return match claims
            .scopes
            .iter()
            .find(|s| accepted_scopes.contains(s))
        {
            Some(matched) => AuthorizationDecision::accept(Some(matched.clone())),
            None => AuthorizationDecision::reject(
                "token scopes do not intersect the accepted scopes",
            ),
        };
    }

    if !claims.roles.is_empty() {
        if accepted_roles.is_empty() {
            return AuthorizationDecision::accept(None);
        }
        return match claims.roles.iter().find(|r| accepted_roles.contains(r)) {
            Some(matched) => AuthorizationDecision::accept(Some(matched.clone())),
            None => {
                AuthorizationDecision::reject("token roles do not intersect the accepted roles")
            }
        };
    }

    if accepted_scopes.is_empty() && accepted_roles.is_empty() {
        return AuthorizationDecision::accept(None);
    }

    AuthorizationDecision::reject(
        "token carries neither a scope (scp) nor a role (roles) claim",
    )
}

/// Scope values from a raw claim set: `scp` first, then the legacy URI
/// claim name. Space-separated, order preserved.
#[must_use]
pub fn scopes_from(claims: &Map<String, Value>) -> Vec<String> {
    [CLAIM_SCOPE, CLAIM_SCOPE_LEGACY]
        .iter()
        .find_map(|name| claims.get(*name).and_then(Value::as_str))
        .map(|value| {
            value
                .split_whitespace()
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default()
}

/// Role values from a raw claim set (`roles`, array of strings).
#[must_use]
pub fn roles_from(claims: &Map<String, Value>) -> Vec<String> {
    claims
        .get(CLAIM_ROLES)
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Decode a JWT payload without verifying the signature.
///
/// Only for tokens that already passed [`super::TokenValidator::validate`];
/// the S2S resolver uses this to read the caller's client id claims.
///
/// # Errors
///
/// Returns [`AuthError::Malformed`] if the compact form or payload JSON is
/// not decodable.
pub fn decode_claims_unverified(token: &str) -> Result<Map<String, Value>, AuthError> {
    let mut parts = token.split('.');
    let payload = match (parts.next(), parts.next()) {
        (Some(_), Some(payload)) => payload,
        _ => {
            return Err(AuthError::Malformed(
                "token is not in JWT compact form".to_string(),
            ));
        }
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| AuthError::Malformed("token payload is not base64url".to_string()))?;

    serde_json::from_slice(&bytes)
        .map_err(|_| AuthError::Malformed("token payload is not a JSON object".to_string()))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn claims_with(scopes: &[&str], roles: &[&str]) -> ValidatedClaims {
        ValidatedClaims {
            subject: "user-1".to_string(),
            issuer: "https://issuer.test/v2.0".to_string(),
            audience: "client-id".to_string(),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            claims: Map::new(),
        }
    }

    fn allow(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn matching_scope_is_accepted() {
        let claims = claims_with(&["api://app/user_impersonation"], &[]);
        let decision = authorize(&claims, &allow(&["api://app/user_impersonation"]), &[]);
        assert!(decision.accepted);
        assert_eq!(
            decision.matched.as_deref(),
            Some("api://app/user_impersonation")
        );
    }

    #[test]
    fn empty_scope_allowlist_accepts_any_delegated_token() {
        let claims = claims_with(&["anything.at.all"], &[]);
        let decision = authorize(&claims, &[], &allow(&["some.role"]));
        assert!(decision.accepted);
        assert_eq!(decision.matched, None);
    }

    #[test]
    fn scope_is_checked_before_roles() {
        // Matching scope plus a role that would be rejected: the scope
        // decides and the role allow-list is never consulted.
        let claims = claims_with(&["user_impersonation"], &["NotAnAcceptedRole"]);
        let decision = authorize(
            &claims,
            &allow(&["user_impersonation"]),
            &allow(&["SomeOtherRole"]),
        );
        assert!(decision.accepted);
        assert_eq!(decision.matched.as_deref(), Some("user_impersonation"));
    }

    #[test]
    fn scoped_token_never_falls_through_to_roles() {
        // Non-matching scope with a role that WOULD match: still rejected,
        // because a token with scopes is decided on scopes alone.
        let claims = claims_with(&["wrong.scope"], &["Accepted.Role"]);
        let decision = authorize(
            &claims,
            &allow(&["user_impersonation"]),
            &allow(&["Accepted.Role"]),
        );
        assert!(!decision.accepted);
        assert!(decision.reason.is_some());
    }

    #[test]
    fn matching_role_is_accepted() {
        let claims = claims_with(&[], &["Data.Read"]);
        let decision = authorize(&claims, &allow(&["user_impersonation"]), &allow(&["Data.Read"]));
        assert!(decision.accepted);
        assert_eq!(decision.matched.as_deref(), Some("Data.Read"));
    }

    #[test]
    fn empty_role_allowlist_accepts_any_application_token() {
        let claims = claims_with(&[], &["Whatever.Role"]);
        let decision = authorize(&claims, &allow(&["user_impersonation"]), &[]);
        assert!(decision.accepted);
    }

    #[test]
    fn bare_validation_mode_accepts_claimless_token() {
        let claims = claims_with(&[], &[]);
        let decision = authorize(&claims, &[], &[]);
        assert!(decision.accepted);
    }

    #[test]
    fn claimless_token_is_rejected_when_policy_configured() {
        let claims = claims_with(&[], &[]);
        let decision = authorize(&claims, &allow(&["user_impersonation"]), &[]);
        assert!(!decision.accepted);
        assert!(decision.reason.is_some());
    }

    #[test]
    fn authorize_is_deterministic() {
        let claims = claims_with(&["a", "b"], &["r1"]);
        let scopes = allow(&["b"]);
        let roles = allow(&["r1"]);
        let first = authorize(&claims, &scopes, &roles);
        for _ in 0..10 {
            assert_eq!(authorize(&claims, &scopes, &roles), first);
        }
    }

    #[test]
    fn scopes_from_splits_on_whitespace() {
        let mut claims = Map::new();
        claims.insert(CLAIM_SCOPE.to_string(), json!("read write admin"));
        assert_eq!(scopes_from(&claims), vec!["read", "write", "admin"]);
    }

    #[test]
    fn scopes_from_falls_back_to_legacy_claim_name() {
        let mut claims = Map::new();
        claims.insert(CLAIM_SCOPE_LEGACY.to_string(), json!("user_impersonation"));
        assert_eq!(scopes_from(&claims), vec!["user_impersonation"]);
    }

    #[test]
    fn roles_from_reads_string_array() {
        let mut claims = Map::new();
        claims.insert(CLAIM_ROLES.to_string(), json!(["Data.Read", "Data.Write"]));
        assert_eq!(roles_from(&claims), vec!["Data.Read", "Data.Write"]);
    }

    #[test]
    fn decode_claims_unverified_reads_payload() {
        let payload = URL_SAFE_NO_PAD.encode(br#"{"azp":"client-1","sub":"s"}"#);
        let token = format!("eyJhbGciOiJSUzI1NiJ9.{payload}.sig");
        let claims = decode_claims_unverified(&token).unwrap();
        assert_eq!(claims.get("azp").and_then(Value::as_str), Some("client-1"));
    }

    #[test]
    fn decode_claims_unverified_rejects_non_jwt() {
        assert!(matches!(
            decode_claims_unverified("not-a-jwt"),
            Err(AuthError::Malformed(_))
        ));
    }
}
