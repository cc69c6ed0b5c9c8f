//! Service-to-service resolution tests against a fake Dataverse connection

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dataverse_gateway::auth::BearerToken;
use dataverse_gateway::dataverse::{ApplicationUser, DataverseConnection, WhoAmIResponse};
use dataverse_gateway::identity::{ApplicationIdentityResolver, ResolveError};
use serde_json::json;
use uuid::Uuid;

/// In-memory connection: configurable application-user records, counting
/// queries, and a WhoAmI that echoes the impersonated caller.
struct FakeConnection {
    users: Vec<ApplicationUser>,
    queries: AtomicUsize,
}

impl FakeConnection {
    fn with_users(users: Vec<ApplicationUser>) -> Arc<Self> {
        Arc::new(Self {
            users,
            queries: AtomicUsize::new(0),
        })
    }

    fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataverseConnection for FakeConnection {
    async fn find_application_users(
        &self,
        _application_id: Uuid,
    ) -> Result<Vec<ApplicationUser>, ResolveError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        Ok(self.users.clone())
    }

    async fn who_am_i(&self, caller_id: Option<Uuid>) -> Result<WhoAmIResponse, ResolveError> {
        Ok(WhoAmIResponse {
            user_id: caller_id.unwrap_or_else(Uuid::nil),
            business_unit_id: Uuid::nil(),
            organization_id: Uuid::nil(),
        })
    }
}

fn app_user(name: &str) -> ApplicationUser {
    ApplicationUser {
        id: Uuid::new_v4(),
        full_name: Some(name.to_string()),
    }
}

/// An unsigned-but-well-formed service token carrying the given claims.
/// The resolver reads claims without re-validating, so no signature needed.
fn service_token(claims: serde_json::Value) -> BearerToken {
    use base64::Engine as _;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    BearerToken::new(format!("{header}.{payload}.sig"))
}

const CALLER_CLIENT_ID: &str = "11111111-1111-1111-1111-111111111111";

#[tokio::test]
async fn zero_matching_records_is_client_id_not_found() {
    let connection = FakeConnection::with_users(vec![]);
    let resolver = ApplicationIdentityResolver::new(connection, Duration::ZERO);

    let err = resolver
        .resolve_application_identity(&service_token(json!({ "azp": CALLER_CLIENT_ID })))
        .await
        .unwrap_err();

    assert!(matches!(err, ResolveError::ClientIdNotFound(_)), "got {err:?}");
}

#[tokio::test]
async fn multiple_matching_records_impersonates_the_first() {
    let first = app_user("App User One");
    let second = app_user("App User Two");
    let first_id = first.id;
    let connection = FakeConnection::with_users(vec![first, second]);
    let resolver = ApplicationIdentityResolver::new(connection, Duration::ZERO);

    let context = resolver
        .resolve_application_identity(&service_token(json!({ "azp": CALLER_CLIENT_ID })))
        .await
        .unwrap();

    assert_eq!(context.application_user_id, first_id);
}

#[tokio::test]
async fn impersonation_context_executes_as_the_mapped_user() {
    let user = app_user("App User");
    let user_id = user.id;
    let connection = FakeConnection::with_users(vec![user]);
    let resolver = ApplicationIdentityResolver::new(connection, Duration::ZERO);

    let context = resolver
        .resolve_application_identity(&service_token(json!({ "azp": CALLER_CLIENT_ID })))
        .await
        .unwrap();

    // The connection receives the mapped user as the caller.
    let response = context
        .connection
        .who_am_i(Some(context.application_user_id))
        .await
        .unwrap();
    assert_eq!(response.user_id, user_id);
}

#[tokio::test]
async fn mapping_cache_skips_repeat_queries_within_ttl() {
    let connection = FakeConnection::with_users(vec![app_user("App User")]);
    let resolver = ApplicationIdentityResolver::new(
        Arc::clone(&connection) as Arc<dyn DataverseConnection>,
        Duration::from_secs(300),
    );
    let token = service_token(json!({ "azp": CALLER_CLIENT_ID }));

    resolver.resolve_application_identity(&token).await.unwrap();
    resolver.resolve_application_identity(&token).await.unwrap();

    assert_eq!(connection.queries(), 1, "second resolve served from cache");
}

#[tokio::test]
async fn disabled_cache_queries_every_time() {
    let connection = FakeConnection::with_users(vec![app_user("App User")]);
    let resolver = ApplicationIdentityResolver::new(
        Arc::clone(&connection) as Arc<dyn DataverseConnection>,
        Duration::ZERO,
    );
    let token = service_token(json!({ "azp": CALLER_CLIENT_ID }));

    resolver.resolve_application_identity(&token).await.unwrap();
    resolver.resolve_application_identity(&token).await.unwrap();

    assert_eq!(connection.queries(), 2);
}

#[tokio::test]
async fn appid_claim_is_used_when_azp_absent() {
    let user = app_user("App User");
    let user_id = user.id;
    let connection = FakeConnection::with_users(vec![user]);
    let resolver = ApplicationIdentityResolver::new(connection, Duration::ZERO);

    let context = resolver
        .resolve_application_identity(&service_token(json!({ "appid": CALLER_CLIENT_ID })))
        .await
        .unwrap();

    assert_eq!(context.application_user_id, user_id);
}

#[tokio::test]
async fn non_guid_client_id_is_client_id_not_found() {
    // The aud fallback can surface an api:// URI, which cannot name an
    // application user.
    let connection = FakeConnection::with_users(vec![app_user("App User")]);
    let resolver = ApplicationIdentityResolver::new(
        Arc::clone(&connection) as Arc<dyn DataverseConnection>,
        Duration::ZERO,
    );

    let err = resolver
        .resolve_application_identity(&service_token(json!({ "aud": "api://some-resource" })))
        .await
        .unwrap_err();

    assert!(matches!(err, ResolveError::ClientIdNotFound(_)), "got {err:?}");
    assert_eq!(connection.queries(), 0, "no downstream query was attempted");
}
