//! On-Behalf-Of exchange tests against a local stub token endpoint
//!
//! The stub records every request so the tests can assert both the exchange
//! wire shape and the retry discipline (a rejected exchange is terminal).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{Form, Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::post};
use dataverse_gateway::auth::BearerToken;
use dataverse_gateway::config::{AzureAdConfig, DataverseConfig};
use dataverse_gateway::identity::{OboExchanger, ResolveError};
use parking_lot::Mutex;
use serde_json::json;
use tokio::net::TcpListener;

/// Shared stub state: call count, last form params, and whether to reject.
struct StubState {
    calls: AtomicUsize,
    reject: bool,
    last_params: Mutex<HashMap<String, String>>,
}

async fn token_endpoint(
    State(state): State<Arc<StubState>>,
    Form(params): Form<HashMap<String, String>>,
) -> impl IntoResponse {
    let call = state.calls.fetch_add(1, Ordering::SeqCst) + 1;
    *state.last_params.lock() = params;

    if state.reject {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "invalid_grant",
                "error_description": "AADSTS50013: assertion is not within its valid time range"
            })),
        );
    }

    (
        StatusCode::OK,
        Json(json!({
            "access_token": format!("obo-token-{call}"),
            "token_type": "Bearer",
            "expires_in": 3600
        })),
    )
}

/// Start the stub and return its state plus configs pointed at it.
async fn start_stub(reject: bool) -> (Arc<StubState>, AzureAdConfig, DataverseConfig) {
    let state = Arc::new(StubState {
        calls: AtomicUsize::new(0),
        reject,
        last_params: Mutex::new(HashMap::new()),
    });

    let app = Router::new()
        .route("/testtenant/oauth2/v2.0/token", post(token_endpoint))
        .with_state(Arc::clone(&state));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (state, azure_for(addr), dataverse_config())
}

fn azure_for(addr: SocketAddr) -> AzureAdConfig {
    AzureAdConfig {
        tenant_id: "testtenant".to_string(),
        client_id: "gateway-client-id".to_string(),
        client_secret: "gateway-secret".to_string(),
        authority_host: format!("http://{addr}"),
        http_timeout: Duration::from_secs(5),
        ..AzureAdConfig::default()
    }
}

fn dataverse_config() -> DataverseConfig {
    DataverseConfig {
        url: "https://org.crm.dynamics.com".to_string(),
        ..DataverseConfig::default()
    }
}

#[tokio::test]
async fn successful_exchange_yields_delegated_context() {
    let (state, azure, dataverse) = start_stub(false).await;
    let exchanger = OboExchanger::new(&azure, &dataverse).unwrap();

    let context = exchanger
        .exchange(&BearerToken::new("user.assertion.token"))
        .await
        .unwrap();

    assert_eq!(context.access_token(), "obo-token-1");
    assert!(context.expires_at() > chrono::Utc::now());

    let params = state.last_params.lock().clone();
    assert_eq!(
        params.get("grant_type").map(String::as_str),
        Some("urn:ietf:params:oauth:grant-type:jwt-bearer")
    );
    assert_eq!(
        params.get("requested_token_use").map(String::as_str),
        Some("on_behalf_of")
    );
    assert_eq!(
        params.get("assertion").map(String::as_str),
        Some("user.assertion.token")
    );
    assert_eq!(
        params.get("scope").map(String::as_str),
        Some("https://org.crm.dynamics.com/.default")
    );
}

#[tokio::test]
async fn fresh_token_reexchanges_instead_of_caching() {
    let (state, azure, dataverse) = start_stub(false).await;
    let exchanger = OboExchanger::new(&azure, &dataverse).unwrap();

    let context = exchanger
        .exchange(&BearerToken::new("user.assertion.token"))
        .await
        .unwrap();
    assert_eq!(state.calls.load(Ordering::SeqCst), 1);

    // Each downstream call re-performs the exchange; no token is reused.
    let first = context.fresh_token().await.unwrap();
    let second = context.fresh_token().await.unwrap();

    assert_eq!(first, "obo-token-2");
    assert_eq!(second, "obo-token-3");
    assert_eq!(state.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn rejected_exchange_fails_once_and_is_not_retried() {
    let (state, azure, dataverse) = start_stub(true).await;
    let exchanger = OboExchanger::new(&azure, &dataverse).unwrap();

    let err = exchanger
        .exchange(&BearerToken::new("user.assertion.token"))
        .await
        .unwrap_err();

    assert!(matches!(err, ResolveError::TokenExchangeFailed(_)), "got {err:?}");
    assert!(err.to_string().contains("invalid_grant"));
    assert_eq!(
        state.calls.load(Ordering::SeqCst),
        1,
        "a rejected exchange must not be retried"
    );
}

#[tokio::test]
async fn unreachable_token_endpoint_is_downstream_unavailable() {
    // Bind to get a free port, then drop the listener so connects are refused.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let exchanger = OboExchanger::new(&azure_for(addr), &dataverse_config()).unwrap();

    let err = exchanger
        .exchange(&BearerToken::new("user.assertion.token"))
        .await
        .unwrap_err();

    assert!(matches!(err, ResolveError::DownstreamUnavailable(_)), "got {err:?}");
}
