//! HTTP API for health checks, ledger status, and the signer endpoint

use crate::asset::ChainKind;
use crate::chain::ChainManager;
use crate::config::ApiConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::ledger::{LedgerStats, TransferLedger};
use crate::role::Role;
use crate::rpc::{JsonRpcRequest, JsonRpcResponse, RpcError};
use crate::signer::SignerService;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub role: Role,
    pub ledger: Arc<dyn TransferLedger>,
    pub chain_manager: Arc<ChainManager>,
    /// Present on verifiers only
    pub signer: Option<Arc<SignerService>>,
    pub started_at: Instant,
}

pub fn router(state: AppState) -> Router {
    let mut app = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/status", get(get_status))
        .route("/chains", get(get_chains));

    if state.signer.is_some() {
        app = app.route("/signer", post(signer_rpc));
    }

    app.layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> RelayerResult<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| RelayerError::Config(format!("bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| RelayerError::Internal(e.to_string()))?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - verify all dependencies
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let db_ok = state.ledger.health_check().await.is_ok();

    let chain_health = state.chain_manager.health_check().await;
    let chains_ok = chain_health.iter().all(|(_, healthy)| *healthy);

    let status = if db_ok && chains_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready: db_ok && chains_ok,
            database: db_ok,
            chains: chains_ok,
            details: chain_health
                .into_iter()
                .map(|(chain, healthy)| ChainHealth { chain, healthy })
                .collect(),
        }),
    )
}

/// Relayer role, uptime and ledger counts
async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    match state.ledger.stats().await {
        Ok(ledger) => (
            StatusCode::OK,
            Json(StatusResponse {
                version: env!("CARGO_PKG_VERSION").to_string(),
                role: state.role.to_string(),
                uptime_seconds: state.started_at.elapsed().as_secs(),
                ledger,
            }),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

/// Persisted cursor of every watched chain
async fn get_chains(State(state): State<AppState>) -> impl IntoResponse {
    let mut chains = Vec::new();
    for chain in state.chain_manager.chains() {
        match state.ledger.cursor(chain).await {
            Ok(cursor) => chains.push(ChainStatus {
                chain,
                height: cursor.as_ref().map(|c| c.height),
                hash: cursor.map(|c| c.hash),
            }),
            Err(e) => {
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse {
                        error: e.to_string(),
                    }),
                )
                    .into_response()
            }
        }
    }
    (StatusCode::OK, Json(ChainsResponse { chains })).into_response()
}

/// JSON-RPC 2.0 endpoint answering `signTx` and `pendingTx`
async fn signer_rpc(State(state): State<AppState>, Json(body): Json<Value>) -> impl IntoResponse {
    let Some(signer) = state.signer else {
        return (StatusCode::NOT_FOUND, Json(Value::Null));
    };

    let response = match serde_json::from_value::<JsonRpcRequest>(body) {
        Ok(request) => signer.handle(request).await,
        Err(e) => JsonRpcResponse::error(
            Value::Null,
            RpcError {
                code: -32600,
                message: format!("invalid request: {}", e),
            },
        ),
    };

    let body = serde_json::to_value(response).unwrap_or(Value::Null);
    (StatusCode::OK, Json(body))
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    database: bool,
    chains: bool,
    details: Vec<ChainHealth>,
}

#[derive(Serialize)]
struct ChainHealth {
    chain: ChainKind,
    healthy: bool,
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    role: String,
    uptime_seconds: u64,
    ledger: LedgerStats,
}

#[derive(Serialize)]
struct ChainStatus {
    chain: ChainKind,
    height: Option<u64>,
    hash: Option<String>,
}

#[derive(Serialize)]
struct ChainsResponse {
    chains: Vec<ChainStatus>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::AssetWhitelist;
    use crate::chain::{ChainClient, MockChainClient};
    use crate::ledger::fixtures::lock_event;
    use crate::ledger::{ChainCursor, MemoryLedger};
    use crate::multisig::auth::tests::{COLLECTOR_ADDRESS, OTHER_KEY};
    use crate::multisig::{CollectorAuth, SignerKey};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::json;
    use tower::ServiceExt;

    async fn state(signer: bool) -> AppState {
        let ledger = Arc::new(MemoryLedger::new());
        ledger
            .upsert_source_event(&lock_event("0xaa-0", 100))
            .await
            .unwrap();
        ledger
            .save_cursor(ChainKind::Ethereum, &ChainCursor::new(120, "0xb120"))
            .await
            .unwrap();

        let mut client = MockChainClient::new();
        client.expect_chain().return_const(ChainKind::Ethereum);
        client.expect_tip_height().returning(|| Ok(120));
        let chain_manager = Arc::new(ChainManager::from_parts(
            vec![Arc::new(client) as Arc<dyn ChainClient>],
            vec![],
        ));

        let signer = signer.then(|| {
            let auth = CollectorAuth::new(None, &[COLLECTOR_ADDRESS.to_string()]).unwrap();
            let key = SignerKey::from_private_key(OTHER_KEY).unwrap();
            Arc::new(SignerService::new(
                ledger.clone(),
                Arc::new(AssetWhitelist::default()),
                chain_manager.clone(),
                auth,
                key,
            ))
        });

        AppState {
            role: if signer.is_some() { Role::Verifier } else { Role::Watcher },
            ledger,
            chain_manager,
            signer,
            started_at: Instant::now(),
        }
    }

    async fn call(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = tokio_test::assert_ok!(app.oneshot(request).await);
        let status = response.status();
        let bytes = tokio_test::assert_ok!(to_bytes(response.into_body(), usize::MAX).await);
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_status_reports_ledger_counts() {
        let (status, body) = call(router(state(false).await), get("/status")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["role"], "watcher");
        assert_eq!(body["ledger"]["unconfirmed"], 1);
    }

    #[tokio::test]
    async fn test_ready_and_chains() {
        let state = state(false).await;

        let (status, body) = call(router(state.clone()), get("/ready")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["details"][0]["chain"], "ethereum");

        let (_, body) = call(router(state), get("/chains")).await;
        assert_eq!(body["chains"][0]["height"], 120);
        assert_eq!(body["chains"][0]["hash"], "0xb120");
    }

    #[tokio::test]
    async fn test_signer_endpoint_only_on_verifiers() {
        let request = || {
            Request::builder()
                .method("POST")
                .uri("/signer")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({"jsonrpc": "2.0", "id": 1, "method": "pendingTx", "params": {"chain": "nervos"}})
                        .to_string(),
                ))
                .unwrap()
        };

        let (status, body) = call(router(state(true).await), request()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], 1);
        assert_eq!(body["result"], Value::Null);
        assert!(body.get("error").is_none());

        let (status, _) = call(router(state(false).await), request()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
