//! Voice gateway service.
//!
//! Bridges a SIP/RTP trunk to a cloud Realtime speech model and fans the
//! model's events out to browser WebSocket clients. One binary: the SIP
//! endpoint registers against the configured trunk, the HTTP listener
//! carries the browser gateway plus health and metrics.

mod bridge;
mod config;
mod gateway;
mod realtime;
mod registry;
mod runtime;
mod sip;
mod store;
mod workflow;

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use bridge::VoiceBridgeMetrics;
use config::GatewayConfig;
use gateway::{Gateway, GatewayUser};
use realtime::client::HttpMintTransport;
use realtime::session::RealtimeSessionFactory;
use realtime::TungsteniteConnector;
use registry::SessionRegistry;
use runtime::InviteRuntime;
use sip::registration::{SipAccountStore, SipRegistrar};
use sip::rtp::RtpPortAllocator;
use store::MemoryThreadStore;
use workflow::{MemoryWorkflowStore, TelephonyRoute, TelephonyStartConfig, WorkflowDefinition};

fn main() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("voice_gateway=info".parse().unwrap()),
        )
        .init();

    dotenvy::dotenv().ok();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("tokio runtime")
        .block_on(async {
            if let Err(e) = run_server().await {
                tracing::error!("gateway exited with error: {:#}", e);
                std::process::exit(1);
            }
        });
}

/// Application state shared across HTTP routes.
#[derive(Clone)]
struct AppState {
    gateway: Arc<Gateway>,
    metrics: Arc<VoiceBridgeMetrics>,
}

async fn run_server() -> anyhow::Result<()> {
    let config = GatewayConfig::from_env().ok_or_else(|| {
        anyhow::anyhow!(
            "missing configuration: SIP_TRUNK_HOST, SIP_USERNAME, SIP_PASSWORD and \
             MODEL_API_KEY are required"
        )
    })?;
    config.validate().map_err(|e| anyhow::anyhow!(e))?;

    let media_host = if config.media_host.is_empty() {
        SipRegistrar::detect_local_ipv4()
            .map(|ip| ip.to_string())
            .unwrap_or_else(|_| "127.0.0.1".to_string())
    } else {
        config.media_host.clone()
    };
    tracing::info!("media host: {}", media_host);

    let registry = Arc::new(SessionRegistry::new());
    let threads = Arc::new(MemoryThreadStore::new());
    let metrics = Arc::new(VoiceBridgeMetrics::default());
    let connector = Arc::new(TungsteniteConnector);

    let factory = Arc::new(RealtimeSessionFactory::new(
        connector.clone(),
        config.model_api_base.clone(),
    ));
    let gateway = Arc::new(Gateway::new(registry.clone(), factory, threads.clone()));

    let accounts = Arc::new(SipAccountStore::new(config.sip_accounts()));
    let workflows = default_workflow_store(&config);

    let mut runtime = InviteRuntime::new(
        config.runtime_config(media_host),
        accounts.clone(),
        workflows,
        config.voice_defaults(),
        registry.clone(),
        gateway.clone(),
        threads.clone(),
        Arc::new(HttpMintTransport::new()),
        connector,
        metrics.clone(),
    );
    if config.media_port == 0 {
        runtime = runtime.with_rtp_port_allocator(Arc::new(RtpPortAllocator::new(
            config.rtp_port_start,
            config.rtp_port_end,
        )));
    }
    let runtime = Arc::new(runtime);

    let registrar = Arc::new(SipRegistrar::new(config.registrar_config(), accounts));
    {
        let registrar = registrar.clone();
        let runtime = runtime.clone();
        tokio::spawn(async move {
            if let Err(e) = registrar.run(runtime).await {
                tracing::error!("SIP registrar stopped: {}", e);
            }
        });
    }

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    let app = Router::new()
        .route("/api/health", get(health))
        .route("/api/voice/metrics", get(voice_metrics))
        .route("/api/voice/ws", get(voice_ws))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { gateway, metrics });

    let listener = tokio::net::TcpListener::bind(&config.http_bind).await?;
    tracing::info!("HTTP gateway listening on {}", config.http_bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(registrar))
        .await?;
    Ok(())
}

async fn shutdown_signal(registrar: Arc<SipRegistrar>) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown requested");
    registrar.shutdown();
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn voice_metrics(State(state): State<AppState>) -> Json<Value> {
    Json(state.metrics.snapshot().await)
}

/// Browser gateway WebSocket. Identity arrives as `user_id` (plus optional
/// `email`) query parameters with the bearer token in the Authorization
/// header; a fronting auth layer is expected to have validated both.
async fn voice_ws(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let Some(user_id) = params.get("user_id").cloned().filter(|id| !id.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "user_id is required").into_response();
    };
    let email = params.get("email").cloned();
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let gateway = state.gateway.clone();
    ws.on_upgrade(move |socket| {
        gateway.serve_socket(socket, GatewayUser { id: user_id, email }, authorization)
    })
}

/// Single default workflow for every configured account. Deployments with a
/// workflow backend replace this with their own [`workflow::WorkflowStore`].
fn default_workflow_store(config: &GatewayConfig) -> Arc<MemoryWorkflowStore> {
    let definition = WorkflowDefinition {
        slug: "default".to_string(),
        telephony: Some(TelephonyStartConfig {
            routes: Vec::new(),
            default_route: Some(TelephonyRoute {
                label: Some("default".to_string()),
                is_default: true,
                ..TelephonyRoute::default()
            }),
            ring_timeout_seconds: config.ring_timeout_seconds,
            speak_first: config.speak_first,
            tools: Vec::new(),
        }),
    };

    let mut store = MemoryWorkflowStore::new();
    for account in config.sip_accounts() {
        store.bind_account(account.id, definition.clone());
    }
    Arc::new(store)
}
