//! Home Connect Proxy
//!
//! Single-binary Rust service that:
//! 1. Walks the operator through the OAuth authorization-code flow
//! 2. Keeps the resulting token valid (single-flight refresh, persisted)
//! 3. Forwards `/homeappliances` REST calls upstream with the bearer token
//! 4. Relays the upstream event stream to MQTT topics

mod authorize;
mod config;
mod error;
mod forward;
mod metrics;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use event_bridge::{EventPublisher, MqttBus, SseBridge, run_dispatcher, run_supervised};
use homeconnect_auth::{CredentialStore, FileCredentialStore, TokenManager, TokenStatus};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::authorize::{AuthFlowState, PendingAuthorizations};
use crate::config::Config;
use crate::forward::{ProxyState, error_response};
use crate::metrics::ServiceMetrics;

/// Graceful shutdown budget for in-flight requests and the event pipeline
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// TCP keepalive interval for upstream connections
const TCP_KEEPALIVE: Duration = Duration::from_secs(60);

/// Served by `GET /`
const ROUTES: &[&str] = &[
    "/",
    "/proxy/auth",
    "/proxy/auth/redirect",
    "/proxy/success",
    "/health",
    "/metrics",
    "/homeappliances",
    "/homeappliances/{*path}",
];

/// Shared application state accessible from all handlers
#[derive(Clone)]
pub struct AppState {
    pub proxy: ProxyState,
    pub auth: AuthFlowState,
    pub metrics: ServiceMetrics,
    pub prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
///
/// Applies a concurrency limit layer based on `max_connections`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/", get(home_handler))
        .route("/proxy/auth", get(authorize::start_handler))
        .route("/proxy/auth/redirect", get(authorize::redirect_handler))
        .route("/proxy/success", get(authorize::success_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/homeappliances", any(proxy_handler))
        .route("/homeappliances/{*path}", any(proxy_handler))
        .fallback(not_found_handler)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

/// Background tasks of the event stream → MQTT pipeline.
struct BridgeTasks {
    supervisor: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
    mqtt_loop: JoinHandle<()>,
    mqtt_cancel: CancellationToken,
}

impl BridgeTasks {
    /// Start the MQTT client, the dispatcher and the stream supervisor.
    /// The supervisor stops when `cancel` fires.
    fn start(
        config: &Config,
        client: reqwest::Client,
        tokens: Arc<TokenManager>,
        cancel: CancellationToken,
    ) -> Self {
        let mqtt_cancel = CancellationToken::new();
        let (bus, mqtt_loop) = MqttBus::connect(&config.mqtt_settings(), mqtt_cancel.clone());
        let publisher = EventPublisher::new(Arc::new(bus), config.mqtt.root_topic.clone());

        let (tx, rx) = mpsc::channel(config.bridge.channel_capacity);
        let dispatcher = tokio::spawn(run_dispatcher(
            publisher,
            rx,
            config.bridge.max_in_flight,
        ));

        let bridge = Arc::new(
            SseBridge::new(
                client,
                &config.proxy.base_url,
                &config.bridge.events_path,
                tokens,
            )
            .with_idle_timeout(Duration::from_secs(config.bridge.idle_timeout_secs)),
        );
        info!(url = %bridge.events_url(), "starting event bridge");
        let supervisor = tokio::spawn(run_supervised(bridge, tx, cancel));

        Self {
            supervisor,
            dispatcher,
            mqtt_loop,
            mqtt_cancel,
        }
    }

    /// Wait for the supervisor to release the channel and the dispatcher to
    /// finish in-flight publishes, then stop the MQTT event loop.
    async fn shutdown(self) {
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            let _ = self.supervisor.await;
            let _ = self.dispatcher.await;
        })
        .await;
        if drained.is_err() {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "event pipeline did not drain in time"
            );
        }
        self.mqtt_cancel.cancel();
        let _ = self.mqtt_loop.await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting homeconnect-proxy");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    let credentials = config
        .client_credentials()
        .context("client secret was not resolved")?;

    info!(
        listen_addr = %config.proxy.listen_addr,
        base_url = %config.proxy.base_url,
        token_path = %config.storage.token_path.display(),
        bridge_enabled = config.bridge.enabled,
        "configuration loaded"
    );

    // No client-wide timeout: the event stream is long-lived. Forwarded
    // requests set their own; the bridge bounds idle reads itself.
    let client = reqwest::Client::builder()
        .tcp_keepalive(TCP_KEEPALIVE)
        .build()
        .context("failed to build HTTP client")?;

    let store: Arc<dyn CredentialStore> =
        Arc::new(FileCredentialStore::new(&config.storage.token_path));
    let tokens = Arc::new(TokenManager::new(
        store,
        client.clone(),
        credentials,
        config.oauth.token_url.clone(),
    ));

    match tokens.status().await {
        Ok(TokenStatus::Valid { expires_at }) => info!(expires_at, "stored token is valid"),
        Ok(status) => warn!(
            token = status.label(),
            "no usable token, open /proxy/auth to authorize the application"
        ),
        Err(e) => warn!(error = %e, "could not read stored token"),
    }

    let metrics = ServiceMetrics::new();
    let app_state = AppState {
        proxy: ProxyState {
            client: client.clone(),
            base_url: config.proxy.base_url.clone(),
            tokens: tokens.clone(),
            timeout: Duration::from_secs(config.proxy.timeout_secs),
            requests_total: metrics.requests_total.clone(),
            errors_total: metrics.errors_total.clone(),
        },
        auth: AuthFlowState {
            tokens: tokens.clone(),
            authorize_url: config.oauth.authorize_url.clone(),
            pending: PendingAuthorizations::new(),
        },
        metrics,
        prometheus: prometheus_handle,
    };

    let cancel = CancellationToken::new();
    let bridge_tasks = if config.bridge.enabled {
        Some(BridgeTasks::start(
            &config,
            client,
            tokens,
            cancel.clone(),
        ))
    } else {
        info!("event bridge disabled");
        None
    };

    let app = build_router(app_state, config.proxy.max_connections);

    let listen_addr = config.proxy.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // Graceful shutdown:
    // 1. shutdown_signal() fires on SIGTERM/SIGINT
    // 2. the event stream is cancelled and axum stops accepting connections
    // 3. DRAIN_TIMEOUT bounds how long in-flight requests may take
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;

    cancel.cancel();
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    if let Some(tasks) = bridge_tasks {
        tasks.shutdown().await;
    }

    info!("shutdown complete");
    Ok(())
}

/// Plain-text list of the routes this service answers.
async fn home_handler() -> String {
    let mut body = String::from("available endpoints:\n");
    for route in ROUTES {
        body.push('\t');
        body.push_str(route);
        body.push('\n');
    }
    body
}

/// Health endpoint: JSON with token state, uptime and request counters.
/// Returns 503 while no usable credential exists.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.metrics.started_at.elapsed().as_secs();
    let requests = state.metrics.requests_total.load(Ordering::Relaxed);
    let errors = state.metrics.errors_total.load(Ordering::Relaxed);

    let (status_code, body) = match state.proxy.tokens.status().await {
        Ok(token) => {
            let usable = matches!(
                token,
                TokenStatus::Valid { .. } | TokenStatus::Expired { refreshable: true }
            );
            let mut body = serde_json::json!({
                "status": if usable { "healthy" } else { "unauthorized" },
                "token": token.label(),
                "uptime_seconds": uptime,
                "requests_served": requests,
                "errors_total": errors,
            });
            if let TokenStatus::Valid { expires_at } = token {
                body["token_expires_at"] = serde_json::json!(expires_at);
            }
            let code = if usable {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            (code, body)
        }
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({
                "status": "degraded",
                "token": "unreadable",
                "error": e.to_string(),
                "uptime_seconds": uptime,
                "requests_served": requests,
                "errors_total": errors,
            }),
        ),
    };

    (
        status_code,
        [(CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.prometheus.render(),
    )
}

/// Forwards `/homeappliances` requests upstream.
async fn proxy_handler(
    State(state): State<AppState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    forward::forward_request(&state.proxy, request, request_id).await
}

async fn not_found_handler(uri: axum::http::Uri) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    error_response(
        StatusCode::NOT_FOUND,
        "not_found",
        &format!("no route for {}", uri.path()),
        &request_id,
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use axum::body::Body;
    use axum::http::Request;
    use homeconnect_auth::{
        ClientCredentials, ClientSecret, MemoryCredentialStore, Token, epoch_seconds,
    };
    use tower::ServiceExt;

    const AUTHORIZE_URL: &str = "https://api.home-connect.com/security/oauth/authorize";

    /// Create a PrometheusHandle for tests without installing a global recorder.
    fn test_prometheus_handle() -> PrometheusHandle {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        recorder.handle()
    }

    fn token(access: &str, expires_at: i64) -> Token {
        Token {
            access_token: access.into(),
            refresh_token: "rt_stored".into(),
            expires_at,
            scope: "IdentifyAppliance Monitor".into(),
            token_type: "Bearer".into(),
            id_token: String::new(),
        }
    }

    fn token_manager(store: Arc<MemoryCredentialStore>, token_url: &str) -> Arc<TokenManager> {
        let credentials = ClientCredentials {
            client_id: "client-id".into(),
            client_secret: ClientSecret::new("client-secret"),
            scopes: "IdentifyAppliance Monitor".into(),
            redirect_uri: None,
        };
        Arc::new(TokenManager::new(
            store,
            reqwest::Client::new(),
            credentials,
            token_url,
        ))
    }

    /// State whose store holds a token valid for an hour.
    fn test_app_state(base_url: &str) -> AppState {
        let store = Arc::new(MemoryCredentialStore::with_token(token(
            "at_valid",
            epoch_seconds() + 3600,
        )));
        app_state_with(base_url, token_manager(store, "http://127.0.0.1:1/token"))
    }

    fn app_state_with(base_url: &str, tokens: Arc<TokenManager>) -> AppState {
        let metrics = ServiceMetrics::new();
        AppState {
            proxy: ProxyState {
                client: reqwest::Client::new(),
                base_url: base_url.to_string(),
                tokens: tokens.clone(),
                timeout: Duration::from_secs(5),
                requests_total: metrics.requests_total.clone(),
                errors_total: metrics.errors_total.clone(),
            },
            auth: AuthFlowState {
                tokens,
                authorize_url: AUTHORIZE_URL.to_string(),
                pending: PendingAuthorizations::new(),
            },
            metrics,
            prometheus: test_prometheus_handle(),
        }
    }

    async fn serve(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    /// Mock upstream that echoes back request headers, path, query and body.
    async fn start_echo_server() -> String {
        let app = Router::new().fallback(|request: Request<Body>| async move {
            let mut headers_map = serde_json::Map::new();
            for (name, value) in request.headers() {
                headers_map.insert(
                    name.to_string(),
                    serde_json::Value::String(value.to_str().unwrap_or("").to_string()),
                );
            }
            let method = request.method().to_string();
            let path = request.uri().path().to_string();
            let query = request.uri().query().unwrap_or("").to_string();
            let body_bytes = axum::body::to_bytes(request.into_body(), 1024 * 1024)
                .await
                .unwrap();
            let body = serde_json::json!({
                "echoed_headers": headers_map,
                "method": method,
                "path": path,
                "query": query,
                "body": String::from_utf8_lossy(&body_bytes),
            });
            (
                StatusCode::OK,
                [("x-upstream-echo", "true")],
                axum::Json(body),
            )
        });
        serve(app).await
    }

    /// Mock token endpoint at `/token` counting calls.
    async fn start_token_server(reply: serde_json::Value) -> (String, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let app = Router::new().route(
            "/token",
            axum::routing::post(move || {
                let counter = counter.clone();
                let reply = reply.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    axum::Json(reply)
                }
            }),
        );
        (format!("{}/token", serve(app).await), calls)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    async fn body_text(response: Response) -> String {
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        String::from_utf8(body.to_vec()).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn forwards_status_request_with_bearer_token() {
        let upstream = start_echo_server().await;
        let app = build_router(test_app_state(&format!("{upstream}/api")), 1000);

        let response = app
            .oneshot(get("/homeappliances/XYZ/status"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-upstream-echo"], "true");
        let json = body_json(response).await;
        assert_eq!(json["path"], "/api/homeappliances/XYZ/status");
        assert_eq!(json["method"], "GET");
        assert_eq!(json["echoed_headers"]["authorization"], "Bearer at_valid");
        assert_eq!(json["echoed_headers"]["content-type"], "application/json");
    }

    #[tokio::test]
    async fn non_2xx_vendor_responses_pass_through_unchanged() {
        let upstream = serve(Router::new().fallback(|| async {
            (
                StatusCode::CONFLICT,
                [(CONTENT_TYPE, "application/vnd.bsh.sdk.v1+json")],
                r#"{"error":{"key":"SDK.Error.WrongOperationState"}}"#,
            )
        }))
        .await;
        let app = build_router(test_app_state(&upstream), 1000);

        let response = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/homeappliances/XYZ/programs/active")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(
            response.headers()[CONTENT_TYPE],
            "application/vnd.bsh.sdk.v1+json"
        );
        assert_eq!(
            body_text(response).await,
            r#"{"error":{"key":"SDK.Error.WrongOperationState"}}"#
        );
    }

    #[tokio::test]
    async fn client_authorization_is_replaced() {
        let upstream = start_echo_server().await;
        let app = build_router(test_app_state(&upstream), 1000);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/homeappliances")
                    .header("authorization", "Bearer client-supplied")
                    .header("accept-language", "de-DE")
                    .header("connection", "keep-alive")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let json = body_json(response).await;
        assert_eq!(json["echoed_headers"]["authorization"], "Bearer at_valid");
        assert_eq!(json["echoed_headers"]["accept-language"], "de-DE");
        assert!(json["echoed_headers"].get("connection").is_none());
    }

    #[tokio::test]
    async fn query_string_and_body_are_forwarded() {
        let upstream = start_echo_server().await;
        let app = build_router(test_app_state(&upstream), 1000);

        let response = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/homeappliances/XYZ/settings/BSH.Common.Setting.PowerState?lang=en")
                    .body(Body::from(r#"{"data":{"value":"On"}}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        let json = body_json(response).await;
        assert_eq!(json["method"], "PUT");
        assert_eq!(json["query"], "lang=en");
        assert_eq!(json["body"], r#"{"data":{"value":"On"}}"#);
    }

    #[tokio::test]
    async fn missing_credential_returns_503_without_calling_upstream() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let upstream = serve(Router::new().fallback(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                "unexpected"
            }
        }))
        .await;
        let tokens = token_manager(
            Arc::new(MemoryCredentialStore::new()),
            "http://127.0.0.1:1/token",
        );
        let state = app_state_with(&upstream, tokens);
        let errors = state.metrics.errors_total.clone();
        let app = build_router(state, 1000);

        let response = app.oneshot(get("/homeappliances")).await.unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "authorization_required");
        assert!(
            json["error"]["request_id"]
                .as_str()
                .unwrap()
                .starts_with("req_")
        );
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(errors.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_before_forwarding() {
        let upstream = start_echo_server().await;
        let (token_url, calls) = start_token_server(serde_json::json!({
            "access_token": "at_refreshed",
            "refresh_token": "rt_new",
            "expires_in": 86400,
            "token_type": "Bearer",
        }))
        .await;
        let store = Arc::new(MemoryCredentialStore::with_token(token(
            "at_expired",
            epoch_seconds() - 10,
        )));
        let app = build_router(
            app_state_with(&upstream, token_manager(store.clone(), &token_url)),
            1000,
        );

        let response = app.oneshot(get("/homeappliances")).await.unwrap();

        let json = body_json(response).await;
        assert_eq!(json["echoed_headers"]["authorization"], "Bearer at_refreshed");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.current().unwrap().refresh_token, "rt_new");
    }

    #[tokio::test]
    async fn dead_upstream_returns_502() {
        let app = build_router(test_app_state("http://127.0.0.1:1"), 1000);

        let response = app.oneshot(get("/homeappliances")).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "proxy_error");
        assert!(json["error"]["message"].is_string());
    }

    #[tokio::test]
    async fn slow_upstream_returns_504() {
        let upstream = serve(Router::new().fallback(|| async {
            tokio::time::sleep(Duration::from_secs(3)).await;
            "too late"
        }))
        .await;
        let mut state = test_app_state(&upstream);
        state.proxy.timeout = Duration::from_millis(200);
        let app = build_router(state, 1000);

        let response = app.oneshot(get("/homeappliances")).await.unwrap();

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "proxy_error");
    }

    #[tokio::test]
    async fn event_stream_is_relayed() {
        let frames = "id:Oven\nevent:STATUS\ndata:{}\n\n";
        let upstream = serve(Router::new().route(
            "/homeappliances/events",
            axum::routing::get(move || async move {
                ([(CONTENT_TYPE, "text/event-stream")], frames)
            }),
        ))
        .await;
        let app = build_router(test_app_state(&upstream), 1000);

        let response = app.oneshot(get("/homeappliances/events")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "text/event-stream");
        assert_eq!(body_text(response).await, frames);
    }

    #[tokio::test]
    async fn unknown_paths_return_404() {
        let app = build_router(test_app_state("http://unused"), 1000);

        let response = app.oneshot(get("/v1/messages")).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "not_found");
    }

    #[tokio::test]
    async fn home_lists_endpoints() {
        let app = build_router(test_app_state("http://unused"), 1000);

        let response = app.oneshot(get("/")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let text = body_text(response).await;
        assert!(text.starts_with("available endpoints:"));
        assert!(text.contains("\t/proxy/auth\n"));
        assert!(text.contains("\t/homeappliances/{*path}\n"));
    }

    #[tokio::test]
    async fn health_reports_valid_token() {
        let state = test_app_state("http://unused");
        state.metrics.requests_total.fetch_add(5, Ordering::Relaxed);
        let app = build_router(state, 1000);

        let response = app.oneshot(get("/health")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["token"], "valid");
        assert!(json["token_expires_at"].is_i64());
        assert_eq!(json["requests_served"], 5);
        assert!(json["uptime_seconds"].is_u64());
    }

    #[tokio::test]
    async fn health_returns_503_without_credential() {
        let tokens = token_manager(
            Arc::new(MemoryCredentialStore::new()),
            "http://127.0.0.1:1/token",
        );
        let app = build_router(app_state_with("http://unused", tokens), 1000);

        let response = app.oneshot(get("/health")).await.unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(response).await;
        assert_eq!(json["status"], "unauthorized");
        assert_eq!(json["token"], "unauthorized");
        assert!(json.get("token_expires_at").is_none());
    }

    #[tokio::test]
    async fn health_stays_up_while_token_is_refreshable() {
        let store = Arc::new(MemoryCredentialStore::with_token(token(
            "at_expired",
            epoch_seconds() - 10,
        )));
        let app = build_router(
            app_state_with("http://unused", token_manager(store, "http://127.0.0.1:1/token")),
            1000,
        );

        let response = app.oneshot(get("/health")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["token"], "expired");
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_prometheus_format() {
        let app = build_router(test_app_state("http://unused"), 1000);

        let response = app.oneshot(get("/metrics")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers()[CONTENT_TYPE].to_str().unwrap();
        assert!(content_type.contains("text/plain"));
    }

    #[tokio::test]
    async fn auth_redirects_to_vendor_with_state() {
        let state = test_app_state("http://unused");
        let app = build_router(state, 1000);

        let response = app.oneshot(get("/proxy/auth")).await.unwrap();

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        let location = response.headers()["location"].to_str().unwrap();
        assert!(location.starts_with(AUTHORIZE_URL), "got: {location}");
        assert!(location.contains("client_id=client-id"));
        assert!(location.contains("response_type=code"));
        assert!(location.contains("state="));
    }

    #[tokio::test]
    async fn callback_with_unknown_state_is_rejected() {
        let app = build_router(test_app_state("http://unused"), 1000);

        let response = app
            .oneshot(get("/proxy/auth/redirect?code=abc&state=forged"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_text(response).await.contains("unknown or expired state"));
    }

    #[tokio::test]
    async fn callback_with_vendor_error_is_reported() {
        let app = build_router(test_app_state("http://unused"), 1000);

        let response = app
            .oneshot(get(
                "/proxy/auth/redirect?error=access_denied&error_description=user+cancelled",
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_text(response).await.contains("access_denied"));
    }

    #[tokio::test]
    async fn full_authorization_flow_stores_token() {
        let (token_url, calls) = start_token_server(serde_json::json!({
            "access_token": "at_first",
            "refresh_token": "rt_first",
            "expires_in": 3600,
            "token_type": "Bearer",
        }))
        .await;
        let store = Arc::new(MemoryCredentialStore::new());
        let app = build_router(
            app_state_with("http://unused", token_manager(store.clone(), &token_url)),
            1000,
        );

        let start = app.clone().oneshot(get("/proxy/auth")).await.unwrap();
        let location = start.headers()["location"].to_str().unwrap().to_string();
        let oauth_state = reqwest::Url::parse(&location)
            .unwrap()
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.into_owned())
            .unwrap();

        let callback = app
            .clone()
            .oneshot(get(&format!(
                "/proxy/auth/redirect?code=abc&state={oauth_state}"
            )))
            .await
            .unwrap();

        assert_eq!(callback.status(), StatusCode::SEE_OTHER);
        assert_eq!(callback.headers()["location"], "/proxy/success");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stored = store.current().unwrap();
        assert_eq!(stored.access_token, "at_first");
        let expected = epoch_seconds() + 3600 - 5;
        assert!((stored.expires_at - expected).abs() <= 1);

        // The state is single-use
        let replay = app
            .oneshot(get(&format!(
                "/proxy/auth/redirect?code=abc&state={oauth_state}"
            )))
            .await
            .unwrap();
        assert_eq!(replay.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn failed_code_exchange_returns_502() {
        let token_server = serve(Router::new().route(
            "/token",
            axum::routing::post(|| async {
                (StatusCode::BAD_REQUEST, r#"{"error":"invalid_grant"}"#)
            }),
        ))
        .await;
        let store = Arc::new(MemoryCredentialStore::new());
        let state = app_state_with(
            "http://unused",
            token_manager(store.clone(), &format!("{token_server}/token")),
        );
        let oauth_state = state.auth.pending.issue().await;
        let app = build_router(state, 1000);

        let response = app
            .oneshot(get(&format!(
                "/proxy/auth/redirect?code=bad&state={oauth_state}"
            )))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(body_text(response).await.contains("invalid_grant"));
        assert!(store.current().is_none());
    }

    #[tokio::test]
    async fn success_page() {
        let app = build_router(test_app_state("http://unused"), 1000);
        let response = app.oneshot(get("/proxy/success")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "authorization completed");
    }
}
