//! tablelocal server
//!
//! Hosts the table service on a local socket. A [`TableServer`] is an
//! explicit instance: bind it, read its address and connection string,
//! then either run it in the foreground or spawn it and stop it later.
//! Several servers can live in one process.

pub mod middleware;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware::{from_fn, from_fn_with_state},
    routing::{any, get},
};
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tablelocal_api::{AppState, Authenticator, dispatch, health_check, metrics_handler};
use tablelocal_common::Config;
use tablelocal_common::config::{AccountConfig, ServerConfig};
use tablelocal_store::Catalog;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Server lifecycle errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Table(#[from] tablelocal_common::Error),

    #[error("server task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Build the HTTP router over shared state
pub fn build_router(state: Arc<AppState>, config: &ServerConfig) -> Router {
    with_service_layers(
        Router::new()
            .route("/health", get(health_check))
            .route("/metrics", get(metrics_handler))
            .route("/", any(dispatch))
            .route("/{*path}", any(dispatch)),
        state,
        config,
    )
}

/// Wrap routes in the middleware stack, outermost last
fn with_service_layers(
    routes: Router<Arc<AppState>>,
    state: Arc<AppState>,
    config: &ServerConfig,
) -> Router {
    let timeout = Duration::from_millis(config.request_timeout_ms);
    routes
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(from_fn_with_state(timeout, middleware::timeout_layer))
        .layer(from_fn_with_state(Arc::clone(&state), middleware::auth_layer))
        .layer(from_fn_with_state(Arc::clone(&state), middleware::metrics_layer))
        .layer(from_fn(middleware::service_headers))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// A bound, not yet serving, table service
pub struct TableServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    account: AccountConfig,
    state: Arc<AppState>,
    router: Router,
}

impl TableServer {
    /// Open storage and bind the listening socket. Port 0 picks a free port.
    pub async fn bind(config: &Config) -> Result<Self, ServerError> {
        let catalog = Arc::new(Catalog::open(&config.storage)?);
        let authenticator =
            Authenticator::new(config.auth.mode, &config.account.name, &config.account.key)?;
        let state = Arc::new(AppState::new(catalog, authenticator));
        let router = build_router(Arc::clone(&state), &config.server);

        let listener = TcpListener::bind(config.server.listen).await?;
        let local_addr = listener.local_addr()?;
        info!(
            "Table service bound to {} (account {}, auth {:?})",
            local_addr, config.account.name, config.auth.mode
        );

        Ok(Self {
            listener,
            local_addr,
            account: config.account.clone(),
            state,
            router,
        })
    }

    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Connection string a storage client can be pointed at
    #[must_use]
    pub fn connection_string(&self) -> String {
        connection_string(&self.account, self.local_addr)
    }

    #[must_use]
    pub const fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Serve until `signal` resolves, then drain in-flight requests
    pub async fn serve_until<F>(self, signal: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!("Table service listening on {}", self.local_addr);
        axum::serve(self.listener, self.router.into_make_service())
            .with_graceful_shutdown(signal)
            .await?;
        info!("Table service on {} stopped", self.local_addr);
        Ok(())
    }

    /// Serve on a background task
    #[must_use]
    pub fn spawn(self) -> RunningServer {
        let (shutdown, rx) = oneshot::channel::<()>();
        let local_addr = self.local_addr;
        let connection_string = self.connection_string();
        let state = Arc::clone(&self.state);
        // A dropped sender also counts as a stop request.
        let handle = tokio::spawn(self.serve_until(async {
            let _ = rx.await;
        }));
        RunningServer {
            local_addr,
            connection_string,
            state,
            shutdown: Some(shutdown),
            handle,
        }
    }
}

/// Handle to a server running on a background task
pub struct RunningServer {
    local_addr: SocketAddr,
    connection_string: String,
    state: Arc<AppState>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<Result<(), ServerError>>,
}

impl RunningServer {
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[must_use]
    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    #[must_use]
    pub const fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Base URL of the table endpoint, account segment included
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("http://{}/{}", client_addr(self.local_addr), self.state.account)
    }

    /// Stop accepting, finish in-flight requests and close the socket
    pub async fn stop(mut self) -> Result<(), ServerError> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.handle.await?
    }
}

/// Address a local client should dial; wildcard binds map to loopback
fn client_addr(addr: SocketAddr) -> SocketAddr {
    if addr.ip().is_unspecified() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
    } else {
        addr
    }
}

fn connection_string(account: &AccountConfig, addr: SocketAddr) -> String {
    format!(
        "DefaultEndpointsProtocol=http;AccountName={name};AccountKey={key};TableEndpoint=http://{addr}/{name};",
        name = account.name,
        key = account.key,
        addr = client_addr(addr),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::extract::State;
    use axum::http::{Request, StatusCode};
    use axum::routing::post;
    use tablelocal_common::TableName;
    use tablelocal_common::config::{AuthMode, DEFAULT_ACCOUNT_KEY};
    use tower::ServiceExt;

    fn test_router(mode: AuthMode) -> Router {
        let authenticator = Authenticator::new(mode, "devstoreaccount1", DEFAULT_ACCOUNT_KEY).unwrap();
        let state = Arc::new(AppState::new(Arc::new(Catalog::in_memory(1000)), authenticator));
        build_router(state, &ServerConfig::default())
    }

    /// Creates a table, but only after sleeping past any short timeout
    async fn slow_create(State(state): State<Arc<AppState>>) -> StatusCode {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let name = TableName::new("late").unwrap();
        match state.catalog.create_table_if_not_exists(&name) {
            Ok(_) => StatusCode::CREATED,
            Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let authenticator =
            Authenticator::new(AuthMode::Open, "devstoreaccount1", DEFAULT_ACCOUNT_KEY).unwrap();
        let state = Arc::new(AppState::new(Arc::new(Catalog::in_memory(1000)), authenticator));
        let config = ServerConfig {
            request_timeout_ms: 20,
            ..ServerConfig::default()
        };
        let app = with_service_layers(
            Router::new().route("/slow", post(slow_create)),
            Arc::clone(&state),
            &config,
        );

        let request = Request::builder()
            .method("POST")
            .uri("/slow")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(response.headers().contains_key("x-ms-request-id"));
        let bytes = http_body_util::BodyExt::collect(response.into_body())
            .await
            .unwrap()
            .to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["odata.error"]["code"], "OperationTimedOut");

        // the handler was cancelled before it reached the catalog
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(state.catalog.table_count(), 0);
    }

    #[test]
    fn test_connection_string() {
        let account = AccountConfig::default();
        let addr: SocketAddr = "0.0.0.0:10002".parse().unwrap();
        assert_eq!(
            connection_string(&account, addr),
            format!(
                "DefaultEndpointsProtocol=http;AccountName=devstoreaccount1;AccountKey={DEFAULT_ACCOUNT_KEY};TableEndpoint=http://127.0.0.1:10002/devstoreaccount1;"
            )
        );
    }

    #[tokio::test]
    async fn test_service_headers_on_every_response() {
        let app = test_router(AuthMode::Open);
        let request = Request::builder()
            .uri("/devstoreaccount1/Tables('missing')")
            .header("x-ms-client-request-id", "abc-123")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let headers = response.headers();
        assert!(headers.contains_key("x-ms-request-id"));
        assert_eq!(headers["x-ms-version"], middleware::SERVICE_VERSION);
        assert!(headers.contains_key("date"));
        assert_eq!(headers["x-ms-client-request-id"], "abc-123");
    }

    #[tokio::test]
    async fn test_dev_auth_requires_signature() {
        let app = test_router(AuthMode::Dev);
        let unsigned = Request::builder()
            .uri("/devstoreaccount1/Tables")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(unsigned).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let signed = Request::builder()
            .uri("/devstoreaccount1/Tables")
            .header("authorization", "SharedKeyLite devstoreaccount1:c2lnbmF0dXJl")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(signed).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let health = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = app.oneshot(health).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_are_recorded() {
        let app = test_router(AuthMode::Open);
        let request = Request::builder()
            .uri("/devstoreaccount1/Tables")
            .body(Body::empty())
            .unwrap();
        app.clone().oneshot(request).await.unwrap();

        let scrape = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let response = app.oneshot(scrape).await.unwrap();
        let bytes = http_body_util::BodyExt::collect(response.into_body())
            .await
            .unwrap()
            .to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains(
            "tablelocal_requests_total{operation=\"QueryTables\",status=\"success\"} 1"
        ));
    }

    #[tokio::test]
    async fn test_spawn_and_stop() {
        let mut config = Config::default();
        config.server.listen = "127.0.0.1:0".parse().unwrap();
        let server = TableServer::bind(&config).await.unwrap();
        let addr = server.local_addr();
        assert_ne!(addr.port(), 0);
        assert!(server.connection_string().contains(&format!(":{}/", addr.port())));

        let running = server.spawn();
        assert_eq!(
            running.endpoint(),
            format!("http://127.0.0.1:{}/devstoreaccount1", addr.port())
        );
        running.stop().await.unwrap();
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }
}
