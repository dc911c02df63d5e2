//! Axum server that signs and forwards task requests

use axum::{
    body::{to_bytes, Body, Bytes},
    extract::{Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use futures::{Stream, StreamExt, TryStreamExt};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tcproxy_core::{CredentialStore, ProxyConfig, Result, TaskLog, TcProxyError, ROTATION_NOTICE};
use tcproxy_queue::authorization_header;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::context::{request_headers, response_headers, ProxyRequestContext};

/// Largest request body the proxy buffers for signing and forwarding
const MAX_REQUEST_BODY: usize = 64 * 1024 * 1024;

/// Seconds a task should wait before retrying a 503
const RETRY_AFTER_SECS: &str = "1";

/// Path answered by the proxy itself
pub const HEALTH_PATH: &str = "/__tcproxy/health";

/// How long a cut-off proxy gets to close its connections before the server
/// task is aborted
const CUT_OFF_WAIT: Duration = Duration::from_millis(250);

/// State shared by all connections
struct ProxyState {
    config: ProxyConfig,
    root_url: String,
    store: CredentialStore,
    task_log: TaskLog,
    http: reqwest::Client,
    /// Highest credential generation any request has used
    observed_generation: AtomicU64,
    requests: AtomicU64,
    /// Flips to true when the shutdown grace period runs out
    cut_off: watch::Receiver<bool>,
}

type SharedState = Arc<ProxyState>;

impl ProxyState {
    /// Record that a request used `generation`; true if that is a rotation
    /// nobody has reported yet
    fn observe(&self, generation: u64) -> bool {
        let previous = self.observed_generation.fetch_max(generation, Ordering::SeqCst);
        generation > previous && generation > 1
    }
}

/// Credential-injecting proxy for one task
pub struct ProxyServer;

impl ProxyServer {
    /// Bind the listener and start serving in a background task.
    ///
    /// `root_url` is the deployment root; requests go to `<root_url>/api/...`.
    pub async fn start(
        config: ProxyConfig,
        root_url: impl Into<String>,
        store: CredentialStore,
        task_log: TaskLog,
    ) -> Result<ProxyHandle> {
        let bind_addr = config.socket_addr()?;
        let grace = config.shutdown_grace();

        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| TcProxyError::Proxy(format!("Failed to build HTTP client: {}", e)))?;

        let (cut_off_tx, cut_off_rx) = watch::channel(false);
        let state = Arc::new(ProxyState {
            config,
            root_url: root_url.into().trim_end_matches('/').to_string(),
            store,
            task_log,
            http,
            observed_generation: AtomicU64::new(0),
            requests: AtomicU64::new(0),
            cut_off: cut_off_rx,
        });

        let app = Router::new()
            .route(HEALTH_PATH, get(handle_health))
            .fallback(handle_forward)
            .with_state(state);

        let listener = TcpListener::bind(bind_addr).await?;
        let addr = listener.local_addr()?;
        info!("Proxy listening on http://{}", addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let join = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.await;
            };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!("Proxy server error: {}", e);
            }
        });

        Ok(ProxyHandle {
            addr,
            grace,
            shutdown_tx: Some(shutdown_tx),
            cut_off_tx,
            join,
        })
    }
}

/// Running proxy
pub struct ProxyHandle {
    addr: SocketAddr,
    grace: Duration,
    shutdown_tx: Option<oneshot::Sender<()>>,
    cut_off_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ProxyHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Base URL handed to the task process
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Stop accepting connections and let in-flight requests drain for the
    /// configured grace period
    pub async fn shutdown(self) {
        let grace = self.grace;
        self.shutdown_with_grace(grace).await
    }

    /// Like [`shutdown`](Self::shutdown) with an explicit grace period.
    ///
    /// Requests still running when the grace period ends are cut off: their
    /// response bodies end with an error, which drops the connection.
    pub async fn shutdown_with_grace(mut self, grace: Duration) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if tokio::time::timeout(grace, &mut self.join).await.is_err() {
            warn!(
                "Proxy on {} did not drain within {:?}, cutting off in-flight requests",
                self.addr, grace
            );
            self.cut_off_tx.send_replace(true);
            if tokio::time::timeout(CUT_OFF_WAIT, &mut self.join).await.is_err() {
                self.join.abort();
            }
        }
        info!("Proxy on {} stopped", self.addr);
    }
}

/// GET /__tcproxy/health
async fn handle_health(State(state): State<SharedState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "tcproxy",
        "credentialGeneration": state.store.generation(),
        "requests": state.requests.load(Ordering::Relaxed),
    }))
}

/// Everything else: sign and forward to the API
async fn handle_forward(State(state): State<SharedState>, request: Request) -> Response {
    state.requests.fetch_add(1, Ordering::Relaxed);

    let (parts, body) = request.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();

    let wait = state.config.credentials_wait();
    let Some(snapshot) = state.store.wait_ready(wait).await else {
        let err = TcProxyError::CredentialsUnavailable(format!(
            "none installed after {:?} for {} {}",
            wait, parts.method, path_and_query
        ));
        warn!("{}", err);
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::RETRY_AFTER, RETRY_AFTER_SECS)],
            format!("tcproxy: {}", err),
        )
            .into_response();
    };

    let context = match ProxyRequestContext::new(&path_and_query, &state.root_url, snapshot) {
        Ok(context) => context,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };

    if state.observe(context.generation()) {
        state.task_log.line(ROTATION_NOTICE).await;
    }

    let authorization = match authorization_header(
        state.config.auth_scheme,
        &context.snapshot.credentials,
        parts.method.as_str(),
        &context.target,
    ) {
        Ok(authorization) => authorization,
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    };

    let body = match to_bytes(body, MAX_REQUEST_BODY).await {
        Ok(body) => body,
        Err(e) => {
            return error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                TcProxyError::Proxy(format!("Failed to read request body: {}", e)),
            )
        }
    };

    let send = state
        .http
        .request(parts.method.clone(), context.target.clone())
        .headers(request_headers(&parts.headers))
        .header(header::AUTHORIZATION, authorization)
        .body(body)
        .send();

    let mut cut_off = state.cut_off.clone();
    let sent = tokio::select! {
        biased;
        _ = cut_off_requested(&mut cut_off) => {
            return error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                TcProxyError::Proxy(format!("Proxy shut down before {} answered", context.target)),
            )
        }
        sent = tokio::time::timeout(state.config.request_timeout(), send) => sent,
    };

    let upstream = match sent {
        Ok(Ok(upstream)) => upstream,
        Ok(Err(e)) if e.is_timeout() => return gateway_timeout(&context),
        Ok(Err(e)) => {
            return error_response(
                StatusCode::BAD_GATEWAY,
                TcProxyError::Proxy(format!("Upstream {} failed: {}", context.target, e)),
            )
        }
        Err(_) => return gateway_timeout(&context),
    };

    debug!(
        "{} {} -> {} (credential generation {})",
        parts.method,
        context.target,
        upstream.status(),
        context.generation()
    );

    let mut response = Response::builder().status(upstream.status());
    if let Some(headers) = response.headers_mut() {
        *headers = response_headers(upstream.headers());
    }

    let target = context.target.clone();
    let stream = upstream
        .bytes_stream()
        .inspect_err(move |e| warn!("Upstream body from {} broke off: {}", target, e))
        .map_err(io::Error::other);

    match response.body(Body::from_stream(until_cut_off(stream, cut_off))) {
        Ok(response) => response,
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            TcProxyError::Proxy(format!("Failed to build response: {}", e)),
        ),
    }
}

/// Resolves once the grace period has run out. A dropped handle never cuts
/// anything off.
async fn cut_off_requested(cut_off: &mut watch::Receiver<bool>) {
    let closed = cut_off.wait_for(|cut| *cut).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

/// Pass `body` through until the proxy is cut off, then fail it
fn until_cut_off<S>(
    body: S,
    cut_off: watch::Receiver<bool>,
) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static
where
    S: Stream<Item = io::Result<Bytes>> + Send + 'static,
{
    let body = Box::pin(body);
    futures::stream::unfold(Some((body, cut_off)), |state| async move {
        let (mut body, mut cut_off) = state?;
        tokio::select! {
            biased;
            _ = cut_off_requested(&mut cut_off) => Some((
                Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "proxy shut down while streaming",
                )),
                None,
            )),
            chunk = body.next() => chunk.map(|chunk| (chunk, Some((body, cut_off)))),
        }
    })
}

fn gateway_timeout(context: &ProxyRequestContext) -> Response {
    error_response(
        StatusCode::GATEWAY_TIMEOUT,
        TcProxyError::Proxy(format!("Upstream {} timed out", context.target)),
    )
}

fn error_response(status: StatusCode, err: TcProxyError) -> Response {
    warn!("Proxy request failed ({}): {}", status, err);
    (status, format!("tcproxy: {}", err)).into_response()
}
