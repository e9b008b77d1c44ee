use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{middleware, Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

use crate::models::UsageSnapshot;
use crate::store::EphemeralFileStore;

pub const RELAY_PORT: u16 = 19876;

/// Receives every snapshot the relay accepts or rehydrates.
pub trait RelaySubscriber: Send + Sync {
    fn notify(&self, snapshot: &UsageSnapshot);
}

impl<F> RelaySubscriber for F
where
    F: Fn(&UsageSnapshot) + Send + Sync,
{
    fn notify(&self, snapshot: &UsageSnapshot) {
        self(snapshot)
    }
}

#[derive(Clone)]
pub struct RelayState {
    store: Arc<EphemeralFileStore>,
    subscriber: Arc<dyn RelaySubscriber>,
}

pub fn router(state: RelayState) -> Router {
    Router::new()
        .route(
            "/usage",
            post(accept_usage).options(preflight).fallback(not_found),
        )
        .fallback(fallback)
        .layer(middleware::map_response(with_cors_headers))
        .with_state(state)
}

async fn with_cors_headers(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
    response
}

async fn preflight() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

async fn fallback(method: Method) -> StatusCode {
    if method == Method::OPTIONS {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

/// Any well-formed JSON is persisted as received; only the subscriber sees a
/// decoded snapshot.
async fn accept_usage(State(state): State<RelayState>, uri: Uri, body: Bytes) -> Response {
    // Only the bare path is a push; `/usage?...` is treated as unknown.
    if uri.query().is_some() {
        return StatusCode::NOT_FOUND.into_response();
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!("Rejected push: {e}");
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": "Invalid JSON" })))
                .into_response();
        }
    };

    if let Err(e) = state.store.write(&payload) {
        tracing::error!("{e}");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "Failed to store usage data" })),
        )
            .into_response();
    }

    match serde_json::from_value::<UsageSnapshot>(payload) {
        Ok(snapshot) => state.subscriber.notify(&snapshot),
        Err(e) => tracing::warn!("Stored payload is not a usage snapshot: {e}"),
    }

    (StatusCode::OK, Json(json!({ "success": true }))).into_response()
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM.
///
/// The SIGTERM handler is installed before this returns, so a signal arriving
/// before the future is first polled is not lost. Must be called from within
/// a tokio runtime.
pub fn shutdown_signal() -> io::Result<impl Future<Output = ()> + Send + 'static> {
    #[cfg(unix)]
    let mut terminate = signal(SignalKind::terminate())?;

    Ok(async move {
        let interrupted = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminated = async {
            terminate.recv().await;
        };
        #[cfg(not(unix))]
        let terminated = std::future::pending::<()>();

        tokio::select! {
            _ = interrupted => tracing::info!("Received Ctrl-C"),
            _ = terminated => tracing::info!("Received SIGTERM"),
        }
        tracing::info!("Shutting down relay");
    })
}

/// Loopback endpoint that accepts usage pushes from the poller.
pub struct LocalRelayServer {
    addr: SocketAddr,
    state: RelayState,
}

impl LocalRelayServer {
    pub fn new(
        port: u16,
        store: Arc<EphemeralFileStore>,
        subscriber: Arc<dyn RelaySubscriber>,
    ) -> Self {
        Self {
            addr: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
            state: RelayState { store, subscriber },
        }
    }

    pub fn router(&self) -> Router {
        router(self.state.clone())
    }

    /// Rehydrate, serve until `shutdown` resolves, then delete the data file.
    ///
    /// Failing to bind is logged and not returned: another instance already
    /// serving this machine is a normal condition for the host process.
    pub async fn run<F>(self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let store = Arc::clone(&self.state.store);
        store.try_rehydrate(self.state.subscriber.as_ref());

        let result = match TcpListener::bind(self.addr).await {
            Ok(listener) => self.serve(listener, shutdown).await,
            Err(e) => {
                if e.kind() == io::ErrorKind::AddrInUse {
                    tracing::info!("Port {} is already in use", self.addr.port());
                } else {
                    tracing::error!("Relay server error: {e}");
                }
                shutdown.await;
                Ok(())
            }
        };

        store.stop();
        result
    }

    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tracing::info!(
            "Claude usage relay listening on {}",
            listener.local_addr()?
        );
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UsageWindow;
    use crate::poller::UsageSink;
    use crate::relay_client::RelayClient;
    use crate::store::DATA_FILE_NAME;
    use axum::body::{self, Body};
    use axum::http::Request;
    use chrono::Utc;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt; // for `oneshot`

    #[derive(Default)]
    struct Recorder(Mutex<Vec<UsageSnapshot>>);

    impl RelaySubscriber for Recorder {
        fn notify(&self, snapshot: &UsageSnapshot) {
            self.0.lock().unwrap().push(snapshot.clone());
        }
    }

    struct Fixture {
        _dir: TempDir,
        store: Arc<EphemeralFileStore>,
        recorder: Arc<Recorder>,
        server: LocalRelayServer,
    }

    fn fixture(port: u16) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(EphemeralFileStore::new(dir.path().join(DATA_FILE_NAME)));
        let recorder = Arc::new(Recorder::default());
        let server = LocalRelayServer::new(port, store.clone(), recorder.clone());
        Fixture {
            _dir: dir,
            store,
            recorder,
            server,
        }
    }

    fn push(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/usage")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(resp: Response) -> Value {
        let bytes = body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn snapshot() -> UsageSnapshot {
        UsageSnapshot::new(
            UsageWindow {
                utilization: 45.0,
                resets_at: "2025-01-01T10:00:00Z".into(),
            },
            None,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn accepts_snapshot_writes_file_and_notifies() {
        let fx = fixture(0);
        let sent = snapshot();

        let resp = fx
            .server
            .router()
            .oneshot(push(&serde_json::to_string(&sent).unwrap()))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            HeaderValue::from_static("*")
        );
        assert_eq!(body_json(resp).await, json!({ "success": true }));

        let stored: UsageSnapshot =
            serde_json::from_str(&std::fs::read_to_string(fx.store.path()).unwrap()).unwrap();
        assert_eq!(stored, sent);
        assert_eq!(*fx.recorder.0.lock().unwrap(), vec![sent]);
    }

    #[tokio::test]
    async fn invalid_json_is_rejected_without_writing() {
        let fx = fixture(0);

        let resp = fx.server.router().oneshot(push("{oops")).await.unwrap();

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await, json!({ "error": "Invalid JSON" }));
        assert!(!fx.store.path().exists());
        assert!(fx.recorder.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn valid_json_of_any_shape_is_persisted() {
        let fx = fixture(0);

        let resp = fx.server.router().oneshot(push("{}")).await.unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(std::fs::read_to_string(fx.store.path()).unwrap(), "{}");
        assert_eq!(
            *fx.recorder.0.lock().unwrap(),
            vec![UsageSnapshot::default()]
        );
    }

    #[tokio::test]
    async fn preflight_returns_no_content() {
        let fx = fixture(0);

        for uri in ["/usage", "/anything"] {
            let req = Request::builder()
                .method("OPTIONS")
                .uri(uri)
                .body(Body::empty())
                .unwrap();
            let resp = fx.server.router().oneshot(req).await.unwrap();
            assert_eq!(resp.status(), StatusCode::NO_CONTENT);
            assert_eq!(
                resp.headers()[header::ACCESS_CONTROL_ALLOW_METHODS],
                HeaderValue::from_static("POST, OPTIONS")
            );
        }
    }

    #[tokio::test]
    async fn push_with_query_string_is_not_found() {
        let fx = fixture(0);

        let req = Request::builder()
            .method("POST")
            .uri("/usage?x=1")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_string(&snapshot()).unwrap()))
            .unwrap();
        let resp = fx.server.router().oneshot(req).await.unwrap();

        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(!fx.store.path().exists());
        assert!(fx.recorder.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn other_requests_are_not_found() {
        let fx = fixture(0);

        let cases = [("GET", "/usage"), ("POST", "/other"), ("GET", "/")];
        for (method, uri) in cases {
            let req = Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap();
            let resp = fx.server.router().oneshot(req).await.unwrap();
            assert_eq!(resp.status(), StatusCode::NOT_FOUND, "{method} {uri}");
        }
        assert!(!fx.store.path().exists());
    }

    #[tokio::test]
    async fn occupied_port_is_not_fatal() {
        let taken = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = taken.local_addr().unwrap().port();
        let fx = fixture(port);
        std::fs::write(fx.store.path(), "{}").unwrap();

        fx.server.run(async {}).await.unwrap();

        // Rehydration discarded the timestamp-less file; stop leaves nothing behind.
        assert!(!fx.store.path().exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn relay_client_pushes_over_loopback() {
        let fx = fixture(0);
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let server = fx.server;
        let serving = tokio::spawn(async move {
            server
                .serve(listener, async move {
                    let _ = stop_rx.await;
                })
                .await
        });

        let sent = snapshot();
        let to_send = sent.clone();
        tokio::task::spawn_blocking(move || RelayClient::new(port).push(&to_send))
            .await
            .unwrap()
            .unwrap();

        let _ = stop_tx.send(());
        serving.await.unwrap().unwrap();

        assert_eq!(*fx.recorder.0.lock().unwrap(), vec![sent]);
        assert!(fx.store.path().exists());
        fx.store.stop();
    }

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn run_deletes_served_file_on_shutdown() {
        let port = free_port();
        let fx = fixture(port);
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let server = fx.server;
        let running = tokio::spawn(server.run(async move {
            let _ = stop_rx.await;
        }));

        let sent = snapshot();
        let pushed = tokio::task::spawn_blocking(move || {
            let client = RelayClient::new(port);
            // The listener may not be bound yet.
            for _ in 0..100 {
                if client.push(&sent).is_ok() {
                    return true;
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            false
        })
        .await
        .unwrap();
        assert!(pushed);
        assert!(fx.store.path().exists());

        let _ = stop_tx.send(());
        running.await.unwrap().unwrap();

        assert!(!fx.store.path().exists());
        assert_eq!(fx.recorder.0.lock().unwrap().len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_signal_triggers_shutdown() {
        let shutdown = shutdown_signal().unwrap();

        let status = std::process::Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        tokio::time::timeout(Duration::from_secs(5), shutdown)
            .await
            .unwrap();
    }

    #[test]
    fn relay_client_reports_unreachable() {
        let port = {
            let probe = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
            probe.local_addr().unwrap().port()
        };
        assert!(RelayClient::new(port).push(&snapshot()).is_err());
    }
}
