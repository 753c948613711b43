//! Shared test fixtures: an in-memory journal store and a mock
//! function runtime speaking the Datum wire protocol.
//!
//! The mock runtime reads the closure part of each invocation as a
//! directive string, so every test controls runtime behavior through
//! the closures it submits:
//!
//! - `echo:<text>`       reply success with a text blob
//! - `arg`               reply success echoing the first argument's bytes
//! - `error:<msg>`       reply failure with an error datum
//! - `ref:<stage_id>`    reply success with a stage reference
//! - `boom`              reply HTTP 500 (retriable)
//! - `flaky:<n>:<text>`  reply HTTP 500 for the first n calls, then echo
//! - `slow:<ms>:<text>`  sleep before echoing
//! - `garbage`           reply 200 without any protocol headers

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::routing::any;

use fnflow_core::FlowRuntime;
use fnflow_core::executor::ExecutorConfig;
use fnflow_core::model::Closure;
use fnflow_core::persistence::{PersistenceProvider, SqlitePersistence};
use fnflow_protocol::{Datum, ErrorKind, decode_multipart, encode_datum};
use sqlx::sqlite::SqlitePoolOptions;

/// Shared state of the mock runtime.
#[derive(Default)]
pub struct MockState {
    /// Closure directives seen, in arrival order.
    pub log: Mutex<Vec<String>>,
    /// Per-directive hit counters (for flaky behavior).
    pub hits: Mutex<HashMap<String, u32>>,
}

impl MockState {
    /// How many invocations carried this directive.
    pub fn count(&self, directive: &str) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|d| d.as_str() == directive)
            .count()
    }
}

/// A running mock function runtime.
pub struct MockRuntime {
    pub base_url: String,
    pub state: Arc<MockState>,
}

/// Bind the mock runtime on an ephemeral port.
pub async fn mock_runtime() -> MockRuntime {
    let state = Arc::new(MockState::default());
    let app = Router::new()
        .route("/r/{function_id}", any(handle))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock runtime");
    let addr = listener.local_addr().expect("mock runtime addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("mock runtime serve");
    });

    MockRuntime {
        base_url: format!("http://{addr}/r"),
        state,
    }
}

async fn handle(
    State(state): State<Arc<MockState>>,
    Path(_function_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, HeaderMap, Vec<u8>) {
    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if let Some(boundary) = multipart_boundary(content_type) {
        let parts = decode_multipart(&boundary, &body).expect("invocation envelope");
        let closure_body = parts.first().map(|p| p.body.clone()).unwrap_or_default();
        let directive = String::from_utf8_lossy(&closure_body).into_owned();
        state.log.lock().unwrap().push(directive.clone());

        let hit = {
            let mut hits = state.hits.lock().unwrap();
            let counter = hits.entry(directive.clone()).or_insert(0);
            *counter += 1;
            *counter
        };

        run_directive(&directive, &parts, hit).await
    } else {
        // Plain relay (invokeFunction): echo the request body back.
        let mut reply = Vec::from(&b"invoked:"[..]);
        reply.extend_from_slice(&body);
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        (StatusCode::OK, headers, reply)
    }
}

async fn run_directive(
    directive: &str,
    parts: &[fnflow_protocol::WirePart],
    hit: u32,
) -> (StatusCode, HeaderMap, Vec<u8>) {
    if let Some(text) = directive.strip_prefix("echo:") {
        return success(Datum::text(text));
    }
    if directive == "arg" {
        let arg = parts.get(1).map(|p| p.body.clone()).unwrap_or_default();
        return success(Datum::Blob {
            content_type: "text/plain".to_string(),
            data: arg,
        });
    }
    if let Some(message) = directive.strip_prefix("error:") {
        return failure(Datum::error(ErrorKind::UnknownError, message));
    }
    if let Some(stage_id) = directive.strip_prefix("ref:") {
        return success(Datum::StageRef {
            stage_id: stage_id.to_string(),
        });
    }
    if directive == "boom" {
        return (StatusCode::INTERNAL_SERVER_ERROR, HeaderMap::new(), Vec::new());
    }
    if let Some(rest) = directive.strip_prefix("flaky:") {
        let (n, text) = rest.split_once(':').expect("flaky:<n>:<text>");
        let n: u32 = n.parse().expect("flaky count");
        if hit <= n {
            return (StatusCode::INTERNAL_SERVER_ERROR, HeaderMap::new(), Vec::new());
        }
        return success(Datum::text(text));
    }
    if let Some(rest) = directive.strip_prefix("slow:") {
        let (ms, text) = rest.split_once(':').expect("slow:<ms>:<text>");
        tokio::time::sleep(Duration::from_millis(ms.parse().expect("slow ms"))).await;
        return success(Datum::text(text));
    }
    if directive == "garbage" {
        return (StatusCode::OK, HeaderMap::new(), b"not a datum".to_vec());
    }
    panic!("mock runtime got unknown directive '{directive}'");
}

fn success(datum: Datum) -> (StatusCode, HeaderMap, Vec<u8>) {
    respond("success", datum)
}

fn failure(datum: Datum) -> (StatusCode, HeaderMap, Vec<u8>) {
    respond("failure", datum)
}

fn respond(status: &str, datum: Datum) -> (StatusCode, HeaderMap, Vec<u8>) {
    let part = encode_datum(&datum);
    let mut headers = HeaderMap::new();
    headers.insert(
        HeaderName::from_static("fnproject-resultstatus"),
        HeaderValue::from_str(status).unwrap(),
    );
    for (name, value) in &part.headers {
        headers.insert(
            HeaderName::from_bytes(name.as_bytes()).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
    }
    (StatusCode::OK, headers, part.body)
}

fn multipart_boundary(content_type: &str) -> Option<String> {
    let rest = content_type.split("boundary=").nth(1)?;
    Some(rest.trim_matches('"').to_string())
}

/// A journal store on an in-memory SQLite database. Lives as long as
/// the pool, so it survives engine restarts within one test.
pub async fn memory_provider(snapshot_interval: u64) -> Arc<SqlitePersistence> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory pool");
    fnflow_core::migrations::run_sqlite(&pool)
        .await
        .expect("migrations");
    Arc::new(SqlitePersistence::new(pool, snapshot_interval))
}

/// Executor settings tuned for tests: small retry budget, short backoff.
pub fn test_executor(base_url: &str, max_attempts: u32) -> ExecutorConfig {
    ExecutorConfig {
        base_url: base_url.to_string(),
        max_attempts,
        base_backoff: Duration::from_millis(10),
    }
}

/// Start an engine over the given provider and runtime URL.
pub async fn start_engine(
    provider: Arc<dyn PersistenceProvider>,
    base_url: &str,
) -> FlowRuntime {
    start_engine_with(provider, test_executor(base_url, 3), Duration::from_secs(60)).await
}

/// Start an engine with explicit executor settings and idle window.
pub async fn start_engine_with(
    provider: Arc<dyn PersistenceProvider>,
    executor: ExecutorConfig,
    idle_window: Duration,
) -> FlowRuntime {
    FlowRuntime::builder()
        .persistence(provider)
        .executor(executor)
        .idle_window(idle_window)
        .build()
        .expect("runtime config")
        .start()
        .await
        .expect("runtime start")
}

/// A directive closure for the mock runtime.
pub fn closure(directive: &str) -> Closure {
    Closure {
        content_type: "text/plain".to_string(),
        data: directive.as_bytes().to_vec(),
    }
}

/// Default request timeout used by the tests.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(5);
