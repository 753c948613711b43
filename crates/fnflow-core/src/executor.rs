// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The HTTP dispatcher.
//!
//! The executor is a stateless actor: it accepts dispatch requests from
//! graph actors, performs the HTTP invocation against the function
//! runtime at `<base>/<function_id>`, and reports the typed outcome
//! back to the originating actor's mailbox. It never touches graph
//! state. Dispatches run in parallel; retries are per dispatch, with
//! exponential backoff for transient failures.

use std::time::Duration;

use fnflow_protocol::{
    CompletionResult, Datum, ErrorKind, HttpMethod, WirePart, decode_invocation_response,
    encode_datum, encode_invocation,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::actor::GraphMsg;
use crate::config::Config;
use crate::error::CoreError;
use crate::model::{Closure, FunctionId, GraphId, StageId};

/// Executor tuning.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Base URL of the function runtime, without the function id.
    pub base_url: String,
    /// Dispatch attempts per invocation (first try + retries).
    pub max_attempts: u32,
    /// Base delay of the exponential backoff between attempts.
    pub base_backoff: Duration,
}

impl ExecutorConfig {
    /// Derive executor settings from the service configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            base_url: config.runtime_base_url(),
            max_attempts: config.max_dispatch_attempts.max(1),
            base_backoff: config.dispatch_backoff,
        }
    }
}

/// What to execute for a stage.
#[derive(Debug, Clone)]
pub enum DispatchKind {
    /// Post the stage's closure and argument datums to its function.
    Closure { closure: Closure, args: Vec<Datum> },
    /// Relay a serialized HTTP request datum to another function.
    HttpInvoke { request: Closure },
}

/// One dispatch order from a graph actor.
pub struct DispatchRequest {
    pub graph_id: GraphId,
    pub stage_id: StageId,
    pub function_id: FunctionId,
    pub kind: DispatchKind,
    /// Mailbox of the originating graph actor.
    pub reply_to: mpsc::Sender<GraphMsg>,
}

/// Cheap handle for submitting dispatches.
#[derive(Clone)]
pub struct ExecutorHandle {
    tx: mpsc::Sender<DispatchRequest>,
}

impl ExecutorHandle {
    /// Queue a dispatch. Fails only when the executor has shut down.
    pub async fn dispatch(&self, request: DispatchRequest) -> Result<(), CoreError> {
        self.tx
            .send(request)
            .await
            .map_err(|_| CoreError::EngineStopped)
    }
}

/// Spawn the executor task and return its handle.
pub fn spawn_executor(config: ExecutorConfig) -> ExecutorHandle {
    let (tx, rx) = mpsc::channel(128);
    tokio::spawn(run(config, rx));
    ExecutorHandle { tx }
}

async fn run(config: ExecutorConfig, mut rx: mpsc::Receiver<DispatchRequest>) {
    let client = reqwest::Client::new();

    while let Some(request) = rx.recv().await {
        let client = client.clone();
        let config = config.clone();
        // Each dispatch runs on its own task; the executor's mailbox
        // never waits on the runtime.
        tokio::spawn(async move {
            debug!(
                graph_id = %request.graph_id,
                stage_id = %request.stage_id,
                function_id = %request.function_id,
                "dispatching stage"
            );
            let result = execute(&client, &config, &request).await;
            let outcome = GraphMsg::StageResult {
                stage_id: request.stage_id.clone(),
                result,
            };
            if request.reply_to.send(outcome).await.is_err() {
                // The actor passivated mid-flight; recovery will
                // re-dispatch the stage.
                debug!(
                    graph_id = %request.graph_id,
                    stage_id = %request.stage_id,
                    "dropping stage result for stopped actor"
                );
            }
        });
    }
}

async fn execute(
    client: &reqwest::Client,
    config: &ExecutorConfig,
    request: &DispatchRequest,
) -> CompletionResult {
    match &request.kind {
        DispatchKind::Closure { closure, args } => {
            execute_closure(client, config, request, closure, args).await
        }
        DispatchKind::HttpInvoke { request: encoded } => {
            execute_invoke(client, config, request, encoded).await
        }
    }
}

/// A failed attempt that may be worth retrying.
enum AttemptError {
    /// The HTTP transport failed outright.
    Transport(String),
    /// The runtime answered with a server error.
    ServerError(u16),
}

async fn execute_closure(
    client: &reqwest::Client,
    config: &ExecutorConfig,
    request: &DispatchRequest,
    closure: &Closure,
    args: &[Datum],
) -> CompletionResult {
    let boundary = format!("fnflow-{}", Uuid::new_v4().simple());
    let closure_part = encode_datum(&Datum::Blob {
        content_type: closure.content_type.clone(),
        data: closure.data.clone(),
    });
    let arg_parts: Vec<WirePart> = args.iter().map(encode_datum).collect();
    let body = encode_invocation(&boundary, Some(&closure_part), &arg_parts);
    let url = format!("{}/{}", config.base_url, request.function_id);

    retry(config, request, || {
        let body = body.clone();
        let url = url.clone();
        let boundary = boundary.clone();
        async move {
            let response = client
                .post(url.as_str())
                .header(fnflow_protocol::HEADER_DATUM_TYPE, fnflow_protocol::DATUM_TYPE_HTTP_REQ)
                .header(fnflow_protocol::HEADER_THREAD_ID, request.graph_id.as_str())
                .header(fnflow_protocol::HEADER_STAGE_REF, request.stage_id.as_str())
                .header(fnflow_protocol::HEADER_METHOD, "POST")
                .header(
                    fnflow_protocol::HEADER_CONTENT_TYPE,
                    format!("multipart/form-data; boundary=\"{boundary}\""),
                )
                .body(body)
                .send()
                .await
                .map_err(|e| AttemptError::Transport(e.to_string()))?;

            let status = response.status();
            if status.is_server_error() {
                return Err(AttemptError::ServerError(status.as_u16()));
            }

            let headers = collect_headers(response.headers());
            let body = match response.bytes().await {
                Ok(bytes) => bytes,
                Err(e) => return Err(AttemptError::Transport(e.to_string())),
            };

            if !status.is_success() {
                // Client errors are not retriable; the request itself
                // is bad.
                return Ok(CompletionResult::from_error(
                    ErrorKind::InvalidStageResponse,
                    format!("runtime rejected the invocation with status {}", status.as_u16()),
                ));
            }

            let view = fnflow_protocol::HeaderView::new(&headers);
            Ok(decode_invocation_response(&view, &body).unwrap_or_else(|e| {
                CompletionResult::from_error(
                    ErrorKind::InvalidStageResponse,
                    format!("undecodable runtime reply: {e}"),
                )
            }))
        }
    })
    .await
}

async fn execute_invoke(
    client: &reqwest::Client,
    config: &ExecutorConfig,
    request: &DispatchRequest,
    encoded: &Closure,
) -> CompletionResult {
    let datum: Datum = match serde_json::from_slice(&encoded.data) {
        Ok(datum) => datum,
        Err(e) => {
            return CompletionResult::from_error(
                ErrorKind::InvalidStageResponse,
                format!("invokeFunction stage carries an undecodable request: {e}"),
            );
        }
    };
    let Datum::HttpReq {
        method,
        headers,
        content_type,
        body,
    } = datum
    else {
        return CompletionResult::from_error(
            ErrorKind::InvalidStageResponse,
            "invokeFunction stage does not carry an HTTP request datum",
        );
    };

    let url = format!("{}/{}", config.base_url, request.function_id);

    retry(config, request, || {
        let url = url.clone();
        let headers = headers.clone();
        let content_type = content_type.clone();
        let body = body.clone();
        let method = to_reqwest_method(method);
        async move {
            let mut builder = client.request(method, url.as_str());
            for header in &headers {
                builder = builder.header(header.key.as_str(), header.value.as_str());
            }
            if let Some(ct) = &content_type {
                builder = builder.header(fnflow_protocol::HEADER_CONTENT_TYPE, ct.as_str());
            }
            let response = builder
                .body(body)
                .send()
                .await
                .map_err(|e| AttemptError::Transport(e.to_string()))?;

            // Whatever the function answers, including its own 4xx/5xx,
            // is the stage's outcome.
            let status = response.status().as_u16();
            let successful = response.status().is_success();
            let resp_headers = collect_headers(response.headers());
            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = match response.bytes().await {
                Ok(bytes) => bytes,
                Err(e) => return Err(AttemptError::Transport(e.to_string())),
            };

            let datum = Datum::HttpResp {
                status_code: status,
                headers: resp_headers
                    .into_iter()
                    .map(|(k, v)| fnflow_protocol::HttpHeader::new(k, v))
                    .collect(),
                content_type,
                body: body.to_vec(),
            };
            Ok(CompletionResult {
                successful,
                datum,
            })
        }
    })
    .await
}

/// Run an attempt up to the configured budget, backing off between
/// transient failures. The stage completes with the last attempt's
/// outcome.
async fn retry<F, Fut>(
    config: &ExecutorConfig,
    request: &DispatchRequest,
    mut attempt_fn: F,
) -> CompletionResult
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<CompletionResult, AttemptError>>,
{
    let mut attempt = 1u32;
    loop {
        match attempt_fn().await {
            Ok(result) => return result,
            Err(error) if attempt >= config.max_attempts => {
                return match error {
                    AttemptError::Transport(details) => CompletionResult::from_error(
                        ErrorKind::FunctionInvokeFailed,
                        format!("transport failure after {attempt} attempts: {details}"),
                    ),
                    AttemptError::ServerError(code) => CompletionResult::from_error(
                        ErrorKind::StageInvokeFailed,
                        format!("runtime returned status {code} after {attempt} attempts"),
                    ),
                };
            }
            Err(error) => {
                let delay = config.base_backoff * 2u32.saturating_pow(attempt - 1);
                match &error {
                    AttemptError::Transport(details) => warn!(
                        graph_id = %request.graph_id,
                        stage_id = %request.stage_id,
                        attempt,
                        error = %details,
                        "retrying dispatch after transport failure"
                    ),
                    AttemptError::ServerError(code) => warn!(
                        graph_id = %request.graph_id,
                        stage_id = %request.stage_id,
                        attempt,
                        status = code,
                        "retrying dispatch after runtime server error"
                    ),
                }
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

fn collect_headers(headers: &reqwest::header::HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

fn to_reqwest_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Head => reqwest::Method::HEAD,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Delete => reqwest::Method::DELETE,
        HttpMethod::Options => reqwest::Method::OPTIONS,
        HttpMethod::Patch => reqwest::Method::PATCH,
    }
}
