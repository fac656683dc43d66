//! # HTTP Surface
//!
//! An `axum` router exposing the bridge as JSON:
//!
//! * `GET /`: the index document listing the exposed methods.
//! * `POST /invoke/{method}`: runs one RPC from a request envelope.
//! * `GET /metadata?method=...`: the schema of a method's request type, or of every known
//!   type for `*`.
//!
//! Every route is mounted under the configured base path.
use axum::{
    Json, Router,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use granc_ui_core::grpc::client::GrpcClient;
use granc_ui_core::grpc::metadata::MetadataEntry;
use granc_ui_core::invoke::{CallContext, InvocationBridge, InvokeError};
use granc_ui_core::prost_reflect::MethodDescriptor;
use granc_ui_core::schema::{Schema, schema_for_method};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[cfg(test)]
mod integration_test;

/// Status used when the caller went away before its request body was read.
const CLIENT_CLOSED_REQUEST: u16 = 499;

/// Everything the handlers share.
pub struct AppState {
    pub target: String,
    /// Exposed methods, keyed by fully qualified name.
    pub methods: BTreeMap<String, MethodDescriptor>,
    pub default_metadata: Vec<MetadataEntry>,
    /// Schema of every known type, served for `method=*`.
    pub all_types: Schema,
    pub bridge: InvocationBridge,
    pub client: GrpcClient,
    /// Extra metadata added to every call.
    pub rpc_metadata: Vec<(String, String)>,
    /// Lowercased names of HTTP request headers copied into call metadata.
    pub preserve_headers: Vec<String>,
    pub max_time: Option<Duration>,
    /// Cancelled on shutdown, which cancels every call in flight.
    pub shutdown: CancellationToken,
}

/// Indexes methods by their fully qualified name, as used in `/invoke/{method}`.
pub fn method_table(
    methods: impl IntoIterator<Item = MethodDescriptor>,
) -> BTreeMap<String, MethodDescriptor> {
    methods
        .into_iter()
        .map(|method| (method.full_name().to_string(), method))
        .collect()
}

pub fn router(state: Arc<AppState>, base_path: &str) -> Router {
    let routes = Router::new()
        .route("/", get(index))
        .route("/invoke/{method}", post(invoke))
        .route("/metadata", get(metadata))
        .with_state(state);

    if base_path == "/" {
        routes
    } else {
        Router::new().nest(base_path, routes)
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Index {
    pub target: String,
    pub methods: Vec<MethodInfo>,
    pub default_metadata: Vec<MetadataEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodInfo {
    pub name: String,
    pub service: String,
    pub method: String,
    pub client_streaming: bool,
    pub server_streaming: bool,
    pub request_type: String,
    pub response_type: String,
}

impl From<&MethodDescriptor> for MethodInfo {
    fn from(method: &MethodDescriptor) -> Self {
        Self {
            name: method.full_name().to_string(),
            service: method.parent_service().full_name().to_string(),
            method: method.name().to_string(),
            client_streaming: method.is_client_streaming(),
            server_streaming: method.is_server_streaming(),
            request_type: method.input().full_name().to_string(),
            response_type: method.output().full_name().to_string(),
        }
    }
}

async fn index(State(state): State<Arc<AppState>>) -> Json<Index> {
    Json(Index {
        target: state.target.clone(),
        methods: state.methods.values().map(MethodInfo::from).collect(),
        default_metadata: state.default_metadata.clone(),
    })
}

#[derive(Debug, Deserialize)]
struct MetadataQuery {
    method: String,
}

async fn metadata(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MetadataQuery>,
) -> Response {
    if query.method == "*" {
        return Json(state.all_types.clone()).into_response();
    }

    match state.methods.get(&query.method) {
        Some(method) => Json(schema_for_method(method)).into_response(),
        None => (StatusCode::UNPROCESSABLE_ENTITY, "Unknown RPC Method").into_response(),
    }
}

async fn invoke(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let started = Instant::now();

    let response = run_invocation(&state, &name, &headers, body).await;

    tracing::info!(
        method = %name,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "invocation finished"
    );

    response
}

async fn run_invocation(state: &AppState, name: &str, headers: &HeaderMap, body: Body) -> Response {
    if !is_json(headers) {
        return (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "Content-Type must be application/json",
        )
            .into_response();
    }

    let Some(method) = state.methods.get(name) else {
        return (StatusCode::NOT_FOUND, format!("Method '{name}' is not exposed")).into_response();
    };

    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(body) => body,
        Err(err) => return error_response(InvokeError::ReadFailure(err.into())),
    };

    let mut ctx = CallContext::with_token(state.shutdown.child_token());
    if let Some(max_time) = state.max_time {
        ctx = ctx.with_timeout(max_time);
    }

    let bridge = state
        .bridge
        .clone()
        .extra_metadata(call_metadata(state, headers));
    let mut client = state.client.clone();

    match bridge.invoke_bytes(method, &mut client, &body, &ctx).await {
        Ok(envelope) => Json(envelope).into_response(),
        Err(err) => error_response(err),
    }
}

/// Configured RPC metadata followed by the preserved request headers.
fn call_metadata(state: &AppState, headers: &HeaderMap) -> Vec<(String, String)> {
    let mut metadata = state.rpc_metadata.clone();

    for name in &state.preserve_headers {
        for value in headers.get_all(name.as_str()) {
            match value.to_str() {
                Ok(value) => metadata.push((name.clone(), value.to_string())),
                Err(_) => tracing::debug!(header = %name, "skipping non-ASCII preserved header"),
            }
        }
    }

    metadata
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .is_some_and(|media| media.trim().eq_ignore_ascii_case("application/json"))
}

fn error_response(err: InvokeError) -> Response {
    let status = if err.is_read_failure() {
        StatusCode::from_u16(CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::BAD_REQUEST)
    } else if err.is_user_error() {
        StatusCode::BAD_REQUEST
    } else {
        tracing::error!(error = %err, "invocation failed");
        StatusCode::INTERNAL_SERVER_ERROR
    };

    (status, err.to_string()).into_response()
}
