use super::{AppState, Index, method_table, router};
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use echo_service::{
    AdminServiceImpl, AdminServiceServer, EchoServiceImpl, EchoServiceServer, FILE_DESCRIPTOR_SET,
};
use granc_ui_core::descriptor::{DescriptorSource, ReflectionSource, all_files};
use granc_ui_core::grpc::client::GrpcClient;
use granc_ui_core::grpc::metadata::MetadataEntry;
use granc_ui_core::invoke::{InvocationBridge, ResponseEnvelope};
use granc_ui_core::methods::{ExposureConfig, resolve_methods};
use granc_ui_core::reflection::client::ReflectionClient;
use granc_ui_core::schema::{ReflectionTypes, schema_for_all_types};
use granc_ui_core::tonic::transport::{Channel, Server};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

/// Starts the echo, admin and reflection services on an ephemeral port.
async fn spawn_echo_server() -> Channel {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind the echo server");
    let addr = listener.local_addr().unwrap();

    let reflection_service = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
        .build_v1()
        .expect("Failed to setup Reflection Service");

    tokio::spawn(async move {
        Server::builder()
            .add_service(EchoServiceServer::new(EchoServiceImpl))
            .add_service(AdminServiceServer::new(AdminServiceImpl))
            .add_service(reflection_service)
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .expect("Echo server failed");
    });

    Channel::from_shared(format!("http://{addr}"))
        .unwrap()
        .connect()
        .await
        .expect("Failed to connect to the echo server")
}

struct Options {
    services: Vec<&'static str>,
    preserve_headers: Vec<String>,
    max_time: Option<Duration>,
    base_path: &'static str,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            services: vec![],
            preserve_headers: vec![],
            max_time: None,
            base_path: "/",
        }
    }
}

async fn setup(options: Options) -> Router {
    let channel = spawn_echo_server().await;
    let source: Arc<dyn DescriptorSource> = Arc::new(ReflectionSource::new(ReflectionClient::new(
        channel.clone(),
    )));

    let exposure = ExposureConfig::from_names(options.services.as_slice(), &[] as &[&str])
        .expect("Invalid exposure config");
    let methods = resolve_methods(source.as_ref(), &exposure)
        .await
        .expect("Failed to resolve methods");
    let files = all_files(source.as_ref())
        .await
        .expect("Failed to collect files");

    let state = AppState {
        target: "http://echo".to_string(),
        methods: method_table(methods),
        default_metadata: vec![MetadataEntry::new("authorization", "Bearer demo")],
        all_types: schema_for_all_types(&files, ReflectionTypes::Exclude),
        bridge: InvocationBridge::new(source),
        client: GrpcClient::new(channel),
        rpc_metadata: vec![("x-configured".to_string(), "yes".to_string())],
        preserve_headers: options.preserve_headers,
        max_time: options.max_time,
        shutdown: CancellationToken::new(),
    };

    router(Arc::new(state), options.base_path)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("Router failed");
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("Failed to read the response body");
    (status, body.to_vec())
}

fn invoke_request(path: &str, body: Value) -> Request<Body> {
    Request::post(path)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn header<'a>(entries: &'a [MetadataEntry], name: &str) -> Option<&'a str> {
    entries
        .iter()
        .find(|e| e.name == name)
        .map(|e| e.value.as_str())
}

#[tokio::test]
async fn test_index_lists_exposed_methods() {
    let app = setup(Options::default()).await;

    let (status, body) = send(&app, Request::get("/").body(Body::empty()).unwrap()).await;

    assert_eq!(status, StatusCode::OK);
    let index: Index = serde_json::from_slice(&body).unwrap();
    assert_eq!(index.target, "http://echo");
    assert_eq!(
        index.default_metadata,
        vec![MetadataEntry::new("authorization", "Bearer demo")]
    );
    assert!(
        index
            .methods
            .iter()
            .all(|m| !m.service.starts_with("grpc.reflection."))
    );

    let bidi = index
        .methods
        .iter()
        .find(|m| m.name == "echo.EchoService.BidirectionalEcho")
        .expect("BidirectionalEcho missing from the index");
    assert_eq!(bidi.service, "echo.EchoService");
    assert_eq!(bidi.method, "BidirectionalEcho");
    assert!(bidi.client_streaming && bidi.server_streaming);
    assert_eq!(bidi.request_type, "echo.EchoRequest");
    assert_eq!(bidi.response_type, "echo.EchoResponse");
}

#[tokio::test]
async fn test_invoke_unary() {
    let app = setup(Options::default()).await;

    let (status, body) = send(
        &app,
        invoke_request(
            "/invoke/echo.EchoService.UnaryEcho",
            json!({ "data": [{ "message": "over http" }] }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let envelope: ResponseEnvelope = serde_json::from_slice(&body).unwrap();
    assert_eq!(envelope.error, None);
    assert_eq!(envelope.responses[0].message, json!({ "message": "over http" }));
    assert_eq!(header(&envelope.headers, "echoed-x-configured"), Some("yes"));
}

#[tokio::test]
async fn test_invoke_reports_rpc_errors_in_the_envelope() {
    let app = setup(Options::default()).await;

    let (status, body) = send(
        &app,
        invoke_request(
            "/invoke/echo.EchoService.FailingEcho",
            json!({ "data": [{ "code": 7, "message": "nope" }] }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let envelope: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(envelope["error"]["code"], 7);
    assert_eq!(envelope["error"]["name"], "PermissionDenied");
    assert_eq!(envelope["error"]["message"], "nope");
    assert_eq!(envelope["requests"], json!({ "total": 1, "sent": 1 }));
}

#[tokio::test]
async fn test_invoke_requires_json() {
    let app = setup(Options::default()).await;

    let request = Request::post("/invoke/echo.EchoService.UnaryEcho")
        .header("content-type", "text/plain")
        .body(Body::from("{}"))
        .unwrap();
    let (status, _) = send(&app, request).await;

    assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
}

#[tokio::test]
async fn test_invoke_unknown_method() {
    let app = setup(Options::default()).await;

    let (status, _) = send(
        &app,
        invoke_request("/invoke/echo.EchoService.Nope", json!({})),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_invoke_rejects_bad_input() {
    let app = setup(Options::default()).await;

    let (status, _) = send(
        &app,
        invoke_request(
            "/invoke/echo.EchoService.UnaryEcho",
            json!({ "data": [{ "message": "a" }, { "message": "b" }] }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let request = Request::post("/invoke/echo.EchoService.UnaryEcho")
        .header("content-type", "application/json; charset=utf-8")
        .body(Body::from("{ broken"))
        .unwrap();
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_max_time_bounds_invocations() {
    let app = setup(Options {
        max_time: Some(Duration::from_millis(200)),
        ..Default::default()
    })
    .await;

    let (status, body) = send(
        &app,
        invoke_request(
            "/invoke/echo.EchoService.SlowEcho",
            json!({ "timeout_seconds": 60, "data": [{ "message": "slow" }] }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let envelope: ResponseEnvelope = serde_json::from_slice(&body).unwrap();
    assert_eq!(
        envelope.error.expect("Expected a deadline").name,
        "DeadlineExceeded"
    );
}

#[tokio::test]
async fn test_preserved_headers_become_metadata() {
    let app = setup(Options {
        preserve_headers: vec!["x-request-id".to_string()],
        ..Default::default()
    })
    .await;

    let request = Request::post("/invoke/echo.EchoService.UnaryEcho")
        .header("content-type", "application/json")
        .header("x-request-id", "req-42")
        .header("x-not-preserved", "dropped")
        .body(Body::from(r#"{"data": [{"message": "hi"}]}"#))
        .unwrap();
    let (status, body) = send(&app, request).await;

    assert_eq!(status, StatusCode::OK);
    let envelope: ResponseEnvelope = serde_json::from_slice(&body).unwrap();
    assert_eq!(header(&envelope.headers, "echoed-x-request-id"), Some("req-42"));
    assert_eq!(header(&envelope.headers, "echoed-x-not-preserved"), None);
}

#[tokio::test]
async fn test_metadata_for_a_method() {
    let app = setup(Options::default()).await;

    let (status, body) = send(
        &app,
        Request::get("/metadata?method=echo.EchoService.ClientStreamingEcho")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let schema: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(schema["requestType"], "echo.EchoRequest");
    assert_eq!(schema["requestStream"], true);
    assert_eq!(schema["messageTypes"]["echo.EchoRequest"][0]["name"], "message");
}

#[tokio::test]
async fn test_metadata_for_every_type() {
    let app = setup(Options::default()).await;

    let (status, body) = send(
        &app,
        Request::get("/metadata?method=*").body(Body::empty()).unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let schema: Value = serde_json::from_slice(&body).unwrap();
    assert!(schema.get("requestType").is_none());
    assert!(schema["messageTypes"].get("echo.ErrorDetail").is_some());
    assert!(schema["enumTypes"].get("echo.KitchenSink.Mood").is_some());
}

#[tokio::test]
async fn test_metadata_for_an_unknown_method() {
    let app = setup(Options {
        services: vec!["echo.AdminService"],
        ..Default::default()
    })
    .await;

    // Not exposed, even though the server knows it.
    let (status, body) = send(
        &app,
        Request::get("/metadata?method=echo.EchoService.UnaryEcho")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body, b"Unknown RPC Method");
}

#[tokio::test]
async fn test_routes_live_under_the_base_path() {
    let app = setup(Options {
        base_path: "/grpc",
        ..Default::default()
    })
    .await;

    let (status, _) = send(
        &app,
        invoke_request(
            "/grpc/invoke/echo.AdminService.Ping",
            json!({ "data": [{ "message": "x" }] }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(
        &app,
        invoke_request(
            "/invoke/echo.AdminService.Ping",
            json!({ "data": [{ "message": "x" }] }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
