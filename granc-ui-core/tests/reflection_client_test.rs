use echo_service::{EchoServiceImpl, EchoServiceServer, FILE_DESCRIPTOR_SET};
use granc_ui_core::reflection::client::{ReflectionClient, ReflectionResolveError};
use prost_reflect::DescriptorPool;
use tonic::Code;
use tonic::metadata::{MetadataMap, MetadataValue};
use tonic_reflection::server::v1::{ServerReflection, ServerReflectionServer};

fn setup_reflection_client() -> ReflectionClient<ServerReflectionServer<impl ServerReflection>> {
    let reflection_service = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
        .build_v1()
        .expect("Failed to setup Reflection Service");

    ReflectionClient::new(reflection_service)
}

#[tokio::test]
async fn test_reflection_client_fetches_service_file_descriptor() {
    let mut client = setup_reflection_client();

    let fd_set = client
        .file_descriptor_set_by_symbol("echo.EchoService")
        .await
        .expect("Failed to fetch file descriptor set by symbol");

    let pool =
        DescriptorPool::from_file_descriptor_set(fd_set).expect("Failed to build descriptor pool");

    let service = pool
        .get_service_by_name("echo.EchoService")
        .expect("Failed to find service in file descriptor");

    let method = |name: &str| {
        service
            .methods()
            .find(|m| m.name() == name)
            .unwrap_or_else(|| panic!("Method {name} missing"))
    };

    let unary = method("UnaryEcho");
    assert!(!unary.is_client_streaming() && !unary.is_server_streaming());

    let client_streaming = method("ClientStreamingEcho");
    assert!(client_streaming.is_client_streaming() && !client_streaming.is_server_streaming());

    let server_streaming = method("ServerStreamingEcho");
    assert!(!server_streaming.is_client_streaming() && server_streaming.is_server_streaming());

    let bidirectional = method("BidirectionalEcho");
    assert!(bidirectional.is_client_streaming() && bidirectional.is_server_streaming());

    // Imports are resolved along with the requested file.
    assert!(pool.get_message_by_name("google.protobuf.Any").is_some());
}

#[tokio::test]
async fn test_reflection_client_lists_services() {
    let metadata = {
        let mut map = MetadataMap::new();
        map.insert("x-reflect", MetadataValue::from_static("yes"));
        map
    };
    let mut client = setup_reflection_client().with_metadata(metadata);

    let services = client.list_services().await.expect("Failed to list services");

    assert!(services.contains(&"echo.EchoService".to_string()));
    assert!(services.contains(&"echo.AdminService".to_string()));
}

#[tokio::test]
async fn test_reflection_service_not_found_error() {
    let mut client = setup_reflection_client();

    let result = client
        .file_descriptor_set_by_symbol("non.existent.Service")
        .await;

    match result {
        Err(err @ ReflectionResolveError::ServerStreamFailure(_)) => {
            assert!(err.is_not_found(), "Expected NotFound, got: {:?}", err);
        }
        Err(e) => panic!("Expected ServerStreamFailure(NotFound), got: {:?}", e),
        Ok(_) => panic!("Expected error, but got a file descriptor set"),
    }
}

#[tokio::test]
async fn test_server_does_not_support_reflection() {
    // This server does NOT have the Reflection service registered.
    let server = EchoServiceServer::new(EchoServiceImpl);
    let mut client = ReflectionClient::new(server);

    let result = client
        .file_descriptor_set_by_symbol("echo.EchoService")
        .await;

    match result {
        Err(ReflectionResolveError::ServerStreamInitFailed(status)) => {
            assert_eq!(
                status.code(),
                Code::Unimplemented,
                "Expected UNIMPLEMENTED status (service not found), but got: {:?}",
                status
            );
        }
        Err(e) => panic!("Expected StreamInitFailed(Unimplemented), got: {:?}", e),
        Ok(_) => panic!("Expected error, but got successful registry"),
    }
}
