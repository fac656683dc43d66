//! In-memory implementations of the test services.
use crate::pb::{EchoRequest, EchoResponse, ErrorDetail, FailRequest, KitchenSink};
use crate::{AdminService, EchoService};
use prost::Message;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::metadata::{Ascii, Binary, KeyAndValueRef, MetadataKey, MetadataMap, MetadataValue};
use tonic::{Code, Request, Response, Status, Streaming};

/// Type URL of [`ErrorDetail`] as attached to failing responses.
pub const ERROR_DETAIL_TYPE_URL: &str = "type.googleapis.com/echo.ErrorDetail";

// google.rpc.Status, as carried by the `grpc-status-details-bin` trailer.
#[derive(Clone, PartialEq, Message)]
struct RpcStatus {
    #[prost(int32, tag = "1")]
    code: i32,
    #[prost(string, tag = "2")]
    message: String,
    #[prost(message, repeated, tag = "3")]
    details: Vec<prost_types::Any>,
}

pub struct EchoServiceImpl;

#[tonic::async_trait]
impl EchoService for EchoServiceImpl {
    type ServerStreamingEchoStream = ReceiverStream<Result<EchoResponse, Status>>;
    type BidirectionalEchoStream = ReceiverStream<Result<EchoResponse, Status>>;

    async fn unary_echo(
        &self,
        req: Request<EchoRequest>,
    ) -> Result<Response<EchoResponse>, Status> {
        let echoed = echoed_metadata(req.metadata());
        let mut response = Response::new(EchoResponse {
            message: req.into_inner().message,
        });

        *response.metadata_mut() = echoed;
        response
            .metadata_mut()
            .insert("x-echo-header", MetadataValue::from_static("unary"));
        response.metadata_mut().insert_bin(
            "x-echo-bin",
            MetadataValue::from_bytes(&[0xde, 0xad, 0xbe, 0xef]),
        );

        Ok(response)
    }

    async fn server_streaming_echo(
        &self,
        req: Request<EchoRequest>,
    ) -> Result<Response<Self::ServerStreamingEchoStream>, Status> {
        let message = req.into_inner().message;
        let (tx, rx) = mpsc::channel(4);

        tokio::spawn(async move {
            // Two messages followed by an error when asked to fail.
            let count = if message.starts_with("fail") { 2 } else { 3 };

            for seq in 0..count {
                let response = EchoResponse {
                    message: format!("{message} - seq {seq}"),
                };
                if tx.send(Ok(response)).await.is_err() {
                    return;
                }
            }

            if message.starts_with("fail") {
                let _ = tx.send(Err(Status::not_found("stream source gone"))).await;
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn client_streaming_echo(
        &self,
        req: Request<Streaming<EchoRequest>>,
    ) -> Result<Response<EchoResponse>, Status> {
        let mut stream = req.into_inner();
        let mut messages = Vec::new();

        while let Some(req) = stream.message().await? {
            messages.push(req.message);
        }

        Ok(Response::new(EchoResponse {
            message: messages.join(","),
        }))
    }

    async fn bidirectional_echo(
        &self,
        req: Request<Streaming<EchoRequest>>,
    ) -> Result<Response<Self::BidirectionalEchoStream>, Status> {
        let mut stream = req.into_inner();
        let (tx, rx) = mpsc::channel(4);

        tokio::spawn(async move {
            loop {
                let next = match stream.message().await {
                    Ok(Some(req)) => Ok(EchoResponse {
                        message: format!("echo: {}", req.message),
                    }),
                    Ok(None) => return,
                    Err(status) => Err(status),
                };

                let failed = next.is_err();
                if tx.send(next).await.is_err() || failed {
                    return;
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn failing_echo(
        &self,
        req: Request<FailRequest>,
    ) -> Result<Response<EchoResponse>, Status> {
        let req = req.into_inner();
        let code = Code::from_i32(req.code);

        let mut metadata = MetadataMap::new();
        metadata.insert("x-fail-reason", MetadataValue::from_static("requested"));

        let details = if req.with_details {
            let detail = ErrorDetail {
                reason: "testing".to_string(),
                retry_after: 30,
            };
            let status = RpcStatus {
                code: req.code,
                message: req.message.clone(),
                details: vec![prost_types::Any {
                    type_url: ERROR_DETAIL_TYPE_URL.to_string(),
                    value: detail.encode_to_vec(),
                }],
            };
            bytes::Bytes::from(status.encode_to_vec())
        } else {
            bytes::Bytes::new()
        };

        Err(Status::with_details_and_metadata(
            code,
            req.message,
            details,
            metadata,
        ))
    }

    async fn slow_echo(&self, req: Request<EchoRequest>) -> Result<Response<EchoResponse>, Status> {
        tokio::time::sleep(Duration::from_secs(30)).await;

        Ok(Response::new(EchoResponse {
            message: req.into_inner().message,
        }))
    }

    async fn inspect_echo(
        &self,
        req: Request<KitchenSink>,
    ) -> Result<Response<KitchenSink>, Status> {
        Ok(Response::new(req.into_inner()))
    }
}

pub struct AdminServiceImpl;

#[tonic::async_trait]
impl AdminService for AdminServiceImpl {
    async fn ping(&self, req: Request<EchoRequest>) -> Result<Response<EchoResponse>, Status> {
        Ok(Response::new(EchoResponse {
            message: format!("pong: {}", req.into_inner().message),
        }))
    }

    async fn reset(&self, _req: Request<EchoRequest>) -> Result<Response<EchoResponse>, Status> {
        Ok(Response::new(EchoResponse::default()))
    }
}

// Copies every `x-` request header back as `echoed-<name>`.
fn echoed_metadata(request: &MetadataMap) -> MetadataMap {
    let mut echoed = MetadataMap::new();

    for entry in request.iter() {
        match entry {
            KeyAndValueRef::Ascii(key, value) if key.as_str().starts_with("x-") => {
                if let Ok(key) = format!("echoed-{}", key.as_str()).parse::<MetadataKey<Ascii>>() {
                    echoed.append(key, value.clone());
                }
            }
            KeyAndValueRef::Binary(key, value) if key.as_str().starts_with("x-") => {
                if let Ok(key) = format!("echoed-{}", key.as_str()).parse::<MetadataKey<Binary>>() {
                    echoed.append_bin(key, value.clone());
                }
            }
            _ => {}
        }
    }

    echoed
}
