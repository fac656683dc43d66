//! # Generic gRPC Client
//!
//! This module wraps a standard `tonic` client to provide a generic interface for
//! gRPC communication. It is agnostic to the specific Protobuf messages being exchanged.
//!
//! ## How it works
//!
//! The [`GrpcClient`] utilizes the [`super::codec::DynamicCodec`] to handle serialization.
//! It builds the HTTP/2 path (e.g., `/package.Service/Method`) from a `MethodDescriptor` at
//! runtime and always drives the call as a bidirectional stream: unary and half-streaming
//! methods are just streams of length one on the relevant side, which lets a single code
//! path serve all four method shapes.
use super::codec::DynamicCodec;
use crate::BoxError;
use futures_util::Stream;
use http_body::Body as HttpBody;
use prost_reflect::{DynamicMessage, MethodDescriptor};
use std::str::FromStr;
use tonic::{Request, Response, Status, Streaming, client::GrpcService, transport::Channel};

#[derive(thiserror::Error, Debug)]
pub enum GrpcRequestError {
    #[error("Internal error, the client was not ready: '{0}'")]
    ClientNotReady(#[source] BoxError),
    #[error("Invalid gRPC path '{path}': '{source}'")]
    InvalidPath {
        path: String,
        source: http::uri::InvalidUri,
    },
}

/// A gRPC client able to call any method described by a `MethodDescriptor`.
#[derive(Debug, Clone)]
pub struct GrpcClient<S = Channel> {
    client: tonic::client::Grpc<S>,
}

impl<S> GrpcClient<S>
where
    S: GrpcService<tonic::body::Body>,
    S::Error: Into<BoxError>,
    S::ResponseBody: HttpBody<Data = tonic::codegen::Bytes> + Send + 'static,
    <S::ResponseBody as HttpBody>::Error: Into<BoxError> + Send,
{
    pub fn new(service: S) -> Self {
        let client = tonic::client::Grpc::new(service);
        Self { client }
    }

    /// Limits the size of a single decoded response message.
    pub fn max_decoding_message_size(mut self, limit: usize) -> Self {
        self.client = self.client.max_decoding_message_size(limit);
        self
    }

    /// Starts a call to `method`, sending every message produced by the request stream.
    ///
    /// # Returns
    ///
    /// * `Ok(Ok(Response))` - The server accepted the call; responses are read from the stream.
    /// * `Ok(Err(Status))` - The call failed before any response header arrived.
    /// * `Err(GrpcRequestError)` - Failed to send the request.
    pub async fn streaming<St>(
        &mut self,
        method: &MethodDescriptor,
        request: Request<St>,
    ) -> Result<Result<Response<Streaming<DynamicMessage>>, Status>, GrpcRequestError>
    where
        St: Stream<Item = DynamicMessage> + Send + 'static,
    {
        self.client
            .ready()
            .await
            .map_err(|e| GrpcRequestError::ClientNotReady(e.into()))?;

        let codec = DynamicCodec::new(method.input(), method.output());
        let path = http_path(method)?;

        Ok(self.client.streaming(request, path, codec).await)
    }
}

fn http_path(method: &MethodDescriptor) -> Result<http::uri::PathAndQuery, GrpcRequestError> {
    let path = format!("/{}/{}", method.parent_service().full_name(), method.name());
    http::uri::PathAndQuery::from_str(&path)
        .map_err(|source| GrpcRequestError::InvalidPath { path, source })
}
