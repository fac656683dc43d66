//! # Invocation Bridge
//!
//! Executes one RPC from a JSON [`RequestEnvelope`] and collects everything observed on the wire
//! into a JSON [`ResponseEnvelope`].
//!
//! ## How it works
//!
//! All four streaming shapes share one call path. The request side is a [`RequestProducer`] that
//! unmarshals `data` lazily, one element per message; the call is always opened as a
//! bidirectional stream through [`GrpcClient::streaming`]. Unary and server-streaming methods
//! simply get a stream of length one.
//!
//! Every await point races the [`CallContext`], so cancellation and deadlines unblock pending
//! sends and receives and show up as the terminal status.
//!
//! A non-OK status is not an [`InvokeError`]: it is reported in [`ResponseEnvelope::error`],
//! together with the responses, headers and trailers received before it.
mod any;
mod context;
mod envelope;
mod producer;

pub use context::{CallContext, timeout_from_secs};
pub use envelope::{RequestEnvelope, RequestStats, ResponseEnvelope, ResponseMessage, RpcError};
pub use producer::{ProducerHandle, RequestProducer};

use crate::BoxError;
use crate::descriptor::{DescriptorSource, SourceError};
use crate::grpc::client::{GrpcClient, GrpcRequestError};
use crate::grpc::metadata::{MetadataError, call_metadata, metadata_entries};
use crate::grpc::status::{code_name, status_details};
use any::AnyResolver;
use http_body::Body as HttpBody;
use prost_reflect::{DescriptorError, MethodDescriptor, SerializeOptions};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tonic::{Code, Request, Status, client::GrpcService};

/// The largest timeout the `grpc-timeout` header can carry: eight digits of hours.
const MAX_WIRE_TIMEOUT: Duration = Duration::from_secs(99_999_999 * 60 * 60);

#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("Failed to read the request body: '{0}'")]
    ReadFailure(#[source] BoxError),
    #[error("Malformed request envelope: '{0}'")]
    BadInput(#[source] serde_json::Error),
    #[error("Method '{method}' accepts a single request message, got {count}")]
    TooManyMessages { method: String, count: usize },
    #[error(transparent)]
    InvalidMetadata(#[from] MetadataError),
    #[error("Failed to issue the call: '{0}'")]
    Request(#[from] GrpcRequestError),
    #[error("Failed to resolve Any type '{type_url}': '{source}'")]
    AnyResolution { type_url: String, source: SourceError },
    #[error("Failed to extend the descriptor pool: '{0}'")]
    Descriptor(#[from] DescriptorError),
    #[error("Type '{0}' is missing from the descriptor pool")]
    MissingType(String),
    #[error("Failed to re-decode a message: '{0}'")]
    Decode(#[from] prost::DecodeError),
}

impl InvokeError {
    /// The request body could not be read.
    pub fn is_read_failure(&self) -> bool {
        matches!(self, InvokeError::ReadFailure(_))
    }

    /// The caller sent something that can be fixed on their side.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            InvokeError::BadInput(_)
                | InvokeError::TooManyMessages { .. }
                | InvokeError::InvalidMetadata(_)
        )
    }
}

/// Drives RPCs described by a [`DescriptorSource`] from JSON envelopes.
#[derive(Clone)]
pub struct InvocationBridge {
    source: Arc<dyn DescriptorSource>,
    emit_defaults: bool,
    extra_metadata: Vec<(String, String)>,
}

impl std::fmt::Debug for InvocationBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationBridge")
            .field("emit_defaults", &self.emit_defaults)
            .field("extra_metadata", &self.extra_metadata)
            .finish_non_exhaustive()
    }
}

impl InvocationBridge {
    pub fn new(source: Arc<dyn DescriptorSource>) -> Self {
        Self {
            source,
            emit_defaults: true,
            extra_metadata: Vec::new(),
        }
    }

    /// Whether default-valued fields are rendered in responses. Defaults to `true`.
    pub fn emit_defaults(mut self, emit_defaults: bool) -> Self {
        self.emit_defaults = emit_defaults;
        self
    }

    /// Metadata added to every call, replacing envelope entries with the same name.
    pub fn extra_metadata(mut self, extra_metadata: Vec<(String, String)>) -> Self {
        self.extra_metadata = extra_metadata;
        self
    }

    /// Parses `body` as a [`RequestEnvelope`] and invokes `method` with it.
    pub async fn invoke_bytes<S>(
        &self,
        method: &MethodDescriptor,
        client: &mut GrpcClient<S>,
        body: &[u8],
        ctx: &CallContext,
    ) -> Result<ResponseEnvelope, InvokeError>
    where
        S: GrpcService<tonic::body::Body>,
        S::Error: Into<BoxError>,
        S::ResponseBody: HttpBody<Data = tonic::codegen::Bytes> + Send + 'static,
        <S::ResponseBody as HttpBody>::Error: Into<BoxError> + Send,
    {
        let envelope = RequestEnvelope::from_slice(body).map_err(InvokeError::BadInput)?;
        self.invoke(method, client, envelope, ctx).await
    }

    pub async fn invoke<S>(
        &self,
        method: &MethodDescriptor,
        client: &mut GrpcClient<S>,
        envelope: RequestEnvelope,
        ctx: &CallContext,
    ) -> Result<ResponseEnvelope, InvokeError>
    where
        S: GrpcService<tonic::body::Body>,
        S::Error: Into<BoxError>,
        S::ResponseBody: HttpBody<Data = tonic::codegen::Bytes> + Send + 'static,
        <S::ResponseBody as HttpBody>::Error: Into<BoxError> + Send,
    {
        let ctx = match envelope.timeout_seconds.and_then(timeout_from_secs) {
            Some(timeout) => ctx.with_timeout(timeout),
            None => ctx.clone(),
        };

        let total = envelope.data.len();
        if !method.is_client_streaming() && total > 1 {
            return Err(InvokeError::TooManyMessages {
                method: method.full_name().to_string(),
                count: total,
            });
        }

        let metadata = call_metadata(&envelope.metadata, &self.extra_metadata)?;

        let mut resolver = AnyResolver::new(self.source.as_ref(), method.parent_pool().clone());
        resolver.prepare_request(&envelope.data).await;

        let input_name = method.input().full_name().to_string();
        let input = resolver
            .pool()
            .get_message_by_name(&input_name)
            .ok_or(InvokeError::MissingType(input_name))?;

        let producer = RequestProducer::new(input, envelope.data, method.is_client_streaming());
        let handle = producer.handle();

        let mut request = Request::new(producer.into_stream());
        *request.metadata_mut() = metadata;
        if let Some(remaining) = ctx.remaining() {
            request.set_timeout(remaining.min(MAX_WIRE_TIMEOUT));
        }

        let options = SerializeOptions::new()
            .skip_default_fields(!self.emit_defaults)
            .use_proto_field_name(true);

        let mut result = ResponseEnvelope {
            requests: RequestStats { total, sent: 0 },
            ..Default::default()
        };

        let started = guard(&ctx, &handle, async {
            match client.streaming(method, request).await {
                Ok(started) => Ok(started),
                Err(GrpcRequestError::ClientNotReady(err)) => {
                    Ok(Err(Status::unavailable(err.to_string())))
                }
                Err(err) => Err(err),
            }
        })
        .await;

        let status = match started {
            Ok(Ok(Ok(response))) => {
                let (headers, mut stream, _) = response.into_parts();
                result.headers = metadata_entries(&headers);

                loop {
                    match guard(&ctx, &handle, stream.message()).await {
                        Ok(Ok(Some(message))) => {
                            let rendered = resolver.render_message(message, &options).await?;
                            result.responses.push(rendered);
                        }
                        Ok(Ok(None)) => {
                            break read_trailers(&ctx, &handle, &mut stream, &mut result).await;
                        }
                        Ok(Err(status)) => {
                            result.trailers = metadata_entries(status.metadata());
                            break status;
                        }
                        Err(status) => break status,
                    }
                }
            }
            // Trailers-only response.
            Ok(Ok(Err(status))) => {
                result.trailers = metadata_entries(status.metadata());
                status
            }
            Ok(Err(err)) => return Err(err.into()),
            Err(status) => status,
        };

        result.requests.sent = handle.sent();

        let status = match handle.failure() {
            Some(failure) => failure,
            None if status.code() != Code::Ok => ctx.err().unwrap_or(status),
            None => status,
        };

        if status.code() != Code::Ok {
            let mut details = Vec::new();
            match status_details(&status) {
                Ok(anys) => {
                    for any in &anys {
                        details.push(resolver.render_detail(any, &options).await?);
                    }
                }
                Err(err) => tracing::debug!(error = %err, "ignoring undecodable status details"),
            }

            result.error = Some(RpcError {
                code: i32::from(status.code()),
                name: code_name(status.code()).to_string(),
                message: status.message().to_string(),
                details,
            });
        }

        Ok(result)
    }
}

/// Reads the trailers once the response stream is drained.
async fn read_trailers(
    ctx: &CallContext,
    handle: &ProducerHandle,
    stream: &mut tonic::Streaming<prost_reflect::DynamicMessage>,
    result: &mut ResponseEnvelope,
) -> Status {
    match guard(ctx, handle, stream.trailers()).await {
        Ok(Ok(trailers)) => {
            if let Some(trailers) = trailers {
                result.trailers = metadata_entries(&trailers);
            }
            Status::ok("")
        }
        Ok(Err(status)) => {
            result.trailers = metadata_entries(status.metadata());
            status
        }
        Err(status) => status,
    }
}

/// Races `op` against the context and the request producer.
///
/// `Err` carries the status that interrupted the operation. A ready `op` still completes after
/// the producer aborts, so responses already received are drained first.
async fn guard<T>(
    ctx: &CallContext,
    handle: &ProducerHandle,
    op: impl Future<Output = T>,
) -> Result<T, Status> {
    tokio::select! {
        biased;
        status = ctx.done() => Err(status),
        value = op => Ok(value),
        status = handle.aborted() => Err(status),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{FutureExt, StreamExt};
    use prost_reflect::DescriptorPool;
    use serde_json::json;

    // A handle whose producer failed on its first element.
    fn aborted_handle() -> ProducerHandle {
        let pool = DescriptorPool::decode(echo_service::FILE_DESCRIPTOR_SET).unwrap();
        let input = pool.get_message_by_name("echo.EchoRequest").unwrap();
        let producer = RequestProducer::new(input, vec![json!({ "no_such_field": 1 })], true);
        let handle = producer.handle();

        let mut stream = Box::pin(producer.into_stream());
        assert!(stream.next().now_or_never().is_none());

        handle
    }

    #[tokio::test]
    async fn test_guard_completes_ready_operations_after_abort() {
        let handle = aborted_handle();

        let result = guard(&CallContext::new(), &handle, async { "buffered" }).await;

        assert_eq!(result.unwrap(), "buffered");
    }

    #[tokio::test]
    async fn test_guard_reports_abort_for_pending_operations() {
        let handle = aborted_handle();

        let result = guard(&CallContext::new(), &handle, std::future::pending::<()>()).await;

        assert_eq!(result.unwrap_err().code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_guard_prefers_the_context() {
        let handle = aborted_handle();
        let ctx = CallContext::new();
        ctx.cancel();

        let result = guard(&ctx, &handle, async { "buffered" }).await;

        assert_eq!(result.unwrap_err().code(), Code::Cancelled);
    }
}
