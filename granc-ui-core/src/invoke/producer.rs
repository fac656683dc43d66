//! The request side of a call.
//!
//! Every streaming shape draws its request messages from a [`RequestProducer`]: an immutable
//! list of JSON values plus a cursor. Each value is unmarshaled only when the transport asks
//! for the next message.
use futures_util::Stream;
use prost_reflect::{DynamicMessage, MessageDescriptor};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;
use tonic::Status;

/// Shared view of a producer's progress, readable after the producer moved into the call.
#[derive(Debug, Clone, Default)]
pub struct ProducerHandle {
    sent: Arc<AtomicUsize>,
    failure: Arc<OnceLock<Status>>,
    aborted: CancellationToken,
}

impl ProducerHandle {
    /// Messages successfully unmarshaled and handed to the call.
    pub fn sent(&self) -> usize {
        self.sent.load(Ordering::Acquire)
    }

    /// The status recorded when a request message failed to unmarshal.
    pub fn failure(&self) -> Option<Status> {
        self.failure.get().cloned()
    }

    /// Resolves once the producer gave up on the remaining messages.
    pub async fn aborted(&self) -> Status {
        self.aborted.cancelled().await;
        self.failure()
            .unwrap_or_else(|| Status::aborted("request stream aborted"))
    }

    fn fail(&self, status: Status) {
        let _ = self.failure.set(status);
        self.aborted.cancel();
    }
}

#[derive(Debug)]
pub struct RequestProducer {
    data: Vec<serde_json::Value>,
    cursor: usize,
    limit: usize,
    descriptor: MessageDescriptor,
    placeholder: bool,
    handle: ProducerHandle,
}

impl RequestProducer {
    /// A producer of `descriptor` messages.
    ///
    /// Without client streaming at most one message is produced, and an empty `data` still
    /// produces one empty message, which is not counted as sent.
    pub fn new(
        descriptor: MessageDescriptor,
        data: Vec<serde_json::Value>,
        client_streaming: bool,
    ) -> Self {
        Self {
            placeholder: data.is_empty() && !client_streaming,
            limit: if client_streaming { usize::MAX } else { 1 },
            data,
            cursor: 0,
            descriptor,
            handle: ProducerHandle::default(),
        }
    }

    pub fn handle(&self) -> ProducerHandle {
        self.handle.clone()
    }

    /// The next message, `None` when the data is exhausted.
    pub fn next_message(&mut self) -> Option<Result<DynamicMessage, Status>> {
        if self.placeholder {
            self.placeholder = false;
            return Some(Ok(DynamicMessage::new(self.descriptor.clone())));
        }

        if self.cursor >= self.limit {
            return None;
        }
        let value = self.data.get(self.cursor)?;
        self.cursor += 1;

        match DynamicMessage::deserialize(self.descriptor.clone(), value) {
            Ok(message) => {
                self.handle.sent.fetch_add(1, Ordering::AcqRel);
                Some(Ok(message))
            }
            Err(err) => Some(Err(Status::invalid_argument(err.to_string()))),
        }
    }

    /// Turns the producer into the request stream of a call.
    ///
    /// On an unmarshal failure the status is recorded, the handle is aborted and the stream
    /// stays pending forever, so the call is never half-closed cleanly.
    pub fn into_stream(self) -> impl Stream<Item = DynamicMessage> + Send + 'static {
        futures_util::stream::unfold(self, |mut producer| async move {
            match producer.next_message()? {
                Ok(message) => Some((message, producer)),
                Err(status) => {
                    producer.handle.fail(status);
                    std::future::pending::<()>().await;
                    None
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use prost_reflect::DescriptorPool;
    use prost_types::{
        DescriptorProto, FieldDescriptorProto, FileDescriptorProto,
        field_descriptor_proto::{Label, Type},
    };
    use serde_json::json;
    use tonic::Code;

    fn message_descriptor() -> MessageDescriptor {
        let file = FileDescriptorProto {
            name: Some("test.proto".to_string()),
            package: Some("test".to_string()),
            syntax: Some("proto3".to_string()),
            message_type: vec![DescriptorProto {
                name: Some("Msg".to_string()),
                field: vec![FieldDescriptorProto {
                    name: Some("a".to_string()),
                    number: Some(1),
                    label: Some(Label::Optional as i32),
                    r#type: Some(Type::Int32 as i32),
                    json_name: Some("a".to_string()),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        };

        let mut pool = DescriptorPool::new();
        pool.add_file_descriptor_proto(file).unwrap();
        pool.get_message_by_name("test.Msg").unwrap()
    }

    #[test]
    fn test_consumes_data_in_order() {
        let mut producer =
            RequestProducer::new(message_descriptor(), vec![json!({"a": 1}), json!({"a": 2})], true);

        let first = producer.next_message().unwrap().unwrap();
        let second = producer.next_message().unwrap().unwrap();

        assert_eq!(first.get_field_by_name("a").unwrap().as_i32(), Some(1));
        assert_eq!(second.get_field_by_name("a").unwrap().as_i32(), Some(2));
        assert!(producer.next_message().is_none());
        assert_eq!(producer.handle().sent(), 2);
    }

    #[test]
    fn test_empty_data_yields_uncounted_placeholder() {
        let mut producer = RequestProducer::new(message_descriptor(), vec![], false);

        assert!(producer.next_message().unwrap().is_ok());
        assert!(producer.next_message().is_none());
        assert_eq!(producer.handle().sent(), 0);
    }

    #[test]
    fn test_empty_data_for_client_streaming_sends_nothing() {
        let mut producer = RequestProducer::new(message_descriptor(), vec![], true);
        assert!(producer.next_message().is_none());
    }

    #[test]
    fn test_unmarshal_failure_is_invalid_argument() {
        let mut producer =
            RequestProducer::new(message_descriptor(), vec![json!({"a": "nope"})], true);

        let status = producer.next_message().unwrap().unwrap_err();

        assert_eq!(status.code(), Code::InvalidArgument);
        assert_eq!(producer.handle().sent(), 0);
    }

    #[tokio::test]
    async fn test_stream_aborts_on_failure() {
        let producer = RequestProducer::new(
            message_descriptor(),
            vec![json!({"a": 1}), json!({"b": true}), json!({"a": 3})],
            true,
        );
        let handle = producer.handle();
        let mut stream = Box::pin(producer.into_stream());

        assert!(stream.next().await.is_some());

        tokio::select! {
            _ = stream.next() => panic!("the stream must not yield after a failure"),
            status = handle.aborted() => assert_eq!(status.code(), Code::InvalidArgument),
        }
        assert_eq!(handle.sent(), 1);
    }
}
