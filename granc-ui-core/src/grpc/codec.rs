//! # Dynamic Protobuf Codec
//!
//! This module implements `tonic::codec::Codec` for `prost_reflect::DynamicMessage`, so `tonic`
//! can transport messages whose types are only known at runtime.
//!
//! JSON conversion happens outside the codec: the bridge needs to count and report
//! conversion failures per message, which a codec error could not express.
use prost::Message;
use prost_reflect::{DynamicMessage, MessageDescriptor, ReflectMessage};
use tonic::{
    Status,
    codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder},
};

/// A Codec that encodes request messages and decodes response messages of the given types.
#[derive(Debug, Clone)]
pub struct DynamicCodec {
    /// Schema for the input message.
    req_desc: MessageDescriptor,
    /// Schema for the output message.
    res_desc: MessageDescriptor,
}

impl DynamicCodec {
    pub fn new(req_desc: MessageDescriptor, res_desc: MessageDescriptor) -> Self {
        Self { req_desc, res_desc }
    }
}

impl Codec for DynamicCodec {
    type Encode = DynamicMessage;
    type Decode = DynamicMessage;

    type Encoder = DynamicEncoder;
    type Decoder = DynamicDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        DynamicEncoder(self.req_desc.clone())
    }

    fn decoder(&mut self) -> Self::Decoder {
        DynamicDecoder(self.res_desc.clone())
    }
}

/// Writes a dynamic message to the wire.
pub struct DynamicEncoder(MessageDescriptor);

impl Encoder for DynamicEncoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        // Descriptors may come from different pools, so compare by name.
        if item.descriptor().full_name() != self.0.full_name() {
            return Err(Status::internal(format!(
                "Expected a '{}' message, got '{}'",
                self.0.full_name(),
                item.descriptor().full_name()
            )));
        }

        item.encode_raw(dst);
        Ok(())
    }
}

/// Reads a dynamic message of the response type from the wire.
pub struct DynamicDecoder(MessageDescriptor);

impl Decoder for DynamicDecoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        let mut msg = DynamicMessage::new(self.0.clone());
        msg.merge(src)
            .map_err(|e| Status::internal(format!("Failed to decode Protobuf bytes: {}", e)))?;

        Ok(Some(msg))
    }
}
