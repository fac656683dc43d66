//! # Granc UI Core
//!
//! `granc-ui-core` is the library behind the Granc UI server. It exposes any gRPC server,
//! whose schema is only known at runtime, through a JSON bridge: protobuf descriptors are
//! described as JSON schemas and RPCs are driven with JSON payloads.
//!
//! ## Key Components
//!
//! * **[`descriptor::DescriptorSource`]:** Resolves symbols, services and extensions. Backed by
//!   server reflection, static descriptor files, or a composite of both.
//! * **[`schema`]:** Walks message graphs (cycles included) into a serializable [`schema::Schema`].
//! * **[`invoke::InvocationBridge`]:** Executes unary, client streaming, server streaming and
//!   bidirectional calls through one code path, producing a JSON [`invoke::ResponseEnvelope`].
//! * **[`methods`]:** Resolves the configured subset of services and methods to expose.
//!
//! ## Internal clients
//!
//! * **[`grpc::client::GrpcClient`]:** A dynamic gRPC client using a `DynamicMessage` codec.
//! * **[`reflection::client::ReflectionClient`]:** A client for `grpc.reflection.v1`.
//!
//! ## Re-exports
//!
//! This crate re-exports `prost`, `prost-reflect`, and `tonic` to ensure that consumers
//! use compatible versions of these underlying dependencies.
pub mod connect;
pub mod descriptor;
pub mod grpc;
pub mod invoke;
pub mod methods;
pub mod reflection;
pub mod schema;

// Re-exports
pub use prost;
pub use prost_reflect;
pub use tonic;

/// Type alias for the standard boxed error used in generic bounds.
type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
