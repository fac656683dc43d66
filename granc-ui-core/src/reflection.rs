//! # Server Reflection
//!
//! This module contains the logic necessary to interact with the gRPC Server Reflection Protocol.
//!
//! It lets the bridge query a server for its own Protobuf schema at runtime, so methods can be
//! exposed without pre-compiled descriptors.
pub mod client;
