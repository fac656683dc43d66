//! # Echo Service
//!
//! **INTERNAL USE ONLY**: This crate exists solely to provide a gRPC server implementation
//! and descriptor set for integration testing `granc-ui` and `granc_ui_core`.
//! It is not intended for production use.
//!
//! The schema deliberately covers cyclic messages, oneofs, maps, enums, `Any`,
//! proto2 defaults and extensions, so the descriptor set doubles as a schema fixture.

pub mod pb {
    include!(concat!(env!("OUT_DIR"), "/echo.rs"));
}

pub use pb::admin_service_server::{AdminService, AdminServiceServer};
pub use pb::echo_service_server::{EchoService, EchoServiceServer};
pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("descriptors");

mod service;

pub use service::{AdminServiceImpl, ERROR_DETAIL_TYPE_URL, EchoServiceImpl};
