//! # Descriptor Sources
//!
//! A [`DescriptorSource`] resolves fully-qualified names into protobuf descriptors. Everything
//! else in the crate (schema generation, invocation, method enumeration) reads the schema
//! through this abstraction, so it never cares whether descriptors come from:
//!
//! * **[`ReflectionSource`]**: a live server, via the gRPC Server Reflection Protocol.
//! * **[`FileDescriptorSource`]**: static protoset files or `.proto` sources compiled at runtime.
//! * **[`CompositeSource`]**: reflection first, with a static fallback.
mod composite;
mod file;
mod reflection;
mod types;

pub use composite::CompositeSource;
pub use file::{FileDescriptorSource, FileSourceError};
pub use reflection::ReflectionSource;
pub use types::{Descriptor, files_with_dependencies};

use crate::reflection::client::ReflectionResolveError;
use async_trait::async_trait;
use prost_reflect::{DescriptorError, ExtensionDescriptor, FileDescriptor};
use std::collections::BTreeMap;

/// Errors that can occur when resolving descriptors.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Symbol '{0}' not found")]
    SymbolNotFound(String),
    #[error("Reflection resolution failed: '{0}'")]
    Reflection(#[from] ReflectionResolveError),
    #[error("Failed to build descriptor pool: '{0}'")]
    Descriptor(#[from] DescriptorError),
}

/// Resolves names to descriptors, lists services and finds extensions.
///
/// Implementations must be usable concurrently from many invocations.
#[async_trait]
pub trait DescriptorSource: Send + Sync {
    /// Fully qualified names of every service known to the source.
    async fn list_services(&self) -> Result<Vec<String>, SourceError>;

    /// Resolves a service, message or enum by its fully qualified name.
    async fn find_symbol(&self, name: &str) -> Result<Descriptor, SourceError>;

    /// Every known extension whose extendee is `type_name`.
    async fn all_extensions_for_type(
        &self,
        type_name: &str,
    ) -> Result<Vec<ExtensionDescriptor>, SourceError>;
}

/// Collects every file reachable from the services of `source`, dependencies first.
pub async fn all_files(source: &dyn DescriptorSource) -> Result<Vec<FileDescriptor>, SourceError> {
    let mut roots = BTreeMap::new();

    for service in source.list_services().await? {
        let descriptor = source.find_symbol(&service).await?;
        let file = descriptor.parent_file();
        roots.entry(file.name().to_string()).or_insert(file);
    }

    Ok(files_with_dependencies(roots.into_values()))
}
