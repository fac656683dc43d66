use prost_reflect::{
    DescriptorPool, EnumDescriptor, FileDescriptor, MessageDescriptor, ServiceDescriptor,
};
use std::collections::HashSet;
use std::fmt::Debug;

/// A generic wrapper for the descriptors a [`super::DescriptorSource`] can resolve.
///
/// This enum allows sources to return a single type when resolving symbols,
/// regardless of whether the symbol points to a Service, a Message, or an Enum.
#[derive(Debug, Clone)]
pub enum Descriptor {
    MessageDescriptor(MessageDescriptor),
    ServiceDescriptor(ServiceDescriptor),
    EnumDescriptor(EnumDescriptor),
}

impl Descriptor {
    /// Looks up a symbol in a pool, trying services first, then messages, then enums.
    pub fn from_pool(pool: &DescriptorPool, symbol: &str) -> Option<Self> {
        if let Some(descriptor) = pool.get_service_by_name(symbol) {
            return Some(Descriptor::ServiceDescriptor(descriptor));
        }
        if let Some(descriptor) = pool.get_message_by_name(symbol) {
            return Some(Descriptor::MessageDescriptor(descriptor));
        }
        if let Some(descriptor) = pool.get_enum_by_name(symbol) {
            return Some(Descriptor::EnumDescriptor(descriptor));
        }
        None
    }

    /// Returns the name (e.g.,`MyMessage`) of the inner descriptor
    pub fn name(&self) -> &str {
        match self {
            Descriptor::MessageDescriptor(v) => v.name(),
            Descriptor::ServiceDescriptor(v) => v.name(),
            Descriptor::EnumDescriptor(v) => v.name(),
        }
    }

    /// Returns the full_name (e.g.,`my.package.v1.MyMessage`) of the inner descriptor
    pub fn full_name(&self) -> &str {
        match self {
            Descriptor::MessageDescriptor(v) => v.full_name(),
            Descriptor::ServiceDescriptor(v) => v.full_name(),
            Descriptor::EnumDescriptor(v) => v.full_name(),
        }
    }

    /// Human readable kind, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Descriptor::MessageDescriptor(_) => "message",
            Descriptor::ServiceDescriptor(_) => "service",
            Descriptor::EnumDescriptor(_) => "enum",
        }
    }

    /// Returns the file in which the inner descriptor is declared.
    pub fn parent_file(&self) -> FileDescriptor {
        match self {
            Descriptor::MessageDescriptor(v) => v.parent_file(),
            Descriptor::ServiceDescriptor(v) => v.parent_file(),
            Descriptor::EnumDescriptor(v) => v.parent_file(),
        }
    }

    /// Returns the inner [`MessageDescriptor`] if this variant is `MessageDescriptor`.
    pub fn message_descriptor(&self) -> Option<&MessageDescriptor> {
        match self {
            Descriptor::MessageDescriptor(d) => Some(d),
            _ => None,
        }
    }

    /// Returns the inner [`ServiceDescriptor`] if this variant is `ServiceDescriptor`.
    pub fn service_descriptor(&self) -> Option<&ServiceDescriptor> {
        match self {
            Descriptor::ServiceDescriptor(d) => Some(d),
            _ => None,
        }
    }

    /// Returns the inner [`EnumDescriptor`] if this variant is `EnumDescriptor`.
    pub fn enum_descriptor(&self) -> Option<&EnumDescriptor> {
        match self {
            Descriptor::EnumDescriptor(d) => Some(d),
            _ => None,
        }
    }
}

/// Expands `roots` with their transitive imports, dependencies first.
///
/// Each file appears once, keyed by file name, so the result can be fed straight
/// into [`DescriptorPool::add_file_descriptor_protos`].
pub fn files_with_dependencies(roots: impl IntoIterator<Item = FileDescriptor>) -> Vec<FileDescriptor> {
    let mut ordered = Vec::new();
    let mut seen = HashSet::new();
    let mut stack: Vec<(FileDescriptor, bool)> = roots.into_iter().map(|f| (f, false)).collect();
    stack.reverse();

    while let Some((file, expanded)) = stack.pop() {
        if expanded {
            ordered.push(file);
            continue;
        }
        if !seen.insert(file.name().to_string()) {
            continue;
        }

        let dependencies: Vec<_> = file
            .dependencies()
            .filter(|dep| !seen.contains(dep.name()))
            .collect();

        stack.push((file, true));
        stack.extend(dependencies.into_iter().rev().map(|dep| (dep, false)));
    }

    ordered
}
