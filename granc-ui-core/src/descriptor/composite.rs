//! # Composite Descriptor Source
//!
//! Combines a reflection source with a static one. Reflection is authoritative; the static
//! source only fills the gaps when reflection cannot answer.
use super::{Descriptor, DescriptorSource, SourceError};
use async_trait::async_trait;
use prost_reflect::ExtensionDescriptor;
use std::collections::HashSet;

/// A [`DescriptorSource`] that asks `reflection` first and falls back to `file`.
#[derive(Debug, Clone)]
pub struct CompositeSource<R, F> {
    reflection: R,
    file: F,
}

impl<R, F> CompositeSource<R, F>
where
    R: DescriptorSource,
    F: DescriptorSource,
{
    pub fn new(reflection: R, file: F) -> Self {
        Self { reflection, file }
    }
}

#[async_trait]
impl<R, F> DescriptorSource for CompositeSource<R, F>
where
    R: DescriptorSource,
    F: DescriptorSource,
{
    /// Services are listed from reflection only.
    async fn list_services(&self) -> Result<Vec<String>, SourceError> {
        self.reflection.list_services().await
    }

    async fn find_symbol(&self, name: &str) -> Result<Descriptor, SourceError> {
        match self.reflection.find_symbol(name).await {
            Ok(descriptor) => Ok(descriptor),
            Err(err) => {
                tracing::debug!(symbol = name, error = %err, "reflection lookup failed, trying static descriptors");
                self.file.find_symbol(name).await
            }
        }
    }

    /// Reflection results come first. Static extensions are appended when their field
    /// number is not already taken.
    async fn all_extensions_for_type(
        &self,
        type_name: &str,
    ) -> Result<Vec<ExtensionDescriptor>, SourceError> {
        let mut extensions = match self.reflection.all_extensions_for_type(type_name).await {
            Ok(extensions) => extensions,
            Err(err) => {
                tracing::debug!(type_name, error = %err, "reflection extension lookup failed, trying static descriptors");
                return self.file.all_extensions_for_type(type_name).await;
            }
        };

        let static_extensions = match self.file.all_extensions_for_type(type_name).await {
            Ok(found) => found,
            Err(err) => {
                tracing::debug!(type_name, error = %err, "static extension lookup failed");
                return Ok(extensions);
            }
        };

        let mut numbers: HashSet<u32> = extensions.iter().map(|ext| ext.number()).collect();
        for ext in static_extensions {
            if numbers.insert(ext.number()) {
                extensions.push(ext);
            }
        }

        Ok(extensions)
    }
}
