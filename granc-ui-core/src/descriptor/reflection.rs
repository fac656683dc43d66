//! # Reflection Descriptor Source
//!
//! Resolves symbols against a live server through the reflection protocol.
//!
//! Downloaded files are merged into a local `DescriptorPool`, so every symbol is fetched
//! at most once per source and later lookups are answered from the cache.
use super::{Descriptor, DescriptorSource, SourceError};
use crate::BoxError;
use crate::reflection::client::ReflectionClient;
use async_trait::async_trait;
use http_body::Body as HttpBody;
use prost_reflect::{DescriptorPool, ExtensionDescriptor};
use prost_types::FileDescriptorSet;
use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};
use tonic::client::GrpcService;
use tonic::transport::Channel;

/// A [`DescriptorSource`] backed by the server reflection service.
#[derive(Debug)]
pub struct ReflectionSource<S = Channel> {
    client: ReflectionClient<S>,
    pool: Mutex<DescriptorPool>,
}

impl<S> ReflectionSource<S>
where
    S: GrpcService<tonic::body::Body> + Clone + Send + Sync + 'static,
    S::Error: Into<BoxError>,
    S::Future: Send,
    S::ResponseBody: HttpBody<Data = tonic::codegen::Bytes> + Send + 'static,
    <S::ResponseBody as HttpBody>::Error: Into<BoxError> + Send,
{
    pub fn new(client: ReflectionClient<S>) -> Self {
        Self {
            client,
            pool: Mutex::new(DescriptorPool::new()),
        }
    }

    /// A snapshot of every file fetched so far.
    pub fn descriptor_pool(&self) -> DescriptorPool {
        self.pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn cached(&self, symbol: &str) -> Option<Descriptor> {
        let pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        Descriptor::from_pool(&pool, symbol)
    }

    fn merge(&self, fd_set: FileDescriptorSet) -> Result<(), SourceError> {
        let mut pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);

        let mut names = HashSet::new();
        let files: Vec<_> = fd_set
            .file
            .into_iter()
            .filter(|fd| {
                pool.get_file_by_name(fd.name()).is_none() && names.insert(fd.name().to_string())
            })
            .collect();

        if files.is_empty() {
            return Ok(());
        }

        // Add on a copy so a failing batch leaves the cache untouched.
        let mut updated = pool.clone();
        updated.add_file_descriptor_protos(files)?;
        *pool = updated;

        Ok(())
    }
}

#[async_trait]
impl<S> DescriptorSource for ReflectionSource<S>
where
    S: GrpcService<tonic::body::Body> + Clone + Send + Sync + 'static,
    S::Error: Into<BoxError>,
    S::Future: Send,
    S::ResponseBody: HttpBody<Data = tonic::codegen::Bytes> + Send + 'static,
    <S::ResponseBody as HttpBody>::Error: Into<BoxError> + Send,
{
    async fn list_services(&self) -> Result<Vec<String>, SourceError> {
        let mut client = self.client.clone();
        Ok(client.list_services().await?)
    }

    async fn find_symbol(&self, name: &str) -> Result<Descriptor, SourceError> {
        if let Some(descriptor) = self.cached(name) {
            return Ok(descriptor);
        }

        let mut client = self.client.clone();
        let fd_set = match client.file_descriptor_set_by_symbol(name).await {
            Ok(fd_set) => fd_set,
            Err(err) if err.is_not_found() => {
                return Err(SourceError::SymbolNotFound(name.to_string()));
            }
            Err(err) => return Err(err.into()),
        };

        self.merge(fd_set)?;

        self.cached(name)
            .ok_or_else(|| SourceError::SymbolNotFound(name.to_string()))
    }

    async fn all_extensions_for_type(
        &self,
        type_name: &str,
    ) -> Result<Vec<ExtensionDescriptor>, SourceError> {
        let mut client = self.client.clone();

        let numbers = match client.all_extension_numbers(type_name).await {
            Ok(numbers) => numbers,
            Err(err) if err.is_not_found() => {
                return Err(SourceError::SymbolNotFound(type_name.to_string()));
            }
            Err(err) => return Err(err.into()),
        };

        if numbers.is_empty() {
            return Ok(Vec::new());
        }

        // The extendee itself must be known before its extensions can be linked.
        self.find_symbol(type_name).await?;

        let known: HashSet<u32> = self
            .descriptor_pool()
            .get_message_by_name(type_name)
            .map(|message| message.extensions().map(|ext| ext.number()).collect())
            .unwrap_or_default();

        for number in &numbers {
            let Ok(unsigned) = u32::try_from(*number) else {
                continue;
            };
            if known.contains(&unsigned) {
                continue;
            }

            let fd_set = client
                .file_descriptor_set_by_extension(type_name, *number)
                .await?;
            self.merge(fd_set)?;
        }

        let wanted: HashSet<i32> = numbers.into_iter().collect();

        Ok(self
            .descriptor_pool()
            .get_message_by_name(type_name)
            .map(|message| {
                message
                    .extensions()
                    .filter(|ext| i32::try_from(ext.number()).is_ok_and(|n| wanted.contains(&n)))
                    .collect()
            })
            .unwrap_or_default())
    }
}
