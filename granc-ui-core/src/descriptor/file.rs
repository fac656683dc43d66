//! # Static Descriptor Source
//!
//! Resolves symbols from an in-memory `DescriptorPool`, loaded from encoded
//! `FileDescriptorSet`s (protosets) or compiled from `.proto` sources with `protox`.
use super::{Descriptor, DescriptorSource, SourceError};
use async_trait::async_trait;
use prost::Message;
use prost_reflect::{DescriptorError, DescriptorPool, ExtensionDescriptor};
use prost_types::FileDescriptorSet;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Errors that can occur while loading static descriptors.
#[derive(Debug, thiserror::Error)]
pub enum FileSourceError {
    #[error("Failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to decode protoset '{path}': {source}")]
    Decode {
        path: PathBuf,
        source: prost::DecodeError,
    },
    #[error("Failed to decode file descriptor set: '{0}'")]
    Descriptor(#[from] DescriptorError),
    #[error("Failed to compile proto sources: '{0}'")]
    Compile(#[from] protox::Error),
}

/// A [`DescriptorSource`] backed by a local `DescriptorPool`.
#[derive(Debug, Clone)]
pub struct FileDescriptorSource {
    pool: DescriptorPool,
}

impl FileDescriptorSource {
    pub fn new(pool: DescriptorPool) -> Self {
        Self { pool }
    }

    /// Builds a source from the bytes of an encoded `FileDescriptorSet`.
    pub fn from_bytes(file_descriptor_set: &[u8]) -> Result<Self, DescriptorError> {
        let pool = DescriptorPool::decode(file_descriptor_set)?;
        Ok(Self { pool })
    }

    /// Loads and merges several protoset files.
    ///
    /// Files present in more than one set are only added once.
    pub fn from_protosets(paths: &[PathBuf]) -> Result<Self, FileSourceError> {
        let mut pool = DescriptorPool::new();

        for path in paths {
            let bytes = std::fs::read(path).map_err(|source| FileSourceError::Io {
                path: path.clone(),
                source,
            })?;
            let fd_set = FileDescriptorSet::decode(bytes.as_slice()).map_err(|source| {
                FileSourceError::Decode {
                    path: path.clone(),
                    source,
                }
            })?;

            let mut names = HashSet::new();
            let files: Vec<_> = fd_set
                .file
                .into_iter()
                .filter(|fd| {
                    let name = fd.name();
                    pool.get_file_by_name(name).is_none() && names.insert(name.to_string())
                })
                .collect();

            pool.add_file_descriptor_protos(files)?;
        }

        Ok(Self { pool })
    }

    /// Compiles `.proto` sources, resolving imports against `import_paths`.
    ///
    /// Without import paths, each file's own directory is used as an import root.
    pub fn from_proto_files(
        files: &[PathBuf],
        import_paths: &[PathBuf],
    ) -> Result<Self, FileSourceError> {
        let includes: Vec<PathBuf> = if import_paths.is_empty() {
            let mut dirs = Vec::new();
            for file in files {
                let dir = file
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .unwrap_or(Path::new("."))
                    .to_path_buf();
                if !dirs.contains(&dir) {
                    dirs.push(dir);
                }
            }
            dirs
        } else {
            import_paths.to_vec()
        };

        let fd_set = protox::compile(files, includes)?;
        let pool = DescriptorPool::from_file_descriptor_set(fd_set)?;

        Ok(Self { pool })
    }

    pub fn descriptor_pool(&self) -> &DescriptorPool {
        &self.pool
    }
}

#[async_trait]
impl DescriptorSource for FileDescriptorSource {
    async fn list_services(&self) -> Result<Vec<String>, SourceError> {
        Ok(self
            .pool
            .services()
            .map(|s| s.full_name().to_string())
            .collect())
    }

    async fn find_symbol(&self, name: &str) -> Result<Descriptor, SourceError> {
        Descriptor::from_pool(&self.pool, name)
            .ok_or_else(|| SourceError::SymbolNotFound(name.to_string()))
    }

    async fn all_extensions_for_type(
        &self,
        type_name: &str,
    ) -> Result<Vec<ExtensionDescriptor>, SourceError> {
        Ok(self
            .pool
            .get_message_by_name(type_name)
            .map(|message| message.extensions().collect())
            .unwrap_or_default())
    }
}
