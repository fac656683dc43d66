//! # Method Enumeration
//!
//! Decides which methods are exposed: either every method of every service (minus the
//! reflection service itself), or the subset named by an [`ExposureConfig`]. Every configured
//! name is validated against the source, and all unknown names are reported together.
use crate::descriptor::{DescriptorSource, SourceError};
use prost_reflect::MethodDescriptor;
use std::collections::{BTreeMap, BTreeSet};

/// The server reflection services, never exposed unless configured explicitly.
pub const REFLECTION_SERVICES: &[&str] = &[
    "grpc.reflection.v1.ServerReflection",
    "grpc.reflection.v1alpha.ServerReflection",
];

#[derive(Debug, thiserror::Error)]
pub enum MethodsError {
    #[error("Invalid method name '{0}', expected 'package.Service.Method' or 'package.Service/Method'")]
    InvalidMethodName(String),
    #[error("Failed to list services: '{0}'")]
    Source(#[from] SourceError),
    #[error("'{name}' should be a service but is a {kind}")]
    NotAService { name: String, kind: &'static str },
    #[error("{}", not_found_message(.services, .methods))]
    NotFound {
        services: Vec<String>,
        methods: Vec<String>,
    },
}

fn not_found_message(services: &[String], methods: &[String]) -> String {
    let mut parts = Vec::new();
    if !services.is_empty() {
        parts.push(format!(
            "configured services not found: {}",
            services.join(", ")
        ));
    }
    if !methods.is_empty() {
        parts.push(format!("configured methods not found: {}", methods.join(", ")));
    }
    parts.join("; ")
}

/// Splits `pkg.Service.Method` or `pkg.Service/Method` at the last separator.
pub fn split_method_name(name: &str) -> Option<(&str, &str)> {
    let index = name.rfind(['.', '/'])?;
    let (service, method) = (&name[..index], &name[index + 1..]);

    if service.is_empty() || method.is_empty() {
        None
    } else {
        Some((service, method))
    }
}

#[derive(Debug, Clone, Default)]
struct ServiceSelection {
    whole_service: bool,
    methods: BTreeSet<String>,
}

/// The services and methods selected for exposure. Empty means "everything".
#[derive(Debug, Clone, Default)]
pub struct ExposureConfig {
    services: BTreeMap<String, ServiceSelection>,
}

impl ExposureConfig {
    pub fn from_names(
        services: &[impl AsRef<str>],
        methods: &[impl AsRef<str>],
    ) -> Result<Self, MethodsError> {
        let mut config = Self::default();

        for service in services {
            config
                .services
                .entry(service.as_ref().to_string())
                .or_default()
                .whole_service = true;
        }

        for method in methods {
            let method = method.as_ref();
            let (service, name) = split_method_name(method)
                .ok_or_else(|| MethodsError::InvalidMethodName(method.to_string()))?;

            config
                .services
                .entry(service.to_string())
                .or_default()
                .methods
                .insert(name.to_string());
        }

        Ok(config)
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

/// Resolves `config` against the services listed by `source`.
pub async fn resolve_methods(
    source: &dyn DescriptorSource,
    config: &ExposureConfig,
) -> Result<Vec<MethodDescriptor>, MethodsError> {
    let available: BTreeSet<String> = source.list_services().await?.into_iter().collect();
    let mut exposed = Vec::new();

    if config.is_empty() {
        for name in &available {
            if REFLECTION_SERVICES.contains(&name.as_str()) {
                continue;
            }
            let service = find_service(source, name).await?;
            exposed.extend(service.methods());
        }
        return Ok(exposed);
    }

    let mut missing_services = Vec::new();
    let mut missing_methods = Vec::new();

    for (name, selection) in &config.services {
        if !available.contains(name) {
            missing_services.push(name.clone());
            continue;
        }

        let service = find_service(source, name).await?;
        let mut wanted = selection.methods.clone();

        for method in service.methods() {
            let named = wanted.remove(method.name());
            if named && selection.whole_service {
                tracing::warn!(
                    service = %name,
                    method = method.name(),
                    "service already exposed, selecting the method is unnecessary"
                );
            }
            if named || selection.whole_service {
                exposed.push(method);
            }
        }

        missing_methods.extend(wanted.into_iter().map(|method| format!("{name}/{method}")));
    }

    if !missing_services.is_empty() || !missing_methods.is_empty() {
        missing_services.sort();
        missing_methods.sort();
        return Err(MethodsError::NotFound {
            services: missing_services,
            methods: missing_methods,
        });
    }

    Ok(exposed)
}

async fn find_service(
    source: &dyn DescriptorSource,
    name: &str,
) -> Result<prost_reflect::ServiceDescriptor, MethodsError> {
    let descriptor = source.find_symbol(name).await?;

    descriptor
        .service_descriptor()
        .cloned()
        .ok_or_else(|| MethodsError::NotAService {
            name: name.to_string(),
            kind: descriptor.kind(),
        })
}
