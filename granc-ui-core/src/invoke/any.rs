//! `google.protobuf.Any` resolution.
//!
//! A call starts from the pool its method was declared in, which may not know the types packed
//! into `Any` values. The [`AnyResolver`] keeps a private copy of that pool and grows it on demand
//! through the [`DescriptorSource`], so packed payloads can be read from JSON and rendered back
//! to JSON inline.
use super::InvokeError;
use super::envelope::ResponseMessage;
use crate::descriptor::{DescriptorSource, SourceError, files_with_dependencies};
use prost::Message;
use prost_reflect::{
    DescriptorError, DescriptorPool, DynamicMessage, FileDescriptor, ReflectMessage, SerializeOptions,
    Value,
};
use std::collections::BTreeSet;

const ANY_TYPE: &str = "google.protobuf.Any";

pub(crate) struct AnyResolver<'a> {
    source: &'a dyn DescriptorSource,
    pool: DescriptorPool,
}

impl<'a> AnyResolver<'a> {
    pub fn new(source: &'a dyn DescriptorSource, pool: DescriptorPool) -> Self {
        Self { source, pool }
    }

    pub fn pool(&self) -> &DescriptorPool {
        &self.pool
    }

    /// Makes the types named by `"@type"` keys in request payloads available.
    ///
    /// Failures are left for unmarshaling to report against the offending message.
    pub async fn prepare_request(&mut self, data: &[serde_json::Value]) {
        for type_url in request_type_urls(data) {
            if let Err(err) = self.ensure_type(type_name(&type_url)).await {
                tracing::debug!(type_url, error = %err, "could not resolve request Any type");
            }
        }
    }

    /// Renders a response message, expanding every `Any` it contains.
    pub async fn render_message(
        &mut self,
        message: DynamicMessage,
        options: &SerializeOptions,
    ) -> Result<ResponseMessage, InvokeError> {
        let message = self.resolve(message).await?;

        Ok(match to_json(&message, options) {
            Ok(json) => ResponseMessage::ok(json),
            Err(err) => ResponseMessage::error(err.to_string()),
        })
    }

    /// Renders a status detail as its JSON form with `"@type"` added.
    pub async fn render_detail(
        &mut self,
        detail: &prost_types::Any,
        options: &SerializeOptions,
    ) -> Result<ResponseMessage, InvokeError> {
        let name = type_name(&detail.type_url);
        self.ensure_type(name)
            .await
            .map_err(|source| InvokeError::AnyResolution {
                type_url: detail.type_url.clone(),
                source,
            })?;

        let descriptor = self
            .pool
            .get_message_by_name(name)
            .ok_or_else(|| InvokeError::MissingType(name.to_string()))?;

        let message = match DynamicMessage::decode(descriptor, detail.value.as_slice()) {
            Ok(message) => message,
            Err(err) => return Ok(ResponseMessage::error(err.to_string())),
        };
        let message = self.resolve(message).await?;

        let type_url = serde_json::Value::String(detail.type_url.clone());
        Ok(match to_json(&message, options) {
            Ok(serde_json::Value::Object(mut fields)) => {
                fields.insert("@type".to_string(), type_url);
                ResponseMessage::ok(serde_json::Value::Object(fields))
            }
            Ok(value) => ResponseMessage::ok(serde_json::json!({
                "@type": type_url,
                "value": value,
            })),
            Err(err) => ResponseMessage::error(err.to_string()),
        })
    }

    /// Moves `message` into the resolver's pool, fetching every packed type it references.
    async fn resolve(&mut self, message: DynamicMessage) -> Result<DynamicMessage, InvokeError> {
        let mut message = self.redecode(&message)?;

        loop {
            let missing = self.missing_types(&message);
            if missing.is_empty() {
                return Ok(message);
            }

            for type_url in missing {
                tracing::debug!(type_url, "resolving Any type through the descriptor source");
                self.ensure_type(type_name(&type_url))
                    .await
                    .map_err(|source| InvokeError::AnyResolution { type_url, source })?;
            }

            message = self.redecode(&message)?;
        }
    }

    fn redecode(&self, message: &DynamicMessage) -> Result<DynamicMessage, InvokeError> {
        let name = message.descriptor().full_name().to_string();
        let descriptor = self
            .pool
            .get_message_by_name(&name)
            .ok_or(InvokeError::MissingType(name))?;

        Ok(DynamicMessage::decode(
            descriptor,
            message.encode_to_vec().as_slice(),
        )?)
    }

    /// Type URLs packed anywhere inside `message` that the pool does not know yet.
    fn missing_types(&self, message: &DynamicMessage) -> BTreeSet<String> {
        let mut missing = BTreeSet::new();
        let mut stack = vec![message.clone()];

        while let Some(message) = stack.pop() {
            if message.descriptor().full_name() == ANY_TYPE {
                let Some((type_url, payload)) = any_parts(&message) else {
                    continue;
                };
                match self.pool.get_message_by_name(type_name(&type_url)) {
                    Some(descriptor) => {
                        if let Ok(inner) = DynamicMessage::decode(descriptor, payload.as_slice()) {
                            stack.push(inner);
                        }
                    }
                    None => {
                        missing.insert(type_url);
                    }
                }
                continue;
            }

            for (_, value) in message.fields() {
                push_messages(value, &mut stack);
            }
            for (_, value) in message.extensions() {
                push_messages(value, &mut stack);
            }
        }

        missing
    }

    /// Adds the file declaring `name`, its imports and the files of its extensions.
    async fn ensure_type(&mut self, name: &str) -> Result<(), SourceError> {
        if self.pool.get_message_by_name(name).is_some() {
            return Ok(());
        }

        let descriptor = self.source.find_symbol(name).await?;
        let mut roots = vec![descriptor.parent_file()];

        match self.source.all_extensions_for_type(name).await {
            Ok(extensions) => roots.extend(extensions.iter().map(|ext| ext.parent_file())),
            Err(err) => tracing::debug!(type_name = name, error = %err, "no extensions resolved"),
        }

        self.add_files(roots)?;

        if self.pool.get_message_by_name(name).is_none() {
            return Err(SourceError::SymbolNotFound(name.to_string()));
        }

        Ok(())
    }

    fn add_files(&mut self, roots: Vec<FileDescriptor>) -> Result<(), DescriptorError> {
        let files: Vec<_> = files_with_dependencies(roots)
            .into_iter()
            .filter(|file| self.pool.get_file_by_name(file.name()).is_none())
            .map(|file| file.file_descriptor_proto().clone())
            .collect();

        if files.is_empty() {
            return Ok(());
        }

        let mut pool = self.pool.clone();
        pool.add_file_descriptor_protos(files)?;
        self.pool = pool;

        Ok(())
    }
}

pub(crate) fn to_json(
    message: &DynamicMessage,
    options: &SerializeOptions,
) -> Result<serde_json::Value, serde_json::Error> {
    message.serialize_with_options(serde_json::value::Serializer, options)
}

/// The message name of a type URL such as `type.googleapis.com/pkg.Msg`.
fn type_name(type_url: &str) -> &str {
    type_url.rsplit('/').next().unwrap_or(type_url)
}

fn any_parts(message: &DynamicMessage) -> Option<(String, Vec<u8>)> {
    let type_url = message.get_field_by_name("type_url")?.as_str()?.to_string();
    if type_url.is_empty() {
        return None;
    }
    let payload = message.get_field_by_name("value")?.as_bytes()?.to_vec();
    Some((type_url, payload))
}

fn push_messages(value: &Value, stack: &mut Vec<DynamicMessage>) {
    match value {
        Value::Message(message) => stack.push(message.clone()),
        Value::List(items) => stack.extend(items.iter().filter_map(|v| v.as_message().cloned())),
        Value::Map(entries) => {
            stack.extend(entries.values().filter_map(|v| v.as_message().cloned()))
        }
        _ => {}
    }
}

/// Every `"@type"` string found in the request payloads.
fn request_type_urls(data: &[serde_json::Value]) -> BTreeSet<String> {
    let mut urls = BTreeSet::new();
    let mut stack: Vec<&serde_json::Value> = data.iter().collect();

    while let Some(value) = stack.pop() {
        match value {
            serde_json::Value::Object(fields) => {
                if let Some(serde_json::Value::String(url)) = fields.get("@type") {
                    urls.insert(url.clone());
                }
                stack.extend(fields.values());
            }
            serde_json::Value::Array(items) => stack.extend(items),
            _ => {}
        }
    }

    urls
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_type_name_strips_prefix() {
        assert_eq!(type_name("type.googleapis.com/echo.ErrorDetail"), "echo.ErrorDetail");
        assert_eq!(type_name("echo.ErrorDetail"), "echo.ErrorDetail");
    }

    #[test]
    fn test_request_type_urls_are_found_at_any_depth() {
        let data = vec![
            json!({"extra": {"@type": "type.googleapis.com/a.B", "x": 1}}),
            json!({"list": [{"nested": {"@type": "type.googleapis.com/c.D"}}]}),
            json!("not an object"),
        ];

        let urls: Vec<_> = request_type_urls(&data).into_iter().collect();

        assert_eq!(
            urls,
            vec!["type.googleapis.com/a.B", "type.googleapis.com/c.D"]
        );
    }
}
