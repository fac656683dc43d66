//! # Metadata Conversion
//!
//! Converts between the ordered `{name, value}` pairs used by JSON envelopes and tonic's
//! `MetadataMap`.
//!
//! Keys ending in `-bin` carry binary values. Outgoing, their values are base64 text that is
//! decoded before sending; incoming, their raw bytes are rendered as standard base64.
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tonic::metadata::{
    Ascii, Binary, KeyAndValueRef, MetadataKey, MetadataMap, MetadataValue,
    errors::{InvalidMetadataKey, InvalidMetadataValue},
};

/// Transport headers that are never shown back to the caller.
const RESERVED_HEADERS: &[&str] = &[
    "content-type",
    "user-agent",
    "te",
    "grpc-status",
    "grpc-message",
    "grpc-status-details-bin",
    "grpc-encoding",
    "grpc-message-type",
    "grpc-timeout",
];

/// A single metadata pair, as it appears in request and response envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub name: String,
    pub value: String,
}

impl MetadataEntry {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("Invalid metadata (header) key '{key}': '{source}'")]
    InvalidKey {
        key: String,
        source: InvalidMetadataKey,
    },
    #[error("Invalid metadata (header) value for key '{key}': '{source}'")]
    InvalidValue {
        key: String,
        source: InvalidMetadataValue,
    },
    #[error("Invalid base64 value for binary metadata key '{key}': '{source}'")]
    InvalidBinaryValue {
        key: String,
        source: base64::DecodeError,
    },
}

/// Builds a `MetadataMap` from ordered pairs, keeping repeated names.
pub fn metadata_map<'a>(
    pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> Result<MetadataMap, MetadataError> {
    let mut map = MetadataMap::new();

    for (name, value) in pairs {
        let key = name.to_ascii_lowercase();

        if key.ends_with("-bin") {
            let bytes =
                decode_binary(value).map_err(|source| MetadataError::InvalidBinaryValue {
                    key: key.clone(),
                    source,
                })?;
            let name = MetadataKey::<Binary>::from_bytes(key.as_bytes())
                .map_err(|source| MetadataError::InvalidKey { key, source })?;
            map.append_bin(name, MetadataValue::from_bytes(&bytes));
        } else {
            let value = MetadataValue::<Ascii>::try_from(value).map_err(|source| {
                MetadataError::InvalidValue {
                    key: key.clone(),
                    source,
                }
            })?;
            let name = MetadataKey::<Ascii>::from_bytes(key.as_bytes())
                .map_err(|source| MetadataError::InvalidKey { key, source })?;
            map.append(name, value);
        }
    }

    Ok(map)
}

/// Metadata for an outgoing call: the caller's entries in order, with every name that also
/// appears in `extra` replaced by the `extra` values.
pub fn call_metadata(
    entries: &[MetadataEntry],
    extra: &[(String, String)],
) -> Result<MetadataMap, MetadataError> {
    let overridden: HashSet<String> = extra
        .iter()
        .map(|(name, _)| name.to_ascii_lowercase())
        .collect();

    let user = entries
        .iter()
        .filter(|entry| !overridden.contains(&entry.name.to_ascii_lowercase()))
        .map(|entry| (entry.name.as_str(), entry.value.as_str()));
    let configured = extra
        .iter()
        .map(|(name, value)| (name.as_str(), value.as_str()));

    metadata_map(user.chain(configured))
}

/// Renders received metadata as name-sorted pairs, without reserved transport headers.
pub fn metadata_entries(map: &MetadataMap) -> Vec<MetadataEntry> {
    let mut entries: Vec<MetadataEntry> = map
        .iter()
        .map(|kv| match kv {
            KeyAndValueRef::Ascii(key, value) => {
                let value = match value.to_str() {
                    Ok(text) => text.to_string(),
                    Err(_) => String::from_utf8_lossy(value.as_encoded_bytes()).into_owned(),
                };
                MetadataEntry::new(key.as_str(), value)
            }
            KeyAndValueRef::Binary(key, value) => {
                let value = match value.to_bytes() {
                    Ok(bytes) => STANDARD.encode(bytes),
                    Err(_) => String::from_utf8_lossy(value.as_encoded_bytes()).into_owned(),
                };
                MetadataEntry::new(key.as_str(), value)
            }
        })
        .filter(|entry| !RESERVED_HEADERS.contains(&entry.name.as_str()))
        .collect();

    // Stable, so repeated names keep their arrival order.
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    entries
}

fn decode_binary(value: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let mut last_error = None;

    for engine in [&STANDARD, &URL_SAFE, &STANDARD_NO_PAD, &URL_SAFE_NO_PAD] {
        match engine.decode(value) {
            Ok(bytes) => return Ok(bytes),
            Err(err) => last_error = Some(err),
        }
    }

    Err(last_error.unwrap_or(base64::DecodeError::InvalidPadding))
}
