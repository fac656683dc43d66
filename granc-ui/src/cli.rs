//! # CLI
//!
//! This module defines the command-line interface of `granc-ui` using `clap`.
//!
//! It is responsible for parsing user input and performing validation (e.g., ensuring headers are
//! `name: value`, that some descriptor source is available, and that `${VAR}` references resolve).
use clap::{ArgAction, Parser};
use granc_ui_core::invoke::timeout_from_secs;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Reflection is disabled and no --protoset or --proto was given")]
    NoDescriptorSource,
    #[error("Header '{0}' references undefined environment variable '{1}'")]
    UndefinedVariable(String, String),
    #[error("Header '{0}' has an unterminated '${{' reference")]
    UnterminatedVariable(String),
}

#[derive(Parser, Debug)]
#[command(name = "granc-ui", version, about = "JSON web bridge to a gRPC server")]
pub struct Cli {
    /// The server to connect to (e.g. http://localhost:50051 or localhost:50051)
    pub target: String,

    /// Header sent on RPCs and reflection requests ("name: value")
    #[arg(short = 'H', long = "header", value_parser = parse_header)]
    pub headers: Vec<(String, String)>,

    /// Header sent on RPCs only
    #[arg(long = "rpc-header", value_parser = parse_header)]
    pub rpc_headers: Vec<(String, String)>,

    /// Header sent on reflection requests only
    #[arg(long = "reflect-header", value_parser = parse_header)]
    pub reflect_headers: Vec<(String, String)>,

    /// Header offered as a form default, never sent automatically
    #[arg(long = "default-header", value_parser = parse_header)]
    pub default_headers: Vec<(String, String)>,

    /// Incoming HTTP request header copied into RPC metadata
    #[arg(long = "preserve-header")]
    pub preserve_headers: Vec<String>,

    /// Expand ${NAME} environment references in header flags
    #[arg(long)]
    pub expand_headers: bool,

    /// Encoded FileDescriptorSet file
    #[arg(long = "protoset", conflicts_with = "protos")]
    pub protosets: Vec<PathBuf>,

    /// Proto source file, compiled at startup
    #[arg(long = "proto")]
    pub protos: Vec<PathBuf>,

    /// Import root for --proto
    #[arg(long = "import-path")]
    pub import_paths: Vec<PathBuf>,

    /// Use server reflection. Defaults to true unless --protoset or --proto is given
    #[arg(long, action = ArgAction::Set)]
    pub use_reflection: Option<bool>,

    /// Service to expose (repeatable). Without --service/--method everything is exposed
    #[arg(long = "service")]
    pub services: Vec<String>,

    /// Method to expose, as pkg.Service.Method or pkg.Service/Method (repeatable)
    #[arg(long = "method")]
    pub methods: Vec<String>,

    /// Upper bound for every invocation, in seconds
    #[arg(long)]
    pub max_time: Option<f64>,

    /// Dial timeout, in seconds
    #[arg(long, default_value_t = 10.0)]
    pub connect_timeout: f64,

    /// Fail on the first dial error instead of retrying
    #[arg(long, action = ArgAction::Set, default_value_t = true)]
    pub connect_fail_fast: bool,

    /// HTTP/2 keepalive interval, in seconds
    #[arg(long)]
    pub keepalive_time: Option<f64>,

    /// Maximum size of a decoded response message, in bytes
    #[arg(long)]
    pub max_msg_sz: Option<usize>,

    /// Value of the :authority pseudo-header
    #[arg(long)]
    pub authority: Option<String>,

    /// Render default-valued fields in responses
    #[arg(long, action = ArgAction::Set, default_value_t = true)]
    pub emit_defaults: bool,

    /// Leave reflection service types out of the "*" schema
    #[arg(long)]
    pub hide_reflection_types: bool,

    /// Address to bind the HTTP server to
    #[arg(long, default_value = "127.0.0.1")]
    pub bind: IpAddr,

    /// Port to listen on. 0 picks a free port
    #[arg(long, default_value_t = 0)]
    pub port: u16,

    /// Path prefix for every route (e.g. /grpc)
    #[arg(long, value_parser = parse_base_path, default_value = "/")]
    pub base_path: String,

    /// Verbosity (-v debug, -vv trace). RUST_LOG takes precedence
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

/// Header flags after `${NAME}` expansion, grouped by destination.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderSets {
    pub rpc: Vec<(String, String)>,
    pub reflection: Vec<(String, String)>,
    pub defaults: Vec<(String, String)>,
}

impl Cli {
    pub fn use_reflection(&self) -> bool {
        self.use_reflection
            .unwrap_or(self.protosets.is_empty() && self.protos.is_empty())
    }

    pub fn max_time(&self) -> Option<Duration> {
        self.max_time.and_then(timeout_from_secs)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        timeout_from_secs(self.connect_timeout)
    }

    pub fn keepalive_time(&self) -> Option<Duration> {
        self.keepalive_time.and_then(timeout_from_secs)
    }

    pub fn validate(&self) -> Result<(), CliError> {
        if !self.use_reflection() && self.protosets.is_empty() && self.protos.is_empty() {
            return Err(CliError::NoDescriptorSource);
        }
        Ok(())
    }

    /// Groups the header flags, expanding environment references when requested.
    pub fn header_sets(&self) -> Result<HeaderSets, CliError> {
        self.header_sets_with(|name| std::env::var(name).ok())
    }

    fn header_sets_with(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<HeaderSets, CliError> {
        let expand = |headers: &[(String, String)]| -> Result<Vec<(String, String)>, CliError> {
            if self.expand_headers {
                expand_headers(headers, &lookup)
            } else {
                Ok(headers.to_vec())
            }
        };

        let shared = expand(&self.headers)?;

        let mut rpc = shared.clone();
        rpc.extend(expand(&self.rpc_headers)?);

        let mut reflection = shared;
        reflection.extend(expand(&self.reflect_headers)?);

        Ok(HeaderSets {
            rpc,
            reflection,
            defaults: expand(&self.default_headers)?,
        })
    }
}

fn parse_header(s: &str) -> Result<(String, String), String> {
    s.split_once(':')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| "Format must be 'name: value'".to_string())
}

fn parse_base_path(value: &str) -> Result<String, String> {
    if !value.starts_with('/') {
        return Err(format!("Base path '{value}' must start with '/'"));
    }

    let trimmed = value.trim_end_matches('/');
    Ok(if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    })
}

/// Replaces every `${NAME}` in header names and values with the variable's value.
pub fn expand_headers(
    headers: &[(String, String)],
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<Vec<(String, String)>, CliError> {
    headers
        .iter()
        .map(|(name, value)| {
            let header = format!("{name}: {value}");
            Ok((
                expand_env(name, &header, lookup)?,
                expand_env(value, &header, lookup)?,
            ))
        })
        .collect()
}

fn expand_env(
    text: &str,
    header: &str,
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<String, CliError> {
    let mut expanded = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("${") {
        expanded.push_str(&rest[..start]);

        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| CliError::UnterminatedVariable(header.to_string()))?;
        let name = &after[..end];

        let value = lookup(name)
            .ok_or_else(|| CliError::UndefinedVariable(header.to_string(), name.to_string()))?;
        expanded.push_str(&value);

        rest = &after[end + 1..];
    }

    expanded.push_str(rest);
    Ok(expanded)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("granc-ui").chain(args.iter().copied()))
            .expect("Failed to parse arguments")
    }

    fn lookup(name: &str) -> Option<String> {
        match name {
            "TOKEN" => Some("s3cr3t".to_string()),
            "TENANT" => Some("acme".to_string()),
            _ => None,
        }
    }

    #[test]
    fn test_header_parsing() {
        assert_eq!(
            parse_header("Authorization:  Bearer x:y "),
            Ok(("Authorization".to_string(), "Bearer x:y".to_string()))
        );
        assert!(parse_header("no-colon").is_err());
        assert!(parse_header(": value").is_err());
    }

    #[test]
    fn test_seconds_are_clamped() {
        let cli = parse(&[
            "localhost:50051",
            "--max-time",
            "1.5",
            "--connect-timeout",
            "0",
            "--keepalive-time",
            "1e300",
        ]);

        assert_eq!(cli.max_time(), Some(Duration::from_millis(1500)));
        assert_eq!(cli.connect_timeout(), None);
        assert_eq!(cli.keepalive_time(), Some(Duration::MAX));

        let cli = parse(&["localhost:50051", "--max-time=-3"]);
        assert_eq!(cli.max_time(), None);

        assert!(Cli::try_parse_from(["granc-ui", "localhost:50051", "--max-time", "soon"]).is_err());
    }

    #[test]
    fn test_base_path_parsing() {
        assert_eq!(parse_base_path("/"), Ok("/".to_string()));
        assert_eq!(parse_base_path("/grpc/"), Ok("/grpc".to_string()));
        assert!(parse_base_path("grpc").is_err());
    }

    #[test]
    fn test_defaults() {
        let cli = parse(&["localhost:50051"]);

        assert!(cli.use_reflection());
        assert!(cli.connect_fail_fast);
        assert!(cli.emit_defaults);
        assert_eq!(cli.connect_timeout(), Some(Duration::from_secs(10)));
        assert_eq!(cli.max_time(), None);
        assert_eq!(cli.port, 0);
        assert_eq!(cli.base_path, "/");
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_static_sources_disable_reflection_by_default() {
        let cli = parse(&["localhost:50051", "--protoset", "a.protoset"]);
        assert!(!cli.use_reflection());
        assert!(cli.validate().is_ok());

        let cli = parse(&[
            "localhost:50051",
            "--proto",
            "a.proto",
            "--use-reflection",
            "true",
        ]);
        assert!(cli.use_reflection());
    }

    #[test]
    fn test_some_source_is_required() {
        let cli = parse(&["localhost:50051", "--use-reflection", "false"]);
        assert!(matches!(cli.validate(), Err(CliError::NoDescriptorSource)));
    }

    #[test]
    fn test_protoset_and_proto_conflict() {
        let result = Cli::try_parse_from([
            "granc-ui",
            "localhost:50051",
            "--protoset",
            "a.protoset",
            "--proto",
            "a.proto",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_header_sets_are_grouped() {
        let cli = parse(&[
            "localhost:50051",
            "-H",
            "x-shared: 1",
            "--rpc-header",
            "x-rpc: 2",
            "--reflect-header",
            "x-reflect: 3",
            "--default-header",
            "x-default: 4",
        ]);

        let sets = cli.header_sets_with(lookup).unwrap();

        let pair = |n: &str, v: &str| (n.to_string(), v.to_string());
        assert_eq!(sets.rpc, vec![pair("x-shared", "1"), pair("x-rpc", "2")]);
        assert_eq!(
            sets.reflection,
            vec![pair("x-shared", "1"), pair("x-reflect", "3")]
        );
        assert_eq!(sets.defaults, vec![pair("x-default", "4")]);
    }

    #[test]
    fn test_headers_are_expanded_only_when_requested() {
        let args = ["localhost:50051", "-H", "authorization: Bearer ${TOKEN}"];

        let raw = parse(&args).header_sets_with(lookup).unwrap();
        assert_eq!(raw.rpc[0].1, "Bearer ${TOKEN}");

        let mut expanded_args = args.to_vec();
        expanded_args.push("--expand-headers");
        let expanded = parse(&expanded_args).header_sets_with(lookup).unwrap();
        assert_eq!(expanded.rpc[0].1, "Bearer s3cr3t");
    }

    #[test]
    fn test_expansion_errors() {
        let headers = vec![("x-${TENANT}".to_string(), "${TOKEN}-${MISSING}".to_string())];
        assert!(matches!(
            expand_headers(&headers, &lookup),
            Err(CliError::UndefinedVariable(_, name)) if name == "MISSING"
        ));

        let headers = vec![("x-tenant".to_string(), "${TENANT".to_string())];
        assert!(matches!(
            expand_headers(&headers, &lookup),
            Err(CliError::UnterminatedVariable(_))
        ));

        let headers = vec![("x-${TENANT}".to_string(), "${TOKEN}!".to_string())];
        assert_eq!(
            expand_headers(&headers, &lookup).unwrap(),
            vec![("x-acme".to_string(), "s3cr3t!".to_string())]
        );
    }
}
