//! # Granc UI Entry Point
//!
//! The main executable of the web bridge. This file drives the application lifecycle:
//!
//! 1. **Initialization**: Parses command-line arguments using [`cli::Cli`] and sets up logging.
//! 2. **Connection**: Dials the target server via `granc_ui_core::connect`.
//! 3. **Discovery**: Builds the descriptor source, resolves the exposed methods and computes
//!    the schema of every known type.
//! 4. **Serving**: Runs the HTTP surface of [`server`] until interrupted.
mod cli;
mod server;

use anyhow::Context;
use clap::Parser;
use cli::Cli;
use granc_ui_core::connect::{self, ConnectOptions, RetryPolicy};
use granc_ui_core::descriptor::{
    CompositeSource, DescriptorSource, FileDescriptorSource, ReflectionSource, all_files,
};
use granc_ui_core::grpc::client::GrpcClient;
use granc_ui_core::grpc::metadata::{MetadataEntry, metadata_map};
use granc_ui_core::invoke::InvocationBridge;
use granc_ui_core::methods::{ExposureConfig, resolve_methods};
use granc_ui_core::reflection::client::ReflectionClient;
use granc_ui_core::schema::{ReflectionTypes, schema_for_all_types};
use granc_ui_core::tonic::transport::Channel;
use server::AppState;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    init_tracing(args.verbose);

    args.validate()?;
    let headers = args.header_sets()?;

    let options = ConnectOptions {
        connect_timeout: args.connect_timeout(),
        keepalive: args.keepalive_time(),
        authority: args.authority.clone(),
    };
    let endpoint = connect::endpoint(&args.target, &options)?;
    let channel = connect::connect(&endpoint, args.connect_fail_fast, &RetryPolicy::default())
        .await
        .context("failed to dial the target server")?;

    let source = descriptor_source(&args, channel.clone(), &headers.reflection)?;

    let exposure = ExposureConfig::from_names(args.services.as_slice(), args.methods.as_slice())?;
    let methods = resolve_methods(source.as_ref(), &exposure).await?;
    if methods.is_empty() {
        tracing::warn!("the server exposes no methods");
    }

    let files = all_files(source.as_ref())
        .await
        .context("failed to load the descriptors of the exposed services")?;
    let policy = if args.hide_reflection_types {
        ReflectionTypes::Exclude
    } else {
        ReflectionTypes::Include
    };

    let mut client = GrpcClient::new(channel);
    if let Some(limit) = args.max_msg_sz {
        client = client.max_decoding_message_size(limit);
    }

    let shutdown = CancellationToken::new();
    let state = AppState {
        target: endpoint.uri().to_string(),
        methods: server::method_table(methods),
        default_metadata: headers
            .defaults
            .into_iter()
            .map(|(name, value)| MetadataEntry::new(name, value))
            .collect(),
        all_types: schema_for_all_types(&files, policy),
        bridge: InvocationBridge::new(source).emit_defaults(args.emit_defaults),
        client,
        rpc_metadata: headers.rpc,
        preserve_headers: args
            .preserve_headers
            .iter()
            .map(|name| name.to_ascii_lowercase())
            .collect(),
        max_time: args.max_time(),
        shutdown: shutdown.clone(),
    };

    let app = server::router(Arc::new(state), &args.base_path);
    let listener = tokio::net::TcpListener::bind((args.bind, args.port))
        .await
        .context("failed to bind the HTTP listener")?;
    let addr = listener.local_addr()?;

    println!("gRPC UI available at http://{addr}{}", args.base_path);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    Ok(())
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();
}

/// Reflection, static descriptors, or both, as selected on the command line.
fn descriptor_source(
    args: &Cli,
    channel: Channel,
    reflection_headers: &[(String, String)],
) -> anyhow::Result<Arc<dyn DescriptorSource>> {
    let file = if !args.protosets.is_empty() {
        Some(FileDescriptorSource::from_protosets(&args.protosets)?)
    } else if !args.protos.is_empty() {
        Some(FileDescriptorSource::from_proto_files(
            &args.protos,
            &args.import_paths,
        )?)
    } else {
        None
    };

    let reflection = if args.use_reflection() {
        let metadata = metadata_map(
            reflection_headers
                .iter()
                .map(|(name, value)| (name.as_str(), value.as_str())),
        )?;
        Some(ReflectionSource::new(
            ReflectionClient::new(channel).with_metadata(metadata),
        ))
    } else {
        None
    };

    let source: Arc<dyn DescriptorSource> = match (reflection, file) {
        (Some(reflection), Some(file)) => Arc::new(CompositeSource::new(reflection, file)),
        (Some(reflection), None) => Arc::new(reflection),
        (None, Some(file)) => Arc::new(file),
        (None, None) => anyhow::bail!(cli::CliError::NoDescriptorSource),
    };

    Ok(source)
}

/// Resolves on Ctrl-C, cancelling every call in flight.
async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
    shutdown.cancel();
}
