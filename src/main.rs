//! resume-drive server binary.
//!
//! Resumable, offset-addressed uploads into a confined storage root. The
//! upload engine owns session state on disk; this entry point wires it into
//! an Axum router and starts the HTTP (and optionally HTTPS) listeners.

mod atomic;
mod background;
mod chunk;
mod config;
mod engine;
mod error;
mod files;
mod http;
mod locking;
mod logging;
mod session;
mod storage;
mod tls;
mod tree;
mod upload;
mod version;

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::{get, post, put};
use axum::{Router, middleware};
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span};

use crate::background::spawn_background_tasks;
use crate::config::{Args, UploadConfig};
use crate::engine::UploadEngine;
use crate::http::{build_cors_layer, resolve_client_ip};
use crate::storage::Storage;

shadow!(build);

/// Starts the server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let storage = Storage::new(PathBuf::from(&args.storage_dir), &args.state_dir)?;
    let upload_config = UploadConfig::from_args(&args);
    info!(
        root = ?storage.root_path(),
        state_dir = storage.state_dir_name(),
        max_chunk_bytes = upload_config.max_chunk_bytes,
        max_file_bytes = upload_config.max_file_bytes,
        persist_threshold = upload_config.persist_threshold,
        "storage configured"
    );
    let engine = Arc::new(UploadEngine::new(storage, upload_config).await?);
    let app = build_router(engine.clone(), args.cors_origins.as_deref());

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let http_addr = SocketAddr::new(host, args.http_port);
    let https_addr = SocketAddr::new(host, args.https_port);
    let tls_config = tls::load_rustls_config(&args).await?;
    let handle = Handle::new();

    spawn_background_tasks(engine);

    info!("Starting HTTP server at {}", http_addr);
    let http_server = axum_server::bind(http_addr)
        .handle(handle.clone())
        .serve(
            app.clone()
                .into_make_service_with_connect_info::<SocketAddr>(),
        );

    match tls_config {
        Some(tls_config) => {
            info!("Starting HTTPS server at {}", https_addr);
            let https_server = axum_server::bind_rustls(https_addr, tls_config)
                .handle(handle.clone())
                .serve(app.into_make_service_with_connect_info::<SocketAddr>());
            tokio::select! {
                result = http_server => result?,
                result = https_server => result?,
                _ = shutdown_signal(handle) => {}
            }
        }
        None => {
            tokio::select! {
                result = http_server => result?,
                _ = shutdown_signal(handle) => {}
            }
        }
    }

    Ok(())
}

fn build_router(engine: Arc<UploadEngine>, cors_origins: Option<&str>) -> Router {
    Router::new()
        .route("/healthz", get(files::health))
        .route("/api/version", get(version::get_version_info))
        .route("/api/v1/storage/tree", get(files::storage_tree))
        .route("/api/v1/uploads/init", post(upload::init_upload))
        .route("/api/v1/uploads/status", get(upload::upload_status))
        .route(
            "/api/v1/uploads/chunk",
            put(upload::upload_chunk).layer(DefaultBodyLimit::disable()),
        )
        .route("/api/v1/uploads/complete", post(upload::complete_upload))
        .route(
            "/api/v1/uploads/cancel",
            post(upload::cancel_upload).delete(upload::cancel_upload),
        )
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(middleware::from_fn(http::propagate_request_id))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.ip());
                    let client_ip = resolve_client_ip(request.headers(), connect_ip)
                        .map(|ip| ip.to_string())
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(engine))
        .layer(build_cors_layer(cors_origins))
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal, shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
