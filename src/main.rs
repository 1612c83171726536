//! filegate server binary.
//!
//! Accepts file uploads guarded by a shared secret and an upload rate limit,
//! stores them under generated names in a single flat directory, and serves
//! listing, download and deletion behind HTTP Basic credentials.

mod atomic;
mod auth;
mod background;
mod config;
mod error;
mod files;
mod frontend;
mod http;
mod logging;
mod rate_limit;
mod routes;
mod sanitize;
mod storage;
mod upload;

use axum::Router;
use axum::extract::connect_info::ConnectInfo;
use axum::http::Request;
use axum_server::Handle;
use clap::Parser;
use std::io::{Error as IoError, ErrorKind};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span};

use crate::auth::{AccessGate, Credentials};
use crate::background::spawn_background_tasks;
use crate::config::Args;
use crate::http::forwarded_ip;
use crate::rate_limit::{RateLimiter, parse_policy};
use crate::storage::Storage;
use crate::upload::UploadPolicy;

/// Starts the filegate server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), IoError> {
    dotenvy::dotenv().ok();
    logging::init_logging();

    let args = Args::parse();
    args.validate()
        .map_err(|msg| IoError::new(ErrorKind::InvalidInput, msg))?;

    let storage = Arc::new(Storage::new(PathBuf::from(&args.storage_dir)));
    storage.ensure_root().await?;

    let tiers = parse_policy(&args.upload_rate_limit)
        .map_err(|err| IoError::new(ErrorKind::InvalidInput, err.to_string()))?;
    let (user, pass) = (args.auth_user.clone(), args.auth_pass.clone());
    let credentials = tokio::task::spawn_blocking(move || Credentials::hash_plain([(user, pass)]))
        .await
        .map_err(|err| IoError::other(err.to_string()))?
        .map_err(|err| IoError::other(err.to_string()))?;
    let gate = Arc::new(AccessGate::new(
        credentials,
        args.api_key.clone(),
        RateLimiter::new(tiers, args.upload_rate_scope),
    ));
    let policy = Arc::new(UploadPolicy::new(args.max_file_size));

    spawn_background_tasks(
        storage.clone(),
        gate.clone(),
        Duration::from_secs(args.staging_ttl_secs),
    );

    let app = routes::build_router(storage.clone(), gate, policy).layer(
        TraceLayer::new_for_http()
            .make_span_with(|request: &Request<_>| {
                let connect_ip = request
                    .extensions()
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|ConnectInfo(addr)| addr.ip());
                let client_ip = forwarded_ip(request.headers())
                    .or(connect_ip)
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
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    );

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| IoError::new(ErrorKind::InvalidInput, err.to_string()))?;
    let addr = SocketAddr::new(host, args.port);
    let handle = Handle::new();

    info!(
        %addr,
        storage = %storage.root_path().display(),
        max_file_size = args.max_file_size,
        rate_limit = args.upload_rate_limit,
        "starting server"
    );

    tokio::spawn(shutdown_signal(handle.clone()));
    serve(addr, app, handle).await?;

    info!("server stopped");
    Ok(())
}

/// Serves until `handle` shuts down; returns only after in-flight requests drain.
async fn serve(addr: SocketAddr, app: Router, handle: Handle) -> Result<(), IoError> {
    axum_server::bind(addr)
        .handle(handle)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
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

    info!("received termination signal, shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
