//! The deployment-hosting part of rueckenmark.
//!
//! A rueckenmark server sits on the machine that has the deployments
//! installed, starts deployment processes when a remote client asks for
//! them, and announces their deaths back to every connected client. The
//! client half lives in [`client`] and drives a server over TCP.

#![recursion_limit = "2048"] // select! needs a higher recursion limit /:

use anyhow::{Context, Result};
use name_service::{MemoryNameService, NameService};
use slog::o;
use std::net::SocketAddr;
use std::sync::Arc;

mod registry;

pub mod catalog;
pub mod client;
pub mod configuration;
pub mod log_dir;
pub mod name_service;
pub mod process;
pub mod protocol;
pub mod reaper;
pub mod remote_process;
pub mod server;

/// Starts the process server on the configured address and serves until
/// interrupted.
///
/// This function only returns once the server got a SIGINT/SIGTERM or
/// hit an unrecoverable error; either way, all processes it started are
/// stopped by the time it does.
pub async fn run(settings: configuration::Config) -> Result<()> {
    let addr = SocketAddr::new(settings.server.bind, settings.server.port);
    let _g = slog_scope::set_global_logger(
        slog_scope::logger().new(o!("service" => "process_server", "addr" => addr.to_string())),
    );

    let catalog = catalog::Catalog::from_config(&settings)
        .context("loading the deployment catalog")?;
    let names: Arc<dyn NameService> = Arc::new(MemoryNameService::new());
    let server = server::ProcessServer::bind(
        &addr,
        catalog,
        names,
        settings.spawn.options(),
        settings.server.shutdown_grace,
    )?;
    server.exec().await
}
