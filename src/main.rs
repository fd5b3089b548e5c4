//! goup server binary.
//!
//! Serves a directory as browsable HTML listings, streams files with
//! conditional GET support and accepts multipart uploads. The same router is
//! exposed either on a plain HTTP listener or as a FastCGI responder.

mod config;
mod error;
mod etag;
mod fastcgi;
mod files;
mod http;
mod listing;
mod logging;
mod routes;
mod sort;
mod storage;
mod upload;

use clap::Parser;
use shadow_rs::shadow;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

use crate::config::{Args, Mode, UPLOAD_ENV};
use crate::fastcgi::Listener;

shadow!(build);

/// Starts the server in the configured transport mode and runs until it fails.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    logging::init_logging(args.verbose);

    let upload_env = std::env::var(UPLOAD_ENV).ok();
    let config = Arc::new(args.server_config(upload_env.as_deref()));
    info!(
        mode = %args.mode,
        addr = %args.addr,
        dir = %config.root.display(),
        upload = config.upload_enabled,
        verbose = args.verbose,
        "settings"
    );

    let mode = args.mode.parse::<Mode>().inspect_err(|err| error!("{err}"))?;
    let app = http::with_tracing(routes::build_router(config));

    match mode {
        Mode::Http => {
            info!("Starting HTTP server at {}", args.addr);
            axum_server::bind(args.addr)
                .serve(app.into_make_service_with_connect_info::<SocketAddr>())
                .await
                .inspect_err(|err| error!(addr = %args.addr, error = %err, "http server failed"))?;
        }
        Mode::Fcgi => {
            let listener = Listener::from_stdin()
                .inspect_err(|err| error!(error = %err, "cannot take over FastCGI socket"))?;
            fastcgi::serve(listener, app).await?;
        }
    }

    Ok(())
}
