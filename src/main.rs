//! keepalive-echo: an HTTP echo server
//!
//! - `GET` requests are answered with `hello {User-Agent}\n`
//! - every other method gets its request body echoed back
//!
//! Features:
//! - HTTP/1.1 keep-alive with a configurable idle timeout
//! - Bounded time to receive request headers
//! - Chunked and gzip-encoded request bodies
//! - Configuration via CLI arguments or TOML file

mod body;
mod config;
mod gzip;
mod handler;
mod protocol;
mod server;

use config::Config;
use server::Server;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn main() -> Result<(), BoxError> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    log_startup(&config);

    let runtime = match config.workers {
        Some(workers) if workers > 1 => tokio::runtime::Builder::new_multi_thread()
            .worker_threads(workers)
            .enable_all()
            .build()?,
        _ => tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?,
    };

    runtime.block_on(run(config))
}

/// The bound address is logged once, by `Server::bind`.
fn log_startup(config: &Config) {
    info!(
        keep_alive_timeout_ms = config.keep_alive_timeout.as_millis() as u64,
        headers_timeout_ms = config.headers_timeout.as_millis() as u64,
        echo = ?config.echo_policy,
        workers = ?config.workers,
        "Starting keepalive-echo server"
    );
}

/// Bind, serve until Ctrl-C, then return.
async fn run(config: Config) -> Result<(), BoxError> {
    let listen = config.listen.clone();
    let server = match Server::bind(config) {
        Ok(server) => server,
        Err(e) => {
            error!(address = %listen, error = %e, "Failed to bind listener");
            return Err(e.into());
        }
    };

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            shutdown.stop();
        }
    });

    server.run().await
}
