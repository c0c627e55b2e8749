//! framewire: demo server built on the framewire runtime.
//!
//! Serves the ping and echo routers from `framewire::handlers`.

use framewire::config::Config;
use framewire::server::Server;
use framewire::{handlers, Connection};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        name = %config.name,
        listen = %config.listen,
        max_conn = config.max_conn,
        max_package_size = config.max_package_size,
        worker_pool_size = config.worker_pool_size,
        "Starting framewire server"
    );

    let server = Server::new(config);
    handlers::register_all(&server)?;
    server.set_on_conn_start(on_conn_start);
    server.set_on_conn_stop(on_conn_stop);

    let serving = Arc::clone(&server);
    let mut accept_loop = tokio::spawn(async move { serving.run().await });

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutdown signal received");
            server.stop();
            accept_loop.await??;
        }
        finished = &mut accept_loop => {
            if let Err(e) = finished? {
                error!(error = %e, "Server failed");
                return Err(e.into());
            }
        }
    }

    Ok(())
}

fn on_conn_start(conn: &Arc<Connection>) {
    conn.set_property("peer", conn.remote_addr().to_string());
    info!(conn_id = conn.conn_id(), peer = %conn.remote_addr(), "Client connected");
}

fn on_conn_stop(conn: &Arc<Connection>) {
    let peer = conn
        .get_property_as::<String>("peer")
        .map(|p| p.to_string())
        .unwrap_or_default();
    info!(conn_id = conn.conn_id(), peer = %peer, "Client disconnected");
}
