//! TCP server: accepts sockets and turns each into a running `Connection`.
//!
//! The server owns the connection registry and the message handler, hands
//! out connection ids, enforces the connection limit and runs the
//! application's start/stop hooks.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::runtime::{ConnManager, ConnOwner, Connection, MsgHandler, Router};

/// Listen backlog for the accept socket
const LISTEN_BACKLOG: i32 = 1024;

/// Application callback run on connection start or stop.
pub type ConnHook = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;

/// Server instance
pub struct Server {
    config: Config,
    conn_mgr: ConnManager,
    msg_handler: Arc<MsgHandler>,
    on_conn_start: RwLock<Option<ConnHook>>,
    on_conn_stop: RwLock<Option<ConnHook>>,
    next_conn_id: AtomicU32,
    shutdown: CancellationToken,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Arc<Self> {
        let msg_handler = Arc::new(MsgHandler::new(&config));

        Arc::new(Server {
            config,
            conn_mgr: ConnManager::new(),
            msg_handler,
            on_conn_start: RwLock::new(None),
            on_conn_stop: RwLock::new(None),
            next_conn_id: AtomicU32::new(0),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn msg_handler(&self) -> &Arc<MsgHandler> {
        &self.msg_handler
    }

    /// Bind a router to a message id.
    pub fn add_router(&self, msg_id: u32, router: Arc<dyn Router>) -> Result<()> {
        self.msg_handler.add_router(msg_id, router)
    }

    pub fn set_on_conn_start<F>(&self, hook: F)
    where
        F: Fn(&Arc<Connection>) + Send + Sync + 'static,
    {
        *self.on_conn_start.write().unwrap_or_else(|p| p.into_inner()) = Some(Arc::new(hook));
    }

    pub fn set_on_conn_stop<F>(&self, hook: F)
    where
        F: Fn(&Arc<Connection>) + Send + Sync + 'static,
    {
        *self.on_conn_stop.write().unwrap_or_else(|p| p.into_inner()) = Some(Arc::new(hook));
    }

    /// Create the listening socket for `config.listen`.
    pub fn bind(&self) -> Result<TcpListener> {
        let addr: SocketAddr = self
            .config
            .listen
            .parse()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

        let listener = create_listener(addr)?;
        Ok(TcpListener::from_std(listener)?)
    }

    /// Bind and serve until [`Server::stop`] is called.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let listener = self.bind()?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until [`Server::stop`] is called.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> Result<()> {
        self.msg_handler.start_worker_pool();

        info!(
            name = %self.config.name,
            address = %listener.local_addr()?,
            max_conn = self.config.max_conn,
            "Server listening"
        );

        loop {
            let (stream, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        continue;
                    }
                },
            };

            if self.conn_mgr.len() >= self.config.max_conn {
                warn!(
                    peer = %peer,
                    max_conn = self.config.max_conn,
                    "Too many connections, rejecting"
                );
                drop(stream);
                continue;
            }

            if let Err(e) = stream.set_nodelay(true) {
                debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
            }

            let conn_id = self.next_conn_id();
            let owner: Arc<dyn ConnOwner> = self.clone();

            match Connection::new(
                owner,
                stream,
                conn_id,
                Arc::clone(&self.msg_handler),
                &self.config,
            ) {
                Ok(conn) => conn.start(),
                Err(e) => warn!(peer = %peer, error = %e, "Failed to set up connection"),
            }
        }

        info!(name = %self.config.name, "Server stopped accepting");
        Ok(())
    }

    /// Stop accepting, stop every connection and the worker pool.
    pub fn stop(&self) {
        info!(name = %self.config.name, "Stopping server");
        self.shutdown.cancel();
        self.conn_mgr.clear_conn();
        self.msg_handler.stop_worker_pool();
    }

    /// Next free connection id. The counter wraps, so ids still held by
    /// live connections are skipped.
    fn next_conn_id(&self) -> u32 {
        loop {
            let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
            if !self.conn_mgr.contains(conn_id) {
                return conn_id;
            }
        }
    }

    fn hook(slot: &RwLock<Option<ConnHook>>) -> Option<ConnHook> {
        slot.read().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl ConnOwner for Server {
    fn conn_manager(&self) -> &ConnManager {
        &self.conn_mgr
    }

    fn call_on_conn_start(&self, conn: &Arc<Connection>) {
        if let Some(hook) = Self::hook(&self.on_conn_start) {
            debug!(conn_id = conn.conn_id(), "Calling OnConnStart");
            hook(conn);
        }
    }

    fn call_on_conn_stop(&self, conn: &Arc<Connection>) {
        if let Some(hook) = Self::hook(&self.on_conn_stop) {
            debug!(conn_id = conn.conn_id(), "Calling OnConnStop");
            hook(conn);
        }
    }
}

fn create_listener(addr: SocketAddr) -> std::io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}
