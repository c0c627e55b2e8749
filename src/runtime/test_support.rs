//! Shared fixtures for runtime tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use super::{ConnManager, ConnOwner, Connection, DispatchPolicy, MsgHandler, Request, Router};
use crate::config::Config;

/// Owner that counts lifecycle hook invocations.
#[derive(Default)]
pub struct RecordingOwner {
    manager: ConnManager,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl RecordingOwner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl ConnOwner for RecordingOwner {
    fn conn_manager(&self) -> &ConnManager {
        &self.manager
    }

    fn call_on_conn_start(&self, _conn: &Arc<Connection>) {
        self.starts.fetch_add(1, Ordering::SeqCst);
    }

    fn call_on_conn_stop(&self, _conn: &Arc<Connection>) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn config_with(f: impl FnOnce(&mut Config)) -> Config {
    let mut config = Config::default();
    f(&mut config);
    config
}

/// Accept one loopback connection, returning the server-side `Connection`
/// (direct dispatch, no routers) and the client socket.
pub async fn connection_pair(
    owner: &Arc<RecordingOwner>,
    conn_id: u32,
    config: &Config,
) -> (Arc<Connection>, TcpStream) {
    let handler = Arc::new(MsgHandler::with_policy(DispatchPolicy::Direct));
    connection_pair_with(owner, conn_id, handler, config).await
}

pub async fn connection_pair_with(
    owner: &Arc<RecordingOwner>,
    conn_id: u32,
    handler: Arc<MsgHandler>,
    config: &Config,
) -> (Arc<Connection>, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    let client = client.unwrap();
    let (server_side, _) = accepted.unwrap();

    let owner: Arc<dyn ConnOwner> = owner.clone();
    let conn = Connection::new(owner, server_side, conn_id, handler, config).unwrap();
    (conn, client)
}

/// Poll `cond` until it holds, panicking after `timeout`.
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Reports each hook invocation on a channel.
pub struct RecordingRouter {
    events: mpsc::UnboundedSender<String>,
}

impl RecordingRouter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Self { events }, rx)
    }
}

#[async_trait]
impl Router for RecordingRouter {
    async fn pre_handle(&self, request: &Request) {
        let _ = self.events.send(format!("pre:{}", request.msg_id()));
    }

    async fn handle(&self, request: &Request) {
        let _ = self.events.send(format!("handle:{}", request.msg_id()));
    }

    async fn post_handle(&self, request: &Request) {
        let _ = self.events.send(format!("post:{}", request.msg_id()));
    }
}

/// Sleeps in `handle` and tracks how many invocations overlap.
pub struct SlowRouter {
    delay: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    completed: AtomicUsize,
}

impl SlowRouter {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Router for SlowRouter {
    async fn handle(&self, _request: &Request) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
    }
}
