//! Connection lifecycle for one accepted TCP socket.
//!
//! A connection moves through `Created -> Running -> Stopping -> Stopped`.
//! While running it owns two tasks:
//! - the reader decodes frames and hands each request to the [`MsgHandler`]
//! - the writer drains the outbound channel onto the socket
//!
//! Both tasks watch a single shutdown token. Stop cancels it, and each task
//! drops its half of the socket on the way out, so the socket is closed
//! exactly once however many times stop is called.

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::property::{Property, PropertyStore};
use super::{ConnManager, MsgHandler, Request};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::protocol::{DataPack, Message};

/// The side that accepted a connection and tracks its lifetime.
///
/// Every method is invoked synchronously from the connection's lifecycle
/// transitions.
pub trait ConnOwner: Send + Sync + 'static {
    /// Registry the connection adds itself to on creation and leaves on stop.
    fn conn_manager(&self) -> &ConnManager;

    /// Called once, right after the reader and writer are spawned.
    fn call_on_conn_start(&self, conn: &Arc<Connection>);

    /// Called before the connection tears down.
    ///
    /// Deduplicated: however many times `stop` is called, concurrently or
    /// not, only the call that claims the stop runs this hook.
    fn call_on_conn_stop(&self, conn: &Arc<Connection>);
}

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    /// Constructed and registered, loops not started yet.
    Created = 0,
    /// Reader and writer are running.
    Running = 1,
    /// Stop has been claimed; the stop hook is running.
    Stopping = 2,
    /// Terminal.
    Stopped = 3,
}

impl ConnState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnState::Created,
            1 => ConnState::Running,
            2 => ConnState::Stopping,
            _ => ConnState::Stopped,
        }
    }
}

/// One live TCP session.
pub struct Connection {
    conn_id: u32,
    remote_addr: SocketAddr,
    /// Socket until `start` splits it between the two loops.
    socket: Mutex<Option<TcpStream>>,
    owner: Arc<dyn ConnOwner>,
    msg_handler: Arc<MsgHandler>,
    datapack: DataPack,
    state: AtomicU8,
    /// Pre-encoded frames waiting for the writer.
    msg_tx: mpsc::Sender<Bytes>,
    /// Receiving end until `start` hands it to the writer.
    msg_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    shutdown: CancellationToken,
    properties: PropertyStore,
}

impl Connection {
    /// Wrap an accepted socket and register it with the owner's registry.
    pub fn new(
        owner: Arc<dyn ConnOwner>,
        stream: TcpStream,
        conn_id: u32,
        msg_handler: Arc<MsgHandler>,
        config: &Config,
    ) -> Result<Arc<Self>> {
        let remote_addr = stream.peer_addr()?;
        let (msg_tx, msg_rx) = mpsc::channel(config.max_msg_chan_len.max(1));

        let conn = Arc::new(Self {
            conn_id,
            remote_addr,
            socket: Mutex::new(Some(stream)),
            owner,
            msg_handler,
            datapack: DataPack::new(config.max_package_size),
            state: AtomicU8::new(ConnState::Created as u8),
            msg_tx,
            msg_rx: Mutex::new(Some(msg_rx)),
            shutdown: CancellationToken::new(),
            properties: PropertyStore::new(),
        });

        conn.owner.conn_manager().add(Arc::clone(&conn));
        debug!(conn_id, peer = %remote_addr, "Connection created");

        Ok(conn)
    }

    /// Spawn the reader and writer, then fire the start hook.
    pub fn start(self: &Arc<Self>) {
        if let Err(state) = self.transition(ConnState::Created, ConnState::Running) {
            warn!(conn_id = self.conn_id, ?state, "Connection cannot be started");
            return;
        }

        let stream = self
            .socket
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        let msg_rx = self
            .msg_rx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();

        let (Some(stream), Some(msg_rx)) = (stream, msg_rx) else {
            // A concurrent stop already released the socket
            return;
        };

        info!(conn_id = self.conn_id, peer = %self.remote_addr, "Connection started");

        let (reader, writer) = stream.into_split();
        tokio::spawn(Arc::clone(self).start_reader(reader));
        tokio::spawn(Arc::clone(self).start_writer(writer, msg_rx));

        self.owner.call_on_conn_start(self);
    }

    /// Tear the connection down. Only the first call has any effect.
    pub fn stop(self: &Arc<Self>) {
        let claimed = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                match ConnState::from_u8(state) {
                    ConnState::Created | ConnState::Running => Some(ConnState::Stopping as u8),
                    ConnState::Stopping | ConnState::Stopped => None,
                }
            });
        if claimed.is_err() {
            trace!(conn_id = self.conn_id, "Connection already stopped");
            return;
        }

        self.owner.call_on_conn_stop(self);

        self.state.store(ConnState::Stopped as u8, Ordering::Release);
        self.shutdown.cancel();
        self.owner.conn_manager().remove_conn(self);

        // Never-started connections still hold the socket and the receiver
        drop(
            self.socket
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .take(),
        );
        drop(
            self.msg_rx
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .take(),
        );

        info!(conn_id = self.conn_id, peer = %self.remote_addr, "Connection stopped");
    }

    /// Queue a message for the writer.
    ///
    /// Waits while the outbound channel is full, but returns
    /// [`Error::ConnectionClosed`] as soon as the connection stops.
    pub async fn send_msg(&self, msg_id: u32, data: impl Into<Bytes>) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed(self.conn_id));
        }

        let msg = Message::new(msg_id, data);
        let frame = self.datapack.pack(&msg).inspect_err(|e| {
            warn!(conn_id = self.conn_id, msg_id, error = %e, "Failed to pack message");
        })?;

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(Error::ConnectionClosed(self.conn_id)),
            sent = self.msg_tx.send(frame) => {
                sent.map_err(|_| Error::ConnectionClosed(self.conn_id))
            }
        }
    }

    pub fn conn_id(&self) -> u32 {
        self.conn_id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// True once stop has completed its state change.
    pub fn is_closed(&self) -> bool {
        self.state() == ConnState::Stopped
    }

    pub fn set_property<T>(&self, key: impl Into<String>, value: T)
    where
        T: std::any::Any + Send + Sync,
    {
        self.properties.set(key, value);
    }

    pub fn get_property(&self, key: &str) -> Result<Property> {
        self.properties.get(key)
    }

    /// Typed lookup; fails with [`Error::PropertyType`] on a type mismatch.
    pub fn get_property_as<T>(&self, key: &str) -> Result<Arc<T>>
    where
        T: std::any::Any + Send + Sync,
    {
        self.properties.get_as(key)
    }

    pub fn del_property(&self, key: &str) {
        self.properties.remove(key);
    }

    fn transition(&self, from: ConnState, to: ConnState) -> std::result::Result<(), ConnState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(ConnState::from_u8)
    }

    async fn start_reader(self: Arc<Self>, mut reader: OwnedReadHalf) {
        debug!(conn_id = self.conn_id, "Reader started");

        loop {
            let msg = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                read = self.datapack.read_message(&mut reader) => match read {
                    Ok(msg) => msg,
                    Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                        debug!(conn_id = self.conn_id, "Peer closed the connection");
                        break;
                    }
                    Err(e) => {
                        warn!(conn_id = self.conn_id, error = %e, "Read failed");
                        break;
                    }
                },
            };

            trace!(conn_id = self.conn_id, msg_id = msg.id(), len = msg.len(), "Frame received");

            let request = Request::new(Arc::clone(&self), msg);

            // Pooled dispatch applies backpressure here; stop must still win
            let dispatched = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                dispatched = self.msg_handler.dispatch(request) => dispatched,
            };
            if let Err(e) = dispatched {
                warn!(conn_id = self.conn_id, error = %e, "Dispatch failed");
                break;
            }
        }

        drop(reader);
        debug!(conn_id = self.conn_id, "Reader exited");
        self.stop();
    }

    async fn start_writer<W>(self: Arc<Self>, mut writer: W, mut msg_rx: mpsc::Receiver<Bytes>)
    where
        W: AsyncWrite + Unpin,
    {
        debug!(conn_id = self.conn_id, "Writer started");

        loop {
            let frame = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                frame = msg_rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            // A peer that stops reading must not keep the socket alive past stop
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                written = writer.write_all(&frame) => {
                    if let Err(e) = written {
                        warn!(conn_id = self.conn_id, error = %e, "Write failed, frame dropped");
                    }
                }
            }
        }

        // Frames still queued are abandoned
        debug!(conn_id = self.conn_id, "Writer exited");
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("conn_id", &self.conn_id)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::EchoRouter;
    use crate::runtime::test_support::{
        config_with, connection_pair, connection_pair_with, wait_until, RecordingOwner,
    };
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_new_registers_in_manager() {
        let owner = RecordingOwner::new();
        let (conn, _client) = connection_pair(&owner, 7, &Config::default()).await;

        assert_eq!(conn.conn_id(), 7);
        assert_eq!(conn.state(), ConnState::Created);
        assert_eq!(owner.conn_manager().len(), 1);
        assert!(owner.conn_manager().get(7).is_ok());
    }

    #[tokio::test]
    async fn test_start_fires_hook_once() {
        let owner = RecordingOwner::new();
        let (conn, _client) = connection_pair(&owner, 1, &Config::default()).await;

        conn.start();
        conn.start();

        assert_eq!(conn.state(), ConnState::Running);
        assert_eq!(owner.starts(), 1);
        conn.stop();
    }

    #[tokio::test]
    async fn test_send_writes_frames_in_order() {
        let owner = RecordingOwner::new();
        let config = Config::default();
        let (conn, mut client) = connection_pair(&owner, 1, &config).await;
        conn.start();

        for i in 0..3u32 {
            conn.send_msg(i, format!("frame-{i}").into_bytes())
                .await
                .unwrap();
        }

        let dp = DataPack::new(config.max_package_size);
        for i in 0..3u32 {
            let msg = dp.read_message(&mut client).await.unwrap();
            assert_eq!(msg.id(), i);
            assert_eq!(&msg.data()[..], format!("frame-{i}").as_bytes());
        }
        conn.stop();
    }

    #[tokio::test]
    async fn test_inbound_frame_reaches_router() {
        let owner = RecordingOwner::new();
        let config = config_with(|c| c.worker_pool_size = 0);
        let handler = Arc::new(MsgHandler::new(&config));
        handler.add_router(5, Arc::new(EchoRouter)).unwrap();

        let (conn, mut client) = connection_pair_with(&owner, 1, handler, &config).await;
        conn.start();

        let dp = DataPack::new(config.max_package_size);
        let frame = dp.pack(&Message::new(5, &b"ping"[..])).unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut client, &frame)
            .await
            .unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(2), dp.read_message(&mut client))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.id(), 5);
        assert_eq!(&reply.data()[..], b"ping");
        conn.stop();
    }

    #[tokio::test]
    async fn test_concurrent_stop_is_idempotent() {
        let owner = RecordingOwner::new();
        let (conn, mut client) = connection_pair(&owner, 3, &Config::default()).await;
        conn.start();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let conn = Arc::clone(&conn);
            handles.push(tokio::spawn(async move { conn.stop() }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(owner.stops(), 1);
        assert!(owner.conn_manager().is_empty());
        assert!(conn.is_closed());

        // The peer sees the socket close
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_stop_releases_writer_stalled_on_peer() {
        let owner = RecordingOwner::new();
        let (conn, _client) = connection_pair(&owner, 6, &Config::default()).await;
        conn.start();

        // The client never reads, so the socket buffers fill and the writer stalls
        for _ in 0..4 {
            conn.send_msg(1, vec![0u8; 8 * 1024 * 1024]).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        conn.stop();

        // Both loops exit and drop their handles, releasing the socket
        wait_until(Duration::from_secs(2), || Arc::strong_count(&conn) == 1).await;
        assert_eq!(owner.stops(), 1);
    }

    #[tokio::test]
    async fn test_failed_write_keeps_connection_open() {
        let owner = RecordingOwner::new();
        let config = Config::default();
        let (conn, _client) = connection_pair(&owner, 8, &config).await;

        let dp = DataPack::new(config.max_package_size);
        let second = dp.pack(&Message::new(2, &b"second"[..])).unwrap();
        let third = dp.pack(&Message::new(3, &b"third"[..])).unwrap();

        let writer = tokio_test::io::Builder::new()
            .write_error(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "reset by peer",
            ))
            .write(&second)
            .write(&third)
            .build();
        let msg_rx = conn.msg_rx.lock().unwrap().take().unwrap();

        let driver = async {
            conn.send_msg(1, &b"first"[..]).await.unwrap();
            conn.send_msg(2, &b"second"[..]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;

            // The first frame was lost, the connection carries on
            assert!(!conn.is_closed());
            assert_eq!(owner.stops(), 0);
            conn.send_msg(3, &b"third"[..]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;

            conn.stop();
        };

        tokio::join!(Arc::clone(&conn).start_writer(writer, msg_rx), driver);
        assert_eq!(owner.stops(), 1);
    }

    #[tokio::test]
    async fn test_send_after_stop_fails_fast() {
        let owner = RecordingOwner::new();
        let (conn, _client) = connection_pair(&owner, 1, &Config::default()).await;
        conn.start();
        conn.stop();

        for _ in 0..3 {
            let sent = tokio::time::timeout(Duration::from_millis(200), conn.send_msg(1, vec![1u8]))
                .await
                .expect("send must not block after stop");
            assert!(matches!(sent, Err(Error::ConnectionClosed(1))));
        }
    }

    #[tokio::test]
    async fn test_blocked_send_released_by_stop() {
        let owner = RecordingOwner::new();
        let config = config_with(|c| c.max_msg_chan_len = 1);
        // Not started: nothing drains the channel
        let (conn, _client) = connection_pair(&owner, 1, &config).await;

        conn.send_msg(1, vec![0u8]).await.unwrap();
        let pending =
            tokio::time::timeout(Duration::from_millis(100), conn.send_msg(1, vec![0u8])).await;
        assert!(pending.is_err(), "second send should wait for room");

        let blocked = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.send_msg(1, vec![0u8]).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        conn.stop();

        let result = tokio::time::timeout(Duration::from_secs(2), blocked)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::ConnectionClosed(1))));
    }

    #[tokio::test]
    async fn test_peer_close_mid_header_stops_once() {
        let owner = RecordingOwner::new();
        let (conn, mut client) = connection_pair(&owner, 9, &Config::default()).await;
        conn.start();

        tokio::io::AsyncWriteExt::write_all(&mut client, &[0x00, 0x00, 0x00])
            .await
            .unwrap();
        drop(client);

        wait_until(Duration::from_secs(2), || owner.conn_manager().is_empty()).await;
        assert!(conn.is_closed());
        assert_eq!(owner.stops(), 1);
    }

    #[tokio::test]
    async fn test_oversized_frame_closes_connection() {
        let owner = RecordingOwner::new();
        let config = config_with(|c| c.max_package_size = 8);
        let (conn, mut client) = connection_pair(&owner, 2, &config).await;
        conn.start();

        // Declares 1 MiB; no body follows
        let head = [0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01];
        tokio::io::AsyncWriteExt::write_all(&mut client, &head)
            .await
            .unwrap();

        wait_until(Duration::from_secs(2), || conn.is_closed()).await;
        assert_eq!(owner.stops(), 1);

        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let owner = RecordingOwner::new();
        let (conn, _client) = connection_pair(&owner, 4, &Config::default()).await;

        conn.stop();
        conn.start();

        assert_eq!(conn.state(), ConnState::Stopped);
        assert_eq!(owner.starts(), 0);
        assert_eq!(owner.stops(), 1);
    }

    #[tokio::test]
    async fn test_connection_properties() {
        let owner = RecordingOwner::new();
        let (conn, _client) = connection_pair(&owner, 1, &Config::default()).await;

        conn.set_property("k", "v");
        assert_eq!(*conn.get_property_as::<&str>("k").unwrap(), "v");
        assert!(conn.get_property("k").is_ok());

        conn.del_property("k");
        assert!(matches!(
            conn.get_property("k"),
            Err(Error::PropertyNotFound(_))
        ));
    }
}
