//! Inbound request: a decoded message bound to the connection it arrived on.

use bytes::Bytes;
use std::sync::Arc;

use super::Connection;
use crate::protocol::Message;

/// One inbound message paired with a handle to its connection.
///
/// The handle lets a router reply through [`Connection::send_msg`] or use
/// the connection's properties; the socket itself stays owned by the
/// connection.
#[derive(Debug, Clone)]
pub struct Request {
    conn: Arc<Connection>,
    msg: Message,
}

impl Request {
    pub fn new(conn: Arc<Connection>, msg: Message) -> Self {
        Self { conn, msg }
    }

    /// Connection the message arrived on.
    pub fn conn(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn msg(&self) -> &Message {
        &self.msg
    }

    pub fn msg_id(&self) -> u32 {
        self.msg.id()
    }

    pub fn data(&self) -> &Bytes {
        self.msg.data()
    }
}
