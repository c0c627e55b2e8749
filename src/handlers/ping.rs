//! Ping router for health checks and latency measurement.
//!
//! ```text
//! Request:  id=0 body=""       Response: id=1 body="pong"
//! Request:  id=0 body="hello"  Response: id=1 body="pong hello"
//! ```

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tracing::debug;

use crate::runtime::{Request, Router};

pub const PING_MSG_ID: u32 = 0;
pub const PONG_MSG_ID: u32 = 1;

pub struct PingRouter;

/// Build the pong payload for a ping body.
pub fn pong_body(ping: &[u8]) -> BytesMut {
    let mut body = BytesMut::with_capacity(5 + ping.len());
    body.put_slice(b"pong");
    if !ping.is_empty() {
        body.put_u8(b' ');
        body.put_slice(ping);
    }
    body
}

#[async_trait]
impl Router for PingRouter {
    async fn handle(&self, request: &Request) {
        let body = pong_body(request.data());
        if let Err(e) = request.conn().send_msg(PONG_MSG_ID, body.freeze()).await {
            debug!(conn_id = request.conn().conn_id(), error = %e, "Pong dropped");
        }
    }
}
