//! Echo router: sends the payload straight back under the same id.

use async_trait::async_trait;
use tracing::debug;

use crate::runtime::{Request, Router};

pub const ECHO_MSG_ID: u32 = 2;

pub struct EchoRouter;

#[async_trait]
impl Router for EchoRouter {
    async fn handle(&self, request: &Request) {
        let conn = request.conn();
        if let Err(e) = conn.send_msg(request.msg_id(), request.data().clone()).await {
            debug!(conn_id = conn.conn_id(), error = %e, "Echo dropped");
        }
    }
}
