//! Demo routers shipped with the `framewire` binary.
//!
//! ## Message ids
//! - `0` ping, answered with `1` pong
//! - `2` echo, answered with `2` and the same payload

pub mod echo;
pub mod ping;

pub use echo::{EchoRouter, ECHO_MSG_ID};
pub use ping::{PingRouter, PING_MSG_ID, PONG_MSG_ID};

use std::sync::Arc;

use crate::error::Result;
use crate::server::Server;

/// Register every demo router on `server`.
pub fn register_all(server: &Server) -> Result<()> {
    server.add_router(PING_MSG_ID, Arc::new(PingRouter))?;
    server.add_router(ECHO_MSG_ID, Arc::new(EchoRouter))?;
    Ok(())
}
