//! framewire: connection and wire-protocol core for TCP application servers.
//!
//! Peers exchange length-prefixed binary frames (see [`protocol`]). For every
//! accepted socket the runtime:
//! - decodes frames into [`runtime::Request`]s
//! - dispatches them to application [`runtime::Router`]s, either on an ad-hoc
//!   task per request or through a bounded worker pool
//! - writes replies queued with [`runtime::Connection::send_msg`]
//!
//! Configuration via CLI arguments or TOML file, see [`config`].

pub mod config;
pub mod error;
pub mod handlers;
pub mod protocol;
pub mod runtime;
pub mod server;

pub use config::Config;
pub use error::{Error, Result};
pub use protocol::{DataPack, Message};
pub use runtime::{Connection, MsgHandler, Request, Router};
pub use server::Server;
