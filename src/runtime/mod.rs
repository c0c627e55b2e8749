//! Per-connection runtime.
//!
//! - `Connection`: socket ownership, reader/writer tasks, lifecycle
//! - `ConnManager`: registry of live connections
//! - `MsgHandler`: router table and dispatch policy
//! - `PropertyStore`: per-connection typed key/value bag

mod conn_manager;
mod connection;
mod msg_handler;
mod property;
mod request;
mod router;

pub use conn_manager::ConnManager;
pub use connection::{ConnOwner, ConnState, Connection};
pub use msg_handler::{DispatchPolicy, MsgHandler};
pub use property::{Property, PropertyStore};
pub use request::Request;
pub use router::Router;

#[cfg(test)]
pub(crate) mod test_support;
