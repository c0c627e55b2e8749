//! Application handler trait.

use async_trait::async_trait;

use super::Request;

/// Business logic bound to one message id.
///
/// The three hooks run in order for every request routed here. Only
/// `handle` is required.
#[async_trait]
pub trait Router: Send + Sync + 'static {
    /// Runs before `handle`.
    async fn pre_handle(&self, _request: &Request) {}

    /// Main handler.
    async fn handle(&self, request: &Request);

    /// Runs after `handle`.
    async fn post_handle(&self, _request: &Request) {}
}
