//! Flow handlers
//!
//! A handler receives one [`Stream`] per admitted flow and owns it for the
//! lifetime of the flow. Dropping the stream closes the flow.

use std::future::Future;

use async_trait::async_trait;

use crate::stream::Stream;

/// Result returned by handlers. Errors are logged with the flow key.
pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Caller-supplied flow handler
#[async_trait]
pub trait FlowHandler: Send + Sync + 'static {
    async fn handle_tcp(&self, stream: Stream) -> HandlerResult;

    async fn handle_udp(&self, stream: Stream) -> HandlerResult;
}

/// Handler built from two closures
pub struct FnHandler<T, U> {
    on_tcp: T,
    on_udp: U,
}

/// Build a handler from separate TCP and UDP closures.
pub fn handler_fn<T, TFut, U, UFut>(on_tcp: T, on_udp: U) -> FnHandler<T, U>
where
    T: Fn(Stream) -> TFut + Send + Sync + 'static,
    TFut: Future<Output = HandlerResult> + Send + 'static,
    U: Fn(Stream) -> UFut + Send + Sync + 'static,
    UFut: Future<Output = HandlerResult> + Send + 'static,
{
    FnHandler { on_tcp, on_udp }
}

#[async_trait]
impl<T, TFut, U, UFut> FlowHandler for FnHandler<T, U>
where
    T: Fn(Stream) -> TFut + Send + Sync + 'static,
    TFut: Future<Output = HandlerResult> + Send + 'static,
    U: Fn(Stream) -> UFut + Send + Sync + 'static,
    UFut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle_tcp(&self, stream: Stream) -> HandlerResult {
        (self.on_tcp)(stream).await
    }

    async fn handle_udp(&self, stream: Stream) -> HandlerResult {
        (self.on_udp)(stream).await
    }
}
