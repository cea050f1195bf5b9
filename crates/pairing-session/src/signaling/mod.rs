//! Bidirectional message channel to the relay.
//!
//! [`WebSocketChannel`] talks JSON over a real socket; [`LocalRelay`] is an
//! in-process relay with the same pairing rules, used by tests and demos.

mod local;
mod websocket;

pub use local::{LocalChannel, LocalRelay};
pub use websocket::WebSocketChannel;

use crate::error::SignalingError;
use crate::protocol::SignalingMessage;
use async_trait::async_trait;

#[async_trait]
pub trait SignalingChannel: Send {
    /// Queue a message for the relay. Fails once the connection is gone.
    async fn send(&mut self, message: SignalingMessage) -> Result<(), SignalingError>;

    /// Next message from the relay, or `None` once the connection is gone.
    /// Cancel-safe.
    async fn recv(&mut self) -> Option<SignalingMessage>;

    async fn close(&mut self);
}
