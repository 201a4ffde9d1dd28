//! Remote streaming endpoint seam
//!
//! A connected endpoint is a narrow [`RemoteHandle`] for outbound audio plus
//! a channel of [`RemoteEvent`]s delivered in arrival order.

mod gemini;

use crate::codec::EncodedPayload;
use crate::config::LiveConfig;
use crate::error::Result;
use crate::models::RemoteEvent;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

pub use gemini::GeminiLive;

/// Outbound side of an open connection
#[async_trait]
pub trait RemoteHandle: Send + Sync {
    /// Send one payload. Returns `NotConnected` once closed.
    async fn send(&self, payload: &EncodedPayload) -> Result<()>;

    /// Close the connection. Closing twice is harmless.
    async fn close(&self) -> Result<()>;
}

/// An open connection
pub struct Connection {
    pub handle: Arc<dyn RemoteHandle>,
    pub events: mpsc::UnboundedReceiver<RemoteEvent>,
}

/// Something that can open a live streaming connection
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Resolves once the remote side reports the session open.
    async fn connect(&self, config: &LiveConfig) -> Result<Connection>;
}
