//! Event sink backed by a tokio channel
//!
//! The surrounding application owns the receiving side (a WebSocket
//! writer, a CLI printer); a dropped receiver reads as a closed live
//! connection.

use async_trait::async_trait;
use conductor_core::{ConductorError, EventSink, Result, SessionEvent};
use tokio::sync::mpsc;

pub struct ChannelSink {
    tx: mpsc::Sender<SessionEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn emit(&self, event: SessionEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| ConductorError::ConnectionClosed)
    }
}
