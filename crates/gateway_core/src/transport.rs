use async_trait::async_trait;
use shared::protocol::OutboundStanza;
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport disconnected")]
    Disconnected,
}

/// Outbound half of the messaging-network connection.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, stanza: OutboundStanza) -> Result<(), TransportError>;
}

/// Fans stanzas out to whoever owns the wire (or a test) via a broadcast channel.
pub struct BroadcastTransport {
    events: broadcast::Sender<OutboundStanza>,
}

impl BroadcastTransport {
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self { events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OutboundStanza> {
        self.events.subscribe()
    }
}

#[async_trait]
impl Transport for BroadcastTransport {
    async fn send(&self, stanza: OutboundStanza) -> Result<(), TransportError> {
        self.events
            .send(stanza)
            .map(|_| ())
            .map_err(|_| TransportError::Disconnected)
    }
}
