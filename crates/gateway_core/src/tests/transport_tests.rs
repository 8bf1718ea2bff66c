use shared::{domain::SessionKey, protocol::OutboundStanza};

use crate::transport::{BroadcastTransport, Transport, TransportError};

fn notice() -> OutboundStanza {
    OutboundStanza::Message {
        to: SessionKey::new("alice@example.org"),
        from: None,
        body: "hello".to_string(),
    }
}

#[tokio::test]
async fn stanzas_reach_every_subscriber() {
    let transport = BroadcastTransport::new(8);
    let mut wire = transport.subscribe();

    transport.send(notice()).await.expect("send");

    assert_eq!(wire.recv().await.expect("stanza"), notice());
}

#[tokio::test]
async fn sending_without_a_link_reports_disconnected() {
    let transport = BroadcastTransport::new(8);

    let err = transport.send(notice()).await.expect_err("nobody listening");

    assert!(matches!(err, TransportError::Disconnected));
    assert_eq!(err.to_string(), "transport disconnected");
}
