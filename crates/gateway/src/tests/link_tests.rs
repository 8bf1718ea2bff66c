use std::time::Duration;

use super::*;
use shared::domain::{ContactId, SessionKey};
use tokio::{
    io::{split, AsyncWriteExt},
    time::timeout,
};

use crate::test_support::test_gateway;
use gateway_core::Transport;

#[test]
fn blank_and_garbage_lines_are_skipped() {
    assert_eq!(decode_line("   "), None);
    assert_eq!(decode_line("{not json"), None);
    assert_eq!(decode_line(r#"{"type":"teleport","payload":{}}"#), None);
}

#[test]
fn inbound_lines_decode_into_stanzas() {
    let stanza = decode_line(
        r#"{"type":"message","payload":{"from":"alice@xmpp.test","to":5,"body":"hi"}}"#,
    );

    assert_eq!(
        stanza,
        Some(InboundStanza::Message {
            from: SessionKey::new("alice@xmpp.test"),
            to: ContactId(5),
            body: "hi".to_string(),
        })
    );
}

#[test]
fn outbound_stanzas_are_single_terminated_lines() {
    let line = encode_line(&OutboundStanza::Message {
        to: SessionKey::new("alice@xmpp.test"),
        from: Some(ContactId(5)),
        body: "two\nlines".to_string(),
    })
    .expect("encode");

    assert!(line.ends_with('\n'));
    assert_eq!(line.matches('\n').count(), 1);
    let decoded: OutboundStanza = serde_json::from_str(line.trim_end()).expect("decode");
    assert!(matches!(decoded, OutboundStanza::Message { body, .. } if body == "two\nlines"));
}

#[tokio::test]
async fn link_dispatches_inbound_and_writes_outbound() {
    let fixture = test_gateway().await;
    let (peer, local) = tokio::io::duplex(4096);
    let (reader, writer) = split(local);
    let outbound = fixture.transport.subscribe();
    let gateway = fixture.gateway.clone();
    let link = tokio::spawn(async move { serve_link(reader, writer, &gateway, outbound).await });
    let (peer_reader, mut peer_writer) = split(peer);
    let mut peer_lines = BufReader::new(peer_reader).lines();

    peer_writer
        .write_all(
            concat!(
                r#"{"type":"login","payload":{"from":"alice@xmpp.test","resource":"pc","#,
                r#""username":"alice","token":"token-1"}}"#,
                "\n"
            )
            .as_bytes(),
        )
        .await
        .expect("write");

    let first = timeout(Duration::from_secs(5), peer_lines.next_line())
        .await
        .expect("outbound line in time")
        .expect("read")
        .expect("line");
    let stanza: OutboundStanza = serde_json::from_str(&first).expect("outbound stanza");
    assert_eq!(stanza.recipient(), &SessionKey::new("alice@xmpp.test"));
    assert!(!fixture.remote.calls_to("users.get").is_empty());

    fixture
        .transport
        .send(OutboundStanza::Message {
            to: SessionKey::new("alice@xmpp.test"),
            from: None,
            body: "notice".to_string(),
        })
        .await
        .expect("send");
    let notice = timeout(Duration::from_secs(5), async {
        loop {
            let line = peer_lines.next_line().await.expect("read").expect("line");
            let stanza: OutboundStanza = serde_json::from_str(&line).expect("stanza");
            if let OutboundStanza::Message { from: None, body, .. } = stanza {
                break body;
            }
        }
    })
    .await
    .expect("notice in time");
    assert_eq!(notice, "notice");

    drop(peer_writer);
    drop(peer_lines);
    let closed = timeout(Duration::from_secs(5), link)
        .await
        .expect("link ends")
        .expect("join");
    assert!(closed.is_ok());
}
