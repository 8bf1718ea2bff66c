//! JSON Lines link to the messaging-network component: one `InboundStanza`
//! per line in, one `OutboundStanza` per line out.

use anyhow::{Context, Result};
use gateway_core::Gateway;
use shared::protocol::{InboundStanza, OutboundStanza};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    sync::broadcast::{self, error::RecvError},
};
use tracing::{debug, warn};

/// Pumps stanzas in both directions until the peer closes the link or a
/// write fails. Returning at all means the link is gone.
pub async fn serve_link<R, W>(
    reader: R,
    mut writer: W,
    gateway: &Gateway,
    mut outbound: broadcast::Receiver<OutboundStanza>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read from transport")? else {
                    return Ok(());
                };
                if let Some(stanza) = decode_line(&line) {
                    gateway.dispatch(stanza).await;
                }
            }
            stanza = outbound.recv() => match stanza {
                Ok(stanza) => write_stanza(&mut writer, &stanza).await?,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "link: outbound stanzas dropped");
                }
                Err(RecvError::Closed) => return Ok(()),
            },
        }
    }
}

pub fn decode_line(line: &str) -> Option<InboundStanza> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(stanza) => Some(stanza),
        Err(err) => {
            warn!("link: dropping undecodable stanza: {err}");
            None
        }
    }
}

pub fn encode_line(stanza: &OutboundStanza) -> Result<String> {
    let mut line = serde_json::to_string(stanza).context("failed to encode stanza")?;
    line.push('\n');
    Ok(line)
}

async fn write_stanza<W>(writer: &mut W, stanza: &OutboundStanza) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let line = encode_line(stanza)?;
    writer
        .write_all(line.as_bytes())
        .await
        .context("failed to write to transport")?;
    writer.flush().await.context("failed to flush transport")?;
    debug!(to = %stanza.recipient(), "link: stanza sent");
    Ok(())
}

#[cfg(test)]
#[path = "tests/link_tests.rs"]
mod tests;
