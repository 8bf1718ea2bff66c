use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use shared::protocol::RemoteMessage;
use tracing::warn;

use crate::session::Session;

/// What a render step contributed to an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Fragment(String),
    /// The step consumed the message; the default outbound send is skipped.
    Terminal,
}

/// One stage of turning a remote message into the text relayed to the user.
#[async_trait]
pub trait RenderStep: Send + Sync {
    fn name(&self) -> &'static str;

    async fn render(&self, session: &Session, message: &RemoteMessage) -> Result<StepOutcome>;
}

/// Ordered render steps. Every step runs for every message, but fragments
/// stop accumulating at the first terminal outcome. A failing step counts
/// as terminal.
#[derive(Clone)]
pub struct RelayPipeline {
    steps: Vec<Arc<dyn RenderStep>>,
}

impl Default for RelayPipeline {
    fn default() -> Self {
        Self::new(vec![
            Arc::new(BodyStep),
            Arc::new(ForwardedStep),
            Arc::new(AttachmentsStep),
        ])
    }
}

impl RelayPipeline {
    pub fn new(steps: Vec<Arc<dyn RenderStep>>) -> Self {
        Self { steps }
    }

    pub fn push(&mut self, step: Arc<dyn RenderStep>) {
        self.steps.push(step);
    }

    /// Returns the body to send, or `None` when a step consumed the message.
    pub async fn render(&self, session: &Session, message: &RemoteMessage) -> Option<String> {
        let mut body = String::new();
        let mut terminated = false;
        for step in &self.steps {
            let outcome = match step.render(session, message).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(
                        session = %session.key(),
                        step = step.name(),
                        message_id = ?message.id,
                        "relay: render step failed: {err:#}"
                    );
                    StepOutcome::Terminal
                }
            };
            match outcome {
                StepOutcome::Fragment(fragment) if !terminated => body.push_str(&fragment),
                StepOutcome::Fragment(_) => {}
                StepOutcome::Terminal => terminated = true,
            }
        }
        (!terminated).then_some(body)
    }
}

pub struct BodyStep;

#[async_trait]
impl RenderStep for BodyStep {
    fn name(&self) -> &'static str {
        "body"
    }

    async fn render(&self, _session: &Session, message: &RemoteMessage) -> Result<StepOutcome> {
        Ok(StepOutcome::Fragment(decode_markup(&message.body)))
    }
}

pub struct ForwardedStep;

#[async_trait]
impl RenderStep for ForwardedStep {
    fn name(&self) -> &'static str {
        "forwarded"
    }

    async fn render(&self, session: &Session, message: &RemoteMessage) -> Result<StepOutcome> {
        let mut rendered = String::new();
        render_forwarded(session, &message.fwd_messages, 1, &mut rendered).await;
        Ok(StepOutcome::Fragment(rendered))
    }
}

const MAX_FORWARD_DEPTH: usize = 8;

async fn render_forwarded(
    session: &Session,
    messages: &[RemoteMessage],
    depth: usize,
    out: &mut String,
) {
    // Pre-order walk; children are pushed reversed so they pop in order.
    let mut pending: Vec<(usize, &RemoteMessage)> =
        messages.iter().rev().map(|message| (depth, message)).collect();
    while let Some((depth, message)) = pending.pop() {
        let author = session
            .contact_name(message.contact())
            .await
            .unwrap_or_else(|| message.contact().to_string());
        out.push('\n');
        out.push_str(&format!(
            "{} {author}: {}",
            ">".repeat(depth),
            decode_markup(&message.body)
        ));
        if depth < MAX_FORWARD_DEPTH {
            pending.extend(
                message
                    .fwd_messages
                    .iter()
                    .rev()
                    .map(|nested| (depth + 1, nested)),
            );
        }
    }
}

pub struct AttachmentsStep;

#[async_trait]
impl RenderStep for AttachmentsStep {
    fn name(&self) -> &'static str {
        "attachments"
    }

    async fn render(&self, _session: &Session, message: &RemoteMessage) -> Result<StepOutcome> {
        if message.attachments.is_empty() {
            return Ok(StepOutcome::Fragment(String::new()));
        }
        let mut rendered = String::from("\nAttachments:");
        for attachment in &message.attachments {
            rendered.push('\n');
            match attachment.url() {
                Some(url) => rendered.push_str(&url),
                None => rendered.push_str(&format!("[{}]", attachment.kind)),
            }
        }
        Ok(StepOutcome::Fragment(rendered))
    }
}

/// Converts the remote side's HTML-escaped text into plain text.
pub fn decode_markup(text: &str) -> String {
    let text = text
        .replace("<br>", "\n")
        .replace("<br/>", "\n")
        .replace("<br />", "\n");
    let mut out = String::with_capacity(text.len());
    let mut rest = text.as_str();
    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        rest = &rest[start..];
        let decoded = rest
            .find(';')
            .filter(|end| *end <= 10)
            .and_then(|end| decode_entity(&rest[1..end]).map(|ch| (ch, end)));
        match decoded {
            Some((ch, end)) => {
                out.push(ch);
                rest = &rest[end + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_entity(entity: &str) -> Option<char> {
    match entity {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some('\u{a0}'),
        _ => {
            let code = entity.strip_prefix('#')?;
            let value = match code.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => code.parse().ok()?,
            };
            char::from_u32(value)
        }
    }
}
