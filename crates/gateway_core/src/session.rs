use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use remote_api::{args, long_poll_endpoint_from, Args, RemoteApi, LONG_POLL_SERVER_METHOD};
use serde_json::Value;
use sha2::{Digest, Sha256};
use shared::{
    domain::{
        ChatState, Contact, ContactId, MessageId, PresenceKind, SessionKey, SessionState,
        SubscriptionKind,
    },
    error::{CaptchaChallenge, RemoteError},
    protocol::{
        CaptchaForm, CaptchaPrompt, ContactList, LongPollEndpoint, MessageBatch, OutboundStanza,
        PollPayload, UpdateEvent,
    },
};
use storage::{CredentialRecord, Storage};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::{relay::RelayPipeline, task::spawn_supervised, transport::Transport};

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

const VALIDATE_TOKEN_METHOD: &str = "users.get";
const CONTACT_FIELDS: &str = "first_name,last_name,online";

#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Store the relay cursor after every fetch so restarts resume where they left off.
    pub persist_cursor: bool,
    pub typing_expiry: Duration,
    pub roster_refresh_interval: Duration,
    pub message_batch_size: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            persist_cursor: true,
            typing_expiry: Duration::from_secs(10),
            roster_refresh_interval: Duration::from_secs(120),
            message_batch_size: 200,
        }
    }
}

/// Requests a session makes of whoever owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSignal {
    RequestRegistration(SessionKey),
    /// The remote network is unreachable; stop polling but keep the session.
    Offline(SessionKey),
    Teardown { key: SessionKey, reason: String },
}

impl SessionSignal {
    pub fn key(&self) -> &SessionKey {
        match self {
            SessionSignal::RequestRegistration(key)
            | SessionSignal::Offline(key)
            | SessionSignal::Teardown { key, .. } => key,
        }
    }
}

/// A signal stamped with the [`Session::instance`] that raised it, so a
/// session that has since been replaced cannot act on its successor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedSignal {
    pub instance: u64,
    pub signal: SessionSignal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Re-register with the current endpoint.
    Continue,
    /// The endpoint is stale; acquire a new one before polling again.
    Reinitialize,
    /// A captcha is pending; stay unregistered until it is answered.
    Suspended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Relayed { relayed: usize, cursor: MessageId },
    AlreadyRunning,
    Suspended,
    Failed,
}

#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub username: String,
    pub token: Option<String>,
    pub password: Option<String>,
}

/// Shared collaborators handed to every session.
#[derive(Clone)]
pub struct SessionContext {
    pub transport: Arc<dyn Transport>,
    pub storage: Storage,
    pub pipeline: Arc<RelayPipeline>,
    pub signals: mpsc::UnboundedSender<TaggedSignal>,
    pub settings: SessionSettings,
}

#[derive(Debug, Clone)]
enum CaptchaOrigin {
    Call,
    Validation { token: String },
    PasswordLogin { password: String },
}

#[derive(Debug, Clone)]
struct PendingCaptcha {
    challenge: CaptchaChallenge,
    origin: CaptchaOrigin,
}

struct SessionInner {
    state: SessionState,
    username: String,
    token: Option<String>,
    online: bool,
    cursor: MessageId,
    poll_endpoint: Option<LongPollEndpoint>,
    contacts: BTreeMap<ContactId, Contact>,
    typing: HashMap<ContactId, Instant>,
    captcha: Option<PendingCaptcha>,
    resources: HashSet<String>,
    roster_initialized: bool,
    last_roster_refresh: Option<Instant>,
    send_sequence: i64,
}

impl SessionInner {
    fn new(username: String) -> Self {
        Self {
            state: SessionState::Unauthenticated,
            username,
            token: None,
            online: true,
            cursor: MessageId::default(),
            poll_endpoint: None,
            contacts: BTreeMap::new(),
            typing: HashMap::new(),
            captcha: None,
            resources: HashSet::new(),
            roster_initialized: false,
            last_roster_refresh: None,
            send_sequence: 0,
        }
    }
}

/// Point-in-time view of a session for operators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub key: SessionKey,
    pub username: String,
    pub state: SessionState,
    pub online: bool,
    pub cursor: MessageId,
    pub contacts: usize,
    pub resources: usize,
}

pub struct Session {
    key: SessionKey,
    instance: u64,
    remote: Arc<dyn RemoteApi>,
    ctx: SessionContext,
    inner: Mutex<SessionInner>,
    fetch_lock: Mutex<()>,
}

impl Session {
    pub fn new(
        key: SessionKey,
        username: impl Into<String>,
        remote: Arc<dyn RemoteApi>,
        ctx: SessionContext,
    ) -> Arc<Self> {
        Arc::new(Self {
            key,
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
            remote,
            ctx,
            inner: Mutex::new(SessionInner::new(username.into())),
            fetch_lock: Mutex::new(()),
        })
    }

    /// Rebuilds a session from its persisted record. The session still has to
    /// authenticate before it relays anything.
    pub fn restore(
        record: &CredentialRecord,
        remote: Arc<dyn RemoteApi>,
        ctx: SessionContext,
    ) -> Arc<Self> {
        let mut inner = SessionInner::new(record.username.clone());
        inner.token = Some(record.token.clone());
        inner.cursor = record.cursor;
        inner.roster_initialized = record.roster_initialized;
        Arc::new(Self {
            key: record.session_key.clone(),
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
            remote,
            ctx,
            inner: Mutex::new(inner),
            fetch_lock: Mutex::new(()),
        })
    }

    /// Process-unique id; a session rebuilt under the same key gets a new one.
    pub fn instance(&self) -> u64 {
        self.instance
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    pub async fn cursor(&self) -> MessageId {
        self.inner.lock().await.cursor
    }

    pub async fn stored_credentials(&self) -> Credentials {
        let inner = self.inner.lock().await;
        Credentials {
            username: inner.username.clone(),
            token: inner.token.clone(),
            password: None,
        }
    }

    pub async fn contact_name(&self, contact: ContactId) -> Option<String> {
        self.inner
            .lock()
            .await
            .contacts
            .get(&contact)
            .map(|contact| contact.name.clone())
    }

    pub async fn contacts(&self) -> BTreeMap<ContactId, Contact> {
        self.inner.lock().await.contacts.clone()
    }

    pub async fn poll_endpoint(&self) -> Option<LongPollEndpoint> {
        self.inner.lock().await.poll_endpoint.clone()
    }

    pub async fn captcha_pending(&self) -> bool {
        self.inner.lock().await.captcha.is_some()
    }

    /// Online, reachable and not waiting on a captcha.
    pub async fn is_pollable(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.state == SessionState::Online && inner.online && inner.captcha.is_none()
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let inner = self.inner.lock().await;
        SessionSnapshot {
            key: self.key.clone(),
            username: inner.username.clone(),
            state: inner.state,
            online: inner.online,
            cursor: inner.cursor,
            contacts: inner.contacts.len(),
            resources: inner.resources.len(),
        }
    }

    pub async fn authenticate(&self, credentials: Credentials) -> Result<SessionState, RemoteError> {
        {
            let mut inner = self.inner.lock().await;
            inner.state = SessionState::Authenticating;
            inner.username = credentials.username.clone();
        }
        info!(session = %self.key, username = %credentials.username, "session: authenticating");

        let (result, origin) = match (credentials.token, credentials.password) {
            (Some(token), _) => {
                self.remote.set_token(token.clone()).await;
                let result = self
                    .remote
                    .call(VALIDATE_TOKEN_METHOD, Args::new())
                    .await
                    .map(|_| token.clone());
                (result, CaptchaOrigin::Validation { token })
            }
            (None, Some(password)) => {
                let result = self
                    .remote
                    .login_with_password(&credentials.username, &password, None)
                    .await;
                (result, CaptchaOrigin::PasswordLogin { password })
            }
            (None, None) => (
                Err(RemoteError::CredentialsInvalid(
                    "no token or password supplied".to_string(),
                )),
                CaptchaOrigin::Call,
            ),
        };

        match result {
            Ok(token) => {
                self.remote.set_token(token.clone()).await;
                self.complete_login(token).await;
                Ok(SessionState::Online)
            }
            Err(RemoteError::CaptchaRequired(challenge)) => {
                self.enter_captcha(challenge, origin).await;
                Ok(SessionState::CaptchaPending)
            }
            Err(err) if err.is_credential_failure() => {
                self.teardown(format!("authentication failed: {err}")).await;
                Err(err)
            }
            Err(err) => {
                warn!(session = %self.key, "session: authentication failed: {err}");
                self.inner.lock().await.state = SessionState::Unauthenticated;
                Err(err)
            }
        }
    }

    async fn complete_login(&self, token: String) {
        let username = {
            let mut inner = self.inner.lock().await;
            inner.token = Some(token.clone());
            inner.state = SessionState::Online;
            inner.online = true;
            inner.captcha = None;
            inner.username.clone()
        };
        if let Err(err) = self
            .ctx
            .storage
            .upsert_credentials(&self.key, &username, &token)
            .await
        {
            warn!(session = %self.key, "session: failed to persist credentials: {err:#}");
        }
        info!(session = %self.key, "session: online");
        self.send(self.gateway_presence(PresenceKind::Available, None))
            .await;
        self.refresh_contacts(Instant::now()).await;
        self.signal(SessionSignal::RequestRegistration(self.key.clone()));
    }

    /// Fetches unseen messages and relays them in id order. Only one fetch
    /// runs per session at a time; overlapping calls return immediately.
    pub async fn fetch_messages(&self) -> FetchOutcome {
        let Ok(_running) = self.fetch_lock.try_lock() else {
            debug!(session = %self.key, "session: fetch already running");
            return FetchOutcome::AlreadyRunning;
        };

        let cursor = {
            let inner = self.inner.lock().await;
            if inner.captcha.is_some() || inner.state != SessionState::Online {
                return FetchOutcome::Suspended;
            }
            inner.cursor
        };

        let mut request = args([
            ("count", self.ctx.settings.message_batch_size.to_string()),
            ("out", "0".to_string()),
        ]);
        if cursor > MessageId::default() {
            request.push(("last_message_id".to_string(), cursor.to_string()));
        } else {
            // Unread only on the very first fetch.
            request.push(("filters".to_string(), "1".to_string()));
        }

        let value = match self.remote_call("messages.get", request).await {
            Ok(value) => value,
            Err(_) => return FetchOutcome::Failed,
        };
        let batch = if value.is_null() {
            MessageBatch::default()
        } else {
            match serde_json::from_value::<MessageBatch>(value) {
                Ok(batch) => batch,
                Err(err) => {
                    warn!(session = %self.key, "session: undecodable message batch: {err}");
                    return FetchOutcome::Failed;
                }
            }
        };

        let mut items = batch.items;
        items.sort_by_key(|message| message.sort_key());
        let highest = items.iter().map(|message| message.sort_key()).max();

        let mut relayed = Vec::new();
        for message in items.iter().filter(|message| !message.is_outgoing()) {
            if cursor > MessageId::default() && message.sort_key() <= cursor {
                continue;
            }
            let Some(body) = self.ctx.pipeline.render(self, message).await else {
                debug!(
                    session = %self.key,
                    message_id = ?message.id,
                    "session: message consumed by render step"
                );
                continue;
            };
            if body.is_empty() {
                continue;
            }
            self.send(OutboundStanza::Message {
                to: self.key.clone(),
                from: Some(message.contact()),
                body,
            })
            .await;
            if let Some(id) = message.id {
                relayed.push(id);
            }
        }

        if !relayed.is_empty() {
            let ids = relayed
                .iter()
                .map(i64::to_string)
                .collect::<Vec<_>>()
                .join(",");
            if let Err(err) = self
                .remote_call("messages.markAsRead", args([("message_ids", ids)]))
                .await
            {
                debug!(session = %self.key, "session: markAsRead failed: {err}");
            }
        }

        let cursor = self.advance_cursor(highest).await;
        info!(
            session = %self.key,
            relayed = relayed.len(),
            cursor = cursor.0,
            "session: messages relayed"
        );
        FetchOutcome::Relayed {
            relayed: relayed.len(),
            cursor,
        }
    }

    async fn advance_cursor(&self, highest: Option<MessageId>) -> MessageId {
        let (cursor, advanced) = {
            let mut inner = self.inner.lock().await;
            match highest {
                Some(highest) if highest > inner.cursor => {
                    inner.cursor = highest;
                    (highest, true)
                }
                _ => (inner.cursor, false),
            }
        };
        if advanced && self.ctx.settings.persist_cursor {
            if let Err(err) = self.ctx.storage.update_cursor(&self.key, cursor).await {
                warn!(session = %self.key, "session: failed to persist cursor: {err:#}");
            }
        }
        cursor
    }

    /// Applies one long-poll payload and says what the multiplexer should do next.
    pub async fn process_poll_result(self: &Arc<Self>, raw: &[u8]) -> PollOutcome {
        if self.captcha_pending().await {
            return PollOutcome::Suspended;
        }
        let Some(payload) = PollPayload::parse(raw) else {
            warn!(session = %self.key, bytes = raw.len(), "poll: undecodable payload ignored");
            return PollOutcome::Continue;
        };
        let (ts, updates) = match payload {
            PollPayload::Failed => {
                info!(session = %self.key, "poll: endpoint expired; reinitializing");
                self.inner.lock().await.poll_endpoint = None;
                return PollOutcome::Reinitialize;
            }
            PollPayload::Updates { ts, updates } => (ts, updates),
        };

        let mut outbound = Vec::new();
        let mut new_messages = false;
        {
            let mut inner = self.inner.lock().await;
            if let Some(endpoint) = inner.poll_endpoint.as_mut() {
                endpoint.ts = endpoint.ts.max(ts);
            }
            let now = Instant::now();
            for update in updates {
                match update {
                    UpdateEvent::NewMessage => new_messages = true,
                    UpdateEvent::ContactOnline(contact) => {
                        outbound.push(self.apply_contact_status(&mut inner, contact, true));
                    }
                    UpdateEvent::ContactOffline(contact) => {
                        outbound.push(self.apply_contact_status(&mut inner, contact, false));
                    }
                    UpdateEvent::Typing(contact) => {
                        if inner.typing.insert(contact, now).is_none() {
                            outbound.push(OutboundStanza::ChatState {
                                to: self.key.clone(),
                                from: contact,
                                state: ChatState::Composing,
                            });
                        }
                    }
                    UpdateEvent::Other(_) => {}
                }
            }
        }

        for stanza in outbound {
            self.send(stanza).await;
        }
        if new_messages {
            let session = Arc::clone(self);
            spawn_supervised("fetch_messages", &self.key, async move {
                session.fetch_messages().await;
            });
        }
        PollOutcome::Continue
    }

    /// Answers the pending captcha and replays what it interrupted. Returns
    /// whether the session resumed.
    pub async fn answer_captcha(&self, answer: &str) -> bool {
        let (pending, username) = {
            let inner = self.inner.lock().await;
            (inner.captcha.clone(), inner.username.clone())
        };
        let Some(mut pending) = pending else {
            debug!(session = %self.key, "session: captcha answer without a pending challenge");
            return false;
        };
        pending.challenge.answer = Some(answer.trim().to_string());

        let result = match &pending.origin {
            CaptchaOrigin::PasswordLogin { password } => self
                .remote
                .login_with_password(&username, password, Some(&pending.challenge))
                .await
                .map(Some),
            CaptchaOrigin::Call | CaptchaOrigin::Validation { .. } => self
                .remote
                .retry(Some(&pending.challenge))
                .await
                .map(|_| None),
        };

        match result {
            Ok(issued_token) => {
                info!(session = %self.key, "session: captcha accepted");
                self.inner.lock().await.captcha = None;
                match (pending.origin, issued_token) {
                    (CaptchaOrigin::Validation { token }, _)
                    | (CaptchaOrigin::PasswordLogin { .. }, Some(token)) => {
                        self.remote.set_token(token.clone()).await;
                        self.complete_login(token).await;
                    }
                    _ => {
                        self.inner.lock().await.state = SessionState::Online;
                        self.send(self.gateway_presence(PresenceKind::Available, None))
                            .await;
                        self.signal(SessionSignal::RequestRegistration(self.key.clone()));
                        // The poll event that started the interrupted work is already consumed.
                        self.fetch_messages().await;
                    }
                }
                true
            }
            Err(RemoteError::CaptchaRequired(next)) => {
                self.enter_captcha(next, pending.origin).await;
                false
            }
            Err(err) if err.is_credential_failure() => {
                self.teardown(format!("captcha retry rejected credentials: {err}"))
                    .await;
                false
            }
            Err(err) => {
                warn!(session = %self.key, "session: captcha retry failed: {err}");
                pending.challenge.answer = None;
                self.emit_captcha_prompt(&pending.challenge).await;
                false
            }
        }
    }

    /// Periodic upkeep: typing expiry, reconnect after the network went away,
    /// and the contact list diff.
    pub async fn housekeeping(&self, now: Instant) {
        let (expired, reconnect, refresh_roster) = {
            let mut inner = self.inner.lock().await;
            let expiry = self.ctx.settings.typing_expiry;
            let expired: Vec<ContactId> = inner
                .typing
                .iter()
                .filter(|(_, started)| now.saturating_duration_since(**started) >= expiry)
                .map(|(contact, _)| *contact)
                .collect();
            for contact in &expired {
                inner.typing.remove(contact);
            }
            let active = inner.state == SessionState::Online && inner.captcha.is_none();
            let refresh_due = inner.last_roster_refresh.map_or(true, |last| {
                now.saturating_duration_since(last) >= self.ctx.settings.roster_refresh_interval
            });
            (
                expired,
                active && !inner.online,
                active && inner.online && refresh_due,
            )
        };

        for contact in expired {
            self.send(OutboundStanza::ChatState {
                to: self.key.clone(),
                from: contact,
                state: ChatState::Paused,
            })
            .await;
        }
        if reconnect {
            match self.acquire_poll_endpoint().await {
                Ok(()) => self.signal(SessionSignal::RequestRegistration(self.key.clone())),
                Err(err) => debug!(session = %self.key, "session: still offline: {err}"),
            }
        }
        if refresh_roster {
            self.refresh_contacts(now).await;
        }
    }

    /// Pulls the contact list and emits subscribe/unsubscribe for the
    /// difference against the cached snapshot.
    pub async fn refresh_contacts(&self, now: Instant) {
        let value = match self
            .remote_call("friends.get", args([("fields", CONTACT_FIELDS)]))
            .await
        {
            Ok(Value::Null) | Err(_) => return,
            Ok(value) => value,
        };
        let list = match serde_json::from_value::<ContactList>(value) {
            Ok(list) => list,
            Err(err) => {
                warn!(session = %self.key, "session: undecodable contact list: {err}");
                return;
            }
        };
        let fresh: BTreeMap<ContactId, Contact> = list
            .items
            .iter()
            .map(|contact| {
                (
                    ContactId::from_signed(contact.id),
                    Contact {
                        name: contact.display_name(),
                        online: contact.online != 0,
                    },
                )
            })
            .collect();

        let (outbound, first_sync) = {
            let mut inner = self.inner.lock().await;
            // After a restart the user already holds these subscriptions.
            let baseline = inner.last_roster_refresh.is_none() && inner.roster_initialized;
            let mut outbound = Vec::new();
            for (contact, entry) in &fresh {
                let previous = inner.contacts.get(contact);
                if previous.is_none() && !baseline {
                    outbound.push(OutboundStanza::Subscription {
                        to: self.key.clone(),
                        contact: Some(*contact),
                        kind: SubscriptionKind::Subscribe,
                        nick: Some(entry.name.clone()),
                    });
                }
                let was_online = previous.is_some_and(|previous| previous.online);
                if entry.online != was_online {
                    outbound.push(self.contact_presence(*contact, entry));
                }
            }
            if !baseline {
                for contact in inner.contacts.keys().filter(|id| !fresh.contains_key(id)) {
                    outbound.push(OutboundStanza::Subscription {
                        to: self.key.clone(),
                        contact: Some(*contact),
                        kind: SubscriptionKind::Unsubscribe,
                        nick: None,
                    });
                }
            }
            let first_sync = !inner.roster_initialized;
            inner.roster_initialized = true;
            inner.contacts = fresh;
            inner.last_roster_refresh = Some(now);
            (outbound, first_sync)
        };

        for stanza in outbound {
            self.send(stanza).await;
        }
        if first_sync {
            if let Err(err) = self
                .ctx
                .storage
                .set_roster_initialized(&self.key, true)
                .await
            {
                warn!(session = %self.key, "session: failed to persist roster flag: {err:#}");
            }
        }
    }

    /// Relays a message from the user to a remote contact.
    pub async fn send_message(
        &self,
        contact: ContactId,
        body: &str,
    ) -> Result<Option<MessageId>, RemoteError> {
        let random_id = {
            let mut inner = self.inner.lock().await;
            inner.send_sequence += 1;
            let seed = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_millis() as i64)
                .unwrap_or_default();
            (seed + inner.send_sequence) % i64::from(i32::MAX)
        };
        let value = self
            .remote_call(
                "messages.send",
                args([
                    ("user_id", contact.to_string()),
                    ("message", body.to_string()),
                    ("random_id", random_id.to_string()),
                ]),
            )
            .await?;
        Ok(value.as_i64().map(MessageId))
    }

    /// Returns true when this is the user's first resource.
    pub async fn add_resource(&self, resource: &str) -> bool {
        let (first, online_contacts) = {
            let mut inner = self.inner.lock().await;
            let first = inner.resources.is_empty();
            inner.resources.insert(resource.to_string());
            let online = inner
                .contacts
                .iter()
                .filter(|(_, contact)| contact.online)
                .map(|(id, contact)| self.contact_presence(*id, contact))
                .collect::<Vec<_>>();
            (first && inner.state == SessionState::Online, online)
        };
        if first {
            self.send(self.gateway_presence(PresenceKind::Available, None))
                .await;
            for presence in online_contacts {
                self.send(presence).await;
            }
        }
        first
    }

    /// Returns true when no resources remain.
    pub async fn remove_resource(&self, resource: &str) -> bool {
        let mut inner = self.inner.lock().await;
        inner.resources.remove(resource);
        inner.resources.is_empty()
    }

    pub async fn acquire_poll_endpoint(&self) -> Result<(), RemoteError> {
        let value = self
            .remote_call(LONG_POLL_SERVER_METHOD, Args::new())
            .await?;
        let endpoint = long_poll_endpoint_from(value)?;
        let mut inner = self.inner.lock().await;
        inner.poll_endpoint = Some(endpoint);
        if !inner.online {
            info!(session = %self.key, "session: remote network reachable again");
            inner.online = true;
        }
        Ok(())
    }

    /// One blocking long-poll request against `endpoint`.
    pub async fn long_poll(&self, endpoint: &LongPollEndpoint) -> Result<Vec<u8>, RemoteError> {
        let result = self.remote.long_poll(endpoint).await;
        if let Err(RemoteError::NetworkUnreachable(reason)) = &result {
            self.mark_offline(reason).await;
        }
        result
    }

    /// Tells the user the session is gone and withdraws the gateway's presence.
    pub async fn notify_teardown(&self, reason: &str) {
        self.notify_user(&format!("Session closed: {reason}")).await;
        self.withdraw_presence().await;
        self.send(OutboundStanza::Subscription {
            to: self.key.clone(),
            contact: None,
            kind: SubscriptionKind::Unsubscribe,
            nick: None,
        })
        .await;
    }

    /// Marks every contact and the gateway itself unavailable.
    pub async fn withdraw_presence(&self) {
        let online: Vec<ContactId> = {
            let inner = self.inner.lock().await;
            inner
                .contacts
                .iter()
                .filter(|(_, contact)| contact.online)
                .map(|(id, _)| *id)
                .collect()
        };
        for contact in online {
            self.send(OutboundStanza::Presence {
                to: self.key.clone(),
                from: Some(contact),
                kind: PresenceKind::Unavailable,
                status: None,
                nick: None,
            })
            .await;
        }
        self.send(self.gateway_presence(PresenceKind::Unavailable, None))
            .await;
    }

    pub async fn notify_poll_abandoned(&self) {
        self.send(self.gateway_presence(
            PresenceKind::ExtendedAway,
            Some("Lost the update stream; send presence again to reconnect".to_string()),
        ))
        .await;
    }

    async fn remote_call(&self, method: &str, args: Args) -> Result<Value, RemoteError> {
        if let Some(pending) = self.inner.lock().await.captcha.as_ref() {
            debug!(session = %self.key, method, "session: call held back by pending captcha");
            return Err(RemoteError::CaptchaRequired(pending.challenge.clone()));
        }
        match self.remote.call(method, args).await {
            Ok(value) => Ok(value),
            Err(err) => self.handle_remote_error(method, err).await,
        }
    }

    async fn handle_remote_error(&self, method: &str, err: RemoteError) -> Result<Value, RemoteError> {
        match &err {
            RemoteError::InternalError(_) | RemoteError::Unknown { .. } => {
                warn!(session = %self.key, method, "session: remote call failed: {err}");
                return Ok(Value::Null);
            }
            RemoteError::Transport(_) | RemoteError::RateLimited => {
                warn!(session = %self.key, method, "session: remote call failed: {err}");
            }
            RemoteError::NetworkUnreachable(reason) => self.mark_offline(reason).await,
            RemoteError::CaptchaRequired(challenge) => {
                self.enter_captcha(challenge.clone(), CaptchaOrigin::Call)
                    .await;
            }
            RemoteError::CredentialsRevoked(_) | RemoteError::CredentialsInvalid(_) => {
                self.teardown(err.to_string()).await;
            }
            RemoteError::NotAllowed(reason) => {
                self.notify_user(&format!("The remote service refused {method}: {reason}"))
                    .await;
            }
        }
        Err(err)
    }

    async fn enter_captcha(&self, challenge: CaptchaChallenge, origin: CaptchaOrigin) {
        {
            let mut inner = self.inner.lock().await;
            inner.state = SessionState::CaptchaPending;
            inner.captcha = Some(PendingCaptcha {
                challenge: challenge.clone(),
                origin,
            });
        }
        warn!(
            session = %self.key,
            sid = %challenge.sid,
            "session: captcha required; remote calls suspended"
        );
        self.emit_captcha_prompt(&challenge).await;
    }

    async fn emit_captcha_prompt(&self, challenge: &CaptchaChallenge) {
        let image = match self.remote.fetch_bytes(&challenge.image_url).await {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                warn!(session = %self.key, "session: captcha image download failed: {err}");
                None
            }
        };
        let content_id = image.as_deref().map(captcha_content_id);
        let prompt = CaptchaPrompt {
            to: self.key.clone(),
            image_url: challenge.image_url.clone(),
            image_b64: image.map(|bytes| STANDARD.encode(bytes)),
            content_id,
            form: CaptchaForm {
                title: "Captcha".to_string(),
                instructions: "Type the text from the image to continue".to_string(),
                field_var: "ocr".to_string(),
                field_required: true,
            },
        };
        self.send(OutboundStanza::Captcha(prompt)).await;
        self.send(self.gateway_presence(
            PresenceKind::ExtendedAway,
            Some("Captcha required".to_string()),
        ))
        .await;
    }

    async fn mark_offline(&self, reason: &str) {
        let was_online = std::mem::replace(&mut self.inner.lock().await.online, false);
        if was_online {
            warn!(session = %self.key, "session: remote network unreachable: {reason}");
            self.signal(SessionSignal::Offline(self.key.clone()));
        }
    }

    async fn teardown(&self, reason: String) {
        {
            let mut inner = self.inner.lock().await;
            inner.state = SessionState::Disconnected;
            inner.poll_endpoint = None;
            inner.captcha = None;
        }
        warn!(session = %self.key, "session: tearing down: {reason}");
        self.signal(SessionSignal::Teardown {
            key: self.key.clone(),
            reason,
        });
    }

    /// Sends a plain message from the gateway itself.
    pub async fn notify_user(&self, body: &str) {
        self.send(OutboundStanza::Message {
            to: self.key.clone(),
            from: None,
            body: body.to_string(),
        })
        .await;
    }

    fn apply_contact_status(
        &self,
        inner: &mut SessionInner,
        contact: ContactId,
        online: bool,
    ) -> OutboundStanza {
        let nick = inner.contacts.get_mut(&contact).map(|known| {
            known.online = online;
            known.name.clone()
        });
        OutboundStanza::Presence {
            to: self.key.clone(),
            from: Some(contact),
            kind: if online {
                PresenceKind::Available
            } else {
                PresenceKind::Unavailable
            },
            status: None,
            nick,
        }
    }

    fn gateway_presence(&self, kind: PresenceKind, status: Option<String>) -> OutboundStanza {
        OutboundStanza::Presence {
            to: self.key.clone(),
            from: None,
            kind,
            status,
            nick: None,
        }
    }

    fn contact_presence(&self, id: ContactId, contact: &Contact) -> OutboundStanza {
        let kind = if contact.online {
            PresenceKind::Available
        } else {
            PresenceKind::Unavailable
        };
        OutboundStanza::Presence {
            to: self.key.clone(),
            from: Some(id),
            kind,
            status: None,
            nick: Some(contact.name.clone()),
        }
    }

    async fn send(&self, stanza: OutboundStanza) {
        if let Err(err) = self.ctx.transport.send(stanza).await {
            warn!(session = %self.key, "session: outbound stanza dropped: {err}");
        }
    }

    fn signal(&self, signal: SessionSignal) {
        let tagged = TaggedSignal {
            instance: self.instance,
            signal,
        };
        if self.ctx.signals.send(tagged).is_err() {
            debug!(session = %self.key, "session: signal dropped; owner has stopped");
        }
    }
}

fn captcha_content_id(image: &[u8]) -> String {
    let digest = Sha256::digest(image);
    let hex: String = digest.iter().map(|byte| format!("{byte:02x}")).collect();
    format!("sha256+{hex}@bob.xmpp.org")
}
