use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use futures::future::join_all;
use remote_api::RemoteApi;
use serde::Serialize;
use shared::{
    domain::{ContactId, MessageId, PollState, SessionKey, SessionState},
    error::RemoteError,
    protocol::InboundStanza,
};
use storage::{CredentialRecord, Storage};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    multiplexer::{Multiplexer, MultiplexerSettings},
    registry::{spawn_registry, RegistryHandle},
    relay::RelayPipeline,
    session::{
        Credentials, Session, SessionContext, SessionSettings, SessionSignal, TaggedSignal,
    },
    task::spawn_supervised,
    transport::Transport,
};

/// Builds a fresh remote client for each new session.
pub trait RemoteFactory: Send + Sync {
    fn create(&self) -> Arc<dyn RemoteApi>;
}

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub session: SessionSettings,
    pub multiplexer: MultiplexerSettings,
    pub housekeeping_interval: Duration,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            session: SessionSettings::default(),
            multiplexer: MultiplexerSettings::default(),
            housekeeping_interval: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub key: SessionKey,
    pub username: String,
    pub state: SessionState,
    pub poll_state: PollState,
    pub online: bool,
    pub cursor: MessageId,
    pub contacts: usize,
    pub resources: usize,
}

/// Background tasks of a started gateway.
pub struct GatewayTasks {
    handles: Vec<JoinHandle<()>>,
}

impl GatewayTasks {
    pub fn abort(&self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

/// Owns every session and routes stanzas, signals and housekeeping ticks to them.
pub struct Gateway {
    registry: RegistryHandle,
    registry_task: JoinHandle<()>,
    multiplexer: Arc<Multiplexer>,
    storage: Storage,
    remote_factory: Arc<dyn RemoteFactory>,
    ctx: SessionContext,
    housekeeping_interval: Duration,
    signals: Mutex<Option<mpsc::UnboundedReceiver<TaggedSignal>>>,
}

impl Gateway {
    pub fn new(
        storage: Storage,
        transport: Arc<dyn Transport>,
        remote_factory: Arc<dyn RemoteFactory>,
        pipeline: RelayPipeline,
        settings: GatewaySettings,
    ) -> Arc<Self> {
        let (registry, registry_task) = spawn_registry();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let multiplexer = Multiplexer::new(Arc::new(registry.clone()), settings.multiplexer);
        let ctx = SessionContext {
            transport,
            storage: storage.clone(),
            pipeline: Arc::new(pipeline),
            signals: signals_tx,
            settings: settings.session,
        };
        Arc::new(Self {
            registry,
            registry_task,
            multiplexer,
            storage,
            remote_factory,
            ctx,
            housekeeping_interval: settings.housekeeping_interval,
            signals: Mutex::new(Some(signals_rx)),
        })
    }

    pub fn multiplexer(&self) -> &Arc<Multiplexer> {
        &self.multiplexer
    }

    /// Restores persisted sessions and starts the poll loop, the signal
    /// handler and the housekeeping scheduler.
    pub async fn start(self: &Arc<Self>) -> Result<GatewayTasks> {
        let signals = self
            .signals
            .lock()
            .await
            .take()
            .context("gateway already started")?;
        let restored = self.restore_sessions().await?;
        info!(restored, "gateway: sessions restored from storage");

        let poll_loop = tokio::spawn(Arc::clone(&self.multiplexer).run_loop());
        let gateway = Arc::clone(self);
        let signal_loop = tokio::spawn(async move { gateway.run_signals(signals).await });
        let gateway = Arc::clone(self);
        let scheduler = tokio::spawn(async move { gateway.run_scheduler().await });
        Ok(GatewayTasks {
            handles: vec![poll_loop, signal_loop, scheduler],
        })
    }

    pub async fn restore_sessions(&self) -> Result<usize> {
        let records = self
            .storage
            .list_credentials()
            .await
            .context("failed to load persisted credentials")?;
        for record in &records {
            self.restore_session(record).await;
        }
        Ok(records.len())
    }

    async fn restore_session(&self, record: &CredentialRecord) -> Arc<Session> {
        let session = Session::restore(record, self.remote_factory.create(), self.ctx.clone());
        self.install(Arc::clone(&session)).await;
        let credentials = session.stored_credentials().await;
        self.spawn_authenticate(&session, credentials);
        session
    }

    async fn install(&self, session: Arc<Session>) {
        let key = session.key().clone();
        self.multiplexer.unregister(&key).await;
        if self.registry.insert(session).await.is_some() {
            debug!(session = %key, "gateway: replaced existing session");
        }
    }

    fn spawn_authenticate(&self, session: &Arc<Session>, credentials: Credentials) {
        let key = session.key().clone();
        let session = Arc::clone(session);
        spawn_supervised("authenticate", &key, async move {
            match session.authenticate(credentials).await {
                Ok(state) => debug!(session = %session.key(), ?state, "gateway: authentication finished"),
                Err(err) if err.is_credential_failure() => {}
                Err(err) => {
                    session
                        .notify_user(&format!("Could not log in to the remote network: {err}"))
                        .await;
                }
            }
        });
    }

    /// Routes one stanza from the messaging network.
    pub async fn dispatch(&self, stanza: InboundStanza) {
        match stanza {
            InboundStanza::Login {
                from,
                resource,
                username,
                token,
                password,
            } => {
                let credentials = Credentials {
                    username,
                    token,
                    password,
                };
                self.login(&from, &resource, credentials).await;
            }
            InboundStanza::Available { from, resource } => {
                self.resource_available(&from, &resource).await;
            }
            InboundStanza::Unavailable { from, resource } => {
                self.resource_unavailable(&from, &resource).await;
            }
            InboundStanza::Message { from, to, body } => {
                self.relay_outgoing(&from, to, body).await;
            }
            InboundStanza::CaptchaAnswer { from, answer } => {
                self.answer_captcha(&from, answer).await;
            }
            InboundStanza::Unregister { from } => {
                self.remove_user(&from, "unregistered by user").await;
            }
        }
    }

    pub async fn login(&self, key: &SessionKey, resource: &str, credentials: Credentials) {
        if let Some(existing) = self.registry.get(key).await {
            if existing.state().await == SessionState::Online {
                existing.add_resource(resource).await;
                return;
            }
        }
        info!(session = %key, "gateway: new login");
        let session = Session::new(
            key.clone(),
            credentials.username.clone(),
            self.remote_factory.create(),
            self.ctx.clone(),
        );
        self.install(Arc::clone(&session)).await;
        session.add_resource(resource).await;
        self.spawn_authenticate(&session, credentials);
    }

    pub async fn resource_available(&self, key: &SessionKey, resource: &str) {
        if let Some(session) = self.registry.get(key).await {
            session.add_resource(resource).await;
            match session.state().await {
                SessionState::Online => self.multiplexer.register(&session).await,
                SessionState::Unauthenticated => {
                    let credentials = session.stored_credentials().await;
                    if credentials.token.is_some() {
                        self.spawn_authenticate(&session, credentials);
                    }
                }
                _ => {}
            }
            return;
        }
        match self.storage.load_credentials(key).await {
            Ok(Some(record)) => {
                info!(session = %key, "gateway: known user came online; restoring session");
                let session = self.restore_session(&record).await;
                session.add_resource(resource).await;
            }
            Ok(None) => debug!(session = %key, "gateway: presence from unregistered user ignored"),
            Err(err) => warn!(session = %key, "gateway: failed to load credentials: {err:#}"),
        }
    }

    pub async fn resource_unavailable(&self, key: &SessionKey, resource: &str) {
        let Some(session) = self.registry.get(key).await else {
            return;
        };
        if session.remove_resource(resource).await {
            info!(session = %key, "gateway: last resource left; closing session");
            self.multiplexer.unregister(key).await;
            self.registry.remove(key).await;
            session.withdraw_presence().await;
        }
    }

    pub async fn relay_outgoing(&self, key: &SessionKey, contact: ContactId, body: String) {
        let Some(session) = self.registry.get(key).await else {
            debug!(session = %key, "gateway: message from user without a session dropped");
            return;
        };
        spawn_supervised("send_message", key, async move {
            match session.send_message(contact, &body).await {
                Ok(message_id) => {
                    debug!(session = %session.key(), %contact, ?message_id, "gateway: message sent");
                }
                Err(RemoteError::CaptchaRequired(_)) => {}
                Err(err) => {
                    session
                        .notify_user(&format!("Message to {contact} was not delivered: {err}"))
                        .await;
                }
            }
        });
    }

    pub async fn answer_captcha(&self, key: &SessionKey, answer: String) {
        let Some(session) = self.registry.get(key).await else {
            return;
        };
        spawn_supervised("answer_captcha", key, async move {
            session.answer_captcha(&answer).await;
        });
    }

    /// Drops the session, its poll handle and its stored credentials. Returns
    /// whether anything existed.
    pub async fn remove_user(&self, key: &SessionKey, reason: &str) -> bool {
        self.multiplexer.unregister(key).await;
        let session = self.registry.remove(key).await;
        let deleted = match self.storage.delete_credentials(key).await {
            Ok(deleted) => deleted,
            Err(err) => {
                warn!(session = %key, "gateway: failed to delete credentials: {err:#}");
                false
            }
        };
        let existed = session.is_some() || deleted;
        if let Some(session) = session {
            session.notify_teardown(reason).await;
        }
        if existed {
            info!(session = %key, reason, "gateway: user removed");
        }
        existed
    }

    /// Applies a session's signal, provided the session that raised it is
    /// still the one registered under its key.
    pub async fn handle_signal(&self, tagged: TaggedSignal) {
        let TaggedSignal { instance, signal } = tagged;
        let Some(session) = self.registry.get(signal.key()).await else {
            debug!(session = %signal.key(), "gateway: signal for unknown session ignored");
            return;
        };
        if session.instance() != instance {
            debug!(
                session = %signal.key(),
                stale = instance,
                current = session.instance(),
                "gateway: signal from replaced session ignored"
            );
            return;
        }
        match signal {
            SessionSignal::RequestRegistration(_) => self.multiplexer.register(&session).await,
            SessionSignal::Offline(key) => self.multiplexer.unregister(&key).await,
            SessionSignal::Teardown { key, reason } => {
                self.remove_user(&key, &reason).await;
            }
        }
    }

    async fn run_signals(&self, mut signals: mpsc::UnboundedReceiver<TaggedSignal>) {
        while let Some(signal) = signals.recv().await {
            self.handle_signal(signal).await;
        }
    }

    /// One housekeeping pass over every session.
    pub async fn tick(&self) {
        let now = Instant::now();
        let sessions = self.registry.list().await;
        join_all(sessions.iter().map(|session| session.housekeeping(now))).await;
    }

    async fn run_scheduler(&self) {
        let mut ticker = interval(self.housekeeping_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }

    pub async fn session_status(&self, key: &SessionKey) -> Option<SessionStatus> {
        let session = self.registry.get(key).await?;
        Some(self.status_of(&session).await)
    }

    pub async fn sessions(&self) -> Vec<SessionStatus> {
        let mut statuses = Vec::new();
        for session in self.registry.list().await {
            statuses.push(self.status_of(&session).await);
        }
        statuses
    }

    async fn status_of(&self, session: &Session) -> SessionStatus {
        let snapshot = session.snapshot().await;
        SessionStatus {
            poll_state: self.multiplexer.state(&snapshot.key).await,
            key: snapshot.key,
            username: snapshot.username,
            state: snapshot.state,
            online: snapshot.online,
            cursor: snapshot.cursor,
            contacts: snapshot.contacts,
            resources: snapshot.resources,
        }
    }

    /// Stops polling and forgets every session. Persisted records are kept.
    pub async fn shutdown(&self) {
        self.multiplexer.shutdown().await;
        let sessions = self.registry.clear().await;
        self.registry_task.abort();
        info!(sessions = sessions.len(), "gateway: shut down");
    }
}
