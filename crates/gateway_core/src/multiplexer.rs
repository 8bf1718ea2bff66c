use std::{
    collections::{HashMap, HashSet},
    panic::AssertUnwindSafe,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use futures::FutureExt;
use shared::{
    domain::{PollState, SessionKey},
    error::RemoteError,
};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tracing::{debug, error, info, warn};

use crate::{
    session::{PollOutcome, Session},
    task::spawn_supervised,
};

/// Looks sessions up by key at the moment a poll completes.
#[async_trait]
pub trait SessionResolver: Send + Sync {
    async fn resolve(&self, key: &SessionKey) -> Option<Arc<Session>>;
}

#[derive(Debug, Clone)]
pub struct MultiplexerSettings {
    /// Upper bound on one wait for a ready poll handle.
    pub readiness_timeout: Duration,
    pub idle_sleep: Duration,
    pub reinit_attempts: usize,
    pub reinit_delay: Duration,
}

impl Default for MultiplexerSettings {
    fn default() -> Self {
        Self {
            readiness_timeout: Duration::from_secs(2),
            idle_sleep: Duration::from_millis(500),
            reinit_attempts: 10,
            reinit_delay: Duration::from_secs(10),
        }
    }
}

struct PollHandle {
    generation: u64,
    task: JoinHandle<()>,
}

struct PollReady {
    key: SessionKey,
    generation: u64,
    result: Result<Vec<u8>, RemoteError>,
}

#[derive(Default)]
struct PollSets {
    registered: HashMap<SessionKey, PollHandle>,
    buffering: HashSet<SessionKey>,
    abandoned: HashSet<SessionKey>,
    next_generation: u64,
}

/// Drives one outstanding long-poll per registered session and feeds the
/// results back into their sessions. A key is never both registered and
/// buffering; both sets live under one lock.
pub struct Multiplexer {
    sets: Mutex<PollSets>,
    ready_tx: mpsc::UnboundedSender<PollReady>,
    ready_rx: Mutex<Option<mpsc::UnboundedReceiver<PollReady>>>,
    resolver: Arc<dyn SessionResolver>,
    settings: MultiplexerSettings,
}

impl Multiplexer {
    pub fn new(resolver: Arc<dyn SessionResolver>, settings: MultiplexerSettings) -> Arc<Self> {
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            sets: Mutex::new(PollSets::default()),
            ready_tx,
            ready_rx: Mutex::new(Some(ready_rx)),
            resolver,
            settings,
        })
    }

    pub async fn state(&self, key: &SessionKey) -> PollState {
        let sets = self.sets.lock().await;
        if sets.registered.contains_key(key) {
            PollState::Registered
        } else if sets.buffering.contains(key) {
            PollState::Buffering
        } else if sets.abandoned.contains(key) {
            PollState::Abandoned
        } else {
            PollState::Unregistered
        }
    }

    pub async fn registered_count(&self) -> usize {
        self.sets.lock().await.registered.len()
    }

    /// Opens a poll handle for the session, or hands it to a re-init worker
    /// when it has no usable endpoint. No-op if already registered or buffering.
    pub async fn register(self: &Arc<Self>, session: &Arc<Session>) {
        let key = session.key().clone();
        if !session.is_pollable().await {
            debug!(session = %key, "poll: register skipped; session not pollable");
            return;
        }
        let mut sets = self.sets.lock().await;
        if sets.registered.contains_key(&key) || sets.buffering.contains(&key) {
            debug!(session = %key, "poll: already registered or buffering");
            return;
        }
        sets.abandoned.remove(&key);
        match session.poll_endpoint().await {
            Some(endpoint) => {
                let generation = sets.next_generation;
                sets.next_generation += 1;
                let tx = self.ready_tx.clone();
                let polling = Arc::clone(session);
                let task_key = key.clone();
                let task = tokio::spawn(async move {
                    let result = AssertUnwindSafe(polling.long_poll(&endpoint))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| {
                            Err(RemoteError::Transport("long-poll task panicked".to_string()))
                        });
                    let _ = tx.send(PollReady {
                        key: task_key,
                        generation,
                        result,
                    });
                });
                sets.registered
                    .insert(key.clone(), PollHandle { generation, task });
                debug!(session = %key, generation, "poll: registered");
            }
            None => {
                sets.buffering.insert(key.clone());
                drop(sets);
                info!(session = %key, "poll: no endpoint; buffering for re-init");
                self.spawn_reinit(Arc::clone(session));
            }
        }
    }

    /// Drops the session from whichever set holds it. Idempotent.
    pub async fn unregister(&self, key: &SessionKey) {
        let mut sets = self.sets.lock().await;
        sets.abandoned.remove(key);
        if sets.buffering.remove(key) {
            debug!(session = %key, "poll: removed from buffering");
            return;
        }
        if let Some(handle) = sets.registered.remove(key) {
            handle.task.abort();
            debug!(session = %key, "poll: unregistered");
        }
    }

    /// Aborts every outstanding poll and forgets all sessions.
    pub async fn shutdown(&self) {
        let mut sets = self.sets.lock().await;
        for (_, handle) in sets.registered.drain() {
            handle.task.abort();
        }
        sets.buffering.clear();
        sets.abandoned.clear();
    }

    fn spawn_reinit(self: &Arc<Self>, session: Arc<Session>) {
        let multiplexer = Arc::clone(self);
        let key = session.key().clone();
        spawn_supervised("poll_reinit", &key, async move {
            multiplexer.reinit_worker(session).await;
        });
    }

    async fn is_buffering(&self, key: &SessionKey) -> bool {
        self.sets.lock().await.buffering.contains(key)
    }

    /// Re-acquires a long-poll endpoint with bounded attempts. Gives up
    /// quietly if the session leaves the buffering set in the meantime.
    async fn reinit_worker(self: Arc<Self>, session: Arc<Session>) {
        let key = session.key().clone();
        let attempts = self.settings.reinit_attempts;
        for attempt in 1..=attempts {
            if !self.is_buffering(&key).await {
                debug!(session = %key, "poll: re-init cancelled");
                return;
            }
            if !session.is_pollable().await {
                self.sets.lock().await.buffering.remove(&key);
                debug!(session = %key, "poll: re-init stopped; session not pollable");
                return;
            }
            match session.acquire_poll_endpoint().await {
                Ok(()) => {
                    if !self.sets.lock().await.buffering.remove(&key) {
                        return;
                    }
                    info!(session = %key, attempt, "poll: endpoint re-acquired");
                    self.register(&session).await;
                    return;
                }
                Err(err) => {
                    warn!(session = %key, attempt, attempts, "poll: re-init attempt failed: {err}");
                }
            }
            if attempt < attempts {
                sleep(self.settings.reinit_delay).await;
            }
        }

        let abandoned = {
            let mut sets = self.sets.lock().await;
            let was_buffering = sets.buffering.remove(&key);
            if was_buffering {
                sets.abandoned.insert(key.clone());
            }
            was_buffering
        };
        if abandoned {
            error!(session = %key, attempts, "poll: re-init exhausted; session abandoned");
            session.notify_poll_abandoned().await;
        }
    }

    /// Waits on ready poll handles and dispatches their results. Only the first
    /// caller gets the ready queue; later calls return immediately.
    pub async fn run_loop(self: Arc<Self>) {
        let Some(mut ready_rx) = self.ready_rx.lock().await.take() else {
            warn!("poll: run loop already started");
            return;
        };
        info!("poll: run loop started");
        loop {
            if self.registered_count().await == 0 {
                sleep(self.settings.idle_sleep).await;
                continue;
            }
            match timeout(self.settings.readiness_timeout, ready_rx.recv()).await {
                Err(_) => continue,
                Ok(None) => break,
                Ok(Some(ready)) => self.handle_ready(ready).await,
            }
        }
    }

    async fn handle_ready(self: &Arc<Self>, ready: PollReady) {
        let current = {
            let mut sets = self.sets.lock().await;
            match sets.registered.get(&ready.key) {
                Some(handle) if handle.generation == ready.generation => {
                    sets.registered.remove(&ready.key)
                }
                _ => None,
            }
        };
        if current.is_none() {
            debug!(session = %ready.key, generation = ready.generation, "poll: stale result dropped");
            return;
        }
        let Some(session) = self.resolver.resolve(&ready.key).await else {
            debug!(session = %ready.key, "poll: session gone before its result arrived");
            return;
        };

        match ready.result {
            Err(err) => {
                warn!(session = %ready.key, "poll: handle errored; re-registering: {err}");
                self.register(&session).await;
            }
            Ok(raw) => match session.process_poll_result(&raw).await {
                PollOutcome::Continue | PollOutcome::Reinitialize => {
                    self.register(&session).await;
                }
                PollOutcome::Suspended => {
                    debug!(session = %ready.key, "poll: suspended until captcha is answered");
                }
            },
        }
    }
}
