use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use shared::domain::SessionKey;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::debug;

use crate::{multiplexer::SessionResolver, session::Session};

const COMMAND_BUFFER: usize = 256;

enum RegistryCommand {
    Insert {
        session: Arc<Session>,
        reply: oneshot::Sender<Option<Arc<Session>>>,
    },
    Remove {
        key: SessionKey,
        reply: oneshot::Sender<Option<Arc<Session>>>,
    },
    Get {
        key: SessionKey,
        reply: oneshot::Sender<Option<Arc<Session>>>,
    },
    List {
        reply: oneshot::Sender<Vec<Arc<Session>>>,
    },
    Clear {
        reply: oneshot::Sender<Vec<Arc<Session>>>,
    },
}

/// Cheap cloneable handle to the task that owns the session map.
#[derive(Clone)]
pub struct RegistryHandle {
    commands: mpsc::Sender<RegistryCommand>,
}

/// Starts the registry task. The map is owned by that task alone; every
/// mutation goes through the returned handle.
pub fn spawn_registry() -> (RegistryHandle, JoinHandle<()>) {
    let (commands, mut rx) = mpsc::channel(COMMAND_BUFFER);
    let task = tokio::spawn(async move {
        let mut sessions: HashMap<SessionKey, Arc<Session>> = HashMap::new();
        while let Some(command) = rx.recv().await {
            match command {
                RegistryCommand::Insert { session, reply } => {
                    let replaced = sessions.insert(session.key().clone(), session);
                    let _ = reply.send(replaced);
                }
                RegistryCommand::Remove { key, reply } => {
                    let _ = reply.send(sessions.remove(&key));
                }
                RegistryCommand::Get { key, reply } => {
                    let _ = reply.send(sessions.get(&key).cloned());
                }
                RegistryCommand::List { reply } => {
                    let mut all: Vec<_> = sessions.values().cloned().collect();
                    all.sort_by(|left, right| left.key().cmp(right.key()));
                    let _ = reply.send(all);
                }
                RegistryCommand::Clear { reply } => {
                    let _ = reply.send(sessions.drain().map(|(_, session)| session).collect());
                }
            }
        }
        debug!("registry: all handles dropped; stopping");
    });
    (RegistryHandle { commands }, task)
}

impl RegistryHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RegistryCommand,
    ) -> Option<T> {
        let (reply, response) = oneshot::channel();
        self.commands.send(build(reply)).await.ok()?;
        response.await.ok()
    }

    /// Returns the session this one replaced, if any.
    pub async fn insert(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        self.request(|reply| RegistryCommand::Insert { session, reply })
            .await
            .flatten()
    }

    pub async fn remove(&self, key: &SessionKey) -> Option<Arc<Session>> {
        let key = key.clone();
        self.request(|reply| RegistryCommand::Remove { key, reply })
            .await
            .flatten()
    }

    pub async fn get(&self, key: &SessionKey) -> Option<Arc<Session>> {
        let key = key.clone();
        self.request(|reply| RegistryCommand::Get { key, reply })
            .await
            .flatten()
    }

    /// All sessions ordered by key.
    pub async fn list(&self) -> Vec<Arc<Session>> {
        self.request(|reply| RegistryCommand::List { reply })
            .await
            .unwrap_or_default()
    }

    pub async fn clear(&self) -> Vec<Arc<Session>> {
        self.request(|reply| RegistryCommand::Clear { reply })
            .await
            .unwrap_or_default()
    }
}

#[async_trait]
impl SessionResolver for RegistryHandle {
    async fn resolve(&self, key: &SessionKey) -> Option<Arc<Session>> {
        self.get(key).await
    }
}
