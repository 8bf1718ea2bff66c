use std::sync::Arc;

use anyhow::{Context, Result};
use gateway_core::{BroadcastTransport, Gateway, RelayPipeline, RemoteFactory};
use remote_api::{HttpRemoteClient, RemoteApi, RemoteConfig, RetryPolicy};
use storage::Storage;
use tokio::{net::TcpStream, sync::RwLock, time::sleep};
use tracing::{error, info, warn};

use crate::{config::Settings, link::serve_link};

const OUTBOUND_BUFFER: usize = 1024;

/// The gateway instance currently attached to the transport, if any.
pub type CurrentGateway = Arc<RwLock<Option<Arc<Gateway>>>>;

/// Builds one HTTP client per session over a shared connection pool.
pub struct HttpRemoteFactory {
    http: reqwest::Client,
    config: RemoteConfig,
    policy: RetryPolicy,
}

impl HttpRemoteFactory {
    pub fn new(config: RemoteConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            policy: RetryPolicy::default(),
        }
    }
}

impl RemoteFactory for HttpRemoteFactory {
    fn create(&self) -> Arc<dyn RemoteApi> {
        Arc::new(HttpRemoteClient::new(
            self.http.clone(),
            self.config.clone(),
            self.policy,
        ))
    }
}

pub struct Supervisor {
    settings: Settings,
    storage: Storage,
    remote_factory: Arc<dyn RemoteFactory>,
    current: CurrentGateway,
}

impl Supervisor {
    pub fn new(settings: Settings, storage: Storage, remote_factory: Arc<dyn RemoteFactory>) -> Self {
        Self {
            settings,
            storage,
            remote_factory,
            current: Arc::new(RwLock::new(None)),
        }
    }

    pub fn current(&self) -> CurrentGateway {
        Arc::clone(&self.current)
    }

    /// Runs gateway instances back to back. Losing the transport tears the
    /// instance down; the next one is rebuilt from persisted records.
    pub async fn run(&self) -> Result<()> {
        let mut generation: u64 = 0;
        loop {
            generation += 1;
            match self.run_instance(generation).await {
                Ok(()) => warn!(generation, "supervisor: transport closed"),
                Err(err) => error!(generation, "supervisor: gateway instance failed: {err:#}"),
            }
            info!(
                delay_seconds = self.settings.restart_delay_seconds,
                "supervisor: restarting gateway"
            );
            sleep(self.settings.restart_delay()).await;
        }
    }

    async fn run_instance(&self, generation: u64) -> Result<()> {
        let addr = &self.settings.transport_addr;
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to transport at {addr}"))?;
        info!(%addr, generation, "supervisor: transport connected");

        let transport = Arc::new(BroadcastTransport::new(OUTBOUND_BUFFER));
        let outbound = transport.subscribe();
        let gateway = Gateway::new(
            self.storage.clone(),
            transport,
            Arc::clone(&self.remote_factory),
            RelayPipeline::default(),
            self.settings.gateway_settings(),
        );
        let tasks = match gateway.start().await {
            Ok(tasks) => tasks,
            Err(err) => {
                gateway.shutdown().await;
                return Err(err);
            }
        };
        *self.current.write().await = Some(Arc::clone(&gateway));

        let (reader, writer) = stream.into_split();
        let result = serve_link(reader, writer, &gateway, outbound).await;

        *self.current.write().await = None;
        tasks.abort();
        gateway.shutdown().await;
        result
    }
}

#[cfg(test)]
#[path = "tests/supervisor_tests.rs"]
mod tests;
