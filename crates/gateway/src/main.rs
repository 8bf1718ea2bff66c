use std::{net::SocketAddr, sync::Arc};

use storage::Storage;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod admin;
mod config;
mod link;
mod supervisor;
#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

use admin::{build_router, AdminState};
use config::{load_settings, prepare_database_url};
use supervisor::{HttpRemoteFactory, Supervisor};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = load_settings()?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.log_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let remote_factory = Arc::new(HttpRemoteFactory::new(settings.remote_config()));
    let admin_addr: SocketAddr = settings.admin_bind.parse()?;
    let supervisor = Supervisor::new(settings, storage.clone(), remote_factory);

    let app = build_router(Arc::new(AdminState {
        storage,
        gateway: supervisor.current(),
    }));
    let listener = tokio::net::TcpListener::bind(admin_addr).await?;
    info!(addr = %admin_addr, "admin listening");
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            error!("admin: server stopped: {err}");
        }
    });

    tokio::select! {
        result = supervisor.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            Ok(())
        }
    }
}
