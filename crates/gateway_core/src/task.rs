use std::{future::Future, panic::AssertUnwindSafe};

use futures::FutureExt;
use shared::domain::SessionKey;
use tokio::task::JoinHandle;
use tracing::error;

/// Runs a per-session unit of work on its own task. A panic is logged and the
/// task dropped; nothing else in the gateway observes it.
pub fn spawn_supervised<F>(task: &'static str, session: &SessionKey, work: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let session = session.clone();
    tokio::spawn(async move {
        if AssertUnwindSafe(work).catch_unwind().await.is_err() {
            error!(task, session = %session, "worker: task panicked and was dropped");
        }
    })
}
