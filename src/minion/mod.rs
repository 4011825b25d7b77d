//! Minion side: staying connected to masters and executing what they
//! publish.
//!
//! - [`session`]: connection lifecycle, failover and backoff
//! - [`executor`]: the function table jobs call into
//! - [`runtime`]: turns publications into returns

pub mod executor;
pub mod runtime;
pub mod session;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::MinionConfig;
use crate::error::Result;
use crate::transport::Transport;

pub use executor::{CallContext, ExecutionResult, FunctionRegistry, MinionFunction};
pub use runtime::MinionRuntime;
pub use session::{
    FailoverCursor, MasterLink, MasterRecord, MasterResolver, Publication, ReconnectBackoff,
    Session, SessionEvent, SessionHandle, SessionManager, SessionState, TrustStore,
};

/// Bootstrap keys from `pki_dir`, connect, and execute jobs until shutdown
/// or a fatal session error.
pub async fn run_minion(
    config: MinionConfig,
    transport: Arc<dyn Transport>,
    shutdown: CancellationToken,
) -> Result<()> {
    let runtime = MinionRuntime::new(&config);
    let (manager, publications) = SessionManager::bootstrap(config, transport).await?;
    tracing::info!(id = %manager.identity().id(), fingerprint = %manager.identity().fingerprint(), "Minion identity loaded");

    let sessions = manager.run(shutdown.clone()).await?;
    let executor = tokio::spawn(runtime.run(publications, shutdown.clone()));

    let outcome = sessions.join().await;
    shutdown.cancel();
    if let Err(e) = executor.await {
        tracing::error!(error = %e, "Minion runtime task failed");
    }
    outcome
}
