//! Executes publications and sends the returns back to the master they came
//! from.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::MinionConfig;
use crate::master::target::Grains;
use crate::minion::executor::{CallContext, FunctionRegistry};
use crate::minion::session::Publication;
use crate::protocol::ReturnLoad;

#[derive(Debug, Clone)]
pub struct MinionRuntime {
    id: String,
    grains: Arc<Grains>,
    functions: FunctionRegistry,
    multiprocessing: bool,
}

impl MinionRuntime {
    pub fn new(config: &MinionConfig) -> Self {
        Self {
            id: config.id.clone(),
            grains: Arc::new(config.grains.clone()),
            functions: FunctionRegistry::with_builtins(),
            multiprocessing: config.multiprocessing,
        }
    }

    pub fn with_functions(mut self, functions: FunctionRegistry) -> Self {
        self.functions = functions;
        self
    }

    /// Drain publications until the sessions go away or `shutdown` fires.
    ///
    /// With `multiprocessing` every job runs in its own task, so a slow or
    /// panicking job does not hold up the others. Otherwise jobs run one at a
    /// time in arrival order.
    pub async fn run(self, mut publications: mpsc::Receiver<Publication>, shutdown: CancellationToken) {
        let mut jobs = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                publication = publications.recv() => match publication {
                    Some(publication) => {
                        if self.multiprocessing {
                            let runtime = self.clone();
                            jobs.spawn(async move { runtime.handle(publication).await; });
                        } else {
                            self.handle(publication).await;
                        }
                    }
                    None => break,
                },
                Some(joined) = jobs.join_next(), if !jobs.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "Job task ended abnormally");
                    }
                }
            }
        }

        if !jobs.is_empty() {
            tracing::info!(running = jobs.len(), "Abandoning running jobs");
            jobs.shutdown().await;
        }
    }

    /// Run one publication and send its return. The return is also handed
    /// back so callers can inspect it.
    pub async fn handle(&self, publication: Publication) -> ReturnLoad {
        let Publication { load, link } = publication;
        let ctx = CallContext {
            jid: load.jid.clone(),
            minion_id: self.id.clone(),
            grains: (*self.grains).clone(),
            link: Some(link.clone()),
        };
        let result = self.functions.execute(&load.fun, &ctx, &load.arg).await;

        let ret = ReturnLoad {
            jid: load.jid,
            id: self.id.clone(),
            fun: load.fun,
            success: result.success,
            ret: result.ret,
            timestamp: Utc::now(),
        };
        if let Err(e) = link.send_return(&ret).await {
            tracing::warn!(jid = %ret.jid, master = %link.master(), error = %e, "Failed to send return");
        }
        ret
    }
}
