//! Worker task: one per pool slot, one job at a time.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use recapsync_shared::{RecapSyncError, Result};

use crate::protocol::{ControlCommand, WorkerRequest, WorkerResponse};
use crate::session::{RecapSession, RecapSource, fetch_recaps};

/// Messages from worker tasks (and their exit watchers) to the pool.
#[derive(Debug)]
pub(crate) enum PoolEvent {
    /// A job settled through the message protocol.
    Response {
        slot: usize,
        generation: u64,
        response: WorkerResponse,
    },
    /// The worker task is gone.
    Exited {
        slot: usize,
        generation: u64,
        exit: WorkerExit,
    },
}

/// How a worker task ended.
#[derive(Debug)]
pub(crate) enum WorkerExit {
    /// Returned after a shutdown command or when its request channel closed.
    Clean,
    /// Its loop returned an error.
    Failed(String),
    /// It panicked.
    Panicked,
    /// It was forcibly terminated.
    Aborted,
}

impl WorkerExit {
    pub(crate) fn describe(&self) -> String {
        match self {
            Self::Clean => "exited".into(),
            Self::Failed(e) => format!("failed: {e}"),
            Self::Panicked => "panicked".into(),
            Self::Aborted => "aborted".into(),
        }
    }
}

pub(crate) struct Worker<S: RecapSource> {
    pub(crate) slot: usize,
    pub(crate) generation: u64,
    pub(crate) source: Arc<S>,
    pub(crate) requests: mpsc::UnboundedReceiver<WorkerRequest>,
    pub(crate) events: mpsc::UnboundedSender<PoolEvent>,
}

impl<S: RecapSource> Worker<S> {
    /// Serve requests until shutdown. The session is opened on the first job.
    pub(crate) async fn run(mut self) -> Result<()> {
        let mut session: Option<S::Session> = None;

        while let Some(request) = self.requests.recv().await {
            let (id, url) = match request {
                WorkerRequest::Control {
                    cmd: ControlCommand::Shutdown,
                } => {
                    debug!(slot = self.slot, "received shutdown");
                    break;
                }
                WorkerRequest::Parse { id, url } => (id, url),
            };

            if session.is_none() {
                match self.source.open().await {
                    Ok(opened) => {
                        info!(slot = self.slot, generation = self.generation, "session opened");
                        session = Some(opened);
                    }
                    Err(e) => {
                        warn!(slot = self.slot, job_id = %id, error = %e, "failed to open session");
                        self.respond(WorkerResponse::Failed {
                            id,
                            error: e.to_string(),
                        });
                        continue;
                    }
                }
            }
            let Some(active) = session.as_mut() else {
                continue;
            };

            let response = match fetch_recaps(active, &url).await {
                Ok(recaps) => WorkerResponse::Recaps { id, recaps },
                Err(e @ RecapSyncError::Worker(_)) => {
                    // The session is unusable; let the pool replace this worker.
                    return Err(e);
                }
                Err(e) => WorkerResponse::Failed {
                    id,
                    error: e.to_string(),
                },
            };
            self.respond(response);
        }

        if let Some(open) = session.take() {
            open.close().await;
            debug!(slot = self.slot, "session closed");
        }
        Ok(())
    }

    fn respond(&self, response: WorkerResponse) {
        let event = PoolEvent::Response {
            slot: self.slot,
            generation: self.generation,
            response,
        };
        if self.events.send(event).is_err() {
            debug!(slot = self.slot, "pool gone, dropping response");
        }
    }
}
