//! The recap worker pool.
//!
//! All pool state (slots, idle list, FIFO queue, in-flight map) is owned by a
//! single actor task. [`RecapPool`] handles talk to it over a channel, so
//! `enqueue` never blocks and no state is shared behind locks.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, instrument, warn};

use recapsync_shared::{ParsedRecap, PoolConfig, RecapSyncError, Result};

use crate::protocol::{JobId, WorkerRequest, WorkerResponse};
use crate::session::RecapSource;
use crate::worker::{PoolEvent, Worker, WorkerExit};

type Reply = oneshot::Sender<Result<Vec<ParsedRecap>>>;

// ---------------------------------------------------------------------------
// Public handle
// ---------------------------------------------------------------------------

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Live worker slots.
    pub workers: usize,
    /// Workers waiting for a job.
    pub idle: usize,
    /// Jobs waiting for a worker.
    pub queued: usize,
    /// Jobs dispatched and not yet settled.
    pub in_flight: usize,
}

/// Cloneable handle to a running pool.
#[derive(Debug, Clone)]
pub struct RecapPool {
    commands: mpsc::UnboundedSender<Command>,
    next_id: Arc<AtomicU64>,
    size: usize,
}

impl RecapPool {
    /// Start a pool of `config.size` workers fetching through `source`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new<S: RecapSource>(source: S, config: PoolConfig) -> Self {
        let size = config.size.max(1);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let actor = PoolActor::new(Arc::new(source), config, commands_rx);
        tokio::spawn(actor.run());

        info!(size, "recap pool started");
        Self {
            commands: commands_tx,
            next_id: Arc::new(AtomicU64::new(1)),
            size,
        }
    }

    /// Configured number of workers.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Queue a recap page for parsing.
    ///
    /// Returns immediately; the returned handle resolves when a worker has
    /// processed the job, or fails with `PoolShutdown` once the pool closes.
    pub fn enqueue(&self, url: impl Into<String>) -> JobHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let (reply, rx) = oneshot::channel();
        let command = Command::Enqueue {
            id: id.clone(),
            url: url.into(),
            reply,
        };
        // If the actor is gone the reply sender is dropped with the command,
        // and the handle resolves to `PoolShutdown`.
        let _ = self.commands.send(command);
        JobHandle { id, rx }
    }

    /// Shut the pool down. Idempotent; resolves once every worker has exited
    /// or been terminated after its grace period.
    pub async fn close(&self) {
        let (done, rx) = oneshot::channel();
        if self.commands.send(Command::Close { done }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Current counters.
    pub async fn stats(&self) -> Result<PoolStats> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Stats { reply })
            .map_err(|_| RecapSyncError::PoolShutdown)?;
        rx.await.map_err(|_| RecapSyncError::PoolShutdown)
    }
}

/// Future for one enqueued job.
#[derive(Debug)]
pub struct JobHandle {
    id: JobId,
    rx: oneshot::Receiver<Result<Vec<ParsedRecap>>>,
}

impl JobHandle {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Future for JobHandle {
    type Output = Result<Vec<ParsedRecap>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|settled| settled.unwrap_or_else(|_| Err(RecapSyncError::PoolShutdown)))
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

enum Command {
    Enqueue { id: JobId, url: String, reply: Reply },
    Stats { reply: oneshot::Sender<PoolStats> },
    Close { done: oneshot::Sender<()> },
}

struct QueuedJob {
    id: JobId,
    url: String,
    reply: Reply,
}

struct InFlight {
    reply: Reply,
}

struct Slot {
    generation: u64,
    requests: mpsc::UnboundedSender<WorkerRequest>,
    abort: AbortHandle,
    alive: bool,
    busy: Option<JobId>,
}

struct PoolActor<S: RecapSource> {
    source: Arc<S>,
    config: PoolConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    events_tx: mpsc::UnboundedSender<PoolEvent>,
    events_rx: mpsc::UnboundedReceiver<PoolEvent>,
    slots: Vec<Slot>,
    idle: VecDeque<usize>,
    queue: VecDeque<QueuedJob>,
    in_flight: HashMap<JobId, InFlight>,
    closing: bool,
}

impl<S: RecapSource> PoolActor<S> {
    fn new(
        source: Arc<S>,
        config: PoolConfig,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut actor = Self {
            source,
            config,
            commands,
            events_tx,
            events_rx,
            slots: Vec::new(),
            idle: VecDeque::new(),
            queue: VecDeque::new(),
            in_flight: HashMap::new(),
            closing: false,
        };
        for slot in 0..actor.config.size.max(1) {
            let spawned = actor.spawn_worker(slot, 0);
            actor.slots.push(spawned);
            actor.idle.push_back(slot);
        }
        actor
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        // Every handle was dropped.
                        self.close().await;
                        break;
                    }
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event),
            }
        }
    }

    /// Spawn the worker task for `slot` plus a watcher reporting its exit.
    fn spawn_worker(&self, slot: usize, generation: u64) -> Slot {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let worker = Worker {
            slot,
            generation,
            source: Arc::clone(&self.source),
            requests: requests_rx,
            events: self.events_tx.clone(),
        };
        let handle = tokio::spawn(worker.run());
        let abort = handle.abort_handle();

        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let exit = match handle.await {
                Ok(Ok(())) => WorkerExit::Clean,
                Ok(Err(e)) => WorkerExit::Failed(e.to_string()),
                Err(e) if e.is_panic() => WorkerExit::Panicked,
                Err(_) => WorkerExit::Aborted,
            };
            let _ = events.send(PoolEvent::Exited {
                slot,
                generation,
                exit,
            });
        });

        debug!(slot, generation, "worker spawned");
        Slot {
            generation,
            requests: requests_tx,
            abort,
            alive: true,
            busy: None,
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Enqueue { id, url, reply } => {
                if self.closing {
                    let _ = reply.send(Err(RecapSyncError::PoolShutdown));
                    return;
                }
                debug!(job_id = %id, %url, "job queued");
                self.queue.push_back(QueuedJob { id, url, reply });
                self.dispatch();
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::Close { done } => {
                self.close().await;
                let _ = done.send(());
            }
        }
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            workers: self.slots.iter().filter(|s| s.alive).count(),
            idle: self.idle.len(),
            queued: self.queue.len(),
            in_flight: self.in_flight.len(),
        }
    }

    /// Hand queued jobs to idle workers, oldest job first.
    fn dispatch(&mut self) {
        while !self.queue.is_empty() {
            let Some(slot) = self.idle.pop_front() else {
                break;
            };
            let Some(job) = self.queue.pop_front() else {
                self.idle.push_front(slot);
                break;
            };

            let request = WorkerRequest::Parse {
                id: job.id.clone(),
                url: job.url.clone(),
            };
            if self.slots[slot].requests.send(request).is_err() {
                // The worker died and its exit has not been processed yet.
                // Leave the slot out of the idle list; the exit respawns it.
                self.queue.push_front(job);
                continue;
            }

            debug!(job_id = %job.id, slot, "job dispatched");
            self.slots[slot].busy = Some(job.id.clone());
            self.in_flight.insert(
                job.id,
                InFlight { reply: job.reply },
            );
        }
    }

    fn handle_event(&mut self, event: PoolEvent) {
        match event {
            PoolEvent::Response {
                slot,
                generation,
                response,
            } => self.on_response(slot, generation, response),
            PoolEvent::Exited {
                slot,
                generation,
                exit,
            } => self.on_exit(slot, generation, exit),
        }
    }

    fn on_response(&mut self, slot: usize, generation: u64, response: WorkerResponse) {
        if let Some(job) = self.in_flight.remove(response.id()) {
            let result = match response {
                WorkerResponse::Recaps { recaps, .. } => Ok(recaps),
                WorkerResponse::Failed { id, error } => {
                    Err(RecapSyncError::Job { id, message: error })
                }
            };
            let _ = job.reply.send(result);
        }

        if self.closing || self.slots[slot].generation != generation {
            return;
        }
        self.slots[slot].busy = None;
        if !self.idle.contains(&slot) {
            self.idle.push_back(slot);
        }
        self.dispatch();
    }

    fn on_exit(&mut self, slot: usize, generation: u64, exit: WorkerExit) {
        if self.slots[slot].generation != generation {
            return;
        }
        self.slots[slot].alive = false;
        self.idle.retain(|s| *s != slot);

        if self.closing {
            return;
        }

        warn!(slot, generation, exit = %exit.describe(), "worker terminated unexpectedly");
        if let Some(job_id) = self.slots[slot].busy.take() {
            if let Some(job) = self.in_flight.remove(&job_id) {
                let _ = job.reply.send(Err(RecapSyncError::Worker(format!(
                    "worker {slot} {} while running job {job_id}",
                    exit.describe()
                ))));
            }
        }
        let replacement = self.spawn_worker(slot, generation + 1);
        self.slots[slot] = replacement;
        self.idle.push_back(slot);
        info!(slot, generation = generation + 1, "worker respawned");
        self.dispatch();
    }

    #[instrument(skip_all)]
    async fn close(&mut self) {
        if self.closing {
            return;
        }
        self.closing = true;

        let queued = self.queue.len();
        let in_flight = self.in_flight.len();
        for job in self.queue.drain(..) {
            let _ = job.reply.send(Err(RecapSyncError::PoolShutdown));
        }
        for (_, job) in self.in_flight.drain() {
            let _ = job.reply.send(Err(RecapSyncError::PoolShutdown));
        }
        self.idle.clear();
        info!(queued, in_flight, "closing recap pool");

        self.shutdown_workers().await;
        info!("recap pool closed");
    }

    /// Ask every live worker to exit, then terminate the ones still running
    /// when the grace period ends.
    async fn shutdown_workers(&mut self) {
        for slot in self.slots.iter().filter(|s| s.alive) {
            let _ = slot.requests.send(WorkerRequest::shutdown());
        }

        let deadline = Instant::now() + self.config.shutdown_grace;
        while self.slots.iter().any(|s| s.alive) {
            match timeout_at(deadline, self.events_rx.recv()).await {
                Ok(Some(PoolEvent::Exited {
                    slot, generation, ..
                })) => {
                    if self.slots[slot].generation == generation {
                        self.slots[slot].alive = false;
                        debug!(slot, "worker exited");
                    }
                }
                // Jobs were already settled when closing began.
                Ok(Some(PoolEvent::Response { .. })) => {}
                Ok(None) => break,
                Err(_) => {
                    for (slot, state) in self.slots.iter_mut().enumerate() {
                        if state.alive {
                            warn!(slot, "worker did not exit within grace period, terminating");
                            state.abort.abort();
                            state.alive = false;
                        }
                    }
                    break;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
