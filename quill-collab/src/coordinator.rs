//! Document session coordinator: the single authoritative writer for one
//! document.
//!
//! ## Architecture
//!
//! ```text
//!  gateway / hub                 coordinator task (one per document)
//! ┌──────────────────┐ Command  ┌─────────────────────────────────────────┐
//! │ CoordinatorHandle│ ───────► │ bounded queue, strictly sequential      │
//! │ (cloneable)      │ ◄─────── │  DocumentState · EventLog · Registry    │
//! └──────────────────┘ oneshot  └──────┬─────────────────────┬────────────┘
//!                                      │ try_send            │ PersistJob
//!                                      ▼                     ▼
//!                          participant outbound      persistence task
//!                          queues (weak refs)        (spawn_blocking I/O)
//! ```
//!
//! Lifecycle: `Unloaded → Active (participants > 0) → Idle (no
//! participants, timer armed) → Unloaded`. On idle timeout the coordinator
//! closes its queue, answers anything still queued with `DocumentClosed`,
//! flushes a final checkpoint and only then reports itself evicted, so a
//! fresh coordinator for the same document always loads the flushed state.
//!
//! Events the coordinator emits to one participant (acks, recovery) travel
//! through the same outbound queue as broadcasts, so each participant sees
//! them in log order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::broadcast::Broadcaster;
use crate::document::DocumentState;
use crate::error::{CollabError, CollabResult};
use crate::event_log::{Attribution, EventLog, EventLogEntry, RecoverySnapshot};
use crate::operation::{now_millis, DocumentId, OpKind, Operation, UserId, Version};
use crate::persistence::{
    spawn_persistence, PersistEvent, PersistJob, PersistenceStats, RetryPolicy,
};
use crate::presence::{Outbound, Selection, SessionRegistry};
use crate::protocol::{
    ChangeRecord, PresenceEntry, RecoveryMode, RecoveryState, ServerEvent, WireOp,
};
use crate::storage::CheckpointStore;
use crate::transform::{compact, invert, rebase_deletion, transform};

/// Undo history kept per user.
const MAX_UNDO_DEPTH: usize = 100;

#[derive(Debug, Clone, Copy)]
enum Step {
    Undo,
    Redo,
}

impl Step {
    fn opposite(self) -> Self {
        match self {
            Step::Undo => Step::Redo,
            Step::Redo => Step::Undo,
        }
    }

    fn exhausted(self, user_id: &str) -> CollabError {
        match self {
            Step::Undo => CollabError::NothingToUndo(user_id.to_string()),
            Step::Redo => CollabError::NothingToRedo(user_id.to_string()),
        }
    }
}

fn push_step(stacks: &mut HashMap<UserId, Vec<Vec<Version>>>, user_id: &str, group: Vec<Version>) {
    let stack = stacks.entry(user_id.to_string()).or_default();
    stack.push(group);
    if stack.len() > MAX_UNDO_DEPTH {
        stack.remove(0);
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Command queue capacity; senders wait when it is full
    pub queue_capacity: usize,
    /// Evict this long after the last participant leaves
    pub idle_timeout: Duration,
    /// Drop participants silent for longer than this
    pub presence_timeout: Duration,
    pub presence_sweep_interval: Duration,
    /// Periodic checkpoint of a changed document (`None` = only on save/evict)
    pub checkpoint_interval: Option<Duration>,
    /// Log entries kept in memory after a checkpoint covers them
    pub retain_after_checkpoint: usize,
    pub max_checkpoint_retries: u32,
    pub checkpoint_backoff: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            idle_timeout: Duration::from_secs(300),
            presence_timeout: Duration::from_secs(60),
            presence_sweep_interval: Duration::from_secs(5),
            checkpoint_interval: Some(Duration::from_secs(30)),
            retain_after_checkpoint: 500,
            max_checkpoint_retries: 5,
            checkpoint_backoff: Duration::from_millis(200),
        }
    }
}

impl CoordinatorConfig {
    /// Short timers for tests.
    pub fn for_testing() -> Self {
        Self {
            queue_capacity: 64,
            idle_timeout: Duration::from_millis(200),
            presence_timeout: Duration::from_secs(5),
            presence_sweep_interval: Duration::from_millis(50),
            checkpoint_interval: None,
            retain_after_checkpoint: 3,
            max_checkpoint_retries: 2,
            checkpoint_backoff: Duration::from_millis(5),
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_checkpoint_retries,
            backoff: self.checkpoint_backoff,
        }
    }
}

/// State handed to a participant when it joins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinSnapshot {
    pub text: String,
    pub version: Version,
    /// Compacted retained history
    pub history: Vec<Operation>,
    pub participants: Vec<PresenceEntry>,
}

/// An accepted operation as it was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submitted {
    pub op: Operation,
    pub version: Version,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recovery {
    Replay {
        operations: Vec<Operation>,
        current_version: Version,
    },
    Snapshot(RecoverySnapshot),
}

/// Point-in-time view of a coordinator, for operators and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentInfo {
    pub document_id: DocumentId,
    pub text: String,
    pub version: Version,
    pub participants: usize,
    /// Oldest version a client can replay from
    pub log_base: Version,
    pub log_len: usize,
    pub durable_version: Version,
}

/// Shared services a coordinator is spawned with.
#[derive(Clone)]
pub struct CoordinatorContext {
    pub store: Arc<dyn CheckpointStore>,
    pub broadcaster: Arc<Broadcaster>,
    pub persistence_stats: Arc<PersistenceStats>,
    /// Told `(document_id, generation)` once the coordinator has shut down
    pub evicted: Option<mpsc::UnboundedSender<(DocumentId, u64)>>,
}

impl CoordinatorContext {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            store,
            broadcaster: Arc::new(Broadcaster::new()),
            persistence_stats: Arc::new(PersistenceStats::default()),
            evicted: None,
        }
    }
}

type Reply<T> = oneshot::Sender<CollabResult<T>>;

enum Command {
    Join {
        user_id: UserId,
        display_name: String,
        channel: Outbound,
        connection_id: Uuid,
        reply: Reply<JoinSnapshot>,
    },
    Leave {
        user_id: UserId,
        reply: Reply<()>,
    },
    Disconnect {
        user_id: UserId,
        connection_id: Uuid,
        reply: Reply<bool>,
    },
    Submit {
        user_id: UserId,
        op: Operation,
        client_version: i64,
        reply: Reply<Submitted>,
    },
    UpdateCursor {
        user_id: UserId,
        position: usize,
        selection: Option<Selection>,
        reply: Reply<()>,
    },
    MarkActive {
        user_id: UserId,
    },
    Recover {
        user_id: UserId,
        last_known_version: i64,
        reply: Reply<Recovery>,
    },
    SaveCheckpoint {
        requested_by: UserId,
        reply: Reply<Version>,
    },
    Undo {
        user_id: UserId,
        reply: Reply<Vec<Submitted>>,
    },
    Redo {
        user_id: UserId,
        reply: Reply<Vec<Submitted>>,
    },
    Attribution {
        since: Version,
        reply: Reply<Vec<Attribution>>,
    },
    Inspect {
        reply: Reply<DocumentInfo>,
    },
    Shutdown,
}

impl Command {
    fn reject(self, err: CollabError) {
        match self {
            Command::Join { reply, .. } => drop(reply.send(Err(err))),
            Command::Leave { reply, .. } => drop(reply.send(Err(err))),
            Command::Disconnect { reply, .. } => drop(reply.send(Err(err))),
            Command::Submit { reply, .. } => drop(reply.send(Err(err))),
            Command::UpdateCursor { reply, .. } => drop(reply.send(Err(err))),
            Command::Recover { reply, .. } => drop(reply.send(Err(err))),
            Command::SaveCheckpoint { reply, .. } => drop(reply.send(Err(err))),
            Command::Undo { reply, .. } => drop(reply.send(Err(err))),
            Command::Redo { reply, .. } => drop(reply.send(Err(err))),
            Command::Attribution { reply, .. } => drop(reply.send(Err(err))),
            Command::Inspect { reply } => drop(reply.send(Err(err))),
            Command::MarkActive { .. } | Command::Shutdown => {}
        }
    }
}

/// Cloneable handle to a running coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    document_id: DocumentId,
    generation: u64,
    tx: mpsc::Sender<Command>,
    done: watch::Receiver<bool>,
}

impl CoordinatorHandle {
    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Distinguishes successive coordinators for the same document.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the coordinator has flushed and stopped.
    pub async fn closed(&self) {
        let mut done = self.done.clone();
        let _ = done.wait_for(|d| *d).await;
    }

    fn closed_error(&self) -> CollabError {
        CollabError::DocumentClosed(self.document_id.clone())
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> CollabResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| self.closed_error())?;
        rx.await.map_err(|_| self.closed_error())?
    }

    pub async fn join(
        &self,
        user_id: &str,
        display_name: &str,
        channel: Outbound,
        connection_id: Uuid,
    ) -> CollabResult<JoinSnapshot> {
        self.request(|reply| Command::Join {
            user_id: user_id.to_string(),
            display_name: display_name.to_string(),
            channel,
            connection_id,
            reply,
        })
        .await
    }

    pub async fn leave(&self, user_id: &str) -> CollabResult<()> {
        self.request(|reply| Command::Leave {
            user_id: user_id.to_string(),
            reply,
        })
        .await
    }

    /// Remove `user_id` if it is still bound to `connection_id`.
    pub async fn disconnect(&self, user_id: &str, connection_id: Uuid) -> CollabResult<bool> {
        self.request(|reply| Command::Disconnect {
            user_id: user_id.to_string(),
            connection_id,
            reply,
        })
        .await
    }

    /// Submit `op`, generated against `client_version`.
    pub async fn submit_operation(
        &self,
        user_id: &str,
        op: Operation,
        client_version: i64,
    ) -> CollabResult<Submitted> {
        self.request(|reply| Command::Submit {
            user_id: user_id.to_string(),
            op,
            client_version,
            reply,
        })
        .await
    }

    pub async fn update_cursor(
        &self,
        user_id: &str,
        position: usize,
        selection: Option<Selection>,
    ) -> CollabResult<()> {
        self.request(|reply| Command::UpdateCursor {
            user_id: user_id.to_string(),
            position,
            selection,
            reply,
        })
        .await
    }

    /// Refresh the participant's last-seen time. Does not wait for a reply.
    pub async fn mark_active(&self, user_id: &str) -> CollabResult<()> {
        self.tx
            .send(Command::MarkActive {
                user_id: user_id.to_string(),
            })
            .await
            .map_err(|_| self.closed_error())
    }

    pub async fn recover(&self, user_id: &str, last_known_version: i64) -> CollabResult<Recovery> {
        self.request(|reply| Command::Recover {
            user_id: user_id.to_string(),
            last_known_version,
            reply,
        })
        .await
    }

    /// Queue a checkpoint of the current state. Returns the version queued.
    pub async fn save_checkpoint(&self, requested_by: &str) -> CollabResult<Version> {
        self.request(|reply| Command::SaveCheckpoint {
            requested_by: requested_by.to_string(),
            reply,
        })
        .await
    }

    /// Revert the user's most recent change that has not been undone.
    ///
    /// Text other participants typed inside the reverted range is kept, so
    /// one undo may apply several operations (one per surviving range).
    pub async fn undo(&self, user_id: &str) -> CollabResult<Vec<Submitted>> {
        self.request(|reply| Command::Undo {
            user_id: user_id.to_string(),
            reply,
        })
        .await
    }

    /// Re-apply the user's most recently undone change. A new edit by the
    /// user clears what can be redone.
    pub async fn redo(&self, user_id: &str) -> CollabResult<Vec<Submitted>> {
        self.request(|reply| Command::Redo {
            user_id: user_id.to_string(),
            reply,
        })
        .await
    }

    pub async fn attribution(&self, since: Version) -> CollabResult<Vec<Attribution>> {
        self.request(|reply| Command::Attribution { since, reply }).await
    }

    pub async fn inspect(&self) -> CollabResult<DocumentInfo> {
        self.request(|reply| Command::Inspect { reply }).await
    }

    /// Ask the coordinator to flush and stop, and wait until it has.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
        self.closed().await;
    }
}

/// Spawn a coordinator for `document_id`. Loading happens inside the task;
/// commands sent meanwhile wait in the queue.
pub fn spawn(
    document_id: impl Into<DocumentId>,
    generation: u64,
    config: CoordinatorConfig,
    ctx: CoordinatorContext,
) -> CoordinatorHandle {
    let document_id = document_id.into();
    let (tx, rx) = mpsc::channel(config.queue_capacity);
    let (done_tx, done_rx) = watch::channel(false);

    let handle = CoordinatorHandle {
        document_id: document_id.clone(),
        generation,
        tx,
        done: done_rx,
    };

    tokio::spawn(run(document_id, generation, config, ctx, rx, done_tx));
    handle
}

async fn run(
    document_id: DocumentId,
    generation: u64,
    config: CoordinatorConfig,
    ctx: CoordinatorContext,
    mut commands: mpsc::Receiver<Command>,
    done: watch::Sender<bool>,
) {
    let evicted = ctx.evicted.clone();

    let loaded = load(&ctx.store, &document_id).await;
    match loaded {
        Ok((doc, log)) => {
            log::info!(
                "Loaded document {document_id} at v{} ({} replayed tail entries)",
                doc.version(),
                log.len()
            );
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let (persist_tx, persist_task) = spawn_persistence(
                document_id.clone(),
                Arc::clone(&ctx.store),
                config.retry_policy(),
                Arc::clone(&ctx.persistence_stats),
                events_tx,
            );
            let coordinator = Coordinator::new(doc, log, config, ctx, persist_tx);
            coordinator
                .run(&mut commands, events_rx, persist_task)
                .await;
        }
        Err(e) => {
            log::error!("Failed to load document {document_id}: {e}");
            drop(ctx);
            commands.close();
            while let Ok(cmd) = commands.try_recv() {
                cmd.reject(e.clone());
            }
        }
    }

    let _ = done.send(true);
    if let Some(evicted) = evicted {
        let _ = evicted.send((document_id, generation));
    }
}

/// Checkpoint plus the durable tail written after it.
async fn load(
    store: &Arc<dyn CheckpointStore>,
    document_id: &str,
) -> CollabResult<(DocumentState, EventLog)> {
    let store = Arc::clone(store);
    let id = document_id.to_string();
    let (checkpoint, tail) = tokio::task::spawn_blocking(move || {
        let checkpoint = store.load_checkpoint(&id)?;
        let after = checkpoint.as_ref().map_or(0, |c| c.version);
        let tail = store.load_log_since(&id, after)?;
        Ok::<_, CollabError>((checkpoint, tail))
    })
    .await
    .map_err(|e| CollabError::Persistence(e.to_string()))??;

    let mut doc = match checkpoint {
        Some(cp) => DocumentState::from_checkpoint(cp),
        None => DocumentState::new(document_id),
    };
    let mut log = EventLog::new(doc.version());

    for entry in tail {
        if entry.version != doc.version() + 1 {
            log::warn!(
                "Log tail of {document_id} jumps from v{} to v{}; ignoring the rest",
                doc.version(),
                entry.version
            );
            break;
        }
        let applied = doc.apply(&entry.op)?;
        log.append(EventLogEntry {
            removed: applied.removed,
            ..entry
        })?;
    }

    Ok((doc, log))
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

async fn tick(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(i) => {
            i.tick().await;
        }
        None => std::future::pending().await,
    }
}

struct Coordinator {
    doc: DocumentState,
    log: EventLog,
    registry: SessionRegistry,
    /// Per user, groups of log versions that one undo step reverts
    undo: HashMap<UserId, Vec<Vec<Version>>>,
    redo: HashMap<UserId, Vec<Vec<Version>>>,
    config: CoordinatorConfig,
    broadcaster: Arc<Broadcaster>,
    persist: Option<mpsc::UnboundedSender<PersistJob>>,
    /// Highest version handed to the persistence task as a checkpoint
    checkpoint_queued: Version,
    /// Highest version known to be durably checkpointed
    durable_version: Version,
    idle_deadline: Option<Instant>,
    shutdown_requested: bool,
}

impl Coordinator {
    fn new(
        doc: DocumentState,
        log: EventLog,
        config: CoordinatorConfig,
        ctx: CoordinatorContext,
        persist: mpsc::UnboundedSender<PersistJob>,
    ) -> Self {
        let checkpointed = log.base_version();
        Self {
            registry: SessionRegistry::new(config.presence_timeout),
            idle_deadline: Some(Instant::now() + config.idle_timeout),
            doc,
            log,
            undo: HashMap::new(),
            redo: HashMap::new(),
            config,
            broadcaster: ctx.broadcaster,
            persist: Some(persist),
            checkpoint_queued: checkpointed,
            durable_version: checkpointed,
            shutdown_requested: false,
        }
    }

    fn id(&self) -> &str {
        self.doc.document_id()
    }

    async fn run(
        mut self,
        commands: &mut mpsc::Receiver<Command>,
        mut persist_events: mpsc::UnboundedReceiver<PersistEvent>,
        persist_task: JoinHandle<()>,
    ) {
        let mut sweep = tokio::time::interval(self.config.presence_sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut autosave = self.config.checkpoint_interval.map(|every| {
            let mut i = tokio::time::interval_at(Instant::now() + every, every);
            i.set_missed_tick_behavior(MissedTickBehavior::Delay);
            i
        });

        loop {
            let idle = self.idle_deadline;
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                Some(event) = persist_events.recv() => self.on_persisted(event),
                _ = sweep.tick() => self.sweep_presence(),
                _ = tick(&mut autosave) => self.autosave(),
                _ = sleep_until(idle) => {
                    log::info!("Document {} idle for {:?}, evicting", self.id(), self.config.idle_timeout);
                    break;
                }
            }
            if self.shutdown_requested {
                break;
            }
        }

        commands.close();
        let mut rejected = 0usize;
        while let Ok(cmd) = commands.try_recv() {
            cmd.reject(CollabError::DocumentClosed(self.id().to_string()));
            rejected += 1;
        }
        if rejected > 0 {
            log::debug!("Rejected {rejected} commands queued for closing document {}", self.id());
        }

        self.flush(persist_task).await;
    }

    /// Final checkpoint; waits until the persistence task has drained.
    async fn flush(mut self, persist_task: JoinHandle<()>) {
        if self.doc.version() > self.checkpoint_queued {
            self.queue_checkpoint(None);
        }
        drop(self.persist.take());
        if let Err(e) = persist_task.await {
            log::error!("Persistence task for {} panicked: {e}", self.id());
        }
        log::info!("Document {} unloaded at v{}", self.id(), self.doc.version());
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Join {
                user_id,
                display_name,
                channel,
                connection_id,
                reply,
            } => {
                let _ = reply.send(Ok(self.join(&user_id, &display_name, channel, connection_id)));
            }
            Command::Leave { user_id, reply } => {
                let _ = reply.send(self.leave(&user_id));
            }
            Command::Disconnect {
                user_id,
                connection_id,
                reply,
            } => {
                let removed = self.registry.disconnect(&user_id, connection_id).is_some();
                if removed {
                    log::info!("{user_id} disconnected from {}", self.id());
                    self.announce_departure(&user_id);
                }
                let _ = reply.send(Ok(removed));
            }
            Command::Submit {
                user_id,
                op,
                client_version,
                reply,
            } => {
                let _ = reply.send(self.submit(&user_id, op, client_version));
            }
            Command::UpdateCursor {
                user_id,
                position,
                selection,
                reply,
            } => {
                let result = self.registry.update_cursor(&user_id, position, selection);
                if result.is_ok() {
                    self.broadcaster.broadcast(
                        &self.registry,
                        ServerEvent::CursorPosition {
                            user_id: user_id.clone(),
                            position,
                            selection,
                        },
                        Some(&user_id),
                    );
                }
                let _ = reply.send(result);
            }
            Command::MarkActive { user_id } => {
                self.registry.mark_active(&user_id);
            }
            Command::Recover {
                user_id,
                last_known_version,
                reply,
            } => {
                let _ = reply.send(Ok(self.recover(&user_id, last_known_version)));
            }
            Command::SaveCheckpoint {
                requested_by,
                reply,
            } => {
                let version = self.queue_checkpoint(Some(requested_by));
                let _ = reply.send(Ok(version));
            }
            Command::Undo { user_id, reply } => {
                let _ = reply.send(self.step(&user_id, Step::Undo));
            }
            Command::Redo { user_id, reply } => {
                let _ = reply.send(self.step(&user_id, Step::Redo));
            }
            Command::Attribution { since, reply } => {
                let _ = reply.send(Ok(self.log.entries_since(since)));
            }
            Command::Inspect { reply } => {
                let _ = reply.send(Ok(self.info()));
            }
            Command::Shutdown => {
                log::info!("Shutdown requested for {}", self.id());
                self.shutdown_requested = true;
            }
        }
    }

    // ─── Sessions ─────────────────────────────────────────────────────

    fn join(
        &mut self,
        user_id: &str,
        display_name: &str,
        channel: Outbound,
        connection_id: Uuid,
    ) -> JoinSnapshot {
        if let Some(previous) = self.registry.join(user_id, display_name, &channel, connection_id) {
            log::debug!(
                "{user_id} rejoined {}, replacing connection {}",
                self.id(),
                previous.connection_id
            );
        }
        self.idle_deadline = None;
        log::info!(
            "{user_id} joined {} at v{} ({} participants)",
            self.id(),
            self.doc.version(),
            self.registry.len()
        );

        let history = compact(&self.log.operations_since(self.log.base_version()));
        let snapshot = JoinSnapshot {
            text: self.doc.text().to_string(),
            version: self.doc.version(),
            history,
            participants: self.registry.snapshot(),
        };

        if let Some(p) = self.registry.get(user_id) {
            let state = RecoveryState {
                mode: RecoveryMode::Snapshot,
                version: snapshot.version,
                text: Some(snapshot.text.clone()),
                history: snapshot.history.iter().map(ChangeRecord::from).collect(),
            };
            self.broadcaster
                .send_to(p, Arc::new(ServerEvent::Recovery { state }));
        }

        self.broadcaster.broadcast(
            &self.registry,
            ServerEvent::UserJoined {
                user_id: user_id.to_string(),
                username: display_name.to_string(),
            },
            Some(user_id),
        );
        self.broadcast_presence();
        snapshot
    }

    fn leave(&mut self, user_id: &str) -> CollabResult<()> {
        self.registry
            .leave(user_id)
            .ok_or_else(|| CollabError::UnknownParticipant(user_id.to_string()))?;
        log::info!("{user_id} left {}", self.id());
        self.announce_departure(user_id);
        Ok(())
    }

    fn announce_departure(&mut self, user_id: &str) {
        self.broadcaster.broadcast(
            &self.registry,
            ServerEvent::UserLeft {
                user_id: user_id.to_string(),
            },
            None,
        );
        self.broadcast_presence();
        self.arm_idle_if_empty();
    }

    fn broadcast_presence(&self) {
        self.broadcaster.broadcast(
            &self.registry,
            ServerEvent::Presence {
                users: self.registry.snapshot(),
            },
            None,
        );
    }

    fn sweep_presence(&mut self) {
        let removed = self.registry.sweep(std::time::Instant::now());
        if removed.is_empty() {
            return;
        }
        for p in &removed {
            log::info!("{} timed out of {}", p.user_id, self.id());
            if p.is_connected() {
                // Still reachable but silent: tell it to join again.
                self.broadcaster.send_to(
                    p,
                    Arc::new(ServerEvent::SessionExpired {
                        user_id: p.user_id.clone(),
                    }),
                );
            }
            self.broadcaster.broadcast(
                &self.registry,
                ServerEvent::UserLeft {
                    user_id: p.user_id.clone(),
                },
                None,
            );
        }
        self.broadcast_presence();
        self.arm_idle_if_empty();
    }

    fn arm_idle_if_empty(&mut self) {
        if self.registry.is_empty() && self.idle_deadline.is_none() {
            log::debug!("{} has no participants, idle timer armed", self.id());
            self.idle_deadline = Some(Instant::now() + self.config.idle_timeout);
        }
    }

    // ─── Operations ───────────────────────────────────────────────────

    fn submit(
        &mut self,
        user_id: &str,
        mut op: Operation,
        client_version: i64,
    ) -> CollabResult<Submitted> {
        if !self.registry.contains(user_id) {
            return Err(CollabError::UnknownParticipant(user_id.to_string()));
        }
        op.user_id = user_id.to_string();
        op.validate()?;

        let current = self.doc.version();
        let oldest = self.log.base_version();
        let base = u64::try_from(client_version)
            .ok()
            .filter(|v| *v >= oldest && *v <= current)
            .ok_or(CollabError::StaleClient {
                client_version,
                oldest,
                current,
            })?;

        let submitted = self.admit(op, base)?;
        push_step(&mut self.undo, user_id, vec![submitted.version]);
        self.redo.remove(user_id);
        Ok(submitted)
    }

    /// Transform `op` (generated at `base`) over every later entry, apply it
    /// and fan it out.
    fn admit(&mut self, mut op: Operation, base: Version) -> CollabResult<Submitted> {
        let current = self.doc.version();
        for entry in self.log.slice(base + 1, current) {
            op = transform(&op, &entry.op);
        }
        op.origin_version = current;

        let applied = self.doc.apply(&op).map_err(|e| {
            log::error!(
                "Transformed operation from {} does not fit {} at v{current}: {e}",
                op.user_id,
                self.id()
            );
            e
        })?;

        let entry = EventLogEntry {
            version: applied.version,
            op: op.clone(),
            timestamp: op.timestamp,
            removed: applied.removed,
        };
        self.log.append(entry.clone())?;
        self.persist(PersistJob::Append(entry.clone()));

        log::trace!("{} v{} by {}", self.id(), entry.version, op.user_id);

        if let Some(author) = self.registry.get(&op.user_id) {
            self.broadcaster.send_to(
                author,
                Arc::new(ServerEvent::Ack {
                    op: WireOp::from(&op),
                    version: entry.version,
                }),
            );
        }
        self.broadcaster.broadcast(
            &self.registry,
            ServerEvent::document_change(&entry),
            Some(&op.user_id),
        );

        Ok(Submitted {
            op,
            version: entry.version,
        })
    }

    /// Undo or redo one step for `user_id`. Steps whose effect other
    /// participants have already erased are skipped.
    fn step(&mut self, user_id: &str, step: Step) -> CollabResult<Vec<Submitted>> {
        if !self.registry.contains(user_id) {
            return Err(CollabError::UnknownParticipant(user_id.to_string()));
        }

        loop {
            let group = self
                .stack(step)
                .get_mut(user_id)
                .and_then(Vec::pop)
                .ok_or_else(|| step.exhausted(user_id))?;

            match self.revert(user_id, &group) {
                Ok(applied) if applied.is_empty() => continue,
                Ok(applied) => {
                    let versions = applied.iter().map(|s| s.version).collect();
                    push_step(self.stack(step.opposite()), user_id, versions);
                    log::debug!(
                        "{user_id} {step:?} in {} applied {} operations",
                        self.id(),
                        applied.len()
                    );
                    return Ok(applied);
                }
                Err(e) => {
                    if matches!(e, CollabError::StaleClient { .. }) {
                        self.stack(step).remove(user_id);
                    }
                    return Err(e);
                }
            }
        }
    }

    fn stack(&mut self, step: Step) -> &mut HashMap<UserId, Vec<Vec<Version>>> {
        match step {
            Step::Undo => &mut self.undo,
            Step::Redo => &mut self.redo,
        }
    }

    /// Apply the inverse of every entry in `group`, newest first, rebased
    /// over everything logged since. Returns what was applied.
    fn revert(&mut self, user_id: &str, group: &[Version]) -> CollabResult<Vec<Submitted>> {
        if let Some(&missing) = group.iter().find(|v| self.log.get(**v).is_none()) {
            return Err(CollabError::StaleClient {
                client_version: missing as i64,
                oldest: self.log.base_version(),
                current: self.doc.version(),
            });
        }

        let mut applied = Vec::new();
        for &version in group.iter().rev() {
            let Some(entry) = self.log.get(version) else {
                continue;
            };
            if entry.op.is_noop() {
                continue;
            }
            let Some(mut inverse) = invert(&entry.op, entry.removed.as_deref()) else {
                continue;
            };
            inverse.user_id = user_id.to_string();
            inverse.timestamp = now_millis();

            let current = self.doc.version();
            let later = self.log.slice(version + 1, current);
            let deleted = match inverse.kind {
                OpKind::Delete { length } => Some(length),
                OpKind::Insert { .. } => None,
            };

            match deleted {
                None => {
                    let op = later.iter().fold(inverse, |op, e| transform(&op, &e.op));
                    if !op.is_noop() {
                        applied.push(self.admit(op, current)?);
                    }
                }
                Some(length) => {
                    let spans = later.iter().fold(vec![(inverse.position, length)], |spans, e| {
                        rebase_deletion(&spans, &e.op)
                    });
                    // Right to left, so earlier spans keep their positions.
                    for (start, len) in spans.into_iter().rev() {
                        let op = Operation::delete(start, len, user_id, inverse.timestamp);
                        let base = self.doc.version();
                        applied.push(self.admit(op, base)?);
                    }
                }
            }
        }
        Ok(applied)
    }

    fn recover(&self, user_id: &str, last_known_version: i64) -> Recovery {
        let current = self.doc.version();
        let replayable = u64::try_from(last_known_version)
            .ok()
            .filter(|v| self.log.covers(*v));

        let (recovery, attribution_since) = match replayable {
            Some(since) => (
                Recovery::Replay {
                    operations: self.log.operations_since(since),
                    current_version: current,
                },
                since,
            ),
            None => (
                Recovery::Snapshot(RecoverySnapshot {
                    text: self.doc.text().to_string(),
                    version: current,
                    history: compact(&self.log.operations_since(self.log.base_version())),
                }),
                self.log.base_version(),
            ),
        };
        log::debug!(
            "{user_id} recovers {} from v{last_known_version} by {}",
            self.id(),
            if replayable.is_some() { "replay" } else { "snapshot" }
        );

        if let Some(p) = self.registry.get(user_id) {
            let state = match &recovery {
                Recovery::Replay {
                    operations,
                    current_version,
                } => RecoveryState {
                    mode: RecoveryMode::Replay,
                    version: *current_version,
                    text: None,
                    history: operations.iter().map(ChangeRecord::from).collect(),
                },
                Recovery::Snapshot(snapshot) => RecoveryState {
                    mode: RecoveryMode::Snapshot,
                    version: snapshot.version,
                    text: Some(snapshot.text.clone()),
                    history: snapshot.history.iter().map(ChangeRecord::from).collect(),
                },
            };
            let changes = self
                .log
                .entries_since(attribution_since)
                .iter()
                .map(ChangeRecord::from)
                .collect();
            self.broadcaster
                .send_to(p, Arc::new(ServerEvent::Recovery { state }));
            self.broadcaster
                .send_to(p, Arc::new(ServerEvent::Attribution { changes }));
        }

        recovery
    }

    // ─── Persistence ──────────────────────────────────────────────────

    fn persist(&mut self, job: PersistJob) {
        let Some(tx) = &self.persist else {
            return;
        };
        if tx.send(job).is_err() {
            log::error!("Persistence task for {} is gone", self.doc.document_id());
            self.persist = None;
        }
    }

    fn queue_checkpoint(&mut self, requested_by: Option<UserId>) -> Version {
        let checkpoint = self.doc.to_checkpoint(now_millis());
        let version = checkpoint.version;
        self.checkpoint_queued = self.checkpoint_queued.max(version);
        log::debug!("Queued checkpoint v{version} of {}", self.id());
        self.persist(PersistJob::Checkpoint {
            checkpoint,
            requested_by,
        });
        version
    }

    fn autosave(&mut self) {
        if self.doc.version() > self.checkpoint_queued {
            self.queue_checkpoint(None);
        }
    }

    fn on_persisted(&mut self, event: PersistEvent) {
        match event {
            PersistEvent::CheckpointDurable {
                version,
                requested_by,
            } => {
                self.durable_version = self.durable_version.max(version);
                let keep_from = version
                    .saturating_sub(self.config.retain_after_checkpoint as Version)
                    + 1;
                let dropped = self.log.truncate_before(keep_from);
                if dropped > 0 {
                    log::debug!("Truncated {dropped} log entries of {} below v{keep_from}", self.id());
                }
                if let Some(user_id) = requested_by {
                    self.broadcaster.broadcast(
                        &self.registry,
                        ServerEvent::DocumentSaved {
                            user_id,
                            version,
                            timestamp: now_millis(),
                        },
                        None,
                    );
                }
            }
            PersistEvent::AppendFailed { from_version } => {
                log::warn!(
                    "Durable tail of {} is missing v{from_version}, checkpointing v{} to cover it",
                    self.id(),
                    self.doc.version()
                );
                self.queue_checkpoint(None);
            }
            PersistEvent::CheckpointFailed {
                version,
                requested_by,
            } => {
                // Allow the next autosave or eviction to try again.
                self.checkpoint_queued = self.durable_version;
                if let Some(user_id) = requested_by {
                    if let Some(p) = self.registry.get(&user_id) {
                        let err = CollabError::Persistence(format!(
                            "checkpoint v{version} could not be saved"
                        ));
                        self.broadcaster.send_to(p, Arc::new(ServerEvent::error(&err)));
                    }
                }
            }
        }
    }

    fn info(&self) -> DocumentInfo {
        DocumentInfo {
            document_id: self.id().to_string(),
            text: self.doc.text().to_string(),
            version: self.doc.version(),
            participants: self.registry.len(),
            log_base: self.log.base_version(),
            log_len: self.log.len(),
            durable_version: self.durable_version,
        }
    }
}
