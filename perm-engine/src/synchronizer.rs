// SPDX-License-Identifier: MIT OR Apache-2.0

//! Keeps the effective permissions of online players up to date.
//!
//! The [`Synchronizer`] is a handle to an actor task owning the table of online players. Every
//! lifecycle event and every invalidation published by the engine schedules a recomputation on a
//! bounded pool of worker tasks. Results are tagged with a generation and only the result of the
//! latest request for a still online player is installed into its [`CapabilitySink`].
//!
//! Installed sets containing temporary grants or memberships are recomputed as soon as the
//! earliest of them expires, independent of any expiry sweep.
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use perm_core::{Context, EntityRef, InvalidationScope, Resolution, Timestamp};
use perm_store::EntryStore;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Semaphore, broadcast, mpsc, oneshot};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::engine::{Invalidation, Permissions};
use crate::error::EngineError;

/// Live capability object of an online player, provided by the host.
pub trait CapabilitySink: Send + Sync + 'static {
    /// Replaces the installed permissions.
    fn install(&self, resolution: Arc<Resolution>);

    /// Removes all installed permissions, called once the player went offline.
    fn detach(&self);
}

#[derive(Debug, Error)]
#[error("synchronizer is not running")]
pub struct SynchronizerError;

enum ToSynchronizer {
    /// A player came online or was re-registered with a new sink.
    Enter {
        subject: String,
        context: Context,
        sink: Arc<dyn CapabilitySink>,
    },
    ContextChanged {
        subject: String,
        context: Context,
    },
    Exit {
        subject: String,
    },
    Invalidated {
        scope: InvalidationScope,
    },
    Online {
        reply: oneshot::Sender<Vec<String>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the synchronizer actor. Cloning it shares the same actor.
#[derive(Clone, Debug)]
pub struct Synchronizer {
    inbox: mpsc::UnboundedSender<ToSynchronizer>,
    token: CancellationToken,
}

impl Synchronizer {
    /// Spawns the actor on the current tokio runtime, recomputing at most `workers` players at the
    /// same time.
    ///
    /// The actor listens to invalidations of `engine` and stops when [`Synchronizer::shutdown`]
    /// is called or the cancellation token of the handle is cancelled.
    pub fn spawn<S>(engine: Arc<Permissions<S>>, workers: usize) -> Self
    where
        S: EntryStore,
    {
        let token = CancellationToken::new();
        let (actor, inbox) = SynchronizerActor::new(engine, workers);
        tokio::spawn(actor.run(token.clone()));
        Self { inbox, token }
    }

    /// Registers an online player and installs its permissions for `context`.
    ///
    /// Entering again before exiting replaces context and sink.
    pub fn enter(
        &self,
        subject: &str,
        context: Context,
        sink: Arc<dyn CapabilitySink>,
    ) -> Result<(), SynchronizerError> {
        self.send(ToSynchronizer::Enter {
            subject: subject.to_string(),
            context,
            sink,
        })
    }

    /// Recomputes the permissions of an online player for a new world or set of regions.
    pub fn context_changed(&self, subject: &str, context: Context) -> Result<(), SynchronizerError> {
        self.send(ToSynchronizer::ContextChanged {
            subject: subject.to_string(),
            context,
        })
    }

    /// Detaches the sink of a player going offline. Pending recomputations are discarded.
    pub fn exit(&self, subject: &str) -> Result<(), SynchronizerError> {
        self.send(ToSynchronizer::Exit {
            subject: subject.to_string(),
        })
    }

    /// Recomputes all online players in `scope`.
    ///
    /// Invalidations of the engine the synchronizer was spawned with are picked up automatically.
    pub fn invalidated(&self, scope: InvalidationScope) -> Result<(), SynchronizerError> {
        self.send(ToSynchronizer::Invalidated { scope })
    }

    /// Names of all online players, sorted.
    pub async fn online(&self) -> Result<Vec<String>, SynchronizerError> {
        let (reply, rx) = oneshot::channel();
        self.send(ToSynchronizer::Online { reply })?;
        rx.await.map_err(|_| SynchronizerError)
    }

    /// Detaches all sinks and stops the actor.
    pub async fn shutdown(&self) -> Result<(), SynchronizerError> {
        let (reply, rx) = oneshot::channel();
        self.send(ToSynchronizer::Shutdown { reply })?;
        rx.await.map_err(|_| SynchronizerError)
    }

    /// Token stopping the actor when cancelled. Other tasks tied to the lifetime of the
    /// synchronizer can share it.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    fn send(&self, msg: ToSynchronizer) -> Result<(), SynchronizerError> {
        self.inbox.send(msg).map_err(|_| SynchronizerError)
    }
}

struct Session {
    /// Name as given when entering, keys of the session table are lower-cased.
    subject: String,
    context: Context,
    sink: Arc<dyn CapabilitySink>,
    /// Generation of the latest scheduled recomputation, shared with waiting workers so they can
    /// skip outdated requests. Zero once the player went offline.
    requested: Arc<AtomicU64>,
    /// When the installed set stops being valid because a temporary item expires.
    deadline: Option<Instant>,
}

/// Result of a recomputation running on a worker.
struct Recomputed {
    subject: String,
    generation: u64,
    result: Result<Arc<Resolution>, EngineError>,
}

struct SynchronizerActor<S> {
    engine: Arc<Permissions<S>>,
    inbox: mpsc::UnboundedReceiver<ToSynchronizer>,
    invalidations: Option<broadcast::Receiver<Invalidation>>,
    results_tx: mpsc::UnboundedSender<Recomputed>,
    results_rx: mpsc::UnboundedReceiver<Recomputed>,
    workers: Arc<Semaphore>,
    sessions: HashMap<String, Session>,
    next_generation: u64,
}

impl<S> SynchronizerActor<S>
where
    S: EntryStore,
{
    fn new(
        engine: Arc<Permissions<S>>,
        workers: usize,
    ) -> (Self, mpsc::UnboundedSender<ToSynchronizer>) {
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let invalidations = Some(engine.subscribe());

        let actor = Self {
            engine,
            inbox,
            invalidations,
            results_tx,
            results_rx,
            workers: Arc::new(Semaphore::new(workers.max(1))),
            sessions: HashMap::new(),
            next_generation: 0,
        };

        (actor, inbox_tx)
    }

    async fn run(mut self, token: CancellationToken) {
        loop {
            let deadline = self.next_deadline();

            tokio::select! {
                biased;

                _ = token.cancelled() => {
                    debug!("synchronizer received shutdown signal");
                    break;
                }
                msg = self.inbox.recv() => {
                    let Some(msg) = msg else {
                        debug!("all synchronizer handles dropped");
                        break;
                    };

                    if !self.on_message(msg) {
                        break;
                    }
                }
                Some(recomputed) = self.results_rx.recv() => {
                    self.on_recomputed(recomputed);
                }
                _ = sleep_until_deadline(deadline) => {
                    self.on_deadline();
                }
                event = next_invalidation(&mut self.invalidations) => {
                    match event {
                        Ok(invalidation) => self.refresh(&invalidation.scope),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "synchronizer missed invalidations, refreshing everyone");
                            self.refresh(&InvalidationScope::All);
                        }
                        Err(RecvError::Closed) => {
                            self.invalidations = None;
                        }
                    }
                }
            }
        }

        self.detach_all();
    }

    /// Handles a message of a handle, returns false if the actor should stop.
    fn on_message(&mut self, msg: ToSynchronizer) -> bool {
        match msg {
            ToSynchronizer::Enter {
                subject,
                context,
                sink,
            } => {
                let key = subject.to_lowercase();
                let session = Session {
                    subject,
                    context,
                    sink: sink.clone(),
                    requested: Arc::default(),
                    deadline: None,
                };

                if let Some(previous) = self.sessions.insert(key.clone(), session) {
                    previous.requested.store(0, Ordering::Release);
                    if !Arc::ptr_eq(&previous.sink, &sink) {
                        previous.sink.detach();
                    }
                }

                debug!(subject = %key, "player entered");
                self.schedule(&key);
            }
            ToSynchronizer::ContextChanged { subject, context } => {
                let key = subject.to_lowercase();
                let Some(session) = self.sessions.get_mut(&key) else {
                    debug!(subject = %key, "ignored context change of offline player");
                    return true;
                };
                session.context = context;
                self.schedule(&key);
            }
            ToSynchronizer::Exit { subject } => {
                let key = subject.to_lowercase();
                if let Some(session) = self.sessions.remove(&key) {
                    session.requested.store(0, Ordering::Release);
                    session.sink.detach();
                    debug!(subject = %key, "player exited");
                }
            }
            ToSynchronizer::Invalidated { scope } => self.refresh(&scope),
            ToSynchronizer::Online { reply } => {
                let mut online: Vec<String> = self
                    .sessions
                    .values()
                    .map(|session| session.subject.clone())
                    .collect();
                online.sort();
                let _ = reply.send(online);
            }
            ToSynchronizer::Shutdown { reply } => {
                self.detach_all();
                let _ = reply.send(());
                return false;
            }
        }

        true
    }

    fn refresh(&mut self, scope: &InvalidationScope) {
        let affected: Vec<String> = match scope.players() {
            Some(players) => players
                .into_iter()
                .filter(|player| self.sessions.contains_key(*player))
                .map(str::to_string)
                .collect(),
            None => self.sessions.keys().cloned().collect(),
        };

        for key in affected {
            self.schedule(&key);
        }
    }

    /// Starts a recomputation of an online player, outdating every earlier one.
    fn schedule(&mut self, key: &str) {
        let Some(session) = self.sessions.get_mut(key) else {
            return;
        };

        self.next_generation += 1;
        let generation = self.next_generation;
        session.requested.store(generation, Ordering::Release);
        let requested = session.requested.clone();

        let engine = self.engine.clone();
        let workers = self.workers.clone();
        let results = self.results_tx.clone();
        let subject = key.to_string();
        let context = session.context.clone();

        tokio::spawn(async move {
            let Ok(_permit) = workers.acquire_owned().await else {
                return;
            };
            if requested.load(Ordering::Acquire) != generation {
                trace!(%subject, generation, "skipped outdated recomputation");
                return;
            }
            let result = engine.resolve(EntityRef::player(&subject), context).await;
            let _ = results.send(Recomputed {
                subject,
                generation,
                result,
            });
        });
    }

    fn on_recomputed(&mut self, recomputed: Recomputed) {
        let Some(session) = self.sessions.get_mut(&recomputed.subject) else {
            trace!(subject = %recomputed.subject, "dropped result for offline player");
            return;
        };

        if session.requested.load(Ordering::Acquire) != recomputed.generation {
            trace!(
                subject = %recomputed.subject,
                generation = recomputed.generation,
                "dropped outdated result"
            );
            return;
        }

        match recomputed.result {
            Ok(resolution) => {
                session.deadline = resolution.expires_at.map(deadline_at);
                session.sink.install(resolution);
            }
            Err(err) => warn!(
                subject = %recomputed.subject,
                "failed recomputing permissions, keeping previous set: {err}"
            ),
        }
    }

    /// Recomputes every player whose installed set contains an expired item.
    fn on_deadline(&mut self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .sessions
            .iter_mut()
            .filter(|(_, session)| session.deadline.is_some_and(|deadline| deadline <= now))
            .map(|(key, session)| {
                session.deadline = None;
                key.clone()
            })
            .collect();

        for key in expired {
            debug!(subject = %key, "installed permissions expired");
            self.schedule(&key);
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.sessions
            .values()
            .filter_map(|session| session.deadline)
            .min()
    }

    fn detach_all(&mut self) {
        for (_, session) in self.sessions.drain() {
            session.requested.store(0, Ordering::Release);
            session.sink.detach();
        }
    }
}

/// Monotonic instant at which an item expiring at `expires_at` is gone.
///
/// Timestamps only have second precision, the deadline therefore never lies before the expiry.
fn deadline_at(expires_at: Timestamp) -> Instant {
    Instant::now() + expires_at.remaining(Timestamp::now()).unwrap_or_default()
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn next_invalidation(
    invalidations: &mut Option<broadcast::Receiver<Invalidation>>,
) -> Result<Invalidation, RecvError> {
    match invalidations {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
