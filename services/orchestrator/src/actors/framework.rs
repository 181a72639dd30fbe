//! Core actor framework types and traits.
//!
//! Provides the building blocks every engine runtime is made of:
//! - `Actor` trait for defining actor behavior
//! - `mailbox` and `start` for wiring and launching an actor task
//! - `ActorHandle` for sending messages to actors
//! - `ActorRef` / `ActorExit` for stopping and observing a running actor
//! - Backoff and restart policies

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use emesh_events::ExitReason;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

// =============================================================================
// Core Traits
// =============================================================================

/// Marker trait for actor messages.
pub trait Message: Send + Debug + 'static {}

impl<T: Send + Debug + 'static> Message for T {}

/// The Actor trait defines behavior for an actor.
///
/// Actors:
/// - Process messages one at a time (no internal concurrency)
/// - Own mutable state not shared with other actors
/// - Communicate only via message passing
#[async_trait]
pub trait Actor: Send + 'static {
    /// The message type this actor handles.
    type Message: Message;

    /// Actor name for logging.
    fn name(&self) -> &str;

    /// Handle a single message.
    ///
    /// Returns `Ok(true)` to continue, `Ok(false)` to stop, or `Err` on failure.
    async fn handle(&mut self, msg: Self::Message, ctx: &mut ActorContext) -> Result<bool, ActorError>;

    /// Called when the actor starts. An error here aborts the launch.
    async fn on_start(&mut self, _ctx: &mut ActorContext) -> Result<(), ActorError> {
        Ok(())
    }

    /// Called when the actor is about to stop.
    async fn on_stop(&mut self, _ctx: &mut ActorContext, _reason: ExitReason) {}

    /// Exit reason to report when the actor asks to stop via `Ok(false)`.
    fn exit_reason(&self) -> ExitReason {
        ExitReason::Normal
    }
}

/// Context provided to actors during message handling.
#[derive(Debug)]
pub struct ActorContext {
    pub actor_id: String,
    pub messages_processed: u64,
}

impl ActorContext {
    fn new(actor_id: String) -> Self {
        Self {
            actor_id,
            messages_processed: 0,
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors that can occur in actors.
#[derive(Debug, Error)]
pub enum ActorError {
    /// Transient error; the actor keeps running.
    #[error("transient error: {0}")]
    Transient(String),

    /// Permanent error; the actor stops.
    #[error("permanent error: {0}")]
    Permanent(String),

    /// Actor mailbox is full.
    #[error("mailbox full")]
    MailboxFull,

    /// Actor has stopped.
    #[error("actor stopped")]
    ActorStopped,

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

// =============================================================================
// Actor Handle
// =============================================================================

/// Handle for sending messages to an actor.
pub struct ActorHandle<M: Message> {
    /// Sender for the actor's mailbox.
    tx: mpsc::Sender<M>,

    /// Actor ID for logging and identity.
    actor_id: String,
}

impl<M: Message> Clone for ActorHandle<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            actor_id: self.actor_id.clone(),
        }
    }
}

impl<M: Message> Debug for ActorHandle<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorHandle")
            .field("actor_id", &self.actor_id)
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl<M: Message> ActorHandle<M> {
    /// Send a message to the actor.
    pub async fn send(&self, msg: M) -> Result<(), ActorError> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| ActorError::ActorStopped)
    }

    /// Try to send a message without blocking.
    pub fn try_send(&self, msg: M) -> Result<(), ActorError> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ActorError::MailboxFull,
            mpsc::error::TrySendError::Closed(_) => ActorError::ActorStopped,
        })
    }

    /// Get the actor ID.
    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }

    /// Returns true once the actor's mailbox has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Completes when the actor's mailbox has been dropped (the actor is gone).
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    /// Returns a handle that does not keep the mailbox alive.
    pub fn downgrade(&self) -> WeakActorHandle<M> {
        WeakActorHandle {
            tx: self.tx.downgrade(),
            actor_id: self.actor_id.clone(),
        }
    }
}

/// Non-owning counterpart to [`ActorHandle`].
pub struct WeakActorHandle<M: Message> {
    tx: mpsc::WeakSender<M>,
    actor_id: String,
}

impl<M: Message> WeakActorHandle<M> {
    /// Upgrade to a full handle if any strong handle is still alive.
    pub fn upgrade(&self) -> Option<ActorHandle<M>> {
        self.tx.upgrade().map(|tx| ActorHandle {
            tx,
            actor_id: self.actor_id.clone(),
        })
    }
}

/// Receiving side of an actor's mailbox, consumed by [`start`].
pub struct Mailbox<M: Message> {
    rx: mpsc::Receiver<M>,
    actor_id: String,
}

/// Creates the mailbox for an actor before it exists, so the actor can hold
/// its own handle.
pub fn mailbox<M: Message>(name: &str, size: usize) -> (ActorHandle<M>, Mailbox<M>) {
    let actor_id = format!("{}_{}", name, generate_actor_id());
    let (tx, rx) = mpsc::channel(size.max(1));
    (
        ActorHandle {
            tx,
            actor_id: actor_id.clone(),
        },
        Mailbox { rx, actor_id },
    )
}

/// Type-erased actor reference for supervision.
#[derive(Debug, Clone)]
pub struct ActorRef {
    /// Actor ID.
    pub actor_id: String,

    /// Actor type name.
    pub actor_type: String,

    abort: AbortHandle,

    shutdown_tx: watch::Sender<bool>,
}

impl ActorRef {
    /// Signal the actor to stop. The actor finishes its current message first.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Abort the actor task immediately. `on_stop` is not called.
    pub fn abort(&self) {
        self.abort.abort();
    }
}

/// Resolves to the exit reason of an actor task.
#[derive(Debug)]
pub struct ActorExit {
    actor_id: String,
    task: JoinHandle<ExitReason>,
}

impl ActorExit {
    /// Waits for the actor task to finish.
    ///
    /// An aborted task reports `Killed`, a panicked one `Crashed`.
    pub async fn wait(self) -> ExitReason {
        match self.task.await {
            Ok(reason) => reason,
            Err(e) if e.is_cancelled() => ExitReason::Killed,
            Err(e) => {
                error!(actor_id = %self.actor_id, error = %e, "Actor task panicked");
                ExitReason::Crashed
            }
        }
    }
}

/// Spawns the actor task and waits for `on_start` to complete.
///
/// Returns the start error if `on_start` fails; the task has exited by then.
pub async fn start<A: Actor>(
    actor: A,
    mailbox: Mailbox<A::Message>,
) -> Result<(ActorRef, ActorExit), ActorError> {
    let Mailbox { rx, actor_id } = mailbox;
    let actor_type = actor.name().to_string();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (started_tx, started_rx) = oneshot::channel();

    let task = tokio::spawn(run_actor_loop(
        actor,
        rx,
        shutdown_rx,
        actor_id.clone(),
        started_tx,
    ));

    let actor_ref = ActorRef {
        actor_id: actor_id.clone(),
        actor_type: actor_type.clone(),
        abort: task.abort_handle(),
        shutdown_tx,
    };
    let exit = ActorExit {
        actor_id: actor_id.clone(),
        task,
    };

    match started_rx.await {
        Ok(Ok(())) => {
            info!(actor_id = %actor_id, actor_type = %actor_type, "Spawned actor");
            Ok((actor_ref, exit))
        }
        Ok(Err(e)) => {
            exit.wait().await;
            Err(ActorError::Permanent(e))
        }
        Err(_) => {
            // on_start panicked before reporting back.
            let reason = exit.wait().await;
            Err(ActorError::Permanent(format!("actor exited during start: {reason}")))
        }
    }
}

// =============================================================================
// Backoff Policy
// =============================================================================

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Calculate delay for the given attempt number.
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(attempt.min(30) as i32);
        let delay = delay.min(self.max.as_millis() as f64);

        let jitter_range = delay * self.jitter;
        let final_delay = (delay + rand_jitter(jitter_range)).max(0.0);

        Duration::from_millis(final_delay as u64)
    }
}

/// Simple jitter from a basic LCG seeded by the clock.
fn rand_jitter(range: f64) -> f64 {
    use std::time::SystemTime;
    let seed = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let random = (seed.wrapping_mul(6364136223846793005).wrapping_add(1)) as f64;
    let normalized = (random / u64::MAX as f64) * 2.0 - 1.0; // -1.0 to 1.0
    normalized * range
}

// =============================================================================
// Restart Policy
// =============================================================================

/// Limits on how often a supervised actor may be restarted.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Maximum restart attempts within the window.
    pub max_restarts: u32,

    /// Time window for counting restarts.
    pub window: Duration,

    /// Backoff policy for restarts.
    pub backoff: BackoffPolicy,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            window: Duration::from_secs(300), // 5 minutes
            backoff: BackoffPolicy::default(),
        }
    }
}

impl RestartPolicy {
    /// Prunes restart timestamps outside the window and reports whether
    /// another restart is allowed.
    pub fn allows_restart(&self, history: &mut Vec<Instant>, now: Instant) -> bool {
        history.retain(|t| now.duration_since(*t) < self.window);
        history.len() < self.max_restarts as usize
    }
}

// =============================================================================
// Actor Loop
// =============================================================================

/// Run the main actor loop.
async fn run_actor_loop<A: Actor>(
    mut actor: A,
    mut rx: mpsc::Receiver<A::Message>,
    mut shutdown: watch::Receiver<bool>,
    actor_id: String,
    started: oneshot::Sender<Result<(), String>>,
) -> ExitReason {
    let mut ctx = ActorContext::new(actor_id.clone());

    if let Err(e) = actor.on_start(&mut ctx).await {
        error!(actor_id = %actor_id, error = %e, "Actor failed to start");
        let _ = started.send(Err(e.to_string()));
        return ExitReason::Crashed;
    }

    let _ = started.send(Ok(()));
    debug!(actor_id = %actor_id, "Actor started");

    let mut shutdown_open = true;
    let reason = loop {
        tokio::select! {
            biased;

            // Check shutdown first
            changed = shutdown.changed(), if shutdown_open => {
                match changed {
                    // Every ActorRef was dropped; only the mailbox can stop us now.
                    Err(_) => shutdown_open = false,
                    Ok(()) if *shutdown.borrow() => {
                        info!(actor_id = %actor_id, "Actor received shutdown signal");
                        break ExitReason::Shutdown;
                    }
                    Ok(()) => {}
                }
            }

            msg = rx.recv() => {
                match msg {
                    Some(msg) => {
                        ctx.messages_processed += 1;

                        match actor.handle(msg, &mut ctx).await {
                            Ok(true) => {}
                            Ok(false) => {
                                debug!(actor_id = %actor_id, "Actor requested stop");
                                break actor.exit_reason();
                            }
                            Err(e) => {
                                if matches!(e, ActorError::Permanent(_) | ActorError::Internal(_)) {
                                    error!(actor_id = %actor_id, error = %e, "Actor failed");
                                    break ExitReason::Crashed;
                                }
                                warn!(actor_id = %actor_id, error = %e, "Actor error");
                            }
                        }
                    }
                    None => {
                        debug!(actor_id = %actor_id, "Actor mailbox closed");
                        break ExitReason::Normal;
                    }
                }
            }
        }
    };

    actor.on_stop(&mut ctx, reason).await;

    info!(
        actor_id = %actor_id,
        messages_processed = ctx.messages_processed,
        reason = %reason,
        "Actor stopped"
    );

    reason
}

// =============================================================================
// Helpers
// =============================================================================

static ACTOR_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn generate_actor_id() -> u64 {
    ACTOR_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
}

// =============================================================================
// Tests
// =============================================================================
