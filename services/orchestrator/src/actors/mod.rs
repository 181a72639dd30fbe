//! Actor framework for engine runtimes.
//!
//! Every engine instance runs as one actor: a single task owning the engine
//! state and draining a bounded mailbox.
//!
//! ## Design Principles
//!
//! - **One actor per engine instance**: the actor owns the engine state and
//!   the processing-mode state machine; nothing else touches them
//! - **Serialized requests**: messages are handled one at a time, so state
//!   transitions never interleave
//! - **Crash isolation**: a failing engine takes down only its own actor
//! - **Supervised restart**: the cluster layer relaunches exited actors with
//!   exponential backoff, bounded by a restart window

mod framework;

pub use framework::{
    mailbox, start, Actor, ActorContext, ActorError, ActorExit, ActorHandle, ActorRef,
    BackoffPolicy, Mailbox, Message, RestartPolicy, WeakActorHandle,
};
