//! Client-side core for the Cypher Protocol: identity & device registry,
//! session manager, job queue, and message pipeline (§4, §9).
//!
//! # Layering
//! Every module here is storage- and transport-agnostic beyond the
//! [`cypher_store::Storage`]/[`transport::Transport`] traits it is handed —
//! callers own persistence of mutated records (ratchet state, device
//! identities) and wiring a concrete transport. [`messenger::Messenger`]
//! assembles the whole set into the single façade described by §9.

pub mod envelope;
pub mod error;
pub mod identity;
pub mod jobqueue;
pub mod messenger;
pub mod pipeline;
pub mod plugin;
pub mod session;
pub mod transport;

pub use error::CoreError;
pub use identity::{IdentityRegistry, IdentityUpdate};
pub use jobqueue::{DrainResult, JobQueue, QueueState, TaskOutcome, TaskRunner};
pub use messenger::Messenger;
pub use pipeline::{transition_delivery_state, DeliveryTransition, Pipeline};
pub use plugin::{CorePlugin, NoopPlugin, SaveDecision, SendDecision};
pub use session::{ReadOutcome, ReadSignal, SessionManager};
pub use transport::{PushType, Transport, TransportEvent};
