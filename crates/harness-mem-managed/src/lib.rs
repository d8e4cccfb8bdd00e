//! Remote side of the storage migration: the Postgres event log, the
//! projector that materializes observations from it, and the
//! [`ManagedBackend`] orchestrator that replicates local writes and scores
//! shadow reads.

mod backend;
mod event_store;
mod projector;

pub use backend::{
    ConnectionState, FlushOutcome, ManagedBackend, ManagedBackendConfig, ManagedBackendStatus,
    ManagedMode, PromotionAttempt, ReplicationTicket, ShadowReadOptions, ShadowReadOutcome,
    DEFAULT_BATCH_SIZE, DEFAULT_FLUSH_INTERVAL, DEFAULT_QUEUE_CAPACITY, DEFAULT_SHADOW_READ_LIMIT,
};
pub use event_store::EventStore;
pub use projector::ObservationProjector;
