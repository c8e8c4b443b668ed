//! # Void Sync
//!
//! Real-time scene synchronization for collaborative editing sessions.
//!
//! Every peer holds a replica of a shared set of scene objects:
//! - Local edits apply immediately and are broadcast to the session
//! - Remote edits merge through a pluggable conflict resolver
//!   (last-write-wins by default)
//! - Late joiners catch up from a full snapshot served by the host
//! - Objects owned by a departed member are removed everywhere
//!
//! ## Architecture
//!
//! The [`SyncEngine`] is a single-owner state machine. It talks to the
//! outside world through three seams:
//! - [`Transport`] for outbound messages
//! - [`SceneProjector`] for render nodes
//! - [`Clock`] for write timestamps
//!
//! Inbound messages and sync loop ticks are fed in by the host, or by a
//! [`SyncDriver`] on a tokio task.
//!
//! ## Usage
//!
//! ```ignore
//! let (transport, outbound) = ChannelTransport::pair();
//! let mut engine = SyncEngine::new("alice", NullProjector).with_transport(transport);
//!
//! let id = engine.create_object(ObjectKind::Box, DVec3::ZERO, Some("crate"));
//! engine.transform_object(&id, TransformPatch::position(DVec3::X));
//!
//! // Run inbound handling and the sync loop
//! let mut driver = SyncDriver::new(engine, inbound);
//! driver.run().await;
//! ```

pub mod clock;
pub mod config;
pub mod driver;
pub mod engine;
pub mod membership;
pub mod object;
pub mod projector;
pub mod protocol;
pub mod resolver;
pub mod scheduler;
pub mod store;
pub mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, SyncConfig};
pub use driver::SyncDriver;
pub use engine::{RemovalReason, SyncEngine, SyncNotification, SyncStats};
pub use membership::SessionMember;
pub use object::{
    MaterialPatch, ObjectId, ObjectKind, ObjectPatch, SyncedObject, TransformPatch, UserId,
};
pub use projector::{
    ChangeOrigin, NullProjector, ProjectionCall, ProjectorError, RecordingProjector,
    SceneProjector,
};
pub use protocol::{Envelope, EventKind, EventPayload, ProtocolError, SceneSnapshot, SyncEvent};
pub use resolver::{last_write_wins, ConflictResolver, LastWriteWins};
pub use transport::{ChannelTransport, Transport, TransportError, TransportStats};

use thiserror::Error;

/// Sync layer errors
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Projector error: {0}")]
    Projector(#[from] ProjectorError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

pub type SyncResult<T> = Result<T, SyncError>;
