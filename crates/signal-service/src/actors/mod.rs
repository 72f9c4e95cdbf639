//! Actor system for the signaling service.
//!
//! Hierarchy:
//! - `RoomSupervisorActor` (singleton): owns the room map, creates room
//!   actors lazily, owns the root `CancellationToken`
//! - `RoomActor` (per room): single writer for all of one room's session
//!   state, which makes every per-room mutation linearizable by
//!   construction (no check-then-set races on router creation)

/// Module for actor messages and reply types
pub mod messages;

/// Module for the per-room actor
pub mod room;

/// Module for the room supervisor actor
pub mod supervisor;

pub use messages::{ConsumeReply, ConsumerParams, JoinReply, ProduceReply, ServerEvent, TransportParams};
pub use room::RoomActorHandle;
pub use supervisor::RoomSupervisorHandle;
