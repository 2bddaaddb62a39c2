//! Change synchronization between two directory trees
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────── local tree ──────────────┐        ┌──────── remote ────────┐
//! │ ChangeWatcher ─► OutboundEndpoint ─────┼─ Push ─►  InboundApplier        │
//! │                    ▲ suppress          │        │                        │
//! │                 LockTable              │        │                        │
//! │                    ▼ hold              │        │                        │
//! │ InboundApplier ◄───────────────────────┼─ Pull ─┤  OutboundEndpoint      │
//! └────────────────────────────────────────┘        └────────────────────────┘
//! ```
//!
//! Each tree has one [`LockTable`](crate::locks::LockTable) shared by its
//! outbound endpoint and its applier. The applier holds every path it touches;
//! the outbound endpoint drops watcher events for held paths. That, not
//! ordering between the two directions, is what keeps edits from bouncing
//! back and forth.

pub mod channel;
pub mod inbound;
pub mod outbound;
pub mod protocol;
pub mod transport;

pub use channel::{ChangeSink, ChangeSource};
pub use inbound::{AppliedAction, ApplyOutcome, InboundApplier, SkipReason};
pub use outbound::OutboundEndpoint;
pub use protocol::{Direction, FileChanged, StatusCode, SyncMessage, WireMessage};
pub use transport::{
    Connection, FrameReader, FrameWriter, WireCodec, MAX_FILE_LEN, MAX_FRAME_LEN,
};
