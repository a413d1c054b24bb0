//! PeerLink session core: direct peer-to-peer text chat, file transfer and calls.
//! Host-driven: no I/O; host passes events and receives actions.

pub mod identity;
pub mod protocol;
pub mod envelope;
pub mod wire;
pub mod bridge;

pub mod chunk;
pub mod timer;
pub mod transfer;
pub mod liveness;

pub mod store;
pub mod call;
pub mod config;
pub mod session;

pub use bridge::{Bridge, BridgeError, Dispatch, PendingCall};
pub use call::{MediaConstraints, MediaSource};
pub use config::{ConfigError, SessionConfig};
pub use envelope::Envelope;
pub use protocol::Message;
pub use session::{Action, IceState, PeerSession, PublishOutcome, SessionError};
pub use store::{CallRole, FileProgress, LogEntry, Session, Status, Store};
pub use wire::{decode_frame, encode_frame, FrameBuffer, FrameDecodeError, FrameEncodeError};
