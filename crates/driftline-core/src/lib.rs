//! Driftline Core Library
//!
//! Collaborative session state for the Driftline canvas: replicated lines,
//! stroke-scoped undo, live presence, and the sync connection lifecycle.

pub mod config;
pub mod context;
pub mod coords;
pub mod crdt;
pub mod error;
pub mod history;
pub mod line;
pub mod observe;
pub mod presence;
pub mod session;
pub mod store;
pub mod sync;
pub mod throttle;

pub use config::SessionConfig;
pub use context::SessionContext;
pub use coords::{CoordinateMapper, ScrollEpoch};
pub use crdt::{LineDocument, LineHandle};
pub use error::{SessionError, SessionResult, TransportError};
pub use history::{TransactionState, UndoController};
pub use line::{Color, Line, LineId};
pub use observe::{Observers, Subscription};
pub use presence::{Participants, PresenceState, PresenceTracker};
pub use session::{ConnectionState, SyncSession};
pub use store::LineStore;
pub use sync::{ClientMessage, ServerMessage, SyncEvent, Transport};
#[cfg(not(target_arch = "wasm32"))]
pub use sync::{NativeWebSocket, PlatformWebSocket};
pub use throttle::ClearThrottle;

pub use kurbo::Point;
