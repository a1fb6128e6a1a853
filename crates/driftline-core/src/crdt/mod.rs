//! CRDT integration using Loro for collaborative drawing.
//!
//! # Schema
//!
//! ```text
//! LoroDoc
//! └── "lines": LoroList<LoroMap> (creation order across all peers)
//! ```
//!
//! Each line map holds:
//! - "id": String (creation time in ms)
//! - "user_color": String (`#rrggbb`)
//! - "is_complete": Bool
//! - "points": LoroList<LoroList<f64>> (`[x, y]` pairs)

mod convert;
mod schema;

pub use convert::{line_from_loro, line_to_loro, push_point};
pub use schema::{LINES_KEY, LineDocument, LineHandle};

// Re-export Loro types that callers of the replication API need
pub use loro::{ExportMode, VersionVector};
