//! Piece selection
//!
//! Tracks availability across peers and decides which block to request next.

#[allow(clippy::module_inception)]
pub mod picker;
pub mod priority;

pub use picker::{BlockOutcome, BlockRequest, PeerKey, PickMode, PiecePicker};
pub use priority::{AvailabilitySummary, PiecePriority};
