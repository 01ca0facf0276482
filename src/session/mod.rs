//! Per-UID session bookkeeping (C2) and the control-channel "frame sink"
//! abstraction shared by the edge and agent control sessions (§9,
//! "Back-references from per-session objects to the owning service").

pub mod sink;
pub mod table;

pub use sink::FrameSink;
pub use table::SessionTable;
