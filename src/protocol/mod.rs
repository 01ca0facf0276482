//! The multiplexed control-channel wire protocol: a fixed 9-byte header
//! followed by an opaque payload.

pub mod frame;

pub use frame::{Frame, FrameError, HEADER_LEN, MAX_FRAME_LEN, MessageType, encode, read_frame};
