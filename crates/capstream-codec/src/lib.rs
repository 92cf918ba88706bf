//! Packed wire codec and frame pump for capstream RPC messages.
//!
//! Three pieces live here:
//!
//! - the **packed codec** ([`pack`], [`PackedDecoder`]): a lossless
//!   zero-byte-elision transform over the 8-byte-word wire format, with a
//!   decoder that resumes correctly across arbitrary chunk boundaries;
//! - [`WireFrame`]: one complete encoded message, self-describing via its
//!   segment table — no outer length prefix exists on the wire;
//! - the **frame pump** ([`FramePump`], [`FrameSender`]): the
//!   per-connection loop that turns transport bytes into frames and back,
//!   with serialized writes and an unblocking disposal handle.

pub mod error;
pub mod frame;
pub mod packed;
pub mod pump;

pub use error::{CodecError, Result};
pub use frame::{frame_len, WireFrame, DEFAULT_MAX_FRAME, MAX_SEGMENTS};
pub use packed::{pack, PackedDecoder, WORD_SIZE};
pub use pump::{pump_pair, FramePump, FrameSender, FrameSink, PumpConfig, PumpHandle};
