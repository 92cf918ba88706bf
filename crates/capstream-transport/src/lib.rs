//! TCP transport layer for capstream RPC connections.
//!
//! This is the lowest layer of capstream. Everything else builds on top of
//! the [`RpcStream`] type provided here: a blocking duplex byte stream that
//! can be cloned into read and write halves and shut down from another
//! thread to unblock in-progress I/O.

pub mod error;
pub mod stream;
pub mod tcp;

pub use error::{Result, TransportError};
pub use stream::RpcStream;
pub use tcp::TcpSocket;
