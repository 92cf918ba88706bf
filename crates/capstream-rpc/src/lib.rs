//! Capability RPC engine and TCP connection manager.
//!
//! The [`RpcEngine`] owns the endpoint table and the process-wide
//! bootstrap capability; an [`RpcServer`] accepts TCP connections and
//! runs one frame-pump worker per connection, wiring each accepted
//! socket into a fresh [`Endpoint`]. Frame contents stay opaque here:
//! call/return grammar belongs to the application [`Dispatcher`].

mod capability;
mod endpoint;
mod engine;
mod error;
mod server;

pub use capability::{Capability, OutboundSink};
pub use endpoint::Endpoint;
pub use engine::{Dispatcher, RpcEngine};
pub use error::{Result, RpcError};
pub use server::{ConnectionInfo, ConnectionState, OutboundEndpoint, RpcServer};
