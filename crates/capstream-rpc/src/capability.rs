use capstream_codec::WireFrame;

use crate::error::Result;

/// An application object invocable through the RPC layer.
///
/// The engine never interprets calls itself; it only stores capability
/// references in its export tables and hands them to the application's
/// dispatcher. The bootstrap capability a peer obtains on connect is one
/// of these.
pub trait Capability: Send + Sync {
    /// Invoke a method on this capability.
    fn call(&self, interface_id: u64, method_id: u16, params: WireFrame) -> Result<WireFrame>;

    /// Short name for diagnostics and logging.
    fn name(&self) -> &str {
        "capability"
    }
}

/// Outbound delivery target backing one endpoint.
///
/// Implemented by the connection layer (a frame-sender adapter in the
/// server); injected into [`crate::RpcEngine::add_endpoint`].
pub trait OutboundSink: Send + Sync {
    /// Deliver one frame toward the remote peer.
    fn deliver(&self, frame: &WireFrame) -> Result<()>;

    /// Stop accepting frames; subsequent delivery fails.
    ///
    /// Must be idempotent.
    fn close(&self);
}
