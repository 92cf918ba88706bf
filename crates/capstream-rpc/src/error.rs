/// Errors that can occur in RPC engine and server operations.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] capstream_transport::TransportError),

    /// Codec or frame-pump error.
    #[error("codec error: {0}")]
    Codec(#[from] capstream_codec::CodecError),

    /// The bootstrap capability was already set.
    #[error("bootstrap capability already set")]
    BootstrapAlreadySet,

    /// The endpoint was dismissed and no longer routes frames.
    #[error("endpoint dismissed")]
    EndpointDismissed,

    /// No export table entry exists for this identifier.
    #[error("unknown export id {0}")]
    UnknownExport(u32),

    /// No import table entry exists for this identifier.
    #[error("unknown import id {0}")]
    UnknownImport(u32),

    /// The application dispatcher rejected a call.
    #[error("dispatch failed: {0}")]
    Dispatch(String),

    /// Server shutdown could not release every worker.
    #[error("shutdown failed: {0}")]
    ShutdownFailed(String),
}

pub type Result<T> = std::result::Result<T, RpcError>;
