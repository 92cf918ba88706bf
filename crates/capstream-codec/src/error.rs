/// Errors that can occur during packing, unpacking, or frame pumping.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Input to the packer is not a whole number of 8-byte words.
    #[error("unaligned input ({len} bytes is not a multiple of 8)")]
    UnalignedInput { len: usize },

    /// The byte stream ended in the middle of a word or a tagged run.
    #[error("stream truncated mid-word")]
    TruncatedStream,

    /// The frame's segment table is inconsistent with its contents.
    #[error("corrupt segment table: {0}")]
    CorruptSegmentTable(String),

    /// The frame exceeds the configured maximum size.
    #[error("frame too large ({size} bytes, max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// An I/O error occurred while reading or writing the packed stream.
    #[error("codec I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete frame was transferred.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,

    /// The frame receiver rejected a dispatched frame.
    #[error("frame receiver failed: {0}")]
    Receiver(String),
}

pub type Result<T> = std::result::Result<T, CodecError>;
