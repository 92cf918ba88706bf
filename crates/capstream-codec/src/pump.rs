use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use capstream_transport::RpcStream;
use tracing::{debug, trace};

use crate::error::{CodecError, Result};
use crate::frame::{frame_len, WireFrame, DEFAULT_MAX_FRAME};
use crate::packed::{pack, PackedDecoder};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Configuration for a frame pump and its sender.
#[derive(Debug, Clone)]
pub struct PumpConfig {
    /// Maximum decoded frame size in bytes. Default: 16 MiB.
    pub max_frame_size: usize,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME,
        }
    }
}

/// Callback receiving each decoded frame, in arrival order.
pub type FrameSink = Box<dyn FnMut(WireFrame) -> Result<()> + Send>;

/// Flags shared between a running pump and its handle.
#[derive(Debug, Default)]
struct PumpFlags {
    waiting: AtomicBool,
    disposed: AtomicBool,
}

/// Turns a packed byte stream into [`WireFrame`]s.
///
/// Owns the read half of one duplex transport. [`FramePump::run`] blocks
/// the calling worker until the transport closes or fails; its return is
/// the sole termination signal consumers observe. Every complete frame is
/// handed to the sink injected at construction, synchronously and in
/// arrival order.
pub struct FramePump<R> {
    inner: R,
    decoder: PackedDecoder,
    unpacked: BytesMut,
    sink: FrameSink,
    config: PumpConfig,
    flags: Arc<PumpFlags>,
}

impl<R: Read> FramePump<R> {
    /// Create a pump with default configuration.
    pub fn new(inner: R, sink: FrameSink) -> Self {
        Self::with_config(inner, sink, PumpConfig::default())
    }

    /// Create a pump with explicit configuration.
    pub fn with_config(inner: R, sink: FrameSink, config: PumpConfig) -> Self {
        Self {
            inner,
            decoder: PackedDecoder::new(),
            unpacked: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            sink,
            config,
            flags: Arc::new(PumpFlags::default()),
        }
    }

    /// Whether the pump is currently blocked waiting for input.
    ///
    /// Diagnostics only; the value is stale the moment it is read.
    pub fn is_waiting_for_data(&self) -> bool {
        self.flags.waiting.load(Ordering::Relaxed)
    }

    /// Run the receive loop to completion.
    ///
    /// Returns `Ok(())` on a clean close at a frame boundary (or after
    /// disposal), and an error for I/O failures, codec corruption, or a
    /// sink rejection. Errors are fatal to the connection; the pump is not
    /// restartable.
    pub fn run(&mut self) -> Result<()> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];

        loop {
            self.dispatch_complete_frames()?;

            self.flags.waiting.store(true, Ordering::Relaxed);
            let read = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => {
                    self.flags.waiting.store(false, Ordering::Relaxed);
                    continue;
                }
                Err(err) => {
                    self.flags.waiting.store(false, Ordering::Relaxed);
                    if self.flags.disposed.load(Ordering::Relaxed) {
                        debug!("pump read unblocked by disposal");
                        return Ok(());
                    }
                    return Err(CodecError::Io(err));
                }
            };
            self.flags.waiting.store(false, Ordering::Relaxed);

            if read == 0 {
                if self.flags.disposed.load(Ordering::Relaxed) {
                    debug!("pump read unblocked by disposal");
                    return Ok(());
                }
                if self.decoder.at_word_boundary() && self.unpacked.is_empty() {
                    debug!("transport closed at frame boundary");
                    return Ok(());
                }
                return Err(CodecError::TruncatedStream);
            }

            trace!(bytes = read, "pump read chunk");
            self.decoder.feed(&chunk[..read], &mut self.unpacked)?;
        }
    }

    fn dispatch_complete_frames(&mut self) -> Result<()> {
        loop {
            match frame_len(&self.unpacked, self.config.max_frame_size)? {
                Some(len) if self.unpacked.len() >= len => {
                    let frame = WireFrame::from_bytes(self.unpacked.split_to(len).freeze())?;
                    trace!(len, "dispatching frame");
                    (self.sink)(frame)?;
                }
                _ => return Ok(()),
            }
        }
    }
}

/// Serialized writer for outbound frames.
///
/// Cloneable; every clone shares one lock around the write half, so two
/// concurrent sends can never interleave their bytes on the wire.
pub struct FrameSender<W> {
    inner: Arc<Mutex<SenderInner<W>>>,
    max_frame_size: usize,
}

struct SenderInner<W> {
    stream: W,
    buf: BytesMut,
}

impl<W> Clone for FrameSender<W> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            max_frame_size: self.max_frame_size,
        }
    }
}

impl<W: Write> FrameSender<W> {
    /// Create a sender with default configuration.
    pub fn new(stream: W) -> Self {
        Self::with_config(stream, PumpConfig::default())
    }

    /// Create a sender with explicit configuration.
    pub fn with_config(stream: W, config: PumpConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SenderInner {
                stream,
                buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            })),
            max_frame_size: config.max_frame_size,
        }
    }

    /// Pack and write one frame (blocking).
    ///
    /// Safe to call from any thread, concurrently with a running pump on
    /// the other half of the stream.
    pub fn send(&self, frame: &WireFrame) -> Result<()> {
        if frame.len() > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                size: frame.len(),
                max: self.max_frame_size,
            });
        }

        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let inner = &mut *inner;

        inner.buf.clear();
        pack(frame.as_bytes(), &mut inner.buf)?;

        let mut offset = 0usize;
        while offset < inner.buf.len() {
            match inner.stream.write(&inner.buf[offset..]) {
                Ok(0) => return Err(CodecError::ConnectionClosed),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(CodecError::Io(err)),
            }
        }

        loop {
            match inner.stream.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(CodecError::Io(err)),
            }
        }
    }
}

/// Disposal and diagnostics handle for a pump over a real socket.
#[derive(Clone)]
pub struct PumpHandle {
    stream: Arc<RpcStream>,
    flags: Arc<PumpFlags>,
}

impl PumpHandle {
    /// Close the transport, unblocking any in-progress read or write.
    ///
    /// Safe to call multiple times and from multiple threads; only the
    /// first call touches the socket.
    pub fn dispose(&self) {
        if !self.flags.disposed.swap(true, Ordering::SeqCst) {
            debug!("disposing pump transport");
            let _ = self.stream.shutdown();
        }
    }

    /// Whether the pump is currently blocked waiting for input.
    pub fn is_waiting_for_data(&self) -> bool {
        self.flags.waiting.load(Ordering::Relaxed)
    }

    /// Whether the pump has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.flags.disposed.load(Ordering::Relaxed)
    }
}

impl FramePump<RpcStream> {
    /// Create a disposal handle for a pump running over a real socket.
    ///
    /// The handle holds its own descriptor of the socket, so disposal
    /// never contends with the read loop.
    pub fn handle(&self) -> Result<PumpHandle> {
        let shutdown_half = self.inner.try_clone().map_err(transport_to_codec_error)?;
        Ok(PumpHandle {
            stream: Arc::new(shutdown_half),
            flags: Arc::clone(&self.flags),
        })
    }
}

/// Wire a pump, sender, and disposal handle over one connected stream.
///
/// The sender and handle use cloned descriptors of the same socket, so the
/// pump's read loop, concurrent sends, and disposal never contend on one
/// `Read`/`Write` object.
pub fn pump_pair(
    stream: RpcStream,
    config: PumpConfig,
    sink: FrameSink,
) -> Result<(FramePump<RpcStream>, FrameSender<RpcStream>, PumpHandle)> {
    let write_half = stream.try_clone().map_err(transport_to_codec_error)?;

    let sender = FrameSender::with_config(write_half, config.clone());
    let pump = FramePump::with_config(stream, sink, config);
    let handle = pump.handle()?;

    Ok((pump, sender, handle))
}

fn transport_to_codec_error(err: capstream_transport::TransportError) -> CodecError {
    match err {
        capstream_transport::TransportError::Io(io)
        | capstream_transport::TransportError::Accept(io) => CodecError::Io(io),
        capstream_transport::TransportError::Bind { source, .. }
        | capstream_transport::TransportError::Connect { source, .. } => CodecError::Io(source),
        other => CodecError::Io(std::io::Error::other(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::mpsc;

    use super::*;

    fn frame_with(byte: u8, words: usize) -> WireFrame {
        WireFrame::single_segment(vec![byte; words * 8]).expect("aligned payload")
    }

    fn packed_bytes(frames: &[WireFrame]) -> Vec<u8> {
        let mut wire = BytesMut::new();
        for frame in frames {
            pack(frame.as_bytes(), &mut wire).unwrap();
        }
        wire.to_vec()
    }

    fn collecting_sink() -> (FrameSink, mpsc::Receiver<WireFrame>) {
        let (tx, rx) = mpsc::channel();
        let sink: FrameSink = Box::new(move |frame| {
            tx.send(frame)
                .map_err(|e| CodecError::Receiver(e.to_string()))
        });
        (sink, rx)
    }

    #[test]
    fn pumps_single_frame() {
        let frame = frame_with(0xAB, 4);
        let wire = packed_bytes(std::slice::from_ref(&frame));

        let (sink, rx) = collecting_sink();
        let mut pump = FramePump::new(Cursor::new(wire), sink);
        pump.run().unwrap();

        let got = rx.try_recv().unwrap();
        assert_eq!(got.as_bytes(), frame.as_bytes());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn pumps_frames_in_arrival_order() {
        let frames = [frame_with(1, 2), frame_with(2, 300), frame_with(3, 1)];
        let wire = packed_bytes(&frames);

        let (sink, rx) = collecting_sink();
        let mut pump = FramePump::new(Cursor::new(wire), sink);
        pump.run().unwrap();

        for expected in &frames {
            let got = rx.try_recv().unwrap();
            assert_eq!(got.as_bytes(), expected.as_bytes());
        }
    }

    #[test]
    fn byte_by_byte_reader_reassembles_frames() {
        let frames = [frame_with(0x11, 8), frame_with(0x22, 3)];
        let wire = packed_bytes(&frames);

        let (sink, rx) = collecting_sink();
        let mut pump = FramePump::new(
            ByteByByteReader {
                bytes: wire,
                pos: 0,
            },
            sink,
        );
        pump.run().unwrap();

        for expected in &frames {
            let got = rx.try_recv().unwrap();
            assert_eq!(got.as_bytes(), expected.as_bytes());
        }
    }

    #[test]
    fn eof_mid_frame_is_truncation() {
        let frame = frame_with(0x5A, 16);
        let mut wire = packed_bytes(std::slice::from_ref(&frame));
        wire.truncate(wire.len() - 3);

        let (sink, _rx) = collecting_sink();
        let mut pump = FramePump::new(Cursor::new(wire), sink);
        let err = pump.run().unwrap_err();
        assert!(matches!(err, CodecError::TruncatedStream));
    }

    #[test]
    fn eof_on_empty_stream_is_clean() {
        let (sink, rx) = collecting_sink();
        let mut pump = FramePump::new(Cursor::new(Vec::<u8>::new()), sink);
        pump.run().unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn oversized_frame_is_fatal() {
        let frame = frame_with(0x77, 64);
        let wire = packed_bytes(std::slice::from_ref(&frame));

        let (sink, _rx) = collecting_sink();
        let mut pump = FramePump::with_config(
            Cursor::new(wire),
            sink,
            PumpConfig {
                max_frame_size: 64,
            },
        );
        let err = pump.run().unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge { .. }));
    }

    #[test]
    fn sink_error_stops_the_pump() {
        let frames = [frame_with(1, 1), frame_with(2, 1)];
        let wire = packed_bytes(&frames);

        let sink: FrameSink = Box::new(|_| Err(CodecError::Receiver("rejected".to_string())));
        let mut pump = FramePump::new(Cursor::new(wire), sink);
        let err = pump.run().unwrap_err();
        assert!(matches!(err, CodecError::Receiver(_)));
    }

    #[test]
    fn sender_output_feeds_pump() {
        let sender = FrameSender::new(Cursor::new(Vec::<u8>::new()));
        let frames = [frame_with(0xC3, 5), frame_with(0x0F, 1)];
        for frame in &frames {
            sender.send(frame).unwrap();
        }

        let wire = match Arc::try_unwrap(sender.inner) {
            Ok(mutex) => mutex.into_inner().unwrap().stream.into_inner(),
            Err(_) => unreachable!("sole owner"),
        };

        let (sink, rx) = collecting_sink();
        let mut pump = FramePump::new(Cursor::new(wire), sink);
        pump.run().unwrap();

        for expected in &frames {
            let got = rx.try_recv().unwrap();
            assert_eq!(got.as_bytes(), expected.as_bytes());
        }
    }

    #[test]
    fn sender_rejects_oversized_frame() {
        let sender = FrameSender::with_config(
            Cursor::new(Vec::<u8>::new()),
            PumpConfig { max_frame_size: 16 },
        );
        let err = sender.send(&frame_with(1, 8)).unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge { .. }));
    }

    #[test]
    fn concurrent_senders_do_not_interleave() {
        let (left, right) = std::os::unix::net::UnixStream::pair().unwrap();
        let sender = FrameSender::new(left);

        let writers: Vec<_> = (0..4u8)
            .map(|i| {
                let sender = sender.clone();
                std::thread::spawn(move || {
                    for _ in 0..16 {
                        sender.send(&frame_with(i + 1, 32)).unwrap();
                    }
                })
            })
            .collect();

        let (sink, rx) = collecting_sink();
        let reader = std::thread::spawn(move || {
            let mut pump = FramePump::new(right, sink);
            pump.run()
        });

        for writer in writers {
            writer.join().unwrap();
        }
        drop(sender); // close the write half so the pump sees EOF

        reader.join().unwrap().unwrap();

        let mut count = 0;
        while let Ok(frame) = rx.try_recv() {
            // Every frame must be internally uniform; interleaving would mix fills.
            let seg = frame.segment(0).unwrap();
            assert!(seg.iter().all(|&b| b == seg[0]));
            count += 1;
        }
        assert_eq!(count, 64);
    }

    #[test]
    fn dispose_unblocks_running_pump() {
        use capstream_transport::TcpSocket;

        let listener = TcpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr();

        let client = std::thread::spawn(move || TcpSocket::connect(addr).unwrap());
        let server_stream = listener.accept().unwrap();
        let _client = client.join().unwrap();

        let (sink, _rx) = collecting_sink();
        let (mut pump, _sender, handle) =
            pump_pair(server_stream, PumpConfig::default(), sink).unwrap();

        let waiter = handle.clone();
        let worker = std::thread::spawn(move || pump.run());

        // Wait for the pump to block on the socket.
        for _ in 0..100 {
            if waiter.is_waiting_for_data() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }

        handle.dispose();
        handle.dispose(); // idempotent

        worker.join().unwrap().unwrap();
        assert!(handle.is_disposed());
    }

    struct ByteByByteReader {
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for ByteByByteReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos >= self.bytes.len() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.bytes[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }
}
