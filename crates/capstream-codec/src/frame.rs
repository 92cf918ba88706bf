use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{CodecError, Result};
use crate::packed::WORD_SIZE;

/// Default maximum frame size: 16 MiB.
pub const DEFAULT_MAX_FRAME: usize = 16 * 1024 * 1024;

/// Upper bound on segments per frame; anything above this is corruption.
pub const MAX_SEGMENTS: u32 = 512;

/// One complete encoded protocol message.
///
/// Owns a contiguous buffer holding the segment table followed by the
/// segment data. Immutable once constructed; total length is always a
/// multiple of 8 bytes. Ownership transfers from producer to consumer on
/// send and receive.
///
/// Segment table layout (all `u32` little-endian):
/// segment count minus one, then one size-in-words entry per segment,
/// then a zero entry if needed to pad the table to a word boundary.
#[derive(Debug, Clone)]
pub struct WireFrame {
    bytes: Bytes,
    /// (offset, len) per segment, both in bytes.
    segments: Vec<(usize, usize)>,
}

impl WireFrame {
    /// Wrap a complete encoded message, validating its segment table.
    pub fn from_bytes(bytes: Bytes) -> Result<Self> {
        if bytes.len() % WORD_SIZE != 0 {
            return Err(CodecError::CorruptSegmentTable(format!(
                "frame length {} is not word-aligned",
                bytes.len()
            )));
        }
        if bytes.len() < WORD_SIZE {
            return Err(CodecError::CorruptSegmentTable(
                "frame shorter than one word".to_string(),
            ));
        }

        let segment_count = read_u32(&bytes, 0)
            .checked_add(1)
            .ok_or_else(|| CodecError::CorruptSegmentTable("segment count overflow".to_string()))?;
        if segment_count > MAX_SEGMENTS {
            return Err(CodecError::CorruptSegmentTable(format!(
                "{segment_count} segments exceeds limit {MAX_SEGMENTS}"
            )));
        }

        let table_len = table_len(segment_count);
        let mut segments = Vec::with_capacity(segment_count as usize);
        let mut offset = table_len;
        for i in 0..segment_count {
            let words = read_u32(&bytes, 4 + 4 * i as usize) as usize;
            let len = words * WORD_SIZE;
            segments.push((offset, len));
            offset = offset.checked_add(len).ok_or_else(|| {
                CodecError::CorruptSegmentTable("segment sizes overflow".to_string())
            })?;
        }

        if offset != bytes.len() {
            return Err(CodecError::CorruptSegmentTable(format!(
                "table describes {offset} bytes but frame holds {}",
                bytes.len()
            )));
        }

        Ok(Self { bytes, segments })
    }

    /// Build a single-segment frame around a word-aligned payload.
    pub fn single_segment(payload: impl Into<Bytes>) -> Result<Self> {
        let payload = payload.into();
        if payload.len() % WORD_SIZE != 0 {
            return Err(CodecError::UnalignedInput { len: payload.len() });
        }

        let mut buf = BytesMut::with_capacity(WORD_SIZE + payload.len());
        buf.put_u32_le(0);
        buf.put_u32_le((payload.len() / WORD_SIZE) as u32);
        buf.put_slice(&payload);
        Self::from_bytes(buf.freeze())
    }

    /// Number of segments in this frame.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Borrow the data of segment `index`.
    pub fn segment(&self, index: usize) -> Option<&[u8]> {
        self.segments
            .get(index)
            .map(|&(offset, len)| &self.bytes[offset..offset + len])
    }

    /// Total encoded length of the frame, segment table included.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The complete encoded message, ready for packing and transmission.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consume the frame, yielding its buffer.
    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }
}

/// Determine the total length of the frame starting at `prefix[0]`.
///
/// Returns `Ok(None)` while `prefix` is still too short to hold the
/// segment-size entries; the frame's own header is the only framing — no
/// outer length prefix exists on the wire.
pub fn frame_len(prefix: &[u8], max_frame_size: usize) -> Result<Option<usize>> {
    if prefix.len() < 4 {
        return Ok(None);
    }

    let segment_count = read_u32(prefix, 0)
        .checked_add(1)
        .ok_or_else(|| CodecError::CorruptSegmentTable("segment count overflow".to_string()))?;
    if segment_count > MAX_SEGMENTS {
        return Err(CodecError::CorruptSegmentTable(format!(
            "{segment_count} segments exceeds limit {MAX_SEGMENTS}"
        )));
    }

    let entries_end = 4 + 4 * segment_count as usize;
    if prefix.len() < entries_end {
        return Ok(None);
    }

    let mut total = table_len(segment_count);
    for i in 0..segment_count {
        let words = read_u32(prefix, 4 + 4 * i as usize) as usize;
        total = total
            .checked_add(words * WORD_SIZE)
            .ok_or_else(|| CodecError::CorruptSegmentTable("segment sizes overflow".to_string()))?;
    }

    if total > max_frame_size {
        return Err(CodecError::FrameTooLarge {
            size: total,
            max: max_frame_size,
        });
    }

    Ok(Some(total))
}

/// Byte length of the segment table for `segment_count` segments, padding
/// to a word boundary included.
fn table_len(segment_count: u32) -> usize {
    let raw = 4 + 4 * segment_count as usize;
    raw.div_ceil(WORD_SIZE) * WORD_SIZE
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}
