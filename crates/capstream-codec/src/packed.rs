use bytes::{BufMut, BytesMut};

use crate::error::{CodecError, Result};

/// Size of one wire word in bytes.
pub const WORD_SIZE: usize = 8;

/// Longest run (in words) a single count byte can describe.
const MAX_RUN_WORDS: usize = 256;

/// Pack a word-aligned buffer into the compact wire representation.
///
/// Each 8-byte word is preceded by a tag byte whose bit *i* (LSB first) is
/// set iff byte *i* of the word is nonzero; only the nonzero bytes follow.
/// Two runs get special treatment:
///
/// - tag `0x00` (all-zero word) is followed by a count byte *n*, standing
///   for *n+1* consecutive zero words;
/// - tag `0xFF` (all-nonzero word) is followed by its 8 bytes, a count
///   byte *m*, and *m* further words copied verbatim with no tags.
///
/// Runs longer than 256 words are split into multiple runs.
pub fn pack(input: &[u8], dst: &mut BytesMut) -> Result<()> {
    if input.len() % WORD_SIZE != 0 {
        return Err(CodecError::UnalignedInput { len: input.len() });
    }

    let word_count = input.len() / WORD_SIZE;
    let mut i = 0;
    while i < word_count {
        let word = word_at(input, i);
        let tag = tag_of(word);

        match tag {
            0x00 => {
                let mut extra = 0;
                while extra < MAX_RUN_WORDS - 1
                    && i + 1 + extra < word_count
                    && tag_of(word_at(input, i + 1 + extra)) == 0x00
                {
                    extra += 1;
                }
                dst.put_u8(0x00);
                dst.put_u8(extra as u8);
                i += 1 + extra;
            }
            0xFF => {
                dst.put_u8(0xFF);
                dst.put_slice(word);
                let mut extra = 0;
                while extra < MAX_RUN_WORDS - 1
                    && i + 1 + extra < word_count
                    && tag_of(word_at(input, i + 1 + extra)) == 0xFF
                {
                    extra += 1;
                }
                dst.put_u8(extra as u8);
                dst.put_slice(&input[(i + 1) * WORD_SIZE..(i + 1 + extra) * WORD_SIZE]);
                i += 1 + extra;
            }
            tag => {
                dst.put_u8(tag);
                for &byte in word {
                    if byte != 0 {
                        dst.put_u8(byte);
                    }
                }
                i += 1;
            }
        }
    }

    Ok(())
}

fn word_at(input: &[u8], index: usize) -> &[u8] {
    &input[index * WORD_SIZE..(index + 1) * WORD_SIZE]
}

fn tag_of(word: &[u8]) -> u8 {
    let mut tag = 0u8;
    for (bit, &byte) in word.iter().enumerate() {
        if byte != 0 {
            tag |= 1 << bit;
        }
    }
    tag
}

#[derive(Debug, Clone, Copy)]
enum DecodeState {
    /// Expecting the next tag byte.
    Tag,
    /// Saw tag 0x00; expecting the zero-run count byte.
    ZeroRunCount,
    /// Filling literal bytes of the current word; `bit` is the next tag
    /// bit to examine.
    Literal { tag: u8, bit: u8 },
    /// Saw a complete 0xFF word; expecting the literal-run count byte.
    LiteralRunCount,
    /// Copying a literal run verbatim; `bytes_left` counts down to zero.
    LiteralRun { bytes_left: usize },
}

/// Streaming decoder for the packed representation.
///
/// `feed` consumes an arbitrary chunk of packed bytes and appends the
/// unpacked words to `out`. All decode state — a partially filled word,
/// a tag whose literal bytes have not all arrived, a run count still
/// pending — is carried across calls, so the input may be split at any
/// byte boundary.
#[derive(Debug)]
pub struct PackedDecoder {
    state: DecodeState,
    word: [u8; WORD_SIZE],
}

impl Default for PackedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl PackedDecoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::Tag,
            word: [0u8; WORD_SIZE],
        }
    }

    /// Decode `input`, appending unpacked bytes to `out`.
    ///
    /// Always consumes the entire input; a partially transferred word is
    /// held internally until the next call supplies the rest.
    pub fn feed(&mut self, mut input: &[u8], out: &mut BytesMut) -> Result<()> {
        loop {
            match self.state {
                DecodeState::Tag => {
                    let Some((&tag, rest)) = input.split_first() else {
                        return Ok(());
                    };
                    input = rest;
                    if tag == 0x00 {
                        self.state = DecodeState::ZeroRunCount;
                    } else {
                        self.word = [0u8; WORD_SIZE];
                        self.state = DecodeState::Literal { tag, bit: 0 };
                    }
                }
                DecodeState::ZeroRunCount => {
                    let Some((&count, rest)) = input.split_first() else {
                        return Ok(());
                    };
                    input = rest;
                    out.put_bytes(0, (count as usize + 1) * WORD_SIZE);
                    self.state = DecodeState::Tag;
                }
                DecodeState::Literal { tag, bit } => {
                    let mut bit = bit;
                    while bit < 8 {
                        if tag & (1 << bit) != 0 {
                            let Some((&byte, rest)) = input.split_first() else {
                                self.state = DecodeState::Literal { tag, bit };
                                return Ok(());
                            };
                            input = rest;
                            self.word[bit as usize] = byte;
                        }
                        bit += 1;
                    }
                    out.put_slice(&self.word);
                    self.state = if tag == 0xFF {
                        DecodeState::LiteralRunCount
                    } else {
                        DecodeState::Tag
                    };
                }
                DecodeState::LiteralRunCount => {
                    let Some((&count, rest)) = input.split_first() else {
                        return Ok(());
                    };
                    input = rest;
                    if count == 0 {
                        self.state = DecodeState::Tag;
                    } else {
                        self.state = DecodeState::LiteralRun {
                            bytes_left: count as usize * WORD_SIZE,
                        };
                    }
                }
                DecodeState::LiteralRun { bytes_left } => {
                    if input.is_empty() {
                        return Ok(());
                    }
                    let take = bytes_left.min(input.len());
                    out.put_slice(&input[..take]);
                    input = &input[take..];
                    let remaining = bytes_left - take;
                    self.state = if remaining == 0 {
                        DecodeState::Tag
                    } else {
                        DecodeState::LiteralRun {
                            bytes_left: remaining,
                        }
                    };
                }
            }
        }
    }

    /// Whether the decoder is between words.
    ///
    /// A stream that ends anywhere else was cut mid-word or mid-run and
    /// must be treated as corrupt by the caller.
    pub fn at_word_boundary(&self) -> bool {
        matches!(self.state, DecodeState::Tag)
    }
}
