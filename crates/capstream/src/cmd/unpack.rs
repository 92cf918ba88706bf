use std::io::{Read, Write};

use bytes::BytesMut;
use capstream_codec::PackedDecoder;

use crate::cmd::UnpackArgs;
use crate::exit::{codec_error, io_error, CliError, CliResult, DATA_INVALID, SUCCESS};

pub fn run(_args: UnpackArgs) -> CliResult<i32> {
    let mut input = Vec::new();
    std::io::stdin()
        .read_to_end(&mut input)
        .map_err(|err| io_error("reading stdin failed", err))?;

    let unpacked = unpack_bytes(&input)?;

    let mut out = std::io::stdout();
    out.write_all(&unpacked)
        .map_err(|err| io_error("writing stdout failed", err))?;
    out.flush()
        .map_err(|err| io_error("writing stdout failed", err))?;
    Ok(SUCCESS)
}

fn unpack_bytes(input: &[u8]) -> CliResult<Vec<u8>> {
    let mut decoder = PackedDecoder::new();
    let mut out = BytesMut::with_capacity(input.len().max(64));
    decoder
        .feed(input, &mut out)
        .map_err(|err| codec_error("unpacking failed", err))?;
    if !decoder.at_word_boundary() {
        return Err(CliError::new(DATA_INVALID, "packed input ends mid-word"));
    }
    Ok(out.to_vec())
}
