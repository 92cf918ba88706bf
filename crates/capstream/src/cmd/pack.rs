use std::io::{Read, Write};

use bytes::BytesMut;
use capstream_codec::pack;

use crate::cmd::PackArgs;
use crate::exit::{codec_error, io_error, CliResult, SUCCESS};

pub fn run(_args: PackArgs) -> CliResult<i32> {
    let mut input = Vec::new();
    std::io::stdin()
        .read_to_end(&mut input)
        .map_err(|err| io_error("reading stdin failed", err))?;

    let packed = pack_bytes(&input)?;

    let mut out = std::io::stdout();
    out.write_all(&packed)
        .map_err(|err| io_error("writing stdout failed", err))?;
    out.flush()
        .map_err(|err| io_error("writing stdout failed", err))?;
    Ok(SUCCESS)
}

fn pack_bytes(input: &[u8]) -> CliResult<Vec<u8>> {
    let mut packed = BytesMut::with_capacity(input.len());
    pack(input, &mut packed).map_err(|err| codec_error("packing failed", err))?;
    Ok(packed.to_vec())
}
