use clap::{Args, Subcommand};

use crate::exit::CliResult;
use crate::output::OutputFormat;

pub mod pack;
pub mod serve;
pub mod unpack;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run an RPC server with an echo dispatcher.
    Serve(ServeArgs),
    /// Pack word-aligned bytes from stdin to stdout.
    Pack(PackArgs),
    /// Unpack a packed stream from stdin to stdout.
    Unpack(UnpackArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args, format),
        Command::Pack(args) => pack::run(args),
        Command::Unpack(args) => unpack::run(args),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to bind, e.g. 127.0.0.1:7000.
    pub addr: String,
    /// Interval between connection-snapshot reports (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub stats_interval: String,
    /// Maximum decoded frame size in bytes.
    #[arg(long)]
    pub max_frame_size: Option<usize>,
}

#[derive(Args, Debug, Default)]
pub struct PackArgs {}

#[derive(Args, Debug, Default)]
pub struct UnpackArgs {}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}
