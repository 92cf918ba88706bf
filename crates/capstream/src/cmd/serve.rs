use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use capstream_codec::{PumpConfig, WireFrame};
use capstream_rpc::{Capability, RpcEngine, RpcServer};

use crate::cmd::ServeArgs;
use crate::exit::{rpc_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{print_snapshot, OutputFormat};

const POLL_TICK: Duration = Duration::from_millis(100);

/// Bootstrap capability of the demo server: returns its params verbatim.
struct EchoCap;

impl Capability for EchoCap {
    fn call(
        &self,
        _interface_id: u64,
        _method_id: u16,
        params: WireFrame,
    ) -> capstream_rpc::Result<WireFrame> {
        Ok(params)
    }

    fn name(&self) -> &str {
        "echo"
    }
}

pub fn run(args: ServeArgs, format: OutputFormat) -> CliResult<i32> {
    let addr: SocketAddr = args
        .addr
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid listen address: {}", args.addr)))?;
    let stats_interval = parse_duration(&args.stats_interval)?;

    let mut config = PumpConfig::default();
    if let Some(max) = args.max_frame_size {
        config.max_frame_size = max;
    }

    let engine = RpcEngine::with_dispatcher(Box::new(|_, frame| Ok(Some(frame))));
    engine
        .set_bootstrap(Arc::new(EchoCap))
        .map_err(|err| rpc_error("bootstrap setup failed", err))?;

    let server = RpcServer::bind_with_config(addr, engine, config)
        .map_err(|err| rpc_error("bind failed", err))?;
    tracing::info!(addr = %server.local_addr(), "serving");

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let mut last_report = Instant::now();
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(POLL_TICK);
        if last_report.elapsed() >= stats_interval {
            print_snapshot(&server.snapshot(), format);
            last_report = Instant::now();
        }
    }

    tracing::info!("interrupt received, shutting down");
    server
        .shutdown()
        .map_err(|err| rpc_error("shutdown failed", err))?;
    Ok(SUCCESS)
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| {
        CliError::new(
            crate::exit::INTERNAL,
            format!("signal handler setup failed: {err}"),
        )
    })
}

pub(crate) fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        _ => Err(CliError::new(
            USAGE,
            format!("unsupported duration unit: {unit}"),
        )),
    }
}
