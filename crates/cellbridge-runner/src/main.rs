//! `cellbridge`: run the MAVLink/MQTT bridge on a host.
//!
//! ```text
//! cellbridge --config bridge.yaml
//! cellbridge --modem 127.0.0.1:7000 --telemetry sim --verbose
//! cellbridge --max-ticks 2000          # smoke run against the simulators
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cellbridge_runner::{open_modem, open_telemetry, App, LinkSpec, RunnerConfig, RunnerResult};
use cellbridge_uart::{Clock, SystemClock};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "cellbridge")]
#[command(version, about = "Bridge MAVLink telemetry to MQTT over an A7600 cellular modem")]
struct Args {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Modem link: host:port of a serial-over-TCP bridge, or "sim"
    #[arg(long)]
    modem: Option<String>,

    /// Telemetry link: host:port of a serial-over-TCP bridge, or "sim"
    #[arg(long)]
    telemetry: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Stop after this many supervisor ticks
    #[arg(long)]
    max_ticks: Option<u64>,

    /// Supervisor tick period in milliseconds
    #[arg(long, default_value = "10")]
    tick_ms: u64,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run(args: Args) -> RunnerResult<()> {
    let mut config = match &args.config {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            RunnerConfig::load(path)?
        }
        None => RunnerConfig::default(),
    };
    if let Some(modem) = args.modem {
        config.links.modem = LinkSpec::from(modem);
    }
    if let Some(telemetry) = args.telemetry {
        config.links.telemetry = LinkSpec::from(telemetry);
    }
    config.validate()?;

    info!("cellbridge v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Broker {}:{} as {} (TLS {})",
        config.mqtt.broker,
        config.mqtt.port,
        config.mqtt.client_id,
        if config.mqtt.use_ssl { "on" } else { "off" }
    );
    cellbridge_metrics::describe_metrics();

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || {
            stop.store(true, Ordering::SeqCst);
        })?;
    }

    let (modem, mut modem_link) = open_modem(&config.links.modem)?;
    let (telemetry, mut telemetry_link) = open_telemetry(&config.links.telemetry)?;

    let clock = SystemClock::new();
    let mut app = App::new(modem, telemetry, clock, &config)?;
    if let Some(path) = &config.tls.ca_cert_path {
        let pem = std::fs::read(path)?;
        info!("Will install {} as {}", path.display(), config.tls.cert_name);
        app = app.with_certificate(&config.tls.cert_name, pem);
    }

    let mut ticks: u64 = 0;
    while !stop.load(Ordering::SeqCst) {
        let now = clock.now_ms();
        modem_link.tick(now);
        telemetry_link.tick(now);
        app.tick();

        ticks += 1;
        if args.max_ticks.is_some_and(|max| ticks >= max) {
            break;
        }
        clock.delay_ms(args.tick_ms);
    }

    info!("Shutting down after {} ticks", ticks);
    app.shutdown();

    let stats = app.bridge_stats();
    info!(
        "Bridge: {} frames forwarded, {} publish failures, {} downlink messages, {} dropped",
        stats.frames_forwarded,
        stats.publish_failures,
        stats.inbound_messages,
        stats.inbound_dropped
    );

    modem_link.shutdown();
    telemetry_link.shutdown();
    Ok(())
}
