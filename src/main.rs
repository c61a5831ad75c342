/// Service entry point.
///
/// Wires together config, store, notifier and the converter backend, then
/// hands everything to the monitoring engine. Secrets come from the
/// environment (`.env` supported): `DATABASE_URL` for Postgres,
/// `SLACK_BOT_TOKEN` for Slack.

use std::error::Error;
use std::path::PathBuf;

use chrono::Utc;

use leakmon_service::adc;
use leakmon_service::config::MonitorConfig;
use leakmon_service::dev_mode::SimulatedAdc;
use leakmon_service::logging::{self, LogLevel, Subsystem};
use leakmon_service::monitor::WaterMonitor;
use leakmon_service::notify::SlackNotifier;
use leakmon_service::store::{MemoryStore, PgStore, ReadingStore};

const DEFAULT_CONFIG_PATH: &str = "config.toml";

struct Args {
    config_path: PathBuf,
    debug: bool,
}

fn parse_args() -> Args {
    let mut args = Args {
        config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
        debug: false,
    };

    let mut argv = std::env::args().skip(1);
    while let Some(arg) = argv.next() {
        match arg.as_str() {
            "--config" => {
                if let Some(path) = argv.next() {
                    args.config_path = PathBuf::from(path);
                }
            }
            "--debug" => args.debug = true,
            other => {
                eprintln!("Unknown argument: {}", other);
                eprintln!("Usage: leakmon_service [--config <path>] [--debug]");
                std::process::exit(2);
            }
        }
    }
    args
}

fn main() -> Result<(), Box<dyn Error>> {
    dotenv::dotenv().ok();
    let args = parse_args();

    // The config may name a log file, so load it before initializing the
    // logger, with a bootstrap logger for load-time messages.
    logging::init_logger(LogLevel::Info, None);
    let config = MonitorConfig::load(&args.config_path)?;

    let min_level = if args.debug {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    logging::init_logger(min_level, config.log_file.as_deref());
    logging::info(Subsystem::System, None, "Starting water monitoring service");

    let store: Box<dyn ReadingStore> = match std::env::var("DATABASE_URL") {
        Ok(url) => Box::new(PgStore::connect(&url)?),
        Err(_) => {
            logging::warn(
                Subsystem::Database,
                None,
                "DATABASE_URL not set, readings will be kept in memory only",
            );
            Box::new(MemoryStore::new())
        }
    };

    let notifier = SlackNotifier::new(&config.slack, std::env::var("SLACK_BOT_TOKEN").ok())?;
    notifier.test_connection();

    // No hardware driver is linked on development machines; the simulated
    // converter stands in behind the same interface.
    logging::info(
        Subsystem::Adc,
        None,
        "Using simulated converter backend (both containers at 75%)",
    );
    let backend = adc::share(Box::new(SimulatedAdc::new(75.0, 75.0)));

    let mut monitor = WaterMonitor::new(
        backend,
        config,
        store,
        Box::new(notifier),
        args.config_path,
        Utc::now(),
    );
    monitor.start();

    logging::info(Subsystem::System, None, "Service running, Ctrl-C to stop");
    loop {
        std::thread::park();
    }
}
