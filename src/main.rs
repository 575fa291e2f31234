pub mod bridge;
pub mod cli;
pub mod config;
pub mod mqtt;
pub mod reader;
pub mod store;

use crate::bridge::{run_session, MessageBridge};
use crate::cli::{Cli, Command};
use crate::config::{Config, StoreBackend, StoreSettings};
use crate::mqtt::MqttHandler;
use crate::store::{FileRecordStore, MemoryRecordStore, RecordStore};
use clap::Parser;
use color_eyre::{
    eyre::{eyre, WrapErr},
    Result,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup(cli.verbose)?;

    let mut config = Config::load(cli.config.as_deref())?;
    config.apply_cli(&cli);

    match &cli.command {
        Some(Command::ReadLog { channel }) => run_read_log(&config, channel),
        None => run_bridge(&config).await,
    }
}

fn setup(verbose: bool) -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env(if verbose { Level::DEBUG } else { Level::INFO });
    Ok(())
}

fn setup_logging_env(level: Level) {
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_bridge(config: &Config) -> Result<()> {
    let mqtt_config = config.mqtt_config()?;
    let store_settings = config.store_settings()?;

    let mut store = open_store(&store_settings);
    store
        .init()
        .wrap_err("Failed to initialize record store")?;

    let mut bridge = MessageBridge::new(store, store_settings.channels);
    for subscription in mqtt_config.subscriptions.iter().filter(|s| !s.is_filter()) {
        bridge
            .provision(&subscription.topic)
            .wrap_err_with(|| format!("Failed to create channel {}", subscription.topic))?;
    }

    println!("Connecting to the MQTT server at {}...", mqtt_config.server);
    let mut handler = MqttHandler::connect(&mqtt_config)
        .await
        .wrap_err_with(|| format!("Failed to connect to {}", mqtt_config.server))?;
    println!("OK");

    let shutdown = CancellationToken::new();
    let _signal_watcher = spawn_signal_watcher(shutdown.clone());

    let outcome = run_session(&mut handler, &mut bridge, &shutdown).await;
    shutdown.cancel();

    if let (Err(_), Err(e)) = (&outcome.consume, &outcome.disconnect) {
        error!("Disconnect failed as well: {}", e);
    }
    let summary = outcome.consume.wrap_err("Stopped forwarding messages")?;
    outcome
        .disconnect
        .wrap_err("MQTT session ended with an error")?;

    info!("Session ended: {:?}", summary.stop);
    println!(
        "Disconnected: {} records forwarded, {} messages skipped",
        summary.forwarded, summary.skipped
    );
    Ok(())
}

fn run_read_log(config: &Config, channel: &str) -> Result<()> {
    let settings = config.store_settings()?;
    if settings.backend == StoreBackend::Memory {
        return Err(eyre!("read-log needs the file store backend"));
    }

    let mut store = FileRecordStore::new(&settings.root);
    store
        .init()
        .wrap_err("Failed to initialize record store")?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    reader::read_log(&mut store, channel, &mut out)?;
    Ok(())
}

fn open_store(settings: &StoreSettings) -> Box<dyn RecordStore + Send> {
    match settings.backend {
        StoreBackend::File => {
            info!("Using file record store at {}", settings.root.display());
            Box::new(FileRecordStore::new(&settings.root))
        }
        StoreBackend::Memory => {
            warn!("Using in-memory record store, records are lost on exit");
            Box::new(MemoryRecordStore::new())
        }
    }
}

fn spawn_signal_watcher(shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            res = tokio::signal::ctrl_c() => match res {
                Ok(()) => {
                    info!("Interrupt received, shutting down");
                    shutdown.cancel();
                }
                Err(e) => warn!("Unable to listen for Ctrl-C: {}", e),
            },
            _ = shutdown.cancelled() => {}
        }
    })
}
