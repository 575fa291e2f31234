use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

/// Forwards tagged MQTT messages into an append-only record log
#[derive(Parser, Debug)]
#[command(name = "mqtt-log-bridge", version, about, disable_help_flag = true)]
pub struct Cli {
    /// Broker address, e.g. tcp://localhost:1883
    #[arg(short = 'h', long = "host", value_name = "BROKER_ADDRESS")]
    pub host: Option<String>,

    /// MQTT client identifier
    #[arg(short = 'c', long = "client-id", value_name = "CLIENT_ID")]
    pub client_id: Option<String>,

    /// Topic to subscribe to; repeat for several topics
    #[arg(short = 't', long = "topic", value_name = "TOPIC")]
    pub topics: Vec<String>,

    /// QoS used for the topics given with -t
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=2))]
    pub qos: Option<u8>,

    /// Configuration file (TOML)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Directory of the file-backed record store
    #[arg(long, global = true, value_name = "DIR")]
    pub store_dir: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Print help
    #[arg(long, action = ArgAction::Help)]
    pub help: Option<bool>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Print every record stored in a channel
    ReadLog {
        /// Channel (topic) name
        channel: String,
    },
}
