use rumqttc::{ClientError, ConnectReturnCode, ConnectionError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MqttError {
    #[error("invalid broker address {0:?}")]
    InvalidAddress(String),

    #[error("unsupported broker scheme {0:?} (only tcp:// and mqtt:// are supported)")]
    UnsupportedScheme(String),

    #[error("invalid QoS level {0} (expected 0, 1 or 2)")]
    InvalidQos(u8),

    /// The first connection attempt failed
    #[error("could not connect to broker: {0}")]
    Connect(#[source] ConnectionError),

    #[error("event loop ended before the broker acknowledged the connection")]
    NotConnected,

    #[error("broker refused connection: {0:?}")]
    Refused(ConnectReturnCode),

    #[error("connection lost after {attempts} reconnect attempts: {source}")]
    ConnectionLost {
        attempts: u32,
        #[source]
        source: ConnectionError,
    },

    #[error("client request failed: {0}")]
    Client(#[from] ClientError),

    #[error("event loop task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
