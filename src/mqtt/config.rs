use rumqttc::QoS;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::error::MqttError;

pub const DEFAULT_PORT: u16 = 1883;

/// Broker endpoint reachable over plain TCP
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
}

impl FromStr for BrokerAddress {
    type Err = MqttError;

    /// Accepts `tcp://host:port`, `mqtt://host:port`, `host:port` and `host`
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        let rest = match raw.split_once("://") {
            Some(("tcp" | "mqtt", rest)) => rest,
            Some((scheme, _)) => return Err(MqttError::UnsupportedScheme(scheme.to_string())),
            None => raw,
        };
        let rest = rest.trim_end_matches('/');

        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| MqttError::InvalidAddress(raw.to_string()))?;
                (host, port)
            }
            None => (rest, DEFAULT_PORT),
        };

        if host.is_empty() || host.contains('/') {
            return Err(MqttError::InvalidAddress(raw.to_string()));
        }
        Ok(BrokerAddress {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "tcp://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSubscription {
    pub topic: String,
    pub qos: QoS,
}

impl TopicSubscription {
    /// Wildcard filters cannot name a channel up front
    pub fn is_filter(&self) -> bool {
        self.topic.contains(|c| c == '#' || c == '+')
    }
}

/// Exponential backoff between reconnect attempts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
    /// `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(2),
            max: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    pub fn next_delay(&self, current: Duration) -> Duration {
        (current * 2).min(self.max)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MqttConfig {
    pub server: BrokerAddress,
    pub client_id: String,
    pub subscriptions: Vec<TopicSubscription>,
    pub clean_session: bool,
    pub keep_alive: Duration,
    pub reconnect: ReconnectPolicy,
    /// Capacity of both the client request queue and the delivery queue
    pub queue_capacity: usize,
}

pub fn qos_from_level(level: u8) -> Result<QoS, MqttError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(MqttError::InvalidQos(other)),
    }
}
