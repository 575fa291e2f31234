use chrono::{DateTime, Local};
use rumqttc::{Publish, QoS};
use std::fmt;

/// A publish received from the broker, as handed to the consume loop
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    topic: String,
    payload: Vec<u8>,
    qos: QoS,
    retain: bool,
    delivered_at: DateTime<Local>,
}

impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.topic, self.payload_lossy())
    }
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        InboundMessage {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtLeastOnce,
            retain: false,
            delivered_at: Local::now(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload_lossy(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    pub fn qos(&self) -> QoS {
        self.qos
    }

    pub fn retained(&self) -> bool {
        self.retain
    }

    pub fn render(&self) -> String {
        format!(
            "{} [qos {}{}] {}",
            self.delivered_at.format("%H:%M:%S%.3f"),
            self.qos() as u8,
            if self.retained() { ", retained" } else { "" },
            self
        )
    }
}

impl From<Publish> for InboundMessage {
    fn from(publish: Publish) -> Self {
        InboundMessage {
            topic: publish.topic,
            payload: publish.payload.to_vec(),
            qos: publish.qos,
            retain: publish.retain,
            delivered_at: Local::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_publish_packet() {
        let mut publish = Publish::new("data/room1", QoS::ExactlyOnce, "<MESSAGE>:1");
        publish.retain = true;

        let message = InboundMessage::from(publish);
        assert_eq!(message.topic(), "data/room1");
        assert_eq!(message.payload(), b"<MESSAGE>:1");
        assert_eq!(message.qos(), QoS::ExactlyOnce);
        assert!(message.retained());
    }

    #[test]
    fn display_is_topic_and_lossy_payload() {
        let message = InboundMessage::new("general", vec![b'o', b'k', 0xff]);
        assert_eq!(message.to_string(), "general: ok\u{FFFD}");
        assert!(message.render().ends_with("[qos 1] general: ok\u{FFFD}"));
    }
}
