use chrono::NaiveDateTime;
use rumqttc::QoS;
use std::fmt;

use crate::ingest::Channel;

/// Delivery level used for every sensor message (MQTT QoS 2)
pub const SENSOR_QOS: QoS = QoS::ExactlyOnce;

/// One outgoing sensor message, stamped when it was built
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorMessage {
    topic: &'static str,
    content: String,
    timestamp: NaiveDateTime,
}

impl fmt::Display for SensorMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}]: {}", self.topic, self.content)
    }
}

impl SensorMessage {
    pub fn for_channel(channel: Channel, content: &str) -> Self {
        SensorMessage {
            topic: channel.topic(),
            content: content.to_string(),
            timestamp: chrono::Local::now().naive_local(),
        }
    }

    pub fn topic(&self) -> &'static str {
        self.topic
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn payload(&self) -> Vec<u8> {
        self.content.as_bytes().to_vec()
    }

    pub fn qos(&self) -> QoS {
        SENSOR_QOS
    }

    pub fn timestamp(&self) -> NaiveDateTime {
        self.timestamp
    }
}
