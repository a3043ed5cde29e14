//! Sensor readings and the line decoder that produces them
//!
//! The serial device speaks a tiny line protocol:
//!
//! ```text
//! TEMP:<value>\n   ──► Reading::Temperature ──► sensores/temperatura
//! UMID:<value>\n   ──► Reading::Humidity    ──► sensores/umidade
//! ```
//!
//! Values are passed through as trimmed strings. Nothing here checks
//! that they are numbers.

pub mod decoder;

use std::fmt;

/// Publish destination for a reading. Each variant is bound to exactly one topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Temperature,
    Humidity,
}

impl Channel {
    pub const TEMPERATURE_TOPIC: &'static str = "sensores/temperatura";
    pub const HUMIDITY_TOPIC: &'static str = "sensores/umidade";

    pub fn topic(&self) -> &'static str {
        match self {
            Channel::Temperature => Self::TEMPERATURE_TOPIC,
            Channel::Humidity => Self::HUMIDITY_TOPIC,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.topic())
    }
}

/// A parsed sensor value extracted from one input line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reading {
    Temperature(String),
    Humidity(String),
}

impl Reading {
    pub fn channel(&self) -> Channel {
        match self {
            Reading::Temperature(_) => Channel::Temperature,
            Reading::Humidity(_) => Channel::Humidity,
        }
    }

    pub fn value(&self) -> &str {
        match self {
            Reading::Temperature(v) | Reading::Humidity(v) => v,
        }
    }
}

/// Downstream consumer of decoded readings.
///
/// Implementations must not fail towards the decoder: whatever goes wrong
/// while handling a reading is reported by the sink itself.
pub trait ReadingSink: Send + Sync {
    fn accept(&self, channel: Channel, value: &str);
}

impl<T: ReadingSink + ?Sized> ReadingSink for std::sync::Arc<T> {
    fn accept(&self, channel: Channel, value: &str) {
        (**self).accept(channel, value)
    }
}
