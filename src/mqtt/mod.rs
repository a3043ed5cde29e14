//! # MQTT side of the bridge
//!
//! Everything between a decoded reading and the broker:
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Broker settings and the retry policy
//! ├── message_manager.rs  - Outgoing sensor message (topic, payload, QoS)
//! ├── mqtt_handler.rs     - BrokerLink trait and the rumqttc connection
//! └── publisher.rs        - Reconnect-then-retry publish state machine
//! ```
//!
//! Messages go out with QoS 2. The publisher never returns an error to its
//! caller; a message that cannot be delivered within the attempt budget is
//! logged and dropped.

pub mod config;
pub mod message_manager;
pub mod mqtt_handler;
pub mod publisher;
