use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use rumqttc::{Client, Connection, Event, MqttOptions, Outgoing, Packet};
use tracing::{debug, error, info, warn};

use super::config::MqttConfig;
use super::message_manager::SensorMessage;
use crate::config::ConfigError;

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("MQTT client is not connected")]
    NotConnected,

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("MQTT link has been closed")]
    Closed,

    #[error("Publisher has been halted")]
    Halted,

    #[error("Disconnect failed: {0}")]
    Disconnect(String),

    #[error("Invalid MQTT configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to start MQTT network thread: {0}")]
    Spawn(String),
}

/// What the publisher needs from a broker connection.
///
/// `reconnect` is synchronous: it returns once the link is connected again
/// or the attempt gave up.
pub trait BrokerLink: Send {
    fn is_connected(&self) -> bool;
    fn reconnect(&mut self) -> Result<(), LinkError>;
    fn publish(&mut self, message: &SensorMessage) -> Result<(), LinkError>;
    fn close(&mut self) -> Result<(), LinkError>;
}

/// Broker link shared between the publisher and the shutdown path
pub type SharedLink = Arc<Mutex<dyn BrokerLink>>;

pub(crate) fn lock_link<'a>(
    link: &'a Mutex<dyn BrokerLink + 'static>,
) -> MutexGuard<'a, dyn BrokerLink + 'static> {
    link.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct LinkStatus {
    state: ConnectionState,
    reconnect_requested: bool,
    shutdown: bool,
    last_error: Option<String>,
}

/// Connection status written by the network thread and read by the handler
#[derive(Debug, Default)]
struct LinkShared {
    status: Mutex<LinkStatus>,
    changed: Condvar,
}

impl LinkShared {
    fn lock(&self) -> MutexGuard<'_, LinkStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, f: impl FnOnce(&mut LinkStatus)) {
        let mut status = self.lock();
        f(&mut status);
        self.changed.notify_all();
    }

    fn state(&self) -> ConnectionState {
        self.lock().state
    }

    fn is_shutdown(&self) -> bool {
        self.lock().shutdown
    }

    fn mark_connected(&self) {
        self.update(|s| {
            if s.state == ConnectionState::Closed {
                return;
            }
            s.state = ConnectionState::Connected;
            s.last_error = None;
        });
    }

    fn mark_disconnected(&self, reason: String) {
        self.update(|s| {
            if s.state != ConnectionState::Closed {
                s.state = ConnectionState::Disconnected;
            }
            s.last_error = Some(reason);
        });
    }

    fn request_reconnect(&self) {
        self.update(|s| {
            s.reconnect_requested = true;
            s.state = ConnectionState::Reconnecting;
        });
    }

    fn shutdown(&self) {
        self.update(|s| {
            s.shutdown = true;
            s.state = ConnectionState::Closed;
        });
    }

    /// Blocks until the link is connected, shut down, or `timeout` passed.
    fn wait_for_connection(&self, timeout: Duration) -> Result<(), LinkError> {
        let guard = self.lock();
        let (status, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |s| {
                s.state != ConnectionState::Connected && !s.shutdown
            })
            .unwrap_or_else(PoisonError::into_inner);

        match status.state {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Closed => Err(LinkError::Closed),
            _ => Err(LinkError::NotConnected),
        }
    }

    /// Called by the network thread after a connection error.
    ///
    /// Returns `false` when the thread should exit.
    fn wait_before_reconnect(&self, automatic: bool, interval: Duration) -> bool {
        let guard = self.lock();
        let mut status = if automatic {
            self.changed
                .wait_timeout_while(guard, interval, |s| {
                    !s.shutdown && !s.reconnect_requested
                })
                .unwrap_or_else(PoisonError::into_inner)
                .0
        } else {
            self.changed
                .wait_while(guard, |s| !s.shutdown && !s.reconnect_requested)
                .unwrap_or_else(PoisonError::into_inner)
        };

        if status.shutdown {
            return false;
        }
        status.reconnect_requested = false;
        status.state = ConnectionState::Connecting;
        true
    }
}

/// rumqttc-backed broker link.
///
/// The rumqttc `Connection` is driven by a dedicated network thread which
/// tracks the connection state. Reconnection happens on that thread, either
/// on its own after `reconnect_interval` (automatic reconnect) or when
/// `reconnect` asks for it.
pub struct MqttHandler {
    client: Client,
    shared: Arc<LinkShared>,
    network_thread: Option<JoinHandle<()>>,
    broker: String,
    connection_timeout: Duration,
    closed: bool,
}

impl MqttHandler {
    /// Creates the client and waits up to the connection timeout for the
    /// first connection.
    ///
    /// A broker that cannot be reached is reported, not returned: the handler
    /// stays usable and a later `reconnect` may still succeed.
    pub fn connect(config: &MqttConfig) -> Result<Self, LinkError> {
        config.validate()?;
        let (host, port) = config.broker_address()?;

        let mut mqtt_options = MqttOptions::new(config.client_id.clone(), host, port);
        mqtt_options
            .set_keep_alive(config.keep_alive())
            .set_clean_session(config.clean_session);
        if let (Some(user), Some(pw)) = (&config.username, &config.password) {
            mqtt_options.set_credentials(user.clone(), pw.clone());
        }

        let (client, connection) = Client::new(mqtt_options, config.request_capacity);

        let shared = Arc::new(LinkShared::default());
        shared.update(|s| s.state = ConnectionState::Connecting);

        let thread_shared = shared.clone();
        let automatic = config.automatic_reconnect;
        let interval = config.reconnect_interval();
        let network_thread = std::thread::Builder::new()
            .name("mqtt-network".to_string())
            .spawn(move || run_network_loop(connection, thread_shared, automatic, interval))
            .map_err(|e| LinkError::Spawn(e.to_string()))?;

        let handler = MqttHandler {
            client,
            shared,
            network_thread: Some(network_thread),
            broker: config.broker_url.clone(),
            connection_timeout: config.connection_timeout(),
            closed: false,
        };

        match handler.shared.wait_for_connection(handler.connection_timeout) {
            Ok(()) => info!("Connected to MQTT broker {}", handler.broker),
            Err(e) => error!(
                "Failed to connect to MQTT broker {}: {} ({})",
                handler.broker,
                e,
                handler
                    .last_error()
                    .unwrap_or_else(|| "connection timed out".to_string())
            ),
        }

        Ok(handler)
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.lock().last_error.clone()
    }
}

impl BrokerLink for MqttHandler {
    fn is_connected(&self) -> bool {
        !self.closed && self.shared.state() == ConnectionState::Connected
    }

    fn reconnect(&mut self) -> Result<(), LinkError> {
        if self.closed {
            return Err(LinkError::Closed);
        }
        if self.is_connected() {
            return Ok(());
        }

        debug!("Requesting reconnect to {}", self.broker);
        self.shared.request_reconnect();
        self.shared.wait_for_connection(self.connection_timeout)
    }

    fn publish(&mut self, message: &SensorMessage) -> Result<(), LinkError> {
        if self.closed {
            return Err(LinkError::Closed);
        }
        self.client
            .try_publish(message.topic(), message.qos(), false, message.payload())
            .map_err(|e| LinkError::Publish(e.to_string()))
    }

    fn close(&mut self) -> Result<(), LinkError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        // DISCONNECT goes behind any queued publish; the network thread
        // leaves once it has been written out
        let was_connected = self.shared.state() == ConnectionState::Connected;
        let result = if was_connected {
            self.client
                .disconnect()
                .map_err(|e| LinkError::Disconnect(e.to_string()))
        } else {
            let _ = self.client.try_disconnect();
            Ok(())
        };
        self.shared.shutdown();

        if let Some(handle) = self.network_thread.take() {
            if handle.join().is_err() {
                warn!("MQTT network thread panicked");
            }
        }

        result
    }
}

impl Drop for MqttHandler {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.client.try_disconnect();
            self.shared.shutdown();
        }
    }
}

fn run_network_loop(
    mut connection: Connection,
    shared: Arc<LinkShared>,
    automatic_reconnect: bool,
    reconnect_interval: Duration,
) {
    debug!("MQTT network thread started");

    for notification in connection.iter() {
        match notification {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                debug!("ConnAck received: {:?}", ack.code);
                shared.mark_connected();
            }
            Ok(Event::Incoming(Packet::PubComp(comp))) => {
                debug!("Publish {} completed", comp.pkid);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                shared.mark_disconnected("disconnect requested".to_string());
                break;
            }
            Ok(event) => debug!("MQTT event: {:?}", event),
            Err(e) => {
                if shared.is_shutdown() {
                    break;
                }
                warn!("MQTT connection error: {}", e);
                shared.mark_disconnected(e.to_string());
                if !shared.wait_before_reconnect(automatic_reconnect, reconnect_interval) {
                    break;
                }
            }
        }
    }

    shared.mark_disconnected("network thread stopped".to_string());
    debug!("MQTT network thread finished");
}
