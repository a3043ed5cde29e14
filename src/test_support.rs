//! Scripted stand-ins for the serial port and the broker link

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use rumqttc::QoS;

use crate::ingest::{Channel, ReadingSink};
use crate::mqtt::message_manager::SensorMessage;
use crate::mqtt::mqtt_handler::{BrokerLink, LinkError};
use crate::serial::{DataHandler, SerialError, SerialTransport};

#[derive(Debug, Default)]
pub struct RecordingSink {
    calls: Mutex<Vec<(Channel, String)>>,
}

impl RecordingSink {
    pub fn calls(&self) -> Vec<(Channel, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn topics(&self) -> Vec<&'static str> {
        self.calls().iter().map(|(c, _)| c.topic()).collect()
    }
}

impl ReadingSink for RecordingSink {
    fn accept(&self, channel: Channel, value: &str) {
        self.calls.lock().unwrap().push((channel, value.to_string()));
    }
}

#[derive(Debug, Default)]
pub struct ScriptedLink {
    pub connected: bool,
    pub closed: bool,
    pub reconnect_succeeds: bool,
    pub close_fails: bool,
    connectivity: RefCell<VecDeque<bool>>,
    publish_failures: usize,

    pub reconnects: usize,
    pub publish_calls: usize,
    pub closes: usize,
    pub delivered: Vec<(String, Vec<u8>)>,
    pub qos_seen: Vec<QoS>,
}

impl ScriptedLink {
    pub fn connected() -> Self {
        Self {
            connected: true,
            ..Self::default()
        }
    }

    pub fn disconnected() -> Self {
        Self::default()
    }

    /// Answers for the next `is_connected` calls, before falling back to `connected`
    pub fn script_connectivity(&mut self, answers: impl IntoIterator<Item = bool>) {
        self.connectivity.get_mut().extend(answers);
    }

    /// Makes the next `count` publish calls fail at transport level
    pub fn fail_publishes(&mut self, count: usize) {
        self.publish_failures = count;
    }
}

impl BrokerLink for ScriptedLink {
    fn is_connected(&self) -> bool {
        if self.closed {
            return false;
        }
        self.connectivity
            .borrow_mut()
            .pop_front()
            .unwrap_or(self.connected)
    }

    fn reconnect(&mut self) -> Result<(), LinkError> {
        self.reconnects += 1;
        if self.closed {
            return Err(LinkError::Closed);
        }
        if self.reconnect_succeeds {
            self.connected = true;
            Ok(())
        } else {
            Err(LinkError::NotConnected)
        }
    }

    fn publish(&mut self, message: &SensorMessage) -> Result<(), LinkError> {
        self.publish_calls += 1;
        self.qos_seen.push(message.qos());
        if self.closed {
            return Err(LinkError::Closed);
        }
        if self.publish_failures > 0 {
            self.publish_failures -= 1;
            return Err(LinkError::Publish("scripted failure".to_string()));
        }
        self.delivered
            .push((message.topic().to_string(), message.payload()));
        Ok(())
    }

    fn close(&mut self) -> Result<(), LinkError> {
        self.closes += 1;
        self.closed = true;
        self.connected = false;
        if self.close_fails {
            Err(LinkError::Disconnect("scripted failure".to_string()))
        } else {
            Ok(())
        }
    }
}

#[derive(Default)]
struct TransportState {
    open: bool,
    handler: Option<DataHandler>,
    registers: usize,
    deregisters: usize,
    closes: usize,
}

pub struct ScriptedTransport {
    name: String,
    open_fails: bool,
    pub register_fails: bool,
    state: Arc<Mutex<TransportState>>,
}

impl ScriptedTransport {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            open_fails: false,
            register_fails: false,
            state: Arc::default(),
        }
    }

    pub fn failing(name: &str) -> Self {
        Self {
            open_fails: true,
            ..Self::new(name)
        }
    }

    pub fn monitor(&self) -> TransportMonitor {
        TransportMonitor {
            state: self.state.clone(),
        }
    }
}

impl SerialTransport for ScriptedTransport {
    fn port_name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> Result<(), SerialError> {
        if self.open_fails {
            return Err(SerialError::Open {
                port: self.name.clone(),
                reason: "scripted failure".to_string(),
            });
        }
        self.state.lock().unwrap().open = true;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state.lock().unwrap().open
    }

    fn register(&mut self, handler: DataHandler) -> Result<(), SerialError> {
        let mut state = self.state.lock().unwrap();
        state.registers += 1;
        if self.register_fails {
            return Err(SerialError::AlreadyListening(self.name.clone()));
        }
        state.handler = Some(handler);
        Ok(())
    }

    fn deregister(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.deregisters += 1;
        state.handler = None;
    }

    fn close(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.closes += 1;
        state.open = false;
        state.handler = None;
    }
}

/// Test-side view of a `ScriptedTransport` after it was boxed into a worker
pub struct TransportMonitor {
    state: Arc<Mutex<TransportState>>,
}

impl TransportMonitor {
    /// Delivers `bytes` to the registered handler, like a data-available event.
    pub fn feed(&self, bytes: &[u8]) {
        let handler = self.state.lock().unwrap().handler.take();
        if let Some(mut handler) = handler {
            handler(bytes);
            self.state.lock().unwrap().handler = Some(handler);
        }
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().unwrap().open
    }

    pub fn has_handler(&self) -> bool {
        self.state.lock().unwrap().handler.is_some()
    }

    pub fn registers(&self) -> usize {
        self.state.lock().unwrap().registers
    }

    pub fn deregisters(&self) -> usize {
        self.state.lock().unwrap().deregisters
    }

    pub fn closes(&self) -> usize {
        self.state.lock().unwrap().closes
    }
}
