//! Sensor worker - wires the serial transport to the MQTT publisher
//!
//! ```text
//! serial listener thread ──► IngestDecoder ──► Publisher ──► BrokerLink
//!        (bytes)               (readings)      (retries)      (MQTT QoS 2)
//! ```
//!
//! Decoding and publishing run synchronously on the transport's listener
//! thread. There is no queue in between.

use std::sync::{Arc, Mutex};

use tracing::{error, info, warn};

use crate::ingest::decoder::IngestDecoder;
use crate::mqtt::config::{MqttConfig, RetryPolicy};
use crate::mqtt::mqtt_handler::{lock_link, BrokerLink, LinkError, MqttHandler, SharedLink};
use crate::mqtt::publisher::Publisher;
use crate::serial::{DataHandler, SerialError, SerialTransport};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Serial error: {0}")]
    SerialError(#[from] SerialError),

    #[error("MQTT error: {0}")]
    LinkError(#[from] LinkError),
}

pub struct SensorWorker {
    transport: Box<dyn SerialTransport>,
    link: SharedLink,
    publisher: Arc<Publisher>,
    listening: bool,
}

impl SensorWorker {
    /// Builds the worker and connects to the broker.
    ///
    /// An unreachable broker does not fail construction; the worker starts
    /// and publishing reconnects on demand.
    pub fn connect(
        transport: Box<dyn SerialTransport>,
        mqtt_config: &MqttConfig,
        policy: RetryPolicy,
    ) -> Result<Self, WorkerError> {
        let handler = MqttHandler::connect(mqtt_config)?;
        let link: SharedLink = Arc::new(Mutex::new(handler));
        Ok(Self::with_link(transport, link, policy))
    }

    /// Builds the worker over an existing broker link without connecting.
    pub fn with_link(
        transport: Box<dyn SerialTransport>,
        link: SharedLink,
        policy: RetryPolicy,
    ) -> Self {
        let publisher = Arc::new(Publisher::new(link.clone(), policy));
        Self {
            transport,
            link,
            publisher,
            listening: false,
        }
    }

    pub fn publisher(&self) -> Arc<Publisher> {
        self.publisher.clone()
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    /// Opens the serial port and registers the decoder as its data handler.
    ///
    /// Returns whether the worker is listening afterwards. Failures are
    /// logged here and never returned.
    pub fn start(&mut self) -> bool {
        if self.publisher.is_halted() {
            warn!("Worker has been stopped and cannot be started again");
            return false;
        }
        if self.listening {
            warn!(
                "Worker already listening on [{}]",
                self.transport.port_name()
            );
            return true;
        }

        if let Err(e) = self.transport.open() {
            warn!(
                "Could not open serial port [{}]: {}",
                self.transport.port_name(),
                e
            );
            return false;
        }
        info!(
            "Serial port [{}] opened successfully.",
            self.transport.port_name()
        );

        let decoder = IngestDecoder::new(self.publisher.clone());
        let handler: DataHandler = Box::new(move |bytes: &[u8]| {
            decoder.decode_bytes(bytes);
        });

        match self.transport.register(handler) {
            Ok(()) => {
                self.listening = true;
                true
            }
            Err(e) => {
                error!(
                    "Failed to listen on serial port [{}]: {}",
                    self.transport.port_name(),
                    e
                );
                self.transport.close();
                false
            }
        }
    }

    /// Closes the broker connection (if active) and releases the serial port
    /// (if open).
    ///
    /// Safe to call when `start` never succeeded. The publisher is halted
    /// first: Stop waits for a delivery attempt that already holds the link,
    /// while a publish between attempts gives up its remaining attempts
    /// without waiting out the delay. The worker cannot be started again.
    pub fn stop(&mut self) {
        self.publisher.halt();

        {
            let mut link = lock_link(&self.link);
            if link.is_connected() {
                match link.close() {
                    Ok(()) => info!("MQTT connection closed."),
                    Err(e) => error!("Error closing MQTT connection: {}", e),
                }
            }
        }

        if self.transport.is_open() {
            self.transport.deregister();
            self.transport.close();
            info!("Serial port [{}] closed.", self.transport.port_name());
        }
        self.listening = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedLink, ScriptedTransport};
    use std::time::Duration;

    fn no_delay() -> RetryPolicy {
        RetryPolicy::new(3, Duration::ZERO).unwrap()
    }

    fn worker(
        transport: ScriptedTransport,
        link: ScriptedLink,
    ) -> (SensorWorker, Arc<Mutex<ScriptedLink>>) {
        let link = Arc::new(Mutex::new(link));
        let shared: SharedLink = link.clone();
        let worker = SensorWorker::with_link(Box::new(transport), shared, no_delay());
        (worker, link)
    }

    #[test]
    fn chunks_from_the_port_end_up_on_the_broker() {
        let transport = ScriptedTransport::new("ttyTEST");
        let monitor = transport.monitor();
        let (mut worker, link) = worker(transport, ScriptedLink::connected());

        assert!(worker.start());
        assert!(worker.is_listening());
        monitor.feed(b"TEMP:22.5\nUMID:55.3\n");

        assert_eq!(
            link.lock().unwrap().delivered,
            vec![
                ("sensores/temperatura".to_string(), b"22.5".to_vec()),
                ("sensores/umidade".to_string(), b"55.3".to_vec()),
            ]
        );
        assert_eq!(worker.publisher().stats().delivered(), 2);
    }

    #[test]
    fn unknown_data_publishes_nothing() {
        let transport = ScriptedTransport::new("ttyTEST");
        let monitor = transport.monitor();
        let (mut worker, link) = worker(transport, ScriptedLink::connected());

        worker.start();
        monitor.feed(b"INVALID_DATA");

        assert_eq!(link.lock().unwrap().publish_calls, 0);
    }

    #[test]
    fn open_failure_registers_no_listener() {
        let transport = ScriptedTransport::failing("ttyMISSING");
        let monitor = transport.monitor();
        let (mut worker, link) = worker(transport, ScriptedLink::disconnected());

        assert!(!worker.start());
        assert!(!worker.is_listening());
        assert_eq!(monitor.registers(), 0);

        worker.stop();
        assert_eq!(monitor.deregisters(), 0);
        assert_eq!(monitor.closes(), 0);
        // broker was never up, nothing to close
        assert_eq!(link.lock().unwrap().closes, 0);
    }

    #[test]
    fn stop_releases_port_and_broker() {
        let transport = ScriptedTransport::new("ttyTEST");
        let monitor = transport.monitor();
        let (mut worker, link) = worker(transport, ScriptedLink::connected());

        worker.start();
        worker.stop();

        assert_eq!(monitor.deregisters(), 1);
        assert_eq!(monitor.closes(), 1);
        assert!(!monitor.is_open());
        assert!(!monitor.has_handler());
        assert_eq!(link.lock().unwrap().closes, 1);
        assert!(!link.lock().unwrap().is_connected());
    }

    #[test]
    fn publish_after_stop_is_exhausted_not_raised() {
        let transport = ScriptedTransport::new("ttyTEST");
        let (mut worker, link) = worker(transport, ScriptedLink::connected());
        let publisher = worker.publisher();

        worker.start();
        worker.stop();

        let outcome = publisher.publish(crate::ingest::Channel::Temperature, "1");
        assert!(matches!(
            outcome,
            crate::mqtt::publisher::PublishOutcome::Exhausted { attempts: 3 }
        ));
        assert_eq!(link.lock().unwrap().publish_calls, 0);
    }

    #[test]
    fn broker_close_error_is_swallowed() {
        let transport = ScriptedTransport::new("ttyTEST");
        let mut link = ScriptedLink::connected();
        link.close_fails = true;
        let (mut worker, _link) = worker(transport, link);

        worker.start();
        worker.stop();
        assert!(!worker.is_listening());
    }

    #[test]
    fn stopped_worker_does_not_start_again() {
        let transport = ScriptedTransport::new("ttyTEST");
        let monitor = transport.monitor();
        let (mut worker, _link) = worker(transport, ScriptedLink::connected());

        assert!(worker.start());
        worker.stop();

        assert!(!worker.start());
        assert_eq!(monitor.registers(), 1);
        assert!(!monitor.is_open());
    }

    #[cfg(unix)]
    #[test]
    fn stop_does_not_wait_out_a_retrying_publish() {
        use crate::serial::port_transport::PortTransport;
        use crate::serial::SerialSettings;
        use serialport::{SerialPort, TTYPort};
        use std::io::Write;
        use std::thread;
        use std::time::Instant;

        let (mut master, slave) = TTYPort::pair().unwrap();
        let transport = PortTransport::new(SerialSettings {
            port: slave.name().unwrap(),
            ..SerialSettings::default()
        });
        let link = Arc::new(Mutex::new(ScriptedLink::disconnected()));
        let shared: SharedLink = link.clone();
        let policy = RetryPolicy::new(3, Duration::from_secs(2)).unwrap();
        let mut worker = SensorWorker::with_link(Box::new(transport), shared, policy);

        assert!(worker.start());
        master.write_all(b"TEMP:1\n").unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while link.lock().unwrap().reconnects == 0 {
            assert!(Instant::now() < deadline, "reading never reached the publisher");
            thread::sleep(Duration::from_millis(10));
        }

        let started = Instant::now();
        worker.stop();

        // one read timeout for the listener to notice, no retry delays
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(link.lock().unwrap().reconnects, 1);
        assert_eq!(worker.publisher().stats().exhausted(), 1);
        assert!(!worker.is_listening());
    }

    #[test]
    fn register_failure_closes_the_port() {
        let mut transport = ScriptedTransport::new("ttyTEST");
        transport.register_fails = true;
        let monitor = transport.monitor();
        let (mut worker, _link) = worker(transport, ScriptedLink::connected());

        assert!(!worker.start());
        assert_eq!(monitor.closes(), 1);
        assert!(!monitor.is_open());
    }
}
