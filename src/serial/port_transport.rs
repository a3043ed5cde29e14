use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::Local;
use serialport::SerialPort;
use tracing::{debug, error, info, warn};

use super::{DataHandler, SerialError, SerialSettings, SerialTransport};

struct Listener {
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// `serialport`-backed transport.
///
/// Reads happen on a listener thread with a short timeout so that
/// `deregister` can stop it without closing the port underneath it.
pub struct PortTransport {
    settings: SerialSettings,
    port: Option<Box<dyn SerialPort>>,
    listener: Option<Listener>,
}

impl PortTransport {
    pub fn new(settings: SerialSettings) -> Self {
        Self {
            settings,
            port: None,
            listener: None,
        }
    }

    fn open_error(&self, reason: impl ToString) -> SerialError {
        SerialError::Open {
            port: self.settings.port.clone(),
            reason: reason.to_string(),
        }
    }
}

impl SerialTransport for PortTransport {
    fn port_name(&self) -> &str {
        &self.settings.port
    }

    fn open(&mut self) -> Result<(), SerialError> {
        if self.port.is_some() {
            return Ok(());
        }

        let data_bits = self
            .settings
            .data_bits()
            .ok_or_else(|| self.open_error(format!("unsupported data bits {}", self.settings.data_bits)))?;
        let stop_bits = self
            .settings
            .stop_bits()
            .ok_or_else(|| self.open_error(format!("unsupported stop bits {}", self.settings.stop_bits)))?;

        let port = serialport::new(&self.settings.port, self.settings.baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(self.settings.parity())
            .timeout(Duration::from_millis(self.settings.read_timeout_ms))
            .open()
            .map_err(|e| self.open_error(e))?;

        debug!(
            "Opened {} at {} baud ({}-{:?}-{})",
            self.settings.port,
            self.settings.baud_rate,
            self.settings.data_bits,
            self.settings.parity,
            self.settings.stop_bits
        );
        self.port = Some(port);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn register(&mut self, handler: DataHandler) -> Result<(), SerialError> {
        let port = self
            .port
            .as_ref()
            .ok_or_else(|| SerialError::NotOpen(self.settings.port.clone()))?;
        if self.listener.is_some() {
            return Err(SerialError::AlreadyListening(self.settings.port.clone()));
        }

        let reader = port
            .try_clone()
            .map_err(|e| SerialError::Io(e.into()))?;
        let cancel = Arc::new(AtomicBool::new(false));
        let thread_cancel = cancel.clone();
        let port_name = self.settings.port.clone();
        let buffer_size = self.settings.read_buffer_size.max(1);

        let handle = std::thread::Builder::new()
            .name("serial-listener".to_string())
            .spawn(move || run_listener(port_name, reader, handler, thread_cancel, buffer_size))?;

        self.listener = Some(Listener { cancel, handle });
        Ok(())
    }

    fn deregister(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.cancel.store(true, Ordering::Relaxed);
            if listener.handle.join().is_err() {
                warn!("Serial listener thread panicked");
            }
            debug!("Listener on {} stopped", self.settings.port);
        }
    }

    fn close(&mut self) {
        self.deregister();
        self.port = None;
    }
}

impl Drop for PortTransport {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_listener<R: Read>(
    port_name: String,
    mut reader: R,
    mut handler: DataHandler,
    cancel: Arc<AtomicBool>,
    buffer_size: usize,
) {
    info!("Listening for data on {}", port_name);

    let mut buf = vec![0u8; buffer_size];
    let mut chunk_count = 0u64;
    let mut byte_count = 0u64;
    let mut last_log_time = Local::now();
    let log_interval = chrono::Duration::seconds(60);

    while !cancel.load(Ordering::Relaxed) {
        match reader.read(&mut buf) {
            Ok(0) => {
                info!("{} reached end of stream, listener stops", port_name);
                break;
            }
            Ok(n) => {
                chunk_count += 1;
                byte_count += n as u64;
                handler(&buf[..n]);
            }
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                error!("Read from {} failed, listener stops: {}", port_name, e);
                break;
            }
        }

        let now = Local::now();
        if now - last_log_time > log_interval {
            info!(
                "Serial stats for {}: {} chunks, {} bytes in last {} seconds",
                port_name,
                chunk_count,
                byte_count,
                log_interval.num_seconds()
            );
            chunk_count = 0;
            byte_count = 0;
            last_log_time = now;
        }
    }

    debug!("Listener on {} finished", port_name);
}
