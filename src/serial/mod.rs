//! Serial side of the bridge
//!
//! The worker only sees the [`SerialTransport`] capability: open the port,
//! register a handler for incoming data, and later deregister and close.
//! [`port_transport::PortTransport`] implements it on top of `serialport`
//! with one listener thread per registered handler.

pub mod port_transport;

use serde::{Deserialize, Serialize};

/// Called with every chunk of bytes read from the port, on the listener thread
pub type DataHandler = Box<dyn FnMut(&[u8]) + Send + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("Failed to open serial port {port}: {reason}")]
    Open { port: String, reason: String },

    #[error("Serial port {0} is not open")]
    NotOpen(String),

    #[error("A data handler is already registered on {0}")]
    AlreadyListening(String),

    #[error("Serial I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub trait SerialTransport: Send {
    fn port_name(&self) -> &str;
    fn open(&mut self) -> Result<(), SerialError>;
    fn is_open(&self) -> bool;
    fn register(&mut self, handler: DataHandler) -> Result<(), SerialError>;
    fn deregister(&mut self);
    fn close(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ParitySetting {
    #[default]
    None,
    Odd,
    Even,
}

/// Port parameters from the `[serial]` section of the config file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: ParitySetting,
    /// How long a read blocks before the listener re-checks for cancellation
    pub read_timeout_ms: u64,
    pub read_buffer_size: usize,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: "/dev/pts/3".to_string(),
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: ParitySetting::None,
            read_timeout_ms: 100,
            read_buffer_size: 1024,
        }
    }
}

impl SerialSettings {
    pub fn data_bits(&self) -> Option<serialport::DataBits> {
        match self.data_bits {
            5 => Some(serialport::DataBits::Five),
            6 => Some(serialport::DataBits::Six),
            7 => Some(serialport::DataBits::Seven),
            8 => Some(serialport::DataBits::Eight),
            _ => None,
        }
    }

    pub fn stop_bits(&self) -> Option<serialport::StopBits> {
        match self.stop_bits {
            1 => Some(serialport::StopBits::One),
            2 => Some(serialport::StopBits::Two),
            _ => None,
        }
    }

    pub fn parity(&self) -> serialport::Parity {
        match self.parity {
            ParitySetting::None => serialport::Parity::None,
            ParitySetting::Odd => serialport::Parity::Odd,
            ParitySetting::Even => serialport::Parity::Even,
        }
    }
}
