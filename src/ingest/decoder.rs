//! Line-oriented decoder for serial chunks
//!
//! Every chunk handed over by the serial transport is decoded on its own.
//! Partial lines are not carried over to the next chunk.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use tracing::{debug, error, info, warn};

use super::{Reading, ReadingSink};

const TEMPERATURE_PREFIX: &str = "TEMP:";
const HUMIDITY_PREFIX: &str = "UMID:";

/// Classification of a single input line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineKind<'a> {
    Reading(Reading),
    Unknown(&'a str),
    Blank,
}

/// What one `decode` call did with its chunk
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodeReport {
    /// Readings handed to the sink, in input order
    pub published: Vec<Reading>,
    /// Non-blank lines that matched no prefix
    pub unknown: Vec<String>,
    pub blank: usize,
    /// Set when decoding aborted on an unexpected failure
    pub failed: bool,
}

/// Strips ASCII control characters and spaces from both ends.
///
/// Non-ASCII whitespace such as U+00A0 is part of the value.
fn trim_value(s: &str) -> &str {
    s.trim_matches(|c: char| c <= ' ')
}

/// Classifies a line by prefix.
///
/// Prefix matching runs on the line as received, so leading whitespace
/// makes a line unknown. Only the extracted value and the emptiness check
/// use the trimmed form.
pub fn classify_line(line: &str) -> LineKind<'_> {
    if let Some(rest) = line.strip_prefix(TEMPERATURE_PREFIX) {
        LineKind::Reading(Reading::Temperature(trim_value(rest).to_string()))
    } else if let Some(rest) = line.strip_prefix(HUMIDITY_PREFIX) {
        LineKind::Reading(Reading::Humidity(trim_value(rest).to_string()))
    } else if !trim_value(line).is_empty() {
        LineKind::Unknown(line)
    } else {
        LineKind::Blank
    }
}

/// Splits a chunk on `\n`, dropping one `\r` right before each break.
///
/// Empty fragments are kept (a trailing newline yields a final empty line).
pub fn split_lines(chunk: &str) -> impl Iterator<Item = &str> {
    chunk
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
}

pub struct IngestDecoder<S: ReadingSink> {
    sink: S,
}

impl<S: ReadingSink> IngestDecoder<S> {
    pub fn new(sink: S) -> Self {
        Self { sink }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Decodes raw bytes from the transport as UTF-8 (lossy) and dispatches them.
    pub fn decode_bytes(&self, bytes: &[u8]) -> DecodeReport {
        self.decode(&String::from_utf8_lossy(bytes))
    }

    /// Decodes one chunk and publishes every recognised reading.
    ///
    /// Never fails and never unwinds: the caller is the transport's listener
    /// thread, which has to survive whatever happens in here.
    pub fn decode(&self, chunk: &str) -> DecodeReport {
        info!("Data received on serial port: {}", chunk);

        match panic::catch_unwind(AssertUnwindSafe(|| self.dispatch_lines(chunk))) {
            Ok(report) => report,
            Err(payload) => {
                error!("Error while processing data: {}", panic_message(&*payload));
                DecodeReport {
                    failed: true,
                    ..DecodeReport::default()
                }
            }
        }
    }

    fn dispatch_lines(&self, chunk: &str) -> DecodeReport {
        let mut report = DecodeReport::default();

        for line in split_lines(chunk) {
            match classify_line(line) {
                LineKind::Reading(reading) => {
                    debug!("Decoded {:?}", reading);
                    self.sink.accept(reading.channel(), reading.value());
                    report.published.push(reading);
                }
                LineKind::Unknown(raw) => {
                    warn!("Unknown data received: {}", raw);
                    report.unknown.push(raw.to_string());
                }
                LineKind::Blank => report.blank += 1,
            }
        }

        report
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
