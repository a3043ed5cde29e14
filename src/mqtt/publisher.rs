//! Publisher with a bounded reconnect-then-retry loop
//!
//! Every publish call runs its own small state machine:
//!
//! ```text
//! Idle ──► Attempting ──► Delivered
//!              │  ▲
//!              ▼  │ (delay)
//!            Retrying
//!              │
//!              ▼ (budget used up)
//!          Exhausted
//! ```
//!
//! The delay between attempts is a blocking wait on the calling thread.
//! When called from the serial listener this stalls serial delivery for
//! the duration of the retries. `Publisher::halt` cuts the wait short and
//! turns every remaining attempt into a failure that never touches the link.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

use statum::{machine, state};
use tracing::{debug, error, info, warn};

use super::config::RetryPolicy;
use super::message_manager::SensorMessage;
use super::mqtt_handler::{lock_link, BrokerLink, LinkError, SharedLink};
use crate::ingest::{Channel, ReadingSink};

/// Stop signal shared by every publish running on a `Publisher`
#[derive(Debug, Default)]
pub struct Halt {
    raised: Mutex<bool>,
    wake: Condvar,
}

impl Halt {
    pub fn raise(&self) {
        *self.raised.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.wake.notify_all();
    }

    pub fn is_raised(&self) -> bool {
        *self.raised.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleeps for `delay`, returning early once the halt is raised.
    fn sleep(&self, delay: Duration) {
        let guard = self.raised.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = self
            .wake
            .wait_timeout_while(guard, delay, |raised| !*raised)
            .unwrap_or_else(PoisonError::into_inner);
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum PublishState {
    Idle,
    Attempting,
    Retrying,
    Delivered,
    Exhausted,
}

/// Bookkeeping for one logical publish, discarded once it reaches a final state
#[machine]
#[derive(Debug)]
pub struct PublishAttempt<S: PublishState> {
    message: SensorMessage,
    attempt: u32,
    policy: RetryPolicy,
    last_error: Option<LinkError>,
}

impl<S: PublishState> PublishAttempt<S> {
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn message(&self) -> &SensorMessage {
        &self.message
    }
}

/// Result of one delivery attempt
pub enum AttemptOutcome {
    Delivered(PublishAttempt<Delivered>),
    Retry(PublishAttempt<Retrying>),
    Exhausted(PublishAttempt<Exhausted>),
}

impl PublishAttempt<Idle> {
    pub fn create(message: SensorMessage, policy: RetryPolicy) -> Self {
        Self::new(message, 0, policy, None)
    }

    pub fn begin(mut self) -> PublishAttempt<Attempting> {
        self.attempt = 1;
        self.transition()
    }
}

impl PublishAttempt<Attempting> {
    /// Runs one delivery attempt against the shared link.
    ///
    /// The link is locked for this attempt only.
    pub fn deliver(self, link: &SharedLink) -> AttemptOutcome {
        let result = {
            let mut guard = lock_link(link);
            deliver_once(&mut *guard, &self.message)
        };
        self.settle(result)
    }

    /// Counts this attempt as failed without going near the link.
    pub fn skip(self) -> AttemptOutcome {
        self.settle(Err(LinkError::Halted))
    }

    fn settle(mut self, result: Result<(), LinkError>) -> AttemptOutcome {
        match result {
            Ok(()) => AttemptOutcome::Delivered(self.transition()),
            Err(e) => {
                warn!(
                    "Publish attempt {}/{} to [{}] failed: {}",
                    self.attempt,
                    self.policy.max_attempts,
                    self.message.topic(),
                    e
                );
                self.last_error = Some(e);
                if self.attempt < self.policy.max_attempts {
                    AttemptOutcome::Retry(self.transition())
                } else {
                    AttemptOutcome::Exhausted(self.transition())
                }
            }
        }
    }
}

impl PublishAttempt<Retrying> {
    pub fn wait(mut self, halt: &Halt) -> PublishAttempt<Attempting> {
        if !self.policy.delay.is_zero() && !halt.is_raised() {
            debug!("Waiting {:?} before next publish attempt", self.policy.delay);
            halt.sleep(self.policy.delay);
        }
        self.attempt += 1;
        self.transition()
    }
}

impl PublishAttempt<Exhausted> {
    pub fn report(&self) {
        let reason = self
            .last_error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_default();
        error!(
            "Error publishing to MQTT [{}] after {} attempts, reading from {} dropped: {}",
            self.message.topic(),
            self.attempt,
            self.message.timestamp().format("%H:%M:%S%.3f"),
            reason
        );
    }
}

/// A single attempt: reconnect if needed, then hand the message to the transport.
fn deliver_once(link: &mut dyn BrokerLink, message: &SensorMessage) -> Result<(), LinkError> {
    if !link.is_connected() {
        warn!("MQTT client disconnected; trying to reconnect...");
        if let Err(e) = link.reconnect() {
            debug!("Reconnect failed: {}", e);
        }
    }
    if !link.is_connected() {
        return Err(LinkError::NotConnected);
    }

    link.publish(message)?;
    info!("Published to topic {}", message);
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Delivered { attempts: u32 },
    Exhausted { attempts: u32 },
}

#[derive(Debug, Default)]
pub struct PublishStats {
    delivered: AtomicU64,
    exhausted: AtomicU64,
}

impl PublishStats {
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn exhausted(&self) -> u64 {
        self.exhausted.load(Ordering::Relaxed)
    }
}

pub struct Publisher {
    link: SharedLink,
    policy: RetryPolicy,
    stats: PublishStats,
    halt: Halt,
}

impl Publisher {
    pub fn new(link: SharedLink, policy: RetryPolicy) -> Self {
        Self {
            link,
            policy,
            stats: PublishStats::default(),
            halt: Halt::default(),
        }
    }

    /// Stops all current and future publishes from using the link.
    ///
    /// A publish waiting between attempts wakes up and fails its remaining
    /// attempts immediately. An attempt already holding the link finishes.
    pub fn halt(&self) {
        self.halt.raise();
    }

    pub fn is_halted(&self) -> bool {
        self.halt.is_raised()
    }

    pub fn stats(&self) -> &PublishStats {
        &self.stats
    }

    /// Publishes `value` on `channel`.
    ///
    /// Never fails towards the caller: once the attempt budget is used up the
    /// failure is logged and `PublishOutcome::Exhausted` is returned.
    pub fn publish(&self, channel: Channel, value: &str) -> PublishOutcome {
        debug!("Publishing {} to {}", value, channel);
        let message = SensorMessage::for_channel(channel, value);
        let mut attempt = PublishAttempt::<Idle>::create(message, self.policy).begin();

        loop {
            let outcome = if self.halt.is_raised() {
                attempt.skip()
            } else {
                attempt.deliver(&self.link)
            };
            match outcome {
                AttemptOutcome::Delivered(done) => {
                    self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                    return PublishOutcome::Delivered {
                        attempts: done.attempt(),
                    };
                }
                AttemptOutcome::Retry(retrying) => attempt = retrying.wait(&self.halt),
                AttemptOutcome::Exhausted(exhausted) => {
                    exhausted.report();
                    self.stats.exhausted.fetch_add(1, Ordering::Relaxed);
                    return PublishOutcome::Exhausted {
                        attempts: exhausted.attempt(),
                    };
                }
            }
        }
    }
}

impl ReadingSink for Publisher {
    fn accept(&self, channel: Channel, value: &str) {
        self.publish(channel, value);
    }
}
