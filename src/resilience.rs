//! Resilience utilities: retry schedules and bulkheads.
//!
//! - [`RetryConfig`]: attempt ceiling and delay schedule for broker retries
//! - [`Bulkhead`]: semaphore bounding concurrent edit applications
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), doc_fanout::resilience::BulkheadFull> {
//! use doc_fanout::resilience::{Bulkhead, RetryConfig};
//!
//! // Broker connect: retry forever every 5s
//! let retry = RetryConfig::broker_connect();
//! assert_eq!(retry.max_attempts, usize::MAX);
//!
//! // Bulkhead: max 64 edits being applied at once
//! let bulkhead = Bulkhead::new(64);
//! let _permit = bulkhead.acquire().await?;
//! // permit dropped = slot released
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Retry schedule for broker operations.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts.
    /// `usize::MAX` means retry until shutdown.
    pub max_attempts: usize,

    /// Delay before the second attempt.
    pub initial_delay: Duration,

    /// Ceiling for the delay between attempts.
    pub max_delay: Duration,

    /// Backoff multiplier. `1.0` gives a fixed interval.
    pub backoff_factor: f64,

    /// Timeout for each individual attempt.
    pub connection_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// Initial broker connection: fixed 5s interval, no ceiling.
    ///
    /// The gateway cannot do anything useful without its log producer, and the
    /// worker cannot do anything without its consumer, so startup blocks here
    /// until the broker answers a PING (or shutdown is requested).
    pub fn broker_connect() -> Self {
        Self::fixed(usize::MAX, Duration::from_secs(5), Duration::from_secs(10))
    }

    /// Joining the consumer group: fixed 5s interval, 20 attempts.
    ///
    /// Exhausting this is fatal for the worker.
    pub fn subscribe() -> Self {
        Self::fixed(20, Duration::from_secs(5), Duration::from_secs(10))
    }

    /// Appending one edit event to the log.
    ///
    /// ```text
    /// Attempt  Delay
    /// -------  -----
    /// 1        100ms
    /// 2        200ms
    /// 3        400ms
    /// 4        800ms
    /// 5        (give up, event dropped and logged)
    /// ```
    pub fn producer_send() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(5),
        }
    }

    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_millis(500),
        }
    }

    /// Fixed-interval schedule with the given ceiling.
    pub fn fixed(max_attempts: usize, interval: Duration, connection_timeout: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: interval,
            max_delay: interval,
            backoff_factor: 1.0,
            connection_timeout,
        }
    }

    /// True when the schedule never gives up on its own.
    pub fn is_unbounded(&self) -> bool {
        self.max_attempts == usize::MAX
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        // Clamp the exponent so unbounded schedules never overflow powi
        let exponent = (attempt - 1).min(64) as i32;
        let multiplier = self.backoff_factor.powi(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        if !delay_secs.is_finite() {
            return self.max_delay;
        }
        let delay = Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()));

        std::cmp::min(delay, self.max_delay)
    }
}

// =============================================================================
// Bulkhead (Concurrency Limiter)
// =============================================================================

/// Error when bulkhead is full.
#[derive(Debug, Clone, thiserror::Error)]
#[error("bulkhead full: max {max_concurrent} concurrent operations")]
pub struct BulkheadFull {
    /// Maximum concurrent operations allowed.
    pub max_concurrent: usize,
}

/// Limits concurrent operations with a semaphore.
///
/// The edit consumer holds one permit per document group being applied, so a
/// burst of log entries never turns into an unbounded number of tasks.
#[derive(Debug)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl Bulkhead {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Wait for a worker slot. The slot frees when the permit drops.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, BulkheadFull> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BulkheadFull {
                max_concurrent: self.max_concurrent,
            })
    }

    /// Free worker slots.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Workers currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.max_concurrent.saturating_sub(self.available())
    }

    pub fn is_full(&self) -> bool {
        self.available() == 0
    }
}
