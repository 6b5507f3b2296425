//! Message disposition and redelivery policy

use std::fmt;

/// Terminal outcome applied to a task message
///
/// Exactly one disposition is applied to every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Task succeeded; remove the message permanently
    Acknowledge,
    /// Task failed; ask the broker to redeliver it
    Requeue,
    /// Task failed too many times; reject without requeue so the broker
    /// routes it to the dead-letter exchange (or drops it)
    DeadLetter,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Acknowledge => "acknowledge",
            Disposition::Requeue => "requeue",
            Disposition::DeadLetter => "dead-letter",
        }
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decides between requeue and dead-letter for failed tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
}

impl RetryPolicy {
    /// Creates a policy allowing `max_attempts` deliveries (at least one)
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    /// Requeues every failure forever
    pub fn unbounded() -> Self {
        Self::new(u32::MAX)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Disposition for a task that failed on its `attempt`-th delivery (1-based)
    pub fn on_failure(&self, attempt: u32) -> Disposition {
        if attempt >= self.max_attempts {
            Disposition::DeadLetter
        } else {
            Disposition::Requeue
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5)
    }
}
