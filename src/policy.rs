//! Pluggable reconnect policies.
//!
//! The channel provider consults the policy before handing out the current
//! channel: a `true` from [`ReconnectPolicy::should_reconnect`] makes the
//! provider drop the live connection and dial a fresh one. The connection
//! coordinator never consults the policy itself.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Decides when the provider should proactively cycle its connection.
pub trait ReconnectPolicy: Send + Sync + 'static {
    /// Whether the current connection is due for replacement.
    fn should_reconnect(&self) -> bool;

    /// Hook invoked after a connection is successfully (re)established.
    fn reconnected(&self);
}

/// Never cycles proactively; reconnects only happen when the connection is
/// gone.
#[derive(Debug, Clone, Copy, Default)]
pub struct Never;

impl ReconnectPolicy for Never {
    fn should_reconnect(&self) -> bool {
        false
    }

    fn reconnected(&self) {}
}

/// Cycles the connection before every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct EveryNotification;

impl ReconnectPolicy for EveryNotification {
    fn should_reconnect(&self) -> bool {
        true
    }

    fn reconnected(&self) {}
}

/// Cycles the connection once it has been up for a fixed period.
#[derive(Debug)]
pub struct Periodic {
    period: Duration,
    connected_at: Mutex<Option<Instant>>,
}

impl Periodic {
    /// Cycle after `period` of connection lifetime.
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            connected_at: Mutex::new(None),
        }
    }

    /// The historic client default: a fresh connection every half hour.
    pub fn every_half_hour() -> Self {
        Self::new(Duration::from_secs(30 * 60))
    }
}

impl ReconnectPolicy for Periodic {
    fn should_reconnect(&self) -> bool {
        self.connected_at
            .lock()
            .is_some_and(|t| t.elapsed() >= self.period)
    }

    fn reconnected(&self) {
        *self.connected_at.lock() = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn periodic_is_quiet_until_the_period_elapses() {
        let policy = Periodic::new(Duration::from_secs(3600));
        // Not yet connected: nothing to cycle.
        assert!(!policy.should_reconnect());
        policy.reconnected();
        assert!(!policy.should_reconnect());
    }

    #[test]
    fn periodic_fires_after_the_period() {
        let policy = Periodic::new(Duration::ZERO);
        policy.reconnected();
        assert!(policy.should_reconnect());
    }
}
