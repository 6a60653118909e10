//! Client side heartbeats over the control stream.
//!
//! [`HeartbeatChannel`] writes probes and correlates their acknowledgements;
//! [`HeartbeatMonitor`] decides when to probe and when the platform has gone
//! quiet for too long.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::wire::{InstructionAck, PlatformInbound};

mod channel;
mod monitor;

pub use channel::{HeartbeatChannel, DEFAULT_PURGE_INTERVAL};
pub use monitor::{HeartbeatMonitor, HeartbeatStatus};

/// Called with the acknowledgement of a probe.
pub type Responder = Box<dyn FnOnce(InstructionAck) + Send + 'static>;

/// Writes an instruction to the control stream.
pub type InstructionWriter = Arc<dyn Fn(PlatformInbound) -> Result<()> + Send + Sync + 'static>;

/// Invoked when no heartbeat evidence arrived before the deadline.
pub type MissedHandler = Arc<dyn Fn() + Send + Sync + 'static>;

pub trait SendHeartbeat: Send + Sync + 'static {
    fn send_heartbeat(&self, responder: Responder, timeout: Duration) -> Result<()>;
}

/// Generation number of a heartbeat configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogicalTime(u64);

impl LogicalTime {
    pub fn get(self) -> u64 {
        self.0
    }
}

/// Advanced by every configuration change; messages stamped with an older
/// value are ignored by the monitor.
#[derive(Debug, Default)]
pub struct LogicalClock(AtomicU64);

impl LogicalClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self) -> LogicalTime {
        LogicalTime(self.0.fetch_add(1, Ordering::AcqRel) + 1)
    }

    pub fn now(&self) -> LogicalTime {
        LogicalTime(self.0.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_advances_monotonically() {
        let clock = LogicalClock::new();
        assert_eq!(clock.now(), LogicalTime::default());
        let first = clock.advance();
        let second = clock.advance();
        assert!(second > first);
        assert_eq!(clock.now(), second);
    }
}
