//! Permit accounting for inbound refills and outbound dispatch.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::{ConfigError, ConnectorError, Result};

/// A strictly positive number of permits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct PermitCount(i64);

impl PermitCount {
    pub const MINIMUM: PermitCount = PermitCount(16);
    pub const DEFAULT: PermitCount = PermitCount(5000);

    pub fn new(value: i64) -> Result<Self, ConfigError> {
        if value <= 0 {
            return Err(ConfigError::invalid(
                "permit count",
                format!("{value} must be greater than 0"),
            ));
        }
        Ok(Self(value))
    }

    pub fn get(self) -> i64 {
        self.0
    }

    /// The refill batch for this capacity: a quarter, at least one.
    pub fn batch(self) -> PermitCount {
        PermitCount((self.0 / 4).max(1))
    }
}

impl TryFrom<i64> for PermitCount {
    type Error = ConfigError;

    fn try_from(value: i64) -> Result<Self, ConfigError> {
        Self::new(value)
    }
}

impl From<PermitCount> for i64 {
    fn from(value: PermitCount) -> i64 {
        value.0
    }
}

impl fmt::Display for PermitCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Non-negative count of consumed permits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PermitCounter(i64);

impl PermitCounter {
    pub const ZERO: PermitCounter = PermitCounter(0);

    pub fn new(value: i64) -> Result<Self, ConfigError> {
        if value < 0 {
            return Err(ConfigError::invalid(
                "permit counter",
                format!("{value} must be greater than or equal to 0"),
            ));
        }
        Ok(Self(value))
    }

    pub fn increment(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    pub fn get(self) -> i64 {
        self.0
    }

    pub fn reached(self, threshold: PermitCount) -> bool {
        self.0 >= threshold.get()
    }
}

/// Signals when a batch of permits has been consumed and must be requested again.
#[derive(Debug)]
pub struct PermitController {
    threshold: PermitCount,
    current: PermitCounter,
}

impl PermitController {
    pub fn new(threshold: PermitCount) -> Self {
        Self {
            threshold,
            current: PermitCounter::ZERO,
        }
    }

    /// Returns `true` exactly once every `threshold` calls.
    pub fn increment(&mut self) -> bool {
        self.current = self.current.increment();
        if self.current.reached(self.threshold) {
            self.current = PermitCounter::ZERO;
            return true;
        }
        false
    }

    pub fn reset(&mut self) {
        self.current = PermitCounter::ZERO;
    }

    pub fn threshold(&self) -> PermitCount {
        self.threshold
    }

    pub fn current(&self) -> PermitCounter {
        self.current
    }
}

/// Shared permit pool for several producers writing to one stream.
#[derive(Debug, Default)]
pub struct ConcurrentFlowControl {
    requested: AtomicI64,
    cancelled: AtomicBool,
    available: Notify,
}

impl ConcurrentFlowControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_permits(permits: PermitCount) -> Self {
        let flow = Self::new();
        flow.request(permits.get());
        flow
    }

    /// Adds `count` permits and wakes waiters. Non-positive counts are ignored.
    pub fn request(&self, count: i64) {
        if count <= 0 {
            return;
        }
        let total = self.requested.fetch_add(count, Ordering::AcqRel) + count;
        if total > 0 {
            self.available.notify_waiters();
        }
    }

    /// Takes one permit if one is available. Never drives the pool negative.
    pub fn try_take(&self) -> bool {
        if self.is_cancelled() {
            return false;
        }
        let mut current = self.requested.load(Ordering::Acquire);
        loop {
            if current <= 0 {
                return false;
            }
            match self.requested.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Gives back a permit taken for a write that never happened.
    pub fn restore(&self) {
        self.request(1);
    }

    /// Waits until a permit is available without taking it.
    ///
    /// Returns `Ok(false)` once the pool is cancelled and
    /// `Err(ConnectorError::Cancelled)` when `cancel` fires first.
    pub async fn wait_to_take(&self, cancel: &CancellationToken) -> Result<bool> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_cancelled() {
                return Ok(false);
            }
            if self.requested.load(Ordering::Acquire) > 0 {
                return Ok(true);
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(ConnectorError::Cancelled),
                _ = &mut notified => {}
            }
        }
    }

    /// Waits for and takes a permit. `Ok(false)` once the pool is cancelled.
    pub async fn take(&self, cancel: &CancellationToken) -> Result<bool> {
        loop {
            if !self.wait_to_take(cancel).await? {
                return Ok(false);
            }
            if self.try_take() {
                return Ok(true);
            }
        }
    }

    /// Waits for a permit and hands it out as a guard that gives it back on
    /// drop. `Ok(None)` once the pool is cancelled.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<Option<Permit<'_>>> {
        if self.take(cancel).await? {
            Ok(Some(Permit { pool: self }))
        } else {
            Ok(None)
        }
    }

    /// Permanently fails every current and future waiter.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.available.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn available(&self) -> i64 {
        self.requested.load(Ordering::Acquire).max(0)
    }
}

/// A permit held for the duration of one dispatch. Returned to its pool when
/// dropped, including when the dispatching future is abandoned.
#[must_use = "dropping a permit returns it to the pool"]
#[derive(Debug)]
pub struct Permit<'a> {
    pool: &'a ConcurrentFlowControl,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.pool.restore();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn permit_count_must_be_positive() {
        assert!(PermitCount::new(0).is_err());
        assert!(PermitCount::new(-3).is_err());
        assert_eq!(PermitCount::new(5000).map(PermitCount::batch).ok(), PermitCount::new(1250).ok());
        assert_eq!(PermitCount::new(2).map(PermitCount::batch).ok(), PermitCount::new(1).ok());
    }

    #[test]
    fn permit_counter_must_not_be_negative() {
        assert!(PermitCounter::new(-1).is_err());
        assert_eq!(PermitCounter::new(0).ok(), Some(PermitCounter::ZERO));
        assert_eq!(PermitCounter::ZERO.increment().get(), 1);
    }

    #[test]
    fn controller_signals_once_per_threshold() {
        let mut controller = PermitController::new(PermitCount::new(3).expect("count"));
        let signals: Vec<bool> = (0..7).map(|_| controller.increment()).collect();
        assert_eq!(signals, vec![false, false, true, false, false, true, false]);
        assert_eq!(controller.current().get(), 1);
        controller.reset();
        assert_eq!(controller.current(), PermitCounter::ZERO);
    }

    #[test]
    fn controller_with_threshold_one_always_signals() {
        let mut controller = PermitController::new(PermitCount::new(1).expect("count"));
        assert!(controller.increment());
        assert!(controller.increment());
    }

    #[test]
    fn try_take_consumes_requested_permits_only() {
        let flow = ConcurrentFlowControl::new();
        assert!(!flow.try_take());
        flow.request(2);
        assert!(flow.try_take());
        assert!(flow.try_take());
        assert!(!flow.try_take());
        assert_eq!(flow.available(), 0);
        flow.request(0);
        flow.request(-5);
        assert!(!flow.try_take());
    }

    #[test]
    fn restore_returns_a_permit() {
        let flow = ConcurrentFlowControl::new();
        flow.request(1);
        assert!(flow.try_take());
        flow.restore();
        assert!(flow.try_take());
    }

    #[tokio::test]
    async fn waiter_is_released_by_request() {
        let flow = Arc::new(ConcurrentFlowControl::new());
        let cancel = CancellationToken::new();
        let waiter = {
            let flow = flow.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { flow.take(&cancel).await })
        };
        tokio::task::yield_now().await;
        flow.request(1);
        assert_eq!(waiter.await.expect("join").ok(), Some(true));
        assert_eq!(flow.available(), 0);
    }

    #[tokio::test]
    async fn cancel_fails_waiters() {
        let flow = Arc::new(ConcurrentFlowControl::new());
        let cancel = CancellationToken::new();
        let waiter = {
            let flow = flow.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { flow.wait_to_take(&cancel).await })
        };
        tokio::task::yield_now().await;
        flow.cancel();
        assert_eq!(waiter.await.expect("join").ok(), Some(false));
        flow.request(10);
        assert!(!flow.try_take());
    }

    #[tokio::test]
    async fn acquired_permits_return_when_dropped() {
        let flow = ConcurrentFlowControl::with_permits(PermitCount::new(2).expect("count"));
        let cancel = CancellationToken::new();
        let first = flow.acquire(&cancel).await.expect("acquire").expect("permit");
        let second = flow.acquire(&cancel).await.expect("acquire").expect("permit");
        assert_eq!(flow.available(), 0);

        drop(first);
        assert_eq!(flow.available(), 1);

        let held = async move {
            let _second = second;
            std::future::pending::<()>().await
        };
        assert!(tokio::time::timeout(Duration::from_millis(5), held).await.is_err());
        assert_eq!(flow.available(), 2);

        flow.cancel();
        assert!(flow.acquire(&cancel).await.expect("acquire").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_token_unwinds_waiter() {
        let flow = ConcurrentFlowControl::new();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        assert_eq!(flow.wait_to_take(&cancel).await, Err(ConnectorError::Cancelled));
        assert_eq!(flow.available(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_takes_never_exceed_requests() {
        let flow = Arc::new(ConcurrentFlowControl::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let flow = flow.clone();
            handles.push(tokio::spawn(async move {
                let mut taken = 0i64;
                for _ in 0..2_000 {
                    if flow.try_take() {
                        taken += 1;
                    }
                    tokio::task::yield_now().await;
                }
                taken
            }));
        }
        for _ in 0..4 {
            let flow = flow.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..250 {
                    flow.request(1);
                    tokio::task::yield_now().await;
                }
                0
            }));
        }
        let mut taken = 0;
        for handle in handles {
            taken += handle.await.expect("join");
        }
        assert!(taken <= 1_000);
        assert_eq!(taken + flow.available(), 1_000);
    }
}
