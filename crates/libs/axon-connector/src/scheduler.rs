//! Single-loop timer service.
//!
//! Tasks are queued with a due instant; a periodic tick, armed only while
//! tasks are pending, runs every task whose due instant has passed. A task that
//! is already overdue when it arrives runs right away.

use std::future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::{ConnectorError, Result};

pub const DEFAULT_TICK: Duration = Duration::from_millis(10);

pub type ScheduledTask = Box<dyn FnOnce() + Send + 'static>;

struct Scheduled {
    due: Instant,
    task: ScheduledTask,
}

enum Protocol {
    Schedule(Scheduled),
}

struct Inner {
    tx: mpsc::UnboundedSender<Protocol>,
    cancel: CancellationToken,
    consumer: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Starts the scheduler loop on the current runtime.
    pub fn new(tick: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let consumer = tokio::spawn(run(rx, tick.max(Duration::from_millis(1)), cancel.clone()));
        Self {
            inner: Arc::new(Inner {
                tx,
                cancel,
                consumer: Mutex::new(Some(consumer)),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn schedule_at(&self, task: ScheduledTask, due: Instant) -> Result<()> {
        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(ConnectorError::Closed {
                component: "scheduler",
            });
        }
        self.inner
            .tx
            .send(Protocol::Schedule(Scheduled { due, task }))
            .map_err(|_| ConnectorError::Closed {
                component: "scheduler",
            })
    }

    pub fn schedule(&self, task: ScheduledTask, delay: Duration) -> Result<()> {
        self.schedule_at(task, Instant::now() + delay)
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Stops the loop and drops every pending task. Idempotent.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.cancel.cancel();
        let consumer = match self.inner.consumer.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(consumer) = consumer {
            if let Err(e) = consumer.await {
                log::error!("scheduler: loop terminated abnormally: {}", e);
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(DEFAULT_TICK)
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => future::pending::<()>().await,
    }
}

async fn run(mut rx: mpsc::UnboundedReceiver<Protocol>, tick: Duration, cancel: CancellationToken) {
    let mut pending: Vec<Scheduled> = Vec::new();
    let mut ticker: Option<Interval> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            message = rx.recv() => match message {
                Some(Protocol::Schedule(scheduled)) => {
                    if scheduled.due <= Instant::now() {
                        (scheduled.task)();
                        continue;
                    }
                    if ticker.is_none() {
                        let mut interval = time::interval_at(Instant::now() + tick, tick);
                        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                        ticker = Some(interval);
                        log::trace!("scheduler: timer enabled");
                    }
                    pending.push(scheduled);
                }
                None => break,
            },
            _ = next_tick(&mut ticker) => {
                let now = Instant::now();
                let (due, later): (Vec<_>, Vec<_>) =
                    pending.drain(..).partition(|scheduled| scheduled.due <= now);
                pending = later;
                if !due.is_empty() {
                    log::trace!("scheduler: {} tasks due", due.len());
                }
                for scheduled in due {
                    (scheduled.task)();
                }
                if pending.is_empty() {
                    ticker = None;
                    log::trace!("scheduler: timer disabled, no pending tasks");
                }
            }
        }
    }

    rx.close();
    log::debug!("scheduler: loop exiting with {} pending tasks", pending.len());
}
