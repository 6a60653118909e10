use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::{LogicalClock, LogicalTime, MissedHandler, Responder, SendHeartbeat};
use crate::actor::{mailbox, Actor, ActorRef, Observe, Receive};
use crate::error::{ErrorCategory, Result};
use crate::ids::Context;
use crate::scheduler::Scheduler;
use crate::wire::{ErrorMessage, InstructionAck};

const MINIMUM_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
enum Message {
    Enable {
        interval: Duration,
        timeout: Duration,
        time: LogicalTime,
    },
    Disable,
    Pause,
    Resume {
        time: LogicalTime,
    },
    Check {
        time: LogicalTime,
    },
    CheckSucceeded,
    CheckFailed(Option<ErrorMessage>),
    ReceiveServerHeartbeat {
        time: LogicalTime,
    },
}

/// Stops the probe timer when dropped.
struct Timer(CancellationToken);

impl Drop for Timer {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Timer")
    }
}

#[derive(Debug)]
enum State {
    Disabled,
    Enabled {
        interval: Duration,
        timeout: Duration,
        next_check: Instant,
        deadline: Instant,
        time: LogicalTime,
        _timer: Timer,
    },
    Paused {
        interval: Duration,
        timeout: Duration,
    },
}

/// Externally visible heartbeat status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeartbeatStatus {
    Disabled,
    Enabled { interval: Duration, timeout: Duration },
    Paused { interval: Duration, timeout: Duration },
}

impl Observe for State {
    type View = HeartbeatStatus;

    fn observe(&self) -> HeartbeatStatus {
        match self {
            State::Disabled => HeartbeatStatus::Disabled,
            State::Enabled {
                interval, timeout, ..
            } => HeartbeatStatus::Enabled {
                interval: *interval,
                timeout: *timeout,
            },
            State::Paused { interval, timeout } => HeartbeatStatus::Paused {
                interval: *interval,
                timeout: *timeout,
            },
        }
    }
}

struct Receiver {
    context: Context,
    sender: Arc<dyn SendHeartbeat>,
    on_missed: MissedHandler,
    mailbox: ActorRef<Message>,
}

impl Receiver {
    fn enabled(&self, interval: Duration, timeout: Duration, time: LogicalTime) -> State {
        let interval = interval.max(MINIMUM_INTERVAL);
        let now = Instant::now();
        State::Enabled {
            interval,
            timeout,
            next_check: now,
            deadline: now + timeout,
            time,
            _timer: self.start_timer(interval, time),
        }
    }

    fn start_timer(&self, interval: Duration, time: LogicalTime) -> Timer {
        let cancel = self.mailbox.cancellation().child_token();
        let stop = cancel.clone();
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            let mut ticks = time::interval(interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticks.tick() => {
                        if mailbox.tell(Message::Check { time }).is_err() {
                            break;
                        }
                    }
                }
            }
        });
        Timer(cancel)
    }

    fn responder(&self) -> Responder {
        let mailbox = self.mailbox.clone();
        Box::new(move |ack: InstructionAck| {
            let message = if ack.success {
                Message::CheckSucceeded
            } else {
                Message::CheckFailed(ack.error)
            };
            let _ = mailbox.tell(message);
        })
    }
}

#[async_trait]
impl Receive<Message, State> for Receiver {
    async fn receive(&self, message: Message, state: State) -> State {
        match (message, state) {
            (Message::Enable { interval, timeout, time }, _) => self.enabled(interval, timeout, time),

            (Message::Disable, _) => State::Disabled,

            (Message::Pause, State::Enabled { interval, timeout, .. }) => {
                State::Paused { interval, timeout }
            }

            (Message::Resume { time }, State::Paused { interval, timeout }) => {
                self.enabled(interval, timeout, time)
            }

            (
                Message::Check { time },
                State::Enabled {
                    interval,
                    timeout,
                    mut next_check,
                    mut deadline,
                    time: current,
                    _timer,
                },
            ) => {
                if time == current {
                    let now = Instant::now();
                    if deadline < now {
                        log::warn!(
                            "heartbeat({}): no heartbeat received within {:?}",
                            self.context,
                            timeout
                        );
                        (self.on_missed)();
                        deadline = now + timeout;
                    }
                    if next_check <= now {
                        if let Err(e) = self.sender.send_heartbeat(self.responder(), timeout) {
                            log::warn!("heartbeat({}): failed to send probe: {}", self.context, e);
                        }
                        next_check = now + interval;
                    }
                }
                State::Enabled {
                    interval,
                    timeout,
                    next_check,
                    deadline,
                    time: current,
                    _timer,
                }
            }

            (
                Message::CheckSucceeded,
                State::Enabled {
                    interval,
                    timeout,
                    next_check,
                    deadline,
                    time,
                    _timer,
                },
            ) => State::Enabled {
                interval,
                timeout,
                next_check,
                deadline: deadline.max(Instant::now() + timeout + interval),
                time,
                _timer,
            },

            (
                Message::CheckFailed(error),
                State::Enabled {
                    interval,
                    timeout,
                    next_check,
                    deadline,
                    time,
                    _timer,
                },
            ) => {
                let error = error.unwrap_or_default();
                let deadline = if ErrorCategory::parse(&error.error_code)
                    == ErrorCategory::UnsupportedInstruction
                {
                    // The platform does not know heartbeats; treat as alive.
                    deadline.max(Instant::now() + timeout + interval)
                } else {
                    log::error!(
                        "heartbeat({}): probe failed with {}: {}",
                        self.context,
                        error.error_code,
                        error.message
                    );
                    deadline
                };
                State::Enabled {
                    interval,
                    timeout,
                    next_check,
                    deadline,
                    time,
                    _timer,
                }
            }

            (
                Message::ReceiveServerHeartbeat { time },
                State::Enabled {
                    interval,
                    timeout,
                    mut next_check,
                    mut deadline,
                    time: current,
                    _timer,
                },
            ) => {
                if time == current {
                    let now = Instant::now();
                    if next_check <= now {
                        next_check = now + interval;
                    }
                    deadline = deadline.max(now + interval);
                }
                State::Enabled {
                    interval,
                    timeout,
                    next_check,
                    deadline,
                    time: current,
                    _timer,
                }
            }

            (message, state) => {
                log::debug!("heartbeat({}): skipped {:?} in {:?}", self.context, message, state);
                state
            }
        }
    }
}

/// Probes the platform periodically and reports silence through the missed
/// handler.
pub struct HeartbeatMonitor {
    actor: Actor<Message, State>,
    clock: LogicalClock,
}

impl HeartbeatMonitor {
    pub fn new(
        context: Context,
        sender: Arc<dyn SendHeartbeat>,
        on_missed: MissedHandler,
        scheduler: &Scheduler,
    ) -> Self {
        let (mailbox, inbox) = mailbox("heartbeat-monitor", scheduler);
        let receiver = Receiver {
            context,
            sender,
            on_missed,
            mailbox: mailbox.clone(),
        };
        Self {
            actor: Actor::spawn(mailbox, inbox, receiver, State::Disabled),
            clock: LogicalClock::new(),
        }
    }

    /// Starts probing every `interval` (at least one second); silence longer
    /// than `timeout` counts as a missed heartbeat.
    pub fn enable(&self, interval: Duration, timeout: Duration) -> Result<()> {
        let time = self.clock.advance();
        self.actor.tell(Message::Enable {
            interval,
            timeout,
            time,
        })
    }

    pub fn disable(&self) -> Result<()> {
        self.clock.advance();
        self.actor.tell(Message::Disable)
    }

    pub fn pause(&self) -> Result<()> {
        self.clock.advance();
        self.actor.tell(Message::Pause)
    }

    pub fn resume(&self) -> Result<()> {
        let time = self.clock.advance();
        self.actor.tell(Message::Resume { time })
    }

    /// Any heartbeat initiated by the platform counts as proof of life.
    pub fn receive_server_heartbeat(&self) -> Result<()> {
        self.actor.tell(Message::ReceiveServerHeartbeat {
            time: self.clock.now(),
        })
    }

    pub fn status(&self) -> HeartbeatStatus {
        self.actor.state()
    }

    pub fn watch(&self) -> tokio::sync::watch::Receiver<HeartbeatStatus> {
        self.actor.watch()
    }

    pub async fn dispose(&self) {
        self.actor.dispose().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Clone, Copy)]
    enum Reply {
        Silent,
        Succeed,
        Unsupported,
    }

    struct Probe {
        reply: Reply,
        sent: AtomicUsize,
        responders: Mutex<Vec<Responder>>,
    }

    impl Probe {
        fn new(reply: Reply) -> Arc<Self> {
            Arc::new(Self {
                reply,
                sent: AtomicUsize::new(0),
                responders: Mutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> usize {
            self.sent.load(Ordering::SeqCst)
        }
    }

    impl SendHeartbeat for Probe {
        fn send_heartbeat(&self, responder: Responder, _timeout: Duration) -> Result<()> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            match self.reply {
                Reply::Silent => self.responders.lock().expect("lock").push(responder),
                Reply::Succeed => responder(InstructionAck::success("probe")),
                Reply::Unsupported => responder(InstructionAck::failure(
                    "probe",
                    ErrorMessage {
                        error_code: ErrorCategory::UnsupportedInstruction.code().into(),
                        message: "unsupported".into(),
                        ..ErrorMessage::default()
                    },
                )),
            }
            Ok(())
        }
    }

    fn monitor(probe: Arc<Probe>, scheduler: &Scheduler) -> (HeartbeatMonitor, Arc<AtomicUsize>) {
        let missed = Arc::new(AtomicUsize::new(0));
        let counter = missed.clone();
        let on_missed: MissedHandler = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let monitor = HeartbeatMonitor::new(Context::default(), probe, on_missed, scheduler);
        (monitor, missed)
    }

    #[tokio::test(start_paused = true)]
    async fn enable_then_disable_sends_no_probe() {
        let scheduler = Scheduler::default();
        let probe = Probe::new(Reply::Silent);
        let (monitor, missed) = monitor(probe.clone(), &scheduler);

        monitor.enable(Duration::from_secs(1), Duration::from_secs(5)).expect("enable");
        monitor.disable().expect("disable");
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(probe.sent(), 0);
        assert_eq!(missed.load(Ordering::SeqCst), 0);
        assert_eq!(monitor.status(), HeartbeatStatus::Disabled);
        monitor.dispose().await;
        scheduler.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn silence_past_the_deadline_is_reported() {
        let scheduler = Scheduler::default();
        let probe = Probe::new(Reply::Silent);
        let (monitor, missed) = monitor(probe.clone(), &scheduler);

        monitor.enable(Duration::from_secs(1), Duration::from_secs(2)).expect("enable");
        tokio::time::sleep(Duration::from_millis(3_500)).await;

        assert!(probe.sent() >= 3);
        assert_eq!(missed.load(Ordering::SeqCst), 1);
        monitor.dispose().await;
        scheduler.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn acknowledged_probes_keep_the_connection_alive() {
        let scheduler = Scheduler::default();
        let probe = Probe::new(Reply::Succeed);
        let (monitor, missed) = monitor(probe.clone(), &scheduler);

        monitor.enable(Duration::from_secs(1), Duration::from_secs(2)).expect("enable");
        tokio::time::sleep(Duration::from_secs(20)).await;

        assert!(probe.sent() >= 19);
        assert_eq!(missed.load(Ordering::SeqCst), 0);
        monitor.dispose().await;
        scheduler.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unsupported_heartbeats_count_as_alive() {
        let scheduler = Scheduler::default();
        let probe = Probe::new(Reply::Unsupported);
        let (monitor, missed) = monitor(probe, &scheduler);

        monitor.enable(Duration::from_secs(1), Duration::from_secs(2)).expect("enable");
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(missed.load(Ordering::SeqCst), 0);
        monitor.dispose().await;
        scheduler.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn server_heartbeats_push_the_deadline_out() {
        let scheduler = Scheduler::default();
        let probe = Probe::new(Reply::Silent);
        let (monitor, missed) = monitor(probe, &scheduler);

        monitor.enable(Duration::from_secs(1), Duration::from_secs(2)).expect("enable");
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(500)).await;
            monitor.receive_server_heartbeat().expect("heartbeat");
        }

        assert_eq!(missed.load(Ordering::SeqCst), 0);
        monitor.dispose().await;
        scheduler.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn pause_stops_probing_and_resume_restarts_it() {
        let scheduler = Scheduler::default();
        let probe = Probe::new(Reply::Silent);
        let (monitor, missed) = monitor(probe.clone(), &scheduler);
        let mut status = monitor.watch();

        monitor.enable(Duration::from_secs(1), Duration::from_secs(30)).expect("enable");
        tokio::time::sleep(Duration::from_millis(100)).await;
        monitor.pause().expect("pause");
        status
            .wait_for(|s| matches!(s, HeartbeatStatus::Paused { .. }))
            .await
            .expect("paused");
        let sent = probe.sent();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(probe.sent(), sent);
        assert_eq!(missed.load(Ordering::SeqCst), 0);

        monitor.resume().expect("resume");
        status
            .wait_for(|s| matches!(s, HeartbeatStatus::Enabled { .. }))
            .await
            .expect("resumed");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(probe.sent() > sent);
        monitor.dispose().await;
        scheduler.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn interval_is_clamped_to_one_second() {
        let scheduler = Scheduler::default();
        let probe = Probe::new(Reply::Succeed);
        let (monitor, _missed) = monitor(probe.clone(), &scheduler);
        let mut status = monitor.watch();

        monitor
            .enable(Duration::from_millis(10), Duration::from_secs(5))
            .expect("enable");
        let enabled = *status
            .wait_for(|s| matches!(s, HeartbeatStatus::Enabled { .. }))
            .await
            .expect("enabled");
        assert_eq!(
            enabled,
            HeartbeatStatus::Enabled {
                interval: Duration::from_secs(1),
                timeout: Duration::from_secs(5)
            }
        );
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert!(probe.sent() <= 3);
        monitor.dispose().await;
        scheduler.dispose().await;
    }
}
