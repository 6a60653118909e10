//! Single-consumer message loops owning one state value.
//!
//! A component builds its mailbox first (so its receiver can talk back to
//! itself), then spawns the actor with the receiver and the initial state. The
//! state is moved into [`Receive::receive`] and the returned value becomes the
//! committed state; a cheap [`Observe::View`] of it is published after every
//! transition for readers outside the loop.

use std::fmt::Debug;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{ConnectorError, Result};
use crate::scheduler::Scheduler;

pub mod priority;

pub use priority::{priority_mailbox, Priority, PriorityActor, PriorityActorRef, PriorityInbox};

/// The transition function of an actor.
///
/// A transition that panics takes its state with it: the actor stops, the
/// failure is logged and the mailbox is closed, so later tells fail with
/// [`ConnectorError::Closed`].
#[async_trait]
pub trait Receive<M, S>: Send + Sync + 'static
where
    M: Send + 'static,
    S: Send + 'static,
{
    async fn receive(&self, message: M, state: S) -> S;
}

/// Projection of an actor state that can be read outside of its loop.
pub trait Observe {
    type View: Clone + Send + Sync + 'static;

    fn observe(&self) -> Self::View;
}

/// Sending side of an actor inbox.
pub struct ActorRef<M> {
    name: &'static str,
    tx: mpsc::UnboundedSender<M>,
    scheduler: Scheduler,
    cancel: CancellationToken,
}

impl<M> Clone for ActorRef<M> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
            scheduler: self.scheduler.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<M: Send + 'static> ActorRef<M> {
    pub fn tell(&self, message: M) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ConnectorError::Closed { component: self.name });
        }
        self.tx
            .send(message)
            .map_err(|_| ConnectorError::Closed { component: self.name })
    }

    pub fn tell_all(&self, messages: impl IntoIterator<Item = M>) -> Result<()> {
        for message in messages {
            self.tell(message)?;
        }
        Ok(())
    }

    /// Delivers `message` after `delay` through the scheduler.
    pub fn schedule(&self, message: M, delay: Duration) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ConnectorError::Closed { component: self.name });
        }
        let tx = self.tx.clone();
        let name = self.name;
        self.scheduler.schedule(
            Box::new(move || {
                if tx.send(message).is_err() {
                    log::debug!("{}: dropped scheduled message, inbox closed", name);
                }
            }),
            delay,
        )
    }

    /// Cancelled when the owning actor is disposed or its loop dies.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }
}

/// Receiving side of an actor inbox, consumed by [`Actor::spawn`].
pub struct Inbox<M> {
    rx: mpsc::UnboundedReceiver<M>,
}

pub fn mailbox<M>(name: &'static str, scheduler: &Scheduler) -> (ActorRef<M>, Inbox<M>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let actor_ref = ActorRef {
        name,
        tx,
        scheduler: scheduler.clone(),
        cancel: CancellationToken::new(),
    };
    (actor_ref, Inbox { rx })
}

pub struct Actor<M, S: Observe> {
    mailbox: ActorRef<M>,
    view: watch::Receiver<S::View>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl<M, S> Actor<M, S>
where
    M: Debug + Send + 'static,
    S: Observe + Debug + Send + 'static,
{
    pub fn spawn<R>(mailbox: ActorRef<M>, inbox: Inbox<M>, receiver: R, initial: S) -> Self
    where
        R: Receive<M, S>,
    {
        let (view_tx, view) = watch::channel(initial.observe());
        let consumer = supervise(
            mailbox.name,
            mailbox.cancel.clone(),
            consume(
                mailbox.name,
                inbox.rx,
                receiver,
                initial,
                view_tx,
                mailbox.cancel.clone(),
            ),
        );
        Self {
            mailbox,
            view,
            consumer: Mutex::new(Some(consumer)),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn tell(&self, message: M) -> Result<()> {
        self.mailbox.tell(message)
    }

    pub fn schedule(&self, message: M, delay: Duration) -> Result<()> {
        self.mailbox.schedule(message, delay)
    }

    pub fn mailbox(&self) -> ActorRef<M> {
        self.mailbox.clone()
    }

    /// The view of the last committed state.
    pub fn state(&self) -> S::View {
        self.view.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<S::View> {
        self.view.clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Cancels the loop, closes the inbox and waits for the loop to finish.
    /// No transition runs after this returns. Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.mailbox.cancel.cancel();
        await_consumer(self.mailbox.name, &self.consumer).await;
    }
}

impl<M, S: Observe> Drop for Actor<M, S> {
    fn drop(&mut self) {
        self.mailbox.cancel.cancel();
    }
}

/// Runs an actor loop and closes its mailbox if the loop dies.
pub(crate) fn supervise<F>(name: &'static str, cancel: CancellationToken, consumer: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let consumer = tokio::spawn(consumer);
    tokio::spawn(async move {
        if let Err(e) = consumer.await {
            if e.is_panic() {
                log::error!("{}: transition panicked, actor stopped: {}", name, e);
            }
            cancel.cancel();
        }
    })
}

pub(crate) async fn await_consumer(name: &'static str, consumer: &Mutex<Option<JoinHandle<()>>>) {
    let consumer = match consumer.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    };
    if let Some(consumer) = consumer {
        if let Err(e) = consumer.await {
            log::error!("{}: actor loop terminated abnormally: {}", name, e);
        }
    }
}

async fn consume<M, S, R>(
    name: &'static str,
    mut rx: mpsc::UnboundedReceiver<M>,
    receiver: R,
    mut state: S,
    view: watch::Sender<S::View>,
    cancel: CancellationToken,
) where
    M: Debug + Send + 'static,
    S: Observe + Debug + Send + 'static,
    R: Receive<M, S>,
{
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        log::trace!("{}: began {:?} in {:?}", name, message, state);
        state = receiver.receive(message, state).await;
        log::trace!("{}: completed with {:?}", name, state);
        view.send_replace(state.observe());
    }
    rx.close();
    log::debug!("{}: actor loop exiting", name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[derive(Debug)]
    enum CounterMessage {
        Add(i64),
        Get(oneshot::Sender<i64>),
    }

    #[derive(Debug)]
    struct Counter(i64);

    impl Observe for Counter {
        type View = i64;

        fn observe(&self) -> i64 {
            self.0
        }
    }

    struct CounterReceiver;

    #[async_trait]
    impl Receive<CounterMessage, Counter> for CounterReceiver {
        async fn receive(&self, message: CounterMessage, state: Counter) -> Counter {
            match message {
                CounterMessage::Add(n) => Counter(state.0 + n),
                CounterMessage::Get(reply) => {
                    let _ = reply.send(state.0);
                    state
                }
            }
        }
    }

    fn counter(scheduler: &Scheduler) -> Actor<CounterMessage, Counter> {
        let (mailbox, inbox) = mailbox("counter", scheduler);
        Actor::spawn(mailbox, inbox, CounterReceiver, Counter(0))
    }

    #[tokio::test]
    async fn messages_are_applied_in_order() {
        let scheduler = Scheduler::default();
        let actor = counter(&scheduler);
        for n in 1..=100 {
            actor.tell(CounterMessage::Add(n)).expect("tell");
        }
        let (tx, rx) = oneshot::channel();
        actor.tell(CounterMessage::Get(tx)).expect("tell");
        assert_eq!(rx.await.expect("reply"), 5050);
        assert_eq!(actor.state(), 5050);
        actor.dispose().await;
        scheduler.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_messages_arrive_after_delay() {
        let scheduler = Scheduler::default();
        let actor = counter(&scheduler);
        let mut view = actor.watch();
        actor
            .schedule(CounterMessage::Add(7), Duration::from_millis(200))
            .expect("schedule");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(actor.state(), 0);
        view.wait_for(|value| *value == 7).await.expect("view");
        actor.dispose().await;
        scheduler.dispose().await;
    }

    #[tokio::test]
    async fn dispose_is_idempotent_and_closes_the_inbox() {
        let scheduler = Scheduler::default();
        let actor = counter(&scheduler);
        let mailbox = actor.mailbox();
        actor.dispose().await;
        actor.dispose().await;
        assert!(actor.is_disposed());
        assert!(mailbox.is_closed());
        assert!(matches!(
            mailbox.tell(CounterMessage::Add(1)),
            Err(ConnectorError::Closed { component: "counter" })
        ));
        scheduler.dispose().await;
    }

    struct Fragile;

    #[async_trait]
    impl Receive<CounterMessage, Counter> for Fragile {
        async fn receive(&self, message: CounterMessage, state: Counter) -> Counter {
            match message {
                CounterMessage::Add(n) if n < 0 => panic!("negative amount"),
                CounterMessage::Add(n) => Counter(state.0 + n),
                CounterMessage::Get(reply) => {
                    let _ = reply.send(state.0);
                    state
                }
            }
        }
    }

    #[tokio::test]
    async fn panicking_transition_closes_the_mailbox() {
        let scheduler = Scheduler::default();
        let (mailbox, inbox) = mailbox("fragile", &scheduler);
        let actor = Actor::spawn(mailbox, inbox, Fragile, Counter(0));
        actor.tell(CounterMessage::Add(2)).expect("tell");
        actor.tell(CounterMessage::Add(-1)).expect("tell");

        actor.mailbox().cancellation().cancelled().await;
        assert!(actor.mailbox().is_closed());
        assert!(matches!(
            actor.tell(CounterMessage::Add(1)),
            Err(ConnectorError::Closed { component: "fragile" })
        ));
        actor.dispose().await;
        scheduler.dispose().await;
    }
}
