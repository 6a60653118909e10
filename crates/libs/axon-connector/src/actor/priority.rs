//! Two-lane variant of [`Actor`](super::Actor).
//!
//! Each cycle takes at most one message from every ready lane, primary first,
//! so a busy primary lane delays the secondary lane but never starves it.

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{await_consumer, supervise, Observe, Receive};
use crate::error::{ConnectorError, Result};
use crate::scheduler::Scheduler;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Priority {
    Primary,
    Secondary,
}

pub struct PriorityActorRef<M> {
    name: &'static str,
    primary: mpsc::UnboundedSender<M>,
    secondary: mpsc::UnboundedSender<M>,
    scheduler: Scheduler,
    cancel: CancellationToken,
}

impl<M> Clone for PriorityActorRef<M> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            primary: self.primary.clone(),
            secondary: self.secondary.clone(),
            scheduler: self.scheduler.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<M: Send + 'static> PriorityActorRef<M> {
    fn lane(&self, priority: Priority) -> &mpsc::UnboundedSender<M> {
        match priority {
            Priority::Primary => &self.primary,
            Priority::Secondary => &self.secondary,
        }
    }

    /// Enqueues on the primary lane.
    pub fn tell(&self, message: M) -> Result<()> {
        self.tell_with(Priority::Primary, message)
    }

    pub fn tell_with(&self, priority: Priority, message: M) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ConnectorError::Closed { component: self.name });
        }
        self.lane(priority)
            .send(message)
            .map_err(|_| ConnectorError::Closed { component: self.name })
    }

    pub fn tell_all(&self, messages: impl IntoIterator<Item = M>) -> Result<()> {
        for message in messages {
            self.tell(message)?;
        }
        Ok(())
    }

    pub fn schedule(&self, message: M, delay: Duration) -> Result<()> {
        self.schedule_with(Priority::Primary, message, delay)
    }

    pub fn schedule_with(&self, priority: Priority, message: M, delay: Duration) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ConnectorError::Closed { component: self.name });
        }
        let tx = self.lane(priority).clone();
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

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.primary.is_closed()
    }
}

pub struct PriorityInbox<M> {
    primary: mpsc::UnboundedReceiver<M>,
    secondary: mpsc::UnboundedReceiver<M>,
}

pub fn priority_mailbox<M>(
    name: &'static str,
    scheduler: &Scheduler,
) -> (PriorityActorRef<M>, PriorityInbox<M>) {
    let (primary_tx, primary_rx) = mpsc::unbounded_channel();
    let (secondary_tx, secondary_rx) = mpsc::unbounded_channel();
    let actor_ref = PriorityActorRef {
        name,
        primary: primary_tx,
        secondary: secondary_tx,
        scheduler: scheduler.clone(),
        cancel: CancellationToken::new(),
    };
    let inbox = PriorityInbox {
        primary: primary_rx,
        secondary: secondary_rx,
    };
    (actor_ref, inbox)
}

pub struct PriorityActor<M, S: Observe> {
    mailbox: PriorityActorRef<M>,
    view: watch::Receiver<S::View>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl<M, S> PriorityActor<M, S>
where
    M: Debug + Send + 'static,
    S: Observe + Debug + Send + 'static,
{
    pub fn spawn<R>(
        mailbox: PriorityActorRef<M>,
        inbox: PriorityInbox<M>,
        receiver: R,
        initial: S,
    ) -> Self
    where
        R: Receive<M, S>,
    {
        let (view_tx, view) = watch::channel(initial.observe());
        let consumer = supervise(
            mailbox.name,
            mailbox.cancel.clone(),
            consume(
                mailbox.name,
                inbox,
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

    pub fn tell_with(&self, priority: Priority, message: M) -> Result<()> {
        self.mailbox.tell_with(priority, message)
    }

    pub fn mailbox(&self) -> PriorityActorRef<M> {
        self.mailbox.clone()
    }

    pub fn state(&self) -> S::View {
        self.view.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<S::View> {
        self.view.clone()
    }

    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.mailbox.cancel.cancel();
        await_consumer(self.mailbox.name, &self.consumer).await;
    }
}

impl<M, S: Observe> Drop for PriorityActor<M, S> {
    fn drop(&mut self) {
        self.mailbox.cancel.cancel();
    }
}

async fn consume<M, S, R>(
    name: &'static str,
    mut inbox: PriorityInbox<M>,
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
        if cancel.is_cancelled() {
            break;
        }

        let mut ready = Vec::with_capacity(2);
        match inbox.primary.try_recv() {
            Ok(message) => ready.push((Priority::Primary, message)),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {}
        }
        match inbox.secondary.try_recv() {
            Ok(message) => ready.push((Priority::Secondary, message)),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {}
        }

        if ready.is_empty() {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(message) = inbox.primary.recv() => (Priority::Primary, message),
                Some(message) = inbox.secondary.recv() => (Priority::Secondary, message),
                else => break,
            };
            ready.push(next);
        }

        for (priority, message) in ready {
            log::trace!("{}: began {:?} as {:?} in {:?}", name, message, priority, state);
            state = receiver.receive(message, state).await;
            log::trace!("{}: completed with {:?}", name, state);
            view.send_replace(state.observe());
        }
    }
    inbox.primary.close();
    inbox.secondary.close();
    log::debug!("{}: priority actor loop exiting", name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::sync::oneshot;

    #[derive(Debug)]
    enum Message {
        Record(&'static str),
        Flush(oneshot::Sender<Vec<&'static str>>),
    }

    #[derive(Debug, Default)]
    struct Log(Vec<&'static str>);

    impl Observe for Log {
        type View = usize;

        fn observe(&self) -> usize {
            self.0.len()
        }
    }

    struct Recorder;

    #[async_trait]
    impl Receive<Message, Log> for Recorder {
        async fn receive(&self, message: Message, mut state: Log) -> Log {
            match message {
                Message::Record(label) => state.0.push(label),
                Message::Flush(reply) => {
                    let _ = reply.send(std::mem::take(&mut state.0));
                }
            }
            state
        }
    }

    #[tokio::test]
    async fn secondary_lane_is_not_starved_by_primary_backlog() {
        let scheduler = Scheduler::default();
        let (mailbox, inbox) = priority_mailbox("recorder", &scheduler);
        for _ in 0..10 {
            mailbox.tell(Message::Record("p")).expect("tell");
        }
        mailbox.tell_with(Priority::Secondary, Message::Record("s")).expect("tell");
        let (tx, rx) = oneshot::channel();
        mailbox.tell_with(Priority::Secondary, Message::Flush(tx)).expect("tell");

        let actor = PriorityActor::spawn(mailbox, inbox, Recorder, Log::default());
        let seen = rx.await.expect("flush");

        let position = seen.iter().position(|label| *label == "s").expect("secondary seen");
        assert_eq!(seen[0], "p");
        assert_eq!(position, 1);
        actor.dispose().await;
        scheduler.dispose().await;
    }

    #[tokio::test]
    async fn lanes_keep_their_own_order() {
        let scheduler = Scheduler::default();
        let (mailbox, inbox) = priority_mailbox("recorder", &scheduler);
        let actor = PriorityActor::spawn(mailbox, inbox, Recorder, Log::default());
        for label in ["a", "b", "c"] {
            actor.tell(Message::Record(label)).expect("tell");
        }
        for label in ["x", "y"] {
            actor.tell_with(Priority::Secondary, Message::Record(label)).expect("tell");
        }
        let mut view = actor.watch();
        view.wait_for(|len| *len == 5).await.expect("view");
        let (tx, rx) = oneshot::channel();
        actor.tell_with(Priority::Secondary, Message::Flush(tx)).expect("tell");
        let seen = rx.await.expect("flush");
        let primary: Vec<_> = seen.iter().copied().filter(|l| ["a", "b", "c"].contains(l)).collect();
        let secondary: Vec<_> = seen.iter().copied().filter(|l| ["x", "y"].contains(l)).collect();
        assert_eq!(primary, vec!["a", "b", "c"]);
        assert_eq!(secondary, vec!["x", "y"]);
        actor.dispose().await;
        scheduler.dispose().await;
    }
}
