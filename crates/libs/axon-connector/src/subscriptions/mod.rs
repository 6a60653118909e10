//! Bookkeeping of subscribe and unsubscribe instructions.
//!
//! A tracker lives inside a channel's actor loop and is never shared. It knows
//! which handlers are registered, which subscriptions are waiting for an
//! acknowledgement and which subscription is active per subject. A subject has
//! at most one active subscription: a newer subscribe for the same subject
//! supersedes the pending older ones, which are dropped when their
//! acknowledgement arrives.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::completion::{Completion, CountdownCompletionSource};
use crate::error::{ConnectorError, ErrorCategory, PlatformError, Result};
use crate::ids::{ClientIdentity, InstructionId, SubscriptionId};
use crate::wire::InstructionAck;

pub mod command;
pub mod query;

pub use command::{CommandName, CommandSubscriptions};
pub use query::{QueryDefinition, QuerySubscriptions};

/// What a subscription is about; the name is the routing key.
pub trait Subject: Clone + Debug {
    fn name(&self) -> &str;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subscription<K, T> {
    pub handler_id: K,
    pub subscription_id: SubscriptionId,
    pub subject: T,
}

#[derive(Clone, Debug)]
struct Pending {
    subscription_id: SubscriptionId,
    created_at: Instant,
}

/// Result of feeding an acknowledgement to a tracker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Acknowledged {
    /// The subscription is now the active one for its subject.
    Subscribed(SubscriptionId),
    /// The subscription was superseded while in flight and was discarded.
    Superseded(SubscriptionId),
    SubscribeRejected(SubscriptionId),
    Unsubscribed(SubscriptionId),
    UnsubscribeRejected(SubscriptionId),
    /// No pending instruction matched, e.g. a duplicate acknowledgement.
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Unsubscribe {
    /// Send an unsubscribe instruction with this id.
    Instruction(InstructionId),
    /// The subscription was not active; nothing needs to be sent.
    NotActive,
}

#[derive(Debug)]
pub struct SubscriptionTracker<K, T, H> {
    client_identity: ClientIdentity,
    handlers: HashMap<K, H>,
    subscriptions: HashMap<SubscriptionId, Subscription<K, T>>,
    subscribe_sources: HashMap<K, CountdownCompletionSource>,
    unsubscribe_sources: HashMap<K, CountdownCompletionSource>,
    active_subscriptions: HashMap<String, SubscriptionId>,
    active_handlers: HashMap<String, H>,
    subscribe_instructions: HashMap<InstructionId, Pending>,
    unsubscribe_instructions: HashMap<InstructionId, Pending>,
    superseded: HashSet<SubscriptionId>,
}

impl<K, T, H> SubscriptionTracker<K, T, H>
where
    K: Clone + Debug + Eq + Hash,
    T: Subject,
    H: Clone,
{
    pub fn new(client_identity: ClientIdentity) -> Self {
        Self {
            client_identity,
            handlers: HashMap::new(),
            subscriptions: HashMap::new(),
            subscribe_sources: HashMap::new(),
            unsubscribe_sources: HashMap::new(),
            active_subscriptions: HashMap::new(),
            active_handlers: HashMap::new(),
            subscribe_instructions: HashMap::new(),
            unsubscribe_instructions: HashMap::new(),
            superseded: HashSet::new(),
        }
    }

    pub fn register_handler(&mut self, handler_id: K, source: CountdownCompletionSource, handler: H) {
        if self.handlers.contains_key(&handler_id) {
            return;
        }
        self.subscribe_sources.entry(handler_id.clone()).or_insert(source);
        self.handlers.insert(handler_id, handler);
    }

    /// Records a pending subscribe and returns the instruction id to send, or
    /// `None` when the subscription id is already known.
    pub fn subscribe_to(
        &mut self,
        subscription_id: SubscriptionId,
        handler_id: K,
        subject: T,
    ) -> Option<InstructionId> {
        if self.subscriptions.contains_key(&subscription_id) {
            return None;
        }

        // An active subscription keeps routing until the newer one is
        // acknowledged, even while its own resubscribe is in flight.
        let name = subject.name().to_string();
        let mut superseded = Vec::new();
        for pending in self.subscribe_instructions.values() {
            let same_subject = self
                .subscriptions
                .get(&pending.subscription_id)
                .is_some_and(|s| s.subject.name() == name);
            if same_subject && !self.is_active(&pending.subscription_id) {
                superseded.push(pending.subscription_id.clone());
            }
        }
        self.superseded.extend(superseded);

        self.subscriptions.insert(
            subscription_id.clone(),
            Subscription {
                handler_id,
                subscription_id: subscription_id.clone(),
                subject,
            },
        );
        let instruction_id = InstructionId::new();
        self.subscribe_instructions.insert(
            instruction_id.clone(),
            Pending {
                subscription_id,
                created_at: Instant::now(),
            },
        );
        Some(instruction_id)
    }

    /// Re-issues subscribe instructions for every active subscription, for use
    /// on a freshly opened stream.
    pub fn resubscribe_active(&mut self) -> Vec<(InstructionId, Subscription<K, T>)> {
        let now = Instant::now();
        let mut instructions = Vec::with_capacity(self.active_subscriptions.len());
        for subscription_id in self.active_subscriptions.values() {
            if let Some(subscription) = self.subscriptions.get(subscription_id) {
                let instruction_id = InstructionId::new();
                self.subscribe_instructions.insert(
                    instruction_id.clone(),
                    Pending {
                        subscription_id: subscription_id.clone(),
                        created_at: now,
                    },
                );
                instructions.push((instruction_id, subscription.clone()));
            }
        }
        instructions
    }

    pub fn acknowledge(&mut self, ack: &InstructionAck) -> Acknowledged {
        let Some(instruction_id) = InstructionId::parse(ack.instruction_id.clone()) else {
            return Acknowledged::Unknown;
        };

        if let Some(pending) = self.subscribe_instructions.remove(&instruction_id) {
            return self.acknowledge_subscribe(pending.subscription_id, ack);
        }
        if let Some(pending) = self.unsubscribe_instructions.remove(&instruction_id) {
            return self.acknowledge_unsubscribe(pending.subscription_id, ack);
        }
        Acknowledged::Unknown
    }

    fn acknowledge_subscribe(&mut self, subscription_id: SubscriptionId, ack: &InstructionAck) -> Acknowledged {
        let Some(subscription) = self.subscriptions.get(&subscription_id).cloned() else {
            return Acknowledged::Unknown;
        };

        let error = (!ack.success).then(|| self.rejection(ack));
        signal(&mut self.subscribe_sources, &subscription.handler_id, error);

        // Being unsubscribed; the unsubscribe acknowledgement forgets it.
        if self.is_pending_unsubscribe(&subscription_id) {
            return Acknowledged::Superseded(subscription_id);
        }
        if self.superseded.remove(&subscription_id) {
            self.subscriptions.remove(&subscription_id);
            return Acknowledged::Superseded(subscription_id);
        }

        if !ack.success {
            let active = self.active_subscriptions.get(subscription.subject.name());
            if active != Some(&subscription_id) {
                self.subscriptions.remove(&subscription_id);
            }
            return Acknowledged::SubscribeRejected(subscription_id);
        }

        let Some(handler) = self.handlers.get(&subscription.handler_id).cloned() else {
            self.subscriptions.remove(&subscription_id);
            return Acknowledged::Superseded(subscription_id);
        };
        let name = subscription.subject.name().to_string();
        if let Some(previous) = self.active_subscriptions.insert(name.clone(), subscription_id.clone()) {
            if previous != subscription_id {
                self.subscriptions.remove(&previous);
            }
        }
        self.active_handlers.insert(name, handler);
        Acknowledged::Subscribed(subscription_id)
    }

    fn acknowledge_unsubscribe(&mut self, subscription_id: SubscriptionId, ack: &InstructionAck) -> Acknowledged {
        let Some(subscription) = self.subscriptions.remove(&subscription_id) else {
            return Acknowledged::Unknown;
        };

        let error = (!ack.success).then(|| self.rejection(ack));
        let completed = signal(&mut self.unsubscribe_sources, &subscription.handler_id, error);
        if completed {
            self.forget_handler(&subscription.handler_id);
        }

        if ack.success {
            Acknowledged::Unsubscribed(subscription_id)
        } else {
            Acknowledged::UnsubscribeRejected(subscription_id)
        }
    }

    pub fn unregister_handler(&mut self, handler_id: &K, source: CountdownCompletionSource) {
        if !self.handlers.contains_key(handler_id) {
            return;
        }
        self.unsubscribe_sources.entry(handler_id.clone()).or_insert(source);
    }

    /// Stops routing to `subscription_id` right away. Only the active
    /// subscription of a subject produces an unsubscribe instruction.
    pub fn unsubscribe_from(&mut self, subscription_id: &SubscriptionId) -> Option<Unsubscribe> {
        let subscription = self.subscriptions.get(subscription_id)?.clone();
        let name = subscription.subject.name();

        if self.active_subscriptions.get(name) == Some(subscription_id) {
            self.active_subscriptions.remove(name);
            self.active_handlers.remove(name);
            self.subscribe_instructions
                .retain(|_, pending| &pending.subscription_id != subscription_id);
            let instruction_id = InstructionId::new();
            self.unsubscribe_instructions.insert(
                instruction_id.clone(),
                Pending {
                    subscription_id: subscription_id.clone(),
                    created_at: Instant::now(),
                },
            );
            return Some(Unsubscribe::Instruction(instruction_id));
        }

        // Still in flight: make sure it never becomes active.
        if self.is_pending_subscribe(subscription_id) {
            self.superseded.insert(subscription_id.clone());
        } else {
            self.subscriptions.remove(subscription_id);
        }
        let completed = signal(&mut self.unsubscribe_sources, &subscription.handler_id, None);
        if completed {
            self.forget_handler(&subscription.handler_id);
        }
        Some(Unsubscribe::NotActive)
    }

    /// Counts the unsubscribe of a subscription the tracker no longer knows,
    /// such as a rejected or purged one, as done.
    pub fn unsubscribe_unknown(&mut self, handler_id: &K) {
        if signal(&mut self.unsubscribe_sources, handler_id, None) {
            self.forget_handler(handler_id);
        }
    }

    /// Drops pending instructions older than `age` and faults their
    /// completion sources with a timeout.
    pub fn purge(&mut self, age: Duration) -> Vec<InstructionId> {
        let now = Instant::now();
        let expired = |pending: &Pending| now.saturating_duration_since(pending.created_at) > age;

        let stale_subscribes: Vec<_> = self
            .subscribe_instructions
            .iter()
            .filter(|(_, pending)| expired(pending))
            .map(|(id, _)| id.clone())
            .collect();
        let stale_unsubscribes: Vec<_> = self
            .unsubscribe_instructions
            .iter()
            .filter(|(_, pending)| expired(pending))
            .map(|(id, _)| id.clone())
            .collect();

        let mut purged = Vec::with_capacity(stale_subscribes.len() + stale_unsubscribes.len());
        for instruction_id in stale_subscribes {
            let Some(pending) = self.subscribe_instructions.remove(&instruction_id) else {
                continue;
            };
            let error = ConnectorError::timeout(format!(
                "subscribe instruction {instruction_id} was not acknowledged within {age:?}"
            ));
            self.superseded.remove(&pending.subscription_id);
            let handler_id = self.subscription_handler(&pending.subscription_id);
            if !self.is_active(&pending.subscription_id) {
                self.subscriptions.remove(&pending.subscription_id);
            }
            if let Some(handler_id) = handler_id {
                signal(&mut self.subscribe_sources, &handler_id, Some(error));
            }
            purged.push(instruction_id);
        }
        for instruction_id in stale_unsubscribes {
            let Some(pending) = self.unsubscribe_instructions.remove(&instruction_id) else {
                continue;
            };
            let error = ConnectorError::timeout(format!(
                "unsubscribe instruction {instruction_id} was not acknowledged within {age:?}"
            ));
            if let Some(subscription) = self.subscriptions.remove(&pending.subscription_id) {
                if signal(&mut self.unsubscribe_sources, &subscription.handler_id, Some(error)) {
                    self.forget_handler(&subscription.handler_id);
                }
            }
            purged.push(instruction_id);
        }
        purged
    }

    /// Routing table: the handler serving each subject.
    pub fn active_handlers(&self) -> &HashMap<String, H> {
        &self.active_handlers
    }

    pub fn active_handler(&self, subject: &str) -> Option<&H> {
        self.active_handlers.get(subject)
    }

    pub fn active_subscription(&self, subject: &str) -> Option<&SubscriptionId> {
        self.active_subscriptions.get(subject)
    }

    pub fn is_superseded(&self, subscription_id: &SubscriptionId) -> bool {
        self.superseded.contains(subscription_id)
    }

    pub fn is_registered(&self, handler_id: &K) -> bool {
        self.handlers.contains_key(handler_id)
    }

    pub fn pending_subscribes(&self) -> usize {
        self.subscribe_instructions.len()
    }

    pub fn pending_unsubscribes(&self) -> usize {
        self.unsubscribe_instructions.len()
    }

    pub fn subscription(&self, subscription_id: &SubscriptionId) -> Option<&Subscription<K, T>> {
        self.subscriptions.get(subscription_id)
    }

    fn is_active(&self, subscription_id: &SubscriptionId) -> bool {
        self.subscriptions
            .get(subscription_id)
            .and_then(|s| self.active_subscriptions.get(s.subject.name()))
            == Some(subscription_id)
    }

    fn is_pending_subscribe(&self, subscription_id: &SubscriptionId) -> bool {
        self.subscribe_instructions
            .values()
            .any(|pending| &pending.subscription_id == subscription_id)
    }

    fn is_pending_unsubscribe(&self, subscription_id: &SubscriptionId) -> bool {
        self.unsubscribe_instructions
            .values()
            .any(|pending| &pending.subscription_id == subscription_id)
    }

    fn subscription_handler(&self, subscription_id: &SubscriptionId) -> Option<K> {
        self.subscriptions.get(subscription_id).map(|s| s.handler_id.clone())
    }

    fn forget_handler(&mut self, handler_id: &K) {
        self.unsubscribe_sources.remove(handler_id);
        let still_used = self.subscriptions.values().any(|s| &s.handler_id == handler_id);
        if !still_used {
            self.handlers.remove(handler_id);
            self.subscribe_sources.remove(handler_id);
        }
    }

    fn rejection(&self, ack: &InstructionAck) -> ConnectorError {
        let error = ack.error.clone().unwrap_or_default();
        let mut rejection = PlatformError::from_error_message(self.client_identity.clone(), &error);
        if error.error_code.is_empty() {
            rejection.category = ErrorCategory::InstructionAckError;
        }
        rejection.into()
    }
}

/// Signals the source of `handler_id`; returns `true` when that completed it.
fn signal<K: Eq + Hash>(
    sources: &mut HashMap<K, CountdownCompletionSource>,
    handler_id: &K,
    error: Option<ConnectorError>,
) -> bool {
    let Some(source) = sources.get_mut(handler_id) else {
        return false;
    };
    let completed = match error {
        None => source.signal_success(),
        Some(error) => source.signal_fault(error),
    };
    if completed {
        sources.remove(handler_id);
    }
    completed
}

type Unsubscriber = Box<dyn Fn(CountdownCompletionSource) -> Result<()> + Send + Sync + 'static>;

/// A registered handler. Subscribing completes once every subject was
/// acknowledged; disposing unsubscribes and completes once every unsubscribe
/// was acknowledged.
pub struct HandlerRegistration {
    subscribed: Completion,
    subjects: usize,
    unsubscribe: Unsubscriber,
    unsubscribed: Mutex<Option<Completion>>,
}

impl HandlerRegistration {
    pub(crate) fn new(subscribed: Completion, subjects: usize, unsubscribe: Unsubscriber) -> Self {
        Self {
            subscribed,
            subjects,
            unsubscribe,
            unsubscribed: Mutex::new(None),
        }
    }

    pub async fn wait_until_completed(&self) -> Result<()> {
        self.subscribed.wait().await
    }

    pub fn is_completed(&self) -> bool {
        self.subscribed.is_completed()
    }

    /// Unsubscribes every subject of the handler. Later calls wait for the
    /// outcome of the first.
    pub async fn dispose(&self) -> Result<()> {
        let completion = {
            let mut unsubscribed = match self.unsubscribed.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            match unsubscribed.as_ref() {
                Some(completion) => completion.clone(),
                None => {
                    let source = CountdownCompletionSource::new(self.subjects)?;
                    let completion = source.completion();
                    (self.unsubscribe)(source)?;
                    *unsubscribed = Some(completion.clone());
                    completion
                }
            }
        };
        completion.wait().await
    }
}

impl std::fmt::Debug for HandlerRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistration")
            .field("subjects", &self.subjects)
            .field("subscribed", &self.subscribed.try_outcome())
            .finish_non_exhaustive()
    }
}
