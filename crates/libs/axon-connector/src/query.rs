//! Query handling and dispatch.
//!
//! Mirrors the command channel, with two differences: a query may be answered
//! by several responses followed by a completion, and handler replies travel
//! the secondary lane of the channel's mailbox so that a burst of replies
//! cannot hold back stream frames and subscription changes.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::actor::{priority_mailbox, Observe, Priority, PriorityActor, PriorityActorRef, Receive};
use crate::backoff::ScheduleDue;
use crate::completion::CountdownCompletionSource;
use crate::config::ChannelOptions;
use crate::connection::ConnectionOwner;
use crate::control::ChannelStatus;
use crate::error::{ConnectorError, ErrorCategory, PlatformError, Result, TransportError};
use crate::flow_control::PermitController;
use crate::ids::{ClientIdentity, Context, InstructionId, MessageId, QueryHandlerId, SubscriptionId};
use crate::scheduler::Scheduler;
use crate::subscriptions::{
    Acknowledged, HandlerRegistration, QueryDefinition, QuerySubscriptions, Unsubscribe,
};
use crate::transport::{PlatformTransport, Pump, QueryResponseStream, QueryStream, TransportProxy};
use crate::wire::{
    ErrorMessage, FlowControl, InstructionAck, QueryComplete, QueryProviderInbound,
    QueryProviderInboundRequest, QueryProviderOutbound, QueryProviderOutboundRequest, QueryRequest,
    QueryResponse, QuerySubscription,
};

pub type QueryHandlerRegistration = HandlerRegistration;

/// Answers queries through the given response channel. Returning without
/// completing the channel completes it; returning an error completes it with
/// a `QueryExecutionError`.
#[async_trait]
pub trait QueryHandler: Send + Sync + 'static {
    async fn handle(&self, request: QueryRequest, responses: &QueryResponseChannel) -> Result<()>;
}

#[derive(Clone)]
pub struct RegisteredQueryHandler {
    handler: Arc<dyn QueryHandler>,
}

impl std::fmt::Debug for RegisteredQueryHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredQueryHandler").finish_non_exhaustive()
    }
}

/// Where a handler writes the responses to one query.
pub struct QueryResponseChannel {
    request_id: String,
    mailbox: PriorityActorRef<Message>,
    completed: AtomicBool,
}

impl QueryResponseChannel {
    fn reply(&self, request: QueryProviderOutboundRequest) -> Result<()> {
        self.mailbox.tell_with(
            Priority::Secondary,
            Message::Reply {
                request_id: self.request_id.clone(),
                request,
            },
        )
    }

    pub fn send(&self, mut response: QueryResponse) -> Result<()> {
        if self.is_completed() {
            return Err(ConnectorError::invalid_argument(format!(
                "query {} was already completed",
                self.request_id
            )));
        }
        response.request_identifier = self.request_id.clone();
        if response.message_identifier.is_empty() {
            response.message_identifier = MessageId::new().to_string();
        }
        self.reply(QueryProviderOutboundRequest::QueryResponse(response))
    }

    /// Ends the query. Completing twice is a no-op.
    pub fn complete(&self) -> Result<()> {
        if self.completed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.reply(QueryProviderOutboundRequest::QueryComplete(QueryComplete {
            message_id: MessageId::new().to_string(),
            request_id: self.request_id.clone(),
        }))
    }

    pub fn complete_with_error(&self, category: ErrorCategory, error: ErrorMessage) -> Result<()> {
        self.send(QueryResponse {
            error_code: category.code().to_string(),
            error_message: Some(error),
            ..QueryResponse::default()
        })?;
        self.complete()
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }
}

/// Responses to a dispatched query, in arrival order.
pub struct QueryResponses {
    client_identity: ClientIdentity,
    rx: QueryResponseStream,
}

impl QueryResponses {
    pub async fn next(&mut self) -> Option<Result<QueryResponse>> {
        let item = self.rx.recv().await?;
        Some(item.map_err(|e| dispatch_error(&self.client_identity, e)))
    }

    /// Drains every remaining response, stopping at the first failure.
    pub async fn collect(mut self) -> Result<Vec<QueryResponse>> {
        let mut responses = Vec::new();
        while let Some(response) = self.next().await {
            responses.push(response?);
        }
        Ok(responses)
    }
}

fn dispatch_error(client_identity: &ClientIdentity, error: TransportError) -> ConnectorError {
    let mut platform = PlatformError::new(
        client_identity.clone(),
        ErrorCategory::QueryDispatchError,
        "An error occurred while attempting to dispatch a query",
    );
    platform.details.push(error.to_string());
    platform.into()
}

type Subjects = Vec<(SubscriptionId, QueryDefinition)>;

#[derive(Debug)]
enum Message {
    Connect,
    Reconnect,
    Disconnect,
    OpenStream,
    StreamOpened(Result<QueryStream, TransportError>),
    Received {
        generation: u64,
        frame: Result<QueryProviderInbound, TransportError>,
    },
    Subscribe {
        handler_id: QueryHandlerId,
        handler: RegisteredQueryHandler,
        queries: Subjects,
        source: CountdownCompletionSource,
    },
    Unsubscribe {
        handler_id: QueryHandlerId,
        queries: Subjects,
        source: CountdownCompletionSource,
    },
    Reply {
        request_id: String,
        request: QueryProviderOutboundRequest,
    },
    Purge,
}

#[derive(Debug)]
enum Phase {
    Disconnected,
    Opening {
        reconnecting: bool,
        deferred: Vec<Message>,
    },
    Connected {
        tx: mpsc::UnboundedSender<QueryProviderOutbound>,
        _pump: Pump,
    },
    Faulted,
}

#[derive(Debug)]
struct State {
    phase: Phase,
    generation: u64,
    subscriptions: QuerySubscriptions,
    permits: PermitController,
    in_flight: HashSet<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryChannelView {
    pub status: ChannelStatus,
    pub active_queries: Vec<String>,
    pub pending_subscribes: usize,
    pub pending_unsubscribes: usize,
    pub in_flight: usize,
}

impl Observe for State {
    type View = QueryChannelView;

    fn observe(&self) -> QueryChannelView {
        let status = match &self.phase {
            Phase::Disconnected => ChannelStatus::Disconnected,
            Phase::Opening { reconnecting, .. } if *reconnecting => ChannelStatus::Reconnecting,
            Phase::Opening { .. } => ChannelStatus::Connecting,
            Phase::Connected { .. } => ChannelStatus::Connected,
            Phase::Faulted => ChannelStatus::Faulted,
        };
        let mut active_queries: Vec<String> =
            self.subscriptions.active_handlers().keys().cloned().collect();
        active_queries.sort();
        QueryChannelView {
            status,
            active_queries,
            pending_subscribes: self.subscriptions.pending_subscribes(),
            pending_unsubscribes: self.subscriptions.pending_unsubscribes(),
            in_flight: self.in_flight.len(),
        }
    }
}

struct Receiver {
    context: Context,
    client_identity: ClientIdentity,
    transport: TransportProxy,
    owner: Arc<dyn ConnectionOwner>,
    options: ChannelOptions,
    connected: Arc<AtomicBool>,
    mailbox: PriorityActorRef<Message>,
}

type Outbound = mpsc::UnboundedSender<QueryProviderOutbound>;

impl Receiver {
    fn tell_self(&self, message: Message) {
        if let Err(e) = self.mailbox.tell(message) {
            log::debug!("query({}): {}", self.context, e);
        }
    }

    fn write(&self, tx: &Outbound, instruction_id: String, request: QueryProviderOutboundRequest) {
        if tx
            .send(QueryProviderOutbound {
                instruction_id,
                request,
            })
            .is_err()
        {
            log::warn!("query({}): unable to write: stream is closed", self.context);
        }
    }

    fn flow_control(&self, permits: i64) -> QueryProviderOutboundRequest {
        QueryProviderOutboundRequest::FlowControl(FlowControl {
            client_id: self.client_identity.client_instance_id.to_string(),
            permits,
        })
    }

    fn consumed(&self, state: &mut State, tx: &Outbound) {
        if state.permits.increment() {
            self.write(tx, String::new(), self.flow_control(self.options.permits.batch().get()));
        }
    }

    fn subscription(&self, message_id: &InstructionId, definition: &QueryDefinition) -> QuerySubscription {
        QuerySubscription {
            message_id: message_id.to_string(),
            query: definition.query_name().to_string(),
            result_name: definition.result_name().to_string(),
            component_name: self.client_identity.component_name.to_string(),
            client_id: self.client_identity.client_instance_id.to_string(),
        }
    }

    fn open_stream(&self) {
        let transport = self.transport.clone();
        let mailbox = self.mailbox.clone();
        let cancel = self.mailbox.cancellation().clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = transport.open_query_stream() => {
                    let _ = mailbox.tell(Message::StreamOpened(result));
                }
            }
        });
    }

    fn connect_stream(&self, state: &mut State, stream: QueryStream) -> Phase {
        state.generation += 1;
        let generation = state.generation;
        state.permits.reset();
        self.write(&stream.tx, String::new(), self.flow_control(self.options.permits.get()));

        for (instruction_id, subscription) in state.subscriptions.resubscribe_active() {
            let request = QueryProviderOutboundRequest::Subscribe(
                self.subscription(&instruction_id, &subscription.subject),
            );
            self.write(&stream.tx, instruction_id.to_string(), request);
        }

        let mailbox = self.mailbox.clone();
        let pump = Pump::spawn(stream.rx, self.mailbox.cancellation(), move |frame| {
            mailbox.tell(Message::Received { generation, frame }).is_ok()
        });
        log::info!("query({}): opened query stream", self.context);
        Phase::Connected {
            tx: stream.tx,
            _pump: pump,
        }
    }

    fn receive_frame(&self, state: &mut State, tx: &Outbound, frame: QueryProviderInbound) {
        match frame.request {
            QueryProviderInboundRequest::Ack(ack) => {
                if let outcome @ (Acknowledged::SubscribeRejected(_) | Acknowledged::UnsubscribeRejected(_)) =
                    state.subscriptions.acknowledge(&ack)
                {
                    log::warn!("query({}): {:?}: {:?}", self.context, outcome, ack.error);
                }
                self.consumed(state, tx);
            }
            QueryProviderInboundRequest::Query(request) => {
                let handler = state.subscriptions.active_handler(&request.query).cloned();
                let acknowledgement = match handler {
                    Some(_) => InstructionAck::success(frame.instruction_id.clone()),
                    None => InstructionAck::failure(frame.instruction_id.clone(), ErrorMessage::default()),
                };
                if !frame.instruction_id.is_empty() {
                    self.write(tx, String::new(), QueryProviderOutboundRequest::Ack(acknowledgement));
                }
                match handler {
                    Some(handler) => {
                        state.in_flight.insert(request.message_identifier.clone());
                        self.run_handler(handler, request);
                    }
                    None => {
                        let response = QueryResponse {
                            message_identifier: MessageId::new().to_string(),
                            request_identifier: request.message_identifier,
                            error_code: ErrorCategory::NoHandlerForQuery.code().to_string(),
                            error_message: Some(ErrorMessage {
                                message: "No handler for query".to_string(),
                                ..ErrorMessage::default()
                            }),
                            ..QueryResponse::default()
                        };
                        self.write(tx, String::new(), QueryProviderOutboundRequest::QueryResponse(response));
                        self.consumed(state, tx);
                    }
                }
            }
        }
    }

    fn run_handler(&self, handler: RegisteredQueryHandler, request: QueryRequest) {
        let responses = QueryResponseChannel {
            request_id: request.message_identifier.clone(),
            mailbox: self.mailbox.clone(),
            completed: AtomicBool::new(false),
        };
        let cancel = self.mailbox.cancellation().clone();
        let context = self.context.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return,
                outcome = handler.handler.handle(request, &responses) => outcome,
            };
            let finished = match outcome {
                Ok(()) => responses.complete(),
                Err(e) if !responses.is_completed() => responses.complete_with_error(
                    ErrorCategory::QueryExecutionError,
                    ErrorMessage {
                        message: e.to_string(),
                        location: "Client".to_string(),
                        details: vec![format!("{e:?}")],
                        ..ErrorMessage::default()
                    },
                ),
                Err(e) => {
                    log::warn!(
                        "query({}): handler failed after completing {}: {}",
                        context,
                        responses.request_id,
                        e
                    );
                    Ok(())
                }
            };
            if let Err(e) = finished {
                log::debug!("query({}): dropped replies to {}: {}", context, responses.request_id, e);
            }
        });
    }

    fn schedule_purge(&self) {
        if let Err(e) = self.mailbox.schedule(Message::Purge, self.options.purge_interval) {
            log::debug!("query({}): could not schedule purge: {}", self.context, e);
        }
    }

    fn fault(&self, source: &mut CountdownCompletionSource, action: &str) {
        source.fault(
            PlatformError::new(
                self.client_identity.clone(),
                ErrorCategory::Other,
                format!("Unable to {action} queries and handler: no connection to AxonServer"),
            )
            .into(),
        );
    }
}

#[async_trait]
impl Receive<Message, State> for Receiver {
    async fn receive(&self, message: Message, mut state: State) -> State {
        let phase = std::mem::replace(&mut state.phase, Phase::Disconnected);
        let next = match (message, phase) {
            (Message::Connect, Phase::Disconnected | Phase::Faulted) => {
                self.tell_self(Message::OpenStream);
                Phase::Opening {
                    reconnecting: false,
                    deferred: Vec::new(),
                }
            }

            (Message::Reconnect, Phase::Disconnected | Phase::Faulted | Phase::Connected { .. }) => {
                self.connected.store(false, Ordering::Release);
                self.tell_self(Message::OpenStream);
                Phase::Opening {
                    reconnecting: true,
                    deferred: Vec::new(),
                }
            }

            (Message::Connect, phase @ Phase::Connected { .. })
            | (Message::Connect | Message::Reconnect, phase @ Phase::Opening { .. }) => {
                log::debug!("query({}): stream is already opening or open", self.context);
                phase
            }

            (Message::Disconnect, _) => {
                self.connected.store(false, Ordering::Release);
                Phase::Disconnected
            }

            (Message::OpenStream, phase @ Phase::Opening { .. }) => {
                self.open_stream();
                phase
            }

            (Message::StreamOpened(Ok(stream)), Phase::Opening { deferred, .. }) => {
                let connected = self.connect_stream(&mut state, stream);
                self.connected.store(true, Ordering::Release);
                for message in deferred {
                    self.tell_self(message);
                }
                self.owner.check_readiness();
                connected
            }

            (Message::StreamOpened(Err(e)), phase @ Phase::Opening { .. }) => {
                let due = ScheduleDue::from_error(&e);
                log::warn!("query({}): could not open query stream: {}, retrying in {:?}", self.context, e, due);
                if let Err(e) = self.mailbox.schedule(Message::OpenStream, due) {
                    log::debug!("query({}): {}", self.context, e);
                }
                phase
            }

            (Message::Received { generation, frame }, Phase::Connected { tx, _pump })
                if generation == state.generation =>
            {
                match frame {
                    Ok(frame) => {
                        self.receive_frame(&mut state, &tx, frame);
                        Phase::Connected { tx, _pump }
                    }
                    Err(e) if e.requires_reconnect() => {
                        self.connected.store(false, Ordering::Release);
                        log::warn!("query({}): stream failed: {}, reconnecting", self.context, e);
                        self.owner.reconnect();
                        Phase::Faulted
                    }
                    Err(e) => {
                        self.connected.store(false, Ordering::Release);
                        log::error!(
                            "query({}): {} remains unhandled and did not cause a reconnect",
                            self.context,
                            e
                        );
                        Phase::Faulted
                    }
                }
            }

            (
                Message::Subscribe {
                    handler_id,
                    handler,
                    queries,
                    source,
                },
                Phase::Connected { tx, _pump },
            ) => {
                state.subscriptions.register_handler(handler_id.clone(), source, handler);
                for (subscription_id, definition) in queries {
                    if let Some(instruction_id) =
                        state
                            .subscriptions
                            .subscribe_to(subscription_id, handler_id.clone(), definition.clone())
                    {
                        log::info!("query({}): registered handler for query '{}'", self.context, definition);
                        let request =
                            QueryProviderOutboundRequest::Subscribe(self.subscription(&instruction_id, &definition));
                        self.write(&tx, instruction_id.to_string(), request);
                    }
                }
                Phase::Connected { tx, _pump }
            }

            (
                Message::Unsubscribe {
                    handler_id,
                    queries,
                    source,
                },
                Phase::Connected { tx, _pump },
            ) => {
                state.subscriptions.unregister_handler(&handler_id, source);
                for (subscription_id, definition) in queries {
                    match state.subscriptions.unsubscribe_from(&subscription_id) {
                        Some(Unsubscribe::Instruction(instruction_id)) => {
                            log::info!(
                                "query({}): unregistered handler for query '{}'",
                                self.context,
                                definition
                            );
                            let request = QueryProviderOutboundRequest::Unsubscribe(
                                self.subscription(&instruction_id, &definition),
                            );
                            self.write(&tx, instruction_id.to_string(), request);
                        }
                        Some(Unsubscribe::NotActive) => {}
                        None => state.subscriptions.unsubscribe_unknown(&handler_id),
                    }
                }
                Phase::Connected { tx, _pump }
            }

            (
                message @ (Message::Subscribe { .. } | Message::Unsubscribe { .. }),
                Phase::Opening {
                    reconnecting,
                    mut deferred,
                },
            ) => {
                deferred.push(message);
                Phase::Opening {
                    reconnecting,
                    deferred,
                }
            }

            (Message::Subscribe { mut source, .. }, phase) => {
                self.fault(&mut source, "subscribe");
                phase
            }

            (Message::Unsubscribe { mut source, .. }, phase) => {
                self.fault(&mut source, "unsubscribe");
                phase
            }

            (Message::Reply { request_id, request }, Phase::Connected { tx, _pump }) => {
                if state.in_flight.contains(&request_id) {
                    let last = matches!(request, QueryProviderOutboundRequest::QueryComplete(_));
                    self.write(&tx, String::new(), request);
                    if last {
                        state.in_flight.remove(&request_id);
                        self.consumed(&mut state, &tx);
                    }
                }
                Phase::Connected { tx, _pump }
            }

            (Message::Reply { request_id, request }, phase) => {
                if matches!(request, QueryProviderOutboundRequest::QueryComplete(_)) {
                    state.in_flight.remove(&request_id);
                }
                log::debug!("query({}): dropped reply to {}: no query stream", self.context, request_id);
                phase
            }

            (Message::Purge, phase) => {
                let purged = state.subscriptions.purge(self.options.purge_age);
                if !purged.is_empty() {
                    log::info!(
                        "query({}): purged {} unacknowledged subscription instructions",
                        self.context,
                        purged.len()
                    );
                }
                self.schedule_purge();
                phase
            }

            (message, phase) => {
                log::warn!("query({}): skipped {:?} in {:?}", self.context, message, phase);
                phase
            }
        };
        state.phase = next;
        state
    }
}

/// Query stream of one connection plus query dispatch.
pub struct QueryChannel {
    actor: PriorityActor<Message, State>,
    client_identity: ClientIdentity,
    transport: TransportProxy,
    connected: Arc<AtomicBool>,
}

impl QueryChannel {
    pub(crate) fn new(
        context: Context,
        client_identity: ClientIdentity,
        transport: TransportProxy,
        owner: Arc<dyn ConnectionOwner>,
        options: ChannelOptions,
        scheduler: &Scheduler,
    ) -> Self {
        let (mailbox, inbox) = priority_mailbox("query-channel", scheduler);
        let connected = Arc::new(AtomicBool::new(false));
        let receiver = Receiver {
            context,
            client_identity: client_identity.clone(),
            transport: transport.clone(),
            owner,
            options,
            connected: connected.clone(),
            mailbox: mailbox.clone(),
        };
        receiver.schedule_purge();
        let initial = State {
            phase: Phase::Disconnected,
            generation: 0,
            subscriptions: QuerySubscriptions::new(client_identity.clone()),
            permits: PermitController::new(options.permits.batch()),
            in_flight: HashSet::new(),
        };
        Self {
            actor: PriorityActor::spawn(mailbox, inbox, receiver, initial),
            client_identity,
            transport,
            connected,
        }
    }

    pub(crate) fn connect(&self) -> Result<()> {
        self.actor.tell(Message::Connect)
    }

    pub(crate) fn reconnect(&self) -> Result<()> {
        self.actor.tell(Message::Reconnect)
    }

    pub(crate) fn disconnect(&self) -> Result<()> {
        self.actor.tell(Message::Disconnect)
    }

    pub fn register_query_handler(
        &self,
        handler: Arc<dyn QueryHandler>,
        queries: Vec<QueryDefinition>,
    ) -> Result<QueryHandlerRegistration> {
        if queries.is_empty() {
            return Err(ConnectorError::invalid_argument("at least one query is required"));
        }
        let handler_id = QueryHandlerId::new();
        let subjects: Subjects = queries.into_iter().map(|q| (SubscriptionId::new(), q)).collect();
        let source = CountdownCompletionSource::new(subjects.len())?;
        let subscribed = source.completion();
        self.actor.tell(Message::Subscribe {
            handler_id: handler_id.clone(),
            handler: RegisteredQueryHandler { handler },
            queries: subjects.clone(),
            source,
        })?;

        let count = subjects.len();
        let mailbox = self.actor.mailbox();
        Ok(HandlerRegistration::new(
            subscribed,
            count,
            Box::new(move |source| {
                mailbox.tell(Message::Unsubscribe {
                    handler_id: handler_id.clone(),
                    queries: subjects.clone(),
                    source,
                })
            }),
        ))
    }

    /// Dispatches `request` and returns its responses as they arrive.
    pub async fn query(&self, mut request: QueryRequest) -> Result<QueryResponses> {
        request.client_id = self.client_identity.client_instance_id.to_string();
        request.component_name = self.client_identity.component_name.to_string();
        if request.message_identifier.is_empty() {
            request.message_identifier = MessageId::new().to_string();
        }
        let rx = self
            .transport
            .query(request)
            .await
            .map_err(|e| dispatch_error(&self.client_identity, e))?;
        Ok(QueryResponses {
            client_identity: self.client_identity.clone(),
            rx,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn view(&self) -> QueryChannelView {
        self.actor.state()
    }

    pub fn watch(&self) -> tokio::sync::watch::Receiver<QueryChannelView> {
        self.actor.watch()
    }

    pub async fn dispose(&self) {
        self.actor.dispose().await;
        self.connected.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow_control::PermitCount;
    use crate::testing::{
        fake_transport, identity, init_logging, proxy_to, unavailable_transport, FakeTransport, Peers,
        QueryPeer, RecordingOwner,
    };
    use crate::transport::SharedTransport;
    use crate::wire::SerializedObject;
    use std::time::Duration;
    use tokio::sync::watch;

    struct Harness {
        channel: QueryChannel,
        owner: Arc<RecordingOwner>,
        peers: Peers,
        scheduler: Scheduler,
        _current: watch::Sender<Option<SharedTransport>>,
    }

    fn harness_with((transport, peers): (Arc<FakeTransport>, Peers)) -> Harness {
        init_logging();
        let scheduler = Scheduler::default();
        let (current, proxy) = proxy_to(transport);
        let owner = Arc::new(RecordingOwner::default());
        let options = ChannelOptions {
            permits: PermitCount::MINIMUM,
            purge_interval: Duration::from_secs(1),
            purge_age: Duration::from_secs(5),
        };
        let channel = QueryChannel::new(Context::default(), identity(), proxy, owner.clone(), options, &scheduler);
        Harness {
            channel,
            owner,
            peers,
            scheduler,
            _current: current,
        }
    }

    async fn connected(h: &mut Harness) -> QueryPeer {
        h.channel.connect().expect("connect");
        let mut peer = h.peers.query.recv().await.expect("query stream");
        let permits = peer.rx.recv().await.expect("permits");
        assert!(matches!(
            permits.request,
            QueryProviderOutboundRequest::FlowControl(FlowControl { permits: 16, .. })
        ));
        h.owner.wait_for(|owner| owner.readiness_checks() == 1).await;
        peer
    }

    async fn dispose(h: Harness) {
        h.channel.dispose().await;
        h.scheduler.dispose().await;
    }

    /// Answers with one response per word of the payload.
    struct Words;

    #[async_trait]
    impl QueryHandler for Words {
        async fn handle(&self, request: QueryRequest, responses: &QueryResponseChannel) -> Result<()> {
            let text = String::from_utf8_lossy(&request.payload.data).to_string();
            for word in text.split_whitespace() {
                responses.send(QueryResponse {
                    payload: Some(SerializedObject::new("text", word.as_bytes().to_vec())),
                    ..QueryResponse::default()
                })?;
            }
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl QueryHandler for Failing {
        async fn handle(&self, _request: QueryRequest, _responses: &QueryResponseChannel) -> Result<()> {
            Err(ConnectorError::invalid_argument("no such customer"))
        }
    }

    fn definition() -> QueryDefinition {
        QueryDefinition::new("words", "text").expect("definition")
    }

    async fn subscribed(h: &Harness, peer: &mut QueryPeer, handler: Arc<dyn QueryHandler>) -> QueryHandlerRegistration {
        let registration = h
            .channel
            .register_query_handler(handler, vec![definition()])
            .expect("register");
        let subscribe = peer.rx.recv().await.expect("subscribe");
        match &subscribe.request {
            QueryProviderOutboundRequest::Subscribe(subscription) => {
                assert_eq!(subscription.query, "words");
                assert_eq!(subscription.result_name, "text");
                assert_eq!(subscription.component_name, "unit-tests");
            }
            other => panic!("expected subscribe, got {other:?}"),
        }
        peer.tx
            .send(Ok(QueryProviderInbound {
                instruction_id: String::new(),
                request: QueryProviderInboundRequest::Ack(InstructionAck::success(subscribe.instruction_id)),
            }))
            .expect("ack");
        registration.wait_until_completed().await.expect("subscribed");
        registration
    }

    fn query(name: &str, text: &str) -> QueryProviderInbound {
        QueryProviderInbound {
            instruction_id: InstructionId::new().to_string(),
            request: QueryProviderInboundRequest::Query(QueryRequest {
                message_identifier: MessageId::new().to_string(),
                query: name.to_string(),
                payload: SerializedObject::new("text", text.as_bytes().to_vec()),
                ..QueryRequest::default()
            }),
        }
    }

    #[tokio::test]
    async fn responses_are_followed_by_a_completion() {
        let mut h = harness_with(fake_transport());
        let mut peer = connected(&mut h).await;
        let _registration = subscribed(&h, &mut peer, Arc::new(Words)).await;

        let inbound = query("words", "red green");
        let QueryProviderInboundRequest::Query(request) = &inbound.request else {
            unreachable!()
        };
        let request_id = request.message_identifier.clone();
        peer.tx.send(Ok(inbound)).expect("query");

        let ack = peer.rx.recv().await.expect("ack");
        assert!(matches!(ack.request, QueryProviderOutboundRequest::Ack(ref a) if a.success));
        let mut words = Vec::new();
        loop {
            let outbound = peer.rx.recv().await.expect("reply");
            match outbound.request {
                QueryProviderOutboundRequest::QueryResponse(response) => {
                    assert_eq!(response.request_identifier, request_id);
                    words.push(response.payload.expect("payload").data);
                }
                QueryProviderOutboundRequest::QueryComplete(complete) => {
                    assert_eq!(complete.request_id, request_id);
                    break;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(words, vec![b"red".to_vec(), b"green".to_vec()]);
        dispose(h).await;
    }

    #[tokio::test]
    async fn queries_without_handler_are_refused() {
        let mut h = harness_with(fake_transport());
        let mut peer = connected(&mut h).await;
        peer.tx.send(Ok(query("unknown", ""))).expect("query");

        let nack = peer.rx.recv().await.expect("nack");
        assert!(matches!(nack.request, QueryProviderOutboundRequest::Ack(ref a) if !a.success));
        let answer = peer.rx.recv().await.expect("response");
        match answer.request {
            QueryProviderOutboundRequest::QueryResponse(response) => {
                assert_eq!(response.error_code, ErrorCategory::NoHandlerForQuery.code());
            }
            other => panic!("expected a response, got {other:?}"),
        }
        dispose(h).await;
    }

    #[tokio::test]
    async fn failing_handlers_complete_with_an_execution_error() {
        let mut h = harness_with(fake_transport());
        let mut peer = connected(&mut h).await;
        let _registration = subscribed(&h, &mut peer, Arc::new(Failing)).await;
        peer.tx.send(Ok(query("words", "x"))).expect("query");

        let _ack = peer.rx.recv().await.expect("ack");
        let error = peer.rx.recv().await.expect("error response");
        match error.request {
            QueryProviderOutboundRequest::QueryResponse(response) => {
                assert_eq!(response.error_code, ErrorCategory::QueryExecutionError.code());
                let message = response.error_message.expect("error message");
                assert!(message.message.contains("no such customer"));
            }
            other => panic!("expected a response, got {other:?}"),
        }
        let complete = peer.rx.recv().await.expect("completion");
        assert!(matches!(complete.request, QueryProviderOutboundRequest::QueryComplete(_)));
        dispose(h).await;
    }

    #[tokio::test]
    async fn registering_while_disconnected_faults() {
        let h = harness_with(fake_transport());
        let registration = h
            .channel
            .register_query_handler(Arc::new(Words), vec![definition()])
            .expect("register");
        let error = registration.wait_until_completed().await.expect_err("no stream");
        assert!(error.to_string().contains("no connection to AxonServer"));
        dispose(h).await;
    }

    #[tokio::test]
    async fn registrations_made_while_connecting_are_sent_once_open() {
        let mut h = harness_with(fake_transport());
        h.channel.connect().expect("connect");
        let registration = h
            .channel
            .register_query_handler(Arc::new(Words), vec![definition()])
            .expect("register");
        let mut peer = h.peers.query.recv().await.expect("stream");
        let _permits = peer.rx.recv().await.expect("permits");
        let subscribe = peer.rx.recv().await.expect("subscribe");
        assert!(matches!(subscribe.request, QueryProviderOutboundRequest::Subscribe(_)));
        assert!(!registration.is_completed());
        dispose(h).await;
    }

    #[tokio::test]
    async fn query_collects_every_response() {
        let h = harness_with(fake_transport());
        let responses = h
            .channel
            .query(QueryRequest {
                query: "words".into(),
                payload: SerializedObject::new("text", b"hi".to_vec()),
                ..QueryRequest::default()
            })
            .await
            .expect("dispatched")
            .collect()
            .await
            .expect("responses");
        assert_eq!(responses.len(), 1);
        assert!(!responses[0].request_identifier.is_empty());
        dispose(h).await;
    }

    #[tokio::test]
    async fn failed_dispatch_is_a_query_dispatch_error() {
        let h = harness_with(unavailable_transport());
        let error = h
            .channel
            .query(QueryRequest::default())
            .await
            .err()
            .expect("unavailable");
        assert_eq!(error.category(), ErrorCategory::QueryDispatchError);
        dispose(h).await;
    }

    #[tokio::test]
    async fn sending_after_completion_is_rejected() {
        let scheduler = Scheduler::default();
        let (mailbox, _inbox) = priority_mailbox::<Message>("query-channel", &scheduler);
        let responses = QueryResponseChannel {
            request_id: "q-1".into(),
            mailbox,
            completed: AtomicBool::new(false),
        };
        responses.complete().expect("complete");
        responses.complete().expect("second complete is a no-op");
        assert!(responses.send(QueryResponse::default()).is_err());
        scheduler.dispose().await;
    }
}
