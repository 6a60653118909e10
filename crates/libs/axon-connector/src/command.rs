//! Command handling and dispatch.
//!
//! Handlers subscribe per command name over the command stream. Inbound
//! commands are acknowledged, run on their own task and answered through the
//! channel, which refills the platform's permits every quarter of the
//! configured capacity. Outbound commands are unary calls that bypass the
//! stream.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::actor::{mailbox, Actor, ActorRef, Observe, Receive};
use crate::backoff::ScheduleDue;
use crate::completion::CountdownCompletionSource;
use crate::config::ChannelOptions;
use crate::connection::ConnectionOwner;
use crate::control::ChannelStatus;
use crate::error::{ConnectorError, ErrorCategory, PlatformError, Result, TransportError};
use crate::flow_control::{ConcurrentFlowControl, PermitController};
use crate::ids::{ClientIdentity, CommandHandlerId, Context, LoadFactor, MessageId, SubscriptionId};
use crate::scheduler::Scheduler;
use crate::subscriptions::{
    Acknowledged, CommandName, CommandSubscriptions, HandlerRegistration, Unsubscribe,
};
use crate::transport::{CommandStream, PlatformTransport, Pump, TransportProxy};
use crate::wire::{
    Command, CommandProviderInbound, CommandProviderInboundRequest, CommandProviderOutbound,
    CommandProviderOutboundRequest, CommandResponse, CommandSubscription, ErrorMessage,
    FlowControl, InstructionAck,
};

pub type CommandHandlerRegistration = HandlerRegistration;

#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    async fn handle(&self, command: Command) -> Result<CommandResponse>;
}

#[async_trait]
impl<F, Fut> CommandHandler for F
where
    F: Fn(Command) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<CommandResponse>> + Send + 'static,
{
    async fn handle(&self, command: Command) -> Result<CommandResponse> {
        (self)(command).await
    }
}

/// A handler together with the load factor it subscribed with.
#[derive(Clone)]
pub struct RegisteredCommandHandler {
    handler: Arc<dyn CommandHandler>,
    load_factor: LoadFactor,
}

impl RegisteredCommandHandler {
    pub fn load_factor(&self) -> LoadFactor {
        self.load_factor
    }
}

impl fmt::Debug for RegisteredCommandHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredCommandHandler")
            .field("load_factor", &self.load_factor)
            .finish_non_exhaustive()
    }
}

type Subjects = Vec<(SubscriptionId, CommandName)>;

#[derive(Debug)]
enum Message {
    Connect,
    Reconnect,
    Disconnect,
    OpenStream,
    StreamOpened(Result<CommandStream, TransportError>),
    Received {
        generation: u64,
        frame: Result<CommandProviderInbound, TransportError>,
    },
    Subscribe {
        handler_id: CommandHandlerId,
        handler: RegisteredCommandHandler,
        commands: Subjects,
        source: CountdownCompletionSource,
    },
    Unsubscribe {
        handler_id: CommandHandlerId,
        commands: Subjects,
        source: CountdownCompletionSource,
    },
    Handled {
        request_id: String,
        response: CommandResponse,
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
        tx: mpsc::UnboundedSender<CommandProviderOutbound>,
        _pump: Pump,
    },
    Faulted,
}

#[derive(Debug)]
struct State {
    phase: Phase,
    generation: u64,
    subscriptions: CommandSubscriptions,
    permits: PermitController,
    in_flight: HashSet<String>,
}

/// Snapshot of a command channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandChannelView {
    pub status: ChannelStatus,
    /// Command names with an active subscription, sorted.
    pub active_commands: Vec<String>,
    pub pending_subscribes: usize,
    pub pending_unsubscribes: usize,
    pub in_flight: usize,
}

impl Observe for State {
    type View = CommandChannelView;

    fn observe(&self) -> CommandChannelView {
        let status = match &self.phase {
            Phase::Disconnected => ChannelStatus::Disconnected,
            Phase::Opening {
                reconnecting: false, ..
            } => ChannelStatus::Connecting,
            Phase::Opening {
                reconnecting: true, ..
            } => ChannelStatus::Reconnecting,
            Phase::Connected { .. } => ChannelStatus::Connected,
            Phase::Faulted => ChannelStatus::Faulted,
        };
        let mut active_commands: Vec<String> =
            self.subscriptions.active_handlers().keys().cloned().collect();
        active_commands.sort();
        CommandChannelView {
            status,
            active_commands,
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
    mailbox: ActorRef<Message>,
}

impl Receiver {
    fn tell_self(&self, message: Message) {
        if let Err(e) = self.mailbox.tell(message) {
            log::debug!("command({}): {}", self.context, e);
        }
    }

    fn open_stream(&self) {
        let transport = self.transport.clone();
        let mailbox = self.mailbox.clone();
        let cancel = self.mailbox.cancellation().clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = transport.open_command_stream() => {
                    let _ = mailbox.tell(Message::StreamOpened(result));
                }
            }
        });
    }

    fn write(
        &self,
        tx: &mpsc::UnboundedSender<CommandProviderOutbound>,
        instruction_id: String,
        request: CommandProviderOutboundRequest,
    ) {
        let outbound = CommandProviderOutbound {
            instruction_id,
            request,
        };
        if let Err(e) = tx.send(outbound) {
            log::warn!(
                "command({}): unable to write {:?}: stream is closed",
                self.context,
                e.0.request
            );
        }
    }

    fn flow_control(&self, permits: i64) -> CommandProviderOutboundRequest {
        CommandProviderOutboundRequest::FlowControl(FlowControl {
            client_id: self.client_identity.client_instance_id.to_string(),
            permits,
        })
    }

    fn consumed(&self, state: &mut State, tx: &mpsc::UnboundedSender<CommandProviderOutbound>) {
        if state.permits.increment() {
            let batch = self.options.permits.batch().get();
            log::debug!("command({}): requesting {} more permits", self.context, batch);
            self.write(tx, String::new(), self.flow_control(batch));
        }
    }

    fn subscription(&self, message_id: String, command: &CommandName, load_factor: i32) -> CommandSubscription {
        CommandSubscription {
            message_id,
            command: command.to_string(),
            component_name: self.client_identity.component_name.to_string(),
            client_id: self.client_identity.client_instance_id.to_string(),
            load_factor,
        }
    }

    fn no_connection(&self, message: &str) -> ConnectorError {
        PlatformError::new(self.client_identity.clone(), ErrorCategory::Other, message).into()
    }

    /// Writes the initial permits and re-subscribes what was active before.
    fn connect_stream(&self, state: &mut State, stream: CommandStream) -> Phase {
        state.generation += 1;
        let generation = state.generation;
        state.permits.reset();
        self.write(&stream.tx, String::new(), self.flow_control(self.options.permits.get()));

        for (instruction_id, subscription) in state.subscriptions.resubscribe_active() {
            let load_factor = state
                .subscriptions
                .active_handler(subscription.subject.as_str())
                .map(|h| h.load_factor.get())
                .unwrap_or(LoadFactor::DEFAULT.get());
            log::info!(
                "command({}): resubscribing handler for command '{}'",
                self.context,
                subscription.subject
            );
            let request = CommandProviderOutboundRequest::Subscribe(self.subscription(
                instruction_id.to_string(),
                &subscription.subject,
                load_factor,
            ));
            self.write(&stream.tx, instruction_id.to_string(), request);
        }

        let mailbox = self.mailbox.clone();
        let pump = Pump::spawn(stream.rx, self.mailbox.cancellation(), move |frame| {
            mailbox.tell(Message::Received { generation, frame }).is_ok()
        });
        log::info!("command({}): opened command stream", self.context);
        Phase::Connected {
            tx: stream.tx,
            _pump: pump,
        }
    }

    fn subscribe(
        &self,
        state: &mut State,
        tx: &mpsc::UnboundedSender<CommandProviderOutbound>,
        handler_id: CommandHandlerId,
        handler: RegisteredCommandHandler,
        commands: Subjects,
        source: CountdownCompletionSource,
    ) {
        let load_factor = handler.load_factor.get();
        state.subscriptions.register_handler(handler_id.clone(), source, handler);
        for (subscription_id, command) in commands {
            let Some(instruction_id) =
                state
                    .subscriptions
                    .subscribe_to(subscription_id, handler_id.clone(), command.clone())
            else {
                continue;
            };
            log::info!(
                "command({}): registered handler for command '{}'",
                self.context,
                command
            );
            let request = CommandProviderOutboundRequest::Subscribe(self.subscription(
                instruction_id.to_string(),
                &command,
                load_factor,
            ));
            self.write(tx, instruction_id.to_string(), request);
        }
    }

    fn unsubscribe(
        &self,
        state: &mut State,
        tx: &mpsc::UnboundedSender<CommandProviderOutbound>,
        handler_id: CommandHandlerId,
        commands: Subjects,
        source: CountdownCompletionSource,
    ) {
        state.subscriptions.unregister_handler(&handler_id, source);
        for (subscription_id, command) in commands {
            match state.subscriptions.unsubscribe_from(&subscription_id) {
                Some(Unsubscribe::Instruction(instruction_id)) => {
                    log::info!(
                        "command({}): unregistered handler for command '{}'",
                        self.context,
                        command
                    );
                    let request = CommandProviderOutboundRequest::Unsubscribe(self.subscription(
                        instruction_id.to_string(),
                        &command,
                        0,
                    ));
                    self.write(tx, instruction_id.to_string(), request);
                }
                Some(Unsubscribe::NotActive) => {}
                None => state.subscriptions.unsubscribe_unknown(&handler_id),
            }
        }
    }

    fn receive_frame(
        &self,
        state: &mut State,
        tx: &mpsc::UnboundedSender<CommandProviderOutbound>,
        frame: CommandProviderInbound,
    ) {
        match frame.request {
            CommandProviderInboundRequest::Ack(ack) => {
                match state.subscriptions.acknowledge(&ack) {
                    Acknowledged::SubscribeRejected(id) | Acknowledged::UnsubscribeRejected(id) => {
                        log::warn!(
                            "command({}): platform rejected instruction for subscription {}: {:?}",
                            self.context,
                            id,
                            ack.error
                        )
                    }
                    outcome => log::debug!("command({}): {:?}", self.context, outcome),
                }
                self.consumed(state, tx);
            }
            CommandProviderInboundRequest::Command(command) => {
                match state.subscriptions.active_handler(&command.name).cloned() {
                    Some(handler) => {
                        if !frame.instruction_id.is_empty() {
                            self.write(
                                tx,
                                String::new(),
                                CommandProviderOutboundRequest::Ack(InstructionAck::success(
                                    frame.instruction_id,
                                )),
                            );
                        }
                        state.in_flight.insert(command.message_identifier.clone());
                        self.run_handler(handler, command);
                    }
                    None => {
                        if !frame.instruction_id.is_empty() {
                            self.write(
                                tx,
                                String::new(),
                                CommandProviderOutboundRequest::Ack(InstructionAck::failure(
                                    frame.instruction_id,
                                    ErrorMessage::default(),
                                )),
                            );
                        }
                        let response = CommandResponse {
                            message_identifier: MessageId::new().to_string(),
                            request_identifier: command.message_identifier,
                            error_code: ErrorCategory::NoHandlerForCommand.code().to_string(),
                            error_message: Some(ErrorMessage {
                                message: "No Handler for command".to_string(),
                                ..ErrorMessage::default()
                            }),
                            ..CommandResponse::default()
                        };
                        self.write(tx, String::new(), CommandProviderOutboundRequest::CommandResponse(response));
                        self.consumed(state, tx);
                    }
                }
            }
        }
    }

    fn run_handler(&self, handler: RegisteredCommandHandler, command: Command) {
        let mailbox = self.mailbox.clone();
        let cancel = self.mailbox.cancellation().clone();
        let context = self.context.clone();
        tokio::spawn(async move {
            let request_id = command.message_identifier.clone();
            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    log::debug!("command({}): handling {} was cancelled", context, request_id);
                    return;
                }
                outcome = handler.handler.handle(command) => outcome,
            };
            let mut response = match outcome {
                Ok(response) => response,
                Err(e) => CommandResponse {
                    error_code: ErrorCategory::CommandExecutionError.code().to_string(),
                    error_message: Some(ErrorMessage {
                        message: e.to_string(),
                        location: "Client".to_string(),
                        details: vec![format!("{e:?}")],
                        ..ErrorMessage::default()
                    }),
                    ..CommandResponse::default()
                },
            };
            response.request_identifier = request_id.clone();
            if response.message_identifier.is_empty() {
                response.message_identifier = MessageId::new().to_string();
            }
            if mailbox.tell(Message::Handled { request_id, response }).is_err() {
                log::debug!("command({}): dropped response, channel is closed", context);
            }
        });
    }

    fn schedule_purge(&self) {
        if let Err(e) = self.mailbox.schedule(Message::Purge, self.options.purge_interval) {
            log::debug!("command({}): could not schedule purge: {}", self.context, e);
        }
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }
}

#[async_trait]
impl Receive<Message, State> for Receiver {
    async fn receive(&self, message: Message, mut state: State) -> State {
        let phase = std::mem::replace(&mut state.phase, Phase::Disconnected);
        let next = match (message, phase) {
            (message @ (Message::Connect | Message::Reconnect), Phase::Disconnected | Phase::Faulted) => {
                self.tell_self(Message::OpenStream);
                Phase::Opening {
                    reconnecting: matches!(message, Message::Reconnect),
                    deferred: Vec::new(),
                }
            }

            (Message::Reconnect, Phase::Connected { .. }) => {
                self.set_connected(false);
                self.tell_self(Message::OpenStream);
                Phase::Opening {
                    reconnecting: true,
                    deferred: Vec::new(),
                }
            }

            (Message::Connect, phase @ Phase::Connected { .. })
            | (Message::Connect | Message::Reconnect, phase @ Phase::Opening { .. }) => {
                log::debug!("command({}): stream is already opening or open", self.context);
                phase
            }

            (Message::Disconnect, _) => {
                self.set_connected(false);
                Phase::Disconnected
            }

            (Message::OpenStream, phase @ Phase::Opening { .. }) => {
                self.open_stream();
                phase
            }

            (Message::StreamOpened(Ok(stream)), Phase::Opening { deferred, .. }) => {
                let connected = self.connect_stream(&mut state, stream);
                self.set_connected(true);
                for message in deferred {
                    self.tell_self(message);
                }
                self.owner.check_readiness();
                connected
            }

            (Message::StreamOpened(Err(e)), phase @ Phase::Opening { .. }) => {
                let due = ScheduleDue::from_error(&e);
                log::warn!(
                    "command({}): could not open command stream: {}, retrying in {:?}",
                    self.context,
                    e,
                    due
                );
                if let Err(e) = self.mailbox.schedule(Message::OpenStream, due) {
                    log::debug!("command({}): {}", self.context, e);
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
                    Err(e) => {
                        self.set_connected(false);
                        if e.requires_reconnect() {
                            log::warn!("command({}): stream failed: {}, reconnecting", self.context, e);
                            self.owner.reconnect();
                        } else {
                            log::error!(
                                "command({}): {} remains unhandled and did not cause a reconnect",
                                self.context,
                                e
                            );
                        }
                        Phase::Faulted
                    }
                }
            }

            (Message::Received { generation, .. }, phase) if generation != state.generation => {
                log::debug!("command({}): dropped frame of stream {}", self.context, generation);
                phase
            }

            (
                Message::Subscribe {
                    handler_id,
                    handler,
                    commands,
                    source,
                },
                Phase::Connected { tx, _pump },
            ) => {
                self.subscribe(&mut state, &tx, handler_id, handler, commands, source);
                Phase::Connected { tx, _pump }
            }

            (
                Message::Unsubscribe {
                    handler_id,
                    commands,
                    source,
                },
                Phase::Connected { tx, _pump },
            ) => {
                self.unsubscribe(&mut state, &tx, handler_id, commands, source);
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
                source.fault(self.no_connection(
                    "Unable to subscribe commands and handler: no connection to AxonServer",
                ));
                phase
            }

            (Message::Unsubscribe { mut source, .. }, phase) => {
                source.fault(self.no_connection(
                    "Unable to unsubscribe commands and handler: no connection to AxonServer",
                ));
                phase
            }

            (Message::Handled { request_id, response }, Phase::Connected { tx, _pump }) => {
                if state.in_flight.remove(&request_id) {
                    self.write(&tx, String::new(), CommandProviderOutboundRequest::CommandResponse(response));
                    self.consumed(&mut state, &tx);
                }
                Phase::Connected { tx, _pump }
            }

            (Message::Handled { request_id, .. }, phase) => {
                state.in_flight.remove(&request_id);
                log::debug!(
                    "command({}): dropped response to {}: no command stream",
                    self.context,
                    request_id
                );
                phase
            }

            (Message::Purge, phase) => {
                let purged = state.subscriptions.purge(self.options.purge_age);
                if !purged.is_empty() {
                    log::info!(
                        "command({}): purged {} unacknowledged subscription instructions",
                        self.context,
                        purged.len()
                    );
                }
                self.schedule_purge();
                phase
            }

            (message, phase) => {
                log::warn!("command({}): skipped {:?} in {:?}", self.context, message, phase);
                phase
            }
        };
        state.phase = next;
        state
    }
}

/// Command stream of one connection plus unary dispatch.
pub struct CommandChannel {
    actor: Actor<Message, State>,
    context: Context,
    client_identity: ClientIdentity,
    transport: TransportProxy,
    dispatch_permits: ConcurrentFlowControl,
    connected: Arc<AtomicBool>,
}

impl CommandChannel {
    pub(crate) fn new(
        context: Context,
        client_identity: ClientIdentity,
        transport: TransportProxy,
        owner: Arc<dyn ConnectionOwner>,
        options: ChannelOptions,
        scheduler: &Scheduler,
    ) -> Self {
        let (mailbox, inbox) = mailbox("command-channel", scheduler);
        let connected = Arc::new(AtomicBool::new(false));
        let receiver = Receiver {
            context: context.clone(),
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
            subscriptions: CommandSubscriptions::new(client_identity.clone()),
            permits: PermitController::new(options.permits.batch()),
            in_flight: HashSet::new(),
        };
        Self {
            actor: Actor::spawn(mailbox, inbox, receiver, initial),
            context,
            client_identity,
            transport,
            dispatch_permits: ConcurrentFlowControl::with_permits(options.permits),
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

    /// Subscribes `handler` to every name in `commands`. The registration
    /// completes once the platform acknowledged all of them.
    pub fn register_command_handler(
        &self,
        handler: Arc<dyn CommandHandler>,
        load_factor: LoadFactor,
        commands: Vec<CommandName>,
    ) -> Result<CommandHandlerRegistration> {
        if commands.is_empty() {
            return Err(ConnectorError::invalid_argument(
                "at least one command name is required",
            ));
        }
        let handler_id = CommandHandlerId::new();
        let subjects: Subjects = commands
            .into_iter()
            .map(|name| (SubscriptionId::new(), name))
            .collect();
        let source = CountdownCompletionSource::new(subjects.len())?;
        let subscribed = source.completion();
        self.actor.tell(Message::Subscribe {
            handler_id: handler_id.clone(),
            handler: RegisteredCommandHandler {
                handler,
                load_factor,
            },
            commands: subjects.clone(),
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
                    commands: subjects.clone(),
                    source,
                })
            }),
        ))
    }

    /// Dispatches `command` to whichever client handles it. An empty message
    /// identifier is generated and an empty routing key defaults to it.
    pub async fn send_command(&self, mut command: Command) -> Result<CommandResponse> {
        command.client_id = self.client_identity.client_instance_id.to_string();
        command.component_name = self.client_identity.component_name.to_string();
        if command.message_identifier.is_empty() {
            command.message_identifier = MessageId::new().to_string();
        }
        if command.routing_key.is_empty() {
            command.routing_key = command.message_identifier.clone();
        }
        log::debug!(
            "command({}): dispatching {} with message identifier {}",
            self.context,
            command.name,
            command.message_identifier
        );

        let cancel = self.actor.mailbox().cancellation().clone();
        let Some(_permit) = self.dispatch_permits.acquire(&cancel).await? else {
            return Err(ConnectorError::Closed {
                component: "command-channel",
            });
        };
        let result = self.transport.dispatch_command(command).await;

        result.map_err(|e| {
            let mut error = PlatformError::new(
                self.client_identity.clone(),
                ErrorCategory::CommandDispatchError,
                "An error occurred while attempting to dispatch a command",
            );
            error.details.push(e.to_string());
            error.into()
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn view(&self) -> CommandChannelView {
        self.actor.state()
    }

    pub fn watch(&self) -> tokio::sync::watch::Receiver<CommandChannelView> {
        self.actor.watch()
    }

    pub async fn dispose(&self) {
        self.dispatch_permits.cancel();
        self.actor.dispose().await;
        self.connected.store(false, Ordering::Release);
    }
}
