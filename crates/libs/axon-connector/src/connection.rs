//! Lifecycle of the connection to one context.
//!
//! The connection actor owns the transport. It establishes one through
//! discovery, publishes it to the channels through the transport proxy and
//! fans connect and reconnect out to the control, command and query channels.
//! Channels report back through [`ConnectionOwner`]: a broken stream asks for
//! a reconnect, an opened stream asks for a readiness check.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, watch};

use crate::actor::{mailbox, Actor, ActorRef, Observe, Receive};
use crate::backoff::BackoffPolicy;
use crate::command::{CommandChannel, CommandHandler, CommandHandlerRegistration};
use crate::config::{ConnectorOptions, ServerAddress};
use crate::control::ControlChannel;
use crate::discovery::{Discovery, Established};
use crate::error::{ConnectorError, Result};
use crate::heartbeat::HeartbeatStatus;
use crate::ids::{ClientIdentity, Context, LoadFactor};
use crate::query::{QueryChannel, QueryHandler, QueryHandlerRegistration, QueryResponses};
use crate::scheduler::Scheduler;
use crate::subscriptions::{CommandName, QueryDefinition};
use crate::transport::{Connector, SharedTransport, TransportProxy};
use crate::wire::{Command, CommandResponse, QueryRequest};

/// Callbacks the channels use to reach the connection that owns them.
pub(crate) trait ConnectionOwner: Send + Sync + 'static {
    fn reconnect(&self);
    fn check_readiness(&self);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    Ready,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(ConnectionEvent) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionView {
    pub status: ConnectionStatus,
    pub address: Option<ServerAddress>,
    pub ready: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChannelKind {
    Command,
    Query,
}

enum Message {
    Connect,
    Reconnect,
    Establish { attempt: u64 },
    Established {
        attempt: u64,
        outcome: Option<Established>,
    },
    ChannelCreated(ChannelKind),
    CheckReadiness,
    WaitUntilConnected(oneshot::Sender<()>),
    WaitUntilReady(oneshot::Sender<()>),
    AddListener(ListenerId, Listener),
    RemoveListener(ListenerId),
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => f.write_str("Connect"),
            Self::Reconnect => f.write_str("Reconnect"),
            Self::Establish { attempt } => f.debug_struct("Establish").field("attempt", attempt).finish(),
            Self::Established { attempt, outcome } => f
                .debug_struct("Established")
                .field("attempt", attempt)
                .field("outcome", outcome)
                .finish(),
            Self::ChannelCreated(kind) => f.debug_tuple("ChannelCreated").field(kind).finish(),
            Self::CheckReadiness => f.write_str("CheckReadiness"),
            Self::WaitUntilConnected(_) => f.write_str("WaitUntilConnected"),
            Self::WaitUntilReady(_) => f.write_str("WaitUntilReady"),
            Self::AddListener(id, _) => f.debug_tuple("AddListener").field(id).finish(),
            Self::RemoveListener(id) => f.debug_tuple("RemoveListener").field(id).finish(),
        }
    }
}

#[derive(Debug)]
enum Phase {
    Disconnected,
    Connecting { attempt: u64 },
    Connected { established: Established },
    Reconnecting { attempt: u64 },
}

struct State {
    phase: Phase,
    attempts: u64,
    last_address: Option<ServerAddress>,
    backoff: BackoffPolicy,
    ready: bool,
    connected_waiters: Vec<oneshot::Sender<()>>,
    ready_waiters: Vec<oneshot::Sender<()>>,
    listeners: Vec<(ListenerId, Listener)>,
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("phase", &self.phase)
            .field("attempts", &self.attempts)
            .field("ready", &self.ready)
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}

impl State {
    fn emit(&self, event: ConnectionEvent) {
        for (_, listener) in &self.listeners {
            listener(event);
        }
    }

    fn next_attempt(&mut self) -> u64 {
        self.attempts += 1;
        self.attempts
    }
}

impl Observe for State {
    type View = ConnectionView;

    fn observe(&self) -> ConnectionView {
        let (status, address) = match &self.phase {
            Phase::Disconnected => (ConnectionStatus::Disconnected, None),
            Phase::Connecting { .. } => (ConnectionStatus::Connecting, None),
            Phase::Connected { established } => {
                (ConnectionStatus::Connected, Some(established.address.clone()))
            }
            Phase::Reconnecting { .. } => (ConnectionStatus::Reconnecting, None),
        };
        ConnectionView {
            status,
            address,
            ready: self.ready,
        }
    }
}

/// The channels of a connection. Command and query channels are created on
/// first use.
struct Channels {
    control: ControlChannel,
    command: OnceLock<CommandChannel>,
    query: OnceLock<QueryChannel>,
}

impl Channels {
    fn for_each_connect(&self, context: &Context, reconnect: bool) {
        let outcomes = [
            ("control", Some(self.control_op(reconnect))),
            ("command", self.command.get().map(|c| if reconnect { c.reconnect() } else { c.connect() })),
            ("query", self.query.get().map(|c| if reconnect { c.reconnect() } else { c.connect() })),
        ];
        for (name, outcome) in outcomes {
            if let Some(Err(e)) = outcome {
                log::warn!("connection({}): could not connect the {} channel: {}", context, name, e);
            }
        }
    }

    /// Drops the streams of the old transport so that none of them reports
    /// its failure once the transport is gone.
    fn disconnect_all(&self, context: &Context) {
        let outcomes = [
            ("control", Some(self.control.disconnect())),
            ("command", self.command.get().map(CommandChannel::disconnect)),
            ("query", self.query.get().map(QueryChannel::disconnect)),
        ];
        for (name, outcome) in outcomes {
            if let Some(Err(e)) = outcome {
                log::debug!("connection({}): could not disconnect the {} channel: {}", context, name, e);
            }
        }
    }

    fn control_op(&self, reconnect: bool) -> Result<()> {
        if reconnect {
            self.control.reconnect()
        } else {
            self.control.connect()
        }
    }

    fn connect(&self, kind: ChannelKind) -> Option<Result<()>> {
        match kind {
            ChannelKind::Command => self.command.get().map(CommandChannel::connect),
            ChannelKind::Query => self.query.get().map(QueryChannel::connect),
        }
    }

    fn all_connected(&self) -> bool {
        self.control.is_connected()
            && self.command.get().map_or(true, CommandChannel::is_connected)
            && self.query.get().map_or(true, QueryChannel::is_connected)
    }
}

struct Receiver {
    context: Context,
    connector: Arc<dyn Connector>,
    discovery: Arc<Discovery>,
    token: Option<String>,
    connect_timeout: Duration,
    force_via_routing_servers: bool,
    current: watch::Sender<Option<SharedTransport>>,
    channels: Arc<Channels>,
    mailbox: ActorRef<Message>,
    connected: Arc<AtomicBool>,
}

impl Receiver {
    /// Runs one establishment attempt off the actor loop.
    fn establish(&self, attempt: u64, last_address: Option<ServerAddress>) {
        let connector = self.connector.clone();
        let discovery = self.discovery.clone();
        let context = self.context.clone();
        let token = self.token.clone();
        let timeout = self.connect_timeout;
        let direct = last_address.filter(|_| !self.force_via_routing_servers);
        let mailbox = self.mailbox.clone();
        let cancel = self.mailbox.cancellation().clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return,
                outcome = establish_once(&connector, &discovery, &context, token.as_deref(), timeout, direct) => outcome,
            };
            if let Err(e) = mailbox.tell(Message::Established { attempt, outcome }) {
                log::debug!("connection({}): attempt {} finished after close: {}", context, attempt, e);
            }
        });
    }

    fn release_stray(&self, established: Established) {
        let context = self.context.clone();
        tokio::spawn(async move { shut_down(&context, established).await });
    }

    fn retry(&self, state: &mut State, attempt: u64) {
        let delay = state.backoff.next();
        log::warn!(
            "connection({}): could not connect to any routing server, retrying in {:?}",
            self.context,
            delay
        );
        if let Err(e) = self.mailbox.schedule(Message::Establish { attempt }, delay) {
            log::debug!("connection({}): {}", self.context, e);
        }
    }

    fn on_established(&self, state: &mut State, established: Established, reconnecting: bool) -> Phase {
        log::info!("connection({}): connected to {}", self.context, established.address);
        state.backoff.reset();
        state.last_address = Some(established.address.clone());
        self.current.send_replace(Some(established.transport.clone()));
        self.connected.store(true, Ordering::Release);
        self.channels.for_each_connect(&self.context, reconnecting);

        state.emit(ConnectionEvent::Connected);
        for waiter in state.connected_waiters.drain(..) {
            let _ = waiter.send(());
        }
        if let Err(e) = self.mailbox.tell(Message::CheckReadiness) {
            log::debug!("connection({}): {}", self.context, e);
        }
        Phase::Connected { established }
    }
}

#[async_trait]
impl Receive<Message, State> for Receiver {
    async fn receive(&self, message: Message, mut state: State) -> State {
        let phase = std::mem::replace(&mut state.phase, Phase::Disconnected);
        let next = match (message, phase) {
            (Message::Connect, Phase::Disconnected) => {
                let attempt = state.next_attempt();
                self.establish(attempt, state.last_address.clone());
                Phase::Connecting { attempt }
            }

            (Message::Connect, phase) => {
                log::debug!("connection({}): already connecting or connected", self.context);
                phase
            }

            (Message::Reconnect, Phase::Connected { established }) => {
                log::warn!("connection({}): reconnecting to {}", self.context, established.address);
                self.current.send_replace(None);
                self.connected.store(false, Ordering::Release);
                self.channels.disconnect_all(&self.context);
                state.ready = false;
                state.emit(ConnectionEvent::Disconnected);
                self.release_stray(established);
                let attempt = state.next_attempt();
                self.establish(attempt, state.last_address.clone());
                Phase::Reconnecting { attempt }
            }

            (Message::Reconnect, phase) => {
                log::debug!("connection({}): reconnect ignored in {:?}", self.context, phase);
                phase
            }

            (Message::Establish { attempt }, Phase::Connecting { attempt: current }) if attempt == current => {
                self.establish(attempt, state.last_address.clone());
                Phase::Connecting { attempt }
            }

            (Message::Establish { attempt }, Phase::Reconnecting { attempt: current }) if attempt == current => {
                self.establish(attempt, state.last_address.clone());
                Phase::Reconnecting { attempt }
            }

            (Message::Established { attempt, outcome }, phase) => match (outcome, phase) {
                (Some(established), Phase::Connecting { attempt: current }) if attempt == current => {
                    self.on_established(&mut state, established, false)
                }
                (Some(established), Phase::Reconnecting { attempt: current }) if attempt == current => {
                    self.on_established(&mut state, established, true)
                }
                (None, Phase::Connecting { attempt: current }) if attempt == current => {
                    self.retry(&mut state, attempt);
                    Phase::Connecting { attempt }
                }
                (None, Phase::Reconnecting { attempt: current }) if attempt == current => {
                    self.retry(&mut state, attempt);
                    Phase::Reconnecting { attempt }
                }
                (Some(established), phase) => {
                    log::debug!(
                        "connection({}): releasing transport of stale attempt {}",
                        self.context,
                        attempt
                    );
                    self.release_stray(established);
                    phase
                }
                (None, phase) => phase,
            },

            (Message::ChannelCreated(kind), phase @ Phase::Connected { .. }) => {
                // Not ready again until the new channel reports its stream open.
                state.ready = false;
                if let Some(Err(e)) = self.channels.connect(kind) {
                    log::warn!("connection({}): could not connect {:?} channel: {}", self.context, kind, e);
                }
                phase
            }

            (Message::ChannelCreated(_), phase) => phase,

            (Message::CheckReadiness, phase @ Phase::Connected { .. }) => {
                let ready = self.channels.all_connected();
                if ready {
                    if !state.ready {
                        log::info!("connection({}): ready", self.context);
                        state.emit(ConnectionEvent::Ready);
                    }
                    for waiter in state.ready_waiters.drain(..) {
                        let _ = waiter.send(());
                    }
                }
                state.ready = ready;
                phase
            }

            (Message::CheckReadiness, phase) => phase,

            (Message::WaitUntilConnected(waiter), phase) => {
                if matches!(phase, Phase::Connected { .. }) {
                    let _ = waiter.send(());
                } else {
                    state.connected_waiters.push(waiter);
                }
                phase
            }

            (Message::WaitUntilReady(waiter), phase) => {
                if state.ready && self.channels.all_connected() {
                    let _ = waiter.send(());
                } else {
                    state.ready_waiters.push(waiter);
                }
                phase
            }

            (Message::AddListener(id, listener), phase) => {
                state.listeners.push((id, listener));
                phase
            }

            (Message::RemoveListener(id), phase) => {
                state.listeners.retain(|(listener_id, _)| *listener_id != id);
                phase
            }

            (message, phase) => {
                log::warn!("connection({}): skipped {:?} in {:?}", self.context, message, phase);
                phase
            }
        };
        state.phase = next;
        state
    }
}

/// Tries the last known node first when given, then the routing servers.
async fn establish_once(
    connector: &Arc<dyn Connector>,
    discovery: &Discovery,
    context: &Context,
    token: Option<&str>,
    timeout: Duration,
    direct: Option<ServerAddress>,
) -> Option<Established> {
    if let Some(address) = direct {
        log::info!("connection({}): reconnecting to last known node {}", context, address);
        match tokio::time::timeout(timeout, connector.connect(&address, context, token)).await {
            Ok(Ok(transport)) => return Some(Established { address, transport }),
            Ok(Err(e)) => log::warn!("connection({}): {} is unreachable: {}", context, address, e),
            Err(_) => log::warn!("connection({}): {} timed out after {:?}", context, address, timeout),
        }
    }
    discovery.discover(context).await
}

async fn shut_down(context: &Context, established: Established) {
    if let Err(e) = established.transport.shutdown().await {
        log::debug!(
            "connection({}): failed to shut down transport to {}: {}",
            context,
            established.address,
            e
        );
    }
}

struct Owner {
    mailbox: ActorRef<Message>,
}

impl ConnectionOwner for Owner {
    fn reconnect(&self) {
        if let Err(e) = self.mailbox.tell(Message::Reconnect) {
            log::debug!("connection: reconnect request dropped: {}", e);
        }
    }

    fn check_readiness(&self) {
        if let Err(e) = self.mailbox.tell(Message::CheckReadiness) {
            log::debug!("connection: readiness check dropped: {}", e);
        }
    }
}

/// A client connection to one context of the platform.
pub struct AxonConnection {
    actor: Actor<Message, State>,
    channels: Arc<Channels>,
    owner: Arc<Owner>,
    options: ConnectorOptions,
    client_identity: ClientIdentity,
    proxy: TransportProxy,
    current: watch::Receiver<Option<SharedTransport>>,
    scheduler: Scheduler,
    listener_ids: AtomicU64,
    connected: Arc<AtomicBool>,
    disposed: AtomicBool,
}

impl AxonConnection {
    /// Validates `options` and starts the connection actor. Nothing is
    /// connected until [`connect`](Self::connect) is called.
    pub fn new(options: ConnectorOptions, connector: Arc<dyn Connector>) -> Result<Self> {
        options.validate()?;
        let context = options.context.clone();
        let client_identity = options.client_identity();
        let scheduler = Scheduler::new(options.scheduler_tick);

        let (current_tx, current) = watch::channel(None);
        let proxy = TransportProxy::new(current.clone());
        let (mailbox, inbox) = mailbox("connection", &scheduler);
        let owner = Arc::new(Owner {
            mailbox: mailbox.clone(),
        });
        let connected = Arc::new(AtomicBool::new(false));

        let control = ControlChannel::new(
            context.clone(),
            client_identity.clone(),
            proxy.clone(),
            owner.clone(),
            options.heartbeat_purge_interval,
            &scheduler,
        );
        let channels = Arc::new(Channels {
            control,
            command: OnceLock::new(),
            query: OnceLock::new(),
        });
        let discovery = Arc::new(Discovery::new(
            connector.clone(),
            options.routing_servers.clone(),
            client_identity.clone(),
            options.authentication_token.clone(),
            options.reconnect.connect_timeout,
        ));
        let receiver = Receiver {
            context,
            connector,
            discovery,
            token: options.authentication_token.clone(),
            connect_timeout: options.reconnect.connect_timeout,
            force_via_routing_servers: options.reconnect.force_via_routing_servers,
            current: current_tx,
            channels: channels.clone(),
            mailbox: mailbox.clone(),
            connected: connected.clone(),
        };
        let initial = State {
            phase: Phase::Disconnected,
            attempts: 0,
            last_address: None,
            backoff: BackoffPolicy::new(options.reconnect.backoff),
            ready: false,
            connected_waiters: Vec::new(),
            ready_waiters: Vec::new(),
            listeners: Vec::new(),
        };

        Ok(Self {
            actor: Actor::spawn(mailbox, inbox, receiver, initial),
            channels,
            owner,
            options,
            client_identity,
            proxy,
            current,
            scheduler,
            listener_ids: AtomicU64::new(0),
            connected,
            disposed: AtomicBool::new(false),
        })
    }

    pub fn client_identity(&self) -> &ClientIdentity {
        &self.client_identity
    }

    pub fn context(&self) -> &Context {
        &self.options.context
    }

    /// Starts connecting; use [`wait_until_connected`](Self::wait_until_connected)
    /// to wait for the outcome. Configured heartbeats are enabled here.
    pub fn connect(&self) -> Result<()> {
        self.ensure_open()?;
        self.actor.tell(Message::Connect)?;
        if let Some(heartbeat) = self.options.heartbeat {
            self.channels.control.enable_heartbeat(heartbeat.interval, heartbeat.timeout)?;
        }
        Ok(())
    }

    pub async fn wait_until_connected(&self) -> Result<()> {
        let (waiter, released) = oneshot::channel();
        self.actor.tell(Message::WaitUntilConnected(waiter))?;
        released.await.map_err(|_| ConnectorError::Cancelled)
    }

    /// Resolves once the control channel and every channel in use have an
    /// open stream.
    pub async fn wait_until_ready(&self) -> Result<()> {
        let (waiter, released) = oneshot::channel();
        self.actor.tell(Message::WaitUntilReady(waiter))?;
        released.await.map_err(|_| ConnectorError::Cancelled)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Ready while connected with the control channel and every channel
    /// created so far holding an open stream.
    pub fn is_ready(&self) -> bool {
        self.connected.load(Ordering::Acquire) && self.channels.all_connected()
    }

    pub fn status(&self) -> ConnectionView {
        self.actor.state()
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionView> {
        self.actor.watch()
    }

    /// Registers a callback invoked from the connection loop on every
    /// lifecycle event.
    pub fn on_event(&self, listener: impl Fn(ConnectionEvent) + Send + Sync + 'static) -> Result<ListenerId> {
        let id = ListenerId(self.listener_ids.fetch_add(1, Ordering::Relaxed));
        self.actor.tell(Message::AddListener(id, Arc::new(listener)))?;
        Ok(id)
    }

    pub fn remove_listener(&self, id: ListenerId) -> Result<()> {
        self.actor.tell(Message::RemoveListener(id))
    }

    pub fn enable_heartbeat(&self, interval: Duration, timeout: Duration) -> Result<()> {
        self.channels.control.enable_heartbeat(interval, timeout)
    }

    pub fn disable_heartbeat(&self) -> Result<()> {
        self.channels.control.disable_heartbeat()
    }

    pub fn heartbeat_status(&self) -> HeartbeatStatus {
        self.channels.control.heartbeat_status()
    }

    pub fn control_channel(&self) -> &ControlChannel {
        &self.channels.control
    }

    pub fn command_channel(&self) -> Result<&CommandChannel> {
        self.ensure_open()?;
        let mut created = false;
        let channel = self.channels.command.get_or_init(|| {
            created = true;
            CommandChannel::new(
                self.options.context.clone(),
                self.client_identity.clone(),
                self.proxy.clone(),
                self.owner.clone(),
                self.options.command_channel(),
                &self.scheduler,
            )
        });
        if created {
            self.actor.tell(Message::ChannelCreated(ChannelKind::Command))?;
        }
        Ok(channel)
    }

    pub fn query_channel(&self) -> Result<&QueryChannel> {
        self.ensure_open()?;
        let mut created = false;
        let channel = self.channels.query.get_or_init(|| {
            created = true;
            QueryChannel::new(
                self.options.context.clone(),
                self.client_identity.clone(),
                self.proxy.clone(),
                self.owner.clone(),
                self.options.query_channel(),
                &self.scheduler,
            )
        });
        if created {
            self.actor.tell(Message::ChannelCreated(ChannelKind::Query))?;
        }
        Ok(channel)
    }

    pub fn register_command_handler(
        &self,
        handler: Arc<dyn CommandHandler>,
        load_factor: LoadFactor,
        commands: Vec<CommandName>,
    ) -> Result<CommandHandlerRegistration> {
        self.command_channel()?
            .register_command_handler(handler, load_factor, commands)
    }

    pub async fn send_command(&self, command: Command) -> Result<CommandResponse> {
        self.command_channel()?.send_command(command).await
    }

    pub fn register_query_handler(
        &self,
        handler: Arc<dyn QueryHandler>,
        queries: Vec<QueryDefinition>,
    ) -> Result<QueryHandlerRegistration> {
        self.query_channel()?.register_query_handler(handler, queries)
    }

    pub async fn query(&self, request: QueryRequest) -> Result<QueryResponses> {
        self.query_channel()?.query(request).await
    }

    fn ensure_open(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) || self.actor.is_disposed() {
            return Err(ConnectorError::Closed {
                component: "connection",
            });
        }
        Ok(())
    }

    /// Stops every channel, then the connection loop, then releases the
    /// transport. Only the first call does any work, concurrent callers
    /// included.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.channels.control.dispose().await;
        if let Some(command) = self.channels.command.get() {
            command.dispose().await;
        }
        if let Some(query) = self.channels.query.get() {
            query.dispose().await;
        }
        self.actor.dispose().await;
        self.connected.store(false, Ordering::Release);

        let transport = self.current.borrow().clone();
        if let Some(transport) = transport {
            if let Err(e) = transport.shutdown().await {
                log::debug!("connection({}): failed to shut down transport: {}", self.options.context, e);
            }
        }
        self.scheduler.dispose().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffPolicyOptions;
    use crate::config::ReconnectOptions;
    use crate::testing::{fake_transport, init_logging, FakeConnector, FakeTransport, Peers};
    use std::sync::Mutex;

    fn options() -> ConnectorOptions {
        let mut options = ConnectorOptions::new(crate::ids::ComponentName::new("unit-tests").expect("name"));
        options.set_routing_servers(vec![ServerAddress::localhost()]);
        options.set_reconnect(ReconnectOptions {
            connect_timeout: Duration::from_secs(1),
            backoff: BackoffPolicyOptions::new(Duration::from_millis(100), Duration::from_secs(1), 2.0)
                .expect("backoff"),
            force_via_routing_servers: false,
        });
        options
    }

    fn connection(failures: usize) -> (AxonConnection, Arc<FakeConnector>, Arc<FakeTransport>, Peers) {
        init_logging();
        let (transport, peers) = fake_transport();
        let connector = FakeConnector::new(transport.clone(), failures);
        let connection = AxonConnection::new(options(), connector.clone()).expect("connection");
        (connection, connector, transport, peers)
    }

    fn record(connection: &AxonConnection) -> Arc<Mutex<Vec<ConnectionEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        connection
            .on_event(move |event| sink.lock().expect("events").push(event))
            .expect("listener");
        events
    }

    #[tokio::test]
    async fn connecting_announces_the_client_and_becomes_ready() {
        let (connection, _connector, _transport, mut peers) = connection(0);
        let events = record(&connection);
        connection.connect().expect("connect");
        connection.wait_until_connected().await.expect("connected");

        let mut control = peers.control.recv().await.expect("control stream");
        let register = control.rx.recv().await.expect("register");
        assert!(matches!(
            register.request,
            crate::wire::PlatformInboundRequest::Register(ref identification)
                if identification.component_name == "unit-tests"
        ));
        connection.wait_until_ready().await.expect("ready");
        assert!(connection.is_ready());
        assert_eq!(
            *events.lock().expect("events"),
            vec![ConnectionEvent::Connected, ConnectionEvent::Ready]
        );
        connection.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_attempts_are_retried_with_backoff() {
        let (connection, connector, _transport, _peers) = connection(2);
        connection.connect().expect("connect");
        connection.wait_until_connected().await.expect("connected");
        assert_eq!(connector.attempts(), 3);
        assert_eq!(connection.status().address, Some(ServerAddress::localhost()));
        connection.dispose().await;
    }

    #[tokio::test]
    async fn broken_control_stream_reconnects_the_connection() {
        let (connection, connector, transport, mut peers) = connection(0);
        let events = record(&connection);
        connection.connect().expect("connect");
        connection.wait_until_ready().await.expect("ready");
        let first = peers.control.recv().await.expect("control stream");

        drop(first);
        let mut second = peers.control.recv().await.expect("reopened control stream");
        let register = second.rx.recv().await.expect("register");
        assert!(matches!(register.request, crate::wire::PlatformInboundRequest::Register(_)));
        connection.wait_until_ready().await.expect("ready again");

        assert_eq!(connector.attempts(), 2);
        assert!(transport.shutdowns() >= 1);
        let seen = events.lock().expect("events").clone();
        assert!(seen.starts_with(&[
            ConnectionEvent::Connected,
            ConnectionEvent::Ready,
            ConnectionEvent::Disconnected,
        ]));
        connection.dispose().await;
    }

    #[tokio::test]
    async fn channels_created_after_connecting_are_connected() {
        let (connection, _connector, _transport, mut peers) = connection(0);
        connection.connect().expect("connect");
        connection.wait_until_ready().await.expect("ready");
        let _control = peers.control.recv().await.expect("control stream");

        connection.command_channel().expect("command channel");
        let _command = peers.command.recv().await.expect("command stream");
        let mut view = connection.command_channel().expect("command channel").watch();
        view.wait_for(|view| view.status == crate::control::ChannelStatus::Connected)
            .await
            .expect("command connected");
        connection.wait_until_ready().await.expect("still ready");
        connection.dispose().await;
    }

    #[tokio::test]
    async fn new_channels_hold_back_readiness_until_connected() {
        let (connection, _connector, _transport, mut peers) = connection(0);
        let events = record(&connection);
        connection.connect().expect("connect");
        connection.wait_until_ready().await.expect("ready");
        let _control = peers.control.recv().await.expect("control stream");

        connection.query_channel().expect("query channel");
        assert!(!connection.is_ready());
        let _query = peers.query.recv().await.expect("query stream");
        connection.wait_until_ready().await.expect("ready with the query channel");
        assert!(connection.is_ready());
        assert!(connection.query_channel().expect("query channel").is_connected());
        assert_eq!(
            *events.lock().expect("events"),
            vec![
                ConnectionEvent::Connected,
                ConnectionEvent::Ready,
                ConnectionEvent::Ready
            ]
        );
        connection.dispose().await;
    }

    #[tokio::test]
    async fn disposed_connections_refuse_work() {
        let (connection, _connector, transport, _peers) = connection(0);
        connection.connect().expect("connect");
        connection.wait_until_connected().await.expect("connected");
        connection.dispose().await;
        connection.dispose().await;
        assert_eq!(transport.shutdowns(), 1);
        assert!(matches!(
            connection.command_channel(),
            Err(ConnectorError::Closed { .. })
        ));
    }

    #[tokio::test]
    async fn concurrent_disposes_shut_down_once() {
        let (connection, _connector, transport, _peers) = connection(0);
        connection.connect().expect("connect");
        connection.wait_until_connected().await.expect("connected");
        tokio::join!(connection.dispose(), connection.dispose(), connection.dispose());
        assert_eq!(transport.shutdowns(), 1);
        assert!(matches!(connection.connect(), Err(ConnectorError::Closed { .. })));
    }
}
