//! An in-memory stand-in for the platform.
//!
//! [`InMemoryPlatform`] implements [`Connector`] and hands out transports that
//! behave like a single platform node: it registers clients, answers
//! heartbeats, acknowledges subscriptions and routes commands and queries to
//! the client streams that subscribed to them. Outages are simulated with
//! [`InMemoryPlatform::fail`] and [`InMemoryPlatform::recover`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Once};

use async_trait::async_trait;
use axon_connector::config::ServerAddress;
use axon_connector::error::{ErrorCategory, TransportError};
use axon_connector::ids::{Context, InstructionId, MessageId};
use axon_connector::transport::{
    CommandStream, Connector, ControlStream, Duplex, PeerEnd, PlatformTransport, QueryResponseStream,
    QueryStream, SharedTransport,
};
use axon_connector::wire::{
    ClientIdentification, Command, CommandProviderInbound, CommandProviderInboundRequest,
    CommandProviderOutbound, CommandProviderOutboundRequest, CommandResponse, ErrorMessage,
    InstructionAck, NodeInfo, PlatformInbound, PlatformInboundRequest, PlatformInfo,
    PlatformOutbound, PlatformOutboundRequest, QueryProviderInbound, QueryProviderInboundRequest,
    QueryProviderOutbound, QueryProviderOutboundRequest, QueryRequest, QueryResponse,
};
use tokio::sync::{mpsc, oneshot, Notify};

/// Installs `env_logger` once for the test binary, honouring `RUST_LOG`.
pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .is_test(true)
            .try_init();
    });
}

type Inbound<T> = mpsc::UnboundedSender<Result<T, TransportError>>;

fn break_stream<T>(tx: &Inbound<T>) {
    let _ = tx.send(Err(TransportError::unavailable("platform is down")));
}

struct Route<T> {
    stream: u64,
    client_id: String,
    tx: Inbound<T>,
}

#[derive(Default)]
struct Platform {
    down: bool,
    connects: usize,
    heartbeats: usize,
    clients: HashMap<String, ClientIdentification>,
    controls: HashMap<u64, Inbound<PlatformOutbound>>,
    command_streams: HashMap<u64, Inbound<CommandProviderInbound>>,
    query_streams: HashMap<u64, Inbound<QueryProviderInbound>>,
    command_routes: HashMap<String, Vec<Route<CommandProviderInbound>>>,
    query_routes: HashMap<String, Vec<Route<QueryProviderInbound>>>,
    command_permits: HashMap<String, i64>,
    pending_commands: HashMap<String, oneshot::Sender<CommandResponse>>,
    pending_queries: HashMap<String, Inbound<QueryResponse>>,
}

impl Platform {
    fn forget_stream(&mut self, stream: u64) {
        self.controls.remove(&stream);
        self.command_streams.remove(&stream);
        self.query_streams.remove(&stream);
        for routes in self.command_routes.values_mut() {
            routes.retain(|route| route.stream != stream);
        }
        for routes in self.query_routes.values_mut() {
            routes.retain(|route| route.stream != stream);
        }
    }
}

struct Shared {
    node: ServerAddress,
    state: Mutex<Platform>,
    changed: Notify,
    streams: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Platform> {
        self.state.lock().expect("platform state poisoned")
    }

    fn update<R>(&self, f: impl FnOnce(&mut Platform) -> R) -> R {
        let outcome = f(&mut self.lock());
        self.changed.notify_waiters();
        outcome
    }

    fn unavailable(&self) -> Result<(), TransportError> {
        if self.lock().down {
            return Err(TransportError::unavailable("platform is down"));
        }
        Ok(())
    }
}

/// A single platform node held in memory. Clones share the node.
#[derive(Clone)]
pub struct InMemoryPlatform {
    shared: Arc<Shared>,
}

impl Default for InMemoryPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryPlatform {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                node: ServerAddress::localhost(),
                state: Mutex::new(Platform::default()),
                changed: Notify::new(),
                streams: AtomicU64::new(0),
            }),
        }
    }

    pub fn address(&self) -> ServerAddress {
        self.shared.node.clone()
    }

    /// Takes the node down: every open stream fails with `Unavailable` and new
    /// connections are refused until [`recover`](Self::recover).
    pub fn fail(&self) {
        log::info!("platform: going down");
        self.shared.update(|platform| {
            platform.down = true;
            for (_, tx) in platform.controls.drain() {
                break_stream(&tx);
            }
            for (_, tx) in platform.command_streams.drain() {
                break_stream(&tx);
            }
            for (_, tx) in platform.query_streams.drain() {
                break_stream(&tx);
            }
            platform.command_routes.clear();
            platform.query_routes.clear();
            platform.pending_commands.clear();
            platform.pending_queries.clear();
        });
    }

    pub fn recover(&self) {
        log::info!("platform: back up");
        self.shared.update(|platform| platform.down = false);
    }

    /// Asks every connected client to reconnect.
    pub fn request_reconnect(&self) {
        self.shared.update(|platform| {
            for tx in platform.controls.values() {
                let _ = tx.send(Ok(PlatformOutbound {
                    instruction_id: String::new(),
                    request: PlatformOutboundRequest::RequestReconnect,
                }));
            }
        });
    }

    pub fn connects(&self) -> usize {
        self.shared.lock().connects
    }

    /// Heartbeats received from clients.
    pub fn heartbeats(&self) -> usize {
        self.shared.lock().heartbeats
    }

    pub fn is_registered(&self, client_id: &str) -> bool {
        self.shared.lock().clients.contains_key(client_id)
    }

    /// Client ids currently subscribed to `command`.
    pub fn command_handlers(&self, command: &str) -> Vec<String> {
        let platform = self.shared.lock();
        platform
            .command_routes
            .get(command)
            .map(|routes| routes.iter().map(|route| route.client_id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn query_handlers(&self, query: &str) -> Vec<String> {
        let platform = self.shared.lock();
        platform
            .query_routes
            .get(query)
            .map(|routes| routes.iter().map(|route| route.client_id.clone()).collect())
            .unwrap_or_default()
    }

    /// Command permits the client granted so far.
    pub fn command_permits(&self, client_id: &str) -> i64 {
        self.shared.lock().command_permits.get(client_id).copied().unwrap_or(0)
    }

    /// Waits until `condition` holds; re-evaluated on every platform change.
    pub async fn wait_until(&self, condition: impl Fn(&InMemoryPlatform) -> bool) {
        loop {
            let changed = self.shared.changed.notified();
            if condition(self) {
                return;
            }
            changed.await;
        }
    }

    fn next_stream(&self) -> u64 {
        self.shared.streams.fetch_add(1, Ordering::Relaxed)
    }
}

#[async_trait]
impl Connector for InMemoryPlatform {
    async fn connect(
        &self,
        address: &ServerAddress,
        context: &Context,
        _token: Option<&str>,
    ) -> Result<SharedTransport, TransportError> {
        self.shared.unavailable()?;
        self.shared.update(|platform| platform.connects += 1);
        log::debug!("platform: {} connected for context {}", address, context);
        Ok(Arc::new(MemoryTransport {
            platform: self.clone(),
        }))
    }
}

/// One client connection to the in-memory node.
pub struct MemoryTransport {
    platform: InMemoryPlatform,
}

impl MemoryTransport {
    fn shared(&self) -> &Shared {
        &self.platform.shared
    }
}

fn ack(instruction_id: &str) -> Option<InstructionAck> {
    (!instruction_id.is_empty()).then(|| InstructionAck::success(instruction_id))
}

async fn serve_control(platform: InMemoryPlatform, stream: u64, mut peer: PeerEnd<PlatformInbound, PlatformOutbound>) {
    while let Some(inbound) = peer.rx.recv().await {
        match inbound.request {
            PlatformInboundRequest::Register(identification) => {
                log::debug!("platform: registered {}", identification.client_id);
                platform.shared.update(|p| {
                    p.clients.insert(identification.client_id.clone(), identification);
                });
            }
            PlatformInboundRequest::Heartbeat => {
                platform.shared.update(|p| p.heartbeats += 1);
                if let Some(ack) = ack(&inbound.instruction_id) {
                    let _ = peer.tx.send(Ok(PlatformOutbound {
                        instruction_id: String::new(),
                        request: PlatformOutboundRequest::Ack(ack),
                    }));
                }
            }
            PlatformInboundRequest::Ack(_) => {}
        }
    }
    platform.shared.update(|p| p.forget_stream(stream));
}

async fn serve_commands(
    platform: InMemoryPlatform,
    stream: u64,
    mut peer: PeerEnd<CommandProviderOutbound, CommandProviderInbound>,
) {
    while let Some(outbound) = peer.rx.recv().await {
        let reply = match outbound.request {
            CommandProviderOutboundRequest::Subscribe(subscription) => {
                let tx = peer.tx.clone();
                platform.shared.update(|p| {
                    let routes = p.command_routes.entry(subscription.command).or_default();
                    routes.retain(|route| route.stream != stream);
                    routes.push(Route {
                        stream,
                        client_id: subscription.client_id,
                        tx,
                    });
                });
                ack(&outbound.instruction_id)
            }
            CommandProviderOutboundRequest::Unsubscribe(subscription) => {
                platform.shared.update(|p| {
                    if let Some(routes) = p.command_routes.get_mut(&subscription.command) {
                        routes.retain(|route| route.stream != stream);
                    }
                });
                ack(&outbound.instruction_id)
            }
            CommandProviderOutboundRequest::FlowControl(flow) => {
                platform.shared.update(|p| {
                    *p.command_permits.entry(flow.client_id).or_default() += flow.permits;
                });
                None
            }
            CommandProviderOutboundRequest::CommandResponse(response) => {
                let waiter = platform.shared.update(|p| p.pending_commands.remove(&response.request_identifier));
                if let Some(waiter) = waiter {
                    let _ = waiter.send(response);
                }
                None
            }
            CommandProviderOutboundRequest::Ack(_) => None,
        };
        if let Some(ack) = reply {
            let _ = peer.tx.send(Ok(CommandProviderInbound {
                instruction_id: String::new(),
                request: CommandProviderInboundRequest::Ack(ack),
            }));
        }
    }
    platform.shared.update(|p| p.forget_stream(stream));
}

async fn serve_queries(
    platform: InMemoryPlatform,
    stream: u64,
    mut peer: PeerEnd<QueryProviderOutbound, QueryProviderInbound>,
) {
    while let Some(outbound) = peer.rx.recv().await {
        let reply = match outbound.request {
            QueryProviderOutboundRequest::Subscribe(subscription) => {
                let tx = peer.tx.clone();
                platform.shared.update(|p| {
                    let routes = p.query_routes.entry(subscription.query).or_default();
                    routes.retain(|route| route.stream != stream);
                    routes.push(Route {
                        stream,
                        client_id: subscription.client_id,
                        tx,
                    });
                });
                ack(&outbound.instruction_id)
            }
            QueryProviderOutboundRequest::Unsubscribe(subscription) => {
                platform.shared.update(|p| {
                    if let Some(routes) = p.query_routes.get_mut(&subscription.query) {
                        routes.retain(|route| route.stream != stream);
                    }
                });
                ack(&outbound.instruction_id)
            }
            QueryProviderOutboundRequest::QueryResponse(response) => {
                let shared = platform.shared.lock();
                if let Some(tx) = shared.pending_queries.get(&response.request_identifier) {
                    let _ = tx.send(Ok(response));
                }
                None
            }
            QueryProviderOutboundRequest::QueryComplete(complete) => {
                platform.shared.update(|p| p.pending_queries.remove(&complete.request_id));
                None
            }
            QueryProviderOutboundRequest::FlowControl(_) | QueryProviderOutboundRequest::Ack(_) => None,
        };
        if let Some(ack) = reply {
            let _ = peer.tx.send(Ok(QueryProviderInbound {
                instruction_id: String::new(),
                request: QueryProviderInboundRequest::Ack(ack),
            }));
        }
    }
    platform.shared.update(|p| p.forget_stream(stream));
}

fn no_handler(category: ErrorCategory, message: &str) -> (String, Option<ErrorMessage>) {
    (
        category.code().to_string(),
        Some(ErrorMessage {
            message: message.to_string(),
            location: "platform".to_string(),
            ..ErrorMessage::default()
        }),
    )
}

#[async_trait]
impl PlatformTransport for MemoryTransport {
    async fn get_platform_server(
        &self,
        _client: &ClientIdentification,
    ) -> Result<PlatformInfo, TransportError> {
        self.shared().unavailable()?;
        let node = &self.shared().node;
        Ok(PlatformInfo {
            primary: NodeInfo {
                host_name: node.host().to_string(),
                grpc_port: node.port(),
                node_name: "in-memory".to_string(),
            },
            same_connection: true,
        })
    }

    async fn open_control_stream(&self) -> Result<ControlStream, TransportError> {
        self.shared().unavailable()?;
        let (stream, peer) = Duplex::pair();
        let id = self.platform.next_stream();
        self.shared().update(|p| p.controls.insert(id, peer.tx.clone()));
        tokio::spawn(serve_control(self.platform.clone(), id, peer));
        Ok(stream)
    }

    async fn open_command_stream(&self) -> Result<CommandStream, TransportError> {
        self.shared().unavailable()?;
        let (stream, peer) = Duplex::pair();
        let id = self.platform.next_stream();
        self.shared().update(|p| p.command_streams.insert(id, peer.tx.clone()));
        tokio::spawn(serve_commands(self.platform.clone(), id, peer));
        Ok(stream)
    }

    async fn open_query_stream(&self) -> Result<QueryStream, TransportError> {
        self.shared().unavailable()?;
        let (stream, peer) = Duplex::pair();
        let id = self.platform.next_stream();
        self.shared().update(|p| p.query_streams.insert(id, peer.tx.clone()));
        tokio::spawn(serve_queries(self.platform.clone(), id, peer));
        Ok(stream)
    }

    async fn dispatch_command(&self, command: Command) -> Result<CommandResponse, TransportError> {
        self.shared().unavailable()?;
        let (reply, response) = oneshot::channel();
        let request_id = command.message_identifier.clone();
        let routed = self.shared().update(|p| {
            let route = p.command_routes.get(&command.name).and_then(|routes| routes.first())?;
            let tx = route.tx.clone();
            p.pending_commands.insert(request_id.clone(), reply);
            Some(tx)
        });
        let Some(tx) = routed else {
            let (error_code, error_message) =
                no_handler(ErrorCategory::NoHandlerForCommand, "No Handler for command");
            return Ok(CommandResponse {
                message_identifier: MessageId::new().to_string(),
                request_identifier: request_id,
                error_code,
                error_message,
                ..CommandResponse::default()
            });
        };
        tx.send(Ok(CommandProviderInbound {
            instruction_id: InstructionId::new().to_string(),
            request: CommandProviderInboundRequest::Command(command),
        }))
        .map_err(|_| TransportError::unavailable("handler stream is gone"))?;
        response.await.map_err(|_| TransportError::unavailable("handler went away"))
    }

    async fn query(&self, query: QueryRequest) -> Result<QueryResponseStream, TransportError> {
        self.shared().unavailable()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let request_id = query.message_identifier.clone();
        let routed = self.shared().update(|p| {
            let route = p.query_routes.get(&query.query).and_then(|routes| routes.first())?;
            let handler = route.tx.clone();
            p.pending_queries.insert(request_id.clone(), tx.clone());
            Some(handler)
        });
        match routed {
            Some(handler) => {
                handler
                    .send(Ok(QueryProviderInbound {
                        instruction_id: InstructionId::new().to_string(),
                        request: QueryProviderInboundRequest::Query(query),
                    }))
                    .map_err(|_| TransportError::unavailable("handler stream is gone"))?;
            }
            None => {
                let (error_code, error_message) = no_handler(ErrorCategory::NoHandlerForQuery, "No handler for query");
                let _ = tx.send(Ok(QueryResponse {
                    message_identifier: MessageId::new().to_string(),
                    request_identifier: request_id,
                    error_code,
                    error_message,
                    ..QueryResponse::default()
                }));
            }
        }
        Ok(rx)
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        Ok(())
    }
}
