//! Fakes shared by the unit tests of the channels.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::config::ServerAddress;
use crate::connection::ConnectionOwner;
use crate::error::TransportError;
use crate::ids::{ClientIdentity, ClientInstanceId, ComponentName, Context};
use crate::transport::{
    CommandStream, Connector, ControlStream, Duplex, PeerEnd, PlatformTransport,
    QueryResponseStream, QueryStream, SharedTransport, TransportProxy,
};
use crate::wire::{
    ClientIdentification, Command, CommandProviderInbound, CommandProviderOutbound,
    CommandResponse, PlatformInbound, PlatformInfo, PlatformOutbound, QueryProviderInbound,
    QueryProviderOutbound, QueryRequest, QueryResponse,
};

pub(crate) type ControlPeer = PeerEnd<PlatformInbound, PlatformOutbound>;
pub(crate) type CommandPeer = PeerEnd<CommandProviderOutbound, CommandProviderInbound>;
pub(crate) type QueryPeer = PeerEnd<QueryProviderOutbound, QueryProviderInbound>;

pub(crate) fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
            .is_test(true)
            .try_init();
    });
}

pub(crate) fn identity() -> ClientIdentity {
    ClientIdentity::new(
        ComponentName::new("unit-tests").expect("component name"),
        ClientInstanceId::new("unit-tests-1").expect("client instance id"),
    )
}

/// Hands the platform side of every opened stream to the test.
pub(crate) struct FakeTransport {
    control: mpsc::UnboundedSender<ControlPeer>,
    command: mpsc::UnboundedSender<CommandPeer>,
    query: mpsc::UnboundedSender<QueryPeer>,
    dispatch: Dispatch,
    shutdowns: AtomicUsize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Dispatch {
    Echo,
    Unavailable,
    Stall,
}

impl FakeTransport {
    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

pub(crate) struct Peers {
    pub control: mpsc::UnboundedReceiver<ControlPeer>,
    pub command: mpsc::UnboundedReceiver<CommandPeer>,
    pub query: mpsc::UnboundedReceiver<QueryPeer>,
}

pub(crate) fn fake_transport() -> (Arc<FakeTransport>, Peers) {
    build(Dispatch::Echo)
}

/// A transport whose unary calls fail with `Unavailable`.
pub(crate) fn unavailable_transport() -> (Arc<FakeTransport>, Peers) {
    build(Dispatch::Unavailable)
}

/// A transport whose unary calls never complete.
pub(crate) fn stalled_transport() -> (Arc<FakeTransport>, Peers) {
    build(Dispatch::Stall)
}

fn build(dispatch: Dispatch) -> (Arc<FakeTransport>, Peers) {
    let (control, control_rx) = mpsc::unbounded_channel();
    let (command, command_rx) = mpsc::unbounded_channel();
    let (query, query_rx) = mpsc::unbounded_channel();
    let transport = FakeTransport {
        control,
        command,
        query,
        dispatch,
        shutdowns: AtomicUsize::new(0),
    };
    let peers = Peers {
        control: control_rx,
        command: command_rx,
        query: query_rx,
    };
    (Arc::new(transport), peers)
}

#[async_trait]
impl PlatformTransport for FakeTransport {
    async fn get_platform_server(
        &self,
        _client: &ClientIdentification,
    ) -> Result<PlatformInfo, TransportError> {
        Ok(PlatformInfo {
            same_connection: true,
            ..PlatformInfo::default()
        })
    }

    async fn open_control_stream(&self) -> Result<ControlStream, TransportError> {
        let (stream, peer) = Duplex::pair();
        self.control.send(peer).map_err(|_| TransportError::Closed)?;
        Ok(stream)
    }

    async fn open_command_stream(&self) -> Result<CommandStream, TransportError> {
        let (stream, peer) = Duplex::pair();
        self.command.send(peer).map_err(|_| TransportError::Closed)?;
        Ok(stream)
    }

    async fn open_query_stream(&self) -> Result<QueryStream, TransportError> {
        let (stream, peer) = Duplex::pair();
        self.query.send(peer).map_err(|_| TransportError::Closed)?;
        Ok(stream)
    }

    async fn dispatch_command(&self, command: Command) -> Result<CommandResponse, TransportError> {
        match self.dispatch {
            Dispatch::Echo => {}
            Dispatch::Unavailable => return Err(TransportError::unavailable("fake platform is down")),
            Dispatch::Stall => std::future::pending::<()>().await,
        }
        Ok(CommandResponse {
            request_identifier: command.message_identifier,
            payload: Some(command.payload),
            ..CommandResponse::default()
        })
    }

    async fn query(&self, query: QueryRequest) -> Result<QueryResponseStream, TransportError> {
        match self.dispatch {
            Dispatch::Echo => {}
            Dispatch::Unavailable => return Err(TransportError::unavailable("fake platform is down")),
            Dispatch::Stall => std::future::pending::<()>().await,
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(Ok(QueryResponse {
            request_identifier: query.message_identifier,
            payload: Some(query.payload),
            ..QueryResponse::default()
        }));
        Ok(rx)
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Connects to the same fake transport every time, after failing the
/// first `failures` attempts.
pub(crate) struct FakeConnector {
    transport: Arc<FakeTransport>,
    failures: AtomicUsize,
    attempts: AtomicUsize,
}

impl FakeConnector {
    pub fn new(transport: Arc<FakeTransport>, failures: usize) -> Arc<Self> {
        Arc::new(Self {
            transport,
            failures: AtomicUsize::new(failures),
            attempts: AtomicUsize::new(0),
        })
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        _address: &ServerAddress,
        _context: &Context,
        _token: Option<&str>,
    ) -> Result<SharedTransport, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::unavailable("fake node is starting"));
        }
        Ok(self.transport.clone())
    }
}

/// A proxy that always resolves to `transport`.
pub(crate) fn proxy_to(transport: SharedTransport) -> (watch::Sender<Option<SharedTransport>>, TransportProxy) {
    let (tx, rx) = watch::channel(Some(transport));
    (tx, TransportProxy::new(rx))
}

#[derive(Debug, Default)]
pub(crate) struct RecordingOwner {
    reconnects: AtomicUsize,
    readiness_checks: AtomicUsize,
    notify: tokio::sync::Notify,
}

impl RecordingOwner {
    pub fn reconnects(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }

    pub fn readiness_checks(&self) -> usize {
        self.readiness_checks.load(Ordering::SeqCst)
    }

    /// Waits until `condition` holds for this owner.
    pub async fn wait_for(&self, condition: impl Fn(&RecordingOwner) -> bool) {
        loop {
            let notified = self.notify.notified();
            if condition(self) {
                return;
            }
            notified.await;
        }
    }
}

impl ConnectionOwner for RecordingOwner {
    fn reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn check_readiness(&self) {
        self.readiness_checks.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}
