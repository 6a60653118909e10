//! The boundary towards the platform.
//!
//! A [`Connector`] produces a [`PlatformTransport`] per node; the transport
//! opens the bidirectional streams and performs the unary calls. Channels never
//! hold a transport directly: they go through a [`TransportProxy`], which looks
//! up whatever transport the connection currently has on every call.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::config::ServerAddress;
use crate::error::TransportError;
use crate::ids::Context;
use crate::wire::{
    ClientIdentification, Command, CommandProviderInbound, CommandProviderOutbound, CommandResponse,
    PlatformInbound, PlatformInfo, PlatformOutbound, QueryProviderInbound, QueryProviderOutbound,
    QueryRequest, QueryResponse,
};

/// Both halves of an open stream. Dropping `tx` completes the request side.
#[derive(Debug)]
pub struct Duplex<Out, In> {
    pub tx: mpsc::UnboundedSender<Out>,
    pub rx: mpsc::UnboundedReceiver<Result<In, TransportError>>,
}

impl<Out, In> Duplex<Out, In> {
    /// Creates a connected pair of stream ends.
    pub fn pair() -> (Duplex<Out, In>, PeerEnd<Out, In>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (
            Duplex { tx: out_tx, rx: in_rx },
            PeerEnd { tx: in_tx, rx: out_rx },
        )
    }
}

/// The platform's side of a [`Duplex`], used by in-process transports.
#[derive(Debug)]
pub struct PeerEnd<Out, In> {
    pub tx: mpsc::UnboundedSender<Result<In, TransportError>>,
    pub rx: mpsc::UnboundedReceiver<Out>,
}

/// Forwards the inbound half of a stream to an actor until the stream ends or
/// the pump is dropped. The end of the stream is reported as
/// [`TransportError::Closed`].
pub(crate) struct Pump {
    cancel: CancellationToken,
}

impl Pump {
    pub(crate) fn spawn<In, F>(
        mut rx: mpsc::UnboundedReceiver<Result<In, TransportError>>,
        parent: &CancellationToken,
        mut forward: F,
    ) -> Self
    where
        In: Send + 'static,
        F: FnMut(Result<In, TransportError>) -> bool + Send + 'static,
    {
        let cancel = parent.child_token();
        let stop = cancel.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    frame = rx.recv() => frame,
                };
                match frame {
                    Some(frame) => {
                        if !forward(frame) {
                            break;
                        }
                    }
                    None => {
                        forward(Err(TransportError::Closed));
                        break;
                    }
                }
            }
        });
        Self { cancel }
    }
}

impl Drop for Pump {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Pump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pump")
            .field("stopped", &self.cancel.is_cancelled())
            .finish()
    }
}

pub type ControlStream = Duplex<PlatformInbound, PlatformOutbound>;
pub type CommandStream = Duplex<CommandProviderOutbound, CommandProviderInbound>;
pub type QueryStream = Duplex<QueryProviderOutbound, QueryProviderInbound>;

/// Responses of a dispatched query, in arrival order.
pub type QueryResponseStream = mpsc::UnboundedReceiver<Result<QueryResponse, TransportError>>;

#[async_trait]
pub trait PlatformTransport: Send + Sync + 'static {
    async fn get_platform_server(
        &self,
        client: &ClientIdentification,
    ) -> Result<PlatformInfo, TransportError>;

    async fn open_control_stream(&self) -> Result<ControlStream, TransportError>;

    async fn open_command_stream(&self) -> Result<CommandStream, TransportError>;

    async fn open_query_stream(&self) -> Result<QueryStream, TransportError>;

    async fn dispatch_command(&self, command: Command) -> Result<CommandResponse, TransportError>;

    async fn query(&self, query: QueryRequest) -> Result<QueryResponseStream, TransportError>;

    async fn shutdown(&self) -> Result<(), TransportError>;
}

/// Establishes transports to platform nodes.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(
        &self,
        address: &ServerAddress,
        context: &Context,
        token: Option<&str>,
    ) -> Result<Arc<dyn PlatformTransport>, TransportError>;
}

pub type SharedTransport = Arc<dyn PlatformTransport>;

/// Forwards every call to the current transport of a connection.
#[derive(Clone)]
pub struct TransportProxy {
    current: watch::Receiver<Option<SharedTransport>>,
}

impl TransportProxy {
    pub fn new(current: watch::Receiver<Option<SharedTransport>>) -> Self {
        Self { current }
    }

    pub fn current(&self) -> Result<SharedTransport, TransportError> {
        self.current
            .borrow()
            .clone()
            .ok_or_else(|| TransportError::unavailable("no connection to AxonServer"))
    }

    pub fn is_connected(&self) -> bool {
        self.current.borrow().is_some()
    }
}

#[async_trait]
impl PlatformTransport for TransportProxy {
    async fn get_platform_server(
        &self,
        client: &ClientIdentification,
    ) -> Result<PlatformInfo, TransportError> {
        self.current()?.get_platform_server(client).await
    }

    async fn open_control_stream(&self) -> Result<ControlStream, TransportError> {
        self.current()?.open_control_stream().await
    }

    async fn open_command_stream(&self) -> Result<CommandStream, TransportError> {
        self.current()?.open_command_stream().await
    }

    async fn open_query_stream(&self) -> Result<QueryStream, TransportError> {
        self.current()?.open_query_stream().await
    }

    async fn dispatch_command(&self, command: Command) -> Result<CommandResponse, TransportError> {
        self.current()?.dispatch_command(command).await
    }

    async fn query(&self, query: QueryRequest) -> Result<QueryResponseStream, TransportError> {
        self.current()?.query(query).await
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        self.current()?.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn proxy_is_unavailable_without_a_transport() {
        let (_tx, rx) = watch::channel(None);
        let proxy = TransportProxy::new(rx);
        assert!(!proxy.is_connected());
        match proxy.open_control_stream().await {
            Err(error) => assert!(error.requires_reconnect()),
            Ok(_) => panic!("expected the proxy to be unavailable"),
        }
    }

    #[tokio::test]
    async fn duplex_pair_connects_both_ends() {
        let (client, mut server): (Duplex<u32, String>, _) = Duplex::pair();
        client.tx.send(7).expect("send");
        assert_eq!(server.rx.recv().await, Some(7));
        server.tx.send(Ok("seven".to_string())).expect("send");
        let mut client = client;
        assert_eq!(client.rx.recv().await, Some(Ok("seven".to_string())));
    }

    #[tokio::test]
    async fn pump_reports_the_end_of_the_stream() {
        let (client, server): (Duplex<u32, String>, _) = Duplex::pair();
        let (tx, mut forwarded) = mpsc::unbounded_channel();
        let _pump = Pump::spawn(client.rx, &CancellationToken::new(), move |frame| {
            tx.send(frame).is_ok()
        });
        server.tx.send(Ok("one".to_string())).expect("send");
        drop(server);
        assert_eq!(forwarded.recv().await, Some(Ok("one".to_string())));
        assert_eq!(forwarded.recv().await, Some(Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn dropped_pump_stops_forwarding() {
        let (client, server): (Duplex<u32, String>, _) = Duplex::pair();
        let (tx, mut forwarded) = mpsc::unbounded_channel();
        let pump = Pump::spawn(client.rx, &CancellationToken::new(), move |frame| {
            tx.send(frame).is_ok()
        });
        drop(pump);
        tokio::task::yield_now().await;
        let _ = server.tx.send(Ok("late".to_string()));
        assert_eq!(forwarded.recv().await, None);
    }
}
