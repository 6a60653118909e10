//! Resolution of the platform node that serves a context.

use std::sync::Arc;
use std::time::Duration;

use crate::config::ServerAddress;
use crate::error::TransportError;
use crate::ids::{ClientIdentity, Context};
use crate::transport::{Connector, SharedTransport};

/// A transport to the node chosen by discovery.
#[derive(Clone)]
pub struct Established {
    pub address: ServerAddress,
    pub transport: SharedTransport,
}

impl std::fmt::Debug for Established {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Established")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

pub struct Discovery {
    connector: Arc<dyn Connector>,
    routing_servers: Vec<ServerAddress>,
    client_identity: ClientIdentity,
    token: Option<String>,
    timeout: Duration,
}

impl Discovery {
    pub fn new(
        connector: Arc<dyn Connector>,
        routing_servers: Vec<ServerAddress>,
        client_identity: ClientIdentity,
        token: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            connector,
            routing_servers,
            client_identity,
            token,
            timeout,
        }
    }

    /// Asks each routing server in turn which node serves `context` and
    /// connects to it. `None` when no routing server could be used.
    pub async fn discover(&self, context: &Context) -> Option<Established> {
        for server in &self.routing_servers {
            log::info!("discovery({}): requesting connection details from {}", context, server);
            match tokio::time::timeout(self.timeout, self.try_server(server, context)).await {
                Ok(Ok(established)) => return Some(established),
                Ok(Err(e)) => {
                    log::warn!("discovery({}): connecting to node {} failed: {}", context, server, e)
                }
                Err(_) => log::warn!(
                    "discovery({}): connecting to node {} timed out after {:?}",
                    context,
                    server,
                    self.timeout
                ),
            }
        }
        None
    }

    async fn try_server(&self, server: &ServerAddress, context: &Context) -> Result<Established, TransportError> {
        let token = self.token.as_deref();
        let candidate = self.connector.connect(server, context, token).await?;
        let info = match candidate
            .get_platform_server(&self.client_identity.to_identification())
            .await
        {
            Ok(info) => info,
            Err(e) => {
                shutdown_quietly(context, server, &candidate).await;
                return Err(e);
            }
        };

        let primary = &info.primary;
        log::debug!(
            "discovery({}): platform suggests [{}] ({}:{}), {}",
            context,
            primary.node_name,
            primary.host_name,
            primary.grpc_port,
            if info.same_connection {
                "allowing use of the existing connection"
            } else {
                "requiring a new connection"
            }
        );

        if info.same_connection || (primary.host_name == server.host() && primary.grpc_port == server.port()) {
            return Ok(Established {
                address: server.clone(),
                transport: candidate,
            });
        }

        shutdown_quietly(context, server, &candidate).await;
        let address = ServerAddress::new(primary.host_name.clone(), primary.grpc_port)
            .map_err(|e| TransportError::status(crate::error::StatusCode::InvalidArgument, e.to_string()))?;
        log::info!("discovery({}): connecting to [{}] ({})", context, primary.node_name, address);
        let transport = self.connector.connect(&address, context, token).await?;
        Ok(Established { address, transport })
    }
}

async fn shutdown_quietly(context: &Context, server: &ServerAddress, transport: &SharedTransport) {
    if let Err(e) = transport.shutdown().await {
        log::debug!("discovery({}): failed to shut down candidate {}: {}", context, server, e);
    }
}
