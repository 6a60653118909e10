//! Client runtime for the Axon messaging platform.
//!
//! An [`AxonConnection`] keeps one context connected: it discovers the node
//! that serves the context, keeps the control stream alive with heartbeats,
//! reconnects with backoff and restores command and query subscriptions on
//! the new streams. Every stateful component is an actor owning its state.

pub mod actor;
pub mod backoff;
pub mod command;
pub mod completion;
pub mod config;
pub mod connection;
pub mod control;
pub mod discovery;
pub mod error;
pub mod flow_control;
pub mod heartbeat;
pub mod ids;
pub mod query;
pub mod scheduler;
pub mod subscriptions;
pub mod transport;
pub mod wire;

#[cfg(test)]
mod testing;

pub use command::{CommandChannel, CommandHandler, CommandHandlerRegistration};
pub use config::{ConnectorOptions, HeartbeatOptions, ReconnectOptions, ServerAddress};
pub use connection::{AxonConnection, ConnectionEvent, ConnectionStatus, ConnectionView, ListenerId};
pub use control::{ChannelStatus, ControlChannel};
pub use error::{ConnectorError, ErrorCategory, PlatformError, Result, TransportError};
pub use flow_control::PermitCount;
pub use ids::{ClientIdentity, ClientInstanceId, ComponentName, Context, LoadFactor};
pub use query::{
    QueryChannel, QueryHandler, QueryHandlerRegistration, QueryResponseChannel, QueryResponses,
};
pub use subscriptions::{CommandName, QueryDefinition};
pub use transport::{Connector, PlatformTransport, SharedTransport};
