//! Connector configuration.
//!
//! Options are built with [`ConnectorOptions::new`] and the `set_*` methods, or
//! read from TOML. Every numeric and duration field has a default so a TOML
//! document only needs to name what it changes:
//!
//! ```toml
//! component_name = "billing"
//! routing_servers = ["axon-1:8124", "axon-2:8124"]
//! command_permits = 1000
//!
//! [heartbeat]
//! interval = { secs = 10, nanos = 0 }
//! timeout = { secs = 15, nanos = 0 }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicyOptions;
use crate::error::ConfigError;
use crate::flow_control::PermitCount;
use crate::heartbeat::DEFAULT_PURGE_INTERVAL;
use crate::ids::{ClientIdentity, ClientInstanceId, ComponentName, Context};

pub const DEFAULT_PORT: u16 = 8124;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_SUBSCRIPTION_PURGE_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_SUBSCRIPTION_PURGE_AGE: Duration = Duration::from_secs(60);

/// `host:port` of a platform node. The port defaults to 8124.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServerAddress {
    host: String,
    port: u16,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, ConfigError> {
        let host = host.into();
        if host.is_empty() {
            return Err(ConfigError::invalid("server address", "host cannot be empty"));
        }
        Ok(Self { host, port })
    }

    pub fn localhost() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl FromStr for ServerAddress {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|e| {
                    ConfigError::invalid("server address", format!("bad port in {value:?}: {e}"))
                })?;
                Self::new(host, port)
            }
            None => Self::new(value, DEFAULT_PORT),
        }
    }
}

impl TryFrom<String> for ServerAddress {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, ConfigError> {
        value.parse()
    }
}

impl From<ServerAddress> for String {
    fn from(value: ServerAddress) -> String {
        value.to_string()
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectOptions {
    pub connect_timeout: Duration,
    pub backoff: BackoffPolicyOptions,
    /// Always go through the routing servers again instead of retrying the
    /// node that was last connected.
    pub force_via_routing_servers: bool,
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            backoff: BackoffPolicyOptions::default(),
            force_via_routing_servers: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatOptions {
    pub interval: Duration,
    pub timeout: Duration,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorOptions {
    pub context: Context,
    pub component_name: Option<ComponentName>,
    pub client_instance_id: Option<ClientInstanceId>,
    pub tags: BTreeMap<String, String>,
    pub routing_servers: Vec<ServerAddress>,
    pub authentication_token: Option<String>,
    pub command_permits: PermitCount,
    pub query_permits: PermitCount,
    pub reconnect: ReconnectOptions,
    pub subscription_purge_interval: Duration,
    pub subscription_purge_age: Duration,
    pub heartbeat_purge_interval: Duration,
    pub heartbeat: Option<HeartbeatOptions>,
    pub scheduler_tick: Duration,
}

impl ConnectorOptions {
    pub fn new(component_name: ComponentName) -> Self {
        Self {
            component_name: Some(component_name),
            ..Self::default()
        }
    }

    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let mut options: Self = toml::from_str(input).map_err(|e| ConfigError::Parse(e.to_string()))?;
        options.command_permits = clamp_permits(options.command_permits);
        options.query_permits = clamp_permits(options.query_permits);
        options.validate()?;
        Ok(options)
    }

    pub fn set_context(&mut self, context: Context) {
        self.context = context;
    }

    pub fn set_client_instance_id(&mut self, id: ClientInstanceId) {
        self.client_instance_id = Some(id);
    }

    pub fn set_tags(&mut self, tags: BTreeMap<String, String>) {
        self.tags = tags;
    }

    pub fn set_tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.tags.insert(key.into(), value.into());
    }

    pub fn set_routing_servers(&mut self, servers: Vec<ServerAddress>) {
        self.routing_servers = servers;
    }

    pub fn set_authentication_token(&mut self, token: impl Into<String>) {
        self.authentication_token = Some(token.into());
    }

    /// Permits below the minimum are raised to it.
    pub fn set_command_permits(&mut self, permits: PermitCount) {
        self.command_permits = clamp_permits(permits);
    }

    /// Permits below the minimum are raised to it.
    pub fn set_query_permits(&mut self, permits: PermitCount) {
        self.query_permits = clamp_permits(permits);
    }

    pub fn set_connect_timeout(&mut self, timeout: Duration) {
        self.reconnect.connect_timeout = timeout;
    }

    pub fn set_backoff(&mut self, backoff: BackoffPolicyOptions) {
        self.reconnect.backoff = backoff;
    }

    pub fn set_reconnect(&mut self, reconnect: ReconnectOptions) {
        self.reconnect = reconnect;
    }

    pub fn set_subscription_purge(&mut self, interval: Duration, age: Duration) {
        self.subscription_purge_interval = interval;
        self.subscription_purge_age = age;
    }

    pub fn set_heartbeat_purge_interval(&mut self, interval: Duration) {
        self.heartbeat_purge_interval = interval;
    }

    pub fn set_heartbeat(&mut self, interval: Duration, timeout: Duration) {
        self.heartbeat = Some(HeartbeatOptions { interval, timeout });
    }

    pub fn set_scheduler_tick(&mut self, tick: Duration) {
        self.scheduler_tick = tick;
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.routing_servers.is_empty() {
            return Err(ConfigError::invalid("routing_servers", "at least one server is required"));
        }
        if self.reconnect.connect_timeout.is_zero() {
            return Err(ConfigError::invalid("connect_timeout", "must be greater than zero"));
        }
        if self.reconnect.backoff.max().is_zero() {
            return Err(ConfigError::invalid("backoff max", "must be greater than zero"));
        }
        if self.subscription_purge_interval.is_zero() {
            return Err(ConfigError::invalid(
                "subscription_purge_interval",
                "must be greater than zero",
            ));
        }
        if self.heartbeat_purge_interval.is_zero() {
            return Err(ConfigError::invalid("heartbeat_purge_interval", "must be greater than zero"));
        }
        if self.scheduler_tick.is_zero() {
            return Err(ConfigError::invalid("scheduler_tick", "must be greater than zero"));
        }
        if let Some(token) = &self.authentication_token {
            if token.is_empty() {
                return Err(ConfigError::invalid("authentication_token", "cannot be empty"));
            }
        }
        Ok(())
    }

    /// The identity announced to the platform; unnamed components get a
    /// generated name.
    pub fn client_identity(&self) -> ClientIdentity {
        ClientIdentity::new(
            self.component_name.clone().unwrap_or_else(ComponentName::generate),
            self.client_instance_id
                .clone()
                .unwrap_or_else(ClientInstanceId::generate),
        )
        .with_tags(self.tags.clone())
    }

    pub(crate) fn command_channel(&self) -> ChannelOptions {
        ChannelOptions {
            permits: self.command_permits,
            purge_interval: self.subscription_purge_interval,
            purge_age: self.subscription_purge_age,
        }
    }

    pub(crate) fn query_channel(&self) -> ChannelOptions {
        ChannelOptions {
            permits: self.query_permits,
            purge_interval: self.subscription_purge_interval,
            purge_age: self.subscription_purge_age,
        }
    }
}

/// Settings of a command or query channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ChannelOptions {
    pub permits: PermitCount,
    pub purge_interval: Duration,
    pub purge_age: Duration,
}

impl Default for ConnectorOptions {
    fn default() -> Self {
        Self {
            context: Context::default(),
            component_name: None,
            client_instance_id: None,
            tags: BTreeMap::new(),
            routing_servers: vec![ServerAddress::localhost()],
            authentication_token: None,
            command_permits: PermitCount::DEFAULT,
            query_permits: PermitCount::DEFAULT,
            reconnect: ReconnectOptions::default(),
            subscription_purge_interval: DEFAULT_SUBSCRIPTION_PURGE_INTERVAL,
            subscription_purge_age: DEFAULT_SUBSCRIPTION_PURGE_AGE,
            heartbeat_purge_interval: DEFAULT_PURGE_INTERVAL,
            heartbeat: None,
            scheduler_tick: crate::scheduler::DEFAULT_TICK,
        }
    }
}

fn clamp_permits(permits: PermitCount) -> PermitCount {
    permits.max(PermitCount::MINIMUM)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_localhost() {
        let options = ConnectorOptions::default();
        assert_eq!(options.routing_servers, vec![ServerAddress::localhost()]);
        assert_eq!(options.routing_servers[0].to_string(), "localhost:8124");
        assert_eq!(options.command_permits.get(), 5000);
        assert_eq!(options.query_permits.get(), 5000);
        assert_eq!(options.reconnect.connect_timeout, Duration::from_secs(10));
        assert_eq!(options.heartbeat_purge_interval, Duration::from_secs(900));
        assert!(options.validate().is_ok());
    }

    #[test]
    fn permits_are_clamped_to_the_minimum() {
        let mut options = ConnectorOptions::default();
        options.set_command_permits(PermitCount::new(1).expect("permits"));
        options.set_query_permits(PermitCount::new(100).expect("permits"));
        assert_eq!(options.command_permits.get(), PermitCount::MINIMUM.get());
        assert_eq!(options.query_permits.get(), 100);
    }

    #[test]
    fn server_addresses_parse_with_default_port() {
        let a: ServerAddress = "axon-1".parse().expect("address");
        assert_eq!((a.host(), a.port()), ("axon-1", DEFAULT_PORT));
        let b: ServerAddress = "axon-2:9000".parse().expect("address");
        assert_eq!((b.host(), b.port()), ("axon-2", 9000));
        assert!("axon-3:http".parse::<ServerAddress>().is_err());
        assert!(":8124".parse::<ServerAddress>().is_err());
    }

    #[test]
    fn options_load_from_toml() {
        let options = ConnectorOptions::from_toml_str(
            r#"
            component_name = "billing"
            routing_servers = ["axon-1:8124", "axon-2"]
            command_permits = 1000
            authentication_token = "secret"

            [tags]
            region = "eu"

            [heartbeat]
            interval = { secs = 10, nanos = 0 }
            timeout = { secs = 15, nanos = 0 }
            "#,
        )
        .expect("options");
        assert_eq!(options.component_name.as_ref().map(ComponentName::as_str), Some("billing"));
        assert_eq!(options.routing_servers.len(), 2);
        assert_eq!(options.command_permits.get(), 1000);
        assert_eq!(options.query_permits.get(), PermitCount::DEFAULT.get());
        assert_eq!(
            options.heartbeat,
            Some(HeartbeatOptions {
                interval: Duration::from_secs(10),
                timeout: Duration::from_secs(15),
            })
        );
        let identity = options.client_identity();
        assert_eq!(identity.component_name.as_str(), "billing");
        assert_eq!(identity.tags.get("region").map(String::as_str), Some("eu"));
    }

    #[test]
    fn invalid_toml_is_rejected() {
        assert!(matches!(
            ConnectorOptions::from_toml_str("routing_servers = []"),
            Err(ConfigError::Invalid { field: "routing_servers", .. })
        ));
        assert!(matches!(
            ConnectorOptions::from_toml_str("command_permits = 0"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            ConnectorOptions::from_toml_str("authentication_token = \"\""),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn reconnect_backoff_must_be_able_to_grow() {
        let mut options = ConnectorOptions::default();
        options.set_backoff(BackoffPolicyOptions::new(Duration::ZERO, Duration::ZERO, 2.0).expect("backoff"));
        assert!(matches!(
            options.validate(),
            Err(ConfigError::Invalid { field: "backoff max", .. })
        ));
        options.set_backoff(BackoffPolicyOptions::new(Duration::ZERO, Duration::from_secs(1), 2.0).expect("backoff"));
        assert!(options.validate().is_ok());
    }

    #[test]
    fn unnamed_components_get_a_generated_name() {
        let identity = ConnectorOptions::default().client_identity();
        assert!(identity.component_name.as_str().starts_with("Unnamed-"));
    }
}
