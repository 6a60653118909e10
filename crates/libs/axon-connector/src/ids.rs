//! Identity and identifier value types shared by every channel.

use std::collections::BTreeMap;
use std::fmt;

use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};

use crate::error::{ConnectorError, Result};
use crate::wire::ClientIdentification;

const TOKEN_LEN: usize = 16;

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    OsRng.fill_bytes(&mut out);
    out
}

/// A fresh random hex token, used for every opaque identifier.
pub fn random_token() -> String {
    hex::encode(random_bytes::<TOKEN_LEN>())
}

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(random_token())
            }

            /// Wraps an identifier received over the wire. Empty strings carry no identity.
            pub fn parse(value: impl Into<String>) -> Option<Self> {
                let value = value.into();
                if value.is_empty() {
                    None
                } else {
                    Some(Self(value))
                }
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> String {
                value.0
            }
        }
    };
}

opaque_id!(
    /// Correlates an outbound instruction with its acknowledgement.
    InstructionId
);
opaque_id!(SubscriptionId);
opaque_id!(RegistrationId);
opaque_id!(CommandHandlerId);
opaque_id!(QueryHandlerId);
opaque_id!(
    /// Message identifier stamped on dispatched commands and queries.
    MessageId
);

/// Logical tenant a connection is scoped to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Context(String);

impl Context {
    pub const DEFAULT: &'static str = "default";
    pub const ADMIN: &'static str = "_admin";

    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(ConnectorError::invalid_argument("context name cannot be empty"));
        }
        Ok(Self(name))
    }

    pub fn default_context() -> Self {
        Self(Self::DEFAULT.to_string())
    }

    pub fn admin() -> Self {
        Self(Self::ADMIN.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::default_context()
    }
}

impl TryFrom<String> for Context {
    type Error = ConnectorError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Context> for String {
    fn from(value: Context) -> String {
        value.0
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name under which the application component announces itself.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComponentName(String);

impl ComponentName {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(ConnectorError::invalid_argument("component name cannot be empty"));
        }
        Ok(Self(name))
    }

    /// `Unnamed-<token>`, for applications that never name themselves.
    pub fn generate() -> Self {
        Self(format!("Unnamed-{}", hex::encode(random_bytes::<4>())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ComponentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identity of this process towards the platform.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientInstanceId(String);

impl ClientInstanceId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(ConnectorError::invalid_argument("client instance id cannot be empty"));
        }
        Ok(Self(id))
    }

    pub fn generate() -> Self {
        Self(random_token())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientIdentity {
    pub component_name: ComponentName,
    pub client_instance_id: ClientInstanceId,
    pub tags: BTreeMap<String, String>,
    pub version: String,
}

impl ClientIdentity {
    pub const PROTOCOL_VERSION: &'static str = "1.0";

    pub fn new(component_name: ComponentName, client_instance_id: ClientInstanceId) -> Self {
        Self {
            component_name,
            client_instance_id,
            tags: BTreeMap::new(),
            version: Self::PROTOCOL_VERSION.to_string(),
        }
    }

    pub fn with_tags(mut self, tags: BTreeMap<String, String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn to_identification(&self) -> ClientIdentification {
        ClientIdentification {
            client_id: self.client_instance_id.to_string(),
            component_name: self.component_name.to_string(),
            tags: self.tags.clone(),
            version: self.version.clone(),
        }
    }
}

/// Relative share of commands a handler is willing to take.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LoadFactor(i32);

impl LoadFactor {
    pub const DEFAULT: LoadFactor = LoadFactor(100);

    pub fn new(value: i32) -> Result<Self> {
        if value < 0 {
            return Err(ConnectorError::invalid_argument(format!(
                "load factor must be greater than or equal to 0, got {value}"
            )));
        }
        Ok(Self(value))
    }

    pub fn get(self) -> i32 {
        self.0
    }
}

impl Default for LoadFactor {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique_hex_tokens() {
        let a = InstructionId::new();
        let b = InstructionId::new();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), TOKEN_LEN * 2);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn empty_wire_ids_do_not_parse() {
        assert!(InstructionId::parse("").is_none());
        assert_eq!(InstructionId::parse("abc").map(String::from), Some("abc".to_string()));
    }

    #[test]
    fn context_rejects_empty_names() {
        assert!(Context::new("").is_err());
        assert_eq!(Context::default().as_str(), "default");
        assert_eq!(Context::admin().as_str(), "_admin");
    }

    #[test]
    fn load_factor_rejects_negative_values() {
        assert!(LoadFactor::new(-1).is_err());
        assert_eq!(LoadFactor::new(0).map(LoadFactor::get).ok(), Some(0));
    }

    #[test]
    fn identification_carries_tags_and_version() {
        let mut tags = BTreeMap::new();
        tags.insert("region".to_string(), "eu".to_string());
        let identity = ClientIdentity::new(
            ComponentName::new("billing").expect("name"),
            ClientInstanceId::new("billing-1").expect("id"),
        )
        .with_tags(tags);
        let wire = identity.to_identification();
        assert_eq!(wire.client_id, "billing-1");
        assert_eq!(wire.component_name, "billing");
        assert_eq!(wire.tags.get("region").map(String::as_str), Some("eu"));
        assert_eq!(wire.version, ClientIdentity::PROTOCOL_VERSION);
    }
}
