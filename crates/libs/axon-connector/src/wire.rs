//! Envelope types exchanged with the platform.
//!
//! Payloads stay opaque ([`SerializedObject`]); the connector only reads the
//! fields it needs for correlation, routing and flow control. Identifier fields
//! follow the platform convention where an empty string means "absent".

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub message: String,
    pub location: String,
    pub details: Vec<String>,
    pub error_code: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstructionAck {
    pub instruction_id: String,
    pub success: bool,
    pub error: Option<ErrorMessage>,
}

impl InstructionAck {
    pub fn success(instruction_id: impl Into<String>) -> Self {
        Self {
            instruction_id: instruction_id.into(),
            success: true,
            error: None,
        }
    }

    pub fn failure(instruction_id: impl Into<String>, error: ErrorMessage) -> Self {
        Self {
            instruction_id: instruction_id.into(),
            success: false,
            error: Some(error),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientIdentification {
    pub client_id: String,
    pub component_name: String,
    pub tags: BTreeMap<String, String>,
    pub version: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowControl {
    pub client_id: String,
    pub permits: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub host_name: String,
    pub grpc_port: u16,
    pub node_name: String,
}

/// Answer of the discovery call.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformInfo {
    pub primary: NodeInfo,
    pub same_connection: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedObject {
    pub type_name: String,
    pub revision: String,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
}

impl SerializedObject {
    pub fn new(type_name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            type_name: type_name.into(),
            revision: String::new(),
            data: data.into(),
        }
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text).map_err(serde::de::Error::custom)
    }
}

pub type MetaData = BTreeMap<String, String>;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub message_identifier: String,
    pub name: String,
    pub payload: SerializedObject,
    pub meta_data: MetaData,
    pub routing_key: String,
    pub client_id: String,
    pub component_name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub message_identifier: String,
    pub request_identifier: String,
    pub error_code: String,
    pub error_message: Option<ErrorMessage>,
    pub payload: Option<SerializedObject>,
    pub meta_data: MetaData,
}

impl CommandResponse {
    pub fn is_error(&self) -> bool {
        !self.error_code.is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSubscription {
    pub message_id: String,
    pub command: String,
    pub component_name: String,
    pub client_id: String,
    pub load_factor: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub message_identifier: String,
    pub query: String,
    pub payload: SerializedObject,
    pub response_type: String,
    pub meta_data: MetaData,
    pub client_id: String,
    pub component_name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub message_identifier: String,
    pub request_identifier: String,
    pub error_code: String,
    pub error_message: Option<ErrorMessage>,
    pub payload: Option<SerializedObject>,
    pub meta_data: MetaData,
}

impl QueryResponse {
    pub fn is_error(&self) -> bool {
        !self.error_code.is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuerySubscription {
    pub message_id: String,
    pub query: String,
    pub result_name: String,
    pub component_name: String,
    pub client_id: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryComplete {
    pub message_id: String,
    pub request_id: String,
}

/// Client to platform, control stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformInbound {
    pub instruction_id: String,
    pub request: PlatformInboundRequest,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlatformInboundRequest {
    Register(ClientIdentification),
    Heartbeat,
    Ack(InstructionAck),
}

/// Platform to client, control stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformOutbound {
    pub instruction_id: String,
    pub request: PlatformOutboundRequest,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlatformOutboundRequest {
    RequestReconnect,
    Heartbeat,
    Ack(InstructionAck),
}

/// Client to platform, command stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandProviderOutbound {
    pub instruction_id: String,
    pub request: CommandProviderOutboundRequest,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandProviderOutboundRequest {
    Subscribe(CommandSubscription),
    Unsubscribe(CommandSubscription),
    FlowControl(FlowControl),
    CommandResponse(CommandResponse),
    Ack(InstructionAck),
}

/// Platform to client, command stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandProviderInbound {
    pub instruction_id: String,
    pub request: CommandProviderInboundRequest,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandProviderInboundRequest {
    Ack(InstructionAck),
    Command(Command),
}

/// Client to platform, query stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryProviderOutbound {
    pub instruction_id: String,
    pub request: QueryProviderOutboundRequest,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryProviderOutboundRequest {
    Subscribe(QuerySubscription),
    Unsubscribe(QuerySubscription),
    FlowControl(FlowControl),
    QueryResponse(QueryResponse),
    QueryComplete(QueryComplete),
    Ack(InstructionAck),
}

/// Platform to client, query stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryProviderInbound {
    pub instruction_id: String,
    pub request: QueryProviderInboundRequest,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryProviderInboundRequest {
    Ack(InstructionAck),
    Query(QueryRequest),
}
