use std::fmt;

use super::{Subject, SubscriptionTracker};
use crate::command::RegisteredCommandHandler;
use crate::error::{ConnectorError, Result};
use crate::ids::CommandHandlerId;

/// Name of a command a handler subscribes to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandName(String);

impl CommandName {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(ConnectorError::invalid_argument("command name cannot be empty"));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommandName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Subject for CommandName {
    fn name(&self) -> &str {
        &self.0
    }
}

pub type CommandSubscriptions =
    SubscriptionTracker<CommandHandlerId, CommandName, RegisteredCommandHandler>;
