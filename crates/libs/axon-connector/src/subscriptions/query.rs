use std::fmt;

use super::{Subject, SubscriptionTracker};
use crate::error::{ConnectorError, Result};
use crate::ids::QueryHandlerId;
use crate::query::RegisteredQueryHandler;

/// A query name together with the result type the handler produces.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct QueryDefinition {
    query_name: String,
    result_name: String,
}

impl QueryDefinition {
    pub fn new(query_name: impl Into<String>, result_name: impl Into<String>) -> Result<Self> {
        let query_name = query_name.into();
        if query_name.is_empty() {
            return Err(ConnectorError::invalid_argument("query name cannot be empty"));
        }
        Ok(Self {
            query_name,
            result_name: result_name.into(),
        })
    }

    pub fn query_name(&self) -> &str {
        &self.query_name
    }

    pub fn result_name(&self) -> &str {
        &self.result_name
    }
}

impl fmt::Display for QueryDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.query_name, self.result_name)
    }
}

impl Subject for QueryDefinition {
    fn name(&self) -> &str {
        &self.query_name
    }
}

pub type QuerySubscriptions = SubscriptionTracker<QueryHandlerId, QueryDefinition, RegisteredQueryHandler>;
