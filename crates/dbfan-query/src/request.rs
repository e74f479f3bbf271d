use crate::types::{effective_limit, Query, Value};
use serde::{Deserialize, Serialize};

/// One unit of work routed to a single target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    target: String,
    query: Query,
    #[serde(default)]
    params: Vec<Value>,
    #[serde(default)]
    limit: usize,
}

impl QueryRequest {
    pub fn new(target: impl Into<String>, query: impl Into<Query>, limit: usize) -> Self {
        Self {
            target: target.into(),
            query: query.into(),
            params: Vec::new(),
            limit,
        }
    }

    pub fn with_params(mut self, params: Vec<Value>) -> Self {
        self.params = params;
        self
    }

    /// Fill in a row limit when none was requested
    pub fn with_default_limit(mut self, limit: usize) -> Self {
        if self.limit == 0 {
            self.limit = limit;
        }
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    /// Row limit with the default applied
    pub fn limit(&self) -> usize {
        effective_limit(self.limit)
    }
}

/// One query fanned out over many targets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchTemplate {
    pub targets: Vec<String>,
    pub query: Query,
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub params: Vec<Value>,
}

impl BatchTemplate {
    pub fn new(targets: Vec<String>, query: impl Into<Query>, limit: usize) -> Self {
        Self {
            targets,
            query: query.into(),
            limit,
            params: Vec::new(),
        }
    }

    /// Expand into one request per target, in target order. Duplicates are kept.
    pub fn requests(&self) -> Vec<QueryRequest> {
        self.targets
            .iter()
            .map(|target| {
                QueryRequest::new(target.clone(), self.query.clone(), self.limit)
                    .with_params(self.params.clone())
            })
            .collect()
    }
}

/// A statement executed as part of a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub query: Query,
    #[serde(default)]
    pub params: Vec<Value>,
}

impl Statement {
    pub fn new(query: impl Into<Query>) -> Self {
        Self {
            query: query.into(),
            params: Vec::new(),
        }
    }

    pub fn with_params(mut self, params: Vec<Value>) -> Self {
        self.params = params;
        self
    }
}
