//! Concurrent fan-out of query requests over many targets.
//!
//! Every resolved request runs in its own task and reports exactly one
//! [`Outcome`] through a channel. The channel closing once every task has
//! returned is the completion barrier. Per-target failures are data, never a
//! batch error: the only batch-level failure is an empty request list.

use crate::backend::BackendHandle;
use crate::error::{DataError, Result};
use crate::registry::HandleRegistry;
use crate::request::{BatchTemplate, QueryRequest};
use crate::types::Record;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, warn};

/// Per-target result of a dispatched request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub target: String,
    /// Authoritative only when `error` is empty
    pub records: Vec<Record>,
    /// Empty on success
    pub error: String,
}

impl Outcome {
    pub fn success(target: impl Into<String>, records: Vec<Record>) -> Self {
        Self {
            target: target.into(),
            records,
            error: String::new(),
        }
    }

    pub fn failure(target: impl Into<String>, error: impl fmt::Display) -> Self {
        let mut error = error.to_string();
        if error.is_empty() {
            error = "unknown error".to_string();
        }
        Self {
            target: target.into(),
            records: Vec::new(),
            error,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_empty()
    }

    /// Records on success, the error message otherwise
    pub fn result(&self) -> std::result::Result<&[Record], &str> {
        if self.is_success() {
            Ok(&self.records)
        } else {
            Err(&self.error)
        }
    }
}

/// Limits applied to each dispatch
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchOptions {
    /// Deadline per task; an expired task becomes a failure outcome
    pub task_timeout: Option<Duration>,
    /// Maximum tasks querying at once; `None` is unbounded
    pub max_concurrency: Option<usize>,
}

impl DispatchOptions {
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = Some(timeout);
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = Some(max.max(1));
        self
    }
}

/// Executes batches of requests against a handle registry
pub struct Dispatcher {
    registry: Arc<HandleRegistry>,
    options: DispatchOptions,
}

impl Dispatcher {
    pub fn new(registry: Arc<HandleRegistry>) -> Self {
        Self {
            registry,
            options: DispatchOptions::default(),
        }
    }

    pub fn with_options(mut self, options: DispatchOptions) -> Self {
        self.options = options;
        self
    }

    pub fn registry(&self) -> &Arc<HandleRegistry> {
        &self.registry
    }

    /// Expand a template and dispatch it
    pub async fn dispatch_batch(&self, template: &BatchTemplate) -> Result<Vec<Outcome>> {
        self.dispatch(template.requests()).await
    }

    /// Run every request concurrently and wait for all of them.
    ///
    /// Returns one outcome per request, in completion order.
    pub async fn dispatch(&self, requests: Vec<QueryRequest>) -> Result<Vec<Outcome>> {
        if requests.is_empty() {
            return Err(DataError::InvalidBatch("request list is empty".to_string()));
        }

        let expected = requests.len();
        let started = Instant::now();
        let handles = self.registry.snapshot().await;
        let permits = self
            .options
            .max_concurrency
            .map(|max| Arc::new(Semaphore::new(max.max(1))));

        debug!("Dispatching {} requests", expected);

        let (sender, mut receiver) = mpsc::unbounded_channel::<Outcome>();
        let mut tasks = Vec::with_capacity(expected);

        for request in requests {
            let target = request.target().to_string();

            let Some(handle) = handles.get(&target).cloned() else {
                warn!("Request for unknown target: {}", target);
                let _ = sender.send(Outcome::failure(
                    &target,
                    DataError::UnknownTarget(target.clone()),
                ));
                continue;
            };

            let sender = sender.clone();
            let permits = permits.clone();
            let timeout = self.options.task_timeout;

            let task = tokio::spawn(async move {
                let _permit = match permits {
                    Some(semaphore) => semaphore.acquire_owned().await.ok(),
                    None => None,
                };
                let outcome = run_request(&handle, &request, timeout).await;
                let _ = sender.send(outcome);
            });
            tasks.push((target, task));
        }

        // Only the tasks hold senders now; recv yields None once all have returned
        drop(sender);

        let mut outcomes = Vec::with_capacity(expected);
        while let Some(outcome) = receiver.recv().await {
            outcomes.push(outcome);
        }

        // A task that panicked never sent its outcome
        for (target, task) in tasks {
            if let Err(e) = task.await {
                error!("Query task for {} did not complete: {}", target, e);
                outcomes.push(Outcome::failure(
                    target,
                    DataError::Internal(format!("query task did not complete: {}", e)),
                ));
            }
        }

        let failed = outcomes.iter().filter(|o| !o.is_success()).count();
        debug!(
            "Dispatch finished: {} outcomes, {} failed, {}ms",
            outcomes.len(),
            failed,
            started.elapsed().as_millis()
        );

        Ok(outcomes)
    }
}

async fn run_request(
    handle: &BackendHandle,
    request: &QueryRequest,
    timeout: Option<Duration>,
) -> Outcome {
    let query = handle.materialized_query(request.query(), request.params(), request.limit());

    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, query).await {
            Ok(result) => result,
            Err(_) => Err(DataError::QueryTimeout(limit.as_millis() as u64)),
        },
        None => query.await,
    };

    match result {
        Ok(records) => {
            debug!("Target {} returned {} records", handle.id(), records.len());
            Outcome::success(handle.id(), records)
        }
        Err(e) => {
            warn!("Target {} failed: {}", handle.id(), e);
            Outcome::failure(handle.id(), e)
        }
    }
}
