//! Fan-out behaviour of the dispatcher over in-memory backends

use async_trait::async_trait;
use dbfan_query::{
    BackendKind, BatchTemplate, BufferedCursor, Column, Connector, DataError, DispatchOptions,
    Dispatcher, Executor, HandleRegistry, Query, QueryRequest, Result, RowCursor, Value,
};
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How a fake target behaves
#[derive(Clone, Copy)]
enum Behaviour {
    Rows(usize),
    RefuseConnection,
    FailQuery,
    Sleep(Duration),
    Panic,
}

struct FakeConnector {
    behaviour: Behaviour,
    connects: Arc<AtomicUsize>,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

struct FakeExecutor {
    behaviour: Behaviour,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[async_trait]
impl Connector for FakeConnector {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    fn describe(&self) -> String {
        "fake".to_string()
    }

    async fn connect(&self) -> Result<Arc<dyn Executor>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Behaviour::RefuseConnection = self.behaviour {
            return Err(DataError::connection_failed(
                BackendKind::Sqlite,
                "connection refused",
            ));
        }
        Ok(Arc::new(FakeExecutor {
            behaviour: self.behaviour,
            running: self.running.clone(),
            peak: self.peak.clone(),
        }))
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    async fn run_query(
        &self,
        _query: &Query,
        _params: &[Value],
        _limit: usize,
    ) -> Result<Box<dyn RowCursor>> {
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);

        let result = match self.behaviour {
            Behaviour::Rows(n) => Ok(rows(n)),
            Behaviour::FailQuery => Err(DataError::query_failed("relation does not exist")),
            Behaviour::Sleep(duration) => {
                tokio::time::sleep(duration).await;
                Ok(rows(1))
            }
            Behaviour::Panic => panic!("driver bug"),
            Behaviour::RefuseConnection => unreachable!(),
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn run_exec(&self, _query: &Query, _params: &[Value]) -> Result<u64> {
        Ok(0)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

fn rows(n: usize) -> Box<dyn RowCursor> {
    let rows = (0..n).map(|i| vec![json!(i as i64)]).collect();
    Box::new(BufferedCursor::new(vec![Column::new("n", "INT8")], rows))
}

struct Harness {
    registry: Arc<HandleRegistry>,
    connects: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    running: Arc<AtomicUsize>,
}

impl Harness {
    fn new() -> Self {
        Self {
            registry: Arc::new(HandleRegistry::new()),
            connects: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            running: Arc::new(AtomicUsize::new(0)),
        }
    }

    async fn add(&self, id: &str, behaviour: Behaviour) {
        let connector = FakeConnector {
            behaviour,
            connects: self.connects.clone(),
            running: self.running.clone(),
            peak: self.peak.clone(),
        };
        self.registry.register(id, Arc::new(connector)).await;
    }

    fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(self.registry.clone())
    }
}

fn targets(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|id| id.to_string()).collect()
}

#[tokio::test]
async fn test_broken_target_does_not_affect_others() {
    let harness = Harness::new();
    harness.add("A", Behaviour::Rows(3)).await;
    harness.add("B", Behaviour::RefuseConnection).await;
    harness.add("C", Behaviour::Rows(2)).await;

    let template = BatchTemplate::new(targets(&["A", "B", "C"]), "SELECT n FROM t", 10);
    let outcomes = harness.dispatcher().dispatch_batch(&template).await.unwrap();

    assert_eq!(outcomes.len(), 3);
    let by_target = |id: &str| outcomes.iter().find(|o| o.target == id).unwrap();

    assert!(by_target("A").is_success());
    assert_eq!(by_target("A").records.len(), 3);
    assert!(by_target("C").is_success());
    assert_eq!(by_target("C").records.len(), 2);

    let broken = by_target("B");
    assert!(!broken.is_success());
    assert!(broken.records.is_empty());
    assert!(broken.error.contains("connection refused"));
}

#[tokio::test]
async fn test_unknown_target_yields_failure_outcome() {
    let harness = Harness::new();
    harness.add("A", Behaviour::Rows(1)).await;

    let template = BatchTemplate::new(targets(&["A", "X"]), "SELECT 1", 0);
    let outcomes = harness.dispatcher().dispatch_batch(&template).await.unwrap();

    assert_eq!(outcomes.len(), 2);
    let unknown = outcomes.iter().find(|o| o.target == "X").unwrap();
    assert!(!unknown.is_success());
    assert!(unknown.error.contains('X'));
    assert!(outcomes.iter().any(|o| o.target == "A" && o.is_success()));
}

#[tokio::test]
async fn test_empty_batch_is_invalid() {
    let harness = Harness::new();
    harness.add("A", Behaviour::Rows(1)).await;

    let template = BatchTemplate::new(Vec::new(), "SELECT 1", 0);
    let err = harness
        .dispatcher()
        .dispatch_batch(&template)
        .await
        .unwrap_err();
    assert!(matches!(err, DataError::InvalidBatch(_)));
    assert_eq!(harness.connects.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_single_request_yields_single_outcome() {
    let harness = Harness::new();
    harness.add("only", Behaviour::Rows(20)).await;

    let outcomes = harness
        .dispatcher()
        .dispatch(vec![QueryRequest::new("only", "SELECT n FROM t", 0)])
        .await
        .unwrap();

    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].records.len(), 10);
}

#[tokio::test]
async fn test_fifty_requests_yield_fifty_outcomes() {
    let harness = Harness::new();
    let ids: Vec<String> = (0..50).map(|i| format!("db{:02}", i)).collect();
    for (i, id) in ids.iter().enumerate() {
        let behaviour = if i % 7 == 0 {
            Behaviour::FailQuery
        } else {
            Behaviour::Rows(i % 5)
        };
        harness.add(id, behaviour).await;
    }

    let template = BatchTemplate::new(ids.clone(), "SELECT n FROM t", 3);
    let outcomes = harness.dispatcher().dispatch_batch(&template).await.unwrap();

    assert_eq!(outcomes.len(), 50);
    let seen: HashSet<&str> = outcomes.iter().map(|o| o.target.as_str()).collect();
    assert_eq!(seen.len(), 50);

    for outcome in &outcomes {
        let index: usize = outcome.target[2..].parse().unwrap();
        if index % 7 == 0 {
            assert!(outcome.error.contains("relation does not exist"));
        } else {
            assert_eq!(outcome.records.len(), (index % 5).min(3));
        }
    }
}

#[tokio::test]
async fn test_duplicate_targets_get_one_outcome_each() {
    let harness = Harness::new();
    harness.add("A", Behaviour::Rows(1)).await;

    let template = BatchTemplate::new(targets(&["A", "A", "A"]), "SELECT 1", 1);
    let outcomes = harness.dispatcher().dispatch_batch(&template).await.unwrap();

    assert_eq!(outcomes.len(), 3);
    assert!(outcomes.iter().all(|o| o.target == "A" && o.is_success()));
    assert_eq!(harness.connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_task_timeout_becomes_failure_outcome() {
    let harness = Harness::new();
    harness.add("slow", Behaviour::Sleep(Duration::from_secs(5))).await;
    harness.add("fast", Behaviour::Rows(1)).await;

    let dispatcher = harness
        .dispatcher()
        .with_options(DispatchOptions::default().with_task_timeout(Duration::from_millis(50)));
    let template = BatchTemplate::new(targets(&["slow", "fast"]), "SELECT 1", 1);
    let outcomes = dispatcher.dispatch_batch(&template).await.unwrap();

    assert_eq!(outcomes.len(), 2);
    let slow = outcomes.iter().find(|o| o.target == "slow").unwrap();
    assert_eq!(slow.error, "Query timeout after 50ms");
    assert!(outcomes.iter().any(|o| o.target == "fast" && o.is_success()));
}

#[tokio::test]
async fn test_panicking_task_becomes_failure_outcome() {
    let harness = Harness::new();
    harness.add("bad", Behaviour::Panic).await;
    harness.add("good", Behaviour::Rows(2)).await;

    let template = BatchTemplate::new(targets(&["bad", "good"]), "SELECT 1", 5);
    let outcomes = harness.dispatcher().dispatch_batch(&template).await.unwrap();

    assert_eq!(outcomes.len(), 2);
    let bad = outcomes.iter().find(|o| o.target == "bad").unwrap();
    assert!(bad.error.contains("did not complete"));
    assert!(outcomes.iter().any(|o| o.target == "good" && o.is_success()));
}

#[tokio::test]
async fn test_max_concurrency_bounds_running_queries() {
    let harness = Harness::new();
    let ids: Vec<String> = (0..8).map(|i| format!("t{}", i)).collect();
    for id in &ids {
        harness.add(id, Behaviour::Sleep(Duration::from_millis(20))).await;
    }

    let dispatcher = harness
        .dispatcher()
        .with_options(DispatchOptions::default().with_max_concurrency(2));
    let template = BatchTemplate::new(ids, "SELECT 1", 1);
    let outcomes = dispatcher.dispatch_batch(&template).await.unwrap();

    assert_eq!(outcomes.len(), 8);
    assert!(outcomes.iter().all(|o| o.is_success()));
    assert!(harness.peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn test_ping_all_reports_each_target() {
    let harness = Harness::new();
    harness.add("up", Behaviour::Rows(0)).await;
    harness.add("down", Behaviour::RefuseConnection).await;

    let outcomes = harness.registry.ping_all().await;
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().any(|o| o.target == "up" && o.is_success()));
    assert!(outcomes.iter().any(|o| o.target == "down" && !o.is_success()));

    assert!(harness.registry.get("up").await.unwrap().is_ready().await);
    assert!(!harness.registry.get("down").await.unwrap().is_ready().await);
}
