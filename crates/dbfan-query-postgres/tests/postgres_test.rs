use dbfan_query::{
    BatchTemplate, DataError, Dispatcher, HandleRegistry, Query, Statement, Value,
};
use dbfan_query_postgres::{PostgresConfig, PostgresConnector};
use std::sync::Arc;
use testcontainers::{runners::AsyncRunner, ContainerAsync, GenericImage, ImageExt};

struct TestDatabase {
    _container: ContainerAsync<GenericImage>,
    config: PostgresConfig,
}

async fn start_postgres() -> Option<TestDatabase> {
    let container = match GenericImage::new("postgres", "16-alpine")
        .with_env_var("POSTGRES_DB", "dbfan")
        .with_env_var("POSTGRES_USER", "postgres")
        .with_env_var("POSTGRES_PASSWORD", "postgres")
        .start()
        .await
    {
        Ok(container) => container,
        Err(e) => {
            println!("⚠️  Docker not available, skipping test: {}", e);
            return None;
        }
    };

    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("Failed to get postgres port");
    let config = PostgresConfig::new("localhost", port, "postgres", "postgres", "dbfan");

    // Wait for the server to accept connections
    let registry = HandleRegistry::new();
    let handle = registry
        .register("readiness", Arc::new(PostgresConnector::new(config.clone())))
        .await;
    let mut retries = 15;
    loop {
        match handle.ensure_ready().await {
            Ok(()) => break,
            Err(e) if retries > 0 => {
                retries -= 1;
                println!("Postgres not ready ({}), retrying in 1s...", e);
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
            Err(e) => panic!("Failed to connect to postgres: {}", e),
        }
    }
    handle.close().await.unwrap();

    Some(TestDatabase {
        _container: container,
        config,
    })
}

#[tokio::test]
async fn test_postgres_materialize_and_dispatch() {
    let Some(db) = start_postgres().await else {
        return;
    };

    let registry = Arc::new(HandleRegistry::new());
    let main = registry
        .register("main", Arc::new(PostgresConnector::new(db.config.clone())))
        .await;

    main.exec(
        &Query::from(
            "CREATE TABLE users (id INT4 PRIMARY KEY, name VARCHAR(50), active BOOL, \
             score FLOAT8, visits INT8, joined TIMESTAMP)",
        ),
        &[],
    )
    .await
    .unwrap();

    for i in 1..=15 {
        let name = if i == 3 {
            Value::Null
        } else {
            Value::from(format!("user{}", i))
        };
        main.exec(
            &Query::from(
                "INSERT INTO users (id, name, active, score, visits, joined) \
                 VALUES ($1, $2, $3, $4, $5, now())",
            ),
            &[
                Value::Int(i),
                name,
                Value::Bool(i % 2 == 0),
                Value::Float(i as f64 / 2.0),
                Value::Int(i * 100),
            ],
        )
        .await
        .unwrap();
    }

    // Zero limit applies the default of 10
    let records = main
        .materialized_query(&Query::from("SELECT * FROM users ORDER BY id"), &[], 0)
        .await
        .unwrap();
    assert_eq!(records.len(), 10);
    assert_eq!(records[0]["id"], Value::Int(1));
    assert_eq!(records[0]["active"], Value::Bool(false));
    assert_eq!(records[0]["score"], Value::Float(0.5));
    assert_eq!(records[0]["visits"], Value::Int(100));
    assert!(matches!(&records[0]["joined"], Value::Text(t) if !t.is_empty()));

    // Null name becomes empty text, key still present
    assert_eq!(records[2]["name"], Value::Text(String::new()));

    let records = main
        .materialized_query(
            &Query::from("SELECT id, name FROM users WHERE id > $1 ORDER BY id"),
            &[Value::Int(12)],
            5,
        )
        .await
        .unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(records[0]["name"], Value::Text("user13".to_string()));

    registry
        .register(
            "broken",
            Arc::new(PostgresConnector::new(PostgresConfig::new(
                "localhost", 1, "postgres", "postgres", "dbfan",
            ))),
        )
        .await;

    let dispatcher = Dispatcher::new(registry.clone());
    let template = BatchTemplate::new(
        vec!["main".to_string(), "broken".to_string(), "missing".to_string()],
        "SELECT id FROM users ORDER BY id",
        4,
    );
    let outcomes = dispatcher.dispatch_batch(&template).await.unwrap();
    assert_eq!(outcomes.len(), 3);

    let main_outcome = outcomes.iter().find(|o| o.target == "main").unwrap();
    assert!(main_outcome.is_success());
    assert_eq!(main_outcome.records.len(), 4);
    assert!(outcomes.iter().any(|o| o.target == "broken" && !o.is_success()));
    assert!(outcomes.iter().any(|o| o.target == "missing" && !o.is_success()));

    registry.close_all().await;
}

#[tokio::test]
async fn test_postgres_transaction_and_ids() {
    let Some(db) = start_postgres().await else {
        return;
    };

    let registry = HandleRegistry::new();
    let handle = registry
        .register("main", Arc::new(PostgresConnector::new(db.config.clone())))
        .await;

    handle
        .exec(&Query::from("CREATE TABLE ledger (amount INT4 NOT NULL)"), &[])
        .await
        .unwrap();

    let committed = handle
        .exec_in_transaction(&[
            Statement::new("INSERT INTO ledger VALUES ($1)").with_params(vec![Value::Int(5)]),
            Statement::new("INSERT INTO ledger VALUES ($1), ($2)")
                .with_params(vec![Value::Int(6), Value::Int(7)]),
        ])
        .await
        .unwrap();
    assert_eq!(committed, 3);

    let err = handle
        .exec_in_transaction(&[
            Statement::new("INSERT INTO ledger VALUES (8)"),
            Statement::new("INSERT INTO ledger VALUES (NULL)"),
        ])
        .await
        .unwrap_err();
    assert!(matches!(err, DataError::QueryFailed(_)));

    let records = handle
        .materialized_query(&Query::from("SELECT count(*) AS n FROM ledger"), &[], 1)
        .await
        .unwrap();
    assert_eq!(records[0]["n"], Value::Int(3));

    let id = handle.generate_id().await;
    assert_eq!(id.len(), 32);
    assert!(id.chars().all(|c| c.is_ascii_hexdigit()));

    let err = handle
        .materialized_query(&Query::from("SELECT * FROM no_such_table"), &[], 1)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no_such_table"));

    handle.close().await.unwrap();
    assert!(!handle.is_ready().await);
}

#[tokio::test]
async fn test_postgres_reconnects_after_backend_termination() {
    let Some(db) = start_postgres().await else {
        return;
    };

    let registry = HandleRegistry::new();
    let main = registry
        .register("main", Arc::new(PostgresConnector::new(db.config.clone())))
        .await;
    let admin = registry
        .register("admin", Arc::new(PostgresConnector::new(db.config.clone())))
        .await;

    let records = main
        .materialized_query(&Query::from("SELECT pg_backend_pid() AS pid"), &[], 1)
        .await
        .unwrap();
    let pid = records[0]["pid"].clone();

    admin
        .materialized_query(&Query::from("SELECT pg_terminate_backend($1)"), &[pid.clone()], 1)
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;

    let records = main
        .materialized_query(&Query::from("SELECT pg_backend_pid() AS pid"), &[], 1)
        .await
        .unwrap();
    assert_ne!(records[0]["pid"], pid);

    registry.close_all().await;
}

#[tokio::test]
async fn test_postgres_arrays_and_bytea_render_as_text() {
    let Some(db) = start_postgres().await else {
        return;
    };

    let handle = HandleRegistry::new()
        .register("main", Arc::new(PostgresConnector::new(db.config.clone())))
        .await;

    let records = handle
        .materialized_query(
            &Query::from("SELECT ARRAY[1, NULL, 3] AS a, '\\xcafe'::bytea AS b"),
            &[],
            1,
        )
        .await
        .unwrap();
    assert_eq!(records[0]["a"], Value::from(r#"["1",null,"3"]"#));
    assert_eq!(records[0]["b"], Value::from("cafe"));

    let err = handle
        .materialized_query(&Query::from("SELECT interval '1 day' AS i"), &[], 1)
        .await
        .unwrap_err();
    assert!(matches!(err, DataError::ReadFailed(_)));

    handle.close().await.unwrap();
}
