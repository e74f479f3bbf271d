use dbfan_query::{DataError, HandleRegistry, Query, Statement, Value};
use dbfan_query_redis::{RedisConfig, RedisConnector};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use testcontainers::core::{ContainerPort, WaitFor};
use testcontainers::{runners::AsyncRunner, GenericImage};

#[tokio::test]
async fn test_redis_commands_as_records() {
    let container = match GenericImage::new("redis", "7-alpine")
        .with_exposed_port(ContainerPort::Tcp(6379))
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"))
        .start()
        .await
    {
        Ok(container) => container,
        Err(e) => {
            println!("⚠️  Docker not available, skipping test: {}", e);
            return;
        }
    };

    let port = container
        .get_host_port_ipv4(6379)
        .await
        .expect("Failed to get redis port");

    let config = RedisConfig {
        host: format!("localhost:{}", port),
        db: 1,
        ..Default::default()
    };
    let registry = HandleRegistry::new();
    let handle = registry
        .register("cache", Arc::new(RedisConnector::new(config)))
        .await;

    let written = handle
        .exec(&Query::from("HSET user:1"), &[
            Value::from("name"),
            Value::from("alice"),
            Value::from("visits"),
            Value::Int(3),
        ])
        .await
        .unwrap();
    assert_eq!(written, 2);

    let records = handle
        .materialized_query(&Query::from("HGETALL user:1"), &[], 10)
        .await
        .unwrap();
    assert_eq!(records.len(), 2);
    assert!(records
        .iter()
        .any(|r| r["field"] == Value::from("name") && r["value"] == Value::from("alice")));

    for job in ["a", "b", "c", "d"] {
        handle
            .exec(&Query::from("RPUSH jobs"), &[Value::from(job)])
            .await
            .unwrap();
    }
    let records = handle
        .materialized_query(&Query::from("LRANGE jobs 0 -1"), &[], 3)
        .await
        .unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(records[0]["value"], Value::from("a"));

    let records = handle
        .materialized_query(&Query::from("GET missing"), &[], 10)
        .await
        .unwrap();
    assert!(records.is_empty());

    let affected = handle
        .exec_in_transaction(&[
            Statement::new("SET counter 10"),
            Statement::new("INCRBY counter").with_params(vec![Value::Int(5)]),
        ])
        .await
        .unwrap();
    assert_eq!(affected, 16);

    let records = handle
        .materialized_query(&Query::from("GET counter"), &[], 1)
        .await
        .unwrap();
    assert_eq!(records[0]["value"], Value::from("15"));

    let err = handle
        .materialized_query(&Query::from("NOTACOMMAND x"), &[], 1)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("NOTACOMMAND"));

    handle.close().await.unwrap();
}

/// Read one CRLF-terminated line starting at `from`
fn read_line(buffer: &[u8], from: usize) -> Option<(String, usize)> {
    let end = buffer[from..].windows(2).position(|w| w == b"\r\n")? + from;
    Some((String::from_utf8_lossy(&buffer[from..end]).into_owned(), end + 2))
}

/// One RESP array of bulk strings from the front of `buffer`, with its length
fn parse_command(buffer: &[u8]) -> Option<(Vec<String>, usize)> {
    let (header, mut pos) = read_line(buffer, 0)?;
    let count: usize = header.strip_prefix('*')?.parse().ok()?;

    let mut parts = Vec::with_capacity(count);
    for _ in 0..count {
        let (len, next) = read_line(buffer, pos)?;
        let len: usize = len.strip_prefix('$')?.parse().ok()?;
        let end = next + len;
        if buffer.len() < end + 2 {
            return None;
        }
        parts.push(String::from_utf8_lossy(&buffer[next..end]).into_owned());
        pos = end + 2;
    }
    Some((parts, pos))
}

/// Answers SENTINEL lookups with `master`, PING with PONG and anything else with OK
async fn serve(mut socket: TcpStream, master: Option<(String, u16)>) {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 1024];

    loop {
        while let Some((command, used)) = parse_command(&buffer) {
            buffer.drain(..used);
            let name = command.first().map(|c| c.to_ascii_uppercase());
            let reply = match name.as_deref() {
                Some("SENTINEL") => match &master {
                    Some((ip, port)) => {
                        let port = port.to_string();
                        format!(
                            "*2\r\n${}\r\n{}\r\n${}\r\n{}\r\n",
                            ip.len(),
                            ip,
                            port.len(),
                            port
                        )
                    }
                    None => "*-1\r\n".to_string(),
                },
                Some("PING") => "+PONG\r\n".to_string(),
                _ => "+OK\r\n".to_string(),
            };
            if socket.write_all(reply.as_bytes()).await.is_err() {
                return;
            }
        }

        match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buffer.extend_from_slice(&chunk[..n]),
        }
    }
}

async fn start_server(master: Option<(String, u16)>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(serve(socket, master.clone()));
        }
    });
    address
}

#[tokio::test]
async fn test_sentinel_resolves_master() {
    let master = start_server(None).await;
    let master_port: u16 = master.rsplit(':').next().unwrap().parse().unwrap();
    let sentinel = start_server(Some(("127.0.0.1".to_string(), master_port))).await;

    // The unreachable sentinel is skipped
    let config = RedisConfig::default()
        .with_sentinel(vec!["127.0.0.1:1".to_string(), sentinel], "main");
    let registry = HandleRegistry::new();
    let handle = registry
        .register("cache", Arc::new(RedisConnector::new(config)))
        .await;

    let records = handle
        .materialized_query(&Query::from("PING"), &[], 1)
        .await
        .unwrap();
    assert_eq!(records[0]["value"], Value::from("PONG"));

    let affected = handle
        .exec(&Query::from("SET greeting"), &[Value::from("hello")])
        .await
        .unwrap();
    assert_eq!(affected, 1);
}

#[tokio::test]
async fn test_sentinel_without_master_fails_to_connect() {
    let sentinel = start_server(None).await;

    let config = RedisConfig::default().with_sentinel(vec![sentinel], "unknown");
    let registry = HandleRegistry::new();
    let handle = registry
        .register("cache", Arc::new(RedisConnector::new(config)))
        .await;

    let err = handle.ensure_ready().await.unwrap_err();
    assert!(matches!(err, DataError::ConnectionFailed { .. }));
    assert!(err.to_string().contains("unknown"));
    assert!(!handle.is_ready().await);
}
