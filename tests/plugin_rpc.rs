//! End-to-end tests driving the stub plugin binary through the pool.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tabwire::host::{ConnectionPool, PluginClient, PluginError};
use tabwire::protocol::{ColumnType, PluginConfig, QueryConstraint};

const PLUGIN_BIN: &str = env!("CARGO_BIN_EXE_tabwire-stub-plugin");

fn token_config() -> PluginConfig {
    [("token", json!("abc"))].into_iter().collect()
}

#[tokio::test]
async fn test_initialize_query_close_round_trip() {
    let pool = ConnectionPool::new();
    let client = pool.new_client(PLUGIN_BIN).await.expect("spawn + handshake");

    let schema = client
        .initialize(1, 0, token_config())
        .await
        .expect("initialize");
    assert_eq!(schema.columns.len(), 2);
    assert_eq!(schema.columns[0].name, "id");
    assert_eq!(schema.columns[0].column_type, ColumnType::Int);
    assert_eq!(schema.columns[1].name, "name");
    assert_eq!(schema.columns[1].column_type, ColumnType::Text);

    let (rows, exhausted) = client
        .query(1, 0, 0, QueryConstraint::default())
        .await
        .expect("query");
    assert_eq!(
        rows,
        vec![vec![json!(1), json!("hello")], vec![json!(2), json!("world")]]
    );
    assert!(exhausted);

    client.close(1).await.expect("close");

    pool.close_connection(PLUGIN_BIN, 1).await;
    assert!(pool.is_empty().await);
}

#[tokio::test]
async fn test_query_before_initialize_is_refused() {
    let pool = ConnectionPool::new();
    let client = pool.new_client(PLUGIN_BIN).await.unwrap();

    let err = client
        .query(1, 0, 0, QueryConstraint::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PluginError::ProtocolViolation(_)));

    pool.close_connection(PLUGIN_BIN, 1).await;
}

#[tokio::test]
async fn test_panic_in_one_table_leaves_siblings_usable() {
    let pool = ConnectionPool::new();
    let client = pool.new_client(PLUGIN_BIN).await.unwrap();

    client.initialize(1, 0, PluginConfig::new()).await.unwrap();
    client.initialize(1, 2, PluginConfig::new()).await.unwrap();

    let err = client
        .query(1, 2, 0, QueryConstraint::default())
        .await
        .unwrap_err();
    match err {
        PluginError::PluginPanic(message) => {
            assert!(message.contains("Query"), "unexpected message: {message}");
        }
        other => panic!("expected a panic error, got {other:?}"),
    }

    // The process survived and unrelated tables still answer.
    let (rows, _) = client
        .query(1, 0, 0, QueryConstraint::default())
        .await
        .expect("sibling table still works");
    assert_eq!(rows.len(), 2);

    pool.close_connection(PLUGIN_BIN, 1).await;
}

#[tokio::test]
async fn test_undeclared_insert_support_is_detected() {
    let pool = ConnectionPool::new();
    let client = pool.new_client(PLUGIN_BIN).await.unwrap();

    // Table 3 implements insert but does not declare it in its schema.
    let schema = client.initialize(1, 3, PluginConfig::new()).await.unwrap();
    assert!(schema.handles_insert);
    assert!(!schema.handles_update);

    client
        .insert(1, 3, vec![vec![json!(9), json!("nine")]])
        .await
        .expect("insert on a structurally capable table");

    // Table 0 implements none of the mutations.
    client.initialize(1, 0, PluginConfig::new()).await.unwrap();
    let err = client.insert(1, 0, vec![]).await.unwrap_err();
    assert!(matches!(err, PluginError::Unsupported(_)));

    pool.close_connection(PLUGIN_BIN, 1).await;
}

#[tokio::test]
async fn test_pool_spawns_once_and_kills_after_last_close() {
    const CONNECTIONS: i64 = 8;

    let pool = Arc::new(ConnectionPool::new());

    let handles: Vec<_> = (0..CONNECTIONS)
        .map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move { pool.new_client(PLUGIN_BIN).await })
        })
        .collect();

    let mut clients: Vec<Arc<PluginClient>> = Vec::new();
    for handle in handles {
        clients.push(handle.await.unwrap().expect("new_client"));
    }

    // Every caller got the same subprocess.
    assert_eq!(pool.len().await, 1);
    for client in &clients[1..] {
        assert!(Arc::ptr_eq(&clients[0], client));
    }

    for connection_id in 0..CONNECTIONS - 1 {
        pool.close_connection(PLUGIN_BIN, connection_id).await;
    }

    // Still referenced: the subprocess must survive N-1 closes.
    assert_eq!(pool.len().await, 1);
    assert!(clients[0].is_alive());
    clients[0]
        .initialize(99, 0, PluginConfig::new())
        .await
        .expect("pooled plugin still serves");

    pool.close_connection(PLUGIN_BIN, CONNECTIONS - 1).await;
    assert!(pool.is_empty().await);

    // Give the kill a moment to propagate to the reader task.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!clients[0].is_alive());
}

#[tokio::test]
async fn test_connecting_to_a_non_plugin_fails_the_handshake() {
    let pool = ConnectionPool::new();
    // `true` exits immediately without ever answering the handshake.
    let err = pool.new_client("true").await.unwrap_err();
    assert!(
        matches!(err, PluginError::HandshakeFailed(_)),
        "expected a handshake failure, got {err:?}"
    );
    assert!(pool.is_empty().await);
}
