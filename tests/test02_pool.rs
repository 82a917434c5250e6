use std::time::Duration;

use pq_middleware::test_utils::{MockDriver, MockResponse, MockServer, test_key};
use pq_middleware::{
    Command, ConnectionPool, IsolationLevel, NativeConnection, PoolSettings, PqMiddlewareError,
    RowValues,
};
use tokio_postgres::types::Type;

fn pool(server: &MockServer, settings: PoolSettings) -> ConnectionPool<MockDriver> {
    ConnectionPool::new(server.driver(), settings)
}

#[tokio::test]
async fn test02_released_connection_is_reused_after_reset() -> Result<(), PqMiddlewareError> {
    let server = MockServer::new();
    let pool = pool(&server, PoolSettings::default());
    let key = test_key("orders");

    let conn = pool.acquire(&key).await?;
    let first_id = conn.id();
    pool.release(&key, conn).await;
    assert_eq!(pool.idle_count(&key), 1);
    assert!(server.executed().contains(&"DISCARD ALL".to_string()));

    let conn = pool.acquire(&key).await?;
    assert_eq!(conn.id(), first_id);
    assert_eq!(server.connects(), 1);
    assert_eq!(pool.idle_count(&key), 0);
    pool.release(&key, conn).await;
    Ok(())
}

#[tokio::test]
async fn test02_keys_never_share_connections() -> Result<(), PqMiddlewareError> {
    let server = MockServer::new();
    let pool = pool(&server, PoolSettings::default());
    let orders = test_key("orders");
    let billing = test_key("billing");

    let a = pool.acquire(&orders).await?;
    let a_id = a.id();
    pool.release(&orders, a).await;

    let b = pool.acquire(&billing).await?;
    assert_ne!(b.id(), a_id);
    assert_eq!(pool.idle_count(&orders), 1);
    assert_eq!(pool.idle_count(&billing), 0);
    pool.release(&billing, b).await;

    assert_eq!(pool.total_idle(), 2);
    assert_eq!(server.connects(), 2);
    Ok(())
}

#[tokio::test]
async fn test02_broken_socket_is_reset_in_place() -> Result<(), PqMiddlewareError> {
    let server = MockServer::new();
    let pool = pool(&server, PoolSettings::default());
    let key = test_key("orders");

    let conn = pool.acquire(&key).await?;
    pool.release(&key, conn).await;
    server.kill_all();

    let conn = pool.acquire(&key).await?;
    assert_eq!(server.resets(), 1);
    assert_eq!(server.connects(), 1);
    assert_eq!(conn.status(), pq_middleware::native::ConnStatus::Ok);
    pool.release(&key, conn).await;
    Ok(())
}

#[tokio::test]
async fn test02_unrecoverable_connection_is_replaced() -> Result<(), PqMiddlewareError> {
    let server = MockServer::new();
    let pool = pool(&server, PoolSettings::default());
    let key = test_key("orders");

    let conn = pool.acquire(&key).await?;
    let old_id = conn.id();
    pool.release(&key, conn).await;
    server.kill_all();
    server.set_fail_reset(true);

    let conn = pool.acquire(&key).await?;
    assert_ne!(conn.id(), old_id);
    assert_eq!(server.connects(), 2);
    assert_eq!(server.closes(), 1);
    pool.release(&key, conn).await;
    Ok(())
}

#[tokio::test]
async fn test02_slow_probe_counts_as_dead() -> Result<(), PqMiddlewareError> {
    let server = MockServer::new();
    let settings = PoolSettings::default().with_probe(3, Duration::from_millis(1));
    let pool = pool(&server, settings);
    let key = test_key("orders");

    let conn = pool.acquire(&key).await?;
    pool.release(&key, conn).await;

    server.set_busy_polls(100);
    let conn = pool.acquire(&key).await?;
    assert_eq!(server.resets(), 1);
    server.set_busy_polls(0);
    pool.release(&key, conn).await;
    Ok(())
}

#[tokio::test]
async fn test02_failed_connect_is_a_connection_error() {
    let server = MockServer::new();
    server.set_fail_connect(true);
    let pool = pool(&server, PoolSettings::default());

    let err = pool.acquire(&test_key("orders")).await.unwrap_err();
    assert!(matches!(err, PqMiddlewareError::ConnectionError(_)));
}

#[tokio::test]
async fn test02_bucket_capacity_closes_extras() -> Result<(), PqMiddlewareError> {
    let server = MockServer::new();
    let pool = pool(&server, PoolSettings::default().with_max_idle_per_key(2));
    let key = test_key("orders");

    let mut held = Vec::new();
    for _ in 0..3 {
        held.push(pool.acquire(&key).await?);
    }
    for conn in held {
        pool.release(&key, conn).await;
    }
    assert_eq!(pool.idle_count(&key), 2);
    assert_eq!(server.closes(), 1);
    Ok(())
}

#[tokio::test]
async fn test02_sweep_thins_long_idle_buckets() -> Result<(), PqMiddlewareError> {
    let server = MockServer::new();
    let pool = pool(&server, PoolSettings::default().with_visit_threshold(2));
    let key = test_key("orders");

    let mut held = Vec::new();
    for _ in 0..4 {
        held.push(pool.acquire(&key).await?);
    }
    for conn in held {
        pool.release(&key, conn).await;
    }

    pool.sweep().await;
    pool.sweep().await;
    assert_eq!(pool.idle_count(&key), 4);

    pool.sweep().await;
    assert_eq!(pool.idle_count(&key), 1);
    assert_eq!(server.closes(), 3);
    Ok(())
}

#[tokio::test]
async fn test02_visit_count_survives_checkout() -> Result<(), PqMiddlewareError> {
    let server = MockServer::new();
    let pool = pool(&server, PoolSettings::default().with_visit_threshold(1));
    let key = test_key("orders");

    let a = pool.acquire(&key).await?;
    let b = pool.acquire(&key).await?;
    pool.release(&key, a).await;
    pool.release(&key, b).await;

    pool.sweep().await;
    // The next head inherits the visit count, so the bucket is still thinned.
    let conn = pool.acquire(&key).await?;
    pool.sweep().await;
    assert_eq!(pool.idle_count(&key), 0);
    pool.release(&key, conn).await;
    assert_eq!(pool.idle_count(&key), 1);
    Ok(())
}

#[tokio::test]
async fn test02_open_transaction_is_rolled_back_on_release() -> Result<(), PqMiddlewareError> {
    let server = MockServer::new();
    let pool = pool(&server, PoolSettings::default());
    let key = test_key("orders");

    let mut conn = pool.get_connection(&key).await?;
    {
        let mut tx = conn.begin(IsolationLevel::Serializable).await?;
        tx.execute_non_query(&mut Command::new("update stock set qty = 0"))
            .await?;
    }
    conn.close().await;

    let executed = server.executed();
    let rollback = executed.iter().position(|s| s == "ROLLBACK");
    let discard = executed.iter().rposition(|s| s == "DISCARD ALL");
    assert!(rollback.is_some());
    assert!(rollback < discard);
    assert_eq!(pool.idle_count(&key), 1);
    Ok(())
}

#[tokio::test]
async fn test02_aborted_transaction_is_still_recovered() -> Result<(), PqMiddlewareError> {
    let server = MockServer::new();
    server.script("select boom()", MockResponse::error("P0001", "boom"));
    server.script(
        "select 1",
        MockResponse::rows(&[("?column?", Type::INT4)], vec![vec![RowValues::Int(1)]]),
    );
    let pool = pool(&server, PoolSettings::default());
    let key = test_key("orders");

    let mut conn = pool.get_connection(&key).await?;
    conn.execute_batch("BEGIN").await?;
    let err = conn.execute_batch("select boom()").await.unwrap_err();
    assert_eq!(err.sql_state(), Some("P0001"));
    conn.close().await;

    assert_eq!(pool.idle_count(&key), 1);
    let mut again = pool.get_connection(&key).await?;
    let value = again.execute_scalar(&mut Command::new("select 1")).await?;
    assert_eq!(value, Some(RowValues::Int(1)));
    again.close().await;
    Ok(())
}

#[tokio::test]
async fn test02_dropped_handle_returns_to_pool() -> Result<(), PqMiddlewareError> {
    let server = MockServer::new();
    let pool = pool(&server, PoolSettings::default());
    let key = test_key("orders");

    drop(pool.get_connection(&key).await?);
    for _ in 0..50 {
        if pool.idle_count(&key) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert_eq!(pool.idle_count(&key), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test02_concurrent_checkouts_never_share() -> Result<(), Box<dyn std::error::Error>> {
    let server = MockServer::new();
    let pool = pool(&server, PoolSettings::default());
    let key = test_key("orders");

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let pool = pool.clone();
        let key = key.clone();
        tasks.push(tokio::spawn(async move {
            let mut ids = Vec::new();
            for _ in 0..10 {
                let conn = pool.acquire(&key).await?;
                ids.push(conn.id());
                tokio::task::yield_now().await;
                pool.release(&key, conn).await;
            }
            Ok::<_, PqMiddlewareError>(ids)
        }));
    }
    for task in tasks {
        task.await??;
    }

    assert!(server.connects() <= 16);
    assert_eq!(server.open_connections(), pool.idle_count(&key));
    Ok(())
}

#[tokio::test]
async fn test02_background_sweeper_and_shutdown() -> Result<(), PqMiddlewareError> {
    let server = MockServer::new();
    let settings = PoolSettings::default()
        .with_sweep_interval(Duration::from_millis(10))
        .with_visit_threshold(0);
    let pool = ConnectionPool::start(server.driver(), settings)?;
    let key = test_key("orders");

    let a = pool.acquire(&key).await?;
    let b = pool.acquire(&key).await?;
    pool.release(&key, a).await;
    pool.release(&key, b).await;

    for _ in 0..100 {
        if pool.idle_count(&key) == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(pool.idle_count(&key), 0);

    let c = pool.acquire(&key).await?;
    pool.release(&key, c).await;
    pool.shutdown().await;
    assert_eq!(pool.total_idle(), 0);
    assert_eq!(server.open_connections(), 0);
    Ok(())
}

#[test]
fn test02_start_requires_a_runtime() {
    let server = MockServer::new();
    let err = ConnectionPool::start(server.driver(), PoolSettings::default()).unwrap_err();
    assert!(matches!(err, PqMiddlewareError::ConfigError(_)));
}
