use pq_middleware::native::TransactionStatus;
use pq_middleware::test_utils::{MockConnection, MockResponse, MockServer, test_key};
use pq_middleware::transaction::{self, IsolationLevel};
use pq_middleware::{
    Command, CommandType, ConnectionPool, NativeConnection, NativeDriver, PoolSettings,
    PqMiddlewareError, RowValues,
};
use tokio_postgres::types::Type;

type TestResult = Result<(), Box<dyn std::error::Error>>;

async fn connect(server: &MockServer) -> Result<MockConnection, PqMiddlewareError> {
    server.driver().connect(&test_key("shop")).await
}

#[tokio::test]
async fn test04_non_query_sums_every_statement() -> TestResult {
    let server = MockServer::new();
    server.script("insert into audit(msg) values ($1)", MockResponse::Command(1));
    server.script("update stock set qty = qty - $2 where sku = $3", MockResponse::Command(4));
    let mut conn = connect(&server).await?;

    let mut cmd = Command::new(
        "insert into audit(msg) values (:msg);\n\
         update stock set qty = qty - :n where sku = :sku",
    );
    cmd.bind("sku", "A-1")?.bind("n", 2)?.bind("msg", "restock")?;
    assert_eq!(cmd.execute_non_query(&mut conn).await?, 5);
    assert_eq!(server.user_statements().len(), 2);
    Ok(())
}

#[tokio::test]
async fn test04_stored_procedure_fills_outputs() -> TestResult {
    let server = MockServer::new();
    server.script(
        "SELECT * FROM place_order($1, $2)",
        MockResponse::rows(
            &[("order_id", Type::INT8), ("status", Type::TEXT)],
            vec![vec![991.into(), "queued".into()]],
        ),
    );
    let mut conn = connect(&server).await?;

    let mut cmd = Command::new("place_order").with_type(CommandType::StoredProcedure);
    cmd.parameters_mut().add("customer", 12)?;
    cmd.parameters_mut().add("sku", "A-1")?;
    cmd.parameters_mut().add_output("ORDER_ID", Type::INT8)?;
    cmd.parameters_mut().add_output("status", Type::TEXT)?;

    cmd.execute_non_query(&mut conn).await?;
    assert_eq!(cmd.parameters().value("order_id"), Some(&RowValues::Int(991)));
    assert_eq!(
        cmd.parameters().value("status"),
        Some(&RowValues::Text("queued".into()))
    );
    Ok(())
}

#[tokio::test]
async fn test04_table_direct_and_scalar() -> TestResult {
    let server = MockServer::new();
    server.script(
        "TABLE regions",
        MockResponse::rows(
            &[("code", Type::TEXT)],
            vec![vec!["eu".into()], vec!["us".into()]],
        ),
    );
    let mut conn = connect(&server).await?;

    let mut cmd = Command::new("regions").with_type(CommandType::TableDirect);
    assert_eq!(
        cmd.execute_scalar(&mut conn).await?,
        Some(RowValues::Text("eu".into()))
    );
    // The remaining row was drained, so the connection takes a new command.
    assert!(!conn.is_busy());
    assert_eq!(cmd.execute_scalar(&mut conn).await?, Some(RowValues::Text("eu".into())));
    Ok(())
}

#[tokio::test]
async fn test04_missing_parameter_is_reported_before_sending() -> TestResult {
    let server = MockServer::new();
    let mut conn = connect(&server).await?;

    let mut cmd = Command::new("select :a; select :b");
    cmd.bind("a", 1)?;
    let err = cmd.execute_non_query(&mut conn).await.unwrap_err();
    assert!(matches!(err, PqMiddlewareError::BindingError(ref name) if name == ":b"));
    assert!(server.executed().is_empty());
    Ok(())
}

#[tokio::test]
async fn test04_untyped_null_is_sent_as_unknown() -> TestResult {
    let server = MockServer::new();
    server.script("select $1", MockResponse::Echo);
    let mut conn = connect(&server).await?;

    let mut cmd = Command::new("select :nothing");
    cmd.bind("nothing", RowValues::Null)?;
    assert_eq!(cmd.execute_scalar(&mut conn).await?, None);

    let mut stream = cmd.execute_reader(&mut conn).await?;
    assert!(stream.advance().await?);
    assert_eq!(stream.columns()[0].type_oid, Type::UNKNOWN.oid());
    assert_eq!(stream.values()?, vec![RowValues::Null]);
    stream.close().await;

    let mut typed = Command::new("select :nothing");
    typed
        .parameters_mut()
        .add_typed("nothing", Type::INT4, RowValues::Null)?;
    let mut stream = typed.execute_reader(&mut conn).await?;
    assert!(stream.advance().await?);
    assert_eq!(stream.columns()[0].type_oid, Type::INT4.oid());
    stream.close().await;
    Ok(())
}

#[tokio::test]
async fn test04_transaction_commit_and_rollback() -> TestResult {
    let server = MockServer::new();
    let mut conn = connect(&server).await?;

    let mut tx = transaction::begin(&mut conn, IsolationLevel::RepeatableRead).await?;
    assert_eq!(tx.isolation_level(), IsolationLevel::RepeatableRead);
    assert_eq!(tx.conn().transaction_status(), TransactionStatus::InTransaction);
    tx.execute_non_query(&mut Command::new("delete from carts")).await?;
    tx.commit().await?;
    assert_eq!(conn.transaction_status(), TransactionStatus::Idle);

    let tx = transaction::begin(&mut conn, IsolationLevel::default()).await?;
    tx.rollback().await?;
    assert_eq!(conn.transaction_status(), TransactionStatus::Idle);

    assert_eq!(
        server.user_statements(),
        [
            "BEGIN ISOLATION LEVEL REPEATABLE READ",
            "delete from carts",
            "COMMIT",
            "BEGIN ISOLATION LEVEL READ COMMITTED",
            "ROLLBACK",
        ]
    );
    Ok(())
}

#[tokio::test]
async fn test04_failed_statement_poisons_the_transaction() -> TestResult {
    let server = MockServer::new();
    server.script("select 1/0", MockResponse::error("22012", "division by zero"));
    let mut conn = connect(&server).await?;

    let mut tx = transaction::begin(&mut conn, IsolationLevel::Serializable).await?;
    let err = tx.execute_scalar(&mut Command::new("select 1/0")).await.unwrap_err();
    assert_eq!(err.sql_state(), Some("22012"));
    assert_eq!(tx.conn().transaction_status(), TransactionStatus::InError);

    let err = tx
        .execute_non_query(&mut Command::new("select 2"))
        .await
        .unwrap_err();
    assert_eq!(err.sql_state(), Some("25P02"));
    tx.rollback().await?;
    assert_eq!(conn.transaction_status(), TransactionStatus::Idle);
    Ok(())
}

#[tokio::test]
async fn test04_begin_failure_is_a_query_error() -> TestResult {
    let server = MockServer::new();
    let mut conn = connect(&server).await?;
    server.kill_all();
    let err = transaction::begin(&mut conn, IsolationLevel::Serializable)
        .await
        .unwrap_err();
    assert_eq!(err.sql_state(), Some("08006"));
    Ok(())
}

#[tokio::test]
async fn test04_pooled_round_trip() -> TestResult {
    let server = MockServer::new();
    server.script(
        "select $1::int8 + 1",
        MockResponse::rows(&[("?column?", Type::INT8)], vec![vec![42.into()]]),
    );
    let pool = ConnectionPool::new(server.driver(), PoolSettings::default());
    let key = test_key("shop");

    let mut conn = pool.get_connection(&key).await?;
    let mut cmd = Command::new("select :n::int8 + 1");
    cmd.parameters_mut().add("n", 41)?;
    assert_eq!(conn.execute_scalar(&mut cmd).await?, Some(RowValues::Int(42)));

    let mut stream = conn.execute_reader(&mut cmd).await?;
    assert!(stream.advance().await?);
    stream.close().await;
    conn.close().await;

    assert_eq!(pool.idle_count(&key), 1);
    Ok(())
}
