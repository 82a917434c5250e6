use pq_middleware::test_utils::{MockConnection, MockResponse, MockServer, column_names, test_key};
use pq_middleware::{
    CancelHandle, Command, NativeDriver, PqMiddlewareError, RowValues, StreamState,
};
use tokio_postgres::types::Type;

type TestResult = Result<(), Box<dyn std::error::Error>>;

async fn connect(server: &MockServer) -> Result<MockConnection, PqMiddlewareError> {
    server.driver().connect(&test_key("shop")).await
}

fn items(server: &MockServer) {
    server.script(
        "select id, name, note from items",
        MockResponse::rows(
            &[("id", Type::INT8), ("name", Type::TEXT), ("Note", Type::TEXT)],
            vec![
                vec![1.into(), "bolt".into(), RowValues::Null],
                vec![2.into(), "nut".into(), "metric".into()],
            ],
        ),
    );
}

#[tokio::test]
async fn test03_failing_statement_stops_the_batch() -> TestResult {
    let server = MockServer::new();
    items(&server);
    server.script(
        "insert into items(id) values ($1)",
        MockResponse::error("23505", "duplicate key value violates unique constraint"),
    );
    let mut conn = connect(&server).await?;

    let mut cmd = Command::new(
        "select id, name, note from items; insert into items(id) values (:id); select 3",
    );
    cmd.bind("id", 1)?;
    let mut stream = cmd.execute_reader(&mut conn).await?;
    assert_eq!(stream.statement_count(), 3);
    assert_eq!(stream.state(), StreamState::Executing(0));

    let mut seen = Vec::new();
    while stream.advance().await? {
        seen.push(stream.value(0)?);
    }
    assert_eq!(seen, vec![RowValues::Int(1), RowValues::Int(2)]);
    assert_eq!(stream.state(), StreamState::CommandCompleted(0));

    let err = stream.next_statement().await.unwrap_err();
    match &err {
        PqMiddlewareError::QueryError(diag) => {
            assert_eq!(diag.code, "23505");
            assert!(diag.message.contains("duplicate key"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(stream.state(), StreamState::Done);
    assert!(!stream.next_statement().await?);
    assert!(!stream.advance().await?);
    stream.close().await;

    let sent = server.user_statements();
    assert!(sent.iter().any(|s| s == "insert into items(id) values ($1)"));
    assert!(!sent.iter().any(|s| s == "select 3"));
    Ok(())
}

#[tokio::test]
async fn test03_schema_and_cell_access() -> TestResult {
    let server = MockServer::new();
    items(&server);
    let mut conn = connect(&server).await?;

    let mut cmd = Command::new("select id, name, note from items");
    let mut stream = cmd.execute_reader(&mut conn).await?;

    assert_eq!(stream.field_count(), 3);
    assert_eq!(column_names(stream.columns()), ["id", "name", "Note"]);
    assert_eq!(stream.columns()[0].type_name, "int8");
    assert_eq!(stream.ordinal("note")?, 2);
    assert_eq!(stream.ordinal("Note")?, 2);
    assert!(stream.ordinal("missing").is_err());
    assert!(matches!(
        stream.value(0),
        Err(PqMiddlewareError::InvalidOperation(_))
    ));

    assert!(stream.advance().await?);
    assert_eq!(stream.row_index(), Some(0));
    assert!(stream.is_null(2)?);
    assert_eq!(stream.value_by_name("NAME")?, RowValues::Text("bolt".into()));
    assert!(matches!(
        stream.value(7),
        Err(PqMiddlewareError::InvalidOperation(_))
    ));

    assert!(stream.advance().await?);
    let row = stream.current_row()?;
    assert_eq!(row.get("note"), Some(&RowValues::Text("metric".into())));
    assert_eq!(stream.values()?.len(), 3);

    assert!(!stream.advance().await?);
    assert!(stream.has_rows());
    assert_eq!(stream.records_affected(), None);
    stream.close().await;
    Ok(())
}

#[tokio::test]
async fn test03_command_statements_report_affected_rows() -> TestResult {
    let server = MockServer::new();
    server.script("update items set qty = 0", MockResponse::Command(3));
    let mut conn = connect(&server).await?;

    let mut cmd = Command::new("update items set qty = 0");
    let mut stream = cmd.execute_reader(&mut conn).await?;
    assert!(!stream.advance().await?);
    assert_eq!(stream.field_count(), 0);
    assert!(!stream.has_rows());
    assert_eq!(stream.records_affected(), Some(3));
    assert!(!stream.next_statement().await?);
    assert_eq!(stream.state(), StreamState::Done);
    Ok(())
}

#[tokio::test]
async fn test03_read_result_set_includes_current_row() -> TestResult {
    let server = MockServer::new();
    items(&server);
    let mut conn = connect(&server).await?;

    let mut cmd = Command::new("select id, name, note from items; select id, name, note from items");
    let mut stream = cmd.execute_reader(&mut conn).await?;
    assert!(stream.advance().await?);
    let first = stream.read_result_set().await?;
    assert_eq!(first.len(), 2);
    assert_eq!(first.results[1].get("name"), Some(&RowValues::Text("nut".into())));

    assert!(stream.next_statement().await?);
    let second = stream.read_result_set().await?;
    assert_eq!(second.len(), 2);
    assert_eq!(second.rows_affected, 2);
    Ok(())
}

#[tokio::test]
async fn test03_consume_leaves_connection_usable() -> TestResult {
    let server = MockServer::new();
    items(&server);
    server.script(
        "select 42",
        MockResponse::rows(&[("answer", Type::INT4)], vec![vec![42.into()]]),
    );
    let mut conn = connect(&server).await?;

    let mut cmd = Command::new("select id, name, note from items; select id, name, note from items");
    let mut stream = cmd.execute_reader(&mut conn).await?;
    assert!(stream.advance().await?);
    stream.consume().await;
    assert_eq!(stream.state(), StreamState::Done);
    assert!(!stream.advance().await?);
    stream.close().await;

    assert_eq!(server.user_statements().len(), 1);
    let answer = Command::new("select 42").execute_scalar(&mut conn).await?;
    assert_eq!(answer, Some(RowValues::Int(42)));
    Ok(())
}

#[tokio::test]
async fn test03_cancel_interrupts_a_long_result() -> TestResult {
    let server = MockServer::new();
    let rows = (0..1000).map(|i| vec![RowValues::Int(i)]).collect();
    server.script(
        "select n from generate_series(1, 1000) n",
        MockResponse::rows(&[("n", Type::INT8)], rows),
    );
    let mut conn = connect(&server).await?;

    let mut cmd = Command::new("select n from generate_series(1, 1000) n");
    let mut stream = cmd.execute_reader(&mut conn).await?;
    assert!(stream.advance().await?);
    assert!(stream.advance().await?);

    let handle = stream.cancel_handle();
    tokio::spawn(async move { handle.cancel().await }).await??;

    let err = stream.advance().await.unwrap_err();
    assert_eq!(err.sql_state(), Some("57014"));
    stream.consume().await;
    assert_eq!(server.cancels(), 1);
    Ok(())
}

#[tokio::test]
async fn test03_first_statement_error_surfaces_from_execute() -> TestResult {
    let server = MockServer::new();
    server.script("select * from nope", MockResponse::error("42P01", "relation \"nope\" does not exist"));
    let mut conn = connect(&server).await?;

    let err = Command::new("select * from nope")
        .execute_reader(&mut conn)
        .await
        .unwrap_err();
    assert_eq!(err.sql_state(), Some("42P01"));
    Ok(())
}

#[tokio::test]
async fn test03_parameters_are_sent_in_placeholder_order() -> TestResult {
    let server = MockServer::new();
    server.script("select $1, $2", MockResponse::Echo);
    let mut conn = connect(&server).await?;

    let mut cmd = Command::new("select :b, :a");
    cmd.bind("a", 7)?;
    cmd.bind("b", "seven")?;
    let mut stream = cmd.execute_reader(&mut conn).await?;
    assert!(stream.advance().await?);
    assert_eq!(
        stream.values()?,
        vec![RowValues::Text("seven".into()), RowValues::Int(7)]
    );
    stream.close().await;
    Ok(())
}

#[tokio::test]
async fn test03_empty_text_runs_nothing() -> TestResult {
    let server = MockServer::new();
    let mut conn = connect(&server).await?;

    let mut cmd = Command::new(" ;; ");
    let mut stream = cmd.execute_reader(&mut conn).await?;
    assert_eq!(stream.state(), StreamState::Done);
    assert!(!stream.advance().await?);
    assert!(server.user_statements().is_empty());
    Ok(())
}
