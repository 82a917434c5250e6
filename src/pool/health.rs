use crate::config::PoolSettings;
use crate::native::{ConnStatus, ExecStatus, NativeConnection, TransactionStatus};

fn is_idle_and_ok<C: NativeConnection>(conn: &C) -> bool {
    conn.status() == ConnStatus::Ok && conn.transaction_status() == TransactionStatus::Idle
}

/// Send an empty query and require the empty-query completion, polling at
/// most `probe_retries` times before giving up.
pub(crate) async fn probe<C: NativeConnection>(conn: &mut C, settings: &PoolSettings) -> bool {
    if conn.send_query("").await.is_err() {
        return false;
    }

    let mut attempt = 0;
    loop {
        if conn.consume_input().await.is_err() {
            return false;
        }
        if !conn.is_busy() {
            break;
        }
        if attempt >= settings.probe_retries {
            tracing::debug!(attempts = attempt, "liveness probe timed out");
            return false;
        }
        attempt += 1;
        tokio::time::sleep(settings.probe_interval).await;
    }

    let mut status = ExecStatus::EmptyQuery;
    while let Some(chunk) = conn.get_result().await {
        if chunk.status != ExecStatus::EmptyQuery {
            status = chunk.status;
        }
    }
    status == ExecStatus::EmptyQuery
}

/// Check a pooled connection before handing it out, reconnecting in place
/// once if it fails. `false` means the connection must be closed.
pub(crate) async fn check_or_reset<C: NativeConnection>(
    conn: &mut C,
    settings: &PoolSettings,
) -> bool {
    if is_idle_and_ok(conn) && probe(conn, settings).await {
        return true;
    }

    tracing::debug!(error = %conn.error_message(), "pooled connection failed validation; resetting");
    if let Err(err) = conn.reset().await {
        tracing::debug!(error = %err, "reset failed");
        return false;
    }
    is_idle_and_ok(conn)
}

/// Roll back any open transaction and drop session state so the connection
/// can be reused. `false` means the connection must be closed.
pub(crate) async fn discard<C: NativeConnection>(conn: &mut C) -> bool {
    if conn.status() != ConnStatus::Ok {
        return false;
    }

    match conn.transaction_status() {
        TransactionStatus::Idle => {}
        TransactionStatus::InTransaction | TransactionStatus::InError => {
            let rollback = conn.exec("ROLLBACK").await;
            if rollback.status != ExecStatus::CommandOk {
                return false;
            }
        }
        TransactionStatus::Active | TransactionStatus::Unknown => return false,
    }

    let reset = conn.exec("DISCARD ALL").await;
    reset.status == ExecStatus::CommandOk && is_idle_and_ok(conn)
}
