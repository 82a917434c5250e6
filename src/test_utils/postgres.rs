//! A real server for the live-driver tests.
//!
//! When `PGHOST` is set the standard libpq variables describe the server.
//! Otherwise, with the `test-utils-postgres` feature, an embedded instance is
//! started for the test and stopped by [`LiveServer::stop`].

use std::env;
use std::error::Error;

use crate::config::PoolKey;

#[cfg(feature = "test-utils-postgres")]
use postgresql_embedded::PostgreSQL;

pub type LiveResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

/// A reachable server and the descriptor that opens connections to it.
pub struct LiveServer {
    pub key: PoolKey,
    #[cfg(feature = "test-utils-postgres")]
    embedded: Option<PostgreSQL>,
}

impl std::fmt::Debug for LiveServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveServer")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl LiveServer {
    /// Stop the embedded instance, if this test started one.
    pub async fn stop(self) {
        #[cfg(feature = "test-utils-postgres")]
        if let Some(postgresql) = self.embedded {
            let _ = postgresql.stop().await;
        }
    }
}

fn key_from_env(host: String) -> LiveResult<PoolKey> {
    let mut key = PoolKey::new().with("host", host)?;
    for (var, option) in [
        ("PGPORT", "port"),
        ("PGUSER", "user"),
        ("PGPASSWORD", "password"),
        ("PGDATABASE", "dbname"),
    ] {
        if let Ok(value) = env::var(var) {
            key = key.with(option, value)?;
        }
    }
    Ok(key.with("application_name", "pqm-live-tests")?)
}

/// The server to run live tests against, or `None` when there is none and
/// the caller should skip.
///
/// `dbname` is created on an embedded instance; an external server uses
/// `PGDATABASE` as given.
///
/// # Errors
/// Returns an error when the environment names invalid options or the
/// embedded instance cannot be set up.
pub async fn live_server(dbname: &str) -> LiveResult<Option<LiveServer>> {
    if let Ok(host) = env::var("PGHOST") {
        return Ok(Some(LiveServer {
            key: key_from_env(host)?,
            #[cfg(feature = "test-utils-postgres")]
            embedded: None,
        }));
    }
    start_embedded(dbname).await
}

#[cfg(feature = "test-utils-postgres")]
async fn start_embedded(dbname: &str) -> LiveResult<Option<LiveServer>> {
    let mut postgresql = PostgreSQL::default();
    postgresql.setup().await?;
    postgresql.start().await?;
    postgresql.create_database(dbname).await?;

    let settings = postgresql.settings();
    let key = PoolKey::from_pairs([
        ("host", settings.host.clone()),
        ("port", settings.port.to_string()),
        ("user", settings.username.clone()),
        ("password", settings.password.clone()),
        ("dbname", dbname.to_string()),
    ])?;
    tracing::debug!(port = settings.port, dbname, "embedded postgres started");
    Ok(Some(LiveServer {
        key,
        embedded: Some(postgresql),
    }))
}

#[cfg(not(feature = "test-utils-postgres"))]
async fn start_embedded(_dbname: &str) -> LiveResult<Option<LiveServer>> {
    Ok(None)
}
