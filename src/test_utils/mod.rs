//! In-memory stand-ins for a Postgres server, and a live-server harness,
//! for tests and benchmarks.

mod mock;
pub mod postgres;
pub mod test_helpers;

pub use mock::{
    MockCancel, MockConnection, MockDriver, MockResponse, MockServer, column_names,
};
pub use postgres::{LiveServer, live_server};
pub use test_helpers::{create_test_row, test_key};
