//! Tests for the database API.
//!
//! These tests help verify the storage backends. The [`run_test`] function
//! sets up a pool and gives your callback a connection to interact with. The
//! general form of a test is:
//!
//! ```rust
//! #[test]
//! fn example() {
//!     run_test(|mut connection| async move {
//!         // Call methods on `connection` and verify its behavior.
//!     });
//! }
//! ```
//!
//! The `run_test` function always runs your test against the in-memory
//! backend, and against Postgres when `TEST_DB_URL` points at a database.
//! The Postgres database is shared between tests, so tests must use their
//! own user ids and endpoints.

use clinic_notifier::db::{Connection, Pool};
use std::future::Future;

mod linking;
mod logs;
mod markers;
mod subscriptions;

fn block_on<Fut: Future<Output = ()>>(fut: Fut) {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(fut);
}

fn run_test<F, Fut>(f: F)
where
    F: Fn(Box<dyn Connection>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send,
{
    if let Ok(url) = std::env::var("TEST_DB_URL") {
        eprintln!("testing Postgres");
        let pool = Pool::open(&url);
        block_on(async { f(pool.connection().await.unwrap()).await });
    }

    eprintln!("testing the in-memory backend");
    let pool = Pool::open("memory:");
    block_on(async { f(pool.connection().await.unwrap()).await });
}
