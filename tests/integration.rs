//! Integration test runner
//!
//! Most suites run against a scripted in-process backend (`common`) and need
//! nothing else. `sqlite_tests` uses a temporary database file.
//! `postgres_tests` needs a running server and skips itself otherwise.
//!
//! Environment variables for the PostgreSQL suite (with defaults):
//! - TEST_DB_HOST: localhost
//! - TEST_DB_PORT: 5433
//! - TEST_DB_NAME: test_db
//! - TEST_DB_USER: test_user
//! - TEST_DB_PASSWORD: test_password

mod common;

#[path = "integration/results.rs"]
mod results;

#[path = "integration/schema_index.rs"]
mod schema_index;

#[path = "integration/sessions.rs"]
mod sessions;

#[path = "integration/statements.rs"]
mod statements;

#[cfg(feature = "sqlite")]
#[path = "integration/sqlite_tests.rs"]
mod sqlite_tests;

#[cfg(feature = "postgres")]
#[path = "integration/postgres_tests.rs"]
mod postgres_tests;
