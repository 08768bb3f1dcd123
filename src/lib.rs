//! vizdb - data-access core of a keyboard-driven terminal client for SQL
//! backends
//!
//! vizdb connects to many kinds of databases behind one capability-driven
//! interface, runs statements without blocking the caller, and pages through
//! result sets of any size.
//!
//! # Architecture
//!
//! - [`db`]: provider registry, capability descriptors and driver adapters
//! - [`session`]: connection manager, sessions and secret prompting
//! - [`credentials`]: credential store over a keyring or local files
//! - [`tunnel`]: SSH tunnels in front of a backend
//! - [`engine`]: statement submission, cancellation and status
//! - [`results`]: windowed, filterable access to streamed rows
//! - [`export`]: CSV / JSON export over a forward-only cursor
//! - [`schema_index`]: introspection snapshots and autocomplete lookup
//! - [`discovery`]: docker containers and cloud CLI instances
//! - [`config`]: connection profiles and settings
//! - [`error`]: error types and result aliases
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use vizdb::config::ConnectionProfile;
//! use vizdb::credentials::CredentialStore;
//! use vizdb::db::ProviderRegistry;
//! use vizdb::engine::{EngineOptions, OutputShape, QueryEngine};
//! use vizdb::results::{ResultSet, VirtualizerOptions};
//! use vizdb::session::ConnectionManager;
//! use vizdb::workers::WorkerPool;
//!
//! # async fn example() -> vizdb::Result<()> {
//! let (profile, secret) = ConnectionProfile::from_url("postgres://app:pw@localhost/shop")?;
//! let manager = ConnectionManager::new(
//!     Arc::new(ProviderRegistry::with_defaults()),
//!     Arc::new(CredentialStore::in_memory()),
//!     vizdb::tunnel::default_manager(),
//! );
//! let session = manager.resolve_with_secret(&profile, secret).await?;
//!
//! let engine = QueryEngine::new(WorkerPool::default(), EngineOptions::default());
//! let mut statement = engine.submit(&session, "SELECT * FROM orders", OutputShape::Interactive)?;
//! let results = ResultSet::open(&mut statement, VirtualizerOptions::default())?;
//! let first = results.window(0, 50).await;
//! println!("{} rows so far", first.total_known);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod credentials;
pub mod db;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod export;
pub mod fuzzy;
pub mod history;
pub mod logging;
pub mod results;
pub mod schema_index;
pub mod session;
pub mod sql;
pub mod tunnel;
pub mod workers;

pub use error::{ConfigError, ConnectionError, Result, StatementError, TunnelError, VizdbError};
