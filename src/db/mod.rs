//! Database abstraction layer
//!
//! Backends plug in through the `DriverAdapter`/`Connection` traits; what a
//! backend can do is described by its `CapabilityDescriptor`, and callers
//! dispatch on that descriptor rather than on the backend kind.

pub mod capability;
pub mod provider;
pub mod registry;
pub mod schema;
pub mod types;

#[cfg(feature = "http")]
pub mod clickhouse;
#[cfg(feature = "duckdb")]
pub mod duckdb;
#[cfg(feature = "mysql")]
pub mod mysql;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;
#[cfg(feature = "http")]
pub mod turso;

// Re-export main types
pub use capability::{BackendKind, CapabilityDescriptor, IntrospectionFeatures};
pub use provider::{ConnectTarget, Connection, DriverAdapter, ExecRequest, ExecSummary, RowSink};
pub use registry::ProviderRegistry;
pub use schema::{Column, Schema, SchemaTree, Table};
pub use types::{CellValue, ColumnDef, DataType, Row};
