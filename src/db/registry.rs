//! Provider registry
//!
//! Maps each backend kind to its capability descriptor and driver adapter.
//! Kinds whose driver was compiled out still get a descriptor; their adapter
//! fails `connect` with a rebuild hint.

use crate::db::capability::{BackendKind, CapabilityDescriptor};
use crate::db::provider::{DriverAdapter, MissingDriver};
use crate::error::{Result, VizdbError};
use std::collections::HashMap;
use std::sync::Arc;

struct Provider {
    descriptor: CapabilityDescriptor,
    adapter: Arc<dyn DriverAdapter>,
}

/// Registry of available providers
pub struct ProviderRegistry {
    providers: HashMap<BackendKind, Provider>,
}

impl ProviderRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    /// Create a registry with all bundled providers registered
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for kind in BackendKind::ALL {
            registry.register(CapabilityDescriptor::builtin(kind), builtin_adapter(kind));
        }
        registry
    }

    /// Register (or replace) the provider for `descriptor.kind`
    pub fn register(&mut self, descriptor: CapabilityDescriptor, adapter: Arc<dyn DriverAdapter>) {
        tracing::debug!(kind = %descriptor.kind, "registering provider");
        self.providers
            .insert(descriptor.kind, Provider { descriptor, adapter });
    }

    /// Capability descriptor of a registered kind
    pub fn describe(&self, kind: BackendKind) -> Result<&CapabilityDescriptor> {
        self.providers
            .get(&kind)
            .map(|p| &p.descriptor)
            .ok_or_else(|| VizdbError::UnknownProvider(kind.to_string()))
    }

    /// Look up a kind by name and describe it
    pub fn describe_name(&self, name: &str) -> Result<&CapabilityDescriptor> {
        self.describe(name.parse()?)
    }

    pub fn adapter(&self, kind: BackendKind) -> Result<Arc<dyn DriverAdapter>> {
        self.providers
            .get(&kind)
            .map(|p| p.adapter.clone())
            .ok_or_else(|| {
                tracing::warn!(kind = %kind, "provider not found in registry");
                VizdbError::UnknownProvider(kind.to_string())
            })
    }

    /// Registered kinds in a stable order
    pub fn kinds(&self) -> Vec<BackendKind> {
        let mut kinds: Vec<BackendKind> = self.providers.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn builtin_adapter(kind: BackendKind) -> Arc<dyn DriverAdapter> {
    match kind {
        BackendKind::Postgresql | BackendKind::Cockroachdb | BackendKind::Supabase => {
            #[cfg(feature = "postgres")]
            return Arc::new(crate::db::postgres::PostgresAdapter::new(kind));
            #[cfg(not(feature = "postgres"))]
            return Arc::new(MissingDriver::new(kind, "postgres"));
        }
        BackendKind::Mysql | BackendKind::Mariadb => {
            #[cfg(feature = "mysql")]
            return Arc::new(crate::db::mysql::MysqlAdapter::new(kind));
            #[cfg(not(feature = "mysql"))]
            return Arc::new(MissingDriver::new(kind, "mysql"));
        }
        BackendKind::Sqlite => {
            #[cfg(feature = "sqlite")]
            return Arc::new(crate::db::sqlite::SqliteAdapter);
            #[cfg(not(feature = "sqlite"))]
            return Arc::new(MissingDriver::new(kind, "sqlite"));
        }
        BackendKind::Duckdb => {
            #[cfg(feature = "duckdb")]
            return Arc::new(crate::db::duckdb::DuckdbAdapter);
            #[cfg(not(feature = "duckdb"))]
            return Arc::new(MissingDriver::new(kind, "duckdb"));
        }
        BackendKind::Clickhouse => {
            #[cfg(feature = "http")]
            return Arc::new(crate::db::clickhouse::ClickhouseAdapter::new());
            #[cfg(not(feature = "http"))]
            return Arc::new(MissingDriver::new(kind, "http"));
        }
        BackendKind::Turso => {
            #[cfg(feature = "http")]
            return Arc::new(crate::db::turso::TursoAdapter::new());
            #[cfg(not(feature = "http"))]
            return Arc::new(MissingDriver::new(kind, "http"));
        }
    }
}
