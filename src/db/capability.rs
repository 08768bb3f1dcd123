//! Backend kinds and capability descriptors
//!
//! Every component above the adapters branches on a `CapabilityDescriptor`
//! rather than on the backend kind itself. The kind only selects which
//! descriptor and which adapter the registry hands out.

use crate::error::VizdbError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Backend kinds bundled with vizdb
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Postgresql,
    Cockroachdb,
    Supabase,
    Mysql,
    Mariadb,
    Sqlite,
    Duckdb,
    Clickhouse,
    Turso,
}

impl BackendKind {
    pub const ALL: [BackendKind; 9] = [
        BackendKind::Postgresql,
        BackendKind::Cockroachdb,
        BackendKind::Supabase,
        BackendKind::Mysql,
        BackendKind::Mariadb,
        BackendKind::Sqlite,
        BackendKind::Duckdb,
        BackendKind::Clickhouse,
        BackendKind::Turso,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Postgresql => "postgresql",
            BackendKind::Cockroachdb => "cockroachdb",
            BackendKind::Supabase => "supabase",
            BackendKind::Mysql => "mysql",
            BackendKind::Mariadb => "mariadb",
            BackendKind::Sqlite => "sqlite",
            BackendKind::Duckdb => "duckdb",
            BackendKind::Clickhouse => "clickhouse",
            BackendKind::Turso => "turso",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = VizdbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s.trim().to_ascii_lowercase().as_str() {
            "postgresql" | "postgres" | "pg" => BackendKind::Postgresql,
            "cockroachdb" | "cockroach" | "crdb" => BackendKind::Cockroachdb,
            "supabase" => BackendKind::Supabase,
            "mysql" => BackendKind::Mysql,
            "mariadb" | "maria" => BackendKind::Mariadb,
            "sqlite" | "sqlite3" => BackendKind::Sqlite,
            "duckdb" => BackendKind::Duckdb,
            "clickhouse" => BackendKind::Clickhouse,
            "turso" | "libsql" => BackendKind::Turso,
            other => return Err(VizdbError::UnknownProvider(other.to_string())),
        };
        Ok(kind)
    }
}

/// How identifiers are quoted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotingStyle {
    /// `"name"`, doubled `""` inside
    DoubleQuote,
    /// `` `name` ``, doubled ``` `` ``` inside
    Backtick,
}

/// Whether the backend can serve a window by re-querying with LIMIT/OFFSET
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pagination {
    LimitOffset,
    ClientSide,
}

/// Row-preview verb used when browsing a table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewVerb {
    /// `SELECT * FROM t LIMIT n`
    Limit,
    /// `SELECT * FROM t FETCH FIRST n ROWS ONLY`
    FetchFirst,
}

/// Shape of the network target a profile must provide
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointStyle {
    Tcp { default_port: u16 },
    File,
    Url,
}

/// Which object kinds schema introspection lists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntrospectionFeatures {
    pub views: bool,
    pub procedures: bool,
    pub sequences: bool,
    pub triggers: bool,
    pub indexes: bool,
}

impl IntrospectionFeatures {
    pub const ALL: IntrospectionFeatures = IntrospectionFeatures {
        views: true,
        procedures: true,
        sequences: true,
        triggers: true,
        indexes: true,
    };

    pub const NONE: IntrospectionFeatures = IntrospectionFeatures {
        views: false,
        procedures: false,
        sequences: false,
        triggers: false,
        indexes: false,
    };
}

/// Backend cancellation retry policy
///
/// `retries` extra attempts are made after the first one fails, each bounded
/// by `attempt_timeout`. The default is a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelPolicy {
    pub retries: u32,
    pub attempt_timeout: Duration,
}

impl Default for CancelPolicy {
    fn default() -> Self {
        Self {
            retries: 0,
            attempt_timeout: Duration::from_secs(5),
        }
    }
}

/// Everything higher layers may know about a backend
#[derive(Debug, Clone)]
pub struct CapabilityDescriptor {
    pub kind: BackendKind,
    pub display_name: &'static str,
    pub quoting: QuotingStyle,
    pub supports_cancellation: bool,
    pub pagination: Pagination,
    pub preview: PreviewVerb,
    pub introspection: IntrospectionFeatures,
    pub endpoint: EndpointStyle,
    pub supports_tunnel: bool,
    pub requires_auth: bool,
    pub default_schema: Option<&'static str>,
    /// Lightweight round-trip used to validate a fresh connection
    pub test_query: &'static str,
    pub cancel_policy: CancelPolicy,
}

impl CapabilityDescriptor {
    /// Descriptor for a bundled backend kind
    pub fn builtin(kind: BackendKind) -> Self {
        let base = CapabilityDescriptor {
            kind,
            display_name: "",
            quoting: QuotingStyle::DoubleQuote,
            supports_cancellation: true,
            pagination: Pagination::LimitOffset,
            preview: PreviewVerb::Limit,
            introspection: IntrospectionFeatures::ALL,
            endpoint: EndpointStyle::Tcp { default_port: 5432 },
            supports_tunnel: true,
            requires_auth: true,
            default_schema: None,
            test_query: "SELECT 1",
            cancel_policy: CancelPolicy::default(),
        };

        match kind {
            BackendKind::Postgresql => CapabilityDescriptor {
                display_name: "PostgreSQL",
                default_schema: Some("public"),
                ..base
            },
            BackendKind::Cockroachdb => CapabilityDescriptor {
                display_name: "CockroachDB",
                endpoint: EndpointStyle::Tcp {
                    default_port: 26257,
                },
                requires_auth: false,
                introspection: IntrospectionFeatures {
                    procedures: false,
                    triggers: false,
                    ..IntrospectionFeatures::ALL
                },
                default_schema: Some("public"),
                ..base
            },
            BackendKind::Supabase => CapabilityDescriptor {
                display_name: "Supabase",
                supports_tunnel: false,
                default_schema: Some("public"),
                ..base
            },
            BackendKind::Mysql => CapabilityDescriptor {
                display_name: "MySQL",
                quoting: QuotingStyle::Backtick,
                endpoint: EndpointStyle::Tcp { default_port: 3306 },
                introspection: IntrospectionFeatures {
                    sequences: false,
                    ..IntrospectionFeatures::ALL
                },
                ..base
            },
            BackendKind::Mariadb => CapabilityDescriptor {
                display_name: "MariaDB",
                quoting: QuotingStyle::Backtick,
                endpoint: EndpointStyle::Tcp { default_port: 3306 },
                ..base
            },
            BackendKind::Sqlite => CapabilityDescriptor {
                display_name: "SQLite",
                endpoint: EndpointStyle::File,
                supports_tunnel: false,
                requires_auth: false,
                introspection: IntrospectionFeatures {
                    procedures: false,
                    sequences: false,
                    ..IntrospectionFeatures::ALL
                },
                default_schema: Some("main"),
                ..base
            },
            BackendKind::Duckdb => CapabilityDescriptor {
                display_name: "DuckDB",
                supports_cancellation: false,
                pagination: Pagination::ClientSide,
                endpoint: EndpointStyle::File,
                supports_tunnel: false,
                requires_auth: false,
                introspection: IntrospectionFeatures {
                    procedures: false,
                    triggers: false,
                    ..IntrospectionFeatures::ALL
                },
                default_schema: Some("main"),
                ..base
            },
            BackendKind::Clickhouse => CapabilityDescriptor {
                display_name: "ClickHouse",
                quoting: QuotingStyle::Backtick,
                pagination: Pagination::ClientSide,
                endpoint: EndpointStyle::Tcp { default_port: 8123 },
                requires_auth: false,
                introspection: IntrospectionFeatures {
                    views: true,
                    ..IntrospectionFeatures::NONE
                },
                default_schema: Some("default"),
                ..base
            },
            BackendKind::Turso => CapabilityDescriptor {
                display_name: "Turso",
                supports_cancellation: false,
                endpoint: EndpointStyle::Url,
                supports_tunnel: false,
                requires_auth: false,
                introspection: IntrospectionFeatures {
                    procedures: false,
                    sequences: false,
                    ..IntrospectionFeatures::ALL
                },
                default_schema: Some("main"),
                ..base
            },
        }
    }

    /// Quote a single identifier
    pub fn quote_ident(&self, name: &str) -> String {
        match self.quoting {
            QuotingStyle::DoubleQuote => format!("\"{}\"", name.replace('"', "\"\"")),
            QuotingStyle::Backtick => format!("`{}`", name.replace('`', "``")),
        }
    }

    /// Quote a possibly schema-qualified relation name
    pub fn qualify(&self, schema: Option<&str>, name: &str) -> String {
        match schema {
            Some(s) => format!("{}.{}", self.quote_ident(s), self.quote_ident(name)),
            None => self.quote_ident(name),
        }
    }

    /// Statement that previews the first `limit` rows of a relation
    pub fn preview_sql(&self, schema: Option<&str>, table: &str, limit: usize) -> String {
        let target = self.qualify(schema, table);
        match self.preview {
            PreviewVerb::Limit => format!("SELECT * FROM {} LIMIT {}", target, limit),
            PreviewVerb::FetchFirst => {
                format!("SELECT * FROM {} FETCH FIRST {} ROWS ONLY", target, limit)
            }
        }
    }

    /// Wrap a single query so it returns one page, or `None` when the
    /// backend only paginates client-side.
    pub fn paginate_sql(&self, sql: &str, limit: usize, offset: usize) -> Option<String> {
        if self.pagination != Pagination::LimitOffset {
            return None;
        }
        let inner = crate::sql::trim_statement(sql);
        let page = match self.preview {
            PreviewVerb::Limit => format!("LIMIT {} OFFSET {}", limit, offset),
            PreviewVerb::FetchFirst => {
                format!("OFFSET {} ROWS FETCH NEXT {} ROWS ONLY", offset, limit)
            }
        };
        Some(format!("SELECT * FROM ({}) AS vizdb_page {}", inner, page))
    }

    pub fn default_port(&self) -> Option<u16> {
        match self.endpoint {
            EndpointStyle::Tcp { default_port } => Some(default_port),
            _ => None,
        }
    }
}
