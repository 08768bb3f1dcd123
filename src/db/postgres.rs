//! PostgreSQL-family adapter (PostgreSQL, CockroachDB, Supabase)
//!
//! Concrete implementation using tokio-postgres. Rows are streamed with
//! `query_raw` so large results never materialize in the adapter.

use crate::db::capability::{BackendKind, IntrospectionFeatures};
use crate::db::provider::{ConnectTarget, Connection, DriverAdapter, ExecRequest, ExecSummary};
use crate::db::schema::{Column, Index, Procedure, Schema, SchemaTree, Table, Trigger};
use crate::db::types::{CellValue, ColumnDef, DataType, Row};
use crate::error::{
    ConnectionError, ConnectionFailure, Result, StatementError, StatementResult, VizdbError,
};
use async_trait::async_trait;
use futures::{StreamExt, pin_mut};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::{FromSql, ToSql, Type};
use tokio_postgres::{Client, Config, NoTls};

/// Adapter for backends speaking the PostgreSQL wire protocol
pub struct PostgresAdapter {
    kind: BackendKind,
}

impl PostgresAdapter {
    pub fn new(kind: BackendKind) -> Self {
        Self { kind }
    }
}

/// SSL mode from the profile's `sslmode` option
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SslMode {
    Disable,
    Prefer,
    Require,
}

impl SslMode {
    fn from_option(value: Option<&str>, kind: BackendKind) -> Self {
        match value {
            Some("disable") => SslMode::Disable,
            Some("require") | Some("verify-ca") | Some("verify-full") => SslMode::Require,
            Some(_) => SslMode::Prefer,
            // Supabase only accepts TLS
            None if kind == BackendKind::Supabase => SslMode::Require,
            None => SslMode::Prefer,
        }
    }
}

#[async_trait]
impl DriverAdapter for PostgresAdapter {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn connect(&self, target: &ConnectTarget) -> Result<Arc<dyn Connection>> {
        let (host, port) = target.endpoint.host_port().ok_or_else(|| {
            VizdbError::Config(crate::error::ConfigError::Invalid(format!(
                "{} needs a host and port",
                self.kind
            )))
        })?;

        let mut config = Config::new();
        config.host(host).port(port).application_name("vizdb");
        if let Some(db) = &target.database {
            config.dbname(db);
        }
        if let Some(user) = &target.username {
            config.user(user);
        }
        if let Some(secret) = &target.secret {
            config.password(secret.expose());
        }
        let ssl_mode = SslMode::from_option(target.option("sslmode"), self.kind);
        config.ssl_mode(match ssl_mode {
            SslMode::Disable => tokio_postgres::config::SslMode::Disable,
            SslMode::Prefer => tokio_postgres::config::SslMode::Prefer,
            SslMode::Require => tokio_postgres::config::SslMode::Require,
        });

        tracing::debug!(kind = %self.kind, host, port, ?ssl_mode, "connecting");

        let (client, driver) = match ssl_mode {
            SslMode::Disable => {
                let (client, connection) = config.connect(NoTls).await.map_err(connect_error)?;
                (client, spawn_connection(connection))
            }
            SslMode::Prefer | SslMode::Require => {
                let tls = tokio_postgres_rustls::MakeRustlsConnect::new(make_tls_config());
                let (client, connection) = config.connect(tls).await.map_err(connect_error)?;
                (client, spawn_connection(connection))
            }
        };

        let cancel_token = client.cancel_token();
        Ok(Arc::new(PostgresConnection {
            client,
            cancel_token,
            ssl_mode,
            driver: Mutex::new(Some(driver)),
        }))
    }
}

/// Drive the connection in the background. Errors are logged; the client
/// notices a dead connection through `is_closed`.
fn spawn_connection<S, T>(connection: tokio_postgres::Connection<S, T>) -> JoinHandle<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::warn!(error = %e, "postgres connection lost");
        }
    })
}

fn connect_error(e: tokio_postgres::Error) -> VizdbError {
    let kind = match e.code() {
        Some(code)
            if *code == SqlState::INVALID_PASSWORD
                || *code == SqlState::INVALID_AUTHORIZATION_SPECIFICATION =>
        {
            ConnectionFailure::AuthRejected
        }
        Some(_) => ConnectionFailure::HandshakeFailed,
        None if has_io_source(&e) => ConnectionFailure::Unreachable,
        None => ConnectionFailure::HandshakeFailed,
    };
    ConnectionError::with_source(kind, e).into()
}

fn has_io_source(e: &tokio_postgres::Error) -> bool {
    let mut source = std::error::Error::source(e);
    while let Some(err) = source {
        if err.is::<std::io::Error>() {
            return true;
        }
        source = err.source();
    }
    false
}

struct PostgresConnection {
    client: Client,
    /// Token for cancelling in-flight queries
    cancel_token: tokio_postgres::CancelToken,
    /// SSL mode (needed to cancel over the right transport)
    ssl_mode: SslMode,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl PostgresConnection {
    fn statement_error(&self, e: tokio_postgres::Error) -> StatementError {
        if self.client.is_closed() || e.is_closed() {
            return StatementError::ConnectivityLost(e.to_string());
        }
        let Some(db) = e.as_db_error() else {
            if has_io_source(&e) {
                return StatementError::ConnectivityLost(e.to_string());
            }
            return StatementError::driver(e.to_string());
        };
        let code = db.code();
        let message = db.message().to_string();
        if *code == SqlState::SYNTAX_ERROR {
            StatementError::Syntax(message)
        } else if *code == SqlState::INSUFFICIENT_PRIVILEGE {
            StatementError::Permission(message)
        } else if code.code().starts_with("08") || *code == SqlState::ADMIN_SHUTDOWN {
            StatementError::ConnectivityLost(message)
        } else {
            StatementError::Driver {
                message,
                code: Some(code.code().to_string()),
            }
        }
    }

    async fn query<'a>(
        &self,
        sql: &str,
        params: &'a [&'a (dyn ToSql + Sync)],
    ) -> StatementResult<Vec<tokio_postgres::Row>> {
        self.client
            .query(sql, params)
            .await
            .map_err(|e| self.statement_error(e))
    }
}

#[async_trait]
impl Connection for PostgresConnection {
    async fn execute(&self, mut req: ExecRequest) -> StatementResult<ExecSummary> {
        let stmt = self
            .client
            .prepare(&req.sql)
            .await
            .map_err(|e| self.statement_error(e))?;

        if stmt.columns().is_empty() {
            let affected = self
                .client
                .execute(&stmt, &[])
                .await
                .map_err(|e| self.statement_error(e))?;
            return Ok(req.sink.summary(Some(affected)));
        }

        let columns: Vec<ColumnDef> = stmt
            .columns()
            .iter()
            .map(|col| ColumnDef::new(col.name(), pg_type_to_datatype(col.type_())))
            .collect();
        if req.sink.columns(columns.clone()).await.is_break() {
            return Ok(req.sink.summary(None));
        }

        let stream = self
            .client
            .query_raw(&stmt, Vec::<String>::new())
            .await
            .map_err(|e| self.statement_error(e))?;
        pin_mut!(stream);

        loop {
            let next = tokio::select! {
                next = stream.next() => next,
                _ = req.cancel.cancelled() => break,
            };
            let Some(pg_row) = next else { break };
            let pg_row = pg_row.map_err(|e| self.statement_error(e))?;
            let values = columns
                .iter()
                .enumerate()
                .map(|(i, col)| extract_cell_value(&pg_row, i, &col.data_type))
                .collect();
            if req.sink.push(Row::new(values)).await.is_break() {
                break;
            }
        }
        let _ = req.sink.flush().await;
        Ok(req.sink.summary(stream.rows_affected()))
    }

    async fn cancel(&self) -> StatementResult<()> {
        let outcome = match self.ssl_mode {
            SslMode::Disable => self.cancel_token.cancel_query(NoTls).await,
            SslMode::Prefer | SslMode::Require => {
                let tls = tokio_postgres_rustls::MakeRustlsConnect::new(make_tls_config());
                self.cancel_token.cancel_query(tls).await
            }
        };
        outcome.map_err(|e| StatementError::driver(format!("Cancel failed: {}", e)))
    }

    async fn introspect(
        &self,
        features: IntrospectionFeatures,
        schema: Option<&str>,
    ) -> StatementResult<SchemaTree> {
        let scope: Option<String> = schema.map(str::to_string);
        let params: Vec<&(dyn ToSql + Sync)> = match &scope {
            Some(s) => vec![s as &(dyn ToSql + Sync)],
            None => vec![],
        };
        let filter = |col: &str| {
            if scope.is_some() {
                format!("AND {} = $1", col)
            } else {
                String::new()
            }
        };

        let schema_rows = self
            .query(
                &format!(
                    "SELECT nspname FROM pg_namespace \
                     WHERE nspname NOT LIKE 'pg_%' \
                       AND nspname NOT IN ('information_schema', 'crdb_internal') {} \
                     ORDER BY nspname",
                    filter("nspname")
                ),
                &params,
            )
            .await?;

        // relkind: r=table, p=partitioned table, v=view, m=materialized view
        let rel_kinds = if features.views {
            "('r','p','v','m')"
        } else {
            "('r','p')"
        };
        let rel_rows = self
            .query(
                &format!(
                    "SELECT n.nspname, c.relname, c.relkind::text, \
                            a.attname, format_type(a.atttypid, a.atttypmod) \
                     FROM pg_class c \
                     JOIN pg_namespace n ON n.oid = c.relnamespace \
                     JOIN pg_attribute a ON a.attrelid = c.oid \
                     WHERE c.relkind IN {} \
                       AND n.nspname NOT LIKE 'pg_%' \
                       AND n.nspname NOT IN ('information_schema', 'crdb_internal') \
                       AND a.attnum > 0 AND NOT a.attisdropped {} \
                     ORDER BY n.nspname, c.relname, a.attnum",
                    rel_kinds,
                    filter("n.nspname")
                ),
                &params,
            )
            .await?;

        let pk_rows = self
            .query(
                &format!(
                    "SELECT n.nspname, c.relname, a.attname \
                     FROM pg_constraint con \
                     JOIN pg_class c ON c.oid = con.conrelid \
                     JOIN pg_namespace n ON n.oid = c.relnamespace \
                     JOIN pg_attribute a ON a.attrelid = c.oid AND a.attnum = ANY(con.conkey) \
                     WHERE con.contype = 'p' {}",
                    filter("n.nspname")
                ),
                &params,
            )
            .await?;
        let pk_set: HashSet<(String, String, String)> = pk_rows
            .iter()
            .map(|r| (r.get(0), r.get(1), r.get(2)))
            .collect();

        let mut index_map: HashMap<String, Vec<Index>> = HashMap::new();
        if features.indexes {
            let rows = self
                .query(
                    &format!(
                        "SELECT n.nspname, ct.relname, ci.relname, ix.indisunique, \
                                array_agg(a.attname::text ORDER BY k.ord) \
                         FROM pg_index ix \
                         JOIN pg_class ci ON ci.oid = ix.indexrelid \
                         JOIN pg_class ct ON ct.oid = ix.indrelid \
                         JOIN pg_namespace n ON n.oid = ct.relnamespace \
                         JOIN LATERAL unnest(ix.indkey) WITH ORDINALITY AS k(attnum, ord) ON true \
                         JOIN pg_attribute a ON a.attrelid = ct.oid AND a.attnum = k.attnum \
                         WHERE n.nspname NOT LIKE 'pg_%' \
                           AND n.nspname NOT IN ('information_schema', 'crdb_internal') {} \
                         GROUP BY n.nspname, ct.relname, ci.relname, ix.indisunique \
                         ORDER BY n.nspname, ci.relname",
                        filter("n.nspname")
                    ),
                    &params,
                )
                .await?;
            for row in &rows {
                index_map.entry(row.get(0)).or_default().push(Index {
                    table_name: row.get(1),
                    name: row.get(2),
                    is_unique: row.get(3),
                    columns: row.get(4),
                });
            }
        }

        let mut proc_map: HashMap<String, Vec<Procedure>> = HashMap::new();
        if features.procedures {
            let rows = self
                .query(
                    &format!(
                        "SELECT n.nspname, p.proname, \
                                pg_get_function_identity_arguments(p.oid) \
                         FROM pg_proc p \
                         JOIN pg_namespace n ON n.oid = p.pronamespace \
                         WHERE n.nspname NOT LIKE 'pg_%' \
                           AND n.nspname != 'information_schema' \
                           AND p.prokind IN ('f', 'p') {} \
                         ORDER BY n.nspname, p.proname",
                        filter("n.nspname")
                    ),
                    &params,
                )
                .await?;
            for row in &rows {
                proc_map.entry(row.get(0)).or_default().push(Procedure {
                    name: row.get(1),
                    args: row.get(2),
                });
            }
        }

        let mut seq_map: HashMap<String, Vec<String>> = HashMap::new();
        if features.sequences {
            let rows = self
                .query(
                    &format!(
                        "SELECT n.nspname, c.relname FROM pg_class c \
                         JOIN pg_namespace n ON n.oid = c.relnamespace \
                         WHERE c.relkind = 'S' {} ORDER BY n.nspname, c.relname",
                        filter("n.nspname")
                    ),
                    &params,
                )
                .await?;
            for row in &rows {
                seq_map.entry(row.get(0)).or_default().push(row.get(1));
            }
        }

        let mut trigger_map: HashMap<String, Vec<Trigger>> = HashMap::new();
        if features.triggers {
            let rows = self
                .query(
                    &format!(
                        "SELECT n.nspname, c.relname, t.tgname FROM pg_trigger t \
                         JOIN pg_class c ON c.oid = t.tgrelid \
                         JOIN pg_namespace n ON n.oid = c.relnamespace \
                         WHERE NOT t.tgisinternal {} ORDER BY n.nspname, t.tgname",
                        filter("n.nspname")
                    ),
                    &params,
                )
                .await?;
            for row in &rows {
                trigger_map.entry(row.get(0)).or_default().push(Trigger {
                    table_name: row.get(1),
                    name: row.get(2),
                });
            }
        }

        // Group columns by (schema, relation), keeping catalog order
        let mut schemas: Vec<Schema> = schema_rows
            .iter()
            .map(|r| Schema::named(r.get::<_, String>(0)))
            .collect();
        let mut by_name: HashMap<String, usize> = schemas
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.clone(), i))
            .collect();

        let mut current: Option<(String, String, String, Vec<Column>)> = None;
        let finish = |entry: Option<(String, String, String, Vec<Column>)>,
                          schemas: &mut Vec<Schema>,
                          by_name: &mut HashMap<String, usize>| {
            let Some((schema, relname, relkind, columns)) = entry else {
                return;
            };
            let idx = *by_name.entry(schema.clone()).or_insert_with(|| {
                schemas.push(Schema::named(schema.clone()));
                schemas.len() - 1
            });
            let table = Table::new(relname, columns);
            match relkind.as_str() {
                "v" | "m" => schemas[idx].views.push(table),
                _ => schemas[idx].tables.push(table),
            }
        };

        for row in &rel_rows {
            let schema: String = row.get(0);
            let relname: String = row.get(1);
            let relkind: String = row.get(2);
            let col_name: String = row.get(3);
            let type_name: String = row.get(4);

            let same = matches!(&current, Some((s, r, _, _)) if *s == schema && *r == relname);
            if !same {
                finish(current.take(), &mut schemas, &mut by_name);
                current = Some((schema.clone(), relname.clone(), relkind, Vec::new()));
            }
            let is_pk = pk_set.contains(&(schema, relname, col_name.clone()));
            if let Some((_, _, _, columns)) = current.as_mut() {
                columns.push(Column {
                    name: col_name,
                    data_type: datatype_from_format_type(&type_name),
                    is_primary_key: is_pk,
                });
            }
        }
        finish(current.take(), &mut schemas, &mut by_name);

        for schema in &mut schemas {
            schema.indexes = index_map.remove(&schema.name).unwrap_or_default();
            schema.procedures = proc_map.remove(&schema.name).unwrap_or_default();
            schema.sequences = seq_map.remove(&schema.name).unwrap_or_default();
            schema.triggers = trigger_map.remove(&schema.name).unwrap_or_default();
        }

        Ok(SchemaTree { schemas })
    }

    async fn ping(&self) -> StatementResult<()> {
        self.client
            .simple_query("SELECT 1")
            .await
            .map(|_| ())
            .map_err(|e| self.statement_error(e))
    }

    async fn close(&self) {
        if let Some(driver) = self.driver.lock().take() {
            driver.abort();
        }
    }
}

/// Map tokio_postgres Type to our DataType enum
fn pg_type_to_datatype(pg_type: &Type) -> DataType {
    let array = |inner| DataType::Array(Box::new(inner));
    match *pg_type {
        Type::INT2 => DataType::SmallInt,
        Type::INT4 => DataType::Integer,
        Type::INT8 => DataType::BigInt,
        Type::FLOAT4 => DataType::Real,
        Type::FLOAT8 => DataType::Double,
        Type::NUMERIC => DataType::Numeric,
        Type::TEXT | Type::NAME => DataType::Text,
        Type::VARCHAR => DataType::Varchar(None),
        Type::CHAR | Type::BPCHAR => DataType::Char(None),
        Type::BOOL => DataType::Boolean,
        Type::DATE => DataType::Date,
        Type::TIME => DataType::Time,
        Type::TIMESTAMP => DataType::Timestamp,
        Type::TIMESTAMPTZ => DataType::TimestampTz,
        Type::INTERVAL => DataType::Interval,
        Type::JSON => DataType::Json,
        Type::JSONB => DataType::Jsonb,
        Type::BYTEA => DataType::Bytea,
        Type::UUID => DataType::Uuid,
        Type::BOOL_ARRAY => array(DataType::Boolean),
        Type::INT2_ARRAY => array(DataType::SmallInt),
        Type::INT4_ARRAY => array(DataType::Integer),
        Type::INT8_ARRAY => array(DataType::BigInt),
        Type::FLOAT4_ARRAY => array(DataType::Real),
        Type::FLOAT8_ARRAY => array(DataType::Double),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY | Type::NAME_ARRAY => array(DataType::Text),
        Type::UUID_ARRAY => array(DataType::Uuid),
        Type::JSONB_ARRAY => array(DataType::Jsonb),
        Type::JSON_ARRAY => array(DataType::Json),
        Type::NUMERIC_ARRAY => array(DataType::Numeric),
        _ => DataType::Unknown(pg_type.name().to_string()),
    }
}

/// Map `format_type()` output ("character varying(255)", "text[]", ...)
/// to our DataType enum.
fn datatype_from_format_type(type_name: &str) -> DataType {
    if let Some(inner) = type_name.strip_suffix("[]") {
        return DataType::Array(Box::new(datatype_from_format_type(inner)));
    }
    let base = type_name.split('(').next().unwrap_or(type_name).trim();
    match base {
        "double precision" => DataType::Double,
        "time without time zone" | "time with time zone" => DataType::Time,
        "timestamp without time zone" => DataType::Timestamp,
        "timestamp with time zone" => DataType::TimestampTz,
        _ => DataType::from_declared(type_name),
    }
}

/// Build a rustls ClientConfig that trusts OS certificates (with Mozilla roots as fallback)
fn make_tls_config() -> rustls::ClientConfig {
    let mut root_store = rustls::RootCertStore::empty();

    let native_certs = rustls_native_certs::load_native_certs();
    let mut loaded = 0;
    for cert in native_certs.certs {
        if root_store.add(cert).is_ok() {
            loaded += 1;
        }
    }
    if loaded == 0 {
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }

    rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth()
}

/// Typed extraction with a string fallback when the wire type doesn't match
fn typed<'a, T: FromSql<'a>>(
    row: &'a tokio_postgres::Row,
    idx: usize,
    wrap: impl FnOnce(T) -> CellValue,
) -> CellValue {
    match row.try_get::<_, Option<T>>(idx) {
        Ok(Some(v)) => wrap(v),
        Ok(None) => CellValue::Null,
        Err(_) => try_as_string(row, idx),
    }
}

fn typed_array<'a, T: FromSql<'a>>(
    row: &'a tokio_postgres::Row,
    idx: usize,
    wrap: impl Fn(T) -> CellValue,
) -> CellValue {
    typed::<Vec<T>>(row, idx, |items| {
        CellValue::Array(items.into_iter().map(wrap).collect())
    })
}

/// Extract a cell value based on the column's DataType.
fn extract_cell_value(row: &tokio_postgres::Row, idx: usize, data_type: &DataType) -> CellValue {
    match data_type {
        DataType::SmallInt => typed::<i16>(row, idx, |v| CellValue::Integer(v.into())),
        DataType::Integer => typed::<i32>(row, idx, |v| CellValue::Integer(v.into())),
        DataType::BigInt => typed::<i64>(row, idx, CellValue::Integer),
        DataType::Real => typed::<f32>(row, idx, |v| CellValue::Float(v.into())),
        DataType::Double => typed::<f64>(row, idx, CellValue::Float),
        DataType::Numeric => typed::<Decimal>(row, idx, |v| CellValue::Text(v.to_string())),
        DataType::Boolean => typed::<bool>(row, idx, CellValue::Boolean),
        DataType::Json | DataType::Jsonb => typed::<serde_json::Value>(row, idx, CellValue::Json),
        DataType::Bytea => typed::<Vec<u8>>(row, idx, CellValue::Binary),
        DataType::Uuid => typed::<uuid::Uuid>(row, idx, |v| CellValue::Uuid(v.to_string())),
        DataType::Timestamp => {
            typed::<chrono::NaiveDateTime>(row, idx, |v| CellValue::DateTime(v.to_string()))
        }
        DataType::TimestampTz => typed::<chrono::DateTime<chrono::Utc>>(row, idx, |v| {
            CellValue::DateTime(v.to_string())
        }),
        DataType::Date => {
            typed::<chrono::NaiveDate>(row, idx, |v| CellValue::DateTime(v.to_string()))
        }
        DataType::Time => {
            typed::<chrono::NaiveTime>(row, idx, |v| CellValue::DateTime(v.to_string()))
        }
        DataType::Array(inner) => match inner.as_ref() {
            DataType::Text | DataType::Varchar(_) | DataType::Char(_) => {
                typed_array::<String>(row, idx, CellValue::Text)
            }
            DataType::SmallInt => typed_array::<i16>(row, idx, |n| CellValue::Integer(n.into())),
            DataType::Integer => typed_array::<i32>(row, idx, |n| CellValue::Integer(n.into())),
            DataType::BigInt => typed_array::<i64>(row, idx, CellValue::Integer),
            DataType::Real => typed_array::<f32>(row, idx, |n| CellValue::Float(n.into())),
            DataType::Double => typed_array::<f64>(row, idx, CellValue::Float),
            DataType::Boolean => typed_array::<bool>(row, idx, CellValue::Boolean),
            DataType::Uuid => {
                typed_array::<uuid::Uuid>(row, idx, |u| CellValue::Uuid(u.to_string()))
            }
            DataType::Json | DataType::Jsonb => {
                typed_array::<serde_json::Value>(row, idx, CellValue::Json)
            }
            DataType::Numeric => {
                typed_array::<Decimal>(row, idx, |d| CellValue::Text(d.to_string()))
            }
            _ => try_as_string(row, idx),
        },
        _ => try_as_string(row, idx),
    }
}

/// Fallback for type mismatches. When even the string conversion fails the
/// postgres type name is shown so the user knows what couldn't be displayed.
fn try_as_string(row: &tokio_postgres::Row, idx: usize) -> CellValue {
    match row.try_get::<_, Option<String>>(idx) {
        Ok(Some(v)) => CellValue::Text(v),
        Ok(None) => CellValue::Null,
        Err(_) => {
            let type_name = row
                .columns()
                .get(idx)
                .map_or("unknown", |c| c.type_().name());
            CellValue::Text(format!("<unable to display: {}>", type_name))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_type_mapping() {
        assert_eq!(
            datatype_from_format_type("character varying(255)"),
            DataType::Varchar(Some(255))
        );
        assert_eq!(
            datatype_from_format_type("timestamp with time zone"),
            DataType::TimestampTz
        );
        assert_eq!(
            datatype_from_format_type("integer[]"),
            DataType::Array(Box::new(DataType::Integer))
        );
        assert_eq!(datatype_from_format_type("numeric(10,2)"), DataType::Numeric);
    }

    #[test]
    fn sslmode_defaults() {
        assert_eq!(
            SslMode::from_option(None, BackendKind::Postgresql),
            SslMode::Prefer
        );
        assert_eq!(
            SslMode::from_option(None, BackendKind::Supabase),
            SslMode::Require
        );
        assert_eq!(
            SslMode::from_option(Some("disable"), BackendKind::Supabase),
            SslMode::Disable
        );
    }

    #[test]
    fn pg_type_mapping() {
        assert_eq!(pg_type_to_datatype(&Type::INT8), DataType::BigInt);
        assert_eq!(
            pg_type_to_datatype(&Type::TEXT_ARRAY),
            DataType::Array(Box::new(DataType::Text))
        );
    }
}
