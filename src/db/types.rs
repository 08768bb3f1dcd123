//! Database type definitions
//!
//! Core data structures for representing query results, column types and
//! cell values, shared by every backend adapter.

use serde::{Deserialize, Serialize};

/// Column definition in query results
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name
    pub name: String,
    /// Data type
    pub data_type: DataType,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

/// Backend-agnostic data types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    // Integer types
    SmallInt,
    Integer,
    BigInt,

    // Floating point
    Real,
    Double,
    Numeric,

    // Text types
    Text,
    Varchar(Option<usize>),
    Char(Option<usize>),

    // Boolean
    Boolean,

    // Date/time types
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Interval,

    // JSON types
    Json,
    Jsonb,

    // Binary data
    Bytea,

    // UUID
    Uuid,

    // Array type
    Array(Box<DataType>),

    // Other/unknown types
    Unknown(String),
}

/// A single row of query results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    /// Cell values in column order
    pub values: Vec<CellValue>,
}

impl Row {
    pub fn new(values: Vec<CellValue>) -> Self {
        Self { values }
    }

    /// Whether any cell's display text contains `needle` (already lowercased)
    pub fn contains_lowercase(&self, needle: &str) -> bool {
        self.values
            .iter()
            .any(|v| v.export_string().to_lowercase().contains(needle))
    }
}

/// A cell value (single column value in a row)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CellValue {
    /// NULL value
    Null,

    /// Integer value
    Integer(i64),

    /// Floating point value
    Float(f64),

    /// Text/string value
    Text(String),

    /// Boolean value
    Boolean(bool),

    /// JSON value (parsed). Serialized as text so spill files stay
    /// readable by non-self-describing formats.
    Json(#[serde(with = "json_text")] serde_json::Value),

    /// Binary data
    Binary(Vec<u8>),

    /// Date/time value (stored as string)
    DateTime(String),

    /// UUID value
    Uuid(String),

    /// Array value
    Array(Vec<CellValue>),
}

mod json_text {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &serde_json::Value, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<serde_json::Value, D::Error> {
        let text = String::deserialize(d)?;
        serde_json::from_str(&text).map_err(serde::de::Error::custom)
    }
}

impl DataType {
    /// Get a human-readable display name for this type
    pub fn display_name(&self) -> String {
        match self {
            DataType::SmallInt => "smallint".to_string(),
            DataType::Integer => "integer".to_string(),
            DataType::BigInt => "bigint".to_string(),
            DataType::Real => "real".to_string(),
            DataType::Double => "double precision".to_string(),
            DataType::Numeric => "numeric".to_string(),
            DataType::Text => "text".to_string(),
            DataType::Varchar(Some(n)) => format!("varchar({})", n),
            DataType::Varchar(None) => "varchar".to_string(),
            DataType::Char(Some(n)) => format!("char({})", n),
            DataType::Char(None) => "char".to_string(),
            DataType::Boolean => "boolean".to_string(),
            DataType::Date => "date".to_string(),
            DataType::Time => "time".to_string(),
            DataType::Timestamp => "timestamp".to_string(),
            DataType::TimestampTz => "timestamptz".to_string(),
            DataType::Interval => "interval".to_string(),
            DataType::Json => "json".to_string(),
            DataType::Jsonb => "jsonb".to_string(),
            DataType::Bytea => "bytea".to_string(),
            DataType::Uuid => "uuid".to_string(),
            DataType::Array(inner) => format!("{}[]", inner.display_name()),
            DataType::Unknown(s) => s.clone(),
        }
    }

    /// Map a declared column type name (as reported by SQLite, DuckDB,
    /// MySQL or ClickHouse) to a `DataType`.
    ///
    /// Matching is on the base name, case-insensitively; wrappers such as
    /// ClickHouse's `Nullable(...)` / `LowCardinality(...)` are unwrapped.
    pub fn from_declared(decl: &str) -> DataType {
        let trimmed = decl.trim();
        for wrapper in ["Nullable(", "LowCardinality("] {
            if let Some(inner) = trimmed.strip_prefix(wrapper).and_then(|s| s.strip_suffix(')')) {
                return DataType::from_declared(inner);
            }
        }
        if let Some(inner) = trimmed.strip_prefix("Array(").and_then(|s| s.strip_suffix(')')) {
            return DataType::Array(Box::new(DataType::from_declared(inner)));
        }
        if let Some(inner) = trimmed.strip_suffix("[]") {
            return DataType::Array(Box::new(DataType::from_declared(inner)));
        }

        let lower = trimmed.to_ascii_lowercase();
        let (base, params) = match lower.find('(') {
            Some(pos) => (
                lower[..pos].trim(),
                lower[pos + 1..].strip_suffix(')').map(str::trim),
            ),
            None => (lower.as_str(), None),
        };
        let len = params.and_then(|p| p.parse::<usize>().ok());

        match base {
            "smallint" | "int2" | "tinyint" | "int16" | "uint8" | "uint16" => {
                DataType::SmallInt
            }
            "int" | "integer" | "int4" | "mediumint" | "int32" | "uint32" | "signed" => {
                DataType::Integer
            }
            "bigint" | "int8" | "int64" | "uint64" | "hugeint" | "long" => DataType::BigInt,
            "real" | "float" | "float4" | "float32" => DataType::Real,
            "double" | "double precision" | "float8" | "float64" => DataType::Double,
            "numeric" | "decimal" | "decimal32" | "decimal64" | "decimal128" => DataType::Numeric,
            "text" | "string" | "clob" | "tinytext" | "mediumtext" | "longtext" | "utf8"
            | "largeutf8" => DataType::Text,
            "varchar" | "character varying" | "nvarchar" => DataType::Varchar(len),
            "char" | "character" | "nchar" | "fixedstring" => DataType::Char(len),
            "bool" | "boolean" => DataType::Boolean,
            "date" | "date32" => DataType::Date,
            "time" => DataType::Time,
            "timestamp" | "datetime" | "datetime64" => DataType::Timestamp,
            "timestamptz" | "timestamp with time zone" => DataType::TimestampTz,
            "interval" => DataType::Interval,
            "json" => DataType::Json,
            "jsonb" => DataType::Jsonb,
            "blob" | "bytea" | "binary" | "varbinary" | "longblob" => DataType::Bytea,
            "uuid" => DataType::Uuid,
            _ => DataType::Unknown(trimmed.to_string()),
        }
    }
}

impl CellValue {
    /// Get a display string for this cell value (truncated if needed)
    pub fn display_string(&self, max_len: usize) -> String {
        let full = match self {
            CellValue::Null => "NULL".to_string(),
            CellValue::Binary(b) => format!("<binary {} bytes>", b.len()),
            CellValue::Array(arr) => {
                let items: Vec<String> = arr.iter().map(|v| v.display_string(max_len)).collect();
                format!("{{{}}}", items.join(","))
            }
            other => other.export_string(),
        };

        if full.chars().count() > max_len {
            let kept: String = full.chars().take(max_len.saturating_sub(3)).collect();
            format!("{}...", kept)
        } else {
            full
        }
    }

    /// Full untruncated value string (NULL → empty string).
    pub fn export_string(&self) -> String {
        match self {
            CellValue::Null => String::new(),
            CellValue::Integer(i) => i.to_string(),
            CellValue::Float(f) => f.to_string(),
            CellValue::Text(s) => s.clone(),
            CellValue::Boolean(b) => b.to_string(),
            CellValue::Json(v) => v.to_string(),
            CellValue::Binary(b) => hex_encode(b),
            CellValue::DateTime(s) => s.clone(),
            CellValue::Uuid(s) => s.clone(),
            CellValue::Array(arr) => {
                let items: Vec<String> = arr.iter().map(CellValue::export_string).collect();
                format!("{{{}}}", items.join(","))
            }
        }
    }

    /// Convert to a `serde_json::Value` with type preservation.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            CellValue::Null => serde_json::Value::Null,
            CellValue::Integer(i) => serde_json::json!(*i),
            CellValue::Float(f) => {
                if f.is_finite() {
                    serde_json::json!(*f)
                } else {
                    // NaN / Infinity aren't valid JSON numbers
                    serde_json::Value::String(f.to_string())
                }
            }
            CellValue::Text(s) => serde_json::Value::String(s.clone()),
            CellValue::Boolean(b) => serde_json::Value::Bool(*b),
            CellValue::Json(v) => v.clone(),
            CellValue::Binary(b) => serde_json::Value::String(hex_encode(b)),
            CellValue::DateTime(s) => serde_json::Value::String(s.clone()),
            CellValue::Uuid(s) => serde_json::Value::String(s.clone()),
            CellValue::Array(arr) => {
                serde_json::Value::Array(arr.iter().map(CellValue::to_json).collect())
            }
        }
    }

    /// Check if this is a NULL value
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }
}

/// Hex-encode binary data (e.g. `\xdeadbeef`).
fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(2 + bytes.len() * 2);
    s.push_str("\\x");
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}
