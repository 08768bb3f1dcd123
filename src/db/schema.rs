//! Database schema introspection
//!
//! Structures for representing database schema hierarchies. Every adapter
//! produces a `SchemaTree`; object kinds a backend does not have are left as
//! empty lists.

use crate::db::types::DataType;

/// Complete database schema tree
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaTree {
    /// All schemas in the database
    pub schemas: Vec<Schema>,
}

/// A database schema (namespace)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schema {
    /// Schema name
    pub name: String,
    /// Tables in this schema
    pub tables: Vec<Table>,
    /// Views (including materialized views)
    pub views: Vec<Table>,
    pub indexes: Vec<Index>,
    /// Functions and stored procedures
    pub procedures: Vec<Procedure>,
    pub sequences: Vec<String>,
    pub triggers: Vec<Trigger>,
}

/// A database table or view
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    /// Table name
    pub name: String,
    /// Columns in ordinal order
    pub columns: Vec<Column>,
}

/// A table column
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    /// Column name
    pub name: String,
    /// Data type
    pub data_type: DataType,
    pub is_primary_key: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Index {
    pub name: String,
    pub table_name: String,
    pub columns: Vec<String>,
    pub is_unique: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Procedure {
    pub name: String,
    /// Argument signature, empty when the backend does not report one
    pub args: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Trigger {
    pub name: String,
    pub table_name: String,
}

impl SchemaTree {
    /// Create a new empty schema tree
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schema(&self, name: &str) -> Option<&Schema> {
        self.schemas.iter().find(|s| s.name == name)
    }

    /// Replace (or append) one schema, keeping the others untouched
    pub fn merge_schema(&mut self, schema: Schema) {
        match self.schemas.iter_mut().find(|s| s.name == schema.name) {
            Some(existing) => *existing = schema,
            None => {
                self.schemas.push(schema);
                self.schemas.sort_by(|a, b| a.name.cmp(&b.name));
            }
        }
    }

    pub fn remove_schema(&mut self, name: &str) {
        self.schemas.retain(|s| s.name != name);
    }
}

impl Schema {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Tables and views together
    pub fn relations(&self) -> impl Iterator<Item = &Table> {
        self.tables.iter().chain(self.views.iter())
    }
}

impl Table {
    pub fn new(name: impl Into<String>, columns: Vec<Column>) -> Self {
        Self {
            name: name.into(),
            columns,
        }
    }
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            is_primary_key: false,
        }
    }
}
