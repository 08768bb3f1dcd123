//! Schema index for autocomplete
//!
//! A `SchemaIndex` is an immutable snapshot built from one introspection: the
//! tree itself, a (schema, table) → columns map and a name list sorted by
//! lowercase name so prefix hits are a binary search. `SchemaIndexer` owns the
//! current snapshot and swaps in a new one when a rebuild finishes; readers
//! clone the `Arc` and never wait for a rebuild.

use crate::db::IntrospectionFeatures;
use crate::db::schema::{Column, SchemaTree};
use crate::engine::SchemaChange;
use crate::error::{Result, VizdbError};
use crate::fuzzy::{MatchQuality, fuzzy_match};
use crate::session::Session;
use crate::workers::WorkerPool;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_INTROSPECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateKind {
    Schema,
    Table,
    View,
    Column,
    Procedure,
    Sequence,
}

impl CandidateKind {
    fn is_relation(self) -> bool {
        matches!(self, CandidateKind::Table | CandidateKind::View)
    }
}

/// One completion candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub name: String,
    pub kind: CandidateKind,
    /// Owning schema (the schema itself for `Schema` candidates)
    pub schema: String,
    /// Owning relation, for columns
    pub table: Option<String>,
}

/// What kind of identifier the cursor position calls for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupContext {
    /// Anything: relations, columns, procedures, schemas
    Any,
    /// After FROM / JOIN / INTO / UPDATE / TABLE
    Relations,
    /// After `qualifier.`: a relation's columns, or a schema's relations
    Qualified(String),
}

/// Immutable introspection snapshot
#[derive(Debug, Default)]
pub struct SchemaIndex {
    tree: SchemaTree,
    /// Keyed by lowercased (schema, relation)
    columns: HashMap<(String, String), Vec<Column>>,
    /// Sorted by `lower`, then name
    names: Vec<Entry>,
}

#[derive(Debug)]
struct Entry {
    lower: String,
    candidate: Candidate,
}

impl SchemaIndex {
    pub fn build(tree: SchemaTree) -> Self {
        let mut columns = HashMap::new();
        let mut names = Vec::new();
        let mut push = |name: &str, kind, schema: &str, table: Option<&str>| {
            names.push(Entry {
                lower: name.to_lowercase(),
                candidate: Candidate {
                    name: name.to_string(),
                    kind,
                    schema: schema.to_string(),
                    table: table.map(str::to_string),
                },
            });
        };

        for schema in &tree.schemas {
            push(&schema.name, CandidateKind::Schema, &schema.name, None);
            for (kind, relations) in [
                (CandidateKind::Table, &schema.tables),
                (CandidateKind::View, &schema.views),
            ] {
                for rel in relations {
                    push(&rel.name, kind, &schema.name, None);
                    for col in &rel.columns {
                        push(&col.name, CandidateKind::Column, &schema.name, Some(&rel.name));
                    }
                    columns.insert(
                        (schema.name.to_lowercase(), rel.name.to_lowercase()),
                        rel.columns.clone(),
                    );
                }
            }
            for proc in &schema.procedures {
                push(&proc.name, CandidateKind::Procedure, &schema.name, None);
            }
            for seq in &schema.sequences {
                push(seq, CandidateKind::Sequence, &schema.name, None);
            }
        }

        names.sort_by(|a, b| {
            a.lower
                .cmp(&b.lower)
                .then_with(|| a.candidate.name.cmp(&b.candidate.name))
        });
        Self {
            tree,
            columns,
            names,
        }
    }

    pub fn tree(&self) -> &SchemaTree {
        &self.tree
    }

    /// Number of indexed identifiers
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Ordered columns of `schema.table`, case-insensitive
    pub fn columns(&self, schema: &str, table: &str) -> Option<&[Column]> {
        self.columns
            .get(&(schema.to_lowercase(), table.to_lowercase()))
            .map(Vec::as_slice)
    }

    /// Candidates for `prefix` in `context`
    ///
    /// Prefix matches come first, then other fuzzy matches; within each
    /// group higher scores rank first, ties alphabetically. Duplicate names
    /// of the same kind (a column present in many tables) appear once.
    pub fn lookup(&self, prefix: &str, context: &LookupContext) -> Vec<Candidate> {
        let pool: Vec<&Candidate> = match context {
            LookupContext::Any => self.names.iter().map(|e| &e.candidate).collect(),
            LookupContext::Relations => self
                .names
                .iter()
                .map(|e| &e.candidate)
                .filter(|c| c.kind.is_relation())
                .collect(),
            LookupContext::Qualified(qualifier) => self.qualified_pool(qualifier),
        };

        let mut scored: Vec<(MatchQuality, i32, &Candidate)> = pool
            .into_iter()
            .filter_map(|c| fuzzy_match(prefix, &c.name).map(|m| (m.quality, m.score, c)))
            .collect();
        scored.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then(b.1.cmp(&a.1))
                .then_with(|| a.2.name.to_lowercase().cmp(&b.2.name.to_lowercase()))
                .then_with(|| a.2.name.cmp(&b.2.name))
        });

        let mut seen = HashSet::new();
        scored
            .into_iter()
            .filter(|(_, _, c)| seen.insert((c.name.clone(), c.kind)))
            .map(|(_, _, c)| c.clone())
            .collect()
    }

    /// Indexed identifiers whose name starts with `prefix`, case-insensitive
    pub fn prefixed(&self, prefix: &str) -> impl Iterator<Item = &Candidate> {
        let prefix = prefix.to_lowercase();
        let start = self
            .names
            .partition_point(|e| e.lower.as_str() < prefix.as_str());
        self.names[start..]
            .iter()
            .take_while(move |e| e.lower.starts_with(&prefix))
            .map(|e| &e.candidate)
    }

    /// Columns of the named relation; failing that, relations of the named
    /// schema. `schema.table` qualifiers resolve the relation exactly.
    fn qualified_pool(&self, qualifier: &str) -> Vec<&Candidate> {
        let qualifier = qualifier.to_lowercase();
        let (schema, relation) = match qualifier.rsplit_once('.') {
            Some((s, r)) => (Some(unquote(s)), unquote(r)),
            None => (None, unquote(&qualifier)),
        };

        let columns: Vec<&Candidate> = self
            .names
            .iter()
            .map(|e| &e.candidate)
            .filter(|c| {
                c.kind == CandidateKind::Column
                    && c.table.as_deref().is_some_and(|t| t.to_lowercase() == relation)
                    && schema
                        .as_deref()
                        .is_none_or(|s| c.schema.to_lowercase() == s)
            })
            .collect();
        if !columns.is_empty() || schema.is_some() {
            return columns;
        }

        self.names
            .iter()
            .map(|e| &e.candidate)
            .filter(|c| c.kind.is_relation() && c.schema.to_lowercase() == relation)
            .collect()
    }
}

fn unquote(ident: &str) -> String {
    ident
        .trim_matches(|c| c == '"' || c == '`' || c == '[' || c == ']')
        .to_string()
}

/// Word being typed at `cursor` (a byte offset into `line`), plus the lookup
/// context it calls for
pub fn context_at(line: &str, cursor: usize) -> (LookupContext, String) {
    let cursor = cursor.min(line.len());
    if !line.is_char_boundary(cursor) {
        return (LookupContext::Any, String::new());
    }
    let word = word_before_cursor(line, cursor);
    let start = cursor - word.len();

    // `qualifier.` directly before the word
    if line[..start].ends_with('.') {
        let head = &line[..start - 1];
        let qualifier = qualifier_before(head);
        if !qualifier.is_empty() {
            return (LookupContext::Qualified(qualifier.to_string()), word.to_string());
        }
    }

    let previous = line[..start]
        .split(|c: char| c.is_whitespace() || c == '(' || c == ',')
        .rev()
        .find(|w| !w.is_empty())
        .map(str::to_ascii_uppercase);
    let context = match previous.as_deref() {
        Some("FROM" | "JOIN" | "INTO" | "UPDATE" | "TABLE") => LookupContext::Relations,
        _ => LookupContext::Any,
    };
    (context, word.to_string())
}

/// Identifier chain (`a` or `a.b`, optionally quoted) ending at `head`
fn qualifier_before(head: &str) -> &str {
    let start = head
        .char_indices()
        .rev()
        .find(|(_, c)| !(c.is_alphanumeric() || matches!(c, '_' | '.' | '"' | '`' | '$')))
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(0);
    &head[start..]
}

/// Extract the word immediately before the cursor position.
///
/// Scans backward from `col` to find the word start. Word delimiters are
/// whitespace and `().,;=<>!+-*/'\"`.
pub fn word_before_cursor(line: &str, col: usize) -> &str {
    let col = col.min(line.len());
    if col == 0 || !line.is_char_boundary(col) {
        return "";
    }
    let mut start = col;
    while start > 0 && line.is_char_boundary(start - 1) {
        let b = line.as_bytes()[start - 1];
        if b.is_ascii_whitespace() || b"().,;=<>!+-*/\'\"".contains(&b) {
            break;
        }
        start -= 1;
    }
    &line[start..col]
}

/// Owns the current `SchemaIndex` for one session
pub struct SchemaIndexer {
    current: RwLock<Arc<SchemaIndex>>,
    pool: WorkerPool,
    timeout: Duration,
}

impl SchemaIndexer {
    pub fn new(pool: WorkerPool) -> Self {
        Self {
            current: RwLock::new(Arc::new(SchemaIndex::default())),
            pool,
            timeout: DEFAULT_INTROSPECT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Current snapshot; stays valid while a rebuild runs
    pub fn snapshot(&self) -> Arc<SchemaIndex> {
        self.current.read().clone()
    }

    pub fn lookup(&self, prefix: &str, context: &LookupContext) -> Vec<Candidate> {
        self.snapshot().lookup(prefix, context)
    }

    /// Full rebuild from a fresh introspection
    pub async fn refresh(&self, session: &Arc<Session>) -> Result<Arc<SchemaIndex>> {
        let tree = self.introspect(session, None).await?;
        let index = Arc::new(SchemaIndex::build(tree));
        *self.current.write() = index.clone();
        tracing::info!(
            session = %session.id(),
            identifiers = index.len(),
            "schema index rebuilt"
        );
        Ok(index)
    }

    /// Rebuild one schema and merge it into the current snapshot. A schema
    /// that no longer exists is removed.
    pub async fn refresh_schema(
        &self,
        session: &Arc<Session>,
        schema: &str,
    ) -> Result<Arc<SchemaIndex>> {
        let fetched = self.introspect(session, Some(schema)).await?;
        let fresh = fetched.schemas.into_iter().find(|s| s.name == schema);

        // Build outside the lock; retry if another rebuild swapped meanwhile
        loop {
            let base = self.snapshot();
            let mut tree = base.tree.clone();
            match &fresh {
                Some(s) => tree.merge_schema(s.clone()),
                None => tree.remove_schema(schema),
            }
            let index = Arc::new(SchemaIndex::build(tree));
            let mut current = self.current.write();
            if Arc::ptr_eq(&current, &base) {
                *current = index.clone();
                tracing::debug!(session = %session.id(), schema, "schema index merged");
                return Ok(index);
            }
        }
    }

    /// Follow up a statement's DDL
    pub async fn apply(
        &self,
        session: &Arc<Session>,
        change: &SchemaChange,
    ) -> Result<Arc<SchemaIndex>> {
        match change {
            SchemaChange::None => Ok(self.snapshot()),
            SchemaChange::Schemas(schemas) => {
                let mut index = self.snapshot();
                for schema in schemas {
                    index = self.refresh_schema(session, schema).await?;
                }
                Ok(index)
            }
            SchemaChange::Unknown => self.refresh(session).await,
        }
    }

    async fn introspect(&self, session: &Arc<Session>, schema: Option<&str>) -> Result<SchemaTree> {
        session.check_usable()?;
        let features: IntrospectionFeatures = session.descriptor().introspection;
        let conn = session.connection();
        let owner = session.clone();
        let schema = schema.map(str::to_string);
        let after = self.timeout;

        self.pool
            .run(async move {
                let work = conn.introspect(features, schema.as_deref());
                match tokio::time::timeout(after, work).await {
                    Ok(Ok(tree)) => Ok(tree),
                    Ok(Err(e)) => {
                        if e.is_connectivity_lost() {
                            owner.invalidate(e.to_string());
                        }
                        Err(VizdbError::Statement(e))
                    }
                    Err(_) => Err(VizdbError::Timeout {
                        operation: "introspect",
                        after,
                    }),
                }
            })
            .await
    }
}
