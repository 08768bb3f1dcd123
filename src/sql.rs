//! SQL text utilities
//!
//! Backend-agnostic helpers that look at statement text without parsing it
//! fully: script splitting, write/delete classification for alerts, detection
//! of pageable queries and of the schema a DDL statement touches.

use serde::{Deserialize, Serialize};

/// Lexical context of one character of SQL text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Region {
    Code,
    Literal,
    Comment,
}

/// Walk `sql` and classify every byte as code, literal or comment.
///
/// Handles single quotes (with `''` and backslash escapes), double-quoted and
/// backtick identifiers, `--` line comments, `/* */` block comments and
/// PostgreSQL dollar quoting (`$$ ... $$`, `$tag$ ... $tag$`).
fn regions(sql: &str) -> Vec<Region> {
    let bytes = sql.as_bytes();
    let mut out = vec![Region::Code; bytes.len()];
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        let next = bytes.get(i + 1).copied();
        let end = match b {
            b'\'' | b'"' | b'`' => {
                let mut j = i + 1;
                let close = loop {
                    match bytes.get(j) {
                        None => break bytes.len(),
                        Some(b'\\') if b != b'`' => j += 2,
                        Some(&c) if c == b && bytes.get(j + 1) == Some(&b) => j += 2,
                        Some(&c) if c == b => break j + 1,
                        Some(_) => j += 1,
                    }
                };
                close.min(bytes.len())
            }
            b'-' if next == Some(b'-') => {
                let stop = sql[i..].find('\n').map_or(bytes.len(), |n| i + n);
                out[i..stop].fill(Region::Comment);
                i = stop;
                continue;
            }
            b'/' if next == Some(b'*') => {
                let stop = sql[i + 2..].find("*/").map_or(bytes.len(), |n| i + 2 + n + 2);
                out[i..stop].fill(Region::Comment);
                i = stop;
                continue;
            }
            b'$' => match dollar_tag(&sql[i..]) {
                Some(tag) => {
                    let body = i + tag.len();
                    sql[body..]
                        .find(tag)
                        .map_or(bytes.len(), |n| body + n + tag.len())
                }
                None => {
                    i += 1;
                    continue;
                }
            },
            _ => {
                i += 1;
                continue;
            }
        };
        out[i..end].fill(Region::Literal);
        i = end;
    }
    out
}

/// `$$` or `$tag$` at the start of `s`
fn dollar_tag(s: &str) -> Option<&str> {
    let rest = &s[1..];
    let close = rest.find('$')?;
    let tag = &rest[..close];
    if tag.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !tag.starts_with(|c: char| c.is_ascii_digit())
    {
        Some(&s[..close + 2])
    } else {
        None
    }
}

/// Split a script into statements.
///
/// When the script has a semicolon outside literals and comments, it is split
/// on semicolons. Otherwise statements are separated by blank lines. Empty
/// pieces and pieces holding only comments are dropped.
pub fn split_statements(script: &str) -> Vec<String> {
    let map = regions(script);
    let has_semicolon = script
        .bytes()
        .zip(&map)
        .any(|(b, r)| b == b';' && *r == Region::Code);

    let mut statements = Vec::new();
    let mut start = 0;
    let mut push = |piece: &str, piece_map: &[Region]| {
        let has_code = piece
            .bytes()
            .zip(piece_map)
            .any(|(b, r)| *r != Region::Comment && !b.is_ascii_whitespace());
        if has_code {
            statements.push(piece.trim().to_string());
        }
    };

    if has_semicolon {
        for (i, b) in script.bytes().enumerate() {
            if b == b';' && map[i] == Region::Code {
                push(&script[start..i], &map[start..i]);
                start = i + 1;
            }
        }
    } else {
        let mut line_start = 0;
        for (i, b) in script.bytes().enumerate() {
            if b != b'\n' || map[i] != Region::Code {
                continue;
            }
            let line = &script[line_start..i];
            if line.trim().is_empty() && line_start > start {
                push(&script[start..line_start], &map[start..line_start]);
                start = i + 1;
            }
            line_start = i + 1;
        }
    }
    push(&script[start..], &map[start..]);
    statements
}

/// `sql` without trailing comments, semicolons and whitespace, so the
/// statement can be embedded in a larger query
pub fn trim_statement(sql: &str) -> &str {
    let map = regions(sql);
    let bytes = sql.as_bytes();
    let mut end = bytes.len();
    while end > 0 {
        let idx = end - 1;
        let trailing = map[idx] == Region::Comment
            || (map[idx] == Region::Code && (bytes[idx] == b';' || bytes[idx].is_ascii_whitespace()));
        if !trailing {
            break;
        }
        end = idx;
    }
    sql[..end].trim_start()
}

/// Statement text with comments removed and literals blanked out, for
/// keyword scanning.
pub fn strip_comments_and_literals(sql: &str) -> String {
    let map = regions(sql);
    let mut out = String::with_capacity(sql.len());
    let mut prev = Region::Code;
    for (i, c) in sql.char_indices() {
        match map[i] {
            Region::Code => out.push(c),
            Region::Comment if prev != Region::Comment => out.push(' '),
            Region::Literal if prev != Region::Literal => out.push_str("''"),
            _ => {}
        }
        prev = map[i];
    }
    out
}

fn keywords(cleaned: &str) -> impl Iterator<Item = String> + '_ {
    cleaned
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .map(str::to_ascii_uppercase)
}

/// First keyword of a statement, upper-cased
pub fn leading_keyword(sql: &str) -> Option<String> {
    keywords(&strip_comments_and_literals(sql)).next()
}

/// When statements need confirmation before running
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertMode {
    #[default]
    Off,
    /// Confirm statements that delete rows
    Delete,
    /// Confirm anything that writes
    Write,
}

/// How dangerous a statement (or script) is
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlertSeverity {
    #[default]
    None,
    Write,
    Delete,
}

const WRITE_KEYWORDS: &[&str] = &[
    "CREATE", "ALTER", "DROP", "TRUNCATE", "RENAME", "INSERT", "UPDATE", "MERGE", "REPLACE",
    "UPSERT", "DELETE",
];

fn classify_statement(statement: &str) -> AlertSeverity {
    let mut severity = AlertSeverity::None;
    for word in keywords(&strip_comments_and_literals(statement)) {
        if word == "DELETE" {
            return AlertSeverity::Delete;
        }
        if WRITE_KEYWORDS.contains(&word.as_str()) {
            severity = AlertSeverity::Write;
        }
    }
    severity
}

/// Highest severity over every statement of a script
pub fn classify_alert(script: &str) -> AlertSeverity {
    split_statements(script)
        .iter()
        .map(|s| classify_statement(s))
        .max()
        .unwrap_or_default()
}

pub fn should_confirm(mode: AlertMode, severity: AlertSeverity) -> bool {
    match mode {
        AlertMode::Off => false,
        AlertMode::Delete => severity == AlertSeverity::Delete,
        AlertMode::Write => severity != AlertSeverity::None,
    }
}

/// Whether a single statement can be wrapped in a paginating outer query
pub fn is_pageable_select(sql: &str) -> bool {
    let cleaned = strip_comments_and_literals(sql);
    let mut words = keywords(&cleaned);
    match words.next().as_deref() {
        Some("SELECT") | Some("WITH") | Some("VALUES") | Some("TABLE") => {}
        _ => return false,
    }
    // Row-locking and side-effecting forms can't be re-run as pages
    let code = cleaned.trim_end().trim_end_matches(';');
    if code.contains(';') {
        return false;
    }
    let mut prev = String::new();
    for word in words {
        let blocked = matches!(
            word.as_str(),
            "INTO" | "INSERT" | "UPDATE" | "DELETE" | "MERGE" | "NOWAIT"
        ) || (prev == "FOR" && matches!(word.as_str(), "SHARE" | "NO" | "KEY"));
        if blocked {
            return false;
        }
        prev = word;
    }
    true
}

/// Statements that open or close an explicit transaction block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionControl {
    Begin,
    /// COMMIT, ROLLBACK or END
    End,
}

/// Whether `sql` is a transaction control statement.
///
/// `ROLLBACK TO SAVEPOINT` and procedural `BEGIN ... END` blocks are not.
pub fn transaction_control(sql: &str) -> Option<TransactionControl> {
    let words: Vec<String> = keywords(&strip_comments_and_literals(sql)).collect();
    let rest_is = |allowed: &[&str]| words[1..].iter().all(|w| allowed.contains(&w.as_str()));
    match words.first()?.as_str() {
        "BEGIN" => {
            let opener = words.get(1).is_none_or(|w| {
                matches!(
                    w.as_str(),
                    "WORK" | "TRANSACTION" | "TRAN" | "ISOLATION" | "READ" | "DEFERRED"
                        | "IMMEDIATE" | "EXCLUSIVE"
                )
            });
            opener.then_some(TransactionControl::Begin)
        }
        "START" if words.get(1).map(String::as_str) == Some("TRANSACTION") => {
            Some(TransactionControl::Begin)
        }
        "COMMIT" | "ROLLBACK" | "END" if rest_is(&["WORK", "TRANSACTION", "TRAN"]) => {
            Some(TransactionControl::End)
        }
        _ => None,
    }
}

const DDL_KEYWORDS: &[&str] = &["CREATE", "ALTER", "DROP", "TRUNCATE", "RENAME", "COMMENT"];

/// Words that may sit between the DDL verb and the object name
const DDL_MODIFIERS: &[&str] = &[
    "OR", "REPLACE", "TEMP", "TEMPORARY", "UNLOGGED", "UNIQUE", "MATERIALIZED", "IF", "NOT",
    "EXISTS", "TABLE", "VIEW", "INDEX", "SEQUENCE", "FUNCTION", "PROCEDURE", "TRIGGER", "TYPE",
    "CONCURRENTLY", "ON", "COLUMN", "ONLY", "RECURSIVE", "GLOBAL", "LOCAL", "DEFINER", "TO",
];

/// Whether a statement changes schema objects
pub fn is_ddl(sql: &str) -> bool {
    leading_keyword(sql).is_some_and(|k| DDL_KEYWORDS.contains(&k.as_str()))
}

/// Schema touched by a DDL statement.
///
/// Unqualified object names resolve to `default_schema`. `CREATE SCHEMA x`
/// and `DROP SCHEMA x` report `x`. Returns `None` for non-DDL statements or
/// when the target can't be determined.
pub fn ddl_target_schema(sql: &str, default_schema: Option<&str>) -> Option<String> {
    if !is_ddl(sql) {
        return None;
    }
    let tokens = name_tokens(sql);
    let mut iter = tokens.iter().skip(1).peekable();

    let names_schema = iter
        .peek()
        .is_some_and(|t| matches!(t.to_ascii_uppercase().as_str(), "SCHEMA" | "DATABASE"));
    if names_schema {
        iter.next();
        return iter
            .find(|t| !DDL_MODIFIERS.contains(&t.to_ascii_uppercase().as_str()))
            .map(|t| unquote(t));
    }

    // CREATE INDEX name ON schema.table: the table decides the schema
    let upper: Vec<String> = tokens.iter().map(|t| t.to_ascii_uppercase()).collect();
    if upper.iter().any(|t| t == "INDEX")
        && let Some(pos) = upper.iter().position(|t| t == "ON")
        && let Some(table) = tokens.get(pos + 1)
    {
        return qualified_schema(table).or(default_schema.map(str::to_string));
    }

    let name = iter.find(|t| !DDL_MODIFIERS.contains(&t.to_ascii_uppercase().as_str()))?;
    qualified_schema(name).or(default_schema.map(str::to_string))
}

/// Code tokens, keeping quoted identifiers and dotted names whole
fn name_tokens(sql: &str) -> Vec<String> {
    let without_comments: String = {
        let map = regions(sql);
        sql.char_indices()
            .map(|(i, c)| if map[i] == Region::Comment { ' ' } else { c })
            .collect()
    };
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for c in without_comments.chars() {
        match quote {
            Some(q) => {
                current.push(c);
                if c == q {
                    quote = None;
                }
            }
            None if c == '"' || c == '`' => {
                current.push(c);
                quote = Some(c);
            }
            None if c.is_whitespace() || "(),;".contains(c) => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            None => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn qualified_schema(name: &str) -> Option<String> {
    let parts = split_qualified(name);
    if parts.len() >= 2 {
        Some(unquote(&parts[parts.len() - 2]))
    } else {
        None
    }
}

fn split_qualified(name: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for c in name.chars() {
        match quote {
            Some(q) if c == q => {
                quote = None;
                current.push(c);
            }
            Some(_) => current.push(c),
            None if c == '"' || c == '`' => {
                quote = Some(c);
                current.push(c);
            }
            None if c == '.' => parts.push(std::mem::take(&mut current)),
            None => current.push(c),
        }
    }
    parts.push(current);
    parts
}

fn unquote(ident: &str) -> String {
    for q in ['"', '`'] {
        if let Some(inner) = ident.strip_prefix(q).and_then(|s| s.strip_suffix(q)) {
            let doubled: String = [q, q].iter().collect();
            return inner.replace(&doubled, &q.to_string());
        }
    }
    ident.to_lowercase()
}

/// Single-line, truncated rendering of SQL for log fields
pub fn sql_preview(sql: &str) -> String {
    const MAX: usize = 80;
    let flat: String = sql.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= MAX {
        flat
    } else {
        let cut: String = flat.chars().take(MAX).collect();
        format!("{}…", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_on_semicolons() {
        let stmts = split_statements("SELECT 1; SELECT 2;\n SELECT 3");
        assert_eq!(stmts, vec!["SELECT 1", "SELECT 2", "SELECT 3"]);
    }

    #[test]
    fn split_ignores_semicolons_in_literals_and_comments() {
        let stmts = split_statements(
            "INSERT INTO t VALUES ('a;b', \"x;y\"); -- trailing; comment\nSELECT /* ; */ 2;",
        );
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[0], "INSERT INTO t VALUES ('a;b', \"x;y\")");
        assert!(stmts[1].ends_with("SELECT /* ; */ 2"));
    }

    #[test]
    fn split_dollar_quoted_body() {
        let script = "CREATE FUNCTION f() RETURNS int AS $$ SELECT 1; $$ LANGUAGE sql; SELECT f()";
        let stmts = split_statements(script);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].contains("SELECT 1; $$"));
    }

    #[test]
    fn split_on_blank_lines_without_semicolons() {
        let stmts = split_statements("SELECT 1\nFROM a\n\n\nSELECT 2\n  \nSELECT 'x\n\ny'");
        assert_eq!(stmts, vec!["SELECT 1\nFROM a", "SELECT 2", "SELECT 'x\n\ny'"]);
    }

    #[test]
    fn split_drops_empty_and_comment_only() {
        assert!(split_statements("  ;; \n -- nothing\n").is_empty());
        assert!(split_statements("").is_empty());
    }

    #[test]
    fn alert_classification() {
        assert_eq!(classify_alert("SELECT * FROM users"), AlertSeverity::None);
        assert_eq!(classify_alert("UPDATE users SET a = 1"), AlertSeverity::Write);
        assert_eq!(
            classify_alert("SELECT 1; DELETE FROM users"),
            AlertSeverity::Delete
        );
        assert_eq!(
            classify_alert("SELECT 'drop table x' -- delete\n FROM t"),
            AlertSeverity::None
        );
        assert_eq!(classify_alert("SELECT \"update\" FROM t"), AlertSeverity::None);
    }

    #[test]
    fn confirmation_follows_mode() {
        assert!(!should_confirm(AlertMode::Off, AlertSeverity::Delete));
        assert!(should_confirm(AlertMode::Delete, AlertSeverity::Delete));
        assert!(!should_confirm(AlertMode::Delete, AlertSeverity::Write));
        assert!(should_confirm(AlertMode::Write, AlertSeverity::Write));
        assert!(!should_confirm(AlertMode::Write, AlertSeverity::None));
    }

    #[test]
    fn pageable_detection() {
        assert!(is_pageable_select("select * from users;"));
        assert!(is_pageable_select("WITH x AS (SELECT 1) SELECT * FROM x"));
        assert!(is_pageable_select("SELECT 'insert' FROM t"));
        assert!(!is_pageable_select("SELECT * INTO new_t FROM t"));
        assert!(!is_pageable_select("SELECT * FROM t FOR UPDATE"));
        assert!(!is_pageable_select("SELECT 1; SELECT 2"));
        assert!(!is_pageable_select("UPDATE t SET a = 1"));
        assert!(!is_pageable_select("EXPLAIN SELECT 1"));
    }

    #[test]
    fn trailing_comments_are_trimmed() {
        assert_eq!(trim_statement("SELECT a FROM t -- all rows"), "SELECT a FROM t");
        assert_eq!(
            trim_statement("  SELECT a FROM t; /* done */ ;\n"),
            "SELECT a FROM t"
        );
        assert_eq!(
            trim_statement("SELECT '--x' -- note\nFROM t -- end"),
            "SELECT '--x' -- note\nFROM t"
        );
        assert_eq!(trim_statement("SELECT 'a;'"), "SELECT 'a;'");
    }

    #[test]
    fn transaction_statements() {
        use TransactionControl::*;
        assert_eq!(transaction_control("BEGIN"), Some(Begin));
        assert_eq!(transaction_control("begin transaction;"), Some(Begin));
        assert_eq!(transaction_control("BEGIN IMMEDIATE"), Some(Begin));
        assert_eq!(
            transaction_control("START TRANSACTION READ ONLY"),
            Some(Begin)
        );
        assert_eq!(transaction_control("COMMIT"), Some(End));
        assert_eq!(transaction_control("rollback work"), Some(End));
        assert_eq!(transaction_control("END"), Some(End));
        assert_eq!(transaction_control("ROLLBACK TO SAVEPOINT a"), None);
        assert_eq!(transaction_control("BEGIN SELECT 1; END"), None);
        assert_eq!(transaction_control("SELECT 'BEGIN'"), None);
        assert_eq!(transaction_control("-- COMMIT\nSELECT 1"), None);
    }

    #[test]
    fn ddl_schema_detection() {
        assert_eq!(
            ddl_target_schema("CREATE TABLE sales.orders (id int)", Some("public")),
            Some("sales".into())
        );
        assert_eq!(
            ddl_target_schema("create table if not exists orders (id int)", Some("public")),
            Some("public".into())
        );
        assert_eq!(
            ddl_target_schema("DROP VIEW \"My Schema\".v", None),
            Some("My Schema".into())
        );
        assert_eq!(
            ddl_target_schema("CREATE UNIQUE INDEX idx ON audit.log (ts)", Some("public")),
            Some("audit".into())
        );
        assert_eq!(
            ddl_target_schema("CREATE SCHEMA IF NOT EXISTS Staging", None),
            Some("staging".into())
        );
        assert_eq!(ddl_target_schema("CREATE TABLE t (a int)", None), None);
        assert_eq!(ddl_target_schema("SELECT 1", Some("public")), None);
    }

    #[test]
    fn preview_is_single_line_and_bounded() {
        assert_eq!(sql_preview("SELECT\n  1"), "SELECT 1");
        let long = "x ".repeat(100);
        assert!(sql_preview(&long).chars().count() <= 81);
    }
}
