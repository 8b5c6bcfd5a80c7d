use crate::thread::ThreadMeta;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Category of an executed statement.
///
/// `System` marks driver calls that are not SQL statements (opening a
/// connection, commits issued through `system_call`). `Any` is only used
/// for matching and never produced by [`StatementKind::classify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    Merge,
    Other,
    System,
    Any,
}

impl StatementKind {
    /// Classifies SQL by its leading keyword (case-insensitive, followed by
    /// whitespace or end of text).
    pub fn classify(sql: &str) -> StatementKind {
        let trimmed = sql.trim_start();
        let end = trimmed
            .find(|c: char| c.is_whitespace())
            .unwrap_or(trimmed.len());
        let keyword = &trimmed[..end];

        if keyword.eq_ignore_ascii_case("select") {
            StatementKind::Select
        } else if keyword.eq_ignore_ascii_case("insert") {
            StatementKind::Insert
        } else if keyword.eq_ignore_ascii_case("update") {
            StatementKind::Update
        } else if keyword.eq_ignore_ascii_case("delete") {
            StatementKind::Delete
        } else if keyword.eq_ignore_ascii_case("merge") {
            StatementKind::Merge
        } else {
            StatementKind::Other
        }
    }

    /// Whether a statement of kind `observed` counts toward this kind.
    /// `Any` covers every SQL statement but not `System` calls.
    pub fn matches(self, observed: StatementKind) -> bool {
        match self {
            StatementKind::Any => observed != StatementKind::System,
            kind => kind == observed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StatementKind::Select => "SELECT",
            StatementKind::Insert => "INSERT",
            StatementKind::Update => "UPDATE",
            StatementKind::Delete => "DELETE",
            StatementKind::Merge => "MERGE",
            StatementKind::Other => "OTHER",
            StatementKind::System => "SYSTEM",
            StatementKind::Any => "ANY",
        }
    }
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Collapses placeholder lists so that `id in (?, ?, ?)` and `id IN (?,?)`
/// are accounted as one statement: `id in (?)`.
///
/// A list needs at least two placeholders and whitespace before `in`.
pub fn normalize_sql(sql: &str) -> String {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i].is_ascii_whitespace()
            && let Some(end) = match_placeholder_list(bytes, i + 1)
        {
            out.push_str(&sql[copied..i]);
            out.push_str(" in (?)");
            copied = end;
            i = end;
            continue;
        }
        i += 1;
    }

    out.push_str(&sql[copied..]);
    out
}

/// Matches `in\s*\((\s*\?\s*,)+\s*\?\s*\)` at `start`, returning the index
/// past the closing parenthesis.
fn match_placeholder_list(b: &[u8], start: usize) -> Option<usize> {
    let keyword = b.get(start..start + 2)?;
    if !keyword.eq_ignore_ascii_case(b"in") {
        return None;
    }

    let mut i = skip_whitespace(b, start + 2);
    if b.get(i) != Some(&b'(') {
        return None;
    }
    i += 1;

    let mut placeholders = 0;
    loop {
        i = skip_whitespace(b, i);
        if b.get(i) != Some(&b'?') {
            return None;
        }
        placeholders += 1;
        i = skip_whitespace(b, i + 1);
        match b.get(i) {
            Some(b',') => i += 1,
            Some(b')') => return (placeholders >= 2).then_some(i + 1),
            _ => return None,
        }
    }
}

fn skip_whitespace(b: &[u8], mut i: usize) -> usize {
    while b.get(i).is_some_and(|c| c.is_ascii_whitespace()) {
        i += 1;
    }
    i
}

/// Identifies one accounted statement: normalized text, kind, thread and
/// (optionally) the call site.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct StatementIdentity {
    pub sql: Arc<str>,
    pub kind: StatementKind,
    pub owner_thread: ThreadMeta,
    pub stack_trace: Option<Arc<str>>,
}

impl StatementIdentity {
    pub fn without_stack_trace(&self) -> Self {
        Self {
            stack_trace: None,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(StatementKind::classify("SELECT 1"), StatementKind::Select);
        assert_eq!(
            StatementKind::classify("  insert into t values (1)"),
            StatementKind::Insert
        );
        assert_eq!(StatementKind::classify("Update t set a = 1"), StatementKind::Update);
        assert_eq!(StatementKind::classify("delete\nfrom t"), StatementKind::Delete);
        assert_eq!(StatementKind::classify("MERGE INTO t"), StatementKind::Merge);
        assert_eq!(StatementKind::classify("select"), StatementKind::Select);
        assert_eq!(StatementKind::classify("selected_rows"), StatementKind::Other);
        assert_eq!(StatementKind::classify("CALL proc()"), StatementKind::Other);
        assert_eq!(StatementKind::classify(""), StatementKind::Other);
    }

    #[test]
    fn test_any_excludes_system() {
        assert!(StatementKind::Any.matches(StatementKind::Select));
        assert!(StatementKind::Any.matches(StatementKind::Other));
        assert!(!StatementKind::Any.matches(StatementKind::System));
        assert!(StatementKind::System.matches(StatementKind::System));
        assert!(!StatementKind::Insert.matches(StatementKind::Select));
    }

    #[test]
    fn test_normalize_in_lists() {
        assert_eq!(
            normalize_sql("select * from t where id in (?, ?, ?)"),
            "select * from t where id in (?)"
        );
        assert_eq!(
            normalize_sql("SELECT * FROM t WHERE id IN(?,?) AND x = ?"),
            "SELECT * FROM t WHERE id in (?) AND x = ?"
        );
        assert_eq!(
            normalize_sql("select * from t where a in ( ? ,\n ? ) or b in (?, ?)"),
            "select * from t where a in (?) or b in (?)"
        );
    }

    #[test]
    fn test_normalize_leaves_other_text() {
        // single placeholder and literal lists are untouched
        assert_eq!(
            normalize_sql("select * from t where id in (?)"),
            "select * from t where id in (?)"
        );
        assert_eq!(
            normalize_sql("select * from t where id in (1, 2)"),
            "select * from t where id in (1, 2)"
        );
        assert_eq!(normalize_sql("select 'café' from t"), "select 'café' from t");
        assert_eq!(normalize_sql("select x from join_in (?, ?)"), "select x from join_in (?, ?)");
    }
}
