/// Statement Helpers Module
///
/// Lightweight, dialect-agnostic inspection of SQL text: classifying a
/// statement, deciding whether it is safe to serve from the result cache,
/// splitting a script into statements and normalizing text for cache keys.
/// None of this parses SQL beyond tokens, quotes and comments.

use once_cell::sync::Lazy;
use regex::Regex;

/// Leading whitespace and comments ahead of the first keyword
static LEADING_TRIVIA: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^(?:\s+|--[^\n]*(?:\n|$)|/\*.*?\*/)*").expect("valid trivia regex")
});

/// Keywords that make a `WITH` statement data-modifying
static DML_KEYWORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:INSERT|UPDATE|DELETE|MERGE)\b").expect("valid keyword regex")
});

/// Represents different SQL statement types for introspection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementType {
    /// SELECT statement
    Select,
    /// WITH (common table expression) statement
    With,
    /// INSERT statement
    Insert,
    /// UPDATE statement
    Update,
    /// DELETE statement
    Delete,
    /// CREATE statement
    Create,
    /// DROP statement
    Drop,
    /// ALTER statement
    Alter,
    /// BEGIN/COMMIT/ROLLBACK transaction commands
    Transaction,
    /// PRAGMA statement
    Pragma,
    /// Other statement types
    Other,
}

impl StatementType {
    /// Determines the statement type from its first keyword, ignoring
    /// leading comments.
    pub fn from_sql(sql: &str) -> Self {
        let body = strip_leading_trivia(sql);
        let keyword: String = body
            .chars()
            .take_while(|c| c.is_ascii_alphabetic())
            .collect::<String>()
            .to_uppercase();

        match keyword.as_str() {
            "SELECT" => StatementType::Select,
            "WITH" => StatementType::With,
            "INSERT" | "REPLACE" => StatementType::Insert,
            "UPDATE" => StatementType::Update,
            "DELETE" => StatementType::Delete,
            "CREATE" => StatementType::Create,
            "DROP" => StatementType::Drop,
            "ALTER" => StatementType::Alter,
            "BEGIN" | "COMMIT" | "ROLLBACK" | "END" | "SAVEPOINT" | "RELEASE" => {
                StatementType::Transaction
            }
            "PRAGMA" => StatementType::Pragma,
            _ => StatementType::Other,
        }
    }
}

fn strip_leading_trivia(sql: &str) -> &str {
    match LEADING_TRIVIA.find(sql) {
        Some(m) => &sql[m.end()..],
        None => sql,
    }
}

/// Returns true when the statement cannot change data.
///
/// A `WITH` statement counts as read-only only if no DML keyword appears
/// anywhere in its code (string literals and comments are ignored).
pub fn is_read_only(sql: &str) -> bool {
    match StatementType::from_sql(sql) {
        StatementType::Select => true,
        StatementType::With => !DML_KEYWORD.is_match(&code_only(sql)),
        _ => false,
    }
}

/// Lexical regions the scanners below care about
#[derive(Clone, Copy, PartialEq)]
enum Region {
    Code,
    Quoted(char),
    LineComment,
    BlockComment,
}

/// Walks `sql` calling `visit` with each character and the region it sits in.
fn scan(sql: &str, mut visit: impl FnMut(usize, char, Region)) {
    let chars: Vec<(usize, char)> = sql.char_indices().collect();
    let mut region = Region::Code;
    let mut i = 0;

    while i < chars.len() {
        let (pos, c) = chars[i];
        let next = chars.get(i + 1).map(|&(_, n)| n);

        match region {
            Region::Code => match (c, next) {
                ('-', Some('-')) => region = Region::LineComment,
                ('/', Some('*')) => {
                    visit(pos, c, Region::BlockComment);
                    visit(chars[i + 1].0, '*', Region::BlockComment);
                    region = Region::BlockComment;
                    i += 2;
                    continue;
                }
                ('\'', _) | ('"', _) | ('`', _) => region = Region::Quoted(c),
                ('[', _) => region = Region::Quoted(']'),
                _ => {}
            },
            Region::Quoted(close) if c == close => {
                // A doubled quote is an escaped quote inside the literal
                if next == Some(close) && close != ']' {
                    visit(pos, c, region);
                    visit(chars[i + 1].0, close, region);
                    i += 2;
                    continue;
                }
                visit(pos, c, region);
                region = Region::Code;
                i += 1;
                continue;
            }
            Region::LineComment if c == '\n' => {
                region = Region::Code;
            }
            Region::BlockComment if c == '*' && next == Some('/') => {
                visit(pos, c, region);
                visit(chars[i + 1].0, '/', region);
                region = Region::Code;
                i += 2;
                continue;
            }
            _ => {}
        }

        visit(pos, c, region);
        i += 1;
    }
}

/// Replaces literals and comments with spaces so keyword searches only see code
fn code_only(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    scan(sql, |_, c, region| {
        out.push(if region == Region::Code { c } else { ' ' });
    });
    out
}

/// Splits a script into individual statements on `;` outside literals and
/// comments. Blank pieces are dropped; each statement is trimmed.
pub fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut start = 0;

    scan(sql, |pos, c, region| {
        if c == ';' && region == Region::Code {
            let piece = sql[start..pos].trim();
            if !piece.is_empty() {
                statements.push(piece.to_string());
            }
            start = pos + 1;
        }
    });

    let tail = sql[start..].trim();
    if !tail.is_empty() {
        statements.push(tail.to_string());
    }

    // A piece consisting only of comments is not a statement
    statements.retain(|s| !strip_leading_trivia(s).is_empty());
    statements
}

/// Normalizes SQL text for use in a cache fingerprint: trims, collapses
/// whitespace runs outside literals to one space and drops trailing `;`.
pub fn normalize(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut pending_space = false;
    let mut previous = Region::Code;

    scan(sql.trim(), |_, c, region| {
        let after_line_comment = previous == Region::LineComment;
        previous = region;

        if region == Region::Code && c.is_whitespace() {
            // The newline ending a line comment is significant
            if after_line_comment {
                out.push('\n');
                pending_space = false;
            } else {
                pending_space = true;
            }
            return;
        }
        if pending_space && !out.is_empty() && !out.ends_with('\n') {
            out.push(' ');
        }
        pending_space = false;
        out.push(c);
    });

    while out.ends_with(|c: char| c == ';' || c.is_whitespace()) {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statement_type_classification() {
        assert_eq!(StatementType::from_sql("SELECT * FROM users"), StatementType::Select);
        assert_eq!(StatementType::from_sql("  select 1"), StatementType::Select);
        assert_eq!(StatementType::from_sql("INSERT INTO users VALUES (1, 'test')"), StatementType::Insert);
        assert_eq!(StatementType::from_sql("UPDATE users SET name = 'new'"), StatementType::Update);
        assert_eq!(StatementType::from_sql("DELETE FROM users WHERE id = 1"), StatementType::Delete);
        assert_eq!(StatementType::from_sql("CREATE TABLE test (id INTEGER)"), StatementType::Create);
        assert_eq!(StatementType::from_sql("DROP TABLE test"), StatementType::Drop);
        assert_eq!(StatementType::from_sql("BEGIN"), StatementType::Transaction);
        assert_eq!(StatementType::from_sql("COMMIT"), StatementType::Transaction);
        assert_eq!(StatementType::from_sql("ROLLBACK TRANSACTION"), StatementType::Transaction);
        assert_eq!(StatementType::from_sql("PRAGMA foreign_keys = ON"), StatementType::Pragma);
        assert_eq!(StatementType::from_sql("VACUUM"), StatementType::Other);
    }

    #[test]
    fn test_classification_skips_leading_comments() {
        assert_eq!(
            StatementType::from_sql("-- fetch everyone\nSELECT * FROM users"),
            StatementType::Select
        );
        assert_eq!(
            StatementType::from_sql("/* cleanup */ DELETE FROM users"),
            StatementType::Delete
        );
    }

    #[test]
    fn test_read_only_detection() {
        assert!(is_read_only("SELECT * FROM t"));
        assert!(is_read_only("WITH x AS (SELECT 1) SELECT * FROM x"));
        assert!(is_read_only("WITH x AS (SELECT 'delete me' AS note) SELECT * FROM x"));
        assert!(!is_read_only("WITH x AS (SELECT 1) DELETE FROM t WHERE id IN x"));
        assert!(!is_read_only("UPDATE t SET a = 1"));
        assert!(!is_read_only("PRAGMA journal_mode = DELETE"));
        assert!(!is_read_only("BEGIN"));
    }

    #[test]
    fn test_split_statements() {
        assert_eq!(split_statements("SELECT 1"), vec!["SELECT 1"]);
        assert_eq!(
            split_statements("SELECT 1; SELECT 2;\n\n;"),
            vec!["SELECT 1", "SELECT 2"]
        );
        assert!(split_statements("  ;  ").is_empty());
    }

    #[test]
    fn test_split_ignores_semicolons_in_literals_and_comments() {
        let script = "INSERT INTO t VALUES ('a;b'); -- trailing; comment\nSELECT \"x;y\" FROM t /* ; */";
        assert_eq!(
            split_statements(script),
            vec![
                "INSERT INTO t VALUES ('a;b')",
                "-- trailing; comment\nSELECT \"x;y\" FROM t /* ; */",
            ]
        );
        assert_eq!(
            split_statements("SELECT 'it''s; fine'; SELECT 2"),
            vec!["SELECT 'it''s; fine'", "SELECT 2"]
        );
    }

    #[test]
    fn test_comment_only_piece_is_dropped() {
        assert_eq!(split_statements("SELECT 1; -- done"), vec!["SELECT 1"]);
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("  SELECT *\n\tFROM   t ;  "), "SELECT * FROM t");
        assert_eq!(normalize("SELECT 'a   b'"), "SELECT 'a   b'");
        assert_ne!(normalize("SELECT 'a  b'"), normalize("SELECT 'a b'"));
        assert_eq!(normalize("SELECT 1;;"), "SELECT 1");
        assert_ne!(
            normalize("SELECT a -- note\nFROM t"),
            normalize("SELECT a -- note FROM t")
        );
    }
}
