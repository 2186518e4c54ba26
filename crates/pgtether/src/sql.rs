//! SQL text helpers
//!
//! - Statement classification by leading keyword
//! - Single-quote escaping for generated literals
//! - Best-effort `INSERT INTO … (cols) VALUES` parsing for the bulk path
//! - Multi-row `VALUES` statement building with positional placeholders
//! - Stable statement cache keys
//!
//! The insert parser is intentionally simple string splitting. It only needs
//! to recognize the statements our own generators produce; anything it cannot
//! parse falls back to standard execution at the call site.

use std::hash::Hasher;

/// Statement classification by leading keyword
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    /// SELECT and other row-producing statements (WITH, SHOW, EXPLAIN, VALUES)
    Select,
    /// INSERT
    Insert,
    /// UPDATE
    Update,
    /// DELETE
    Delete,
    /// Everything else (DDL, SET, utility statements)
    Other,
}

impl QueryKind {
    /// Classify a statement by its first keyword
    pub fn of(sql: &str) -> Self {
        let first = sql
            .trim_start()
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        match first.as_str() {
            "select" | "with" | "show" | "explain" | "values" | "table" => Self::Select,
            "insert" => Self::Insert,
            "update" => Self::Update,
            "delete" => Self::Delete,
            _ => Self::Other,
        }
    }

    /// Whether statements of this kind modify data
    #[inline]
    pub const fn is_write(self) -> bool {
        matches!(self, Self::Insert | Self::Update | Self::Delete)
    }

    /// Whether statements of this kind produce a result set
    #[inline]
    pub const fn returns_rows(self) -> bool {
        matches!(self, Self::Select)
    }
}

/// Escape single quotes that sit between two word characters, so generated
/// literals with embedded apostrophes survive. Callers must not pre-escape.
pub fn escape_single_quotes(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    for (i, &c) in chars.iter().enumerate() {
        if c == '\'' {
            let prev_word = i > 0 && is_word_char(chars[i - 1]);
            let next_word = chars.get(i + 1).is_some_and(|&n| is_word_char(n));
            if prev_word && next_word {
                out.push_str("''");
                continue;
            }
        }
        out.push(c);
    }
    out
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Best-effort parse of `INSERT INTO <table> (<cols>) VALUES …`, returning
/// the table name and column list. Returns `None` for anything it cannot
/// confidently split apart.
pub fn parse_insert(sql: &str) -> Option<(String, Vec<String>)> {
    let lower = sql.to_ascii_lowercase();
    let after = lower.find("insert into")? + "insert into".len();
    let rest = &sql[after..];

    let open = rest.find('(')?;
    let table = rest[..open].trim();
    if table.is_empty() || table.contains(char::is_whitespace) {
        return None;
    }

    let close = rest[open + 1..].find(')')?;
    let columns: Vec<String> = rest[open + 1..open + 1 + close]
        .split(',')
        .map(|c| c.trim().to_string())
        .collect();
    if columns.is_empty() || columns.iter().any(String::is_empty) {
        return None;
    }

    Some((table.to_string(), columns))
}

/// Build a multi-row `INSERT … VALUES` statement with `$n` placeholders for
/// `row_count` rows of `columns.len()` values each.
pub fn build_multi_insert(table: &str, columns: &[String], row_count: usize) -> String {
    let width = columns.len();
    let mut sql = format!("INSERT INTO {} ({}) VALUES ", table, columns.join(", "));
    for row in 0..row_count {
        if row > 0 {
            sql.push_str(", ");
        }
        sql.push('(');
        for col in 0..width {
            if col > 0 {
                sql.push_str(", ");
            }
            sql.push('$');
            sql.push_str(&(row * width + col + 1).to_string());
        }
        sql.push(')');
    }
    sql
}

/// Stable 64-bit FNV-1a hash of the statement text. Used as a prepared
/// statement cache key; stable across processes, unlike the default hasher.
pub fn statement_key(sql: &str) -> u64 {
    let mut hasher = Fnv1a::default();
    hasher.write(sql.as_bytes());
    hasher.finish()
}

struct Fnv1a(u64);

impl Default for Fnv1a {
    fn default() -> Self {
        Self(0xcbf2_9ce4_8422_2325)
    }
}

impl Hasher for Fnv1a {
    fn finish(&self) -> u64 {
        self.0
    }

    fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 ^= u64::from(b);
            self.0 = self.0.wrapping_mul(0x0000_0100_0000_01b3);
        }
    }
}

/// Truncate statement text for log and error messages
pub fn truncate_sql(sql: &str, max_chars: usize) -> String {
    if sql.chars().count() <= max_chars {
        return sql.to_string();
    }
    let mut out: String = sql.chars().take(max_chars).collect();
    out.push_str("...");
    out
}
