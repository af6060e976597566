use std::fmt;

use serde::{Deserialize, Serialize};

/// Execution errors on this statement are expected and must not fail a run.
pub const STMT_IGNERR: u32 = 1 << 0;
/// The statement produces a result set to digest and compare.
pub const STMT_QUERY: u32 = 1 << 1;
/// The result set has a deterministic row order (trailing ORDER BY over all
/// output columns, or equivalent).
pub const STMT_SORTED: u32 = 1 << 2;
/// The statement carries `?` placeholders and must go through a prepared
/// execution path with [`Stmt::params`].
pub const STMT_PREPARED: u32 = 1 << 3;

/// A value bound to a `?` placeholder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Param {
    Null,
    Int(i64),
    Float(f64),
    Str(String),
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Param::Null => f.write_str("NULL"),
            Param::Int(v) => write!(f, "{v}"),
            Param::Float(v) => write!(f, "{v}"),
            Param::Str(v) => write!(f, "'{}'", v.replace('\'', "''")),
        }
    }
}

/// One generated statement: final SQL text, behavior flags and any bound
/// parameters collected by the script hooks while the text was produced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stmt {
    pub sql: String,
    pub flags: u32,
    pub params: Vec<Param>,
}

impl Stmt {
    /// Build the final statement from accumulated text and script state.
    /// Flags the scripts did not set explicitly are inferred from the text.
    pub fn seal(sql: String, mut flags: u32, params: Vec<Param>) -> Self {
        if looks_like_query(&sql) {
            flags |= STMT_QUERY;
        }
        if !params.is_empty() {
            flags |= STMT_PREPARED;
        }
        Stmt { sql, flags, params }
    }

    pub fn is_query(&self) -> bool {
        self.flags & STMT_QUERY != 0
    }

    pub fn is_sorted(&self) -> bool {
        self.flags & STMT_SORTED != 0
    }

    pub fn is_prepared(&self) -> bool {
        self.flags & STMT_PREPARED != 0
    }

    pub fn ignores_errors(&self) -> bool {
        self.flags & STMT_IGNERR != 0
    }

    /// The statement with every placeholder replaced by its bound value,
    /// for dumps and repro files.
    pub fn inlined(&self) -> String {
        if self.params.is_empty() {
            return self.sql.clone();
        }
        let mut out = String::with_capacity(self.sql.len());
        let mut params = self.params.iter();
        for c in self.sql.chars() {
            if c == '?' {
                match params.next() {
                    Some(p) => out.push_str(&p.to_string()),
                    None => out.push(c),
                }
            } else {
                out.push(c);
            }
        }
        out
    }
}

impl fmt::Display for Stmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};", self.sql.trim_end_matches(';').trim_end())?;
        if !self.params.is_empty() {
            let vals: Vec<String> = self.params.iter().map(|p| p.to_string()).collect();
            write!(f, " -- params: [{}]", vals.join(", "))?;
        }
        if self.flags != 0 {
            let mut names = Vec::new();
            if self.ignores_errors() {
                names.push("ignerr");
            }
            if self.is_query() {
                names.push("query");
            }
            if self.is_sorted() {
                names.push("sorted");
            }
            if self.is_prepared() {
                names.push("prepared");
            }
            write!(f, " -- flags: {}", names.join("|"))?;
        }
        Ok(())
    }
}

/// Whether the leading word of `sql` marks a result-producing statement.
pub fn looks_like_query(sql: &str) -> bool {
    let mut words = sql
        .split_whitespace()
        .map(|w| w.to_ascii_lowercase());
    match words.next().as_deref() {
        Some("select" | "show" | "explain" | "desc" | "describe") => true,
        Some("admin") => words.next().as_deref() == Some("show"),
        _ => false,
    }
}
