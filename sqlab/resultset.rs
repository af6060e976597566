use serde::{Deserialize, Serialize};

/// Column metadata kept alongside archived rows. `type_name` is the server's
/// type tag (`LONG`, `DOUBLE`, `JSON`, ...) and drives the digest column
/// filters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub type_name: String,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        ColumnDef {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

/// Metadata of an exec-shaped statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutcome {
    pub rows_affected: u64,
    pub last_insert_id: u64,
}

/// One side's outcome of one statement: an archived result set or an error
/// text. Error content is never compared, only recorded.
pub type Outcome = Result<ResultSet, String>;

/// A fully materialized result set. Cells are the server's raw bytes
/// (`None` for SQL NULL), so digests compare content rather than client
/// formatting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    pub cols: Vec<ColumnDef>,
    pub rows: Vec<Vec<Option<Vec<u8>>>>,
    pub exec: Option<ExecOutcome>,
}

impl ResultSet {
    pub fn from_exec(rows_affected: u64, last_insert_id: u64) -> Self {
        ResultSet {
            exec: Some(ExecOutcome {
                rows_affected,
                last_insert_id,
            }),
            ..ResultSet::default()
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn col_count(&self) -> usize {
        self.cols.len()
    }

    /// Archival form, stable across encode/decode.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Human-readable table for failure reports.
    pub fn dump(&self) -> String {
        if let Some(exec) = &self.exec {
            return format!(
                "rows affected: {}, last insert id: {}\n",
                exec.rows_affected, exec.last_insert_id
            );
        }
        let mut out = String::new();
        if !self.cols.is_empty() {
            let names: Vec<&str> = self.cols.iter().map(|c| c.name.as_str()).collect();
            out.push_str(&names.join(" | "));
            out.push('\n');
        }
        for row in &self.rows {
            let cells: Vec<String> = row
                .iter()
                .map(|c| match c {
                    None => "NULL".to_string(),
                    Some(b) => String::from_utf8_lossy(b).into_owned(),
                })
                .collect();
            out.push_str(&cells.join(" | "));
            out.push('\n');
        }
        if self.rows.is_empty() {
            out.push_str("(no rows)\n");
        }
        out
    }
}

/// Build a result set from string cells. Test helper shared across the
/// digest and comparison tests.
#[cfg(test)]
pub(crate) fn rs(cells: &[&[Option<&str>]]) -> ResultSet {
    ResultSet {
        cols: vec![],
        rows: cells
            .iter()
            .map(|row| {
                row.iter()
                    .map(|c| c.map(|s| s.as_bytes().to_vec()))
                    .collect()
            })
            .collect(),
        exec: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let mut r = rs(&[&[Some("1"), None], &[Some("2"), Some("x")]]);
        r.cols = vec![ColumnDef::new("a", "LONG"), ColumnDef::new("b", "VARCHAR")];
        let raw = r.encode().unwrap();
        assert_eq!(ResultSet::decode(&raw).unwrap(), r);
    }

    #[test]
    fn exec_roundtrip_and_dump() {
        let r = ResultSet::from_exec(3, 7);
        let back = ResultSet::decode(&r.encode().unwrap()).unwrap();
        assert_eq!(back.exec.unwrap().rows_affected, 3);
        assert!(r.dump().contains("rows affected: 3"));
    }

    #[test]
    fn dump_renders_nulls() {
        let mut r = rs(&[&[Some("1"), None]]);
        r.cols = vec![ColumnDef::new("a", "LONG"), ColumnDef::new("b", "VARCHAR")];
        assert_eq!(r.dump(), "a | b\n1 | NULL\n");
    }
}
