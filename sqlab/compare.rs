use sqlab_sqlgen::Stmt;

use crate::digest::{ordered_digest, unordered_digest, ColumnFilter};
use crate::resultset::{ColumnDef, Outcome};

/// Result of comparing one statement's two outcomes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    /// One side erred and the other did not. Error content is never
    /// compared, only presence.
    ErrorMismatch {
        a_err: Option<String>,
        b_err: Option<String>,
    },
    DigestMismatch {
        a_digest: String,
        b_digest: String,
        ordered: bool,
    },
    ExecMismatch {
        a: (u64, u64),
        b: (u64, u64),
    },
}

impl Verdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Pass)
    }

    /// One-line failure description for store messages and reports.
    pub fn describe(&self, stmt: &Stmt) -> String {
        match self {
            Verdict::Pass => "pass".to_string(),
            Verdict::ErrorMismatch { a_err, b_err } => format!(
                "error presence mismatch on `{}`: a={:?} b={:?}",
                stmt.sql, a_err, b_err
            ),
            Verdict::DigestMismatch {
                a_digest,
                b_digest,
                ordered,
            } => format!(
                "result digest mismatch ({}) on `{}`: a={} b={}",
                if *ordered { "ordered" } else { "unordered" },
                stmt.sql,
                a_digest,
                b_digest
            ),
            Verdict::ExecMismatch { a, b } => format!(
                "exec outcome mismatch on `{}`: a=({} rows, id {}) b=({} rows, id {})",
                stmt.sql, a.0, a.1, b.0, b.1
            ),
        }
    }
}

pub fn errors_match(a: &Outcome, b: &Outcome) -> bool {
    a.is_err() == b.is_err()
}

fn contains_word(sql: &str, needle: &str) -> bool {
    sql.to_ascii_lowercase().contains(needle)
}

/// Float and decimal columns render nondeterministically under `union`, so
/// they are dropped from digests for such statements. JSON formatting is
/// never stable enough to compare.
pub fn volatile_column(c: &ColumnDef) -> bool {
    matches!(
        c.type_name.to_ascii_uppercase().as_str(),
        "FLOAT" | "DOUBLE" | "DECIMAL" | "NEWDECIMAL" | "JSON"
    )
}

fn stable_columns(c: &ColumnDef) -> bool {
    !volatile_column(c)
}

/// The per-statement comparison protocol.
///
/// Matched errors pass without further inspection. Query results compare by
/// digest: order-insensitive when both sides returned the same row count
/// above one and the statement is not order-sensitive, order-sensitive
/// otherwise. Exec results optionally compare affected rows and last insert
/// id.
pub fn compare_results(stmt: &Stmt, a: &Outcome, b: &Outcome, check_exec: bool) -> Verdict {
    if !errors_match(a, b) {
        return Verdict::ErrorMismatch {
            a_err: a.as_ref().err().cloned(),
            b_err: b.as_ref().err().cloned(),
        };
    }
    let (ra, rb) = match (a, b) {
        (Ok(ra), Ok(rb)) => (ra, rb),
        // both sides failed the same way as far as we care
        _ => return Verdict::Pass,
    };

    if stmt.is_query() {
        // a force-unordered marker in the text overrides an `order by`,
        // so grammars can opt out for subquery-only ordering
        let order_sensitive = stmt.is_sorted()
            || (contains_word(&stmt.sql, "order by")
                && !contains_word(&stmt.sql, "force-unordered"));
        let unordered =
            !order_sensitive && ra.row_count() == rb.row_count() && ra.row_count() > 1;
        let filter: Option<ColumnFilter> = if contains_word(&stmt.sql, "union") {
            Some(&stable_columns)
        } else {
            None
        };
        let (da, db) = if unordered {
            (unordered_digest(ra, filter), unordered_digest(rb, filter))
        } else {
            (ordered_digest(ra, filter), ordered_digest(rb, filter))
        };
        if da != db {
            return Verdict::DigestMismatch {
                a_digest: da,
                b_digest: db,
                ordered: !unordered,
            };
        }
        return Verdict::Pass;
    }

    if check_exec {
        if let (Some(ea), Some(eb)) = (&ra.exec, &rb.exec) {
            if ea != eb {
                return Verdict::ExecMismatch {
                    a: (ea.rows_affected, ea.last_insert_id),
                    b: (eb.rows_affected, eb.last_insert_id),
                };
            }
        }
    }
    Verdict::Pass
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resultset::{rs, ResultSet};
    use sqlab_sqlgen::{Generator, GeneratorOpts, KeyFunc, KeyFuncs, Stmt};

    fn query(sql: &str) -> Stmt {
        Stmt::seal(sql.to_string(), 0, vec![])
    }

    #[test]
    fn error_presence_only() {
        let ok: Outcome = Ok(ResultSet::default());
        let bad: Outcome = Err("syntax error".into());
        let worse: Outcome = Err("table on fire".into());
        assert!(errors_match(&ok, &ok));
        assert!(errors_match(&bad, &worse));
        assert!(!errors_match(&ok, &bad));
        // matched failures short-circuit to a pass
        assert!(compare_results(&query("SELECT 1"), &bad, &worse, true).is_pass());
        assert!(matches!(
            compare_results(&query("SELECT 1"), &ok, &bad, true),
            Verdict::ErrorMismatch { a_err: None, b_err: Some(_) }
        ));
    }

    #[test]
    fn multirow_queries_compare_unordered() {
        let a: Outcome = Ok(rs(&[&[Some("1")], &[Some("2")]]));
        let b: Outcome = Ok(rs(&[&[Some("2")], &[Some("1")]]));
        assert!(compare_results(&query("SELECT a FROM t"), &a, &b, true).is_pass());
    }

    #[test]
    fn order_by_forces_ordered_compare() {
        let a: Outcome = Ok(rs(&[&[Some("1")], &[Some("2")]]));
        let b: Outcome = Ok(rs(&[&[Some("2")], &[Some("1")]]));
        let v = compare_results(&query("SELECT a FROM t ORDER BY a"), &a, &b, true);
        assert!(matches!(v, Verdict::DigestMismatch { ordered: true, .. }));
    }

    #[test]
    fn force_unordered_marker_overrides_order_by() {
        let a: Outcome = Ok(rs(&[&[Some("1")], &[Some("2")]]));
        let b: Outcome = Ok(rs(&[&[Some("2")], &[Some("1")]]));
        let sql = "SELECT a FROM (SELECT a FROM t ORDER BY a LIMIT 3) s /* force-unordered */";
        assert!(compare_results(&query(sql), &a, &b, true).is_pass());
    }

    #[test]
    fn sorted_flag_forces_ordered_compare() {
        let stmt = Stmt::seal(
            "SELECT a FROM t".to_string(),
            sqlab_sqlgen::STMT_SORTED,
            vec![],
        );
        let a: Outcome = Ok(rs(&[&[Some("1")], &[Some("2")]]));
        let b: Outcome = Ok(rs(&[&[Some("2")], &[Some("1")]]));
        assert!(!compare_results(&stmt, &a, &b, true).is_pass());
    }

    #[test]
    fn differing_row_counts_fail() {
        let a: Outcome = Ok(rs(&[&[Some("1")]]));
        let b: Outcome = Ok(rs(&[&[Some("1")], &[Some("1")]]));
        assert!(!compare_results(&query("SELECT a FROM t"), &a, &b, true).is_pass());
    }

    #[test]
    fn union_ignores_volatile_columns() {
        let mk = |f: &str| {
            let mut r = rs(&[&[Some("1"), Some(f)], &[Some("2"), Some(f)]]);
            r.cols = vec![
                ColumnDef::new("id", "LONG"),
                ColumnDef::new("f", "DOUBLE"),
            ];
            r
        };
        let a: Outcome = Ok(mk("0.30000000000001"));
        let b: Outcome = Ok(mk("0.3"));
        let sql = "SELECT id, f FROM t UNION SELECT id, f FROM u";
        assert!(compare_results(&query(sql), &a, &b, true).is_pass());
        // without union the raw bytes count
        assert!(!compare_results(&query("SELECT id, f FROM t"), &a, &b, true).is_pass());
    }

    #[test]
    fn exec_outcomes_compare_when_enabled() {
        let stmt = query("INSERT INTO t VALUES (1)");
        let a: Outcome = Ok(ResultSet::from_exec(1, 5));
        let b: Outcome = Ok(ResultSet::from_exec(2, 5));
        assert!(matches!(
            compare_results(&stmt, &a, &b, true),
            Verdict::ExecMismatch { .. }
        ));
        assert!(compare_results(&stmt, &a, &b, false).is_pass());
    }

    // The two end-to-end scenarios, replayed against the pure layer with
    // synthetic per-side executions: a key function that agrees on both
    // sides passes, one that diverges is caught by the digest.

    fn side_stmts(grammar: &str, lit: &'static str) -> Vec<Stmt> {
        let mut kf = KeyFuncs::new();
        kf.insert(
            "_int_val".to_string(),
            Box::new(move || Ok(lit.to_string())) as KeyFunc,
        );
        let mut g = Generator::new(grammar, kf, GeneratorOpts::default()).unwrap();
        g.generate().unwrap()
    }

    /// Pretend-execute against an in-memory single-column table.
    fn apply(stmts: &[Stmt], table: &mut Vec<String>) -> Vec<Outcome> {
        stmts
            .iter()
            .map(|s| {
                if let Some(rest) = s.sql.strip_prefix("insert into t values(") {
                    table.push(rest.trim_end_matches(')').trim().to_string());
                    Ok(ResultSet::from_exec(1, 0))
                } else if s.sql.starts_with("select") {
                    Ok(ResultSet {
                        cols: vec![],
                        rows: table
                            .iter()
                            .map(|v| vec![Some(v.as_bytes().to_vec())])
                            .collect(),
                        exec: None,
                    })
                } else {
                    Ok(ResultSet::from_exec(0, 0))
                }
            })
            .collect()
    }

    const SCENARIO: &str = "query: insert into t values( _int_val ) ; select * from t";

    #[test]
    fn agreeing_key_functions_pass_end_to_end() {
        let sa = side_stmts(SCENARIO, "1");
        let sb = side_stmts(SCENARIO, "1");
        let (mut ta, mut tb) = (vec![], vec![]);
        let oa = apply(&sa, &mut ta);
        let ob = apply(&sb, &mut tb);
        for ((s, a), b) in sa.iter().zip(&oa).zip(&ob) {
            assert!(compare_results(s, a, b, true).is_pass());
        }
    }

    #[test]
    fn diverging_key_functions_fail_on_the_select() {
        let sa = side_stmts(SCENARIO, "1");
        let sb = side_stmts(SCENARIO, "2");
        let (mut ta, mut tb) = (vec![], vec![]);
        let oa = apply(&sa, &mut ta);
        let ob = apply(&sb, &mut tb);
        let verdicts: Vec<Verdict> = sa
            .iter()
            .zip(oa.iter().zip(&ob))
            .map(|(s, (a, b))| compare_results(s, a, b, false))
            .collect();
        assert!(verdicts[0].is_pass(), "insert outcomes look alike");
        assert!(
            matches!(verdicts[1], Verdict::DigestMismatch { .. }),
            "the select exposes the divergence: {:?}",
            verdicts[1]
        );
    }
}
