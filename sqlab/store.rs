use std::fmt;

use mysql::prelude::Queryable;
use mysql::{Opts, Pool, TxOpts};
use tracing::debug;

use sqlab_sqlgen::{Param, Stmt};

use crate::resultset::Outcome;
use crate::round::TestRound;
use crate::DiffError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestStatus {
    Pending,
    Running,
    Failed,
    Passed,
    Unknown,
}

impl TestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestStatus::Pending => "pending",
            TestStatus::Running => "running",
            TestStatus::Failed => "failed",
            TestStatus::Passed => "passed",
            TestStatus::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> TestStatus {
        match s {
            "pending" => TestStatus::Pending,
            "running" => TestStatus::Running,
            "failed" => TestStatus::Failed,
            "passed" => TestStatus::Passed,
            _ => TestStatus::Unknown,
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One archived per-statement outcome, as stored.
#[derive(Debug, Clone)]
pub struct StmtResultRow {
    pub seq: usize,
    pub tag: String,
    pub payload: String,
    pub is_error: bool,
}

/// Test queue and archive. Implementations must make `next_pending_test`
/// an atomic claim: no two workers may receive the same test.
pub trait Store: Send {
    fn load_inits(&mut self) -> Result<Vec<Stmt>, DiffError>;
    fn put_inits(&mut self, stmts: &[Stmt]) -> Result<(), DiffError>;
    fn add_test(&mut self, round: &TestRound) -> Result<(), DiffError>;
    fn next_pending_test(&mut self) -> Result<Option<TestRound>, DiffError>;
    fn set_test(&mut self, id: &str, status: TestStatus, message: &str) -> Result<(), DiffError>;
    fn put_stmt_result(
        &mut self,
        id: &str,
        seq: usize,
        tag: &str,
        outcome: &Outcome,
    ) -> Result<(), DiffError>;
    fn load_test(&mut self, id: &str) -> Result<(TestRound, TestStatus, String), DiffError>;
    fn load_results(&mut self, id: &str) -> Result<Vec<StmtResultRow>, DiffError>;
}

fn encode_outcome(outcome: &Outcome) -> Result<(String, bool), DiffError> {
    match outcome {
        Ok(rs) => Ok((rs.encode()?, false)),
        Err(e) => Ok((e.clone(), true)),
    }
}

/// Init statements use this group marker in the stmt table.
const INIT_GROUP: i64 = -1;

fn encode_params(stmt: &Stmt) -> Result<String, DiffError> {
    Ok(serde_json::to_string(&stmt.params)?)
}

fn decode_stmt(sql: String, flags: u32, params: String) -> Result<Stmt, DiffError> {
    let params: Vec<Param> = serde_json::from_str(&params)?;
    Ok(Stmt { sql, flags, params })
}

/// MySQL-backed store, shared by `gen` producers and `run` workers.
pub struct MysqlStore {
    pool: Pool,
}

impl MysqlStore {
    pub fn connect(dsn: &str) -> Result<Self, DiffError> {
        let opts = Opts::from_url(dsn).map_err(mysql::Error::from)?;
        Ok(MysqlStore {
            pool: Pool::new(opts)?,
        })
    }

    /// Create the schema. Idempotent.
    pub fn init_schema(&self) -> Result<(), DiffError> {
        let mut conn = self.pool.get_conn()?;
        for ddl in [
            "CREATE TABLE IF NOT EXISTS test (
                id VARCHAR(64) PRIMARY KEY,
                status VARCHAR(16) NOT NULL,
                message TEXT,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP)",
            "CREATE TABLE IF NOT EXISTS stmt (
                test_id VARCHAR(64) NOT NULL,
                seq INT NOT NULL,
                grp BIGINT NOT NULL,
                sql_text TEXT NOT NULL,
                flags INT UNSIGNED NOT NULL,
                params TEXT NOT NULL,
                PRIMARY KEY (test_id, seq))",
            "CREATE TABLE IF NOT EXISTS stmt_result (
                test_id VARCHAR(64) NOT NULL,
                seq INT NOT NULL,
                tag VARCHAR(16) NOT NULL,
                payload MEDIUMTEXT NOT NULL,
                is_error BOOL NOT NULL,
                PRIMARY KEY (test_id, seq, tag))",
            "CREATE TABLE IF NOT EXISTS init (
                seq INT PRIMARY KEY,
                sql_text TEXT NOT NULL,
                flags INT UNSIGNED NOT NULL,
                params TEXT NOT NULL)",
        ] {
            conn.query_drop(ddl)?;
        }
        Ok(())
    }

    /// Drop everything, including archived results.
    pub fn clear_schema(&self) -> Result<(), DiffError> {
        let mut conn = self.pool.get_conn()?;
        for table in ["stmt_result", "stmt", "test", "init"] {
            conn.query_drop(format!("DROP TABLE IF EXISTS {table}"))?;
        }
        Ok(())
    }

    fn load_stmts(
        conn: &mut impl Queryable,
        id: &str,
    ) -> Result<(Vec<Stmt>, Vec<Vec<Stmt>>), DiffError> {
        let rows: Vec<(i64, String, u32, String)> = conn.exec(
            "SELECT grp, sql_text, flags, params FROM stmt WHERE test_id = ? ORDER BY seq",
            (id,),
        )?;
        let mut init = Vec::new();
        let mut groups: Vec<Vec<Stmt>> = Vec::new();
        for (grp, sql, flags, params) in rows {
            let stmt = decode_stmt(sql, flags, params)?;
            if grp == INIT_GROUP {
                init.push(stmt);
            } else {
                let g = grp as usize;
                while groups.len() <= g {
                    groups.push(Vec::new());
                }
                groups[g].push(stmt);
            }
        }
        Ok((init, groups))
    }
}

impl Store for MysqlStore {
    fn load_inits(&mut self) -> Result<Vec<Stmt>, DiffError> {
        let mut conn = self.pool.get_conn()?;
        let rows: Vec<(String, u32, String)> =
            conn.query("SELECT sql_text, flags, params FROM init ORDER BY seq")?;
        rows.into_iter()
            .map(|(sql, flags, params)| decode_stmt(sql, flags, params))
            .collect()
    }

    fn put_inits(&mut self, stmts: &[Stmt]) -> Result<(), DiffError> {
        let mut conn = self.pool.get_conn()?;
        conn.query_drop("DELETE FROM init")?;
        for (seq, stmt) in stmts.iter().enumerate() {
            conn.exec_drop(
                "INSERT INTO init (seq, sql_text, flags, params) VALUES (?, ?, ?, ?)",
                (seq as i64, &stmt.sql, stmt.flags, encode_params(stmt)?),
            )?;
        }
        Ok(())
    }

    fn add_test(&mut self, round: &TestRound) -> Result<(), DiffError> {
        let mut conn = self.pool.get_conn()?;
        let mut tx = conn.start_transaction(TxOpts::default())?;
        tx.exec_drop(
            "INSERT INTO test (id, status, message) VALUES (?, ?, '')",
            (&round.id, TestStatus::Pending.as_str()),
        )?;
        for (seq, grp, stmt) in round.numbered() {
            let grp = if grp == usize::MAX {
                INIT_GROUP
            } else {
                grp as i64
            };
            tx.exec_drop(
                "INSERT INTO stmt (test_id, seq, grp, sql_text, flags, params) \
                 VALUES (?, ?, ?, ?, ?, ?)",
                (
                    &round.id,
                    seq as i64,
                    grp,
                    &stmt.sql,
                    stmt.flags,
                    encode_params(stmt)?,
                ),
            )?;
        }
        tx.commit()?;
        debug!(id = %round.id, "test queued");
        Ok(())
    }

    fn next_pending_test(&mut self) -> Result<Option<TestRound>, DiffError> {
        let mut conn = self.pool.get_conn()?;
        let mut tx = conn.start_transaction(TxOpts::default())?;
        let id: Option<String> = tx.exec_first(
            "SELECT id FROM test WHERE status = ? ORDER BY created_at LIMIT 1 FOR UPDATE",
            (TestStatus::Pending.as_str(),),
        )?;
        let id = match id {
            Some(id) => id,
            None => {
                tx.rollback()?;
                return Ok(None);
            }
        };
        tx.exec_drop(
            "UPDATE test SET status = ? WHERE id = ?",
            (TestStatus::Running.as_str(), &id),
        )?;
        let (init, tests) = Self::load_stmts(&mut tx, &id)?;
        tx.commit()?;
        Ok(Some(TestRound { id, init, tests }))
    }

    fn set_test(&mut self, id: &str, status: TestStatus, message: &str) -> Result<(), DiffError> {
        let mut conn = self.pool.get_conn()?;
        conn.exec_drop(
            "UPDATE test SET status = ?, message = ? WHERE id = ?",
            (status.as_str(), message, id),
        )?;
        Ok(())
    }

    fn put_stmt_result(
        &mut self,
        id: &str,
        seq: usize,
        tag: &str,
        outcome: &Outcome,
    ) -> Result<(), DiffError> {
        let (payload, is_error) = encode_outcome(outcome)?;
        let mut conn = self.pool.get_conn()?;
        conn.exec_drop(
            "REPLACE INTO stmt_result (test_id, seq, tag, payload, is_error) \
             VALUES (?, ?, ?, ?, ?)",
            (id, seq as i64, tag, payload, is_error),
        )?;
        Ok(())
    }

    fn load_test(&mut self, id: &str) -> Result<(TestRound, TestStatus, String), DiffError> {
        let mut conn = self.pool.get_conn()?;
        let head: Option<(String, Option<String>)> =
            conn.exec_first("SELECT status, message FROM test WHERE id = ?", (id,))?;
        let (status, message) = head.ok_or_else(|| DiffError::TestNotFound(id.to_string()))?;
        let (init, tests) = Self::load_stmts(&mut conn, id)?;
        Ok((
            TestRound {
                id: id.to_string(),
                init,
                tests,
            },
            TestStatus::parse(&status),
            message.unwrap_or_default(),
        ))
    }

    fn load_results(&mut self, id: &str) -> Result<Vec<StmtResultRow>, DiffError> {
        let mut conn = self.pool.get_conn()?;
        let rows: Vec<(i64, String, String, bool)> = conn.exec(
            "SELECT seq, tag, payload, is_error FROM stmt_result \
             WHERE test_id = ? ORDER BY seq, tag",
            (id,),
        )?;
        Ok(rows
            .into_iter()
            .map(|(seq, tag, payload, is_error)| StmtResultRow {
                seq: seq as usize,
                tag,
                payload,
                is_error,
            })
            .collect())
    }
}

/// In-memory store for unit tests and dry runs.
#[derive(Default)]
pub struct MemStore {
    inits: Vec<Stmt>,
    tests: Vec<(TestRound, TestStatus, String)>,
    results: Vec<(String, StmtResultRow)>,
}

impl Store for MemStore {
    fn load_inits(&mut self) -> Result<Vec<Stmt>, DiffError> {
        Ok(self.inits.clone())
    }

    fn put_inits(&mut self, stmts: &[Stmt]) -> Result<(), DiffError> {
        self.inits = stmts.to_vec();
        Ok(())
    }

    fn add_test(&mut self, round: &TestRound) -> Result<(), DiffError> {
        self.tests
            .push((round.clone(), TestStatus::Pending, String::new()));
        Ok(())
    }

    fn next_pending_test(&mut self) -> Result<Option<TestRound>, DiffError> {
        for (round, status, _) in &mut self.tests {
            if *status == TestStatus::Pending {
                *status = TestStatus::Running;
                return Ok(Some(round.clone()));
            }
        }
        Ok(None)
    }

    fn set_test(&mut self, id: &str, status: TestStatus, message: &str) -> Result<(), DiffError> {
        for (round, st, msg) in &mut self.tests {
            if round.id == id {
                *st = status;
                *msg = message.to_string();
                return Ok(());
            }
        }
        Err(DiffError::TestNotFound(id.to_string()))
    }

    fn put_stmt_result(
        &mut self,
        id: &str,
        seq: usize,
        tag: &str,
        outcome: &Outcome,
    ) -> Result<(), DiffError> {
        let (payload, is_error) = encode_outcome(outcome)?;
        self.results.push((
            id.to_string(),
            StmtResultRow {
                seq,
                tag: tag.to_string(),
                payload,
                is_error,
            },
        ));
        Ok(())
    }

    fn load_test(&mut self, id: &str) -> Result<(TestRound, TestStatus, String), DiffError> {
        self.tests
            .iter()
            .find(|(round, _, _)| round.id == id)
            .map(|(round, status, msg)| (round.clone(), *status, msg.clone()))
            .ok_or_else(|| DiffError::TestNotFound(id.to_string()))
    }

    fn load_results(&mut self, id: &str) -> Result<Vec<StmtResultRow>, DiffError> {
        Ok(self
            .results
            .iter()
            .filter(|(tid, _)| tid == id)
            .map(|(_, row)| row.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resultset::ResultSet;

    fn round(id: &str) -> TestRound {
        TestRound {
            id: id.to_string(),
            init: vec![Stmt::seal("CREATE TABLE t (a int)".into(), 0, vec![])],
            tests: vec![vec![Stmt::seal("SELECT a FROM t".into(), 0, vec![])]],
        }
    }

    #[test]
    fn mem_store_claims_each_test_once() {
        let mut s = MemStore::default();
        s.add_test(&round("t1")).unwrap();
        s.add_test(&round("t2")).unwrap();
        let first = s.next_pending_test().unwrap().unwrap();
        let second = s.next_pending_test().unwrap().unwrap();
        assert_ne!(first.id, second.id);
        assert!(s.next_pending_test().unwrap().is_none());
    }

    #[test]
    fn mem_store_status_and_results_roundtrip() {
        let mut s = MemStore::default();
        s.add_test(&round("t1")).unwrap();
        s.set_test("t1", TestStatus::Failed, "digest mismatch").unwrap();
        s.put_stmt_result("t1", 0, "a", &Ok(ResultSet::from_exec(1, 0)))
            .unwrap();
        s.put_stmt_result("t1", 0, "b", &Err("boom".to_string()))
            .unwrap();
        let (_, status, msg) = s.load_test("t1").unwrap();
        assert_eq!(status, TestStatus::Failed);
        assert_eq!(msg, "digest mismatch");
        let results = s.load_results("t1").unwrap();
        assert_eq!(results.len(), 2);
        assert!(!results[0].is_error);
        assert!(results[1].is_error);
        assert_eq!(results[1].payload, "boom");
        assert!(matches!(
            s.set_test("nope", TestStatus::Passed, ""),
            Err(DiffError::TestNotFound(_))
        ));
    }

    #[test]
    fn inits_roundtrip() {
        let mut s = MemStore::default();
        assert!(s.load_inits().unwrap().is_empty());
        s.put_inits(&[Stmt::seal("CREATE TABLE t (a int)".into(), 0, vec![])])
            .unwrap();
        assert_eq!(s.load_inits().unwrap().len(), 1);
    }

    #[test]
    fn status_string_roundtrip() {
        for st in [
            TestStatus::Pending,
            TestStatus::Running,
            TestStatus::Failed,
            TestStatus::Passed,
            TestStatus::Unknown,
        ] {
            assert_eq!(TestStatus::parse(st.as_str()), st);
        }
        assert_eq!(TestStatus::parse("garbage"), TestStatus::Unknown);
    }
}
