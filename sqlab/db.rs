use std::thread;
use std::time::{Duration, Instant};

use mysql::prelude::Queryable;
use mysql::{Conn, Opts, OptsBuilder, Params, Row, Value};
use tracing::{debug, warn};

use sqlab_sqlgen::{Param, Stmt};

use crate::resultset::{ColumnDef, Outcome, ResultSet};
use crate::DiffError;

const CONNECT_ATTEMPTS: usize = 10;
const CONNECT_BACKOFF: Duration = Duration::from_secs(3);

/// Connection tuning shared by both sides of a run.
#[derive(Debug, Clone)]
pub struct DbOpts {
    /// Per-statement deadline, enforced through the socket read/write
    /// timeouts. A timed-out statement fails, it is never retried.
    pub query_timeout: Duration,
    /// A statement slower than this that then fails gets the lock
    /// diagnostics appended to its error.
    pub lock_threshold: Duration,
}

impl Default for DbOpts {
    fn default() -> Self {
        DbOpts {
            query_timeout: Duration::from_secs(30),
            lock_threshold: Duration::from_secs(10),
        }
    }
}

/// One side of a differential run: a tagged connection plus execution
/// policy.
pub struct Db {
    conn: Conn,
    tag: String,
    opts: DbOpts,
}

impl Db {
    /// Connect with a bounded ping-retry loop; transient failures while the
    /// target warms up are expected in fleet runs.
    pub fn connect(dsn: &str, tag: &str, opts: DbOpts) -> Result<Db, DiffError> {
        let base = Opts::from_url(dsn).map_err(mysql::Error::from)?;
        let built: Opts = OptsBuilder::from_opts(base)
            .read_timeout(Some(opts.query_timeout))
            .write_timeout(Some(opts.query_timeout))
            .into();
        let mut last_err: Option<mysql::Error> = None;
        for attempt in 0..CONNECT_ATTEMPTS {
            match Conn::new(built.clone()) {
                Ok(mut conn) => match conn.ping() {
                    Ok(()) => {
                        debug!(tag, attempt, "connected");
                        return Ok(Db {
                            conn,
                            tag: tag.to_string(),
                            opts,
                        });
                    }
                    Err(e) => last_err = Some(e),
                },
                Err(e) => last_err = Some(e),
            }
            warn!(tag, attempt, "connect failed, retrying");
            thread::sleep(CONNECT_BACKOFF);
        }
        match last_err {
            Some(e) => Err(DiffError::Db(e)),
            None => Err(DiffError::Connect {
                tag: tag.to_string(),
                attempts: CONNECT_ATTEMPTS,
            }),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Run one generated statement, query- or exec-shaped per its flag.
    /// Errors come back as text with lock diagnostics attached when they
    /// look lock-related or the statement overstayed the threshold.
    pub fn exec_stmt(&mut self, stmt: &Stmt) -> Outcome {
        let started = Instant::now();
        let res = self.exec_stmt_raw(stmt);
        match res {
            Ok(rs) => Ok(rs),
            Err(e) => Err(self.describe_error(e, started.elapsed())),
        }
    }

    fn exec_stmt_raw(&mut self, stmt: &Stmt) -> Result<ResultSet, mysql::Error> {
        if stmt.is_query() {
            let rows: Vec<Row> = if stmt.is_prepared() {
                self.conn.exec(&stmt.sql, params_of(stmt))?
            } else {
                self.conn.query(&stmt.sql)?
            };
            Ok(resultset_from_rows(rows))
        } else {
            if stmt.is_prepared() {
                self.conn.exec_drop(&stmt.sql, params_of(stmt))?;
            } else {
                self.conn.query_drop(&stmt.sql)?;
            }
            Ok(ResultSet::from_exec(
                self.conn.affected_rows(),
                self.conn.last_insert_id(),
            ))
        }
    }

    fn describe_error(&mut self, e: mysql::Error, elapsed: Duration) -> String {
        let msg = e.to_string();
        let lockish = msg.to_ascii_lowercase().contains("lock");
        if lockish || elapsed >= self.opts.lock_threshold {
            if let Some(dump) = self.lock_dump() {
                return format!("{msg}\n{dump}");
            }
        }
        msg
    }

    /// Snapshot the server's deadlock and lock-wait views. Best effort:
    /// targets without these views just yield nothing.
    pub fn lock_dump(&mut self) -> Option<String> {
        let mut out = String::new();
        for (title, sql) in [
            ("deadlocks", "SELECT * FROM information_schema.deadlocks"),
            (
                "lock waits",
                "SELECT * FROM information_schema.data_lock_waits",
            ),
        ] {
            match self.conn.query::<Row, _>(sql) {
                Ok(rows) if !rows.is_empty() => {
                    let rs = resultset_from_rows(rows);
                    out.push_str(&format!("-- {title}\n{}", rs.dump()));
                }
                Ok(_) => {}
                Err(e) => debug!(tag = %self.tag, %e, "lock diagnostics unavailable"),
            }
        }
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }

    pub fn create_database(&mut self, name: &str) -> Result<(), DiffError> {
        self.conn
            .query_drop(format!("CREATE DATABASE IF NOT EXISTS `{name}`"))?;
        Ok(())
    }

    pub fn drop_database(&mut self, name: &str) -> Result<(), DiffError> {
        self.conn
            .query_drop(format!("DROP DATABASE IF EXISTS `{name}`"))?;
        Ok(())
    }

    pub fn use_database(&mut self, name: &str) -> Result<(), DiffError> {
        self.conn.query_drop(format!("USE `{name}`"))?;
        Ok(())
    }

    /// Best-effort rollback after a failed test. Nothing to roll back is
    /// not an error.
    pub fn rollback(&mut self) {
        if let Err(e) = self.conn.query_drop("ROLLBACK") {
            debug!(tag = %self.tag, %e, "rollback failed");
        }
    }

    pub fn table_names(&mut self) -> Result<Vec<String>, DiffError> {
        let names: Vec<String> = self.conn.query(
            "SELECT table_name FROM information_schema.tables \
             WHERE table_schema = DATABASE() ORDER BY table_name",
        )?;
        Ok(names)
    }

    /// Unordered content digest per table in the current database, JSON
    /// columns excluded. The integrity-check statement is best effort and
    /// skipped on targets that reject it.
    pub fn table_digests(&mut self) -> Result<Vec<(String, String)>, DiffError> {
        let mut out = Vec::new();
        for table in self.table_names()? {
            if let Err(e) = self.conn.query_drop(format!("CHECK TABLE `{table}`")) {
                debug!(tag = %self.tag, table, %e, "integrity check unsupported");
            }
            let rows: Vec<Row> = self.conn.query(format!("SELECT * FROM `{table}`"))?;
            let rs = resultset_from_rows(rows);
            let digest =
                crate::digest::unordered_digest(&rs, Some(&|c: &ColumnDef| c.type_name != "JSON"));
            out.push((table, digest));
        }
        Ok(out)
    }
}

/// Positional parameter list for the prepared path.
fn params_of(stmt: &Stmt) -> Params {
    if stmt.params.is_empty() {
        return Params::Empty;
    }
    Params::Positional(stmt.params.iter().map(param_to_value).collect())
}

fn param_to_value(p: &Param) -> Value {
    match p {
        Param::Null => Value::NULL,
        Param::Int(v) => Value::Int(*v),
        Param::Float(v) => Value::Double(*v),
        Param::Str(v) => Value::Bytes(v.clone().into_bytes()),
    }
}

/// Materialize driver rows into the archival shape. Cell canonical form is
/// the server's raw bytes for byte-typed values and the SQL literal
/// rendering for everything else.
pub fn resultset_from_rows(rows: Vec<Row>) -> ResultSet {
    let cols: Vec<ColumnDef> = rows
        .first()
        .map(|row| {
            row.columns_ref()
                .iter()
                .map(|c| {
                    ColumnDef::new(
                        c.name_str().into_owned(),
                        format!("{:?}", c.column_type())
                            .trim_start_matches("MYSQL_TYPE_")
                            .to_string(),
                    )
                })
                .collect()
        })
        .unwrap_or_default();
    let data = rows
        .into_iter()
        .map(|row| row.unwrap().into_iter().map(cell_bytes).collect())
        .collect();
    ResultSet {
        cols,
        rows: data,
        exec: None,
    }
}

fn cell_bytes(v: Value) -> Option<Vec<u8>> {
    match v {
        Value::NULL => None,
        Value::Bytes(b) => Some(b),
        other => Some(other.as_sql(true).into_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_convert_to_driver_values() {
        let stmt = Stmt::seal(
            "SELECT ?, ?, ?, ?".into(),
            0,
            vec![
                Param::Null,
                Param::Int(-3),
                Param::Float(1.5),
                Param::Str("x".into()),
            ],
        );
        match params_of(&stmt) {
            Params::Positional(vals) => {
                assert_eq!(vals.len(), 4);
                assert_eq!(vals[0], Value::NULL);
                assert_eq!(vals[1], Value::Int(-3));
                assert_eq!(vals[2], Value::Double(1.5));
                assert_eq!(vals[3], Value::Bytes(b"x".to_vec()));
            }
            other => panic!("expected positional params, got {other:?}"),
        }
    }

    #[test]
    fn no_params_means_empty() {
        let stmt = Stmt::seal("SELECT 1".into(), 0, vec![]);
        assert!(matches!(params_of(&stmt), Params::Empty));
    }

    #[test]
    fn cell_bytes_canonical_forms() {
        assert_eq!(cell_bytes(Value::NULL), None);
        assert_eq!(cell_bytes(Value::Bytes(b"ab".to_vec())), Some(b"ab".to_vec()));
        assert_eq!(cell_bytes(Value::Int(42)), Some(b"42".to_vec()));
    }
}
