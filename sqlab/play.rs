use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use tracing::{error, info, warn};

use sqlab_sqlgen::Stmt;

use crate::db::{Db, DbOpts};
use crate::round::{gen_round, RoundOpts, TestRound};
use crate::runner::{db_name, dual_execute, failure_report, first_table_divergence, tag_stmt};
use crate::compare::compare_results;
use crate::DiffError;

/// Generate-and-run without a store: rounds are produced in process, fired
/// at both sides, and discarded on pass. Failures leave a reproducer
/// script in `out_dir`.
#[derive(Debug, Clone)]
pub struct PlayOpts {
    pub grammar: String,
    pub dsn_a: String,
    pub dsn_b: String,
    pub tag_a: String,
    pub tag_b: String,
    pub rounds: usize,
    pub threads: usize,
    pub out_dir: PathBuf,
    pub db_opts: DbOpts,
    pub round: RoundOpts,
    pub check_exec: bool,
    /// Print generated rounds instead of executing them.
    pub dry_run: bool,
}

impl Default for PlayOpts {
    fn default() -> Self {
        PlayOpts {
            grammar: String::new(),
            dsn_a: String::new(),
            dsn_b: String::new(),
            tag_a: "a".to_string(),
            tag_b: "b".to_string(),
            rounds: 1,
            threads: 1,
            out_dir: PathBuf::from("."),
            db_opts: DbOpts::default(),
            round: RoundOpts::default(),
            check_exec: true,
            dry_run: false,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PlaySummary {
    pub rounds: usize,
    pub failures: usize,
}

/// Run `opts.rounds` rounds across `opts.threads` workers. Each round gets
/// its own seed derived from the base seed, so a failing round's script
/// header is enough to regenerate it.
pub fn play(opts: &PlayOpts) -> Result<PlaySummary, DiffError> {
    if opts.dry_run {
        return dry_run(opts);
    }
    fs::create_dir_all(&opts.out_dir)?;

    let stop = Arc::new(AtomicBool::new(false));
    let next = AtomicUsize::new(0);
    let done = AtomicUsize::new(0);
    let failures = AtomicUsize::new(0);

    thread::scope(|s| {
        for worker in 0..opts.threads.max(1) {
            let stop = stop.clone();
            let next = &next;
            let done = &done;
            let failures = &failures;
            s.spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    let n = next.fetch_add(1, Ordering::Relaxed);
                    if n >= opts.rounds {
                        break;
                    }
                    let seed = opts.round.seed.wrapping_add(n as u64);
                    match play_round(opts, seed) {
                        Ok(None) => {
                            done.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(Some(path)) => {
                            done.fetch_add(1, Ordering::Relaxed);
                            failures.fetch_add(1, Ordering::Relaxed);
                            error!(worker, seed, script = %path.display(), "round failed");
                            stop.store(true, Ordering::Relaxed);
                        }
                        Err(e) => {
                            error!(worker, seed, %e, "round errored");
                            stop.store(true, Ordering::Relaxed);
                        }
                    }
                }
            });
        }
    });

    Ok(PlaySummary {
        rounds: done.load(Ordering::Relaxed),
        failures: failures.load(Ordering::Relaxed),
    })
}

fn dry_run(opts: &PlayOpts) -> Result<PlaySummary, DiffError> {
    for n in 0..opts.rounds {
        let round = gen_round(&RoundOpts {
            grammar: opts.grammar.clone(),
            seed: opts.round.seed.wrapping_add(n as u64),
            ..opts.round.clone()
        })?;
        println!("-- round {} (seed {})", round.id, opts.round.seed.wrapping_add(n as u64));
        print!("{}", reproducer_script(&round));
    }
    Ok(PlaySummary {
        rounds: opts.rounds,
        failures: 0,
    })
}

/// One full round: generate, set up per-round databases on both sides,
/// replay with comparison, tear down. A divergence writes the reproducer
/// script and returns its path.
fn play_round(opts: &PlayOpts, seed: u64) -> Result<Option<PathBuf>, DiffError> {
    let round = gen_round(&RoundOpts {
        grammar: opts.grammar.clone(),
        seed,
        ..opts.round.clone()
    })?;
    info!(id = %round.id, seed, groups = round.tests.len(), "playing round");

    let mut db_a = Db::connect(&opts.dsn_a, &opts.tag_a, opts.db_opts.clone())?;
    let mut db_b = Db::connect(&opts.dsn_b, &opts.tag_b, opts.db_opts.clone())?;
    let name_a = db_name(&opts.tag_a, &round.id);
    let name_b = db_name(&opts.tag_b, &round.id);
    db_a.create_database(&name_a)?;
    db_a.use_database(&name_a)?;
    db_b.create_database(&name_b)?;
    db_b.use_database(&name_b)?;

    let failure = exec_round(&round, &mut db_a, &mut db_b, opts);

    match failure {
        None => {
            db_a.drop_database(&name_a)?;
            db_b.drop_database(&name_b)?;
            Ok(None)
        }
        Some(msg) => {
            // leave the databases behind for inspection
            db_a.rollback();
            db_b.rollback();
            let path = write_artifact(opts, &round, seed, &msg)?;
            Ok(Some(path))
        }
    }
}

fn exec_round(round: &TestRound, db_a: &mut Db, db_b: &mut Db, opts: &PlayOpts) -> Option<String> {
    for stmt in &round.init {
        let t = tag_stmt(stmt, &round.id);
        let (oa, ob) = dual_execute(db_a, db_b, &t);
        for (db, o) in [(&*db_a, &oa), (&*db_b, &ob)] {
            if let Err(e) = o {
                warn!(id = %round.id, tag = db.tag(), sql = %stmt.sql, %e, "init statement failed");
            }
        }
    }
    let mut seq = round.init.len();
    for group in &round.tests {
        for stmt in group {
            let t = tag_stmt(stmt, &round.id);
            let (oa, ob) = dual_execute(db_a, db_b, &t);
            if stmt.ignores_errors() && (oa.is_err() || ob.is_err()) {
                seq += 1;
                continue;
            }
            let verdict = compare_results(stmt, &oa, &ob, opts.check_exec);
            if !verdict.is_pass() {
                return Some(failure_report(stmt, seq, &verdict.describe(stmt), &oa, &ob));
            }
            seq += 1;
        }
        let da = match db_a.table_digests() {
            Ok(d) => d,
            Err(e) => return Some(format!("table check failed on side a: {e}")),
        };
        let db_ = match db_b.table_digests() {
            Ok(d) => d,
            Err(e) => return Some(format!("table check failed on side b: {e}")),
        };
        if let Some(msg) = first_table_divergence(&da, &db_) {
            return Some(msg);
        }
    }
    None
}

fn write_artifact(
    opts: &PlayOpts,
    round: &TestRound,
    seed: u64,
    report: &str,
) -> Result<PathBuf, DiffError> {
    let path = opts.out_dir.join(format!("{}.sql", round.id));
    let mut out = format!("-- round {} seed {seed}\n", round.id);
    for line in report.lines() {
        out.push_str("-- ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    out.push_str(&reproducer_script(round));
    fs::write(&path, out)?;
    Ok(path)
}

/// The round as a script a mysql client can replay verbatim. Prepared
/// statements are expanded into PREPARE/SET/EXECUTE so the server takes
/// the same code path it took during the run.
pub fn reproducer_script(round: &TestRound) -> String {
    let mut out = String::new();
    for (seq, _, stmt) in round.numbered() {
        out.push_str(&reproducer_stmt(stmt, seq));
    }
    out
}

fn reproducer_stmt(stmt: &Stmt, n: usize) -> String {
    if !stmt.is_prepared() {
        return format!("{};\n", stmt.sql);
    }
    let quoted = stmt.sql.replace('\'', "''");
    let mut out = format!("PREPARE s{n} FROM '{quoted}';\n");
    let mut names = Vec::with_capacity(stmt.params.len());
    for (i, p) in stmt.params.iter().enumerate() {
        out.push_str(&format!("SET @p{i} = {p};\n"));
        names.push(format!("@p{i}"));
    }
    out.push_str(&format!("EXECUTE s{n} USING {};\n", names.join(", ")));
    out.push_str(&format!("DEALLOCATE PREPARE s{n};\n"));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlab_sqlgen::{Param, STMT_PREPARED};

    #[test]
    fn plain_statements_dump_as_is() {
        let round = TestRound {
            id: "r".into(),
            init: vec![Stmt::seal("CREATE TABLE t ( a INT )".into(), 0, vec![])],
            tests: vec![vec![Stmt::seal("SELECT a FROM t".into(), 0, vec![])]],
        };
        let script = reproducer_script(&round);
        assert_eq!(script, "CREATE TABLE t ( a INT );\nSELECT a FROM t;\n");
    }

    #[test]
    fn prepared_statements_expand_to_prepare_execute() {
        let stmt = Stmt::seal(
            "SELECT * FROM t WHERE a = ? AND b = ?".into(),
            STMT_PREPARED,
            vec![Param::Int(5), Param::Str("it's".into())],
        );
        let script = reproducer_stmt(&stmt, 3);
        assert!(script.contains("PREPARE s3 FROM 'SELECT * FROM t WHERE a = ? AND b = ?';"));
        assert!(script.contains("SET @p0 = 5;"));
        assert!(script.contains("SET @p1 = 'it''s';"));
        assert!(script.contains("EXECUTE s3 USING @p0, @p1;"));
        assert!(script.contains("DEALLOCATE PREPARE s3;"));
    }

    #[test]
    fn artifacts_carry_header_report_and_script() {
        let dir = tempfile::tempdir().unwrap();
        let opts = PlayOpts {
            out_dir: dir.path().to_path_buf(),
            ..PlayOpts::default()
        };
        let round = TestRound {
            id: "r-1".into(),
            init: vec![],
            tests: vec![vec![Stmt::seal("SELECT 1".into(), 0, vec![])]],
        };
        let path = write_artifact(&opts, &round, 42, "digest mismatch\non statement #0").unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("-- round r-1 seed 42\n"));
        assert!(text.contains("-- digest mismatch\n"));
        assert!(text.contains("-- on statement #0\n"));
        assert!(text.contains("SELECT 1;\n"));
    }

    #[test]
    fn quotes_inside_prepared_sql_are_doubled() {
        let stmt = Stmt::seal(
            "SELECT 'x' FROM t WHERE a = ?".into(),
            STMT_PREPARED,
            vec![Param::Null],
        );
        let script = reproducer_stmt(&stmt, 0);
        assert!(script.contains("FROM 'SELECT ''x'' FROM t WHERE a = ?';"));
        assert!(script.contains("SET @p0 = NULL;"));
    }
}
