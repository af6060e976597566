use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{error, info, warn};

use sqlab_sqlgen::Stmt;

use crate::compare::compare_results;
use crate::db::{Db, DbOpts};
use crate::resultset::Outcome;
use crate::round::TestRound;
use crate::store::{Store, TestStatus};
use crate::DiffError;

#[derive(Debug, Clone)]
pub struct RunnerOpts {
    pub dsn_a: String,
    pub dsn_b: String,
    pub tag_a: String,
    pub tag_b: String,
    pub threads: usize,
    pub db_opts: DbOpts,
    /// Stop claiming after this many tests across all workers.
    pub max_tests: Option<usize>,
    pub check_exec: bool,
    /// First failure stops the whole fleet from claiming further tests.
    pub stop_on_failure: bool,
    /// Replay groups as interleaved sessions instead of sequentially.
    pub multi_session: bool,
}

impl Default for RunnerOpts {
    fn default() -> Self {
        RunnerOpts {
            dsn_a: String::new(),
            dsn_b: String::new(),
            tag_a: "a".to_string(),
            tag_b: "b".to_string(),
            threads: 1,
            db_opts: DbOpts::default(),
            max_tests: None,
            check_exec: false,
            stop_on_failure: true,
            multi_session: false,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RunSummary {
    pub passed: usize,
    pub failed: usize,
}

pub type SharedStore = Arc<Mutex<dyn Store>>;

fn lock_store(store: &SharedStore) -> std::sync::MutexGuard<'_, dyn Store + 'static> {
    store.lock().unwrap_or_else(|e| e.into_inner())
}

/// Claim-and-run loop: `threads` workers pull pending tests from the store
/// until it runs dry, a cap is hit, or a failure raises the stop signal.
/// The signal is a set-once flag, so concurrent failures cannot trip over
/// each other.
pub fn run(store: SharedStore, opts: &RunnerOpts) -> RunSummary {
    let stop = Arc::new(AtomicBool::new(false));
    let claimed = AtomicUsize::new(0);
    let passed = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);

    thread::scope(|s| {
        for worker in 0..opts.threads.max(1) {
            let store = store.clone();
            let stop = stop.clone();
            let claimed = &claimed;
            let passed = &passed;
            let failed = &failed;
            s.spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    if let Some(cap) = opts.max_tests {
                        if claimed.fetch_add(1, Ordering::Relaxed) >= cap {
                            break;
                        }
                    }
                    let test = match lock_store(&store).next_pending_test() {
                        Ok(Some(test)) => test,
                        Ok(None) => break,
                        Err(e) => {
                            error!(worker, %e, "claim failed");
                            break;
                        }
                    };
                    info!(worker, id = %test.id, "claimed test");
                    match run_one(&test, opts, &store) {
                        Ok(None) => {
                            passed.fetch_add(1, Ordering::Relaxed);
                            set_status(&store, &test.id, TestStatus::Passed, "");
                        }
                        Ok(Some(msg)) => {
                            failed.fetch_add(1, Ordering::Relaxed);
                            error!(worker, id = %test.id, %msg, "test failed");
                            set_status(&store, &test.id, TestStatus::Failed, &msg);
                            if opts.stop_on_failure {
                                stop.store(true, Ordering::Relaxed);
                            }
                        }
                        Err(e) => {
                            error!(worker, id = %test.id, %e, "test errored");
                            set_status(&store, &test.id, TestStatus::Unknown, &e.to_string());
                        }
                    }
                }
            });
        }
    });

    RunSummary {
        passed: passed.load(Ordering::Relaxed),
        failed: failed.load(Ordering::Relaxed),
    }
}

fn set_status(store: &SharedStore, id: &str, status: TestStatus, msg: &str) {
    if let Err(e) = lock_store(store).set_test(id, status, msg) {
        error!(id, %e, "could not record test status");
    }
}

/// Fire the statement at both sides at once and wait for both, so one
/// stalled side costs the slower side's latency, not the sum. Each side's
/// result comes back through its own join; nothing is shared between the
/// two executions.
pub fn dual_execute(a: &mut Db, b: &mut Db, stmt: &Stmt) -> (Outcome, Outcome) {
    thread::scope(|s| {
        let ha = s.spawn(|| a.exec_stmt(stmt));
        let ob = b.exec_stmt(stmt);
        let oa = match ha.join() {
            Ok(o) => o,
            Err(_) => Err("side worker panicked mid-statement".to_string()),
        };
        (oa, ob)
    })
}

/// Correlation tag prefixed to every executed statement so server-side
/// logs can be matched back to a round.
pub fn tag_stmt(stmt: &Stmt, round_id: &str) -> Stmt {
    let mut s = stmt.clone();
    s.sql = format!("/* sqlab:{round_id} */ {}", s.sql);
    s
}

pub fn db_name(tag: &str, round_id: &str) -> String {
    let clean: String = round_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{tag}__{clean}")
}

/// First table whose content digest differs between the two sides.
pub fn first_table_divergence(
    a: &[(String, String)],
    b: &[(String, String)],
) -> Option<String> {
    if a.len() != b.len() {
        return Some(format!(
            "table count differs: {} vs {} tables",
            a.len(),
            b.len()
        ));
    }
    for ((ta, da), (tb, db)) in a.iter().zip(b) {
        if ta != tb {
            return Some(format!("table set differs: `{ta}` vs `{tb}`"));
        }
        if da != db {
            return Some(format!("table `{ta}` content diverged: {da} vs {db}"));
        }
    }
    None
}

/// Execute one claimed test. `Ok(None)` is a pass; `Ok(Some(msg))` is a
/// divergence with its report; `Err` is infrastructure trouble.
fn run_one(
    test: &TestRound,
    opts: &RunnerOpts,
    store: &SharedStore,
) -> Result<Option<String>, DiffError> {
    let mut db_a = Db::connect(&opts.dsn_a, &opts.tag_a, opts.db_opts.clone())?;
    let mut db_b = Db::connect(&opts.dsn_b, &opts.tag_b, opts.db_opts.clone())?;

    let name_a = db_name(&opts.tag_a, &test.id);
    let name_b = db_name(&opts.tag_b, &test.id);
    db_a.create_database(&name_a)?;
    db_a.use_database(&name_a)?;
    db_b.create_database(&name_b)?;
    db_b.use_database(&name_b)?;

    // init failures are tolerated: the schema grammar may generate
    // statements one target rejects, and the comparison below still holds
    // as long as both sides saw the same init sequence
    for stmt in &test.init {
        let t = tag_stmt(stmt, &test.id);
        for db in [&mut db_a, &mut db_b] {
            if let Err(e) = db.exec_stmt(&t) {
                warn!(id = %test.id, tag = db.tag(), sql = %stmt.sql, %e, "init statement failed");
            }
        }
    }

    let outcome = if opts.multi_session {
        crate::sessions::run_sessions(test, &mut db_a, &mut db_b, opts, store)?
    } else {
        run_sequential(test, &mut db_a, &mut db_b, opts, store)?
    };

    if let Some(msg) = outcome {
        db_a.rollback();
        db_b.rollback();
        return Ok(Some(msg));
    }

    db_a.drop_database(&name_a)?;
    db_b.drop_database(&name_b)?;
    Ok(None)
}

fn run_sequential(
    test: &TestRound,
    db_a: &mut Db,
    db_b: &mut Db,
    opts: &RunnerOpts,
    store: &SharedStore,
) -> Result<Option<String>, DiffError> {
    let mut seq = test.init.len();
    for group in &test.tests {
        for stmt in group {
            let t = tag_stmt(stmt, &test.id);
            let (oa, ob) = dual_execute(db_a, db_b, &t);
            {
                let mut st = lock_store(store);
                st.put_stmt_result(&test.id, seq, db_a.tag(), &oa)?;
                st.put_stmt_result(&test.id, seq, db_b.tag(), &ob)?;
            }
            // errors on an ignore-errors statement are expected and end
            // the inspection of that statement on either side
            if stmt.ignores_errors() && (oa.is_err() || ob.is_err()) {
                seq += 1;
                continue;
            }
            let verdict = compare_results(stmt, &oa, &ob, opts.check_exec);
            if !verdict.is_pass() {
                return Ok(Some(failure_report(
                    stmt,
                    seq,
                    &verdict.describe(stmt),
                    &oa,
                    &ob,
                )));
            }
            seq += 1;
        }
        let da = db_a.table_digests()?;
        let db_ = db_b.table_digests()?;
        if let Some(msg) = first_table_divergence(&da, &db_) {
            return Ok(Some(msg));
        }
    }
    Ok(None)
}

/// Failure message with both sides' raw results attached for diagnosis.
pub fn failure_report(
    stmt: &Stmt,
    seq: usize,
    verdict: &str,
    oa: &Outcome,
    ob: &Outcome,
) -> String {
    let side = |o: &Outcome| match o {
        Ok(rs) => rs.dump(),
        Err(e) => format!("error: {e}\n"),
    };
    format!(
        "statement #{seq} `{}`: {verdict}\n-- side a\n{}-- side b\n{}",
        stmt,
        side(oa),
        side(ob),
    )
}
