use std::collections::VecDeque;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info};

use sqlab_sqlgen::Stmt;

use crate::compare::compare_results;
use crate::db::Db;
use crate::resultset::Outcome;
use crate::round::TestRound;
use crate::runner::{db_name, failure_report, first_table_divergence, tag_stmt, RunnerOpts, SharedStore};
use crate::DiffError;

/// How long one probe waits for an in-flight statement before the session
/// counts as blocked.
const PROBE: Duration = Duration::from_millis(200);
/// Consecutive fruitless probes across all sessions before the schedule is
/// declared wedged.
const MAX_STALLS_PER_SESSION: usize = 150;

/// One statement as side A completed it, in global completion order.
struct Played {
    group: usize,
    idx: usize,
    stmt: Stmt,
    outcome: Outcome,
}

/// Side A session: a dedicated connection on its own thread, fed one
/// statement at a time. The channel pair is the only link; the scheduler
/// never touches the connection.
struct Session {
    group: usize,
    tx: mpsc::Sender<Stmt>,
    rx: mpsc::Receiver<Outcome>,
    queue: VecDeque<(usize, Stmt)>,
    inflight: Option<(usize, Stmt)>,
}

impl Session {
    fn start(mut db: Db, group: usize, stmts: &[Stmt]) -> Session {
        let (tx_stmt, rx_stmt) = mpsc::channel::<Stmt>();
        let (tx_out, rx_out) = mpsc::channel::<Outcome>();
        // worker exits when the scheduler drops its sender; the connection
        // goes down with the thread
        thread::spawn(move || {
            while let Ok(stmt) = rx_stmt.recv() {
                let out = db.exec_stmt(&stmt);
                if tx_out.send(out).is_err() {
                    break;
                }
            }
        });
        Session {
            group,
            tx: tx_stmt,
            rx: rx_out,
            queue: stmts.iter().cloned().enumerate().collect(),
            inflight: None,
        }
    }

    fn done(&self) -> bool {
        self.queue.is_empty() && self.inflight.is_none()
    }
}

/// Whether a side A failure means side B must skip the statement: a
/// lock-victim statement has no deterministic counterpart in a serial
/// replay.
pub fn skip_on_replay(outcome: &Outcome) -> bool {
    matches!(outcome, Err(e) if e.to_ascii_lowercase().contains("lock"))
}

/// Global sequence number of statement `idx` of group `group`, matching
/// the numbering used when the round was stored.
pub fn global_seq(test: &TestRound, group: usize, idx: usize) -> usize {
    test.init.len()
        + test.tests[..group].iter().map(Vec::len).sum::<usize>()
        + idx
}

/// Interleaved replay: every group runs as its own session on side A with
/// random scheduling, then side B replays the recorded completion order on
/// one connection. Only intra-session order is guaranteed on side A; that
/// recorded order is what side B must reproduce.
pub(crate) fn run_sessions(
    test: &TestRound,
    _db_a: &mut Db,
    db_b: &mut Db,
    opts: &RunnerOpts,
    store: &SharedStore,
) -> Result<Option<String>, DiffError> {
    let name_a = db_name(&opts.tag_a, &test.id);
    let mut sessions = Vec::with_capacity(test.tests.len());
    for (group, stmts) in test.tests.iter().enumerate() {
        let tag = format!("{}-s{group}", opts.tag_a);
        let mut db = Db::connect(&opts.dsn_a, &tag, opts.db_opts.clone())?;
        db.use_database(&name_a)?;
        let tagged: Vec<Stmt> = stmts.iter().map(|s| tag_stmt(s, &test.id)).collect();
        sessions.push(Session::start(db, group, &tagged));
    }

    let order = schedule(sessions)?;
    info!(id = %test.id, steps = order.len(), "side a schedule recorded");

    for played in &order {
        let seq = global_seq(test, played.group, played.idx);
        let stmt = &test.tests[played.group][played.idx];
        {
            let mut st = store.lock().unwrap_or_else(|e| e.into_inner());
            st.put_stmt_result(&test.id, seq, &opts.tag_a, &played.outcome)?;
        }
        if skip_on_replay(&played.outcome) {
            debug!(seq, sql = %stmt.sql, "lock victim, skipped on side b");
            continue;
        }
        let ob = db_b.exec_stmt(&played.stmt);
        {
            let mut st = store.lock().unwrap_or_else(|e| e.into_inner());
            st.put_stmt_result(&test.id, seq, &opts.tag_b, &ob)?;
        }
        if stmt.ignores_errors() && (played.outcome.is_err() || ob.is_err()) {
            continue;
        }
        let verdict = compare_results(stmt, &played.outcome, &ob, opts.check_exec);
        if !verdict.is_pass() {
            return Ok(Some(failure_report(
                stmt,
                seq,
                &verdict.describe(stmt),
                &played.outcome,
                &ob,
            )));
        }
    }

    let mut check_a = Db::connect(&opts.dsn_a, &format!("{}-check", opts.tag_a), opts.db_opts.clone())?;
    check_a.use_database(&name_a)?;
    let da = check_a.table_digests()?;
    let db_digests = db_b.table_digests()?;
    Ok(first_table_divergence(&da, &db_digests))
}

/// Advance a uniformly random unfinished session one statement at a time
/// until all are drained. A session whose in-flight statement misses the
/// probe window is blocked; when every unfinished session stays blocked
/// through the stall budget, the whole schedule is wedged.
fn schedule(mut sessions: Vec<Session>) -> Result<Vec<Played>, DiffError> {
    let mut rng = rand::rng();
    let mut order = Vec::new();
    let mut stalls = 0usize;
    loop {
        let open: Vec<usize> = sessions
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.done())
            .map(|(i, _)| i)
            .collect();
        if open.is_empty() {
            return Ok(order);
        }
        let pick = open[rng.random_range(0..open.len())];
        let s = &mut sessions[pick];
        if s.inflight.is_none() {
            // queue is non-empty here, otherwise the session were done
            if let Some((idx, stmt)) = s.queue.pop_front() {
                if s.tx.send(stmt.clone()).is_err() {
                    return Err(DiffError::SideGone { side: "a" });
                }
                s.inflight = Some((idx, stmt));
            }
        }
        match s.rx.recv_timeout(PROBE) {
            Ok(outcome) => {
                stalls = 0;
                if let Some((idx, stmt)) = s.inflight.take() {
                    order.push(Played {
                        group: s.group,
                        idx,
                        stmt,
                        outcome,
                    });
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                stalls += 1;
                debug!(session = s.group, stalls, "session blocked");
                if stalls > MAX_STALLS_PER_SESSION * sessions.len() {
                    return Err(DiffError::AllSessionsBlocked);
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                return Err(DiffError::SideGone { side: "a" });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stmt(sql: &str) -> Stmt {
        Stmt::seal(sql.into(), 0, vec![])
    }

    #[test]
    fn lock_errors_are_skipped_on_replay() {
        assert!(skip_on_replay(&Err("Deadlock found when trying to get lock".into())));
        assert!(skip_on_replay(&Err("Lock wait timeout exceeded".into())));
        assert!(!skip_on_replay(&Err("syntax error".into())));
        assert!(!skip_on_replay(&Ok(crate::resultset::ResultSet::default())));
    }

    #[test]
    fn global_sequence_matches_stored_numbering() {
        let round = TestRound {
            id: "r".into(),
            init: vec![stmt("I0"), stmt("I1")],
            tests: vec![
                vec![stmt("A0"), stmt("A1")],
                vec![stmt("B0")],
                vec![stmt("C0"), stmt("C1")],
            ],
        };
        // must agree with TestRound::numbered
        for (seq, group, s) in round.numbered() {
            if group == usize::MAX {
                continue;
            }
            let idx = round.tests[group]
                .iter()
                .position(|x| x.sql == s.sql)
                .unwrap();
            assert_eq!(global_seq(&round, group, idx), seq);
        }
        assert_eq!(global_seq(&round, 2, 1), 6);
    }
}
