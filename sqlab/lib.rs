//! Grammar-driven differential SQL testing: generate statement rounds from a
//! weighted grammar, replay them against two targets, and flag the first
//! divergence in errors, result digests, or full-table content.

pub mod cli;
pub mod compare;
pub mod db;
pub mod digest;
pub mod play;
pub mod resultset;
pub mod round;
pub mod runner;
pub mod sessions;
pub mod store;

pub use compare::{compare_results, errors_match, Verdict};
pub use resultset::{ColumnDef, ExecOutcome, Outcome, ResultSet};
pub use round::TestRound;
pub use store::{Store, TestStatus};

use thiserror::Error;

/// Default grammar used by `sqlab init` to seed the store's init queue.
pub const DEFAULT_SCHEMA_GRAMMAR: &str = include_str!("schema.yy");

#[derive(Debug, Error)]
pub enum DiffError {
    #[error(transparent)]
    Gen(#[from] sqlab_sqlgen::GenError),
    #[error(transparent)]
    Db(#[from] mysql::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("test `{0}` not found")]
    TestNotFound(String),
    #[error("could not connect side `{tag}` after {attempts} attempts")]
    Connect { tag: String, attempts: usize },
    #[error("every session is blocked, replay cannot make progress")]
    AllSessionsBlocked,
    #[error("side {side} worker disappeared mid-statement")]
    SideGone { side: &'static str },
}
