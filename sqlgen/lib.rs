//! Weighted random statement generation over a compiled grammar.
//!
//! [`Generator`] repeatedly walks the production table from a root rule,
//! choosing alternatives by weight, expanding `_keyword` items through
//! caller-supplied key functions and `{ ... }` blocks through the embedded
//! script environment, and emitting a [`Stmt`] at every `;` boundary.

mod generator;
mod path;
mod script;
mod stmt;

pub use generator::{Flow, Generator, GeneratorOpts, Step};
pub use path::PathInfo;
pub use script::{KeyFunc, KeyFuncs, ScriptEnv, StmtState};
pub use stmt::{
    looks_like_query, Param, Stmt, STMT_IGNERR, STMT_PREPARED, STMT_QUERY, STMT_SORTED,
};

use thiserror::Error;

/// Errors surfaced while building a generator or walking the grammar.
#[derive(Debug, Error)]
pub enum GenError {
    #[error(transparent)]
    Grammar(#[from] sqlab_grammar::GrammarError),
    #[error("production `{0}` is not defined")]
    UnknownProduction(String),
    #[error("no key function registered for `{0}`")]
    UnsupportedKeyword(String),
    #[error("recursion limit {limit} exceeded at `{name}` (active: {trace})")]
    RecursionLimit {
        name: String,
        limit: usize,
        trace: String,
    },
    #[error("every alternative of `{name}` is blocked at recursion limit {limit} (active: {trace})")]
    NoViableAlternative {
        name: String,
        limit: usize,
        trace: String,
    },
    #[error("script block failed: {0}")]
    Script(#[from] minijinja::Error),
    #[error("key function `{name}` failed: {message}")]
    KeyFunc { name: String, message: String },
}
