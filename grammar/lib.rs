//! Grammar front end: a lexer for the weighted-BNF test-grammar dialect and
//! a parser that turns token streams into a table of productions.
//!
//! The dialect looks like:
//!
//! ```text
//! {{ set('n', 0) }}
//!
//! # entry rule
//! query: select | insert [weight=3]
//!
//! select: SELECT _field FROM _table ;
//! ```
//!
//! Rule heads are lowercase identifiers, `_`-prefixed identifiers are
//! keywords resolved by the generator, `{...}` blocks are embedded scripts,
//! and `[...]` attributes set per-alternative weights.

mod parser;
mod token;
mod tokenizer;

pub use parser::{parse, Alt, Production, ProductionTable};
pub use token::{Token, TokenKind};
pub use tokenizer::Tokenizer;

use thiserror::Error;

/// Errors surfaced while lexing or parsing a grammar. All of them are fatal
/// at load time.
#[derive(Debug, Error)]
pub enum GrammarError {
    #[error("unterminated comment starting at offset {0}")]
    UnterminatedComment(usize),
    #[error("unterminated code block starting at offset {0}")]
    UnterminatedCodeBlock(usize),
    #[error("unterminated quoted terminal starting at offset {0}")]
    UnterminatedQuote(usize),
    #[error("unterminated attribute starting at offset {0}")]
    UnterminatedAttribute(usize),
    #[error("expect ':' after rule head `{0}`")]
    ExpectColon(String),
    #[error("`{0}` is not a nonterminal")]
    NotNonTerminal(String),
    #[error("unknown attribute string: {0}")]
    UnknownAttribute(String),
    #[error("invalid weight value in {0}: {1}")]
    InvalidWeight(String, String),
    #[error("grammar contains no productions")]
    Empty,
}

/// Parse a whole grammar source into header code blocks and a merged
/// production table.
pub fn compile(src: &str) -> Result<(Vec<Token>, ProductionTable), GrammarError> {
    let mut tokenizer = Tokenizer::new(src);
    let (blocks, productions) = parse(|| tokenizer.next_token())?;
    if productions.is_empty() {
        return Err(GrammarError::Empty);
    }
    Ok((blocks, ProductionTable::build(productions)))
}
