use std::fmt;

/// What kind of lexical unit a [`Token`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Lowercase identifier naming a production (`select_stmt`).
    NonTerminal,
    /// Literal text emitted as-is (`SELECT`, `;`, `'abc'`).
    Terminal,
    /// `_`-prefixed identifier resolved through the key-function table.
    Keyword,
    /// `:` or `|`.
    Operator,
    /// `[weight=2]`, `[ignore]`, `[omit]`.
    Attribute,
    /// `{ ... }` embedded script, outer braces included in `text`.
    CodeBlock,
    /// `# ...`, `-- ...` or `/* ... */`; skipped by the parser.
    Comment,
    /// End of the grammar source.
    Eof,
}

/// One lexical unit with its origin text and whether whitespace preceded it.
///
/// `pre_space` is what lets the generator re-serialize expansions with the
/// grammar author's original spacing: a token that was glued to its
/// predecessor must stay glued in the output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub pre_space: bool,
}

impl Token {
    pub fn new(kind: TokenKind, text: impl Into<String>, pre_space: bool) -> Self {
        Token {
            kind,
            text: text.into(),
            pre_space,
        }
    }

    pub fn eof() -> Self {
        Token::new(TokenKind::Eof, "", false)
    }

    /// An empty terminal, used for empty alternatives (`a: | b`).
    pub fn empty_terminal() -> Self {
        Token::new(TokenKind::Terminal, "", false)
    }

    pub fn is_nonterminal(&self) -> bool {
        self.kind == TokenKind::NonTerminal
    }

    pub fn is_terminal(&self) -> bool {
        self.kind == TokenKind::Terminal
    }

    pub fn is_keyword(&self) -> bool {
        self.kind == TokenKind::Keyword
    }

    pub fn is_code_block(&self) -> bool {
        self.kind == TokenKind::CodeBlock
    }

    pub fn is_comment(&self) -> bool {
        self.kind == TokenKind::Comment
    }

    pub fn is_eof(&self) -> bool {
        self.kind == TokenKind::Eof
    }

    /// Script source of a code block, outer braces stripped.
    pub fn code_body(&self) -> &str {
        debug_assert_eq!(self.kind, TokenKind::CodeBlock);
        self.text
            .strip_prefix('{')
            .and_then(|s| s.strip_suffix('}'))
            .unwrap_or(&self.text)
    }

    /// Attribute payload, brackets and padding stripped.
    pub fn attr_body(&self) -> &str {
        debug_assert_eq!(self.kind, TokenKind::Attribute);
        self.text.trim_matches(|c| c == '[' || c == ']' || c == ' ')
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}
