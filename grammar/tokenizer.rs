use crate::token::{Token, TokenKind};
use crate::GrammarError;

/// Lexer over the grammar source. Produces one [`Token`] per call to
/// [`Tokenizer::next_token`], ending with an `Eof` token that can be
/// requested repeatedly.
pub struct Tokenizer {
    chars: Vec<char>,
    pos: usize,
}

impl Tokenizer {
    pub fn new(src: &str) -> Self {
        Tokenizer {
            chars: src.chars().collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, off: usize) -> Option<char> {
        self.chars.get(self.pos + off).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    /// Next token in the stream. Comments are returned as tokens; the parser
    /// decides to skip them.
    pub fn next_token(&mut self) -> Result<Token, GrammarError> {
        let mut pre_space = false;
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                pre_space = true;
                self.pos += 1;
            } else {
                break;
            }
        }

        let start = self.pos;
        let c = match self.peek() {
            Some(c) => c,
            None => return Ok(Token::eof()),
        };

        match c {
            '#' => Ok(self.line_comment(pre_space)),
            '-' if self.peek_at(1) == Some('-') => Ok(self.line_comment(pre_space)),
            '/' if self.peek_at(1) == Some('*') => self.block_comment(start, pre_space),
            '{' => self.code_block(start, pre_space),
            '[' => self.attribute(start, pre_space),
            '\'' | '"' => self.quoted(start, c, pre_space),
            ':' | '|' => {
                self.pos += 1;
                Ok(Token::new(TokenKind::Operator, c, pre_space))
            }
            _ if is_ident_char(c) => Ok(self.ident(pre_space)),
            _ => {
                // any other single character is an opaque terminal (`;`,
                // `,`, `(`, `)`, `=`, ...)
                self.pos += 1;
                Ok(Token::new(TokenKind::Terminal, c, pre_space))
            }
        }
    }

    fn line_comment(&mut self, pre_space: bool) -> Token {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.pos += 1;
        }
        Token::new(
            TokenKind::Comment,
            self.chars[start..self.pos].iter().collect::<String>(),
            pre_space,
        )
    }

    fn block_comment(&mut self, start: usize, pre_space: bool) -> Result<Token, GrammarError> {
        self.pos += 2; // consume `/*`
        while let Some(c) = self.bump() {
            if c == '*' && self.peek() == Some('/') {
                self.pos += 1;
                return Ok(Token::new(
                    TokenKind::Comment,
                    self.chars[start..self.pos].iter().collect::<String>(),
                    pre_space,
                ));
            }
        }
        Err(GrammarError::UnterminatedComment(start))
    }

    /// Code blocks keep their outer braces in the origin text and may nest
    /// same-kind delimiters: `{ set('a', '{x}') }` is one token.
    fn code_block(&mut self, start: usize, pre_space: bool) -> Result<Token, GrammarError> {
        let mut depth = 0usize;
        while let Some(c) = self.bump() {
            match c {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(Token::new(
                            TokenKind::CodeBlock,
                            self.chars[start..self.pos].iter().collect::<String>(),
                            pre_space,
                        ));
                    }
                }
                _ => {}
            }
        }
        Err(GrammarError::UnterminatedCodeBlock(start))
    }

    fn attribute(&mut self, start: usize, pre_space: bool) -> Result<Token, GrammarError> {
        while let Some(c) = self.bump() {
            if c == ']' {
                return Ok(Token::new(
                    TokenKind::Attribute,
                    self.chars[start..self.pos].iter().collect::<String>(),
                    pre_space,
                ));
            }
        }
        Err(GrammarError::UnterminatedAttribute(start))
    }

    /// Quoted terminals keep their quotes, so `'abc'` expands to a SQL
    /// string literal verbatim.
    fn quoted(&mut self, start: usize, quote: char, pre_space: bool) -> Result<Token, GrammarError> {
        self.pos += 1; // opening quote
        while let Some(c) = self.bump() {
            if c == '\\' {
                self.pos += 1;
            } else if c == quote {
                return Ok(Token::new(
                    TokenKind::Terminal,
                    self.chars[start..self.pos].iter().collect::<String>(),
                    pre_space,
                ));
            }
        }
        Err(GrammarError::UnterminatedQuote(start))
    }

    fn ident(&mut self, pre_space: bool) -> Token {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if is_ident_char(c) {
                self.pos += 1;
            } else {
                break;
            }
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        let kind = classify_ident(&text);
        Token::new(kind, text, pre_space)
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// `_table` is a keyword, `select_stmt` a nonterminal, `SELECT`/`42` plain
/// terminals.
fn classify_ident(text: &str) -> TokenKind {
    if text.starts_with('_') {
        return TokenKind::Keyword;
    }
    let mut chars = text.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {
            if chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_') {
                TokenKind::NonTerminal
            } else {
                TokenKind::Terminal
            }
        }
        _ => TokenKind::Terminal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(src: &str) -> Vec<Token> {
        let mut t = Tokenizer::new(src);
        let mut out = vec![];
        loop {
            let tkn = t.next_token().unwrap();
            let eof = tkn.is_eof();
            out.push(tkn);
            if eof {
                break;
            }
        }
        out
    }

    #[test]
    fn classifies_idents() {
        let toks = lex("query: SELECT _field FROM tbl_1 ;");
        let kinds: Vec<TokenKind> = toks.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::NonTerminal,
                TokenKind::Operator,
                TokenKind::Terminal,
                TokenKind::Keyword,
                TokenKind::Terminal,
                TokenKind::NonTerminal,
                TokenKind::Terminal,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn tracks_pre_space() {
        let toks = lex("a: b,c ,d");
        // `,` after b has no preceding space, `,` before d has one
        assert_eq!(toks[2].text, "b");
        assert!(toks[2].pre_space);
        assert_eq!(toks[3].text, ",");
        assert!(!toks[3].pre_space);
        assert_eq!(toks[5].text, ",");
        assert!(toks[5].pre_space);
        assert_eq!(toks[6].text, "d");
        assert!(!toks[6].pre_space);
    }

    #[test]
    fn nested_code_block_is_one_token() {
        let toks = lex("{ if x { y() } }");
        assert_eq!(toks[0].kind, TokenKind::CodeBlock);
        assert_eq!(toks[0].text, "{ if x { y() } }");
        assert_eq!(toks[0].code_body(), " if x { y() } ");
        assert!(toks[1].is_eof());
    }

    #[test]
    fn unterminated_code_block_errors() {
        let mut t = Tokenizer::new("{ oops");
        assert!(matches!(
            t.next_token(),
            Err(GrammarError::UnterminatedCodeBlock(_))
        ));
    }

    #[test]
    fn unterminated_block_comment_errors() {
        let mut t = Tokenizer::new("/* oops");
        assert!(matches!(
            t.next_token(),
            Err(GrammarError::UnterminatedComment(_))
        ));
    }

    #[test]
    fn quoted_terminal_keeps_quotes() {
        let toks = lex("a: 'x y' \"z\"");
        assert_eq!(toks[2].text, "'x y'");
        assert_eq!(toks[2].kind, TokenKind::Terminal);
        assert_eq!(toks[3].text, "\"z\"");
    }

    #[test]
    fn unterminated_quote_errors() {
        let mut t = Tokenizer::new("'oops");
        assert!(matches!(
            t.next_token(),
            Err(GrammarError::UnterminatedQuote(_))
        ));
    }

    #[test]
    fn comments_are_tokens() {
        let toks = lex("# line\n-- another\n/* block */ a");
        assert_eq!(toks[0].kind, TokenKind::Comment);
        assert_eq!(toks[1].kind, TokenKind::Comment);
        assert_eq!(toks[2].kind, TokenKind::Comment);
        assert_eq!(toks[3].kind, TokenKind::NonTerminal);
    }

    #[test]
    fn attribute_token() {
        let toks = lex("[weight=2.5]");
        assert_eq!(toks[0].kind, TokenKind::Attribute);
        assert_eq!(toks[0].attr_body(), "weight=2.5");
    }

    #[test]
    fn eof_is_idempotent() {
        let mut t = Tokenizer::new("");
        assert!(t.next_token().unwrap().is_eof());
        assert!(t.next_token().unwrap().is_eof());
    }
}
