use indexmap::IndexMap;

use crate::token::{Token, TokenKind};
use crate::GrammarError;

/// One alternative (right-hand side) of a production.
///
/// `prod_num`/`alt_num` are assigned when the alternative is attached to its
/// production and stay stable across table merges, so the pair is a durable
/// identity for visited-path tracking.
#[derive(Debug, Clone)]
pub struct Alt {
    pub items: Vec<Token>,
    pub prod_num: usize,
    pub alt_num: usize,
    pub weight: f64,
}

impl Alt {
    fn new() -> Self {
        Alt {
            items: Vec::new(),
            prod_num: 0,
            alt_num: 0,
            weight: 1.0,
        }
    }

    fn with_items(items: Vec<Token>) -> Self {
        Alt {
            items,
            ..Alt::new()
        }
    }

    /// Append a token, routing attribute tokens into weight handling instead
    /// of the item list.
    pub fn push(&mut self, t: Token) -> Result<(), GrammarError> {
        if t.kind != TokenKind::Attribute {
            self.items.push(t);
            return Ok(());
        }
        let body = t.attr_body().to_string();
        let mut parts = body.splitn(2, '=');
        let key = parts.next().unwrap_or("").trim();
        match key {
            "weight" => {
                let raw = parts
                    .next()
                    .ok_or_else(|| GrammarError::UnknownAttribute(t.text.clone()))?;
                let w: f64 = raw
                    .trim()
                    .parse()
                    .map_err(|e: std::num::ParseFloatError| {
                        GrammarError::InvalidWeight(t.text.clone(), e.to_string())
                    })?;
                if !w.is_finite() || w < 0.0 {
                    return Err(GrammarError::InvalidWeight(
                        t.text.clone(),
                        "weight must be a finite non-negative number".into(),
                    ));
                }
                self.weight = w;
            }
            "ignore" | "omit" => self.weight = 0.0,
            _ => return Err(GrammarError::UnknownAttribute(t.text)),
        }
        Ok(())
    }
}

/// A named rule: a nonterminal head plus its ordered alternatives.
#[derive(Debug, Clone)]
pub struct Production {
    pub number: usize,
    pub head: Token,
    pub alts: Vec<Alt>,
}

impl Production {
    fn new(head: Token, number: usize) -> Self {
        Production {
            number,
            head,
            alts: Vec::new(),
        }
    }

    fn push_alt(&mut self, mut alt: Alt) {
        alt.prod_num = self.number;
        alt.alt_num = self.alts.len();
        self.alts.push(alt);
    }
}

/// Head string → production, with same-head productions merged. Read-only
/// after construction; generation only does lookups.
#[derive(Debug, Clone, Default)]
pub struct ProductionTable {
    map: IndexMap<String, Production>,
}

impl ProductionTable {
    pub fn build(productions: Vec<Production>) -> Self {
        let mut map: IndexMap<String, Production> = IndexMap::new();
        for p in productions {
            match map.get_mut(&p.head.text) {
                Some(existing) => existing.alts.extend(p.alts),
                None => {
                    map.insert(p.head.text.clone(), p);
                }
            }
        }
        ProductionTable { map }
    }

    pub fn get(&self, head: &str) -> Option<&Production> {
        self.map.get(head)
    }

    pub fn contains(&self, head: &str) -> bool {
        self.map.contains_key(head)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Production)> {
        self.map.iter()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    DelimFetched,
    TermFetched,
    PrepareNextProd,
    End,
}

fn skip_comments(
    next: &mut impl FnMut() -> Result<Token, GrammarError>,
) -> Result<Token, GrammarError> {
    loop {
        let t = next()?;
        if !t.is_comment() {
            return Ok(t);
        }
    }
}

/// Header code blocks appear before the first rule head; comments in between
/// are dropped.
fn collect_head_code_blocks(
    next: &mut impl FnMut() -> Result<Token, GrammarError>,
) -> Result<(Token, Vec<Token>), GrammarError> {
    let mut blocks = Vec::new();
    loop {
        let t = skip_comments(next)?;
        if t.is_code_block() {
            blocks.push(t);
        } else {
            return Ok((t, blocks));
        }
    }
}

/// Parse a token stream into header script blocks and productions in source
/// order. Production numbers increase monotonically and are never reused.
pub fn parse(
    mut next: impl FnMut() -> Result<Token, GrammarError>,
) -> Result<(Vec<Token>, Vec<Production>), GrammarError> {
    let mut prods: Vec<Production> = Vec::new();
    let mut p_number = 0usize;

    let (head, blocks) = collect_head_code_blocks(&mut next)?;
    if head.is_eof() {
        return Ok((blocks, prods));
    }
    if !head.is_nonterminal() {
        return Err(GrammarError::NotNonTerminal(head.text));
    }

    let mut p = Production::new(head, p_number);
    p_number += 1;
    let mut alt = Alt::new();
    let mut last_term: Option<Token> = None;
    let mut state = State::Init;

    while state != State::End {
        let tkn = skip_comments(&mut next)?;
        match state {
            State::Init => {
                if tkn.text != ":" {
                    return Err(GrammarError::ExpectColon(p.head.text.clone()));
                }
                state = State::DelimFetched;
            }
            State::DelimFetched => {
                if tkn.is_eof() {
                    alt.push(Token::empty_terminal())?;
                    p.push_alt(alt);
                    prods.push(p);
                    return Ok((blocks, prods));
                }
                if tkn.kind == TokenKind::Operator && tkn.text == "|" {
                    // consecutive delimiters produce an empty alternative
                    alt.push(Token::empty_terminal())?;
                    p.push_alt(alt);
                    alt = Alt::new();
                } else if tkn.kind == TokenKind::Operator && tkn.text == ":" {
                    // stray colon, ignore
                } else {
                    alt.push(tkn)?;
                    state = State::TermFetched;
                }
            }
            State::TermFetched => match tkn.kind {
                TokenKind::Eof => {
                    p.push_alt(alt);
                    prods.push(p);
                    return Ok((blocks, prods));
                }
                TokenKind::Operator => {
                    if tkn.text == "|" {
                        p.push_alt(alt);
                        alt = Alt::new();
                    } else {
                        // `a: b: ...` — the single fetched term is really the
                        // next production's head, leaving `a` an empty
                        // alternative
                        let head = alt.items.pop().ok_or_else(|| {
                            GrammarError::NotNonTerminal(String::new())
                        })?;
                        if !head.is_nonterminal() {
                            return Err(GrammarError::NotNonTerminal(head.text));
                        }
                        alt.push(Token::empty_terminal())?;
                        p.push_alt(alt);
                        prods.push(p);
                        p = Production::new(head, p_number);
                        p_number += 1;
                        alt = Alt::new();
                    }
                    state = State::DelimFetched;
                }
                _ => {
                    last_term = Some(tkn);
                    state = State::PrepareNextProd;
                }
            },
            State::PrepareNextProd => match tkn.kind {
                TokenKind::Eof => {
                    if let Some(t) = last_term.take() {
                        alt.push(t)?;
                    }
                    p.push_alt(alt);
                    prods.push(p);
                    return Ok((blocks, prods));
                }
                TokenKind::Operator => {
                    if tkn.text == "|" {
                        if let Some(t) = last_term.take() {
                            alt.push(t)?;
                        }
                        p.push_alt(alt);
                        alt = Alt::new();
                    } else {
                        // the buffered trailing symbol is the next head
                        p.push_alt(alt);
                        alt = Alt::new();
                        prods.push(p);
                        let head = last_term.take().ok_or_else(|| {
                            GrammarError::NotNonTerminal(String::new())
                        })?;
                        if !head.is_nonterminal() {
                            return Err(GrammarError::NotNonTerminal(head.text));
                        }
                        p = Production::new(head, p_number);
                        p_number += 1;
                    }
                    state = State::DelimFetched;
                }
                _ => {
                    if let Some(t) = last_term.replace(tkn) {
                        alt.push(t)?;
                    }
                }
            },
            State::End => unreachable!(),
        }
    }

    Ok((blocks, prods))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile;
    use crate::tokenizer::Tokenizer;

    fn parse_src(src: &str) -> (Vec<Token>, Vec<Production>) {
        let mut t = Tokenizer::new(src);
        parse(|| t.next_token()).unwrap()
    }

    fn parse_err(src: &str) -> GrammarError {
        let mut t = Tokenizer::new(src);
        parse(|| t.next_token()).unwrap_err()
    }

    #[test]
    fn single_production() {
        let (_, prods) = parse_src("query: SELECT 1 | SELECT 2");
        assert_eq!(prods.len(), 1);
        assert_eq!(prods[0].head.text, "query");
        assert_eq!(prods[0].alts.len(), 2);
        assert_eq!(prods[0].alts[0].items.len(), 2);
        assert_eq!(prods[0].alts[1].items[1].text, "2");
        assert_eq!(prods[0].alts[1].alt_num, 1);
    }

    #[test]
    fn chained_productions_share_trailing_head() {
        let (_, prods) = parse_src("a: x y\nb: z");
        assert_eq!(prods.len(), 2);
        assert_eq!(prods[0].head.text, "a");
        // `b` was consumed as the next head, not as part of a's alternative
        let items: Vec<&str> = prods[0].alts[0]
            .items
            .iter()
            .map(|t| t.text.as_str())
            .collect();
        assert_eq!(items, vec!["x", "y"]);
        assert_eq!(prods[1].head.text, "b");
        assert_eq!(prods[1].number, 1);
    }

    #[test]
    fn empty_alternatives() {
        let (_, prods) = parse_src("opt: | x |");
        assert_eq!(prods[0].alts.len(), 3);
        assert_eq!(prods[0].alts[0].items[0].text, "");
        assert_eq!(prods[0].alts[2].items[0].text, "");
    }

    #[test]
    fn weight_attribute() {
        let (_, prods) = parse_src("a: x [weight=2.5] | y [ignore] | z [omit]");
        assert_eq!(prods[0].alts[0].weight, 2.5);
        assert_eq!(prods[0].alts[1].weight, 0.0);
        assert_eq!(prods[0].alts[2].weight, 0.0);
        // attributes never land in the item list
        assert_eq!(prods[0].alts[0].items.len(), 1);
    }

    #[test]
    fn unknown_attribute_is_error() {
        assert!(matches!(
            parse_err("a: x [frobnicate]"),
            GrammarError::UnknownAttribute(_)
        ));
    }

    #[test]
    fn bad_weight_is_error() {
        assert!(matches!(
            parse_err("a: x [weight=oops]"),
            GrammarError::InvalidWeight(..)
        ));
        assert!(matches!(
            parse_err("a: x [weight=-1]"),
            GrammarError::InvalidWeight(..)
        ));
    }

    #[test]
    fn missing_colon_is_error() {
        assert!(matches!(parse_err("a b c"), GrammarError::ExpectColon(_)));
    }

    #[test]
    fn terminal_head_is_error() {
        assert!(matches!(
            parse_err("SELECT: x"),
            GrammarError::NotNonTerminal(_)
        ));
    }

    #[test]
    fn non_nonterminal_chained_head_is_error() {
        // trailing symbol before `:` must be a nonterminal
        assert!(matches!(
            parse_err("a: x Y: z"),
            GrammarError::NotNonTerminal(_)
        ));
    }

    #[test]
    fn header_code_blocks_collected() {
        let (blocks, prods) = parse_src("{ set('i', 0) }\n# hi\n{ set('j', 1) }\na: x");
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].code_body(), " set('i', 0) ");
        assert_eq!(prods.len(), 1);
    }

    #[test]
    fn table_merges_same_head() {
        let (_, table) = compile("a: x\nb: y\na: z").unwrap();
        assert_eq!(table.len(), 2);
        let a = table.get("a").unwrap();
        assert_eq!(a.alts.len(), 2);
        // merged alternative keeps its original production number identity
        assert_eq!(a.alts[0].prod_num, 0);
        assert_eq!(a.alts[1].prod_num, 2);
    }

    #[test]
    fn empty_grammar_is_error() {
        assert!(matches!(compile("# nothing"), Err(GrammarError::Empty)));
    }

    #[test]
    fn production_numbers_are_stable() {
        let (_, prods) = parse_src("a: x\nb: y\nc: z");
        let nums: Vec<usize> = prods.iter().map(|p| p.number).collect();
        assert_eq!(nums, vec![0, 1, 2]);
    }
}
