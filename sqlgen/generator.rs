use std::sync::{Arc, Mutex};

use indexmap::IndexMap;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use sqlab_grammar::{compile, ProductionTable, TokenKind};

use crate::path::PathInfo;
use crate::script::{KeyFuncs, ScriptEnv};
use crate::stmt::Stmt;
use crate::GenError;

/// Immutable knobs for a [`Generator`], fixed at construction.
#[derive(Debug, Clone)]
pub struct GeneratorOpts {
    /// How many times one rule may appear on the expansion stack.
    pub recursion_limit: usize,
    /// Seed for the deterministic walk RNG.
    pub seed: u64,
    /// Trace every emitted word at debug level.
    pub debug: bool,
}

impl Default for GeneratorOpts {
    fn default() -> Self {
        GeneratorOpts {
            recursion_limit: 15,
            seed: 0,
            debug: false,
        }
    }
}

/// Whether a walk keeps going after a statement was handed to the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Outcome of expanding one rule: did it write any text, and does the walk
/// continue. `Stop` unwinds the whole walk without an error.
#[derive(Debug, Clone, Copy)]
pub struct Step {
    pub wrote: bool,
    pub flow: Flow,
}

/// Walks a compiled grammar, producing statements.
///
/// The RNG is seeded explicitly so a `(grammar, seed)` pair always replays
/// the identical statement sequence.
pub struct Generator {
    table: ProductionTable,
    key_funcs: Arc<Mutex<KeyFuncs>>,
    script: ScriptEnv,
    root: String,
    opts: GeneratorOpts,
    rng: ChaCha8Rng,
    path: PathInfo,
    buf: String,
}

impl Generator {
    /// Compile `grammar`, set up the script environment and run the header
    /// blocks. The default root is `query` when the grammar defines it,
    /// otherwise the first rule.
    pub fn new(grammar: &str, key_funcs: KeyFuncs, opts: GeneratorOpts) -> Result<Self, GenError> {
        let (blocks, table) = compile(grammar)?;
        let key_funcs = Arc::new(Mutex::new(key_funcs));
        let script = ScriptEnv::new(key_funcs.clone());
        for block in &blocks {
            script.exec_block(&block.text)?;
        }
        let root = if table.contains("query") {
            "query".to_string()
        } else {
            table
                .iter()
                .next()
                .map(|(head, _)| head.clone())
                .unwrap_or_default()
        };
        let rng = ChaCha8Rng::seed_from_u64(opts.seed);
        Ok(Generator {
            table,
            key_funcs,
            script,
            root,
            opts,
            rng,
            path: PathInfo::default(),
            buf: String::new(),
        })
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn has_production(&self, name: &str) -> bool {
        self.table.contains(name)
    }

    pub fn set_root(&mut self, name: &str) -> Result<(), GenError> {
        if !self.table.contains(name) {
            return Err(GenError::UnknownProduction(name.to_string()));
        }
        self.root = name.to_string();
        Ok(())
    }

    /// Rules visited by the most recent walk.
    pub fn path(&self) -> &PathInfo {
        &self.path
    }

    /// One full expansion of the root rule. Every `;` boundary hands the
    /// completed statement to `cb`; a `false` return stops the walk early.
    /// Leftover text after the last boundary is flushed as a final
    /// statement, so a grammar without `;` still yields one statement.
    pub fn walk(&mut self, cb: &mut dyn FnMut(Stmt) -> bool) -> Result<(), GenError> {
        self.buf.clear();
        self.path.clear();
        let mut recur: IndexMap<String, usize> = IndexMap::new();
        let root = self.root.clone();
        let step = self.expand(&root, &mut recur, false, cb)?;
        if step.flow == Flow::Continue && !self.buf.trim().is_empty() {
            self.flush(cb);
        }
        self.buf.clear();
        Ok(())
    }

    /// Collect every statement of one walk.
    pub fn generate(&mut self) -> Result<Vec<Stmt>, GenError> {
        let mut out = Vec::new();
        self.walk(&mut |stmt| {
            out.push(stmt);
            true
        })?;
        Ok(out)
    }

    fn expand(
        &mut self,
        name: &str,
        recur: &mut IndexMap<String, usize>,
        parent_pre_space: bool,
        cb: &mut dyn FnMut(Stmt) -> bool,
    ) -> Result<Step, GenError> {
        if !self.table.contains(name) {
            return Err(GenError::UnknownProduction(name.to_string()));
        }
        *recur.entry(name.to_string()).or_insert(0) += 1;
        let active: usize = recur.values().sum();
        if active > self.path.depth {
            self.path.depth = active;
        }
        let out = self.expand_inner(name, recur, parent_pre_space, cb);
        if let Some(c) = recur.get_mut(name) {
            *c -= 1;
            if *c == 0 {
                recur.shift_remove(name);
            }
        }
        out
    }

    fn expand_inner(
        &mut self,
        name: &str,
        recur: &mut IndexMap<String, usize>,
        parent_pre_space: bool,
        cb: &mut dyn FnMut(Stmt) -> bool,
    ) -> Result<Step, GenError> {
        let limit = self.opts.recursion_limit;
        if recur.get(name).copied().unwrap_or(0) > limit {
            return Err(GenError::RecursionLimit {
                name: name.to_string(),
                limit,
                trace: trace(recur),
            });
        }

        // Rules already at the limit cannot be entered again, so any
        // alternative that mentions one is pruned before the draw.
        let blocked: Vec<String> = recur
            .iter()
            .filter(|(_, &c)| c >= limit)
            .map(|(k, _)| k.clone())
            .collect();

        let items = {
            let p = self
                .table
                .get(name)
                .ok_or_else(|| GenError::UnknownProduction(name.to_string()))?;
            self.path.add_production(p.number);

            let mut total = 0.0f64;
            let mut cands: Vec<(usize, f64)> = Vec::new();
            for (i, alt) in p.alts.iter().enumerate() {
                if alt.weight <= 0.0 {
                    continue;
                }
                let hits_blocked = alt.items.iter().any(|t| {
                    t.is_nonterminal() && blocked.iter().any(|b| b == &t.text)
                });
                if hits_blocked {
                    continue;
                }
                total += alt.weight;
                cands.push((i, alt.weight));
            }
            if cands.is_empty() {
                return Err(GenError::NoViableAlternative {
                    name: name.to_string(),
                    limit,
                    trace: trace(recur),
                });
            }

            let draw = self.rng.random::<f64>() * total;
            let mut acc = 0.0f64;
            let mut chosen = cands[cands.len() - 1].0;
            for &(i, w) in &cands {
                acc += w;
                if draw < acc {
                    chosen = i;
                    break;
                }
            }
            let alt = &p.alts[chosen];
            self.path.add_alt(alt.prod_num, alt.alt_num);
            alt.items.clone()
        };

        let mut first_write = true;
        for item in items {
            match item.kind {
                TokenKind::NonTerminal if self.table.contains(&item.text) => {
                    let pps = if first_write {
                        parent_pre_space
                    } else {
                        item.pre_space
                    };
                    let sub = self.expand(&item.text, recur, pps, cb)?;
                    if sub.wrote {
                        first_write = false;
                    }
                    if sub.flow == Flow::Stop {
                        return Ok(Step {
                            wrote: !first_write,
                            flow: Flow::Stop,
                        });
                    }
                }
                TokenKind::Keyword => {
                    let text = self.call_key_func(&item.text)?;
                    if !text.is_empty() {
                        self.write_space(first_write, parent_pre_space, item.pre_space);
                        self.emit(&text, recur);
                        first_write = false;
                    }
                }
                TokenKind::CodeBlock => {
                    // spacing is decided before the block runs, so an
                    // empty-output block still separates its neighbors
                    self.write_space(first_write, parent_pre_space, item.pre_space);
                    let out = self.script.exec_block(&item.text)?;
                    let out = out.trim();
                    if !out.is_empty() {
                        self.emit(out, recur);
                        first_write = false;
                    }
                }
                _ => {
                    // plain terminals, plus lowercase words with no rule of
                    // their own (column and table names in the grammar text)
                    if item.text == ";" {
                        if !self.flush(cb) {
                            return Ok(Step {
                                wrote: !first_write,
                                flow: Flow::Stop,
                            });
                        }
                        first_write = true;
                        continue;
                    }
                    if item.text.is_empty() {
                        continue;
                    }
                    self.write_space(first_write, parent_pre_space, item.pre_space);
                    self.emit(&item.text, recur);
                    first_write = false;
                }
            }
        }
        Ok(Step {
            wrote: !first_write,
            flow: Flow::Continue,
        })
    }

    /// The first write at a position inherits the parent's spacing; later
    /// writes use their own flag.
    fn write_space(&mut self, first_write: bool, parent_pre_space: bool, own_pre_space: bool) {
        let space = if first_write {
            parent_pre_space
        } else {
            own_pre_space
        };
        if space && !self.buf.is_empty() {
            self.buf.push(' ');
        }
    }

    fn emit(&mut self, text: &str, recur: &IndexMap<String, usize>) {
        if self.opts.debug {
            debug!(word = text, active = %trace(recur), "emit");
        }
        self.buf.push_str(text);
    }

    /// Hand the buffered statement to the callback. Returns the callback's
    /// continue decision; a boundary with nothing buffered is a no-op.
    fn flush(&mut self, cb: &mut dyn FnMut(Stmt) -> bool) -> bool {
        let text = std::mem::take(&mut self.buf);
        let text = text.trim();
        if text.is_empty() {
            return true;
        }
        let stmt = self.script.take_stmt(text.to_string());
        if self.opts.debug {
            debug!(sql = %stmt.sql, flags = stmt.flags, "statement complete");
        }
        cb(stmt)
    }

    fn call_key_func(&mut self, name: &str) -> Result<String, GenError> {
        let mut kf = self.key_funcs.lock().unwrap_or_else(|e| e.into_inner());
        let f = kf
            .get_mut(name)
            .ok_or_else(|| GenError::UnsupportedKeyword(name.to_string()))?;
        f().map_err(|e| GenError::KeyFunc {
            name: name.to_string(),
            message: e.to_string(),
        })
    }
}

fn trace(recur: &IndexMap<String, usize>) -> String {
    let parts: Vec<String> = recur.iter().map(|(k, v)| format!("{k}x{v}")).collect();
    parts.join(", ")
}
