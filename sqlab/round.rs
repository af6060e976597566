use std::sync::{Arc, Mutex};

use chrono::Utc;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use sqlab_sqlgen::{Generator, GeneratorOpts, KeyFunc, KeyFuncs, Stmt};

use crate::DiffError;

/// One generated test: shared init statements plus ordered statement
/// groups. In sequential mode a group is a transaction; in multi-session
/// mode each group becomes its own session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestRound {
    pub id: String,
    pub init: Vec<Stmt>,
    pub tests: Vec<Vec<Stmt>>,
}

impl TestRound {
    /// Statements in replay order with their global sequence numbers.
    /// Init occupies the leading sequence slots.
    pub fn numbered(&self) -> impl Iterator<Item = (usize, usize, &Stmt)> {
        let init = self.init.iter().map(|s| (usize::MAX, s));
        let groups = self
            .tests
            .iter()
            .enumerate()
            .flat_map(|(g, stmts)| stmts.iter().map(move |s| (g, s)));
        init.chain(groups)
            .enumerate()
            .map(|(seq, (g, s))| (seq, g, s))
    }
}

/// Everything `gen_round` needs to produce one round.
#[derive(Debug, Clone)]
pub struct RoundOpts {
    pub grammar: String,
    pub init_root: String,
    pub txn_root: String,
    pub recursion_limit: usize,
    pub txn_count: usize,
    pub seed: u64,
    pub debug: bool,
}

impl Default for RoundOpts {
    fn default() -> Self {
        RoundOpts {
            grammar: String::new(),
            init_root: "init".to_string(),
            txn_root: "txn".to_string(),
            recursion_limit: 15,
            txn_count: 10,
            seed: 0,
            debug: false,
        }
    }
}

/// Fresh round id: unix seconds plus a random suffix so ids stay unique
/// across workers started in the same second.
pub fn round_id(seed_hint: u64) -> String {
    let mut rng = ChaCha8Rng::seed_from_u64(seed_hint ^ 0x5eed_1d);
    format!("{}-{:04x}", Utc::now().timestamp(), rng.random::<u16>())
}

/// Build a generator over `opts.grammar` with the standard key functions
/// and produce init statements plus `txn_count` statement groups.
pub fn gen_round(opts: &RoundOpts) -> Result<TestRound, DiffError> {
    let mut g = Generator::new(
        &opts.grammar,
        standard_key_funcs(opts.seed),
        GeneratorOpts {
            recursion_limit: opts.recursion_limit,
            seed: opts.seed,
            debug: opts.debug,
        },
    )?;
    // a grammar may define only the workload and rely on externally
    // provided init statements
    let init = if g.has_production(&opts.init_root) {
        g.set_root(&opts.init_root)?;
        g.generate()?
    } else {
        debug!(root = %opts.init_root, "grammar has no init root");
        Vec::new()
    };
    let mut tests = Vec::with_capacity(opts.txn_count);
    if opts.txn_count > 0 {
        g.set_root(&opts.txn_root)?;
        for _ in 0..opts.txn_count {
            tests.push(g.generate()?);
        }
    }
    let round = TestRound {
        id: round_id(opts.seed),
        init,
        tests,
    };
    debug!(
        id = %round.id,
        init = round.init.len(),
        groups = round.tests.len(),
        "round generated"
    );
    Ok(round)
}

const ENGLISH: &[&str] = &[
    "bar", "baz", "corge", "foo", "garply", "grault", "quux", "qux", "waldo",
];

/// The keyword table grammars can rely on: deterministic per seed, so the
/// same `(grammar, seed)` pair regenerates the identical round.
pub fn standard_key_funcs(seed: u64) -> KeyFuncs {
    // separate stream from the walk RNG so keyword draws do not disturb
    // alternative selection
    let rng = Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(
        seed ^ 0x6b65_7946_756e_6373,
    )));
    let mut kf = KeyFuncs::new();

    let r = rng.clone();
    kf.insert(
        "_int".to_string(),
        Box::new(move || {
            let mut r = r.lock().unwrap_or_else(|e| e.into_inner());
            Ok(r.random_range(-1000i64..1000).to_string())
        }) as KeyFunc,
    );

    let r = rng.clone();
    kf.insert(
        "_digit".to_string(),
        Box::new(move || {
            let mut r = r.lock().unwrap_or_else(|e| e.into_inner());
            Ok(r.random_range(0u8..10).to_string())
        }) as KeyFunc,
    );

    let r = rng.clone();
    kf.insert(
        "_letter".to_string(),
        Box::new(move || {
            let mut r = r.lock().unwrap_or_else(|e| e.into_inner());
            Ok(char::from(b'a' + r.random_range(0u8..26)).to_string())
        }) as KeyFunc,
    );

    let r = rng.clone();
    kf.insert(
        "_bool".to_string(),
        Box::new(move || {
            let mut r = r.lock().unwrap_or_else(|e| e.into_inner());
            Ok(if r.random::<bool>() { "1" } else { "0" }.to_string())
        }) as KeyFunc,
    );

    let r = rng.clone();
    kf.insert(
        "_english".to_string(),
        Box::new(move || {
            let mut r = r.lock().unwrap_or_else(|e| e.into_inner());
            let w = ENGLISH[r.random_range(0..ENGLISH.len())];
            Ok(format!("'{w}'"))
        }) as KeyFunc,
    );

    let r = rng;
    kf.insert(
        "_year".to_string(),
        Box::new(move || {
            let mut r = r.lock().unwrap_or_else(|e| e.into_inner());
            Ok(r.random_range(1990u32..2030).to_string())
        }) as KeyFunc,
    );

    kf
}
