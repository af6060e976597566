use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use minijinja::value::{Rest, Value, ValueKind};
use minijinja::{Environment, Error, ErrorKind};

use crate::stmt::{Param, Stmt, STMT_IGNERR, STMT_PREPARED, STMT_QUERY, STMT_SORTED};
use crate::GenError;

/// A caller-supplied expansion hook for `_keyword` grammar items.
pub type KeyFunc =
    Box<dyn FnMut() -> Result<String, Box<dyn std::error::Error + Send + Sync>> + Send>;

/// Keyword spelling as written in the grammar (`_table`, `_digit`) → hook.
pub type KeyFuncs = IndexMap<String, KeyFunc>;

/// Flags and parameters collected while one statement's text is being built.
#[derive(Debug, Default)]
pub struct StmtState {
    pub flags: u32,
    pub params: Vec<Param>,
}

/// The embedded script evaluator behind `{ ... }` grammar blocks.
///
/// Blocks are template fragments: plain text renders into the statement,
/// `{{ ... }}` interpolations call intrinsics or key functions, and state
/// persists across blocks through the `set`/`get` global map. One env lives
/// for the whole lifetime of a generator, so counters survive from the
/// header blocks through every generated statement.
pub struct ScriptEnv {
    env: Environment<'static>,
    stmt: Arc<Mutex<StmtState>>,
}

fn poisoned<T>(_: PoisonError<T>) -> Error {
    Error::new(ErrorKind::InvalidOperation, "script state lock poisoned")
}

impl ScriptEnv {
    pub fn new(key_funcs: Arc<Mutex<KeyFuncs>>) -> Self {
        let mut env = Environment::new();
        let globals: Arc<Mutex<HashMap<String, Value>>> = Arc::new(Mutex::new(HashMap::new()));
        let stmt: Arc<Mutex<StmtState>> = Arc::new(Mutex::new(StmtState::default()));

        let g = globals.clone();
        env.add_function("set", move |k: String, v: Value| -> Result<Value, Error> {
            g.lock().map_err(poisoned)?.insert(k, v);
            Ok(Value::UNDEFINED)
        });

        let g = globals.clone();
        env.add_function(
            "get",
            move |k: String, default: Option<Value>| -> Result<Value, Error> {
                let g = g.lock().map_err(poisoned)?;
                Ok(g.get(&k)
                    .cloned()
                    .or(default)
                    .unwrap_or(Value::UNDEFINED))
            },
        );

        let g = globals.clone();
        env.add_function("del", move |k: String| -> Result<Value, Error> {
            g.lock().map_err(poisoned)?.remove(&k);
            Ok(Value::UNDEFINED)
        });

        let g = globals.clone();
        env.add_function("exists", move |k: String| -> Result<Value, Error> {
            Ok(Value::from(g.lock().map_err(poisoned)?.contains_key(&k)))
        });

        env.add_function(
            "sprintf",
            |fmt: String, args: Rest<Value>| -> Result<Value, Error> {
                Ok(Value::from(sprintf(&fmt, &args)?))
            },
        );

        env.add_function("timef", |args: Rest<Value>| -> Result<Value, Error> {
            let now = match args.first() {
                Some(v) if !v.is_undefined() && !v.is_none() => {
                    let secs = i64::try_from(v.clone())?;
                    DateTime::<Utc>::from_timestamp(secs, 0).ok_or_else(|| {
                        Error::new(ErrorKind::InvalidOperation, "epoch out of range")
                    })?
                }
                _ => Utc::now(),
            };
            let fmt = match args.get(1).and_then(|v| v.as_str()) {
                Some(f) => f.to_string(),
                None => "%Y-%m-%d %H:%M:%S".to_string(),
            };
            Ok(Value::from(now.format(&fmt).to_string()))
        });

        for (name, flag) in [
            ("stmt_ignerr", STMT_IGNERR),
            ("stmt_query", STMT_QUERY),
            ("stmt_sorted", STMT_SORTED),
            ("stmt_prepared", STMT_PREPARED),
        ] {
            let s = stmt.clone();
            env.add_function(name, move || -> Result<Value, Error> {
                s.lock().map_err(poisoned)?.flags |= flag;
                Ok(Value::UNDEFINED)
            });
        }

        let s = stmt.clone();
        env.add_function("stmt_param", move |v: Value| -> Result<Value, Error> {
            s.lock().map_err(poisoned)?.params.push(param_from_value(&v)?);
            Ok(Value::from("?"))
        });

        let s = stmt.clone();
        env.add_function(
            "stmt_add_params",
            move |args: Rest<Value>| -> Result<Value, Error> {
                let mut st = s.lock().map_err(poisoned)?;
                for v in args.iter() {
                    st.params.push(param_from_value(v)?);
                }
                Ok(Value::UNDEFINED)
            },
        );

        let names: Vec<String> = match key_funcs.lock() {
            Ok(kf) => kf.keys().cloned().collect(),
            Err(e) => e.into_inner().keys().cloned().collect(),
        };
        for name in names {
            let kf = key_funcs.clone();
            let key = name.clone();
            env.add_function(name, move || -> Result<Value, Error> {
                let mut kf = kf.lock().map_err(poisoned)?;
                let f = kf.get_mut(&key).ok_or_else(|| {
                    Error::new(
                        ErrorKind::UnknownFunction,
                        format!("no key function registered for `{key}`"),
                    )
                })?;
                f().map(Value::from).map_err(|e| {
                    Error::new(
                        ErrorKind::InvalidOperation,
                        format!("key function `{key}` failed: {e}"),
                    )
                })
            });
        }

        ScriptEnv { env, stmt }
    }

    /// Render one grammar code block and return its output text.
    ///
    /// `block_text` is the block as lexed, outer braces included. A block
    /// that is itself a template tag (`{{ ... }}`, `{% ... %}`) is rendered
    /// whole; otherwise the single outer brace pair is the grammar delimiter
    /// and only the inside is rendered.
    pub fn exec_block(&self, block_text: &str) -> Result<String, GenError> {
        let src = if block_text.starts_with("{{")
            || block_text.starts_with("{%")
            || block_text.starts_with("{#")
        {
            block_text
        } else {
            block_text
                .strip_prefix('{')
                .and_then(|s| s.strip_suffix('}'))
                .unwrap_or(block_text)
        };
        Ok(self.env.render_str(src, ())?)
    }

    /// Seal the statement under construction and reset the per-statement
    /// accumulator for the next one.
    pub fn take_stmt(&self, sql: String) -> Stmt {
        let state = {
            let mut st = self.stmt.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *st)
        };
        Stmt::seal(sql, state.flags, state.params)
    }
}

/// Bind a template value as a statement parameter. Booleans bind as
/// integers 0/1 so both sides of an A/B run see identical typed values.
fn param_from_value(v: &Value) -> Result<Param, Error> {
    match v.kind() {
        ValueKind::Undefined | ValueKind::None => Ok(Param::Null),
        ValueKind::Bool => Ok(Param::Int(if v.is_true() { 1 } else { 0 })),
        ValueKind::Number => i64::try_from(v.clone())
            .map(Param::Int)
            .or_else(|_| f64::try_from(v.clone()).map(Param::Float)),
        ValueKind::String => Ok(Param::Str(v.as_str().unwrap_or_default().to_string())),
        other => Err(Error::new(
            ErrorKind::InvalidOperation,
            format!("cannot bind a {other} value as a statement parameter"),
        )),
    }
}

/// Small printf with the `%d`/`%s`/`%f`/`%%` conversions grammar scripts use.
fn sprintf(fmt: &str, args: &[Value]) -> Result<String, Error> {
    let mut out = String::with_capacity(fmt.len());
    let mut next = 0usize;
    let mut chars = fmt.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let verb = chars.next().ok_or_else(|| {
            Error::new(ErrorKind::InvalidOperation, "dangling % in format string")
        })?;
        if verb == '%' {
            out.push('%');
            continue;
        }
        let arg = args.get(next).ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidOperation,
                format!("missing argument {next} for %{verb}"),
            )
        })?;
        next += 1;
        match verb {
            'd' => out.push_str(&i64::try_from(arg.clone())?.to_string()),
            'f' => out.push_str(&format!("{:.6}", f64::try_from(arg.clone())?)),
            's' => match arg.as_str() {
                Some(s) => out.push_str(s),
                None => out.push_str(&arg.to_string()),
            },
            _ => {
                return Err(Error::new(
                    ErrorKind::InvalidOperation,
                    format!("unsupported conversion %{verb}"),
                ))
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> ScriptEnv {
        ScriptEnv::new(Arc::new(Mutex::new(KeyFuncs::new())))
    }

    #[test]
    fn set_get_del_exists_roundtrip() {
        let e = env();
        assert_eq!(e.exec_block("{{ set('n', 3) }}").unwrap(), "");
        assert_eq!(e.exec_block("{{ get('n') }}").unwrap(), "3");
        assert_eq!(e.exec_block("{{ exists('n') }}").unwrap(), "true");
        assert_eq!(e.exec_block("{{ get('n') + 1 }}").unwrap(), "4");
        assert_eq!(e.exec_block("{{ del('n') }}").unwrap(), "");
        assert_eq!(e.exec_block("{{ exists('n') }}").unwrap(), "false");
        assert_eq!(e.exec_block("{{ get('n', 9) }}").unwrap(), "9");
    }

    #[test]
    fn state_survives_across_blocks() {
        let e = env();
        e.exec_block("{{ set('i', 10) }}").unwrap();
        e.exec_block("{{ set('i', get('i') + 1) }}").unwrap();
        assert_eq!(e.exec_block("{{ get('i') }}").unwrap(), "11");
    }

    #[test]
    fn plain_block_is_literal_text() {
        let e = env();
        assert_eq!(e.exec_block("{ FOR UPDATE }").unwrap(), " FOR UPDATE ");
    }

    #[test]
    fn sprintf_conversions() {
        let e = env();
        let out = e
            .exec_block("{{ sprintf('t%d says %s at %f%%', 7, 'hi', 0.5) }}")
            .unwrap();
        assert_eq!(out, "t7 says hi at 0.500000%");
        assert!(e.exec_block("{{ sprintf('%d') }}").is_err());
        assert!(e.exec_block("{{ sprintf('%q', 1) }}").is_err());
    }

    #[test]
    fn timef_formats_epoch() {
        let e = env();
        let out = e.exec_block("{{ timef(0) }}").unwrap();
        assert_eq!(out, "1970-01-01 00:00:00");
        let out = e.exec_block("{{ timef(86400, '%Y%m%d') }}").unwrap();
        assert_eq!(out, "19700102");
    }

    #[test]
    fn stmt_param_emits_placeholder_and_binds() {
        let e = env();
        let sql = e
            .exec_block("{{ 'SELECT ' ~ stmt_param(3) ~ ' + ' ~ stmt_param('x') }}")
            .unwrap();
        assert_eq!(sql, "SELECT ? + ?");
        let s = e.take_stmt(sql);
        assert_eq!(s.params, vec![Param::Int(3), Param::Str("x".into())]);
        assert!(s.is_prepared());
    }

    #[test]
    fn bool_and_null_params_normalize() {
        let e = env();
        e.exec_block("{{ stmt_add_params(true, false, none, 2.5) }}")
            .unwrap();
        let s = e.take_stmt("SELECT ?, ?, ?, ?".into());
        assert_eq!(
            s.params,
            vec![
                Param::Int(1),
                Param::Int(0),
                Param::Null,
                Param::Float(2.5)
            ]
        );
    }

    #[test]
    fn flags_reset_per_statement() {
        let e = env();
        e.exec_block("{{ stmt_ignerr() }}{{ stmt_sorted() }}").unwrap();
        let s = e.take_stmt("SELECT 1 ORDER BY 1".into());
        assert!(s.ignores_errors());
        assert!(s.is_sorted());
        let s = e.take_stmt("SELECT 2".into());
        assert!(!s.ignores_errors());
        assert!(!s.is_sorted());
    }

    #[test]
    fn key_funcs_callable_from_scripts() {
        let mut kf = KeyFuncs::new();
        let mut n = 0;
        kf.insert(
            "_digit".to_string(),
            Box::new(move || {
                n += 1;
                Ok(n.to_string())
            }) as KeyFunc,
        );
        let e = ScriptEnv::new(Arc::new(Mutex::new(kf)));
        assert_eq!(e.exec_block("{{ _digit() }}{{ _digit() }}").unwrap(), "12");
    }
}
