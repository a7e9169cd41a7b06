use std::hash::{Hash, Hasher};
use std::time::Duration;

/// A single command argument.
///
/// Arguments carry their type so serialization can apply the right
/// rendering: keys get the connection-wide key prefix, lex and score
/// ranges get their `[` / `(` markers, and booleans render as the words
/// `true` / `false`.
#[derive(Debug, Clone)]
pub enum Arg {
    /// A key argument, subject to the connection key prefix.
    Key(String),
    /// A plain string argument.
    Str(String),
    /// A signed integer argument.
    Int(i64),
    /// An unsigned integer argument.
    Uint(u64),
    /// A 32-bit float argument.
    Float32(f32),
    /// A 64-bit float argument.
    Float64(f64),
    /// A boolean argument, rendered as `true` / `false`.
    Bool(bool),
    /// A lexicographic range bound, rendered with a `[` or `(` prefix.
    Lex { value: String, inclusive: bool },
    /// A score range bound, rendered with a `(` prefix when exclusive.
    Score { value: f64, inclusive: bool },
}

impl Arg {
    /// Creates a key argument.
    pub fn key(s: impl Into<String>) -> Arg {
        Arg::Key(s.into())
    }

    /// Creates a string argument.
    pub fn string(s: impl Into<String>) -> Arg {
        Arg::Str(s.into())
    }

    /// Creates an inclusive or exclusive lex range bound.
    pub fn lex(s: impl Into<String>, inclusive: bool) -> Arg {
        Arg::Lex {
            value: s.into(),
            inclusive,
        }
    }

    /// Creates an inclusive or exclusive score range bound.
    pub fn score(value: f64, inclusive: bool) -> Arg {
        Arg::Score { value, inclusive }
    }

    /// Creates an argument holding a duration in milliseconds.
    pub fn milliseconds(d: Duration) -> Arg {
        Arg::Int(d.as_millis() as i64)
    }

    /// Creates an argument holding a duration in seconds.
    pub fn seconds(d: Duration) -> Arg {
        Arg::Int(d.as_secs() as i64)
    }

    /// The minus infinity score range bound.
    pub fn min_score() -> Arg {
        Arg::Str("-inf".to_string())
    }

    /// The plus infinity score range bound.
    pub fn max_score() -> Arg {
        Arg::Str("+inf".to_string())
    }

    /// The minus infinity lex range bound.
    pub fn min_lex() -> Arg {
        Arg::Str("-".to_string())
    }

    /// The plus infinity lex range bound.
    pub fn max_lex() -> Arg {
        Arg::Str("+".to_string())
    }

    /// Returns the textual payload of a key or string argument.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Arg::Key(s) | Arg::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the numeric value of an integer-like argument.
    pub fn as_int(&self) -> Option<i64> {
        match *self {
            Arg::Int(n) => Some(n),
            Arg::Uint(n) if n <= i64::MAX as u64 => Some(n as i64),
            _ => None,
        }
    }

    fn discriminant(&self) -> u8 {
        match self {
            Arg::Key(_) => 0,
            Arg::Str(_) => 1,
            Arg::Int(_) => 2,
            Arg::Uint(_) => 3,
            Arg::Float32(_) => 4,
            Arg::Float64(_) => 5,
            Arg::Bool(_) => 6,
            Arg::Lex { .. } => 7,
            Arg::Score { .. } => 8,
        }
    }
}

impl From<String> for Arg {
    fn from(s: String) -> Arg {
        Arg::Str(s)
    }
}

impl<'a> From<&'a str> for Arg {
    fn from(s: &'a str) -> Arg {
        Arg::Str(s.to_string())
    }
}

impl From<i64> for Arg {
    fn from(n: i64) -> Arg {
        Arg::Int(n)
    }
}

impl From<u64> for Arg {
    fn from(n: u64) -> Arg {
        Arg::Uint(n)
    }
}

impl From<f64> for Arg {
    fn from(f: f64) -> Arg {
        Arg::Float64(f)
    }
}

impl From<bool> for Arg {
    fn from(b: bool) -> Arg {
        Arg::Bool(b)
    }
}

// Value equality: floats compare by bit pattern so arguments are usable
// as script-cache keys.
impl PartialEq for Arg {
    fn eq(&self, other: &Arg) -> bool {
        match (self, other) {
            (Arg::Key(a), Arg::Key(b)) => a == b,
            (Arg::Str(a), Arg::Str(b)) => a == b,
            (Arg::Int(a), Arg::Int(b)) => a == b,
            (Arg::Uint(a), Arg::Uint(b)) => a == b,
            (Arg::Float32(a), Arg::Float32(b)) => a.to_bits() == b.to_bits(),
            (Arg::Float64(a), Arg::Float64(b)) => a.to_bits() == b.to_bits(),
            (Arg::Bool(a), Arg::Bool(b)) => a == b,
            (
                Arg::Lex {
                    value: a,
                    inclusive: ai,
                },
                Arg::Lex {
                    value: b,
                    inclusive: bi,
                },
            ) => a == b && ai == bi,
            (
                Arg::Score {
                    value: a,
                    inclusive: ai,
                },
                Arg::Score {
                    value: b,
                    inclusive: bi,
                },
            ) => a.to_bits() == b.to_bits() && ai == bi,
            _ => false,
        }
    }
}

impl Eq for Arg {}

impl Hash for Arg {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u8(self.discriminant());
        match self {
            Arg::Key(s) | Arg::Str(s) => s.hash(state),
            Arg::Int(n) => n.hash(state),
            Arg::Uint(n) => n.hash(state),
            Arg::Float32(f) => f.to_bits().hash(state),
            Arg::Float64(f) => f.to_bits().hash(state),
            Arg::Bool(b) => b.hash(state),
            Arg::Lex { value, inclusive } => {
                value.hash(state);
                inclusive.hash(state);
            }
            Arg::Score { value, inclusive } => {
                value.to_bits().hash(state);
                inclusive.hash(state);
            }
        }
    }
}

/// An argument list builder.
///
/// The builder is an append-only buffer that higher constructs reuse
/// between commands to avoid reallocating argument storage.
#[derive(Debug, Default)]
pub struct ArgBuilder {
    args: Vec<Arg>,
}

impl ArgBuilder {
    /// Creates an empty builder.
    pub fn new() -> ArgBuilder {
        ArgBuilder::default()
    }

    /// Adds a key argument.
    pub fn key(&mut self, key: impl Into<String>) {
        self.args.push(Arg::Key(key.into()));
    }

    /// Adds multiple key arguments.
    pub fn keys<I>(&mut self, keys: I)
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        for key in keys {
            self.key(key);
        }
    }

    /// Adds a key-value pair.
    pub fn kv(&mut self, key: impl Into<String>, arg: Arg) {
        self.args.push(Arg::Key(key.into()));
        self.args.push(arg);
    }

    /// Adds a field-value pair.
    pub fn field(&mut self, name: impl Into<String>, value: Arg) {
        self.args.push(Arg::Str(name.into()));
        self.args.push(value);
    }

    /// Adds a string argument.
    pub fn string(&mut self, s: impl Into<String>) {
        self.args.push(Arg::Str(s.into()));
    }

    /// Adds multiple string arguments.
    pub fn strings<I>(&mut self, strs: I)
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        for s in strs {
            self.string(s);
        }
    }

    /// Adds an integer argument.
    pub fn int(&mut self, n: i64) {
        self.args.push(Arg::Int(n));
    }

    /// Adds a float argument.
    pub fn float(&mut self, f: f64) {
        self.args.push(Arg::Float64(f));
    }

    /// Adds a score range bound.
    pub fn score(&mut self, score: f64, inclusive: bool) {
        self.args.push(Arg::Score {
            value: score,
            inclusive,
        });
    }

    /// Adds a lex range bound.
    pub fn lex(&mut self, lex: impl Into<String>, inclusive: bool) {
        self.args.push(Arg::Lex {
            value: lex.into(),
            inclusive,
        });
    }

    /// Adds an optional `OPTION value` argument pair when the value is
    /// not empty.
    pub fn option(&mut self, option: &str, value: &str) {
        if !value.is_empty() {
            self.string(option);
            self.string(value);
        }
    }

    /// Adds an optional flag argument when `ok` is true.
    pub fn flag(&mut self, flag: &str, ok: bool) {
        if ok {
            self.string(flag);
        }
    }

    /// Adds a prebuilt argument.
    pub fn arg(&mut self, arg: Arg) {
        self.args.push(arg);
    }

    /// Adds multiple prebuilt arguments.
    pub fn append(&mut self, args: &[Arg]) {
        self.args.extend_from_slice(args);
    }

    /// Returns the number of arguments.
    pub fn len(&self) -> usize {
        self.args.len()
    }

    /// Checks if the builder is empty.
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Resets the builder to empty, retaining capacity.
    pub fn reset(&mut self) {
        self.args.clear();
    }

    /// Returns the accumulated arguments.
    pub fn args(&self) -> &[Arg] {
        &self.args
    }

    /// Takes the accumulated arguments out of the builder, leaving it
    /// empty.
    pub fn take_args(&mut self) -> Vec<Arg> {
        std::mem::take(&mut self.args)
    }
}

/// Builds an argument slice where the first argument is a key and the
/// rest are plain strings.
pub fn quick_args<I>(key: &str, args: I) -> Vec<Arg>
where
    I: IntoIterator,
    I::Item: Into<String>,
{
    let mut out = Vec::new();
    if !key.is_empty() {
        out.push(Arg::Key(key.to_string()));
    }
    for arg in args {
        out.push(Arg::Str(arg.into()));
    }
    out
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn args_compare_by_value() {
        assert_eq!(Arg::key("a"), Arg::key("a"));
        assert_ne!(Arg::key("a"), Arg::string("a"));
        assert_eq!(Arg::Float64(1.5), Arg::Float64(1.5));
        assert_ne!(Arg::Float64(0.0), Arg::Float64(-0.0));
        assert_eq!(Arg::Float64(f64::NAN), Arg::Float64(f64::NAN));
        assert_eq!(Arg::lex("m", true), Arg::lex("m", true));
        assert_ne!(Arg::lex("m", true), Arg::lex("m", false));
    }

    #[test]
    fn args_work_as_cache_keys() {
        let mut cache: HashMap<Arg, String> = HashMap::new();
        cache.insert(Arg::string("return 1"), "digest".to_string());
        assert_eq!(cache.get(&Arg::string("return 1")).unwrap(), "digest");
        assert!(cache.get(&Arg::key("return 1")).is_none());
    }

    #[test]
    fn builder_accumulates_typed_arguments() {
        let mut args = ArgBuilder::new();
        args.key("k");
        args.kv("field", Arg::Int(1));
        args.option("MATCH", "x*");
        args.option("COUNT", "");
        args.flag("WITHSCORES", true);
        args.flag("NX", false);
        args.score(2.5, false);
        assert_eq!(args.len(), 7);
        assert_eq!(
            args.args(),
            &[
                Arg::key("k"),
                Arg::key("field"),
                Arg::Int(1),
                Arg::string("MATCH"),
                Arg::string("x*"),
                Arg::string("WITHSCORES"),
                Arg::score(2.5, false),
            ]
        );
        args.reset();
        assert!(args.is_empty());
    }

    #[test]
    fn quick_args_marks_the_leading_key() {
        let args = quick_args("key", vec!["a", "b"]);
        assert_eq!(
            args,
            vec![Arg::key("key"), Arg::string("a"), Arg::string("b")]
        );
        let args = quick_args("", vec!["a"]);
        assert_eq!(args, vec![Arg::string("a")]);
    }

    #[test]
    fn durations_convert_to_integer_arguments() {
        assert_eq!(
            Arg::milliseconds(Duration::from_millis(1500)),
            Arg::Int(1500)
        );
        assert_eq!(Arg::seconds(Duration::from_secs(9)), Arg::Int(9));
    }
}
