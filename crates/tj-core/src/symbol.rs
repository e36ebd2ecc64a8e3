//! Interned, namespaced identifiers for node kinds and attribute names.
//!
//! A [`Symbol`] is a `u32` handle into a process-wide interner. Builtin
//! symbols occupy fixed slots so they can be used as constants (see the
//! [`prim`], [`aten`], [`attr`] and [`namespaces`] modules).

use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::{OnceLock, PoisonError, RwLock};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymbolError {
    MissingNamespace { input: String },
    EmptyComponent { input: String },
}

impl fmt::Display for SymbolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingNamespace { input } => {
                write!(f, "'{input}' is not a qualified symbol (expected ns::name)")
            }
            Self::EmptyComponent { input } => {
                write!(f, "'{input}' has an empty namespace or name")
            }
        }
    }
}

impl std::error::Error for SymbolError {}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(u32);

const BUILTINS: &[(&str, &str)] = &[
    ("namespaces", "prim"),
    ("namespaces", "aten"),
    ("namespaces", "attr"),
    ("namespaces", "onnx"),
    ("namespaces", "scope"),
    ("namespaces", "user"),
    ("namespaces", "namespaces"),
    ("prim", "Param"),
    ("prim", "Return"),
    ("prim", "Constant"),
    ("prim", "If"),
    ("prim", "Loop"),
    ("prim", "GradOf"),
    ("prim", "AutogradAdd"),
    ("prim", "Undefined"),
    ("prim", "AnyDefined"),
    ("prim", "Reverse"),
    ("prim", "DifferentiableGraph"),
    ("prim", "TupleConstruct"),
    ("aten", "add"),
    ("aten", "sub"),
    ("aten", "mul"),
    ("aten", "div"),
    ("aten", "neg"),
    ("aten", "exp"),
    ("aten", "sigmoid"),
    ("aten", "tanh"),
    ("aten", "relu"),
    ("aten", "mm"),
    ("aten", "t"),
    ("aten", "lt"),
    ("aten", "gt"),
    ("aten", "eq"),
    ("aten", "threshold_backward"),
    ("aten", "sigmoid_backward"),
    ("aten", "tanh_backward"),
    ("aten", "_grad_sum_to_size"),
    ("aten", "chunk"),
    ("attr", "value"),
    ("attr", "alpha"),
    ("attr", "Subgraph"),
    ("attr", "name"),
    ("attr", "size"),
    ("attr", "chunks"),
    ("attr", "dim"),
];

const fn str_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    let mut i = 0;
    while i < a.len() {
        if a[i] != b[i] {
            return false;
        }
        i += 1;
    }
    true
}

const fn builtin(ns: &str, name: &str) -> Symbol {
    let mut i = 0;
    while i < BUILTINS.len() {
        let (entry_ns, entry_name) = BUILTINS[i];
        if str_eq(entry_ns, ns) && str_eq(entry_name, name) {
            return Symbol(i as u32);
        }
        i += 1;
    }
    panic!("not a builtin symbol");
}

pub mod namespaces {
    use super::{Symbol, builtin};

    pub const PRIM: Symbol = builtin("namespaces", "prim");
    pub const ATEN: Symbol = builtin("namespaces", "aten");
    pub const ATTR: Symbol = builtin("namespaces", "attr");
    pub const ONNX: Symbol = builtin("namespaces", "onnx");
    pub const SCOPE: Symbol = builtin("namespaces", "scope");
    pub const USER: Symbol = builtin("namespaces", "user");
    pub const NAMESPACES: Symbol = builtin("namespaces", "namespaces");
}

pub mod prim {
    use super::{Symbol, builtin};

    pub const PARAM: Symbol = builtin("prim", "Param");
    pub const RETURN: Symbol = builtin("prim", "Return");
    pub const CONSTANT: Symbol = builtin("prim", "Constant");
    pub const IF: Symbol = builtin("prim", "If");
    pub const LOOP: Symbol = builtin("prim", "Loop");
    pub const GRAD_OF: Symbol = builtin("prim", "GradOf");
    pub const AUTOGRAD_ADD: Symbol = builtin("prim", "AutogradAdd");
    pub const UNDEFINED: Symbol = builtin("prim", "Undefined");
    pub const ANY_DEFINED: Symbol = builtin("prim", "AnyDefined");
    pub const REVERSE: Symbol = builtin("prim", "Reverse");
    pub const DIFFERENTIABLE_GRAPH: Symbol = builtin("prim", "DifferentiableGraph");
    pub const TUPLE_CONSTRUCT: Symbol = builtin("prim", "TupleConstruct");
}

pub mod aten {
    use super::{Symbol, builtin};

    pub const ADD: Symbol = builtin("aten", "add");
    pub const SUB: Symbol = builtin("aten", "sub");
    pub const MUL: Symbol = builtin("aten", "mul");
    pub const DIV: Symbol = builtin("aten", "div");
    pub const NEG: Symbol = builtin("aten", "neg");
    pub const EXP: Symbol = builtin("aten", "exp");
    pub const SIGMOID: Symbol = builtin("aten", "sigmoid");
    pub const TANH: Symbol = builtin("aten", "tanh");
    pub const RELU: Symbol = builtin("aten", "relu");
    pub const MM: Symbol = builtin("aten", "mm");
    pub const T: Symbol = builtin("aten", "t");
    pub const LT: Symbol = builtin("aten", "lt");
    pub const GT: Symbol = builtin("aten", "gt");
    pub const EQ: Symbol = builtin("aten", "eq");
    pub const THRESHOLD_BACKWARD: Symbol = builtin("aten", "threshold_backward");
    pub const SIGMOID_BACKWARD: Symbol = builtin("aten", "sigmoid_backward");
    pub const TANH_BACKWARD: Symbol = builtin("aten", "tanh_backward");
    pub const GRAD_SUM_TO_SIZE: Symbol = builtin("aten", "_grad_sum_to_size");
    pub const CHUNK: Symbol = builtin("aten", "chunk");
}

pub mod attr {
    use super::{Symbol, builtin};

    pub const VALUE: Symbol = builtin("attr", "value");
    pub const ALPHA: Symbol = builtin("attr", "alpha");
    pub const SUBGRAPH: Symbol = builtin("attr", "Subgraph");
    pub const NAME: Symbol = builtin("attr", "name");
    pub const SIZE: Symbol = builtin("attr", "size");
    pub const CHUNKS: Symbol = builtin("attr", "chunks");
    pub const DIM: Symbol = builtin("attr", "dim");
}

struct Entry {
    qual: &'static str,
    split: usize,
}

struct Interner {
    entries: Vec<Entry>,
    lookup: FxHashMap<&'static str, u32>,
}

impl Interner {
    fn seeded() -> Self {
        let mut interner = Self {
            entries: Vec::with_capacity(BUILTINS.len() * 2),
            lookup: FxHashMap::default(),
        };
        for (ns, name) in BUILTINS {
            interner.intern(ns, name);
        }
        interner
    }

    fn intern(&mut self, ns: &str, name: &str) -> Symbol {
        let qual = format!("{ns}::{name}");
        if let Some(&id) = self.lookup.get(qual.as_str()) {
            return Symbol(id);
        }
        let qual: &'static str = Box::leak(qual.into_boxed_str());
        let id = u32::try_from(self.entries.len()).unwrap_or(u32::MAX);
        self.entries.push(Entry {
            qual,
            split: ns.len(),
        });
        self.lookup.insert(qual, id);
        Symbol(id)
    }
}

fn interner() -> &'static RwLock<Interner> {
    static INTERNER: OnceLock<RwLock<Interner>> = OnceLock::new();
    INTERNER.get_or_init(|| RwLock::new(Interner::seeded()))
}

impl Symbol {
    /// Parses `ns::name`. The namespace and name must both be non-empty.
    pub fn from_qual_string(qual: &str) -> Result<Self, SymbolError> {
        let Some((ns, name)) = qual.split_once("::") else {
            return Err(SymbolError::MissingNamespace {
                input: qual.to_owned(),
            });
        };
        if ns.is_empty() || name.is_empty() {
            return Err(SymbolError::EmptyComponent {
                input: qual.to_owned(),
            });
        }
        Ok(Self::from_domain_and_unqual(ns, name))
    }

    #[must_use]
    pub fn from_domain_and_unqual(ns: &str, name: &str) -> Self {
        {
            let guard = interner().read().unwrap_or_else(PoisonError::into_inner);
            if let Some(&id) = guard.lookup.get(format!("{ns}::{name}").as_str()) {
                return Self(id);
            }
        }
        interner()
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .intern(ns, name)
    }

    #[must_use]
    pub fn prim(name: &str) -> Self {
        Self::from_domain_and_unqual("prim", name)
    }

    #[must_use]
    pub fn aten(name: &str) -> Self {
        Self::from_domain_and_unqual("aten", name)
    }

    #[must_use]
    pub fn attr(name: &str) -> Self {
        Self::from_domain_and_unqual("attr", name)
    }

    #[must_use]
    pub fn to_qual_string(self) -> &'static str {
        self.entry().0
    }

    #[must_use]
    pub fn to_unqual_string(self) -> &'static str {
        let (qual, split) = self.entry();
        &qual[split + 2..]
    }

    #[must_use]
    pub fn domain_string(self) -> &'static str {
        let (qual, split) = self.entry();
        &qual[..split]
    }

    /// The `namespaces::<ns>` symbol for this symbol's namespace.
    #[must_use]
    pub fn ns(self) -> Symbol {
        Self::from_domain_and_unqual("namespaces", self.domain_string())
    }

    #[must_use]
    pub fn is_prim(self) -> bool {
        self.domain_string() == "prim"
    }

    #[must_use]
    pub fn is_aten(self) -> bool {
        self.domain_string() == "aten"
    }

    #[must_use]
    pub fn is_attr(self) -> bool {
        self.domain_string() == "attr"
    }

    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    fn entry(self) -> (&'static str, usize) {
        let guard = interner().read().unwrap_or_else(PoisonError::into_inner);
        match guard.entries.get(self.0 as usize) {
            Some(entry) => (entry.qual, entry.split),
            None => ("<unknown>::<unknown>", "<unknown>".len()),
        }
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_qual_string())
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Symbol({})", self.to_qual_string())
    }
}
