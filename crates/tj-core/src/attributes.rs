//! Named, typed node attributes.

use crate::graph::Graph;
use crate::ivalue::Tensor;
use crate::symbol::Symbol;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeKind {
    F,
    Fs,
    I,
    Is,
    S,
    Ss,
    T,
    Ts,
    G,
    Gs,
}

impl AttributeKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::F => "f",
            Self::Fs => "fs",
            Self::I => "i",
            Self::Is => "is",
            Self::S => "s",
            Self::Ss => "ss",
            Self::T => "t",
            Self::Ts => "ts",
            Self::G => "g",
            Self::Gs => "gs",
        }
    }
}

#[derive(Debug, Clone)]
pub enum AttributeValue {
    F(f64),
    Fs(Vec<f64>),
    I(i64),
    Is(Vec<i64>),
    S(String),
    Ss(Vec<String>),
    T(Tensor),
    Ts(Vec<Tensor>),
    G(Arc<Graph>),
    Gs(Vec<Arc<Graph>>),
}

impl AttributeValue {
    #[must_use]
    pub fn kind(&self) -> AttributeKind {
        match self {
            Self::F(_) => AttributeKind::F,
            Self::Fs(_) => AttributeKind::Fs,
            Self::I(_) => AttributeKind::I,
            Self::Is(_) => AttributeKind::Is,
            Self::S(_) => AttributeKind::S,
            Self::Ss(_) => AttributeKind::Ss,
            Self::T(_) => AttributeKind::T,
            Self::Ts(_) => AttributeKind::Ts,
            Self::G(_) => AttributeKind::G,
            Self::Gs(_) => AttributeKind::Gs,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::F(value) => write!(f, "{value}"),
            Self::Fs(values) => write!(f, "{values:?}"),
            Self::I(value) => write!(f, "{value}"),
            Self::Is(values) => write!(f, "{values:?}"),
            Self::S(value) => write!(f, "\"{value}\""),
            Self::Ss(values) => write!(f, "{values:?}"),
            Self::T(tensor) => write!(f, "<Tensor{:?}>", tensor.sizes()),
            Self::Ts(values) => write!(f, "<{} tensors>", values.len()),
            Self::G(_) => f.write_str("<Graph>"),
            Self::Gs(values) => write!(f, "<{} graphs>", values.len()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeError {
    Missing {
        name: Symbol,
    },
    KindMismatch {
        name: Symbol,
        expected: AttributeKind,
        actual: AttributeKind,
    },
}

impl fmt::Display for AttributeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing { name } => write!(f, "required attribute {name} not found"),
            Self::KindMismatch {
                name,
                expected,
                actual,
            } => write!(
                f,
                "attribute {name} has kind {}, expected {}",
                actual.as_str(),
                expected.as_str()
            ),
        }
    }
}

impl std::error::Error for AttributeError {}

macro_rules! typed_accessors {
    ($($getter:ident, $setter:ident, $variant:ident, $ty:ty;)*) => {
        $(
            pub fn $getter(&self, name: Symbol) -> Result<&$ty, AttributeError> {
                match self.get(name) {
                    Some(AttributeValue::$variant(value)) => Ok(value),
                    Some(other) => Err(AttributeError::KindMismatch {
                        name,
                        expected: AttributeKind::$variant,
                        actual: other.kind(),
                    }),
                    None => Err(AttributeError::Missing { name }),
                }
            }

            pub fn $setter(&mut self, name: Symbol, value: $ty) -> &mut Self {
                self.set(name, AttributeValue::$variant(value));
                self
            }
        )*
    };
}

/// Attribute table of a node. Setting an existing name overwrites it,
/// including its kind.
#[derive(Debug, Clone, Default)]
pub struct Attributes {
    values: BTreeMap<Symbol, AttributeValue>,
}

impl Attributes {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: Symbol, value: AttributeValue) {
        self.values.insert(name, value);
    }

    #[must_use]
    pub fn get(&self, name: Symbol) -> Option<&AttributeValue> {
        self.values.get(&name)
    }

    #[must_use]
    pub fn has(&self, name: Symbol) -> bool {
        self.values.contains_key(&name)
    }

    pub fn remove(&mut self, name: Symbol) -> Option<AttributeValue> {
        self.values.remove(&name)
    }

    #[must_use]
    pub fn kind_of(&self, name: Symbol) -> Option<AttributeKind> {
        self.get(name).map(AttributeValue::kind)
    }

    pub fn names(&self) -> impl Iterator<Item = Symbol> + '_ {
        self.values.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Symbol, &AttributeValue)> + '_ {
        self.values.iter().map(|(name, value)| (*name, value))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    typed_accessors! {
        f, f_, F, f64;
        fs, fs_, Fs, Vec<f64>;
        i, i_, I, i64;
        is, is_, Is, Vec<i64>;
        s, s_, S, String;
        ss, ss_, Ss, Vec<String>;
        t, t_, T, Tensor;
        ts, ts_, Ts, Vec<Tensor>;
        g, g_, G, Arc<Graph>;
        gs, gs_, Gs, Vec<Arc<Graph>>;
    }
}
