//! Operator signatures and their textual form
//! `ns::name(Tensor self, int other) -> Tensor`.

use std::fmt;
use tj_core::{IValue, Symbol, SymbolError, Type};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SchemaType {
    Tensor,
    Float,
    Int,
    Bool,
    IntList,
    FloatList,
    TensorList,
}

impl SchemaType {
    /// Whether a runtime value can be passed for this parameter.
    #[must_use]
    pub fn accepts(&self, value: &IValue) -> bool {
        matches!(
            (self, value),
            (Self::Tensor, IValue::Tensor(_))
                | (Self::Float, IValue::Double(_))
                | (Self::Int, IValue::Int(_))
                | (Self::Bool, IValue::Bool(_))
                | (Self::IntList, IValue::IntList(_))
                | (Self::FloatList, IValue::DoubleList(_))
                | (Self::TensorList, IValue::TensorList(_))
        )
    }

    /// Whether a statically typed value may flow into this parameter.
    /// `Dynamic` is compatible with everything.
    #[must_use]
    pub fn admits(&self, ty: &Type) -> bool {
        match (self, ty) {
            (_, Type::Dynamic) => true,
            (Self::Tensor, Type::Tensor(_)) => true,
            (Self::Float, Type::Float) | (Self::Int, Type::Int) | (Self::Bool, Type::Bool) => true,
            (Self::IntList, Type::List(elem)) => matches!(**elem, Type::Int | Type::Dynamic),
            (Self::FloatList, Type::List(elem)) => matches!(**elem, Type::Float | Type::Dynamic),
            (Self::TensorList, Type::List(elem)) => elem.is_tensor_like(),
            _ => false,
        }
    }

    /// Static type of a value produced for this return slot.
    #[must_use]
    pub fn to_type(&self) -> Type {
        match self {
            Self::Tensor => Type::Dynamic,
            Self::Float => Type::Float,
            Self::Int => Type::Int,
            Self::Bool => Type::Bool,
            Self::IntList => Type::List(Box::new(Type::Int)),
            Self::FloatList => Type::List(Box::new(Type::Float)),
            Self::TensorList => Type::List(Box::new(Type::Dynamic)),
        }
    }

    fn parse(text: &str) -> Option<Self> {
        Some(match text {
            "Tensor" => Self::Tensor,
            "float" => Self::Float,
            "int" => Self::Int,
            "bool" => Self::Bool,
            "int[]" => Self::IntList,
            "float[]" => Self::FloatList,
            "Tensor[]" => Self::TensorList,
            _ => return None,
        })
    }
}

impl fmt::Display for SchemaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tensor => "Tensor",
            Self::Float => "float",
            Self::Int => "int",
            Self::Bool => "bool",
            Self::IntList => "int[]",
            Self::FloatList => "float[]",
            Self::TensorList => "Tensor[]",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Argument {
    pub name: String,
    pub ty: SchemaType,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionSchema {
    pub name: Symbol,
    pub arguments: Vec<Argument>,
    pub returns: Vec<Argument>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaParseError {
    Name(SymbolError),
    MissingParenthesis { schema: String },
    UnknownType { schema: String, ty: String },
    MissingReturn { schema: String },
}

impl fmt::Display for SchemaParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(err) => write!(f, "bad operator name: {err}"),
            Self::MissingParenthesis { schema } => {
                write!(f, "schema '{schema}' has no balanced argument list")
            }
            Self::UnknownType { schema, ty } => {
                write!(f, "schema '{schema}' uses unknown type '{ty}'")
            }
            Self::MissingReturn { schema } => {
                write!(f, "schema '{schema}' has no '->' return clause")
            }
        }
    }
}

impl std::error::Error for SchemaParseError {}

impl From<SymbolError> for SchemaParseError {
    fn from(err: SymbolError) -> Self {
        Self::Name(err)
    }
}

impl FunctionSchema {
    #[must_use]
    pub fn new(name: Symbol, arguments: Vec<Argument>, returns: Vec<Argument>) -> Self {
        Self {
            name,
            arguments,
            returns,
        }
    }

    pub fn parse(schema: &str) -> Result<Self, SchemaParseError> {
        let schema = schema.trim();
        let missing_paren = || SchemaParseError::MissingParenthesis {
            schema: schema.to_owned(),
        };
        let open = schema.find('(').ok_or_else(missing_paren)?;
        let close = schema[open..]
            .find(')')
            .map(|i| open + i)
            .ok_or_else(missing_paren)?;
        let name = Symbol::from_qual_string(schema[..open].trim())?;
        let arguments = parse_arguments(schema, &schema[open + 1..close])?;

        let rest = schema[close + 1..].trim();
        let Some(ret) = rest.strip_prefix("->") else {
            return Err(SchemaParseError::MissingReturn {
                schema: schema.to_owned(),
            });
        };
        let ret = ret.trim();
        let returns = match ret.strip_prefix('(').and_then(|r| r.strip_suffix(')')) {
            Some(inner) => parse_arguments(schema, inner)?,
            None => parse_arguments(schema, ret)?,
        };
        Ok(Self {
            name,
            arguments,
            returns,
        })
    }

    #[must_use]
    pub fn argument_types(&self) -> Vec<SchemaType> {
        self.arguments.iter().map(|arg| arg.ty.clone()).collect()
    }

    #[must_use]
    pub fn return_types(&self) -> Vec<SchemaType> {
        self.returns.iter().map(|arg| arg.ty.clone()).collect()
    }

    /// Whether `values` (the top of a stack, in argument order) fit this schema.
    #[must_use]
    pub fn accepts(&self, values: &[IValue]) -> bool {
        values.len() == self.arguments.len()
            && self
                .arguments
                .iter()
                .zip(values)
                .all(|(arg, value)| arg.ty.accepts(value))
    }

    #[must_use]
    pub fn admits(&self, types: &[Type]) -> bool {
        types.len() == self.arguments.len()
            && self
                .arguments
                .iter()
                .zip(types)
                .all(|(arg, ty)| arg.ty.admits(ty))
    }
}

fn parse_arguments(schema: &str, list: &str) -> Result<Vec<Argument>, SchemaParseError> {
    list.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .enumerate()
        .map(|(idx, part)| {
            let mut pieces = part.split_whitespace();
            let ty_text = pieces.next().unwrap_or_default();
            let ty = SchemaType::parse(ty_text).ok_or_else(|| SchemaParseError::UnknownType {
                schema: schema.to_owned(),
                ty: ty_text.to_owned(),
            })?;
            let name = pieces
                .next()
                .map_or_else(|| format!("_{idx}"), str::to_owned);
            Ok(Argument { name, ty })
        })
        .collect()
}

fn write_arguments(f: &mut fmt::Formatter<'_>, args: &[Argument]) -> fmt::Result {
    for (idx, arg) in args.iter().enumerate() {
        if idx > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{} {}", arg.ty, arg.name)?;
    }
    Ok(())
}

impl fmt::Display for FunctionSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        write_arguments(f, &self.arguments)?;
        f.write_str(") -> ")?;
        if let [single] = self.returns.as_slice() {
            write!(f, "{}", single.ty)
        } else {
            f.write_str("(")?;
            for (idx, ret) in self.returns.iter().enumerate() {
                if idx > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{}", ret.ty)?;
            }
            f.write_str(")")
        }
    }
}
