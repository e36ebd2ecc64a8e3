use crate::schema::{Argument, FunctionSchema, SchemaType};
use crate::{OpError, Operation, RegistrationError, Stack, pop_operands};
use rustc_hash::FxHashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tj_core::{Graph, IValue, NodeId, Symbol, Tensor, Type};

/// Values that cross the operator boundary as a single stack slot.
pub trait OpValue: Sized {
    fn schema_type() -> SchemaType;
    fn from_ivalue(value: IValue) -> Result<Self, IValue>;
    fn into_ivalue(self) -> IValue;
}

macro_rules! op_value {
    ($ty:ty, $schema:ident, $variant:ident) => {
        impl OpValue for $ty {
            fn schema_type() -> SchemaType {
                SchemaType::$schema
            }

            fn from_ivalue(value: IValue) -> Result<Self, IValue> {
                match value {
                    IValue::$variant(inner) => Ok(inner),
                    other => Err(other),
                }
            }

            fn into_ivalue(self) -> IValue {
                IValue::$variant(self)
            }
        }

        impl OpReturn for $ty {
            fn schema_types() -> Vec<SchemaType> {
                vec![SchemaType::$schema]
            }

            fn push_to(self, stack: &mut Stack) -> Result<(), OpError> {
                stack.push(IValue::$variant(self));
                Ok(())
            }
        }
    };
}

/// What an operator implementation may return: one value, a tuple of
/// values, or a `Result` of either.
pub trait OpReturn {
    fn schema_types() -> Vec<SchemaType>;
    fn push_to(self, stack: &mut Stack) -> Result<(), OpError>;
}

op_value!(Tensor, Tensor, Tensor);
op_value!(f64, Float, Double);
op_value!(i64, Int, Int);
op_value!(bool, Bool, Bool);
op_value!(Vec<i64>, IntList, IntList);
op_value!(Vec<f64>, FloatList, DoubleList);
op_value!(Vec<Tensor>, TensorList, TensorList);

impl OpReturn for () {
    fn schema_types() -> Vec<SchemaType> {
        Vec::new()
    }

    fn push_to(self, _stack: &mut Stack) -> Result<(), OpError> {
        Ok(())
    }
}

impl<A: OpValue, B: OpValue> OpReturn for (A, B) {
    fn schema_types() -> Vec<SchemaType> {
        vec![A::schema_type(), B::schema_type()]
    }

    fn push_to(self, stack: &mut Stack) -> Result<(), OpError> {
        stack.push(self.0.into_ivalue());
        stack.push(self.1.into_ivalue());
        Ok(())
    }
}

impl<A: OpValue, B: OpValue, C: OpValue> OpReturn for (A, B, C) {
    fn schema_types() -> Vec<SchemaType> {
        vec![A::schema_type(), B::schema_type(), C::schema_type()]
    }

    fn push_to(self, stack: &mut Stack) -> Result<(), OpError> {
        stack.push(self.0.into_ivalue());
        stack.push(self.1.into_ivalue());
        stack.push(self.2.into_ivalue());
        Ok(())
    }
}

impl<R: OpReturn> OpReturn for Result<R, OpError> {
    fn schema_types() -> Vec<SchemaType> {
        R::schema_types()
    }

    fn push_to(self, stack: &mut Stack) -> Result<(), OpError> {
        self?.push_to(stack)
    }
}

/// Rust callables usable as operator implementations. `Marker` is the
/// callable's `fn` signature and only serves to select the impl.
pub trait IntoOperation<Marker> {
    fn argument_types() -> Vec<SchemaType>;
    fn return_types() -> Vec<SchemaType>;
    fn into_operation(self, name: Symbol) -> Operation;
}

fn convert<T: OpValue>(name: Symbol, index: usize, value: IValue) -> Result<T, OpError> {
    T::from_ivalue(value).map_err(|value| OpError::ArgumentType {
        op: name,
        index,
        expected: T::schema_type(),
        actual: value.kind(),
    })
}

macro_rules! into_operation {
    ($count:literal $(, $arg:ident $var:ident $idx:literal)*) => {
        impl<F, R, $($arg,)*> IntoOperation<fn($($arg,)*) -> R> for F
        where
            F: Fn($($arg),*) -> R + Send + Sync + 'static,
            R: OpReturn,
            $($arg: OpValue,)*
        {
            fn argument_types() -> Vec<SchemaType> {
                vec![$($arg::schema_type()),*]
            }

            fn return_types() -> Vec<SchemaType> {
                R::schema_types()
            }

            #[allow(unused_mut, unused_variables)]
            fn into_operation(self, name: Symbol) -> Operation {
                Arc::new(move |stack: &mut Stack| {
                    let operands = pop_operands(stack, name, $count)?;
                    let mut operands = operands.into_iter();
                    $(
                        let $var: $arg = convert(
                            name,
                            $idx,
                            operands.next().unwrap_or_default(),
                        )?;
                    )*
                    (self)($($var),*).push_to(stack)
                })
            }
        }
    };
}

into_operation!(0);
into_operation!(1, A0 a0 0);
into_operation!(2, A0 a0 0, A1 a1 1);
into_operation!(3, A0 a0 0, A1 a1 1, A2 a2 2);
into_operation!(4, A0 a0 0, A1 a1 1, A2 a2 2, A3 a3 3);

pub struct Operator {
    schema: FunctionSchema,
    operation: Operation,
}

impl std::fmt::Debug for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operator")
            .field("schema", &self.schema.to_string())
            .finish_non_exhaustive()
    }
}

impl Operator {
    /// Wraps a raw stack operation. The operation must honor `schema`.
    #[must_use]
    pub fn from_raw(schema: FunctionSchema, operation: Operation) -> Self {
        Self { schema, operation }
    }

    #[must_use]
    pub fn schema(&self) -> &FunctionSchema {
        &self.schema
    }

    #[must_use]
    pub fn operation(&self) -> Operation {
        Arc::clone(&self.operation)
    }
}

/// Builds an operator from a typed Rust callable.
///
/// `schema_or_name` is either a bare qualified name (`foo::bar`), in which
/// case the schema is inferred from the callable, or a full schema string,
/// which must agree with the inferred argument and return types.
pub fn create_operator<M, F>(
    schema_or_name: &str,
    implementation: F,
) -> Result<Operator, RegistrationError>
where
    F: IntoOperation<M>,
{
    let inferred_args = F::argument_types();
    let inferred_returns = F::return_types();
    let schema = if schema_or_name.contains('(') {
        let declared = FunctionSchema::parse(schema_or_name)?;
        check_against(&declared, &inferred_args, &inferred_returns)?;
        declared
    } else {
        let name = Symbol::from_qual_string(schema_or_name.trim())
            .map_err(|err| RegistrationError::Schema(err.into()))?;
        let name_slots = |types: Vec<SchemaType>| {
            types
                .into_iter()
                .enumerate()
                .map(|(idx, ty)| Argument {
                    name: format!("_{idx}"),
                    ty,
                })
                .collect()
        };
        FunctionSchema::new(name, name_slots(inferred_args), name_slots(inferred_returns))
    };
    let operation = implementation.into_operation(schema.name);
    Ok(Operator { schema, operation })
}

fn check_against(
    declared: &FunctionSchema,
    inferred_args: &[SchemaType],
    inferred_returns: &[SchemaType],
) -> Result<(), RegistrationError> {
    let name = declared.name;
    if declared.arguments.len() != inferred_args.len() {
        return Err(RegistrationError::ArgumentCount {
            name,
            inferred: inferred_args.len(),
            declared: declared.arguments.len(),
        });
    }
    for (index, (arg, inferred)) in declared.arguments.iter().zip(inferred_args).enumerate() {
        if &arg.ty != inferred {
            return Err(RegistrationError::ArgumentType {
                name,
                index,
                inferred: inferred.clone(),
                declared: arg.ty.clone(),
            });
        }
    }
    if declared.returns.len() != inferred_returns.len() {
        return Err(RegistrationError::ReturnCount {
            name,
            inferred: inferred_returns.len(),
            declared: declared.returns.len(),
        });
    }
    for (index, (ret, inferred)) in declared.returns.iter().zip(inferred_returns).enumerate() {
        if &ret.ty != inferred {
            return Err(RegistrationError::ReturnType {
                name,
                index,
                inferred: inferred.clone(),
                declared: ret.ty.clone(),
            });
        }
    }
    Ok(())
}

/// What a node lowering sees when the interpreter flattens a node.
pub struct NodeLoweringContext<'a> {
    pub graph: &'a Graph,
    pub node: NodeId,
    pub registry: &'a Arc<OperatorRegistry>,
}

/// Produces the operation for a node whose behavior depends on the node
/// itself (its attributes, arity or subgraph) rather than on a fixed schema.
pub type NodeLowering =
    Arc<dyn Fn(&NodeLoweringContext<'_>) -> Result<Operation, OpError> + Send + Sync>;

/// Overloads keyed by node kind, plus node lowerings. Safe to share across
/// threads; registration takes a write lock.
#[derive(Default)]
pub struct OperatorRegistry {
    operators: RwLock<FxHashMap<Symbol, Vec<Arc<Operator>>>>,
    lowerings: RwLock<FxHashMap<Symbol, NodeLowering>>,
}

impl std::fmt::Debug for OperatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let operators = self.operators.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("OperatorRegistry")
            .field("kinds", &operators.len())
            .finish_non_exhaustive()
    }
}

impl OperatorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-populated with the builtin kernels and prim lowerings.
    pub fn with_builtins() -> Result<Self, RegistrationError> {
        let registry = Self::new();
        crate::builtins::register_builtin_operators(&registry)?;
        Ok(registry)
    }

    pub fn register(&self, operator: Operator) -> Result<(), RegistrationError> {
        let mut operators = self.operators.write().unwrap_or_else(PoisonError::into_inner);
        let overloads = operators.entry(operator.schema.name).or_default();
        if overloads.iter().any(|existing| {
            existing.schema.argument_types() == operator.schema.argument_types()
        }) {
            return Err(RegistrationError::DuplicateOverload {
                schema: operator.schema.to_string(),
            });
        }
        log::debug!("registered operator {}", operator.schema);
        overloads.push(Arc::new(operator));
        Ok(())
    }

    pub fn register_lowering(&self, kind: Symbol, lowering: NodeLowering) {
        self.lowerings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, lowering);
    }

    #[must_use]
    pub fn lowering(&self, kind: Symbol) -> Option<NodeLowering> {
        self.lowerings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
    }

    #[must_use]
    pub fn overloads(&self, kind: Symbol) -> Vec<Arc<Operator>> {
        self.operators
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
            .unwrap_or_default()
    }

    #[must_use]
    pub fn has_operator(&self, kind: Symbol) -> bool {
        !self.overloads(kind).is_empty() || self.lowering(kind).is_some()
    }

    /// Picks the overload of `kind` for arguments of static types
    /// `arg_types`. When static types leave more than one candidate, the
    /// returned operation selects among them from the runtime operands.
    pub fn resolve(&self, kind: Symbol, arg_types: &[Type]) -> Result<Operation, OpError> {
        let overloads = self.overloads(kind);
        if overloads.is_empty() {
            return Err(OpError::NoOperator { kind });
        }
        let candidates: Vec<Arc<Operator>> = overloads
            .into_iter()
            .filter(|op| op.schema.admits(arg_types))
            .collect();
        match candidates.as_slice() {
            [] => Err(OpError::NoMatchingOverload {
                kind,
                detail: format!(
                    "static argument types ({})",
                    arg_types
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            }),
            [single] => Ok(single.operation()),
            _ => {
                let arity = arg_types.len();
                Ok(Arc::new(move |stack: &mut Stack| {
                    let start = stack.len().checked_sub(arity).ok_or(OpError::StackUnderflow {
                        op: kind,
                        needed: arity,
                        available: stack.len(),
                    })?;
                    let chosen = candidates
                        .iter()
                        .find(|op| op.schema.accepts(&stack[start..]))
                        .ok_or_else(|| OpError::NoMatchingOverload {
                            kind,
                            detail: format!(
                                "runtime operands ({})",
                                stack[start..]
                                    .iter()
                                    .map(|v| format!("{:?}", v.kind()))
                                    .collect::<Vec<_>>()
                                    .join(", ")
                            ),
                        })?;
                    (chosen.operation)(stack)
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{OperatorRegistry, create_operator};
    use crate::schema::SchemaType;
    use crate::{OpError, RegistrationError, Stack};
    use tj_core::{IValue, Symbol, Tensor, Type};

    #[test]
    fn schema_is_inferred_from_the_callable() {
        let op = create_operator("foo::scale", |a: Tensor, b: f64| -> Result<Tensor, OpError> {
            let data = a.to_vec().map_err(|source| OpError::Tensor {
                op: Symbol::from_domain_and_unqual("foo", "scale"),
                source,
            })?;
            a.with_data(data.iter().map(|x| x * b).collect(), a.sizes())
                .map_err(|source| OpError::Tensor {
                    op: Symbol::from_domain_and_unqual("foo", "scale"),
                    source,
                })
        })
        .expect("inferred schema");
        assert_eq!(
            op.schema().argument_types(),
            vec![SchemaType::Tensor, SchemaType::Float]
        );
        assert_eq!(op.schema().return_types(), vec![SchemaType::Tensor]);

        let mut stack: Stack = vec![
            IValue::Tensor(Tensor::from_vec(vec![1.0, 2.0], &[2]).expect("tensor")),
            IValue::Double(3.0),
        ];
        (op.operation())(&mut stack).expect("runs");
        assert_eq!(stack.len(), 1);
        let out = stack[0].to_tensor().expect("tensor").to_vec().expect("data");
        assert_eq!(out, vec![3.0, 6.0]);
    }

    #[test]
    fn declared_schema_must_agree_with_the_callable() {
        let ok = create_operator("foo::bar(float a, Tensor b) -> Tensor", |_: f64, b: Tensor| b);
        assert!(ok.is_ok());

        let count = create_operator("foo::bar(float a) -> Tensor", |_: f64, b: Tensor| b);
        let err = count.expect_err("arity differs");
        assert!(matches!(
            err,
            RegistrationError::ArgumentCount {
                inferred: 2,
                declared: 1,
                ..
            }
        ));
        assert!(
            err.to_string()
                .contains("inferred 2 argument(s) for operator implementation")
        );

        let ty = create_operator("foo::bar(int a, Tensor b) -> Tensor", |_: f64, b: Tensor| b);
        let err = ty.expect_err("type differs");
        assert!(
            err.to_string().contains(
                "inferred type for argument #0 was float, \
                 but the provided schema specified type int"
            )
        );

        let ret = create_operator(
            "foo::bar(float a, Tensor b) -> (Tensor, Tensor)",
            |_: f64, b: Tensor| b,
        );
        assert!(matches!(ret, Err(RegistrationError::ReturnCount { .. })));
    }

    #[test]
    fn list_arguments_and_tuple_returns() {
        let op = create_operator(
            "foo::split(int[] xs, Tensor[] ts) -> (int, int)",
            |xs: Vec<i64>, ts: Vec<Tensor>| (xs.iter().sum::<i64>(), ts.len() as i64),
        )
        .expect("lists");
        let mut stack: Stack = vec![
            IValue::IntList(vec![1, 2, 3]),
            IValue::TensorList(vec![Tensor::scalar(1.0)]),
        ];
        (op.operation())(&mut stack).expect("runs");
        assert_eq!(stack, vec![IValue::Int(6), IValue::Int(1)]);
    }

    #[test]
    fn wrong_runtime_operand_is_reported() {
        let op = create_operator("foo::neg", |a: i64| -a).expect("op");
        let mut stack: Stack = vec![IValue::Double(1.0)];
        assert!(matches!(
            (op.operation())(&mut stack),
            Err(OpError::ArgumentType { index: 0, .. })
        ));
        let mut empty: Stack = Vec::new();
        assert!(matches!(
            (op.operation())(&mut empty),
            Err(OpError::StackUnderflow { .. })
        ));
    }

    #[test]
    fn resolution_defers_to_runtime_when_ambiguous() {
        let registry = OperatorRegistry::with_builtins().expect("builtins");
        let add = Symbol::aten("add");
        let op = registry
            .resolve(add, &[Type::Dynamic, Type::Dynamic])
            .expect("ambiguous but resolvable");
        let mut stack: Stack = vec![IValue::Int(2), IValue::Int(5)];
        op(&mut stack).expect("int overload");
        assert_eq!(stack, vec![IValue::Int(7)]);

        assert!(matches!(
            registry.resolve(add, &[Type::Bool, Type::Bool]),
            Err(OpError::NoMatchingOverload { .. })
        ));
        assert!(matches!(
            registry.resolve(Symbol::aten("no_such_op"), &[]),
            Err(OpError::NoOperator { .. })
        ));
    }

    #[test]
    fn duplicate_overloads_are_rejected() {
        let registry = OperatorRegistry::new();
        registry
            .register(create_operator("foo::id", |a: i64| a).expect("op"))
            .expect("first");
        assert!(matches!(
            registry.register(create_operator("foo::id", |a: i64| a + 1).expect("op")),
            Err(RegistrationError::DuplicateOverload { .. })
        ));
        registry
            .register(create_operator("foo::id", |a: f64| a).expect("op"))
            .expect("different argument types");
        assert_eq!(registry.overloads(Symbol::from_domain_and_unqual("foo", "id")).len(), 2);
    }
}
