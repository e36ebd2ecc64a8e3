use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::Arc;
use tj_core::{Graph, IValue, IrError, Symbol, SymbolicVariable, Type, aten};

/// What a backward rule sees: the forward node's inputs and outputs and the
/// incoming gradient for each output.
#[derive(Debug, Clone)]
pub struct BackwardArgs {
    pub inputs: Vec<SymbolicVariable>,
    pub outputs: Vec<SymbolicVariable>,
    pub grads: Vec<SymbolicVariable>,
}

impl BackwardArgs {
    fn input(&self, index: usize) -> SymbolicVariable {
        self.inputs[index]
    }

    fn output(&self) -> SymbolicVariable {
        self.outputs[0]
    }

    fn grad(&self) -> SymbolicVariable {
        self.grads[0]
    }

    /// Reduces `grad` to the sizes of input `index`, which the forward node
    /// may have broadcast. With complete static sizes the reduction is only
    /// emitted when they differ and reads its target from a constant;
    /// otherwise it reads the sizes of the input at run time.
    pub fn sum_to_input(
        &self,
        g: &mut Graph,
        grad: SymbolicVariable,
        index: usize,
    ) -> Result<SymbolicVariable, IrError> {
        let input = self.input(index);
        let input_ty = g.ty(input.value()).clone();
        if !input_ty.requires_grad() {
            return Ok(grad);
        }
        let known = |ty: &Type| ty.as_tensor().and_then(|t| t.sizes.clone());
        let output_sizes = known(g.ty(self.output().value()));
        let reduced = match (known(&input_ty), output_sizes) {
            (Some(input_sizes), Some(output_sizes)) if input_sizes == output_sizes => {
                return Ok(grad);
            }
            (Some(input_sizes), Some(_)) => {
                let target = input_sizes
                    .iter()
                    .map(|&s| i64::try_from(s).unwrap_or(i64::MAX))
                    .collect();
                let target = g.insert_constant(&IValue::IntList(target))?;
                grad.grad_sum_to_size(g, target.into())?
            }
            _ => grad.grad_sum_to_size(g, input)?,
        };
        Ok(reduced.set_type(g, input_ty.with_requires_grad(false)))
    }
}

/// Emits the gradient of each forward input, in input order, at the graph's
/// current insert point. `None` marks an input with no gradient.
pub type BackwardRule = Arc<
    dyn Fn(&mut Graph, &BackwardArgs) -> Result<Vec<Option<SymbolicVariable>>, IrError>
        + Send
        + Sync,
>;

#[derive(Clone, Default)]
pub struct BackwardRegistry {
    rules: FxHashMap<Symbol, BackwardRule>,
}

impl fmt::Debug for BackwardRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<String> = self.rules.keys().map(ToString::to_string).collect();
        kinds.sort();
        f.debug_struct("BackwardRegistry").field("kinds", &kinds).finish()
    }
}

impl BackwardRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rules for the builtin differentiable `aten` operators.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_builtins();
        registry
    }

    /// Installs `rule` for `kind`, replacing any previous rule.
    pub fn register<F>(&mut self, kind: Symbol, rule: F)
    where
        F: Fn(&mut Graph, &BackwardArgs) -> Result<Vec<Option<SymbolicVariable>>, IrError>
            + Send
            + Sync
            + 'static,
    {
        self.rules.insert(kind, Arc::new(rule));
    }

    #[must_use]
    pub fn rule(&self, kind: Symbol) -> Option<BackwardRule> {
        self.rules.get(&kind).cloned()
    }

    #[must_use]
    pub fn has_rule(&self, kind: Symbol) -> bool {
        self.rules.contains_key(&kind)
    }

    fn register_builtins(&mut self) {
        self.register(aten::ADD, |g, args| {
            let grad = args.grad();
            Ok(vec![
                Some(args.sum_to_input(g, grad, 0)?),
                Some(args.sum_to_input(g, grad, 1)?),
            ])
        });
        self.register(aten::SUB, |g, args| {
            let grad = args.grad();
            let negated = grad.neg(g)?;
            Ok(vec![
                Some(args.sum_to_input(g, grad, 0)?),
                Some(args.sum_to_input(g, negated, 1)?),
            ])
        });
        self.register(aten::MUL, |g, args| {
            let grad = args.grad();
            let da = grad.mul(g, args.input(1))?;
            let db = grad.mul(g, args.input(0))?;
            Ok(vec![
                Some(args.sum_to_input(g, da, 0)?),
                Some(args.sum_to_input(g, db, 1)?),
            ])
        });
        self.register(aten::DIV, |g, args| {
            let (a, b, grad) = (args.input(0), args.input(1), args.grad());
            let da = grad.div(g, b)?;
            let numerator = grad.mul(g, a)?;
            let denominator = b.mul(g, b)?;
            let db = numerator.div(g, denominator)?.neg(g)?;
            Ok(vec![
                Some(args.sum_to_input(g, da, 0)?),
                Some(args.sum_to_input(g, db, 1)?),
            ])
        });
        self.register(aten::NEG, |g, args| Ok(vec![Some(args.grad().neg(g)?)]));
        self.register(aten::EXP, |g, args| {
            Ok(vec![Some(args.grad().mul(g, args.output())?)])
        });
        self.register(aten::SIGMOID, |g, args| {
            Ok(vec![Some(args.grad().sigmoid_backward(g, args.output())?)])
        });
        self.register(aten::TANH, |g, args| {
            Ok(vec![Some(args.grad().tanh_backward(g, args.output())?)])
        });
        self.register(aten::RELU, |g, args| {
            Ok(vec![Some(args.grad().threshold_backward(g, args.input(0))?)])
        });
        self.register(aten::T, |g, args| Ok(vec![Some(args.grad().t(g)?)]));
        self.register(aten::MM, |g, args| {
            let (a, b, grad) = (args.input(0), args.input(1), args.grad());
            let bt = b.t(g)?;
            let at = a.t(g)?;
            Ok(vec![Some(grad.mm(g, bt)?), Some(at.mm(g, grad)?)])
        });
    }
}

#[cfg(test)]
mod tests {
    use super::BackwardRegistry;
    use tj_core::{Symbol, aten};

    #[test]
    fn builtin_rules_cover_the_differentiable_set() {
        let registry = BackwardRegistry::with_builtins();
        for kind in [
            aten::ADD,
            aten::SUB,
            aten::MUL,
            aten::DIV,
            aten::NEG,
            aten::EXP,
            aten::SIGMOID,
            aten::TANH,
            aten::RELU,
            aten::T,
            aten::MM,
        ] {
            assert!(registry.has_rule(kind), "{kind}");
        }
        assert!(!registry.has_rule(aten::LT));
        assert!(!BackwardRegistry::new().has_rule(aten::ADD));
    }

    #[test]
    fn custom_rules_can_be_added() {
        let mut registry = BackwardRegistry::new();
        let square = Symbol::from_domain_and_unqual("user", "square");
        registry.register(square, |g, args| {
            let two_x = args.inputs[0].add(g, args.inputs[0])?;
            Ok(vec![Some(args.grads[0].mul(g, two_x)?)])
        });
        assert!(registry.has_rule(square));
        assert!(registry.rule(square).is_some());
    }
}
