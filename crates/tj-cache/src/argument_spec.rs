//! Fingerprints of concrete executor inputs.
//!
//! Both spec flavors precompute their hash at construction, so lookups in
//! the executor cache hash a single word.

use rustc_hash::FxHasher;
use std::hash::{Hash, Hasher};
use tj_core::{DType, Device, IValue, IValueKind, TensorType, Type};

/// Per-argument entry of an [`ArgumentSpec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgumentInfo {
    Tensor {
        defined: bool,
        requires_grad: bool,
        dtype: Option<DType>,
        device: Option<Device>,
    },
    Other(IValueKind),
}

impl ArgumentInfo {
    fn of(value: &IValue, with_grad: bool) -> Self {
        match value {
            IValue::Tensor(tensor) => Self::Tensor {
                defined: tensor.is_defined(),
                requires_grad: with_grad && tensor.requires_grad(),
                dtype: tensor.dtype(),
                device: tensor.device(),
            },
            other => Self::Other(other.kind()),
        }
    }
}

/// Definedness, dtype, device and requires-grad of every tensor input, and
/// the kind of every other input. Sizes are not part of this spec.
#[derive(Debug, Clone)]
pub struct ArgumentSpec {
    args: Vec<ArgumentInfo>,
    hash_code: u64,
}

impl ArgumentSpec {
    /// With `with_grad` false every tensor is recorded as not requiring grad.
    #[must_use]
    pub fn new(inputs: &[IValue], with_grad: bool) -> Self {
        let args: Vec<ArgumentInfo> = inputs
            .iter()
            .map(|value| ArgumentInfo::of(value, with_grad))
            .collect();
        let hash_code = fx_hash(&args);
        Self { args, hash_code }
    }

    #[must_use]
    pub fn args(&self) -> &[ArgumentInfo] {
        &self.args
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.args.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    #[must_use]
    pub fn hash_code(&self) -> u64 {
        self.hash_code
    }
}

impl PartialEq for ArgumentSpec {
    fn eq(&self, other: &Self) -> bool {
        self.hash_code == other.hash_code && self.args == other.args
    }
}

impl Eq for ArgumentSpec {}

impl Hash for ArgumentSpec {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash_code);
    }
}

/// Per-tensor entry of a [`CompleteArgumentSpec`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorInfo {
    pub defined: bool,
    pub requires_grad: bool,
    pub dtype: Option<DType>,
    pub device: Option<Device>,
    pub sizes: Vec<usize>,
    pub strides: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CompleteArgumentInfo {
    Tensor(TensorInfo),
    Other(IValueKind),
}

impl CompleteArgumentInfo {
    fn of(value: &IValue, with_grad: bool) -> Self {
        match value {
            IValue::Tensor(tensor) => Self::Tensor(TensorInfo {
                defined: tensor.is_defined(),
                requires_grad: with_grad && tensor.requires_grad(),
                dtype: tensor.dtype(),
                device: tensor.device(),
                sizes: tensor.sizes().to_vec(),
                strides: tensor.strides().to_vec(),
            }),
            other => Self::Other(other.kind()),
        }
    }

    /// Static type a graph input takes when specialized to this argument.
    #[must_use]
    pub fn to_type(&self) -> Type {
        match self {
            Self::Tensor(TensorInfo {
                defined: true,
                requires_grad,
                dtype: Some(dtype),
                device: Some(device),
                sizes,
                strides,
            }) => Type::Tensor(
                TensorType::new(*dtype, *device)
                    .with_sizes_and_strides(sizes.clone(), strides.clone())
                    .with_requires_grad(*requires_grad),
            ),
            Self::Tensor(_) => Type::Dynamic,
            Self::Other(kind) => match kind {
                IValueKind::Int => Type::Int,
                IValueKind::Double => Type::Float,
                IValueKind::Bool => Type::Bool,
                IValueKind::None => Type::NoneType,
                IValueKind::IntList => Type::List(Box::new(Type::Int)),
                IValueKind::DoubleList => Type::List(Box::new(Type::Float)),
                IValueKind::TensorList => Type::List(Box::new(Type::Dynamic)),
                IValueKind::Tuple | IValueKind::Tensor => Type::Dynamic,
            },
        }
    }
}

/// [`ArgumentSpec`] plus the full sizes and strides of every tensor. This
/// is the key the executor specializes plans under.
#[derive(Debug, Clone)]
pub struct CompleteArgumentSpec {
    args: Vec<CompleteArgumentInfo>,
    hash_code: u64,
}

impl CompleteArgumentSpec {
    #[must_use]
    pub fn new(inputs: &[IValue], with_grad: bool) -> Self {
        let args: Vec<CompleteArgumentInfo> = inputs
            .iter()
            .map(|value| CompleteArgumentInfo::of(value, with_grad))
            .collect();
        let hash_code = fx_hash(&args);
        Self { args, hash_code }
    }

    #[must_use]
    pub fn args(&self) -> &[CompleteArgumentInfo] {
        &self.args
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.args.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    #[must_use]
    pub fn hash_code(&self) -> u64 {
        self.hash_code
    }

    #[must_use]
    pub fn input_types(&self) -> Vec<Type> {
        self.args.iter().map(CompleteArgumentInfo::to_type).collect()
    }

    /// Whether any defined tensor argument requires grad.
    #[must_use]
    pub fn any_requires_grad(&self) -> bool {
        self.args.iter().any(|arg| {
            matches!(
                arg,
                CompleteArgumentInfo::Tensor(TensorInfo {
                    defined: true,
                    requires_grad: true,
                    ..
                })
            )
        })
    }
}

impl PartialEq for CompleteArgumentSpec {
    fn eq(&self, other: &Self) -> bool {
        self.hash_code == other.hash_code && self.args == other.args
    }
}

impl Eq for CompleteArgumentSpec {}

impl Hash for CompleteArgumentSpec {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash_code);
    }
}

fn fx_hash<T: Hash>(value: &T) -> u64 {
    let mut hasher = FxHasher::default();
    value.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::{ArgumentSpec, CompleteArgumentSpec};
    use proptest::prelude::*;
    use proptest::test_runner::{Config as ProptestConfig, TestRunner};
    use tj_core::{DType, Device, IValue, Tensor, Type};

    fn tensor(sizes: &[usize], requires_grad: bool) -> IValue {
        let numel = sizes.iter().product();
        IValue::Tensor(
            Tensor::from_vec(vec![1.0; numel], sizes)
                .expect("tensor")
                .with_requires_grad(requires_grad),
        )
    }

    #[test]
    fn equal_metadata_means_equal_specs_regardless_of_storage() {
        let a = vec![tensor(&[2, 3], true), IValue::Int(4)];
        let b = vec![
            IValue::Tensor(
                Tensor::from_vec(vec![7.0; 6], &[2, 3])
                    .expect("tensor")
                    .with_requires_grad(true),
            ),
            IValue::Int(-9),
        ];
        assert_eq!(ArgumentSpec::new(&a, true), ArgumentSpec::new(&b, true));
        assert_eq!(
            CompleteArgumentSpec::new(&a, true),
            CompleteArgumentSpec::new(&b, true)
        );
    }

    #[test]
    fn strides_distinguish_complete_specs_only() {
        let contiguous = Tensor::from_vec(vec![0.0; 6], &[3, 2]).expect("tensor");
        let transposed = Tensor::from_vec(vec![0.0; 6], &[2, 3])
            .expect("tensor")
            .t()
            .expect("transpose");
        assert_eq!(contiguous.sizes(), transposed.sizes());
        let a = [IValue::Tensor(contiguous)];
        let b = [IValue::Tensor(transposed)];
        assert_eq!(ArgumentSpec::new(&a, false), ArgumentSpec::new(&b, false));
        assert_ne!(
            CompleteArgumentSpec::new(&a, false),
            CompleteArgumentSpec::new(&b, false)
        );
    }

    #[test]
    fn disabling_grad_changes_the_spec() {
        let inputs = [tensor(&[2], true)];
        let with = CompleteArgumentSpec::new(&inputs, true);
        let without = CompleteArgumentSpec::new(&inputs, false);
        assert_ne!(with, without);
        assert!(with.any_requires_grad());
        assert!(!without.any_requires_grad());
    }

    #[test]
    fn complete_specs_produce_input_types() {
        let inputs = [
            tensor(&[2, 2], true),
            IValue::Double(1.0),
            IValue::Tensor(Tensor::undefined()),
        ];
        let types = CompleteArgumentSpec::new(&inputs, true).input_types();
        let Type::Tensor(first) = &types[0] else {
            panic!("expected tensor type, got {}", types[0]);
        };
        assert_eq!(first.dtype, DType::F32);
        assert_eq!(first.device, Device::Cpu);
        assert_eq!(first.sizes.as_deref(), Some(&[2, 2][..]));
        assert!(first.requires_grad);
        assert_eq!(types[1], Type::Float);
        assert_eq!(types[2], Type::Dynamic);
    }

    fn arb_input() -> impl Strategy<Value = IValue> {
        prop_oneof![
            (proptest::collection::vec(1usize..4, 0..3), any::<bool>())
                .prop_map(|(sizes, rg)| tensor(&sizes, rg)),
            any::<i64>().prop_map(IValue::Int),
            any::<bool>().prop_map(IValue::Bool),
            Just(IValue::Tensor(Tensor::undefined())),
        ]
    }

    #[test]
    fn prop_spec_equality_is_an_equivalence() {
        let mut runner = TestRunner::new(ProptestConfig::with_cases(
            tj_test_utils::property_test_case_count(),
        ));
        let strategy = (
            proptest::collection::vec(arb_input(), 0..4),
            proptest::collection::vec(arb_input(), 0..4),
            any::<bool>(),
        );
        runner
            .run(&strategy, |(xs, ys, grad)| {
                let x = CompleteArgumentSpec::new(&xs, grad);
                let x2 = CompleteArgumentSpec::new(&xs.clone(), grad);
                let y = CompleteArgumentSpec::new(&ys, grad);
                prop_assert_eq!(&x, &x);
                prop_assert_eq!(&x, &x2);
                prop_assert_eq!(x == y, y == x);
                if x == y {
                    prop_assert_eq!(x.hash_code(), y.hash_code());
                    prop_assert_eq!(&x2, &y);
                }
                let coarse_x = ArgumentSpec::new(&xs, grad);
                let coarse_y = ArgumentSpec::new(&ys, grad);
                if x == y {
                    prop_assert_eq!(coarse_x, coarse_y);
                }
                Ok(())
            })
            .expect("argument spec equality laws hold");
    }
}
