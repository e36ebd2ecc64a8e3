use crate::OpError;
use crate::arithmetic::binary_elementwise;
use tj_core::{DType, Symbol, Tensor};

/// Elementwise comparison producing a `Bool` tensor of zeros and ones.
pub(crate) fn compare(
    op: Symbol,
    lhs: &Tensor,
    rhs: &Tensor,
    predicate: impl Fn(f64, f64) -> bool,
) -> Result<Tensor, OpError> {
    let out = binary_elementwise(op, lhs, rhs, |a, b| {
        if predicate(a, b) { 1.0 } else { 0.0 }
    })?;
    Ok(out.with_dtype(DType::Bool))
}

#[cfg(test)]
mod tests {
    use super::compare;
    use tj_core::{DType, IValue, Tensor, aten};

    #[test]
    fn comparison_yields_bool_tensor_usable_as_condition() {
        let a = Tensor::scalar(1.0);
        let b = Tensor::scalar(2.0);
        let lt = compare(aten::LT, &a, &b, |x, y| x < y).expect("lt");
        assert_eq!(lt.dtype(), Some(DType::Bool));
        assert_eq!(IValue::Tensor(lt).to_bool(), Ok(true));
        let gt = compare(aten::GT, &a, &b, |x, y| x > y).expect("gt");
        assert_eq!(IValue::Tensor(gt).to_bool(), Ok(false));
    }
}
