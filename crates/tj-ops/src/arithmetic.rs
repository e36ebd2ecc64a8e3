use crate::OpError;
use tj_core::{Symbol, Tensor};

fn tensor_err(op: Symbol) -> impl Fn(tj_core::TensorError) -> OpError {
    move |source| OpError::Tensor { op, source }
}

/// Elementwise binary op. Shapes must match, or one side must hold a
/// single element, which is broadcast.
pub(crate) fn binary_elementwise(
    op: Symbol,
    lhs: &Tensor,
    rhs: &Tensor,
    f: impl Fn(f64, f64) -> f64,
) -> Result<Tensor, OpError> {
    let left = lhs.to_vec().map_err(tensor_err(op))?;
    let right = rhs.to_vec().map_err(tensor_err(op))?;
    let (data, sizes): (Vec<f64>, &[usize]) = if lhs.sizes() == rhs.sizes() {
        (left.iter().zip(&right).map(|(a, b)| f(*a, *b)).collect(), lhs.sizes())
    } else if right.len() == 1 {
        let b = right[0];
        (left.iter().map(|a| f(*a, b)).collect(), lhs.sizes())
    } else if left.len() == 1 {
        let a = left[0];
        (right.iter().map(|b| f(a, *b)).collect(), rhs.sizes())
    } else {
        return Err(OpError::ShapeMismatch {
            op,
            left: lhs.sizes().to_vec(),
            right: rhs.sizes().to_vec(),
        });
    };
    let template = if sizes == lhs.sizes() { lhs } else { rhs };
    template.with_data(data, sizes).map_err(tensor_err(op))
}

pub(crate) fn unary_elementwise(
    op: Symbol,
    input: &Tensor,
    f: impl Fn(f64) -> f64,
) -> Result<Tensor, OpError> {
    let data = input.to_vec().map_err(tensor_err(op))?;
    input
        .with_data(data.into_iter().map(f).collect(), input.sizes())
        .map_err(tensor_err(op))
}

pub(crate) fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// `[n, k] x [k, m] -> [n, m]`.
pub(crate) fn matmul(op: Symbol, lhs: &Tensor, rhs: &Tensor) -> Result<Tensor, OpError> {
    let (&[n, k], &[k2, m]) = (lhs.sizes(), rhs.sizes()) else {
        return Err(OpError::ShapeMismatch {
            op,
            left: lhs.sizes().to_vec(),
            right: rhs.sizes().to_vec(),
        });
    };
    if k != k2 {
        return Err(OpError::ShapeMismatch {
            op,
            left: lhs.sizes().to_vec(),
            right: rhs.sizes().to_vec(),
        });
    }
    let a = lhs.to_vec().map_err(tensor_err(op))?;
    let b = rhs.to_vec().map_err(tensor_err(op))?;
    let mut out = vec![0.0; n * m];
    for row in 0..n {
        for inner in 0..k {
            let scale = a[row * k + inner];
            for col in 0..m {
                out[row * m + col] += scale * b[inner * m + col];
            }
        }
    }
    lhs.with_data(out, &[n, m]).map_err(tensor_err(op))
}

pub(crate) fn transpose(op: Symbol, input: &Tensor) -> Result<Tensor, OpError> {
    input.t().map_err(tensor_err(op))
}

/// Sum that treats an undefined operand as zero.
pub(crate) fn autograd_add(op: Symbol, lhs: Tensor, rhs: Tensor) -> Result<Tensor, OpError> {
    match (lhs.is_defined(), rhs.is_defined()) {
        (false, _) => Ok(rhs),
        (_, false) => Ok(lhs),
        (true, true) => binary_elementwise(op, &lhs, &rhs, |a, b| a + b),
    }
}

#[cfg(test)]
mod tests {
    use super::{autograd_add, binary_elementwise, matmul, transpose};
    use crate::OpError;
    use tj_core::{Tensor, aten, prim};

    #[test]
    fn scalar_operands_broadcast() {
        let a = Tensor::from_vec(vec![1.0, 2.0, 3.0], &[3]).expect("tensor");
        let two = Tensor::scalar(2.0);
        let out = binary_elementwise(aten::MUL, &two, &a, |x, y| x * y).expect("broadcast");
        assert_eq!(out.sizes(), &[3]);
        assert_eq!(out.to_vec().expect("data"), vec![2.0, 4.0, 6.0]);
    }

    #[test]
    fn incompatible_shapes_are_rejected() {
        let a = Tensor::zeros(&[2]);
        let b = Tensor::zeros(&[3]);
        assert!(matches!(
            binary_elementwise(aten::ADD, &a, &b, |x, y| x + y),
            Err(OpError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn matmul_reads_through_transposed_views() {
        let a = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).expect("a");
        let at = transpose(aten::T, &a).expect("view");
        let gram = matmul(aten::MM, &a, &at).expect("mm");
        assert_eq!(gram.sizes(), &[2, 2]);
        assert_eq!(gram.to_vec().expect("data"), vec![14.0, 32.0, 32.0, 77.0]);
        assert!(matches!(
            matmul(aten::MM, &a, &a),
            Err(OpError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn autograd_add_skips_undefined() {
        let a = Tensor::full(&[2], 1.0);
        let sum = autograd_add(prim::AUTOGRAD_ADD, Tensor::undefined(), a.clone()).expect("add");
        assert_eq!(sum, a);
        let both = autograd_add(prim::AUTOGRAD_ADD, a.clone(), a).expect("add");
        assert_eq!(both.to_vec().expect("data"), vec![2.0, 2.0]);
    }
}
