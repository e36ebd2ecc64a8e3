use crate::OpError;
use tj_core::{Symbol, Tensor, TensorError};

fn tensor_err(op: Symbol) -> impl Fn(TensorError) -> OpError {
    move |source| OpError::Tensor { op, source }
}

/// Reduces a gradient back to the sizes of the operand it flowed from.
/// Broadcasting only ever expands a single-element operand, so the only
/// reduction needed is a full sum. Undefined gradients pass through.
pub(crate) fn sum_to_size(op: Symbol, grad: &Tensor, sizes: &[usize]) -> Result<Tensor, OpError> {
    if !grad.is_defined() || grad.sizes() == sizes {
        return Ok(grad.clone());
    }
    if sizes.iter().product::<usize>() != 1 {
        return Err(OpError::ShapeMismatch {
            op,
            left: grad.sizes().to_vec(),
            right: sizes.to_vec(),
        });
    }
    let total = grad.to_vec().map_err(tensor_err(op))?.iter().sum();
    grad.with_data(vec![total], sizes).map_err(tensor_err(op))
}

/// Converts an `int[]` operand to sizes, rejecting negative extents.
pub(crate) fn sizes_from_ints(op: Symbol, ints: &[i64]) -> Result<Vec<usize>, OpError> {
    ints.iter()
        .map(|&v| {
            usize::try_from(v).map_err(|_| OpError::Lowering {
                kind: op,
                detail: format!("negative size {v} in {ints:?}"),
            })
        })
        .collect()
}

/// Splits `input` along `dim` into pieces of `ceil(len / chunks)` elements;
/// the last piece may be shorter and fewer than `chunks` pieces may result.
pub(crate) fn chunk(
    op: Symbol,
    input: &Tensor,
    chunks: usize,
    dim: usize,
) -> Result<Vec<Tensor>, OpError> {
    let sizes = input.sizes().to_vec();
    if dim >= sizes.len() {
        return Err(OpError::Tensor {
            op,
            source: TensorError::DimOutOfRange {
                dim,
                rank: sizes.len(),
            },
        });
    }
    if chunks == 0 {
        return Err(OpError::Lowering {
            kind: op,
            detail: "chunk count must be positive".to_owned(),
        });
    }
    let data = input.to_vec().map_err(tensor_err(op))?;
    let extent = sizes[dim];
    let outer: usize = sizes[..dim].iter().product();
    let inner: usize = sizes[dim + 1..].iter().product();
    let step = extent.div_ceil(chunks).max(1);

    let mut pieces = Vec::with_capacity(chunks);
    let mut start = 0;
    while start < extent {
        let len = step.min(extent - start);
        let mut piece = Vec::with_capacity(outer * len * inner);
        for o in 0..outer {
            let base = (o * extent + start) * inner;
            piece.extend_from_slice(&data[base..base + len * inner]);
        }
        let mut piece_sizes = sizes.clone();
        piece_sizes[dim] = len;
        pieces.push(input.with_data(piece, &piece_sizes).map_err(tensor_err(op))?);
        start += len;
    }
    Ok(pieces)
}
