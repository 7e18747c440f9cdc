//! Lightweight validation helpers shared across layer components.
//!
//! These routines provide concise shape and dtype assertions that can be wired
//! into constructors or forward paths. They return `candle_core::Result<()>`
//! so call sites can propagate errors without panicking.

use candle_core::{DType, Error, Result, Tensor};

/// Ensures a tensor has the expected number of dimensions.
pub fn expect_rank(label: &str, tensor: &Tensor, rank: usize) -> Result<()> {
    let dims = tensor.dims();
    if dims.len() == rank {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: expected rank {rank}, got shape {:?}",
            dims
        )))
    }
}

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(label: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    let actual = tensor.dims();
    if actual == expected {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: expected shape {:?}, got {:?}",
            expected, actual
        )))
    }
}

/// Validates the `(batch, channels, height, width)` convention with a known channel count.
pub fn expect_image_batch(label: &str, tensor: &Tensor, channels: usize) -> Result<()> {
    match tensor.dims() {
        [batch, actual, height, width] if *actual == channels => {
            if *batch == 0 || *height == 0 || *width == 0 {
                Err(Error::Msg(format!(
                    "{label}: batch and spatial dimensions must be non-zero, got {:?}",
                    tensor.dims()
                )))
            } else {
                Ok(())
            }
        }
        dims => Err(Error::Msg(format!(
            "{label}: expected (batch, {channels}, height, width) layout, got {:?}",
            dims
        ))),
    }
}

/// Checks the tensor dtype is one of the allowed values.
pub fn expect_dtype_in(label: &str, tensor: &Tensor, allowed: &[DType]) -> Result<()> {
    let dtype = tensor.dtype();
    if allowed.iter().copied().any(|allowed| allowed == dtype) {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: expected dtype in {:?}, got {:?}",
            allowed, dtype
        )))
    }
}
