//! Weight initialisation schemes for convolutional and linear weights.
//!
//! Schemes only ever touch tensors registered as
//! [`ParamKind::ConvWeight`](crate::ParamKind::ConvWeight) or
//! [`ParamKind::LinearWeight`](crate::ParamKind::LinearWeight); biases and
//! normalisation parameters keep their construction-time values. Fan sizes
//! follow the usual convention for `(out, in, kh, kw)` kernels: the receptive
//! field multiplies both fans.

use std::f64::consts::SQRT_2;

use candle_core::{DType, Device, Error, Result, Tensor};

use crate::params::ParamStore;

/// Supported weight initialisation policies, selected by name.
#[derive(Debug, Clone, PartialEq)]
pub enum WeightInit {
    /// Xavier/Glorot uniform with unit gain.
    XavierUniform,
    /// Fixed normal distribution.
    Normal { mean: f64, std: f64 },
    /// Xavier/Glorot normal scaled by `gain`.
    XavierNormal { gain: f64 },
    /// Kaiming/He normal using fan-in.
    KaimingNormal { negative_slope: f64 },
    /// (Semi-)orthogonal matrix scaled by `gain`.
    Orthogonal { gain: f64 },
    /// Keeps the layer's own initialisation.
    Default,
    /// Any other name. Treated exactly like [`WeightInit::Default`].
    Unrecognized(String),
}

impl WeightInit {
    /// Maps a configuration name onto a scheme; unknown names never fail.
    pub fn from_name(name: &str) -> Self {
        match name.trim().trim_end_matches('_') {
            "xavier_uniform" => WeightInit::XavierUniform,
            "normal" => WeightInit::Normal {
                mean: 0.0,
                std: 0.02,
            },
            "xavier_normal" => WeightInit::XavierNormal { gain: SQRT_2 },
            "kaiming_normal" => WeightInit::KaimingNormal {
                negative_slope: 0.0,
            },
            "orthogonal" => WeightInit::Orthogonal { gain: SQRT_2 },
            "default" => WeightInit::Default,
            _ => WeightInit::Unrecognized(name.to_string()),
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, WeightInit::Default | WeightInit::Unrecognized(_))
    }

    /// Re-initialises every conv/linear weight in `store`, returning how many
    /// tensors were rewritten.
    pub fn apply(&self, store: &ParamStore) -> Result<usize> {
        if self.is_noop() {
            return Ok(0);
        }
        let mut rewritten = 0;
        for param in store.all() {
            if !param.kind.is_weight_matrix() {
                continue;
            }
            let current = param.var.as_tensor();
            let sampled = self.sample(current.dims(), current.device())?;
            let sampled = if current.dtype() == DType::F32 {
                sampled
            } else {
                sampled.to_dtype(current.dtype())?
            };
            param.var.set(&sampled)?;
            rewritten += 1;
        }
        Ok(rewritten)
    }

    /// Draws a fresh f32 tensor shaped `dims` following this scheme.
    pub fn sample(&self, dims: &[usize], device: &Device) -> Result<Tensor> {
        let (fan_in, fan_out) = fans(dims)?;
        match self {
            WeightInit::XavierUniform => {
                let bound = (6.0f64 / (fan_in + fan_out)).sqrt();
                Tensor::rand(-bound as f32, bound as f32, dims, device)
            }
            WeightInit::Normal { mean, std } => {
                Tensor::randn(*mean as f32, *std as f32, dims, device)
            }
            WeightInit::XavierNormal { gain } => {
                let std = gain * (2.0f64 / (fan_in + fan_out)).sqrt();
                Tensor::randn(0f32, std as f32, dims, device)
            }
            WeightInit::KaimingNormal { negative_slope } => {
                let gain = (2.0f64 / (1.0 + negative_slope.powi(2))).sqrt();
                let std = gain / fan_in.sqrt();
                Tensor::randn(0f32, std as f32, dims, device)
            }
            WeightInit::Orthogonal { gain } => orthogonal(dims, *gain, device),
            WeightInit::Default | WeightInit::Unrecognized(_) => Err(Error::Msg(
                "no-op initialisation schemes cannot sample tensors".into(),
            )),
        }
    }
}

fn fans(dims: &[usize]) -> Result<(f64, f64)> {
    if dims.len() < 2 {
        return Err(Error::Msg(format!(
            "fan computation requires at least 2 dimensions, got {:?}",
            dims
        )));
    }
    let receptive: usize = dims[2..].iter().product();
    let fan_in = (dims[1] * receptive) as f64;
    let fan_out = (dims[0] * receptive) as f64;
    Ok((fan_in, fan_out))
}

/// Orthonormal rows (or columns, whichever is shorter) via modified
/// Gram-Schmidt on a Gaussian matrix.
fn orthogonal(dims: &[usize], gain: f64, device: &Device) -> Result<Tensor> {
    let rows = dims[0];
    let cols: usize = dims[1..].iter().product();
    if rows == 0 || cols == 0 {
        return Tensor::zeros(dims, DType::F32, device);
    }

    let transpose = rows < cols;
    let (m, n) = if transpose { (cols, rows) } else { (rows, cols) };
    let gaussian: Vec<f64> = Tensor::randn(0f32, 1f32, m * n, &Device::Cpu)?
        .to_vec1::<f32>()?
        .into_iter()
        .map(f64::from)
        .collect();

    // Tall m x n matrix, row-major; orthonormalise its n columns.
    let mut q = gaussian;
    for j in 0..n {
        for i in 0..j {
            let dot: f64 = (0..m).map(|r| q[r * n + i] * q[r * n + j]).sum();
            for r in 0..m {
                q[r * n + j] -= dot * q[r * n + i];
            }
        }
        let norm = (0..m).map(|r| q[r * n + j].powi(2)).sum::<f64>().sqrt();
        if norm <= f64::EPSILON {
            return Err(Error::Msg(
                "orthogonal init drew a degenerate matrix".into(),
            ));
        }
        for r in 0..m {
            q[r * n + j] /= norm;
        }
    }

    let mut values = Vec::with_capacity(rows * cols);
    for r in 0..rows {
        for c in 0..cols {
            let value = if transpose { q[c * n + r] } else { q[r * n + c] };
            values.push((value * gain) as f32);
        }
    }
    Tensor::from_vec(values, dims, device)
}
