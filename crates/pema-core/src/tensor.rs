// SPDX-License-Identifier: MIT OR Apache-2.0

#![forbid(unsafe_code)]

use crate::PemaError;
use serde::{Deserialize, Serialize};

/// Role of a named tensor within a model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorKind {
    /// Trainable weight; participates in EMA averaging.
    Parameter,
    /// Non-trainable state (e.g. normalization statistics); carried over
    /// from the live model, never averaged.
    Buffer,
}

/// Named, shaped, dense numeric tensor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub name: String,
    pub kind: TensorKind,
    pub shape: Vec<usize>,
    pub data: Vec<f64>,
}

impl Tensor {
    pub fn new(
        name: impl Into<String>,
        kind: TensorKind,
        shape: Vec<usize>,
        data: Vec<f64>,
    ) -> Result<Self, PemaError> {
        let name = name.into();
        let tensor = Self {
            name,
            kind,
            shape,
            data,
        };
        tensor.validate()?;
        Ok(tensor)
    }

    pub fn validate(&self) -> Result<(), PemaError> {
        if self.name.trim().is_empty() {
            return Err(PemaError::invalid_input("tensor name must be non-empty"));
        }
        let expected_len = self
            .shape
            .iter()
            .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
            .ok_or_else(|| {
                PemaError::invalid_input(format!(
                    "tensor '{}' shape product overflows usize",
                    self.name
                ))
            })?;
        if self.data.len() != expected_len {
            return Err(PemaError::invalid_input(format!(
                "tensor '{}' data length mismatch: got {}, expected {} for shape {:?}",
                self.name,
                self.data.len(),
                expected_len,
                self.shape
            )));
        }
        Ok(())
    }
}

/// Ordered collection of named model tensors, parameters and buffers mixed
/// in model order. Duplicate names are rejected.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TensorMap {
    tensors: Vec<Tensor>,
}

impl TensorMap {
    pub fn new(tensors: Vec<Tensor>) -> Result<Self, PemaError> {
        let map = Self { tensors };
        map.validate()?;
        Ok(map)
    }

    /// Re-validates invariants, used after deserializing from a checkpoint.
    pub fn validate(&self) -> Result<(), PemaError> {
        for (idx, tensor) in self.tensors.iter().enumerate() {
            tensor.validate()?;
            if self.tensors[..idx]
                .iter()
                .any(|earlier| earlier.name == tensor.name)
            {
                return Err(PemaError::invalid_input(format!(
                    "duplicate tensor name '{}'",
                    tensor.name
                )));
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn parameters(&self) -> impl Iterator<Item = &Tensor> {
        self.tensors
            .iter()
            .filter(|tensor| tensor.kind == TensorKind::Parameter)
    }

    pub fn buffers(&self) -> impl Iterator<Item = &Tensor> {
        self.tensors
            .iter()
            .filter(|tensor| tensor.kind == TensorKind::Buffer)
    }

    /// A same-shaped map with every tensor zeroed, ready to accumulate a
    /// weighted sum into.
    pub fn zeros_like(&self) -> Self {
        let tensors = self
            .tensors
            .iter()
            .map(|tensor| Tensor {
                name: tensor.name.clone(),
                kind: tensor.kind,
                shape: tensor.shape.clone(),
                data: vec![0.0; tensor.data.len()],
            })
            .collect();
        Self { tensors }
    }

    /// Copies buffer-kind tensors from `src` into `self` by position,
    /// leaving parameters untouched. Shapes must agree exactly.
    pub fn copy_buffers_from(&mut self, src: &impl ModelTensors) -> Result<(), PemaError> {
        let dst = self.tensors_mut();
        let src = src.tensors();
        check_aligned(dst, src)?;
        for (dst_tensor, src_tensor) in dst.iter_mut().zip(src) {
            if dst_tensor.kind == TensorKind::Buffer {
                dst_tensor.data.copy_from_slice(src_tensor.data.as_slice());
            }
        }
        Ok(())
    }
}

/// Capability interface over a model's ordered tensor set. Reconstruction
/// code is written against this trait so it stays agnostic to the concrete
/// model container.
pub trait ModelTensors {
    fn tensors(&self) -> &[Tensor];
    fn tensors_mut(&mut self) -> &mut [Tensor];
}

impl ModelTensors for TensorMap {
    fn tensors(&self) -> &[Tensor] {
        self.tensors.as_slice()
    }

    fn tensors_mut(&mut self) -> &mut [Tensor] {
        self.tensors.as_mut_slice()
    }
}

/// Accumulates `coef * src` into `dst` for every parameter tensor, in
/// place. Buffers are left untouched. Tensor order, names, kinds and shapes
/// must agree between the two models.
pub fn accumulate_scaled(
    dst: &mut impl ModelTensors,
    src: &impl ModelTensors,
    coef: f64,
) -> Result<(), PemaError> {
    if !coef.is_finite() {
        return Err(PemaError::numerical_issue(format!(
            "accumulation coefficient must be finite; got {coef}"
        )));
    }
    let dst = dst.tensors_mut();
    let src = src.tensors();
    check_aligned(dst, src)?;
    for (dst_tensor, src_tensor) in dst.iter_mut().zip(src) {
        if dst_tensor.kind != TensorKind::Parameter {
            continue;
        }
        for (acc, value) in dst_tensor.data.iter_mut().zip(src_tensor.data.iter()) {
            *acc += coef * value;
        }
    }
    Ok(())
}

fn check_aligned(dst: &[Tensor], src: &[Tensor]) -> Result<(), PemaError> {
    if dst.len() != src.len() {
        return Err(PemaError::invalid_input(format!(
            "tensor count mismatch: destination has {}, source has {}",
            dst.len(),
            src.len()
        )));
    }
    for (dst_tensor, src_tensor) in dst.iter().zip(src) {
        if dst_tensor.name != src_tensor.name
            || dst_tensor.kind != src_tensor.kind
            || dst_tensor.shape != src_tensor.shape
        {
            return Err(PemaError::invalid_input(format!(
                "tensor mismatch: destination '{}' {:?} vs source '{}' {:?}",
                dst_tensor.name, dst_tensor.shape, src_tensor.name, src_tensor.shape
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{ModelTensors, Tensor, TensorKind, TensorMap, accumulate_scaled};

    fn model(param_value: f64, buffer_value: f64) -> TensorMap {
        TensorMap::new(vec![
            Tensor::new(
                "net.weight",
                TensorKind::Parameter,
                vec![2, 2],
                vec![param_value; 4],
            )
            .expect("weight tensor should be valid"),
            Tensor::new(
                "norm.running_mean",
                TensorKind::Buffer,
                vec![2],
                vec![buffer_value; 2],
            )
            .expect("buffer tensor should be valid"),
        ])
        .expect("tensor map should be valid")
    }

    #[test]
    fn shape_mismatch_rejected() {
        let err = Tensor::new("w", TensorKind::Parameter, vec![2, 3], vec![0.0; 4])
            .expect_err("length 4 does not fit shape [2, 3]");
        assert!(err.to_string().contains("data length mismatch"), "{err}");
    }

    #[test]
    fn duplicate_names_rejected() {
        let tensor = Tensor::new("w", TensorKind::Parameter, vec![1], vec![0.0])
            .expect("tensor should be valid");
        let err = TensorMap::new(vec![tensor.clone(), tensor])
            .expect_err("duplicate names must be rejected");
        assert!(err.to_string().contains("duplicate tensor name"), "{err}");
    }

    #[test]
    fn zeros_like_zeroes_everything() {
        let zeroed = model(3.0, 7.0).zeros_like();
        let param = zeroed.parameters().next().expect("one parameter");
        let buffer = zeroed.buffers().next().expect("one buffer");
        assert!(param.data.iter().all(|&v| v == 0.0));
        assert!(buffer.data.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn accumulate_scaled_is_weighted_sum() {
        let mut out = model(1.0, 0.0).zeros_like();
        accumulate_scaled(&mut out, &model(1.0, 0.0), 0.25).expect("first accumulation");
        accumulate_scaled(&mut out, &model(2.0, 0.0), 0.75).expect("second accumulation");
        let param = out.parameters().next().expect("one parameter");
        for &value in &param.data {
            assert!((value - 1.75).abs() < 1e-12, "got {value}");
        }
    }

    #[test]
    fn accumulate_rejects_misaligned_models() {
        let mut out = model(0.0, 0.0);
        let other = TensorMap::new(vec![
            Tensor::new("other.weight", TensorKind::Parameter, vec![4], vec![0.0; 4])
                .expect("tensor should be valid"),
        ])
        .expect("tensor map should be valid");
        assert!(accumulate_scaled(&mut out, &other, 1.0).is_err());
    }

    #[test]
    fn copy_buffers_from_replaces_only_buffers() {
        let mut recon = model(5.0, 0.0);
        let live = model(1.0, 9.0);
        recon
            .copy_buffers_from(&live)
            .expect("buffer copy should succeed");
        let param = recon.parameters().next().expect("one parameter");
        let buffer = recon.buffers().next().expect("one buffer");
        assert!(param.data.iter().all(|&v| v == 5.0));
        assert!(buffer.data.iter().all(|&v| v == 9.0));
    }
}
