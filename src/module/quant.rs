//! Quantization-aware training as a declarative policy.
//!
//! Every layer builder names its [`LayerKind`]; the policy maps that kind to
//! a [`Wrapping`] once, when the model is constructed. A fake-quantized layer
//! applies [`FakeQuant`] to its kernel before use and to its activated output.

use burn::{module::Module, prelude::*};
use serde::{Deserialize, Serialize};

const LEVELS: f32 = 127.;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LayerKind {
    Conv2d,
    SeparableConv2d,
    Dense,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Wrapping {
    Plain,
    FakeQuantized,
}

#[derive(Config, Debug)]
pub struct QuantizationPolicy {
    /// Layer kinds that get fake-quantized outputs.
    #[config(default = "Vec::new()")]
    pub wrapped: Vec<LayerKind>,
}

impl QuantizationPolicy {
    pub fn quantization_aware() -> Self {
        Self::new().with_wrapped(vec![
            LayerKind::Conv2d,
            LayerKind::SeparableConv2d,
            LayerKind::Dense,
        ])
    }

    pub fn resolve(&self, kind: LayerKind) -> Wrapping {
        if self.wrapped.contains(&kind) {
            Wrapping::FakeQuantized
        } else {
            Wrapping::Plain
        }
    }
}

impl Wrapping {
    pub fn init(&self) -> Option<FakeQuant> {
        match self {
            Wrapping::Plain => None,
            Wrapping::FakeQuantized => Some(FakeQuant),
        }
    }
}

/// Symmetric per-tensor 8-bit fake quantization with a straight-through gradient.
#[derive(Module, Clone, Debug)]
pub struct FakeQuant;

impl FakeQuant {
    pub fn forward<B: Backend, const D: usize>(&self, input: Tensor<B, D>) -> Tensor<B, D> {
        let frozen = input.clone().detach();
        let scale = (frozen.clone().abs().max().clamp_min(1e-8) / LEVELS).reshape([1usize; D]);
        let quantized = (frozen.clone() / scale.clone()).round().clamp(-LEVELS - 1., LEVELS) * scale;

        input + (quantized - frozen)
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::{Autodiff, NdArray};

    use super::*;

    type TestBackend = NdArray<f32>;

    #[test]
    fn policy_resolves_per_kind() {
        let plain = QuantizationPolicy::new();
        assert_eq!(plain.resolve(LayerKind::Conv2d), Wrapping::Plain);

        let aware = QuantizationPolicy::quantization_aware();
        for kind in [LayerKind::Conv2d, LayerKind::SeparableConv2d, LayerKind::Dense] {
            assert_eq!(aware.resolve(kind), Wrapping::FakeQuantized);
        }

        let dense_only = QuantizationPolicy::new().with_wrapped(vec![LayerKind::Dense]);
        assert_eq!(dense_only.resolve(LayerKind::Conv2d), Wrapping::Plain);
        assert!(dense_only.resolve(LayerKind::Dense).init().is_some());
    }

    #[test]
    fn fake_quant_snaps_to_grid() {
        let device = Default::default();
        let input = Tensor::<TestBackend, 1>::from_floats([1.27, 0.004, -0.5], &device);
        let output = FakeQuant.forward(input).into_data().to_vec::<f32>().unwrap();

        // scale = 0.01
        assert!((output[0] - 1.27).abs() < 1e-5);
        assert!(output[1].abs() < 1e-6);
        assert!((output[2] + 0.5).abs() < 1e-5);
    }

    #[test]
    fn gradient_passes_straight_through() {
        let device = Default::default();
        let input =
            Tensor::<Autodiff<TestBackend>, 1>::from_floats([0.3, -0.7], &device).require_grad();
        let grads = FakeQuant.forward(input.clone()).sum().backward();
        let grad = input.grad(&grads).unwrap().into_data().to_vec::<f32>().unwrap();

        assert_eq!(grad, vec![1., 1.]);
    }
}
