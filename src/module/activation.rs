use burn::{
    prelude::Backend,
    tensor::{
        activation::{leaky_relu, mish, relu},
        Tensor,
    },
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivationKind {
    Identity,
    Relu,
    Mish,
    /// Slope 0.1.
    LeakyRelu,
}

impl ActivationKind {
    pub fn forward<B: Backend, const D: usize>(&self, input: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            ActivationKind::Identity => input,
            ActivationKind::Relu => relu(input),
            ActivationKind::Mish => mish(input),
            ActivationKind::LeakyRelu => leaky_relu(input, 0.1),
        }
    }
}
