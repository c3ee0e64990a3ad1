use burn::prelude::*;

use crate::error::{Result, TrainError};

/// Learning rate as a pure function of the zero-based epoch index.
pub trait LrSchedule {
    fn lr(&self, epoch: usize) -> f64;
}

#[derive(Config, Debug)]
pub struct PiecewiseLrConfig {
    pub base_lr: f64,

    pub total_epochs: usize,

    /// Fractions of `total_epochs` where each segment ends.
    #[config(default = "vec![0.5, 0.8, 0.9]")]
    pub boundaries: Vec<f64>,

    /// Multipliers of `base_lr`, one more than `boundaries`.
    #[config(default = "vec![1.0, 0.5, 0.1, 0.01]")]
    pub factors: Vec<f64>,
}

impl PiecewiseLrConfig {
    pub fn init(&self) -> Result<PiecewiseLr> {
        if self.factors.len() != self.boundaries.len() + 1 {
            return Err(TrainError::Config(format!(
                "{} boundaries need {} factors, got {}",
                self.boundaries.len(),
                self.boundaries.len() + 1,
                self.factors.len()
            )));
        }
        if self.boundaries.windows(2).any(|pair| pair[0] > pair[1])
            || self.boundaries.iter().any(|b| !(0. ..=1.).contains(b))
        {
            return Err(TrainError::Config(format!(
                "boundaries must be non-decreasing fractions, got {:?}",
                self.boundaries
            )));
        }

        Ok(PiecewiseLr {
            base_lr: self.base_lr,
            ends: self
                .boundaries
                .iter()
                .map(|fraction| (self.total_epochs as f64 * fraction) as usize)
                .collect(),
            factors: self.factors.clone(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct PiecewiseLr {
    base_lr: f64,
    /// First epoch of the next segment, already floored.
    ends: Vec<usize>,
    factors: Vec<f64>,
}

impl LrSchedule for PiecewiseLr {
    fn lr(&self, epoch: usize) -> f64 {
        let segment = self
            .ends
            .iter()
            .position(|&end| epoch < end)
            .unwrap_or(self.ends.len());
        self.base_lr * self.factors[segment]
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConstantLr(pub f64);

impl LrSchedule for ConstantLr {
    fn lr(&self, _epoch: usize) -> f64 {
        self.0
    }
}
