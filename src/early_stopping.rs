use burn::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Config, Debug)]
pub struct EarlyStoppingConfig {
    /// A validation loss counts as better only when it beats the best by more than this.
    #[config(default = 0.005)]
    pub min_delta: f64,

    #[config(default = 10)]
    pub patience: usize,

    #[config(default = true)]
    pub restore_best: bool,
}

impl EarlyStoppingConfig {
    pub fn init(&self) -> EarlyStopping {
        EarlyStopping {
            min_delta: self.min_delta,
            patience: self.patience,
            restore_best: self.restore_best,
            state: EarlyStoppingState::default(),
        }
    }
}

/// The part that has to survive a restart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EarlyStoppingState {
    pub best: Option<f64>,
    pub best_epoch: usize,
    pub wait: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Improved,
    Waiting,
    Stop,
}

#[derive(Debug, Clone)]
pub struct EarlyStopping {
    min_delta: f64,
    patience: usize,
    restore_best: bool,
    state: EarlyStoppingState,
}

impl EarlyStopping {
    pub fn observe(&mut self, epoch: usize, valid_loss: f64) -> Verdict {
        let improved = match self.state.best {
            None => valid_loss.is_finite(),
            Some(best) => valid_loss < best - self.min_delta,
        };

        if improved {
            self.state = EarlyStoppingState {
                best: Some(valid_loss),
                best_epoch: epoch,
                wait: 0,
            };
            return Verdict::Improved;
        }

        self.state.wait += 1;
        if self.state.wait >= self.patience {
            Verdict::Stop
        } else {
            Verdict::Waiting
        }
    }

    pub fn restore_best(&self) -> bool {
        self.restore_best
    }

    pub fn state(&self) -> EarlyStoppingState {
        self.state
    }

    pub fn with_state(mut self, state: EarlyStoppingState) -> Self {
        self.state = state;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stops_after_patience_without_improvement() {
        let mut stopping = EarlyStoppingConfig::new().with_patience(3).init();

        assert_eq!(stopping.observe(0, 1.0), Verdict::Improved);
        assert_eq!(stopping.observe(1, 0.999), Verdict::Waiting);
        assert_eq!(stopping.observe(2, 0.998), Verdict::Waiting);
        assert_eq!(stopping.observe(3, 0.997), Verdict::Stop);
        assert_eq!(stopping.state().best_epoch, 0);
    }

    #[test]
    fn improvement_must_exceed_min_delta() {
        let mut stopping = EarlyStoppingConfig::new().init();
        stopping.observe(0, 1.0);

        assert_eq!(stopping.observe(1, 0.996), Verdict::Waiting);
        assert_eq!(stopping.observe(2, 0.99), Verdict::Improved);
        assert_eq!(stopping.state().wait, 0);
        assert_eq!(stopping.state().best, Some(0.99));
    }

    #[test]
    fn nan_never_improves() {
        let mut stopping = EarlyStoppingConfig::new().with_patience(1).init();
        assert_eq!(stopping.observe(0, f64::NAN), Verdict::Stop);
    }

    #[test]
    fn state_survives_a_round_trip() {
        let mut stopping = EarlyStoppingConfig::new().with_patience(2).init();
        stopping.observe(0, 1.0);
        stopping.observe(1, 1.0);

        let json = serde_json::to_string(&stopping.state()).unwrap();
        let mut resumed = EarlyStoppingConfig::new()
            .with_patience(2)
            .init()
            .with_state(serde_json::from_str(&json).unwrap());
        assert_eq!(resumed.observe(2, 1.0), Verdict::Stop);
    }
}
