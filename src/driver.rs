use std::{collections::BTreeMap, sync::Arc, time::Instant};

use burn::{
    data::dataloader::DataLoader,
    module::AutodiffModule,
    optim::Optimizer,
    prelude::*,
    record::CompactRecorder,
    tensor::{backend::AutodiffBackend, ElementConversion},
    train::{ClassificationOutput, TrainStep, ValidStep},
};
use tracing::{debug, info, warn};

use crate::{
    checkpoint::{CheckpointManager, CheckpointState},
    early_stopping::{EarlyStopping, EarlyStoppingConfig, Verdict},
    error::{checkpoint_error, Result, TrainError},
    run::{EpochSummary, MetricLog, TrainingContext},
    schedule::LrSchedule,
};

#[derive(Config, Debug)]
pub struct DriverConfig {
    pub num_epochs: usize,

    /// Caps the optimization steps of one epoch; every batch when unset.
    pub steps_per_epoch: Option<usize>,

    /// Validate after every n-th epoch.
    #[config(default = 1)]
    pub validation_every: usize,

    pub validation_steps: Option<usize>,

    #[config(default = 10)]
    pub checkpoint_every: usize,

    pub early_stopping: Option<EarlyStoppingConfig>,
}

/// What the driver needs to know about one step's output.
pub trait StepOutput {
    fn loss(&self) -> f64;

    fn accuracy(&self) -> Option<f64> {
        None
    }

    /// Named loss terms worth logging next to the total.
    fn components(&self) -> Vec<(&'static str, f64)> {
        Vec::new()
    }
}

pub(crate) fn scalar<B: Backend>(tensor: &Tensor<B, 1>) -> f64 {
    tensor.clone().into_scalar().elem::<f64>()
}

impl<B: Backend> StepOutput for ClassificationOutput<B> {
    fn loss(&self) -> f64 {
        scalar(&self.loss)
    }

    fn accuracy(&self) -> Option<f64> {
        let [batch, _] = self.output.dims();
        if batch == 0 {
            return None;
        }
        let correct = self
            .output
            .clone()
            .argmax(1)
            .reshape([batch])
            .equal(self.targets.clone())
            .int()
            .sum()
            .into_scalar()
            .elem::<f64>();
        Some(correct / batch as f64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    NotStarted,
    /// Zero-based index of the epoch in progress.
    Running { epoch: usize },
    Completed,
    /// 1-based epoch after which training stopped.
    StoppedEarly { epoch: usize },
}

#[derive(Debug)]
pub struct FitOutcome<M> {
    pub model: M,
    pub status: RunStatus,
    /// Zero-based epoch the run started from; non-zero after a restore.
    pub start_epoch: usize,
    pub summaries: Vec<EpochSummary>,
}

#[derive(Default)]
struct Meter {
    steps: usize,
    loss: f64,
    accuracy: Option<f64>,
    components: BTreeMap<String, f64>,
}

impl Meter {
    fn update(&mut self, output: &impl StepOutput, loss: f64) {
        self.steps += 1;
        self.loss += loss;
        if let Some(accuracy) = output.accuracy() {
            *self.accuracy.get_or_insert(0.) += accuracy;
        }
        for (name, value) in output.components() {
            *self.components.entry(name.to_string()).or_default() += value;
        }
    }

    fn mean_loss(&self) -> Option<f64> {
        (self.steps > 0).then(|| self.loss / self.steps as f64)
    }

    fn mean_accuracy(&self) -> Option<f64> {
        self.accuracy
            .filter(|_| self.steps > 0)
            .map(|total| total / self.steps as f64)
    }

    fn mean_components(self) -> BTreeMap<String, f64> {
        let steps = self.steps.max(1) as f64;
        self.components
            .into_iter()
            .map(|(name, total)| (name, total / steps))
            .collect()
    }
}

pub struct TrainingDriver<B: AutodiffBackend, S> {
    config: DriverConfig,
    context: TrainingContext<B>,
    schedule: S,
    status: RunStatus,
}

impl<B: AutodiffBackend, S: LrSchedule> TrainingDriver<B, S> {
    pub fn new(config: DriverConfig, context: TrainingContext<B>, schedule: S) -> Result<Self> {
        if config.validation_every == 0 {
            return Err(TrainError::Config("validation interval must be positive".into()));
        }
        if config.steps_per_epoch == Some(0) {
            return Err(TrainError::Config("steps per epoch must be positive".into()));
        }

        Ok(Self {
            config,
            context,
            schedule,
            status: RunStatus::NotStarted,
        })
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    /// Trains `model` from the latest checkpoint if one exists, otherwise from
    /// the given parameters, and always writes the final model.
    pub fn fit<M, O, TI, VI, TO, VO>(
        &mut self,
        model: M,
        optim: O,
        train_loader: Arc<dyn DataLoader<TI>>,
        valid_loader: Arc<dyn DataLoader<VI>>,
    ) -> Result<FitOutcome<M>>
    where
        M: AutodiffModule<B> + TrainStep<TI, TO>,
        M::InnerModule: ValidStep<VI, VO>,
        O: Optimizer<M, B>,
        TO: StepOutput,
        VO: StepOutput,
    {
        let layout = &self.context.layout;
        layout.create()?;
        let checkpoints = CheckpointManager::new(&layout.checkpoint_dir, self.config.checkpoint_every)?;
        let mut metric_log = MetricLog::open(layout.metrics_path())?;
        let mut stopper = self.config.early_stopping.as_ref().map(EarlyStoppingConfig::init);

        let (mut model, mut optim, start_epoch) = match checkpoints.latest()? {
            Some(entry) => {
                info!("Restoring from {}", entry.path.display());
                let (model, optim, state) =
                    checkpoints.restore::<B, _, _>(&entry, model, optim, &self.context.device)?;
                if let (Some(stopper), Some(saved)) = (stopper.as_mut(), state.early_stopping) {
                    *stopper = stopper.clone().with_state(saved);
                }
                (model, optim, state.epoch)
            }
            None => {
                info!("Creating a new model");
                (model, optim, 0)
            }
        };

        let mut best_model: Option<M> = None;
        let mut best_valid_loss = stopper.as_ref().and_then(|s| s.state().best);
        let mut summaries = vec![];
        let steps_cap = self.config.steps_per_epoch.unwrap_or(usize::MAX);
        let valid_cap = self.config.validation_steps.unwrap_or(usize::MAX);

        for epoch in start_epoch..self.config.num_epochs {
            self.status = RunStatus::Running { epoch };
            let lr = self.schedule.lr(epoch);
            let started = Instant::now();

            let mut train = Meter::default();
            for (step, batch) in train_loader.iter().take(steps_cap).enumerate() {
                let output = TrainStep::step(&model, batch);
                let loss = output.item.loss();
                if !loss.is_finite() {
                    warn!("Epoch {}, step {step}: invalid loss, terminating training", epoch + 1);
                    return Err(TrainError::Diverged {
                        epoch: epoch + 1,
                        step,
                    });
                }
                debug!("Epoch {} step {step}: loss {loss:.5}", epoch + 1);
                train.update(&output.item, loss);
                model = optim.step(lr, model, output.grads);
            }

            let mut valid = Meter::default();
            if (epoch + 1) % self.config.validation_every == 0 {
                let model_valid = model.valid();
                for batch in valid_loader.iter().take(valid_cap) {
                    let output = ValidStep::step(&model_valid, batch);
                    let loss = output.loss();
                    valid.update(&output, loss);
                }
            }

            let summary = EpochSummary {
                epoch: epoch + 1,
                lr,
                train_loss: train.mean_loss(),
                train_accuracy: train.mean_accuracy(),
                valid_loss: valid.mean_loss(),
                valid_accuracy: valid.mean_accuracy(),
                components: train.mean_components(),
                elapsed_secs: started.elapsed().as_secs_f64(),
            };
            info!(
                "Epoch {}/{}: lr {:.2e} | train loss {} | valid loss {} | valid accuracy {}",
                summary.epoch,
                self.config.num_epochs,
                summary.lr,
                format_metric(summary.train_loss),
                format_metric(summary.valid_loss),
                format_metric(summary.valid_accuracy),
            );
            metric_log.write(&summary)?;

            let mut stop = false;
            if let (Some(stopper), Some(valid_loss)) = (stopper.as_mut(), summary.valid_loss) {
                match stopper.observe(epoch + 1, valid_loss) {
                    Verdict::Improved => {
                        best_valid_loss = Some(valid_loss);
                        if stopper.restore_best() {
                            best_model = Some(model.clone());
                        }
                    }
                    Verdict::Waiting => {}
                    Verdict::Stop => stop = true,
                }
            }

            if checkpoints.is_due(epoch + 1) {
                checkpoints.save::<B, _, _>(
                    &model,
                    &optim,
                    &CheckpointState {
                        epoch: epoch + 1,
                        best_valid_loss,
                        early_stopping: stopper.as_ref().map(EarlyStopping::state),
                    },
                )?;
            }
            summaries.push(summary);

            if stop {
                let best_epoch = stopper.as_ref().map_or(0, |s| s.state().best_epoch);
                info!("Early stopping at epoch {} (best was epoch {best_epoch})", epoch + 1);
                match best_model.take() {
                    Some(best) => {
                        info!("Restoring model weights from the end of the best epoch");
                        model = best;
                    }
                    None if stopper.as_ref().is_some_and(EarlyStopping::restore_best) => {
                        warn!("Best weights predate this process; keeping the latest weights");
                    }
                    None => {}
                }
                self.status = RunStatus::StoppedEarly { epoch: epoch + 1 };
                break;
            }
        }

        if !matches!(self.status, RunStatus::StoppedEarly { .. }) {
            self.status = RunStatus::Completed;
        }

        let final_path = layout.final_model_path();
        model
            .clone()
            .save_file(final_path.clone(), &CompactRecorder::new())
            .map_err(|err| checkpoint_error(&final_path, format!("{err:?}")))?;
        info!("Saved final model to {}", final_path.display());

        Ok(FitOutcome {
            model,
            status: self.status,
            start_epoch,
            summaries,
        })
    }
}

fn format_metric(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |value| format!("{value:.4}"))
}
