pub mod anchor;
pub mod checkpoint;
pub mod classification;
pub mod data;
pub mod detection;
pub mod driver;
pub mod early_stopping;
pub mod error;
pub mod geometry;
pub mod loss;
pub mod model;
pub mod module;
pub mod run;
pub mod schedule;
pub mod target;

pub use error::{Result, TrainError};
