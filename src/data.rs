pub mod annotation;
pub mod augment;
pub mod cifar;
pub mod detection;
