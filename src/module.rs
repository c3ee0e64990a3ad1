pub mod activation;
pub mod conv2d_norm;
pub mod quant;
pub mod residual;
