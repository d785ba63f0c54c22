//! Array operations shared by the estimator and the multi-scale driver.

pub mod fft;
pub mod resample;
