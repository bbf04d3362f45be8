pub mod adam;
pub mod classifier;
pub mod dataset;
pub mod gaussian_window;
pub mod ms_ssim;
pub mod optimizer;
pub mod ssim;
pub mod temporal_indicator;
pub mod utils;
