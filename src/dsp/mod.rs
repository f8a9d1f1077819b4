pub mod nco;
pub mod resampler;

pub use nco::Nco;
pub use resampler::Resampler;
