pub mod constants;
pub mod encoder;

pub use encoder::{frame_size_samples, sample_size_bytes, OpusEncoder};
