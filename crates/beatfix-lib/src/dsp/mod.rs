pub mod filters;
pub mod smoothing;
pub mod stats;

pub use filters::*;
pub use smoothing::*;
pub use stats::*;
