pub mod config;
pub mod detectors;
pub mod dsp;
pub mod error;
pub mod io;
pub mod metrics;
pub mod pipeline;
pub mod plot;
pub mod ranges;
pub mod session;
pub mod signal;
pub mod simulate;

pub use config::*;
pub use error::*;
pub use pipeline::*;
pub use signal::*;
