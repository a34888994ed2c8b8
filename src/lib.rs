#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! Automatic response-curve fitting for multi-channel gas sensing.
//!
//! Given a time-indexed series of per-channel relative deviation values,
//! the engine segments each channel into baseline and exposition phases,
//! fits a two-exponential response model by randomized-restart nonlinear
//! least squares (trust-region and Levenberg-Marquardt pools side by
//! side), and derives response metrics: response time `tau_90`, plateau
//! height and the 10%-of-plateau recovery time. Channels are fitted
//! concurrently on a bounded worker pool with a timeout-bounded wait.
//!
//! [`FitCoordinator`] is the interactive entry point (range detection,
//! manual range edits, progress events); [`AutomatedFitWorker`] wraps it
//! for headless batch runs ending in a semicolon-delimited results table.

pub mod batch;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod math;
pub mod minimisation;
pub mod model;
pub mod ranges;
pub mod report;
pub mod series;

pub use batch::{AutomatedFitWorker, BatchOutcome};
pub use config::FitConfig;
pub use coordinator::{FitCoordinator, FitEvent, FitResult, Phase};
pub use error::FitError;
pub use model::Parameters;
pub use ranges::ChannelRange;
pub use report::ResultsTable;
pub use series::TimeSeries;

pub type Result<T> = ::std::result::Result<T, error::FitError>;
