mod executor;
mod report;

pub use executor::MergeExecutor;
pub use report::{ExcludedConflict, MergeReport, MergeStatus, RepointCount};
