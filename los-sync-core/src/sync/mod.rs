//! One sync run, end to end.

mod engine;
mod error;
mod report;

pub use engine::{SyncEngine, SyncOptions};
pub use error::SyncError;
pub use report::{PlannedCounts, SyncReport};
