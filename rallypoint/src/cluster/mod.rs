mod coordinator;
pub mod tracker;

pub use coordinator::{Coordinator, CoordinatorHandle};
pub use tracker::{Progress, SeriesTracker, TrackerState};
