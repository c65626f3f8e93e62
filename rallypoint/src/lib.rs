pub mod client;
pub mod cluster;
pub mod collective;
pub mod config;
pub mod error;
pub mod group;
pub mod protocol;
pub mod transport;
pub mod types;

pub use client::{DistributedContext, RallyContext, WorkerClient};
pub use cluster::{Coordinator, CoordinatorHandle};
pub use collective::{Operation, OperationGroup};
pub use config::RallyConfig;
pub use error::{RallyError, Result};
pub use group::GroupDescriptor;
pub use protocol::RallyMessage;
pub use transport::TransportListener;
pub use types::{Failure, OperationKind, Outcome, Rank, SeriesKey};
