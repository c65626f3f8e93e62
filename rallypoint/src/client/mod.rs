mod context;
mod sync_context;
mod worker;

pub use context::RallyContext;
pub use sync_context::DistributedContext;
pub use worker::WorkerClient;
