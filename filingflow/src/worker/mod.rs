//! Queue backend and worker pool.

mod pool;
mod queue;
mod shutdown;
mod undelivered;

pub use pool::{WorkerPool, WorkerStats, STOPPED_BEFORE_DELIVERY};
pub use queue::{TaskQueue, TaskReceiver, CLOSED_BEFORE_DELIVERY};
pub use shutdown::ShutdownToken;
