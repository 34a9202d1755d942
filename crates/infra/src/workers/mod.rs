pub mod command_worker;

pub use command_worker::{CommandWorker, WorkerHandle, WorkerStats};
