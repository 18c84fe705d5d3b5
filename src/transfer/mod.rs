//! Planned, concurrent, cancellable object transfers

pub mod engine;
pub mod error;
pub mod manager;
pub mod planner;
pub mod progress;
pub mod retry;
pub mod task;

pub use engine::TransferEngine;
pub use error::TransferError;
pub use manager::TransferManager;
pub use planner::{plan, PartRange, Strategy, TransferPlan};
pub use progress::{ProgressHub, ProgressReporter, ProgressSample};
pub use retry::RetryPolicy;
pub use task::{
    Direction, DownloadTarget, PartState, TaskSnapshot, TaskState, TransferOutcome, TransferPart,
    UploadSource,
};
