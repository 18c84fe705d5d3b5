//! s3xfer - resumable, concurrent transfers against S3-compatible object storage

pub mod cli;
pub mod config;
pub mod listing;
pub mod s3;
pub mod transfer;

pub use config::Config;
pub use transfer::TransferManager;
