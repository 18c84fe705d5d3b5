//! Command-line front end: `ls`, `put`, `get`, `rm`, `stat` and `presign`
//!
//! ```bash
//! s3xfer ls s3://bucket/photos/ --recursive
//! s3xfer put ./video.mp4 s3://bucket/videos/
//! s3xfer get s3://bucket/videos/video.mp4 ./copy.mp4
//! s3xfer presign s3://bucket/videos/video.mp4 --expires 1h
//! ```

pub mod args;
pub mod commands;
