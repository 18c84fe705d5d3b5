//! S3 client module with AWS SigV4 signing
//!
//! This module provides:
//! - AWS Signature Version 4 signing and presigning
//! - Atomically replaceable credentials
//! - A pluggable, cancellable HTTP transport
//! - Async S3 operations (list, get, put, head, delete, multipart)
//! - Type-safe S3 response structures

pub mod client;
pub mod credentials;
pub mod error;
pub mod signer;
pub mod transport;
pub mod types;
pub mod xml;

// Re-export main types for convenience
pub use client::S3Client;
pub use credentials::{CredentialStore, Credentials};
pub use error::{Result, S3Error};
pub use signer::{HttpRequest, PayloadHash, RequestSigner, SignedRequest};
pub use transport::{HttpTransport, RequestBody, Response, Transport};
pub use types::{
    CompleteMultipartUploadResponse, CompletedPart, CreateMultipartUploadResponse, DeleteResult,
    DownloadResult, ListingPage, ObjectMetadata, ObjectSummary, UploadResult,
};
