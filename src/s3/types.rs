//! S3 types and response structures

use serde::{Deserialize, Serialize};

/// Object metadata from a listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSummary {
    /// Object key
    pub key: String,
    /// Last modified timestamp as returned by the server (ISO-8601)
    pub last_modified: Option<String>,
    /// ETag without surrounding quotes
    pub etag: Option<String>,
    /// Object size in bytes
    pub size: u64,
    /// Storage class (STANDARD, STANDARD_IA, ARCHIVE, ...)
    pub storage_class: Option<String>,
}

impl ObjectSummary {
    pub fn new(key: String, size: u64) -> Self {
        Self {
            key,
            last_modified: None,
            etag: None,
            size,
            storage_class: None,
        }
    }
}

/// One page of a ListObjectsV2 listing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingPage {
    /// Entries in server order
    pub entries: Vec<ObjectSummary>,
    /// Common prefixes (subdirectories when using delimiter)
    pub common_prefixes: Vec<String>,
    /// Token to request the next page
    pub continuation_token: Option<String>,
    /// Whether more pages follow
    pub is_truncated: bool,
}

/// Result of a completed upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResult {
    pub status_code: u16,
    #[serde(rename = "eTag")]
    pub etag: String,
    pub location: String,
}

/// Result of a completed download
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadResult {
    pub status_code: u16,
    #[serde(rename = "eTag")]
    pub etag: String,
    pub content_length: u64,
    /// Object bytes when downloading into memory
    #[serde(skip)]
    pub data: Option<bytes::Bytes>,
}

/// Result of a delete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteResult {
    pub status_code: u16,
}

/// Object metadata from a HEAD request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMetadata {
    pub status_code: u16,
    pub content_length: u64,
    #[serde(rename = "eTag")]
    pub etag: String,
    pub last_modified: Option<String>,
    pub content_type: Option<String>,
}

// =============================================================================
// Multipart Upload Types
// =============================================================================

/// Response from CreateMultipartUpload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateMultipartUploadResponse {
    pub bucket: String,
    pub key: String,
    /// Upload ID for subsequent UploadPart and Complete/Abort requests
    pub upload_id: String,
}

/// Part information for CompleteMultipartUpload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    /// Part number (1-10000)
    pub part_number: u32,
    /// ETag returned from UploadPart
    pub etag: String,
}

impl CompletedPart {
    pub fn new(part_number: u32, etag: String) -> Self {
        Self { part_number, etag }
    }
}

/// Response from CompleteMultipartUpload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompleteMultipartUploadResponse {
    /// Location URL of the completed object
    pub location: Option<String>,
    pub bucket: String,
    pub key: String,
    /// Aggregate ETag of the completed object
    pub etag: String,
}

/// `<Code>`/`<Message>` of an S3 error body
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// Strip the quotes servers put around ETag values
pub fn normalize_etag(raw: &str) -> String {
    raw.trim().trim_matches('"').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_etag() {
        assert_eq!(normalize_etag("\"abc\""), "abc");
        assert_eq!(normalize_etag("abc-3"), "abc-3");
        assert_eq!(normalize_etag(" \"x\" "), "x");
    }

    #[test]
    fn test_upload_result_field_names() {
        let result = UploadResult {
            status_code: 200,
            etag: "abc".to_string(),
            location: "https://s3.example.com/bucket/key".to_string(),
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["statusCode"], 200);
        assert_eq!(json["eTag"], "abc");
        assert_eq!(json["location"], "https://s3.example.com/bucket/key");
    }
}
