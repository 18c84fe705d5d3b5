//! Paginated object listing
//!
//! `list_page` issues one ListObjectsV2 request. `ObjectLister` turns a
//! sequence of those requests into a lazy stream of entries: the next page is
//! only fetched once the entries of the previous one have been consumed.

use crate::s3::types::{ListingPage, ObjectSummary};
use crate::s3::{Result, S3Client, S3Error};
use futures::stream::{self, BoxStream, Stream, StreamExt, TryStreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};

/// Largest page the server hands out
pub const MAX_KEYS_LIMIT: u32 = 1000;

/// Fetch a single page.
///
/// Pages are independent: the same token always asks for the same slice.
pub async fn list_page(
    client: &S3Client,
    bucket: &str,
    prefix: Option<&str>,
    delimiter: Option<&str>,
    continuation_token: Option<&str>,
    max_keys: u32,
) -> Result<ListingPage> {
    if bucket.is_empty() {
        return Err(S3Error::InvalidRequest("bucket must not be empty".to_string()));
    }
    if max_keys == 0 || max_keys > MAX_KEYS_LIMIT {
        return Err(S3Error::InvalidRequest(format!(
            "max_keys must be between 1 and {}, got {}",
            MAX_KEYS_LIMIT, max_keys
        )));
    }

    let page = client
        .list_objects_v2(bucket, prefix, delimiter, continuation_token, max_keys)
        .await?;
    tracing::debug!(
        bucket,
        entries = page.entries.len(),
        truncated = page.is_truncated,
        "listed page"
    );
    Ok(page)
}

/// Parameters of a listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListRequest {
    pub bucket: String,
    pub prefix: Option<String>,
    pub delimiter: Option<String>,
    pub max_keys: u32,
    /// Resume after a previously returned continuation token
    pub start_token: Option<String>,
}

impl ListRequest {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: None,
            delimiter: None,
            max_keys: MAX_KEYS_LIMIT,
            start_token: None,
        }
    }
}

struct PageCursor {
    client: S3Client,
    request: ListRequest,
    token: Option<String>,
    done: bool,
}

/// Lazy stream of the pages of a listing
pub fn pages(client: S3Client, request: ListRequest) -> BoxStream<'static, Result<ListingPage>> {
    let cursor = PageCursor {
        client,
        token: request.start_token.clone(),
        request,
        done: false,
    };

    stream::try_unfold(cursor, |mut cursor| async move {
        if cursor.done {
            return Ok(None);
        }

        let page = list_page(
            &cursor.client,
            &cursor.request.bucket,
            cursor.request.prefix.as_deref(),
            cursor.request.delimiter.as_deref(),
            cursor.token.as_deref(),
            cursor.request.max_keys,
        )
        .await?;

        if page.is_truncated {
            match &page.continuation_token {
                Some(next) if cursor.token.as_ref() != Some(next) => {
                    cursor.token = Some(next.clone());
                }
                _ => {
                    return Err(S3Error::InvalidResponse(
                        "truncated listing did not advance its continuation token".to_string(),
                    ))
                }
            }
        } else {
            cursor.done = true;
        }

        Ok(Some((page, cursor)))
    })
    .boxed()
}

/// Lazy stream of every `ObjectSummary` matching a `ListRequest`, in server order
pub struct ObjectLister {
    inner: BoxStream<'static, Result<ObjectSummary>>,
}

impl ObjectLister {
    pub fn new(client: S3Client, request: ListRequest) -> Self {
        let inner = pages(client, request)
            .map_ok(|page| stream::iter(page.entries.into_iter().map(Ok::<_, S3Error>)))
            .try_flatten()
            .boxed();
        Self { inner }
    }

    /// Drain the listing into memory
    pub async fn collect_all(self) -> Result<Vec<ObjectSummary>> {
        self.try_collect().await
    }
}

impl Stream for ObjectLister {
    type Item = Result<ObjectSummary>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl std::fmt::Debug for ObjectLister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectLister").finish_non_exhaustive()
    }
}
