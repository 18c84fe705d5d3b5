//! XML bodies exchanged with the S3 API
//!
//! Parsers use byte-slice tag matching and `std::mem::take` so that no
//! String is allocated per tag. Text is kept verbatim: keys, prefixes and
//! tokens may carry leading or trailing whitespace. Only numeric and
//! boolean fields are trimmed.

use crate::s3::error::{Result, S3Error};
use crate::s3::types::{
    normalize_etag, CompleteMultipartUploadResponse, CompletedPart, CreateMultipartUploadResponse,
    ErrorBody, ListingPage, ObjectSummary,
};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::fmt::Write as FmtWrite;

fn new_reader(xml_data: &[u8]) -> Reader<&[u8]> {
    Reader::from_reader(xml_data)
}

/// Parse a ListObjectsV2 response
pub fn parse_list_response(xml_data: &[u8]) -> Result<ListingPage> {
    let mut reader = new_reader(xml_data);

    let mut page = ListingPage::default();
    let mut current_object: Option<ObjectSummary> = None;
    let mut current_text = String::with_capacity(256);
    let mut in_common_prefixes = false;
    let mut saw_root = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                current_text.clear();
                match e.local_name().as_ref() {
                    b"ListBucketResult" => saw_root = true,
                    b"Contents" => {
                        current_object = Some(ObjectSummary::new(String::new(), 0));
                    }
                    b"CommonPrefixes" => in_common_prefixes = true,
                    _ => {}
                }
            }
            Ok(Event::Text(e)) => current_text.push_str(&e.unescape()?),
            Ok(Event::End(e)) => {
                match e.local_name().as_ref() {
                    b"Key" => {
                        if let Some(ref mut obj) = current_object {
                            obj.key = std::mem::take(&mut current_text);
                        }
                    }
                    b"Size" => {
                        if let Some(ref mut obj) = current_object {
                            obj.size = current_text.trim().parse().map_err(|_| {
                                S3Error::XmlParse(format!("invalid Size: {}", current_text))
                            })?;
                        }
                    }
                    b"LastModified" => {
                        if let Some(ref mut obj) = current_object {
                            obj.last_modified = Some(current_text.trim().to_string());
                        }
                    }
                    b"ETag" => {
                        if let Some(ref mut obj) = current_object {
                            obj.etag = Some(normalize_etag(&current_text));
                        }
                    }
                    b"StorageClass" => {
                        if let Some(ref mut obj) = current_object {
                            obj.storage_class = Some(std::mem::take(&mut current_text));
                        }
                    }
                    b"Contents" => {
                        if let Some(obj) = current_object.take() {
                            page.entries.push(obj);
                        }
                    }
                    b"CommonPrefixes" => in_common_prefixes = false,
                    b"Prefix" if in_common_prefixes => {
                        page.common_prefixes.push(std::mem::take(&mut current_text));
                    }
                    b"IsTruncated" => {
                        page.is_truncated = current_text.trim() == "true";
                    }
                    b"NextContinuationToken" => {
                        page.continuation_token = Some(std::mem::take(&mut current_text));
                    }
                    _ => {}
                }
                current_text.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(e.into()),
            _ => {}
        }
    }

    if !saw_root {
        return Err(S3Error::XmlParse(
            "missing ListBucketResult element".to_string(),
        ));
    }
    if page.is_truncated && page.continuation_token.is_none() {
        return Err(S3Error::InvalidResponse(
            "truncated listing without NextContinuationToken".to_string(),
        ));
    }

    Ok(page)
}

/// Parse a CreateMultipartUpload (InitiateMultipartUploadResult) response
pub fn parse_create_multipart_response(xml_data: &[u8]) -> Result<CreateMultipartUploadResponse> {
    let mut reader = new_reader(xml_data);

    let mut bucket = String::new();
    let mut key = String::new();
    let mut upload_id = String::new();
    let mut current_text = String::with_capacity(256);

    loop {
        match reader.read_event() {
            Ok(Event::Start(_)) => current_text.clear(),
            Ok(Event::Text(e)) => current_text.push_str(&e.unescape()?),
            Ok(Event::End(e)) => {
                match e.local_name().as_ref() {
                    b"Bucket" => bucket = std::mem::take(&mut current_text),
                    b"Key" => key = std::mem::take(&mut current_text),
                    b"UploadId" => upload_id = std::mem::take(&mut current_text),
                    _ => {}
                }
                current_text.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(e.into()),
            _ => {}
        }
    }

    if upload_id.is_empty() {
        return Err(S3Error::InvalidResponse(
            "Missing UploadId in response".to_string(),
        ));
    }

    Ok(CreateMultipartUploadResponse {
        bucket,
        key,
        upload_id,
    })
}

/// Parse a CompleteMultipartUpload response.
///
/// S3 may answer 200 with an `<Error>` body when completion fails after the
/// headers were sent; that case is surfaced as a server error.
pub fn parse_complete_multipart_response(xml_data: &[u8]) -> Result<CompleteMultipartUploadResponse> {
    if let Some(err) = parse_error_body(xml_data) {
        return Err(S3Error::Server {
            status: hyper::StatusCode::INTERNAL_SERVER_ERROR,
            code: err.code,
            message: err.message,
        });
    }

    let mut reader = new_reader(xml_data);

    let mut location = None;
    let mut bucket = String::new();
    let mut key = String::new();
    let mut etag = String::new();
    let mut current_text = String::with_capacity(256);

    loop {
        match reader.read_event() {
            Ok(Event::Start(_)) => current_text.clear(),
            Ok(Event::Text(e)) => current_text.push_str(&e.unescape()?),
            Ok(Event::End(e)) => {
                match e.local_name().as_ref() {
                    b"Location" => location = Some(std::mem::take(&mut current_text)),
                    b"Bucket" => bucket = std::mem::take(&mut current_text),
                    b"Key" => key = std::mem::take(&mut current_text),
                    b"ETag" => etag = normalize_etag(&current_text),
                    _ => {}
                }
                current_text.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(e.into()),
            _ => {}
        }
    }

    if etag.is_empty() {
        return Err(S3Error::InvalidResponse(
            "Missing ETag in CompleteMultipartUpload response".to_string(),
        ));
    }

    Ok(CompleteMultipartUploadResponse {
        location,
        bucket,
        key,
        etag,
    })
}

/// Parse an `<Error>` document; `None` when the body is not one
pub fn parse_error_body(xml_data: &[u8]) -> Option<ErrorBody> {
    let mut reader = new_reader(xml_data);
    let mut in_error = false;
    let mut body = ErrorBody::default();
    let mut current_text = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                current_text.clear();
                if e.local_name().as_ref() == b"Error" {
                    in_error = true;
                }
            }
            Ok(Event::Text(e)) => current_text.push_str(&e.unescape().ok()?),
            Ok(Event::End(e)) => {
                match e.local_name().as_ref() {
                    b"Code" if in_error => body.code = current_text.trim().to_string(),
                    b"Message" if in_error => body.message = current_text.trim().to_string(),
                    _ => {}
                }
                current_text.clear();
            }
            Ok(Event::Eof) => break,
            Err(_) => return None,
            _ => {}
        }
    }

    in_error.then_some(body)
}

/// Build the CompleteMultipartUpload body. Parts must already be sorted.
pub fn complete_multipart_body(parts: &[CompletedPart]) -> String {
    let mut xml = String::with_capacity(parts.len() * 100 + 100);
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>");
    xml.push_str("<CompleteMultipartUpload>");
    for part in parts {
        xml.push_str("<Part><PartNumber>");
        let _ = write!(xml, "{}", part.part_number);
        xml.push_str("</PartNumber><ETag>\"");
        xml_escape_into(&mut xml, part.etag.trim_matches('"'));
        xml.push_str("\"</ETag></Part>");
    }
    xml.push_str("</CompleteMultipartUpload>");
    xml
}

/// Escape XML special characters into an existing buffer
fn xml_escape_into(buf: &mut String, s: &str) {
    for ch in s.chars() {
        match ch {
            '&' => buf.push_str("&amp;"),
            '<' => buf.push_str("&lt;"),
            '>' => buf.push_str("&gt;"),
            '"' => buf.push_str("&quot;"),
            '\'' => buf.push_str("&apos;"),
            _ => buf.push(ch),
        }
    }
}
