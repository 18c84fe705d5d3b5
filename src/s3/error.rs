//! Errors raised by the signing, transport and S3 request layers

use hyper::StatusCode;
use thiserror::Error;

/// S3 client errors
#[derive(Error, Debug)]
pub enum S3Error {
    #[error("credentials expired at {expiry}")]
    CredentialExpired { expiry: chrono::DateTime<chrono::Utc> },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("S3 error: {status} {code} - {message}")]
    Server {
        status: StatusCode,
        code: String,
        message: String,
    },

    #[error("Access denied: {status} - {message}")]
    Auth { status: StatusCode, message: String },

    #[error("XML parse error: {0}")]
    XmlParse(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("request cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, S3Error>;

impl From<quick_xml::Error> for S3Error {
    fn from(err: quick_xml::Error) -> Self {
        S3Error::XmlParse(err.to_string())
    }
}

impl From<hyper::http::Error> for S3Error {
    fn from(err: hyper::http::Error) -> Self {
        S3Error::InvalidRequest(err.to_string())
    }
}

impl From<hyper_util::client::legacy::Error> for S3Error {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        S3Error::Network(format!("Client error: {}", err))
    }
}

impl S3Error {
    /// Whether a retry of the same request may succeed.
    ///
    /// Network failures, timeouts, throttling (429) and 5xx responses are
    /// transient. Every other 4xx, expired credentials and local errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            S3Error::Network(_) | S3Error::Timeout(_) => true,
            S3Error::Server { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
            _ => false,
        }
    }

    /// HTTP status carried by the error, if the server produced one
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            S3Error::Server { status, .. } | S3Error::Auth { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Build the error for a non-2xx response from its status and body.
    pub fn from_response(status: StatusCode, body: &[u8]) -> Self {
        let parsed = crate::s3::xml::parse_error_body(body);
        let message = parsed
            .as_ref()
            .map(|e| e.message.clone())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| String::from_utf8_lossy(body).trim().to_string());

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return S3Error::Auth { status, message };
        }

        let code = parsed
            .map(|e| e.code)
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("Unknown").to_string());
        S3Error::Server {
            status,
            code,
            message,
        }
    }
}
