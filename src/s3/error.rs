use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

/// Errors that can occur while talking to an S3-compatible endpoint
#[derive(Error, Debug)]
pub enum S3Error {
    /// Bucket or key empty, or a key with `.`/`..` segments; no request was built
    #[error("Invalid argument: bucket '{bucket}' and key '{key}' do not name an object")]
    InvalidArgument { bucket: String, key: String },

    /// Byte range that cannot be expressed as a Range header
    #[error("Invalid range: offset {offset} with length {length}")]
    InvalidRange { offset: i64, length: i64 },

    /// Object (or its bucket) does not exist
    #[error("Object not found: {bucket}/{key}")]
    ObjectNotFound { bucket: String, key: String },

    /// Any other non-success status from the server
    #[error("Request failed with status {status}{}", describe(.code, .message, .request_id))]
    Protocol {
        status: StatusCode,
        code: Option<String>,
        message: Option<String>,
        request_id: Option<String>,
    },

    /// Connection, DNS, TLS or timeout failure
    #[error("Network error: {0}")]
    Transport(#[from] reqwest::Error),

    /// A response header was present but could not be parsed
    #[error("Malformed {header} header '{value}': {reason}")]
    MalformedResponse {
        header: &'static str,
        value: String,
        reason: String,
    },

    /// Content hash given for an upload is not valid hex
    #[error("Invalid content hash '{value}'")]
    InvalidContentHash {
        value: String,
        #[source]
        source: hex::FromHexError,
    },

    #[error("Invalid object URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Unable to sign request: {0}")]
    Signing(String),

    /// Write attempted on an upload handle that was already closed
    #[error("Upload handle is already closed")]
    HandleClosed,

    /// The request finished before all content was written; close() has the outcome
    #[error("Upload ended before all data was written")]
    UploadEnded,

    /// Background upload ended without reporting an outcome
    #[error("Upload was interrupted before it completed")]
    UploadInterrupted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// First failure of a fan-out, annotated with every target attempted
    #[error("Unable to write to one or more targets [{}]: {source}", .targets.join(", "))]
    FanOut {
        targets: Vec<String>,
        #[source]
        source: Box<S3Error>,
    },
}

/// S3 XML error document
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct ErrorDocument {
    code: Option<String>,
    message: Option<String>,
    request_id: Option<String>,
}

fn describe(code: &Option<String>, message: &Option<String>, request_id: &Option<String>) -> String {
    let mut out = String::new();
    if let Some(code) = code {
        out.push_str(&format!(" ({code})"));
    }
    if let Some(message) = message {
        out.push_str(&format!(": {message}"));
    }
    if let Some(request_id) = request_id {
        out.push_str(&format!(" [request id {request_id}]"));
    }
    out
}

impl S3Error {
    /// Build a protocol error from an unexpected response, consuming its body
    pub async fn from_response(response: reqwest::Response) -> Self {
        let status = response.status();
        let header_request_id = response
            .headers()
            .get("x-amz-request-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = response.text().await.unwrap_or_default();
        let document = if body.trim().is_empty() {
            ErrorDocument::default()
        } else {
            quick_xml::de::from_str::<ErrorDocument>(&body).unwrap_or_else(|e| {
                tracing::debug!("Error response body is not an S3 error document: {}", e);
                ErrorDocument::default()
            })
        };

        Self::Protocol {
            status,
            code: document.code,
            message: document.message,
            request_id: document.request_id.or(header_request_id),
        }
    }

    /// Create a malformed-header error
    pub(crate) fn malformed(header: &'static str, value: &str, reason: impl ToString) -> Self {
        Self::MalformedResponse {
            header,
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error (or the fan-out failure it wraps) is a missing object
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::ObjectNotFound { .. } => true,
            Self::FanOut { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            Self::ObjectNotFound { bucket, key } => {
                format!(
                    "Object not found: {}/{}\n\nPossible solutions:\n  \
                     1. Check the bucket and key spelling\n  \
                     2. Verify the object exists: s3pipe stat <host>/{}/{}",
                    bucket, key, bucket, key
                )
            }
            Self::Protocol {
                status: StatusCode::FORBIDDEN,
                ..
            } => {
                format!(
                    "{}\n\nPossible solutions:\n  \
                     1. Check AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY in .env\n  \
                     2. Check AWS_REGION matches the bucket region\n  \
                     3. Verify the bucket policy allows this operation",
                    self
                )
            }
            Self::Transport(_) => {
                format!(
                    "{}\n\nPossible solutions:\n  \
                     1. Check your network connection\n  \
                     2. Verify the host in the object URL is reachable\n  \
                     3. Use an explicit http:// prefix for endpoints without TLS",
                    self
                )
            }
            Self::FanOut { targets, source } => {
                format!(
                    "Unable to write to one or more targets [{}]\n\n{}",
                    targets.join(", "),
                    source.user_message()
                )
            }
            _ => self.to_string(),
        }
    }
}

/// Result type for S3 operations
pub type Result<T> = std::result::Result<T, S3Error>;
