use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use reqwest::header::{CONTENT_LENGTH, ETAG, LAST_MODIFIED, RANGE};
use reqwest::{Request, Response, StatusCode, Url};
use serde::Serialize;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;
use tracing::debug;

use super::error::{Result, S3Error};
use super::signer::RequestSigner;
use super::target::Target;

/// Object content handed to the caller; dropping it releases the connection
pub type ObjectBody = Pin<Box<dyn AsyncRead + Send>>;

/// Result of a full or ranged download
pub struct GetObjectOutput {
    pub body: ObjectBody,
    /// Content length of this response, when the server sent one
    pub size: Option<u64>,
    /// ETag with the surrounding quotes stripped
    pub etag: String,
}

impl std::fmt::Debug for GetObjectOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GetObjectOutput")
            .field("size", &self.size)
            .field("etag", &self.etag)
            .finish_non_exhaustive()
    }
}

/// Object metadata from a HEAD request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectStat {
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Client for one S3-compatible endpoint
#[derive(Debug, Clone)]
pub struct S3Client {
    http: reqwest::Client,
    endpoint: Url,
    signer: Arc<dyn RequestSigner>,
}

impl S3Client {
    pub fn new(http: reqwest::Client, endpoint: Url, signer: Arc<dyn RequestSigner>) -> Self {
        Self {
            http,
            endpoint,
            signer,
        }
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// `<endpoint>/<bucket>/<key>`, each key segment percent-encoded
    pub(crate) fn key_url(&self, target: &Target) -> Result<Url> {
        // URL normalisation would drop these and address another object
        let dot_segment = |s: &str| s == "." || s == "..";
        if dot_segment(target.bucket()) || target.key().split('/').any(dot_segment) {
            return Err(S3Error::InvalidArgument {
                bucket: target.bucket().to_string(),
                key: target.key().to_string(),
            });
        }

        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| S3Error::InvalidUrl {
                url: self.endpoint.to_string(),
                reason: "endpoint cannot carry a path".to_string(),
            })?
            .pop_if_empty()
            .push(target.bucket())
            .extend(target.key().split('/'));
        Ok(url)
    }

    /// Sign and send a request
    pub(crate) async fn execute(&self, mut request: Request) -> Result<Response> {
        self.signer.sign(&mut request)?;
        debug!("{} {}", request.method(), request.url());
        let response = self.http.execute(request).await?;
        debug!("Response status: {}", response.status());
        Ok(response)
    }

    /// Download a whole object
    pub async fn get(&self, target: &Target) -> Result<GetObjectOutput> {
        let request = self.http.get(self.key_url(target)?).build()?;
        let response = self.execute(request).await?;

        match response.status() {
            StatusCode::OK => Ok(into_output(response)),
            StatusCode::NOT_FOUND => Err(not_found(target)),
            _ => Err(S3Error::from_response(response).await),
        }
    }

    /// Download part of an object.
    ///
    /// A negative `length` reads from `offset` to the end of the object. A
    /// server that ignores the range and answers 200 with the full content is
    /// accepted as well.
    pub async fn get_partial(
        &self,
        target: &Target,
        offset: i64,
        length: i64,
    ) -> Result<GetObjectOutput> {
        let range = range_header(offset, length)?;
        let request = self
            .http
            .get(self.key_url(target)?)
            .header(RANGE, range)
            .build()?;
        let response = self.execute(request).await?;

        match response.status() {
            StatusCode::OK | StatusCode::PARTIAL_CONTENT => Ok(into_output(response)),
            StatusCode::NOT_FOUND => Err(not_found(target)),
            _ => Err(S3Error::from_response(response).await),
        }
    }

    /// Fetch size and modification time of an object
    pub async fn stat_object(&self, target: &Target) -> Result<ObjectStat> {
        if target.bucket().is_empty() || target.key().is_empty() {
            return Err(S3Error::InvalidArgument {
                bucket: target.bucket().to_string(),
                key: target.key().to_string(),
            });
        }

        let request = self.http.head(self.key_url(target)?).build()?;
        let response = self.execute(request).await?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(not_found(target)),
            StatusCode::OK => parse_stat(&response),
            _ => Err(S3Error::from_response(response).await),
        }
    }
}

/// `bytes=<offset>-<last>` for a bounded range, `bytes=<offset>-` otherwise.
///
/// An empty range has no Range header form and is rejected.
fn range_header(offset: i64, length: i64) -> Result<String> {
    if offset < 0 || length == 0 {
        return Err(S3Error::InvalidRange { offset, length });
    }
    if length >= 0 {
        Ok(format!("bytes={}-{}", offset, offset.saturating_add(length) - 1))
    } else {
        Ok(format!("bytes={}-", offset))
    }
}

fn not_found(target: &Target) -> S3Error {
    S3Error::ObjectNotFound {
        bucket: target.bucket().to_string(),
        key: target.key().to_string(),
    }
}

fn into_output(response: Response) -> GetObjectOutput {
    let etag = response
        .headers()
        .get(ETAG)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_matches('"').to_string())
        .unwrap_or_default();
    let size = response.content_length();
    let stream = response.bytes_stream().map_err(std::io::Error::other);

    GetObjectOutput {
        body: Box::pin(StreamReader::new(stream)),
        size,
        etag,
    }
}

fn parse_stat(response: &Response) -> Result<ObjectStat> {
    let headers = response.headers();

    let length = match headers.get(CONTENT_LENGTH) {
        Some(value) => value
            .to_str()
            .map_err(|e| S3Error::malformed("Content-Length", &format!("{:?}", value), e))?,
        None => "",
    };
    let size = length
        .parse::<u64>()
        .map_err(|e| S3Error::malformed("Content-Length", length, e))?;

    // RFC 1123 dates are valid RFC 2822 dates
    let last_modified = match headers.get(LAST_MODIFIED) {
        Some(value) => {
            let value = value
                .to_str()
                .map_err(|e| S3Error::malformed("Last-Modified", &format!("{:?}", value), e))?;
            let date = DateTime::parse_from_rfc2822(value)
                .map_err(|e| S3Error::malformed("Last-Modified", value, e))?;
            Some(date.with_timezone(&Utc))
        }
        None => None,
    };

    Ok(ObjectStat {
        size,
        last_modified,
    })
}
