use percent_encoding::percent_decode_str;
use reqwest::Url;
use std::fmt;
use std::str::FromStr;

use super::error::{Result, S3Error};

/// A single remote object: bucket plus key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    bucket: String,
    key: String,
}

impl Target {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// An object address of the form `[scheme://]host[:port]/bucket/key`
///
/// Without a scheme, `https` is assumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectUrl {
    endpoint: Url,
    target: Target,
}

impl ObjectUrl {
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = |reason: &str| S3Error::InvalidUrl {
            url: input.to_string(),
            reason: reason.to_string(),
        };

        let with_scheme = if input.contains("://") {
            input.to_string()
        } else {
            format!("https://{}", input)
        };
        let url = Url::parse(&with_scheme).map_err(|e| invalid(&e.to_string()))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid("only http and https are supported"));
        }
        if url.host_str().is_none_or(str::is_empty) {
            return Err(invalid("missing host"));
        }

        let path = percent_decode_str(url.path().trim_start_matches('/'))
            .decode_utf8()
            .map_err(|e| invalid(&e.to_string()))?;
        let (bucket, key) = path
            .split_once('/')
            .ok_or_else(|| invalid("expected host/bucket/key"))?;
        if bucket.is_empty() {
            return Err(invalid("missing bucket"));
        }
        if key.is_empty() {
            return Err(invalid("missing key"));
        }

        let mut endpoint = url.clone();
        endpoint.set_path("/");
        endpoint.set_query(None);
        endpoint.set_fragment(None);

        Ok(Self {
            endpoint,
            target: Target::new(bucket, key),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn target(&self) -> &Target {
        &self.target
    }
}

impl FromStr for ObjectUrl {
    type Err = S3Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ObjectUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let host = self.endpoint.host_str().unwrap_or_default();
        match self.endpoint.port() {
            Some(port) => write!(f, "{}:{}/{}", host, port, self.target),
            None => write!(f, "{}/{}", host, self.target),
        }
    }
}
