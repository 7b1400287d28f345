//! Request authentication.
//!
//! Every request the client sends passes through a [`RequestSigner`] right
//! before it goes on the wire. [`SigV4Signer`] implements AWS Signature
//! Version 4 with header-based authentication; streamed bodies are signed as
//! `UNSIGNED-PAYLOAD` so they never need to be buffered.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use reqwest::Request;
use reqwest::header::{AUTHORIZATION, HeaderName, HeaderValue};
use sha2::{Digest, Sha256};
use std::fmt;

use super::error::{Result, S3Error};

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SERVICE: &str = "s3";
const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";
const X_AMZ_DATE: &str = "x-amz-date";
const X_AMZ_CONTENT_SHA256: &str = "x-amz-content-sha256";
const X_AMZ_SECURITY_TOKEN: &str = "x-amz-security-token";

// RFC 3986 unreserved characters stay as-is
const URI_ENCODE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Applies authentication to a fully built request
pub trait RequestSigner: Send + Sync + fmt::Debug {
    fn sign(&self, request: &mut Request) -> Result<()>;
}

/// Leaves requests untouched, for public buckets
#[derive(Debug, Default, Clone, Copy)]
pub struct AnonymousSigner;

impl RequestSigner for AnonymousSigner {
    fn sign(&self, _request: &mut Request) -> Result<()> {
        Ok(())
    }
}

/// Static access key credentials
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"** redacted **")
            .field("session_token", &self.session_token.as_ref().map(|_| "** redacted **"))
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct SigV4Signer {
    credentials: Credentials,
    region: String,
}

impl SigV4Signer {
    pub fn new(credentials: Credentials, region: impl Into<String>) -> Self {
        Self {
            credentials,
            region: region.into(),
        }
    }

    fn sign_at(&self, request: &mut Request, now: DateTime<Utc>) -> Result<()> {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();

        let payload_hash = match request.body() {
            None => hex::encode(Sha256::digest(b"")),
            Some(body) => match body.as_bytes() {
                Some(bytes) => hex::encode(Sha256::digest(bytes)),
                None => UNSIGNED_PAYLOAD.to_string(),
            },
        };

        let headers = request.headers_mut();
        headers.insert(X_AMZ_DATE, header_value(&amz_date)?);
        headers.insert(X_AMZ_CONTENT_SHA256, header_value(&payload_hash)?);
        if let Some(token) = &self.credentials.session_token {
            headers.insert(X_AMZ_SECURITY_TOKEN, header_value(token)?);
        }

        let (signed_headers, canonical_headers) = canonical_headers(request)?;
        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            request.method().as_str(),
            canonical_uri(request),
            canonical_query(request),
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let scope = format!("{}/{}/{}/aws4_request", date, self.region, SERVICE);
        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            ALGORITHM,
            amz_date,
            scope,
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let key = signing_key(
            &self.credentials.secret_access_key,
            &date,
            &self.region,
            SERVICE,
        )?;
        let signature = hex::encode(hmac(&key, string_to_sign.as_bytes())?);

        let authorization = format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            ALGORITHM, self.credentials.access_key_id, scope, signed_headers, signature
        );
        request
            .headers_mut()
            .insert(AUTHORIZATION, header_value(&authorization)?);

        Ok(())
    }
}

impl RequestSigner for SigV4Signer {
    fn sign(&self, request: &mut Request) -> Result<()> {
        self.sign_at(request, Utc::now())
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| S3Error::Signing(e.to_string()))
}

fn hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| S3Error::Signing(e.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> Result<Vec<u8>> {
    let k_date = hmac(format!("AWS4{}", secret).as_bytes(), date.as_bytes())?;
    let k_region = hmac(&k_date, region.as_bytes())?;
    let k_service = hmac(&k_region, service.as_bytes())?;
    hmac(&k_service, b"aws4_request")
}

/// The host header hyper will send: host, plus port when not the default
fn host_header(request: &Request) -> String {
    let url = request.url();
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

fn is_signed_header(name: &HeaderName) -> bool {
    let name = name.as_str();
    name == "content-md5" || name == "range" || name.starts_with("x-amz-")
}

fn canonical_headers(request: &Request) -> Result<(String, String)> {
    let mut entries = vec![("host".to_string(), host_header(request))];
    for (name, value) in request.headers() {
        if is_signed_header(name) {
            let value = value
                .to_str()
                .map_err(|e| S3Error::Signing(format!("header {}: {}", name, e)))?;
            entries.push((name.as_str().to_string(), value.trim().to_string()));
        }
    }
    entries.sort();

    let signed = entries
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(";");
    let canonical = entries
        .iter()
        .map(|(name, value)| format!("{}:{}\n", name, value))
        .collect::<String>();
    Ok((signed, canonical))
}

fn canonical_uri(request: &Request) -> String {
    let segments = request
        .url()
        .path()
        .split('/')
        .map(|segment| {
            let decoded = percent_decode_str(segment).decode_utf8_lossy();
            utf8_percent_encode(&decoded, URI_ENCODE).to_string()
        })
        .collect::<Vec<_>>();
    let uri = segments.join("/");
    if uri.starts_with('/') {
        uri
    } else {
        format!("/{}", uri)
    }
}

fn canonical_query(request: &Request) -> String {
    let mut pairs = request
        .url()
        .query_pairs()
        .map(|(k, v)| {
            (
                utf8_percent_encode(&k, URI_ENCODE).to_string(),
                utf8_percent_encode(&v, URI_ENCODE).to_string(),
            )
        })
        .collect::<Vec<_>>();
    pairs.sort();
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}
