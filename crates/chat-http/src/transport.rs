//! HTTP transport seam
//!
//! The request executor talks to the network only through [`HttpTransport`].
//! [`ReqwestTransport`] is the production implementation; tests plug in an
//! in-memory transport that scripts responses and records timing.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use std::error::Error as StdError;
use std::io;
use url::Url;

/// A file uploaded with a multipart request
#[derive(Debug, Clone)]
pub struct FileAttachment {
    pub filename: String,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

impl FileAttachment {
    pub fn new(filename: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            filename: filename.into(),
            content_type: None,
            data: data.into(),
        }
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Request body
///
/// Bodies are kept in a replayable form since a call may be attempted
/// several times.
#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(serde_json::Value),
    /// `payload_json` part plus `files[n]` parts
    Multipart {
        payload_json: Option<serde_json::Value>,
        files: Vec<FileAttachment>,
    },
}

/// One outbound HTTP request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: RequestBody,
}

/// A fully-read HTTP response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    /// Response with a JSON body and matching content type
    pub fn json(status: StatusCode, body: &serde_json::Value) -> Self {
        let mut response = Self::new(status);
        response
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response.body = body.to_string().into_bytes();
        response
    }

    /// Add a header; invalid names or values are skipped
    pub fn header(mut self, name: &str, value: impl AsRef<str>) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value.as_ref()),
        ) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn is_json(&self) -> bool {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("application/json"))
    }
}

/// Transport-level failures (no HTTP status was received)
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection reset by peer")]
    ConnectionReset,

    #[error("request timed out")]
    Timeout,

    #[error("failed to build request: {0}")]
    Build(String),

    #[error("request failed: {0}")]
    Request(String),
}

impl TransportError {
    /// Transient resets are the only transport failure worth retrying
    pub fn is_connection_reset(&self) -> bool {
        matches!(self, Self::ConnectionReset)
    }
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// [`HttpTransport`] backed by a pooled `reqwest::Client`
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn build_form(
        payload_json: Option<serde_json::Value>,
        files: Vec<FileAttachment>,
    ) -> Result<reqwest::multipart::Form, TransportError> {
        let mut form = reqwest::multipart::Form::new();
        if let Some(payload) = payload_json {
            let part = reqwest::multipart::Part::text(payload.to_string())
                .mime_str("application/json")
                .map_err(|e| TransportError::Build(e.to_string()))?;
            form = form.part("payload_json", part);
        }
        for (index, file) in files.into_iter().enumerate() {
            let mut part = reqwest::multipart::Part::bytes(file.data).file_name(file.filename);
            if let Some(content_type) = file.content_type {
                part = part
                    .mime_str(&content_type)
                    .map_err(|e| TransportError::Build(e.to_string()))?;
            }
            form = form.part(format!("files[{index}]"), part);
        }
        Ok(form)
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = self
            .client
            .request(request.method, request.url)
            .headers(request.headers);

        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder
                .header(CONTENT_TYPE, "application/json")
                .body(value.to_string()),
            RequestBody::Multipart {
                payload_json,
                files,
            } => builder.multipart(Self::build_form(payload_json, files)?),
        };

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(map_reqwest_error)?.to_vec();

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        return TransportError::Timeout;
    }
    if is_connection_reset(&err) {
        return TransportError::ConnectionReset;
    }
    TransportError::Request(err.to_string())
}

/// Walk the source chain looking for a reset/aborted socket
fn is_connection_reset(err: &(dyn StdError + 'static)) -> bool {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            if matches!(
                io_err.kind(),
                io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
            ) {
                return true;
            }
        }
        current = e.source();
    }
    false
}
