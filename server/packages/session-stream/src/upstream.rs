use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use reqwest::{Client, Url};
use thiserror::Error;

/// Upper bound on how much of a rejection body is kept for diagnostics.
const MAX_ERROR_BODY: usize = 2048;

pub type UpstreamBody = BoxStream<'static, Result<Bytes, UpstreamError>>;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("invalid upstream url `{url}`: {message}")]
    InvalidUrl { url: String, message: String },
    #[error("upstream request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("upstream responded with status {status}")]
    Status { status: u16, body: Option<String> },
    #[error("upstream read failed: {0}")]
    Read(String),
}

/// Source of per-session generation streams.
pub trait UpstreamSource: Send + Sync + 'static {
    fn open<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Result<UpstreamBody, UpstreamError>>;
}

/// Streams generations from the Python service at
/// `{base}/sessions/{id}/stream`.
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: Client,
    base_url: Url,
}

impl HttpUpstream {
    pub fn new(base_url: &str) -> Result<Self, UpstreamError> {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: &str) -> Result<Self, UpstreamError> {
        let parsed = Url::parse(base_url).map_err(|err| UpstreamError::InvalidUrl {
            url: base_url.to_string(),
            message: err.to_string(),
        })?;
        if parsed.cannot_be_a_base() {
            return Err(UpstreamError::InvalidUrl {
                url: base_url.to_string(),
                message: "url cannot be a base".to_string(),
            });
        }
        Ok(Self {
            client,
            base_url: parsed,
        })
    }

    pub fn stream_url(&self, session_id: &str) -> Result<Url, UpstreamError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| UpstreamError::InvalidUrl {
                url: self.base_url.to_string(),
                message: "url cannot be a base".to_string(),
            })?
            .pop_if_empty()
            .extend(["sessions", session_id, "stream"]);
        Ok(url)
    }
}

impl UpstreamSource for HttpUpstream {
    fn open<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Result<UpstreamBody, UpstreamError>> {
        Box::pin(async move {
            let url = self.stream_url(session_id)?;
            tracing::debug!(session_id = session_id, url = %url, "opening upstream stream");

            let response = self
                .client
                .get(url)
                .header(ACCEPT, "text/event-stream")
                .header(CACHE_CONTROL, "no-cache")
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                let body = response
                    .text()
                    .await
                    .ok()
                    .filter(|body| !body.is_empty())
                    .map(truncate_body);
                return Err(UpstreamError::Status {
                    status: status.as_u16(),
                    body,
                });
            }

            Ok(response
                .bytes_stream()
                .map_err(|err| UpstreamError::Read(err.to_string()))
                .boxed())
        })
    }
}

fn truncate_body(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY {
        let mut end = MAX_ERROR_BODY;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    body
}
