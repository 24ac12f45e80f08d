use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::upstream::{UpstreamBody, UpstreamError, UpstreamSource};

enum Script {
    Feed(mpsc::UnboundedReceiver<Result<Bytes, UpstreamError>>),
    Reject(u16),
}

/// In-memory upstream whose bodies are driven by the test.
#[derive(Default)]
pub(crate) struct ScriptedUpstream {
    scripts: Mutex<HashMap<String, Script>>,
    opens: Mutex<HashMap<String, usize>>,
    open_delay: Option<Duration>,
}

impl ScriptedUpstream {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = Some(delay);
        self
    }

    /// Script the next open of `session_id` to succeed with a body fed
    /// through the returned handle.
    pub(crate) fn feed(&self, session_id: &str) -> UpstreamFeed {
        let (tx, rx) = mpsc::unbounded_channel();
        self.scripts
            .lock()
            .expect("scripts lock")
            .insert(session_id.to_string(), Script::Feed(rx));
        UpstreamFeed { tx }
    }

    pub(crate) fn reject(&self, session_id: &str, status: u16) {
        self.scripts
            .lock()
            .expect("scripts lock")
            .insert(session_id.to_string(), Script::Reject(status));
    }

    pub(crate) fn open_count(&self, session_id: &str) -> usize {
        self.opens
            .lock()
            .expect("opens lock")
            .get(session_id)
            .copied()
            .unwrap_or(0)
    }
}

impl UpstreamSource for ScriptedUpstream {
    fn open<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Result<UpstreamBody, UpstreamError>> {
        Box::pin(async move {
            *self
                .opens
                .lock()
                .expect("opens lock")
                .entry(session_id.to_string())
                .or_default() += 1;

            if let Some(delay) = self.open_delay {
                tokio::time::sleep(delay).await;
            }

            let script = self.scripts.lock().expect("scripts lock").remove(session_id);
            match script {
                Some(Script::Feed(rx)) => Ok(UnboundedReceiverStream::new(rx).boxed()),
                Some(Script::Reject(status)) => Err(UpstreamError::Status {
                    status,
                    body: Some("rejected".to_string()),
                }),
                None => Err(UpstreamError::Status {
                    status: 404,
                    body: Some("Session not found".to_string()),
                }),
            }
        })
    }
}

pub(crate) struct UpstreamFeed {
    tx: mpsc::UnboundedSender<Result<Bytes, UpstreamError>>,
}

impl UpstreamFeed {
    pub(crate) fn chunk(&self, chunk: impl Into<Bytes>) {
        let _ = self.tx.send(Ok(chunk.into()));
    }

    pub(crate) fn fail(&self, message: &str) {
        let _ = self.tx.send(Err(UpstreamError::Read(message.to_string())));
    }

    /// End the body cleanly.
    pub(crate) fn finish(self) {}

    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
