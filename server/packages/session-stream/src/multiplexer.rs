use std::sync::{Arc, Weak};
use std::time::Duration;

use session_stream_error::{StreamError, ABORTED_BY_USER};
use tokio::sync::oneshot;

use crate::broadcast::Subscription;
use crate::driver;
use crate::registry::StreamRegistry;
use crate::session::{Followup, SessionStatus, SessionStream, StreamInfo};
use crate::state::DriverEvent;
use crate::upstream::{UpstreamBody, UpstreamError, UpstreamSource};

const DEFAULT_COMPLETED_TTL: Duration = Duration::from_secs(60);
const COMPLETED_TTL_ENV: &str = "SESSION_STREAM_COMPLETED_TTL_MS";

#[derive(Debug, Clone)]
pub struct MultiplexerConfig {
    pub completed_ttl: Duration,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            completed_ttl: DEFAULT_COMPLETED_TTL,
        }
    }
}

impl MultiplexerConfig {
    pub fn completed_ttl(mut self, ttl: Duration) -> Self {
        self.completed_ttl = ttl;
        self
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(ttl) = std::env::var(COMPLETED_TTL_ENV)
            .ok()
            .and_then(|value| value.trim().parse::<u64>().ok())
            .filter(|ms| *ms > 0)
        {
            config.completed_ttl = Duration::from_millis(ttl);
        }
        config
    }
}

struct Inner {
    registry: StreamRegistry,
    upstream: Arc<dyn UpstreamSource>,
    config: MultiplexerConfig,
}

/// Shares one upstream generation per session among any number of
/// downstream subscribers.
#[derive(Clone)]
pub struct StreamMultiplexer {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for StreamMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamMultiplexer")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl StreamMultiplexer {
    pub fn new(upstream: Arc<dyn UpstreamSource>, config: MultiplexerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: StreamRegistry::new(),
                upstream,
                config,
            }),
        }
    }

    pub fn config(&self) -> &MultiplexerConfig {
        &self.inner.config
    }

    /// Attach to the session's live stream, opening the upstream first if
    /// nobody is streaming it yet.
    ///
    /// The returned subscription yields the buffered frames followed by live
    /// ones. Open failures are returned here and leave nothing behind.
    pub async fn start_or_join(&self, session_id: &str) -> Result<Subscription, StreamError> {
        if session_id.trim().is_empty() {
            return Err(StreamError::InvalidRequest {
                message: "session id must not be empty".to_string(),
            });
        }

        loop {
            let (session, created) = self.inner.registry.get_or_create(session_id).await;
            // A record can turn terminal between lookup and join; the next
            // lookup replaces it.
            let Some(subscription) = session.join() else {
                continue;
            };

            if created {
                tracing::info!(session_id = session_id, "starting session stream");
                let (opened_tx, opened_rx) = oneshot::channel();
                let mux = self.clone();
                let driven = Arc::clone(&session);
                tokio::spawn(async move {
                    mux.run_session(driven, opened_tx).await;
                });
                // The session task owns the open; dropping this future only
                // drops the caller's subscription.
                match opened_rx.await {
                    Ok(opened) => opened?,
                    Err(_) => return Err(terminal_error(&session)),
                }
            }
            return Ok(subscription);
        }
    }

    /// Open the upstream, report the outcome to the creator, then pump the
    /// body until the session is terminal.
    async fn run_session(
        self,
        session: Arc<SessionStream>,
        opened_tx: oneshot::Sender<Result<(), StreamError>>,
    ) {
        let body = match self.open_upstream(&session).await {
            Ok(body) => body,
            Err(err) => {
                let _ = opened_tx.send(Err(err));
                return;
            }
        };
        let _ = opened_tx.send(Ok(()));

        let followup = driver::consume(&session, body).await;
        self.apply_followup(&session, followup).await;
    }

    async fn open_upstream(
        &self,
        session: &Arc<SessionStream>,
    ) -> Result<UpstreamBody, StreamError> {
        let cancel = session.cancel_token();
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(terminal_error(session)),
            opened = self.inner.upstream.open(session.id()) => opened,
        };

        match opened {
            Ok(body) => {
                let followup = session.handle(DriverEvent::Opened);
                if followup.terminal {
                    return Err(terminal_error(session));
                }
                Ok(body)
            }
            Err(err) => {
                let error = open_error(session.id(), err);
                tracing::warn!(
                    session_id = session.id(),
                    error = %error,
                    "failed to open upstream stream"
                );
                let followup = session.handle(DriverEvent::OpenFailed(error.to_string()));
                if !followup.applied {
                    return Err(terminal_error(session));
                }
                self.apply_followup(session, followup).await;
                Err(error)
            }
        }
    }

    async fn apply_followup(&self, session: &Arc<SessionStream>, followup: Followup) {
        if followup.remove_now && self.inner.registry.remove_if_same(session.id(), session).await {
            tracing::debug!(session_id = session.id(), "session stream removed");
        }

        if followup.schedule_cleanup {
            let ttl = self.inner.config.completed_ttl;
            let inner: Weak<Inner> = Arc::downgrade(&self.inner);
            let session = Arc::clone(session);
            tracing::debug!(
                session_id = session.id(),
                ttl_ms = ttl.as_millis() as u64,
                "scheduled session stream cleanup"
            );
            tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                if inner.registry.reap(session.id(), &session).await {
                    tracing::info!(session_id = session.id(), "reclaimed session stream");
                } else {
                    tracing::debug!(session_id = session.id(), "session stream kept past ttl");
                }
            });
        }
    }

    /// Cancel a running generation. Returns `false` when there is nothing
    /// live to cancel, including sessions that already completed.
    pub async fn abort(&self, session_id: &str) -> bool {
        let Some(session) = self.inner.registry.get(session_id).await else {
            return false;
        };

        let followup = session.handle(DriverEvent::Aborted);
        if !followup.applied {
            return false;
        }
        self.apply_followup(&session, followup).await;
        tracing::info!(session_id = session_id, "session stream aborted");
        true
    }

    pub async fn status(&self, session_id: &str) -> SessionStatus {
        match self.inner.registry.get(session_id).await {
            Some(session) => session.status(),
            None => SessionStatus::idle(),
        }
    }

    pub async fn list(&self) -> Vec<StreamInfo> {
        let mut streams = self
            .inner
            .registry
            .list()
            .await
            .iter()
            .map(|session| session.info())
            .collect::<Vec<_>>();
        streams.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        streams
    }

    /// Terminate every live session and forget all records.
    pub async fn shutdown(&self) {
        let sessions = self.inner.registry.drain().await;
        let mut stopped = 0usize;
        for session in &sessions {
            if session.handle(DriverEvent::Shutdown).applied {
                stopped += 1;
            }
        }
        tracing::info!(
            records = sessions.len(),
            stopped = stopped,
            "session streams shut down"
        );
    }
}

fn open_error(session_id: &str, err: UpstreamError) -> StreamError {
    match err {
        UpstreamError::Status { status, body } => StreamError::UpstreamStatus {
            session_id: session_id.to_string(),
            status,
            body,
        },
        other => StreamError::UpstreamOpen {
            session_id: session_id.to_string(),
            message: other.to_string(),
        },
    }
}

/// Error for a session that went terminal while its upstream was opening.
fn terminal_error(session: &SessionStream) -> StreamError {
    match session.status().error {
        Some(message) if message != ABORTED_BY_USER => StreamError::StreamFailed {
            session_id: session.id().to_string(),
            message,
        },
        _ => StreamError::Aborted {
            session_id: session.id().to_string(),
        },
    }
}
