use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use bytes::Bytes;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::broadcast::{Broadcaster, Subscription};
use crate::parser::{Frame, TextDelta};
use crate::state::{transition, DriverEvent, Effect, Phase};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Idle,
    Generating,
    Completed,
    Errored,
}

impl From<Phase> for StreamStatus {
    fn from(phase: Phase) -> Self {
        match phase {
            Phase::Connecting | Phase::Generating => StreamStatus::Generating,
            Phase::Completed => StreamStatus::Completed,
            Phase::Errored => StreamStatus::Errored,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub status: StreamStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SessionStatus {
    pub fn idle() -> Self {
        Self {
            status: StreamStatus::Idle,
            content: None,
            reasoning: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInfo {
    pub session_id: String,
    pub status: StreamStatus,
    pub subscribers: usize,
    pub frames: usize,
    pub bytes: usize,
    pub age_ms: u64,
    pub idle_ms: u64,
}

/// Registry follow-up requested by a transition. The record cannot touch
/// the registry itself while its own lock is held.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Followup {
    pub applied: bool,
    pub terminal: bool,
    pub remove_now: bool,
    pub schedule_cleanup: bool,
}

#[derive(Debug)]
struct SessionState {
    phase: Phase,
    buffer: Vec<Bytes>,
    buffered_bytes: usize,
    content: String,
    reasoning: String,
    error: Option<String>,
    broadcaster: Broadcaster,
    last_update_at: Instant,
}

/// One record per live or recently finished session.
#[derive(Debug)]
pub struct SessionStream {
    id: String,
    created_at: Instant,
    cancel: CancellationToken,
    state: Mutex<SessionState>,
}

impl SessionStream {
    pub(crate) fn new(id: impl Into<String>) -> Self {
        let now = Instant::now();
        Self {
            id: id.into(),
            created_at: now,
            cancel: CancellationToken::new(),
            state: Mutex::new(SessionState {
                phase: Phase::Connecting,
                buffer: Vec::new(),
                buffered_bytes: 0,
                content: String::new(),
                reasoning: String::new(),
                error: None,
                broadcaster: Broadcaster::default(),
                last_update_at: now,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn phase(&self) -> Phase {
        self.lock().phase
    }

    pub fn is_terminal(&self) -> bool {
        self.phase().is_terminal()
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.lock().broadcaster.len()
    }

    /// Attach a subscriber with a full replay of the buffer.
    ///
    /// Returns `None` once the record is terminal; callers start a fresh
    /// session instead.
    pub(crate) fn join(self: &Arc<Self>) -> Option<Subscription> {
        let mut state = self.lock();
        if state.phase.is_terminal() {
            return None;
        }

        let state = &mut *state;
        let (subscriber_id, rx) = state.broadcaster.join(&state.buffer);
        tracing::debug!(
            session_id = %self.id,
            subscriber_id = subscriber_id,
            replayed = state.buffer.len(),
            subscribers = state.broadcaster.len(),
            "subscriber joined"
        );
        Some(Subscription::new(Arc::clone(self), subscriber_id, rx))
    }

    pub(crate) fn leave(&self, subscriber_id: u64) {
        let mut state = self.lock();
        if state.broadcaster.leave(subscriber_id) {
            tracing::debug!(
                session_id = %self.id,
                subscriber_id = subscriber_id,
                subscribers = state.broadcaster.len(),
                "subscriber left"
            );
        }
    }

    /// Run one event through the state machine and apply its effects.
    pub(crate) fn handle(&self, event: DriverEvent) -> Followup {
        let mut guard = self.lock();
        let state = &mut *guard;
        let from = state.phase;
        let step = transition(from, &event);
        if step.is_noop(from) {
            return Followup {
                applied: false,
                terminal: from.is_terminal(),
                ..Followup::default()
            };
        }

        state.phase = step.next;
        state.last_update_at = Instant::now();
        if step.error.is_some() {
            state.error = step.error;
        }

        let mut followup = Followup {
            applied: true,
            terminal: step.next.is_terminal(),
            ..Followup::default()
        };

        for effect in step.effects {
            match effect {
                Effect::AppendFrame => {
                    if let DriverEvent::Frame(frame) | DriverEvent::Sentinel(frame) = &event {
                        self.append(state, frame);
                    }
                }
                Effect::CancelUpstream => self.cancel.cancel(),
                Effect::NotifyTerminal => {
                    let notified = state.broadcaster.notify_terminal(state.error.as_deref());
                    if notified > 0 {
                        tracing::debug!(
                            session_id = %self.id,
                            notified = notified,
                            "subscribers closed"
                        );
                    }
                }
                Effect::ScheduleCleanup => {
                    followup.schedule_cleanup = state.broadcaster.is_empty();
                }
                Effect::RemoveNow => followup.remove_now = true,
            }
        }

        if from != step.next {
            tracing::info!(
                session_id = %self.id,
                from = ?from,
                to = ?step.next,
                frames = state.buffer.len(),
                bytes = state.buffered_bytes,
                error = state.error.as_deref(),
                elapsed_ms = self.created_at.elapsed().as_millis() as u64,
                "session stream transition"
            );
        }

        followup
    }

    fn append(&self, state: &mut SessionState, frame: &Frame) {
        match frame.text_delta() {
            Some(TextDelta::Content(text)) => state.content.push_str(text),
            Some(TextDelta::Reasoning(text)) => state.reasoning.push_str(text),
            None => {}
        }

        let raw = frame.raw().clone();
        state.buffered_bytes += raw.len();
        let evicted = state.broadcaster.deliver(&raw);
        state.buffer.push(raw);

        if evicted > 0 {
            tracing::warn!(
                session_id = %self.id,
                evicted = evicted,
                subscribers = state.broadcaster.len(),
                "evicted closed subscribers"
            );
        }
    }

    /// Terminal and nobody attached: safe to reclaim.
    pub(crate) fn is_reclaimable(&self) -> bool {
        let state = self.lock();
        state.phase.is_terminal() && state.broadcaster.is_empty()
    }

    pub fn status(&self) -> SessionStatus {
        let state = self.lock();
        SessionStatus {
            status: state.phase.into(),
            content: Some(state.content.clone()),
            reasoning: (!state.reasoning.is_empty()).then(|| state.reasoning.clone()),
            error: state.error.clone(),
        }
    }

    pub fn info(&self) -> StreamInfo {
        let state = self.lock();
        StreamInfo {
            session_id: self.id.clone(),
            status: state.phase.into(),
            subscribers: state.broadcaster.len(),
            frames: state.buffer.len(),
            bytes: state.buffered_bytes,
            age_ms: self.created_at.elapsed().as_millis() as u64,
            idle_ms: state.last_update_at.elapsed().as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::broadcast::SubscriberEvent;

    fn frame(raw: &'static str) -> Frame {
        Frame::decode(Bytes::from_static(raw.as_bytes()))
    }

    fn generating(id: &str) -> Arc<SessionStream> {
        let stream = Arc::new(SessionStream::new(id));
        assert!(stream.handle(DriverEvent::Opened).applied);
        stream
    }

    #[tokio::test]
    async fn frames_accumulate_and_fan_out() {
        let stream = generating("s1");
        let mut first = stream.join().expect("join first");
        let mut second = stream.join().expect("join second");

        stream.handle(DriverEvent::Frame(frame(
            "data: {\"type\":\"chunk\",\"content\":\"Hello\"}\n\n",
        )));
        stream.handle(DriverEvent::Frame(frame(
            "data: {\"type\":\"chunk\",\"content\":\" world\"}\n\n",
        )));
        let followup = stream.handle(DriverEvent::Ended);
        assert!(followup.terminal);
        assert!(followup.schedule_cleanup);

        let first_events = (&mut first).collect::<Vec<_>>().await;
        let second_events = (&mut second).collect::<Vec<_>>().await;
        assert_eq!(first_events.len(), 2);
        assert_eq!(first_events, second_events);

        let status = stream.status();
        assert_eq!(status.status, StreamStatus::Completed);
        assert_eq!(status.content.as_deref(), Some("Hello world"));
        assert_eq!(status.error, None);
        assert_eq!(stream.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn late_joiner_gets_replay_then_live() {
        let stream = generating("s1");
        stream.handle(DriverEvent::Frame(frame("data: {\"content\":\"a\"}\n\n")));
        stream.handle(DriverEvent::Frame(frame("data: {\"content\":\"b\"}\n\n")));

        let mut late = stream.join().expect("join");
        stream.handle(DriverEvent::Frame(frame("data: {\"content\":\"c\"}\n\n")));
        stream.handle(DriverEvent::Ended);

        let received = (&mut late)
            .map(SubscriberEvent::into_bytes)
            .collect::<Vec<_>>()
            .await;
        assert_eq!(
            received,
            vec![
                Bytes::from_static(b"data: {\"content\":\"a\"}\n\n"),
                Bytes::from_static(b"data: {\"content\":\"b\"}\n\n"),
                Bytes::from_static(b"data: {\"content\":\"c\"}\n\n"),
            ]
        );
    }

    #[test]
    fn dropping_subscription_leaves() {
        let stream = generating("s1");
        let subscription = stream.join().expect("join");
        assert_eq!(stream.subscriber_count(), 1);
        drop(subscription);
        assert_eq!(stream.subscriber_count(), 0);
        assert!(!stream.is_terminal());
    }

    #[tokio::test]
    async fn failure_notifies_with_detail() {
        let stream = generating("s1");
        let mut subscription = stream.join().expect("join");

        let followup = stream.handle(DriverEvent::Failed("connection reset".to_string()));
        assert!(followup.remove_now);
        assert!(!followup.schedule_cleanup);

        assert_eq!(
            subscription.recv().await,
            Some(SubscriberEvent::Error("connection reset".to_string()))
        );
        assert_eq!(subscription.recv().await, None);

        let status = stream.status();
        assert_eq!(status.status, StreamStatus::Errored);
        assert_eq!(status.error.as_deref(), Some("connection reset"));
    }

    #[test]
    fn terminal_record_rejects_joins_and_events() {
        let stream = generating("s1");
        stream.handle(DriverEvent::Ended);

        assert!(stream.join().is_none());
        let followup = stream.handle(DriverEvent::Aborted);
        assert!(!followup.applied);
        assert!(followup.terminal);
        assert_eq!(stream.status().status, StreamStatus::Completed);
    }

    #[test]
    fn abort_cancels_upstream_token() {
        let stream = generating("s1");
        let token = stream.cancel_token();
        let followup = stream.handle(DriverEvent::Aborted);

        assert!(followup.applied);
        assert!(followup.remove_now);
        assert!(token.is_cancelled());
        assert_eq!(stream.status().error.as_deref(), Some("Aborted by user"));
    }

    #[test]
    fn reasoning_is_a_separate_channel() {
        let stream = generating("s1");
        stream.handle(DriverEvent::Frame(frame(
            "data: {\"type\":\"reasoning\",\"content\":\"hmm\"}\n\n",
        )));
        stream.handle(DriverEvent::Frame(frame(
            "data: {\"type\":\"chunk\",\"content\":\"answer\"}\n\n",
        )));

        let status = stream.status();
        assert_eq!(status.status, StreamStatus::Generating);
        assert_eq!(status.content.as_deref(), Some("answer"));
        assert_eq!(status.reasoning.as_deref(), Some("hmm"));

        let info = stream.info();
        assert_eq!(info.frames, 2);
        assert_eq!(info.session_id, "s1");
    }
}
