//! Session lifecycle state machine.
//!
//! `transition` is a pure function of the current phase and an incoming
//! event. It decides the next phase and the ordered side effects; the
//! session record applies those effects while holding its lock.

use session_stream_error::ABORTED_BY_USER;

use crate::parser::Frame;

pub const SHUTDOWN_MESSAGE: &str = "Server shutting down";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    Generating,
    Completed,
    Errored,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Errored)
    }
}

#[derive(Debug, Clone)]
pub enum DriverEvent {
    Opened,
    OpenFailed(String),
    Frame(Frame),
    Sentinel(Frame),
    Ended,
    Failed(String),
    Aborted,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Append the event's frame to the replay buffer and deliver it.
    AppendFrame,
    CancelUpstream,
    NotifyTerminal,
    ScheduleCleanup,
    RemoveNow,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: Phase,
    pub error: Option<String>,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn stay(phase: Phase) -> Self {
        Self {
            next: phase,
            error: None,
            effects: Vec::new(),
        }
    }

    fn to(next: Phase, effects: Vec<Effect>) -> Self {
        Self {
            next,
            error: None,
            effects,
        }
    }

    fn errored(message: impl Into<String>, effects: Vec<Effect>) -> Self {
        Self {
            next: Phase::Errored,
            error: Some(message.into()),
            effects,
        }
    }

    pub fn is_noop(&self, from: Phase) -> bool {
        self.next == from && self.effects.is_empty()
    }
}

pub fn transition(phase: Phase, event: &DriverEvent) -> Transition {
    use Effect::*;

    if phase.is_terminal() {
        return Transition::stay(phase);
    }

    match (phase, event) {
        (Phase::Connecting, DriverEvent::Opened) => Transition::to(Phase::Generating, Vec::new()),
        (Phase::Connecting, DriverEvent::OpenFailed(message)) => {
            Transition::errored(message.clone(), vec![NotifyTerminal, RemoveNow])
        }
        (Phase::Generating, DriverEvent::Frame(_)) => {
            Transition::to(Phase::Generating, vec![AppendFrame])
        }
        (Phase::Generating, DriverEvent::Sentinel(_)) => Transition::to(
            Phase::Completed,
            vec![AppendFrame, CancelUpstream, NotifyTerminal, ScheduleCleanup],
        ),
        (Phase::Generating, DriverEvent::Ended) => {
            Transition::to(Phase::Completed, vec![NotifyTerminal, ScheduleCleanup])
        }
        (Phase::Generating, DriverEvent::Failed(message)) => {
            Transition::errored(message.clone(), vec![NotifyTerminal, RemoveNow])
        }
        (_, DriverEvent::Aborted) => Transition::errored(
            ABORTED_BY_USER,
            vec![CancelUpstream, NotifyTerminal, RemoveNow],
        ),
        (_, DriverEvent::Shutdown) => Transition::errored(
            SHUTDOWN_MESSAGE,
            vec![CancelUpstream, NotifyTerminal, RemoveNow],
        ),
        _ => Transition::stay(phase),
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn frame() -> Frame {
        Frame::decode(Bytes::from_static(b"data: {\"content\":\"x\"}\n\n"))
    }

    #[test]
    fn happy_path() {
        let opened = transition(Phase::Connecting, &DriverEvent::Opened);
        assert_eq!(opened.next, Phase::Generating);
        assert!(opened.effects.is_empty());

        let framed = transition(Phase::Generating, &DriverEvent::Frame(frame()));
        assert_eq!(framed.next, Phase::Generating);
        assert_eq!(framed.effects, vec![Effect::AppendFrame]);

        let ended = transition(Phase::Generating, &DriverEvent::Ended);
        assert_eq!(ended.next, Phase::Completed);
        assert_eq!(
            ended.effects,
            vec![Effect::NotifyTerminal, Effect::ScheduleCleanup]
        );
        assert_eq!(ended.error, None);
    }

    #[test]
    fn sentinel_completes_after_appending() {
        let done = transition(Phase::Generating, &DriverEvent::Sentinel(frame()));
        assert_eq!(done.next, Phase::Completed);
        assert_eq!(done.effects[0], Effect::AppendFrame);
        assert!(done.effects.contains(&Effect::CancelUpstream));
    }

    #[test]
    fn failures_remove_immediately() {
        let open_failed = transition(
            Phase::Connecting,
            &DriverEvent::OpenFailed("connection refused".to_string()),
        );
        assert_eq!(open_failed.next, Phase::Errored);
        assert_eq!(open_failed.error.as_deref(), Some("connection refused"));
        assert!(open_failed.effects.contains(&Effect::RemoveNow));

        let failed = transition(Phase::Generating, &DriverEvent::Failed("reset".to_string()));
        assert_eq!(failed.next, Phase::Errored);
        assert!(failed.effects.contains(&Effect::RemoveNow));
        assert!(!failed.effects.contains(&Effect::ScheduleCleanup));
    }

    #[test]
    fn abort_from_connecting_or_generating() {
        for phase in [Phase::Connecting, Phase::Generating] {
            let aborted = transition(phase, &DriverEvent::Aborted);
            assert_eq!(aborted.next, Phase::Errored);
            assert_eq!(aborted.error.as_deref(), Some("Aborted by user"));
            assert_eq!(
                aborted.effects,
                vec![
                    Effect::CancelUpstream,
                    Effect::NotifyTerminal,
                    Effect::RemoveNow
                ]
            );
        }
    }

    #[test]
    fn terminal_phases_are_absorbing() {
        for phase in [Phase::Completed, Phase::Errored] {
            for event in [
                DriverEvent::Opened,
                DriverEvent::Frame(frame()),
                DriverEvent::Ended,
                DriverEvent::Failed("late".to_string()),
                DriverEvent::Aborted,
            ] {
                assert!(transition(phase, &event).is_noop(phase));
            }
        }
    }

    #[test]
    fn frames_before_open_are_ignored() {
        assert!(transition(Phase::Connecting, &DriverEvent::Frame(frame())).is_noop(Phase::Connecting));
        assert!(transition(Phase::Connecting, &DriverEvent::Ended).is_noop(Phase::Connecting));
    }
}
