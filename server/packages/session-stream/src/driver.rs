use futures::StreamExt;

use crate::parser::{Frame, FrameParser};
use crate::session::{Followup, SessionStream};
use crate::state::DriverEvent;
use crate::upstream::UpstreamBody;

/// Pump one upstream body into its session until the session is terminal.
///
/// Cancellation wins over pending reads. When the token fires, whoever
/// cancelled has already driven the terminal transition, so there is
/// nothing left to apply here.
pub(crate) async fn consume(session: &SessionStream, mut body: UpstreamBody) -> Followup {
    let cancel = session.cancel_token();
    let mut parser = FrameParser::new();

    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Followup::default(),
            chunk = body.next() => chunk,
        };

        match chunk {
            Some(Ok(bytes)) => {
                for frame in parser.push(&bytes) {
                    let followup = session.handle(frame_event(frame));
                    if followup.terminal {
                        return followup;
                    }
                }
            }
            Some(Err(err)) => {
                tracing::warn!(
                    session_id = session.id(),
                    error = %err,
                    pending = parser.remainder().len(),
                    "upstream stream failed"
                );
                return session.handle(DriverEvent::Failed(err.to_string()));
            }
            None => {
                if let Some(frame) = parser.finish() {
                    let followup = session.handle(frame_event(frame));
                    if followup.terminal {
                        return followup;
                    }
                }
                tracing::debug!(session_id = session.id(), "upstream stream ended");
                return session.handle(DriverEvent::Ended);
            }
        }
    }
}

fn frame_event(frame: Frame) -> DriverEvent {
    if frame.is_sentinel() {
        DriverEvent::Sentinel(frame)
    } else {
        DriverEvent::Frame(frame)
    }
}
