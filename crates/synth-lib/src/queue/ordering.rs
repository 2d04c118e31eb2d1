//! Tie-break policy for session-level events

use std::cmp::Ordering;

use crate::error::{Result, SynthError};
use crate::event::{Event, SessionEventName};
use crate::models::SimTime;

use super::heap::HeapOrder;

/// An event buffered in a session queue
#[derive(Debug, Clone)]
pub struct QueuedEvent {
    pub event: Event,
    /// Event timestamp plus the owning session's delay
    pub adjusted: SimTime,
    /// Set when a consumer handed the event back for another attempt
    pub requeued: bool,
}

impl QueuedEvent {
    pub fn new(event: Event, adjusted: SimTime) -> Self {
        Self {
            event,
            adjusted,
            requeued: false,
        }
    }

    pub fn session_event(&self) -> Option<SessionEventName> {
        self.event.name.session()
    }
}

impl HeapOrder for QueuedEvent {
    fn heap_cmp(&self, other: &Self) -> Ordering {
        compare_events(self, other)
    }
}

/// Order of two queued events.
///
/// Events with equal adjusted timestamps are ordered by, in turn:
/// `session-ready` first, `training-ended` before `session-stopped`, and the
/// lower global index. Otherwise the earlier adjusted timestamp wins.
pub fn compare_events(a: &QueuedEvent, b: &QueuedEvent) -> Ordering {
    if a.adjusted != b.adjusted {
        return a.adjusted.cmp(&b.adjusted);
    }
    compare_same_tick(a.session_event(), b.session_event())
        .then(a.event.global_index.cmp(&b.event.global_index))
}

/// Name-based precedence among events of the same tick
pub(crate) fn compare_same_tick(
    a: Option<SessionEventName>,
    b: Option<SessionEventName>,
) -> Ordering {
    use SessionEventName::*;

    match (a, b) {
        (Some(SessionReady), Some(SessionReady)) => Ordering::Equal,
        (Some(SessionReady), _) => Ordering::Less,
        (_, Some(SessionReady)) => Ordering::Greater,
        (Some(TrainingEnded), Some(SessionStopped)) => Ordering::Less,
        (Some(SessionStopped), Some(TrainingEnded)) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

/// Verify that a `training-ended`/`session-stopped` pair of one session at
/// one tick was created in processing order.
pub fn check_consistency(a: &QueuedEvent, b: &QueuedEvent) -> Result<()> {
    if a.requeued || b.requeued || a.event.timestamp != b.event.timestamp {
        return Ok(());
    }
    let (ended, stopped) = match (a.session_event(), b.session_event()) {
        (Some(SessionEventName::TrainingEnded), Some(SessionEventName::SessionStopped)) => (a, b),
        (Some(SessionEventName::SessionStopped), Some(SessionEventName::TrainingEnded)) => (b, a),
        _ => return Ok(()),
    };
    if ended.event.session_id() != stopped.event.session_id() {
        return Ok(());
    }
    if ended.event.local_index > stopped.event.local_index {
        return Err(SynthError::FatalInconsistency {
            training_ended: ended.event.to_string(),
            session_stopped: stopped.event.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventName, EventPayload};
    use crate::models::SessionSnapshot;

    fn queued(name: SessionEventName, secs: i64, global: u64, local: u64) -> QueuedEvent {
        let snapshot = SessionSnapshot {
            session_id: "s1".to_string(),
            ..SessionSnapshot::default()
        };
        let at = SimTime::from_secs(secs);
        let mut event = Event::new(
            EventName::Session(name),
            0,
            at,
            EventPayload::Session(Box::new(snapshot)),
        );
        event.global_index = global;
        event.local_index = local;
        QueuedEvent::new(event, at)
    }

    #[test]
    fn test_earlier_timestamp_wins_over_names() {
        let ready = queued(SessionEventName::SessionReady, 20, 0, 0);
        let started = queued(SessionEventName::TrainingStarted, 10, 5, 5);
        assert_eq!(compare_events(&started, &ready), Ordering::Less);
    }

    #[test]
    fn test_same_tick_precedence() {
        let ready = queued(SessionEventName::SessionReady, 10, 9, 9);
        let ended = queued(SessionEventName::TrainingEnded, 10, 3, 3);
        let stopped = queued(SessionEventName::SessionStopped, 10, 1, 4);
        let started = queued(SessionEventName::TrainingStarted, 10, 0, 0);

        assert_eq!(compare_events(&ready, &started), Ordering::Less);
        assert_eq!(compare_events(&ended, &stopped), Ordering::Less);
        assert_eq!(compare_events(&started, &ended), Ordering::Less);
    }

    #[test]
    fn test_consistency_check() {
        let ended = queued(SessionEventName::TrainingEnded, 10, 1, 1);
        let stopped = queued(SessionEventName::SessionStopped, 10, 0, 0);
        assert!(matches!(
            check_consistency(&stopped, &ended),
            Err(SynthError::FatalInconsistency { .. })
        ));

        let mut requeued = ended.clone();
        requeued.requeued = true;
        assert!(check_consistency(&requeued, &stopped).is_ok());

        let later = queued(SessionEventName::TrainingEnded, 20, 1, 1);
        assert!(check_consistency(&later, &stopped).is_ok());
    }
}
