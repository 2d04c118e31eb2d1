//! Tests for the session state machine

use super::*;
use crate::event::EventPayload;

const CPU: ResourceKind = ResourceKind::Cpu;
const GPU: ResourceKind = ResourceKind::Gpu;
const MEM: ResourceKind = ResourceKind::Memory;

fn driver_event(kind: ResourceKind, name: DriverEventName, secs: i64) -> Event {
    let status = match name {
        DriverEventName::Started | DriverEventName::Deactivated => UtilStatus::Idle,
        DriverEventName::Activated => UtilStatus::Busy,
        DriverEventName::Stopped => UtilStatus::Stopped,
    };
    let at = SimTime::from_secs(secs);
    let snapshot = UtilizationSnapshot {
        kind,
        timestamp: at,
        onset: at,
        session_id: "s1".to_string(),
        value: 0.0,
        running_max: 0.0,
        status,
        repeat: 0,
        gpus: 0,
        vram_gb: 0.0,
    };
    Event::reading(kind, name, 1, snapshot)
}

fn apply_all(
    session: &mut Session,
    events: &[(ResourceKind, DriverEventName, i64)],
) -> Vec<SessionEventName> {
    let mut out = Vec::new();
    for (kind, name, secs) in events {
        out.extend(session.transit(driver_event(*kind, *name, *secs)).unwrap());
    }
    out
}

#[test]
fn test_policy_masks() {
    let all = SessionPolicy::default();
    assert_eq!(all.ready_mask, 0x07);
    assert_eq!(all.stop_mask, 0x03);
    assert_eq!(all.training_kind, GPU);

    let cpu_mem = SessionPolicy::for_kinds(&[CPU, MEM]);
    assert_eq!(cpu_mem.stop_mask, 0x01);
    assert_eq!(cpu_mem.training_kind, CPU);

    let mem_only = SessionPolicy::for_kinds(&[MEM]);
    assert_eq!(mem_only.ready_mask, 0x04);
    assert_eq!(mem_only.stop_mask, 0x04);
    assert_eq!(mem_only.training_kind, MEM);
}

#[test]
fn test_cpu_only_session_lifecycle() {
    let mut session = Session::new("s1", SessionPolicy::for_kinds(&[CPU]));
    let out = apply_all(
        &mut session,
        &[
            (CPU, DriverEventName::Started, 0),
            (CPU, DriverEventName::Activated, 60),
            (CPU, DriverEventName::Deactivated, 180),
            (CPU, DriverEventName::Stopped, 240),
        ],
    );

    assert_eq!(
        out,
        vec![
            SessionEventName::SessionStarted,
            SessionEventName::SessionReady,
            SessionEventName::TrainingStarted,
            SessionEventName::TrainingEnded,
            SessionEventName::SessionStopped,
        ]
    );
    assert_eq!(session.status(), SessionStatus::Stopped);
    assert_eq!(session.trainings(), 1);
}

#[test]
fn test_ready_waits_for_every_kind() {
    let mut session = Session::new("s1", SessionPolicy::for_kinds(&[CPU, GPU]));
    let out = apply_all(&mut session, &[(CPU, DriverEventName::Started, 0)]);
    assert_eq!(out, vec![SessionEventName::SessionStarted]);
    assert_eq!(session.status(), SessionStatus::Initializing);

    let out = apply_all(&mut session, &[(GPU, DriverEventName::Started, 120)]);
    assert_eq!(out, vec![SessionEventName::SessionReady]);
    assert_eq!(session.status(), SessionStatus::Idle);
    assert_eq!(session.snapshot().init_delay, Duration::from_secs(120));
}

#[test]
fn test_early_events_are_parked_and_replayed() {
    let mut session = Session::new("s1", SessionPolicy::for_kinds(&[CPU, GPU]));
    let out = apply_all(
        &mut session,
        &[
            (CPU, DriverEventName::Started, 0),
            (GPU, DriverEventName::Activated, 0),
        ],
    );
    assert_eq!(out, vec![SessionEventName::SessionStarted]);
    assert_eq!(session.pending(), 1);

    let out = apply_all(&mut session, &[(GPU, DriverEventName::Started, 0)]);
    assert_eq!(
        out,
        vec![
            SessionEventName::SessionReady,
            SessionEventName::TrainingStarted
        ]
    );
    assert_eq!(session.pending(), 0);
    assert_eq!(session.status(), SessionStatus::Training);
}

#[test]
fn test_cpu_stop_during_training_waits_for_gpu_deactivation() {
    let mut session = Session::new("s1", SessionPolicy::for_kinds(&[CPU, GPU]));
    apply_all(
        &mut session,
        &[
            (CPU, DriverEventName::Started, 0),
            (GPU, DriverEventName::Started, 0),
            (GPU, DriverEventName::Activated, 60),
        ],
    );

    let out = apply_all(&mut session, &[(CPU, DriverEventName::Stopped, 120)]);
    assert!(out.is_empty());
    assert_eq!(session.pending(), 1);

    let out = apply_all(&mut session, &[(GPU, DriverEventName::Deactivated, 180)]);
    assert_eq!(out, vec![SessionEventName::TrainingEnded]);
    assert_eq!(session.status(), SessionStatus::Stopping);

    let out = apply_all(&mut session, &[(GPU, DriverEventName::Stopped, 240)]);
    assert_eq!(out, vec![SessionEventName::SessionStopped]);
}

#[test]
fn test_stopping_recovers_when_trace_resumes() {
    let mut session = Session::new("s1", SessionPolicy::for_kinds(&[CPU, GPU]));
    apply_all(
        &mut session,
        &[
            (CPU, DriverEventName::Started, 0),
            (GPU, DriverEventName::Started, 0),
            (GPU, DriverEventName::Stopped, 60),
        ],
    );
    assert_eq!(session.status(), SessionStatus::Stopping);

    let out = apply_all(&mut session, &[(GPU, DriverEventName::Started, 120)]);
    assert!(out.is_empty());
    assert_eq!(session.status(), SessionStatus::Idle);
}

#[test]
fn test_memory_stop_tolerated_after_stopped() {
    let mut session = Session::new("s1", SessionPolicy::for_kinds(&[CPU, MEM]));
    apply_all(
        &mut session,
        &[
            (CPU, DriverEventName::Started, 0),
            (MEM, DriverEventName::Started, 0),
            (CPU, DriverEventName::Stopped, 60),
        ],
    );
    assert_eq!(session.status(), SessionStatus::Stopped);

    assert!(session
        .transit(driver_event(MEM, DriverEventName::Stopped, 120))
        .unwrap()
        .is_empty());
    assert!(matches!(
        session.transit(driver_event(CPU, DriverEventName::Started, 180)),
        Err(SynthError::UnexpectedSessionTransition { .. })
    ));
}

#[test]
fn test_undefined_transitions_are_rejected() {
    let policy = SessionPolicy::for_kinds(&[CPU, GPU]);

    let mut session = Session::new("s1", policy);
    for name in [
        DriverEventName::Activated,
        DriverEventName::Deactivated,
        DriverEventName::Stopped,
    ] {
        assert!(session.transit(driver_event(CPU, name, 0)).is_err());
    }
    assert_eq!(session.status(), SessionStatus::Init);

    let mut session = Session::new("s1", policy);
    apply_all(
        &mut session,
        &[
            (CPU, DriverEventName::Started, 0),
            (GPU, DriverEventName::Started, 0),
        ],
    );
    assert!(session
        .transit(driver_event(GPU, DriverEventName::Started, 60))
        .is_err());
    assert_eq!(session.status(), SessionStatus::Idle);

    let sentinel = Event::new(EventName::NoMore, 1, SimTime::ZERO, EventPayload::Empty);
    assert!(session.transit(sentinel).is_err());
}

#[test]
fn test_pending_overflow() {
    let mut session = Session::new("s1", SessionPolicy::for_kinds(&[CPU, GPU]));
    apply_all(&mut session, &[(CPU, DriverEventName::Started, 0)]);
    for i in 0..PENDING_CAPACITY {
        session
            .transit(driver_event(CPU, DriverEventName::Activated, i as i64))
            .unwrap();
    }
    assert!(matches!(
        session.transit(driver_event(CPU, DriverEventName::Activated, 100)),
        Err(SynthError::PendingOverflow { .. })
    ));
}

#[test]
fn test_snapshot_tracks_latest_readings() {
    let mut session = Session::new("s1", SessionPolicy::for_kinds(&[CPU, GPU]));
    apply_all(
        &mut session,
        &[
            (CPU, DriverEventName::Started, 0),
            (GPU, DriverEventName::Started, 30),
            (GPU, DriverEventName::Activated, 60),
        ],
    );

    let snapshot = session.snapshot();
    assert_eq!(snapshot.session_id, "s1");
    assert_eq!(snapshot.status, Some(SessionStatus::Training));
    assert_eq!(snapshot.timestamp, SimTime::from_secs(60));
    assert_eq!(snapshot.gpu.unwrap().status, UtilStatus::Busy);
    assert_eq!(snapshot.cpu.unwrap().timestamp, SimTime::ZERO);
    assert_eq!(snapshot.training_index, Some(0));
    assert_eq!(snapshot.inited_at, Some(SimTime::ZERO));
}
