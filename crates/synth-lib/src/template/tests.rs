//! Tests for template workloads

use super::*;
use crate::queue::EventQueue;
use crate::synth::QueueConsumer;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::io::Write;
use tokio_test::{assert_err, assert_ok};

/// Consumer that keeps everything it is given
#[derive(Default)]
struct RecordingConsumer {
    events: Mutex<Vec<Event>>,
    errors: Mutex<Vec<String>>,
    complete: Mutex<bool>,
}

impl RecordingConsumer {
    fn names(&self) -> Vec<(String, i64, SessionEventName)> {
        self.events
            .lock()
            .iter()
            .map(|e| {
                (
                    e.session_id().unwrap_or_default().to_string(),
                    e.timestamp.as_secs(),
                    e.name.session().unwrap(),
                )
            })
            .collect()
    }
}

#[async_trait]
impl EventConsumer for RecordingConsumer {
    async fn submit_event(&self, event: Event) -> Result<()> {
        self.events.lock().push(event);
        Ok(())
    }

    async fn report_error(&self, error: SynthError) {
        self.errors.lock().push(error.to_string());
    }

    async fn generator_complete(&self) {
        *self.complete.lock() = true;
    }
}

fn training(start_tick: i64, duration_in_ticks: i64) -> TemplateTraining {
    TemplateTraining {
        start_tick,
        duration_in_ticks,
        cpus: 2.0,
        memory_mb: 1024.0,
        vram_gb: 2.0,
        gpu_utilizations: vec![50.0, 0.0],
    }
}

fn session(
    id: &str,
    start_tick: i64,
    stop_tick: i64,
    trainings: Vec<TemplateTraining>,
) -> TemplateSession {
    TemplateSession {
        id: id.to_string(),
        max_resource_request: ResourceRequest {
            cpus: 4.0,
            memory_mb: 2048.0,
            gpus: 2,
            vram_gb: 8.0,
        },
        start_tick,
        stop_tick,
        trainings,
    }
}

fn template(sessions: Vec<TemplateSession>) -> WorkloadTemplate {
    WorkloadTemplate { sessions }
}

fn rejection(template: &WorkloadTemplate) -> String {
    match template.validate() {
        Err(SynthError::InvalidTemplate(message)) => message,
        other => panic!("expected an invalid template, got {:?}", other),
    }
}

#[tokio::test]
async fn test_events_of_one_session_follow_its_template() {
    use SessionEventName::*;

    let consumer = Arc::new(RecordingConsumer::default());
    let workload = template(vec![session(
        "s1",
        0,
        10,
        vec![training(2, 3), training(5, 2)],
    )]);

    let report = generate_template_workload(&workload, consumer.clone())
        .await
        .unwrap();

    let expected: Vec<(String, i64, SessionEventName)> = [
        (0, SessionStarted),
        (0, SessionReady),
        (120, TrainingStarted),
        (300, TrainingEnded),
        (300, TrainingStarted),
        (420, TrainingEnded),
        (600, SessionStopped),
    ]
    .into_iter()
    .map(|(secs, name)| ("s1".to_string(), secs, name))
    .collect();
    assert_eq!(consumer.names(), expected);
    assert_eq!(report.events, 7);
    assert_eq!(report.trainings, 2);
    assert_eq!(report.final_tick, 10);
    assert_eq!(report.final_timestamp, SimTime::from_secs(600));
    assert!(*consumer.complete.lock());

    let events = consumer.events.lock();
    let locals: Vec<u64> = events.iter().map(|e| e.local_index).collect();
    assert_eq!(locals, vec![0, 1, 2, 3, 4, 5, 6]);

    let first = events[2].session_snapshot().unwrap();
    assert_eq!(first.status, Some(SessionStatus::Training));
    assert_eq!(first.training_index, Some(0));
    assert_eq!(first.max_session_gpus, 2);
    assert_eq!(first.max_session_memory_gb, 2.048);
    assert_eq!(first.current_training_max_gpus, 1);
    assert_eq!(first.current_training_max_memory_gb, 1.024);
    assert_eq!(first.gpu.as_ref().unwrap().status, UtilStatus::Busy);

    let second_end = events[5].session_snapshot().unwrap();
    assert_eq!(second_end.status, Some(SessionStatus::Idle));
    assert_eq!(second_end.training_index, Some(1));

    let stopped = events[6].session_snapshot().unwrap();
    assert_eq!(stopped.status, Some(SessionStatus::Stopped));
    assert_eq!(stopped.inited_at, Some(SimTime::ZERO));
}

#[tokio::test]
async fn test_sessions_are_merged_by_timestamp() {
    use SessionEventName::*;

    let consumer = Arc::new(RecordingConsumer::default());
    let workload = template(vec![
        session("s1", 5, 6, vec![]),
        session("s2", 0, 8, vec![training(1, 2)]),
    ]);

    generate_template_workload(&workload, consumer.clone())
        .await
        .unwrap();

    let names: Vec<(&str, i64, SessionEventName)> = vec![
        ("s2", 0, SessionStarted),
        ("s2", 0, SessionReady),
        ("s2", 60, TrainingStarted),
        ("s2", 180, TrainingEnded),
        ("s1", 300, SessionStarted),
        ("s1", 300, SessionReady),
        ("s1", 360, SessionStopped),
        ("s2", 480, SessionStopped),
    ];
    let expected: Vec<_> = names
        .into_iter()
        .map(|(id, secs, name)| (id.to_string(), secs, name))
        .collect();
    assert_eq!(consumer.names(), expected);
}

#[test]
fn test_template_validation_rules() {
    let mut negative_cpus = session("s1", 0, 4, vec![]);
    negative_cpus.max_resource_request.cpus = -1.0;

    let mut greedy_cpus = training(1, 1);
    greedy_cpus.cpus = 8.0;
    let mut greedy_gpus = training(1, 1);
    greedy_gpus.gpu_utilizations = vec![10.0, 10.0, 10.0];
    let mut greedy_memory = training(1, 1);
    greedy_memory.memory_mb = 4096.0;

    let cases = vec![
        (template(vec![]), "template has no sessions"),
        (template(vec![session("", 0, 4, vec![])]), "id must not be empty"),
        (template(vec![negative_cpus]), "maximum CPUs (-1) must not be negative"),
        (template(vec![session("s1", -1, 4, vec![])]), "start tick -1 must not be negative"),
        (template(vec![session("s1", 5, 4, vec![])]), "start tick 5 is after its stop tick 4"),
        (
            template(vec![session("s1", 3, 8, vec![training(2, 1)])]),
            "starts at tick 2 before the session starts at tick 3",
        ),
        (
            template(vec![session("s1", 0, 4, vec![training(2, 3)])]),
            "ends at tick 5 after the session stops at tick 4",
        ),
        (
            template(vec![session("s1", 0, 4, vec![training(2, 0)])]),
            "must last at least one tick, got 0",
        ),
        (
            template(vec![session("s1", 0, 8, vec![training(1, 3), training(2, 1)])]),
            "training 1 starts at tick 2 before training 0 ends at tick 4",
        ),
        (
            template(vec![session("s1", 0, 4, vec![greedy_cpus])]),
            "uses 8 CPUs, more than the session maximum of 4",
        ),
        (
            template(vec![session("s1", 0, 4, vec![greedy_gpus])]),
            "uses 3 GPUs, more than the session maximum of 2",
        ),
        (
            template(vec![session("s1", 0, 4, vec![greedy_memory])]),
            "uses 4096 MB of memory",
        ),
        (
            template(vec![session("s1", 0, 4, vec![]), session("s1", 1, 2, vec![])]),
            "duplicate session id s1",
        ),
    ];

    for (workload, expected) in cases {
        let message = rejection(&workload);
        assert!(
            message.contains(expected),
            "{:?} does not mention {:?}",
            message,
            expected
        );
    }
}

#[test]
fn test_valid_template_reports_final_tick() {
    let workload = template(vec![
        session("s1", 0, 10, vec![training(2, 3)]),
        session("s2", 4, 12, vec![]),
        session("s3", 1, 1, vec![]),
    ]);
    assert_eq!(assert_ok!(workload.validate()), 12);
}

#[test]
fn test_sequencer_rejects_steps_out_of_order() {
    let mut sequencer = TemplateSequencer::new(SimTime::ZERO, DEFAULT_TEMPLATE_TICK);
    let limits = session("s1", 0, 10, vec![]).limits();

    assert!(matches!(
        sequencer.add_session_started("s1", 0),
        Err(SynthError::UnregisteredSession(_))
    ));
    assert_ok!(sequencer.register_session("s1", limits));
    assert!(matches!(
        sequencer.register_session("s1", limits),
        Err(SynthError::InvalidTemplate(_))
    ));

    assert_err!(sequencer.add_training("s1", &training(1, 1)));
    assert_err!(sequencer.add_session_terminated("s1", 4));

    assert_ok!(sequencer.add_session_started("s1", 5));
    assert_err!(sequencer.add_session_started("s1", 5));
    assert_err!(sequencer.add_training("s1", &training(2, 1)));

    assert_ok!(sequencer.add_training("s1", &training(6, 2)));
    assert_err!(sequencer.add_session_terminated("s1", 7));
    assert_ok!(sequencer.add_session_terminated("s1", 8));
    assert_err!(sequencer.add_training("s1", &training(9, 1)));

    // started, ready, training started and ended, stopped
    assert_eq!(sequencer.len(), 5);
}

#[tokio::test]
async fn test_unterminated_session_still_submits_held_event() {
    let consumer = Arc::new(RecordingConsumer::default());
    let mut sequencer = TemplateSequencer::new(SimTime::from_secs(1_000), DEFAULT_TEMPLATE_TICK);
    let limits = session("s1", 0, 10, vec![]).limits();
    sequencer.register_session("s1", limits).unwrap();
    sequencer.add_session_started("s1", 0).unwrap();
    sequencer.add_training("s1", &training(1, 2)).unwrap();

    let submitted = sequencer.submit_events(consumer.clone()).await.unwrap();

    assert_eq!(submitted, 4);
    let names = consumer.names();
    assert_eq!(names[3], ("s1".to_string(), 1_180, SessionEventName::TrainingEnded));
}

#[tokio::test]
async fn test_invalid_template_is_reported_to_consumer() {
    let consumer = Arc::new(RecordingConsumer::default());
    let workload = template(vec![session("s1", 5, 4, vec![])]);

    let result = generate_template_workload(&workload, consumer.clone()).await;

    assert!(matches!(result, Err(SynthError::InvalidTemplate(_))));
    assert!(consumer.events.lock().is_empty());
    assert!(!*consumer.complete.lock());
    let errors = consumer.errors.lock();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("Invalid workload template: session s1"));
}

#[tokio::test]
async fn test_template_events_feed_event_queue() {
    let queue = Arc::new(EventQueue::new());
    let consumer = Arc::new(QueueConsumer::new(queue.clone()));
    let workload = template(vec![
        session("s1", 0, 6, vec![training(1, 2)]),
        session("s2", 2, 4, vec![]),
    ]);

    let report = generate_template_workload(&workload, consumer.clone())
        .await
        .unwrap();

    assert_eq!(report.events, 8);
    // session-started only registers the session's sub-queue
    assert_eq!(queue.len(), 6);
    assert_eq!(queue.num_session_queues(), 2);
    assert!(consumer.is_generator_complete());
    assert!(consumer.errors().is_empty());

    let first = queue.pop(SimTime::from_secs(600)).unwrap();
    assert_eq!(first.name, EventName::Session(SessionEventName::SessionReady));
    assert_eq!(first.session_id(), Some("s1"));
}

#[test]
fn test_template_from_json_file() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("template.json");
    let mut file = std::fs::File::create(&path).unwrap();
    write!(
        file,
        r#"{{"sessions": [{{"id": "s1", "start_tick": 0, "stop_tick": 6,
            "max_resource_request": {{"cpus": 2, "memory_mb": 512, "gpus": 1}},
            "trainings": [{{"start_tick": 1, "duration_in_ticks": 2, "cpus": 1.5,
                "gpu_utilizations": [80]}}]}}]}}"#
    )
    .unwrap();

    let workload = WorkloadTemplate::from_path(&path).unwrap();
    assert_eq!(workload.sessions.len(), 1);
    let s1 = &workload.sessions[0];
    assert_eq!(s1.max_resource_request.gpus, 1);
    assert_eq!(s1.max_resource_request.vram_gb, 0.0);
    assert_eq!(s1.trainings[0].num_gpus(), 1);
    assert_eq!(s1.trainings[0].memory_mb, 0.0);
    assert_ok!(workload.validate());

    let missing = WorkloadTemplate::from_path(&dir.path().join("missing.json"));
    assert!(matches!(missing, Err(SynthError::Setup { .. })));
}
