//! End-to-end run lifecycles through the orchestrator facade

use chrono::Utc;
use quay_core::domain::event::EventDraft;
use quay_core::domain::pipeline::{StageDefinition, StepDefinition};
use quay_core::domain::run::{Run, Status, StepResult, TriggerMetadata};
use quay_core::dto::agent::{Heartbeat, RegisterAgent};
use quay_core::dto::pipeline::CreatePipeline;
use quay_core::dto::run::CreateRun;
use quay_core::topic::{Topic, TopicPattern, topics};
use quay_orchestrator::config::Config;
use quay_orchestrator::orchestrator::{Orchestrator, requeue_timed_out};
use quay_orchestrator::service::event_bus::{Cursor, Delivery, Gap, Subscription};
use quay_orchestrator::service::log_stream::TailItem;
use quay_orchestrator::service::run::EntityRef;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

fn orchestrator(config: Config) -> Orchestrator {
    let orchestrator = Orchestrator::new(config);
    orchestrator
        .pipelines
        .create_pipeline(CreatePipeline {
            name: "ci".to_string(),
            description: Some("build then test".to_string()),
            stages: vec![
                StageDefinition::new("build").with_step(StepDefinition::new("compile")),
                StageDefinition::new("test")
                    .depends_on("build")
                    .with_step(StepDefinition::new("unit")),
            ],
        })
        .unwrap();
    orchestrator
}

fn register(orchestrator: &Orchestrator, id: &str) {
    orchestrator
        .agents
        .register_agent(RegisterAgent {
            agent_id: id.to_string(),
            capabilities: vec!["linux".to_string()],
        })
        .unwrap();
}

fn start_run(orchestrator: &Orchestrator) -> Run {
    orchestrator
        .create_run(CreateRun {
            pipeline: "ci".to_string(),
            trigger: TriggerMetadata {
                commit: "abc123".to_string(),
                source: "test".to_string(),
                ..Default::default()
            },
        })
        .unwrap()
}

fn step_of(run: &Run, stage: &str) -> Uuid {
    run.stage(stage).unwrap().steps[0].id
}

fn drain(subscription: &mut Subscription) -> Vec<Delivery> {
    let mut deliveries = Vec::new();
    while let Some(delivery) = subscription.try_recv().unwrap() {
        deliveries.push(delivery);
    }
    deliveries
}

fn finish(orchestrator: &Orchestrator, step_id: Uuid, status: Status) {
    orchestrator
        .runs
        .report_step_transition(step_id, Status::Running, None)
        .unwrap();
    orchestrator
        .runs
        .report_step_transition(step_id, status, None)
        .unwrap();
}

#[test]
fn test_downstream_failure_fails_run() {
    let orchestrator = orchestrator(Config::default());
    register(&orchestrator, "a1");
    let run = start_run(&orchestrator);

    assert_eq!(orchestrator.runs.dispatch_ready_steps(), 1);
    finish(&orchestrator, step_of(&run, "build"), Status::Succeeded);

    // test only becomes ready once build succeeded
    assert_eq!(orchestrator.runs.dispatch_ready_steps(), 1);
    let unit = step_of(&run, "test");
    orchestrator
        .runs
        .report_step_transition(unit, Status::Running, None)
        .unwrap();
    orchestrator
        .runs
        .report_step_transition(
            unit,
            Status::Failed,
            Some(StepResult {
                exit_code: Some(1),
                message: Some("2 tests failed".to_string()),
            }),
        )
        .unwrap();

    let run = orchestrator.runs.get_run(run.id).unwrap();
    assert_eq!(run.stage("build").unwrap().status, Status::Succeeded);
    assert_eq!(run.stage("test").unwrap().status, Status::Failed);
    assert_eq!(run.status, Status::Failed);
    assert!(run.completed_at.is_some());
    assert!(run.reason.unwrap().contains("test"));

    let agent = orchestrator.agents.get_agent("a1").unwrap();
    assert_eq!(agent.assigned_step, None);
}

#[test]
fn test_least_recently_heard_agent_is_picked() {
    let orchestrator = orchestrator(Config::default());
    for id in ["a1", "a2", "a3"] {
        register(&orchestrator, id);
    }
    let base = Utc::now();
    for (id, offset) in [("a1", 3), ("a2", 1), ("a3", 2)] {
        orchestrator
            .agents
            .heartbeat_at(id, Heartbeat::default(), base + chrono::Duration::seconds(offset))
            .unwrap();
    }

    let run = start_run(&orchestrator);
    orchestrator.runs.dispatch_ready_steps();

    let step = orchestrator.runs.get_step(step_of(&run, "build")).unwrap();
    assert_eq!(step.status, Status::Started);
    assert_eq!(step.agent_id.as_deref(), Some("a2"));
}

#[test]
fn test_timed_out_step_requeued_exactly_once() {
    let orchestrator = orchestrator(Config::default());
    let mut requeued = orchestrator
        .bus
        .subscribe(TopicPattern::new("run.*.step.*.requeued").unwrap(), None)
        .unwrap();
    register(&orchestrator, "a1");
    let run = start_run(&orchestrator);
    orchestrator.runs.dispatch_ready_steps();
    let build = step_of(&run, "build");

    let later = Utc::now() + chrono::Duration::seconds(31);
    let report = orchestrator.agents.sweep(later);
    assert_eq!(report.timeouts.len(), 1);
    assert_eq!(report.timeouts[0].step_id, Some(build));
    assert_eq!(requeue_timed_out(&orchestrator.runs, &report), 1);

    // Nothing left to take back on the next sweep
    let again = orchestrator.agents.sweep(later + chrono::Duration::seconds(10));
    assert!(again.timeouts.is_empty());
    assert_eq!(requeue_timed_out(&orchestrator.runs, &again), 0);
    // Replaying the old report does not requeue twice either
    assert_eq!(requeue_timed_out(&orchestrator.runs, &report), 0);

    let step = orchestrator.runs.get_step(build).unwrap();
    assert_eq!(step.status, Status::Queued);
    assert_eq!(step.attempt, 1);
    assert_eq!(drain(&mut requeued).len(), 1);

    register(&orchestrator, "a2");
    assert_eq!(orchestrator.runs.dispatch_ready_steps(), 1);
    let step = orchestrator.runs.get_step(build).unwrap();
    assert_eq!(step.agent_id.as_deref(), Some("a2"));
}

#[test]
fn test_deregistered_agent_step_is_requeued() {
    let orchestrator = orchestrator(Config::default());
    register(&orchestrator, "a1");
    let run = start_run(&orchestrator);
    orchestrator.runs.dispatch_ready_steps();

    orchestrator.deregister_agent("a1").unwrap();

    let step = orchestrator.runs.get_step(step_of(&run, "build")).unwrap();
    assert_eq!(step.status, Status::Queued);
    assert!(orchestrator.agents.get_agent("a1").is_err());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_acknowledged_within_grace() {
    let orchestrator = orchestrator(Config::default());
    register(&orchestrator, "a1");
    let run = start_run(&orchestrator);
    orchestrator.runs.dispatch_ready_steps();
    let build = step_of(&run, "build");
    orchestrator
        .runs
        .report_step_transition(build, Status::Running, None)
        .unwrap();

    orchestrator
        .runs
        .request_cancel(EntityRef::Run(run.id))
        .unwrap();

    let ack = orchestrator
        .agents
        .heartbeat("a1", Heartbeat::default())
        .unwrap();
    assert_eq!(ack.cancel_step, Some(build));

    tokio::time::sleep(Duration::from_secs(3)).await;
    orchestrator
        .runs
        .report_step_transition(build, Status::Cancelled, None)
        .unwrap();

    // Past the grace period the acknowledged step stays cancelled
    tokio::time::sleep(Duration::from_secs(20)).await;
    let run = orchestrator.runs.get_run(run.id).unwrap();
    assert_eq!(run.status, Status::Cancelled);
    assert_eq!(run.stage("build").unwrap().steps[0].status, Status::Cancelled);
    assert_eq!(run.stage("test").unwrap().steps[0].status, Status::Cancelled);
}

#[test]
fn test_run_events_are_gapless_and_replayable() {
    let orchestrator = orchestrator(Config::default());
    let mut live = orchestrator
        .bus
        .subscribe(TopicPattern::new("run.**").unwrap(), None)
        .unwrap();
    register(&orchestrator, "a1");
    let run = start_run(&orchestrator);

    orchestrator.runs.dispatch_ready_steps();
    let build = step_of(&run, "build");
    orchestrator
        .runs
        .report_step_transition(build, Status::Running, None)
        .unwrap();
    orchestrator
        .runs
        .report_step_output(build, 1, "compiling".to_string())
        .unwrap();
    orchestrator
        .runs
        .report_step_transition(build, Status::Succeeded, None)
        .unwrap();
    orchestrator.runs.dispatch_ready_steps();
    finish(&orchestrator, step_of(&run, "test"), Status::Succeeded);

    let sequences: Vec<u64> = drain(&mut live)
        .into_iter()
        .filter_map(|d| match d {
            Delivery::Event(event) if event.run_id == run.id => Some(event.sequence),
            _ => None,
        })
        .collect();
    let last = *sequences.last().unwrap();
    assert_eq!(sequences, (1..=last).collect::<Vec<_>>());
    assert_eq!(orchestrator.runs.get_run(run.id).unwrap().sequence, last);

    let mut replay = orchestrator
        .bus
        .subscribe(
            TopicPattern::new("run.**").unwrap(),
            Some(Cursor {
                run_id: run.id,
                sequence: 4,
            }),
        )
        .unwrap();
    let replayed: Vec<u64> = drain(&mut replay)
        .into_iter()
        .map(|d| match d {
            Delivery::Event(event) => event.sequence,
            Delivery::Gap(gap) => panic!("unexpected gap {:?}", gap),
        })
        .collect();
    assert_eq!(replayed, (4..=last).collect::<Vec<_>>());
}

#[test]
fn test_replay_beyond_history_reports_gap() {
    let orchestrator = orchestrator(Config {
        history_capacity: 4,
        ..Config::default()
    });
    register(&orchestrator, "a1");
    let run = start_run(&orchestrator);
    orchestrator.runs.dispatch_ready_steps();
    finish(&orchestrator, step_of(&run, "build"), Status::Succeeded);

    let last = orchestrator.bus.last_sequence(run.id).unwrap();
    assert!(last > 4);

    let mut replay = orchestrator
        .bus
        .subscribe(
            TopicPattern::all(),
            Some(Cursor {
                run_id: run.id,
                sequence: 1,
            }),
        )
        .unwrap();
    let deliveries = drain(&mut replay);

    assert_eq!(
        deliveries[0],
        Delivery::Gap(Gap {
            run_id: run.id,
            from: 1,
            to: last - 4,
        })
    );
    assert_eq!(deliveries.len(), 5);
}

#[tokio::test]
async fn test_step_logs_follow_output() {
    let orchestrator = orchestrator(Config::default());
    register(&orchestrator, "a1");
    let run = start_run(&orchestrator);
    orchestrator.runs.dispatch_ready_steps();
    let build = step_of(&run, "build");

    let mut output = orchestrator
        .bus
        .subscribe(TopicPattern::new(topics::STEP_OUTPUT_PATTERN).unwrap(), None)
        .unwrap();
    for (seq, line) in [(1, "one"), (2, "two"), (2, "two"), (3, "three")] {
        orchestrator
            .runs
            .report_step_output(build, seq, line.to_string())
            .unwrap();
    }

    for delivery in drain(&mut output) {
        if let Delivery::Event(event) = delivery {
            orchestrator.logs.ingest(&event);
        }
    }

    orchestrator.logs.finish(run.id, build);

    let mut tail = orchestrator.tail_step(build, 1).unwrap();
    let mut lines = Vec::new();
    while let Some(item) = tail.recv().await.unwrap() {
        match item {
            TailItem::Chunk(chunk) => lines.push(chunk.line),
            TailItem::Gap { from, to } => panic!("unexpected gap {from}..={to}"),
        }
    }
    assert_eq!(lines, vec!["one", "two", "three"]);
}

#[tokio::test]
async fn test_background_loops_run_webhook_to_dispatch() {
    let orchestrator = std::sync::Arc::new(orchestrator(Config::default()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = orchestrator.spawn(shutdown_rx);
    register(&orchestrator, "a1");

    // Wait for the trigger consumer and log pump to subscribe
    tokio::time::timeout(Duration::from_secs(5), async {
        while orchestrator.bus.subscriber_count() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    orchestrator
        .bus
        .publish(EventDraft::system(
            Topic::new(topics::WEBHOOK_GITHUB).unwrap(),
            serde_json::json!({ "pipeline": "ci", "commit": "feedbeef" }),
        ))
        .unwrap();

    let run_id = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(run) = orchestrator.runs.list_runs().first() {
                return run.id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let build = step_of(&orchestrator.runs.get_run(run_id).unwrap(), "build");
    tokio::time::timeout(Duration::from_secs(5), async {
        while orchestrator.runs.get_step(build).unwrap().status != Status::Started {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let mut tail = orchestrator.tail_step(build, 1).unwrap();
    orchestrator
        .runs
        .report_step_output(build, 1, "hello".to_string())
        .unwrap();
    let item = tokio::time::timeout(Duration::from_secs(5), tail.recv())
        .await
        .unwrap()
        .unwrap();
    match item {
        Some(TailItem::Chunk(chunk)) => assert_eq!(chunk.line, "hello"),
        other => panic!("expected output, got {:?}", other),
    }

    shutdown_tx.send(true).unwrap();
    for worker in workers {
        worker.await.unwrap();
    }
}
