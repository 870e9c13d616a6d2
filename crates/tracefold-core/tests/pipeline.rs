//! End-to-end: OTLP/JSON payloads in, reconstructed runs out.

use chrono::Utc;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::thread;
use tempfile::NamedTempFile;
use tracefold_core::{
    AgentRun, ClaimScheduler, Ingestor, NoopRequester, ProcessingConfig, ProcessingStatus, Role, Store,
};

struct SpanFixture<'a> {
    id: &'a str,
    start_secs: u64,
    run: &'a str,
    attrs: Vec<(&'a str, &'a str)>,
}

fn payload(spans: &[SpanFixture<'_>]) -> Vec<u8> {
    let spans: Vec<Value> = spans
        .iter()
        .map(|s| {
            let mut attrs: Vec<Value> = s
                .attrs
                .iter()
                .map(|(k, v)| json!({"key": k, "value": {"stringValue": v}}))
                .collect();
            attrs.push(json!({"key": "agent_run_id", "value": {"stringValue": s.run}}));
            let start = s.start_secs * 1_000_000_000;
            json!({
                "traceId": "4bf92f3577b34da6a3ce929d0e0e4736",
                "spanId": s.id,
                "name": "chat",
                "startTimeUnixNano": start.to_string(),
                "endTimeUnixNano": (start + 500_000_000).to_string(),
                "attributes": attrs,
            })
        })
        .collect();
    serde_json::to_vec(&json!({
        "resourceSpans": [{
            "resource": {"attributes": [{"key": "service.name", "value": {"stringValue": "agent"}}]},
            "scopeSpans": [{"scope": {"name": "test"}, "spans": spans}]
        }]
    }))
    .unwrap()
}

fn prompt_with_tool_call<'a>(extra: Vec<(&'a str, &'a str)>) -> Vec<(&'a str, &'a str)> {
    let mut attrs = vec![
        ("gen_ai.prompt.0.role", "user"),
        ("gen_ai.prompt.0.content", "hi"),
        ("gen_ai.prompt.1.role", "assistant"),
        ("gen_ai.prompt.1.tool_calls.0.id", "42"),
        ("gen_ai.prompt.1.tool_calls.0.name", "lookup"),
    ];
    attrs.extend(extra);
    attrs
}

fn setup() -> (Store, Ingestor, ClaimScheduler) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let store = Store::memory().unwrap();
    let ingestor = Ingestor::new(store.clone(), Arc::new(NoopRequester));
    let scheduler = ClaimScheduler::with_lease(store.clone(), Arc::new(NoopRequester), ProcessingConfig::default());
    (store, ingestor, scheduler)
}

fn load(store: &Store, run: &str) -> AgentRun {
    store.load_agent_run(run).unwrap().expect("run was persisted")
}

#[test]
fn test_empty_tool_result_is_backfilled_across_submissions() {
    let (store, ingestor, scheduler) = setup();

    let s1 = SpanFixture {
        id: "00000000000000a1",
        start_secs: 1,
        run: "r",
        attrs: vec![
            ("gen_ai.prompt.0.role", "user"),
            ("gen_ai.prompt.0.content", "hi"),
            ("gen_ai.completion.0.tool_calls.0.id", "42"),
            ("gen_ai.completion.0.tool_calls.0.name", "lookup"),
        ],
    };
    let s2 = SpanFixture {
        id: "00000000000000a2",
        start_secs: 2,
        run: "r",
        attrs: prompt_with_tool_call(vec![
            ("gen_ai.prompt.2.role", "tool"),
            ("gen_ai.prompt.2.tool_call_id", "42"),
            ("gen_ai.prompt.2.content", ""),
        ]),
    };
    let s3 = SpanFixture {
        id: "00000000000000a3",
        start_secs: 3,
        run: "r",
        attrs: prompt_with_tool_call(vec![
            ("gen_ai.prompt.2.role", "tool"),
            ("gen_ai.prompt.2.tool_call_id", "42"),
            ("gen_ai.prompt.2.content", "result"),
        ]),
    };

    ingestor.submit_spans("c", &payload(&[s1])).unwrap();
    scheduler.drain("c").unwrap();
    ingestor.submit_spans("c", &payload(&[s2])).unwrap();
    ingestor.submit_spans("c", &payload(&[s3])).unwrap();
    scheduler.drain("c").unwrap();

    let run = load(&store, "r");
    assert_eq!(run.transcripts.len(), 1);
    let tools: Vec<_> = run.transcripts[0]
        .messages
        .iter()
        .filter(|m| m.role == Role::Tool)
        .collect();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].tool_call_id.as_deref(), Some("42"));
    assert_eq!(tools[0].content, "result");

    let status = store.run_status("r").unwrap().unwrap();
    assert_eq!(status.status, ProcessingStatus::Completed);
    assert_eq!(status.processed_version, status.current_version);
}

#[test]
fn test_group_with_missing_parent_is_persisted_without_it() {
    let (store, ingestor, scheduler) = setup();
    let now = Utc::now();
    let fields = |v: Value| -> Map<String, Value> { v.as_object().cloned().unwrap() };

    ingestor
        .submit_transcript_group_metadata("c", "r", "A", fields(json!({"name": "root"})), now)
        .unwrap();
    ingestor
        .submit_transcript_group_metadata("c", "r", "B", fields(json!({"parent_transcript_group_id": "A"})), now)
        .unwrap();
    ingestor
        .submit_transcript_group_metadata("c", "r", "C", fields(json!({"parent_transcript_group_id": "Z"})), now)
        .unwrap();
    let reports = scheduler.drain("c").unwrap();
    assert_eq!(reports.iter().map(|r| r.failed + r.escalated).sum::<usize>(), 0);

    let run = load(&store, "r");
    let parent = |id: &str| {
        run.transcript_groups
            .iter()
            .find(|g| g.id == id)
            .map(|g| g.parent_transcript_group_id.clone())
    };
    assert_eq!(parent("A"), Some(None));
    assert_eq!(parent("B"), Some(Some("A".to_string())));
    assert_eq!(parent("C"), Some(None));
}

#[test]
fn test_resubmitting_identical_spans_changes_nothing() {
    let (store, ingestor, scheduler) = setup();
    let spans = || {
        payload(&[
            SpanFixture {
                id: "00000000000000b1",
                start_secs: 1,
                run: "r",
                attrs: vec![
                    ("gen_ai.prompt.0.content", "plan a trip"),
                    ("gen_ai.completion.0.content", "where to?"),
                    ("transcript_group_id", "planner"),
                ],
            },
            SpanFixture {
                id: "00000000000000b2",
                start_secs: 2,
                run: "r",
                attrs: vec![
                    ("gen_ai.prompt.0.content", "plan a trip"),
                    ("gen_ai.prompt.1.role", "assistant"),
                    ("gen_ai.prompt.1.content", "where to?"),
                    ("gen_ai.prompt.2.content", "Lisbon"),
                    ("gen_ai.completion.0.content", "booked"),
                    ("agent_run.score.success", "1"),
                ],
            },
        ])
    };

    ingestor.submit_spans("c", &spans()).unwrap();
    scheduler.drain("c").unwrap();
    let once = load(&store, "r");

    ingestor.submit_spans("c", &spans()).unwrap();
    scheduler.drain("c").unwrap();
    let twice = load(&store, "r");

    assert_eq!(once, twice);
    assert_eq!(once.transcripts.len(), 1);
    assert_eq!(once.transcripts[0].messages.len(), 4);
    // No group fragment for "planner", so the reference is dropped.
    assert_eq!(once.transcripts[0].transcript_group_id, None);
    assert_eq!(once.scores["success"], json!(1));
}

#[test]
fn test_explicit_score_overrides_span_score() {
    let (store, ingestor, scheduler) = setup();
    ingestor
        .submit_spans(
            "c",
            &payload(&[SpanFixture {
                id: "00000000000000c1",
                start_secs: 1,
                run: "r",
                attrs: vec![("agent_run.score.accuracy", "0.2")],
            }]),
        )
        .unwrap();
    ingestor
        .submit_score("c", "r", "accuracy", json!(0.9), Utc::now())
        .unwrap();
    scheduler.drain("c").unwrap();
    assert_eq!(load(&store, "r").scores["accuracy"], json!(0.9));
}

#[test]
fn test_non_finite_double_is_dropped_and_the_run_still_completes() {
    let (store, ingestor, scheduler) = setup();
    ingestor
        .submit_spans(
            "c",
            &payload(&[SpanFixture {
                id: "00000000000000d1",
                start_secs: 1,
                run: "r",
                attrs: vec![("gen_ai.prompt.0.content", "hello")],
            }]),
        )
        .unwrap();

    let mut body: Value = serde_json::from_slice(&payload(&[SpanFixture {
        id: "00000000000000d2",
        start_secs: 2,
        run: "r",
        attrs: vec![
            ("gen_ai.prompt.0.content", "hello"),
            ("gen_ai.completion.0.content", "hi there"),
        ],
    }]))
    .unwrap();
    body["resourceSpans"][0]["scopeSpans"][0]["spans"][0]["attributes"]
        .as_array_mut()
        .unwrap()
        .push(json!({"key": "llm.temperature", "value": {"doubleValue": "NaN"}}));
    ingestor
        .submit_spans("c", &serde_json::to_vec(&body).unwrap())
        .unwrap();

    let reports = scheduler.drain("c").unwrap();
    assert_eq!(reports.iter().map(|r| r.failed + r.escalated).sum::<usize>(), 0);
    assert_eq!(store.run_status("r").unwrap().unwrap().status, ProcessingStatus::Completed);
    let run = load(&store, "r");
    assert_eq!(run.transcripts.len(), 1);
    assert_eq!(run.transcripts[0].messages.len(), 2);
}

#[test]
fn test_runs_may_reuse_transcript_and_group_ids() {
    let (store, ingestor, scheduler) = setup();
    for run in ["r1", "r2"] {
        ingestor
            .submit_spans(
                "c",
                &payload(&[SpanFixture {
                    id: if run == "r1" { "00000000000000e1" } else { "00000000000000e2" },
                    start_secs: 1,
                    run,
                    attrs: vec![
                        ("gen_ai.prompt.0.content", run),
                        ("transcript_id", "main"),
                        ("transcript_group_id", "g"),
                    ],
                }]),
            )
            .unwrap();
        ingestor
            .submit_transcript_group_metadata(
                "c",
                run,
                "g",
                json!({"name": run}).as_object().cloned().unwrap(),
                Utc::now(),
            )
            .unwrap();
    }
    scheduler.drain("c").unwrap();
    // Rebuilding r1 after r2 must not take the group back from r2.
    ingestor.submit_score("c", "r1", "ok", json!(1), Utc::now()).unwrap();
    scheduler.drain("c").unwrap();

    for run_id in ["r1", "r2"] {
        let status = store.run_status(run_id).unwrap().unwrap();
        assert_eq!(status.status, ProcessingStatus::Completed, "{}", run_id);
        let run = load(&store, run_id);
        assert_eq!(run.transcript_groups.len(), 1, "{}", run_id);
        assert_eq!(run.transcript_groups[0].name.as_deref(), Some(run_id));
        assert_eq!(run.transcripts.len(), 1, "{}", run_id);
        assert_eq!(run.transcripts[0].id, "main");
        assert_eq!(run.transcripts[0].transcript_group_id.as_deref(), Some("g"));
        assert_eq!(run.transcripts[0].messages[0].content, run_id);
    }
}

#[test]
fn test_delete_run_removes_everything() {
    let (store, ingestor, scheduler) = setup();
    ingestor
        .submit_score("c", "r", "accuracy", json!(1), Utc::now())
        .unwrap();
    scheduler.drain("c").unwrap();
    assert!(store.load_agent_run("r").unwrap().is_some());

    store.delete_run("r").unwrap();
    assert!(store.load_agent_run("r").unwrap().is_none());
    assert!(store.run_status("r").unwrap().is_none());
    assert_eq!(store.fragment_count("c").unwrap(), 0);
}

/// Producers and a pass loop running at once, each on its own connection.
/// Once producers stop and the collection is drained, every run is current.
#[test]
fn test_concurrent_ingest_and_passes_converge() {
    let tmp = NamedTempFile::new().unwrap();
    let path = tmp.path().to_path_buf();
    Store::open(&path).unwrap();

    let producers: Vec<_> = (0..3)
        .map(|p| {
            let store = Store::open(&path).unwrap();
            thread::spawn(move || {
                let ingestor = Ingestor::new(store, Arc::new(NoopRequester));
                for i in 0..15 {
                    let run = format!("run-{}", i % 5);
                    let id = format!("{:08x}{:08x}", p, i);
                    let content = format!("message {} from producer {}", i, p);
                    let body = payload(&[SpanFixture {
                        id: &id,
                        start_secs: (i + 1) as u64,
                        run: &run,
                        attrs: vec![("gen_ai.prompt.0.content", content.as_str())],
                    }]);
                    ingestor.submit_spans("c", &body).unwrap();
                }
            })
        })
        .collect();

    let passes = {
        let store = Store::open(&path).unwrap();
        thread::spawn(move || {
            let scheduler = ClaimScheduler::with_lease(store, Arc::new(NoopRequester), ProcessingConfig::default());
            for _ in 0..20 {
                scheduler.run_pass("c").unwrap();
            }
        })
    };

    for p in producers {
        p.join().unwrap();
    }
    passes.join().unwrap();

    let store = Store::open(&path).unwrap();
    let scheduler = ClaimScheduler::with_lease(store.clone(), Arc::new(NoopRequester), ProcessingConfig::default());
    scheduler.drain("c").unwrap();

    let statuses = store.list_run_statuses("c").unwrap();
    assert_eq!(statuses.len(), 5);
    for status in statuses {
        assert_eq!(status.status, ProcessingStatus::Completed, "{}", status.run_id);
        assert_eq!(status.processed_version, status.current_version);
        let run = store.load_agent_run(&status.run_id).unwrap().unwrap();
        assert_eq!(run.transcripts.len(), 9);
    }
}
