use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use prompt_recorder::notify::ChangeKind;
use prompt_recorder::{Config, FlowEvent, PromptFilter, PromptRecord, Recorder, Source, Submission, WriteOutcome};

fn config_in(dir: &Path) -> Config {
    let mut config = Config::default();
    config.storage.database_path = dir.join("prompts.db").display().to_string();
    config.storage.backup_path = dir.join("prompts.json").display().to_string();
    config.storage.busy_timeout_ms = 50;
    config.retry.backoff_ms = 10;
    config
}

fn submit(recorder: &Recorder, text: &str, llm: &str) -> String {
    let outcome = recorder.submit(Submission::new(text, llm)).unwrap();
    outcome.id().expect("record should be stored").to_string()
}

fn chat_flow(text: &str) -> FlowEvent {
    let body = serde_json::json!({
        "model": "gpt-4o",
        "messages": [{"role": "user", "content": text}],
    });
    FlowEvent::new("POST", "https://api.openai.com/v1/chat/completions", body.to_string())
        .with_header("content-type", "application/json")
}

fn paths(recorder: &Recorder, id: &str) -> Vec<String> {
    let mut paths: Vec<String> = recorder
        .associations(id)
        .unwrap()
        .into_iter()
        .map(|a| a.file_path)
        .collect();
    paths.sort();
    paths
}

#[test]
fn test_non_matching_flow_has_no_side_effects() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Recorder::open(config_in(dir.path()));
    let mut events = recorder.subscribe();

    let flows = [
        FlowEvent::new("GET", "https://static.example.com/logo.svg", "<svg/>"),
        FlowEvent::new("POST", "https://telemetry.example.com/v1/events", r#"{"event":"click"}"#),
        FlowEvent::new("POST", "https://api.openai.com/v1/chat/completions", "\u{0}\u{1}binary"),
        FlowEvent::new("POST", "https://api.openai.com/v1/chat/completions", r#"{"unexpected":"shape"}"#),
    ];
    for flow in &flows {
        assert!(recorder.on_flow_observed(flow).unwrap().is_none());
    }

    assert!(events.try_recv().is_err());
    assert!(recorder.list_recent(10).unwrap().is_empty());
    assert!(recorder.coordinator().backup().load().unwrap().is_empty());
}

#[test]
fn test_round_trip_n_records() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Recorder::open(config_in(dir.path()));

    let mut written = vec![];
    for i in 0..12 {
        let mut submission = Submission::new(format!("prompt number {}", i), "Claude");
        submission.model_name = Some("claude-3-haiku".to_string());
        submission.description = Some(format!("desc {}", i));
        submission.metadata = Some(serde_json::from_str(r#"{"tokens": 42, "tags": ["a", "b"]}"#).unwrap());
        let outcome = recorder.submit(submission).unwrap();
        written.push(outcome.id().unwrap().to_string());
    }

    let all = recorder.query(&PromptFilter::default()).unwrap();
    assert_eq!(all.len(), 12);
    for id in &written {
        let stored = all.iter().find(|r| &r.id == id).unwrap();
        let backup = recorder.coordinator().backup().get(id).unwrap().unwrap();
        assert_eq!(stored, &backup.record);
        assert_eq!(stored.model_name, "claude-3-haiku");
        assert_eq!(stored.metadata["tokens"], 42);
    }

    // newest first
    assert!(all.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));
}

#[test]
fn test_reconcile_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Recorder::open(config_in(dir.path()));
    recorder.register_active_files(&["/work/a.rs"]).unwrap();
    submit(&recorder, "first", "ChatGPT");
    submit(&recorder, "second", "ChatGPT");

    let first = recorder.reconcile().unwrap();
    assert!(first.restored.is_empty());
    assert_eq!(first.backup_entries, 2);

    let before = recorder.query(&PromptFilter::default()).unwrap();
    let second = recorder.reconcile().unwrap();
    assert_eq!(second, first);
    assert_eq!(recorder.query(&PromptFilter::default()).unwrap(), before);
    assert_eq!(recorder.stats().unwrap().associations, 2);
}

#[test]
fn test_duplicate_window() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Recorder::open(config_in(dir.path()));
    let coordinator = recorder.coordinator();

    let mut first = PromptRecord::new(Source::Proxy, "ChatGPT", "retry me");
    first.conversation_id = "conv-a".to_string();
    let first_id = first.id.clone();
    assert!(matches!(coordinator.write(first.clone(), &[]).unwrap(), WriteOutcome::Recorded { .. }));

    let mut retry = PromptRecord::new(Source::Proxy, "ChatGPT", "retry me");
    retry.conversation_id = "conv-a".to_string();
    retry.timestamp = first.timestamp + chrono::Duration::seconds(2);
    let retry_id = retry.id.clone();
    assert_eq!(
        coordinator.write(retry, &[]).unwrap(),
        WriteOutcome::Duplicate {
            dropped_id: retry_id.clone(),
            existing_id: first_id.clone(),
        }
    );
    assert!(recorder.get(&retry_id).unwrap().is_none());

    let mut later = PromptRecord::new(Source::Proxy, "ChatGPT", "retry me");
    later.conversation_id = "conv-a".to_string();
    later.timestamp = first.timestamp + chrono::Duration::seconds(10);
    assert!(matches!(coordinator.write(later, &[]).unwrap(), WriteOutcome::Recorded { .. }));

    assert_eq!(recorder.list_recent(10).unwrap().len(), 2);
    assert_eq!(coordinator.backup().load().unwrap().len(), 2);
}

#[test]
fn test_dedup_can_be_disabled() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_in(dir.path());
    config.deduplication.enabled = false;
    let recorder = Recorder::open(config);

    submit(&recorder, "same", "Claude");
    submit(&recorder, "same", "Claude");
    assert_eq!(recorder.list_recent(10).unwrap().len(), 2);
}

#[test]
fn test_associations_accumulate() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Recorder::open(config_in(dir.path()));

    recorder.register_active_files(&["/p/a.rs", "/p/b.rs"]).unwrap();
    let r1 = submit(&recorder, "first prompt", "Claude");

    recorder.register_active_files(&["/p/c.rs", "/p/d.rs"]).unwrap();
    let r2 = submit(&recorder, "second prompt", "Claude");

    assert_eq!(paths(&recorder, &r1), vec!["/p/a.rs", "/p/b.rs"]);
    assert_eq!(paths(&recorder, &r2), vec!["/p/c.rs", "/p/d.rs"]);

    // retroactive links add, never replace
    let outcome = recorder.associate_file(&r1, "/p/c.rs", Some(-30)).unwrap();
    assert!(outcome.degraded.is_none());
    assert_eq!(paths(&recorder, &r1), vec!["/p/a.rs", "/p/b.rs", "/p/c.rs"]);

    let backup = recorder.coordinator().backup().get(&r1).unwrap().unwrap();
    assert_eq!(backup.files, vec!["/p/a.rs", "/p/b.rs", "/p/c.rs"]);
    assert_eq!(backup.file_changes.get("/p/c.rs"), Some(&-30));

    assert!(recorder.associate_file("no-such-prompt", "/p/x.rs", None).is_err());
    assert!(recorder.associate_file(&r1, "", None).is_err());
}

#[test]
fn test_rest_then_proxy_share_conversation() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Recorder::open(config_in(dir.path()));

    let mut submission = Submission::new("Summarize file main.go", "ChatGPT");
    submission.url = Some("https://api.openai.com/v1/chat/completions".to_string());
    let first = recorder.submit(submission).unwrap();
    let WriteOutcome::Recorded { id: first_id, conversation_id } = first else {
        panic!("expected recorded outcome");
    };
    assert!(conversation_id.starts_with("chatgpt-"));
    assert!(recorder.associations(&first_id).unwrap().is_empty());

    recorder.register_active_files(&["main.go"]).unwrap();
    let second = recorder.on_flow_observed(&chat_flow("continue")).unwrap().unwrap();
    let WriteOutcome::Recorded { id: second_id, conversation_id: second_conversation } = second else {
        panic!("expected recorded outcome");
    };

    assert_eq!(second_conversation, conversation_id);
    let record = recorder.get(&second_id).unwrap().unwrap();
    assert_eq!(record.source, Source::Proxy);
    assert_eq!(record.prompt_text, "continue");

    let files = recorder.associations(&second_id).unwrap();
    assert_eq!(files.len(), 1);
    assert!(files[0].file_path.ends_with("main.go"));
    assert!(Path::new(&files[0].file_path).is_absolute());

    let conversation = recorder
        .query(&PromptFilter {
            conversation_id: Some(conversation_id),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(conversation.len(), 2);
}

#[test]
fn test_recovery_from_backup_after_primary_loss() {
    let dir = tempfile::tempdir().unwrap();
    let originals = {
        let recorder = Recorder::open(config_in(dir.path()));
        recorder.register_active_files(&["/src/lib.rs"]).unwrap();
        submit(&recorder, "one", "Claude");
        submit(&recorder, "two", "Gemini");
        let id = submit(&recorder, "three", "ChatGPT");
        recorder.associate_file(&id, "/src/main.rs", Some(12)).unwrap();
        recorder.query(&PromptFilter::default()).unwrap()
    };
    assert_eq!(originals.len(), 3);

    std::fs::remove_file(dir.path().join("prompts.db")).unwrap();

    let recorder = Recorder::open(config_in(dir.path()));
    assert!(recorder.list_recent(10).unwrap().is_empty());

    let report = recorder.reconcile().unwrap();
    assert_eq!(report.restored.len(), 3);
    assert_eq!(report.associations_restored, 4);

    let restored = recorder.query(&PromptFilter::default()).unwrap();
    assert_eq!(restored, originals);

    let three = originals.iter().find(|r| r.prompt_text == "three").unwrap();
    let files = recorder.associations(&three.id).unwrap();
    assert_eq!(files.len(), 2);
    assert_eq!(
        files.iter().find(|f| f.file_path == "/src/main.rs").unwrap().token_change,
        Some(12)
    );

    assert!(recorder.reconcile().unwrap().restored.is_empty());
}

#[test]
fn test_unusable_primary_degrades_then_recovers() {
    let dir = tempfile::tempdir().unwrap();
    // a regular file where the database directory should be
    std::fs::write(dir.path().join("blocked"), "").unwrap();

    let mut config = config_in(dir.path());
    config.storage.database_path = dir.path().join("blocked/prompts.db").display().to_string();
    let recorder = Recorder::open(config);
    let mut events = recorder.subscribe();

    let outcome = recorder.submit(Submission::new("kept in backup", "Claude")).unwrap();
    assert!(outcome.is_degraded());
    let id = outcome.id().unwrap().to_string();
    assert_eq!(events.try_recv().unwrap().kind, ChangeKind::Recorded);

    // reads fall back to the backup store
    assert_eq!(recorder.list_recent(5).unwrap()[0].id, id);
    let stats = recorder.stats().unwrap();
    assert!(!stats.primary_available);
    assert_eq!(stats.total, 1);

    // point a fresh recorder at a usable database with the same backup
    let recovered = Recorder::open(config_in(dir.path()));
    let report = recovered.reconcile().unwrap();
    assert_eq!(report.restored, vec![id.clone()]);
    assert!(recovered.coordinator().primary_available());
    assert_eq!(recovered.get(&id).unwrap().unwrap().prompt_text, "kept in backup");
}

#[test]
fn test_busy_primary_is_retried_then_degraded() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Recorder::open(config_in(dir.path()));

    let other = rusqlite::Connection::open(dir.path().join("prompts.db")).unwrap();
    other.execute_batch("BEGIN EXCLUSIVE;").unwrap();

    let started = std::time::Instant::now();
    let outcome = recorder.submit(Submission::new("written while locked", "Claude")).unwrap();
    assert!(started.elapsed() < std::time::Duration::from_secs(2));
    let WriteOutcome::Degraded { id, reason, .. } = outcome else {
        panic!("expected degraded outcome");
    };
    assert!(reason.contains("busy"), "reason was {}", reason);

    other.execute_batch("COMMIT;").unwrap();
    drop(other);

    // the next successful write restores the earlier one
    submit(&recorder, "written after unlock", "Claude");
    assert!(recorder.get(&id).unwrap().is_some());
    assert_eq!(recorder.stats().unwrap().total, 2);
}

#[test]
fn test_concurrent_writers_lose_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Arc::new(Recorder::open(config_in(dir.path())));

    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let recorder = Arc::clone(&recorder);
            std::thread::spawn(move || {
                let mut ids = vec![];
                for i in 0..5 {
                    let outcome = if i % 2 == 0 {
                        recorder.submit(Submission::new(format!("worker {} prompt {}", worker, i), "Claude"))
                    } else {
                        recorder
                            .on_flow_observed(&chat_flow(&format!("worker {} flow {}", worker, i)))
                            .map(|o| o.expect("chat flow carries a prompt"))
                    };
                    ids.push(outcome.unwrap().id().unwrap().to_string());
                }
                ids
            })
        })
        .collect();

    let mut ids: Vec<String> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
    assert_eq!(ids.len(), 20);
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 20, "ids must be unique");

    let stored: HashSet<String> = recorder
        .query(&PromptFilter::default())
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(stored.len(), 20);
    assert!(ids.iter().all(|id| stored.contains(id)));
    assert_eq!(recorder.coordinator().backup().load().unwrap().len(), 20);
}

#[test]
fn test_legacy_backup_is_imported() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("prompts.json"),
        r#"[
    {
        "id": "legacy-1",
        "timestamp": "2024-02-11T09:30:12.512000",
        "prompt_text": "Refactor the settings dialog",
        "description": "Prompt from Claude",
        "model": "Claude",
        "files": ["/home/me/app/settings.py"],
        "source": "Claude Desktop"
    },
    {
        "id": "legacy-2",
        "timestamp": "2024-02-11T10:02:00",
        "prompt_text": "Explain this stack trace",
        "model": "ChatGPT",
        "files": [],
        "source": "Web Browser"
    }
]"#,
    )
    .unwrap();

    let recorder = Recorder::open(config_in(dir.path()));
    let report = recorder.reconcile().unwrap();
    assert_eq!(report.restored.len(), 2);

    let first = recorder.get("legacy-1").unwrap().unwrap();
    assert_eq!(first.llm_name, "Claude");
    assert_eq!(first.source, Source::AssistantIntegration);
    assert_eq!(paths(&recorder, "legacy-1"), vec!["/home/me/app/settings.py"]);

    let by_source = recorder
        .query(&PromptFilter {
            source: Some(Source::Proxy),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(by_source.len(), 1);
    assert_eq!(by_source[0].id, "legacy-2");

    // new writes append after the legacy entries
    submit(&recorder, "fresh prompt", "Claude");
    assert_eq!(recorder.coordinator().backup().load().unwrap().len(), 3);
}

#[tokio::test]
async fn test_subscribers_see_recorded_and_associated() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Recorder::open(config_in(dir.path()));
    let mut events = recorder.subscribe();

    let id = submit(&recorder, "notify me", "Claude");
    recorder.associate_file(&id, "/x/y.rs", None).unwrap();

    let recorded = events.recv().await.unwrap();
    assert_eq!(recorded.kind, ChangeKind::Recorded);
    assert_eq!(recorded.prompt_id, id);

    let associated = events.recv().await.unwrap();
    assert_eq!(associated.kind, ChangeKind::Associated);
    assert_eq!(associated.conversation_id, recorded.conversation_id);
}
