use maestro::maestro::memory::{MemoryStore, SessionDraft, SESSION_CAP};
use maestro::maestro::paths::Resolver;
use std::sync::Arc;
use tempfile::TempDir;

fn store() -> (TempDir, MemoryStore) {
    let dir = TempDir::new().unwrap();
    let resolver = Arc::new(Resolver::new(dir.path()));
    (dir, MemoryStore::new(resolver))
}

#[test]
fn test_record_gotcha_deduplicates_case_insensitively() {
    let (_dir, store) = store();
    assert!(store.record_gotcha("Watch out for stale locks").unwrap());
    assert!(!store.record_gotcha("watch out for STALE locks").unwrap());
    assert!(store.record_gotcha("A different gotcha").unwrap());

    let stats = store.stats();
    assert_eq!(stats.gotcha_count, 2);
}

#[test]
fn test_record_discovery_replaces_description_for_same_path() {
    let (_dir, store) = store();
    store
        .record_discovery("src/lib.rs", "crate root", "entry")
        .unwrap();
    store
        .record_discovery("src/lib.rs", "crate root with re-exports", "entry")
        .unwrap();

    let stats = store.stats();
    assert_eq!(stats.discovery_count, 1);

    let context = store.load_memory_for_context();
    assert_eq!(context.discoveries.len(), 1);
    assert!(context.discoveries[0].contains("re-exports"));
}

#[test]
fn test_save_session_numbers_and_extracts() {
    let (_dir, store) = store();
    let draft = SessionDraft {
        summary: "wired the hook pipeline".to_string(),
        patterns_found: vec!["register hooks before dispatch".to_string()],
        gotchas_encountered: vec!["PostToolUse cannot block".to_string()],
        discoveries: vec![(
            "src/maestro/hooks.rs".to_string(),
            "pipeline".to_string(),
            "core".to_string(),
        )],
        ..SessionDraft::default()
    };

    assert_eq!(store.save_session(&draft).unwrap(), 1);
    assert_eq!(store.save_session(&draft).unwrap(), 2);

    let stats = store.stats();
    assert_eq!(stats.session_count, 2);
    // Extraction deduplicates across sessions.
    assert_eq!(stats.pattern_count, 1);
    assert_eq!(stats.gotcha_count, 1);
    assert_eq!(stats.discovery_count, 1);
}

#[test]
fn test_sessions_pruned_to_cap() {
    let (_dir, store) = store();
    for i in 0..(SESSION_CAP + 3) {
        let draft = SessionDraft {
            summary: format!("session number {}", i),
            ..SessionDraft::default()
        };
        store.save_session(&draft).unwrap();
    }
    let stats = store.stats();
    assert_eq!(stats.session_count, SESSION_CAP);

    // The newest sessions survive.
    let context = store.load_memory_for_context();
    assert!(context
        .recent_sessions
        .last()
        .unwrap()
        .contains(&format!("session number {}", SESSION_CAP + 2)));
}

#[test]
fn test_load_memory_for_context_respects_caps() {
    let (_dir, store) = store();
    for i in 0..60 {
        store
            .record_gotcha(&format!("gotcha {} {}", i, "x".repeat(180)))
            .unwrap();
    }
    let context = store.load_memory_for_context();
    assert!(context.gotchas.len() <= 20);
    let total_chars: usize = context.gotchas.iter().map(|g| g.len()).sum();
    assert!(total_chars <= 2000);
}

#[tokio::test]
async fn test_session_end_hook_persists_the_draft() {
    use maestro::maestro::hooks::{Hook, HookEnvelope, HookEvent};
    use maestro::maestro::memory::SessionEndHook;

    let dir = tempfile::TempDir::new().unwrap();
    let resolver = Arc::new(Resolver::new(dir.path()));
    let hook = SessionEndHook::new(Arc::clone(&resolver));

    let envelope = HookEnvelope::for_event(HookEvent::SessionEnd).with_context(
        "session",
        serde_json::json!({"summary": "wrapped up the refactor"}),
    );
    hook.run(&envelope).await.unwrap();

    let store = MemoryStore::new(resolver);
    let context = store.load_memory_for_context();
    assert_eq!(context.recent_sessions.len(), 1);
    assert!(context.recent_sessions[0].contains("wrapped up the refactor"));

    // Without a draft the hook errors (and the pipeline fails it open).
    let empty = HookEnvelope::for_event(HookEvent::SessionEnd);
    assert!(hook.run(&empty).await.is_err());
}

#[test]
fn test_corrupt_files_degrade_to_empty() {
    let (dir, store) = store();
    let gotchas = dir.path().join("runtime/memory/gotchas.json");
    std::fs::create_dir_all(gotchas.parent().unwrap()).unwrap();
    std::fs::write(&gotchas, "not json at all").unwrap();

    let context = store.load_memory_for_context();
    assert!(context.gotchas.is_empty());
}
