use maestro::maestro::paths::{ArtifactKind, Resolver};
use maestro::maestro::state::{AuditRecord, GateRecord, RunStatus, StateError, StateStore};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;

fn store() -> (TempDir, StateStore) {
    let dir = TempDir::new().unwrap();
    let resolver = Arc::new(Resolver::new(dir.path()));
    (dir, StateStore::new(resolver))
}

#[test]
fn test_run_lifecycle_and_transition_rules() {
    let (_dir, store) = store();
    let run = store
        .create_run("workflows/web-app.yaml", None, BTreeMap::new())
        .unwrap();
    assert_eq!(run.status, RunStatus::Created);

    store.set_status(&run.id, RunStatus::InProgress).unwrap();
    store.set_status(&run.id, RunStatus::Paused).unwrap();
    // The one allowed reversal.
    store.set_status(&run.id, RunStatus::InProgress).unwrap();
    store.set_status(&run.id, RunStatus::Completed).unwrap();

    // Completed is terminal.
    assert!(matches!(
        store.set_status(&run.id, RunStatus::InProgress),
        Err(StateError::InvalidTransition { .. })
    ));
}

#[test]
fn test_current_step_is_monotonic() {
    let (_dir, store) = store();
    let run = store.create_run("wf", None, BTreeMap::new()).unwrap();
    store.advance_step(&run.id, 2).unwrap();
    assert!(matches!(
        store.advance_step(&run.id, 1),
        Err(StateError::StepRegression { .. })
    ));
    // Same step is allowed (idempotent retries).
    store.advance_step(&run.id, 2).unwrap();
}

#[test]
fn test_artifact_registration_is_idempotent_by_path_and_hash() {
    let (dir, store) = store();
    let run = store.create_run("wf", None, BTreeMap::new()).unwrap();

    let artifact = dir.path().join("report.json");
    std::fs::write(&artifact, "{\"ok\": true}").unwrap();

    assert!(store
        .register_artifact(&run.id, &artifact, ArtifactKind::Generated, None, "analyst", 1)
        .unwrap());
    // Identical content: no-op.
    assert!(!store
        .register_artifact(&run.id, &artifact, ArtifactKind::Generated, None, "analyst", 1)
        .unwrap());
    assert_eq!(store.list_artifacts(&run.id).unwrap().len(), 1);

    // Changed content registers a new record.
    std::fs::write(&artifact, "{\"ok\": false}").unwrap();
    assert!(store
        .register_artifact(&run.id, &artifact, ArtifactKind::Generated, None, "analyst", 2)
        .unwrap());
    assert_eq!(store.list_artifacts(&run.id).unwrap().len(), 2);
}

#[test]
fn test_invalidation_appends_without_rewriting_history() {
    let (dir, store) = store();
    let run = store.create_run("wf", None, BTreeMap::new()).unwrap();
    let artifact = dir.path().join("plan.json");
    std::fs::write(&artifact, "{}").unwrap();
    store
        .register_artifact(&run.id, &artifact, ArtifactKind::Generated, None, "planner", 0)
        .unwrap();

    store
        .invalidate_artifact(&run.id, artifact.to_str().unwrap())
        .unwrap();

    let changes = store.artifact_changes(&run.id).unwrap();
    assert_eq!(changes.len(), 2);
    assert_eq!(changes[0].change, "registered");
    assert_eq!(changes[1].change, "invalidated");
    // The artifact record itself is untouched.
    assert_eq!(store.list_artifacts(&run.id).unwrap().len(), 1);
}

#[test]
fn test_gates_recover_current_step() {
    let (_dir, store) = store();
    let run = store.create_run("wf", None, BTreeMap::new()).unwrap();

    store
        .record_gate(&run.id, 0, &GateRecord::passed("plan-rating", 0, "rated 8.0"))
        .unwrap();
    store
        .record_gate(&run.id, 10, &GateRecord::passed("verification", 1, "ok"))
        .unwrap();
    store
        .record_gate(&run.id, 20, &GateRecord::failed("signoffs", 2, "missing qa"))
        .unwrap();

    // Resume one past the highest passed gate.
    assert_eq!(store.recover_current_step(&run.id).unwrap(), 2);
}

#[test]
fn test_audit_log_appends_one_record_per_line() {
    let (dir, store) = store();
    store
        .append_audit(&AuditRecord::new("PreToolUse", "block", "rm against /home").with_hook("shell-safety"))
        .unwrap();
    store
        .append_audit(&AuditRecord::new("PostDelegation", "success", "done"))
        .unwrap();

    let records = store.read_audit().unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].decision, "block");
    assert!(records[0].timestamp <= records[1].timestamp);

    let raw = std::fs::read_to_string(dir.path().join("runtime/logs/audit.jsonl")).unwrap();
    assert_eq!(raw.lines().count(), 2);
}

#[test]
fn test_purge_run_removes_gates_and_artifacts_with_it() {
    let (dir, store) = store();
    let run = store.create_run("wf", None, BTreeMap::new()).unwrap();
    store
        .record_gate(&run.id, 0, &GateRecord::passed("plan-rating", 0, "ok"))
        .unwrap();
    let run_dir = dir.path().join("runtime/runs").join(&run.id);
    assert!(run_dir.exists());

    store.purge_run(&run.id).unwrap();
    assert!(!run_dir.exists());
    assert!(store.load_run(&run.id).is_err());
}

#[test]
fn test_save_plan_and_rating_live_under_the_run() {
    let (dir, store) = store();
    let run = store.create_run("wf", None, BTreeMap::new()).unwrap();
    store
        .save_plan(&run.id, "plan-01", &json!({"phases": ["discovery"]}))
        .unwrap();
    store
        .save_plan_rating(&run.id, "plan-01", &json!({"rating": 8.0}))
        .unwrap();

    let plans = dir.path().join("runtime/runs").join(&run.id).join("plans");
    assert!(plans.join("plan-01.json").exists());
    assert!(plans.join("plan-01-rating.json").exists());
}
