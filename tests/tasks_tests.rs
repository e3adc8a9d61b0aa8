use maestro::maestro::paths::Resolver;
use maestro::maestro::tasks::{TaskError, TaskPatch, TaskStatus, TaskStore};
use std::collections::BTreeSet;
use std::sync::Arc;
use tempfile::TempDir;

fn store() -> (TempDir, TaskStore) {
    let dir = TempDir::new().unwrap();
    let resolver = Arc::new(Resolver::new(dir.path()));
    (dir, TaskStore::new(resolver))
}

fn deps(ids: &[&str]) -> BTreeSet<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_create_assigns_sequential_ids() {
    let (_dir, store) = store();
    let first = store.create("Design schema", "draw the tables", deps(&[])).unwrap();
    let second = store.create("Write migrations", "sql", deps(&[])).unwrap();
    assert_eq!(first.id, "1");
    assert_eq!(second.id, "2");
    assert_eq!(store.list(None).unwrap().len(), 2);
}

#[test]
fn test_unknown_dependency_rejected() {
    let (_dir, store) = store();
    assert!(matches!(
        store.create("Orphan", "depends on nothing real", deps(&["42"])),
        Err(TaskError::UnknownDependency { .. })
    ));
}

#[test]
fn test_claim_requires_completed_dependencies() {
    let (_dir, store) = store();
    let base = store.create("Base", "first", deps(&[])).unwrap();
    let dependent = store
        .create("Dependent", "second", deps(&[base.id.as_str()]))
        .unwrap();

    assert!(matches!(
        store.claim(&dependent.id, "backend-engineer"),
        Err(TaskError::DependencyIncomplete { .. })
    ));

    store.claim(&base.id, "backend-engineer").unwrap();
    store
        .update(&base.id, TaskPatch::completed("base built"))
        .unwrap();

    let claimed = store.claim(&dependent.id, "backend-engineer").unwrap();
    assert_eq!(claimed.status, TaskStatus::InProgress);
    assert_eq!(claimed.owner.as_deref(), Some("backend-engineer"));
}

#[test]
fn test_completion_without_summary_is_rejected() {
    let (_dir, store) = store();
    let task = store.create("Fix bug", "the login bug", deps(&[])).unwrap();
    store.claim(&task.id, "fixer").unwrap();

    assert!(matches!(
        store.update(&task.id, TaskPatch::status(TaskStatus::Completed)),
        Err(TaskError::MissingSummary(_))
    ));

    let done = store
        .update(&task.id, TaskPatch::completed("patched the session check"))
        .unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.metadata.summary.as_deref(), Some("patched the session check"));
}

#[test]
fn test_cycles_are_rejected() {
    let (_dir, store) = store();
    let a = store.create("A", "", deps(&[])).unwrap();
    let b = store.create("B", "", deps(&[a.id.as_str()])).unwrap();

    // Making A depend on B would close the loop.
    let patch = TaskPatch {
        dependencies: Some(deps(&[b.id.as_str()])),
        ..TaskPatch::default()
    };
    assert!(matches!(store.update(&a.id, patch), Err(TaskError::Cycle(_))));

    // The failed update must not have been persisted.
    assert!(store.get(&a.id).unwrap().dependencies.is_empty());
}

#[test]
fn test_next_available_tasks_orders_and_filters() {
    let (_dir, store) = store();
    let a = store.create("A", "", deps(&[])).unwrap();
    let _b = store.create("B", "", deps(&[a.id.as_str()])).unwrap();
    let _c = store.create("C", "", deps(&[])).unwrap();

    let available = store.next_available_tasks().unwrap();
    let ids: Vec<&str> = available.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec!["1", "3"]);

    store.claim(&a.id, "w").unwrap();
    store.update(&a.id, TaskPatch::completed("done")).unwrap();

    let available = store.next_available_tasks().unwrap();
    let ids: Vec<&str> = available.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec!["2", "3"]);
}
