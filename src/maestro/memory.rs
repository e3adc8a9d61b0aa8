//! Persistent, bounded cross-session memory.
//!
//! Memory is partitioned per category (gotchas, patterns, codebase
//! discoveries, and numbered session records) so every agent can load a
//! cheap, truncated view at context-assembly time instead of dragging a
//! monolithic learnings file around. Legacy markdown archives
//! (`learnings.md`, `decisions.md`, `issues.md`, `active_context.md`) are
//! read-only.
//!
//! All writes go through the path resolver's atomic JSON writer; duplicate
//! gotchas/patterns are suppressed by case-insensitive text comparison, and
//! session files are pruned to the newest [`SESSION_CAP`].

use crate::maestro::paths::{AccessMode, PathResult, Resolver};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;

/// Maximum number of session files retained after pruning.
pub const SESSION_CAP: usize = 50;

/// Read-time truncation caps: (max items, max total chars) per category.
const GOTCHA_CAPS: (usize, usize) = (20, 2000);
const PATTERN_CAPS: (usize, usize) = (20, 2000);
const DISCOVERY_CAPS: (usize, usize) = (30, 3000);
const SESSION_CAPS: (usize, usize) = (5, 5000);
const LEGACY_CHAR_CAP: usize = 3000;

/// A deduplicated memory line with its insertion time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// One discovered file in the codebase map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryEntry {
    pub description: String,
    pub category: String,
    pub discovered_at: DateTime<Utc>,
}

/// Input for [`MemoryStore::save_session`]. The sequence number and
/// timestamp are assigned by the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionDraft {
    pub summary: String,
    #[serde(default)]
    pub tasks_completed: Vec<String>,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub discoveries: Vec<(String, String, String)>,
    #[serde(default)]
    pub patterns_found: Vec<String>,
    #[serde(default)]
    pub gotchas_encountered: Vec<String>,
    #[serde(default)]
    pub decisions_made: Vec<String>,
    #[serde(default)]
    pub next_steps: Vec<String>,
    /// Open extension map persisted verbatim alongside the known fields.
    #[serde(default)]
    pub custom: BTreeMap<String, Value>,
}

/// The truncated view handed to agents at context-assembly time.
///
/// Its serialized size is bounded by the sum of the per-category caps.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MemoryContext {
    pub gotchas: Vec<String>,
    pub patterns: Vec<String>,
    pub discoveries: Vec<String>,
    pub recent_sessions: Vec<String>,
    pub legacy_learnings: String,
}

/// Counts and byte sizes per category.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MemoryStats {
    pub gotcha_count: usize,
    pub pattern_count: usize,
    pub discovery_count: usize,
    pub session_count: usize,
    pub total_bytes: u64,
}

/// Session-partitioned persistent memory.
pub struct MemoryStore {
    resolver: Arc<Resolver>,
}

impl MemoryStore {
    pub fn new(resolver: Arc<Resolver>) -> Self {
        Self { resolver }
    }

    /// Record a gotcha. Duplicate text (case-insensitive) is suppressed.
    pub fn record_gotcha(&self, text: &str) -> PathResult<bool> {
        self.record_entry("memory/gotchas.json", text)
    }

    /// Record a reusable pattern. Duplicate text is suppressed.
    pub fn record_pattern(&self, text: &str) -> PathResult<bool> {
        self.record_entry("memory/patterns.json", text)
    }

    fn record_entry(&self, subpath: &str, text: &str) -> PathResult<bool> {
        let path = self.resolver.resolve_runtime(subpath, AccessMode::Write)?;
        let mut entries: Vec<MemoryEntry> = self
            .resolver
            .safe_read_json(&path, "entry-list")?
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        let lowered = text.to_lowercase();
        if entries.iter().any(|e| e.text.to_lowercase() == lowered) {
            return Ok(false);
        }
        entries.push(MemoryEntry {
            text: text.to_string(),
            timestamp: Utc::now(),
        });
        self.resolver
            .atomic_write_json(&path, &serde_json::to_value(&entries).unwrap_or(Value::Null))?;
        Ok(true)
    }

    /// Record a discovered file in the codebase map. Re-recording a path
    /// replaces its description.
    pub fn record_discovery(
        &self,
        file_path: &str,
        description: &str,
        category: &str,
    ) -> PathResult<()> {
        let path = self
            .resolver
            .resolve_runtime("memory/codebase_map.json", AccessMode::Write)?;
        let mut map: BTreeMap<String, DiscoveryEntry> = self
            .resolver
            .safe_read_json(&path, "codebase-map")?
            .and_then(|v| {
                v.get("discovered_files")
                    .cloned()
                    .and_then(|files| serde_json::from_value(files).ok())
            })
            .unwrap_or_default();
        map.insert(
            file_path.to_string(),
            DiscoveryEntry {
                description: description.to_string(),
                category: category.to_string(),
                discovered_at: Utc::now(),
            },
        );
        let doc = json!({
            "discovered_files": serde_json::to_value(&map).unwrap_or(Value::Null),
            "last_updated": Utc::now(),
        });
        self.resolver.atomic_write_json(&path, &doc)
    }

    /// Persist a session record with an auto-assigned sequence number,
    /// extract its patterns/gotchas/discoveries into their own files, and
    /// prune sessions beyond [`SESSION_CAP`]. Returns the sequence number.
    pub fn save_session(&self, draft: &SessionDraft) -> PathResult<u64> {
        let sequence = self.next_session_number()?;
        let filename = format!("memory/sessions/session_{:03}.json", sequence);
        let path = self.resolver.resolve_runtime(&filename, AccessMode::Write)?;

        let mut doc = serde_json::to_value(draft).unwrap_or_else(|_| json!({}));
        if let Value::Object(map) = &mut doc {
            map.insert("sequence_number".to_string(), json!(sequence));
            map.insert("timestamp".to_string(), json!(Utc::now()));
            // Flatten the extension map into the record itself.
            if let Some(Value::Object(custom)) = map.remove("custom") {
                for (key, value) in custom {
                    map.entry(key).or_insert(value);
                }
            }
        }
        self.resolver.atomic_write_json(&path, &doc)?;

        for pattern in &draft.patterns_found {
            self.record_pattern(pattern)?;
        }
        for gotcha in &draft.gotchas_encountered {
            self.record_gotcha(gotcha)?;
        }
        for (file_path, description, category) in &draft.discoveries {
            self.record_discovery(file_path, description, category)?;
        }

        self.prune_sessions()?;
        Ok(sequence)
    }

    fn next_session_number(&self) -> PathResult<u64> {
        Ok(self.session_files()?.last().map(|(n, _)| n + 1).unwrap_or(1))
    }

    /// Session files as `(sequence, path)`, sorted ascending.
    fn session_files(&self) -> PathResult<Vec<(u64, std::path::PathBuf)>> {
        let dir = self
            .resolver
            .resolve_runtime("memory/sessions", AccessMode::Read)?;
        let mut files = Vec::new();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(files),
            Err(err) => return Err(err.into()),
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(number) = name
                .strip_prefix("session_")
                .and_then(|rest| rest.strip_suffix(".json"))
                .and_then(|digits| digits.parse::<u64>().ok())
            {
                files.push((number, entry.path()));
            }
        }
        files.sort_by_key(|(n, _)| *n);
        Ok(files)
    }

    fn prune_sessions(&self) -> PathResult<()> {
        let files = self.session_files()?;
        if files.len() <= SESSION_CAP {
            return Ok(());
        }
        let excess = files.len() - SESSION_CAP;
        for (_, path) in files.into_iter().take(excess) {
            log::debug!("pruning old session file {}", path.display());
            let _ = fs::remove_file(path);
        }
        Ok(())
    }

    /// Build the truncated context view. Missing or corrupt files degrade
    /// to empty categories rather than failing the caller.
    pub fn load_memory_for_context(&self) -> MemoryContext {
        let mut context = MemoryContext::default();

        context.gotchas = self.load_capped_entries("memory/gotchas.json", GOTCHA_CAPS);
        context.patterns = self.load_capped_entries("memory/patterns.json", PATTERN_CAPS);
        context.discoveries = self.load_capped_discoveries(DISCOVERY_CAPS);
        context.recent_sessions = self.load_capped_sessions(SESSION_CAPS);
        context.legacy_learnings = self.load_legacy_learnings();

        context
    }

    fn load_capped_entries(&self, subpath: &str, (max_items, max_chars): (usize, usize)) -> Vec<String> {
        let Ok(path) = self.resolver.resolve_runtime(subpath, AccessMode::Read) else {
            return Vec::new();
        };
        let entries: Vec<MemoryEntry> = self
            .resolver
            .safe_read_json(&path, "entry-list")
            .ok()
            .flatten()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        cap_newest_first(
            entries.into_iter().rev().map(|e| e.text),
            max_items,
            max_chars,
        )
    }

    fn load_capped_discoveries(&self, (max_items, max_chars): (usize, usize)) -> Vec<String> {
        let Ok(path) = self
            .resolver
            .resolve_runtime("memory/codebase_map.json", AccessMode::Read)
        else {
            return Vec::new();
        };
        let map: BTreeMap<String, DiscoveryEntry> = self
            .resolver
            .safe_read_json(&path, "codebase-map")
            .ok()
            .flatten()
            .and_then(|v| v.get("discovered_files").cloned())
            .and_then(|files| serde_json::from_value(files).ok())
            .unwrap_or_default();
        let mut entries: Vec<(DateTime<Utc>, String)> = map
            .into_iter()
            .map(|(path, d)| {
                (
                    d.discovered_at,
                    format!("{} [{}]: {}", path, d.category, d.description),
                )
            })
            .collect();
        entries.sort_by_key(|(at, _)| std::cmp::Reverse(*at));
        cap_newest_first(entries.into_iter().map(|(_, line)| line), max_items, max_chars)
    }

    fn load_capped_sessions(&self, (max_items, max_chars): (usize, usize)) -> Vec<String> {
        let files = match self.session_files() {
            Ok(files) => files,
            Err(_) => return Vec::new(),
        };
        let summaries = files.into_iter().rev().filter_map(|(number, path)| {
            let raw = fs::read_to_string(path).ok()?;
            let value: Value = serde_json::from_str(&raw).ok()?;
            let summary = value.get("summary")?.as_str()?;
            Some(format!("session {:03}: {}", number, summary))
        });
        cap_newest_first(summaries, max_items, max_chars)
    }

    fn load_legacy_learnings(&self) -> String {
        let Ok(path) = self
            .resolver
            .resolve_runtime("memory/learnings.md", AccessMode::Read)
        else {
            return String::new();
        };
        let mut content = fs::read_to_string(path).unwrap_or_default();
        if content.len() > LEGACY_CHAR_CAP {
            content.truncate(truncation_boundary(&content, LEGACY_CHAR_CAP));
        }
        content
    }

    /// Counts and byte sizes per category.
    pub fn stats(&self) -> MemoryStats {
        let mut stats = MemoryStats::default();
        stats.gotcha_count = self.count_entries("memory/gotchas.json", &mut stats.total_bytes);
        stats.pattern_count = self.count_entries("memory/patterns.json", &mut stats.total_bytes);
        if let Ok(path) = self
            .resolver
            .resolve_runtime("memory/codebase_map.json", AccessMode::Read)
        {
            if let Ok(meta) = fs::metadata(&path) {
                stats.total_bytes += meta.len();
            }
            stats.discovery_count = self
                .resolver
                .safe_read_json(&path, "codebase-map")
                .ok()
                .flatten()
                .and_then(|v| v.get("discovered_files").cloned())
                .and_then(|files| files.as_object().map(|m| m.len()))
                .unwrap_or(0);
        }
        if let Ok(files) = self.session_files() {
            stats.session_count = files.len();
            for (_, path) in files {
                if let Ok(meta) = fs::metadata(path) {
                    stats.total_bytes += meta.len();
                }
            }
        }
        stats
    }

    fn count_entries(&self, subpath: &str, total_bytes: &mut u64) -> usize {
        let Ok(path) = self.resolver.resolve_runtime(subpath, AccessMode::Read) else {
            return 0;
        };
        if let Ok(meta) = fs::metadata(&path) {
            *total_bytes += meta.len();
        }
        let entries: Vec<MemoryEntry> = self
            .resolver
            .safe_read_json(&path, "entry-list")
            .ok()
            .flatten()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        entries.len()
    }
}

/// Recording hook for `SessionEnd`: persists a session record from the
/// envelope context. Fails open: memory bookkeeping must never block a
/// session from ending.
pub struct SessionEndHook {
    store: MemoryStore,
}

impl SessionEndHook {
    pub fn new(resolver: Arc<Resolver>) -> Self {
        Self {
            store: MemoryStore::new(resolver),
        }
    }
}

#[async_trait::async_trait]
impl crate::maestro::hooks::Hook for SessionEndHook {
    fn name(&self) -> &str {
        "session-memory"
    }

    async fn run(
        &self,
        envelope: &crate::maestro::hooks::HookEnvelope,
    ) -> crate::maestro::hooks::HookResult<crate::maestro::hooks::HookDecision> {
        let draft: SessionDraft = envelope
            .context
            .get("session")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .ok_or("session-end hook invoked without a session draft")?;
        let sequence = self.store.save_session(&draft)?;
        log::info!("session summary persisted as session {:03}", sequence);
        Ok(crate::maestro::hooks::HookDecision::allow())
    }
}

/// Keep the newest items (input must already be newest-first) until either
/// the item cap or the character budget is exhausted, then restore
/// chronological order.
fn cap_newest_first(
    items: impl Iterator<Item = String>,
    max_items: usize,
    max_chars: usize,
) -> Vec<String> {
    let mut kept = Vec::new();
    let mut chars = 0usize;
    for item in items.take(max_items) {
        if chars + item.len() > max_chars {
            break;
        }
        chars += item.len();
        kept.push(item);
    }
    kept.reverse();
    kept
}

/// Largest char boundary not exceeding `cap`.
fn truncation_boundary(text: &str, cap: usize) -> usize {
    let mut boundary = cap.min(text.len());
    while boundary > 0 && !text.is_char_boundary(boundary) {
        boundary -= 1;
    }
    boundary
}
