//! Canonical path resolution and safe state I/O.
//!
//! Every state or artifact path in the runtime is resolved through
//! [`Resolver`]; no other module constructs state paths directly (a repo
//! scan in the test suite enforces this). The resolver maintains a two-tier
//! layout: `config/` is version-controlled, `runtime/` is ephemeral. Reads
//! prefer the canonical location and fall back to a legacy tree so older
//! deployments keep working; writes always target the canonical location.
//!
//! On top of resolution it provides the I/O discipline the rest of the crate
//! relies on:
//!
//! - [`safe_read_json`](Resolver::safe_read_json): prototype-pollution key
//!   rejection plus validation against a registered schema set.
//! - [`atomic_write_json`](Resolver::atomic_write_json): tmp + rename under a
//!   cooperative lock file with a 5 s stale threshold. No partial file is
//!   ever visible to readers.
//! - [`cached_read`](Resolver::cached_read): a TTL cache keyed by path and
//!   mtime, invalidated on write.
//!
//! # Layout
//!
//! ```text
//! <project root>/
//!   config/{rule-index,signoff-matrix,cuj-registry,...}.json
//!   runtime/
//!     runs/<run_id>/{state.json, plans/, artifacts/, gates/, reasoning/}
//!     tasks/index.json
//!     memory/{gotchas,patterns,codebase_map}.json, sessions/
//!     logs/audit.jsonl
//!     sessions/<router_session_id>.json
//!   artifacts/{generated,reference}/
//! ```

use serde_json::Value;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

/// Stale threshold for cooperative lock files.
const LOCK_TTL: Duration = Duration::from_secs(5);

/// Poll interval while waiting on a held lock.
const LOCK_POLL: Duration = Duration::from_millis(25);

/// Default TTL for [`Resolver::cached_read`].
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_millis(1000);

/// Keys rejected by [`Resolver::safe_read_json`] at any nesting depth.
const FORBIDDEN_KEYS: [&str; 3] = ["__proto__", "constructor", "prototype"];

/// Marker files that identify a project root, in priority order.
const PROJECT_MARKERS: [&str; 2] = [".maestro-project", ".git"];

pub type PathResult<T> = Result<T, PathError>;

/// Failure modes of the resolver.
#[derive(Debug)]
pub enum PathError {
    Io(std::io::Error),
    /// JSON could not be parsed.
    Malformed(PathBuf, String),
    /// A forbidden (prototype-pollution) key was present.
    ForbiddenKey(PathBuf, String),
    /// The document did not satisfy its registered schema.
    Schema(PathBuf, String),
    /// No schema is registered under the given name.
    UnknownSchema(String),
    /// The config name is not in the known set.
    UnknownConfig(String),
    /// The lock could not be acquired within the stale TTL.
    LockContended(PathBuf),
    /// Path escapes the project root or contains traversal sequences.
    Unsafe(String),
    /// No project marker was found walking upward.
    NoProjectRoot,
}

impl fmt::Display for PathError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathError::Io(err) => write!(f, "IO error: {}", err),
            PathError::Malformed(p, msg) => write!(f, "Malformed JSON in {}: {}", p.display(), msg),
            PathError::ForbiddenKey(p, key) => {
                write!(f, "Forbidden key '{}' in {}", key, p.display())
            }
            PathError::Schema(p, msg) => {
                write!(f, "Schema violation in {}: {}", p.display(), msg)
            }
            PathError::UnknownSchema(name) => write!(f, "Unknown schema: {}", name),
            PathError::UnknownConfig(name) => write!(f, "Unknown config file: {}", name),
            PathError::LockContended(p) => {
                write!(f, "Lock contended beyond stale TTL: {}", p.display())
            }
            PathError::Unsafe(msg) => write!(f, "Unsafe path: {}", msg),
            PathError::NoProjectRoot => write!(f, "No project root marker found"),
        }
    }
}

impl Error for PathError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PathError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PathError {
    fn from(err: std::io::Error) -> Self {
        PathError::Io(err)
    }
}

/// Whether a resolution is for reading or writing. Reads get legacy
/// fallback; writes always land on the canonical path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}

/// Typed identity of a produced or consumed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    /// Runtime output, lives under `artifacts/generated/`.
    Generated,
    /// Version-controlled input, lives under `artifacts/reference/`.
    Reference,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Generated => "generated",
            ArtifactKind::Reference => "reference",
        }
    }
}

/// Merge policy for [`Resolver::migrate_if_needed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationPolicy {
    /// Keep whichever file has the newer mtime.
    PreferNewer,
    /// Array files: append legacy entries missing from the canonical file.
    Append,
    /// Legacy content replaces the canonical file unconditionally.
    Overwrite,
}

struct CacheEntry {
    value: Value,
    mtime: Option<SystemTime>,
    inserted: Instant,
    ttl: Duration,
}

/// The single canonical resolver for all state paths.
pub struct Resolver {
    project_root: PathBuf,
    config_dir: PathBuf,
    legacy_config_dir: PathBuf,
    runtime_dir: PathBuf,
    legacy_runtime_dir: PathBuf,
    artifacts_dir: PathBuf,
    cache: Mutex<HashMap<PathBuf, CacheEntry>>,
}

/// Config files the resolver knows how to place.
const KNOWN_CONFIGS: [&str; 6] = [
    "rule-index",
    "signoff-matrix",
    "cuj-registry",
    "skill-integration-matrix",
    "security-triggers",
    "team-roster",
];

impl Resolver {
    /// Build a resolver rooted at an explicit project directory.
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        let project_root = project_root.into();
        Self {
            config_dir: project_root.join("config"),
            legacy_config_dir: project_root.join(".maestro").join("config"),
            runtime_dir: project_root.join("runtime"),
            legacy_runtime_dir: project_root.join(".maestro"),
            artifacts_dir: project_root.join("artifacts"),
            project_root,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Build a resolver by discovering the project root from the current
    /// directory (see [`find_project_root`]).
    pub fn discover() -> PathResult<Self> {
        let cwd = std::env::current_dir()?;
        Ok(Self::new(find_project_root(&cwd)?))
    }

    /// The project root this resolver is anchored to.
    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Resolve a known config file.
    ///
    /// Reads prefer `config/<name>.json`; if only the legacy location exists
    /// it is returned instead, and if both exist the canonical one wins and
    /// the duplication is logged. Writes always resolve canonical.
    pub fn resolve_config(&self, name: &str, mode: AccessMode) -> PathResult<PathBuf> {
        if !KNOWN_CONFIGS.contains(&name) {
            return Err(PathError::UnknownConfig(name.to_string()));
        }
        let filename = format!("{}.json", name);
        let canonical = self.config_dir.join(&filename);
        if mode == AccessMode::Write {
            return Ok(canonical);
        }
        let legacy = self.legacy_config_dir.join(&filename);
        Ok(self.prefer_canonical(canonical, legacy))
    }

    /// Resolve a runtime-state subpath (`runs/<id>/state.json`,
    /// `tasks/index.json`, `logs/audit.jsonl`, ...). The subpath is validated
    /// against traversal before joining.
    pub fn resolve_runtime(&self, subpath: &str, mode: AccessMode) -> PathResult<PathBuf> {
        validate_relative(subpath)?;
        let canonical = self.runtime_dir.join(subpath);
        if mode == AccessMode::Write {
            return Ok(canonical);
        }
        let legacy = self.legacy_runtime_dir.join(subpath);
        Ok(self.prefer_canonical(canonical, legacy))
    }

    /// Resolve an artifact path by kind. Generated artifacts are ephemeral
    /// and land under `runtime/artifacts/generated/`; reference artifacts
    /// live in the version-controlled `artifacts/reference/` tree.
    pub fn resolve_artifact(&self, kind: ArtifactKind, filename: &str) -> PathResult<PathBuf> {
        validate_relative(filename)?;
        let base = match kind {
            ArtifactKind::Generated => self.runtime_dir.join("artifacts").join(kind.as_str()),
            ArtifactKind::Reference => self.artifacts_dir.join(kind.as_str()),
        };
        Ok(base.join(filename))
    }

    fn prefer_canonical(&self, canonical: PathBuf, legacy: PathBuf) -> PathBuf {
        let canonical_exists = canonical.exists();
        if canonical_exists && legacy.exists() {
            log::debug!(
                "both canonical and legacy state present, preferring {}",
                canonical.display()
            );
        }
        if !canonical_exists && legacy.exists() {
            return legacy;
        }
        canonical
    }

    /// Read and validate a JSON document.
    ///
    /// Returns `Ok(None)` when the file does not exist. Rejects documents
    /// containing prototype-pollution keys at any depth, then validates the
    /// shape against the schema registered under `schema`.
    pub fn safe_read_json(&self, path: &Path, schema: &str) -> PathResult<Option<Value>> {
        let requirements = schema_requirements(schema)
            .ok_or_else(|| PathError::UnknownSchema(schema.to_string()))?;
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let value: Value = serde_json::from_str(&raw)
            .map_err(|e| PathError::Malformed(path.to_path_buf(), e.to_string()))?;
        if let Some(key) = find_forbidden_key(&value) {
            return Err(PathError::ForbiddenKey(path.to_path_buf(), key));
        }
        requirements
            .check(&value)
            .map_err(|msg| PathError::Schema(path.to_path_buf(), msg))?;
        Ok(Some(value))
    }

    /// Atomically persist a JSON document.
    ///
    /// Acquires the sibling `<path>.lock` (stealing locks older than the 5 s
    /// stale TTL), writes `<path>.tmp`, fsyncs, renames over the target, and
    /// releases the lock whether or not the write succeeded. The cache entry
    /// for the path is invalidated.
    pub fn atomic_write_json(&self, path: &Path, value: &Value) -> PathResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let lock = self.acquire_lock(path)?;
        let result = write_tmp_and_rename(path, value);
        lock.release();
        if result.is_ok() {
            if let Ok(mut cache) = self.cache.lock() {
                cache.remove(path);
            }
        }
        result
    }

    /// Read through the TTL cache.
    ///
    /// The entry is reused while it is younger than `ttl` **and** the file
    /// mtime is unchanged; otherwise the file is re-read (missing or
    /// malformed files yield `default`).
    pub fn cached_read(&self, path: &Path, default: Value, ttl: Duration) -> Value {
        let mtime = fs::metadata(path).and_then(|m| m.modified()).ok();
        if let Ok(cache) = self.cache.lock() {
            if let Some(entry) = cache.get(path) {
                if entry.inserted.elapsed() < entry.ttl && entry.mtime == mtime {
                    return entry.value.clone();
                }
            }
        }
        let value = fs::read_to_string(path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or(default);
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(
                path.to_path_buf(),
                CacheEntry {
                    value: value.clone(),
                    mtime,
                    inserted: Instant::now(),
                    ttl,
                },
            );
        }
        value
    }

    /// Migrate a legacy state file to its canonical location. Idempotent:
    /// once the legacy file is gone the call is a no-op.
    pub fn migrate_if_needed(
        &self,
        legacy: &Path,
        canonical: &Path,
        policy: MigrationPolicy,
    ) -> PathResult<()> {
        if !legacy.exists() {
            return Ok(());
        }
        if !canonical.exists() {
            if let Some(parent) = canonical.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::rename(legacy, canonical)?;
            log::info!("migrated {} -> {}", legacy.display(), canonical.display());
            return Ok(());
        }
        match policy {
            MigrationPolicy::Overwrite => {
                fs::rename(legacy, canonical)?;
            }
            MigrationPolicy::PreferNewer => {
                let legacy_mtime = fs::metadata(legacy)?.modified()?;
                let canonical_mtime = fs::metadata(canonical)?.modified()?;
                if legacy_mtime > canonical_mtime {
                    fs::rename(legacy, canonical)?;
                } else {
                    fs::remove_file(legacy)?;
                }
            }
            MigrationPolicy::Append => {
                let mut merged: Vec<Value> = read_array(canonical)?;
                let legacy_entries: Vec<Value> = read_array(legacy)?;
                for entry in legacy_entries {
                    if !merged.contains(&entry) {
                        merged.push(entry);
                    }
                }
                self.atomic_write_json(canonical, &Value::Array(merged))?;
                fs::remove_file(legacy)?;
            }
        }
        Ok(())
    }

    /// Validate that `candidate` stays inside the project root.
    ///
    /// Rejects absolute paths, `..` components, URL-encoded traversal, and
    /// null bytes, then returns the normalized absolute path.
    pub fn validate_path_within_project(&self, candidate: &str) -> PathResult<PathBuf> {
        validate_relative(candidate)?;
        let joined = self.project_root.join(candidate);
        let normalized = normalize(&joined);
        if !normalized.starts_with(&self.project_root) {
            return Err(PathError::Unsafe(format!(
                "{} escapes the project root",
                candidate
            )));
        }
        Ok(normalized)
    }

    fn acquire_lock(&self, path: &Path) -> PathResult<LockGuard> {
        let lock_path = lock_path_for(path);
        let start = Instant::now();
        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(mut file) => {
                    let _ = writeln!(file, "{}", std::process::id());
                    return Ok(LockGuard { path: lock_path });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    let stale = fs::metadata(&lock_path)
                        .and_then(|m| m.modified())
                        .ok()
                        .and_then(|mtime| mtime.elapsed().ok())
                        .map(|age| age > LOCK_TTL)
                        .unwrap_or(true);
                    if stale {
                        log::warn!("stealing stale lock {}", lock_path.display());
                        let _ = fs::remove_file(&lock_path);
                        continue;
                    }
                    if start.elapsed() > LOCK_TTL {
                        return Err(PathError::LockContended(lock_path));
                    }
                    std::thread::sleep(LOCK_POLL);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    fn release(self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}

fn write_tmp_and_rename(path: &Path, value: &Value) -> PathResult<()> {
    let mut tmp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);
    {
        let mut file = fs::File::create(&tmp)?;
        let body = serde_json::to_string_pretty(value)
            .map_err(|e| PathError::Malformed(path.to_path_buf(), e.to_string()))?;
        file.write_all(body.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_array(path: &Path) -> PathResult<Vec<Value>> {
    let raw = fs::read_to_string(path)?;
    let value: Value = serde_json::from_str(&raw)
        .map_err(|e| PathError::Malformed(path.to_path_buf(), e.to_string()))?;
    match value {
        Value::Array(entries) => Ok(entries),
        _ => Err(PathError::Schema(
            path.to_path_buf(),
            "expected a JSON array".to_string(),
        )),
    }
}

/// Walk upward from `start` looking for a project marker file.
pub fn find_project_root(start: &Path) -> PathResult<PathBuf> {
    let mut current = start;
    loop {
        for marker in PROJECT_MARKERS {
            if current.join(marker).exists() {
                return Ok(current.to_path_buf());
            }
        }
        match current.parent() {
            Some(parent) => current = parent,
            None => return Err(PathError::NoProjectRoot),
        }
    }
}

/// Reject traversal in a relative path fragment before it is joined
/// anywhere. Decodes URL-encoded sequences first so `%2e%2e%2f` cannot
/// smuggle a `..` through.
fn validate_relative(fragment: &str) -> PathResult<()> {
    if fragment.is_empty() {
        return Err(PathError::Unsafe("empty path".to_string()));
    }
    if fragment.contains('\0') {
        return Err(PathError::Unsafe("null byte in path".to_string()));
    }
    let decoded = urlencoding::decode(fragment)
        .map(|d| d.into_owned())
        .unwrap_or_else(|_| fragment.to_string());
    for candidate in [fragment, decoded.as_str()] {
        let path = Path::new(candidate);
        if path.is_absolute() || candidate.starts_with('/') || candidate.contains(":\\") {
            return Err(PathError::Unsafe(format!("absolute path: {}", candidate)));
        }
        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(PathError::Unsafe(format!("traversal in: {}", candidate)));
        }
    }
    Ok(())
}

/// Normalize a path lexically (resolve `.` and `..` without touching the
/// filesystem).
fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            other => normalized.push(other),
        }
    }
    normalized
}

fn find_forbidden_key(value: &Value) -> Option<String> {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if FORBIDDEN_KEYS.contains(&key.as_str()) {
                    return Some(key.clone());
                }
                if let Some(found) = find_forbidden_key(child) {
                    return Some(found);
                }
            }
            None
        }
        Value::Array(entries) => entries.iter().find_map(find_forbidden_key),
        _ => None,
    }
}

/// Top-level shape a schema expects.
enum SchemaShape {
    Object,
    Array,
    Any,
}

/// Structural requirements for one registered schema.
pub struct SchemaSpec {
    required_keys: &'static [&'static str],
    shape: SchemaShape,
}

impl SchemaSpec {
    fn check(&self, value: &Value) -> Result<(), String> {
        match self.shape {
            SchemaShape::Any => return Ok(()),
            SchemaShape::Array => {
                return match value {
                    Value::Array(_) => Ok(()),
                    _ => Err("expected a JSON array".to_string()),
                };
            }
            SchemaShape::Object => {}
        }
        let map = match value {
            Value::Object(map) => map,
            _ => return Err("expected a JSON object".to_string()),
        };
        for key in self.required_keys {
            if !map.contains_key(*key) {
                return Err(format!("missing required key '{}'", key));
            }
        }
        Ok(())
    }
}

/// Look up the schema registered under `name`.
pub fn schema_requirements(name: &str) -> Option<SchemaSpec> {
    let (required_keys, shape): (&'static [&'static str], SchemaShape) = match name {
        "router-state" => (&["session_id", "agent_role", "costs"], SchemaShape::Object),
        "loop-state" => (&["iteration"], SchemaShape::Object),
        "evolution-state" => (&["generation"], SchemaShape::Object),
        "plan" => (&["phases"], SchemaShape::Object),
        "plan-rating" => (&["rating"], SchemaShape::Object),
        "run-state" => (&["id", "status", "current_step"], SchemaShape::Object),
        "tasks-index" => (&["tasks"], SchemaShape::Object),
        "artifact-registry" => (&["artifacts"], SchemaShape::Object),
        "gate-record" => (&["gate", "passed"], SchemaShape::Object),
        "worker-session" => (&["id", "status"], SchemaShape::Object),
        "codebase-map" => (&["discovered_files"], SchemaShape::Object),
        "session-record" => (&["sequence_number", "summary"], SchemaShape::Object),
        "entry-list" => (&[], SchemaShape::Array),
        "free" => (&[], SchemaShape::Any),
        _ => return None,
    };
    Some(SchemaSpec {
        required_keys,
        shape,
    })
}
