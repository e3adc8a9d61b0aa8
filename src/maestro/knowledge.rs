//! Knowledge Index
//!
//! An O(ms) lookup over skills, agents, and workflows, stored as a single
//! 11-column CSV at a canonical artifact path. The index is rebuilt
//! atomically (tmp + rename) and read through an in-memory cache that is
//! invalidated whenever the file's mtime changes, so readers never take a
//! lock.
//!
//! Two safety rules are applied on every row:
//!
//! - Formula-injection escaping: any cell whose first character is `=`,
//!   `+`, `-`, or `@` is serialized with a leading `'`.
//! - Path allowlisting: a row whose `path` contains traversal sequences
//!   (`../`, URL-encoded variants, `${...}`, null bytes) or an absolute
//!   prefix is rejected; accepted paths must start with an allowlisted
//!   artifact directory.
//!
//! Malformed lines are skipped and logged; the index always returns what
//! it can parse.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

/// CSV header, fixed order.
pub const CSV_HEADER: [&str; 11] = [
    "name",
    "path",
    "description",
    "domain",
    "complexity",
    "use_cases",
    "tools",
    "deprecated",
    "alias",
    "usage_count",
    "last_used",
];

/// What kind of knowledge artifact a row describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Skill,
    Agent,
    Workflow,
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Skill => "skill",
            Domain::Agent => "agent",
            Domain::Workflow => "workflow",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "skill" => Some(Domain::Skill),
            "agent" => Some(Domain::Agent),
            "workflow" => Some(Domain::Workflow),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Complexity {
    Low,
    Medium,
    High,
    Epic,
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Complexity::Low => "LOW",
            Complexity::Medium => "MEDIUM",
            Complexity::High => "HIGH",
            Complexity::Epic => "EPIC",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "LOW" => Some(Complexity::Low),
            "MEDIUM" => Some(Complexity::Medium),
            "HIGH" => Some(Complexity::High),
            "EPIC" => Some(Complexity::Epic),
            _ => None,
        }
    }
}

/// One row of the index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexRow {
    pub name: String,
    pub path: String,
    pub description: String,
    pub domain: Domain,
    pub complexity: Complexity,
    /// Comma-free semicolon-separated tag list inside one cell.
    pub use_cases: Vec<String>,
    pub tools: Vec<String>,
    pub deprecated: bool,
    pub alias: String,
    pub usage_count: u64,
    pub last_used: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexStats {
    pub total: usize,
    pub skills: usize,
    pub agents: usize,
    pub workflows: usize,
    pub deprecated: usize,
}

#[derive(Debug)]
pub enum IndexError {
    Io(std::io::Error),
    Csv(String),
    /// The row's path failed the traversal/allowlist check.
    UnsafePath(String),
}

impl fmt::Display for IndexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexError::Io(err) => write!(f, "IO error: {}", err),
            IndexError::Csv(msg) => write!(f, "CSV error: {}", msg),
            IndexError::UnsafePath(path) => write!(f, "Unsafe index path: {}", path),
        }
    }
}

impl std::error::Error for IndexError {}

impl From<std::io::Error> for IndexError {
    fn from(err: std::io::Error) -> Self {
        IndexError::Io(err)
    }
}

pub type IndexResult<T> = Result<T, IndexError>;

/// The CSV-backed index with mtime-invalidated caching.
pub struct KnowledgeIndex {
    csv_path: PathBuf,
    allowed_prefixes: Vec<String>,
    cache: Mutex<Option<(SystemTime, Vec<IndexRow>)>>,
}

impl KnowledgeIndex {
    /// Open an index at an already-resolved CSV path (callers obtain it via
    /// the path resolver's artifact resolution).
    pub fn open(csv_path: impl Into<PathBuf>) -> Self {
        Self {
            csv_path: csv_path.into(),
            allowed_prefixes: vec![
                "skills/".to_string(),
                "agents/".to_string(),
                "workflows/".to_string(),
                "artifacts/".to_string(),
            ],
            cache: Mutex::new(None),
        }
    }

    pub fn with_allowed_prefixes(mut self, prefixes: Vec<String>) -> Self {
        self.allowed_prefixes = prefixes;
        self
    }

    /// Atomically rebuild the CSV from a full row set. Rows with unsafe
    /// paths are rejected up front.
    pub fn rebuild(&self, rows: &[IndexRow]) -> IndexResult<()> {
        for row in rows {
            self.check_row_path(&row.path)?;
        }
        let mut tmp_name = self
            .csv_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        tmp_name.push(".tmp");
        let tmp = self.csv_path.with_file_name(tmp_name);
        if let Some(parent) = tmp.parent() {
            fs::create_dir_all(parent)?;
        }
        {
            let mut writer = csv::Writer::from_path(&tmp)
                .map_err(|e| IndexError::Csv(e.to_string()))?;
            writer
                .write_record(CSV_HEADER)
                .map_err(|e| IndexError::Csv(e.to_string()))?;
            for row in rows {
                writer
                    .write_record(&serialize_row(row))
                    .map_err(|e| IndexError::Csv(e.to_string()))?;
            }
            writer.flush()?;
        }
        fs::rename(&tmp, &self.csv_path)?;
        if let Ok(mut cache) = self.cache.lock() {
            *cache = None;
        }
        Ok(())
    }

    /// Load all rows, via the mtime cache. Missing file yields an empty
    /// index; malformed lines are skipped and logged.
    pub fn load(&self) -> Vec<IndexRow> {
        let mtime = fs::metadata(&self.csv_path)
            .and_then(|m| m.modified())
            .ok();
        if let (Some(mtime), Ok(cache)) = (mtime, self.cache.lock()) {
            if let Some((cached_mtime, rows)) = cache.as_ref() {
                if *cached_mtime == mtime {
                    return rows.clone();
                }
            }
        }
        let rows = self.read_rows();
        if let (Some(mtime), Ok(mut cache)) = (mtime, self.cache.lock()) {
            *cache = Some((mtime, rows.clone()));
        }
        rows
    }

    fn read_rows(&self) -> Vec<IndexRow> {
        let mut reader = match csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(&self.csv_path)
        {
            Ok(reader) => reader,
            Err(_) => return Vec::new(),
        };
        let mut rows = Vec::new();
        for (line, record) in reader.records().enumerate() {
            let record = match record {
                Ok(record) => record,
                Err(err) => {
                    log::warn!("knowledge index line {} unreadable: {}", line + 2, err);
                    continue;
                }
            };
            match parse_row(&record) {
                Some(row) if self.check_row_path(&row.path).is_ok() => rows.push(row),
                Some(row) => {
                    log::warn!("knowledge index row {} has unsafe path: {}", row.name, row.path)
                }
                None => log::warn!("knowledge index line {} malformed, skipped", line + 2),
            }
        }
        rows
    }

    fn check_row_path(&self, path: &str) -> IndexResult<()> {
        if !row_path_is_safe(path) {
            return Err(IndexError::UnsafePath(path.to_string()));
        }
        if !self
            .allowed_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
        {
            return Err(IndexError::UnsafePath(path.to_string()));
        }
        Ok(())
    }

    // ── Queries ───────────────────────────────────────────────────────────

    /// Case-insensitive substring search over name, description, alias,
    /// and use cases.
    pub fn search(&self, query: &str) -> Vec<IndexRow> {
        let needle = query.to_lowercase();
        self.load()
            .into_iter()
            .filter(|row| {
                row.name.to_lowercase().contains(&needle)
                    || row.description.to_lowercase().contains(&needle)
                    || row.alias.to_lowercase().contains(&needle)
                    || row
                        .use_cases
                        .iter()
                        .any(|u| u.to_lowercase().contains(&needle))
            })
            .collect()
    }

    pub fn filter_by_domain(&self, domain: Domain) -> Vec<IndexRow> {
        self.load()
            .into_iter()
            .filter(|row| row.domain == domain)
            .collect()
    }

    /// AND-semantics tag filter over use cases and tools.
    pub fn filter_by_tags(&self, tags: &[String]) -> Vec<IndexRow> {
        self.load()
            .into_iter()
            .filter(|row| {
                tags.iter().all(|tag| {
                    let tag = tag.to_lowercase();
                    row.use_cases.iter().any(|u| u.to_lowercase() == tag)
                        || row.tools.iter().any(|t| t.to_lowercase() == tag)
                })
            })
            .collect()
    }

    /// Exact match on name, falling back to alias.
    pub fn get(&self, name: &str) -> Option<IndexRow> {
        let rows = self.load();
        rows.iter()
            .find(|row| row.name == name)
            .or_else(|| rows.iter().find(|row| !row.alias.is_empty() && row.alias == name))
            .cloned()
    }

    pub fn list_all(&self) -> Vec<IndexRow> {
        self.load()
    }

    pub fn stats(&self) -> IndexStats {
        let rows = self.load();
        let mut stats = IndexStats {
            total: rows.len(),
            ..IndexStats::default()
        };
        for row in rows {
            match row.domain {
                Domain::Skill => stats.skills += 1,
                Domain::Agent => stats.agents += 1,
                Domain::Workflow => stats.workflows += 1,
            }
            if row.deprecated {
                stats.deprecated += 1;
            }
        }
        stats
    }

    /// The skills an agent kind requires, by convention the rows whose
    /// `tools` tags include the agent name.
    pub fn skills_for_agent(&self, agent_kind: &str) -> Vec<IndexRow> {
        let needle = agent_kind.to_lowercase();
        self.filter_by_domain(Domain::Skill)
            .into_iter()
            .filter(|row| row.tools.iter().any(|t| t.to_lowercase() == needle))
            .collect()
    }

    pub fn csv_path(&self) -> &Path {
        &self.csv_path
    }
}

/// Reject traversal and injection spellings inside a row path.
fn row_path_is_safe(path: &str) -> bool {
    if path.is_empty() || path.contains('\0') {
        return false;
    }
    let lowered = path.to_lowercase();
    if lowered.contains("../") || lowered.contains("..\\") {
        return false;
    }
    if lowered.contains("%2e%2e%2f") || lowered.contains("%2e%2e/") {
        return false;
    }
    if path.contains("${") {
        return false;
    }
    if path.starts_with('/') || path.len() >= 3 && path.as_bytes()[1] == b':' {
        return false;
    }
    true
}

/// Prefix cells that spreadsheet software would treat as formulas.
fn escape_cell(cell: &str) -> String {
    match cell.chars().next() {
        Some('=') | Some('+') | Some('-') | Some('@') => format!("'{}", cell),
        _ => cell.to_string(),
    }
}

fn unescape_cell(cell: &str) -> String {
    match cell.strip_prefix('\'') {
        Some(rest)
            if matches!(rest.chars().next(), Some('=') | Some('+') | Some('-') | Some('@')) =>
        {
            rest.to_string()
        }
        _ => cell.to_string(),
    }
}

fn serialize_row(row: &IndexRow) -> Vec<String> {
    vec![
        escape_cell(&row.name),
        escape_cell(&row.path),
        escape_cell(&row.description),
        row.domain.as_str().to_string(),
        row.complexity.as_str().to_string(),
        escape_cell(&row.use_cases.join(";")),
        escape_cell(&row.tools.join(";")),
        row.deprecated.to_string(),
        escape_cell(&row.alias),
        row.usage_count.to_string(),
        row.last_used.map(|t| t.to_rfc3339()).unwrap_or_default(),
    ]
}

fn parse_row(record: &csv::StringRecord) -> Option<IndexRow> {
    if record.len() < 11 {
        return None;
    }
    Some(IndexRow {
        name: unescape_cell(record.get(0)?),
        path: unescape_cell(record.get(1)?),
        description: unescape_cell(record.get(2)?),
        domain: Domain::parse(record.get(3)?)?,
        complexity: Complexity::parse(record.get(4)?)?,
        use_cases: split_tags(&unescape_cell(record.get(5)?)),
        tools: split_tags(&unescape_cell(record.get(6)?)),
        deprecated: record.get(7)?.eq_ignore_ascii_case("true"),
        alias: unescape_cell(record.get(8)?),
        usage_count: record.get(9)?.parse().unwrap_or(0),
        last_used: record
            .get(10)
            .filter(|s| !s.is_empty())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc)),
    })
}

fn split_tags(cell: &str) -> Vec<String> {
    cell.split(';')
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}
