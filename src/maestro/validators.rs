//! Command-level authorization.
//!
//! A registry maps command names to validators. Unknown commands are
//! allowed by default; known dangerous commands get strict validation.
//! Shell invocations (`bash -c "..."`) have their inner command extracted
//! and re-validated recursively through the same registry, so wrapping a
//! blocked command in a shell does not evade the policy.
//!
//! Validators are pure string functions, with no I/O and no network, and are
//! consulted by the shell `PreToolUse` hook, which maps a failed verdict to
//! a block (exit 2).

use lazy_static::lazy_static;
use std::collections::HashMap;

/// A parsed command ready for validation.
#[derive(Debug, Clone)]
pub struct ParsedCommand {
    pub name: String,
    pub args: Vec<String>,
    pub full_command: String,
}

impl ParsedCommand {
    /// Tokenize a command line with basic quote awareness.
    pub fn parse(line: &str) -> Option<Self> {
        let tokens = tokenize(line);
        let name = tokens.first()?.clone();
        Some(Self {
            name,
            args: tokens[1..].to_vec(),
            full_command: line.trim().to_string(),
        })
    }
}

/// Validation outcome consulted by the shell hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub valid: bool,
    pub error: Option<String>,
}

impl Verdict {
    pub fn allow() -> Self {
        Self {
            valid: true,
            error: None,
        }
    }

    pub fn block(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            error: Some(error.into()),
        }
    }
}

type ValidatorFn = fn(&ParsedCommand, &ValidatorRegistry) -> Verdict;

/// Registry of per-command validators.
pub struct ValidatorRegistry {
    validators: HashMap<&'static str, ValidatorFn>,
    critical_paths: Vec<String>,
    allowed_domains: Vec<String>,
}

lazy_static! {
    /// Package-registry hosts curl/wget may reach.
    static ref DEFAULT_ALLOWED_DOMAINS: Vec<String> = vec![
        "registry.npmjs.org".to_string(),
        "registry.yarnpkg.com".to_string(),
        "pypi.org".to_string(),
        "files.pythonhosted.org".to_string(),
        "crates.io".to_string(),
        "static.crates.io".to_string(),
        "index.crates.io".to_string(),
        "proxy.golang.org".to_string(),
    ];
}

impl Default for ValidatorRegistry {
    fn default() -> Self {
        let mut validators: HashMap<&'static str, ValidatorFn> = HashMap::new();
        for shell in ["bash", "sh", "zsh"] {
            validators.insert(shell, validate_shell);
        }
        validators.insert("rm", validate_rm);
        validators.insert("chmod", validate_chmod);
        for killer in ["kill", "pkill", "killall"] {
            validators.insert(killer, validate_kill);
        }
        validators.insert("git", validate_git);
        for db in ["psql", "mysql", "redis-cli", "mongosh"] {
            validators.insert(db, validate_db);
        }
        for fetcher in ["curl", "wget"] {
            validators.insert(fetcher, validate_fetch);
        }
        for blocked in ["nc", "netcat", "ssh", "scp", "sudo"] {
            validators.insert(blocked, validate_always_block);
        }
        validators.insert("rsync", validate_rsync);
        Self {
            validators,
            critical_paths: vec![
                "/".to_string(),
                "/home".to_string(),
                "/etc".to_string(),
                "/usr".to_string(),
                "/var".to_string(),
                "/boot".to_string(),
                "/bin".to_string(),
                "~".to_string(),
                "$HOME".to_string(),
            ],
            allowed_domains: DEFAULT_ALLOWED_DOMAINS.clone(),
        }
    }
}

impl ValidatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the critical-path set protected from destructive commands.
    pub fn with_critical_paths(mut self, paths: Vec<String>) -> Self {
        self.critical_paths = paths;
        self
    }

    /// Override the curl/wget domain allowlist.
    pub fn with_allowed_domains(mut self, domains: Vec<String>) -> Self {
        self.allowed_domains = domains;
        self
    }

    /// Register or replace a validator for a command name.
    pub fn register(&mut self, name: &'static str, validator: ValidatorFn) {
        self.validators.insert(name, validator);
    }

    /// Validate a raw command line. Unknown commands are allowed.
    pub fn validate_command_line(&self, line: &str) -> Verdict {
        let Some(parsed) = ParsedCommand::parse(line) else {
            return Verdict::allow();
        };
        self.validate(&parsed)
    }

    pub fn validate(&self, command: &ParsedCommand) -> Verdict {
        match self.validators.get(command.name.as_str()) {
            Some(validator) => validator(command, self),
            None => Verdict::allow(),
        }
    }
}

// ── Shell ─────────────────────────────────────────────────────────────────

/// `bash -c "INNER"`: extract INNER and revalidate every pipeline segment
/// through the registry. Dynamic execution (`eval`) is blocked outright.
fn validate_shell(command: &ParsedCommand, registry: &ValidatorRegistry) -> Verdict {
    let inner = command
        .args
        .iter()
        .position(|arg| arg == "-c")
        .and_then(|flag| command.args.get(flag + 1));
    let Some(inner) = inner else {
        return Verdict::allow();
    };
    if inner.split_whitespace().any(|word| word == "eval") {
        return Verdict::block("Dynamic execution (eval) is not allowed");
    }
    for segment in split_segments(inner) {
        let verdict = registry.validate_command_line(&segment);
        if !verdict.valid {
            return Verdict::block(format!(
                "Inner command blocked: {}",
                verdict.error.unwrap_or_else(|| segment.clone())
            ));
        }
    }
    Verdict::allow()
}

/// Split a shell string into its pipeline/sequence segments.
fn split_segments(inner: &str) -> Vec<String> {
    inner
        .split(|c| c == ';' || c == '|' || c == '&')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

// ── Filesystem ────────────────────────────────────────────────────────────

fn validate_rm(command: &ParsedCommand, registry: &ValidatorRegistry) -> Verdict {
    let recursive_or_forced = command
        .args
        .iter()
        .any(|arg| arg.starts_with('-') && (arg.contains('r') || arg.contains('R') || arg.contains('f')));
    if !recursive_or_forced {
        return Verdict::allow();
    }
    for arg in command.args.iter().filter(|a| !a.starts_with('-')) {
        let normalized = arg.trim_end_matches('/');
        let target = if normalized.is_empty() { "/" } else { normalized };
        if registry
            .critical_paths
            .iter()
            .any(|critical| critical.trim_end_matches('/') == target || (critical == "/" && target == "/"))
        {
            return Verdict::block(format!("rm against critical path: {}", arg));
        }
    }
    Verdict::allow()
}

fn validate_chmod(command: &ParsedCommand, _registry: &ValidatorRegistry) -> Verdict {
    for arg in &command.args {
        if arg == "777" || arg.ends_with("=777") {
            return Verdict::block("chmod 777 makes the target world-writable");
        }
        if arg.contains("o+w") || arg.contains("a+w") {
            return Verdict::block(format!("world-writable permission change: {}", arg));
        }
    }
    Verdict::allow()
}

// ── Processes ─────────────────────────────────────────────────────────────

fn validate_kill(command: &ParsedCommand, _registry: &ValidatorRegistry) -> Verdict {
    if command.args.iter().any(|arg| arg == "-1") {
        return Verdict::block("signal to PID -1 would kill every process");
    }
    Verdict::allow()
}

// ── Git ───────────────────────────────────────────────────────────────────

fn validate_git(command: &ParsedCommand, _registry: &ValidatorRegistry) -> Verdict {
    let lowered = command.full_command.to_lowercase();
    if lowered.contains("credential.helper") && lowered.contains("store") {
        return Verdict::block("storing git credentials in plaintext is not allowed");
    }
    let is_push = command.args.first().map(|a| a == "push").unwrap_or(false);
    if is_push
        && command
            .args
            .iter()
            .any(|arg| arg == "--force" || arg == "-f" || arg.starts_with("--force-with-lease"))
    {
        return Verdict::block("history-rewriting push is not allowed");
    }
    Verdict::allow()
}

// ── Databases ─────────────────────────────────────────────────────────────

fn validate_db(command: &ParsedCommand, _registry: &ValidatorRegistry) -> Verdict {
    let lowered = command.full_command.to_lowercase();
    const DESTRUCTIVE: [&str; 5] = [
        "drop database",
        "drop user",
        "flushall",
        "flushdb",
        "dropdatabase",
    ];
    for phrase in DESTRUCTIVE {
        if lowered.contains(phrase) {
            return Verdict::block(format!("destructive database operation: {}", phrase));
        }
    }
    Verdict::allow()
}

// ── Network ───────────────────────────────────────────────────────────────

fn validate_fetch(command: &ParsedCommand, registry: &ValidatorRegistry) -> Verdict {
    let lowered = command.full_command.to_lowercase();
    for shell in ["| sh", "| bash", "|sh", "|bash"] {
        if lowered.contains(shell) {
            return Verdict::block("piping downloads into a shell is not allowed");
        }
    }
    for arg in &command.args {
        let Some(host) = extract_host(arg) else {
            continue;
        };
        let allowed = registry
            .allowed_domains
            .iter()
            .any(|domain| host == *domain || host.ends_with(&format!(".{}", domain)));
        if !allowed {
            return Verdict::block(format!("domain not in allowlist: {}", host));
        }
    }
    Verdict::allow()
}

fn extract_host(arg: &str) -> Option<String> {
    let rest = arg
        .strip_prefix("https://")
        .or_else(|| arg.strip_prefix("http://"))?;
    let host = rest.split(['/', '?', '#']).next()?;
    let host = host.split('@').last().unwrap_or(host);
    let host = host.split(':').next().unwrap_or(host);
    Some(host.to_string())
}

fn validate_always_block(command: &ParsedCommand, _registry: &ValidatorRegistry) -> Verdict {
    Verdict::block(format!("{} is not allowed", command.name))
}

// ── Sync ──────────────────────────────────────────────────────────────────

fn validate_rsync(command: &ParsedCommand, _registry: &ValidatorRegistry) -> Verdict {
    for arg in command.args.iter().filter(|a| !a.starts_with('-')) {
        if arg.starts_with("rsync://") {
            return Verdict::block(format!("remote rsync destination: {}", arg));
        }
        // host:path and user@host:path spellings. Windows drive letters
        // don't apply here; a colon before the first slash means remote.
        let before_slash = arg.split('/').next().unwrap_or(arg);
        if before_slash.contains(':') {
            return Verdict::block(format!("remote rsync destination: {}", arg));
        }
    }
    Verdict::allow()
}

/// Quote-aware whitespace tokenizer.
fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for c in line.trim().chars() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                } else {
                    current.push(c);
                }
            }
            None => match c {
                '"' | '\'' => quote = Some(c),
                c if c.is_whitespace() => {
                    if !current.is_empty() {
                        tokens.push(std::mem::take(&mut current));
                    }
                }
                c => current.push(c),
            },
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}
