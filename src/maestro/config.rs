//! Runtime configuration.
//!
//! Provides the [`RuntimeConfig`] struct consumed by the supervisor, hook
//! pipeline, party coordinator, and telemetry. Users construct it manually or
//! via [`RuntimeConfig::from_env`]; no config-file parsing dependencies are
//! introduced; file-level settings are plain JSON read through the path
//! resolver by the caller, and the environment always wins over file values.
//!
//! # Example
//!
//! ```rust
//! use maestro::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::default()
//!     .with_use_workers(true)
//!     .with_party_mode(false);
//!
//! assert!(config.use_workers);
//! ```

use std::path::PathBuf;

/// Per-hook enforcement mode, settable via `<HOOK>_ENFORCEMENT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnforcementMode {
    /// Violations block the tool call (the default for security hooks).
    Block,
    /// Violations are downgraded to warnings. The downgrade is audit-logged.
    Warn,
    /// The hook is disabled. The disable is audit-logged.
    Off,
}

impl EnforcementMode {
    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "block" => Some(EnforcementMode::Block),
            "warn" => Some(EnforcementMode::Warn),
            "off" => Some(EnforcementMode::Off),
            _ => None,
        }
    }
}

/// Global configuration for the runtime.
///
/// Field defaults match the documented environment defaults: workers off,
/// party mode off, hooks enforced, telemetry disabled.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Root directory for runtime state (`runtime/` layout beneath it).
    /// Resolved relative to the project root by the path resolver.
    pub runtime_root: PathBuf,
    /// Enable the ephemeral-worker execution pattern (`USE_WORKERS`).
    pub use_workers: bool,
    /// Enable the party-mode coordinator (`PARTY_MODE_ENABLED`).
    pub party_mode_enabled: bool,
    /// Verbose hook logging (`DEBUG_HOOKS`).
    pub debug_hooks: bool,
    /// Telemetry export toggle (`OTEL_ENABLED`).
    pub otel_enabled: bool,
    /// OTLP endpoint (`OTEL_EXPORTER_OTLP_ENDPOINT`).
    pub otel_endpoint: Option<String>,
    /// Span batch size (`OTEL_BATCH_SIZE`, default 512).
    pub otel_batch_size: usize,
    /// Batch flush timeout in milliseconds (`OTEL_BATCH_TIMEOUT`, default 5000).
    pub otel_batch_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            runtime_root: PathBuf::from("runtime"),
            use_workers: false,
            party_mode_enabled: false,
            debug_hooks: false,
            otel_enabled: false,
            otel_endpoint: None,
            otel_batch_size: 512,
            otel_batch_timeout_ms: 5000,
        }
    }
}

impl RuntimeConfig {
    /// Build a config from defaults plus environment overrides.
    ///
    /// The environment wins over any file-derived value, so callers that load
    /// flags from a settings file should apply [`apply_env`](Self::apply_env)
    /// last.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Apply environment-variable overrides onto the current values.
    pub fn apply_env(&mut self) {
        if let Some(v) = env_bool("USE_WORKERS") {
            self.use_workers = v;
        }
        if let Some(v) = env_bool("PARTY_MODE_ENABLED") {
            if v != self.party_mode_enabled {
                log::info!(
                    "PARTY_MODE_ENABLED={} overrides configured value {}",
                    v,
                    self.party_mode_enabled
                );
            }
            self.party_mode_enabled = v;
        }
        if let Some(v) = env_bool("DEBUG_HOOKS") {
            self.debug_hooks = v;
        }
        if let Some(v) = env_bool("OTEL_ENABLED") {
            self.otel_enabled = v;
        }
        if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
            if !endpoint.is_empty() {
                self.otel_endpoint = Some(endpoint);
            }
        }
        if let Ok(size) = std::env::var("OTEL_BATCH_SIZE") {
            if let Ok(size) = size.parse() {
                self.otel_batch_size = size;
            }
        }
        if let Ok(timeout) = std::env::var("OTEL_BATCH_TIMEOUT") {
            if let Ok(timeout) = timeout.parse() {
                self.otel_batch_timeout_ms = timeout;
            }
        }
    }

    /// Set the runtime state root.
    pub fn with_runtime_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.runtime_root = root.into();
        self
    }

    /// Toggle the ephemeral-worker pattern.
    pub fn with_use_workers(mut self, enabled: bool) -> Self {
        self.use_workers = enabled;
        self
    }

    /// Toggle party mode.
    pub fn with_party_mode(mut self, enabled: bool) -> Self {
        self.party_mode_enabled = enabled;
        self
    }

    /// Look up the enforcement mode for a hook, honoring
    /// `<HOOK>_ENFORCEMENT` (hook name uppercased, dashes to underscores).
    /// Defaults to [`EnforcementMode::Block`].
    pub fn hook_enforcement(&self, hook_name: &str) -> EnforcementMode {
        let var = format!(
            "{}_ENFORCEMENT",
            hook_name.to_ascii_uppercase().replace('-', "_")
        );
        match std::env::var(&var) {
            Ok(value) => EnforcementMode::parse(&value).unwrap_or(EnforcementMode::Block),
            Err(_) => EnforcementMode::Block,
        }
    }
}

fn env_bool(name: &str) -> Option<bool> {
    match std::env::var(name) {
        Ok(value) => match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        },
        Err(_) => None,
    }
}
