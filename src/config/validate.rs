//! Configuration validation: unknown field detection and semantic checks.

use serde_json::Value;
use std::collections::HashSet;

use super::Config;

/// Known top-level config field names.
const KNOWN_TOP_LEVEL: &[&str] = &["agents", "compression", "bus", "logging"];

const KNOWN_AGENTS_DEFAULTS: &[&str] = &[
    "workspace",
    "model",
    "max_tokens",
    "temperature",
    "max_tool_iterations",
    "tool_timeout_secs",
    "provider_timeout_secs",
    "provider_retries",
    "retry_base_delay_ms",
    "retry_max_delay_ms",
    "max_concurrent_sessions",
];

const KNOWN_COMPRESSION: &[&str] = &[
    "enabled",
    "max_context_tokens",
    "target_context_tokens",
    "recent_messages_keep",
    "strategy",
    "min_content_length",
    "preserve_system_prompt_cache",
    "tool_result_threshold",
    "prompt_cache_capacity",
    "summary_timeout_secs",
];

const KNOWN_BUS: &[&str] = &[
    "storage_path",
    "visibility_timeout_secs",
    "max_retries",
    "sweep_interval_secs",
    "fsync",
    "done_retention",
    "event_buffer",
];

const KNOWN_LOGGING: &[&str] = &["format", "file", "level"];

/// A validation diagnostic.
#[derive(Debug)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub path: String,
    pub message: String,
}

#[derive(Debug, PartialEq)]
pub enum DiagnosticLevel {
    Ok,
    Warn,
    Error,
}

impl Diagnostic {
    fn error(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Error,
            path: path.into(),
            message: message.into(),
        }
    }

    fn warn(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Warn,
            path: path.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let prefix = match self.level {
            DiagnosticLevel::Ok => "[OK]",
            DiagnosticLevel::Warn => "[WARN]",
            DiagnosticLevel::Error => "[ERROR]",
        };
        if self.path.is_empty() {
            write!(f, "{} {}", prefix, self.message)
        } else {
            write!(f, "{} {}: {}", prefix, self.path, self.message)
        }
    }
}

/// Edit distance between two field names.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let b_chars: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b_chars.len()).collect();
    let mut curr = vec![0usize; b_chars.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b_chars.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b_chars.len()]
}

/// Suggest the closest known field name (if distance <= 3).
pub fn suggest_field(unknown: &str, known: &[&str]) -> Option<String> {
    known
        .iter()
        .map(|k| (k, levenshtein(unknown, k)))
        .filter(|(_, d)| *d <= 3)
        .min_by_key(|(_, d)| *d)
        .map(|(k, _)| format!("did you mean '{}'?", k))
}

fn check_keys(
    obj: &serde_json::Map<String, Value>,
    known: &[&str],
    prefix: &str,
    out: &mut Vec<Diagnostic>,
) -> bool {
    let known_set: HashSet<&str> = known.iter().copied().collect();
    let mut has_unknown = false;
    for key in obj.keys() {
        if known_set.contains(key.as_str()) {
            continue;
        }
        has_unknown = true;
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        let msg = match suggest_field(key, known) {
            Some(suggestion) => format!("Unknown field '{}', {}", key, suggestion),
            None => format!("Unknown field '{}'", key),
        };
        out.push(Diagnostic::error(path, msg));
    }
    has_unknown
}

/// Validate a raw JSON config value against known field names.
pub fn validate_config(raw: &Value) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    let obj = match raw.as_object() {
        Some(o) => o,
        None => {
            diagnostics.push(Diagnostic::error("", "Config must be a JSON object"));
            return diagnostics;
        }
    };

    let mut has_unknown = check_keys(obj, KNOWN_TOP_LEVEL, "", &mut diagnostics);

    if let Some(defaults) = obj
        .get("agents")
        .and_then(|v| v.get("defaults"))
        .and_then(|v| v.as_object())
    {
        has_unknown |= check_keys(
            defaults,
            KNOWN_AGENTS_DEFAULTS,
            "agents.defaults",
            &mut diagnostics,
        );
    }
    let sections: [(&str, &[&str]); 3] = [
        ("compression", KNOWN_COMPRESSION),
        ("bus", KNOWN_BUS),
        ("logging", KNOWN_LOGGING),
    ];
    for (section, known) in sections {
        if let Some(section_obj) = obj.get(section).and_then(|v| v.as_object()) {
            has_unknown |= check_keys(section_obj, known, section, &mut diagnostics);
        }
    }

    if !has_unknown {
        diagnostics.push(Diagnostic {
            level: DiagnosticLevel::Ok,
            path: String::new(),
            message: "All fields recognized".to_string(),
        });
    }

    diagnostics
}

/// Check constraints between fields of a parsed config.
pub fn check_semantics(config: &Config) -> Vec<Diagnostic> {
    let mut out = Vec::new();
    let c = &config.compression;
    let a = &config.agents.defaults;

    if c.target_context_tokens > c.max_context_tokens {
        out.push(Diagnostic::error(
            "compression.target_context_tokens",
            format!(
                "must not exceed max_context_tokens ({} > {})",
                c.target_context_tokens, c.max_context_tokens
            ),
        ));
    }
    if c.enabled && c.max_context_tokens == 0 {
        out.push(Diagnostic::error(
            "compression.max_context_tokens",
            "must be greater than zero when compression is enabled",
        ));
    }
    if a.max_tool_iterations == 0 {
        out.push(Diagnostic::error(
            "agents.defaults.max_tool_iterations",
            "must be at least 1",
        ));
    }
    if a.max_concurrent_sessions == 0 {
        out.push(Diagnostic::error(
            "agents.defaults.max_concurrent_sessions",
            "must be at least 1",
        ));
    }
    if config.bus.max_retries == 0 {
        out.push(Diagnostic::error("bus.max_retries", "must be at least 1"));
    }
    if config.bus.event_buffer == 0 {
        out.push(Diagnostic::error("bus.event_buffer", "must be at least 1"));
    }
    if c.recent_messages_keep > 200 {
        out.push(Diagnostic::warn(
            "compression.recent_messages_keep",
            "very large keep window, compression will rarely have anything to reduce",
        ));
    }
    if a.retry_base_delay_ms > a.retry_max_delay_ms {
        out.push(Diagnostic::warn(
            "agents.defaults.retry_base_delay_ms",
            "exceeds retry_max_delay_ms, every retry waits the cap",
        ));
    }

    out
}
