//! Logging setup and structured observability for the orchestrator.
//!
//! The journal and executor report progress through [`ProtocolEvent`] lines
//! on the `foreman.obs` target; [`init`] wires those into a rolling JSONL
//! file plus an optional console layer.

use anyhow::Context;
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Where orchestrator logs live and how long they are kept.
#[derive(Debug, Clone)]
pub struct LogSettings {
    pub dir: PathBuf,
    pub retention_days: u64,
    pub console: bool,
}

impl LogSettings {
    /// Default placement next to the orchestrator state root.
    pub fn for_state_root(root: &Path) -> Self {
        Self {
            dir: root.join("logs"),
            retention_days: 14,
            console: true,
        }
    }
}

/// Keeps the non-blocking writer alive for the process lifetime.
pub struct LogHandle {
    pub dir: PathBuf,
    pub started_at: DateTime<Utc>,
    _guard: WorkerGuard,
}

pub fn init(settings: &LogSettings) -> anyhow::Result<LogHandle> {
    fs::create_dir_all(&settings.dir)
        .with_context(|| format!("creating log directory {}", settings.dir.display()))?;
    sweep_expired(&settings.dir, settings.retention_days)?;

    let appender = tracing_appender::rolling::daily(&settings.dir, "orchestrator.jsonl");
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(writer)
        .with_ansi(false)
        .with_current_span(false);
    let console_layer = settings
        .console
        .then(|| tracing_subscriber::fmt::layer().compact().with_target(true));

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .ok();

    Ok(LogHandle {
        dir: settings.dir.clone(),
        started_at: Utc::now(),
        _guard: guard,
    })
}

/// Age-based retention: log files older than the cutoff are removed.
/// Keyed off file mtime, so hand-rotated or renamed logs age out too.
fn sweep_expired(dir: &Path, retention_days: u64) -> anyhow::Result<usize> {
    let cutoff = SystemTime::now() - Duration::from_secs(retention_days * 24 * 60 * 60);
    let mut removed = 0;

    for entry in fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.contains("jsonl") {
            continue;
        }
        let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
            continue;
        };
        if modified < cutoff && fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }

    Ok(removed)
}

/// One structured line about a protocol. Built where the orchestrator knows
/// the context (journal append, budget check, step execution) and flattened
/// into fields on the `foreman.obs` target.
#[derive(Debug, Clone)]
pub struct ProtocolEvent<'a> {
    pub component: &'a str,
    pub kind: &'a str,
    pub protocol_id: &'a str,
    pub step_index: Option<u32>,
    pub engine_id: Option<&'a str>,
    pub model_id: Option<&'a str>,
    pub gate: Option<&'a str>,
    pub detail: Option<&'a str>,
}

impl<'a> ProtocolEvent<'a> {
    pub fn new(component: &'a str, kind: &'a str, protocol_id: &'a str) -> Self {
        Self {
            component,
            kind,
            protocol_id,
            step_index: None,
            engine_id: None,
            model_id: None,
            gate: None,
            detail: None,
        }
    }

    pub fn step(mut self, index: u32) -> Self {
        self.step_index = Some(index);
        self
    }

    pub fn engine(mut self, engine_id: &'a str, model_id: &'a str) -> Self {
        self.engine_id = Some(engine_id);
        self.model_id = Some(model_id);
        self
    }

    pub fn gate(mut self, gate: &'a str) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn detail(mut self, detail: &'a str) -> Self {
        self.detail = Some(detail);
        self
    }
}

// tracing levels are const per macro call, so the level match lives here
// once instead of at every call site.
macro_rules! obs_line {
    ($level:ident, $event:expr) => {
        tracing::$level!(
            target: "foreman.obs",
            component = $event.component,
            kind = $event.kind,
            protocol_id = $event.protocol_id,
            step_index = $event.step_index.map(i64::from).unwrap_or(-1),
            engine_id = $event.engine_id.unwrap_or(""),
            model_id = $event.model_id.unwrap_or(""),
            gate = $event.gate.unwrap_or(""),
            detail = $event.detail.unwrap_or(""),
            "{}",
            $event.kind
        )
    };
}

pub fn emit(level: Level, event: &ProtocolEvent<'_>) {
    match level {
        Level::ERROR => obs_line!(error, event),
        Level::WARN => obs_line!(warn, event),
        Level::DEBUG => obs_line!(debug, event),
        Level::TRACE => obs_line!(trace, event),
        _ => obs_line!(info, event),
    }
}

/// Mask operator-provided text (clarification answers, prompt bodies) before
/// it reaches a log line or journal metadata. Keeps the length and a short
/// fingerprint so repeated occurrences of the same value still correlate.
pub fn redact(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }
    format!(
        "<redacted {} chars, fp {}>",
        trimmed.chars().count(),
        fingerprint(trimmed)
    )
}

fn fingerprint(text: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    text.len().hash(&mut hasher);
    text.hash(&mut hasher);
    format!("{:08x}", hasher.finish() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_hides_content_and_correlates_repeats() {
        let masked = redact("postgres://user:hunter2@db/prod");
        assert!(!masked.contains("hunter2"));
        assert!(masked.starts_with("<redacted"));

        assert_eq!(redact("same secret"), redact("  same secret  "));
        assert_ne!(redact("secret a"), redact("secret b"));
        assert_eq!(redact("   "), "<empty>");
    }

    #[test]
    fn sweep_removes_only_expired_log_files() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("orchestrator.jsonl.2026-01-01"), "{}").unwrap();
        std::fs::write(temp.path().join("notes.txt"), "keep me").unwrap();

        // A generous retention keeps everything.
        assert_eq!(sweep_expired(temp.path(), 7).unwrap(), 0);

        // Zero retention expires any already-written log, but never
        // non-log files.
        assert_eq!(sweep_expired(temp.path(), 0).unwrap(), 1);
        assert!(!temp.path().join("orchestrator.jsonl.2026-01-01").exists());
        assert!(temp.path().join("notes.txt").exists());
    }

    #[test]
    fn settings_default_under_state_root() {
        let settings = LogSettings::for_state_root(Path::new("/var/lib/foreman"));
        assert_eq!(settings.dir, PathBuf::from("/var/lib/foreman/logs"));
        assert_eq!(settings.retention_days, 14);
        assert!(settings.console);
    }

    #[test]
    fn event_builder_fills_optional_fields() {
        let event = ProtocolEvent::new("executor", "step_started", "proto-1")
            .step(2)
            .engine("codex", "default")
            .gate("lint")
            .detail("attempt 1");
        assert_eq!(event.step_index, Some(2));
        assert_eq!(event.engine_id, Some("codex"));
        assert_eq!(event.gate, Some("lint"));
        // Emission is side-effect only and must not panic without a
        // subscriber installed.
        emit(Level::INFO, &event);
    }
}
