use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::Path;

pub mod catalog;
pub mod collect;
pub mod config;
pub mod engine;
pub mod expand;
pub mod frequency;
pub mod job;
pub mod jobname;
pub mod notify;
pub mod perf;
pub mod validate;
pub mod variant;

pub use catalog::Catalog;
pub use collect::{collect_results, write_jsonl, ResultRecord};
pub use config::{ExperimentConfig, InterruptPolicy};
pub use engine::{write_batch_report, BatchOutcome, Engine, EngineError, JobResult, ReportEntry};
pub use expand::expand_jobs;
pub use frequency::{CommandFrequencyController, FrequencyControl};
pub use jobname::{Frequency, InputClass, InputSelector, JobDescriptor, JobNameError};
pub use notify::{Notifier, NullNotifier, SendmailNotifier};
pub use variant::{BenchmarkVariant, VariantFamily, VariantKind};

pub(crate) fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub(crate) fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

pub fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:,=".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}
