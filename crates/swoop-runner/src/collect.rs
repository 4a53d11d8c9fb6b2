use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::{debug, warn};

use crate::job::{ERROR_MARKER, STDERR_FILE};
use crate::jobname::JobDescriptor;
use crate::perf::{parse_perf_file, PerfSample};

/// One successful job, flattened for analysis.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultRecord {
    pub name: String,
    pub host: String,
    pub frequency: String,
    pub benchmark: String,
    pub binary: String,
    pub kind: String,
    pub unroll: Option<u32>,
    pub indirection: Option<u32>,
    pub hoist: Option<String>,
    pub scheduler: String,
    pub input: String,
    #[serde(flatten)]
    pub counters: BTreeMap<String, u64>,
    pub total: Option<f64>,
    pub execute_time: Option<f64>,
    pub prefetch_time: Option<f64>,
}

impl ResultRecord {
    fn new(descriptor: &JobDescriptor, perf: PerfSample) -> Self {
        Self {
            name: descriptor.encode(),
            host: descriptor.host.clone(),
            frequency: descriptor.frequency.to_string(),
            benchmark: descriptor.benchmark().to_string(),
            binary: descriptor.binary_name(),
            kind: descriptor.kind.as_str().to_string(),
            unroll: descriptor.unroll,
            indirection: descriptor.indirection,
            hoist: descriptor.hoist.clone(),
            scheduler: descriptor.scheduler_name().to_string(),
            input: descriptor.input.to_string(),
            counters: perf.counters,
            total: perf.total_seconds,
            execute_time: perf.execute_time,
            prefetch_time: perf.prefetch_time,
        }
    }
}

/// Scans `<runs_root>/<benchmark>/<job>/stderr.txt` for jobs whose last
/// attempt succeeded. Directories that do not decode as job names are
/// skipped with a warning, as are jobs whose stderr cannot be read.
pub fn collect_results(runs_root: &Path) -> Result<Vec<ResultRecord>> {
    let mut records = Vec::new();
    let walker = walkdir::WalkDir::new(runs_root)
        .min_depth(3)
        .max_depth(3)
        .sort_by_file_name();
    for entry in walker {
        let entry = entry.with_context(|| format!("scanning {}", runs_root.display()))?;
        if entry.file_name() != STDERR_FILE || !entry.file_type().is_file() {
            continue;
        }
        let Some(job_dir) = entry.path().parent() else {
            continue;
        };
        if job_dir.join(ERROR_MARKER).exists() {
            debug!(dir = %job_dir.display(), "failed job, not collected");
            continue;
        }
        let Some(name) = job_dir.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let descriptor = match JobDescriptor::decode(name) {
            Ok(d) => d,
            Err(err) => {
                warn!(dir = %job_dir.display(), error = %err, "not a job directory");
                continue;
            }
        };
        let perf = match parse_perf_file(entry.path()) {
            Ok(perf) => perf,
            Err(err) => {
                warn!(job = name, error = %format!("{:#}", err), "unreadable perf output, skipping");
                continue;
            }
        };
        records.push(ResultRecord::new(&descriptor, perf));
    }
    Ok(records)
}

pub fn write_jsonl(path: &Path, records: &[ResultRecord]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let file = fs::File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut out = BufWriter::new(file);
    for record in records {
        serde_json::to_writer(&mut out, record)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}
