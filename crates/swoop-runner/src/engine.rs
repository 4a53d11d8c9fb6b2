use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::catalog::Catalog;
use crate::config::{ExperimentConfig, InterruptPolicy};
use crate::frequency::FrequencyControl;
use crate::job::{Job, JobState};
use crate::jobname::{Frequency, JobDescriptor};
use crate::notify::Notifier;
use crate::perf::{parse_perf_file, PerfSample};
use crate::{atomic_write_json_pretty, shell_join};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("batch interrupted while running {job}")]
    Interrupted { job: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct JobResult {
    pub name: String,
    pub success: bool,
    pub elapsed_secs: f64,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub perf: PerfSample,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportEntry {
    pub name: String,
    pub success: bool,
    pub elapsed_secs: f64,
}

impl fmt::Display for ReportEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = if self.success { "success" } else { "failure" };
        write!(f, "{}\t\t\t{}\t{:.3}", self.name, verdict, self.elapsed_secs)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub results: Vec<JobResult>,
    pub report: Vec<ReportEntry>,
    /// Jobs whose previous output still validates.
    pub skipped: Vec<String>,
    /// Jobs whose binary is not built.
    pub dropped: Vec<String>,
    /// Command lines a dry run would have launched, by job name.
    pub planned: Vec<(String, String)>,
}

impl BatchOutcome {
    pub fn failures(&self) -> usize {
        self.results.iter().filter(|r| !r.success).count()
    }

    pub fn report_text(&self) -> String {
        self.report
            .iter()
            .map(ReportEntry::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

enum RunOutcome {
    Exited { status: ExitStatus, elapsed: Duration },
    TimedOut { elapsed: Duration },
    /// Never started, or could not be supervised.
    Failed { elapsed: Duration },
    Interrupted,
}

/// Runs batches of jobs one at a time, owning the frequency state between
/// them.
pub struct Engine<'a> {
    config: &'a ExperimentConfig,
    catalog: &'a Catalog,
    frequency: Box<dyn FrequencyControl + 'a>,
    notifier: Box<dyn Notifier + 'a>,
    cancel: Arc<AtomicBool>,
    environment: BTreeMap<String, String>,
    current_frequency: Frequency,
    dry_run: bool,
}

impl<'a> Engine<'a> {
    pub fn new(
        config: &'a ExperimentConfig,
        catalog: &'a Catalog,
        frequency: Box<dyn FrequencyControl + 'a>,
        notifier: Box<dyn Notifier + 'a>,
        cancel: Arc<AtomicBool>,
    ) -> Result<Self> {
        Ok(Self {
            environment: config.benchmark_environment()?,
            config,
            catalog,
            frequency,
            notifier,
            cancel,
            current_frequency: Frequency::Default,
            dry_run: false,
        })
    }

    pub fn dry_run(mut self, enabled: bool) -> Self {
        self.dry_run = enabled;
        self
    }

    pub fn run_batch(&mut self, descriptors: &[JobDescriptor]) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome {
            started_at: Utc::now(),
            finished_at: Utc::now(),
            dry_run: self.dry_run,
            results: Vec::new(),
            report: Vec::new(),
            skipped: Vec::new(),
            dropped: Vec::new(),
            planned: Vec::new(),
        };

        let mut jobs = Vec::new();
        for descriptor in descriptors {
            match Job::resolve(
                descriptor,
                self.catalog,
                &self.config.sources_root,
                &self.config.runs_root,
                &self.config.launcher,
                self.config.repeat,
            )? {
                Some(job) => jobs.push(job),
                None => outcome.dropped.push(descriptor.encode()),
            }
        }
        info!(jobs = jobs.len(), dropped = outcome.dropped.len(), "resolved batch");

        if !self.dry_run {
            self.notifier.notify("Starting experiments..", "");
        }

        let run = self.run_jobs(jobs, &mut outcome);
        // no exit path leaves the CPU pinned
        self.restore_frequency();
        run?;

        if !self.dry_run {
            self.notifier
                .notify("Experiments finished", &outcome.report_text());
        }
        outcome.finished_at = Utc::now();
        Ok(outcome)
    }

    fn run_jobs(&mut self, jobs: Vec<Job>, outcome: &mut BatchOutcome) -> Result<()> {
        for mut job in jobs {
            if job.already_executed() {
                info!(job = %job.name, "already executed, skipping");
                outcome.skipped.push(job.name.clone());
                continue;
            }
            if self.dry_run {
                let command = shell_join(&job.command);
                info!(job = %job.name, command = %command, "would run");
                outcome.planned.push((job.name.clone(), command));
                continue;
            }
            if self.cancel.load(Ordering::SeqCst) {
                return Err(self.abort(None));
            }
            if let Err(err) = job.stage() {
                error!(job = %job.name, error = %format!("{:#}", err), "staging failed, dropping job");
                outcome.dropped.push(job.name.clone());
                continue;
            }
            self.switch_frequency(job.frequency());
            job.advance(JobState::Running)?;
            info!(job = %job.name, command = %shell_join(&job.command), "running");

            let (elapsed, exit_code, timed_out, exited_ok) = match self.execute(&job) {
                RunOutcome::Interrupted => {
                    job.advance(JobState::CompletedFail)?;
                    return Err(self.abort(Some(&job)));
                }
                RunOutcome::Exited { status, elapsed } => {
                    (elapsed, status.code(), false, status.success())
                }
                RunOutcome::TimedOut { elapsed } => (elapsed, None, true, false),
                RunOutcome::Failed { elapsed } => (elapsed, None, false, false),
            };

            let success = exited_ok && job.output_is_valid();
            update_marker(&job, success);
            job.advance(if success {
                JobState::CompletedOk
            } else {
                JobState::CompletedFail
            })?;

            let elapsed_secs = elapsed.as_secs_f64();
            let perf = match parse_perf_file(&job.stderr) {
                Ok(perf) => perf,
                Err(err) => {
                    warn!(job = %job.name, error = %format!("{:#}", err), "cannot read perf output");
                    PerfSample::default()
                }
            };
            if perf.is_empty() {
                debug!(job = %job.name, "no perf counters in stderr");
            }
            let entry = ReportEntry {
                name: job.name.clone(),
                success,
                elapsed_secs,
            };
            info!(job = %job.name, success, elapsed_secs, timed_out, "job finished");
            self.notifier.notify(
                &format!(
                    "{} finished: {} time: {:.3}",
                    job.name,
                    if success { "success" } else { "failure" },
                    elapsed_secs
                ),
                &entry.to_string(),
            );
            outcome.results.push(JobResult {
                name: job.name.clone(),
                success,
                elapsed_secs,
                exit_code,
                timed_out,
                perf,
            });
            outcome.report.push(entry);
            job.advance(JobState::Reported)?;
        }

        // a Ctrl-C that landed while the remaining jobs were skipped
        if !self.dry_run && self.cancel.load(Ordering::SeqCst) {
            return Err(self.abort(None));
        }
        Ok(())
    }

    fn switch_frequency(&mut self, wanted: &Frequency) {
        if wanted.is_default() || *wanted == self.current_frequency {
            return;
        }
        if self.frequency.apply(wanted) {
            self.current_frequency = wanted.clone();
        }
    }

    fn restore_frequency(&mut self) {
        if !self.current_frequency.is_default() {
            self.frequency.reset();
            self.current_frequency = Frequency::Default;
        }
    }

    fn abort(&mut self, job: Option<&Job>) -> anyhow::Error {
        self.restore_frequency();
        let name = job.map_or_else(|| "(between jobs)".to_string(), |j| j.name.clone());
        if let Some(job) = job {
            if let Err(err) = job.mark_failed() {
                error!(job = %job.name, error = %format!("{:#}", err), "could not mark interrupted job");
            }
        }
        warn!(job = %name, "batch interrupted");
        self.notifier.notify("Experiments failed!", &name);
        EngineError::Interrupted { job: name }.into()
    }

    fn execute(&self, job: &Job) -> RunOutcome {
        let started = Instant::now();
        let failed = || RunOutcome::Failed {
            elapsed: started.elapsed(),
        };
        let (stdout, stderr) = match (File::create(&job.stdout), File::create(&job.stderr)) {
            (Ok(stdout), Ok(stderr)) => (stdout, stderr),
            (Err(err), _) | (_, Err(err)) => {
                warn!(job = %job.name, error = %err, "cannot create output files");
                return failed();
            }
        };
        let stdin = match &job.stdin {
            Some(path) => match File::open(path) {
                Ok(file) => Stdio::from(file),
                Err(err) => {
                    warn!(job = %job.name, stdin = %path.display(), error = %err, "cannot open stdin file");
                    return failed();
                }
            },
            None => Stdio::null(),
        };

        let mut cmd = Command::new(program_path(&job.dir, &job.command[0]));
        cmd.args(&job.command[1..])
            .current_dir(&job.dir)
            .envs(&self.environment)
            .stdin(stdin)
            .stdout(stdout)
            .stderr(stderr);
        let started = Instant::now();
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!(job = %job.name, error = %err, "failed to launch benchmark");
                return RunOutcome::Failed {
                    elapsed: started.elapsed(),
                };
            }
        };

        let timeout = self.config.timeout();
        loop {
            let exited = match child.try_wait() {
                Ok(status) => status,
                Err(err) => {
                    warn!(job = %job.name, error = %err, "lost track of benchmark");
                    terminate_and_reap(&mut child);
                    return RunOutcome::Failed {
                        elapsed: started.elapsed(),
                    };
                }
            };
            // A terminal Ctrl-C reaches the child too, so it may already
            // be gone by the time the flag is seen.
            if self.cancel.load(Ordering::SeqCst) {
                if exited.is_none() {
                    self.stop_on_interrupt(job, &mut child);
                }
                return RunOutcome::Interrupted;
            }
            if let Some(status) = exited {
                return RunOutcome::Exited {
                    status,
                    elapsed: started.elapsed(),
                };
            }
            if timeout.is_some_and(|limit| started.elapsed() >= limit) {
                warn!(job = %job.name, "timed out, killing benchmark");
                terminate_and_reap(&mut child);
                return RunOutcome::TimedOut {
                    elapsed: started.elapsed(),
                };
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn stop_on_interrupt(&self, job: &Job, child: &mut Child) {
        match self.config.on_interrupt {
            InterruptPolicy::Detach => {
                info!(job = %job.name, pid = child.id(), "leaving benchmark running");
            }
            InterruptPolicy::Kill => terminate_and_reap(child),
            InterruptPolicy::Wait => {
                info!(job = %job.name, "waiting for benchmark to exit");
                if let Err(err) = child.wait() {
                    warn!(job = %job.name, error = %err, "failed to wait for benchmark");
                }
            }
        }
    }
}

fn update_marker(job: &Job, success: bool) {
    let updated = if success {
        job.clear_failed()
    } else {
        job.mark_failed()
    };
    if let Err(err) = updated {
        warn!(job = %job.name, error = %format!("{:#}", err), "cannot update error marker");
    }
}

fn terminate_and_reap(child: &mut Child) {
    if let Err(err) = child.kill() {
        warn!(pid = child.id(), error = %err, "failed to kill benchmark");
    }
    if let Err(err) = child.wait() {
        warn!(pid = child.id(), error = %err, "failed to reap benchmark");
    }
}

/// `./<binary>` is resolved against the job dir so the lookup does not
/// depend on how the platform orders chdir and exec.
fn program_path(dir: &Path, program: &str) -> PathBuf {
    match program.strip_prefix("./") {
        Some(rest) => dir.join(rest),
        None => PathBuf::from(program),
    }
}

/// Writes `<runs_root>/reports/batch_<timestamp>.json` and returns its path.
pub fn write_batch_report(runs_root: &Path, outcome: &BatchOutcome) -> Result<PathBuf> {
    let path = runs_root.join("reports").join(format!(
        "batch_{}.json",
        outcome.started_at.format("%Y%m%d_%H%M%S")
    ));
    let value = serde_json::to_value(outcome)?;
    atomic_write_json_pretty(&path, &value)?;
    Ok(path)
}
