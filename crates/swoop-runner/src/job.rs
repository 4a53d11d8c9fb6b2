use anyhow::{anyhow, Context, Result};
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::catalog::{Catalog, CompareTarget};
use crate::config::LauncherSettings;
use crate::jobname::{Frequency, InputClass, JobDescriptor};
use crate::validate::is_valid_output;

pub const STDOUT_FILE: &str = "stdout.txt";
pub const STDERR_FILE: &str = "stderr.txt";
pub const ERROR_MARKER: &str = "error";
pub const TEST_SCRIPT: &str = "test_script.sh";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Staged,
    Running,
    CompletedOk,
    CompletedFail,
    Reported,
}

impl JobState {
    pub fn can_advance_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Staged)
                | (Staged, Running)
                | (Running, CompletedOk)
                | (Running, CompletedFail)
                | (CompletedOk, Reported)
                | (CompletedFail, Reported)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Staged => "staged",
            JobState::Running => "running",
            JobState::CompletedOk => "completed_ok",
            JobState::CompletedFail => "completed_fail",
            JobState::Reported => "reported",
        }
    }
}

/// Where a benchmark's binaries, inputs and reference outputs live:
/// `<sources_root>/<benchmark>/{bin, data/<class>/{input,output}}`.
pub struct SourceLayout {
    bench_dir: PathBuf,
}

impl SourceLayout {
    pub fn new(sources_root: &Path, benchmark: &str) -> Self {
        Self {
            bench_dir: sources_root.join(benchmark),
        }
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.bench_dir.join("bin")
    }

    pub fn input_dir(&self, class: InputClass) -> PathBuf {
        self.bench_dir.join("data").join(class.as_str()).join("input")
    }

    pub fn output_dir(&self, class: InputClass) -> PathBuf {
        self.bench_dir.join("data").join(class.as_str()).join("output")
    }
}

/// One executable unit, owning its working directory
/// `<runs_root>/<benchmark>/<job_name>`.
#[derive(Debug)]
pub struct Job {
    pub name: String,
    pub descriptor: JobDescriptor,
    pub dir: PathBuf,
    pub command: Vec<String>,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    pub stdin: Option<PathBuf>,
    pub reference: PathBuf,
    pub compare_file: PathBuf,
    pub test_script: PathBuf,
    binary: PathBuf,
    link_dirs: Vec<PathBuf>,
    state: JobState,
}

impl Job {
    /// Resolves `descriptor` against the catalog and the source tree.
    /// `Ok(None)` means the binary is not built; catalog problems are errors.
    pub fn resolve(
        descriptor: &JobDescriptor,
        catalog: &Catalog,
        sources_root: &Path,
        runs_root: &Path,
        launcher: &LauncherSettings,
        repeat: u32,
    ) -> Result<Option<Job>> {
        let benchmark = descriptor.benchmark();
        let class = descriptor.input.class;
        let input = catalog.input(benchmark, class, descriptor.input.ordinal)?;
        let layout = SourceLayout::new(sources_root, benchmark);

        let binary_name = descriptor.binary_name();
        let binary = layout.bin_dir().join(&binary_name);
        if !binary.exists() {
            warn!(binary = %binary.display(), "no such binary, dropping job");
            return Ok(None);
        }

        let name = descriptor.encode();
        let dir = runs_root.join(benchmark).join(&name);
        let stdout = dir.join(STDOUT_FILE);
        let compare_file = match catalog.compare_target(benchmark)? {
            CompareTarget::Stdout => stdout.clone(),
            CompareTarget::LastArg => {
                let last = input.args.last().ok_or_else(|| {
                    anyhow!("benchmark '{}' compares its last argument but has none", benchmark)
                })?;
                dir.join(last)
            }
        };

        let mut link_dirs = vec![layout.input_dir(class)];
        if class != InputClass::All {
            link_dirs.push(layout.input_dir(InputClass::All));
        }

        Ok(Some(Job {
            command: build_command(launcher, repeat, &binary_name, &input.args),
            stderr: dir.join(STDERR_FILE),
            stdin: input.stdin.as_ref().map(|f| dir.join(f)),
            reference: layout.output_dir(class).join(&input.reference),
            test_script: dir.join(TEST_SCRIPT),
            descriptor: descriptor.clone(),
            compare_file,
            stdout,
            binary,
            link_dirs,
            name,
            dir,
            state: JobState::Pending,
        }))
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn frequency(&self) -> &Frequency {
        &self.descriptor.frequency
    }

    pub fn advance(&mut self, next: JobState) -> Result<()> {
        if !self.state.can_advance_to(next) {
            return Err(anyhow!(
                "job {}: illegal transition {} -> {}",
                self.name,
                self.state.as_str(),
                next.as_str()
            ));
        }
        debug!(job = %self.name, from = self.state.as_str(), to = next.as_str(), "job transition");
        self.state = next;
        Ok(())
    }

    pub fn error_marker(&self) -> PathBuf {
        self.dir.join(ERROR_MARKER)
    }

    pub fn output_is_valid(&self) -> bool {
        is_valid_output(&self.compare_file, &self.reference, Some(&self.test_script))
    }

    /// A previous run already produced validated output and was not marked
    /// failed. Output that exists but no longer validates (an interrupted
    /// write) does not count.
    pub fn already_executed(&self) -> bool {
        if !self.dir.is_dir() {
            return false;
        }
        let outputs_exist = self.stdout.is_file() && self.stderr.is_file();
        outputs_exist && !self.error_marker().exists() && self.output_is_valid()
    }

    /// Creates the working directory and symlinks inputs and the binary
    /// into it, replacing links left by earlier runs.
    pub fn stage(&mut self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating job dir {}", self.dir.display()))?;
        for src in &self.link_dirs {
            if !src.is_dir() {
                continue;
            }
            for entry in fs::read_dir(src).with_context(|| format!("listing {}", src.display()))? {
                link_into(&entry?.path(), &self.dir)?;
            }
        }
        link_into(&self.binary, &self.dir)?;
        self.advance(JobState::Staged)
    }

    pub fn mark_failed(&self) -> Result<()> {
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.error_marker())
            .with_context(|| format!("writing error marker for {}", self.name))?;
        Ok(())
    }

    pub fn clear_failed(&self) -> Result<()> {
        let marker = self.error_marker();
        if marker.exists() {
            fs::remove_file(&marker)
                .with_context(|| format!("removing stale error marker {}", marker.display()))?;
        }
        Ok(())
    }
}

fn link_into(src: &Path, dir: &Path) -> Result<()> {
    let file_name = src
        .file_name()
        .ok_or_else(|| anyhow!("cannot link {}: no file name", src.display()))?;
    let target = dir.join(file_name);
    if let Ok(meta) = target.symlink_metadata() {
        // a real directory left behind by a hand-staged run
        let removed = if meta.is_dir() {
            fs::remove_dir_all(&target)
        } else {
            fs::remove_file(&target)
        };
        removed.with_context(|| format!("replacing {}", target.display()))?;
    }
    let src = fs::canonicalize(src).unwrap_or_else(|_| src.to_path_buf());
    #[cfg(unix)]
    symlink(&src, &target)
        .with_context(|| format!("linking {} -> {}", target.display(), src.display()))?;
    Ok(())
}

pub fn build_command(
    launcher: &LauncherSettings,
    repeat: u32,
    binary_name: &str,
    args: &[String],
) -> Vec<String> {
    let mut cmd = Vec::new();
    if let Some(cpu) = launcher.pin_cpu {
        cmd.push(launcher.taskset.clone());
        cmd.push("-c".to_string());
        cmd.push(cpu.to_string());
    }
    if let Some(perf) = &launcher.perf {
        cmd.push(perf.program.clone());
        cmd.push("stat".to_string());
        cmd.push("-r".to_string());
        cmd.push(repeat.to_string());
        if !perf.events.is_empty() {
            cmd.push("-e".to_string());
            cmd.push(perf.events.join(","));
        }
    }
    cmd.push(format!("./{}", binary_name));
    cmd.extend(args.iter().cloned());
    cmd
}
