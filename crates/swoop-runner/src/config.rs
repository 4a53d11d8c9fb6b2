use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::catalog::Catalog;
use crate::jobname::{Frequency, InputClass};

/// What happens to the running benchmark when the batch is interrupted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptPolicy {
    /// Stop waiting and leave the child to process-group signal delivery.
    #[default]
    Detach,
    /// Kill the child, then reap it.
    Kill,
    /// Keep waiting until the child exits on its own.
    Wait,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PerfSettings {
    pub program: String,
    pub events: Vec<String>,
}

impl Default for PerfSettings {
    fn default() -> Self {
        Self {
            program: "perf".to_string(),
            events: vec!["cycles".to_string(), "instructions".to_string()],
        }
    }
}

/// How the benchmark command line is wrapped.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LauncherSettings {
    /// `taskset -c <cpu>` prefix; `None` runs unpinned.
    pub pin_cpu: Option<u32>,
    pub taskset: String,
    /// `perf stat` prefix; `None` runs the binary directly.
    pub perf: Option<PerfSettings>,
}

impl Default for LauncherSettings {
    fn default() -> Self {
        Self {
            pin_cpu: Some(0),
            taskset: "taskset".to_string(),
            perf: Some(PerfSettings::default()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotifySettings {
    pub enabled: bool,
    pub to: String,
    pub from: Option<String>,
    pub sendmail: String,
}

impl Default for NotifySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            to: String::new(),
            from: None,
            sendmail: "/usr/sbin/sendmail".to_string(),
        }
    }
}

/// An experiment file. Relative paths are resolved against the file's
/// directory by [`ExperimentConfig::load`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub runs_root: PathBuf,
    pub sources_root: PathBuf,
    pub catalog: Option<PathBuf>,
    pub host: Option<String>,
    pub input: String,
    pub benchmarks: Vec<String>,
    pub hoist_policies: Vec<String>,
    pub schedulers: Vec<String>,
    pub frequencies: Vec<String>,
    pub frequency_table: BTreeMap<String, String>,
    pub repeat: u32,
    pub launcher: LauncherSettings,
    pub frequency_tool: PathBuf,
    pub settle_ms: u64,
    pub timeout_secs: Option<u64>,
    pub on_interrupt: InterruptPolicy,
    pub notify: NotifySettings,
    pub environment: BTreeMap<String, String>,
    pub llvm_lib_dir: Option<PathBuf>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        let benchmarks = ["429.mcf.kernel", "CG", "UA", "LU"];
        let frequency_table = [
            ("min", "1600000"),
            ("max", "3401000"),
            ("ondemand", "ondemand"),
            ("default", "default"),
        ];
        Self {
            runs_root: PathBuf::from("runs"),
            sources_root: PathBuf::from("sources"),
            catalog: None,
            host: None,
            input: "test".to_string(),
            benchmarks: ["orig", "sw"]
                .iter()
                .flat_map(|suffix| benchmarks.iter().map(move |b| format!("{}.{}", b, suffix)))
                .collect(),
            hoist_policies: vec!["spec".to_string(), "multispecsafe".to_string()],
            schedulers: vec!["default".to_string()],
            frequencies: vec!["default".to_string()],
            frequency_table: frequency_table
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            repeat: 1,
            launcher: LauncherSettings::default(),
            frequency_tool: PathBuf::from("./cfreq.sh"),
            settle_ms: 1000,
            timeout_secs: None,
            on_interrupt: InterruptPolicy::default(),
            notify: NotifySettings::default(),
            environment: BTreeMap::from([("OMP_NUM_THREADS".to_string(), "1".to_string())]),
            llvm_lib_dir: None,
        }
    }
}

impl ExperimentConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading experiment {}", path.display()))?;
        let mut config: ExperimentConfig = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing experiment {}", path.display()))?;
        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        config.rebase(base);
        Ok(config)
    }

    fn rebase(&mut self, base: &Path) {
        let join = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        join(&mut self.runs_root);
        join(&mut self.sources_root);
        if let Some(c) = self.catalog.as_mut() {
            join(c);
        }
        if let Some(l) = self.llvm_lib_dir.as_mut() {
            join(l);
        }
    }

    pub fn load_catalog(&self) -> Result<Catalog> {
        match &self.catalog {
            Some(path) => Catalog::load(path),
            None => Catalog::builtin(),
        }
    }

    pub fn input_class(&self) -> Result<InputClass> {
        self.input.parse::<InputClass>().map_err(Into::into)
    }

    pub fn resolve_frequency(&self, name: &str) -> Result<Frequency> {
        let value = self.frequency_table.get(name).ok_or_else(|| {
            anyhow!(
                "unknown frequency '{}': expected one of {:?}",
                name,
                self.frequency_table.keys().collect::<Vec<_>>()
            )
        })?;
        Ok(Frequency::parse(value))
    }

    pub fn host_name(&self) -> String {
        self.host.clone().unwrap_or_else(detect_host)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Environment passed to every benchmark process.
    pub fn benchmark_environment(&self) -> Result<BTreeMap<String, String>> {
        let mut env = self.environment.clone();
        if let Some(lib_dir) = &self.llvm_lib_dir {
            if !lib_dir.join("libomp.so").is_file() {
                return Err(anyhow!(
                    "cannot find libomp.so in llvm_lib_dir {}",
                    lib_dir.display()
                ));
            }
            let mut path = lib_dir.to_string_lossy().to_string();
            if let Ok(existing) = std::env::var("LD_LIBRARY_PATH") {
                if !existing.is_empty() {
                    path.push(':');
                    path.push_str(&existing);
                }
            }
            env.insert("LD_LIBRARY_PATH".to_string(), path);
        }
        Ok(env)
    }
}

fn detect_host() -> String {
    ["/proc/sys/kernel/hostname", "/etc/hostname"]
        .iter()
        .filter_map(|p| fs::read_to_string(p).ok())
        .map(|s| s.trim().to_string())
        .find(|s| !s.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok().filter(|s| !s.is_empty()))
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_current_benchmark_set() {
        let config = ExperimentConfig::default();
        assert_eq!(config.benchmarks.len(), 8);
        assert!(config.benchmarks.contains(&"429.mcf.kernel.orig".to_string()));
        assert!(config.benchmarks.contains(&"LU.sw".to_string()));
        assert_eq!(config.input_class().unwrap(), InputClass::Test);
        assert_eq!(config.on_interrupt, InterruptPolicy::Detach);
        assert_eq!(config.timeout(), None);
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let raw = r#"
input: ref
benchmarks: [429.mcf.orig]
frequencies: [max]
launcher:
  pin_cpu: null
  perf: null
on_interrupt: kill
timeout_secs: 30
"#;
        let config: ExperimentConfig = serde_yaml::from_str(raw).unwrap();
        assert_eq!(config.input_class().unwrap(), InputClass::Ref);
        assert_eq!(config.benchmarks, vec!["429.mcf.orig".to_string()]);
        assert_eq!(
            config.resolve_frequency("max").unwrap(),
            Frequency::Fixed("3401000".to_string())
        );
        assert_eq!(config.resolve_frequency("default").unwrap(), Frequency::Default);
        assert!(config.resolve_frequency("turbo").is_err());
        assert_eq!(config.launcher.pin_cpu, None);
        assert!(config.launcher.perf.is_none());
        assert_eq!(config.on_interrupt, InterruptPolicy::Kill);
        assert_eq!(config.timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.repeat, 1);
    }

    #[test]
    fn load_rebases_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("experiment.yaml");
        fs::write(&path, "runs_root: out\nsources_root: /abs/sources\n").unwrap();
        let config = ExperimentConfig::load(&path).unwrap();
        assert_eq!(config.runs_root, dir.path().join("out"));
        assert_eq!(config.sources_root, PathBuf::from("/abs/sources"));
    }

    #[test]
    fn unknown_input_class_is_rejected() {
        let config = ExperimentConfig {
            input: "huge".to_string(),
            ..ExperimentConfig::default()
        };
        assert!(config.input_class().is_err());
    }

    #[test]
    fn llvm_lib_dir_requires_libomp() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ExperimentConfig {
            llvm_lib_dir: Some(dir.path().to_path_buf()),
            ..ExperimentConfig::default()
        };
        assert!(config.benchmark_environment().is_err());
        fs::write(dir.path().join("libomp.so"), b"").unwrap();
        let env = config.benchmark_environment().unwrap();
        assert!(env["LD_LIBRARY_PATH"].starts_with(&*dir.path().to_string_lossy()));
        assert_eq!(env["OMP_NUM_THREADS"], "1");
        config.llvm_lib_dir = None;
        assert!(!config.benchmark_environment().unwrap().contains_key("LD_LIBRARY_PATH"));
    }
}
