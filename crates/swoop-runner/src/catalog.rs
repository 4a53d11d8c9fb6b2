use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::jobname::InputClass;

const BUILTIN_CATALOG: &str = include_str!("../data/catalog.yaml");

/// Immutable per-benchmark run parameters, loaded once and passed explicitly.
#[derive(Debug, Clone, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    variants: BTreeMap<String, VariantParams>,
    benchmarks: BTreeMap<String, BenchmarkEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VariantParams {
    #[serde(default)]
    pub unroll: Vec<u32>,
    #[serde(default)]
    pub indirection: Vec<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BenchmarkEntry {
    #[serde(default)]
    pub inputs: BTreeMap<String, Vec<Vec<String>>>,
    #[serde(default)]
    pub stdin: BTreeMap<String, Vec<String>>,
    pub reference: ReferenceRule,
    #[serde(default)]
    pub compare: CompareTarget,
}

/// Which produced file is checked against the reference output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareTarget {
    #[default]
    Stdout,
    /// The file named by the last command-line argument, in the job dir.
    LastArg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgPick {
    First,
    Last,
    /// Last argument for long flag-style invocations (more than three
    /// arguments), otherwise the first.
    LastIfMany,
}

/// How the reference output file is named for one input instance.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ReferenceRule {
    Fixed { name: String },
    /// `<class>.<ext>`
    InputClass { ext: String },
    /// `<class>.<ordinal>.<ext>`
    ClassOrdinal { ext: String },
    /// `<stem of picked arg>.<ext>`
    ArgStem { arg: ArgPick, ext: String },
    /// `<picked arg>.<ext>`
    ArgFile { arg: ArgPick, ext: String },
    /// Stem of the first non-flag argument joined with the arguments after
    /// it by `.`.
    JoinedArgs { ext: String },
    /// `<stem of stdin file>.<ext>`
    StdinStem { ext: String },
    /// Last argument's stem if it names an input class, else the whole
    /// last argument; either way with `.<ext>` appended.
    ClassNamedStem { ext: String },
    /// `foreman_ref_encoder_main.cfg` -> `foreman_ref_main_encodelog.out`
    EncoderLog,
}

/// One concrete input instance of a benchmark.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputInstance {
    pub args: Vec<String>,
    pub stdin: Option<String>,
    pub reference: String,
}

fn stem(file: &str) -> &str {
    file.split('.').next().unwrap_or(file)
}

impl ReferenceRule {
    pub fn resolve(
        &self,
        class: InputClass,
        ordinal: u32,
        args: &[String],
        stdin: Option<&str>,
    ) -> Result<String> {
        let pick = |which: ArgPick| -> Result<&str> {
            let picked = match which {
                ArgPick::First => args.first(),
                ArgPick::Last => args.last(),
                ArgPick::LastIfMany if args.len() > 3 => args.last(),
                ArgPick::LastIfMany => args.first(),
            };
            picked
                .map(String::as_str)
                .ok_or_else(|| anyhow!("reference rule needs an argument but input has none"))
        };
        Ok(match self {
            ReferenceRule::Fixed { name } => name.clone(),
            ReferenceRule::InputClass { ext } => format!("{}.{}", class, ext),
            ReferenceRule::ClassOrdinal { ext } => format!("{}.{}.{}", class, ordinal, ext),
            ReferenceRule::ArgStem { arg, ext } => format!("{}.{}", stem(pick(*arg)?), ext),
            ReferenceRule::ArgFile { arg, ext } => format!("{}.{}", pick(*arg)?, ext),
            ReferenceRule::JoinedArgs { ext } => {
                let pos = args
                    .iter()
                    .position(|a| !a.starts_with('-'))
                    .ok_or_else(|| anyhow!("reference rule needs a non-flag argument"))?;
                let mut parts = vec![stem(&args[pos])];
                parts.extend(args[pos + 1..].iter().map(String::as_str));
                format!("{}.{}", parts.join("."), ext)
            }
            ReferenceRule::StdinStem { ext } => {
                let stdin =
                    stdin.ok_or_else(|| anyhow!("reference rule needs a stdin file"))?;
                format!("{}.{}", stem(stdin), ext)
            }
            ReferenceRule::ClassNamedStem { ext } => {
                let last = pick(ArgPick::Last)?;
                if stem(last).parse::<InputClass>().is_ok() {
                    format!("{}.{}", stem(last), ext)
                } else {
                    format!("{}.{}", last, ext)
                }
            }
            ReferenceRule::EncoderLog => {
                let last = pick(ArgPick::Last)?;
                let (head, tail) = stem(last)
                    .split_once("encoder_")
                    .ok_or_else(|| anyhow!("'{}' is not an encoder config", last))?;
                format!("{}{}_encodelog.out", head, tail)
            }
        })
    }
}

impl Catalog {
    pub fn builtin() -> Result<Self> {
        Self::from_yaml(BUILTIN_CATALOG).context("parsing built-in benchmark catalog")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading catalog {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("parsing catalog {}", path.display()))
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let catalog: Catalog = serde_yaml::from_str(raw)?;
        for (name, entry) in &catalog.benchmarks {
            for class in entry.inputs.keys().chain(entry.stdin.keys()) {
                class
                    .parse::<InputClass>()
                    .with_context(|| format!("benchmark {}", name))?;
            }
            for (class, files) in &entry.stdin {
                let count = entry.inputs.get(class).map_or(0, Vec::len);
                if files.len() != count {
                    return Err(anyhow!(
                        "benchmark {}: {} stdin files for {} inputs of class {}",
                        name,
                        files.len(),
                        count,
                        class
                    ));
                }
            }
        }
        Ok(catalog)
    }

    pub fn contains(&self, benchmark: &str) -> bool {
        self.benchmarks.contains_key(benchmark)
    }

    pub fn benchmark(&self, benchmark: &str) -> Result<&BenchmarkEntry> {
        self.benchmarks
            .get(benchmark)
            .ok_or_else(|| anyhow!("benchmark '{}' is not in the catalog", benchmark))
    }

    /// Unroll sweep for a variant id. `[None]` when the variant has no such axis.
    pub fn unroll_values(&self, variant_id: &str) -> Vec<Option<u32>> {
        axis(self.variants.get(variant_id).map(|p| p.unroll.as_slice()))
    }

    pub fn indirection_values(&self, variant_id: &str) -> Vec<Option<u32>> {
        axis(self.variants.get(variant_id).map(|p| p.indirection.as_slice()))
    }

    /// All input instances of `benchmark` for `class`, in ordinal order.
    pub fn inputs(&self, benchmark: &str, class: InputClass) -> Result<Vec<InputInstance>> {
        let entry = self.benchmark(benchmark)?;
        let arg_lists = entry
            .inputs
            .get(class.as_str())
            .filter(|lists| !lists.is_empty())
            .ok_or_else(|| {
                anyhow!(
                    "benchmark '{}' has no inputs for input class '{}'",
                    benchmark,
                    class
                )
            })?;
        let stdin = entry.stdin.get(class.as_str());
        arg_lists
            .iter()
            .enumerate()
            .map(|(idx, args)| {
                let stdin = stdin.and_then(|files| files.get(idx)).cloned();
                let reference = entry
                    .reference
                    .resolve(class, idx as u32 + 1, args, stdin.as_deref())
                    .with_context(|| format!("benchmark {} input {}{}", benchmark, class, idx + 1))?;
                Ok(InputInstance {
                    args: args.clone(),
                    stdin,
                    reference,
                })
            })
            .collect()
    }

    pub fn input(&self, benchmark: &str, class: InputClass, ordinal: u32) -> Result<InputInstance> {
        let mut inputs = self.inputs(benchmark, class)?;
        let idx = (ordinal as usize)
            .checked_sub(1)
            .filter(|i| *i < inputs.len())
            .ok_or_else(|| {
                anyhow!(
                    "benchmark '{}' has no input {}{}",
                    benchmark,
                    class,
                    ordinal
                )
            })?;
        Ok(inputs.swap_remove(idx))
    }

    pub fn compare_target(&self, benchmark: &str) -> Result<CompareTarget> {
        Ok(self.benchmark(benchmark)?.compare)
    }
}

fn axis(values: Option<&[u32]>) -> Vec<Option<u32>> {
    match values {
        Some(v) if !v.is_empty() => v.iter().copied().map(Some).collect(),
        _ => vec![None],
    }
}
