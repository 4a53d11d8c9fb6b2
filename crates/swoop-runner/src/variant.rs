use serde::Serialize;
use std::fmt;

use crate::jobname::JobNameError;

/// Build family of a benchmark binary, named by the suffix of its variant id
/// (`429.mcf.orig`, `429.mcf.sw`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantFamily {
    Original,
    Speculative,
    Unrolled,
    Prefetch,
}

// Checked in order; a suffix that matches no row is an error.
const SUFFIX_TABLE: &[(&str, VariantFamily)] = &[
    ("orig", VariantFamily::Original),
    ("sw", VariantFamily::Speculative),
    ("unr", VariantFamily::Unrolled),
    ("pref", VariantFamily::Prefetch),
];

impl VariantFamily {
    pub fn from_suffix(suffix: &str) -> Option<Self> {
        SUFFIX_TABLE
            .iter()
            .find(|(s, _)| *s == suffix)
            .map(|(_, family)| *family)
    }

    pub fn suffix(self) -> &'static str {
        match self {
            VariantFamily::Original => "orig",
            VariantFamily::Speculative => "sw",
            VariantFamily::Unrolled => "unr",
            VariantFamily::Prefetch => "pref",
        }
    }

    pub fn uses_unroll(self) -> bool {
        matches!(self, VariantFamily::Speculative | VariantFamily::Unrolled)
    }

    pub fn uses_indirection(self) -> bool {
        self == VariantFamily::Speculative
    }

    pub fn uses_hoist(self) -> bool {
        self == VariantFamily::Speculative
    }

    pub fn uses_scheduler(self) -> bool {
        self == VariantFamily::Original
    }
}

/// What a job actually measures. Differs from [`VariantFamily`] only in
/// splitting the speculative family by its hoist policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantKind {
    Original,
    Speculative,
    Dae,
    Unrolled,
    Prefetch,
}

impl VariantKind {
    pub fn derive(family: VariantFamily, hoist: Option<&str>) -> Self {
        match family {
            VariantFamily::Original => VariantKind::Original,
            VariantFamily::Speculative if hoist == Some("dae") => VariantKind::Dae,
            VariantFamily::Speculative => VariantKind::Speculative,
            VariantFamily::Unrolled => VariantKind::Unrolled,
            VariantFamily::Prefetch => VariantKind::Prefetch,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VariantKind::Original => "original",
            VariantKind::Speculative => "speculative",
            VariantKind::Dae => "dae",
            VariantKind::Unrolled => "unrolled",
            VariantKind::Prefetch => "prefetch",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct BenchmarkVariant {
    pub benchmark: String,
    pub family: VariantFamily,
}

impl BenchmarkVariant {
    pub fn parse(id: &str) -> Result<Self, JobNameError> {
        let (benchmark, suffix) = id
            .rsplit_once('.')
            .ok_or_else(|| JobNameError::UnknownVariant(id.to_string()))?;
        let family = VariantFamily::from_suffix(suffix)
            .ok_or_else(|| JobNameError::UnknownVariant(id.to_string()))?;
        if benchmark.is_empty() {
            return Err(JobNameError::UnknownVariant(id.to_string()));
        }
        Ok(Self {
            benchmark: benchmark.to_string(),
            family,
        })
    }

    pub fn id(&self) -> String {
        format!("{}.{}", self.benchmark, self.family.suffix())
    }

    /// File name of the compiled binary under `<benchmark>/bin/`.
    pub fn binary_name(
        &self,
        unroll: Option<u32>,
        indirection: Option<u32>,
        hoist: Option<&str>,
        scheduler: Option<&str>,
    ) -> String {
        let mut name = self.benchmark.clone();
        match self.family {
            VariantFamily::Unrolled => {
                if let Some(u) = unroll {
                    name.push_str(&format!(".unr{}", u));
                }
                name.push_str(".cae");
            }
            VariantFamily::Speculative => {
                if let Some(u) = unroll {
                    name.push_str(&format!(".unr{}", u));
                }
                if let Some(i) = indirection {
                    name.push_str(&format!(".indir{}", i));
                }
                if let Some(h) = hoist {
                    name.push('.');
                    name.push_str(h);
                }
            }
            VariantFamily::Original => match scheduler {
                Some(s) => name.push_str(&format!(".sched{}.sched", s)),
                None => name.push_str(".original"),
            },
            VariantFamily::Prefetch => name.push_str(".pref"),
        }
        name
    }
}

impl fmt::Display for BenchmarkVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.benchmark, self.family.suffix())
    }
}
