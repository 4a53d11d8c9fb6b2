use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::variant::{BenchmarkVariant, VariantKind};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobNameError {
    #[error("unrecognized benchmark variant '{0}': expected <benchmark>.(orig|sw|unr|pref)")]
    UnknownVariant(String),
    #[error("unknown input class '{0}': expected one of ref, train, test, all")]
    UnknownInputClass(String),
    #[error("malformed input selector '{0}': expected <class><ordinal>, ordinal >= 1")]
    BadInputSelector(String),
    #[error("malformed job name '{name}': {reason}")]
    Malformed { name: String, reason: String },
    #[error("unrecognized token '{token}' in job name '{name}'")]
    UnknownToken { name: String, token: String },
    #[error("token '{token}' is not meaningful for variant '{variant}'")]
    IrrelevantToken { variant: String, token: String },
    #[error("{field} '{value}' cannot be encoded in a job name")]
    Unencodable { field: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InputClass {
    Ref,
    Train,
    Test,
    All,
}

impl InputClass {
    pub const ALL: [InputClass; 4] = [
        InputClass::Ref,
        InputClass::Train,
        InputClass::Test,
        InputClass::All,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            InputClass::Ref => "ref",
            InputClass::Train => "train",
            InputClass::Test => "test",
            InputClass::All => "all",
        }
    }
}

impl FromStr for InputClass {
    type Err = JobNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        InputClass::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| JobNameError::UnknownInputClass(s.to_string()))
    }
}

impl fmt::Display for InputClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct InputSelector {
    pub class: InputClass,
    pub ordinal: u32,
}

impl FromStr for InputSelector {
    type Err = JobNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let split = s
            .find(|c: char| c.is_ascii_digit())
            .ok_or_else(|| JobNameError::BadInputSelector(s.to_string()))?;
        let (class, ordinal) = s.split_at(split);
        let class = class.parse::<InputClass>()?;
        let ordinal = ordinal
            .parse::<u32>()
            .ok()
            .filter(|n| *n >= 1)
            .ok_or_else(|| JobNameError::BadInputSelector(s.to_string()))?;
        Ok(Self { class, ordinal })
    }
}

impl fmt::Display for InputSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.class, self.ordinal)
    }
}

/// CPU frequency a job runs at. `Default` leaves the governor alone.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Frequency {
    Default,
    Fixed(String),
}

impl Frequency {
    pub fn parse(value: &str) -> Self {
        if value == "default" {
            Frequency::Default
        } else {
            Frequency::Fixed(value.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Frequency::Default => "default",
            Frequency::Fixed(v) => v,
        }
    }

    pub fn is_default(&self) -> bool {
        matches!(self, Frequency::Default)
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Frequency {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Every axis value identifying one runnable configuration.
///
/// Fields the variant family does not use are always `None`; construction
/// through [`JobDescriptor::new`] drops them, and [`JobDescriptor::decode`]
/// rejects names that carry them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct JobDescriptor {
    pub host: String,
    pub frequency: Frequency,
    pub variant: BenchmarkVariant,
    pub input: InputSelector,
    pub unroll: Option<u32>,
    pub indirection: Option<u32>,
    pub hoist: Option<String>,
    pub scheduler: Option<String>,
    pub kind: VariantKind,
}

impl JobDescriptor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        host: &str,
        frequency: Frequency,
        variant: BenchmarkVariant,
        input: InputSelector,
        unroll: Option<u32>,
        indirection: Option<u32>,
        hoist: Option<&str>,
        scheduler: Option<&str>,
    ) -> Result<Self, JobNameError> {
        let family = variant.family;
        let hoist = hoist.filter(|_| family.uses_hoist()).map(str::to_string);
        let scheduler = scheduler
            .filter(|s| *s != "default" && family.uses_scheduler())
            .map(str::to_string);
        let descriptor = Self {
            host: host.to_string(),
            frequency,
            kind: VariantKind::derive(family, hoist.as_deref()),
            unroll: unroll.filter(|_| family.uses_unroll()),
            indirection: indirection.filter(|_| family.uses_indirection()),
            hoist,
            scheduler,
            variant,
            input,
        };
        descriptor.check_encodable()?;
        Ok(descriptor)
    }

    fn check_encodable(&self) -> Result<(), JobNameError> {
        let unencodable = |field: &'static str, value: &str| JobNameError::Unencodable {
            field,
            value: value.to_string(),
        };
        if self.host.is_empty() || self.host.contains('_') {
            return Err(unencodable("host", &self.host));
        }
        let freq = self.frequency.as_str();
        if freq.is_empty() || freq.contains(['-', '_']) {
            return Err(unencodable("frequency", freq));
        }
        if self.variant.benchmark.contains('-') {
            return Err(unencodable("benchmark", &self.variant.benchmark));
        }
        if let Some(h) = &self.hoist {
            if h.is_empty() || h.contains(['-', '_']) {
                return Err(unencodable("hoist policy", h));
            }
        }
        if let Some(s) = &self.scheduler {
            if s.is_empty() || s.contains(['.', '_']) {
                return Err(unencodable("scheduler", s));
            }
        }
        Ok(())
    }

    pub fn benchmark(&self) -> &str {
        &self.variant.benchmark
    }

    pub fn scheduler_name(&self) -> &str {
        self.scheduler.as_deref().unwrap_or("default")
    }

    pub fn binary_name(&self) -> String {
        self.variant.binary_name(
            self.unroll,
            self.indirection,
            self.hoist.as_deref(),
            self.scheduler.as_deref(),
        )
    }

    pub fn encode(&self) -> String {
        let mut name = format!("{}-{}_{}", self.host, self.frequency, self.variant);
        if let Some(i) = self.indirection {
            name.push_str(&format!("-i{}", i));
        }
        if let Some(h) = &self.hoist {
            name.push_str(&format!("-h{}", h));
        }
        if let Some(u) = self.unroll {
            name.push_str(&format!("-u{}", u));
        }
        if let Some(s) = &self.scheduler {
            name.push_str(&format!("-s{}", s.replace('-', ".")));
        }
        name.push('-');
        name.push_str(&self.input.to_string());
        name
    }

    pub fn decode(name: &str) -> Result<Self, JobNameError> {
        let malformed = |reason: &str| JobNameError::Malformed {
            name: name.to_string(),
            reason: reason.to_string(),
        };
        let (hw, sw) = name
            .split_once('_')
            .ok_or_else(|| malformed("missing '_' between hardware and software parts"))?;
        let (host, frequency) = hw
            .rsplit_once('-')
            .ok_or_else(|| malformed("missing '-<frequency>' after host"))?;
        if host.is_empty() || frequency.is_empty() {
            return Err(malformed("empty host or frequency"));
        }

        let tokens: Vec<&str> = sw.split('-').collect();
        if tokens.len() < 2 {
            return Err(malformed("missing input selector"));
        }
        let variant = BenchmarkVariant::parse(tokens[0])?;
        let input = tokens[tokens.len() - 1].parse::<InputSelector>()?;

        let mut unroll = None;
        let mut indirection = None;
        let mut hoist = None;
        let mut scheduler = None;
        let unknown = |token: &str| JobNameError::UnknownToken {
            name: name.to_string(),
            token: token.to_string(),
        };
        for &token in &tokens[1..tokens.len() - 1] {
            let (tag, value) = token.split_at(token.chars().next().map_or(0, char::len_utf8));
            if value.is_empty() {
                return Err(unknown(token));
            }
            let (slot_filled, relevant) = match tag {
                "i" => (
                    indirection
                        .replace(value.parse::<u32>().map_err(|_| unknown(token))?)
                        .is_some(),
                    variant.family.uses_indirection(),
                ),
                "h" => (
                    hoist.replace(value.to_string()).is_some(),
                    variant.family.uses_hoist(),
                ),
                "u" => (
                    unroll
                        .replace(value.parse::<u32>().map_err(|_| unknown(token))?)
                        .is_some(),
                    variant.family.uses_unroll(),
                ),
                "s" => (
                    scheduler.replace(value.replace('.', "-")).is_some(),
                    variant.family.uses_scheduler(),
                ),
                _ => return Err(unknown(token)),
            };
            if slot_filled {
                return Err(malformed(&format!("duplicate token '{}'", token)));
            }
            if !relevant {
                return Err(JobNameError::IrrelevantToken {
                    variant: variant.id(),
                    token: token.to_string(),
                });
            }
        }

        Self::new(
            host,
            Frequency::parse(frequency),
            variant,
            input,
            unroll,
            indirection,
            hoist.as_deref(),
            scheduler.as_deref(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(
        variant: &str,
        unroll: Option<u32>,
        indirection: Option<u32>,
        hoist: Option<&str>,
        scheduler: Option<&str>,
    ) -> JobDescriptor {
        JobDescriptor::new(
            "node-7",
            Frequency::Fixed("1600000".to_string()),
            BenchmarkVariant::parse(variant).unwrap(),
            InputSelector {
                class: InputClass::Ref,
                ordinal: 2,
            },
            unroll,
            indirection,
            hoist,
            scheduler,
        )
        .expect("descriptor")
    }

    #[test]
    fn encodes_tokens_in_fixed_order() {
        let d = descriptor("429.mcf.sw", Some(2), Some(3), Some("spec"), None);
        assert_eq!(d.encode(), "node-7-1600000_429.mcf.sw-i3-hspec-u2-ref2");
    }

    #[test]
    fn original_only_carries_scheduler() {
        let d = descriptor("CG.orig", Some(4), Some(1), Some("spec"), Some("list-ilp"));
        assert_eq!(d.unroll, None);
        assert_eq!(d.hoist, None);
        assert_eq!(d.encode(), "node-7-1600000_CG.orig-slist.ilp-ref2");
        assert_eq!(d.binary_name(), "CG.schedlist-ilp.sched");
    }

    #[test]
    fn default_scheduler_is_not_encoded() {
        let d = descriptor("CG.orig", None, None, None, Some("default"));
        assert_eq!(d.scheduler, None);
        assert_eq!(d.scheduler_name(), "default");
        assert_eq!(d.encode(), "node-7-1600000_CG.orig-ref2");
    }

    #[test]
    fn round_trips_every_family() {
        let cases = [
            descriptor("429.mcf.sw", Some(42), Some(6), Some("multispecsafe"), None),
            descriptor("429.mcf.sw", Some(1), Some(0), Some("dae"), None),
            descriptor("331.art_l.orig", None, None, None, Some("list-hybrid")),
            descriptor("LU.unr", Some(8), None, None, None),
            descriptor("UA.pref", None, None, None, None),
        ];
        for d in cases {
            let name = d.encode();
            let decoded = JobDescriptor::decode(&name).expect("decode");
            assert_eq!(decoded, d);
            assert_eq!(decoded.encode(), name);
        }
    }

    #[test]
    fn decode_recovers_host_with_dashes_and_kind() {
        let d = JobDescriptor::decode("srv-a-b-default_429.mcf.kernel.sw-i0-hdae-u8-test1")
            .expect("decode");
        assert_eq!(d.host, "srv-a-b");
        assert_eq!(d.frequency, Frequency::Default);
        assert_eq!(d.benchmark(), "429.mcf.kernel");
        assert_eq!(d.kind, VariantKind::Dae);
        assert_eq!(d.indirection, Some(0));
        assert_eq!(
            d.input,
            InputSelector {
                class: InputClass::Test,
                ordinal: 1
            }
        );
    }

    #[test]
    fn decode_refuses_to_guess() {
        assert!(matches!(
            JobDescriptor::decode("host-max_CG.opt-ref1"),
            Err(JobNameError::UnknownVariant(_))
        ));
        assert!(matches!(
            JobDescriptor::decode("host-max_CG.sw-x4-ref1"),
            Err(JobNameError::UnknownToken { .. })
        ));
        assert!(matches!(
            JobDescriptor::decode("host-max_CG.orig-u4-ref1"),
            Err(JobNameError::IrrelevantToken { .. })
        ));
        assert!(matches!(
            JobDescriptor::decode("host-max_CG.orig-huge0"),
            Err(JobNameError::UnknownInputClass(_))
        ));
        assert!(matches!(
            JobDescriptor::decode("host-max_CG.orig-ref0"),
            Err(JobNameError::BadInputSelector(_))
        ));
        assert!(JobDescriptor::decode("hostmax-CG.orig-ref1").is_err());
        assert!(JobDescriptor::decode("host-max_CG.orig").is_err());
    }

    #[test]
    fn rejects_unencodable_components() {
        let err = JobDescriptor::new(
            "my_host",
            Frequency::Default,
            BenchmarkVariant::parse("CG.orig").unwrap(),
            InputSelector {
                class: InputClass::Ref,
                ordinal: 1,
            },
            None,
            None,
            None,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, JobNameError::Unencodable { field: "host", .. }));
    }

    #[test]
    fn input_selector_parses_class_prefix() {
        let s: InputSelector = "train12".parse().unwrap();
        assert_eq!(s.class, InputClass::Train);
        assert_eq!(s.ordinal, 12);
        assert!("train".parse::<InputSelector>().is_err());
        assert!("x1".parse::<InputSelector>().is_err());
    }
}
