use anyhow::Result;
use std::collections::HashSet;
use tracing::debug;

use crate::catalog::Catalog;
use crate::config::ExperimentConfig;
use crate::jobname::{Frequency, InputSelector, JobDescriptor};
use crate::variant::{BenchmarkVariant, VariantFamily};

/// Expands the experiment's axes into the jobs to run.
///
/// Axes are iterated as benchmark, unroll, hoist, indirection, scheduler,
/// frequency, then input instance. Combinations that pair a non-default
/// scheduler with anything but the original build are skipped, and
/// combinations that encode to an already-seen job name are dropped.
pub fn expand_jobs(
    config: &ExperimentConfig,
    catalog: &Catalog,
    host: &str,
) -> Result<Vec<JobDescriptor>> {
    let class = config.input_class()?;
    let frequencies = config
        .frequencies
        .iter()
        .map(|name| config.resolve_frequency(name))
        .collect::<Result<Vec<Frequency>>>()?;
    let hoists = optional_axis(&config.hoist_policies);
    let schedulers = optional_axis(&config.schedulers);

    let mut processed: HashSet<String> = HashSet::new();
    let mut jobs = Vec::new();
    for bm in &config.benchmarks {
        let variant = BenchmarkVariant::parse(bm)?;
        let input_count = catalog.inputs(&variant.benchmark, class)?.len();
        for unroll in catalog.unroll_values(bm) {
            for &hoist in &hoists {
                for indirection in catalog.indirection_values(bm) {
                    for &scheduler in &schedulers {
                        let custom_scheduler = scheduler.is_some_and(|s| s != "default");
                        if custom_scheduler && variant.family != VariantFamily::Original {
                            continue;
                        }
                        for frequency in &frequencies {
                            for ordinal in 1..=input_count as u32 {
                                let descriptor = JobDescriptor::new(
                                    host,
                                    frequency.clone(),
                                    variant.clone(),
                                    InputSelector { class, ordinal },
                                    unroll,
                                    indirection,
                                    hoist,
                                    scheduler,
                                )?;
                                let name = descriptor.encode();
                                if !processed.insert(name) {
                                    debug!(job = %descriptor.encode(), "duplicate job name, skipping");
                                    continue;
                                }
                                jobs.push(descriptor);
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(jobs)
}

fn optional_axis(values: &[String]) -> Vec<Option<&str>> {
    if values.is_empty() {
        vec![None]
    } else {
        values.iter().map(|v| Some(v.as_str())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variant::VariantKind;

    fn config(benchmarks: &[&str]) -> ExperimentConfig {
        ExperimentConfig {
            input: "ref".to_string(),
            benchmarks: benchmarks.iter().map(|s| s.to_string()).collect(),
            ..ExperimentConfig::default()
        }
    }

    fn names(jobs: &[JobDescriptor]) -> Vec<String> {
        jobs.iter().map(JobDescriptor::encode).collect()
    }

    #[test]
    fn single_original_variant_yields_one_job() {
        let catalog = Catalog::builtin().unwrap();
        let jobs = expand_jobs(&config(&["429.mcf.orig"]), &catalog, "node1").unwrap();
        assert_eq!(names(&jobs), ["node1-default_429.mcf.orig-ref1"]);
        assert_eq!(jobs[0].kind, VariantKind::Original);
    }

    #[test]
    fn irrelevant_hoist_axis_collapses_for_original() {
        let catalog = Catalog::builtin().unwrap();
        let cfg = ExperimentConfig {
            hoist_policies: vec!["spec".into(), "multispecsafe".into(), "dae".into()],
            ..config(&["CG.orig"])
        };
        let jobs = expand_jobs(&cfg, &catalog, "node1").unwrap();
        assert_eq!(jobs.len(), 1);
    }

    #[test]
    fn speculative_variant_sweeps_every_axis() {
        let catalog = Catalog::builtin().unwrap();
        let jobs = expand_jobs(&config(&["331.art_l.sw"]), &catalog, "node1").unwrap();
        // unroll {2,3} x hoist {spec, multispecsafe} x indirection {3}
        assert_eq!(
            names(&jobs),
            [
                "node1-default_331.art_l.sw-i3-hspec-u2-ref1",
                "node1-default_331.art_l.sw-i3-hmultispecsafe-u2-ref1",
                "node1-default_331.art_l.sw-i3-hspec-u3-ref1",
                "node1-default_331.art_l.sw-i3-hmultispecsafe-u3-ref1",
            ]
        );
    }

    #[test]
    fn schedulers_only_apply_to_original_builds() {
        let catalog = Catalog::builtin().unwrap();
        let cfg = ExperimentConfig {
            schedulers: vec!["default".into(), "list-ilp".into(), "list-burr".into()],
            ..config(&["CG.orig", "CG.sw"])
        };
        let jobs = expand_jobs(&cfg, &catalog, "node1").unwrap();
        for job in &jobs {
            if job.scheduler.is_some() {
                assert_eq!(job.variant.family, VariantFamily::Original);
            }
        }
        let scheduled: Vec<_> = jobs.iter().filter_map(|j| j.scheduler.as_deref()).collect();
        assert_eq!(scheduled, ["list-ilp", "list-burr"]);
        // CG.orig x 3 schedulers, CG.sw x 2 hoists
        assert_eq!(jobs.len(), 5);
    }

    #[test]
    fn inputs_get_consecutive_ordinals() {
        let catalog = Catalog::builtin().unwrap();
        let jobs = expand_jobs(&config(&["403.gcc.orig"]), &catalog, "node1").unwrap();
        assert_eq!(jobs.len(), 9);
        let ordinals: Vec<u32> = jobs.iter().map(|j| j.input.ordinal).collect();
        assert_eq!(ordinals, (1..=9).collect::<Vec<_>>());
    }

    #[test]
    fn duplicate_benchmarks_are_deduplicated() {
        let catalog = Catalog::builtin().unwrap();
        let cfg = ExperimentConfig {
            frequencies: vec!["max".into(), "max".into(), "min".into()],
            ..config(&["429.mcf.orig", "429.mcf.orig"])
        };
        let jobs = expand_jobs(&cfg, &catalog, "node1").unwrap();
        assert_eq!(
            names(&jobs),
            [
                "node1-3401000_429.mcf.orig-ref1",
                "node1-1600000_429.mcf.orig-ref1"
            ]
        );
    }

    #[test]
    fn configuration_errors_abort_expansion() {
        let catalog = Catalog::builtin().unwrap();
        assert!(expand_jobs(&config(&["429.mcf.bogus"]), &catalog, "node1").is_err());
        assert!(expand_jobs(&config(&["999.none.orig"]), &catalog, "node1").is_err());
        let bad_freq = ExperimentConfig {
            frequencies: vec!["turbo".into()],
            ..config(&["429.mcf.orig"])
        };
        assert!(expand_jobs(&bad_freq, &catalog, "node1").is_err());
        let bad_class = ExperimentConfig {
            input: "all".to_string(),
            ..config(&["429.mcf.orig"])
        };
        assert!(expand_jobs(&bad_class, &catalog, "node1").is_err());
    }

    #[test]
    fn every_expanded_name_round_trips() {
        let catalog = Catalog::builtin().unwrap();
        let cfg = ExperimentConfig {
            schedulers: vec!["default".into(), "list-hybrid".into()],
            frequencies: vec!["min".into(), "default".into()],
            ..config(&["429.mcf.sw", "429.mcf.orig", "450.soplex.sw", "445.gobmk.orig"])
        };
        let jobs = expand_jobs(&cfg, &catalog, "bench-box").unwrap();
        assert!(!jobs.is_empty());
        for job in jobs {
            let name = job.encode();
            assert_eq!(JobDescriptor::decode(&name).unwrap().encode(), name);
        }
    }
}
