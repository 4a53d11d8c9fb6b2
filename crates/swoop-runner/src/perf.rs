use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Measurements scraped from a job's `stderr.txt`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerfSample {
    /// Hardware counters by event name.
    pub counters: BTreeMap<String, u64>,
    /// `seconds time elapsed` as reported by `perf stat`.
    pub total_seconds: Option<f64>,
    /// Compute-phase time printed by DVFS-instrumented binaries.
    pub execute_time: Option<f64>,
    /// Prefetch-phase time printed by DVFS-instrumented binaries.
    pub prefetch_time: Option<f64>,
}

impl PerfSample {
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
            && self.total_seconds.is_none()
            && self.execute_time.is_none()
            && self.prefetch_time.is_none()
    }
}

/// Benchmarks share stderr with perf, so the file is not guaranteed to be
/// UTF-8; undecodable bytes are replaced before parsing.
pub fn parse_perf_file(path: &Path) -> Result<PerfSample> {
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(parse_perf_output(&String::from_utf8_lossy(&bytes)))
}

pub fn parse_perf_output(text: &str) -> PerfSample {
    let mut sample = PerfSample::default();
    for line in text.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 2 {
            continue;
        }
        if tokens[1] == "seconds" {
            if tokens.get(2).map_or(true, |t| *t == "time") {
                if let Ok(v) = tokens[0].parse::<f64>() {
                    sample.total_seconds = Some(v);
                }
            }
            continue;
        }
        if tokens.len() >= 4 && tokens[1] == "time" {
            let slot = match tokens[0] {
                "Compute" => &mut sample.execute_time,
                "PreFetch" => &mut sample.prefetch_time,
                _ => continue,
            };
            if let Ok(v) = tokens[3].parse::<f64>() {
                *slot = Some(v);
            }
            continue;
        }
        if is_counter_value(tokens[0]) {
            if let Ok(v) = tokens[0].replace(',', "").parse::<u64>() {
                sample.counters.insert(tokens[1].to_string(), v);
            }
        }
    }
    sample
}

fn is_counter_value(token: &str) -> bool {
    !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_digit() || c == ',' || c == '.')
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERF_STAT: &str = "\
 Performance counter stats for './429.mcf.original inp.in' (3 runs):

     9,812,345,678      cycles                                                        ( +-  0.12% )
     4,001,002,003      instructions              #    0.41  insn per cycle           ( +-  0.01% )

       3.141592653 seconds time elapsed                                          ( +-  0.35% )

       3.000000000 seconds user
       0.100000000 seconds sys
";

    #[test]
    fn parses_counters_and_elapsed_time() {
        let s = parse_perf_output(PERF_STAT);
        assert_eq!(s.counters["cycles"], 9_812_345_678);
        assert_eq!(s.counters["instructions"], 4_001_002_003);
        assert_eq!(s.counters.len(), 2);
        assert_eq!(s.total_seconds, Some(3.141592653));
        assert!(s.execute_time.is_none());
    }

    #[test]
    fn parses_dvfs_phase_times() {
        let s = parse_perf_output("Compute time : 1.25\nPreFetch time : 0.5\nnoise line\n");
        assert_eq!(s.execute_time, Some(1.25));
        assert_eq!(s.prefetch_time, Some(0.5));
        assert!(s.counters.is_empty());
    }

    #[test]
    fn unrelated_output_yields_empty_sample() {
        assert!(parse_perf_output("segmentation fault\n\n").is_empty());
    }

    #[test]
    fn binary_noise_in_stderr_keeps_counters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stderr.txt");
        let mut bytes = b"\xff\xfe garbled benchmark output\n".to_vec();
        bytes.extend_from_slice(PERF_STAT.as_bytes());
        fs::write(&path, bytes).unwrap();

        let s = parse_perf_file(&path).unwrap();
        assert_eq!(s.counters["cycles"], 9_812_345_678);
        assert_eq!(s.total_seconds, Some(3.141592653));
    }
}
