use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::{debug, warn};

/// Whether `output` matches `reference`.
///
/// A benchmark-supplied comparison script, when present, is tried first and
/// run as `<script> <reference> <output>` from the output's directory. Only a
/// zero exit accepts; anything else falls back to the line comparison.
pub fn is_valid_output(output: &Path, reference: &Path, script: Option<&Path>) -> bool {
    if let Some(script) = script.filter(|s| s.is_file()) {
        if run_comparison_script(script, output, reference) {
            return true;
        }
    }
    match compare_lines(output, reference) {
        Ok(same) => same,
        Err(err) => {
            warn!(
                output = %output.display(),
                reference = %reference.display(),
                error = %err,
                "could not compare output to reference"
            );
            false
        }
    }
}

fn run_comparison_script(script: &Path, output: &Path, reference: &Path) -> bool {
    let mut cmd = Command::new(script);
    cmd.arg(reference)
        .arg(output)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    if let Some(dir) = output.parent().filter(|d| !d.as_os_str().is_empty()) {
        cmd.current_dir(dir);
    }
    match cmd.status() {
        Ok(status) => {
            debug!(script = %script.display(), status = %status, "comparison script finished");
            status.success()
        }
        Err(err) => {
            warn!(script = %script.display(), error = %err, "failed to run comparison script");
            false
        }
    }
}

/// Lock-step comparison of whitespace-trimmed lines. A file that ends
/// before the other is a mismatch.
fn compare_lines(output: &Path, reference: &Path) -> io::Result<bool> {
    let mut out_lines = BufReader::new(File::open(output)?).split(b'\n');
    let mut ref_lines = BufReader::new(File::open(reference)?).split(b'\n');
    loop {
        match (ref_lines.next().transpose()?, out_lines.next().transpose()?) {
            (None, None) => return Ok(true),
            (Some(r), Some(o)) => {
                if r.trim_ascii() != o.trim_ascii() {
                    return Ok(false);
                }
            }
            _ => return Ok(false),
        }
    }
}
