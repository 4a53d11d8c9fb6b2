use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

use crate::jobname::Frequency;

/// Changes the CPU frequency between jobs. Failures never abort a batch.
pub trait FrequencyControl {
    /// Returns whether the change was made. `Frequency::Default` is never
    /// applied.
    fn apply(&mut self, frequency: &Frequency) -> bool;

    /// Hands control back to the on-demand governor.
    fn reset(&mut self);
}

/// Shells out to a `cfreq.sh`-style tool:
/// `<tool> userspace <value>` and `<tool> ondemand`.
pub struct CommandFrequencyController {
    tool: PathBuf,
    settle: Duration,
}

impl CommandFrequencyController {
    pub fn new(tool: PathBuf, settle: Duration) -> Self {
        Self { tool, settle }
    }

    fn invoke(&self, args: &[&str]) -> bool {
        let status = Command::new(&self.tool)
            .args(args)
            .stdin(Stdio::null())
            .status();
        match status {
            Ok(status) => {
                if !status.success() {
                    warn!(
                        tool = %self.tool.display(),
                        args = ?args,
                        status = %status,
                        "frequency tool exited unsuccessfully"
                    );
                }
                true
            }
            Err(err) => {
                warn!(
                    tool = %self.tool.display(),
                    args = ?args,
                    error = %err,
                    "failed to run frequency tool"
                );
                false
            }
        }
    }
}

impl FrequencyControl for CommandFrequencyController {
    fn apply(&mut self, frequency: &Frequency) -> bool {
        let value = match frequency {
            Frequency::Default => return false,
            Frequency::Fixed(value) => value,
        };
        if !self.invoke(&["userspace", value.as_str()]) {
            return false;
        }
        info!(frequency = %value, "set cpu frequency");
        thread::sleep(self.settle);
        true
    }

    fn reset(&mut self) {
        if self.invoke(&["ondemand"]) {
            info!("reset cpu frequency to ondemand governor");
            thread::sleep(self.settle);
        }
    }
}
