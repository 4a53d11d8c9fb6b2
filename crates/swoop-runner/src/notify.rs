use std::io::Write;
use std::process::{Command, Stdio};
use std::thread;
use tracing::{debug, warn};

use crate::config::NotifySettings;

/// Fire-and-forget batch progress reports. Implementations must not block
/// on delivery and must swallow their own failures.
pub trait Notifier {
    fn notify(&self, subject: &str, body: &str);
}

pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, subject: &str, _body: &str) {
        debug!(subject, "notifications disabled");
    }
}

/// Hands each message to a local `sendmail -t` and reaps it on a background
/// thread.
pub struct SendmailNotifier {
    sendmail: String,
    from: String,
    to: String,
}

impl SendmailNotifier {
    pub fn new(settings: &NotifySettings, host: &str) -> Self {
        let from = settings.from.clone().unwrap_or_else(|| {
            let user = std::env::var("USER")
                .or_else(|_| std::env::var("LOGNAME"))
                .unwrap_or_else(|_| "swoop".to_string());
            format!("{}@{}", user, host)
        });
        Self {
            sendmail: settings.sendmail.clone(),
            from,
            to: settings.to.clone(),
        }
    }

    fn message(&self, subject: &str, body: &str) -> String {
        format!(
            "From: {}\nTo: {}\nSubject: {}\nContent-Type: text/plain; charset=utf-8\n\n{}\n",
            self.from, self.to, subject, body
        )
    }
}

impl Notifier for SendmailNotifier {
    fn notify(&self, subject: &str, body: &str) {
        if self.to.is_empty() {
            warn!(subject, "notification skipped: no recipient configured");
            return;
        }
        let child = Command::new(&self.sendmail)
            .arg("-t")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        let mut child = match child {
            Ok(child) => child,
            Err(err) => {
                warn!(sendmail = %self.sendmail, error = %err, "failed to start sendmail");
                return;
            }
        };
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(err) = stdin.write_all(self.message(subject, body).as_bytes()) {
                warn!(error = %err, "failed to hand message to sendmail");
            }
        }
        let subject = subject.to_string();
        thread::spawn(move || match child.wait() {
            Ok(status) if !status.success() => {
                warn!(subject = %subject, status = %status, "sendmail reported failure")
            }
            Err(err) => warn!(subject = %subject, error = %err, "failed to wait for sendmail"),
            Ok(_) => {}
        });
    }
}
