use chrono::Utc;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::session::LifecycleState;

/// Append-only operation log under the forge home (`forge.log`).
///
/// Logging never fails an operation: the first write error is reported on
/// stderr and the logger goes quiet for the rest of the process.
#[derive(Debug)]
pub(crate) struct Logger {
    path: Option<PathBuf>,
    disabled: AtomicBool,
}

impl Logger {
    pub(crate) fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            disabled: AtomicBool::new(false),
        }
    }

    pub(crate) fn discard() -> Self {
        Self::new(None)
    }

    pub(crate) fn log(&self, message: &str) {
        let Some(path) = &self.path else {
            return;
        };
        if self.disabled.load(Ordering::Relaxed) {
            return;
        }
        let ts = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
        let line = format!("{} pid={} {}\n", ts, std::process::id(), sanitize_log_value(message));
        let mut file = match fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => file,
            Err(err) => {
                self.disable_with_warning(path, &err);
                return;
            }
        };
        if let Err(err) = file.write_all(line.as_bytes()) {
            self.disable_with_warning(path, &err);
        }
    }

    pub(crate) fn log_transition(
        &self,
        op: &str,
        challenge: &str,
        from: LifecycleState,
        to: LifecycleState,
    ) {
        self.log(&format!(
            "transition op={} challenge={} from={} to={}",
            op, challenge, from, to
        ));
    }

    pub(crate) fn log_rejected(&self, op: &str, challenge: &str, reason: &str) {
        self.log(&format!(
            "rejected op={} challenge={} reason={}",
            op, challenge, reason
        ));
    }

    fn disable_with_warning(&self, path: &Path, err: &std::io::Error) {
        if self
            .disabled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(
                stderr,
                "Warning: forge logging disabled log_path={} io_error={}",
                path.display(),
                err
            );
        }
    }
}

pub(crate) fn sanitize_log_value(value: &str) -> String {
    value
        .replace('\n', "\\n")
        .replace('\r', "\\r")
        .replace('\t', "\\t")
}
