//! The "reporter capability" (design §9): replaces the original's virtual reporting
//! base class with a plain trait object passed by reference into sequencers and
//! protocols. No inheritance, no callbacks into foreign vtables.

use log::{error, info, warn};

/// What a sequencer should do after consulting the reporter at a cancellation point
/// (design §5: "a user-supplied progress callback may return a non-success value").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    Abort,
}

/// Progress + logging sink threaded through sequencers and protocol clients.
///
/// Implementors must be cheap to call frequently (progress is reported at least
/// every 750 ms during a hex transfer, design §4.1 step 12).
pub trait Reporter {
    /// 0..=1000 progress ("permille"), plus a short human-readable status line.
    fn progress(&self, permille: u16, status: &str) -> Verdict {
        let _ = (permille, status);
        Verdict::Continue
    }

    fn info(&self, activity: &str, message: &str) {
        info!(target: "ecuflash", "[{}] {}", activity, message);
    }

    fn warning(&self, activity: &str, message: &str) {
        warn!(target: "ecuflash", "[{}] {}", activity, message);
    }

    fn error(&self, activity: &str, message: &str) {
        error!(target: "ecuflash", "[{}] {}", activity, message);
    }
}

/// A reporter that only logs, never aborts. Used by sequences that have no
/// interactive progress bar (broadcasts, device configuration).
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingReporter;

impl Reporter for LoggingReporter {}

/// A reporter for tests: records every call instead of emitting log lines, and can
/// be configured to abort after a fixed number of progress calls.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    pub progress_calls: std::sync::Mutex<Vec<(u16, String)>>,
    pub abort_after: Option<usize>,
}

impl Reporter for RecordingReporter {
    fn progress(&self, permille: u16, status: &str) -> Verdict {
        let mut calls = self.progress_calls.lock().unwrap();
        calls.push((permille, status.to_string()));
        if let Some(limit) = self.abort_after {
            if calls.len() >= limit {
                return Verdict::Abort;
            }
        }
        Verdict::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_reporter_aborts_after_limit() {
        let r = RecordingReporter {
            abort_after: Some(2),
            ..Default::default()
        };
        assert_eq!(r.progress(0, "start"), Verdict::Continue);
        assert_eq!(r.progress(500, "half"), Verdict::Abort);
    }
}
