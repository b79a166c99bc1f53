//! Sniff verify report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Class of a media error found by sniff verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaErrorKind {
    /// The device recovered the data.
    Recoverable,
    /// The data at the failing lba is lost.
    Unrecoverable,
}

/// Error counts for one pass (or the drive's lifetime).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyCounts {
    pub recoverable: u64,
    pub unrecoverable: u64,
}

impl VerifyCounts {
    pub fn add(&mut self, kind: MediaErrorKind) {
        match kind {
            MediaErrorKind::Recoverable => self.recoverable += 1,
            MediaErrorKind::Unrecoverable => self.unrecoverable += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.recoverable + self.unrecoverable
    }
}

/// Persisted result of sniff verify passes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyReport {
    /// Completed full passes over the drive.
    pub pass_count: u64,
    /// Errors found so far in the running pass.
    pub current: VerifyCounts,
    /// Errors found by the last completed pass.
    pub previous: VerifyCounts,
    /// Errors found since the drive was created.
    pub totals: VerifyCounts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_pass_completed_at: Option<DateTime<Utc>>,
    /// The running pass was closed but the sniff checkpoint has not been
    /// wrapped to 0 yet.
    #[serde(default)]
    pub wrap_pending: bool,
}

impl VerifyReport {
    pub fn record(&mut self, kind: MediaErrorKind) {
        self.current.add(kind);
        self.totals.add(kind);
    }

    /// Close the running pass: it becomes the previous pass and a new one
    /// starts from zero. A no-op while an earlier close still waits for its
    /// wrap.
    pub fn complete_pass(&mut self, now: DateTime<Utc>) {
        if self.wrap_pending {
            return;
        }
        self.pass_count += 1;
        self.previous = self.current;
        self.current = VerifyCounts::default();
        self.last_pass_completed_at = Some(now);
        self.wrap_pending = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_rollover() {
        let mut report = VerifyReport::default();
        report.record(MediaErrorKind::Recoverable);
        report.record(MediaErrorKind::Unrecoverable);
        report.record(MediaErrorKind::Unrecoverable);

        report.complete_pass(Utc::now());
        assert_eq!(report.pass_count, 1);
        assert_eq!(report.previous.recoverable, 1);
        assert_eq!(report.previous.unrecoverable, 2);
        assert_eq!(report.current, VerifyCounts::default());
        assert_eq!(report.totals.total(), 3);
        assert!(report.last_pass_completed_at.is_some());

        report.wrap_pending = false;
        report.record(MediaErrorKind::Recoverable);
        report.complete_pass(Utc::now());
        assert_eq!(report.pass_count, 2);
        assert_eq!(report.previous.total(), 1);
        assert_eq!(report.totals.total(), 4);
    }

    #[test]
    fn test_complete_pass_waits_for_wrap() {
        let mut report = VerifyReport::default();
        report.record(MediaErrorKind::Unrecoverable);
        report.complete_pass(Utc::now());
        assert!(report.wrap_pending);

        report.complete_pass(Utc::now());
        assert_eq!(report.pass_count, 1);
        assert_eq!(report.previous.unrecoverable, 1);
    }

    #[test]
    fn test_report_json() {
        let mut report = VerifyReport::default();
        report.record(MediaErrorKind::Recoverable);
        let json = serde_json::to_string(&report).unwrap();
        assert!(!json.contains("last_pass_completed_at"));
        let back: VerifyReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back, report);
    }
}
