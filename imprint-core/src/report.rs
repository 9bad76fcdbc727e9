//! Terminal records produced by a job.
use std::fmt;
use std::ops::Range;
use std::time::Duration;

/// How a device's part of a job ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    /// Every chunk written and, unless verification was skipped, verified.
    Completed,
    /// Read-back differed from the source for at least one chunk.
    VerificationMismatch,
    /// The device failed and retries were exhausted or pointless.
    DeviceFailure,
    UserCancelled,
    /// Stopped to protect hardware; not a fault.
    ThermalAbort,
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobOutcome::Completed => "completed",
            JobOutcome::VerificationMismatch => "verification mismatch",
            JobOutcome::DeviceFailure => "device failure",
            JobOutcome::UserCancelled => "cancelled by user",
            JobOutcome::ThermalAbort => "stopped by thermal protection",
        };
        f.write_str(s)
    }
}

/// What verification concluded for a device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verification {
    /// Every chunk read back identical to the source.
    Passed,
    /// These chunks did not match.
    Failed { mismatched: Vec<usize> },
    /// The caller asked for the fast, unverified mode.
    Skipped,
    /// The job ended before verification could finish.
    NotRun,
}

#[derive(Clone, Debug, PartialEq)]
pub struct JobResult {
    pub device: String,
    pub outcome: JobOutcome,
    /// Bytes written to the device during this run.
    pub bytes_written: u64,
    pub bytes_total: u64,
    pub duration: Duration,
    pub verification: Verification,
    /// Chunks still needing a write or a read-back.
    pub unresolved_chunks: Vec<usize>,
    /// The same, as image byte ranges.
    pub unresolved_ranges: Vec<Range<u64>>,
    /// Whether a later job with resume enabled can pick up from here.
    pub resumable: bool,
    pub error: Option<String>,
}

impl JobResult {
    pub fn is_success(&self) -> bool {
        self.outcome == JobOutcome::Completed
    }
}

impl fmt::Display for JobResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.device, self.outcome)?;
        if let Some(err) = &self.error {
            write!(f, " ({err})")?;
        }
        if !self.unresolved_ranges.is_empty() {
            let ranges: Vec<String> = self
                .unresolved_ranges
                .iter()
                .map(|r| format!("{}-{}", r.start, r.end - 1))
                .collect();
            write!(f, "; unresolved bytes {}", ranges.join(", "))?;
        }
        if self.outcome != JobOutcome::Completed {
            let resume = if self.resumable { "resumable" } else { "not resumable" };
            write!(f, "; {resume}")?;
        }
        Ok(())
    }
}

/// Results for every device of a job, in the order the devices were given.
#[derive(Clone, Debug, PartialEq)]
pub struct JobReport {
    pub results: Vec<JobResult>,
}

impl JobReport {
    /// A job succeeds only if every device completed.
    pub fn is_success(&self) -> bool {
        !self.results.is_empty() && self.results.iter().all(JobResult::is_success)
    }

    pub fn get(&self, device: &str) -> Option<&JobResult> {
        self.results.iter().find(|r| r.device == device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(outcome: JobOutcome) -> JobResult {
        JobResult {
            device: "/dev/sdb".into(),
            outcome,
            bytes_written: 0,
            bytes_total: 3_000,
            duration: Duration::ZERO,
            verification: Verification::NotRun,
            unresolved_chunks: vec![1, 2],
            unresolved_ranges: vec![1_000..3_000],
            resumable: true,
            error: Some("device /dev/sdb was removed".into()),
        }
    }

    #[test]
    fn display_names_unresolved_bytes() {
        let s = result(JobOutcome::DeviceFailure).to_string();
        assert_eq!(
            s,
            "/dev/sdb: device failure (device /dev/sdb was removed); unresolved bytes 1000-2999; resumable"
        );
    }

    #[test]
    fn report_success_requires_all() {
        let mut ok = result(JobOutcome::Completed);
        ok.device = "/dev/sdc".into();
        let report = JobReport {
            results: vec![ok.clone(), result(JobOutcome::ThermalAbort)],
        };
        assert!(!report.is_success());
        assert!(report.get("/dev/sdc").is_some());
        assert!(JobReport { results: vec![ok] }.is_success());
        assert!(!JobReport { results: vec![] }.is_success());
    }
}
