//! Sentinel-file checks run after the driver reports a job as done.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::thread;
use std::time::{Duration, Instant};

use jobq_core::{JobFailure, QueueConfig};
use regex::Regex;

static EXIT_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<(job|reason|stderr_file|stderr)>(.*?)</(job|reason|stderr_file|stderr)>")
        .expect("static pattern compiles")
});

/// Outcome of a completion check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// No EXIT file and, if required, the OK file showed up in time.
    Ok,
    /// The EXIT file exists.
    ExitFile,
    /// The OK file did not appear within the wait window.
    OkTimeout,
}

impl Verdict {
    pub fn is_ok(self) -> bool {
        self == Verdict::Ok
    }
}

/// Decides whether a job that the driver reports as done really succeeded.
#[derive(Debug, Clone, Copy)]
pub struct CompletionVerifier {
    max_ok_wait: Duration,
    poll_interval: Duration,
}

impl CompletionVerifier {
    pub fn new(max_ok_wait: Duration, poll_interval: Duration) -> Self {
        Self {
            max_ok_wait,
            poll_interval,
        }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(config.max_ok_wait(), config.ok_poll_interval())
    }

    /// Check the sentinel files.
    ///
    /// An EXIT file always wins. Without an OK file requirement the job
    /// passes immediately; otherwise the OK file is polled until it appears
    /// or the wait window closes. The EXIT file is checked again on every
    /// poll since a job may still be writing it.
    pub fn check(&self, exit_file: Option<&Path>, ok_file: Option<&Path>) -> Verdict {
        let exit_exists = || exit_file.is_some_and(Path::exists);

        if exit_exists() {
            return Verdict::ExitFile;
        }
        let Some(ok_file) = ok_file else {
            return Verdict::Ok;
        };

        let deadline = Instant::now() + self.max_ok_wait;
        loop {
            if ok_file.exists() {
                return Verdict::Ok;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(self.poll_interval.min(deadline - now));
            if exit_exists() {
                return Verdict::ExitFile;
            }
        }

        tracing::warn!(
            "OK file {} did not appear within {:?}",
            ok_file.display(),
            self.max_ok_wait
        );
        Verdict::OkTimeout
    }
}

/// Parse the tagged text of an EXIT file.
///
/// Recognized tags are `job`, `reason`, `stderr` and `stderr_file`; anything
/// else is ignored. Missing tags leave their field unset.
pub fn parse_exit_file(content: &str) -> JobFailure {
    let mut failure = JobFailure::default();

    for caps in EXIT_TAG.captures_iter(content) {
        if caps[1] != caps[3] {
            continue;
        }
        let value = unescape(caps[2].trim());
        match &caps[1] {
            "job" => failure.failed_job = Some(value),
            "reason" => failure.reason = Some(value),
            "stderr" => failure.stderr_capture = Some(value),
            "stderr_file" => failure.stderr_file = Some(PathBuf::from(value)),
            _ => {}
        }
    }

    failure
}

/// Read and parse an EXIT file.
pub fn read_exit_file(path: &Path) -> std::io::Result<JobFailure> {
    let content = std::fs::read_to_string(path)?;
    Ok(parse_exit_file(&content))
}

/// Failure payload for a job that has just failed for good.
pub(crate) fn load_failure(exit_file: Option<&Path>) -> Option<JobFailure> {
    let path = exit_file?;
    match read_exit_file(path) {
        Ok(failure) => Some(failure),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Some(JobFailure::missing_exit_file(path))
        }
        Err(e) => {
            tracing::warn!("Failed to read EXIT file {}: {}", path.display(), e);
            Some(JobFailure::with_reason(format!(
                "EXIT file: {} unreadable: {}",
                path.display(),
                e
            )))
        }
    }
}

fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXIT_XML: &str = r#"<error>
  <time>2026-10-19T10:11:12</time>
  <job>ECLIPSE100</job>
  <reason>Process exited with status 1</reason>
  <stderr>
Error: grid &lt;EGRID&gt; missing
  </stderr>
  <stderr_file>/runs/real-0/ECLIPSE100.stderr</stderr_file>
</error>"#;

    fn fast() -> CompletionVerifier {
        CompletionVerifier::new(Duration::from_millis(200), Duration::from_millis(20))
    }

    #[test]
    fn parses_all_tags() {
        let failure = parse_exit_file(EXIT_XML);
        assert_eq!(failure.failed_job.as_deref(), Some("ECLIPSE100"));
        assert_eq!(failure.reason.as_deref(), Some("Process exited with status 1"));
        assert_eq!(failure.stderr_capture.as_deref(), Some("Error: grid <EGRID> missing"));
        assert_eq!(
            failure.stderr_file,
            Some(PathBuf::from("/runs/real-0/ECLIPSE100.stderr"))
        );
    }

    #[test]
    fn partial_exit_file() {
        let failure = parse_exit_file("<error><reason>killed</reason></error>");
        assert_eq!(failure.reason.as_deref(), Some("killed"));
        assert!(failure.failed_job.is_none());
        assert!(failure.stderr_file.is_none());
    }

    #[test]
    fn missing_exit_file_gets_synthetic_reason() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("EXIT");
        let failure = load_failure(Some(&path)).unwrap();
        assert!(failure.reason.unwrap().contains("not found - load failure?"));
        assert!(load_failure(None).is_none());
    }

    #[test]
    fn exit_file_wins() {
        let dir = tempfile::tempdir().unwrap();
        let exit = dir.path().join("EXIT");
        let ok = dir.path().join("OK");
        std::fs::write(&exit, EXIT_XML).unwrap();
        std::fs::write(&ok, "").unwrap();
        assert_eq!(fast().check(Some(&exit), Some(&ok)), Verdict::ExitFile);
    }

    #[test]
    fn no_ok_requirement_passes() {
        let dir = tempfile::tempdir().unwrap();
        let exit = dir.path().join("EXIT");
        assert_eq!(fast().check(Some(&exit), None), Verdict::Ok);
        assert_eq!(fast().check(None, None), Verdict::Ok);
    }

    #[test]
    fn ok_file_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let ok = dir.path().join("OK");
        let started = Instant::now();
        assert_eq!(fast().check(None, Some(&ok)), Verdict::OkTimeout);
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[test]
    fn ok_file_appears_late() {
        let dir = tempfile::tempdir().unwrap();
        let ok = dir.path().join("OK");
        let writer = {
            let ok = ok.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(60));
                std::fs::write(ok, "").unwrap();
            })
        };
        let verifier = CompletionVerifier::new(Duration::from_secs(5), Duration::from_millis(10));
        assert_eq!(verifier.check(None, Some(&ok)), Verdict::Ok);
        writer.join().unwrap();
    }
}
