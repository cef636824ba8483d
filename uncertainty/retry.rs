// ========================================================================================
//                         Bounded retry around shared-storage I/O
// ========================================================================================
//
// Block files, ray weight files and non-represented variance files live on shared
// storage that fails transiently under load. Every read goes through
// `read_with_retry`: a failed attempt is recorded in the task's `WarningTrail`,
// the caller sleeps for the configured delay, and the operation is retried. Only
// after the last attempt fails does the error escape as an `IoFailure`.

use log::warn;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

const DEFAULT_ATTEMPTS: u32 = 10;
const DEFAULT_DELAY_MS: u64 = 5000;

/// How many times an I/O operation is attempted and how long to wait between
/// attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            delay_ms: DEFAULT_DELAY_MS,
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay_ms: delay.as_millis() as u64,
        }
    }

    #[inline]
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    #[inline]
    fn limit(&self) -> u32 {
        self.attempts.max(1)
    }
}

/// Human-readable record of every recovered or unrecovered I/O failure seen by
/// one task. It travels back to the orchestrator inside the task result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WarningTrail {
    lines: Vec<String>,
}

impl WarningTrail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, line: String) {
        self.lines.push(line);
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }
}

impl fmt::Display for WarningTrail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.lines {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    Read,
    Write,
}

impl fmt::Display for IoDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoDirection::Read => f.write_str("read"),
            IoDirection::Write => f.write_str("write"),
        }
    }
}

/// An I/O operation that failed on every permitted attempt. `trail` holds the
/// warning line of each of those attempts.
#[derive(Debug, Clone, Error)]
#[error(
    "{direction} of '{}' failed after {attempts} attempts ({} warnings recorded): {last_error}",
    .path.display(),
    .trail.len()
)]
pub struct IoFailure {
    pub direction: IoDirection,
    pub path: PathBuf,
    pub attempts: u32,
    pub last_error: String,
    pub trail: WarningTrail,
}

fn timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

fn run_with_retry<T, F>(
    direction: IoDirection,
    path: &Path,
    policy: &RetryPolicy,
    trail: &mut WarningTrail,
    mut op: F,
) -> Result<T, IoFailure>
where
    F: FnMut(&Path) -> io::Result<T>,
{
    let limit = policy.limit();
    let mut attempts_trail = WarningTrail::new();
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op(path) {
            Ok(value) => return Ok(value),
            Err(e) => {
                let line = format!(
                    "{} {direction} attempt {attempt}/{limit} failed for {}: {e}",
                    timestamp_millis(),
                    path.display()
                );
                warn!("{line}");
                trail.push(line.clone());
                attempts_trail.push(line);
                if attempt >= limit {
                    return Err(IoFailure {
                        direction,
                        path: path.to_path_buf(),
                        attempts: attempt,
                        last_error: e.to_string(),
                        trail: attempts_trail,
                    });
                }
                thread::sleep(policy.delay());
            }
        }
    }
}

/// Runs a read operation against `path` under the retry policy.
pub fn read_with_retry<T, F>(
    path: &Path,
    policy: &RetryPolicy,
    trail: &mut WarningTrail,
    op: F,
) -> Result<T, IoFailure>
where
    F: FnMut(&Path) -> io::Result<T>,
{
    run_with_retry(IoDirection::Read, path, policy, trail, op)
}

/// Runs a write operation against `path` under the retry policy.
pub fn write_with_retry<T, F>(
    path: &Path,
    policy: &RetryPolicy,
    trail: &mut WarningTrail,
    op: F,
) -> Result<T, IoFailure>
where
    F: FnMut(&Path) -> io::Result<T>,
{
    run_with_retry(IoDirection::Write, path, policy, trail, op)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instant_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::ZERO)
    }

    #[test]
    fn recovered_read_returns_data_and_records_each_failure() {
        let mut trail = WarningTrail::new();
        let mut calls = 0;
        let value = read_with_retry(
            Path::new("/shared/block.bin"),
            &instant_policy(5),
            &mut trail,
            |_| {
                calls += 1;
                if calls < 3 {
                    Err(io::Error::new(io::ErrorKind::TimedOut, "nfs stall"))
                } else {
                    Ok(42u32)
                }
            },
        )
        .unwrap();

        assert_eq!(value, 42);
        assert_eq!(calls, 3);
        assert_eq!(trail.len(), 2);
        assert!(trail.lines()[0].contains("read attempt 1/5"));
        assert!(trail.lines()[1].contains("/shared/block.bin"));
        assert!(trail.lines()[1].contains("nfs stall"));
    }

    #[test]
    fn exhausted_read_reports_path_and_attempt_count() {
        let mut trail = WarningTrail::new();
        let mut calls = 0;
        let err = read_with_retry(
            Path::new("missing.bin"),
            &instant_policy(4),
            &mut trail,
            |p| -> io::Result<()> {
                calls += 1;
                std::fs::read(p).map(|_| ())
            },
        )
        .unwrap_err();

        assert_eq!(calls, 4);
        assert_eq!(err.attempts, 4);
        assert_eq!(err.path, PathBuf::from("missing.bin"));
        assert_eq!(err.direction, IoDirection::Read);
        assert_eq!(trail.len(), 4);
        assert!(err.to_string().contains("after 4 attempts"));
    }

    fn failing_then_ok(failures: u32) -> impl FnMut(&Path) -> io::Result<&'static str> {
        let mut calls = 0;
        move |_: &Path| {
            calls += 1;
            if calls <= failures {
                Err(io::Error::new(io::ErrorKind::TimedOut, format!("stall {calls}")))
            } else {
                Ok("block")
            }
        }
    }

    #[test]
    fn read_failing_one_short_of_the_limit_recovers() {
        let mut trail = WarningTrail::new();
        let value = read_with_retry(
            Path::new("ginv_0_0.blk"),
            &instant_policy(4),
            &mut trail,
            failing_then_ok(3),
        )
        .unwrap();

        assert_eq!(value, "block");
        assert_eq!(trail.len(), 3);
        assert!(trail.lines()[2].contains("read attempt 3/4"));
    }

    #[test]
    fn read_failing_on_every_attempt_carries_its_warnings() {
        let mut trail = WarningTrail::new();
        trail.push("earlier warning from another file".to_string());
        let err = read_with_retry(
            Path::new("ginv_0_0.blk"),
            &instant_policy(4),
            &mut trail,
            failing_then_ok(4),
        )
        .unwrap_err();

        assert!(matches!(err, IoFailure { attempts: 4, .. }));
        assert_eq!(err.last_error, "stall 4");
        assert_eq!(err.trail.len(), 4);
        assert!(err.trail.lines()[0].contains("read attempt 1/4"));
        assert!(err.trail.lines()[3].contains("read attempt 4/4"));
        assert_eq!(trail.len(), 5);
        assert!(err.to_string().contains("(4 warnings recorded)"));
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        let mut trail = WarningTrail::new();
        let mut calls = 0;
        let result = write_with_retry(
            Path::new("out.bin"),
            &instant_policy(0),
            &mut trail,
            |_| -> io::Result<()> {
                calls += 1;
                Err(io::Error::other("disk full"))
            },
        );
        assert!(result.is_err());
        assert_eq!(calls, 1);
        assert!(trail.lines()[0].contains("write attempt 1/1"));
    }
}
