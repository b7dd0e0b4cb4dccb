//! Small shared helpers.

use crate::error::{Error, Result};
use regex::Regex;
use std::net::Ipv4Addr;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Guest command listing global IPv4 addresses, one interface per line.
pub const LIST_IPV4_COMMAND: &str = "ip -brief -family inet address show scope global";

/// What a polled action wants next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeoutAction<T> {
    /// Finished with a value.
    Done(T),
    /// Not yet; poll again.
    Retry,
}

/// Retry cadence: `initial` until `backoff` has elapsed, then `backoff`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySchedule {
    /// Interval at first.
    pub initial: Duration,
    /// Interval once the first window has passed.
    pub backoff: Duration,
}

impl RetrySchedule {
    /// Constant interval.
    pub fn every(interval: Duration) -> Self {
        Self {
            initial: interval,
            backoff: interval,
        }
    }

    /// Interval to wait after `elapsed` has passed.
    pub fn interval_after(&self, elapsed: Duration) -> Duration {
        if elapsed < self.backoff {
            self.initial
        } else {
            self.backoff
        }
    }
}

/// Poll `action` until it is done, fails, or `timeout` elapses.
///
/// Errors from `action` abort immediately. The action always runs at least
/// once, even with a zero timeout.
pub fn try_action_for<T, F>(
    operation: &str,
    timeout: Duration,
    schedule: RetrySchedule,
    mut action: F,
) -> Result<T>
where
    F: FnMut() -> Result<TimeoutAction<T>>,
{
    let start = Instant::now();
    loop {
        if let TimeoutAction::Done(value) = action()? {
            return Ok(value);
        }

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(Error::timeout(operation, timeout));
        }

        let wait = schedule.interval_after(elapsed).min(timeout - elapsed);
        tracing::trace!(operation, ?wait, "retrying");
        std::thread::sleep(wait);
    }
}

/// A pattern compiled on first use and shared afterwards.
pub struct CachedRegex {
    pattern: &'static str,
    compiled: OnceLock<std::result::Result<Regex, regex::Error>>,
}

impl CachedRegex {
    pub const fn new(pattern: &'static str) -> Self {
        Self {
            pattern,
            compiled: OnceLock::new(),
        }
    }

    /// The compiled pattern.
    pub fn get(&self) -> Result<&Regex> {
        self.compiled
            .get_or_init(|| Regex::new(self.pattern))
            .as_ref()
            .map_err(|e| Error::Config(format!("invalid regex {:?}: {}", self.pattern, e)))
    }
}

static IPV4_WITH_PREFIX: CachedRegex = CachedRegex::new(r"\b(\d{1,3}(?:\.\d{1,3}){3})/\d{1,2}\b");

/// Extract IPv4 addresses (`a.b.c.d/len`) from `ip -brief` style output.
pub fn parse_ipv4_addresses(output: &str) -> Result<Vec<Ipv4Addr>> {
    Ok(IPV4_WITH_PREFIX
        .get()?
        .captures_iter(output)
        .filter_map(|c| c.get(1))
        .filter_map(|m| m.as_str().parse().ok())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_cached_regex_compiles_once() {
        static DIGITS: CachedRegex = CachedRegex::new(r"^\d+$");
        let first = DIGITS.get().unwrap();
        let second = DIGITS.get().unwrap();
        assert!(std::ptr::eq(first, second));
        assert!(first.is_match("42"));

        static BROKEN: CachedRegex = CachedRegex::new(r"(unclosed");
        assert!(matches!(BROKEN.get(), Err(Error::Config(_))));
        assert!(matches!(BROKEN.get(), Err(Error::Config(_))));
    }

    #[test]
    fn test_try_action_for_returns_value() {
        let calls = Cell::new(0);
        let value = try_action_for(
            "ip discovery",
            Duration::from_secs(5),
            RetrySchedule::every(Duration::from_millis(1)),
            || {
                calls.set(calls.get() + 1);
                Ok(if calls.get() < 3 {
                    TimeoutAction::Retry
                } else {
                    TimeoutAction::Done("10.0.0.5")
                })
            },
        )
        .unwrap();

        assert_eq!(value, "10.0.0.5");
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_try_action_for_times_out() {
        let err = try_action_for::<(), _>(
            "ip discovery",
            Duration::from_millis(30),
            RetrySchedule::every(Duration::from_millis(5)),
            || Ok(TimeoutAction::Retry),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[test]
    fn test_try_action_for_propagates_errors() {
        let err = try_action_for::<(), _>(
            "ip discovery",
            Duration::from_secs(5),
            RetrySchedule::every(Duration::from_millis(1)),
            || Err(Error::Ssh("gone".into())),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Ssh(_)));
    }

    #[test]
    fn test_zero_timeout_runs_once() {
        let calls = Cell::new(0);
        let _ = try_action_for::<(), _>(
            "x",
            Duration::ZERO,
            RetrySchedule::every(Duration::from_secs(1)),
            || {
                calls.set(calls.get() + 1);
                Ok(TimeoutAction::Retry)
            },
        );
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_schedule_backs_off() {
        let schedule = RetrySchedule {
            initial: Duration::from_secs(5),
            backoff: Duration::from_secs(30),
        };
        assert_eq!(schedule.interval_after(Duration::from_secs(0)), Duration::from_secs(5));
        assert_eq!(schedule.interval_after(Duration::from_secs(29)), Duration::from_secs(5));
        assert_eq!(schedule.interval_after(Duration::from_secs(31)), Duration::from_secs(30));
    }

    #[test]
    fn test_parse_ip_brief_output() {
        let output = "\
enp0s3           UP             10.0.2.15/24 metric 100
enp0s8           UP             192.168.56.10/24
br-lan           DOWN           172.17.0.1/16 \n";

        let addrs = parse_ipv4_addresses(output).unwrap();
        assert_eq!(
            addrs,
            vec![
                Ipv4Addr::new(10, 0, 2, 15),
                Ipv4Addr::new(192, 168, 56, 10),
                Ipv4Addr::new(172, 17, 0, 1),
            ]
        );
        assert!(parse_ipv4_addresses("").unwrap().is_empty());
        assert!(parse_ipv4_addresses("eth0 UP 999.1.1.1/24").unwrap().is_empty());
    }
}
