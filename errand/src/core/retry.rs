use crate::core::{DateTime, Duration};
use std::fmt;
use std::str::FromStr;

/// How long to wait before the next attempt. `n` below is the attempt count of the run that
/// just failed, starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Always wait `base`.
    Constant(Duration),
    /// Wait `base * n`.
    Linear(Duration),
    /// Wait `base * 2^(n - 1)`.
    Exponential(Duration),
}

impl Backoff {
    /// Build a strategy from its configuration name (`constant`, `linear`, `exponential`).
    /// Negative bases are rejected.
    pub fn from_name(name: &str, base: Duration) -> anyhow::Result<Self> {
        if base < Duration::zero() {
            anyhow::bail!("Backoff base must not be negative: {}s", base.num_seconds());
        }
        match name.trim().to_ascii_lowercase().as_str() {
            "constant" | "fixed" => Ok(Backoff::Constant(base)),
            "linear" => Ok(Backoff::Linear(base)),
            "exponential" => Ok(Backoff::Exponential(base)),
            _ => anyhow::bail!("Unknown backoff strategy: {}", name),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Backoff::Constant(_) => "constant",
            Backoff::Linear(_) => "linear",
            Backoff::Exponential(_) => "exponential",
        }
    }

    pub fn base(&self) -> Duration {
        match self {
            Backoff::Constant(base) | Backoff::Linear(base) | Backoff::Exponential(base) => *base,
        }
    }

    pub fn delay(&self, attempt_count: u32) -> Duration {
        let n = attempt_count.max(1);
        let factor: i32 = match self {
            Backoff::Constant(_) => 1,
            Backoff::Linear(_) => i32::try_from(n).unwrap_or(i32::MAX),
            // 2^30 is the largest power that still fits the multiplier
            Backoff::Exponential(_) => 1i32 << (n - 1).min(30),
        };
        self.base()
            .checked_mul(factor)
            .unwrap_or_else(|| Duration::days(365))
    }
}

impl fmt::Display for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}s)", self.name(), self.base().num_seconds())
    }
}

/// Outcome of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    RetryScheduled { next_run_at: DateTime },
    Dead,
}

/// Decides between another attempt and the dead set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt. `1` means at most two runs in total.
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            backoff: Backoff::Exponential(Duration::seconds(5)),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Backoff) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// A policy that sends every failure straight to the dead set.
    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// `attempt_count` is the count stamped by the claim that just failed.
    pub fn decide(&self, attempt_count: u32, now: DateTime) -> FailureOutcome {
        if attempt_count > self.max_retries {
            FailureOutcome::Dead
        } else {
            // Far-future retries saturate instead of overflowing the timestamp.
            let next_run_at = now
                .checked_add_signed(self.backoff.delay(attempt_count))
                .unwrap_or(DateTime::MAX_UTC);
            FailureOutcome::RetryScheduled { next_run_at }
        }
    }
}

impl FromStr for Backoff {
    type Err = anyhow::Error;

    /// Parses `name` or `name:seconds`, e.g. `exponential:5`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, secs) = match s.split_once(':') {
            Some((name, secs)) => (name, secs.trim().parse::<i64>()?),
            None => (s, 5),
        };
        Backoff::from_name(name, Duration::seconds(secs))
    }
}
