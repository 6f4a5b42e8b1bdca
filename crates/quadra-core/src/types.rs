//! Value objects shared across the job engine.

use std::fmt::{self, Display};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

/// Value object: registered job type name (e.g. `components:sync`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobName(pub String);

impl JobName {
    /// Create a job name from anything string-like
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Borrow the underlying string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for JobName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Value object: named queue a job is processed on
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueName(pub String);

impl QueueName {
    /// Create a queue name from anything string-like
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Borrow the underlying string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Value object: unique job instance identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a fresh random job id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the underlying string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Academic term scope: year plus term number, rendered `"<year>:<term>"`.
///
/// Every natural key and every sync lock is scoped by a season so runs
/// for different terms never contend with each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Season {
    /// Calendar year
    pub year: u16,
    /// Term number within the year (1-based)
    pub term: u8,
}

impl Season {
    /// Create a season
    pub fn new(year: u16, term: u8) -> Self {
        Self { year, term }
    }
}

impl Display for Season {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.year, self.term)
    }
}

impl FromStr for Season {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (year, term) = s
            .split_once(':')
            .ok_or_else(|| CoreError::Other(format!("Invalid season format: {}", s)))?;
        let year = year
            .parse::<u16>()
            .map_err(|e| CoreError::Other(format!("Invalid season year in {}: {}", s, e)))?;
        let term = term
            .parse::<u8>()
            .map_err(|e| CoreError::Other(format!("Invalid season term in {}: {}", s, e)))?;
        Ok(Self { year, term })
    }
}

/// Job instance state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Ready to be claimed by a worker
    Waiting,

    /// Scheduled for a later promotion to `Waiting`
    Delayed,

    /// Claimed by a worker, handler executing
    Active,

    /// Parent of a flow, barred until every child is terminal
    WaitingChildren,

    /// Finished successfully
    Completed,

    /// Attempts exhausted or fatal handler failure
    Failed,
}

impl JobState {
    /// Whether the state is terminal (no further transitions)
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::WaitingChildren => "waiting_children",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Retry backoff strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay before every retry
    Fixed(Duration),

    /// Delay doubles per attempt, starting from `base`
    Exponential {
        /// Delay before the first retry
        base: Duration,
    },
}

/// Retries never wait longer than this regardless of strategy
const MAX_BACKOFF: Duration = Duration::from_secs(5 * 60);

impl Backoff {
    /// Delay to apply before retrying after the given attempt (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Fixed(delay) => *delay,
            Backoff::Exponential { base } => {
                let shift = attempt.saturating_sub(1).min(16);
                let delay = base.saturating_mul(1u32 << shift);
                delay.min(MAX_BACKOFF)
            }
        }
    }
}

/// What the backend does with a job record once it reaches a terminal
/// state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Keep the record indefinitely
    Keep,

    /// Drop the record immediately
    Remove,

    /// Keep only the most recent N terminal records for the same
    /// queue and job name
    KeepLast(usize),
}

/// Per-definition execution options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOptions {
    /// Maximum attempts before the job is marked failed
    pub max_attempts: u32,

    /// Backoff between attempts
    pub backoff: Backoff,

    /// Retention after successful completion
    pub remove_on_complete: RetentionPolicy,

    /// Retention after terminal failure
    pub remove_on_fail: RetentionPolicy,

    /// Wall-clock budget for a single attempt; expiry counts as a
    /// retryable failure
    pub attempt_timeout: Duration,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Exponential {
                base: Duration::from_secs(1),
            },
            remove_on_complete: RetentionPolicy::KeepLast(100),
            remove_on_fail: RetentionPolicy::Keep,
            attempt_timeout: Duration::from_secs(5 * 60),
        }
    }
}

/// Recurring schedule attached to a job definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    /// Standard cron expression (seconds field included)
    Cron(String),

    /// Fixed interval between dispatches
    Every(Duration),
}

impl Schedule {
    /// Validate the schedule; cron expressions are parsed eagerly so a
    /// bad expression is a registration-time error, not a runtime one
    pub fn validate(&self, job_name: &JobName) -> Result<(), CoreError> {
        match self {
            Schedule::Cron(expr) => {
                cron::Schedule::from_str(expr).map_err(|e| CoreError::InvalidSchedule {
                    name: job_name.to_string(),
                    reason: e.to_string(),
                })?;
                Ok(())
            }
            Schedule::Every(interval) => {
                if interval.is_zero() {
                    return Err(CoreError::InvalidSchedule {
                        name: job_name.to_string(),
                        reason: "interval must be non-zero".to_string(),
                    });
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_season_round_trip() {
        let season = Season::new(2024, 3);
        assert_eq!(season.to_string(), "2024:3");
        assert_eq!("2024:3".parse::<Season>().unwrap(), season);
    }

    #[test]
    fn test_season_rejects_garbage() {
        assert!("2024".parse::<Season>().is_err());
        assert!("year:3".parse::<Season>().is_err());
        assert!("2024:term".parse::<Season>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Waiting.is_terminal());
        assert!(!JobState::Active.is_terminal());
        assert!(!JobState::WaitingChildren.is_terminal());
        assert!(!JobState::Delayed.is_terminal());
    }

    #[test]
    fn test_fixed_backoff() {
        let backoff = Backoff::Fixed(Duration::from_secs(10));
        assert_eq!(backoff.delay_for(1), Duration::from_secs(10));
        assert_eq!(backoff.delay_for(5), Duration::from_secs(10));
    }

    #[test]
    fn test_exponential_backoff_doubles_and_caps() {
        let backoff = Backoff::Exponential {
            base: Duration::from_secs(2),
        };
        assert_eq!(backoff.delay_for(1), Duration::from_secs(2));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(4));
        assert_eq!(backoff.delay_for(3), Duration::from_secs(8));
        assert_eq!(backoff.delay_for(30), MAX_BACKOFF);
    }

    #[test]
    fn test_schedule_validation() {
        let name = JobName::new("components:sync");
        assert!(Schedule::Cron("0 0 3 * * *".to_string())
            .validate(&name)
            .is_ok());
        assert!(Schedule::Cron("every tuesday".to_string())
            .validate(&name)
            .is_err());
        assert!(Schedule::Every(Duration::from_secs(60))
            .validate(&name)
            .is_ok());
        assert!(Schedule::Every(Duration::ZERO).validate(&name).is_err());
    }

    #[test]
    fn test_job_state_serde_names() {
        assert_eq!(
            serde_json::to_string(&JobState::WaitingChildren).unwrap(),
            "\"waiting_children\""
        );
        assert_eq!(
            serde_json::from_str::<JobState>("\"delayed\"").unwrap(),
            JobState::Delayed
        );
    }
}
