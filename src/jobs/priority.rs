//! Job priorities and the outranking relation that orders the run queue.

use super::error::JobError;
use super::job::Job;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Priority of a queued job.
///
/// Symbolic levels are ordered `immediate > next > superior > normal > inferior > on-idle`.
/// `Level(n)` is a numeric priority placed on the same scale as `normal`, which counts as `0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "PriorityRepr", into = "PriorityRepr")]
pub enum Priority {
    Immediate,
    Next,
    Superior,
    #[default]
    Normal,
    Inferior,
    OnIdle,
    Level(i64),
}

impl Priority {
    /// Position on the signed scale used for `superior`/`normal`/`inferior`/numeric comparisons.
    fn scale(&self) -> Option<i64> {
        match self {
            Priority::Normal => Some(0),
            Priority::Level(n) => Some(*n),
            _ => None,
        }
    }

    /// Whether two priorities sit on the same level (`normal` and `Level(0)` do).
    pub fn same_level(&self, other: &Priority) -> bool {
        match (self.scale(), other.scale()) {
            (Some(a), Some(b)) => a == b,
            _ => self == other,
        }
    }

    /// Returns true when a job with this priority must be placed ahead of a job with `other`.
    ///
    /// Equal levels never outrank each other, which keeps the queue FIFO within a level.
    pub fn outranks(&self, other: &Priority) -> bool {
        use Priority::*;

        if self.same_level(other) {
            return false;
        }
        match (self, other) {
            (Immediate, _) => true,
            (Next, b) => *b != Immediate,
            (OnIdle, _) => false,
            (_, Immediate | Next) => false,
            (_, OnIdle) => true,
            (Superior, _) => true,
            (_, Superior) => false,
            (Inferior, _) => false,
            (_, Inferior) => true,
            (a, b) => match (a.scale(), b.scale()) {
                (Some(a), Some(b)) => a > b,
                _ => false,
            },
        }
    }

    pub fn as_str(&self) -> String {
        match self {
            Priority::Immediate => "immediate".to_string(),
            Priority::Next => "next".to_string(),
            Priority::Superior => "superior".to_string(),
            Priority::Normal => "normal".to_string(),
            Priority::Inferior => "inferior".to_string(),
            Priority::OnIdle => "on-idle".to_string(),
            Priority::Level(n) => n.to_string(),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str())
    }
}

impl FromStr for Priority {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "immediate" => Ok(Priority::Immediate),
            "next" => Ok(Priority::Next),
            "superior" => Ok(Priority::Superior),
            "normal" => Ok(Priority::Normal),
            "inferior" => Ok(Priority::Inferior),
            "on-idle" | "on_idle" | "onidle" => Ok(Priority::OnIdle),
            other => other
                .parse::<i64>()
                .map(Priority::Level)
                .map_err(|_| JobError::InvalidPriority(s.to_string())),
        }
    }
}

/// Wire form of a priority: either a symbolic name or an integer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum PriorityRepr {
    Number(i64),
    Name(String),
}

impl TryFrom<PriorityRepr> for Priority {
    type Error = JobError;

    fn try_from(repr: PriorityRepr) -> Result<Self, Self::Error> {
        match repr {
            PriorityRepr::Number(n) => Ok(Priority::Level(n)),
            PriorityRepr::Name(name) => name.parse(),
        }
    }
}

impl From<Priority> for PriorityRepr {
    fn from(priority: Priority) -> Self {
        match priority {
            Priority::Level(n) => PriorityRepr::Number(n),
            other => PriorityRepr::Name(other.as_str()),
        }
    }
}

/// Inserts `job` before the first queued job it strictly outranks, or appends it. The head of
/// the queue is the next job to run.
pub(crate) fn insert_by_priority(queue: &mut VecDeque<Arc<Job>>, job: Arc<Job>) {
    let priority = job.priority();
    let position = queue
        .iter()
        .position(|queued| priority.outranks(&queued.priority()))
        .unwrap_or(queue.len());
    queue.insert(position, job);
}
