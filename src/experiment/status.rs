//! Experiment status.
//!
//! Named variants internally, a stable integer code on the wire:
//!
//! | variant       | code |
//! |---------------|------|
//! | `not_started` | 0    |
//! | `running`     | 1    |
//! | `stopped`     | 2    |
//! | `error`       | 3    |

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of one experiment or jig.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Status {
    /// No run since the process started.
    #[default]
    NotStarted = 0,
    /// The loop is pulsing on schedule.
    Running = 1,
    /// Terminal until the next explicit start.
    Stopped = 2,
    /// Non-terminal: the loop backs off and returns to `Running`.
    Error = 3,
}

impl Status {
    /// Integer code used in API responses.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Inverse of [`code`](Self::code).
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Status::NotStarted),
            1 => Some(Status::Running),
            2 => Some(Status::Stopped),
            3 => Some(Status::Error),
            _ => None,
        }
    }

    /// Wire name, e.g. `not_started`.
    pub fn as_str(self) -> &'static str {
        match self {
            Status::NotStarted => "not_started",
            Status::Running => "running",
            Status::Stopped => "stopped",
            Status::Error => "error",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
