//! Device reset causes as reported by the `reset_cause` command.

use std::fmt;

/// Reason the device last restarted, as reported by `reset_cause`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetCause {
    HardReset,
    PowerOn,
    Watchdog,
    SoftReset,
    Lockup,
    Brownout,
    Unknown(i64),
}

impl ResetCause {
    pub fn from_code(code: i64) -> Self {
        match code {
            3 => Self::HardReset,
            4 => Self::PowerOn,
            5 => Self::Watchdog,
            6 => Self::SoftReset,
            9 => Self::Lockup,
            11 => Self::Brownout,
            other => Self::Unknown(other),
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            Self::HardReset => 3,
            Self::PowerOn => 4,
            Self::Watchdog => 5,
            Self::SoftReset => 6,
            Self::Lockup => 9,
            Self::Brownout => 11,
            Self::Unknown(code) => *code,
        }
    }
}

impl fmt::Display for ResetCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HardReset => write!(f, "hard reset"),
            Self::PowerOn => write!(f, "power-on"),
            Self::Watchdog => write!(f, "watchdog timeout"),
            Self::SoftReset => write!(f, "soft reset"),
            Self::Lockup => write!(f, "lockup"),
            Self::Brownout => write!(f, "brownout"),
            Self::Unknown(code) => write!(f, "unknown cause {code}"),
        }
    }
}
