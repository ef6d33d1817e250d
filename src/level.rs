//! Severity levels
//!
//! Levels are totally ordered; a level acts as a filter key (per subsystem and
//! per sink), a color key for the terminal sink, and an expiry key for retry
//! queues.

use std::fmt;
use std::str::FromStr;

/// Severity of a log event, ordered from least to most severe.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    Finest,
    Finer,
    Fine,
    Config,
    Info,
    Warning,
    Severe,
}

/// Minimum level compiled into this build.
///
/// Selected through the `min-level-*` cargo features; the most severe enabled
/// feature wins. The [`log!`](crate::log) macro compares against this constant
/// in a branch the compiler folds away, so call sites below the threshold cost
/// nothing at run time.
#[cfg(feature = "min-level-severe")]
pub const STATIC_MIN_LEVEL: Level = Level::Severe;
#[cfg(all(feature = "min-level-warning", not(feature = "min-level-severe")))]
pub const STATIC_MIN_LEVEL: Level = Level::Warning;
#[cfg(all(
    feature = "min-level-info",
    not(any(feature = "min-level-warning", feature = "min-level-severe"))
))]
pub const STATIC_MIN_LEVEL: Level = Level::Info;
#[cfg(all(
    feature = "min-level-config",
    not(any(
        feature = "min-level-info",
        feature = "min-level-warning",
        feature = "min-level-severe"
    ))
))]
pub const STATIC_MIN_LEVEL: Level = Level::Config;
#[cfg(all(
    feature = "min-level-fine",
    not(any(
        feature = "min-level-config",
        feature = "min-level-info",
        feature = "min-level-warning",
        feature = "min-level-severe"
    ))
))]
pub const STATIC_MIN_LEVEL: Level = Level::Fine;
#[cfg(all(
    feature = "min-level-finer",
    not(any(
        feature = "min-level-fine",
        feature = "min-level-config",
        feature = "min-level-info",
        feature = "min-level-warning",
        feature = "min-level-severe"
    ))
))]
pub const STATIC_MIN_LEVEL: Level = Level::Finer;
#[cfg(not(any(
    feature = "min-level-finer",
    feature = "min-level-fine",
    feature = "min-level-config",
    feature = "min-level-info",
    feature = "min-level-warning",
    feature = "min-level-severe"
)))]
pub const STATIC_MIN_LEVEL: Level = Level::Finest;

impl Level {
    /// All levels, least severe first.
    pub fn all() -> [Level; 7] {
        [
            Level::Finest,
            Level::Finer,
            Level::Fine,
            Level::Config,
            Level::Info,
            Level::Warning,
            Level::Severe,
        ]
    }

    /// The lower-case display name.
    pub fn name(self) -> &'static str {
        match self {
            Level::Finest => "finest",
            Level::Finer => "finer",
            Level::Fine => "fine",
            Level::Config => "config",
            Level::Info => "info",
            Level::Warning => "warning",
            Level::Severe => "severe",
        }
    }

    /// The tag published to the message broker: upper-case, no whitespace.
    pub fn broker_tag(self) -> &'static str {
        match self {
            Level::Finest => "FINEST",
            Level::Finer => "FINER",
            Level::Fine => "FINE",
            Level::Config => "CONFIG",
            Level::Info => "INFO",
            Level::Warning => "WARNING",
            Level::Severe => "SEVERE",
        }
    }

    pub(crate) fn from_index(index: u8) -> Level {
        match index {
            0 => Level::Finest,
            1 => Level::Finer,
            2 => Level::Fine,
            3 => Level::Config,
            4 => Level::Info,
            5 => Level::Warning,
            _ => Level::Severe,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A level name that did not match any known level.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown level name: {0:?}")]
pub struct UnknownLevelName(pub String);

impl FromStr for Level {
    type Err = UnknownLevelName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Level::all()
            .into_iter()
            .find(|l| l.name() == s)
            .ok_or_else(|| UnknownLevelName(s.to_owned()))
    }
}
