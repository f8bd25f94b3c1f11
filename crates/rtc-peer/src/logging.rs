//! Tracing subscriber setup
//!
//! Verbosity levels follow the classic binding convention: 0 disables
//! logging, 1 errors, 2 warnings, 3 info (default), 4 and above trace.
//! `RUST_LOG` always wins when it is set.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Trace,
}

impl Verbosity {
    /// Map a numeric level onto a verbosity
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => Verbosity::Off,
            1 => Verbosity::Error,
            2 => Verbosity::Warn,
            3 => Verbosity::Info,
            _ => Verbosity::Trace,
        }
    }

    /// Filter directive used when `RUST_LOG` is not set
    pub fn directive(&self) -> &'static str {
        match self {
            Verbosity::Off => "off",
            Verbosity::Error => "error",
            Verbosity::Warn => "warn",
            Verbosity::Info => "info",
            Verbosity::Trace => "trace",
        }
    }
}

/// Install a global fmt subscriber.
///
/// Returns `false` when a subscriber was already installed, which makes the
/// call safe to repeat.
pub fn init_logging(verbosity: Verbosity) -> bool {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity.directive()));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_level() {
        assert_eq!(Verbosity::from_level(0), Verbosity::Off);
        assert_eq!(Verbosity::from_level(2), Verbosity::Warn);
        assert_eq!(Verbosity::from_level(3), Verbosity::Info);
        assert_eq!(Verbosity::from_level(9), Verbosity::Trace);
        assert_eq!(Verbosity::default(), Verbosity::Info);
    }

    #[test]
    fn test_init_is_repeatable() {
        let _ = init_logging(Verbosity::Warn);
        assert!(!init_logging(Verbosity::Warn));
    }
}
