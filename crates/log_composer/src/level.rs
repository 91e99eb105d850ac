//! Severity levels understood by the pipeline and their mapping onto [`tracing::Level`].

use std::{fmt, str::FromStr};

use tracing::level_filters::LevelFilter;

/// Severity of a log event, from most to least verbose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum LogLevel {
    /// Tracing information and debugging minutiae.
    #[default]
    Verbose,

    /// Internal control flow and diagnostic state dumps.
    Debug,

    /// Interesting events in the normal flow of the application.
    Information,

    /// Suspicious or degraded conditions.
    Warning,

    /// A failure of the current activity.
    Error,

    /// A failure that requires immediate attention, usually before the process stops.
    Fatal,
}

impl LogLevel {
    /// All levels, in ascending order of severity.
    pub const ALL: [Self; 6] = [
        Self::Verbose,
        Self::Debug,
        Self::Information,
        Self::Warning,
        Self::Error,
        Self::Fatal,
    ];

    /// Full name of the level, e.g. `Information`.
    pub fn name(self) -> &'static str {
        match self {
            Self::Verbose => "Verbose",
            Self::Debug => "Debug",
            Self::Information => "Information",
            Self::Warning => "Warning",
            Self::Error => "Error",
            Self::Fatal => "Fatal",
        }
    }

    /// Three-letter upper-case abbreviation, e.g. `INF`.
    pub fn abbreviation(self) -> &'static str {
        match self {
            Self::Verbose => "VRB",
            Self::Debug => "DBG",
            Self::Information => "INF",
            Self::Warning => "WRN",
            Self::Error => "ERR",
            Self::Fatal => "FTL",
        }
    }

    /// The [`tracing::Level`] events of this level are emitted at.
    ///
    /// `tracing` has no level above `ERROR`, so fatal events are emitted at `ERROR` and carry
    /// the `fatal` field instead.
    pub fn as_tracing_level(self) -> tracing::Level {
        match self {
            Self::Verbose => tracing::Level::TRACE,
            Self::Debug => tracing::Level::DEBUG,
            Self::Information => tracing::Level::INFO,
            Self::Warning => tracing::Level::WARN,
            Self::Error | Self::Fatal => tracing::Level::ERROR,
        }
    }

    /// The least verbose [`LevelFilter`] that still lets events of this level through.
    pub fn as_level_filter(self) -> LevelFilter {
        LevelFilter::from_level(self.as_tracing_level())
    }

    /// Maps a [`tracing::Level`] back, with `fatal` set when the event carried `fatal = true`.
    pub fn from_tracing_level(level: tracing::Level, fatal: bool) -> Self {
        if level == tracing::Level::TRACE {
            Self::Verbose
        } else if level == tracing::Level::DEBUG {
            Self::Debug
        } else if level == tracing::Level::INFO {
            Self::Information
        } else if level == tracing::Level::WARN {
            Self::Warning
        } else if fatal {
            Self::Fatal
        } else {
            Self::Error
        }
    }

    /// Renders the level according to a template format specifier.
    ///
    /// Supported formats are `u` (upper case), `w` (lower case) and `t` (title case), each
    /// optionally followed by a width. A width of 3 selects the standard abbreviation; any other
    /// width truncates the full name. Unknown formats render the full name.
    pub(crate) fn render(self, format: Option<&str>) -> String {
        let Some(format) = format else {
            return self.name().to_string();
        };

        let mut chars = format.chars();
        let case = chars.next();
        let width = chars.as_str().parse::<usize>().ok();

        let base = match width {
            Some(3) => self.abbreviation().to_string(),
            Some(width) => self.name().chars().take(width).collect(),
            None => self.name().to_string(),
        };

        match case {
            Some('u') => base.to_uppercase(),
            Some('w') => base.to_lowercase(),
            Some('t') => {
                let lower = base.to_lowercase();
                let mut chars = lower.chars();
                chars
                    .next()
                    .map(|first| first.to_uppercase().chain(chars).collect())
                    .unwrap_or_default()
            }
            _ => self.name().to_string(),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error returned when a string does not name a [`LogLevel`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown log level `{0}`")]
pub struct ParseLevelError(String);

impl FromStr for LogLevel {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|level| {
                level.name().eq_ignore_ascii_case(s) || level.abbreviation().eq_ignore_ascii_case(s)
            })
            .ok_or_else(|| ParseLevelError(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_ordered_by_severity() {
        assert!(LogLevel::Verbose < LogLevel::Debug);
        assert!(LogLevel::Error < LogLevel::Fatal);
        assert_eq!(LogLevel::default(), LogLevel::Verbose);
    }

    #[test]
    fn renders_template_formats() {
        assert_eq!(LogLevel::Information.render(Some("u3")), "INF");
        assert_eq!(LogLevel::Warning.render(Some("w3")), "wrn");
        assert_eq!(LogLevel::Fatal.render(Some("t3")), "Ftl");
        assert_eq!(LogLevel::Error.render(Some("u")), "ERROR");
        assert_eq!(LogLevel::Debug.render(Some("w")), "debug");
        assert_eq!(LogLevel::Information.render(Some("u4")), "INFO");
        assert_eq!(LogLevel::Verbose.render(None), "Verbose");
        assert_eq!(LogLevel::Verbose.render(Some("x")), "Verbose");
    }

    #[test]
    fn fatal_round_trips_through_tracing_error_level() {
        let level = LogLevel::Fatal.as_tracing_level();
        assert_eq!(level, tracing::Level::ERROR);
        assert_eq!(LogLevel::from_tracing_level(level, true), LogLevel::Fatal);
        assert_eq!(LogLevel::from_tracing_level(level, false), LogLevel::Error);
    }

    #[test]
    fn parses_names_and_abbreviations() {
        assert_eq!("information".parse::<LogLevel>(), Ok(LogLevel::Information));
        assert_eq!("WRN".parse::<LogLevel>(), Ok(LogLevel::Warning));
        assert!("loud".parse::<LogLevel>().is_err());
    }
}
