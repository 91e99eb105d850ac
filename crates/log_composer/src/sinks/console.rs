//! Console output: standard output, with events at or above a configurable level optionally
//! redirected to standard error.

use std::io::{IsTerminal, Write};

use tracing_appender::non_blocking::NonBlocking;
use tracing_subscriber::{Layer, fmt::MakeWriter};

use super::{BoxedLayer, BuiltSink, SinkBuildContext, SinkGuard};
use crate::{
    LoggerError,
    formatter::{JsonFormattingLayer, LineWriter, TemplateFormattingLayer},
    level::LogLevel,
    template::OutputTemplate,
};

/// Defines the output format for console logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConsoleLogFormat {
    /// One line per event, rendered with the output template.
    #[default]
    Template,

    /// Compact, single-line JSON format.
    CompactJson,

    /// Pretty-printed, multi-line JSON format.
    PrettyJson,
}

/// Coloring of template output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConsoleTheme {
    /// Plain text.
    None,

    /// Lines colored by level with ANSI escape sequences.
    #[default]
    Ansi,
}

/// Configuration of the console sink.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsoleSinkOptions {
    /// Minimum level written to the console. Defaults to [`LogLevel::Verbose`], leaving the
    /// decision to the pipeline's minimum level.
    pub minimum_level: LogLevel,

    /// Output template replacing the pipeline template for this sink.
    pub output_template: Option<String>,

    /// Output format. Defaults to [`ConsoleLogFormat::Template`].
    pub format: ConsoleLogFormat,

    /// Events at or above this level go to standard error instead of standard output.
    /// If `None`, everything goes to standard output.
    pub standard_error_from_level: Option<LogLevel>,

    /// Coloring of template output. Defaults to [`ConsoleTheme::Ansi`], applied only when
    /// standard output is a terminal unless `apply_theme_to_redirected_output` is set.
    pub theme: ConsoleTheme,

    /// Whether the theme is applied when the output is not a terminal.
    pub apply_theme_to_redirected_output: bool,

    /// [`EnvFilter`](tracing_subscriber::EnvFilter) directive specific to the console,
    /// overriding the pipeline directive.
    pub filtering_directive: Option<String>,
}

impl ConsoleSinkOptions {
    /// Sets the minimum level written to the console.
    #[must_use]
    pub fn with_minimum_level(mut self, level: LogLevel) -> Self {
        self.minimum_level = level;
        self
    }

    /// Replaces the pipeline template for this sink.
    #[must_use]
    pub fn with_output_template(mut self, template: impl Into<String>) -> Self {
        self.output_template = Some(template.into());
        self
    }

    /// Sets the output format.
    #[must_use]
    pub fn with_format(mut self, format: ConsoleLogFormat) -> Self {
        self.format = format;
        self
    }

    /// Redirects events at or above `level` to standard error.
    #[must_use]
    pub fn with_standard_error_from_level(mut self, level: LogLevel) -> Self {
        self.standard_error_from_level = Some(level);
        self
    }

    /// Sets the theme, and whether it applies to redirected output.
    #[must_use]
    pub fn with_theme(mut self, theme: ConsoleTheme, apply_to_redirected_output: bool) -> Self {
        self.theme = theme;
        self.apply_theme_to_redirected_output = apply_to_redirected_output;
        self
    }

    /// Sets the console filtering directive.
    #[must_use]
    pub fn with_filtering_directive(mut self, directive: impl Into<String>) -> Self {
        self.filtering_directive = Some(directive.into());
        self
    }
}

/// Writes lines to standard output or standard error by level.
#[derive(Debug)]
struct ConsoleWriter {
    stdout: NonBlocking,
    stderr: Option<(LogLevel, NonBlocking)>,
    colored: bool,
}

impl ConsoleWriter {
    fn target(&self, level: LogLevel) -> NonBlocking {
        match &self.stderr {
            Some((from_level, stderr)) if level >= *from_level => stderr.make_writer(),
            _ => self.stdout.make_writer(),
        }
    }
}

impl LineWriter for ConsoleWriter {
    fn write_line(&self, level: LogLevel, line: &[u8]) -> std::io::Result<()> {
        let mut writer = self.target(level);
        if self.colored {
            writer.write_all(&colorize(level, line))
        } else {
            writer.write_all(line)
        }
    }
}

fn color(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Verbose => "\x1b[90m",
        LogLevel::Debug => "\x1b[37m",
        LogLevel::Information => "\x1b[97m",
        LogLevel::Warning => "\x1b[33m",
        LogLevel::Error => "\x1b[31m",
        LogLevel::Fatal => "\x1b[1;31m",
    }
}

/// Wraps `line` in the color of `level`, keeping the line break outside the colored span.
fn colorize(level: LogLevel, line: &[u8]) -> Vec<u8> {
    let (body, line_break) = match line.strip_suffix(b"\n") {
        Some(body) => (body, &b"\n"[..]),
        None => (line, &b""[..]),
    };

    let mut colored = Vec::with_capacity(line.len() + 16);
    colored.extend_from_slice(color(level).as_bytes());
    colored.extend_from_slice(body);
    colored.extend_from_slice(b"\x1b[0m");
    colored.extend_from_slice(line_break);
    colored
}

pub(super) fn build(
    options: &ConsoleSinkOptions,
    context: &SinkBuildContext<'_>,
    template: OutputTemplate,
) -> Result<BuiltSink, LoggerError> {
    let filter = context.filter(options.filtering_directive.as_deref(), options.minimum_level)?;

    let mut guards = Vec::new();
    let (stdout, guard) = tracing_appender::non_blocking(std::io::stdout());
    guards.push(SinkGuard::from(guard));

    let stderr = options.standard_error_from_level.map(|level| {
        let (stderr, guard) = tracing_appender::non_blocking(std::io::stderr());
        guards.push(SinkGuard::from(guard));
        (level, stderr)
    });

    let colored = options.format == ConsoleLogFormat::Template
        && options.theme == ConsoleTheme::Ansi
        && (options.apply_theme_to_redirected_output || std::io::stdout().is_terminal());

    let writer = ConsoleWriter {
        stdout,
        stderr,
        colored,
    };
    let events = context.events.clone();

    let layer: BoxedLayer = match options.format {
        ConsoleLogFormat::Template => {
            TemplateFormattingLayer::new(events, options.minimum_level, template.clone(), writer)
                .with_filter(filter)
                .boxed()
        }
        ConsoleLogFormat::CompactJson => JsonFormattingLayer::new(
            events,
            options.minimum_level,
            writer,
            serde_json::ser::CompactFormatter,
        )
        .with_filter(filter)
        .boxed(),
        ConsoleLogFormat::PrettyJson => JsonFormattingLayer::new(
            events,
            options.minimum_level,
            writer,
            serde_json::ser::PrettyFormatter::new(),
        )
        .with_filter(filter)
        .boxed(),
    };

    Ok(BuiltSink {
        layer,
        guards,
        template,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colorized_lines_keep_the_line_break_last() {
        assert_eq!(
            colorize(LogLevel::Warning, b"WRN careful\n"),
            b"\x1b[33mWRN careful\x1b[0m\n".to_vec()
        );
        assert_eq!(
            colorize(LogLevel::Fatal, b"FTL"),
            b"\x1b[1;31mFTL\x1b[0m".to_vec()
        );
    }

    #[test]
    fn builder_methods_set_the_options() {
        let options = ConsoleSinkOptions::default()
            .with_minimum_level(LogLevel::Warning)
            .with_format(ConsoleLogFormat::CompactJson)
            .with_standard_error_from_level(LogLevel::Error)
            .with_theme(ConsoleTheme::Ansi, true)
            .with_filtering_directive("info");

        assert_eq!(
            options,
            ConsoleSinkOptions {
                minimum_level: LogLevel::Warning,
                output_template: None,
                format: ConsoleLogFormat::CompactJson,
                standard_error_from_level: Some(LogLevel::Error),
                theme: ConsoleTheme::Ansi,
                apply_theme_to_redirected_output: true,
                filtering_directive: Some("info".to_string()),
            }
        );
    }
}
