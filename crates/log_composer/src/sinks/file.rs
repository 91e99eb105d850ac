//! Rolling file output.

use std::path::Path;

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::Layer;

use super::{BoxedLayer, BuiltSink, SinkBuildContext, SinkGuard, SinkKind};
use crate::{
    LoggerError,
    formatter::{JsonFormattingLayer, MakeWriterLines, TemplateFormattingLayer},
    level::LogLevel,
    template::OutputTemplate,
};

/// Number of rolled files kept by default.
const DEFAULT_RETAINED_FILE_COUNT_LIMIT: usize = 31;

/// How often a new log file is started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RollingInterval {
    /// A single file that is never rolled.
    #[default]
    Infinite,

    /// A new file every day.
    Day,

    /// A new file every hour.
    Hour,

    /// A new file every minute.
    Minute,
}

impl RollingInterval {
    fn rotation(self) -> Rotation {
        match self {
            Self::Infinite => Rotation::NEVER,
            Self::Day => Rotation::DAILY,
            Self::Hour => Rotation::HOURLY,
            Self::Minute => Rotation::MINUTELY,
        }
    }
}

/// Output format of the file sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FileLogFormat {
    /// One line per event, rendered with the output template.
    #[default]
    Template,

    /// Compact, single-line JSON format.
    CompactJson,
}

/// Configuration of the file sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSinkOptions {
    /// Path of the log file. When rolling, the date is inserted between the file stem and the
    /// extension, e.g. `logs/app.2024-05-01.log`.
    pub path: String,

    /// Minimum level written to the file.
    pub minimum_level: LogLevel,

    /// Output template replacing the pipeline template for this sink.
    pub output_template: Option<String>,

    /// Output format. Defaults to [`FileLogFormat::Template`].
    pub format: FileLogFormat,

    /// How often a new file is started. Defaults to [`RollingInterval::Infinite`].
    pub rolling_interval: RollingInterval,

    /// Maximum number of rolled files to keep. If `None`, all files are kept.
    /// Defaults to 31. Ignored when the file is never rolled.
    pub retained_file_count_limit: Option<usize>,

    /// Whether lines are handed to a background writer instead of being written on the
    /// logging thread.
    pub buffered: bool,

    /// [`EnvFilter`](tracing_subscriber::EnvFilter) directive specific to the file,
    /// overriding the pipeline directive.
    pub filtering_directive: Option<String>,
}

impl FileSinkOptions {
    /// File sink options for `path`, everything else at its default.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            minimum_level: LogLevel::default(),
            output_template: None,
            format: FileLogFormat::default(),
            rolling_interval: RollingInterval::default(),
            retained_file_count_limit: Some(DEFAULT_RETAINED_FILE_COUNT_LIMIT),
            buffered: false,
            filtering_directive: None,
        }
    }

    /// Sets the minimum level written to the file.
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
    pub fn with_format(mut self, format: FileLogFormat) -> Self {
        self.format = format;
        self
    }

    /// Sets the rolling interval.
    #[must_use]
    pub fn with_rolling_interval(mut self, interval: RollingInterval) -> Self {
        self.rolling_interval = interval;
        self
    }

    /// Sets the number of rolled files to keep.
    #[must_use]
    pub fn with_retained_file_count_limit(mut self, limit: Option<usize>) -> Self {
        self.retained_file_count_limit = limit;
        self
    }

    /// Hands lines to a background writer.
    #[must_use]
    pub fn with_buffered(mut self, buffered: bool) -> Self {
        self.buffered = buffered;
        self
    }

    /// Sets the file filtering directive.
    #[must_use]
    pub fn with_filtering_directive(mut self, directive: impl Into<String>) -> Self {
        self.filtering_directive = Some(directive.into());
        self
    }
}

/// Directory, file name prefix and optional file name suffix of a log file path.
fn split_path(path: &str) -> Result<(&Path, String, Option<String>), LoggerError> {
    let path = Path::new(path);
    let file_name_error = || {
        LoggerError::Configuration(format!(
            "the {} sink path `{}` does not name a file",
            SinkKind::File,
            path.display()
        ))
    };

    let stem = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.is_empty())
        .ok_or_else(file_name_error)?;
    let extension = path
        .extension()
        .and_then(|extension| extension.to_str())
        .map(ToString::to_string);
    let directory = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    Ok((directory, stem.to_string(), extension))
}

pub(super) fn build(
    options: &FileSinkOptions,
    context: &SinkBuildContext<'_>,
    template: OutputTemplate,
) -> Result<BuiltSink, LoggerError> {
    let filter = context.filter(options.filtering_directive.as_deref(), options.minimum_level)?;
    let (directory, prefix, suffix) = split_path(&options.path)?;

    let mut file_appender_builder = RollingFileAppender::builder()
        .rotation(options.rolling_interval.rotation())
        .filename_prefix(prefix);

    if let Some(suffix) = suffix {
        file_appender_builder = file_appender_builder.filename_suffix(suffix);
    }

    if options.rolling_interval != RollingInterval::Infinite {
        if let Some(max_log_files) = options.retained_file_count_limit {
            file_appender_builder = file_appender_builder.max_log_files(max_log_files);
        }
    }

    let file_appender = file_appender_builder.build(directory)?;
    let events = context.events.clone();
    let mut guards = Vec::new();

    let layer: BoxedLayer = if options.buffered {
        let (non_blocking_appender, guard) = tracing_appender::non_blocking(file_appender);
        guards.push(SinkGuard::from(guard));
        file_layer(
            options,
            events,
            &template,
            MakeWriterLines(non_blocking_appender),
        )
        .with_filter(filter)
        .boxed()
    } else {
        file_layer(options, events, &template, MakeWriterLines(file_appender))
            .with_filter(filter)
            .boxed()
    };

    Ok(BuiltSink {
        layer,
        guards,
        template,
    })
}

/// The formatting layer for the configured format, not yet filtered.
fn file_layer<W>(
    options: &FileSinkOptions,
    events: std::sync::Arc<crate::event::EventContext>,
    template: &OutputTemplate,
    writer: MakeWriterLines<W>,
) -> BoxedLayer
where
    W: for<'a> tracing_subscriber::fmt::MakeWriter<'a> + Send + Sync + 'static,
{
    match options.format {
        FileLogFormat::Template => {
            TemplateFormattingLayer::new(events, options.minimum_level, template.clone(), writer)
                .boxed()
        }
        FileLogFormat::CompactJson => JsonFormattingLayer::new(
            events,
            options.minimum_level,
            writer,
            serde_json::ser::CompactFormatter,
        )
        .boxed(),
    }
}
