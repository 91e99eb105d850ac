//! Sink descriptors: what each output of a pipeline is, and how it turns into a
//! [`tracing_subscriber::Layer`].

mod batching;
mod console;
mod file;
mod relational_table;
mod search_index;
mod streaming_collector;

use std::{fmt, sync::Arc};

use tracing_subscriber::{EnvFilter, Layer, Registry};
use url::Url;

pub use self::{
    console::{ConsoleLogFormat, ConsoleSinkOptions, ConsoleTheme},
    file::{FileLogFormat, FileSinkOptions, RollingInterval},
    relational_table::{RelationalTableSinkOptions, StandardColumn},
    search_index::{EventFailureHandling, SearchIndexSinkOptions},
    streaming_collector::StreamingCollectorSinkOptions,
};
use crate::{LoggerError, event::EventContext, level::LogLevel, template::OutputTemplate};

/// A sink layer, ready to be added to a [`Registry`].
pub(crate) type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// The kinds of sink a pipeline can write to. A pipeline holds at most one sink per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SinkKind {
    /// Standard output, optionally standard error.
    Console,

    /// A rolling log file.
    File,

    /// A search index accepting bulk document uploads.
    SearchIndex,

    /// A log collector ingesting newline-delimited compact JSON events.
    StreamingCollector,

    /// A table of a relational database.
    RelationalTable,
}

impl SinkKind {
    /// The order in which sinks are built and attached to the engine.
    pub const ORDER: [Self; 5] = [
        Self::Console,
        Self::File,
        Self::SearchIndex,
        Self::StreamingCollector,
        Self::RelationalTable,
    ];

    /// Human-readable name of the sink kind.
    pub fn name(self) -> &'static str {
        match self {
            Self::Console => "console",
            Self::File => "file",
            Self::SearchIndex => "search index",
            Self::StreamingCollector => "streaming collector",
            Self::RelationalTable => "relational table",
        }
    }
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything needed to build one sink.
#[derive(Debug, Clone)]
pub enum SinkDescriptor {
    /// See [`ConsoleSinkOptions`].
    Console(ConsoleSinkOptions),

    /// See [`FileSinkOptions`].
    File(FileSinkOptions),

    /// See [`SearchIndexSinkOptions`].
    SearchIndex(SearchIndexSinkOptions),

    /// See [`StreamingCollectorSinkOptions`].
    StreamingCollector(StreamingCollectorSinkOptions),

    /// See [`RelationalTableSinkOptions`].
    RelationalTable(RelationalTableSinkOptions),
}

impl SinkDescriptor {
    /// The kind of sink this descriptor builds.
    pub fn kind(&self) -> SinkKind {
        match self {
            Self::Console(_) => SinkKind::Console,
            Self::File(_) => SinkKind::File,
            Self::SearchIndex(_) => SinkKind::SearchIndex,
            Self::StreamingCollector(_) => SinkKind::StreamingCollector,
            Self::RelationalTable(_) => SinkKind::RelationalTable,
        }
    }

    /// The output template configured on the sink itself, replacing the pipeline template.
    pub fn template_override(&self) -> Option<&str> {
        match self {
            Self::Console(options) => options.output_template.as_deref(),
            Self::File(options) => options.output_template.as_deref(),
            Self::SearchIndex(_) | Self::StreamingCollector(_) | Self::RelationalTable(_) => None,
        }
    }

    /// Builds the sink. `template` is the pipeline template; a template override configured on
    /// the sink takes precedence over it.
    pub(crate) fn build(
        &self,
        context: &SinkBuildContext<'_>,
        template: &OutputTemplate,
    ) -> Result<BuiltSink, LoggerError> {
        let template = match self.template_override() {
            Some(text) => OutputTemplate::parse(text)?,
            None => template.clone(),
        };

        match self {
            Self::Console(options) => console::build(options, context, template),
            Self::File(options) => file::build(options, context, template),
            Self::SearchIndex(options) => search_index::build(options, context, template),
            Self::StreamingCollector(options) => {
                streaming_collector::build(options, context, template)
            }
            Self::RelationalTable(options) => relational_table::build(options, context, template),
        }
    }
}

impl From<ConsoleSinkOptions> for SinkDescriptor {
    fn from(options: ConsoleSinkOptions) -> Self {
        Self::Console(options)
    }
}

impl From<FileSinkOptions> for SinkDescriptor {
    fn from(options: FileSinkOptions) -> Self {
        Self::File(options)
    }
}

impl From<SearchIndexSinkOptions> for SinkDescriptor {
    fn from(options: SearchIndexSinkOptions) -> Self {
        Self::SearchIndex(options)
    }
}

impl From<StreamingCollectorSinkOptions> for SinkDescriptor {
    fn from(options: StreamingCollectorSinkOptions) -> Self {
        Self::StreamingCollector(options)
    }
}

impl From<RelationalTableSinkOptions> for SinkDescriptor {
    fn from(options: RelationalTableSinkOptions) -> Self {
        Self::RelationalTable(options)
    }
}

/// Pipeline-wide inputs shared by every sink build.
#[derive(Debug)]
pub(crate) struct SinkBuildContext<'a> {
    pub(crate) events: &'a Arc<EventContext>,
    pub(crate) filtering_directive: Option<&'a str>,
}

impl SinkBuildContext<'_> {
    /// The [`EnvFilter`] of a sink: its own directive if any, else the pipeline directive, with
    /// everything at or above the effective minimum level enabled by default.
    pub(crate) fn filter(
        &self,
        sink_directive: Option<&str>,
        sink_minimum: LogLevel,
    ) -> Result<EnvFilter, LoggerError> {
        let directive = sink_directive
            .or(self.filtering_directive)
            .unwrap_or_default(); // Using an empty string causes it to use the default directive

        let default_level = self.events.minimum_level().max(sink_minimum);
        Ok(EnvFilter::builder()
            .with_default_directive(default_level.as_level_filter().into())
            .parse(directive)?)
    }
}

/// Keeps a sink's background writer alive; dropping it flushes and stops the writer.
#[derive(Debug)]
pub(crate) enum SinkGuard {
    Appender {
        _guard: tracing_appender::non_blocking::WorkerGuard,
    },
    Batch {
        _guard: batching::BatchWorkerGuard,
    },
}

impl From<tracing_appender::non_blocking::WorkerGuard> for SinkGuard {
    fn from(guard: tracing_appender::non_blocking::WorkerGuard) -> Self {
        Self::Appender { _guard: guard }
    }
}

impl From<batching::BatchWorkerGuard> for SinkGuard {
    fn from(guard: batching::BatchWorkerGuard) -> Self {
        Self::Batch { _guard: guard }
    }
}

/// The result of building a sink.
pub(crate) struct BuiltSink {
    pub(crate) layer: BoxedLayer,
    pub(crate) guards: Vec<SinkGuard>,
    pub(crate) template: OutputTemplate,
}

impl fmt::Debug for BuiltSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuiltSink")
            .field("guards", &self.guards)
            .field("template", &self.template)
            .finish_non_exhaustive()
    }
}

/// Parses the base URL of a remote endpoint. The URL is normalized to end with `/`, so that
/// relative paths joined onto it extend it instead of replacing its last segment.
pub(crate) fn parse_endpoint(sink: SinkKind, text: &str) -> Result<Url, LoggerError> {
    if text.trim().is_empty() {
        return Err(LoggerError::Configuration(format!(
            "the {sink} sink requires an endpoint URL"
        )));
    }

    let mut url = Url::parse(text)?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(LoggerError::Configuration(format!(
            "unsupported scheme `{}` for the {sink} sink endpoint",
            url.scheme()
        )));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_are_normalized_for_joining() {
        let url = parse_endpoint(SinkKind::SearchIndex, "http://localhost:9200/es")
            .expect("URL should parse");

        assert_eq!(url.as_str(), "http://localhost:9200/es/");
        assert_eq!(
            url.join("_bulk").expect("join").as_str(),
            "http://localhost:9200/es/_bulk"
        );
    }

    #[test]
    fn invalid_endpoints_are_rejected() {
        assert!(matches!(
            parse_endpoint(SinkKind::StreamingCollector, ""),
            Err(LoggerError::Configuration(_))
        ));
        assert!(matches!(
            parse_endpoint(SinkKind::StreamingCollector, "not a url"),
            Err(LoggerError::InvalidUrl(_))
        ));
        assert!(matches!(
            parse_endpoint(SinkKind::StreamingCollector, "ftp://logs.example.com"),
            Err(LoggerError::Configuration(_))
        ));
    }

    #[test]
    fn sink_overrides_replace_the_pipeline_template() {
        let pipeline = OutputTemplate::parse("{Message}").expect("template should parse");
        let console = SinkDescriptor::from(ConsoleSinkOptions {
            output_template: Some("{Level:u3} {Message}".to_string()),
            ..ConsoleSinkOptions::default()
        });

        assert_eq!(console.kind(), SinkKind::Console);
        assert_eq!(console.template_override(), Some("{Level:u3} {Message}"));
        assert_eq!(
            SinkDescriptor::from(SearchIndexSinkOptions::default()).template_override(),
            None
        );
        assert_eq!(pipeline.as_str(), "{Message}");
    }

    #[test]
    fn filters_fall_back_to_the_pipeline_directive() {
        let events = Arc::new(EventContext::new(LogLevel::Information));
        let context = SinkBuildContext {
            events: &events,
            filtering_directive: Some("warn,my_app=debug"),
        };

        assert!(context.filter(None, LogLevel::Verbose).is_ok());
        assert!(context.filter(Some("info"), LogLevel::Verbose).is_ok());
        assert!(matches!(
            context.filter(Some("my_app=notalevel"), LogLevel::Verbose),
            Err(LoggerError::InvalidFilteringDirective(_))
        ));
    }
}
