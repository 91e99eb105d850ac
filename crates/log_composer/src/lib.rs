//! `log_composer` assembles a structured logging pipeline on top of the [`tracing`] ecosystem.
//!
//! A [`PipelineConfiguration`] collects:
//! - A minimum level, application identity and a global [`EnvFilter`] directive.
//! - At most one [`SinkDescriptor`] per [`SinkKind`]: console, rolling file, search index,
//!   streaming collector and relational table.
//! - An [`EnrichmentPlan`] deciding which contextual properties are attached to events and
//!   which fragments the shared output template is made of.
//!
//! [`PipelineConfiguration::assemble`] builds a [`Logger`] from it and publishes the logger
//! through the process-wide [`handle`], replacing the previously active one.
//!
//! # Example
//!
//! ```no_run
//! use log_composer::{
//!     ConsoleSinkOptions, EnrichmentPlan, FileSinkOptions, LogLevel, PipelineConfiguration,
//!     RollingInterval,
//! };
//!
//! let logger = PipelineConfiguration::new()
//!     .with_minimum_level(LogLevel::Debug)
//!     .with_application("orders", 1)
//!     .enrich(EnrichmentPlan::new().with_thread(false, true, "worker"))
//!     .log_to_console(ConsoleSinkOptions::default())
//!     .log_to_file(FileSinkOptions::new("logs/orders.log").with_rolling_interval(RollingInterval::Day))
//!     .assemble()?;
//!
//! logger.information("Order {OrderId} shipped", &[&17]);
//! # Ok::<(), log_composer::LoggerError>(())
//! ```
//!
//! [`EnvFilter`]: tracing_subscriber::EnvFilter

mod configuration;
mod enrichment;
mod event;
mod formatter;
pub mod handle;
mod level;
mod logger;
mod request_context;
mod sinks;
mod storage;
mod template;

pub use self::{
    configuration::{ApplicationInfo, BOOTSTRAP_MESSAGE, PipelineConfiguration},
    enrichment::{
        CORRELATION_ID_HEADER, DEFAULT_ENVIRONMENT_NAME, DEFAULT_THREAD_NAME,
        ENVIRONMENT_NAME_VARIABLE, Enricher, EnrichmentKind, EnrichmentPlan,
    },
    event::{ExceptionInfo, LogEvent},
    level::{LogLevel, ParseLevelError},
    logger::{ActiveSink, Logger},
    request_context::{RequestContext, RequestContextGuard},
    sinks::{
        ConsoleLogFormat, ConsoleSinkOptions, ConsoleTheme, EventFailureHandling, FileLogFormat,
        FileSinkOptions, RelationalTableSinkOptions, RollingInterval, SearchIndexSinkOptions,
        SinkDescriptor, SinkKind, StandardColumn, StreamingCollectorSinkOptions,
    },
    storage::SpanStorageLayer,
    template::{DEFAULT_PREFIX, DEFAULT_SUFFIX, OutputTemplate, TemplateError},
};

mod keys {
    use std::sync::LazyLock;

    use rustc_hash::FxHashSet;

    pub(crate) const MESSAGE: &str = "message";
    pub(crate) const MESSAGE_TEMPLATE: &str = "message_template";
    pub(crate) const FATAL: &str = "fatal";

    /// Field names with a meaning of their own, never stored as event properties.
    pub(crate) static RESERVED_KEYS: LazyLock<FxHashSet<&'static str>> =
        LazyLock::new(|| [MESSAGE, MESSAGE_TEMPLATE, FATAL].iter().copied().collect());
}

/// Errors that can occur within the logger.
#[derive(Debug, thiserror::Error)]
pub enum LoggerError {
    /// Represents an error in configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Represents an output template that could not be parsed.
    #[error("Invalid output template: {0}")]
    Template(#[from] TemplateError),

    /// Represents an error due to an invalid filtering directive.
    #[error("Failed to parse filtering directive: {0}")]
    InvalidFilteringDirective(#[from] tracing_subscriber::filter::ParseError),

    /// Represents an error during initialization of the rolling file appender.
    #[error("Failed to initialize rolling file appender: {0}")]
    FileAppenderInitialization(#[from] tracing_appender::rolling::InitError),

    /// Represents an endpoint URL that could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Represents a failure of the HTTP client used by the remote sinks.
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Represents a failure to connect to the database of the relational table sink.
    #[error("Failed to connect to the database: {0}")]
    DatabaseConnection(#[from] diesel::ConnectionError),

    /// Represents a failed database statement.
    #[error("Database error: {0}")]
    Database(#[from] diesel::result::Error),

    /// Represents an error during JSON serialization.
    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    /// Represents an I/O error, e.g. while spawning a sink worker thread.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Represents a sink whose construction failed.
    #[error("Failed to build the {kind} sink")]
    SinkBuild {
        /// The sink that failed.
        kind: SinkKind,

        /// Why it failed.
        #[source]
        source: Box<LoggerError>,
    },
}
