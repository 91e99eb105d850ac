//! The logging engine produced by a pipeline configuration.

use std::{error::Error, fmt::Display};

use tracing::Dispatch;

use crate::{
    level::LogLevel,
    sinks::{SinkGuard, SinkKind},
    template::{OutputTemplate, render_message},
};

/// Target of the events emitted through a [`Logger`].
const TARGET: &str = env!("CARGO_PKG_NAME");

/// A sink attached to a [`Logger`], as it was built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSink {
    kind: SinkKind,
    template: OutputTemplate,
}

impl ActiveSink {
    pub(crate) fn new(kind: SinkKind, template: OutputTemplate) -> Self {
        Self { kind, template }
    }

    /// The kind of the sink.
    pub fn kind(&self) -> SinkKind {
        self.kind
    }

    /// The output template the sink was built with.
    pub fn template(&self) -> &OutputTemplate {
        &self.template
    }
}

/// A fully built logging engine: a [`Dispatch`] over the sink layers of a pipeline.
///
/// Dropping the logger flushes every sink and stops their background writers.
pub struct Logger {
    // Dropped before the guards, so that workers see their queues close before being joined.
    dispatch: Dispatch,
    minimum_level: LogLevel,
    sinks: Vec<ActiveSink>,
    _guards: Vec<SinkGuard>,
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger")
            .field("minimum_level", &self.minimum_level)
            .field("sinks", &self.sinks)
            .finish_non_exhaustive()
    }
}

/// Emits one `tracing` event at a constant level.
macro_rules! emit {
    ($level:expr, $fatal:expr, $error:expr, $template:expr, $message:expr) => {
        tracing::event!(
            target: TARGET,
            $level,
            fatal = $fatal,
            message_template = $template,
            error = $error,
            "{}",
            $message
        )
    };
}

impl Logger {
    pub(crate) fn new(
        dispatch: Dispatch,
        minimum_level: LogLevel,
        sinks: Vec<ActiveSink>,
        guards: Vec<SinkGuard>,
    ) -> Self {
        Self {
            dispatch,
            minimum_level,
            sinks,
            _guards: guards,
        }
    }

    /// The minimum level of the engine.
    pub fn minimum_level(&self) -> LogLevel {
        self.minimum_level
    }

    /// The sinks of the engine, in build order.
    pub fn active_sinks(&self) -> &[ActiveSink] {
        &self.sinks
    }

    /// The sink of kind `kind`, if the engine has one.
    pub fn sink(&self, kind: SinkKind) -> Option<&ActiveSink> {
        self.sinks.iter().find(|sink| sink.kind == kind)
    }

    /// Whether events at `level` pass the engine's minimum level.
    pub fn is_enabled(&self, level: LogLevel) -> bool {
        level >= self.minimum_level && !self.sinks.is_empty()
    }

    /// Runs `f` with this engine as the default `tracing` dispatcher of the calling thread, so
    /// that `tracing` macros used by `f` reach this engine's sinks.
    pub fn in_scope<R>(&self, f: impl FnOnce() -> R) -> R {
        tracing::dispatcher::with_default(&self.dispatch, f)
    }

    /// Writes an event. The message is rendered from `template`, placeholders being filled
    /// with `values` in order; the template itself is kept on the event.
    pub fn write(
        &self,
        level: LogLevel,
        error: Option<&(dyn Error + 'static)>,
        template: &str,
        values: &[&dyn Display],
    ) {
        if !self.is_enabled(level) {
            return;
        }

        let message = render_message(template, values);
        let fatal = level == LogLevel::Fatal;
        self.in_scope(|| match level {
            LogLevel::Verbose => emit!(tracing::Level::TRACE, fatal, error, template, message),
            LogLevel::Debug => emit!(tracing::Level::DEBUG, fatal, error, template, message),
            LogLevel::Information => emit!(tracing::Level::INFO, fatal, error, template, message),
            LogLevel::Warning => emit!(tracing::Level::WARN, fatal, error, template, message),
            LogLevel::Error | LogLevel::Fatal => {
                emit!(tracing::Level::ERROR, fatal, error, template, message)
            }
        });
    }

    /// Writes a [`LogLevel::Verbose`] event.
    pub fn verbose(&self, template: &str, values: &[&dyn Display]) {
        self.write(LogLevel::Verbose, None, template, values);
    }

    /// Writes a [`LogLevel::Debug`] event.
    pub fn debug(&self, template: &str, values: &[&dyn Display]) {
        self.write(LogLevel::Debug, None, template, values);
    }

    /// Writes a [`LogLevel::Information`] event.
    pub fn information(&self, template: &str, values: &[&dyn Display]) {
        self.write(LogLevel::Information, None, template, values);
    }

    /// Writes a [`LogLevel::Warning`] event.
    pub fn warning(&self, template: &str, values: &[&dyn Display]) {
        self.write(LogLevel::Warning, None, template, values);
    }

    /// Writes a [`LogLevel::Error`] event with an optional error attached.
    pub fn error(
        &self,
        error: Option<&(dyn Error + 'static)>,
        template: &str,
        values: &[&dyn Display],
    ) {
        self.write(LogLevel::Error, error, template, values);
    }

    /// Writes a [`LogLevel::Fatal`] event with an optional error attached.
    pub fn fatal(
        &self,
        error: Option<&(dyn Error + 'static)>,
        template: &str,
        values: &[&dyn Display],
    ) {
        self.write(LogLevel::Fatal, error, template, values);
    }
}
