//! Provides the [`tracing_subscriber::Layer`]s that turn events into lines of output:
//! [`TemplateFormattingLayer`] renders an output template, [`JsonFormattingLayer`] writes one
//! JSON object per event.

use std::{io::Write, sync::Arc};

use serde::ser::{SerializeMap, Serializer};
use serde_json::ser::Formatter;
use time::format_description::well_known::Rfc3339;
use tracing::{Event, Subscriber};
use tracing_subscriber::{Layer, fmt::MakeWriter, layer::Context, registry::LookupSpan};

use crate::{
    LoggerError,
    event::{EventContext, LogEvent},
    level::LogLevel,
    template::OutputTemplate,
};

/// Destination of formatted lines. The level is passed along so that writers can route lines,
/// e.g. to standard error above a threshold.
pub(crate) trait LineWriter: Send + Sync + 'static {
    fn write_line(&self, level: LogLevel, line: &[u8]) -> std::io::Result<()>;
}

/// Adapts any [`MakeWriter`] into a [`LineWriter`].
#[derive(Debug)]
pub(crate) struct MakeWriterLines<W>(pub(crate) W);

impl<W> LineWriter for MakeWriterLines<W>
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    fn write_line(&self, _level: LogLevel, line: &[u8]) -> std::io::Result<()> {
        // A single `write_all` call keeps lines from interleaving between threads.
        self.0.make_writer().write_all(line)
    }
}

/// A [`tracing_subscriber::Layer`] that renders events with an [`OutputTemplate`].
#[derive(Debug)]
pub(crate) struct TemplateFormattingLayer<W> {
    context: Arc<EventContext>,
    minimum_level: LogLevel,
    template: OutputTemplate,
    writer: W,
}

impl<W: LineWriter> TemplateFormattingLayer<W> {
    pub(crate) fn new(
        context: Arc<EventContext>,
        minimum_level: LogLevel,
        template: OutputTemplate,
        writer: W,
    ) -> Self {
        Self {
            context,
            minimum_level,
            template,
            writer,
        }
    }

    /// Renders `event`, making sure the line ends with exactly one line break.
    fn format(&self, event: &LogEvent) -> Vec<u8> {
        let mut line = self.template.render(event).into_bytes();
        if !line.ends_with(b"\n") {
            line.push(b'\n');
        }
        line
    }
}

impl<S, W> Layer<S> for TemplateFormattingLayer<W>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: LineWriter,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        if !self
            .context
            .may_pass(*event.metadata().level(), self.minimum_level)
        {
            return;
        }

        if let Some(log_event) = self.context.captured(event, &ctx, self.minimum_level) {
            let _ = self
                .writer
                .write_line(log_event.level, &self.format(&log_event));
        }
    }
}

/// A [`tracing_subscriber::Layer`] that writes every event as a single JSON object.
///
/// It requires a [`serde_json::ser::Formatter`] to control the JSON output style
/// (e.g., compact or pretty-printed).
#[derive(Debug)]
pub(crate) struct JsonFormattingLayer<W, F>
where
    F: Formatter + Clone,
{
    context: Arc<EventContext>,
    minimum_level: LogLevel,
    writer: W,
    formatter: F,
}

impl<W, F> JsonFormattingLayer<W, F>
where
    W: LineWriter,
    F: Formatter + Clone,
{
    pub(crate) fn new(
        context: Arc<EventContext>,
        minimum_level: LogLevel,
        writer: W,
        formatter: F,
    ) -> Self {
        Self {
            context,
            minimum_level,
            writer,
            formatter,
        }
    }

    /// Serializes `event` into a buffer with a trailing newline.
    fn event_serialize(&self, event: &LogEvent) -> Result<Vec<u8>, LoggerError> {
        let mut buffer = Vec::new();
        let mut serializer =
            serde_json::Serializer::with_formatter(&mut buffer, self.formatter.clone());
        serialize_event(&mut serializer, event)?;
        buffer.write_all(b"\n")?;
        Ok(buffer)
    }
}

/// Serializes the common JSON shape of an event:
/// `Timestamp`, `Level`, `MessageTemplate`, `RenderedMessage`, `Exception` and `Properties`.
fn serialize_event<S>(serializer: S, event: &LogEvent) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let mut map_serializer = serializer.serialize_map(None)?;

    if let Ok(timestamp) = event.timestamp.format(&Rfc3339) {
        map_serializer.serialize_entry("Timestamp", &timestamp)?;
    }
    map_serializer.serialize_entry("Level", event.level.name())?;
    map_serializer.serialize_entry(
        "MessageTemplate",
        event
            .message_template
            .as_deref()
            .unwrap_or(event.message.as_str()),
    )?;
    map_serializer.serialize_entry("RenderedMessage", &event.message)?;
    if let Some(exception) = &event.exception {
        map_serializer.serialize_entry("Exception", &exception.render_text())?;
    }
    if !event.properties.is_empty() {
        map_serializer.serialize_entry("Properties", &event.properties)?;
    }

    map_serializer.end()
}

impl<S, W, F> Layer<S> for JsonFormattingLayer<W, F>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: LineWriter,
    F: Formatter + Clone + Send + Sync + 'static,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        if !self
            .context
            .may_pass(*event.metadata().level(), self.minimum_level)
        {
            return;
        }

        if let Some(log_event) = self.context.captured(event, &ctx, self.minimum_level) {
            if let Ok(serialized) = self.event_serialize(&log_event) {
                let _ = self.writer.write_line(log_event.level, &serialized);
            }
        }
    }
}
