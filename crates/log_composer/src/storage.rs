//! Provides a [`tracing_subscriber::Layer`] ([`SpanStorageLayer`]) for capturing the fields of
//! spans, so that events inherit the context of the spans they occur in.

use std::{collections::HashMap, error::Error, fmt};

use tracing::{
    Id, Subscriber,
    field::{Field, Visit},
    span::{Attributes, Record},
};
use tracing_subscriber::{Layer, layer::Context, registry::LookupSpan};

use crate::event::ExceptionInfo;

/// A [`tracing_subscriber::Layer`] that stores span fields within span extensions.
///
/// Child spans start from a copy of their parent's fields, so an event sees every field of
/// every enclosing span, with the innermost value winning.
#[derive(Clone, Copy, Debug, Default)]
pub struct SpanStorageLayer;

/// Holds key-value data recorded for a span or an event.
#[derive(Clone, Debug, Default)]
pub(crate) struct Storage<'a> {
    /// The collected key-value pairs.
    values: HashMap<&'a str, serde_json::Value>,

    /// The primary message of an event, if captured.
    message: Option<String>,

    /// The message template the message was rendered from, if the event carried one.
    message_template: Option<String>,

    /// Whether the event was marked fatal.
    fatal: bool,

    /// The first error recorded on the event.
    exception: Option<ExceptionInfo>,
}

impl<'a> Storage<'a> {
    /// Records a key-value pair into the storage.
    ///
    /// Reserved keys are skipped with a warning.
    pub(crate) fn record_value(&mut self, key: &'a str, value: serde_json::Value) {
        if crate::keys::RESERVED_KEYS.contains(key) {
            tracing::warn!(
                "Attempting to record a reserved key `{key}` (value: {value:?}). Skipping."
            );
        } else {
            self.values.insert(key, value);
        }
    }

    pub(crate) fn values(&self) -> &HashMap<&'a str, serde_json::Value> {
        &self.values
    }

    pub(crate) fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub(crate) fn message_template(&self) -> Option<&str> {
        self.message_template.as_deref()
    }

    pub(crate) fn is_fatal(&self) -> bool {
        self.fatal
    }

    pub(crate) fn take_exception(&mut self) -> Option<ExceptionInfo> {
        self.exception.take()
    }

    fn record_text(&mut self, field: &Field, text: String) {
        match field.name() {
            crate::keys::MESSAGE => {
                if self.message.is_none() {
                    self.message = Some(text);
                }
            }
            crate::keys::MESSAGE_TEMPLATE => self.message_template = Some(text),
            name => self.record_value(name, serde_json::Value::from(text)),
        }
    }
}

// Implement `Visit` to capture span or event fields into the `Storage` map.
impl Visit for Storage<'_> {
    fn record_f64(&mut self, field: &Field, value: f64) {
        if field.name() == crate::keys::MESSAGE {
            self.record_text(field, value.to_string());
        } else {
            self.record_value(field.name(), serde_json::Value::from(value));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        if field.name() == crate::keys::MESSAGE {
            self.record_text(field, value.to_string());
        } else {
            self.record_value(field.name(), serde_json::Value::from(value));
        }
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        if field.name() == crate::keys::MESSAGE {
            self.record_text(field, value.to_string());
        } else {
            self.record_value(field.name(), serde_json::Value::from(value));
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        match field.name() {
            crate::keys::FATAL => self.fatal = value,
            crate::keys::MESSAGE => self.record_text(field, value.to_string()),
            name => self.record_value(name, serde_json::Value::from(value)),
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == crate::keys::MESSAGE {
            self.message = Some(value.to_string()); // `record_str()` is preferred for `message`
        } else {
            self.record_text(field, value.to_string());
        }
    }

    fn record_error(&mut self, field: &Field, value: &(dyn Error + 'static)) {
        if self.exception.is_none() {
            self.exception = Some(ExceptionInfo::from_error(value));
        } else {
            self.record_text(field, value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        match field.name() {
            // Fields emitted by the `log` compatibility layer are not event data
            name if name.starts_with("log.") => (),
            name if name.starts_with("r#") => {
                if let Some(stripped) = name.get(2..) {
                    self.record_value(stripped, serde_json::Value::from(format!("{value:?}")));
                }
            }
            _ => self.record_text(field, format!("{value:?}")),
        }
    }
}

impl<S> Layer<S> for SpanStorageLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };

        // Inherit storage from parent span if it exists, otherwise start empty.
        let mut visitor = span
            .parent()
            .and_then(|parent_span| parent_span.extensions().get::<Storage<'_>>().cloned())
            .unwrap_or_default();

        // Spans carry context, not messages or failures.
        visitor.message = None;
        visitor.exception = None;

        attrs.record(&mut visitor);
        span.extensions_mut().insert(visitor);
    }

    fn on_record(&self, span_id: &Id, values: &Record<'_>, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(span_id) else {
            return;
        };
        let mut extensions = span.extensions_mut();
        if let Some(visitor) = extensions.get_mut::<Storage<'_>>() {
            values.record(visitor);
        }
    }
}
