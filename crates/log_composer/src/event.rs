//! The event model shared by every sink, and its construction from [`tracing`] events.

use std::{cell::RefCell, collections::BTreeMap, error::Error, ptr, sync::Arc};

use serde_json::{Value, json};
use time::OffsetDateTime;
use tracing::{Event, Subscriber};
use tracing_subscriber::{Layer, layer::Context, registry::LookupSpan};

use crate::{enrichment::Enricher, level::LogLevel, storage::Storage};

/// A fully captured log event: what the sinks format and ship.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEvent {
    /// When the event was captured.
    pub timestamp: OffsetDateTime,

    /// Severity of the event.
    pub level: LogLevel,

    /// The message template the message was rendered from, if any.
    pub message_template: Option<String>,

    /// The rendered message.
    pub message: String,

    /// The error attached to the event, if any.
    pub exception: Option<ExceptionInfo>,

    /// Named properties, from the event itself, its spans, static fields and enrichers.
    pub properties: BTreeMap<String, Value>,
}

impl LogEvent {
    /// Adds a property unless one with the same name is already present.
    pub fn add_property_if_absent(&mut self, name: &str, value: impl Into<Value>) {
        if !self.properties.contains_key(name) {
            self.properties.insert(name.to_string(), value.into());
        }
    }
}

/// An error attached to an event, flattened into its message and the messages of its sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionInfo {
    /// `Display` output of the error.
    pub message: String,

    /// `Display` output of each error in the `source()` chain, outermost first.
    pub sources: Vec<String>,
}

impl ExceptionInfo {
    /// Captures `error` and its source chain.
    pub fn from_error(error: &(dyn Error + 'static)) -> Self {
        let mut sources = Vec::new();
        let mut current = error.source();
        while let Some(source) = current {
            sources.push(source.to_string());
            current = source.source();
        }

        Self {
            message: error.to_string(),
            sources,
        }
    }

    /// Human-readable text, one cause per line.
    pub fn render_text(&self) -> String {
        self.lines().collect::<Vec<_>>().join("\n")
    }

    /// The error as lines of text, the outermost message first.
    pub fn lines(&self) -> impl Iterator<Item = String> + '_ {
        std::iter::once(self.message.clone()).chain(
            self.sources
                .iter()
                .map(|source| format!("  Caused by: {source}")),
        )
    }

    /// Structured representation attached by the exception detail enricher.
    pub fn detail(&self) -> Value {
        json!({
            "Message": self.message,
            "Sources": self.sources,
        })
    }
}

/// Everything registered with the engine before any sink is built: the level threshold, the
/// static properties and the enrichers. Shared by every sink layer of one engine instance.
#[derive(Default)]
pub(crate) struct EventContext {
    minimum_level: LogLevel,
    static_properties: Vec<(String, Value)>,
    enrichers: Vec<Arc<dyn Enricher>>,
}

impl std::fmt::Debug for EventContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventContext")
            .field("minimum_level", &self.minimum_level)
            .field("static_properties", &self.static_properties)
            .field(
                "enrichers",
                &self
                    .enrichers
                    .iter()
                    .map(|enricher| enricher.name())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl EventContext {
    pub(crate) fn new(minimum_level: LogLevel) -> Self {
        Self {
            minimum_level,
            ..Self::default()
        }
    }

    pub(crate) fn minimum_level(&self) -> LogLevel {
        self.minimum_level
    }

    pub(crate) fn add_static_property(&mut self, name: &str, value: impl Into<Value>) {
        self.static_properties.push((name.to_string(), value.into()));
    }

    pub(crate) fn register(&mut self, enricher: Arc<dyn Enricher>) {
        self.enrichers.push(enricher);
    }

    #[cfg(test)]
    pub(crate) fn enricher_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.enrichers.iter().map(|enricher| enricher.name())
    }

    /// Whether a `tracing` event at `level` could pass `sink_minimum` and the engine threshold.
    ///
    /// `ERROR` events may turn out to be fatal, so they are let through here and checked again
    /// once captured.
    pub(crate) fn may_pass(&self, level: tracing::Level, sink_minimum: LogLevel) -> bool {
        LogLevel::from_tracing_level(level, true) >= self.minimum_level.max(sink_minimum)
    }

    /// The captured form of `event` for a sink at `sink_minimum`, or `None` if the event is
    /// below the sink or engine level.
    ///
    /// Within an engine, the capture made by [`SharedCaptureLayer`] is reused so that every
    /// sink sees the same timestamp and enriched properties. Otherwise the event is captured
    /// here.
    pub(crate) fn captured<S>(
        &self,
        event: &Event<'_>,
        ctx: &Context<'_, S>,
        sink_minimum: LogLevel,
    ) -> Option<Arc<LogEvent>>
    where
        S: Subscriber + for<'a> LookupSpan<'a>,
    {
        let shared = SHARED_CAPTURES.with(|captures| {
            captures
                .borrow()
                .last()
                .filter(|capture| capture.is_for(self, event))
                .map(|capture| capture.log_event.clone())
        });

        let log_event = match shared {
            Some(log_event) => log_event?,
            None => Arc::new(self.capture(event, ctx)?),
        };
        (log_event.level >= sink_minimum).then_some(log_event)
    }

    /// Captures `event` with the properties of its span, the static properties and every
    /// registered enricher applied. Returns `None` if the event is below the engine threshold.
    fn capture<S>(&self, event: &Event<'_>, ctx: &Context<'_, S>) -> Option<LogEvent>
    where
        S: Subscriber + for<'a> LookupSpan<'a>,
    {
        let mut storage = Storage::default();
        event.record(&mut storage);

        let level = LogLevel::from_tracing_level(*event.metadata().level(), storage.is_fatal());
        if level < self.minimum_level {
            return None;
        }

        let mut properties = storage
            .values()
            .iter()
            .map(|(key, value)| ((*key).to_string(), value.clone()))
            .collect::<BTreeMap<_, _>>();

        if let Some(span) = ctx.event_span(event) {
            if let Some(span_storage) = span.extensions().get::<Storage<'_>>() {
                for (key, value) in span_storage.values() {
                    properties
                        .entry((*key).to_string())
                        .or_insert_with(|| value.clone());
                }
            }
        }

        let message = storage
            .message()
            .unwrap_or_else(|| event.metadata().target())
            .to_string();

        let mut log_event = LogEvent {
            timestamp: OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc()),
            level,
            message_template: storage.message_template().map(ToString::to_string),
            message,
            exception: storage.take_exception(),
            properties,
        };

        self.enrich(&mut log_event);
        Some(log_event)
    }

    /// Applies the static properties, then every enricher in registration order.
    pub(crate) fn enrich(&self, event: &mut LogEvent) {
        for (name, value) in &self.static_properties {
            event.add_property_if_absent(name, value.clone());
        }
        for enricher in &self.enrichers {
            enricher.enrich(event);
        }
    }
}

thread_local! {
    /// Captures of the events being dispatched on this thread, innermost last.
    static SHARED_CAPTURES: RefCell<Vec<SharedCapture>> = const { RefCell::new(Vec::new()) };
}

/// The capture of one event, valid while the event goes through the layers of one engine.
struct SharedCapture {
    context: *const EventContext,
    event: *const (),
    log_event: Option<Arc<LogEvent>>,
}

impl SharedCapture {
    fn is_for(&self, context: &EventContext, event: &Event<'_>) -> bool {
        ptr::eq(self.context, context) && ptr::eq(self.event, ptr::from_ref(event).cast())
    }
}

/// Captures each event once, ahead of the sink layers of an engine, and shares the capture
/// with them until [`CaptureReleaseLayer`] sees the same event at the end of the stack.
///
/// Both layers must be filtered identically so that every capture is released.
#[derive(Debug)]
pub(crate) struct SharedCaptureLayer {
    context: Arc<EventContext>,
}

/// Releases the capture made by [`SharedCaptureLayer`] once every sink has seen the event.
#[derive(Debug)]
pub(crate) struct CaptureReleaseLayer {
    context: Arc<EventContext>,
}

/// The pair of layers enclosing the sink layers of the engine owning `context`.
pub(crate) fn shared_capture_layers(
    context: &Arc<EventContext>,
) -> (SharedCaptureLayer, CaptureReleaseLayer) {
    (
        SharedCaptureLayer {
            context: Arc::clone(context),
        },
        CaptureReleaseLayer {
            context: Arc::clone(context),
        },
    )
}

impl<S> Layer<S> for SharedCaptureLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let log_event = self.context.capture(event, &ctx).map(Arc::new);
        SHARED_CAPTURES.with(|captures| {
            captures.borrow_mut().push(SharedCapture {
                context: Arc::as_ptr(&self.context),
                event: ptr::from_ref(event).cast(),
                log_event,
            });
        });
    }
}

impl<S> Layer<S> for CaptureReleaseLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        SHARED_CAPTURES.with(|captures| {
            let mut captures = captures.borrow_mut();
            if captures
                .last()
                .is_some_and(|capture| capture.is_for(&self.context, event))
            {
                captures.pop();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::{
        fmt,
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use tracing_subscriber::layer::SubscriberExt;

    use super::*;

    #[derive(Debug)]
    struct Inner;

    impl fmt::Display for Inner {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("disk full")
        }
    }

    impl Error for Inner {}

    #[derive(Debug)]
    struct Outer(Inner);

    impl fmt::Display for Outer {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("could not write segment")
        }
    }

    impl Error for Outer {
        fn source(&self) -> Option<&(dyn Error + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn exception_info_flattens_the_source_chain() {
        let info = ExceptionInfo::from_error(&Outer(Inner));

        assert_eq!(info.message, "could not write segment");
        assert_eq!(info.sources, vec!["disk full".to_string()]);
        assert_eq!(
            info.render_text(),
            "could not write segment\n  Caused by: disk full"
        );
        assert_eq!(
            info.detail(),
            json!({"Message": "could not write segment", "Sources": ["disk full"]})
        );
    }

    #[test]
    fn properties_are_only_added_when_absent() {
        let mut event = LogEvent {
            timestamp: OffsetDateTime::UNIX_EPOCH,
            level: LogLevel::Information,
            message_template: None,
            message: String::new(),
            exception: None,
            properties: BTreeMap::from([("Application".to_string(), json!("from-event"))]),
        };

        event.add_property_if_absent("Application", "static");
        event.add_property_if_absent("ApplicationInstance", 2);

        assert_eq!(event.properties["Application"], json!("from-event"));
        assert_eq!(event.properties["ApplicationInstance"], json!(2));
    }

    #[test]
    fn may_pass_lets_error_events_through_to_fatal_sinks() {
        let context = EventContext::new(LogLevel::Information);

        assert!(!context.may_pass(tracing::Level::DEBUG, LogLevel::Verbose));
        assert!(context.may_pass(tracing::Level::INFO, LogLevel::Verbose));
        assert!(!context.may_pass(tracing::Level::WARN, LogLevel::Error));
        assert!(context.may_pass(tracing::Level::ERROR, LogLevel::Fatal));
    }

    #[derive(Default)]
    struct CountingEnricher(AtomicUsize);

    impl Enricher for CountingEnricher {
        fn name(&self) -> &'static str {
            "Counting"
        }

        fn enrich(&self, _event: &mut LogEvent) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    type Received = Arc<Mutex<Vec<Arc<LogEvent>>>>;

    struct Receiving {
        context: Arc<EventContext>,
        minimum_level: LogLevel,
        received: Received,
    }

    impl<S> Layer<S> for Receiving
    where
        S: Subscriber + for<'a> LookupSpan<'a>,
    {
        fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
            if let Some(log_event) = self.context.captured(event, &ctx, self.minimum_level) {
                self.received.lock().expect("received lock").push(log_event);
            }
        }
    }

    #[test]
    fn sinks_of_one_engine_share_a_single_capture() {
        let enricher = Arc::new(CountingEnricher::default());
        let registered: Arc<dyn Enricher> = enricher.clone();
        let mut context = EventContext::new(LogLevel::Debug);
        context.register(registered);
        let context = Arc::new(context);

        let verbose = Received::default();
        let warning = Received::default();
        let receiving = |minimum_level, received: &Received| Receiving {
            context: Arc::clone(&context),
            minimum_level,
            received: Arc::clone(received),
        };
        let verbose_sink = receiving(LogLevel::Verbose, &verbose);
        let warning_sink = receiving(LogLevel::Warning, &warning);
        let (capture, release) = shared_capture_layers(&context);

        let subscriber = tracing_subscriber::registry()
            .with(capture)
            .with(verbose_sink)
            .with(warning_sink)
            .with(release);
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("for one sink");
            tracing::warn!("for both sinks");
            tracing::trace!("below the engine level");
        });

        assert_eq!(enricher.0.load(Ordering::Relaxed), 2);

        let verbose = verbose.lock().expect("received lock");
        let warning = warning.lock().expect("received lock");
        assert_eq!(
            verbose.iter().map(|event| event.message.as_str()).collect::<Vec<_>>(),
            vec!["for one sink", "for both sinks"]
        );
        assert_eq!(warning.len(), 1);
        assert!(Arc::ptr_eq(&verbose[1], &warning[0]));

        assert!(SHARED_CAPTURES.with(|captures| captures.borrow().is_empty()));
    }
}
