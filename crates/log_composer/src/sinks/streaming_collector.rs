//! Streaming collector output: batches of events posted as newline-delimited compact JSON.
//!
//! Each event is one JSON object with the reserved members `@t` (timestamp), `@mt` (message
//! template), `@m` (rendered message), `@l` (level, omitted for information events) and `@x`
//! (exception). Properties are added as top-level members; property names starting with `@`
//! are escaped by doubling the `@`.

use std::time::Duration;

use reqwest::{blocking::Client, header::CONTENT_TYPE};
use serde_json::{Map, Value};
use time::format_description::well_known::Rfc3339;
use tracing_subscriber::Layer;
use url::Url;

use super::{
    BuiltSink, SinkBuildContext, SinkGuard, SinkKind,
    batching::{self, BatchOptions, BatchTransport},
    parse_endpoint,
};
use crate::{LoggerError, event::LogEvent, level::LogLevel, template::OutputTemplate};

const INGESTION_PATH: &str = "api/events/raw?clef";
const CONTENT_TYPE_COMPACT_JSON: &str = "application/vnd.serilog.clef";
const API_KEY_HEADER: &str = "X-Seq-ApiKey";

/// Configuration of the streaming collector sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingCollectorSinkOptions {
    /// Base URL of the collector.
    pub server_url: String,

    /// Minimum level shipped to the collector.
    pub minimum_level: LogLevel,

    /// Maximum number of events per request. Defaults to 1000.
    pub batch_posting_limit: usize,

    /// Time between two requests. Defaults to 2 seconds.
    pub period: Duration,

    /// API key sent with every request, if the collector requires one.
    pub api_key: Option<String>,

    /// Events whose JSON is larger than this many bytes are dropped. Defaults to 256 KiB.
    pub event_body_limit_bytes: Option<usize>,

    /// Maximum number of events waiting to be shipped. Defaults to 100 000.
    pub queue_size_limit: usize,
}

impl StreamingCollectorSinkOptions {
    /// Streaming collector sink options for the collector at `server_url`, everything else
    /// at its default.
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            minimum_level: LogLevel::default(),
            batch_posting_limit: 1000,
            period: Duration::from_secs(2),
            api_key: None,
            event_body_limit_bytes: Some(256 * 1024),
            queue_size_limit: 100_000,
        }
    }

    /// Sets the minimum level shipped to the collector.
    #[must_use]
    pub fn with_minimum_level(mut self, level: LogLevel) -> Self {
        self.minimum_level = level;
        self
    }

    /// Sets the API key.
    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Sets the batch size and the time between two requests.
    #[must_use]
    pub fn with_batching(mut self, batch_posting_limit: usize, period: Duration) -> Self {
        self.batch_posting_limit = batch_posting_limit;
        self.period = period;
        self
    }

    /// Sets the size above which an event is dropped instead of shipped.
    #[must_use]
    pub fn with_event_body_limit_bytes(mut self, limit: Option<usize>) -> Self {
        self.event_body_limit_bytes = limit;
        self
    }

    /// Sets the maximum number of events waiting to be shipped.
    #[must_use]
    pub fn with_queue_size_limit(mut self, queue_size_limit: usize) -> Self {
        self.queue_size_limit = queue_size_limit;
        self
    }
}

/// The compact JSON representation of `event`.
fn compact_event(event: &LogEvent) -> Value {
    let mut object = Map::new();
    if let Ok(timestamp) = event.timestamp.format(&Rfc3339) {
        object.insert("@t".to_string(), Value::from(timestamp));
    }
    match &event.message_template {
        Some(message_template) => {
            object.insert("@mt".to_string(), Value::from(message_template.as_str()));
            object.insert("@m".to_string(), Value::from(event.message.as_str()));
        }
        None => {
            object.insert("@mt".to_string(), Value::from(event.message.as_str()));
        }
    }
    if event.level != LogLevel::Information {
        object.insert("@l".to_string(), Value::from(event.level.name()));
    }
    if let Some(exception) = &event.exception {
        object.insert("@x".to_string(), Value::from(exception.render_text()));
    }
    for (name, value) in &event.properties {
        let name = if name.starts_with('@') {
            format!("@{name}")
        } else {
            name.clone()
        };
        object.insert(name, value.clone());
    }
    Value::Object(object)
}

#[derive(Debug)]
struct StreamingCollectorTransport {
    client: Client,
    ingestion_url: Url,
    api_key: Option<String>,
    event_body_limit_bytes: Option<usize>,
}

impl StreamingCollectorTransport {
    /// The request body for `batch`, one event per line.
    fn payload(&self, batch: &[LogEvent]) -> Result<String, LoggerError> {
        let mut payload = String::new();
        for event in batch {
            let line = serde_json::to_string(&compact_event(event))?;
            if let Some(limit) = self.event_body_limit_bytes {
                if line.len() > limit {
                    tracing::warn!(
                        sink = %SinkKind::StreamingCollector,
                        size = line.len(),
                        limit,
                        "Event body exceeds the size limit, dropping it"
                    );
                    continue;
                }
            }
            payload.push_str(&line);
            payload.push('\n');
        }
        Ok(payload)
    }
}

impl BatchTransport for StreamingCollectorTransport {
    fn emit_batch(&mut self, batch: &[LogEvent]) -> Result<(), LoggerError> {
        let payload = self.payload(batch)?;
        if payload.is_empty() {
            return Ok(());
        }

        let mut request = self
            .client
            .post(self.ingestion_url.clone())
            .header(CONTENT_TYPE, CONTENT_TYPE_COMPACT_JSON)
            .body(payload);
        if let Some(api_key) = &self.api_key {
            request = request.header(API_KEY_HEADER, api_key.as_str());
        }
        request.send()?.error_for_status()?;
        Ok(())
    }
}

pub(super) fn build(
    options: &StreamingCollectorSinkOptions,
    context: &SinkBuildContext<'_>,
    template: OutputTemplate,
) -> Result<BuiltSink, LoggerError> {
    let filter = context.filter(None, options.minimum_level)?;
    let ingestion_url =
        parse_endpoint(SinkKind::StreamingCollector, &options.server_url)?.join(INGESTION_PATH)?;

    let transport = StreamingCollectorTransport {
        client: Client::builder().build()?,
        ingestion_url,
        api_key: options.api_key.clone(),
        event_body_limit_bytes: options.event_body_limit_bytes,
    };

    let (layer, guard) = batching::spawn(
        transport,
        context.events.clone(),
        BatchOptions {
            sink: SinkKind::StreamingCollector,
            minimum_level: options.minimum_level,
            batch_posting_limit: options.batch_posting_limit,
            period: options.period,
            queue_size_limit: options.queue_size_limit,
            report_failures: true,
        },
    )?;

    Ok(BuiltSink {
        layer: layer.with_filter(filter).boxed(),
        guards: vec![SinkGuard::from(guard)],
        template,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;
    use time::macros::datetime;

    use super::*;

    fn event(level: LogLevel) -> LogEvent {
        LogEvent {
            timestamp: datetime!(2024-05-01 12:00:00 UTC),
            level,
            message_template: Some("User {UserId} signed in".to_string()),
            message: "User 42 signed in".to_string(),
            exception: None,
            properties: BTreeMap::from([
                ("UserId".to_string(), json!(42)),
                ("@source".to_string(), json!("web")),
            ]),
        }
    }

    #[test]
    fn compact_events_use_reserved_members() {
        assert_eq!(
            compact_event(&event(LogLevel::Warning)),
            json!({
                "@t": "2024-05-01T12:00:00Z",
                "@mt": "User {UserId} signed in",
                "@m": "User 42 signed in",
                "@l": "Warning",
                "UserId": 42,
                "@@source": "web",
            })
        );
    }

    #[test]
    fn information_level_is_implied() {
        let compact = compact_event(&event(LogLevel::Information));

        assert!(compact.get("@l").is_none());
    }

    #[test]
    fn builder_methods_set_the_options() {
        let options = StreamingCollectorSinkOptions::new("http://localhost:5341")
            .with_minimum_level(LogLevel::Debug)
            .with_api_key("secret")
            .with_batching(20, Duration::from_millis(500))
            .with_event_body_limit_bytes(None)
            .with_queue_size_limit(1000);

        assert_eq!(
            options,
            StreamingCollectorSinkOptions {
                server_url: "http://localhost:5341".to_string(),
                minimum_level: LogLevel::Debug,
                batch_posting_limit: 20,
                period: Duration::from_millis(500),
                api_key: Some("secret".to_string()),
                event_body_limit_bytes: None,
                queue_size_limit: 1000,
            }
        );
    }

    #[test]
    fn payload_is_newline_delimited_and_respects_the_size_limit() {
        let mut transport = StreamingCollectorTransport {
            client: Client::new(),
            ingestion_url: Url::parse("http://localhost:5341/api/events/raw?clef")
                .expect("URL should parse"),
            api_key: None,
            event_body_limit_bytes: None,
        };
        let batch = [event(LogLevel::Information), event(LogLevel::Error)];

        let payload = transport.payload(&batch).expect("payload should serialize");
        assert_eq!(payload.lines().count(), 2);
        assert!(payload.ends_with('\n'));

        transport.event_body_limit_bytes = Some(16);
        assert_eq!(transport.payload(&batch).expect("payload"), "");
    }

    #[test]
    fn ingestion_url_extends_the_server_url() {
        let url = parse_endpoint(SinkKind::StreamingCollector, "https://seq.example.com/logs")
            .expect("URL should parse")
            .join(INGESTION_PATH)
            .expect("join");

        assert_eq!(
            url.as_str(),
            "https://seq.example.com/logs/api/events/raw?clef"
        );
    }
}
