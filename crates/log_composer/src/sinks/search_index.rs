//! Search index output: batches of events uploaded as newline-delimited bulk index requests.

use std::time::Duration;

use reqwest::{blocking::Client, header::CONTENT_TYPE};
use serde_json::{Map, Value, json};
use time::{UtcOffset, format_description::well_known::Rfc3339};
use tracing_subscriber::Layer;
use url::Url;

use super::{
    BuiltSink, SinkBuildContext, SinkGuard, SinkKind,
    batching::{self, BatchOptions, BatchTransport},
    parse_endpoint,
};
use crate::{LoggerError, event::LogEvent, level::LogLevel, template::OutputTemplate};

/// What happens to events the search index refuses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EventFailureHandling {
    /// Failures are reported through the self-log.
    #[default]
    WriteToSelfLog,

    /// Failures are silently discarded.
    Discard,
}

/// Configuration of the search index sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchIndexSinkOptions {
    /// Base URL of the search index node. Defaults to `http://localhost:9200`.
    pub node_url: String,

    /// Minimum level shipped to the index.
    pub minimum_level: LogLevel,

    /// Name of the index an event is written to. `{0:format}` is replaced with the UTC date of
    /// the event in the given format. Defaults to `logstash-{0:yyyy.MM.dd}`.
    pub index_format: String,

    /// Document type name, for index servers that still require one.
    pub type_name: Option<String>,

    /// Maximum number of events per bulk request. Defaults to 50.
    pub batch_posting_limit: usize,

    /// Time between two bulk requests. Defaults to 2 seconds.
    pub period: Duration,

    /// Events whose document is larger than this many bytes are dropped.
    pub single_event_size_posting_limit: Option<usize>,

    /// Timeout of bulk requests. Defaults to 5 seconds.
    pub connection_timeout: Duration,

    /// Maximum number of events waiting to be shipped. Defaults to 100 000.
    pub queue_size_limit: usize,

    /// Whether exception details are written as an array of lines instead of a single string.
    pub format_stack_trace_as_array: bool,

    /// What happens to failed uploads.
    pub emit_event_failure: EventFailureHandling,
}

impl Default for SearchIndexSinkOptions {
    fn default() -> Self {
        Self {
            node_url: "http://localhost:9200".to_string(),
            minimum_level: LogLevel::default(),
            index_format: "logstash-{0:yyyy.MM.dd}".to_string(),
            type_name: None,
            batch_posting_limit: 50,
            period: Duration::from_secs(2),
            single_event_size_posting_limit: None,
            connection_timeout: Duration::from_secs(5),
            queue_size_limit: 100_000,
            format_stack_trace_as_array: false,
            emit_event_failure: EventFailureHandling::default(),
        }
    }
}

impl SearchIndexSinkOptions {
    /// Search index sink options for the node at `node_url`, everything else at its default.
    pub fn new(node_url: impl Into<String>) -> Self {
        Self {
            node_url: node_url.into(),
            ..Self::default()
        }
    }

    /// Sets the minimum level shipped to the index.
    #[must_use]
    pub fn with_minimum_level(mut self, level: LogLevel) -> Self {
        self.minimum_level = level;
        self
    }

    /// Sets the index name format.
    #[must_use]
    pub fn with_index_format(mut self, index_format: impl Into<String>) -> Self {
        self.index_format = index_format.into();
        self
    }

    /// Sets the batch size and the time between two bulk requests.
    #[must_use]
    pub fn with_batching(mut self, batch_posting_limit: usize, period: Duration) -> Self {
        self.batch_posting_limit = batch_posting_limit;
        self.period = period;
        self
    }

    /// Sets the document type name.
    #[must_use]
    pub fn with_type_name(mut self, type_name: impl Into<String>) -> Self {
        self.type_name = Some(type_name.into());
        self
    }

    /// Sets the size above which an event is dropped instead of indexed.
    #[must_use]
    pub fn with_single_event_size_posting_limit(mut self, limit: Option<usize>) -> Self {
        self.single_event_size_posting_limit = limit;
        self
    }

    /// Sets the timeout of bulk requests.
    #[must_use]
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Sets the maximum number of events waiting to be shipped.
    #[must_use]
    pub fn with_queue_size_limit(mut self, queue_size_limit: usize) -> Self {
        self.queue_size_limit = queue_size_limit;
        self
    }

    /// Writes exception details as an array of lines.
    #[must_use]
    pub fn with_format_stack_trace_as_array(mut self, as_array: bool) -> Self {
        self.format_stack_trace_as_array = as_array;
        self
    }

    /// Sets what happens to failed uploads.
    #[must_use]
    pub fn with_emit_event_failure(mut self, handling: EventFailureHandling) -> Self {
        self.emit_event_failure = handling;
        self
    }
}

/// Index name of `event`: the first `{0:format}` placeholder of `index_format` is replaced
/// with the event's UTC date. Index names are lowercase.
fn index_name(index_format: &str, event: &LogEvent) -> String {
    let utc = event.timestamp.to_offset(UtcOffset::UTC);
    let name = match index_format.split_once("{0:") {
        Some((head, rest)) => match rest.split_once('}') {
            Some((format, tail)) => format!(
                "{head}{}{tail}",
                crate::template::format_timestamp(&utc, format)
            ),
            None => index_format.to_string(),
        },
        None => index_format.to_string(),
    };
    name.to_lowercase()
}

#[derive(Debug)]
struct SearchIndexTransport {
    client: Client,
    bulk_url: Url,
    index_format: String,
    type_name: Option<String>,
    single_event_size_posting_limit: Option<usize>,
    format_stack_trace_as_array: bool,
}

impl SearchIndexTransport {
    /// The indexed document of `event`.
    fn document(&self, event: &LogEvent) -> Value {
        let mut document = Map::new();
        if let Ok(timestamp) = event.timestamp.format(&Rfc3339) {
            document.insert("@timestamp".to_string(), Value::from(timestamp));
        }
        document.insert("level".to_string(), Value::from(event.level.name()));
        if let Some(message_template) = &event.message_template {
            document.insert(
                "messageTemplate".to_string(),
                Value::from(message_template.as_str()),
            );
        }
        document.insert("message".to_string(), Value::from(event.message.as_str()));
        if let Some(exception) = &event.exception {
            let exception = if self.format_stack_trace_as_array {
                Value::from(exception.lines().collect::<Vec<_>>())
            } else {
                Value::from(exception.render_text())
            };
            document.insert("exception".to_string(), exception);
        }
        if !event.properties.is_empty() {
            document.insert(
                "fields".to_string(),
                Value::Object(event.properties.clone().into_iter().collect()),
            );
        }
        Value::Object(document)
    }

    /// The bulk request body for `batch`: an action line and a document line per event.
    fn bulk_body(&self, batch: &[LogEvent]) -> Result<String, LoggerError> {
        let mut body = String::new();
        for event in batch {
            let document = serde_json::to_string(&self.document(event))?;
            if let Some(limit) = self.single_event_size_posting_limit {
                if document.len() > limit {
                    tracing::warn!(
                        sink = %SinkKind::SearchIndex,
                        size = document.len(),
                        limit,
                        "Event exceeds the single event size limit, dropping it"
                    );
                    continue;
                }
            }

            let mut action = json!({ "_index": index_name(&self.index_format, event) });
            if let (Some(type_name), Some(action)) = (&self.type_name, action.as_object_mut()) {
                action.insert("_type".to_string(), Value::from(type_name.as_str()));
            }

            body.push_str(&serde_json::to_string(&json!({ "index": action }))?);
            body.push('\n');
            body.push_str(&document);
            body.push('\n');
        }
        Ok(body)
    }
}

impl BatchTransport for SearchIndexTransport {
    fn emit_batch(&mut self, batch: &[LogEvent]) -> Result<(), LoggerError> {
        let body = self.bulk_body(batch)?;
        if body.is_empty() {
            return Ok(());
        }

        self.client
            .post(self.bulk_url.clone())
            .header(CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()?
            .error_for_status()?;
        Ok(())
    }
}

pub(super) fn build(
    options: &SearchIndexSinkOptions,
    context: &SinkBuildContext<'_>,
    template: OutputTemplate,
) -> Result<BuiltSink, LoggerError> {
    let filter = context.filter(None, options.minimum_level)?;
    let bulk_url = parse_endpoint(SinkKind::SearchIndex, &options.node_url)?.join("_bulk")?;
    let client = Client::builder()
        .timeout(options.connection_timeout)
        .build()?;

    let transport = SearchIndexTransport {
        client,
        bulk_url,
        index_format: options.index_format.clone(),
        type_name: options.type_name.clone(),
        single_event_size_posting_limit: options.single_event_size_posting_limit,
        format_stack_trace_as_array: options.format_stack_trace_as_array,
    };

    let (layer, guard) = batching::spawn(
        transport,
        context.events.clone(),
        BatchOptions {
            sink: SinkKind::SearchIndex,
            minimum_level: options.minimum_level,
            batch_posting_limit: options.batch_posting_limit,
            period: options.period,
            queue_size_limit: options.queue_size_limit,
            report_failures: options.emit_event_failure == EventFailureHandling::WriteToSelfLog,
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

    use time::macros::datetime;

    use super::*;
    use crate::event::ExceptionInfo;

    fn event() -> LogEvent {
        LogEvent {
            timestamp: datetime!(2024-05-01 23:30:00 -02:00),
            level: LogLevel::Error,
            message_template: Some("Order {OrderId} failed".to_string()),
            message: "Order 17 failed".to_string(),
            exception: Some(ExceptionInfo {
                message: "timeout".to_string(),
                sources: vec!["connection reset".to_string()],
            }),
            properties: BTreeMap::from([("Application".to_string(), json!("orders"))]),
        }
    }

    fn transport(format_stack_trace_as_array: bool) -> SearchIndexTransport {
        SearchIndexTransport {
            client: Client::new(),
            bulk_url: Url::parse("http://localhost:9200/_bulk").expect("URL should parse"),
            index_format: "Logstash-{0:yyyy.MM.dd}".to_string(),
            type_name: None,
            single_event_size_posting_limit: None,
            format_stack_trace_as_array,
        }
    }

    #[test]
    fn index_names_use_the_utc_date_of_the_event() {
        assert_eq!(
            index_name("logstash-{0:yyyy.MM.dd}", &event()),
            "logstash-2024.05.02"
        );
        assert_eq!(index_name("Audit", &event()), "audit");
    }

    #[test]
    fn bulk_body_pairs_actions_with_documents() {
        let body = transport(false)
            .bulk_body(&[event()])
            .expect("body should serialize");
        let lines = body.lines().collect::<Vec<_>>();

        assert_eq!(lines.len(), 2);
        let action: Value = serde_json::from_str(lines[0]).expect("action should be JSON");
        assert_eq!(action, json!({"index": {"_index": "logstash-2024.05.02"}}));

        let document: Value = serde_json::from_str(lines[1]).expect("document should be JSON");
        assert_eq!(document["level"], json!("Error"));
        assert_eq!(document["messageTemplate"], json!("Order {OrderId} failed"));
        assert_eq!(document["message"], json!("Order 17 failed"));
        assert_eq!(
            document["exception"],
            json!("timeout\n  Caused by: connection reset")
        );
        assert_eq!(document["fields"], json!({"Application": "orders"}));
        assert_eq!(document["@timestamp"], json!("2024-05-01T23:30:00-02:00"));
    }

    #[test]
    fn exceptions_can_be_written_as_arrays() {
        let document = transport(true).document(&event());

        assert_eq!(
            document["exception"],
            json!(["timeout", "  Caused by: connection reset"])
        );
    }

    #[test]
    fn oversized_events_are_left_out() {
        let mut transport = transport(false);
        transport.single_event_size_posting_limit = Some(10);
        transport.type_name = Some("logevent".to_string());

        assert_eq!(transport.bulk_body(&[event()]).expect("body"), "");
    }

    #[test]
    fn defaults_target_a_local_node() {
        let options = SearchIndexSinkOptions::default();

        assert_eq!(options.node_url, "http://localhost:9200");
        assert_eq!(options.index_format, "logstash-{0:yyyy.MM.dd}");
        assert_eq!(options.batch_posting_limit, 50);
        assert_eq!(options.period, Duration::from_secs(2));
        assert_eq!(options.emit_event_failure, EventFailureHandling::WriteToSelfLog);
    }

    #[test]
    fn builder_methods_set_the_options() {
        let options = SearchIndexSinkOptions::new("https://search.example.com")
            .with_minimum_level(LogLevel::Warning)
            .with_index_format("audit-{0:yyyy.MM}")
            .with_batching(10, Duration::from_secs(1))
            .with_type_name("logevent")
            .with_single_event_size_posting_limit(Some(4096))
            .with_connection_timeout(Duration::from_secs(30))
            .with_queue_size_limit(500)
            .with_format_stack_trace_as_array(true)
            .with_emit_event_failure(EventFailureHandling::Discard);

        assert_eq!(
            options,
            SearchIndexSinkOptions {
                node_url: "https://search.example.com".to_string(),
                minimum_level: LogLevel::Warning,
                index_format: "audit-{0:yyyy.MM}".to_string(),
                type_name: Some("logevent".to_string()),
                batch_posting_limit: 10,
                period: Duration::from_secs(1),
                single_event_size_posting_limit: Some(4096),
                connection_timeout: Duration::from_secs(30),
                queue_size_limit: 500,
                format_stack_trace_as_array: true,
                emit_event_failure: EventFailureHandling::Discard,
            }
        );
    }
}
