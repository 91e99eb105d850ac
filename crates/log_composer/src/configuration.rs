//! The pipeline configuration: sinks, enrichment and level threshold, assembled into a
//! [`Logger`].

use std::{collections::BTreeMap, sync::Arc};

use tracing::Dispatch;
use tracing_subscriber::{Layer, layer::SubscriberExt};

use crate::{
    LoggerError,
    enrichment::EnrichmentPlan,
    event::{EventContext, shared_capture_layers},
    handle,
    level::LogLevel,
    logger::{ActiveSink, Logger},
    sinks::{
        BoxedLayer, ConsoleSinkOptions, FileSinkOptions, RelationalTableSinkOptions,
        SearchIndexSinkOptions, SinkBuildContext, SinkDescriptor, SinkKind,
        StreamingCollectorSinkOptions,
    },
    storage::SpanStorageLayer,
    template::OutputTemplate,
};

/// Message of the event emitted through a newly published logger.
pub const BOOTSTRAP_MESSAGE: &str = "Logger assembled and published";

const APPLICATION: &str = "Application";
const APPLICATION_INSTANCE: &str = "ApplicationInstance";

/// Identity of the application, attached to every event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationInfo {
    /// Name of the application.
    pub name: String,

    /// Identifier of this instance of the application.
    pub instance_id: i64,
}

/// Everything a [`Logger`] is built from.
///
/// Holds at most one [`SinkDescriptor`] per [`SinkKind`]: attaching a second descriptor of a
/// kind replaces the first.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfiguration {
    minimum_level: LogLevel,
    application: Option<ApplicationInfo>,
    filtering_directive: Option<String>,
    sinks: BTreeMap<SinkKind, SinkDescriptor>,
    enrichment: Option<EnrichmentPlan>,
}

impl PipelineConfiguration {
    /// An empty configuration: every level enabled, no sink, no enrichment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the minimum level of the engine. Defaults to [`LogLevel::Verbose`].
    #[must_use]
    pub fn with_minimum_level(mut self, level: LogLevel) -> Self {
        self.minimum_level = level;
        self
    }

    /// Sets the application identity. Only the first call has an effect.
    #[must_use]
    pub fn with_application(mut self, name: impl Into<String>, instance_id: i64) -> Self {
        if self.application.is_none() {
            self.application = Some(ApplicationInfo {
                name: name.into(),
                instance_id,
            });
        }
        self
    }

    /// Sets the [`EnvFilter`](tracing_subscriber::EnvFilter) directive used by every sink that
    /// does not have its own.
    #[must_use]
    pub fn with_filtering_directive(mut self, directive: impl Into<String>) -> Self {
        self.filtering_directive = Some(directive.into());
        self
    }

    /// Attaches a console sink.
    #[must_use]
    pub fn log_to_console(self, options: ConsoleSinkOptions) -> Self {
        self.attach(SinkDescriptor::Console(options))
    }

    /// Attaches a rolling file sink.
    #[must_use]
    pub fn log_to_file(self, options: FileSinkOptions) -> Self {
        self.attach(SinkDescriptor::File(options))
    }

    /// Attaches a search index sink.
    #[must_use]
    pub fn log_to_search_index(self, options: SearchIndexSinkOptions) -> Self {
        self.attach(SinkDescriptor::SearchIndex(options))
    }

    /// Attaches a streaming collector sink.
    #[must_use]
    pub fn log_to_streaming_collector(self, options: StreamingCollectorSinkOptions) -> Self {
        self.attach(SinkDescriptor::StreamingCollector(options))
    }

    /// Attaches a relational table sink.
    #[must_use]
    pub fn log_to_relational_table(self, options: RelationalTableSinkOptions) -> Self {
        self.attach(SinkDescriptor::RelationalTable(options))
    }

    /// Attaches `descriptor`, replacing any descriptor of the same kind.
    #[must_use]
    pub fn attach(mut self, descriptor: impl Into<SinkDescriptor>) -> Self {
        let descriptor = descriptor.into();
        self.sinks.insert(descriptor.kind(), descriptor);
        self
    }

    /// Sets the enrichment plan, replacing any previous one.
    #[must_use]
    pub fn enrich(mut self, plan: EnrichmentPlan) -> Self {
        self.enrichment = Some(plan);
        self
    }

    /// The minimum level of the engine.
    pub fn minimum_level(&self) -> LogLevel {
        self.minimum_level
    }

    /// The application identity, if set.
    pub fn application(&self) -> Option<&ApplicationInfo> {
        self.application.as_ref()
    }

    /// The attached descriptor of kind `kind`, if any.
    pub fn sink(&self, kind: SinkKind) -> Option<&SinkDescriptor> {
        self.sinks.get(&kind)
    }

    /// The attached descriptors, in build order.
    pub fn sinks(&self) -> impl Iterator<Item = &SinkDescriptor> + '_ {
        SinkKind::ORDER
            .into_iter()
            .filter_map(|kind| self.sinks.get(&kind))
    }

    /// The output template sinks without an override are built with.
    pub fn output_template(&self) -> String {
        self.enrichment.as_ref().map_or_else(
            || EnrichmentPlan::default().output_template(),
            EnrichmentPlan::output_template,
        )
    }

    /// Builds a [`Logger`] without publishing it.
    ///
    /// Static fields, the minimum level and the enrichers are registered first, then every
    /// attached sink is built in [`SinkKind::ORDER`] with the resulting template, or with its
    /// own template override.
    ///
    /// # Errors
    ///
    /// Returns [`LoggerError::SinkBuild`] if a sink cannot be built, or another
    /// [`LoggerError`] if the composed template is invalid. The sinks built before the failing
    /// one are dropped with their background writers.
    pub fn build(&self) -> Result<Logger, LoggerError> {
        let mut events = EventContext::new(self.minimum_level);
        if let Some(application) = &self.application {
            events.add_static_property(APPLICATION, application.name.as_str());
            events.add_static_property(APPLICATION_INSTANCE, application.instance_id);
        }

        let template_text = match &self.enrichment {
            Some(plan) => plan.apply(&mut events),
            None => EnrichmentPlan::default().apply(&mut events),
        };
        let template = OutputTemplate::parse(&template_text)?;
        let events = Arc::new(events);

        let build_context = SinkBuildContext {
            events: &events,
            filtering_directive: self.filtering_directive.as_deref(),
        };

        // Declared before the layers so that, on failure, layers are dropped first and the
        // workers they feed can finish before their guards join them.
        let mut guards = Vec::new();
        let engine_filter = self.minimum_level.as_level_filter();
        let (capture, release) = shared_capture_layers(&events);
        let mut layers: Vec<BoxedLayer> = vec![
            SpanStorageLayer.boxed(),
            capture.with_filter(engine_filter).boxed(),
        ];
        let mut active_sinks = Vec::new();

        for descriptor in self.sinks() {
            let kind = descriptor.kind();
            let built = descriptor
                .build(&build_context, &template)
                .map_err(|source| LoggerError::SinkBuild {
                    kind,
                    source: Box::new(source),
                })?;

            layers.push(built.layer);
            guards.extend(built.guards);
            active_sinks.push(ActiveSink::new(kind, built.template));
        }
        layers.push(release.with_filter(engine_filter).boxed());

        let dispatch = Dispatch::new(tracing_subscriber::registry().with(layers));
        Ok(Logger::new(
            dispatch,
            self.minimum_level,
            active_sinks,
            guards,
        ))
    }

    /// Builds a [`Logger`], publishes it as the active logger and emits a bootstrap event
    /// through it.
    ///
    /// # Errors
    ///
    /// See [`PipelineConfiguration::build`]. On failure nothing is published and the
    /// previously active logger stays active.
    pub fn assemble(self) -> Result<Arc<Logger>, LoggerError> {
        let logger = Arc::new(self.build()?);
        // The replaced logger is flushed here, unless someone else still holds it.
        drop(handle::publish(Arc::clone(&logger)));
        logger.information(BOOTSTRAP_MESSAGE, &[]);
        Ok(logger)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        net::IpAddr,
        sync::{PoisonError, mpsc},
        time::Duration,
    };

    use super::*;
    use crate::{enrichment::CORRELATION_ID_HEADER, request_context::RequestContext};

    fn read_log(directory: &tempfile::TempDir, file_name: &str) -> String {
        fs::read_to_string(directory.path().join(file_name)).expect("log file should exist")
    }

    #[test]
    fn attaching_a_second_descriptor_replaces_the_first() {
        let configuration = PipelineConfiguration::new()
            .log_to_console(ConsoleSinkOptions::default().with_minimum_level(LogLevel::Debug))
            .log_to_file(FileSinkOptions::new("first.log"))
            .attach(ConsoleSinkOptions::default().with_minimum_level(LogLevel::Warning));

        assert_eq!(configuration.sinks().count(), 2);
        match configuration.sink(SinkKind::Console) {
            Some(SinkDescriptor::Console(options)) => {
                assert_eq!(options.minimum_level, LogLevel::Warning);
            }
            other => panic!("unexpected console descriptor: {other:?}"),
        }
    }

    #[test]
    fn the_first_application_identity_wins() {
        let configuration = PipelineConfiguration::new()
            .with_application("orders", 1)
            .with_application("billing", 2);

        assert_eq!(
            configuration.application(),
            Some(&ApplicationInfo {
                name: "orders".to_string(),
                instance_id: 1,
            })
        );
    }

    #[test]
    fn sinks_share_the_enriched_template_unless_overridden() {
        let directory = tempfile::tempdir().expect("temporary directory");
        let plan = EnrichmentPlan::new().with_thread(false, true, "main");
        let configuration = PipelineConfiguration::new()
            .enrich(plan.clone())
            .log_to_console(ConsoleSinkOptions::default())
            .log_to_file(FileSinkOptions::new(
                directory.path().join("app.log").to_string_lossy(),
            ));

        let logger = configuration.build().expect("logger should build");
        let templates = logger
            .active_sinks()
            .iter()
            .map(|sink| (sink.kind(), sink.template().as_str().to_string()))
            .collect::<Vec<_>>();

        assert_eq!(
            templates,
            vec![
                (SinkKind::Console, plan.output_template()),
                (SinkKind::File, plan.output_template()),
            ]
        );
        assert!(plan.output_template().contains("ThreadId:{ThreadId},"));

        let overridden = configuration
            .log_to_console(ConsoleSinkOptions::default().with_output_template("{Message}"))
            .build()
            .expect("logger should build");
        assert_eq!(
            overridden
                .sink(SinkKind::Console)
                .map(|sink| sink.template().as_str()),
            Some("{Message}")
        );
        assert_eq!(
            overridden
                .sink(SinkKind::File)
                .map(|sink| sink.template().as_str().to_string()),
            Some(plan.output_template())
        );
    }

    #[test]
    fn events_carry_static_fields_and_the_correlation_id() {
        let directory = tempfile::tempdir().expect("temporary directory");
        let logger = PipelineConfiguration::new()
            .with_application("orders", 7)
            .with_minimum_level(LogLevel::Information)
            .log_to_file(
                FileSinkOptions::new(directory.path().join("app.log").to_string_lossy())
                    .with_output_template(
                        "{Level:u3}|{Application}|{ApplicationInstance}|{CorrelationId}|{Message}",
                    ),
            )
            .build()
            .expect("logger should build");

        RequestContext::new()
            .with_header(CORRELATION_ID_HEADER, "req-1")
            .with_client_ip(IpAddr::from([127, 0, 0, 1]))
            .scope(|| {
                logger.debug("filtered out", &[]);
                logger.information("Order {OrderId} shipped", &[&17]);
            });
        logger.warning("No request", &[]);
        drop(logger);

        assert_eq!(
            read_log(&directory, "app.log"),
            "INF|orders|7|req-1|Order 17 shipped\nWRN|orders|7||No request\n"
        );
    }

    #[test]
    fn tracing_macros_reach_the_sinks_in_scope() {
        let directory = tempfile::tempdir().expect("temporary directory");
        let logger = PipelineConfiguration::new()
            .log_to_file(
                FileSinkOptions::new(directory.path().join("app.log").to_string_lossy())
                    .with_output_template("{Level:u3} {Message} {tenant}"),
            )
            .build()
            .expect("logger should build");

        logger.in_scope(|| {
            let span = tracing::info_span!("request", tenant = "acme");
            let _entered = span.enter();
            tracing::error!(fatal = true, "giving up");
        });

        assert_eq!(read_log(&directory, "app.log"), "FTL giving up acme\n");
    }

    #[test]
    fn invalid_templates_and_directives_fail_the_build() {
        let template_error = PipelineConfiguration::new()
            .log_to_console(ConsoleSinkOptions::default().with_output_template("{Message"))
            .build();
        assert!(matches!(
            template_error,
            Err(LoggerError::SinkBuild {
                kind: SinkKind::Console,
                ..
            })
        ));

        let directive_error = PipelineConfiguration::new()
            .with_filtering_directive("my_app=loud")
            .log_to_console(ConsoleSinkOptions::default())
            .build();
        assert!(matches!(
            directive_error,
            Err(LoggerError::SinkBuild {
                kind: SinkKind::Console,
                ..
            })
        ));

        let table_error = PipelineConfiguration::new()
            .log_to_relational_table(
                RelationalTableSinkOptions::new(":memory:").with_table_name("bad name"),
            )
            .build();
        assert!(matches!(
            table_error,
            Err(LoggerError::SinkBuild {
                kind: SinkKind::RelationalTable,
                ..
            })
        ));
    }

    #[test]
    fn unusable_batching_periods_fail_the_build() {
        for period in [Duration::ZERO, Duration::MAX] {
            let result = PipelineConfiguration::new()
                .log_to_relational_table(
                    RelationalTableSinkOptions::new(":memory:").with_batching(10, period),
                )
                .build();
            assert!(
                matches!(
                    result,
                    Err(LoggerError::SinkBuild {
                        kind: SinkKind::RelationalTable,
                        ..
                    })
                ),
                "period {period:?} should be rejected"
            );
        }
    }

    #[test]
    fn loggers_are_dropped_while_spans_are_alive() {
        let directory = tempfile::tempdir().expect("temporary directory");
        let database = directory.path().join("logs.db");
        let logger = PipelineConfiguration::new()
            .log_to_relational_table(
                RelationalTableSinkOptions::new(database.to_string_lossy())
                    .with_auto_create_table(true),
            )
            .build()
            .expect("logger should build");

        logger.information("Request started", &[]);
        let span = logger.in_scope(|| tracing::info_span!("request"));

        let (dropped_sender, dropped) = mpsc::channel();
        std::thread::spawn(move || {
            drop(logger);
            let _ = dropped_sender.send(());
        });
        dropped
            .recv_timeout(Duration::from_secs(10))
            .expect("logger should be dropped while the span is alive");
        drop(span);

        use diesel::{Connection, RunQueryDsl, sql_types::BigInt};
        #[derive(diesel::QueryableByName)]
        struct Count {
            #[diesel(sql_type = BigInt)]
            total: i64,
        }
        let mut connection = diesel::SqliteConnection::establish(&database.to_string_lossy())
            .expect("database should open");
        let count = diesel::sql_query("SELECT COUNT(*) AS total FROM \"Logs\"")
            .get_result::<Count>(&mut connection)
            .expect("count should load");
        assert_eq!(count.total, 1);
    }

    #[test]
    fn failed_assembly_keeps_the_active_logger() {
        let _lock = handle::TEST_LOCK
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let directory = tempfile::tempdir().expect("temporary directory");
        let active = PipelineConfiguration::new()
            .log_to_file(FileSinkOptions::new(
                directory.path().join("active.log").to_string_lossy(),
            ))
            .assemble()
            .expect("first assembly should succeed");
        assert!(read_log(&directory, "active.log").contains(BOOTSTRAP_MESSAGE));

        // A regular file cannot be used as a log directory.
        let blocker = directory.path().join("blocker");
        fs::write(&blocker, "").expect("blocker file");
        let result = PipelineConfiguration::new()
            .log_to_console(ConsoleSinkOptions::default())
            .log_to_file(FileSinkOptions::new(
                blocker.join("app.log").to_string_lossy(),
            ))
            .assemble();

        assert!(matches!(
            result,
            Err(LoggerError::SinkBuild {
                kind: SinkKind::File,
                ..
            })
        ));
        assert!(handle::current().is_some_and(|current| Arc::ptr_eq(&current, &active)));
    }

    #[test]
    fn assembly_writes_rows_to_the_relational_table() {
        let _lock = handle::TEST_LOCK
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let directory = tempfile::tempdir().expect("temporary directory");
        let database = directory.path().join("logs.db");
        let logger = PipelineConfiguration::new()
            .with_application("orders", 1)
            .log_to_relational_table(
                RelationalTableSinkOptions::new(database.to_string_lossy())
                    .with_auto_create_table(true),
            )
            .assemble()
            .expect("assembly should succeed");
        logger.error(None, "Payment {PaymentId} declined", &[&"p-1"]);

        // Release every holder so the worker drains its queue.
        drop(logger);
        drop(handle::publish(Arc::new(
            PipelineConfiguration::new()
                .build()
                .expect("empty logger should build"),
        )));

        #[derive(diesel::QueryableByName)]
        struct Row {
            #[diesel(sql_type = diesel::sql_types::Text)]
            message: String,
            #[diesel(sql_type = diesel::sql_types::Text)]
            properties: String,
        }

        use diesel::{Connection, RunQueryDsl};
        let mut connection = diesel::SqliteConnection::establish(&database.to_string_lossy())
            .expect("database should open");
        let rows = diesel::sql_query(
            "SELECT \"Message\" AS message, \"Properties\" AS properties FROM \"Logs\" \
             ORDER BY \"Id\"",
        )
        .load::<Row>(&mut connection)
        .expect("rows should load");

        let messages = rows.iter().map(|row| row.message.as_str()).collect::<Vec<_>>();
        assert_eq!(messages, vec![BOOTSTRAP_MESSAGE, "Payment p-1 declined"]);
        assert!(rows
            .iter()
            .all(|row| row.properties.contains("\"Application\":\"orders\"")));
    }
}
