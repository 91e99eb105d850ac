//! Relational table output: batches of events inserted as rows of a SQLite table.

use std::time::Duration;

use diesel::{
    Connection, RunQueryDsl, SqliteConnection,
    sql_types::{Nullable, Text},
    sqlite::Sqlite,
};
use tracing_subscriber::Layer;

use super::{
    BuiltSink, SinkBuildContext, SinkGuard, SinkKind,
    batching::{self, BatchOptions, BatchTransport},
};
use crate::{LoggerError, event::LogEvent, level::LogLevel, template::OutputTemplate};

/// The columns a log table may have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StandardColumn {
    /// The rendered message.
    Message,

    /// The message template, if any.
    MessageTemplate,

    /// The level name.
    Level,

    /// The RFC 3339 timestamp.
    TimeStamp,

    /// The exception text, if any.
    Exception,

    /// Every property of the event, as a JSON object.
    Properties,
}

impl StandardColumn {
    /// Every column, in table order.
    pub const ALL: [Self; 6] = [
        Self::Message,
        Self::MessageTemplate,
        Self::Level,
        Self::TimeStamp,
        Self::Exception,
        Self::Properties,
    ];

    /// Column name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Message => "Message",
            Self::MessageTemplate => "MessageTemplate",
            Self::Level => "Level",
            Self::TimeStamp => "TimeStamp",
            Self::Exception => "Exception",
            Self::Properties => "Properties",
        }
    }

    /// Value of the column for `event`.
    fn value(self, event: &LogEvent) -> Option<String> {
        match self {
            Self::Message => Some(event.message.clone()),
            Self::MessageTemplate => event.message_template.clone(),
            Self::Level => Some(event.level.name().to_string()),
            Self::TimeStamp => event
                .timestamp
                .format(&time::format_description::well_known::Rfc3339)
                .ok(),
            Self::Exception => event.exception.as_ref().map(|exception| exception.render_text()),
            Self::Properties => serde_json::to_string(&event.properties).ok(),
        }
    }
}

/// Configuration of the relational table sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationalTableSinkOptions {
    /// Database to connect to: a file path, a `file:` URI or `:memory:`.
    pub connection_string: String,

    /// Table the events are inserted into. Defaults to `Logs`.
    pub table_name: String,

    /// Minimum level written to the table.
    pub minimum_level: LogLevel,

    /// Whether the table is created when it does not exist.
    pub auto_create_table: bool,

    /// Maximum number of rows per transaction. Defaults to 50.
    pub batch_posting_limit: usize,

    /// Time between two transactions. Defaults to 5 seconds.
    pub period: Duration,

    /// Maximum number of events waiting to be written. Defaults to 100 000.
    pub queue_size_limit: usize,

    /// Columns written for every event. Defaults to every [`StandardColumn`].
    pub columns: Vec<StandardColumn>,
}

impl RelationalTableSinkOptions {
    /// Relational table sink options for the database at `connection_string`, everything else
    /// at its default.
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            table_name: "Logs".to_string(),
            minimum_level: LogLevel::default(),
            auto_create_table: false,
            batch_posting_limit: 50,
            period: Duration::from_secs(5),
            queue_size_limit: 100_000,
            columns: StandardColumn::ALL.to_vec(),
        }
    }

    /// Sets the table name.
    #[must_use]
    pub fn with_table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = table_name.into();
        self
    }

    /// Sets the minimum level written to the table.
    #[must_use]
    pub fn with_minimum_level(mut self, level: LogLevel) -> Self {
        self.minimum_level = level;
        self
    }

    /// Creates the table when it does not exist.
    #[must_use]
    pub fn with_auto_create_table(mut self, auto_create_table: bool) -> Self {
        self.auto_create_table = auto_create_table;
        self
    }

    /// Sets the columns written for every event.
    #[must_use]
    pub fn with_columns(mut self, columns: impl IntoIterator<Item = StandardColumn>) -> Self {
        self.columns = columns.into_iter().collect();
        self
    }

    /// Sets the number of rows per transaction and the time between two transactions.
    #[must_use]
    pub fn with_batching(mut self, batch_posting_limit: usize, period: Duration) -> Self {
        self.batch_posting_limit = batch_posting_limit;
        self.period = period;
        self
    }

    /// Sets the maximum number of events waiting to be written.
    #[must_use]
    pub fn with_queue_size_limit(mut self, queue_size_limit: usize) -> Self {
        self.queue_size_limit = queue_size_limit;
        self
    }
}

/// Identifiers are interpolated into statements, so only plain names are accepted.
fn validate_table_name(table_name: &str) -> Result<(), LoggerError> {
    let valid = table_name
        .chars()
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
        && table_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid {
        Ok(())
    } else {
        Err(LoggerError::Configuration(format!(
            "invalid table name `{table_name}` for the {} sink",
            SinkKind::RelationalTable
        )))
    }
}

fn create_table_statement(table_name: &str, columns: &[StandardColumn]) -> String {
    let columns = columns
        .iter()
        .map(|column| format!(", \"{}\" TEXT NULL", column.name()))
        .collect::<String>();
    format!(
        "CREATE TABLE IF NOT EXISTS \"{table_name}\" \
         (\"Id\" INTEGER PRIMARY KEY AUTOINCREMENT{columns})"
    )
}

fn insert_statement(table_name: &str, columns: &[StandardColumn]) -> String {
    let names = columns
        .iter()
        .map(|column| format!("\"{}\"", column.name()))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = vec!["?"; columns.len()].join(", ");
    format!("INSERT INTO \"{table_name}\" ({names}) VALUES ({placeholders})")
}

struct RelationalTableTransport {
    connection: SqliteConnection,
    insert_statement: String,
    columns: Vec<StandardColumn>,
}

impl std::fmt::Debug for RelationalTableTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelationalTableTransport")
            .field("insert_statement", &self.insert_statement)
            .field("columns", &self.columns)
            .finish_non_exhaustive()
    }
}

impl BatchTransport for RelationalTableTransport {
    fn emit_batch(&mut self, batch: &[LogEvent]) -> Result<(), LoggerError> {
        let Self {
            connection,
            insert_statement,
            columns,
        } = self;

        connection.transaction::<_, diesel::result::Error, _>(|connection| {
            for event in batch {
                let mut query = diesel::sql_query(insert_statement.as_str()).into_boxed::<Sqlite>();
                for column in columns.iter() {
                    query = query.bind::<Nullable<Text>, _>(column.value(event));
                }
                query.execute(connection)?;
            }
            Ok(())
        })?;
        Ok(())
    }
}

pub(super) fn build(
    options: &RelationalTableSinkOptions,
    context: &SinkBuildContext<'_>,
    template: OutputTemplate,
) -> Result<BuiltSink, LoggerError> {
    let filter = context.filter(None, options.minimum_level)?;
    validate_table_name(&options.table_name)?;
    if options.columns.is_empty() {
        return Err(LoggerError::Configuration(format!(
            "the {} sink requires at least one column",
            SinkKind::RelationalTable
        )));
    }

    let mut connection = SqliteConnection::establish(&options.connection_string)?;
    if options.auto_create_table {
        diesel::sql_query(create_table_statement(&options.table_name, &options.columns))
            .execute(&mut connection)?;
    }

    let transport = RelationalTableTransport {
        connection,
        insert_statement: insert_statement(&options.table_name, &options.columns),
        columns: options.columns.clone(),
    };

    let (layer, guard) = batching::spawn(
        transport,
        context.events.clone(),
        BatchOptions {
            sink: SinkKind::RelationalTable,
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
