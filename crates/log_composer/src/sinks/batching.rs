//! Background batching shared by the remote sinks: events are captured on the logging thread,
//! queued, and emitted in batches by a dedicated worker thread.

use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use tracing::{Event, Subscriber};
use tracing_subscriber::{Layer, layer::Context, registry::LookupSpan};

use super::SinkKind;
use crate::{
    LoggerError,
    event::{EventContext, LogEvent},
    level::LogLevel,
};

/// How long dropping a [`BatchWorkerGuard`] waits for the worker to emit its last batch.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Ships batches of events to a remote store. Runs on the worker thread only.
pub(crate) trait BatchTransport: Send + 'static {
    /// Emits `batch`, in order.
    fn emit_batch(&mut self, batch: &[LogEvent]) -> Result<(), LoggerError>;
}

/// Batching parameters of a remote sink.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BatchOptions {
    pub(crate) sink: SinkKind,
    pub(crate) minimum_level: LogLevel,
    pub(crate) batch_posting_limit: usize,
    pub(crate) period: Duration,
    pub(crate) queue_size_limit: usize,
    pub(crate) report_failures: bool,
}

#[derive(Debug)]
enum Message {
    Event(LogEvent),
    Shutdown,
}

/// A [`tracing_subscriber::Layer`] that captures events and queues them for the worker.
#[derive(Debug)]
pub(crate) struct BatchingLayer {
    context: Arc<EventContext>,
    minimum_level: LogLevel,
    sender: SyncSender<Message>,
    dropped: Arc<AtomicU64>,
}

impl<S> Layer<S> for BatchingLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        if !self
            .context
            .may_pass(*event.metadata().level(), self.minimum_level)
        {
            return;
        }

        if let Some(log_event) = self.context.captured(event, &ctx, self.minimum_level) {
            let message = Message::Event(Arc::unwrap_or_clone(log_event));
            // Never block the logging thread; the worker reports dropped events.
            if let Err(TrySendError::Full(_)) = self.sender.try_send(message) {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Keeps the worker thread of a remote sink running.
///
/// Dropping the guard tells the worker to emit what is queued and stop, and waits for it at
/// most [`SHUTDOWN_TIMEOUT`]. Spans still referencing the engine do not delay it.
#[derive(Debug)]
pub(crate) struct BatchWorkerGuard {
    sink: SinkKind,
    sender: SyncSender<Message>,
    shutdown: Arc<AtomicBool>,
    // Disconnected once the worker returns.
    finished: Mutex<Receiver<()>>,
    worker: Option<JoinHandle<()>>,
}

impl Drop for BatchWorkerGuard {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        // Wakes an idle worker up. A full queue keeps the worker busy, and it checks the flag
        // after every event.
        let _ = self.sender.try_send(Message::Shutdown);

        let finished = self
            .finished
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        match finished.recv_timeout(SHUTDOWN_TIMEOUT) {
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    sink = %self.sink,
                    timeout = ?SHUTDOWN_TIMEOUT,
                    "Worker did not finish emitting its queue in time"
                );
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(worker) = self.worker.take() {
                    let _ = worker.join();
                }
            }
        }
    }
}

/// Spawns the worker thread emitting through `transport`, returning the layer feeding it.
pub(crate) fn spawn<T: BatchTransport>(
    transport: T,
    context: Arc<EventContext>,
    options: BatchOptions,
) -> Result<(BatchingLayer, BatchWorkerGuard), LoggerError> {
    if options.batch_posting_limit == 0 || options.queue_size_limit == 0 {
        return Err(LoggerError::Configuration(format!(
            "the {} sink requires a non-zero batch size and queue size",
            options.sink
        )));
    }
    if options.period.is_zero() || Instant::now().checked_add(options.period).is_none() {
        return Err(LoggerError::Configuration(format!(
            "the {} sink requires a non-zero period, got {:?}",
            options.sink, options.period
        )));
    }

    let (sender, receiver) = mpsc::sync_channel(options.queue_size_limit);
    let (finished_sender, finished) = mpsc::channel();
    let dropped = Arc::new(AtomicU64::new(0));
    let shutdown = Arc::new(AtomicBool::new(false));

    let worker = {
        let dropped = Arc::clone(&dropped);
        let shutdown = Arc::clone(&shutdown);
        std::thread::Builder::new()
            .name(format!("{}-sink", options.sink.name().replace(' ', "-")))
            .spawn(move || {
                run(transport, &receiver, &dropped, &shutdown, options);
                drop(finished_sender);
            })?
    };

    Ok((
        BatchingLayer {
            context,
            minimum_level: options.minimum_level,
            sender: sender.clone(),
            dropped,
        },
        BatchWorkerGuard {
            sink: options.sink,
            sender,
            shutdown,
            finished: Mutex::new(finished),
            worker: Some(worker),
        },
    ))
}

/// Collects events until a batch is full or the period elapses, then emits the batch.
/// Returns once shutdown is requested, or every sender is gone, and the queued events have
/// been emitted.
fn run<T: BatchTransport>(
    mut transport: T,
    receiver: &Receiver<Message>,
    dropped: &AtomicU64,
    shutdown: &AtomicBool,
    options: BatchOptions,
) {
    let mut batch = Vec::with_capacity(options.batch_posting_limit);
    let mut deadline = Instant::now().checked_add(options.period);

    loop {
        let timeout = deadline.map_or(options.period, |deadline| {
            deadline.saturating_duration_since(Instant::now())
        });
        let stopping = match receiver.recv_timeout(timeout) {
            Ok(Message::Event(event)) => {
                batch.push(event);
                let stopping = shutdown.load(Ordering::Acquire);
                if batch.len() < options.batch_posting_limit && !stopping {
                    continue;
                }
                stopping
            }
            Ok(Message::Shutdown) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
        };

        if stopping {
            break;
        }
        flush(&mut transport, &mut batch, dropped, &options);
        deadline = Instant::now().checked_add(options.period);
    }

    // Live spans may keep the layer feeding the queue, so only what is queued now is taken.
    for message in receiver.try_iter().take(options.queue_size_limit) {
        if let Message::Event(event) = message {
            batch.push(event);
            if batch.len() >= options.batch_posting_limit {
                flush(&mut transport, &mut batch, dropped, &options);
            }
        }
    }
    flush(&mut transport, &mut batch, dropped, &options);
}

fn flush<T: BatchTransport>(
    transport: &mut T,
    batch: &mut Vec<LogEvent>,
    dropped: &AtomicU64,
    options: &BatchOptions,
) {
    let dropped = dropped.swap(0, Ordering::Relaxed);
    if dropped > 0 && options.report_failures {
        tracing::warn!(
            sink = %options.sink,
            dropped,
            "Queue full, events were dropped"
        );
    }

    if batch.is_empty() {
        return;
    }

    // Failed batches are reported and discarded, never retried.
    if let Err(error) = transport.emit_batch(batch) {
        if options.report_failures {
            tracing::warn!(
                sink = %options.sink,
                events = batch.len(),
                %error,
                "Failed to emit a batch of events"
            );
        }
    }
    batch.clear();
}
