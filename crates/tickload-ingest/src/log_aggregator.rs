//! Single sink for the log records of every shard
//!
//! Shard tasks log through the ordinary `tracing` macros. A [`ChannelLayer`]
//! installed next to the console and file layers turns every event into a
//! [`LogRecord`], tags it with the `shard` field of the closest enclosing span
//! and pushes it into a bounded channel without blocking. One
//! [`LogAggregator`] task drains the channel into its writer, so lines from
//! parallel shards never interleave mid-line.
//!
//! When the channel is full the record is dropped and counted; logging never
//! slows ingestion down.

use std::fmt::{self, Write as _};
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Local};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// Span and event field naming the shard a record belongs to
pub const SHARD_FIELD: &str = "shard";

/// One captured log event
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub level: Level,
    pub timestamp: DateTime<Local>,
    pub shard: Option<String>,
    pub target: String,
    pub message: String,
}

impl LogRecord {
    /// `LEVEL: timestamp - shard - message`
    pub fn format_line(&self) -> String {
        format!(
            "{}: {} - {} - {}",
            self.level,
            self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.shard.as_deref().unwrap_or("-"),
            self.message
        )
    }
}

#[derive(Debug)]
enum Envelope {
    Record(LogRecord),
    Shutdown,
}

/// Shard tag stored in span extensions
struct ShardTag(String);

/// Collects the message, the shard and any other fields of an event or span
#[derive(Default)]
struct RecordVisitor {
    message: String,
    fields: String,
    shard: Option<String>,
}

impl RecordVisitor {
    fn push(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message.push_str(value),
            SHARD_FIELD => self.shard = Some(value.to_string()),
            name => {
                let _ = write!(self.fields, " {name}={value}");
            },
        }
    }

    fn into_message(self) -> String {
        let mut message = self.message;
        message.push_str(&self.fields);
        message
    }
}

impl Visit for RecordVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.push(field, value);
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.push(field, &format!("{value:?}"));
    }
}

/// `tracing` layer feeding the aggregator channel
pub struct ChannelLayer {
    sender: mpsc::Sender<Envelope>,
    dropped: Arc<AtomicU64>,
}

impl<S> Layer<S> for ChannelLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let mut visitor = RecordVisitor::default();
        attrs.record(&mut visitor);
        if let (Some(shard), Some(span)) = (visitor.shard, ctx.span(id)) {
            span.extensions_mut().insert(ShardTag(shard));
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let mut visitor = RecordVisitor::default();
        event.record(&mut visitor);

        let shard = visitor.shard.take().or_else(|| {
            ctx.event_scope(event).and_then(|mut scope| {
                scope.find_map(|span| span.extensions().get::<ShardTag>().map(|tag| tag.0.clone()))
            })
        });

        let metadata = event.metadata();
        let record = LogRecord {
            level: *metadata.level(),
            timestamp: Local::now(),
            shard,
            target: metadata.target().to_string(),
            message: visitor.into_message(),
        };

        if self.sender.try_send(Envelope::Record(record)).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Counters reported when the aggregator finishes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregatorStats {
    pub written: u64,
    /// Records lost because the channel was full or already closed
    pub dropped: u64,
}

/// Owns the log sink and writes every record sent by the [`ChannelLayer`]
pub struct LogAggregator<W> {
    sender: mpsc::Sender<Envelope>,
    dropped: Arc<AtomicU64>,
    handle: JoinHandle<io::Result<(u64, W)>>,
}

fn channel_layer(capacity: usize) -> (ChannelLayer, mpsc::Receiver<Envelope>) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    let layer = ChannelLayer {
        sender,
        dropped: Arc::new(AtomicU64::new(0)),
    };
    (layer, receiver)
}

impl<W> LogAggregator<W>
where
    W: Write + Send + 'static,
{
    /// Start the writer task and return the layer producers log through
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(capacity: usize, sink: W) -> (Self, ChannelLayer) {
        let (layer, mut receiver) = channel_layer(capacity);

        let handle = tokio::task::spawn_blocking(move || {
            let mut sink = sink;
            let mut written = 0u64;
            while let Some(envelope) = receiver.blocking_recv() {
                match envelope {
                    Envelope::Record(record) => {
                        writeln!(sink, "{}", record.format_line())?;
                        written += 1;
                    },
                    Envelope::Shutdown => break,
                }
            }
            sink.flush()?;
            Ok((written, sink))
        });

        let aggregator = Self {
            sender: layer.sender.clone(),
            dropped: Arc::clone(&layer.dropped),
            handle,
        };
        (aggregator, layer)
    }

    /// Drain everything logged so far, stop the writer and hand the sink back
    pub async fn finish(self) -> io::Result<(AggregatorStats, W)> {
        // a closed channel means the writer already stopped; its result is below
        let _ = self.sender.send(Envelope::Shutdown).await;
        let (written, sink) = self.handle.await.map_err(io::Error::other)??;
        let stats = AggregatorStats {
            written,
            dropped: self.dropped.load(Ordering::Relaxed),
        };
        Ok((stats, sink))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tracing::{info, info_span, warn};
    use tracing_subscriber::layer::SubscriberExt;

    #[tokio::test]
    async fn test_records_are_tagged_with_enclosing_shard() {
        let (aggregator, layer) = LogAggregator::start(64, Vec::new());
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            let span = info_span!("shard", shard = "201705");
            let nested = span.in_scope(|| info_span!("file", name = "20170501_EUX_MKtrade.csv.gz"));
            nested.in_scope(|| info!(rows = 3, "Payload appended"));
            warn!("Outside any shard");
            info!(shard = "201806", "Explicit shard field");
        });

        let (stats, sink) = aggregator.finish().await.unwrap();
        let text = String::from_utf8(sink).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(stats, AggregatorStats { written: 3, dropped: 0 });
        assert!(lines[0].starts_with("INFO: "));
        assert!(lines[0].ends_with(" - 201705 - Payload appended rows=3"), "{}", lines[0]);
        assert!(lines[1].starts_with("WARN: "));
        assert!(lines[1].ends_with(" - - - Outside any shard"));
        assert!(lines[2].ends_with(" - 201806 - Explicit shard field"));
    }

    #[test]
    fn test_full_channel_drops_and_counts() {
        let (layer, _receiver) = channel_layer(1);
        let dropped = Arc::clone(&layer.dropped);
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            for i in 0..3 {
                info!(i, "burst");
            }
        });

        assert_eq!(dropped.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_format_line() {
        let record = LogRecord {
            level: Level::ERROR,
            timestamp: Local::now(),
            shard: Some("201705".into()),
            target: "tickload_ingest".into(),
            message: "boom".into(),
        };
        let line = record.format_line();
        assert!(line.starts_with("ERROR: "));
        assert!(line.ends_with(" - 201705 - boom"));
    }
}
