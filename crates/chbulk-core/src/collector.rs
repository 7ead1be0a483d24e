// Collector
//
// Top-level orchestrator of the buffering pipeline: accepts classified
// insert statements, buffers them per destination table, decides flush
// timing (count threshold inline with the push, age threshold on a periodic
// task), and owns graceful-shutdown draining.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::batch::PendingBatch;
use crate::cache::{fingerprint, DedupCache};
use crate::query::{InsertStatement, RowFormat};
use crate::sender::BatchSink;

/// Per-table buffer of pending row fragments sharing one statement prefix.
struct StatementGroup {
    /// Routed params captured from the first statement of the current
    /// window; every fragment in the group shares this prefix.
    params: String,
    format: RowFormat,
    fragments: Vec<String>,
    /// Newline-delimited row fragment count, the flush-count unit.
    count: usize,
    bytes: usize,
    created_at: Instant,
}

impl StatementGroup {
    fn new(params: String, format: RowFormat) -> Self {
        Self {
            params,
            format,
            fragments: Vec::new(),
            count: 0,
            bytes: 0,
            created_at: Instant::now(),
        }
    }

    fn push_fragment(&mut self, content: String) {
        // The age window belongs to the first statement of the window, not
        // to the previous flush.
        if self.fragments.is_empty() {
            self.created_at = Instant::now();
        }
        self.count += content.matches('\n').count() + 1;
        self.bytes += content.len();
        self.fragments.push(content);
    }

    fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Serialize the buffered fragments into one batch and reset the
    /// group. Returns `None` when there is nothing to flush.
    fn take(&mut self) -> Option<PendingBatch> {
        if self.fragments.is_empty() {
            return None;
        }
        let content = self.fragments.join(self.format.separator());
        self.fragments.clear();
        self.count = 0;
        self.bytes = 0;
        Some(PendingBatch::new(self.params.clone(), content))
    }
}

/// Buffers inserts per table and hands completed batches to the sink.
///
/// Pushes to different tables proceed independently: the outer map lock is
/// held only to fetch the per-table handle, and the per-table lock is
/// released before any batch leaves through the sink.
pub struct Collector {
    sink: Box<dyn BatchSink>,
    cache: Option<Arc<DedupCache>>,
    flush_count: usize,
    flush_interval: Duration,
    tables: Mutex<HashMap<String, Arc<Mutex<StatementGroup>>>>,
    flush_done: Notify,
}

impl Collector {
    pub fn new(
        sink: impl BatchSink,
        flush_count: usize,
        flush_interval: Duration,
        cache: Option<Arc<DedupCache>>,
    ) -> Self {
        Self {
            sink: Box::new(sink),
            cache,
            flush_count: flush_count.max(1),
            flush_interval,
            tables: Mutex::new(HashMap::new()),
            flush_done: Notify::new(),
        }
    }

    fn group(&self, stmt: &InsertStatement) -> Arc<Mutex<StatementGroup>> {
        let mut tables = self.tables.lock();
        Arc::clone(tables.entry(stmt.table.clone()).or_insert_with(|| {
            Arc::new(Mutex::new(StatementGroup::new(
                stmt.params.clone(),
                stmt.format,
            )))
        }))
    }

    /// Accept one classified insert. Duplicates within the dedup window are
    /// a silent no-op (already accepted); otherwise the content is appended
    /// to its table's group and the count threshold is checked inline.
    pub fn push(&self, stmt: InsertStatement) {
        counter!("chbulk.ingest.statements", 1);

        if let Some(cache) = &self.cache {
            if !cache.insert(fingerprint(&stmt.params, &stmt.content)) {
                counter!("chbulk.ingest.duplicates", 1);
                debug!(table = %stmt.table, "dropping duplicate statement");
                return;
            }
        }

        let group = self.group(&stmt);
        let (displaced, ready) = {
            let mut group = group.lock();
            // A changed prefix (different columns, auth, or format) flushes
            // the old window before starting a new one.
            let displaced = if group.params != stmt.params {
                let old = group.take();
                group.params = stmt.params;
                group.format = stmt.format;
                old
            } else {
                None
            };
            group.push_fragment(stmt.content);
            let ready = if group.count >= self.flush_count {
                group.take()
            } else {
                None
            };
            (displaced, ready)
        };

        for batch in [displaced, ready].into_iter().flatten() {
            self.dispatch(batch);
        }
    }

    fn dispatch(&self, batch: PendingBatch) {
        counter!("chbulk.flush.batches", 1);
        self.sink.enqueue(batch);
    }

    fn snapshot(&self) -> Vec<Arc<Mutex<StatementGroup>>> {
        self.tables.lock().values().cloned().collect()
    }

    /// Flush every table group immediately; used during shutdown.
    pub fn flush_all(&self) {
        for group in self.snapshot() {
            if let Some(batch) = group.lock().take() {
                self.dispatch(batch);
            }
        }
    }

    /// Flush every group whose age reached the flush interval, bounding
    /// latency for low-traffic tables.
    pub fn flush_aged(&self) {
        for group in self.snapshot() {
            let batch = {
                let mut group = group.lock();
                if !group.is_empty() && group.age() >= self.flush_interval {
                    group.take()
                } else {
                    None
                }
            };
            if let Some(batch) = batch {
                self.dispatch(batch);
            }
        }
    }

    /// Whether all table groups are currently clear.
    pub fn is_empty(&self) -> bool {
        self.snapshot().iter().all(|g| g.lock().is_empty())
    }

    /// Pending fragment counts per table, for the status endpoint.
    pub fn pending_tables(&self) -> HashMap<String, usize> {
        self.tables
            .lock()
            .iter()
            .map(|(table, group)| (table.clone(), group.lock().count))
            .collect()
    }

    /// Block until the next interval flush cycle completes.
    pub async fn wait_flush(&self) {
        self.flush_done.notified().await;
    }

    /// Start the interval flusher. Fires every `flush_interval`, flushes
    /// aged groups, and wakes `wait_flush` callers after each cycle.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let collector = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(collector.flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                collector.flush_aged();
                collector.flush_done.notify_waiters();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DedupOptions;
    use crate::query::{parse_query, percent_decode, Classified};

    #[derive(Clone, Default)]
    struct RecordingSink {
        batches: Arc<Mutex<Vec<PendingBatch>>>,
    }

    impl RecordingSink {
        fn drained(&self) -> Vec<PendingBatch> {
            self.batches.lock().clone()
        }
    }

    impl BatchSink for RecordingSink {
        fn enqueue(&self, batch: PendingBatch) {
            self.batches.lock().push(batch);
        }
    }

    fn insert(body: &str) -> InsertStatement {
        match parse_query("", body) {
            Classified::Insert(stmt) => stmt,
            Classified::PassThrough => panic!("statement not recognized as insert: {body}"),
        }
    }

    fn collector(sink: &RecordingSink, flush_count: usize) -> Collector {
        Collector::new(
            sink.clone(),
            flush_count,
            Duration::from_secs(60),
            None,
        )
    }

    #[test]
    fn coalesces_values_inserts_in_arrival_order() {
        let sink = RecordingSink::default();
        let c = collector(&sink, 2);

        c.push(insert("INSERT INTO t (a) VALUES (1)"));
        assert!(sink.drained().is_empty());
        c.push(insert("INSERT INTO t (a) VALUES (2)"));

        let batches = sink.drained();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].content, "(1)(2)");
        assert_eq!(
            percent_decode(batches[0].params.strip_prefix("query=").unwrap()),
            "INSERT INTO t (a) VALUES"
        );
        assert!(c.is_empty());
    }

    #[test]
    fn newline_fragments_count_toward_threshold() {
        let sink = RecordingSink::default();
        let c = collector(&sink, 3);

        c.push(insert("INSERT INTO t (a) VALUES (1)\n(2)"));
        assert!(sink.drained().is_empty());
        c.push(insert("INSERT INTO t (a) VALUES (3)"));

        let batches = sink.drained();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].content, "(1)\n(2)(3)");
    }

    #[test]
    fn tables_buffer_independently() {
        let sink = RecordingSink::default();
        let c = collector(&sink, 2);

        c.push(insert("INSERT INTO a (x) VALUES (1)"));
        c.push(insert("INSERT INTO b (x) VALUES (1)"));
        assert!(sink.drained().is_empty());
        assert_eq!(c.pending_tables().len(), 2);

        c.push(insert("INSERT INTO a (x) VALUES (2)"));
        let batches = sink.drained();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].content, "(1)(2)");
    }

    #[test]
    fn flush_all_drains_every_group() {
        let sink = RecordingSink::default();
        let c = collector(&sink, 100);

        c.push(insert("INSERT INTO a (x) VALUES (1)"));
        c.push(insert("INSERT INTO b (x) VALUES (2)"));
        assert!(!c.is_empty());

        c.flush_all();
        assert_eq!(sink.drained().len(), 2);
        assert!(c.is_empty());
    }

    #[test]
    fn prefix_mismatch_flushes_old_group_first() {
        let sink = RecordingSink::default();
        let c = collector(&sink, 100);

        c.push(insert("INSERT INTO t (a) VALUES (1)"));
        c.push(insert("INSERT INTO t (b) VALUES (2)"));

        let batches = sink.drained();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].content, "(1)");
        assert_eq!(
            percent_decode(batches[0].params.strip_prefix("query=").unwrap()),
            "INSERT INTO t (a) VALUES"
        );

        c.flush_all();
        let batches = sink.drained();
        assert_eq!(batches[1].content, "(2)");
        assert_eq!(
            percent_decode(batches[1].params.strip_prefix("query=").unwrap()),
            "INSERT INTO t (b) VALUES"
        );
    }

    #[test]
    fn lines_format_joins_with_newlines() {
        let sink = RecordingSink::default();
        let c = collector(&sink, 2);

        c.push(insert("INSERT INTO t FORMAT TabSeparated\n1\tx"));
        c.push(insert("INSERT INTO t FORMAT TabSeparated\n2\ty"));

        let batches = sink.drained();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].content, "1\tx\n2\ty");
    }

    #[test]
    fn duplicate_within_life_window_is_buffered_once() {
        let cache = Arc::new(
            DedupCache::new(DedupOptions {
                shards: 4,
                life_window: Duration::from_secs(60),
                ..DedupOptions::default()
            })
            .unwrap(),
        );
        let sink = RecordingSink::default();
        let c = Collector::new(sink.clone(), 100, Duration::from_secs(60), Some(cache));

        c.push(insert("INSERT INTO t (a) VALUES (1)"));
        c.push(insert("INSERT INTO t (a) VALUES (1)"));
        c.flush_all();

        let batches = sink.drained();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].content, "(1)");
    }

    #[test]
    fn repeat_push_after_life_window_is_buffered_again() {
        let cache = Arc::new(
            DedupCache::new(DedupOptions {
                shards: 4,
                life_window: Duration::from_millis(20),
                ..DedupOptions::default()
            })
            .unwrap(),
        );
        let sink = RecordingSink::default();
        let c = Collector::new(sink.clone(), 100, Duration::from_secs(60), Some(cache));

        c.push(insert("INSERT INTO t (a) VALUES (1)"));
        std::thread::sleep(Duration::from_millis(30));
        c.push(insert("INSERT INTO t (a) VALUES (1)"));
        c.flush_all();

        let batches = sink.drained();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].content, "(1)(1)");
    }

    #[test]
    fn age_window_starts_at_first_fragment_after_idle_gap() {
        let sink = RecordingSink::default();
        let c = Collector::new(sink.clone(), 100, Duration::from_millis(50), None);

        c.push(insert("INSERT INTO t (a) VALUES (1)"));
        c.flush_all();
        assert_eq!(sink.drained().len(), 1);

        // Idle longer than the flush interval, then start a new window.
        std::thread::sleep(Duration::from_millis(80));
        c.push(insert("INSERT INTO t (a) VALUES (2)"));
        c.flush_aged();
        assert_eq!(sink.drained().len(), 1);

        std::thread::sleep(Duration::from_millis(60));
        c.flush_aged();
        let batches = sink.drained();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].content, "(2)");
    }

    #[tokio::test]
    async fn interval_flusher_drains_aged_groups() {
        let sink = RecordingSink::default();
        let c = Arc::new(Collector::new(
            sink.clone(),
            100,
            Duration::from_millis(30),
            None,
        ));
        let task = c.start();

        c.push(insert("INSERT INTO t (a) VALUES (1)"));
        tokio::time::timeout(Duration::from_secs(2), async {
            while !c.is_empty() {
                c.wait_flush().await;
            }
        })
        .await
        .expect("aged group never flushed");

        let batches = sink.drained();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].content, "(1)");
        task.abort();
    }

    #[tokio::test]
    async fn wait_flush_wakes_on_every_cycle() {
        let sink = RecordingSink::default();
        let c = Arc::new(Collector::new(
            sink.clone(),
            100,
            Duration::from_millis(10),
            None,
        ));
        let task = c.start();

        for _ in 0..3 {
            tokio::time::timeout(Duration::from_secs(1), c.wait_flush())
                .await
                .expect("flush cycle never completed");
        }
        task.abort();
    }
}
