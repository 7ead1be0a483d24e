// chbulk-core - Write-path buffering pipeline
//
// Coalesces many single-row insert statements into large batches per
// destination table, delivers them across a pool of backend nodes with
// failover, spills undeliverable batches to a durable overflow store, and
// suppresses client-side retry duplicates through a fingerprint cache.
//
// Buffered inserts are acknowledged before delivery completes: the proxy
// trades per-insert delivery confirmation for low-latency ingestion, with
// at-least-once delivery backed by the overflow store.

pub mod batch;
pub mod cache;
pub mod collector;
pub mod dump;
pub mod error;
pub mod query;
pub mod sender;

pub use batch::PendingBatch;
pub use cache::{fingerprint, DedupCache, DedupOptions};
pub use collector::Collector;
pub use dump::Dumper;
pub use error::{Error, Result};
pub use query::{parse_query, percent_encode, Classified, InsertStatement, RowFormat};
pub use sender::{BatchSink, NodeStatus, Sender};
