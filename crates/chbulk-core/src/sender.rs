// Backend node pool and failover delivery
//
// Owns the list of backend nodes and their health state. Buffered batches
// iterate candidate nodes in rotation order, demoting a node on failure and
// advancing to the next; pass-through statements get a single attempt and
// return the backend's response verbatim. When every node is exhausted the
// batch is diverted to the durable overflow store instead of being dropped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::counter;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::batch::PendingBatch;
use crate::dump::Dumper;
use crate::error::{Error, Result};

/// Fire-and-forget handoff seam between the collector and the delivery
/// machinery. The request path enqueues and returns immediately; delivery
/// runs on its own task.
pub trait BatchSink: Send + Sync + 'static {
    fn enqueue(&self, batch: PendingBatch);
}

/// Point-in-time health snapshot of one node, served by `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub url: String,
    pub up: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct NodeHealth {
    down_until: Option<Instant>,
    last_error: Option<String>,
}

#[derive(Debug)]
struct BackendNode {
    url: String,
    health: Mutex<NodeHealth>,
}

impl BackendNode {
    fn new(url: &str) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
            health: Mutex::new(NodeHealth::default()),
        }
    }

    /// A down node becomes eligible again once its down-until timestamp has
    /// elapsed; the next attempt is the optimistic half-open retry.
    fn is_available(&self) -> bool {
        self.health
            .lock()
            .down_until
            .is_none_or(|until| Instant::now() >= until)
    }

    fn mark_down(&self, timeout: Duration, err: &Error) {
        let mut health = self.health.lock();
        health.down_until = Some(Instant::now() + timeout);
        health.last_error = Some(err.to_string());
    }

    fn mark_up(&self) {
        let mut health = self.health.lock();
        health.down_until = None;
        health.last_error = None;
    }

    fn status(&self) -> NodeStatus {
        let health = self.health.lock();
        NodeStatus {
            url: self.url.clone(),
            up: health
                .down_until
                .is_none_or(|until| Instant::now() >= until),
            last_error: health.last_error.clone(),
        }
    }
}

struct SenderInner {
    nodes: RwLock<Vec<Arc<BackendNode>>>,
    cursor: AtomicUsize,
    client: reqwest::Client,
    down_timeout: Duration,
    dumper: RwLock<Option<Dumper>>,
    in_flight: AtomicUsize,
}

/// Shared handle to the node pool; cheap to clone across tasks.
#[derive(Clone)]
pub struct Sender {
    inner: Arc<SenderInner>,
}

impl Sender {
    pub fn new(down_timeout: Duration, connect_timeout: Option<Duration>) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        Ok(Self {
            inner: Arc::new(SenderInner {
                nodes: RwLock::new(Vec::new()),
                cursor: AtomicUsize::new(0),
                client: builder.build()?,
                down_timeout,
                dumper: RwLock::new(None),
                in_flight: AtomicUsize::new(0),
            }),
        })
    }

    /// Register a backend node in Up state.
    pub fn add_server(&self, url: &str) {
        info!(url, "registered backend node");
        self.inner.nodes.write().push(Arc::new(BackendNode::new(url)));
    }

    /// Attach the durable overflow store used when every node is exhausted.
    pub fn set_dumper(&self, dumper: Dumper) {
        *self.inner.dumper.write() = Some(dumper);
    }

    pub fn nodes_status(&self) -> Vec<NodeStatus> {
        self.inner.nodes.read().iter().map(|n| n.status()).collect()
    }

    /// Number of batches currently handed off and not yet resolved.
    pub fn len(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn post(&self, node: &BackendNode, params: &str, content: String) -> Result<(String, u16)> {
        let url = if params.is_empty() {
            format!("{}/", node.url)
        } else {
            format!("{}/?{}", node.url, params)
        };
        let response = self.inner.client.post(&url).body(content).send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok((body, status))
    }

    /// Pass-through delivery: one candidate node, raw response returned
    /// verbatim. No failover; a down node surfaces its error upstream.
    pub async fn send_query(&self, params: &str, content: String) -> Result<(String, u16)> {
        let node = {
            let nodes = self.inner.nodes.read();
            if nodes.is_empty() {
                return Err(Error::NoServers);
            }
            let start = self.inner.cursor.fetch_add(1, Ordering::Relaxed) % nodes.len();
            (0..nodes.len())
                .map(|i| &nodes[(start + i) % nodes.len()])
                .find(|n| n.is_available())
                .unwrap_or(&nodes[start])
                .clone()
        };

        match self.post(&node, params, content).await {
            Ok((body, status)) => {
                if (200..300).contains(&status) {
                    node.mark_up();
                }
                Ok((body, status))
            }
            Err(err) => {
                warn!(url = %node.url, error = %err, "pass-through delivery failed; marking node down");
                node.mark_down(self.inner.down_timeout, &err);
                Err(err)
            }
        }
    }

    /// One failover pass across candidate nodes, strictly sequential.
    /// Skips nodes presently Down; demotes a node on transport or server
    /// error. Does not touch the overflow store.
    pub async fn try_deliver(&self, batch: &PendingBatch) -> Result<()> {
        let nodes: Vec<Arc<BackendNode>> = self.inner.nodes.read().clone();
        if nodes.is_empty() {
            return Err(Error::NoServers);
        }

        let start = self.inner.cursor.fetch_add(1, Ordering::Relaxed) % nodes.len();
        let mut last_err = Error::AllNodesDown;
        for i in 0..nodes.len() {
            let node = &nodes[(start + i) % nodes.len()];
            if !node.is_available() {
                continue;
            }
            match self.post(node, &batch.params, batch.content.clone()).await {
                Ok((_, status)) if (200..300).contains(&status) => {
                    node.mark_up();
                    return Ok(());
                }
                Ok((body, status)) => {
                    let err = Error::BackendStatus { status, body };
                    warn!(url = %node.url, status, "backend rejected batch; marking node down");
                    node.mark_down(self.inner.down_timeout, &err);
                    counter!("chbulk.send.errors", 1);
                    last_err = err;
                }
                Err(err) => {
                    warn!(url = %node.url, error = %err, "delivery failed; marking node down");
                    node.mark_down(self.inner.down_timeout, &err);
                    counter!("chbulk.send.errors", 1);
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    /// Flush-path delivery: failover across nodes, then divert to the
    /// overflow store on total exhaustion. Never surfaces an error to the
    /// caller; the originating request was already acknowledged.
    pub async fn send_batch(&self, batch: PendingBatch) {
        if let Err(err) = self.try_deliver(&batch).await {
            counter!("chbulk.send.exhausted", 1);
            warn!(error = %err, "no backend accepted batch; diverting to overflow store");
            let dumper = self.inner.dumper.read().clone();
            match dumper {
                Some(dumper) => {
                    if let Err(dump_err) = dumper.dump(&batch).await {
                        error!(error = %dump_err, "overflow write failed; batch lost");
                    }
                }
                None => error!("no overflow store configured; batch lost"),
            }
        }
    }
}

impl BatchSink for Sender {
    fn enqueue(&self, batch: PendingBatch) {
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        let sender = self.clone();
        tokio::spawn(async move {
            sender.send_batch(batch).await;
            sender.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::RawQuery;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::Router;
    use std::sync::atomic::AtomicU16;

    type Seen = Arc<Mutex<Vec<(String, String)>>>;

    async fn spawn_backend(status: Arc<AtomicU16>, seen: Seen) -> String {
        let app = Router::new().route(
            "/",
            post(move |RawQuery(query): RawQuery, body: String| {
                let status = Arc::clone(&status);
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().push((query.unwrap_or_default(), body));
                    let code = StatusCode::from_u16(status.load(Ordering::SeqCst)).unwrap();
                    (code, "backend response")
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn batch(content: &str) -> PendingBatch {
        PendingBatch::new("query=INSERT%20INTO%20t%20VALUES".into(), content.into())
    }

    #[tokio::test]
    async fn delivers_batch_to_healthy_node() {
        let status = Arc::new(AtomicU16::new(200));
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sender = Sender::new(Duration::from_secs(300), None).unwrap();
        sender.add_server(&spawn_backend(status, Arc::clone(&seen)).await);

        sender.try_deliver(&batch("(1)(2)")).await.unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "query=INSERT%20INTO%20t%20VALUES");
        assert_eq!(seen[0].1, "(1)(2)");
        assert!(sender.nodes_status()[0].up);
    }

    #[tokio::test]
    async fn fails_over_to_next_node() {
        let bad: Seen = Arc::new(Mutex::new(Vec::new()));
        let good: Seen = Arc::new(Mutex::new(Vec::new()));
        let sender = Sender::new(Duration::from_secs(300), None).unwrap();
        sender.add_server(&spawn_backend(Arc::new(AtomicU16::new(500)), Arc::clone(&bad)).await);
        sender.add_server(&spawn_backend(Arc::new(AtomicU16::new(200)), Arc::clone(&good)).await);

        sender.try_deliver(&batch("(1)")).await.unwrap();

        assert_eq!(bad.lock().len(), 1);
        assert_eq!(good.lock().len(), 1);
        let statuses = sender.nodes_status();
        assert!(!statuses[0].up);
        assert!(statuses[0].last_error.as_deref().unwrap().contains("500"));
        assert!(statuses[1].up);
    }

    #[tokio::test]
    async fn down_node_is_skipped_until_timeout() {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sender = Sender::new(Duration::from_secs(300), None).unwrap();
        sender.add_server(&spawn_backend(Arc::new(AtomicU16::new(500)), Arc::clone(&seen)).await);

        assert!(sender.try_deliver(&batch("(1)")).await.is_err());
        // Second attempt within down_timeout must not reach the node.
        let err = sender.try_deliver(&batch("(2)")).await.unwrap_err();
        assert!(matches!(err, Error::AllNodesDown));
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn down_node_becomes_eligible_after_timeout() {
        let status = Arc::new(AtomicU16::new(500));
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sender = Sender::new(Duration::from_millis(50), None).unwrap();
        sender.add_server(&spawn_backend(Arc::clone(&status), Arc::clone(&seen)).await);

        assert!(sender.try_deliver(&batch("(1)")).await.is_err());
        status.store(200, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(80)).await;

        sender.try_deliver(&batch("(2)")).await.unwrap();
        assert_eq!(seen.lock().len(), 2);
        assert!(sender.nodes_status()[0].up);
    }

    #[tokio::test]
    async fn exhausted_batch_is_dumped() {
        let dir = tempfile::tempdir().unwrap();
        let sender = Sender::new(Duration::from_secs(300), None).unwrap();
        sender.add_server(&spawn_backend(Arc::new(AtomicU16::new(500)), Arc::default()).await);
        sender.set_dumper(Dumper::new(dir.path()).unwrap());

        sender.send_batch(batch("(1)(2)(3)")).await;

        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
        let persisted: PendingBatch =
            serde_json::from_slice(&std::fs::read(files[0].as_ref().unwrap().path()).unwrap())
                .unwrap();
        assert_eq!(persisted.content, "(1)(2)(3)");
    }

    #[tokio::test]
    async fn pass_through_returns_backend_response_verbatim() {
        let sender = Sender::new(Duration::from_secs(300), None).unwrap();
        sender.add_server(&spawn_backend(Arc::new(AtomicU16::new(404)), Arc::default()).await);

        let (body, status) = sender
            .send_query("query=SELECT%201", String::new())
            .await
            .unwrap();
        assert_eq!(status, 404);
        assert_eq!(body, "backend response");
        // Application-level errors do not demote the node.
        assert!(sender.nodes_status()[0].up);
    }

    #[tokio::test]
    async fn pass_through_without_servers_errors() {
        let sender = Sender::new(Duration::from_secs(300), None).unwrap();
        let err = sender.send_query("", String::new()).await.unwrap_err();
        assert!(matches!(err, Error::NoServers));
    }
}
