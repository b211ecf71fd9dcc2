use crate::engine::client::ServerClient;
use crate::engine::pacing::Pacer;
use crate::engine::streams::{StreamHandle, StreamManager};
use crate::error::EngineError;
use crate::model::{Direction, StreamId};
use futures::StreamExt;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Lower bound of the inter-stream start stagger.
const STAGGER_MIN_MS: u64 = 50;
/// Upper bound of the inter-stream start stagger.
const STAGGER_MAX_MS: u64 = 100;

/// Opens persistent GET streams and drains their bodies into the stream
/// counters.
///
/// Two request shapes: unbounded bodies for saturation, `?size=`-capped
/// bodies for warmup probing (the per-request size is the download tuning
/// knob and may be adjusted while streams run).
pub struct DownloadEngine {
    client: ServerClient,
    pacer: Arc<Pacer>,
    chunk_size: Arc<AtomicU64>,
}

impl DownloadEngine {
    pub fn new(client: ServerClient, pacer: Arc<Pacer>) -> Self {
        Self {
            client,
            pacer,
            chunk_size: Arc::new(AtomicU64::new(1024 * 1024)),
        }
    }

    /// Adjust the per-request body size used by sized (warmup) streams.
    pub fn set_chunk_size(&self, bytes: u64) {
        self.chunk_size.store(bytes, Ordering::Relaxed);
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size.load(Ordering::Relaxed)
    }

    pub fn swap_pacer(&mut self, pacer: Arc<Pacer>) {
        self.pacer = pacer;
    }

    /// Start `count` streams, staggered 50-100 ms apart to smooth the
    /// initial burst.
    pub fn spawn_streams(
        &self,
        mgr: &mut StreamManager,
        count: usize,
        sized: bool,
        request_timeout: Option<Duration>,
    ) -> Vec<StreamId> {
        let mut ids = Vec::with_capacity(count);
        for i in 0..count {
            let stagger = Duration::from_millis(
                i as u64 * rand::thread_rng().gen_range(STAGGER_MIN_MS..=STAGGER_MAX_MS),
            );
            ids.push(self.spawn_stream(mgr, sized, request_timeout, stagger));
        }
        ids
    }

    pub fn spawn_stream(
        &self,
        mgr: &mut StreamManager,
        sized: bool,
        request_timeout: Option<Duration>,
        stagger: Duration,
    ) -> StreamId {
        let handle = mgr.create(Direction::Download);
        let id = handle.id;
        let client = self.client.clone();
        let pacer = self.pacer.clone();
        let chunk_size = self.chunk_size.clone();
        let task = tokio::spawn(async move {
            run_stream(handle, client, pacer, chunk_size, sized, request_timeout, stagger).await;
        });
        mgr.attach_task(id, Direction::Download, task);
        id
    }
}

async fn run_stream(
    handle: StreamHandle,
    client: ServerClient,
    pacer: Arc<Pacer>,
    chunk_size: Arc<AtomicU64>,
    sized: bool,
    request_timeout: Option<Duration>,
    stagger: Duration,
) {
    if !stagger.is_zero() {
        tokio::time::sleep(stagger).await;
    }

    'requests: while !handle.is_cancelled() {
        let url = if sized {
            client.download_url_sized(chunk_size.load(Ordering::Relaxed))
        } else {
            client.download_url()
        };
        let mut req = client.load.get(url);
        if let Some(t) = request_timeout {
            req = req.timeout(t);
        }

        let resp = match req.send().await {
            Ok(r) => r,
            Err(e) => {
                log_transport_end(&handle, e);
                break 'requests;
            }
        };

        if !resp.status().is_success() {
            tracing::warn!(stream_id = %handle.id, status = %resp.status(), "download rejected");
            tokio::time::sleep(Duration::from_millis(100)).await;
            continue;
        }

        let mut body = resp.bytes_stream();
        while let Some(chunk) = body.next().await {
            let b = match chunk {
                Ok(b) => b,
                Err(e) => {
                    log_transport_end(&handle, e);
                    break 'requests;
                }
            };
            handle.record_bytes(b.len() as u64);
            if let Some(wait) = pacer.debit(b.len() as u64) {
                tokio::time::sleep(wait).await;
            }
            if handle.is_cancelled() {
                break 'requests;
            }
        }
        // Body finished cleanly: sized probes re-issue, unbounded bodies
        // should not end but a server-side close is survivable either way.
    }
}

/// Classify the request error that ended this stream and log it; cancelled
/// streams are expected and stay quiet.
fn log_transport_end(handle: &StreamHandle, e: reqwest::Error) {
    if handle.is_cancelled() {
        let err = EngineError::TransportCancelled {
            stream_id: handle.id,
            direction: Direction::Download,
        };
        tracing::debug!(error = %err, "download stream wound down");
    } else {
        let err = EngineError::TransportFailed {
            stream_id: handle.id,
            direction: Direction::Download,
            source: e,
        };
        tracing::warn!(error = %err, "download stream terminated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::streams::StreamManager;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    fn engine_and_manager(base_url: &str) -> (DownloadEngine, StreamManager) {
        let cfg = EngineConfig {
            base_url: base_url.into(),
            ..Default::default()
        };
        let client = ServerClient::new(&cfg).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mgr = StreamManager::new(Duration::from_secs(5), Instant::now(), tx);
        (DownloadEngine::new(client, Arc::new(Pacer::unlimited())), mgr)
    }

    #[tokio::test]
    async fn cancelled_stream_winds_down_without_bytes() {
        let (engine, mut mgr) = engine_and_manager("http://127.0.0.1:1");
        let ids = engine.spawn_streams(&mut mgr, 2, false, Some(Duration::from_millis(100)));
        assert_eq!(mgr.active_counts().0, 2);

        for id in ids {
            mgr.terminate(id).await;
        }
        assert_eq!(mgr.active_counts(), (0, 0));
        assert_eq!(mgr.leaked_count(), 0);
        assert_eq!(mgr.session_bytes(Direction::Download), 0);
    }

    #[tokio::test]
    async fn chunk_size_is_shared_with_running_streams() {
        let (engine, _mgr) = engine_and_manager("http://127.0.0.1:1");
        engine.set_chunk_size(4 * 1024 * 1024);
        assert_eq!(engine.chunk_size(), 4 * 1024 * 1024);
    }
}
