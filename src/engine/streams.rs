use crate::model::{Direction, StreamId, StreamLifecycleKind, StreamState, TestEvent};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Worker-side view of a managed stream: the byte counter and the
/// cancellation flag, cheap to clone into a spawned task.
#[derive(Clone)]
pub struct StreamHandle {
    pub id: StreamId,
    pub direction: Direction,
    bytes: Arc<AtomicU64>,
    cancel: Arc<AtomicBool>,
}

impl StreamHandle {
    /// Attribute `delta` transferred bytes to this stream. Counters only
    /// ever grow; termination stops attribution by stopping the worker.
    pub fn record_bytes(&self, delta: u64) {
        self.bytes.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Workers poll this between suspension points and wind down when set.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Force the counter to an arbitrary value, including backwards, to
    /// exercise the sampler's reset recovery.
    #[cfg(test)]
    pub(crate) fn set_bytes_for_test(&self, v: u64) {
        self.bytes.store(v, Ordering::Relaxed);
    }
}

struct ManagedStream {
    state: StreamState,
    bytes: Arc<AtomicU64>,
    cancel: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

/// Owns every active transfer stream: registry, byte accounting, graceful
/// and emergency termination.
///
/// Lives on the run task. Spawned workers interact with it only through
/// their `StreamHandle` atomics, so registry mutation needs no locks.
pub struct StreamManager {
    downloads: BTreeMap<StreamId, ManagedStream>,
    uploads: BTreeMap<StreamId, ManagedStream>,
    next_id: u64,
    /// Bytes of streams that have already been removed, per direction.
    /// Keeps session totals monotonic across stream churn.
    retired: [u64; 2],
    leaked: usize,
    per_stream_timeout: Duration,
    test_start: Instant,
    event_tx: UnboundedSender<TestEvent>,
}

impl StreamManager {
    pub fn new(
        per_stream_timeout: Duration,
        test_start: Instant,
        event_tx: UnboundedSender<TestEvent>,
    ) -> Self {
        Self {
            downloads: BTreeMap::new(),
            uploads: BTreeMap::new(),
            next_id: 0,
            retired: [0, 0],
            leaked: 0,
            per_stream_timeout,
            test_start,
            event_tx,
        }
    }

    fn registry(&mut self, direction: Direction) -> &mut BTreeMap<StreamId, ManagedStream> {
        match direction {
            Direction::Download => &mut self.downloads,
            Direction::Upload => &mut self.uploads,
        }
    }

    fn dir_index(direction: Direction) -> usize {
        match direction {
            Direction::Download => 0,
            Direction::Upload => 1,
        }
    }

    fn elapsed_ms(&self) -> f64 {
        self.test_start.elapsed().as_secs_f64() * 1000.0
    }

    /// Register a new stream and hand back the worker handle. The stream is
    /// `Creating` until its task is attached.
    pub fn create(&mut self, direction: Direction) -> StreamHandle {
        self.next_id += 1;
        let id = StreamId(self.next_id);
        let bytes = Arc::new(AtomicU64::new(0));
        let cancel = Arc::new(AtomicBool::new(false));
        self.registry(direction).insert(
            id,
            ManagedStream {
                state: StreamState::Creating,
                bytes: bytes.clone(),
                cancel: cancel.clone(),
                task: None,
            },
        );
        let elapsed_ms = self.elapsed_ms();
        tracing::debug!(stream_id = %id, direction = %direction, "stream created");
        let _ = self.event_tx.send(TestEvent::StreamLifecycle {
            kind: StreamLifecycleKind::Created,
            stream_id: id,
            direction,
            elapsed_ms,
        });
        StreamHandle {
            id,
            direction,
            bytes,
            cancel,
        }
    }

    /// Attach the spawned worker task; the stream becomes `Active`.
    pub fn attach_task(&mut self, id: StreamId, direction: Direction, task: JoinHandle<()>) {
        if let Some(s) = self.registry(direction).get_mut(&id) {
            s.task = Some(task);
            s.state = StreamState::Active;
        }
    }

    /// Per-stream byte totals for one direction, ordered by id.
    pub fn snapshot(&self, direction: Direction) -> Vec<(StreamId, u64)> {
        let reg = match direction {
            Direction::Download => &self.downloads,
            Direction::Upload => &self.uploads,
        };
        reg.iter()
            .map(|(id, s)| (*id, s.bytes.load(Ordering::Relaxed)))
            .collect()
    }

    /// Bytes already folded in from removed streams.
    pub fn retired_bytes(&self, direction: Direction) -> u64 {
        self.retired[Self::dir_index(direction)]
    }

    /// Session-wide cumulative byte total for a direction. Monotonic for
    /// the life of the run; a phase boundary never resets it.
    pub fn session_bytes(&self, direction: Direction) -> u64 {
        let live: u64 = self
            .snapshot(direction)
            .iter()
            .map(|(_, b)| *b)
            .sum();
        self.retired_bytes(direction) + live
    }

    pub fn active_counts(&self) -> (usize, usize) {
        (self.downloads.len(), self.uploads.len())
    }

    /// State of a registered stream; `None` once removed.
    pub fn stream_state(&self, id: StreamId) -> Option<StreamState> {
        self.downloads
            .get(&id)
            .or_else(|| self.uploads.get(&id))
            .map(|s| s.state)
    }

    pub fn leaked_count(&self) -> usize {
        self.leaked
    }

    fn retire(&mut self, id: StreamId, direction: Direction, stream: ManagedStream) {
        self.retired[Self::dir_index(direction)] += stream.bytes.load(Ordering::Relaxed);
        let elapsed_ms = self.elapsed_ms();
        tracing::debug!(stream_id = %id, direction = %direction, "stream terminated");
        let _ = self.event_tx.send(TestEvent::StreamLifecycle {
            kind: StreamLifecycleKind::Terminated,
            stream_id: id,
            direction,
            elapsed_ms,
        });
    }

    /// Graceful shutdown of one stream: signal cancellation, wait for the
    /// worker to drain, then remove it. A worker that ignores cancellation
    /// past the per-stream cap is aborted and counted as leaked.
    pub async fn terminate(&mut self, id: StreamId) -> bool {
        let direction = if self.downloads.contains_key(&id) {
            Direction::Download
        } else if self.uploads.contains_key(&id) {
            Direction::Upload
        } else {
            return false;
        };

        let stream = self.registry(direction).get_mut(&id).unwrap();
        stream.cancel.store(true, Ordering::Relaxed);
        stream.state = StreamState::Draining;
        let task = stream.task.take();

        let mut leaked = false;
        if let Some(task) = task {
            match tokio::time::timeout(self.per_stream_timeout, task).await {
                Ok(_) => {}
                Err(_) => {
                    leaked = true;
                }
            }
        }

        let mut stream = self.registry(direction).remove(&id).unwrap();
        stream.state = StreamState::Terminated;
        if leaked {
            self.leaked += 1;
            tracing::warn!(stream_id = %id, direction = %direction, "stream leaked past hard timeout");
        }
        self.retire(id, direction, stream);
        !leaked
    }

    /// Graceful shutdown of every registered stream. Cancellation is
    /// signalled to all workers at once, then the grace window is spent
    /// collecting drained tasks. Returns the number of residual streams;
    /// callers must follow a non-zero return with `emergency_cleanup`.
    ///
    /// Idempotent: a second call with an empty registry returns 0 and emits
    /// nothing.
    pub async fn terminate_all(&mut self, grace: Duration) -> usize {
        for reg in [&mut self.downloads, &mut self.uploads] {
            for s in reg.values_mut() {
                s.cancel.store(true, Ordering::Relaxed);
                s.state = StreamState::Draining;
            }
        }

        let deadline = Instant::now() + grace;
        loop {
            self.collect_finished().await;
            if self.downloads.is_empty() && self.uploads.is_empty() {
                return 0;
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let (d, u) = self.active_counts();
        d + u
    }

    /// Remove every stream whose task has already run to completion.
    async fn collect_finished(&mut self) {
        for direction in [Direction::Download, Direction::Upload] {
            let ids: Vec<StreamId> = {
                let reg = self.registry(direction);
                reg.iter()
                    .filter(|(_, s)| s.task.as_ref().map(|t| t.is_finished()).unwrap_or(true))
                    .map(|(id, _)| *id)
                    .collect()
            };
            for id in ids {
                let mut stream = self.registry(direction).remove(&id).unwrap();
                if let Some(task) = stream.task.take() {
                    let _ = task.await;
                }
                stream.state = StreamState::Terminated;
                self.retire(id, direction, stream);
            }
        }
    }

    /// Abort every residual stream without waiting. Bounded: aborts are
    /// synchronous, so this returns well inside the 100 ms window.
    pub fn emergency_cleanup(&mut self) {
        let mut cancelled = 0usize;
        for direction in [Direction::Download, Direction::Upload] {
            let ids: Vec<StreamId> = match direction {
                Direction::Download => self.downloads.keys().copied().collect(),
                Direction::Upload => self.uploads.keys().copied().collect(),
            };
            for id in ids {
                let mut stream = self.registry(direction).remove(&id).unwrap();
                if let Some(task) = stream.task.take() {
                    task.abort();
                }
                stream.state = StreamState::Terminated;
                cancelled += 1;
                self.leaked += 1;
                self.retire(id, direction, stream);
            }
        }
        if cancelled > 0 {
            tracing::warn!(count = cancelled, "emergency cleanup aborted residual streams");
        }
        let elapsed_ms = self.elapsed_ms();
        let _ = self.event_tx.send(TestEvent::StreamReset { elapsed_ms });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn manager(per_stream_timeout: Duration) -> (StreamManager, mpsc::UnboundedReceiver<TestEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (StreamManager::new(per_stream_timeout, Instant::now(), tx), rx)
    }

    /// Worker that counts until cancelled, checking the flag between steps.
    fn spawn_cooperative(handle: StreamHandle) -> JoinHandle<()> {
        tokio::spawn(async move {
            while !handle.is_cancelled() {
                handle.record_bytes(10);
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
    }

    #[tokio::test]
    async fn ids_are_monotonic_and_unique() {
        let (mut mgr, _rx) = manager(Duration::from_secs(1));
        let a = mgr.create(Direction::Download);
        let b = mgr.create(Direction::Upload);
        let c = mgr.create(Direction::Download);
        assert!(a.id < b.id && b.id < c.id);
        assert_eq!(mgr.active_counts(), (2, 1));
    }

    #[tokio::test]
    async fn stream_state_walks_the_lifecycle() {
        let (mut mgr, _rx) = manager(Duration::from_secs(1));
        let h = mgr.create(Direction::Download);
        assert_eq!(mgr.stream_state(h.id), Some(StreamState::Creating));
        let task = spawn_cooperative(h.clone());
        mgr.attach_task(h.id, Direction::Download, task);
        assert_eq!(mgr.stream_state(h.id), Some(StreamState::Active));
        mgr.terminate(h.id).await;
        assert_eq!(mgr.stream_state(h.id), None);
    }

    #[tokio::test]
    async fn bytes_accumulate_and_snapshot_reads_them() {
        let (mut mgr, _rx) = manager(Duration::from_secs(1));
        let h = mgr.create(Direction::Download);
        h.record_bytes(500);
        h.record_bytes(250);
        let snap = mgr.snapshot(Direction::Download);
        assert_eq!(snap, vec![(h.id, 750)]);
        assert_eq!(mgr.session_bytes(Direction::Download), 750);
    }

    #[tokio::test]
    async fn graceful_terminate_waits_for_drain() {
        let (mut mgr, _rx) = manager(Duration::from_secs(5));
        let h = mgr.create(Direction::Download);
        let task = spawn_cooperative(h.clone());
        mgr.attach_task(h.id, Direction::Download, task);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(mgr.terminate(h.id).await);
        assert_eq!(mgr.active_counts(), (0, 0));
        assert_eq!(mgr.leaked_count(), 0);
        // Retired bytes keep the session total alive.
        assert!(mgr.session_bytes(Direction::Download) > 0);
    }

    #[tokio::test]
    async fn stubborn_stream_leaks_after_hard_timeout() {
        let (mut mgr, _rx) = manager(Duration::from_millis(20));
        let h = mgr.create(Direction::Upload);
        // Ignores cancellation entirely.
        let task = tokio::spawn(async move {
            futures::future::pending::<()>().await;
        });
        mgr.attach_task(h.id, Direction::Upload, task);

        assert!(!mgr.terminate(h.id).await);
        assert_eq!(mgr.leaked_count(), 1);
        assert_eq!(mgr.active_counts(), (0, 0));
    }

    #[tokio::test]
    async fn terminate_all_then_emergency_cleanup() {
        let (mut mgr, mut rx) = manager(Duration::from_secs(30));
        for _ in 0..3 {
            let h = mgr.create(Direction::Download);
            let task = spawn_cooperative(h.clone());
            mgr.attach_task(h.id, Direction::Download, task);
        }
        // One refuses to cancel.
        let h = mgr.create(Direction::Upload);
        let task = tokio::spawn(async move {
            futures::future::pending::<()>().await;
        });
        mgr.attach_task(h.id, Direction::Upload, task);

        let residual = mgr.terminate_all(Duration::from_millis(100)).await;
        assert_eq!(residual, 1);

        mgr.emergency_cleanup();
        assert_eq!(mgr.active_counts(), (0, 0));

        let mut saw_reset = false;
        while let Ok(ev) = rx.try_recv() {
            if matches!(ev, TestEvent::StreamReset { .. }) {
                saw_reset = true;
            }
        }
        assert!(saw_reset);
    }

    #[tokio::test]
    async fn terminate_all_twice_is_idempotent() {
        let (mut mgr, mut rx) = manager(Duration::from_secs(1));
        let h = mgr.create(Direction::Download);
        let task = spawn_cooperative(h.clone());
        mgr.attach_task(h.id, Direction::Download, task);

        assert_eq!(mgr.terminate_all(Duration::from_millis(200)).await, 0);
        while rx.try_recv().is_ok() {}

        // Second call: same final state, no further events.
        assert_eq!(mgr.terminate_all(Duration::from_millis(200)).await, 0);
        assert!(rx.try_recv().is_err());
        assert_eq!(mgr.active_counts(), (0, 0));
    }

    #[tokio::test]
    async fn terminate_unknown_id_is_a_noop() {
        let (mut mgr, _rx) = manager(Duration::from_secs(1));
        assert!(!mgr.terminate(StreamId(42)).await);
    }

    #[tokio::test]
    async fn session_bytes_survive_stream_churn() {
        let (mut mgr, _rx) = manager(Duration::from_secs(1));
        let h = mgr.create(Direction::Download);
        h.record_bytes(1000);
        let task = spawn_cooperative(h.clone());
        mgr.attach_task(h.id, Direction::Download, task);
        mgr.terminate(h.id).await;
        let after_first = mgr.session_bytes(Direction::Download);
        assert!(after_first >= 1000);

        let h2 = mgr.create(Direction::Download);
        h2.record_bytes(500);
        assert_eq!(mgr.session_bytes(Direction::Download), after_first + 500);
    }
}
