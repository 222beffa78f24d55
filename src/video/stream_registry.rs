//! Stream registry — tracks active MJPEG relay streams and a bounded
//! history of recently stopped ones.
//!
//! `stop()` never joins a stream's relay loop. A stream is most often
//! stopped from inside that very loop, on client disconnect; joining it
//! from there would deadlock the loop against itself. Instead `stop()`
//! marks the context stopped and removes it from the active map — the
//! relay loop notices on its next frame-wait iteration and exits on its own.

use crate::video::shm_reader::{FrameReader, FrameReaderError};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

#[derive(thiserror::Error, Debug)]
pub enum StreamError {
    #[error("stream registry is at capacity ({0} streams)")]
    AtCapacity(usize),
    #[error("stream {0} not found")]
    NotFound(String),
    #[error("failed to attach to frame source: {0}")]
    Attach(#[from] FrameReaderError),
}

pub struct StreamContext {
    pub id: String,
    /// `None` when the browser advertised `shm_available: false` for this
    /// viewport — the relay loop falls back to polling frames over the IPC
    /// transport instead of shared memory.
    pub reader: Option<FrameReader>,
    pub started_at: Instant,
    pub client_count: AtomicUsize,
    stopped: AtomicBool,
}

impl StreamContext {
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone)]
pub struct StoppedRecord {
    pub id: String,
    pub stopped_at: Instant,
    pub reason: String,
}

struct Inner {
    active: HashMap<String, Arc<StreamContext>>,
    stopped_history: VecDeque<StoppedRecord>,
}

pub struct StreamRegistry {
    inner: Mutex<Inner>,
    capacity: usize,
    history_capacity: usize,
}

impl StreamRegistry {
    pub fn new(capacity: usize, history_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                active: HashMap::new(),
                stopped_history: VecDeque::new(),
            }),
            capacity,
            history_capacity,
        }
    }

    /// Start (or join, if already running) the stream. `shm_name` is `None`
    /// when the browser reported `shm_available: false`, in which case the
    /// context carries no reader and relay loops fall back to IPC framing.
    /// A second caller for the same `id` just increments the client count
    /// onto the existing context.
    pub async fn start(
        &self,
        id: &str,
        shm_name: Option<&str>,
    ) -> Result<Arc<StreamContext>, StreamError> {
        if let Some(existing) = self.get(id).await {
            existing.client_count.fetch_add(1, Ordering::AcqRel);
            return Ok(existing);
        }
        let reader = match shm_name {
            Some(name) => Some(FrameReader::attach(name)?),
            None => None,
        };
        self.start_with_source(id, reader).await
    }

    pub(crate) async fn start_with_source(
        &self,
        id: &str,
        reader: Option<FrameReader>,
    ) -> Result<Arc<StreamContext>, StreamError> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.active.get(id) {
            existing.client_count.fetch_add(1, Ordering::AcqRel);
            return Ok(existing.clone());
        }
        if inner.active.len() >= self.capacity {
            return Err(StreamError::AtCapacity(self.capacity));
        }
        let ctx = Arc::new(StreamContext {
            id: id.to_string(),
            reader,
            started_at: Instant::now(),
            client_count: AtomicUsize::new(1),
            stopped: AtomicBool::new(false),
        });
        inner.active.insert(id.to_string(), ctx.clone());
        Ok(ctx)
    }

    /// Decrement the stream's client count; if it just dropped to zero,
    /// mark it stopped and move it into the bounded history. Returns
    /// `true` iff this call was the one that removed the stream (the
    /// caller is the last relay loop), so it knows whether it — and it
    /// alone — is responsible for releasing the reader.
    pub async fn cleanup_if_last(&self, id: &str, reason: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(ctx) = inner.active.get(id).cloned() else {
            return false;
        };
        let remaining = ctx.client_count.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 {
            ctx.stopped.store(true, Ordering::Release);
            inner.active.remove(id);
            Self::push_history(&mut inner.stopped_history, self.history_capacity, id, reason);
            true
        } else {
            false
        }
    }

    /// Remove any stale stopped-history record for `id`. Called before
    /// re-starting a viewport so a relay loop that joins the freshly
    /// created context doesn't immediately observe a leftover stop from a
    /// previous run of the same viewport id.
    pub async fn clear_stopped(&self, id: &str) {
        let mut inner = self.inner.lock().await;
        inner.stopped_history.retain(|r| r.id != id);
    }

    /// `true` if `id` appears in the bounded stopped-history set — consulted
    /// by a relay loop that no longer holds (or never held) a live context
    /// handle but must still observe a stop signal for its viewport.
    pub async fn was_stopped(&self, id: &str) -> bool {
        self.inner
            .lock()
            .await
            .stopped_history
            .iter()
            .any(|r| r.id == id)
    }

    /// Force-stop a stream regardless of client count (e.g. the browser
    /// restarted out from under it). See the module doc comment for why
    /// this never joins the relay loop.
    pub async fn stop(&self, id: &str, reason: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(ctx) = inner.active.remove(id) else {
            return false;
        };
        ctx.stopped.store(true, Ordering::Release);
        Self::push_history(&mut inner.stopped_history, self.history_capacity, id, reason);
        true
    }

    fn push_history(
        history: &mut VecDeque<StoppedRecord>,
        capacity: usize,
        id: &str,
        reason: &str,
    ) {
        if history.len() >= capacity {
            history.pop_front();
        }
        history.push_back(StoppedRecord {
            id: id.to_string(),
            stopped_at: Instant::now(),
            reason: reason.to_string(),
        });
    }

    pub async fn get(&self, id: &str) -> Option<Arc<StreamContext>> {
        self.inner.lock().await.active.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<Arc<StreamContext>> {
        self.inner.lock().await.active.values().cloned().collect()
    }

    pub async fn stopped_history(&self) -> Vec<StoppedRecord> {
        self.inner
            .lock()
            .await
            .stopped_history
            .iter()
            .cloned()
            .collect()
    }

    pub async fn active_count(&self) -> usize {
        self.inner.lock().await.active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starting_the_same_id_twice_joins_rather_than_duplicates() {
        let reg = StreamRegistry::new(4, 4);
        let a = reg
            .start_with_source("s1", Some(FrameReader::attach_for_test()))
            .await
            .unwrap();
        let b = reg
            .start_with_source("s1", Some(FrameReader::attach_for_test()))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.client_count.load(Ordering::Acquire), 2);
        assert_eq!(reg.active_count().await, 1);
    }

    #[tokio::test]
    async fn capacity_is_enforced() {
        let reg = StreamRegistry::new(1, 4);
        reg.start_with_source("s1", Some(FrameReader::attach_for_test()))
            .await
            .unwrap();
        let err = reg
            .start_with_source("s2", Some(FrameReader::attach_for_test()))
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::AtCapacity(1)));
    }

    #[tokio::test]
    async fn cleanup_if_last_removes_only_when_count_reaches_zero() {
        let reg = StreamRegistry::new(4, 4);
        reg.start_with_source("s1", Some(FrameReader::attach_for_test()))
            .await
            .unwrap();
        reg.start_with_source("s1", Some(FrameReader::attach_for_test()))
            .await
            .unwrap();
        assert!(!reg.cleanup_if_last("s1", "client disconnected").await);
        assert_eq!(reg.active_count().await, 1);
        assert!(reg.cleanup_if_last("s1", "client disconnected").await);
        assert_eq!(reg.active_count().await, 0);
        assert_eq!(reg.stopped_history().await.len(), 1);
    }

    #[tokio::test]
    async fn stopped_history_is_bounded() {
        let reg = StreamRegistry::new(8, 2);
        for i in 0..4 {
            let id = format!("s{i}");
            reg.start_with_source(&id, Some(FrameReader::attach_for_test()))
                .await
                .unwrap();
            reg.stop(&id, "test teardown").await;
        }
        assert_eq!(reg.stopped_history().await.len(), 2);
    }

    #[tokio::test]
    async fn clear_stopped_removes_only_the_named_record() {
        let reg = StreamRegistry::new(8, 8);
        reg.start_with_source("s1", Some(FrameReader::attach_for_test()))
            .await
            .unwrap();
        reg.start_with_source("s2", Some(FrameReader::attach_for_test()))
            .await
            .unwrap();
        reg.stop("s1", "test").await;
        reg.stop("s2", "test").await;
        assert!(reg.was_stopped("s1").await);
        reg.clear_stopped("s1").await;
        assert!(!reg.was_stopped("s1").await);
        assert!(reg.was_stopped("s2").await);
    }
}
