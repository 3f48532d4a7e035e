use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, trace};

use super::UploadError;

#[derive(Debug, Default)]
struct SessionState {
    // chunk index -> number of writes in flight for it
    pending: HashMap<u64, usize>,
    pending_total: usize,
    committed: BTreeSet<u64>,
    canceled: bool,
    expected_chunks: Option<u64>,
    // set once the session has been dropped from the registry
    retired: bool,
}

/// Point-in-time copy of a session's accounting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub file_name: String,
    pub pending_chunks: Vec<u64>,
    pub committed_chunks: Vec<u64>,
    pub canceled: bool,
    pub expected_chunks: Option<u64>,
}

/// Tracking record for one logical file's chunk uploads.
///
/// The state lock is only held for bookkeeping and never across an await.
/// Every change to the number of in-flight writes is published on a watch
/// channel so cancellation can wait for the count to reach zero.
#[derive(Debug)]
pub struct UploadSession {
    file_name: String,
    state: Mutex<SessionState>,
    pending_tx: watch::Sender<usize>,
}

enum Begin {
    Started(PendingChunk),
    Retired,
}

impl UploadSession {
    fn new(file_name: &str) -> Self {
        let (pending_tx, _) = watch::channel(0);
        Self {
            file_name: file_name.to_string(),
            state: Mutex::new(SessionState::default()),
            pending_tx,
        }
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_canceled(&self) -> bool {
        self.state().canceled
    }

    pub fn pending_count(&self) -> usize {
        self.state().pending_total
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state();
        let mut pending_chunks: Vec<u64> = state.pending.keys().copied().collect();
        pending_chunks.sort_unstable();
        SessionSnapshot {
            file_name: self.file_name.clone(),
            pending_chunks,
            committed_chunks: state.committed.iter().copied().collect(),
            canceled: state.canceled,
            expected_chunks: state.expected_chunks,
        }
    }

    /// Resolves once no chunk write is in flight.
    ///
    /// Only meaningful after the session is canceled, since nothing else stops
    /// new writes from arriving.
    pub async fn wait_drained(&self) {
        let mut rx = self.pending_tx.subscribe();
        // the sender lives as long as `self`, so the channel can't close here
        let _ = rx.wait_for(|pending| *pending == 0).await;
    }

    fn mark_canceled(&self) -> bool {
        let mut state = self.state();
        if state.retired {
            return false;
        }
        state.canceled = true;
        true
    }

    fn begin_chunk(
        self: &Arc<Self>,
        index: u64,
        declared_total: Option<u64>,
    ) -> Result<Begin, UploadError> {
        let mut state = self.state();
        if state.retired {
            return Ok(Begin::Retired);
        }
        if state.canceled {
            return Err(UploadError::UploadCanceled {
                file_name: self.file_name.clone(),
            });
        }
        if let (Some(declared), Some(expected)) = (declared_total, state.expected_chunks) {
            if declared != expected {
                return Err(UploadError::validation(format!(
                    "file {} was declared with {} chunks, got {}",
                    self.file_name, expected, declared
                )));
            }
        }
        let expected = declared_total.or(state.expected_chunks);
        if let Some(expected) = expected {
            if index >= expected {
                return Err(UploadError::validation(format!(
                    "chunk index {} is out of range for {} chunks",
                    index, expected
                )));
            }
        }

        state.expected_chunks = expected;
        *state.pending.entry(index).or_default() += 1;
        state.pending_total += 1;
        self.pending_tx.send_replace(state.pending_total);
        trace!(
            file_name = %self.file_name,
            index,
            pending = state.pending_total,
            "chunk write started"
        );

        Ok(Begin::Started(PendingChunk {
            session: self.clone(),
            index,
            done: false,
        }))
    }

    fn finish_chunk(&self, index: u64, committed: bool) {
        let mut state = self.state();
        if let Some(count) = state.pending.get_mut(&index) {
            *count -= 1;
            if *count == 0 {
                state.pending.remove(&index);
            }
            state.pending_total -= 1;
        }
        if committed {
            state.committed.insert(index);
        }
        self.pending_tx.send_replace(state.pending_total);
        trace!(
            file_name = %self.file_name,
            index,
            committed,
            pending = state.pending_total,
            "chunk write finished"
        );
    }

    /// Marks the session as dropped from the registry if no write is in
    /// flight. Writes that still hold a reference are then redirected to a
    /// fresh session. A canceled session is only retired by its purge, so
    /// `keep_canceled` leaves it in place.
    fn retire_if_idle(&self, keep_canceled: bool) -> bool {
        let mut state = self.state();
        if state.pending_total > 0 || (keep_canceled && state.canceled) {
            return false;
        }
        state.retired = true;
        true
    }
}

/// An accepted chunk write.
///
/// Dropping it without [`PendingChunk::commit`] records the write as failed,
/// which keeps the pending accounting exact even when the writing task is
/// aborted or panics.
#[derive(Debug)]
pub struct PendingChunk {
    session: Arc<UploadSession>,
    index: u64,
    done: bool,
}

impl PendingChunk {
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn commit(mut self) {
        self.done = true;
        self.session.finish_chunk(self.index, true);
    }
}

impl Drop for PendingChunk {
    fn drop(&mut self) {
        if !self.done {
            self.session.finish_chunk(self.index, false);
        }
    }
}

/// In-memory upload sessions keyed by file name.
///
/// Sessions for different names live in independent map shards and carry
/// their own lock, so unrelated files never contend.
#[derive(Debug, Default)]
pub struct UploadRegistry {
    sessions: DashMap<String, Arc<UploadSession>>,
}

impl UploadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, file_name: &str) -> Arc<UploadSession> {
        if let Some(session) = self.sessions.get(file_name) {
            return session.value().clone();
        }
        self.sessions
            .entry(file_name.to_string())
            .or_insert_with(|| {
                debug!(file_name, "created upload session");
                Arc::new(UploadSession::new(file_name))
            })
            .value()
            .clone()
    }

    pub fn get(&self, file_name: &str) -> Option<Arc<UploadSession>> {
        self.sessions.get(file_name).map(|s| s.value().clone())
    }

    pub fn is_canceled(&self, file_name: &str) -> bool {
        self.get(file_name).is_some_and(|s| s.is_canceled())
    }

    /// Marks the session for `file_name` canceled, creating it if needed.
    /// Chunk writes that have not registered yet are rejected from now on.
    pub fn mark_canceled(&self, file_name: &str) -> Arc<UploadSession> {
        loop {
            let session = self.get_or_create(file_name);
            if session.mark_canceled() {
                return session;
            }
            // lost a race with a removal, the next lookup sees a fresh entry
            self.sessions
                .remove_if(file_name, |_, s| Arc::ptr_eq(s, &session));
        }
    }

    /// Registers an in-flight write of chunk `index`.
    pub fn begin_chunk(
        &self,
        file_name: &str,
        index: u64,
        declared_total: Option<u64>,
    ) -> Result<PendingChunk, UploadError> {
        loop {
            let session = self.get_or_create(file_name);
            match session.begin_chunk(index, declared_total)? {
                Begin::Started(pending) => return Ok(pending),
                Begin::Retired => {
                    self.sessions
                        .remove_if(file_name, |_, s| Arc::ptr_eq(s, &session));
                }
            }
        }
    }

    /// Drops `session` from the registry unless a newer session has replaced
    /// it or a write is still in flight.
    pub fn remove(&self, session: &Arc<UploadSession>) -> bool {
        self.sessions
            .remove_if(session.file_name(), |_, s| {
                Arc::ptr_eq(s, session) && s.retire_if_idle(false)
            })
            .is_some()
    }

    /// Drops the session for `file_name` if no write is in flight. Canceled
    /// sessions stay until their cancel removes them.
    pub fn forget_idle(&self, file_name: &str) -> bool {
        self.sessions
            .remove_if(file_name, |_, s| s.retire_if_idle(true))
            .is_some()
    }

    /// Drops every session without writes in flight, except canceled ones,
    /// and returns how many were dropped.
    pub fn forget_all_idle(&self) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, s| !s.retire_if_idle(true));
        before.saturating_sub(self.sessions.len())
    }

    pub fn snapshot(&self, file_name: &str) -> Option<SessionSnapshot> {
        self.get(file_name).map(|s| s.snapshot())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_get_or_create_returns_same_session() {
        let registry = UploadRegistry::new();
        let a = registry.get_or_create("video");
        let b = registry.get_or_create("video");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
        assert!(!registry.is_canceled("video"));
        assert!(!registry.is_canceled("unknown"));
    }

    #[test]
    fn test_chunk_moves_from_pending_to_committed() {
        let registry = UploadRegistry::new();
        let pending = registry.begin_chunk("video", 3, None).unwrap();
        assert_eq!(pending.index(), 3);

        let snapshot = registry.snapshot("video").unwrap();
        assert_eq!(snapshot.pending_chunks, vec![3]);
        assert!(snapshot.committed_chunks.is_empty());

        pending.commit();
        let snapshot = registry.snapshot("video").unwrap();
        assert!(snapshot.pending_chunks.is_empty());
        assert_eq!(snapshot.committed_chunks, vec![3]);
    }

    #[test]
    fn test_dropped_chunk_is_not_committed() {
        let registry = UploadRegistry::new();
        let pending = registry.begin_chunk("video", 0, None).unwrap();
        drop(pending);

        let session = registry.get("video").unwrap();
        assert_eq!(session.pending_count(), 0);
        assert!(session.snapshot().committed_chunks.is_empty());
    }

    #[test]
    fn test_duplicate_index_in_flight_is_counted_twice() {
        let registry = UploadRegistry::new();
        let first = registry.begin_chunk("video", 1, None).unwrap();
        let second = registry.begin_chunk("video", 1, None).unwrap();
        let session = registry.get("video").unwrap();
        assert_eq!(session.pending_count(), 2);

        first.commit();
        assert_eq!(session.pending_count(), 1);
        assert_eq!(session.snapshot().pending_chunks, vec![1]);

        drop(second);
        assert_eq!(session.pending_count(), 0);
        assert_eq!(session.snapshot().committed_chunks, vec![1]);
    }

    #[test]
    fn test_canceled_session_rejects_without_mutation() {
        let registry = UploadRegistry::new();
        registry.mark_canceled("video");
        assert!(registry.is_canceled("video"));

        let err = registry.begin_chunk("video", 0, None).unwrap_err();
        assert!(matches!(err, UploadError::UploadCanceled { .. }));
        assert_eq!(registry.get("video").unwrap().pending_count(), 0);
    }

    #[test]
    fn test_declared_total_bounds_chunk_index() {
        let registry = UploadRegistry::new();
        registry.begin_chunk("video", 0, Some(2)).unwrap().commit();

        // the declaration sticks to the session
        let err = registry.begin_chunk("video", 2, None).unwrap_err();
        assert!(matches!(err, UploadError::Validation(_)));

        let err = registry.begin_chunk("video", 1, Some(5)).unwrap_err();
        assert!(matches!(err, UploadError::Validation(_)));

        registry.begin_chunk("video", 1, Some(2)).unwrap().commit();
        assert_eq!(registry.snapshot("video").unwrap().expected_chunks, Some(2));
    }

    #[test]
    fn test_rejected_declaration_is_not_recorded() {
        let registry = UploadRegistry::new();
        registry.begin_chunk("video", 4, Some(3)).unwrap_err();
        assert_eq!(registry.snapshot("video").unwrap().expected_chunks, None);
    }

    #[test]
    fn test_remove_keeps_busy_and_replaced_sessions() {
        let registry = UploadRegistry::new();
        let session = registry.get_or_create("video");
        let pending = registry.begin_chunk("video", 0, None).unwrap();
        assert!(!registry.remove(&session));

        pending.commit();
        assert!(registry.remove(&session));
        assert!(registry.get("video").is_none());

        // a stale handle can't remove the replacement
        let replacement = registry.get_or_create("video");
        assert!(!Arc::ptr_eq(&session, &replacement));
        assert!(!registry.remove(&session));
        assert!(registry.get("video").is_some());
    }

    #[test]
    fn test_writes_on_a_removed_session_go_to_a_fresh_one() {
        let registry = UploadRegistry::new();
        let stale = registry.mark_canceled("video");
        assert!(registry.remove(&stale));

        let pending = registry.begin_chunk("video", 0, None).unwrap();
        let fresh = registry.get("video").unwrap();
        assert!(!Arc::ptr_eq(&stale, &fresh));
        assert_eq!(fresh.pending_count(), 1);
        pending.commit();
    }

    #[test]
    fn test_forget_idle_sessions() {
        let registry = UploadRegistry::new();
        registry.begin_chunk("a", 0, None).unwrap().commit();
        let busy = registry.begin_chunk("b", 0, None).unwrap();
        registry.mark_canceled("c");

        assert!(!registry.forget_idle("b"));
        assert!(!registry.forget_idle("c"));
        assert_eq!(registry.forget_all_idle(), 1);
        assert_eq!(registry.len(), 2);
        assert!(registry.get("b").is_some());
        busy.commit();
        assert!(registry.forget_idle("b"));
        assert_eq!(registry.len(), 1);
        assert!(registry.is_canceled("c"));

        let canceled = registry.get("c").unwrap();
        assert!(registry.remove(&canceled));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_wait_drained_wakes_on_last_write() {
        let registry = UploadRegistry::new();
        let first = registry.begin_chunk("video", 0, None).unwrap();
        let second = registry.begin_chunk("video", 1, None).unwrap();
        let session = registry.mark_canceled("video");

        let waiter = tokio::spawn({
            let session = session.clone();
            async move { session.wait_drained().await }
        });

        first.commit();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(second);
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("drain should complete")
            .unwrap();
        assert_eq!(session.snapshot().committed_chunks, vec![0]);
    }

    #[tokio::test]
    async fn test_wait_drained_returns_immediately_when_idle() {
        let registry = UploadRegistry::new();
        let session = registry.mark_canceled("video");
        tokio::time::timeout(Duration::from_secs(1), session.wait_drained())
            .await
            .unwrap();
    }
}
