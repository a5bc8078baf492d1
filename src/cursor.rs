//! Sync cursor store
//!
//! Durable per-mailbox watermark plus the set of message ids a run has
//! picked up but not yet committed. `advance` moves the watermark and the
//! committed set together or not at all; a crashed run resumes from
//! `resume_point` and reprocesses only the uncommitted tail.

use crate::error::PipelineError;
use crate::models::SyncCursor;
use crate::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Where a sync run should pick up: the last durable cursor and any ids
/// left in flight by a prior run.
#[derive(Debug, Clone, Default)]
pub struct ResumePoint {
    pub cursor: SyncCursor,
    pub in_flight: Vec<String>,
}

#[async_trait]
pub trait SyncCursorStore: Send + Sync {
    /// Record ids as in flight before processing starts, preserving
    /// provider order. Already-committed ids are not re-added.
    async fn begin_batch(&self, mailbox_id: Uuid, ids: &[String]) -> Result<()>;

    /// Atomically move the watermark, mark ids committed, and clear them
    /// from the in-flight set. On error nothing moves.
    async fn advance(
        &self,
        mailbox_id: Uuid,
        new_cursor: SyncCursor,
        committed_ids: &[String],
    ) -> Result<()>;

    async fn resume_point(&self, mailbox_id: Uuid) -> Result<ResumePoint>;

    /// A committed id is never reprocessed by a later sync.
    async fn is_committed(&self, mailbox_id: Uuid, provider_message_id: &str) -> Result<bool>;

    /// Explicit invalidation (mailbox re-scope): clears the watermark,
    /// the committed set and the in-flight set.
    async fn invalidate(&self, mailbox_id: Uuid) -> Result<()>;
}

#[derive(Default)]
struct CursorState {
    cursor: SyncCursor,
    committed: HashSet<String>,
    in_flight: Vec<String>,
}

/// In-memory cursor store for development; the durability seam is the
/// trait above.
pub struct InMemoryCursorStore {
    states: Arc<RwLock<HashMap<Uuid, CursorState>>>,
}

impl InMemoryCursorStore {
    pub fn new() -> Self {
        Self {
            states: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryCursorStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SyncCursorStore for InMemoryCursorStore {
    async fn begin_batch(&self, mailbox_id: Uuid, ids: &[String]) -> Result<()> {
        let mut states = self.states.write().await;
        let state = states.entry(mailbox_id).or_default();

        for id in ids {
            if state.committed.contains(id) {
                continue;
            }
            if !state.in_flight.iter().any(|f| f == id) {
                state.in_flight.push(id.clone());
            }
        }
        Ok(())
    }

    async fn advance(
        &self,
        mailbox_id: Uuid,
        new_cursor: SyncCursor,
        committed_ids: &[String],
    ) -> Result<()> {
        // Single write-lock section: watermark and committed set move
        // together, or the lock was never taken.
        let mut states = self.states.write().await;
        let state = states.entry(mailbox_id).or_default();

        if new_cursor.watermark_ms < state.cursor.watermark_ms {
            return Err(PipelineError::Store(format!(
                "cursor for mailbox {} would move backwards ({} < {})",
                mailbox_id, new_cursor.watermark_ms, state.cursor.watermark_ms
            )));
        }

        state.cursor = new_cursor;
        for id in committed_ids {
            state.committed.insert(id.clone());
        }
        state.in_flight.retain(|f| !committed_ids.iter().any(|c| c == f));
        Ok(())
    }

    async fn resume_point(&self, mailbox_id: Uuid) -> Result<ResumePoint> {
        let states = self.states.read().await;
        Ok(states
            .get(&mailbox_id)
            .map(|state| ResumePoint {
                cursor: state.cursor,
                in_flight: state.in_flight.clone(),
            })
            .unwrap_or_default())
    }

    async fn is_committed(&self, mailbox_id: Uuid, provider_message_id: &str) -> Result<bool> {
        let states = self.states.read().await;
        Ok(states
            .get(&mailbox_id)
            .map(|state| state.committed.contains(provider_message_id))
            .unwrap_or(false))
    }

    async fn invalidate(&self, mailbox_id: Uuid) -> Result<()> {
        let mut states = self.states.write().await;
        states.remove(&mailbox_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_advance_moves_watermark_and_committed_together() {
        let store = InMemoryCursorStore::new();
        let mailbox = Uuid::new_v4();

        store.begin_batch(mailbox, &ids(&["a", "b"])).await.unwrap();
        store
            .advance(mailbox, SyncCursor { watermark_ms: 100 }, &ids(&["a", "b"]))
            .await
            .unwrap();

        let point = store.resume_point(mailbox).await.unwrap();
        assert_eq!(point.cursor.watermark_ms, 100);
        assert!(point.in_flight.is_empty());
        assert!(store.is_committed(mailbox, "a").await.unwrap());
        assert!(store.is_committed(mailbox, "b").await.unwrap());
    }

    #[tokio::test]
    async fn test_resume_point_exposes_uncommitted_tail() {
        let store = InMemoryCursorStore::new();
        let mailbox = Uuid::new_v4();

        store.begin_batch(mailbox, &ids(&["a", "b", "c"])).await.unwrap();
        // Only "a" committed before the crash.
        store
            .advance(mailbox, SyncCursor { watermark_ms: 10 }, &ids(&["a"]))
            .await
            .unwrap();

        let point = store.resume_point(mailbox).await.unwrap();
        assert_eq!(point.cursor.watermark_ms, 10);
        assert_eq!(point.in_flight, ids(&["b", "c"]));
    }

    #[tokio::test]
    async fn test_begin_batch_skips_committed_ids() {
        let store = InMemoryCursorStore::new();
        let mailbox = Uuid::new_v4();

        store.begin_batch(mailbox, &ids(&["a"])).await.unwrap();
        store
            .advance(mailbox, SyncCursor { watermark_ms: 10 }, &ids(&["a"]))
            .await
            .unwrap();

        // A later overlapping window re-observes "a"; it must not go back
        // in flight.
        store.begin_batch(mailbox, &ids(&["a", "b"])).await.unwrap();
        let point = store.resume_point(mailbox).await.unwrap();
        assert_eq!(point.in_flight, ids(&["b"]));
    }

    #[tokio::test]
    async fn test_cursor_never_moves_backwards() {
        let store = InMemoryCursorStore::new();
        let mailbox = Uuid::new_v4();

        store
            .advance(mailbox, SyncCursor { watermark_ms: 100 }, &[])
            .await
            .unwrap();
        let err = store
            .advance(mailbox, SyncCursor { watermark_ms: 50 }, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Store(_)));

        let point = store.resume_point(mailbox).await.unwrap();
        assert_eq!(point.cursor.watermark_ms, 100);
    }

    #[tokio::test]
    async fn test_invalidate_clears_everything() {
        let store = InMemoryCursorStore::new();
        let mailbox = Uuid::new_v4();

        store.begin_batch(mailbox, &ids(&["a"])).await.unwrap();
        store
            .advance(mailbox, SyncCursor { watermark_ms: 10 }, &ids(&["a"]))
            .await
            .unwrap();
        store.invalidate(mailbox).await.unwrap();

        let point = store.resume_point(mailbox).await.unwrap();
        assert_eq!(point.cursor.watermark_ms, 0);
        assert!(!store.is_committed(mailbox, "a").await.unwrap());
    }
}
