/*!
 * @file cursor.rs
 * @brief Cursor Manager (C11): process-wide cursor map with TTL expiry
 */

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bson::Document;
use metrics::gauge;
use parking_lot::Mutex;

use crate::error::{RelayError, Result};

struct CursorState {
    namespace: String,
    documents: Vec<Document>,
    position: usize,
    batch_size: i64,
    created_at: Instant,
    in_use: bool,
}

struct Inner {
    next_id: AtomicU64,
    cursors: Mutex<HashMap<u64, CursorState>>,
    ttl: Duration,
}

/// Maintains `cursorId -> CursorState` (spec §3/§4.10). Ids are
/// monotonically increasing and never reused within a process. One instance
/// is shared across every backend and the command dispatcher — cursors
/// opened by either the document store or the OLAP backend live in the same
/// id space, since a `getMore` command carries only the id, not which
/// backend produced it.
#[derive(Clone)]
pub struct CursorManager {
    inner: Arc<Inner>,
}

/// One page of documents plus the cursor id to resume from (`0` means
/// exhausted — the whole result set was returned).
pub struct Batch {
    pub cursor_id: u64,
    pub documents: Vec<Document>,
}

impl CursorManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(1),
                cursors: Mutex::new(HashMap::new()),
                ttl,
            }),
        }
    }

    /// Register a freshly materialized result set and return its first
    /// batch. `0 ≤ position ≤ len(documents)` is maintained throughout.
    pub fn open(&self, namespace: &str, documents: Vec<Document>, batch_size: i64) -> Batch {
        let take = batch_size.max(0) as usize;
        if documents.len() <= take {
            return Batch {
                cursor_id: 0,
                documents,
            };
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let first_batch = documents[..take].to_vec();
        let mut cursors = self.inner.cursors.lock();
        cursors.insert(
            id,
            CursorState {
                namespace: namespace.to_string(),
                documents,
                position: take,
                batch_size,
                created_at: Instant::now(),
                in_use: false,
            },
        );
        gauge!("relaydb_cursor_count").set(cursors.len() as f64);
        Batch {
            cursor_id: id,
            documents: first_batch,
        }
    }

    /// `getMore`: slice `count` documents starting at `position` and
    /// advance it. Exactly one concurrent `getMore` per cursor id is
    /// permitted (spec §5 Ordering guarantees); a second call while the
    /// first is outstanding is rejected with `CursorInUse`.
    pub fn advance(&self, id: u64, count: i64) -> Result<Batch> {
        let mut cursors = self.inner.cursors.lock();
        let state = cursors.get_mut(&id).ok_or(RelayError::CursorNotFound(id))?;
        if state.in_use {
            return Err(RelayError::CursorInUse(id));
        }
        if state.created_at.elapsed() > self.inner.ttl {
            cursors.remove(&id);
            return Err(RelayError::CursorNotFound(id));
        }

        state.in_use = true;
        let take = if count > 0 { count as usize } else { state.batch_size.max(0) as usize };
        let end = (state.position + take).min(state.documents.len());
        let batch_docs = state.documents[state.position..end].to_vec();
        state.position = end;
        let exhausted = state.position >= state.documents.len();

        if exhausted {
            cursors.remove(&id);
            gauge!("relaydb_cursor_count").set(cursors.len() as f64);
            Ok(Batch {
                cursor_id: 0,
                documents: batch_docs,
            })
        } else {
            state.in_use = false;
            Ok(Batch {
                cursor_id: id,
                documents: batch_docs,
            })
        }
    }

    pub fn close(&self, id: u64) {
        let mut cursors = self.inner.cursors.lock();
        cursors.remove(&id);
        gauge!("relaydb_cursor_count").set(cursors.len() as f64);
    }

    /// Close every cursor belonging to `namespace` (used on collection drop).
    pub fn close_namespace(&self, namespace: &str) {
        let mut cursors = self.inner.cursors.lock();
        cursors.retain(|_, state| state.namespace != namespace);
        gauge!("relaydb_cursor_count").set(cursors.len() as f64);
    }

    /// Remove entries whose age exceeds the TTL (spec §4.10).
    pub fn cleanup_expired(&self) -> usize {
        let mut cursors = self.inner.cursors.lock();
        let before = cursors.len();
        cursors.retain(|_, state| state.created_at.elapsed() <= self.inner.ttl);
        gauge!("relaydb_cursor_count").set(cursors.len() as f64);
        before - cursors.len()
    }

    pub fn len(&self) -> usize {
        self.inner.cursors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn docs(n: usize) -> Vec<Document> {
        (0..n).map(|i| bson::doc! { "n": i as i64 }).collect()
    }

    #[test]
    fn small_result_set_is_returned_exhausted() {
        let manager = CursorManager::new(Duration::from_secs(600));
        let batch = manager.open("db.coll", docs(3), 10);
        assert_eq!(batch.cursor_id, 0);
        assert_eq!(batch.documents.len(), 3);
        assert!(manager.is_empty());
    }

    #[test]
    fn large_result_set_opens_a_cursor_and_advances() {
        let manager = CursorManager::new(Duration::from_secs(600));
        let first = manager.open("db.coll", docs(10), 4);
        assert_ne!(first.cursor_id, 0);
        assert_eq!(first.documents.len(), 4);

        let second = manager.advance(first.cursor_id, 4).unwrap();
        assert_eq!(second.documents.len(), 4);
        assert_ne!(second.cursor_id, 0);

        let third = manager.advance(second.cursor_id, 4).unwrap();
        assert_eq!(third.cursor_id, 0);
        assert_eq!(third.documents.len(), 2);
        assert!(manager.is_empty());
    }

    #[test]
    fn concurrent_getmore_is_rejected() {
        let manager = CursorManager::new(Duration::from_secs(600));
        let first = manager.open("db.coll", docs(10), 2);
        // Simulate an outstanding getMore by marking in_use directly.
        manager.inner.cursors.lock().get_mut(&first.cursor_id).unwrap().in_use = true;
        let err = manager.advance(first.cursor_id, 2).unwrap_err();
        assert_eq!(err.code(), crate::error::code::CURSOR_IN_USE);
    }

    #[test]
    fn expired_cursor_is_not_found() {
        let manager = CursorManager::new(Duration::from_millis(0));
        let first = manager.open("db.coll", docs(10), 2);
        std::thread::sleep(Duration::from_millis(5));
        let err = manager.advance(first.cursor_id, 2).unwrap_err();
        assert_eq!(err.code(), crate::error::code::CURSOR_NOT_FOUND);
    }

    #[test]
    fn ids_are_never_reused() {
        let manager = CursorManager::new(Duration::from_secs(600));
        let first = manager.open("db.coll", docs(10), 2).cursor_id;
        manager.close(first);
        let second = manager.open("db.coll", docs(10), 2).cursor_id;
        assert!(second > first);
    }
}
