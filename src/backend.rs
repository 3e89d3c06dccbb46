/*!
 * @file backend.rs
 * @brief Backend Interface (C8): operations every storage backend implements
 */

use async_trait::async_trait;
use bson::Document;

use crate::error::Result;

#[derive(Debug, Clone, Default)]
pub struct UpdateOutcome {
    pub matched_count: u64,
    pub modified_count: u64,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteOutcome {
    pub deleted_count: u64,
}

#[derive(Debug, Clone, Default)]
pub struct InsertOutcome {
    pub inserted_ids: Vec<bson::Bson>,
}

/// Abstracts the two concrete storage backends (C9 document store, C10
/// OLAP) behind one operation set, so the command dispatcher (C12) and
/// aggregation executor (C7) never branch on which backend a namespace
/// resolves to (spec §4.11, §3 Collection Namespace).
#[async_trait]
pub trait Backend: Send + Sync {
    async fn insert_many(&self, namespace: &str, documents: Vec<Document>) -> Result<InsertOutcome>;
    async fn find(
        &self,
        namespace: &str,
        filter: &Document,
        sort: Option<&Document>,
        limit: Option<i64>,
        skip: Option<i64>,
    ) -> Result<Vec<Document>>;
    async fn update_many(&self, namespace: &str, filter: &Document, update: &Document, multi: bool) -> Result<UpdateOutcome>;
    async fn delete_many(&self, namespace: &str, filter: &Document, multi: bool) -> Result<DeleteOutcome>;
    async fn count_documents(&self, namespace: &str, filter: &Document) -> Result<u64>;
    async fn aggregate(&self, namespace: &str, pipeline: &[Document], batch_size: i64) -> Result<crate::cursor::Batch>;
    async fn list_indexes(&self, namespace: &str) -> Result<Vec<Document>>;

    /// Whether this backend refuses all mutating operations (spec §4.9
    /// Read-only policy — the OLAP backend rejects before any backend call).
    fn is_read_only(&self) -> bool {
        false
    }
}
