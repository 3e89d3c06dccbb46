/*!
 * @file dispatcher.rs
 * @brief Command Dispatcher (C12): routes wire commands to a backend and builds MongoDB-shaped responses
 *
 * Grounded on the base server's `mongodb_commands.rs` (the `register_command`
 * table, the `{ cursor: { firstBatch, id, ns } }` / `{ ok: 1 }` response
 * shapes), generalized so CRUD/query/aggregate commands actually reach a
 * [`Backend`] instead of returning canned sample data. The leading-key
 * dispatch table and the per-command response builders keep the base
 * server's structure; only the command bodies change.
 */

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use bson::{Bson, Document};
use metrics::{counter, histogram};

use crate::backend::Backend;
use crate::config::RelayConfig;
use crate::cursor::{Batch, CursorManager};
use crate::document::get_path;
use crate::error::{RelayError, Result};

pub struct Dispatcher {
    document_backend: Arc<dyn Backend>,
    olap_backend: Option<Arc<dyn Backend>>,
    config: RelayConfig,
    cursors: CursorManager,
}

impl Dispatcher {
    pub fn new(
        document_backend: Arc<dyn Backend>,
        olap_backend: Option<Arc<dyn Backend>>,
        config: RelayConfig,
        cursors: CursorManager,
    ) -> Self {
        Self {
            document_backend,
            olap_backend,
            config,
            cursors,
        }
    }

    fn backend_for(&self, namespace: &str) -> &Arc<dyn Backend> {
        match &self.olap_backend {
            Some(olap) if self.config.is_olap_namespace(namespace) => olap,
            _ => &self.document_backend,
        }
    }

    /// Run one command document to completion, always returning a
    /// well-formed MongoDB response — errors are converted to `{ ok: 0,
    /// code, codeName, errmsg }` rather than propagated (spec §4.11).
    pub async fn dispatch(&self, command: Document) -> Document {
        let name = command
            .iter()
            .next()
            .map(|(k, _)| k.clone())
            .unwrap_or_else(|| "unknown".to_string());
        let started = Instant::now();

        let response = match self.dispatch_inner(command).await {
            Ok(response) => response,
            Err(e) => e.to_command_error_document(),
        };

        counter!("relaydb_queries_total", "command" => name.clone()).increment(1);
        histogram!("relaydb_query_duration_seconds", "command" => name).record(started.elapsed().as_secs_f64());
        response
    }

    async fn dispatch_inner(&self, command: Document) -> Result<Document> {
        let db = command.get_str("$db").unwrap_or("test").to_string();
        let (name, _) = command
            .iter()
            .next()
            .ok_or_else(|| RelayError::bad_value("empty command document"))?;
        let name = name.clone();

        match name.as_str() {
            "hello" | "ismaster" | "isMaster" => Ok(self.handle_hello()),
            "ping" => Ok(success_response()),
            "find" => self.handle_find(&db, &command).await,
            "getMore" => self.handle_get_more(&db, &command),
            "killCursors" => self.handle_kill_cursors(&command),
            "insert" => self.handle_insert(&db, &command).await,
            "update" => self.handle_update(&db, &command).await,
            "delete" => self.handle_delete(&db, &command).await,
            "aggregate" => self.handle_aggregate(&db, &command).await,
            "count" => self.handle_count(&db, &command).await,
            "distinct" => self.handle_distinct(&db, &command).await,
            "listDatabases" => Ok(self.handle_list_databases()),
            "listCollections" => Ok(self.handle_list_collections()),
            "listIndexes" => self.handle_list_indexes(&db, &command).await,
            "createIndexes" => Ok(success_response()),
            "dropIndexes" => Ok(success_response()),
            "create" => Ok(success_response()),
            "drop" => Ok(self.handle_drop(&db, &command)),
            "dropDatabase" => Ok(success_response()),
            "collStats" => Ok(self.handle_coll_stats(&db, &command)),
            "dbStats" => Ok(self.handle_db_stats()),
            "serverStatus" => Ok(self.handle_server_status()),
            other => Err(RelayError::CommandNotFound(other.to_string())),
        }
    }

    fn handle_hello(&self) -> Document {
        bson::doc! {
            "ismaster": true,
            "maxBsonObjectSize": 16_777_216,
            "maxMessageSizeBytes": 48_000_000,
            "maxWriteBatchSize": 100_000,
            "logicalSessionTimeoutMinutes": 30,
            "connectionId": 1,
            "minWireVersion": 0,
            "maxWireVersion": 17,
            "readOnly": false,
            "ok": 1.0,
        }
    }

    async fn handle_find(&self, db: &str, command: &Document) -> Result<Document> {
        let collection = command
            .get_str("find")
            .map_err(|_| RelayError::bad_value("find requires a collection name"))?;
        let namespace = format!("{db}.{collection}");
        let filter = command.get_document("filter").cloned().unwrap_or_default();
        let sort = command.get_document("sort").ok().cloned();
        let limit = get_i64_opt(command, "limit");
        let skip = get_i64_opt(command, "skip");
        let batch_size = get_i64_opt(command, "batchSize").unwrap_or(self.config.cursor.default_batch_size);

        let backend = self.backend_for(&namespace);
        let documents = backend.find(&namespace, &filter, sort.as_ref(), limit, skip).await?;
        let batch = self.cursors.open(&namespace, documents, batch_size);
        Ok(cursor_response(batch, &namespace, "firstBatch"))
    }

    fn handle_get_more(&self, db: &str, command: &Document) -> Result<Document> {
        let cursor_id = command
            .get_i64("getMore")
            .map_err(|_| RelayError::bad_value("getMore requires a cursor id"))?;
        let collection = command
            .get_str("collection")
            .map_err(|_| RelayError::bad_value("getMore requires a collection name"))?;
        let namespace = format!("{db}.{collection}");
        let count = get_i64_opt(command, "batchSize").unwrap_or(0);
        let batch = self.cursors.advance(cursor_id as u64, count)?;
        Ok(cursor_response(batch, &namespace, "nextBatch"))
    }

    fn handle_kill_cursors(&self, command: &Document) -> Result<Document> {
        let ids = command
            .get_array("cursors")
            .map_err(|_| RelayError::bad_value("killCursors requires a cursors array"))?;
        let mut killed = Vec::new();
        for id in ids {
            if let Some(id) = id.as_i64() {
                self.cursors.close(id as u64);
                killed.push(Bson::Int64(id));
            }
        }
        Ok(bson::doc! {
            "cursorsKilled": killed,
            "cursorsNotFound": Vec::<Bson>::new(),
            "cursorsAlive": Vec::<Bson>::new(),
            "cursorsUnknown": Vec::<Bson>::new(),
            "ok": 1.0,
        })
    }

    async fn handle_insert(&self, db: &str, command: &Document) -> Result<Document> {
        let collection = command
            .get_str("insert")
            .map_err(|_| RelayError::bad_value("insert requires a collection name"))?;
        let namespace = format!("{db}.{collection}");
        let documents = command
            .get_array("documents")
            .map_err(|_| RelayError::bad_value("insert requires a documents array"))?
            .iter()
            .filter_map(|v| v.as_document().cloned())
            .collect::<Vec<_>>();

        let backend = self.backend_for(&namespace);
        let outcome = backend.insert_many(&namespace, documents).await?;
        Ok(bson::doc! {
            "n": outcome.inserted_ids.len() as i32,
            "ok": 1.0,
        })
    }

    async fn handle_update(&self, db: &str, command: &Document) -> Result<Document> {
        let collection = command
            .get_str("update")
            .map_err(|_| RelayError::bad_value("update requires a collection name"))?;
        let namespace = format!("{db}.{collection}");
        let updates = command
            .get_array("updates")
            .map_err(|_| RelayError::bad_value("update requires an updates array"))?;

        let backend = self.backend_for(&namespace);
        let mut matched = 0u64;
        let mut modified = 0u64;
        for spec in updates {
            let spec = spec
                .as_document()
                .ok_or_else(|| RelayError::bad_value("each update entry must be a document"))?;
            let filter = spec.get_document("q").cloned().unwrap_or_default();
            let update = spec.get_document("u").cloned().unwrap_or_default();
            let multi = spec.get_bool("multi").unwrap_or(false);
            let outcome = backend.update_many(&namespace, &filter, &update, multi).await?;
            matched += outcome.matched_count;
            modified += outcome.modified_count;
        }
        Ok(bson::doc! {
            "n": matched as i64,
            "nModified": modified as i64,
            "ok": 1.0,
        })
    }

    async fn handle_delete(&self, db: &str, command: &Document) -> Result<Document> {
        let collection = command
            .get_str("delete")
            .map_err(|_| RelayError::bad_value("delete requires a collection name"))?;
        let namespace = format!("{db}.{collection}");
        let deletes = command
            .get_array("deletes")
            .map_err(|_| RelayError::bad_value("delete requires a deletes array"))?;

        let backend = self.backend_for(&namespace);
        let mut deleted = 0u64;
        for spec in deletes {
            let spec = spec
                .as_document()
                .ok_or_else(|| RelayError::bad_value("each delete entry must be a document"))?;
            let filter = spec.get_document("q").cloned().unwrap_or_default();
            let multi = spec.get_i32("limit").unwrap_or(0) != 1;
            let outcome = backend.delete_many(&namespace, &filter, multi).await?;
            deleted += outcome.deleted_count;
        }
        Ok(bson::doc! {
            "n": deleted as i64,
            "ok": 1.0,
        })
    }

    async fn handle_aggregate(&self, db: &str, command: &Document) -> Result<Document> {
        let collection = command
            .get_str("aggregate")
            .map_err(|_| RelayError::bad_value("aggregate requires a collection name"))?;
        let namespace = format!("{db}.{collection}");
        let pipeline = command
            .get_array("pipeline")
            .map_err(|_| RelayError::bad_value("aggregate requires a pipeline array"))?
            .iter()
            .filter_map(|v| v.as_document().cloned())
            .collect::<Vec<_>>();
        let batch_size = command
            .get_document("cursor")
            .ok()
            .and_then(|c| get_i64_opt(c, "batchSize"))
            .unwrap_or(self.config.cursor.default_batch_size);

        let backend = self.backend_for(&namespace);
        let batch = backend.aggregate(&namespace, &pipeline, batch_size).await?;
        Ok(cursor_response(batch, &namespace, "firstBatch"))
    }

    async fn handle_count(&self, db: &str, command: &Document) -> Result<Document> {
        let collection = command
            .get_str("count")
            .map_err(|_| RelayError::bad_value("count requires a collection name"))?;
        let namespace = format!("{db}.{collection}");
        let filter = command.get_document("query").cloned().unwrap_or_default();

        let backend = self.backend_for(&namespace);
        let n = backend.count_documents(&namespace, &filter).await?;
        Ok(bson::doc! { "n": n as i64, "ok": 1.0 })
    }

    /// No dedicated backend primitive exists for `distinct` — the filtered
    /// result set is fetched and collapsed to unique values of `key` here,
    /// in memory, rather than pushed down per backend.
    async fn handle_distinct(&self, db: &str, command: &Document) -> Result<Document> {
        let collection = command
            .get_str("distinct")
            .map_err(|_| RelayError::bad_value("distinct requires a collection name"))?;
        let key = command
            .get_str("key")
            .map_err(|_| RelayError::bad_value("distinct requires a key"))?
            .to_string();
        let namespace = format!("{db}.{collection}");
        let filter = command.get_document("query").cloned().unwrap_or_default();

        let backend = self.backend_for(&namespace);
        let documents = backend.find(&namespace, &filter, None, None, None).await?;
        let mut seen = HashSet::new();
        let mut values = Vec::new();
        for doc in &documents {
            if let Some(value) = get_path(doc, &key) {
                let key_repr = bson::to_vec(value).unwrap_or_default();
                if seen.insert(key_repr) {
                    values.push(value.clone());
                }
            }
        }
        Ok(bson::doc! { "values": values, "ok": 1.0 })
    }

    fn handle_list_databases(&self) -> Document {
        bson::doc! {
            "databases": Vec::<Document>::new(),
            "totalSize": 0i64,
            "ok": 1.0,
        }
    }

    fn handle_list_collections(&self) -> Document {
        cursor_response(
            Batch {
                cursor_id: 0,
                documents: Vec::new(),
            },
            "admin.$cmd",
            "firstBatch",
        )
    }

    async fn handle_list_indexes(&self, db: &str, command: &Document) -> Result<Document> {
        let collection = command
            .get_str("listIndexes")
            .map_err(|_| RelayError::bad_value("listIndexes requires a collection name"))?;
        let namespace = format!("{db}.{collection}");
        let backend = self.backend_for(&namespace);
        let indexes = backend.list_indexes(&namespace).await?;
        Ok(cursor_response(
            Batch {
                cursor_id: 0,
                documents: indexes,
            },
            &namespace,
            "firstBatch",
        ))
    }

    /// Closes every cursor open against the dropped namespace before
    /// acknowledging — a `getMore` against a dropped collection's cursor
    /// would otherwise dangle until its TTL expired.
    fn handle_drop(&self, db: &str, command: &Document) -> Document {
        if let Ok(collection) = command.get_str("drop") {
            self.cursors.close_namespace(&format!("{db}.{collection}"));
        }
        success_response()
    }

    fn handle_coll_stats(&self, db: &str, command: &Document) -> Document {
        let ns = command
            .get_str("collStats")
            .map(|c| format!("{db}.{c}"))
            .unwrap_or_else(|_| db.to_string());
        bson::doc! { "ns": ns, "count": 0i64, "size": 0i64, "ok": 1.0 }
    }

    fn handle_db_stats(&self) -> Document {
        bson::doc! { "collections": 0i32, "objects": 0i64, "dataSize": 0i64, "ok": 1.0 }
    }

    fn handle_server_status(&self) -> Document {
        bson::doc! {
            "host": "relaydb",
            "version": "5.0.0",
            "process": "relaydb",
            "uptime": 0i64,
            "ok": 1.0,
        }
    }
}

fn success_response() -> Document {
    bson::doc! { "ok": 1.0 }
}

fn cursor_response(batch: Batch, namespace: &str, batch_key: &str) -> Document {
    let mut cursor = Document::new();
    cursor.insert(batch_key, batch.documents);
    cursor.insert("id", batch.cursor_id as i64);
    cursor.insert("ns", namespace);
    let mut response = Document::new();
    response.insert("cursor", cursor);
    response.insert("ok", 1.0);
    response
}

fn get_i64_opt(doc: &Document, key: &str) -> Option<i64> {
    doc.get(key).and_then(|v| v.as_i64().or_else(|| v.as_i32().map(i64::from)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DeleteOutcome, InsertOutcome, UpdateOutcome};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct FakeBackend {
        documents: StdMutex<Vec<Document>>,
        read_only: bool,
    }

    #[async_trait]
    impl Backend for FakeBackend {
        async fn insert_many(&self, _namespace: &str, documents: Vec<Document>) -> Result<InsertOutcome> {
            let ids: Vec<Bson> = documents.iter().map(|_| Bson::Int32(1)).collect();
            self.documents.lock().unwrap().extend(documents);
            Ok(InsertOutcome { inserted_ids: ids })
        }

        async fn find(
            &self,
            _namespace: &str,
            _filter: &Document,
            _sort: Option<&Document>,
            _limit: Option<i64>,
            _skip: Option<i64>,
        ) -> Result<Vec<Document>> {
            Ok(self.documents.lock().unwrap().clone())
        }

        async fn update_many(&self, _namespace: &str, _filter: &Document, _update: &Document, _multi: bool) -> Result<UpdateOutcome> {
            Ok(UpdateOutcome { matched_count: 1, modified_count: 1 })
        }

        async fn delete_many(&self, _namespace: &str, _filter: &Document, _multi: bool) -> Result<DeleteOutcome> {
            Ok(DeleteOutcome { deleted_count: 1 })
        }

        async fn count_documents(&self, _namespace: &str, _filter: &Document) -> Result<u64> {
            Ok(self.documents.lock().unwrap().len() as u64)
        }

        async fn aggregate(&self, namespace: &str, _pipeline: &[Document], batch_size: i64) -> Result<Batch> {
            Ok(CursorManager::new(std::time::Duration::from_secs(600)).open(namespace, self.documents.lock().unwrap().clone(), batch_size))
        }

        async fn list_indexes(&self, _namespace: &str) -> Result<Vec<Document>> {
            Ok(vec![])
        }

        fn is_read_only(&self) -> bool {
            self.read_only
        }
    }

    fn dispatcher_with(documents: Vec<Document>) -> Dispatcher {
        let backend = Arc::new(FakeBackend {
            documents: StdMutex::new(documents),
            read_only: false,
        });
        Dispatcher::new(backend, None, RelayConfig::default(), CursorManager::new(std::time::Duration::from_secs(600)))
    }

    #[tokio::test]
    async fn find_returns_a_cursor_response() {
        let dispatcher = dispatcher_with(vec![bson::doc! { "_id": 1i32 }]);
        let command = bson::doc! { "find": "widgets", "$db": "app" };
        let response = dispatcher.dispatch(command).await;
        assert_eq!(response.get_f64("ok").unwrap(), 1.0);
        let cursor = response.get_document("cursor").unwrap();
        assert_eq!(cursor.get_array("firstBatch").unwrap().len(), 1);
        assert_eq!(cursor.get_i64("id").unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_command_is_a_command_error() {
        let dispatcher = dispatcher_with(vec![]);
        let response = dispatcher.dispatch(bson::doc! { "notACommand": 1, "$db": "app" }).await;
        assert_eq!(response.get_f64("ok").unwrap(), 0.0);
        assert_eq!(response.get_i32("code").unwrap(), crate::error::code::COMMAND_NOT_FOUND);
    }

    #[tokio::test]
    async fn insert_reports_inserted_count() {
        let dispatcher = dispatcher_with(vec![]);
        let command = bson::doc! { "insert": "widgets", "$db": "app", "documents": [bson::doc! { "a": 1i32 }] };
        let response = dispatcher.dispatch(command).await;
        assert_eq!(response.get_f64("ok").unwrap(), 1.0);
        assert_eq!(response.get_i32("n").unwrap(), 1);
    }

    #[tokio::test]
    async fn kill_cursors_acknowledges_the_requested_ids() {
        let dispatcher = dispatcher_with(vec![]);
        let command = bson::doc! { "killCursors": "widgets", "$db": "app", "cursors": [123i64] };
        let response = dispatcher.dispatch(command).await;
        assert_eq!(response.get_f64("ok").unwrap(), 1.0);
        assert_eq!(response.get_array("cursorsKilled").unwrap().len(), 1);
    }
}
