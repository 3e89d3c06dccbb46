//! End-to-end scenarios exercising the command dispatcher against an
//! in-memory fake backend (scenarios from the testable-properties list).

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use bson::{Bson, Document};
use relaydb::backend::{Backend, DeleteOutcome, InsertOutcome, UpdateOutcome};
use relaydb::config::RelayConfig;
use relaydb::cursor::{Batch, CursorManager};
use relaydb::{Dispatcher, RelayError};

struct FakeBackend {
    documents: StdMutex<Vec<Document>>,
    read_only: bool,
}

impl FakeBackend {
    fn seeded(documents: Vec<Document>) -> Arc<Self> {
        Arc::new(Self {
            documents: StdMutex::new(documents),
            read_only: false,
        })
    }

    fn read_only() -> Arc<Self> {
        Arc::new(Self {
            documents: StdMutex::new(Vec::new()),
            read_only: true,
        })
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn insert_many(&self, _namespace: &str, documents: Vec<Document>) -> relaydb::error::Result<InsertOutcome> {
        if self.read_only {
            return Err(RelayError::read_only("insertOne"));
        }
        let ids = documents
            .iter()
            .map(|d| d.get("_id").cloned().unwrap_or(Bson::Int32(1)))
            .collect();
        self.documents.lock().unwrap().extend(documents);
        Ok(InsertOutcome { inserted_ids: ids })
    }

    async fn find(
        &self,
        _namespace: &str,
        filter: &Document,
        _sort: Option<&Document>,
        _limit: Option<i64>,
        _skip: Option<i64>,
    ) -> relaydb::error::Result<Vec<Document>> {
        let docs = self.documents.lock().unwrap();
        if filter.is_empty() {
            return Ok(docs.clone());
        }
        Ok(docs.iter().filter(|d| matches_filter(d, filter)).cloned().collect())
    }

    async fn update_many(&self, _namespace: &str, _filter: &Document, _update: &Document, _multi: bool) -> relaydb::error::Result<UpdateOutcome> {
        Ok(UpdateOutcome::default())
    }

    async fn delete_many(&self, _namespace: &str, _filter: &Document, _multi: bool) -> relaydb::error::Result<DeleteOutcome> {
        Ok(DeleteOutcome::default())
    }

    async fn count_documents(&self, _namespace: &str, _filter: &Document) -> relaydb::error::Result<u64> {
        Ok(self.documents.lock().unwrap().len() as u64)
    }

    async fn aggregate(&self, _namespace: &str, _pipeline: &[Document], _batch_size: i64) -> relaydb::error::Result<Batch> {
        Ok(Batch { cursor_id: 0, documents: self.documents.lock().unwrap().clone() })
    }

    async fn list_indexes(&self, _namespace: &str) -> relaydb::error::Result<Vec<Document>> {
        Ok(vec![])
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

/// Minimal `$gte`/`$elemMatch` evaluator — enough to drive the scenarios
/// below without pulling in the real SQL translators.
fn matches_filter(doc: &Document, filter: &Document) -> bool {
    filter.iter().all(|(key, condition)| match condition {
        Bson::Document(ops) if ops.keys().all(|k| k.starts_with('$')) => {
            ops.iter().all(|(op, value)| match op.as_str() {
                "$gte" => doc.get(key).and_then(|v| v.as_i64()).unwrap_or(i64::MIN) >= value.as_i64().unwrap_or(0),
                "$elemMatch" => doc
                    .get_array(key)
                    .map(|arr| arr.iter().any(|el| el.as_document().is_some_and(|d| matches_filter(d, value.as_document().unwrap())))
                    )
                    .unwrap_or(false),
                "$gt" => doc.get(key).and_then(|v| v.as_i64()).unwrap_or(i64::MIN) > value.as_i64().unwrap_or(0),
                _ => false,
            })
        }
        other => doc.get(key) == Some(other),
    })
}

fn dispatcher_over(backend: Arc<dyn Backend>) -> Dispatcher {
    Dispatcher::new(backend, None, RelayConfig::default(), CursorManager::new(Duration::from_secs(600)))
}

#[tokio::test]
async fn insert_then_find_returns_the_inserted_document() {
    let backend = FakeBackend::seeded(Vec::new());
    let dispatcher = dispatcher_over(backend);

    let insert = bson::doc! {
        "insert": "people", "$db": "app",
        "documents": [bson::doc! { "_id": 1i32, "name": "Alice", "age": 30i32 }],
    };
    let insert_response = dispatcher.dispatch(insert).await;
    assert_eq!(insert_response.get_i32("n").unwrap(), 1);

    let find = bson::doc! {
        "find": "people", "$db": "app",
        "filter": { "age": { "$gte": 18i32 } },
    };
    let find_response = dispatcher.dispatch(find).await;
    let batch = find_response.get_document("cursor").unwrap().get_array("firstBatch").unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].as_document().unwrap().get_str("name").unwrap(), "Alice");
}

#[tokio::test]
async fn elem_match_selects_only_the_matching_document() {
    let seed = vec![
        bson::doc! { "_id": 1i32, "tags": [bson::doc! { "k": "x", "n": 1i32 }, bson::doc! { "k": "y", "n": 5i32 }] },
        bson::doc! { "_id": 2i32, "tags": [bson::doc! { "k": "x", "n": 10i32 }] },
    ];
    let dispatcher = dispatcher_over(FakeBackend::seeded(seed));

    let find = bson::doc! {
        "find": "widgets", "$db": "app",
        "filter": { "tags": { "$elemMatch": { "k": "x", "n": { "$gt": 5i32 } } } },
    };
    let response = dispatcher.dispatch(find).await;
    let batch = response.get_document("cursor").unwrap().get_array("firstBatch").unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].as_document().unwrap().get_i32("_id").unwrap(), 2);
}

#[tokio::test]
async fn cursor_paging_exhausts_after_the_expected_number_of_batches() {
    // 150 documents at batchSize 50: the initial find returns 50 and a
    // live cursor; two getMore(50) calls return the remaining 100, the
    // second of which already reports id=0 (the cursor manager retires a
    // cursor in the same call that drains it, see cursor.rs::advance).
    let seed: Vec<Document> = (0..150).map(|i| bson::doc! { "_id": i as i64 }).collect();
    let dispatcher = dispatcher_over(FakeBackend::seeded(seed));

    let find = bson::doc! { "find": "widgets", "$db": "app", "filter": {}, "batchSize": 50i64 };
    let first = dispatcher.dispatch(find).await;
    let cursor = first.get_document("cursor").unwrap();
    assert_ne!(cursor.get_i64("id").unwrap(), 0);
    assert_eq!(cursor.get_array("firstBatch").unwrap().len(), 50);
    let cursor_id = cursor.get_i64("id").unwrap();

    let second = dispatcher
        .dispatch(bson::doc! { "getMore": cursor_id, "$db": "app", "collection": "widgets", "batchSize": 50i64 })
        .await;
    let second_cursor = second.get_document("cursor").unwrap();
    assert_ne!(second_cursor.get_i64("id").unwrap(), 0);
    assert_eq!(second_cursor.get_array("nextBatch").unwrap().len(), 50);

    let third = dispatcher
        .dispatch(bson::doc! { "getMore": second_cursor.get_i64("id").unwrap(), "$db": "app", "collection": "widgets", "batchSize": 50i64 })
        .await;
    let third_cursor = third.get_document("cursor").unwrap();
    assert_eq!(third_cursor.get_i64("id").unwrap(), 0);
    assert_eq!(third_cursor.get_array("nextBatch").unwrap().len(), 50);
}

#[tokio::test]
async fn read_only_backend_rejects_writes_without_a_network_call() {
    let backend = FakeBackend::read_only();
    let dispatcher = dispatcher_over(backend);

    let insert = bson::doc! { "insert": "t", "$db": "db", "documents": [bson::doc! { "x": 1i32 }] };
    let response = dispatcher.dispatch(insert).await;
    assert_eq!(response.get_f64("ok").unwrap(), 0.0);
    assert_eq!(response.get_i32("code").unwrap(), relaydb::error::code::ILLEGAL_OPERATION);
}
