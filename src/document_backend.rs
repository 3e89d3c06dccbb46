/*!
 * @file document_backend.rs
 * @brief Document Backend (C9): the embedded JSON-relational document store
 *
 * Grounded on the base server's `database.rs` (`deadpool_postgres::Pool`
 * over `tokio-postgres`, connection-pool error mapping) generalized to the
 * `collections(id, name)` / `documents(id, collection_id, _id, data)`
 * schema spec §4.8 describes, with a linear migration manager replacing the
 * base server's ad hoc `CREATE TABLE IF NOT EXISTS` calls scattered across
 * call sites.
 */

use std::sync::Arc;

use async_trait::async_trait;
use bson::{Bson, Document};
use deadpool_postgres::{Manager, Pool};
use tokio_postgres::NoTls;

use crate::aggregate::{self, CompiledPipeline};
use crate::backend::{Backend, DeleteOutcome, InsertOutcome, UpdateOutcome};
use crate::config::DocumentBackendConfig;
use crate::cursor::CursorManager;
use crate::dialect::Dialect;
use crate::document::{set_path, unset_path};
use crate::error::{RelayError, Result};
use crate::executor;
use crate::function_evaluator::FunctionEvaluator;
use crate::objectid::ObjectIdGenerator;
use crate::query;
use crate::stage::parse_pipeline;

const MIGRATIONS: &[(u32, &str)] = &[
    (
        1,
        "CREATE TABLE IF NOT EXISTS collections (id BIGSERIAL PRIMARY KEY, name TEXT UNIQUE NOT NULL)",
    ),
    (
        2,
        "CREATE TABLE IF NOT EXISTS documents ( \
            id BIGSERIAL PRIMARY KEY, \
            collection_id BIGINT NOT NULL REFERENCES collections(id), \
            _id TEXT NOT NULL, \
            data JSONB NOT NULL \
        )",
    ),
    (
        3,
        "CREATE UNIQUE INDEX IF NOT EXISTS documents_collection_id_idx ON documents (collection_id, _id)",
    ),
    (
        4,
        "CREATE TABLE IF NOT EXISTS schema_migrations (version INT PRIMARY KEY, applied_at TIMESTAMPTZ NOT NULL DEFAULT now())",
    ),
];

pub struct DocumentBackend {
    pool: Pool,
    objectid_generator: ObjectIdGenerator,
    cursors: CursorManager,
    evaluator: Arc<FunctionEvaluator>,
}

impl DocumentBackend {
    pub async fn new(config: &DocumentBackendConfig, cursors: CursorManager, evaluator: Arc<FunctionEvaluator>) -> Result<Self> {
        let pg_config = config
            .connection_string
            .parse()
            .map_err(|e| RelayError::Database(format!("invalid document backend connection string: {e}")))?;
        let manager = Manager::new(pg_config, NoTls);
        let pool = Pool::builder(manager)
            .max_size(config.pool_size as usize)
            .build()
            .map_err(|e| RelayError::ConnectionPool(format!("failed to build document backend pool: {e}")))?;

        let backend = Self {
            pool,
            objectid_generator: ObjectIdGenerator::new(),
            cursors,
            evaluator,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Exposes the underlying connection pool for the health checker
    /// (spec §4.16 A7) — a cheap clone, `Pool` is itself `Arc`-backed.
    pub fn pool(&self) -> Pool {
        self.pool.clone()
    }

    /// Validate a linear sequence of versioned migrations and advance to
    /// the latest (spec §4.8: "opens with a migration manager").
    async fn run_migrations(&self) -> Result<()> {
        let client = self.pool.get().await.map_err(pool_error)?;
        client
            .batch_execute("CREATE TABLE IF NOT EXISTS schema_migrations (version INT PRIMARY KEY, applied_at TIMESTAMPTZ NOT NULL DEFAULT now())")
            .await
            .map_err(RelayError::from)?;

        let applied: Vec<i32> = client
            .query("SELECT version FROM schema_migrations ORDER BY version", &[])
            .await
            .map_err(RelayError::from)?
            .iter()
            .map(|row| row.get::<_, i32>(0))
            .collect();

        for (version, ddl) in MIGRATIONS {
            if applied.contains(&(*version as i32)) {
                continue;
            }
            client.batch_execute(ddl).await.map_err(RelayError::from)?;
            client
                .execute(
                    "INSERT INTO schema_migrations (version) VALUES ($1) ON CONFLICT DO NOTHING",
                    &[&(*version as i32)],
                )
                .await
                .map_err(RelayError::from)?;
        }
        Ok(())
    }

    async fn resolve_collection_id(&self, namespace: &str, create_if_missing: bool) -> Result<i64> {
        let client = self.pool.get().await.map_err(pool_error)?;
        if let Some(row) = client
            .query_opt("SELECT id FROM collections WHERE name = $1", &[&namespace])
            .await
            .map_err(RelayError::from)?
        {
            return Ok(row.get(0));
        }
        if !create_if_missing {
            return Err(RelayError::NamespaceNotFound(namespace.to_string()));
        }
        let row = client
            .query_one(
                "INSERT INTO collections (name) VALUES ($1) ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name RETURNING id",
                &[&namespace],
            )
            .await
            .map_err(RelayError::from)?;
        Ok(row.get(0))
    }

    fn document_to_json(doc: &Document) -> Result<serde_json::Value> {
        serde_json::to_value(doc).map_err(RelayError::from)
    }

    fn row_to_document(value: serde_json::Value) -> Result<Document> {
        bson::to_document(&serde_json::from_value::<Document>(value.clone()).unwrap_or_default())
            .or_else(|_| {
                let as_bson: Bson = bson::to_bson(&value).map_err(RelayError::from)?;
                as_bson
                    .as_document()
                    .cloned()
                    .ok_or_else(|| RelayError::internal_error("stored row was not a JSON object"))
            })
    }
}

fn pool_error(e: deadpool_postgres::PoolError) -> RelayError {
    RelayError::ConnectionPool(e.to_string())
}

/// Translate `filter` and shift its placeholders past `collection_id = $1`,
/// which every `find`/`count_documents` query binds ahead of the filter's
/// own parameters. Without the shift, a filter touching two or more fields
/// emits `$1`/`$2` that collide with the hand-written `$1` above it.
fn collection_scoped_where(
    dialect: &crate::dialect::PostgresJsonbDialect,
    filter: &Document,
) -> Result<(String, Vec<crate::dialect::Param>)> {
    let (where_sql, where_params) = query::translate(dialect, filter)?;
    Ok((dialect.renumber_params(&where_sql, 1), where_params))
}

#[async_trait]
impl Backend for DocumentBackend {
    async fn insert_many(&self, namespace: &str, mut documents: Vec<Document>) -> Result<InsertOutcome> {
        let collection_id = self.resolve_collection_id(namespace, true).await?;
        let client = self.pool.get().await.map_err(pool_error)?;

        let mut inserted_ids = Vec::with_capacity(documents.len());
        for doc in documents.iter_mut() {
            if !doc.contains_key("_id") {
                let oid = self.objectid_generator.next();
                doc.insert("_id", Bson::ObjectId(oid));
            }
            let id_bson = doc.get("_id").unwrap().clone();
            let id_text = match &id_bson {
                Bson::ObjectId(oid) => oid.to_hex(),
                other => other.to_string(),
            };
            let json = Self::document_to_json(doc)?;
            client
                .execute(
                    "INSERT INTO documents (collection_id, _id, data) VALUES ($1, $2, $3)",
                    &[&collection_id, &id_text, &json],
                )
                .await
                .map_err(RelayError::from)?;
            inserted_ids.push(id_bson);
        }
        Ok(InsertOutcome { inserted_ids })
    }

    async fn find(
        &self,
        namespace: &str,
        filter: &Document,
        sort: Option<&Document>,
        limit: Option<i64>,
        skip: Option<i64>,
    ) -> Result<Vec<Document>> {
        let collection_id = self.resolve_collection_id(namespace, false).await?;
        let dialect = crate::dialect::PostgresJsonbDialect::new("data");
        let (where_sql, where_params) = collection_scoped_where(&dialect, filter)?;

        let mut sql = format!("SELECT data FROM documents WHERE collection_id = $1 AND ({where_sql})");
        if let Some(sort_spec) = sort {
            let sort_stage = crate::stage::Stage::Sort(sort_spec.clone());
            let mut counter = 0;
            let fragment = crate::stage::translate_stage(&dialect, &sort_stage, &mut counter)?;
            if let Some(order_by) = fragment.order_by_clause {
                sql.push_str(&format!(" ORDER BY {order_by}"));
            }
        }
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(skip) = skip {
            sql.push_str(&format!(" OFFSET {skip}"));
        }

        let client = self.pool.get().await.map_err(pool_error)?;
        let mut bound: Vec<Box<dyn tokio_postgres::types::ToSql + Sync>> = vec![Box::new(collection_id)];
        for param in &where_params {
            bound.push(param_to_sql(param));
        }
        let refs: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> = bound.iter().map(|b| b.as_ref()).collect();

        let rows = client.query(&sql, &refs).await.map_err(RelayError::from)?;
        rows.into_iter()
            .map(|row| Self::row_to_document(row.get(0)))
            .collect()
    }

    async fn update_many(&self, namespace: &str, filter: &Document, update: &Document, multi: bool) -> Result<UpdateOutcome> {
        let collection_id = self.resolve_collection_id(namespace, false).await?;
        let matching = self.find(namespace, filter, None, None, None).await?;
        let targets = if multi { matching } else { matching.into_iter().take(1).collect() };

        let client = self.pool.get().await.map_err(pool_error)?;
        let mut modified = 0u64;
        for mut doc in targets.iter().cloned() {
            let id_bson = doc.get("_id").cloned();
            apply_update_operators(&mut doc, update)?;
            let json = Self::document_to_json(&doc)?;
            let id_text = match &id_bson {
                Some(Bson::ObjectId(oid)) => oid.to_hex(),
                Some(other) => other.to_string(),
                None => continue,
            };
            client
                .execute(
                    "UPDATE documents SET data = $1 WHERE collection_id = $2 AND _id = $3",
                    &[&json, &collection_id, &id_text],
                )
                .await
                .map_err(RelayError::from)?;
            modified += 1;
        }
        Ok(UpdateOutcome {
            matched_count: modified,
            modified_count: modified,
        })
    }

    async fn delete_many(&self, namespace: &str, filter: &Document, multi: bool) -> Result<DeleteOutcome> {
        let collection_id = self.resolve_collection_id(namespace, false).await?;
        let matching = self.find(namespace, filter, None, None, None).await?;
        let targets = if multi { matching } else { matching.into_iter().take(1).collect::<Vec<_>>() };

        let client = self.pool.get().await.map_err(pool_error)?;
        let mut deleted = 0u64;
        for doc in &targets {
            let id_text = match doc.get("_id") {
                Some(Bson::ObjectId(oid)) => oid.to_hex(),
                Some(other) => other.to_string(),
                None => continue,
            };
            client
                .execute(
                    "DELETE FROM documents WHERE collection_id = $1 AND _id = $2",
                    &[&collection_id, &id_text],
                )
                .await
                .map_err(RelayError::from)?;
            deleted += 1;
        }
        Ok(DeleteOutcome { deleted_count: deleted })
    }

    async fn count_documents(&self, namespace: &str, filter: &Document) -> Result<u64> {
        let collection_id = self.resolve_collection_id(namespace, false).await?;
        let dialect = crate::dialect::PostgresJsonbDialect::new("data");
        let (where_sql, where_params) = collection_scoped_where(&dialect, filter)?;
        let sql = format!("SELECT COUNT(*) FROM documents WHERE collection_id = $1 AND ({where_sql})");

        let client = self.pool.get().await.map_err(pool_error)?;
        let mut bound: Vec<Box<dyn tokio_postgres::types::ToSql + Sync>> = vec![Box::new(collection_id)];
        for param in &where_params {
            bound.push(param_to_sql(param));
        }
        let refs: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> = bound.iter().map(|b| b.as_ref()).collect();
        let row = client.query_one(&sql, &refs).await.map_err(RelayError::from)?;
        let count: i64 = row.get(0);
        Ok(count as u64)
    }

    async fn aggregate(&self, namespace: &str, pipeline: &[Document], batch_size: i64) -> Result<crate::cursor::Batch> {
        let collection_id = self.resolve_collection_id(namespace, false).await?;
        let stages = parse_pipeline(pipeline)?;
        let source = format!("(SELECT data FROM documents WHERE collection_id = {collection_id}) AS base");
        let compiled = aggregate::compile(&source, "data", stages)?;

        let client = self.pool.get().await.map_err(pool_error)?;
        let documents = match compiled {
            CompiledPipeline::Statement(statement) => {
                let bound: Vec<Box<dyn tokio_postgres::types::ToSql + Sync>> =
                    statement.params.iter().map(param_to_sql).collect();
                let refs: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> = bound.iter().map(|b| b.as_ref()).collect();
                let rows = client.query(&statement.sql, &refs).await.map_err(RelayError::from)?;
                let mut docs = rows
                    .into_iter()
                    .map(|row| Self::row_to_document(row.get(0)))
                    .collect::<Result<Vec<_>>>()?;
                executor::resolve_function_placeholders(&mut docs, &self.evaluator)?;
                if let Some(sort_spec) = &statement.post_function_sort {
                    executor::reapply_trailing_sort(&mut docs, sort_spec);
                }
                docs
            }
            CompiledPipeline::Facets(branches) => {
                let mut merged = Document::new();
                for (name, statement) in branches {
                    let bound: Vec<Box<dyn tokio_postgres::types::ToSql + Sync>> =
                        statement.params.iter().map(param_to_sql).collect();
                    let refs: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> = bound.iter().map(|b| b.as_ref()).collect();
                    let rows = client.query(&statement.sql, &refs).await.map_err(RelayError::from)?;
                    let mut branch_docs: Vec<Document> = rows
                        .into_iter()
                        .map(|row| Self::row_to_document(row.get(0)))
                        .collect::<Result<Vec<_>>>()?;
                    executor::resolve_function_placeholders(&mut branch_docs, &self.evaluator)?;
                    if let Some(sort_spec) = &statement.post_function_sort {
                        executor::reapply_trailing_sort(&mut branch_docs, sort_spec);
                    }
                    merged.insert(name, Bson::Array(branch_docs.into_iter().map(Bson::Document).collect()));
                }
                vec![merged]
            }
        };

        Ok(self.cursors.open(namespace, documents, batch_size))
    }

    async fn list_indexes(&self, namespace: &str) -> Result<Vec<Document>> {
        let _ = self.resolve_collection_id(namespace, false).await?;
        Ok(vec![bson::doc! { "v": 2, "key": { "_id": 1 }, "name": "_id_" }])
    }
}

/// Apply `$set`/`$unset` update operators over dot-paths (spec §4.8
/// updateOne); `_id` is never touched.
fn apply_update_operators(doc: &mut Document, update: &Document) -> Result<()> {
    for (op, body) in update {
        let body_doc = body
            .as_document()
            .ok_or_else(|| RelayError::bad_value(format!("{op} requires a document")))?;
        match op.as_str() {
            "$set" => {
                for (path, value) in body_doc {
                    if path != "_id" {
                        set_path(doc, path, value.clone());
                    }
                }
            }
            "$unset" => {
                for (path, _) in body_doc {
                    if path != "_id" {
                        unset_path(doc, path);
                    }
                }
            }
            other => return Err(RelayError::bad_value(format!("unsupported update operator: {other}"))),
        }
    }
    Ok(())
}

fn param_to_sql(param: &crate::dialect::Param) -> Box<dyn tokio_postgres::types::ToSql + Sync> {
    use crate::dialect::Param;
    match param {
        Param::Null => Box::new(Option::<String>::None),
        Param::Bool(b) => Box::new(*b),
        Param::Int(n) => Box::new(*n),
        Param::Double(d) => Box::new(*d),
        Param::String(s) => Box::new(s.clone()),
        Param::Bytes(b) => Box::new(b.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::Param;

    #[test]
    fn multi_key_filter_placeholders_start_after_collection_id() {
        let dialect = crate::dialect::PostgresJsonbDialect::new("data");
        let filter = bson::doc! { "name": "Alice", "age": { "$gte": 30i32 } };
        let (where_sql, where_params) = collection_scoped_where(&dialect, &filter).unwrap();

        assert_eq!(where_params.len(), 2);
        assert!(!where_sql.contains("$1"), "where clause must not reuse collection_id's $1: {where_sql}");
        assert!(where_sql.contains("$2"));
        assert!(where_sql.contains("$3"));

        let sql = format!("SELECT data FROM documents WHERE collection_id = $1 AND ({where_sql})");
        assert_eq!(where_params, vec![Param::String("Alice".to_string()), Param::Int(30)]);
        // collection_id ($1) plus the filter's own two params line up 1:1 with
        // the query's three total bound values.
        assert_eq!(sql.matches('$').count(), 3);
    }

    #[test]
    fn single_key_filter_still_offsets_past_collection_id() {
        let dialect = crate::dialect::PostgresJsonbDialect::new("data");
        let filter = bson::doc! { "name": "Bob" };
        let (where_sql, where_params) = collection_scoped_where(&dialect, &filter).unwrap();

        assert_eq!(where_params.len(), 1);
        assert!(!where_sql.contains("$1"));
        assert!(where_sql.contains("$2"));
    }
}
