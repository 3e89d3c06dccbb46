/*!
 * @file aggregate.rs
 * @brief Aggregation Translator (C5): walk optimized stages, emit SQL
 *
 * Specific to the document backend (C9) — the OLAP backend (C10) compiles
 * aggregation pipelines with its own dialect-specific compiler (spec §4.9),
 * not through this module. Every CTE this module emits exposes exactly one
 * `doc` jsonb column, so stage translators downstream of the first CTE
 * always read/write through `src.doc` regardless of the physical document
 * column name the base table uses.
 */

use indexmap::IndexMap;

use crate::dialect::{Dialect, Param, PostgresJsonbDialect};
use crate::error::{RelayError, Result};
use crate::optimizer;
use crate::stage::{self, is_shape_preserving, Stage, StageFragment};

/// Each stage translator numbers its own fragment's placeholders from 1 in
/// isolation (spec §4.3). Before folding a fragment's params into a running
/// list, shift its placeholder text up by how many params already precede
/// it so two fragments never both claim `$1`.
fn renumber_fragment(dialect: &dyn Dialect, mut fragment: StageFragment, offset: usize) -> StageFragment {
    if offset == 0 {
        return fragment;
    }
    fragment.select_clause = fragment.select_clause.map(|s| dialect.renumber_params(&s, offset));
    fragment.where_clause = fragment.where_clause.map(|s| dialect.renumber_params(&s, offset));
    fragment.group_by_clause = fragment.group_by_clause.map(|s| dialect.renumber_params(&s, offset));
    fragment.order_by_clause = fragment.order_by_clause.map(|s| dialect.renumber_params(&s, offset));
    fragment.cte_expression = fragment.cte_expression.map(|s| dialect.renumber_params(&s, offset));
    fragment
}

/// Shift every placeholder in a fully-rendered SQL body (e.g. a flushed
/// `Pending`, itself internally consistent from 1) up by `offset` so it can
/// be spliced after params that already precede it in the final statement.
fn renumber_body(dialect: &dyn Dialect, body: String, offset: usize) -> String {
    if offset == 0 {
        body
    } else {
        dialect.renumber_params(&body, offset)
    }
}

#[derive(Debug, Clone)]
pub struct CompiledStatement {
    pub sql: String,
    pub params: Vec<Param>,
    /// Set when a `$sort` stage followed a stage containing `$function`
    /// (spec §4.7 step 7) — the backend sorted on unresolved placeholder
    /// strings, so the executor must re-sort in memory after resolving them.
    pub post_function_sort: Option<bson::Document>,
}

/// The result of compiling a pipeline (spec §4.5): either a single
/// statement, or — when the pipeline contains `$facet` — the CTEs
/// accumulated up to that point plus one compiled statement per branch.
#[derive(Debug, Clone)]
pub enum CompiledPipeline {
    Statement(CompiledStatement),
    Facets(IndexMap<String, CompiledStatement>),
}

#[derive(Default)]
struct Pending {
    select_clause: Option<String>,
    where_clauses: Vec<String>,
    group_by_clause: Option<String>,
    order_by_clause: Option<String>,
    limit_clause: Option<i64>,
    offset_clause: Option<i64>,
    params: Vec<Param>,
}

impl Pending {
    fn is_trivial(&self) -> bool {
        self.select_clause.is_none()
            && self.where_clauses.is_empty()
            && self.group_by_clause.is_none()
            && self.order_by_clause.is_none()
            && self.limit_clause.is_none()
            && self.offset_clause.is_none()
    }

    fn merge_fragment(&mut self, dialect: &dyn Dialect, fragment: StageFragment) {
        let fragment = renumber_fragment(dialect, fragment, self.params.len());
        if let Some(select) = fragment.select_clause {
            self.select_clause = Some(select);
        }
        if let Some(where_sql) = fragment.where_clause {
            self.where_clauses.push(where_sql);
        }
        if let Some(group_by) = fragment.group_by_clause {
            self.group_by_clause = Some(group_by);
        }
        if let Some(order_by) = fragment.order_by_clause {
            self.order_by_clause = Some(order_by);
        }
        if let Some(limit) = fragment.limit_clause {
            self.limit_clause = Some(limit);
        }
        if let Some(offset) = fragment.offset_clause {
            self.offset_clause = Some(offset);
        }
        self.params.extend(fragment.params);
    }

    fn render(&self, from_clause: &str) -> String {
        let select = self.select_clause.clone().unwrap_or_else(|| "src.doc AS doc".to_string());
        let mut sql = format!("SELECT {select} FROM {from_clause} src");
        if !self.where_clauses.is_empty() {
            sql.push_str(&format!(" WHERE {}", self.where_clauses.join(" AND ")));
        }
        if let Some(group_by) = &self.group_by_clause {
            sql.push_str(&format!(" GROUP BY {group_by}"));
        }
        if let Some(order_by) = &self.order_by_clause {
            sql.push_str(&format!(" ORDER BY {order_by}"));
        }
        if let Some(limit) = self.limit_clause {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = self.offset_clause {
            sql.push_str(&format!(" OFFSET {offset}"));
        }
        sql
    }
}

/// Compile a full pipeline against `source_table`, whose raw document
/// column is named `document_column` (spec §4.5).
pub fn compile(source_table: &str, document_column: &str, stages: Vec<Stage>) -> Result<CompiledPipeline> {
    let stages = optimizer::optimize(stages);

    // Heuristic: at most one shape-transforming stage and no always-flush
    // stage compiles to a flat SELECT with no CTEs (spec §4.5 Heuristic).
    let transform_count = stages.iter().filter(|s| !is_shape_preserving(s)).count();
    let has_always_flush = stages.iter().any(stage::always_flushes);
    let has_facet = stages.iter().any(|s| matches!(s, Stage::Facet(_)));

    if transform_count <= 1 && !has_always_flush && !has_facet {
        return compile_flat(source_table, document_column, &stages);
    }

    compile_chained(source_table, document_column, &stages)
}

fn compile_flat(source_table: &str, document_column: &str, stages: &[Stage]) -> Result<CompiledPipeline> {
    let dialect = PostgresJsonbDialect::new(document_column);
    let from_clause = source_table.to_string();
    let mut pending = Pending::default();
    let mut cte_counter = 0usize;

    for stage in stages {
        let fragment = stage::translate_stage(&dialect, stage, &mut cte_counter)?;
        pending.merge_fragment(&dialect, fragment);
    }

    Ok(CompiledPipeline::Statement(CompiledStatement {
        sql: pending.render(&from_clause),
        params: pending.params,
        post_function_sort: trailing_sort_after_function(stages),
    }))
}

/// Whether a value-expression document embeds a `$function` call anywhere
/// within it (spec §4.7 step 7 detection).
fn contains_function_call(value: &bson::Bson) -> bool {
    match value {
        bson::Bson::Document(doc) => doc.iter().any(|(k, v)| k == "$function" || contains_function_call(v)),
        bson::Bson::Array(items) => items.iter().any(contains_function_call),
        _ => false,
    }
}

/// The last `$sort` stage that follows a stage embedding `$function`, if any.
fn trailing_sort_after_function(stages: &[Stage]) -> Option<bson::Document> {
    let mut seen_function = false;
    let mut trailing = None;
    for stage in stages {
        match stage {
            Stage::Project(doc) | Stage::Group(doc) | Stage::AddFields(doc) => {
                if contains_function_call(&bson::Bson::Document(doc.clone())) {
                    seen_function = true;
                }
            }
            Stage::Sort(doc) if seen_function => {
                trailing = Some(doc.clone());
            }
            _ => {}
        }
    }
    trailing
}

fn compile_chained(source_table: &str, document_column: &str, stages: &[Stage]) -> Result<CompiledPipeline> {
    let mut ctes: Vec<(String, String, Vec<Param>)> = Vec::new();
    let mut current_from = source_table.to_string();
    let mut current_document_column = document_column.to_string();
    let mut pending = Pending::default();
    let mut cte_counter = 0usize;

    for stage in stages {
        if let Stage::Facet(branches) = stage {
            let facet_dialect = PostgresJsonbDialect::new(&current_document_column);
            let pre_facet_name = flush(
                &facet_dialect,
                &mut ctes,
                &mut pending,
                &current_from,
                &current_document_column,
                &mut cte_counter,
                true,
            );
            let source = pre_facet_name.unwrap_or(current_from.clone());
            let preamble = render_ctes(&ctes);
            let preamble_params: Vec<Param> = ctes.iter().flat_map(|(_, _, p)| p.clone()).collect();

            let mut compiled_branches = IndexMap::new();
            for (name, branch_stages) in branches {
                let branch_pipeline = compile(&source, "doc", branch_stages.clone())?;
                let CompiledPipeline::Statement(mut statement) = branch_pipeline else {
                    return Err(RelayError::bad_value("$facet branches may not themselves contain $facet"));
                };
                if !preamble.is_empty() {
                    let branch_dialect = PostgresJsonbDialect::new("doc");
                    let body = renumber_body(&branch_dialect, statement.sql, preamble_params.len());
                    statement.sql = format!("WITH {preamble} {body}");
                    let mut params = preamble_params.clone();
                    params.extend(statement.params);
                    statement.params = params;
                }
                compiled_branches.insert(name.clone(), statement);
            }
            return Ok(CompiledPipeline::Facets(compiled_branches));
        }

        let dialect = PostgresJsonbDialect::new(&current_document_column);
        let fragment = stage::translate_stage(&dialect, stage, &mut cte_counter)?;

        if stage::always_flushes(stage) {
            flush(
                &dialect,
                &mut ctes,
                &mut pending,
                &current_from,
                &current_document_column,
                &mut cte_counter,
                false,
            );
            let cte_name = fragment.cte_name.clone().unwrap();
            let upstream_source = source_sql(&current_from, &current_document_column);
            let offset: usize = ctes.iter().map(|(_, _, p)| p.len()).sum();
            let cte_body = renumber_body(&dialect, fragment.cte_expression.clone().unwrap(), offset)
                .replace("__upstream__", &upstream_source);
            ctes.push((cte_name.clone(), cte_body, fragment.params));
            current_from = cte_name;
            current_document_column = "doc".to_string();
            continue;
        }

        if is_shape_preserving(stage) {
            pending.merge_fragment(&dialect, fragment);
        } else {
            pending.merge_fragment(&dialect, fragment);
            let new_name = flush(
                &dialect,
                &mut ctes,
                &mut pending,
                &current_from,
                &current_document_column,
                &mut cte_counter,
                false,
            )
            .unwrap();
            current_from = new_name;
            current_document_column = "doc".to_string();
        }
    }

    let final_dialect = PostgresJsonbDialect::new(&current_document_column);
    let final_name = flush(
        &final_dialect,
        &mut ctes,
        &mut pending,
        &current_from,
        &current_document_column,
        &mut cte_counter,
        true,
    );

    let (sql, params) = if let Some(name) = final_name {
        let idx = ctes.iter().position(|(n, _, _)| n == &name).unwrap();
        let (_, body, cte_params) = ctes.remove(idx);
        let preamble = render_ctes(&ctes);
        let sql = if preamble.is_empty() {
            body
        } else {
            format!("WITH {preamble} {body}")
        };
        let mut params: Vec<Param> = ctes.iter().flat_map(|(_, _, p)| p.clone()).collect();
        params.extend(cte_params);
        (sql, params)
    } else {
        let preamble = render_ctes(&ctes);
        let sql = format!("WITH {preamble} SELECT src.doc AS doc FROM {current_from} src");
        let params = ctes.iter().flat_map(|(_, _, p)| p.clone()).collect();
        (sql, params)
    };

    Ok(CompiledPipeline::Statement(CompiledStatement {
        sql,
        params,
        post_function_sort: trailing_sort_after_function(stages),
    }))
}

fn source_sql(from: &str, document_column: &str) -> String {
    if document_column == "doc" {
        from.to_string()
    } else {
        format!("(SELECT {document_column} AS doc FROM {from}) AS upstream_src")
    }
}

/// Flush the accumulated `pending` fragment into a new named CTE unless it
/// has nothing to contribute. `force` flushes even a trivial pending
/// fragment (used at pipeline end and before a `$facet` split) so the
/// caller always has a usable source name to continue from.
///
/// `pending`'s own SQL is internally numbered from 1 (each fragment folded
/// into it via [`Pending::merge_fragment`] already renumbered relative to
/// `pending`); before it becomes a CTE body it must be shifted past every
/// param already bound by CTEs emitted so far, since all of them share one
/// final parameter list in emission order.
fn flush(
    dialect: &dyn Dialect,
    ctes: &mut Vec<(String, String, Vec<Param>)>,
    pending: &mut Pending,
    current_from: &str,
    current_document_column: &str,
    cte_counter: &mut usize,
    force: bool,
) -> Option<String> {
    if pending.is_trivial() && !force {
        return None;
    }
    if pending.is_trivial() && current_document_column == "doc" {
        // Nothing to add over an existing CTE; reuse it as-is.
        return Some(current_from.to_string());
    }
    let name = format!("stage_{cte_counter}");
    *cte_counter += 1;
    let from_clause = source_sql(current_from, current_document_column);
    let offset: usize = ctes.iter().map(|(_, _, p)| p.len()).sum();
    let body = renumber_body(dialect, pending.render(&from_clause), offset);
    let params = std::mem::take(&mut pending.params);
    *pending = Pending::default();
    ctes.push((name.clone(), body, params));
    Some(name)
}

fn render_ctes(ctes: &[(String, String, Vec<Param>)]) -> String {
    ctes.iter()
        .map(|(name, body, _)| format!("{name} AS ({body})"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Flatten a compiled pipeline's bound parameters in SQL text order,
/// asserting the round-trip guarantee from spec §3 (Compiled Statement).
pub fn param_count_matches_placeholders(statement: &CompiledStatement) -> bool {
    let placeholder_count = (1..=statement.params.len())
        .filter(|n| statement.sql.contains(&format!("${n}")))
        .count();
    placeholder_count == statement.params.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::parse_pipeline;

    #[test]
    fn single_match_compiles_flat() {
        let stages = parse_pipeline(&[bson::doc! { "$match": { "age": { "$gte": 18 } } }]).unwrap();
        let compiled = compile("documents", "data", stages).unwrap();
        match compiled {
            CompiledPipeline::Statement(statement) => {
                assert!(statement.sql.starts_with("SELECT"));
                assert!(!statement.sql.contains("WITH"));
            }
            _ => panic!("expected a flat statement"),
        }
    }

    #[test]
    fn project_then_match_chains_through_a_cte() {
        let stages = parse_pipeline(&[
            bson::doc! { "$project": { "name": 1, "age": 1 } },
            bson::doc! { "$group": { "_id": "$name" } },
            bson::doc! { "$sort": { "_id": 1 } },
        ])
        .unwrap();
        let compiled = compile("documents", "data", stages).unwrap();
        match compiled {
            CompiledPipeline::Statement(statement) => {
                assert!(statement.sql.contains("WITH"));
                assert!(statement.sql.contains("stage_"));
            }
            _ => panic!("expected a statement"),
        }
    }

    #[test]
    fn facet_returns_one_statement_per_branch() {
        let stages = parse_pipeline(&[bson::doc! {
            "$facet": {
                "byStatus": [ { "$group": { "_id": "$status" } } ],
                "total": [ { "$count": "n" } ]
            }
        }])
        .unwrap();
        let compiled = compile("documents", "data", stages).unwrap();
        match compiled {
            CompiledPipeline::Facets(branches) => {
                assert_eq!(branches.len(), 2);
                assert!(branches.contains_key("byStatus"));
                assert!(branches.contains_key("total"));
            }
            _ => panic!("expected facet branches"),
        }
    }

    #[test]
    fn lookup_always_produces_a_cte_even_alone() {
        let stages = parse_pipeline(&[bson::doc! {
            "$lookup": { "from": "orders", "localField": "id", "foreignField": "userId", "as": "orders" }
        }])
        .unwrap();
        let compiled = compile("documents", "data", stages).unwrap();
        match compiled {
            CompiledPipeline::Statement(statement) => assert!(statement.sql.contains("WITH")),
            _ => panic!("expected a statement"),
        }
    }

    #[test]
    fn two_parameterized_fragments_do_not_collide_on_the_same_placeholder() {
        // The optimizer fuses adjacent `$match`es into one filter, so a
        // `$limit` in between keeps these as two independently-translated
        // fragments merged via `Pending::merge_fragment` — the exact path
        // that dropped renumbering before.
        let stages = parse_pipeline(&[
            bson::doc! { "$match": { "name": "Alice" } },
            bson::doc! { "$limit": 10i64 },
            bson::doc! { "$match": { "age": { "$gte": 21i32 } } },
        ])
        .unwrap();
        let compiled = compile("documents", "data", stages).unwrap();
        match compiled {
            CompiledPipeline::Statement(statement) => {
                assert_eq!(statement.params, vec![Param::String("Alice".to_string()), Param::Int(21)]);
                assert!(param_count_matches_placeholders(&statement), "sql: {}", statement.sql);
            }
            _ => panic!("expected a flat statement"),
        }
    }

    #[test]
    fn facet_branch_after_a_parameterized_stage_keeps_preamble_and_branch_params_aligned() {
        let stages = parse_pipeline(&[
            bson::doc! { "$match": { "region": "eu" } },
            bson::doc! { "$sort": { "id": 1i32 } },
            bson::doc! { "$facet": { "total": [ { "$count": "n" } ] } },
        ])
        .unwrap();
        let compiled = compile("documents", "data", stages).unwrap();
        match compiled {
            CompiledPipeline::Facets(branches) => {
                let statement = branches.get("total").unwrap();
                assert_eq!(statement.params, vec![Param::String("eu".to_string())]);
                assert!(param_count_matches_placeholders(statement), "sql: {}", statement.sql);
            }
            _ => panic!("expected facet branches"),
        }
    }
}
