/*!
 * @file stage.rs
 * @brief Stage Translators (C3): one per aggregation stage
 *
 * Each translator returns a [`StageFragment`]: a partial SQL record the
 * aggregation translator (C5) combines into a flat SELECT or chains into a
 * CTE. The stage set and translation rules are fixed by spec §4.3 — this is
 * intentionally a closed `match` over a closed `Stage` enum rather than the
 * base server's dynamic per-stage closure registry (spec §9 REDESIGN FLAGS).
 */

use bson::{Bson, Document};
use indexmap::IndexMap;

use crate::dialect::{Dialect, Param};
use crate::document::field_to_json_path;
use crate::error::{RelayError, Result};
use crate::expr;
use crate::query;

/// The recognized aggregation stage set (spec §3).
#[derive(Debug, Clone)]
pub enum Stage {
    Match(Document),
    Project(Document),
    Group(Document),
    Sort(Document),
    Limit(i64),
    Skip(i64),
    Count(String),
    Lookup(LookupOptions),
    Unwind(UnwindOptions),
    AddFields(Document),
    Bucket(BucketOptions),
    Facet(IndexMap<String, Vec<Stage>>),
    Search(Document),
}

#[derive(Debug, Clone)]
pub struct LookupOptions {
    pub from: String,
    pub local_field: String,
    pub foreign_field: String,
    pub as_field: String,
}

#[derive(Debug, Clone)]
pub struct UnwindOptions {
    pub path: String,
    pub preserve_null_and_empty_arrays: bool,
    pub include_array_index: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BucketOptions {
    pub group_by: Bson,
    pub boundaries: Vec<Bson>,
    pub default: Option<Bson>,
    pub output: Document,
}

/// Result of translating one stage: fields the aggregation translator
/// splices into either the pending fragment (shape-preserving) or a new CTE
/// (shape-transforming), per spec §4.3/§4.5.
#[derive(Debug, Clone, Default)]
pub struct StageFragment {
    pub select_clause: Option<String>,
    pub where_clause: Option<String>,
    pub group_by_clause: Option<String>,
    pub order_by_clause: Option<String>,
    pub limit_clause: Option<i64>,
    pub offset_clause: Option<i64>,
    pub cte_expression: Option<String>,
    pub cte_name: Option<String>,
    pub facets: Option<IndexMap<String, Vec<Stage>>>,
    pub transforms_shape: bool,
    pub params: Vec<Param>,
}

/// Parse one `{ $stageName: stageBody }` document into a [`Stage`].
pub fn parse_stage(doc: &Document) -> Result<Stage> {
    if doc.len() != 1 {
        return Err(RelayError::bad_value(
            "a pipeline stage document must have exactly one field",
        ));
    }
    let (name, body) = doc.iter().next().unwrap();
    match name.as_str() {
        "$match" => Ok(Stage::Match(expect_doc(body, "$match")?)),
        "$project" => Ok(Stage::Project(expect_doc(body, "$project")?)),
        "$group" => Ok(Stage::Group(expect_doc(body, "$group")?)),
        "$sort" => Ok(Stage::Sort(expect_doc(body, "$sort")?)),
        "$limit" => Ok(Stage::Limit(expect_int(body, "$limit")?)),
        "$skip" => Ok(Stage::Skip(expect_int(body, "$skip")?)),
        "$count" => Ok(Stage::Count(
            body.as_str()
                .ok_or_else(|| RelayError::bad_value("$count requires a string field name"))?
                .to_string(),
        )),
        "$addFields" | "$set" => Ok(Stage::AddFields(expect_doc(body, name)?)),
        "$lookup" => parse_lookup(expect_doc(body, "$lookup")?),
        "$unwind" => parse_unwind(body),
        "$bucket" => parse_bucket(expect_doc(body, "$bucket")?),
        "$facet" => parse_facet(expect_doc(body, "$facet")?),
        "$search" => Ok(Stage::Search(expect_doc(body, "$search")?)),
        other => Err(RelayError::bad_value(format!("unknown pipeline stage: {other}"))),
    }
}

pub fn parse_pipeline(stages: &[Document]) -> Result<Vec<Stage>> {
    stages.iter().map(parse_stage).collect()
}

fn expect_doc(value: &Bson, stage: &str) -> Result<Document> {
    value
        .as_document()
        .cloned()
        .ok_or_else(|| RelayError::bad_value(format!("{stage} requires a document")))
}

fn expect_int(value: &Bson, stage: &str) -> Result<i64> {
    value
        .as_i64()
        .or_else(|| value.as_i32().map(i64::from))
        .ok_or_else(|| RelayError::bad_value(format!("{stage} requires an integer")))
}

fn parse_lookup(doc: Document) -> Result<Stage> {
    Ok(Stage::Lookup(LookupOptions {
        from: doc
            .get_str("from")
            .map_err(|_| RelayError::bad_value("$lookup requires `from`"))?
            .to_string(),
        local_field: doc
            .get_str("localField")
            .map_err(|_| RelayError::bad_value("$lookup requires `localField`"))?
            .to_string(),
        foreign_field: doc
            .get_str("foreignField")
            .map_err(|_| RelayError::bad_value("$lookup requires `foreignField`"))?
            .to_string(),
        as_field: doc
            .get_str("as")
            .map_err(|_| RelayError::bad_value("$lookup requires `as`"))?
            .to_string(),
    }))
}

fn parse_unwind(body: &Bson) -> Result<Stage> {
    match body {
        Bson::String(path) => Ok(Stage::Unwind(UnwindOptions {
            path: path.trim_start_matches('$').to_string(),
            preserve_null_and_empty_arrays: false,
            include_array_index: None,
        })),
        Bson::Document(doc) => {
            let path = doc
                .get_str("path")
                .map_err(|_| RelayError::bad_value("$unwind requires `path`"))?
                .trim_start_matches('$')
                .to_string();
            let preserve = doc
                .get_bool("preserveNullAndEmptyArrays")
                .unwrap_or(false);
            let include_index = doc
                .get_str("includeArrayIndex")
                .ok()
                .map(|s| s.to_string());
            Ok(Stage::Unwind(UnwindOptions {
                path,
                preserve_null_and_empty_arrays: preserve,
                include_array_index: include_index,
            }))
        }
        _ => Err(RelayError::bad_value("$unwind requires a string or document")),
    }
}

fn parse_bucket(doc: Document) -> Result<Stage> {
    let group_by = doc
        .get("groupBy")
        .ok_or_else(|| RelayError::bad_value("$bucket requires `groupBy`"))?
        .clone();
    let boundaries = doc
        .get_array("boundaries")
        .map_err(|_| RelayError::bad_value("$bucket requires `boundaries`"))?
        .clone();
    let default = doc.get("default").cloned();
    let output = doc
        .get_document("output")
        .cloned()
        .unwrap_or_default();
    Ok(Stage::Bucket(BucketOptions {
        group_by,
        boundaries,
        default,
        output,
    }))
}

fn parse_facet(doc: Document) -> Result<Stage> {
    let mut branches = IndexMap::new();
    for (name, value) in doc {
        let arr = value
            .as_array()
            .ok_or_else(|| RelayError::bad_value("$facet branch must be a pipeline array"))?;
        let docs: Result<Vec<Document>> = arr
            .iter()
            .map(|v| {
                v.as_document()
                    .cloned()
                    .ok_or_else(|| RelayError::bad_value("$facet branch stage must be a document"))
            })
            .collect();
        branches.insert(name, parse_pipeline(&docs?)?);
    }
    Ok(Stage::Facet(branches))
}

/// Whether a stage preserves the input shape (spec §3). Shape-preserving
/// stages mutate the pending SELECT in place; everything else flushes a CTE.
pub fn is_shape_preserving(stage: &Stage) -> bool {
    matches!(stage, Stage::Match(_) | Stage::Sort(_) | Stage::Limit(_) | Stage::Skip(_))
}

/// Whether a stage always flushes regardless of shape (spec §4.5:
/// `$lookup`/`$unwind`/`$search` always emit their own CTE).
pub fn always_flushes(stage: &Stage) -> bool {
    matches!(stage, Stage::Lookup(_) | Stage::Unwind(_) | Stage::Search(_))
}

/// Field paths a stage reads, if staticly determinable — used by the
/// optimizer's predicate-pushdown pass (C4) to decide whether a `$match`
/// can cross this stage. `None` means "opaque": don't push past it.
pub fn referenced_output_fields(stage: &Stage) -> Option<Vec<String>> {
    match stage {
        Stage::Project(doc) | Stage::AddFields(doc) => Some(doc.keys().cloned().collect()),
        Stage::Unwind(opts) => Some(vec![opts.path.clone()]),
        Stage::Lookup(opts) => Some(vec![opts.as_field.clone()]),
        Stage::Group(_) | Stage::Bucket(_) | Stage::Facet(_) => None,
        _ => Some(Vec::new()),
    }
}

/// Translate one stage into a [`StageFragment`]. `source` is the SQL
/// `FROM`-clause expression for the stage's upstream rows (a table name or
/// a prior CTE name); `source_document_expr` is the SQL expression that
/// yields the document JSON value from that source (the dialect's document
/// column for the base table, or `doc` for a CTE that projects a `doc` column).
pub fn translate_stage(
    dialect: &dyn Dialect,
    stage: &Stage,
    cte_counter: &mut usize,
) -> Result<StageFragment> {
    match stage {
        Stage::Match(filter) => {
            let mut params = Vec::new();
            let (where_sql, where_params) = query::translate(dialect, filter)?;
            params.extend(where_params);
            Ok(StageFragment {
                where_clause: Some(where_sql),
                params,
                transforms_shape: false,
                ..Default::default()
            })
        }
        Stage::Sort(spec) => {
            let mut parts = Vec::with_capacity(spec.len());
            for (field, direction) in spec {
                let dir = direction
                    .as_i64()
                    .or_else(|| direction.as_i32().map(i64::from))
                    .ok_or_else(|| RelayError::bad_value("$sort direction must be 1 or -1"))?;
                let order = if dir >= 0 { "ASC" } else { "DESC" };
                let extract = dialect.json_extract(&field_to_json_path(field));
                parts.push(format!("{extract} {order}"));
            }
            Ok(StageFragment {
                order_by_clause: Some(parts.join(", ")),
                transforms_shape: false,
                ..Default::default()
            })
        }
        Stage::Limit(n) => Ok(StageFragment {
            limit_clause: Some(*n),
            transforms_shape: false,
            ..Default::default()
        }),
        Stage::Skip(n) => Ok(StageFragment {
            offset_clause: Some(*n),
            transforms_shape: false,
            ..Default::default()
        }),
        Stage::Count(field_name) => Ok(StageFragment {
            select_clause: Some(format!(
                "jsonb_build_object('{}', COUNT(*)) AS doc",
                field_name.replace('\'', "''")
            )),
            transforms_shape: true,
            ..Default::default()
        }),
        Stage::Project(spec) => translate_project(dialect, spec),
        Stage::AddFields(spec) => translate_add_fields(dialect, spec),
        Stage::Group(spec) => translate_group(dialect, spec),
        Stage::Bucket(opts) => translate_bucket(dialect, opts),
        Stage::Lookup(opts) => translate_lookup(dialect, opts, cte_counter),
        Stage::Unwind(opts) => translate_unwind(dialect, opts, cte_counter),
        Stage::Search(spec) => translate_search(dialect, spec, cte_counter),
        Stage::Facet(branches) => Ok(StageFragment {
            facets: Some(branches.clone()),
            transforms_shape: true,
            ..Default::default()
        }),
    }
}

/// `$project`: inclusion if any value is `1`/an expression, exclusion if
/// every value is `0` (with `_id` the allowed exception either way).
fn translate_project(dialect: &dyn Dialect, spec: &Document) -> Result<StageFragment> {
    let is_exclusion = spec
        .iter()
        .filter(|(k, _)| k.as_str() != "_id")
        .all(|(_, v)| matches!(v, Bson::Int32(0) | Bson::Int64(0) | Bson::Boolean(false)));

    let mut params = Vec::new();

    if is_exclusion {
        let mut pairs = Vec::new();
        for (field, _) in spec.iter().filter(|(k, _)| k.as_str() != "_id") {
            pairs.push(format!("'{}'", field.replace('\'', "''")));
        }
        let expr = if pairs.is_empty() {
            "doc".to_string()
        } else {
            format!("doc - {}", pairs.join(" - "))
        };
        return Ok(StageFragment {
            select_clause: Some(format!("({expr}) AS doc")),
            transforms_shape: true,
            params,
            ..Default::default()
        });
    }

    let mut pairs = Vec::new();
    for (field, value) in spec {
        let value_sql = match value {
            Bson::Int32(1) | Bson::Int64(1) | Bson::Boolean(true) => {
                dialect.json_extract(&field_to_json_path(field))
            }
            _ => expr::translate(dialect, value, &mut params)?,
        };
        pairs.push(format!("'{}'", field.replace('\'', "''")));
        pairs.push(value_sql);
    }
    Ok(StageFragment {
        select_clause: Some(format!("jsonb_build_object({}) AS doc", pairs.join(", "))),
        transforms_shape: true,
        params,
        ..Default::default()
    })
}

/// `$addFields`/`$set`: a sequence of `jsonb_set` calls layered over the
/// incoming document (spec §4.3).
fn translate_add_fields(dialect: &dyn Dialect, spec: &Document) -> Result<StageFragment> {
    let mut params = Vec::new();
    let mut expr = "doc".to_string();
    for (field, value) in spec {
        let value_sql = expr::translate(dialect, value, &mut params)?;
        let path_literal = format!(
            "{{{}}}",
            field
                .split('.')
                .collect::<Vec<_>>()
                .join(",")
        );
        expr = format!("jsonb_set({expr}, '{path_literal}', to_jsonb({value_sql}), true)");
    }
    Ok(StageFragment {
        select_clause: Some(format!("({expr}) AS doc")),
        transforms_shape: true,
        params,
        ..Default::default()
    })
}

/// `$group`: builds `jsonb_build_object('_id', …, field, accumulator(…))`
/// plus a `GROUP BY` over the `_id` expression (spec §4.3).
fn translate_group(dialect: &dyn Dialect, spec: &Document) -> Result<StageFragment> {
    let id_expr_raw = spec
        .get("_id")
        .ok_or_else(|| RelayError::bad_value("$group requires `_id`"))?;
    let mut params = Vec::new();
    let id_sql = expr::translate(dialect, id_expr_raw, &mut params)?;

    let mut pairs = vec!["'_id'".to_string(), id_sql.clone()];
    for (field, accumulator_doc) in spec.iter().filter(|(k, _)| k.as_str() != "_id") {
        let acc_doc = accumulator_doc
            .as_document()
            .ok_or_else(|| RelayError::bad_value(format!("$group field {field} requires an accumulator document")))?;
        if acc_doc.len() != 1 {
            return Err(RelayError::bad_value(format!(
                "$group field {field} requires exactly one accumulator"
            )));
        }
        let (acc_op, acc_arg) = acc_doc.iter().next().unwrap();
        let acc_sql = translate_accumulator(dialect, acc_op, acc_arg, &mut params)?;
        pairs.push(format!("'{}'", field.replace('\'', "''")));
        pairs.push(acc_sql);
    }

    Ok(StageFragment {
        select_clause: Some(format!("jsonb_build_object({}) AS doc", pairs.join(", "))),
        group_by_clause: Some(id_sql),
        transforms_shape: true,
        params,
        ..Default::default()
    })
}

fn translate_accumulator(
    dialect: &dyn Dialect,
    op: &str,
    arg: &Bson,
    params: &mut Vec<Param>,
) -> Result<String> {
    if op == "$count" {
        return Ok("COUNT(*)".to_string());
    }
    let arg_sql = expr::translate(dialect, arg, params)?;
    match op {
        "$sum" => Ok(format!("SUM(({arg_sql})::numeric)")),
        "$avg" => Ok(format!("AVG(({arg_sql})::numeric)")),
        "$min" => Ok(format!("MIN({arg_sql})")),
        "$max" => Ok(format!("MAX({arg_sql})")),
        "$first" => Ok(format!("(array_agg({arg_sql}))[1]")),
        "$last" => Ok(format!("(array_agg({arg_sql}))[array_length(array_agg({arg_sql}), 1)]")),
        "$push" => Ok(format!("jsonb_agg({arg_sql})")),
        "$addToSet" => Ok(format!("jsonb_agg(DISTINCT {arg_sql})")),
        other => Err(RelayError::bad_value(format!("unknown accumulator: {other}"))),
    }
}

/// `$bucket`: a `CASE` expression assigning each row to the boundary
/// interval it falls in, grouped by that bucket key (spec §4.3).
fn translate_bucket(dialect: &dyn Dialect, opts: &BucketOptions) -> Result<StageFragment> {
    let mut params = Vec::new();
    let group_sql = expr::translate(dialect, &opts.group_by, &mut params)?;

    let mut case_sql = String::from("CASE");
    for window in opts.boundaries.windows(2) {
        let lower = expr::translate(dialect, &window[0], &mut params)?;
        let upper = expr::translate(dialect, &window[1], &mut params)?;
        case_sql.push_str(&format!(
            " WHEN ({group_sql})::numeric >= ({lower})::numeric AND ({group_sql})::numeric < ({upper})::numeric THEN {lower}"
        ));
    }
    if let Some(default) = &opts.default {
        let default_sql = expr::translate(dialect, default, &mut params)?;
        case_sql.push_str(&format!(" ELSE {default_sql}"));
    } else {
        return Err(RelayError::bad_value("$bucket requires `default` for out-of-range values"));
    }
    case_sql.push_str(" END");

    let mut pairs = vec!["'_id'".to_string(), case_sql.clone()];
    for (field, accumulator_doc) in &opts.output {
        let acc_doc = accumulator_doc
            .as_document()
            .ok_or_else(|| RelayError::bad_value(format!("$bucket output {field} requires an accumulator")))?;
        let (acc_op, acc_arg) = acc_doc
            .iter()
            .next()
            .ok_or_else(|| RelayError::bad_value(format!("$bucket output {field} is empty")))?;
        let acc_sql = translate_accumulator(dialect, acc_op, acc_arg, &mut params)?;
        pairs.push(format!("'{}'", field.replace('\'', "''")));
        pairs.push(acc_sql);
    }
    if opts.output.is_empty() {
        pairs.push("'count'".to_string());
        pairs.push("COUNT(*)".to_string());
    }

    Ok(StageFragment {
        select_clause: Some(format!("jsonb_build_object({}) AS doc", pairs.join(", "))),
        group_by_clause: Some(case_sql),
        transforms_shape: true,
        params,
        ..Default::default()
    })
}

fn next_cte_name(counter: &mut usize) -> String {
    let name = format!("stage_{counter}");
    *counter += 1;
    name
}

/// `$lookup`: a CTE that LEFT JOINs the upstream rows against the foreign
/// collection's table, grouping matches into a JSON array via
/// `jsonb_agg` (spec §4.3). `from` names a collection; the document
/// backend resolves it to its physical table via the same collections
/// mapping the primary query used (left to the caller via `from` literal
/// quoting — C9 substitutes the resolved table name before execution).
fn translate_lookup(dialect: &dyn Dialect, opts: &LookupOptions, cte_counter: &mut usize) -> Result<StageFragment> {
    let cte_name = next_cte_name(cte_counter);
    let local_extract = dialect.json_extract_text(&field_to_json_path(&opts.local_field));
    let foreign_extract = dialect.json_extract_text(&field_to_json_path(&opts.foreign_field));
    let foreign_table = dialect.quote_ident(&opts.from);
    let foreign_doc_col = dialect.document_column();

    let cte_expr = format!(
        "SELECT src.doc || jsonb_build_object('{as_field}', COALESCE(matches.docs, '[]'::jsonb)) AS doc \
         FROM __upstream__ src \
         LEFT JOIN LATERAL ( \
           SELECT jsonb_agg({foreign_doc_col}) AS docs \
           FROM {foreign_table} f \
           WHERE {foreign_extract_of_f} = {local_extract} \
         ) matches ON true",
        as_field = opts.as_field.replace('\'', "''"),
        foreign_extract_of_f = foreign_extract,
    );

    Ok(StageFragment {
        cte_expression: Some(cte_expr),
        cte_name: Some(cte_name),
        transforms_shape: true,
        ..Default::default()
    })
}

/// `$unwind`: a CTE joining the source against a JSON-each expansion of the
/// target array. `preserveNullAndEmptyArrays` selects inner vs. left join;
/// `includeArrayIndex` writes the iteration index into the document.
fn translate_unwind(dialect: &dyn Dialect, opts: &UnwindOptions, cte_counter: &mut usize) -> Result<StageFragment> {
    let cte_name = next_cte_name(cte_counter);
    let array_extract = dialect.json_extract(&field_to_json_path(&opts.path));
    let join_kind = if opts.preserve_null_and_empty_arrays {
        "LEFT JOIN LATERAL"
    } else {
        "JOIN LATERAL"
    };

    let index_field = opts
        .include_array_index
        .as_ref()
        .map(|name| {
            format!(
                " || jsonb_build_object('{}', elem.idx - 1)",
                name.replace('\'', "''")
            )
        })
        .unwrap_or_default();

    let path_literal = format!("{{{}}}", opts.path.replace('.', ","));

    let cte_expr = format!(
        "SELECT jsonb_set(src.doc, '{path_literal}', elem.value){index_field} AS doc \
         FROM __upstream__ src \
         {join_kind} jsonb_array_elements({array_extract}) WITH ORDINALITY AS elem(value, idx) ON true"
    );

    Ok(StageFragment {
        cte_expression: Some(cte_expr),
        cte_name: Some(cte_name),
        transforms_shape: true,
        ..Default::default()
    })
}

/// `$search`/`$text`: a CTE joining against a full-text index table and a
/// `MATCH` predicate, expressed here as a Postgres `@@ plainto_tsquery`
/// predicate over a `search_index` table keyed by `document_id`.
fn translate_search(dialect: &dyn Dialect, spec: &Document, cte_counter: &mut usize) -> Result<StageFragment> {
    let cte_name = next_cte_name(cte_counter);
    let query_text = spec
        .get_document("text")
        .ok()
        .and_then(|d| d.get_str("query").ok())
        .or_else(|| spec.get_str("query").ok())
        .ok_or_else(|| RelayError::bad_value("$search requires a `query` string"))?;

    let mut params = Vec::new();
    let placeholder = dialect.push_param(&mut params, Param::String(query_text.to_string()));

    let cte_expr = format!(
        "SELECT src.doc AS doc \
         FROM __upstream__ src \
         JOIN search_index si ON si.document_id = (src.doc->>'_id') \
         WHERE si.tsv @@ plainto_tsquery({placeholder})"
    );

    Ok(StageFragment {
        cte_expression: Some(cte_expr),
        cte_name: Some(cte_name),
        transforms_shape: true,
        params,
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::PostgresJsonbDialect;

    fn dialect() -> PostgresJsonbDialect {
        PostgresJsonbDialect::new("data")
    }

    #[test]
    fn parse_match_stage() {
        let doc = bson::doc! { "$match": { "age": { "$gte": 18 } } };
        let stage = parse_stage(&doc).unwrap();
        assert!(matches!(stage, Stage::Match(_)));
        assert!(is_shape_preserving(&stage));
    }

    #[test]
    fn parse_unwind_string_shorthand() {
        let doc = bson::doc! { "$unwind": "$tags" };
        let stage = parse_stage(&doc).unwrap();
        match stage {
            Stage::Unwind(opts) => {
                assert_eq!(opts.path, "tags");
                assert!(!opts.preserve_null_and_empty_arrays);
            }
            _ => panic!("expected Unwind"),
        }
    }

    #[test]
    fn project_exclusion_uses_minus_operator() {
        let doc = bson::doc! { "$project": { "password": 0 } };
        let stage = parse_stage(&doc).unwrap();
        let mut counter = 0;
        let fragment = translate_stage(&dialect(), &stage, &mut counter).unwrap();
        assert!(fragment.select_clause.unwrap().contains(" - "));
    }

    #[test]
    fn group_builds_group_by_and_select() {
        let doc = bson::doc! { "$group": { "_id": "$status", "total": { "$sum": 1 } } };
        let stage = parse_stage(&doc).unwrap();
        let mut counter = 0;
        let fragment = translate_stage(&dialect(), &stage, &mut counter).unwrap();
        assert!(fragment.group_by_clause.is_some());
        assert!(fragment.select_clause.unwrap().contains("SUM"));
    }

    #[test]
    fn lookup_always_flushes_and_emits_cte() {
        let doc = bson::doc! { "$lookup": { "from": "orders", "localField": "id", "foreignField": "userId", "as": "orders" } };
        let stage = parse_stage(&doc).unwrap();
        assert!(always_flushes(&stage));
        let mut counter = 0;
        let fragment = translate_stage(&dialect(), &stage, &mut counter).unwrap();
        assert!(fragment.cte_expression.is_some());
        assert_eq!(fragment.cte_name.unwrap(), "stage_0");
    }

    #[test]
    fn facet_collects_branch_pipelines() {
        let doc = bson::doc! {
            "$facet": {
                "a": [ { "$match": { "x": 1 } } ],
                "b": [ { "$count": "n" } ]
            }
        };
        let stage = parse_stage(&doc).unwrap();
        match stage {
            Stage::Facet(branches) => assert_eq!(branches.len(), 2),
            _ => panic!("expected Facet"),
        }
    }
}
