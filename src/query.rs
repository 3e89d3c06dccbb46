/*!
 * @file query.rs
 * @brief Query Translator (C1): filter document -> (where_sql, params[])
 *
 * Source (the base server's `aggregation_pipeline.rs::filter_to_sql`) built
 * WHERE clauses by matching directly on the incoming `bson::Document` and
 * mutating a SQL string in place. Per spec §9 REDESIGN FLAGS ("recursive
 * structural walks" / "dynamic operator registries"), this parses the
 * filter into a typed `FilterNode` tree first and translates the tree,
 * with one closed match per operator family instead of a string-keyed map.
 */

use bson::{Bson, Document};

use crate::dialect::{Dialect, Param};
use crate::document::field_to_json_path;
use crate::error::{RelayError, Result};

/// Parsed filter expression tree (spec §3 Filter Document).
#[derive(Debug, Clone)]
pub enum FilterNode {
    And(Vec<FilterNode>),
    Or(Vec<FilterNode>),
    Nor(Vec<FilterNode>),
    Field(String, FieldCondition),
    Text(TextQuery),
    /// An always-true/always-false constant, produced by boundary cases
    /// like `$and: []` or `$in: []` (spec §8).
    Const(bool),
}

#[derive(Debug, Clone)]
pub enum FieldCondition {
    Eq(Bson),
    Ne(Bson),
    Gt(Bson),
    Gte(Bson),
    Lt(Bson),
    Lte(Bson),
    In(Vec<Bson>),
    Nin(Vec<Bson>),
    Exists(bool),
    Type(String),
    Size(i64),
    All(Vec<Bson>),
    ElemMatch(Box<FilterNode>),
    Not(Box<FieldCondition>),
    /// Multiple operators against the same field combine conjunctively
    /// (e.g. `{age: {$gte: 18, $lt: 65}}`).
    And(Vec<FieldCondition>),
}

#[derive(Debug, Clone, Default)]
pub struct TextQuery {
    pub terms: Vec<String>,
    pub phrases: Vec<String>,
    pub negated: Vec<String>,
}

/// Parse a MongoDB filter document into a [`FilterNode`] tree (spec §4.1).
pub fn parse_filter(filter: &Document) -> Result<FilterNode> {
    if filter.is_empty() {
        return Ok(FilterNode::Const(true));
    }

    let mut children = Vec::with_capacity(filter.len());
    for (key, value) in filter {
        children.push(parse_top_level_entry(key, value)?);
    }

    if children.len() == 1 {
        Ok(children.into_iter().next().unwrap())
    } else {
        Ok(FilterNode::And(flatten_and(children)))
    }
}

fn parse_top_level_entry(key: &str, value: &Bson) -> Result<FilterNode> {
    match key {
        "$and" => Ok(FilterNode::And(flatten_and(parse_node_array(value)?))),
        "$or" => Ok(FilterNode::Or(flatten_kind(parse_node_array(value)?, |n| {
            matches!(n, FilterNode::Or(_))
        }))),
        "$nor" => Ok(FilterNode::Nor(parse_node_array(value)?)),
        "$text" => Ok(FilterNode::Text(parse_text_query(value)?)),
        _ if key.starts_with('$') => Err(RelayError::bad_value(format!(
            "unknown top-level logical operator: {key}"
        ))),
        _ => {
            let condition = parse_field_value(value)?;
            Ok(FilterNode::Field(key.to_string(), condition))
        }
    }
}

fn parse_node_array(value: &Bson) -> Result<Vec<FilterNode>> {
    let arr = value
        .as_array()
        .ok_or_else(|| RelayError::bad_value("expected an array of filter documents"))?;
    if arr.is_empty() {
        return Ok(Vec::new());
    }
    arr.iter()
        .map(|v| {
            let doc = v
                .as_document()
                .ok_or_else(|| RelayError::bad_value("expected a filter document"))?;
            parse_filter(doc)
        })
        .collect()
}

/// `$and: []` matches everything; `$or: []`/`$nor: []` have no branches to
/// satisfy, so they degrade to their identity constants (spec §8).
fn flatten_and(nodes: Vec<FilterNode>) -> Vec<FilterNode> {
    if nodes.is_empty() {
        return vec![FilterNode::Const(true)];
    }
    flatten_kind(nodes, |n| matches!(n, FilterNode::And(_)))
}

fn flatten_kind(nodes: Vec<FilterNode>, is_same_kind: impl Fn(&FilterNode) -> bool) -> Vec<FilterNode> {
    let mut out = Vec::with_capacity(nodes.len());
    for node in nodes {
        if is_same_kind(&node) {
            match node {
                FilterNode::And(inner) | FilterNode::Or(inner) => out.extend(inner),
                other => out.push(other),
            }
        } else {
            out.push(node);
        }
    }
    out
}

/// A field's value is a literal (equality) or a sub-document of `$op ->
/// value` pairs, unless it's a document all of whose keys happen not to
/// start with `$`, in which case it's an equality literal against that
/// whole sub-document (spec §4.1 tie-break).
fn parse_field_value(value: &Bson) -> Result<FieldCondition> {
    match value.as_document() {
        Some(doc) if !doc.is_empty() && doc.keys().all(|k| k.starts_with('$')) => {
            let mut conditions = Vec::with_capacity(doc.len());
            for (op, operand) in doc {
                conditions.push(parse_operator(op, operand)?);
            }
            if conditions.len() == 1 {
                Ok(conditions.into_iter().next().unwrap())
            } else {
                Ok(FieldCondition::And(conditions))
            }
        }
        _ => Ok(FieldCondition::Eq(value.clone())),
    }
}

fn parse_operator(op: &str, operand: &Bson) -> Result<FieldCondition> {
    match op {
        "$eq" => Ok(FieldCondition::Eq(operand.clone())),
        "$ne" => Ok(FieldCondition::Ne(operand.clone())),
        "$gt" => Ok(FieldCondition::Gt(operand.clone())),
        "$gte" => Ok(FieldCondition::Gte(operand.clone())),
        "$lt" => Ok(FieldCondition::Lt(operand.clone())),
        "$lte" => Ok(FieldCondition::Lte(operand.clone())),
        "$in" => Ok(FieldCondition::In(bson_array(operand)?)),
        "$nin" => Ok(FieldCondition::Nin(bson_array(operand)?)),
        "$exists" => Ok(FieldCondition::Exists(
            operand
                .as_bool()
                .ok_or_else(|| RelayError::bad_value("$exists requires a boolean"))?,
        )),
        "$type" => Ok(FieldCondition::Type(type_alias(operand)?)),
        "$size" => Ok(FieldCondition::Size(
            operand
                .as_i64()
                .or_else(|| operand.as_i32().map(i64::from))
                .ok_or_else(|| RelayError::bad_value("$size requires an integer"))?,
        )),
        "$all" => Ok(FieldCondition::All(bson_array(operand)?)),
        "$elemMatch" => {
            let doc = operand
                .as_document()
                .ok_or_else(|| RelayError::bad_value("$elemMatch requires a document"))?;
            Ok(FieldCondition::ElemMatch(Box::new(parse_elem_match(doc)?)))
        }
        "$not" => {
            let inner = operand
                .as_document()
                .ok_or_else(|| RelayError::bad_value("$not requires an operator document"))?;
            if inner.len() != 1 {
                return Err(RelayError::bad_value("$not requires exactly one operator"));
            }
            let (inner_op, inner_value) = inner.iter().next().unwrap();
            Ok(FieldCondition::Not(Box::new(parse_operator(
                inner_op,
                inner_value,
            )?)))
        }
        other => Err(RelayError::bad_value(format!("unknown operator: {other}"))),
    }
}

/// `$elemMatch`'s sub-document may itself be either a nested filter (field
/// paths relative to the array element) or a bare operator document applied
/// to scalar elements (e.g. `{$elemMatch: {$gt: 5}}`). Both parse through
/// the normal filter grammar, scoped to the element.
fn parse_elem_match(doc: &Document) -> Result<FilterNode> {
    if doc.keys().all(|k| k.starts_with('$')) && !doc.is_empty() {
        // scalar-element form: wrap as a condition on the synthetic "this"
        // element path, which the SQL emitter treats specially.
        let condition = parse_field_value(&Bson::Document(doc.clone()))?;
        Ok(FilterNode::Field(String::new(), condition))
    } else {
        parse_filter(doc)
    }
}

fn bson_array(value: &Bson) -> Result<Vec<Bson>> {
    value
        .as_array()
        .map(|a| a.to_vec())
        .ok_or_else(|| RelayError::bad_value("expected an array"))
}

/// Maps a BSON `$type` alias (string or numeric, spec §4.1) to the value
/// `jsonb_typeof()` actually returns, which only ever produces
/// `object|array|string|number|boolean|null` — none of BSON's finer-grained
/// numeric/binary/date aliases. Every alias that jsonb collapses into
/// "number" or "boolean" is normalized here so the emitted comparison can
/// match real rows instead of a `jsonb_typeof()` value that never occurs.
fn type_alias(value: &Bson) -> Result<String> {
    let alias = if let Some(s) = value.as_str() {
        s.to_string()
    } else if let Some(n) = value.as_i64().or_else(|| value.as_i32().map(i64::from)) {
        match n {
            1 => "double".to_string(),
            2 => "string".to_string(),
            3 => "object".to_string(),
            4 => "array".to_string(),
            5 => "binData".to_string(),
            7 => "objectId".to_string(),
            8 => "bool".to_string(),
            9 => "date".to_string(),
            10 => "null".to_string(),
            16 => "int".to_string(),
            18 => "long".to_string(),
            19 => "decimal".to_string(),
            _ => return Err(RelayError::bad_value(format!("unknown $type alias: {n}"))),
        }
    } else {
        return Err(RelayError::bad_value("$type requires a string or numeric alias"));
    };
    Ok(jsonb_typeof_name(&alias).to_string())
}

/// `jsonb_typeof()`'s vocabulary: every numeric alias collapses to
/// "number", `bool` to "boolean", and `binData`/`objectId`/`date` — stored
/// as JSON strings by the document backend's encoding — collapse to
/// "string". `object`/`array`/`string`/`null` already match verbatim.
fn jsonb_typeof_name(alias: &str) -> &'static str {
    match alias {
        "double" | "int" | "long" | "decimal" => "number",
        "bool" => "boolean",
        "binData" | "objectId" | "date" => "string",
        "object" => "object",
        "array" => "array",
        "string" => "string",
        "null" => "null",
        _ => "object",
    }
}

fn parse_text_query(value: &Bson) -> Result<TextQuery> {
    let doc = value
        .as_document()
        .ok_or_else(|| RelayError::bad_value("$text requires a document"))?;
    let search = doc
        .get_str("$search")
        .map_err(|_| RelayError::bad_value("$text requires $search"))?;

    let mut query = TextQuery::default();
    let mut chars = search.chars().peekable();
    let mut current = String::new();
    let mut in_phrase = false;

    let flush = |current: &mut String, in_phrase: bool, query: &mut TextQuery| {
        if current.is_empty() {
            return;
        }
        if in_phrase {
            query.phrases.push(std::mem::take(current));
        } else if let Some(term) = current.strip_prefix('-') {
            if !term.is_empty() {
                query.negated.push(term.to_string());
            }
            current.clear();
        } else {
            query.terms.push(std::mem::take(current));
        }
    };

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                if in_phrase {
                    flush(&mut current, true, &mut query);
                    in_phrase = false;
                } else {
                    flush(&mut current, false, &mut query);
                    in_phrase = true;
                }
            }
            ' ' if !in_phrase => flush(&mut current, false, &mut query),
            other => current.push(other),
        }
    }
    flush(&mut current, in_phrase, &mut query);

    Ok(query)
}

/// Compile a filter document to `(where_sql, params[])` (spec §4.1 contract).
/// Empty filter yields `"TRUE"` and no params.
pub fn translate(dialect: &dyn Dialect, filter: &Document) -> Result<(String, Vec<Param>)> {
    let node = parse_filter(filter)?;
    let mut params = Vec::new();
    let sql = emit(dialect, &node, &mut params)?;
    Ok((sql, params))
}

fn emit(dialect: &dyn Dialect, node: &FilterNode, params: &mut Vec<Param>) -> Result<String> {
    match node {
        FilterNode::Const(b) => Ok(dialect.bool_literal(*b)),
        FilterNode::And(nodes) => emit_conjunction(dialect, nodes, "AND", params),
        FilterNode::Or(nodes) => {
            if nodes.is_empty() {
                return Ok(dialect.bool_literal(false));
            }
            emit_conjunction(dialect, nodes, "OR", params)
        }
        FilterNode::Nor(nodes) => {
            if nodes.is_empty() {
                return Ok(dialect.bool_literal(true));
            }
            let inner = emit_conjunction(dialect, nodes, "OR", params)?;
            Ok(format!("NOT ({inner})"))
        }
        FilterNode::Field(path, condition) => emit_field(dialect, path, condition, params),
        FilterNode::Text(query) => Ok(emit_text(dialect, query)),
    }
}

fn emit_conjunction(
    dialect: &dyn Dialect,
    nodes: &[FilterNode],
    joiner: &str,
    params: &mut Vec<Param>,
) -> Result<String> {
    if nodes.is_empty() {
        return Ok(dialect.bool_literal(true));
    }
    let parts: Result<Vec<String>> = nodes.iter().map(|n| emit(dialect, n, params)).collect();
    Ok(format!(
        "({})",
        parts?.join(&format!(" {joiner} "))
    ))
}

fn emit_field(
    dialect: &dyn Dialect,
    path: &str,
    condition: &FieldCondition,
    params: &mut Vec<Param>,
) -> Result<String> {
    let json_path = field_to_json_path(path);
    emit_condition(dialect, &json_path, condition, params)
}

fn emit_condition(
    dialect: &dyn Dialect,
    json_path: &str,
    condition: &FieldCondition,
    params: &mut Vec<Param>,
) -> Result<String> {
    let typed = dialect.json_extract(json_path);
    let text = dialect.json_extract_text(json_path);

    match condition {
        FieldCondition::Eq(Bson::Null) => Ok(format!("{typed} IS NULL")),
        FieldCondition::Ne(Bson::Null) => Ok(format!("{typed} IS NOT NULL")),
        FieldCondition::Eq(v) => emit_scalar_cmp(dialect, &typed, "=", v, params),
        FieldCondition::Ne(v) => emit_scalar_cmp(dialect, &typed, "!=", v, params),
        FieldCondition::Gt(v) => emit_scalar_cmp(dialect, &typed, ">", v, params),
        FieldCondition::Gte(v) => emit_scalar_cmp(dialect, &typed, ">=", v, params),
        FieldCondition::Lt(v) => emit_scalar_cmp(dialect, &typed, "<", v, params),
        FieldCondition::Lte(v) => emit_scalar_cmp(dialect, &typed, "<=", v, params),
        FieldCondition::In(values) => {
            if values.is_empty() {
                return Ok(dialect.bool_literal(false));
            }
            let placeholders: Vec<String> = values
                .iter()
                .map(|v| dialect.push_param(params, Param::from(v)))
                .collect();
            Ok(format!("{typed} IN ({})", placeholders.join(", ")))
        }
        FieldCondition::Nin(values) => {
            if values.is_empty() {
                return Ok(dialect.bool_literal(true));
            }
            let placeholders: Vec<String> = values
                .iter()
                .map(|v| dialect.push_param(params, Param::from(v)))
                .collect();
            Ok(format!(
                "({typed} IS NULL OR {typed} NOT IN ({}))",
                placeholders.join(", ")
            ))
        }
        FieldCondition::Exists(true) => Ok(format!("{typed} IS NOT NULL")),
        FieldCondition::Exists(false) => Ok(format!("{typed} IS NULL")),
        FieldCondition::Type(name) => {
            let placeholder = dialect.push_param(params, Param::String(name.clone()));
            Ok(format!("jsonb_typeof({typed}) = {placeholder}"))
        }
        FieldCondition::Size(n) => {
            let placeholder = dialect.push_param(params, Param::Int(*n));
            Ok(format!("jsonb_array_length({typed}) = {placeholder}"))
        }
        FieldCondition::All(values) => {
            if values.is_empty() {
                return Ok(dialect.bool_literal(true));
            }
            let clauses: Result<Vec<String>> = values
                .iter()
                .map(|v| {
                    let placeholder = dialect.push_param(params, Param::from(v));
                    Ok(format!(
                        "EXISTS (SELECT 1 FROM jsonb_array_elements({typed}) elem WHERE elem::text = {placeholder}::text)"
                    ))
                })
                .collect();
            Ok(format!("({})", clauses?.join(" AND ")))
        }
        FieldCondition::ElemMatch(inner) => {
            let mut inner_params = Vec::new();
            let inner_sql = emit_elem_match(dialect, inner, &mut inner_params)?;
            for p in inner_params {
                dialect.push_param(params, p);
            }
            Ok(format!(
                "EXISTS (SELECT 1 FROM jsonb_array_elements({typed}) elem WHERE {inner_sql})"
            ))
        }
        FieldCondition::Not(inner) => {
            let inner_sql = emit_condition_for_not(dialect, json_path, inner, params)?;
            Ok(format!("NOT ({inner_sql})"))
        }
        FieldCondition::And(conditions) => {
            let parts: Result<Vec<String>> = conditions
                .iter()
                .map(|c| emit_condition(dialect, json_path, c, params))
                .collect();
            Ok(format!("({})", parts?.join(" AND ")))
        }
    }
}

fn emit_condition_for_not(
    dialect: &dyn Dialect,
    json_path: &str,
    condition: &FieldCondition,
    params: &mut Vec<Param>,
) -> Result<String> {
    emit_condition(dialect, json_path, condition, params)
}

/// Within `$elemMatch`, the subject is `elem` (the unnested array element),
/// not the original document column (spec §4.1: "opens a nested scope").
fn emit_elem_match(dialect: &dyn Dialect, node: &FilterNode, params: &mut Vec<Param>) -> Result<String> {
    match node {
        FilterNode::Field(path, condition) if path.is_empty() => {
            emit_elem_condition(dialect, "elem", condition, params)
        }
        FilterNode::Field(path, condition) => {
            let expr = format!("elem #> '{{{}}}'", path.replace('.', ","));
            let expr_text = format!("elem #>> '{{{}}}'", path.replace('.', ","));
            emit_elem_condition_expr(dialect, &expr, &expr_text, condition, params)
        }
        FilterNode::And(nodes) => {
            let parts: Result<Vec<String>> = nodes
                .iter()
                .map(|n| emit_elem_match(dialect, n, params))
                .collect();
            Ok(format!("({})", parts?.join(" AND ")))
        }
        FilterNode::Or(nodes) => {
            let parts: Result<Vec<String>> = nodes
                .iter()
                .map(|n| emit_elem_match(dialect, n, params))
                .collect();
            Ok(format!("({})", parts?.join(" OR ")))
        }
        FilterNode::Nor(nodes) => {
            let parts: Result<Vec<String>> = nodes
                .iter()
                .map(|n| emit_elem_match(dialect, n, params))
                .collect();
            Ok(format!("NOT ({})", parts?.join(" OR ")))
        }
        FilterNode::Const(b) => Ok(dialect.bool_literal(*b)),
        FilterNode::Text(_) => Err(RelayError::bad_value("$text is not valid inside $elemMatch")),
    }
}

fn emit_elem_condition(
    dialect: &dyn Dialect,
    elem_expr: &str,
    condition: &FieldCondition,
    params: &mut Vec<Param>,
) -> Result<String> {
    emit_elem_condition_expr(dialect, elem_expr, elem_expr, condition, params)
}

fn emit_elem_condition_expr(
    dialect: &dyn Dialect,
    typed: &str,
    _text: &str,
    condition: &FieldCondition,
    params: &mut Vec<Param>,
) -> Result<String> {
    match condition {
        FieldCondition::Eq(Bson::Null) => Ok(format!("{typed} IS NULL")),
        FieldCondition::Ne(Bson::Null) => Ok(format!("{typed} IS NOT NULL")),
        FieldCondition::Eq(v) => emit_scalar_cmp(dialect, typed, "=", v, params),
        FieldCondition::Ne(v) => emit_scalar_cmp(dialect, typed, "!=", v, params),
        FieldCondition::Gt(v) => emit_scalar_cmp(dialect, typed, ">", v, params),
        FieldCondition::Gte(v) => emit_scalar_cmp(dialect, typed, ">=", v, params),
        FieldCondition::Lt(v) => emit_scalar_cmp(dialect, typed, "<", v, params),
        FieldCondition::Lte(v) => emit_scalar_cmp(dialect, typed, "<=", v, params),
        FieldCondition::And(conditions) => {
            let parts: Result<Vec<String>> = conditions
                .iter()
                .map(|c| emit_elem_condition_expr(dialect, typed, _text, c, params))
                .collect();
            Ok(format!("({})", parts?.join(" AND ")))
        }
        FieldCondition::Not(inner) => {
            let inner_sql = emit_elem_condition_expr(dialect, typed, _text, inner, params)?;
            Ok(format!("NOT ({inner_sql})"))
        }
        other => Err(RelayError::bad_value(format!(
            "{other:?} is not supported inside $elemMatch"
        ))),
    }
}

fn emit_scalar_cmp(
    dialect: &dyn Dialect,
    typed_expr: &str,
    op: &str,
    value: &Bson,
    params: &mut Vec<Param>,
) -> Result<String> {
    let placeholder = dialect.push_param(params, Param::from(value));
    let cast = match value {
        Bson::Boolean(_) => "::boolean",
        Bson::Int32(_) | Bson::Int64(_) => "::numeric",
        Bson::Double(_) => "::numeric",
        _ => "",
    };
    Ok(format!("({typed_expr}){cast} {op} {placeholder}{cast}"))
}

fn emit_text(dialect: &dyn Dialect, query: &TextQuery) -> String {
    // Translated to a MATCH predicate against a full-text index table
    // (spec §4.1, §6). The concrete FTS table reference is supplied by the
    // aggregation translator's $search/$text stage handling; here we emit
    // the boolean query expression the backend's MATCH operator expects.
    let mut clauses = Vec::new();
    for phrase in &query.phrases {
        clauses.push(format!("\"{}\"", escape_quotes(phrase)));
    }
    if !query.terms.is_empty() {
        clauses.push(query.terms.join(" OR "));
    }
    let positive = if clauses.is_empty() {
        if query.negated.is_empty() {
            "*".to_string()
        } else {
            String::new()
        }
    } else {
        clauses.join(" OR ")
    };
    let mut expr = positive;
    for term in &query.negated {
        if expr.is_empty() {
            expr = format!("NOT {term}");
        } else {
            expr = format!("({expr}) AND NOT {term}");
        }
    }
    let _ = dialect; // the FTS table join is emitted by the caller (C3 $text/$search stage)
    expr
}

fn escape_quotes(s: &str) -> String {
    s.replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::PostgresJsonbDialect;

    fn dialect() -> PostgresJsonbDialect {
        PostgresJsonbDialect::new("data")
    }

    #[test]
    fn empty_filter_yields_true_and_no_params() {
        let (sql, params) = translate(&dialect(), &Document::new()).unwrap();
        assert_eq!(sql, "TRUE");
        assert!(params.is_empty());
    }

    #[test]
    fn param_count_matches_placeholder_count() {
        let filter = bson::doc! { "age": { "$gte": 18, "$lt": 65 }, "name": "Alice" };
        let (sql, params) = translate(&dialect(), &filter).unwrap();
        let placeholder_count = (1..=params.len())
            .filter(|n| sql.contains(&format!("${n}")))
            .count();
        assert_eq!(placeholder_count, params.len());
    }

    #[test]
    fn in_empty_is_false() {
        let filter = bson::doc! { "x": { "$in": [] } };
        let (sql, _params) = translate(&dialect(), &filter).unwrap();
        assert_eq!(sql, "FALSE");
    }

    #[test]
    fn nin_empty_is_true() {
        let filter = bson::doc! { "x": { "$nin": [] } };
        let (sql, _params) = translate(&dialect(), &filter).unwrap();
        assert_eq!(sql, "TRUE");
    }

    #[test]
    fn and_empty_matches_everything() {
        let filter = bson::doc! { "$and": [] };
        let (sql, _params) = translate(&dialect(), &filter).unwrap();
        assert_eq!(sql, "TRUE");
    }

    #[test]
    fn or_empty_matches_nothing() {
        let filter = bson::doc! { "$or": [] };
        let (sql, _params) = translate(&dialect(), &filter).unwrap();
        assert_eq!(sql, "FALSE");
    }

    #[test]
    fn unknown_operator_is_bad_value() {
        let filter = bson::doc! { "x": { "$bogus": 1 } };
        let err = translate(&dialect(), &filter).unwrap_err();
        assert_eq!(err.code(), crate::error::code::BAD_VALUE);
    }

    #[test]
    fn elem_match_opens_nested_scope() {
        let filter = bson::doc! { "tags": { "$elemMatch": { "k": "x", "n": { "$gt": 5 } } } };
        let (sql, _params) = translate(&dialect(), &filter).unwrap();
        assert!(sql.contains("jsonb_array_elements"));
        assert!(sql.contains("elem"));
    }

    #[test]
    fn eq_null_becomes_is_null() {
        let filter = bson::doc! { "deletedAt": Bson::Null };
        let (sql, params) = translate(&dialect(), &filter).unwrap();
        assert!(sql.contains("IS NULL"));
        assert!(params.is_empty());
    }

    #[test]
    fn type_numeric_aliases_normalize_to_jsonb_number() {
        let filter = bson::doc! { "age": { "$type": 16 } };
        let (sql, params) = translate(&dialect(), &filter).unwrap();
        assert!(sql.contains("jsonb_typeof"));
        assert_eq!(params, vec![Param::String("number".to_string())]);
    }

    #[test]
    fn type_string_alias_names_normalize_to_jsonb_vocabulary() {
        for (alias, expected) in [
            ("double", "number"),
            ("long", "number"),
            ("decimal", "number"),
            ("bool", "boolean"),
            ("objectId", "string"),
            ("date", "string"),
            ("object", "object"),
            ("array", "array"),
            ("string", "string"),
            ("null", "null"),
        ] {
            let filter = bson::doc! { "x": { "$type": alias } };
            let (_, params) = translate(&dialect(), &filter).unwrap();
            assert_eq!(params, vec![Param::String(expected.to_string())], "alias {alias}");
        }
    }

    #[test]
    fn type_rejects_unknown_numeric_alias() {
        let filter = bson::doc! { "x": { "$type": 999 } };
        let err = translate(&dialect(), &filter).unwrap_err();
        assert_eq!(err.code(), crate::error::code::BAD_VALUE);
    }
}
