/*!
 * @file expr.rs
 * @brief Expression Translator (C2): aggregation value expressions -> scalar SQL
 *
 * Inputs are the value-expression grammar used by `$project`/`$addFields`/
 * `$group` accumulator arguments/etc: field references (`"$path"`),
 * `$$varName` let-bindings (rejected here — out of scope per spec §4.2),
 * literals, and nested operator documents.
 */

use bson::{Bson, Document};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::dialect::{Dialect, Param};
use crate::document::field_to_json_path;
use crate::error::{RelayError, Result};

/// Sentinel prefix identifying a `$function` placeholder literal in a
/// translated row's text column, so the executor (C7) can find and resolve
/// it during result rehydration (spec §4.2, §4.6).
pub const FUNCTION_PLACEHOLDER_SENTINEL: &str = "\u{1}RELAYDB_FN\u{1}";

/// A self-describing `$function` call, serialized into the placeholder
/// literal the translator emits in place of SQL.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FunctionCall {
    pub body: String,
    /// Dot-path field references used as positional arguments, in order.
    pub field_args: Vec<String>,
    /// Positions (0-based) among the combined argument list that are
    /// literal values rather than field references, paired with their
    /// literal JSON value.
    pub literal_args: Vec<(usize, serde_json::Value)>,
    pub arg_count: usize,
}

impl FunctionCall {
    /// SHA-256 content hash of the function body, truncated to 16 hex
    /// chars, used by the function evaluator (C6) to batch identical
    /// function bodies across rows (spec §4.6).
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.body.as_bytes());
        let digest = hasher.finalize();
        digest[..8].iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// Compile a value expression to a scalar SQL expression, appending any
/// bound parameters to `params` (spec §4.2 contract).
pub fn translate(dialect: &dyn Dialect, expr: &Bson, params: &mut Vec<Param>) -> Result<String> {
    match expr {
        Bson::String(s) if s.starts_with("$$") => Err(RelayError::bad_value(format!(
            "let-binding variables are not supported: {s}"
        ))),
        Bson::String(s) if s.starts_with('$') => {
            let path = &s[1..];
            if path.is_empty() {
                return Err(RelayError::bad_value("empty field reference"));
            }
            Ok(dialect.json_extract(&field_to_json_path(path)))
        }
        Bson::Document(doc) => translate_operator_document(dialect, doc, params),
        Bson::Array(items) => {
            // A literal array expression: build a JSON array of the
            // translated scalar sub-expressions.
            let parts: Result<Vec<String>> = items
                .iter()
                .map(|item| translate(dialect, item, params))
                .collect();
            Ok(format!("json_build_array({})", parts?.join(", ")))
        }
        literal => {
            let placeholder = dialect.push_param(params, Param::from(literal));
            Ok(placeholder)
        }
    }
}

fn translate_operator_document(
    dialect: &dyn Dialect,
    doc: &Document,
    params: &mut Vec<Param>,
) -> Result<String> {
    // A document all of whose keys are plain field names (no leading `$`)
    // is itself a literal sub-document, not an operator call.
    if doc.is_empty() || !doc.keys().all(|k| k.starts_with('$')) {
        let placeholder = dialect.push_param(params, Param::from(&Bson::Document(doc.clone())));
        return Ok(placeholder);
    }
    if doc.len() != 1 {
        return Err(RelayError::bad_value(
            "operator documents must have exactly one operator key",
        ));
    }
    let (op, operand) = doc.iter().next().unwrap();
    translate_operator(dialect, op, operand, params)
}

fn translate_operator(
    dialect: &dyn Dialect,
    op: &str,
    operand: &Bson,
    params: &mut Vec<Param>,
) -> Result<String> {
    match op {
        "$add" => fold_binary(dialect, operand, "+", params),
        "$subtract" => fold_binary_exact2(dialect, operand, "-", params),
        "$multiply" => fold_binary(dialect, operand, "*", params),
        "$divide" => fold_binary_exact2(dialect, operand, "/", params),
        "$mod" => fold_binary_exact2(dialect, operand, "%", params),

        "$concat" => {
            let args = operand_array(operand)?;
            let parts: Result<Vec<String>> = args
                .iter()
                .map(|a| translate(dialect, a, params))
                .collect();
            Ok(format!("CONCAT({})", parts?.join(", ")))
        }
        "$substr" | "$substrBytes" => {
            let args = operand_array(operand)?;
            if args.len() != 3 {
                return Err(RelayError::bad_value(format!("{op} requires 3 arguments")));
            }
            let subject = translate(dialect, &args[0], params)?;
            let start = translate(dialect, &args[1], params)?;
            let len = translate(dialect, &args[2], params)?;
            // MongoDB's $substr is 0-based; SQL SUBSTRING is 1-based.
            Ok(format!("SUBSTRING({subject} FROM ({start}) + 1 FOR {len})"))
        }
        "$toLower" => {
            let inner = translate(dialect, &single_operand(operand)?, params)?;
            Ok(format!("LOWER({inner})"))
        }
        "$toUpper" => {
            let inner = translate(dialect, &single_operand(operand)?, params)?;
            Ok(format!("UPPER({inner})"))
        }

        "$cond" => translate_cond(dialect, operand, params),
        "$ifNull" => {
            let args = operand_array(operand)?;
            if args.len() < 2 {
                return Err(RelayError::bad_value("$ifNull requires at least 2 arguments"));
            }
            let parts: Result<Vec<String>> = args
                .iter()
                .map(|a| translate(dialect, a, params))
                .collect();
            Ok(format!("COALESCE({})", parts?.join(", ")))
        }
        "$switch" => translate_switch(dialect, operand, params),

        "$eq" => fold_binary_exact2(dialect, operand, "=", params),
        "$ne" => fold_binary_exact2(dialect, operand, "!=", params),
        "$gt" => fold_binary_exact2(dialect, operand, ">", params),
        "$gte" => fold_binary_exact2(dialect, operand, ">=", params),
        "$lt" => fold_binary_exact2(dialect, operand, "<", params),
        "$lte" => fold_binary_exact2(dialect, operand, "<=", params),
        "$and" => fold_logical(dialect, operand, "AND", params),
        "$or" => fold_logical(dialect, operand, "OR", params),
        "$not" => {
            let inner = translate(dialect, &single_operand(operand)?, params)?;
            Ok(format!("NOT ({inner})"))
        }

        "$function" => translate_function(operand),

        other => Err(RelayError::bad_value(format!(
            "unsupported expression operator: {other}"
        ))),
    }
}

fn operand_array(operand: &Bson) -> Result<Vec<Bson>> {
    operand
        .as_array()
        .map(|a| a.to_vec())
        .ok_or_else(|| RelayError::bad_value("expected an argument array"))
}

fn single_operand(operand: &Bson) -> Result<Bson> {
    match operand.as_array() {
        Some(arr) if arr.len() == 1 => Ok(arr[0].clone()),
        Some(_) => Err(RelayError::bad_value("expected exactly one argument")),
        None => Ok(operand.clone()),
    }
}

/// N-ary arithmetic operators fold left: `$add: [a, b, c]` -> `((a + b) + c)`.
fn fold_binary(
    dialect: &dyn Dialect,
    operand: &Bson,
    sql_op: &str,
    params: &mut Vec<Param>,
) -> Result<String> {
    let args = operand_array(operand)?;
    if args.is_empty() {
        return Err(RelayError::bad_value(format!(
            "{sql_op} requires at least one argument"
        )));
    }
    let mut iter = args.iter();
    let mut acc = translate(dialect, iter.next().unwrap(), params)?;
    for arg in iter {
        let next = translate(dialect, arg, params)?;
        acc = format!("({acc} {sql_op} {next})");
    }
    Ok(acc)
}

/// `$subtract`/`$divide`/`$mod`/comparison operators are strictly binary.
fn fold_binary_exact2(
    dialect: &dyn Dialect,
    operand: &Bson,
    sql_op: &str,
    params: &mut Vec<Param>,
) -> Result<String> {
    let args = operand_array(operand)?;
    if args.len() != 2 {
        return Err(RelayError::bad_value(format!(
            "{sql_op} requires exactly 2 arguments"
        )));
    }
    let lhs = translate(dialect, &args[0], params)?;
    let rhs = translate(dialect, &args[1], params)?;
    Ok(format!("({lhs} {sql_op} {rhs})"))
}

fn fold_logical(
    dialect: &dyn Dialect,
    operand: &Bson,
    joiner: &str,
    params: &mut Vec<Param>,
) -> Result<String> {
    let args = operand_array(operand)?;
    if args.is_empty() {
        return Ok(dialect.bool_literal(joiner == "AND"));
    }
    let parts: Result<Vec<String>> = args.iter().map(|a| translate(dialect, a, params)).collect();
    Ok(format!("({})", parts?.join(&format!(" {joiner} "))))
}

fn translate_cond(dialect: &dyn Dialect, operand: &Bson, params: &mut Vec<Param>) -> Result<String> {
    let (if_expr, then_expr, else_expr) = match operand {
        Bson::Array(args) if args.len() == 3 => (args[0].clone(), args[1].clone(), args[2].clone()),
        Bson::Document(doc) => {
            let if_expr = doc
                .get("if")
                .ok_or_else(|| RelayError::bad_value("$cond requires an `if` field"))?
                .clone();
            let then_expr = doc
                .get("then")
                .ok_or_else(|| RelayError::bad_value("$cond requires a `then` field"))?
                .clone();
            let else_expr = doc
                .get("else")
                .ok_or_else(|| RelayError::bad_value("$cond requires an `else` field"))?
                .clone();
            (if_expr, then_expr, else_expr)
        }
        _ => return Err(RelayError::bad_value("$cond requires 3 arguments or if/then/else")),
    };
    let cond_sql = translate(dialect, &if_expr, params)?;
    let then_sql = translate(dialect, &then_expr, params)?;
    let else_sql = translate(dialect, &else_expr, params)?;
    Ok(format!("CASE WHEN {cond_sql} THEN {then_sql} ELSE {else_sql} END"))
}

fn translate_switch(dialect: &dyn Dialect, operand: &Bson, params: &mut Vec<Param>) -> Result<String> {
    let doc = operand
        .as_document()
        .ok_or_else(|| RelayError::bad_value("$switch requires a document"))?;
    let branches = doc
        .get_array("branches")
        .map_err(|_| RelayError::bad_value("$switch requires a `branches` array"))?;

    let mut sql = String::from("CASE");
    for branch in branches {
        let branch_doc = branch
            .as_document()
            .ok_or_else(|| RelayError::bad_value("$switch branch must be a document"))?;
        let case_expr = branch_doc
            .get("case")
            .ok_or_else(|| RelayError::bad_value("$switch branch requires `case`"))?;
        let then_expr = branch_doc
            .get("then")
            .ok_or_else(|| RelayError::bad_value("$switch branch requires `then`"))?;
        let case_sql = translate(dialect, case_expr, params)?;
        let then_sql = translate(dialect, then_expr, params)?;
        sql.push_str(&format!(" WHEN {case_sql} THEN {then_sql}"));
    }
    if let Some(default_expr) = doc.get("default") {
        let default_sql = translate(dialect, default_expr, params)?;
        sql.push_str(&format!(" ELSE {default_sql}"));
    } else {
        return Err(RelayError::bad_value(
            "$switch requires a `default` when no branch matches",
        ));
    }
    sql.push_str(" END");
    Ok(sql)
}

/// `$function` compiles to a placeholder literal instead of SQL (spec §4.2):
/// a sentinel-prefixed JSON payload the executor (C7) recognizes during
/// result rehydration and resolves via the function evaluator (C6).
fn translate_function(operand: &Bson) -> Result<String> {
    let doc = operand
        .as_document()
        .ok_or_else(|| RelayError::bad_value("$function requires a document"))?;
    let body = doc
        .get_str("body")
        .map_err(|_| RelayError::bad_value("$function requires a `body` string"))?
        .to_string();
    let args = doc
        .get_array("args")
        .map_err(|_| RelayError::bad_value("$function requires an `args` array"))?;

    let mut field_args = Vec::new();
    let mut literal_args = Vec::new();
    for (i, arg) in args.iter().enumerate() {
        match arg {
            Bson::String(s) if s.starts_with('$') && !s.starts_with("$$") => {
                field_args.push(s[1..].to_string());
            }
            other => {
                let json_value = bson_to_json(other);
                literal_args.push((i, json_value));
            }
        }
    }

    let call = FunctionCall {
        body,
        field_args,
        literal_args,
        arg_count: args.len(),
    };
    let payload = serde_json::to_string(&call)
        .map_err(|e| RelayError::internal_error(format!("failed to serialize $function call: {e}")))?;

    Ok(format!(
        "'{}{}'",
        FUNCTION_PLACEHOLDER_SENTINEL,
        crate::dialect::escape_sql_string_literal(&payload)
    ))
}

fn bson_to_json(value: &Bson) -> serde_json::Value {
    match value {
        Bson::Null => serde_json::Value::Null,
        Bson::Boolean(b) => json!(b),
        Bson::Int32(n) => json!(n),
        Bson::Int64(n) => json!(n),
        Bson::Double(d) => json!(d),
        Bson::String(s) => json!(s),
        other => json!(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::PostgresJsonbDialect;

    fn dialect() -> PostgresJsonbDialect {
        PostgresJsonbDialect::new("data")
    }

    #[test]
    fn field_reference_extracts_json_path() {
        let mut params = Vec::new();
        let sql = translate(&dialect(), &Bson::String("$a.0.b".to_string()), &mut params).unwrap();
        assert!(sql.contains("#>"));
        assert!(params.is_empty());
    }

    #[test]
    fn add_folds_left_for_nary_arguments() {
        let mut params = Vec::new();
        let expr = bson::doc! { "$add": [1, 2, 3] };
        let sql = translate(&dialect(), &Bson::Document(expr), &mut params).unwrap();
        assert_eq!(params.len(), 3);
        assert!(sql.starts_with("(("));
    }

    #[test]
    fn subtract_rejects_non_binary_arity() {
        let mut params = Vec::new();
        let expr = bson::doc! { "$subtract": [1, 2, 3] };
        let err = translate(&dialect(), &Bson::Document(expr), &mut params).unwrap_err();
        assert_eq!(err.code(), crate::error::code::BAD_VALUE);
    }

    #[test]
    fn cond_compiles_to_case_expression() {
        let mut params = Vec::new();
        let expr = bson::doc! { "$cond": ["$active", "yes", "no"] };
        let sql = translate(&dialect(), &Bson::Document(expr), &mut params).unwrap();
        assert!(sql.starts_with("CASE WHEN"));
    }

    #[test]
    fn switch_without_default_is_rejected() {
        let mut params = Vec::new();
        let expr = bson::doc! { "$switch": { "branches": [ { "case": true, "then": 1 } ] } };
        let err = translate(&dialect(), &Bson::Document(expr), &mut params).unwrap_err();
        assert_eq!(err.code(), crate::error::code::BAD_VALUE);
    }

    #[test]
    fn function_emits_sentinel_placeholder() {
        let expr = bson::doc! {
            "$function": { "body": "function(x) { return x + 1; }", "args": ["$count"] }
        };
        let mut params = Vec::new();
        let sql = translate(&dialect(), &Bson::Document(expr), &mut params).unwrap();
        assert!(sql.contains(FUNCTION_PLACEHOLDER_SENTINEL));
        assert!(params.is_empty());
    }

    #[test]
    fn function_call_content_hash_is_stable() {
        let call = FunctionCall {
            body: "function(x) { return x; }".to_string(),
            field_args: vec!["x".to_string()],
            literal_args: vec![],
            arg_count: 1,
        };
        let hash1 = call.content_hash();
        let hash2 = call.content_hash();
        assert_eq!(hash1, hash2);
        assert_eq!(hash1.len(), 16);
    }

    #[test]
    fn let_binding_variables_are_rejected() {
        let mut params = Vec::new();
        let err = translate(&dialect(), &Bson::String("$$ROOT".to_string()), &mut params).unwrap_err();
        assert_eq!(err.code(), crate::error::code::BAD_VALUE);
    }
}
