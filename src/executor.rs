/*!
 * @file executor.rs
 * @brief Aggregation Executor (C7): runs compiled statements, resolves `$function` placeholders
 *
 * Implements spec §4.7 steps 4-7: after a compiled statement's rows are
 * parsed to documents, this module walks them for `$function` placeholder
 * strings emitted by the expression translator (C2), groups the calls by
 * function body, resolves each group through the function evaluator (C6),
 * and writes results back in place. `$function` arguments that are field
 * references are resolved against the *same* result document the
 * placeholder was found in — the only document available once SQL
 * execution has already materialized rows — rather than against whatever
 * upstream document a `$project`/`$addFields` chain may have discarded.
 */

use bson::{Bson, Document};

use crate::document::PathSegment;
use crate::error::Result;
use crate::expr::{FunctionCall, FUNCTION_PLACEHOLDER_SENTINEL};
use crate::function_evaluator::FunctionEvaluator;

struct Pending {
    doc_index: usize,
    path: Vec<PathSegment>,
    call: FunctionCall,
    args: Vec<serde_json::Value>,
}

/// Scan `documents` for `$function` placeholder strings, resolve them via
/// `evaluator`, and assign results back in place (spec §4.7 steps 4-6).
pub fn resolve_function_placeholders(documents: &mut [Document], evaluator: &FunctionEvaluator) -> Result<()> {
    let mut pending = Vec::new();
    for (doc_index, doc) in documents.iter().enumerate() {
        let mut path = Vec::new();
        walk(&Bson::Document(doc.clone()), doc, &mut path, doc_index, &mut pending);
    }
    if pending.is_empty() {
        return Ok(());
    }

    // Group by function body so each distinct $function call is batched once.
    let mut groups: Vec<(String, FunctionCall, Vec<usize>)> = Vec::new();
    for (i, item) in pending.iter().enumerate() {
        let hash = item.call.content_hash();
        if let Some(group) = groups.iter_mut().find(|(h, _, _)| h == &hash) {
            group.2.push(i);
        } else {
            groups.push((hash, item.call.clone(), vec![i]));
        }
    }

    let mut resolved = vec![None; pending.len()];
    for (_, call, indices) in &groups {
        let arg_tuples: Vec<Vec<serde_json::Value>> = indices.iter().map(|&i| pending[i].args.clone()).collect();
        let results = evaluator.execute_batch(call, &arg_tuples)?;
        for (&i, result) in indices.iter().zip(results) {
            resolved[i] = Some(result);
        }
    }

    for (item, result) in pending.into_iter().zip(resolved) {
        let Some(result) = result else { continue };
        let bson_value = bson::to_bson(&result)?;
        set_at_path(&mut documents[item.doc_index], &item.path, bson_value);
    }

    Ok(())
}

/// If the compiled pipeline had a `$sort` after a `$function` projection,
/// the backend sorted on unresolved placeholder strings; re-sort in memory
/// now that their real values are known (spec §4.7 step 7).
pub fn reapply_trailing_sort(documents: &mut [Document], sort_spec: &Document) {
    let keys: Vec<(String, i64)> = sort_spec
        .iter()
        .map(|(k, v)| (k.clone(), v.as_i64().or_else(|| v.as_i32().map(i64::from)).unwrap_or(1)))
        .collect();
    documents.sort_by(|a, b| {
        for (field, direction) in &keys {
            let ord = compare_bson(crate::document::get_path(a, field), crate::document::get_path(b, field));
            let ord = if *direction < 0 { ord.reverse() } else { ord };
            if ord != std::cmp::Ordering::Equal {
                return ord;
            }
        }
        std::cmp::Ordering::Equal
    });
}

fn compare_bson(a: Option<&Bson>, b: Option<&Bson>) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(fx), Some(fy)) => fx.partial_cmp(&fy).unwrap_or(Ordering::Equal),
            _ => x.to_string().cmp(&y.to_string()),
        },
    }
}

fn walk(value: &Bson, root: &Document, path: &mut Vec<PathSegment>, doc_index: usize, pending: &mut Vec<Pending>) {
    match value {
        Bson::String(s) if s.starts_with(FUNCTION_PLACEHOLDER_SENTINEL) => {
            let payload = &s[FUNCTION_PLACEHOLDER_SENTINEL.len()..];
            let Ok(call) = serde_json::from_str::<FunctionCall>(payload) else {
                return;
            };
            let args = extract_args(&call, root);
            pending.push(Pending {
                doc_index,
                path: path.clone(),
                call,
                args,
            });
        }
        Bson::Document(doc) => {
            for (k, v) in doc {
                path.push(PathSegment::Key(k.clone()));
                walk(v, root, path, doc_index, pending);
                path.pop();
            }
        }
        Bson::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                path.push(PathSegment::Index(i));
                walk(v, root, path, doc_index, pending);
                path.pop();
            }
        }
        _ => {}
    }
}

/// Merge `field_args` (resolved against `root`) and `literal_args` into one
/// positional argument list of length `call.arg_count`.
fn extract_args(call: &FunctionCall, root: &Document) -> Vec<serde_json::Value> {
    let mut args = vec![serde_json::Value::Null; call.arg_count];
    let literal_positions: std::collections::HashSet<usize> = call.literal_args.iter().map(|(i, _)| *i).collect();
    let mut field_iter = call.field_args.iter();
    for pos in 0..call.arg_count {
        if literal_positions.contains(&pos) {
            continue;
        }
        if let Some(field_path) = field_iter.next() {
            args[pos] = crate::document::get_path(root, field_path)
                .map(bson_to_json)
                .unwrap_or(serde_json::Value::Null);
        }
    }
    for (pos, value) in &call.literal_args {
        if *pos < args.len() {
            args[*pos] = value.clone();
        }
    }
    args
}

fn bson_to_json(value: &Bson) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

/// Navigate `doc` by `path`, writing `value` at the leaf. Array segments are
/// supported, unlike [`crate::document::set_path`] which only ever needs to
/// write into maps.
fn set_at_path(doc: &mut Document, path: &[PathSegment], value: Bson) {
    let Some((first, rest)) = path.split_first() else { return };
    let PathSegment::Key(key) = first else { return };
    if rest.is_empty() {
        doc.insert(key.clone(), value);
        return;
    }
    if let Some(child) = doc.get_mut(key.as_str()) {
        set_in_bson(child, rest, value);
    }
}

fn set_in_bson(current: &mut Bson, path: &[PathSegment], value: Bson) {
    let Some((first, rest)) = path.split_first() else {
        *current = value;
        return;
    };
    match (current, first) {
        (Bson::Document(d), PathSegment::Key(k)) => {
            if rest.is_empty() {
                d.insert(k.clone(), value);
            } else if let Some(child) = d.get_mut(k.as_str()) {
                set_in_bson(child, rest, value);
            }
        }
        (Bson::Array(a), PathSegment::Index(idx)) => {
            if let Some(child) = a.get_mut(*idx) {
                if rest.is_empty() {
                    *child = value;
                } else {
                    set_in_bson(child, rest, value);
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FunctionEvaluatorConfig;

    fn evaluator() -> FunctionEvaluator {
        let config = FunctionEvaluatorConfig::default();
        FunctionEvaluator::new(config.enabled, config.cache_capacity)
    }

    fn placeholder(body: &str, field_args: Vec<&str>, arg_count: usize) -> Bson {
        let call = FunctionCall {
            body: body.to_string(),
            field_args: field_args.into_iter().map(String::from).collect(),
            literal_args: vec![],
            arg_count,
        };
        let payload = serde_json::to_string(&call).unwrap();
        Bson::String(format!("{FUNCTION_PLACEHOLDER_SENTINEL}{payload}"))
    }

    #[test]
    fn resolves_a_top_level_placeholder() {
        let mut docs = vec![bson::doc! {
            "score": 10i32,
            "doubled": placeholder("function(x) { return x * 2; }", vec!["score"], 1),
        }];
        resolve_function_placeholders(&mut docs, &evaluator()).unwrap();
        assert_eq!(docs[0].get_i64("doubled").unwrap(), 20);
    }

    #[test]
    fn resolves_a_nested_placeholder_across_multiple_documents() {
        let mut docs = vec![
            bson::doc! { "n": 1i32, "nested": { "r": placeholder("function(x) { return x + 1; }", vec!["n"], 1) } },
            bson::doc! { "n": 5i32, "nested": { "r": placeholder("function(x) { return x + 1; }", vec!["n"], 1) } },
        ];
        resolve_function_placeholders(&mut docs, &evaluator()).unwrap();
        let r0 = docs[0].get_document("nested").unwrap().get_i64("r").unwrap();
        let r1 = docs[1].get_document("nested").unwrap().get_i64("r").unwrap();
        assert_eq!(r0, 2);
        assert_eq!(r1, 6);
    }

    #[test]
    fn reapplies_a_trailing_sort_after_resolution() {
        let mut docs = vec![
            bson::doc! { "n": 3i32, "key": placeholder("function(x) { return x; }", vec!["n"], 1) },
            bson::doc! { "n": 1i32, "key": placeholder("function(x) { return x; }", vec!["n"], 1) },
            bson::doc! { "n": 2i32, "key": placeholder("function(x) { return x; }", vec!["n"], 1) },
        ];
        resolve_function_placeholders(&mut docs, &evaluator()).unwrap();
        reapply_trailing_sort(&mut docs, &bson::doc! { "key": 1 });
        let values: Vec<i64> = docs.iter().map(|d| d.get_i64("key").unwrap()).collect();
        assert_eq!(values, vec![1, 2, 3]);
    }

    #[test]
    fn no_placeholders_is_a_no_op() {
        let mut docs = vec![bson::doc! { "a": 1i32 }];
        resolve_function_placeholders(&mut docs, &evaluator()).unwrap();
        assert_eq!(docs[0].get_i64("a").unwrap(), 1);
    }
}
