/*!
 * @file optimizer.rs
 * @brief Pipeline Optimizer (C4): semantics-preserving stage-list rewrites
 *
 * Three rewrites applied in order (spec §4.4): predicate pushdown, fusion,
 * elimination. Each operates purely on the `Stage` IR so it composes ahead
 * of the aggregation translator (C5) without either module needing to know
 * about SQL.
 */

use bson::Bson;

use crate::document::parse_field_path;
use crate::document::PathSegment;
use crate::stage::{always_flushes, is_shape_preserving, referenced_output_fields, Stage};

pub fn optimize(stages: Vec<Stage>) -> Vec<Stage> {
    let stages = pushdown_match(stages);
    let stages = fuse(stages);
    eliminate(stages)
}

/// Move each `$match` toward the front, stopping before the earliest
/// upstream stage that (a) changes shape in a way invalidating the
/// predicate's field references, (b) is `$limit`/`$skip`, or (c) is
/// `$group` (spec §4.4.1).
fn pushdown_match(stages: Vec<Stage>) -> Vec<Stage> {
    let mut stages = stages;
    let mut i = 1;
    while i < stages.len() {
        if !matches!(stages[i], Stage::Match(_)) {
            i += 1;
            continue;
        }
        let match_fields = match &stages[i] {
            Stage::Match(filter) => referenced_filter_fields(filter),
            _ => unreachable!(),
        };

        let mut target = i;
        while target > 0 {
            let upstream = &stages[target - 1];
            if matches!(upstream, Stage::Limit(_) | Stage::Skip(_) | Stage::Group(_)) {
                break;
            }
            if blocks_pushdown(upstream, &match_fields) {
                break;
            }
            target -= 1;
        }

        if target < i {
            let match_stage = stages.remove(i);
            stages.insert(target, match_stage);
        }
        i += 1;
    }
    stages
}

fn blocks_pushdown(upstream: &Stage, match_fields: &[String]) -> bool {
    match referenced_output_fields(upstream) {
        None => true,
        Some(touched) if touched.is_empty() => false,
        Some(touched) => match_fields
            .iter()
            .any(|f| touched.iter().any(|t| paths_overlap(f, t))),
    }
}

fn paths_overlap(a: &str, b: &str) -> bool {
    a == b || a.starts_with(&format!("{b}.")) || b.starts_with(&format!("{a}."))
}

fn referenced_filter_fields(filter: &bson::Document) -> Vec<String> {
    let mut fields = Vec::new();
    collect_filter_fields(filter, &mut fields);
    fields
}

fn collect_filter_fields(doc: &bson::Document, out: &mut Vec<String>) {
    for (key, value) in doc {
        if key.starts_with('$') {
            if let Bson::Array(arr) = value {
                for item in arr {
                    if let Some(inner) = item.as_document() {
                        collect_filter_fields(inner, out);
                    }
                }
            }
        } else {
            out.push(key.clone());
        }
    }
}

/// Adjacent `$match` pairs combine under `$and`; adjacent `$addFields`
/// merge by key-wise override; adjacent `$project` of the same polarity
/// merge. Stages of different polarity never merge (spec §4.4.2).
fn fuse(stages: Vec<Stage>) -> Vec<Stage> {
    let mut out: Vec<Stage> = Vec::with_capacity(stages.len());
    for stage in stages {
        match (out.last_mut(), &stage) {
            (Some(Stage::Match(prev)), Stage::Match(next)) => {
                let mut merged = bson::Document::new();
                merged.insert("$and", vec![Bson::Document(prev.clone()), Bson::Document(next.clone())]);
                *out.last_mut().unwrap() = Stage::Match(merged);
            }
            (Some(Stage::AddFields(prev)), Stage::AddFields(next)) => {
                let mut merged = prev.clone();
                merged.extend(next.clone());
                *out.last_mut().unwrap() = Stage::AddFields(merged);
            }
            (Some(Stage::Project(prev)), Stage::Project(next)) if same_project_polarity(prev, next) => {
                let mut merged = prev.clone();
                merged.extend(next.clone());
                *out.last_mut().unwrap() = Stage::Project(merged);
            }
            _ => out.push(stage),
        }
    }
    out
}

fn same_project_polarity(a: &bson::Document, b: &bson::Document) -> bool {
    is_exclusion_project(a) == is_exclusion_project(b)
}

fn is_exclusion_project(doc: &bson::Document) -> bool {
    doc.iter()
        .filter(|(k, _)| k.as_str() != "_id")
        .all(|(_, v)| matches!(v, Bson::Int32(0) | Bson::Int64(0) | Bson::Boolean(false)))
}

/// Drop empty `$match` documents, and a `$sort` immediately followed
/// (without an intervening `$sort`/`$limit`/`$skip`) by another `$sort`
/// (spec §4.4.3).
fn eliminate(stages: Vec<Stage>) -> Vec<Stage> {
    let mut out: Vec<Stage> = Vec::with_capacity(stages.len());
    for stage in stages {
        if let Stage::Match(filter) = &stage {
            if filter.is_empty() {
                continue;
            }
        }
        if let Stage::Sort(_) = &stage {
            if let Some(Stage::Sort(_)) = out.last() {
                out.pop();
            }
        }
        out.push(stage);
    }
    out
}

/// Used by stage-aware callers that need to know whether a field path is
/// only ever a prefix/suffix match against another (array-index-agnostic).
#[allow(dead_code)]
fn path_segments_overlap(a: &str, b: &str) -> bool {
    let sa = parse_field_path(a);
    let sb = parse_field_path(b);
    sa.iter().zip(sb.iter()).all(|(x, y)| match (x, y) {
        (PathSegment::Key(kx), PathSegment::Key(ky)) => kx == ky,
        (PathSegment::Index(ix), PathSegment::Index(iy)) => ix == iy,
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::parse_stage;

    #[test]
    fn adjacent_matches_fuse_under_and() {
        let stages = vec![
            parse_stage(&bson::doc! { "$match": { "a": 1 } }).unwrap(),
            parse_stage(&bson::doc! { "$match": { "b": 2 } }).unwrap(),
        ];
        let optimized = optimize(stages);
        assert_eq!(optimized.len(), 1);
        assert!(matches!(optimized[0], Stage::Match(_)));
    }

    #[test]
    fn empty_match_is_eliminated() {
        let stages = vec![parse_stage(&bson::doc! { "$match": {} }).unwrap()];
        let optimized = optimize(stages);
        assert!(optimized.is_empty());
    }

    #[test]
    fn redundant_sort_is_eliminated() {
        let stages = vec![
            parse_stage(&bson::doc! { "$sort": { "a": 1 } }).unwrap(),
            parse_stage(&bson::doc! { "$sort": { "b": -1 } }).unwrap(),
        ];
        let optimized = optimize(stages);
        assert_eq!(optimized.len(), 1);
        match &optimized[0] {
            Stage::Sort(spec) => assert!(spec.contains_key("b")),
            _ => panic!("expected Sort"),
        }
    }

    #[test]
    fn match_pushes_past_untouched_project() {
        let stages = vec![
            parse_stage(&bson::doc! { "$project": { "name": 1, "age": 1 } }).unwrap(),
            parse_stage(&bson::doc! { "$match": { "age": { "$gte": 18 } } }).unwrap(),
        ];
        let optimized = optimize(stages);
        assert!(matches!(optimized[0], Stage::Match(_)));
    }

    #[test]
    fn match_does_not_push_past_group() {
        let stages = vec![
            parse_stage(&bson::doc! { "$group": { "_id": "$status" } }).unwrap(),
            parse_stage(&bson::doc! { "$match": { "status": "active" } }).unwrap(),
        ];
        let optimized = optimize(stages);
        assert!(matches!(optimized[0], Stage::Group(_)));
    }
}
