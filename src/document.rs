/*!
 * @file document.rs
 * @brief Field-path helpers shared by the translators and executor
 */

use bson::{Bson, Document};

/// A single segment of a dotted field path: either a map key or an array index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// Split `"a.b.0.c"` into `[Key(a), Key(b), Index(0), Key(c)]`. A segment
/// that parses as a plain non-negative integer is an array index; anything
/// else is a map key (spec §3: "numeric path segments index into arrays").
pub fn parse_field_path(path: &str) -> Vec<PathSegment> {
    path.split('.')
        .map(|seg| match seg.parse::<usize>() {
            Ok(n) if !seg.is_empty() && seg.chars().all(|c| c.is_ascii_digit()) => {
                PathSegment::Index(n)
            }
            _ => PathSegment::Key(seg.to_string()),
        })
        .collect()
}

/// `"a.b.0.c"` -> `"$.a.b[0].c"` (spec §4.1, §8 round-trip law).
pub fn field_to_json_path(path: &str) -> String {
    let mut out = String::from("$");
    for seg in parse_field_path(path) {
        match seg {
            PathSegment::Key(k) => {
                out.push('.');
                out.push_str(&k);
            }
            PathSegment::Index(i) => {
                out.push('[');
                out.push_str(&i.to_string());
                out.push(']');
            }
        }
    }
    out
}

/// Inverse of [`field_to_json_path`]: `"$.a[0].b"` -> `"a.0.b"`.
pub fn json_path_to_field(json_path: &str) -> String {
    let rest = json_path.strip_prefix('$').unwrap_or(json_path);
    let mut out = String::new();
    let mut chars = rest.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if !out.is_empty() {
                    out.push('.');
                }
            }
            '[' => {
                let mut idx = String::new();
                for d in chars.by_ref() {
                    if d == ']' {
                        break;
                    }
                    idx.push(d);
                }
                if !out.is_empty() && !out.ends_with('.') {
                    out.push('.');
                }
                out.push_str(&idx);
            }
            other => out.push(other),
        }
    }
    out
}

/// Navigate a document by dotted field path, following array indices.
pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    let segments = parse_field_path(path);
    let mut current: Option<&Bson> = None;
    for (i, seg) in segments.iter().enumerate() {
        current = if i == 0 {
            match seg {
                PathSegment::Key(k) => doc.get(k),
                PathSegment::Index(_) => None,
            }
        } else {
            match (current, seg) {
                (Some(Bson::Document(d)), PathSegment::Key(k)) => d.get(k),
                (Some(Bson::Array(a)), PathSegment::Index(idx)) => a.get(*idx),
                _ => None,
            }
        };
        if current.is_none() {
            return None;
        }
    }
    current
}

/// Set a value at a dotted field path, creating intermediate documents as
/// needed (used by `$set`/`$addFields` and the document backend's `$set`
/// update operator). Array index segments require the target array to
/// already exist and be long enough.
pub fn set_path(doc: &mut Document, path: &str, value: Bson) {
    let segments = parse_field_path(path);
    set_path_segments(doc, &segments, value);
}

fn set_path_segments(doc: &mut Document, segments: &[PathSegment], value: Bson) {
    match segments.first() {
        None => {}
        Some(PathSegment::Key(k)) if segments.len() == 1 => {
            doc.insert(k.clone(), value);
        }
        Some(PathSegment::Key(k)) => {
            let entry = doc
                .entry(k.clone())
                .or_insert_with(|| Bson::Document(Document::new()));
            if !matches!(entry, Bson::Document(_)) {
                *entry = Bson::Document(Document::new());
            }
            if let Bson::Document(inner) = entry {
                set_path_segments(inner, &segments[1..], value);
            }
        }
        Some(PathSegment::Index(_)) => {
            // Setting directly into an array root isn't reachable from a
            // document's top level; callers resolve the parent array first.
        }
    }
}

/// Remove a value at a dotted field path (`$unset`).
pub fn unset_path(doc: &mut Document, path: &str) {
    let segments = parse_field_path(path);
    unset_path_segments(doc, &segments);
}

fn unset_path_segments(doc: &mut Document, segments: &[PathSegment]) {
    match segments.first() {
        None => {}
        Some(PathSegment::Key(k)) if segments.len() == 1 => {
            doc.remove(k);
        }
        Some(PathSegment::Key(k)) => {
            if let Some(Bson::Document(inner)) = doc.get_mut(k) {
                unset_path_segments(inner, &segments[1..]);
            }
        }
        Some(PathSegment::Index(_)) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_path_derivation_matches_spec_example() {
        assert_eq!(field_to_json_path("a.0.b"), "$.a[0].b");
    }

    #[test]
    fn json_path_round_trips() {
        let field = "a.0.b";
        let json_path = field_to_json_path(field);
        assert_eq!(json_path_to_field(&json_path), field);
    }

    #[test]
    fn get_and_set_nested_path() {
        let mut doc = Document::new();
        set_path(&mut doc, "a.b.c", Bson::Int32(7));
        assert_eq!(get_path(&doc, "a.b.c"), Some(&Bson::Int32(7)));
    }

    #[test]
    fn unset_removes_leaf() {
        let mut doc = bson::doc! { "a": { "b": 1, "c": 2 } };
        unset_path(&mut doc, "a.b");
        assert_eq!(get_path(&doc, "a.b"), None);
        assert_eq!(get_path(&doc, "a.c"), Some(&Bson::Int32(2)));
    }
}
