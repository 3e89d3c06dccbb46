/*!
 * @file dialect.rs
 * @brief SQL dialect abstraction shared by the query/expression/aggregation
 * translators (C1-C5) and both backend adapters (C9, C10).
 *
 * Per spec §9 REDESIGN FLAGS ("OLAP pipeline translator vs general
 * translator"): one IR, one optimizer, N dialect emitters. `Dialect` is the
 * seam: the document backend emits Postgres/JSONB SQL, the OLAP backend
 * emits the columnar engine's dialect, and every translator above this line
 * is dialect-agnostic.
 */

use std::sync::OnceLock;

use bson::Bson;
use regex::Regex;

use crate::document::parse_field_path;
use crate::document::PathSegment;

fn postgres_placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$(\d+)").unwrap())
}

fn clickhouse_placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{p(\d+):").unwrap())
}

/// A bound parameter value, carried alongside SQL text so a backend can bind
/// it however its transport requires (positional placeholders for Postgres,
/// named URL-escaped parameters for the OLAP HTTP transport).
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
}

impl From<&Bson> for Param {
    fn from(value: &Bson) -> Self {
        match value {
            Bson::Null => Param::Null,
            Bson::Boolean(b) => Param::Bool(*b),
            Bson::Int32(n) => Param::Int(*n as i64),
            Bson::Int64(n) => Param::Int(*n),
            Bson::Double(d) => Param::Double(*d),
            Bson::String(s) => Param::String(s.clone()),
            Bson::ObjectId(oid) => Param::String(oid.to_hex()),
            Bson::DateTime(dt) => Param::Int(dt.timestamp_millis()),
            other => Param::String(other.to_string()),
        }
    }
}

/// Column expressions and quoting rules for one backend's SQL dialect.
/// Implementations are pure and synchronous (spec §9: "Async everywhere" —
/// translation never suspends).
pub trait Dialect {
    /// Quote an identifier (table/column name) for inclusion in SQL text.
    fn quote_ident(&self, ident: &str) -> String;

    /// The document column's SQL expression (e.g. `data`, `document`).
    fn document_column(&self) -> &str;

    /// Extract the field at `json_path` (spec §4.1 form, e.g. `$.a[0].b`)
    /// from the document column as a JSON/JSONB scalar, for use in
    /// comparisons that need to distinguish `NULL` from absent.
    fn json_extract(&self, json_path: &str) -> String;

    /// Extract the field at `json_path` coerced to text, for string
    /// comparisons and full-text predicates.
    fn json_extract_text(&self, json_path: &str) -> String;

    /// Append a bound parameter and return the placeholder text to splice
    /// into the SQL (`$3` for Postgres, `{p3:String}` for the OLAP dialect).
    fn push_param(&self, params: &mut Vec<Param>, value: Param) -> String;

    /// Shift every placeholder already embedded in `sql` up by `offset`
    /// (spec §3 Compiled Statement: one bound-parameter list per statement).
    /// Each translator emits fragments numbered from 1 in isolation; when
    /// two independently-translated fragments are concatenated into one
    /// statement, the second fragment's placeholders must be renumbered
    /// past the first's before the two parameter lists are joined.
    fn renumber_params(&self, sql: &str, offset: usize) -> String;

    /// SQL boolean literal.
    fn bool_literal(&self, value: bool) -> String {
        if value {
            "TRUE".to_string()
        } else {
            "FALSE".to_string()
        }
    }

    /// Whether this dialect allows mutation at all (OLAP is read-only).
    fn is_read_only(&self) -> bool {
        false
    }
}

/// Render a spec-form field path (`a.b.0.c`) into this dialect's JSON path
/// syntax internally; dialects receive the `$.a.b[0].c` form already derived
/// by [`crate::document::field_to_json_path`] and only need to translate the
/// bracket/dot syntax into their own extraction function call.
pub fn json_path_segments(json_path: &str) -> Vec<PathSegment> {
    parse_field_path(&crate::document::json_path_to_field(json_path))
}

/// Postgres + JSONB dialect used by the document backend (C9).
pub struct PostgresJsonbDialect {
    pub document_column: String,
}

impl PostgresJsonbDialect {
    pub fn new(document_column: impl Into<String>) -> Self {
        Self {
            document_column: document_column.into(),
        }
    }

    fn path_array_literal(&self, json_path: &str) -> String {
        let segments = json_path_segments(json_path);
        let parts: Vec<String> = segments
            .into_iter()
            .map(|seg| match seg {
                PathSegment::Key(k) => k,
                PathSegment::Index(i) => i.to_string(),
            })
            .collect();
        format!("{{{}}}", parts.join(","))
    }
}

impl Dialect for PostgresJsonbDialect {
    fn quote_ident(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn document_column(&self) -> &str {
        &self.document_column
    }

    fn json_extract(&self, json_path: &str) -> String {
        format!(
            "{} #> '{}'",
            self.document_column,
            self.path_array_literal(json_path)
        )
    }

    fn json_extract_text(&self, json_path: &str) -> String {
        format!(
            "{} #>> '{}'",
            self.document_column,
            self.path_array_literal(json_path)
        )
    }

    fn push_param(&self, params: &mut Vec<Param>, value: Param) -> String {
        params.push(value);
        format!("${}", params.len())
    }

    fn renumber_params(&self, sql: &str, offset: usize) -> String {
        if offset == 0 {
            return sql.to_string();
        }
        postgres_placeholder_pattern()
            .replace_all(sql, |caps: &regex::Captures| {
                let n: usize = caps[1].parse().unwrap();
                format!("${}", n + offset)
            })
            .into_owned()
    }
}

/// The OLAP backend's columnar-engine dialect (C10). Identifiers are
/// backtick-quoted, nested paths use the engine's JSON-extract-string
/// function, and string literals are escaped by doubling single quotes
/// when inlined; bound values otherwise travel as named URL parameters
/// (spec §6 OLAP HTTP).
pub struct ClickHouseDialect {
    pub document_column: String,
}

impl ClickHouseDialect {
    pub fn new(document_column: impl Into<String>) -> Self {
        Self {
            document_column: document_column.into(),
        }
    }
}

impl Dialect for ClickHouseDialect {
    fn quote_ident(&self, ident: &str) -> String {
        format!("`{}`", ident.replace('`', "``"))
    }

    fn document_column(&self) -> &str {
        &self.document_column
    }

    fn json_extract(&self, json_path: &str) -> String {
        let field = crate::document::json_path_to_field(json_path);
        format!(
            "JSONExtractRaw({}, '{}')",
            self.document_column,
            field.replace('\'', "''")
        )
    }

    fn json_extract_text(&self, json_path: &str) -> String {
        let field = crate::document::json_path_to_field(json_path);
        format!(
            "JSONExtractString({}, '{}')",
            self.document_column,
            field.replace('\'', "''")
        )
    }

    fn push_param(&self, params: &mut Vec<Param>, value: Param) -> String {
        params.push(value);
        let name = format!("p{}", params.len());
        let ty = match params.last().unwrap() {
            Param::Null => "Nullable(String)",
            Param::Bool(_) => "UInt8",
            Param::Int(_) => "Int64",
            Param::Double(_) => "Float64",
            Param::String(_) => "String",
            Param::Bytes(_) => "String",
        };
        format!("{{{}:{}}}", name, ty)
    }

    fn renumber_params(&self, sql: &str, offset: usize) -> String {
        if offset == 0 {
            return sql.to_string();
        }
        clickhouse_placeholder_pattern()
            .replace_all(sql, |caps: &regex::Captures| {
                let n: usize = caps[1].parse().unwrap();
                format!("{{p{}:", n + offset)
            })
            .into_owned()
    }
}

pub fn escape_sql_string_literal(s: &str) -> String {
    s.replace('\'', "''")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn postgres_renumber_shifts_every_placeholder() {
        let dialect = PostgresJsonbDialect::new("data");
        let sql = "col = $1 AND other = $2";
        assert_eq!(dialect.renumber_params(sql, 2), "col = $3 AND other = $4");
        assert_eq!(dialect.renumber_params(sql, 0), sql);
    }

    #[test]
    fn clickhouse_renumber_shifts_named_placeholders_and_keeps_types() {
        let dialect = ClickHouseDialect::new("doc");
        let sql = "col = {p1:Int64} AND other = {p2:String}";
        assert_eq!(
            dialect.renumber_params(sql, 3),
            "col = {p4:Int64} AND other = {p5:String}"
        );
    }
}
