//! Literal escaping for callers that substitute values into query text.
//!
//! Prefer bound parameters. These helpers exist for queries assembled as text
//! and only make a value safe to place between single quotes.

use crate::types::BackendKind;

/// `'` becomes `''`
pub fn double_single_quotes(value: &str) -> String {
    value.replace('\'', "''")
}

/// Quotes doubled, `&` spliced out through `chr(38)` so client-side
/// substitution variables never see it
pub fn postgres_literal(value: &str) -> String {
    double_single_quotes(value).replace('&', "' || chr(38) || '")
}

pub fn escape_literal(kind: BackendKind, value: &str) -> String {
    match kind {
        BackendKind::Postgres => postgres_literal(value),
        BackendKind::Sqlite => double_single_quotes(value),
        BackendKind::MongoDb | BackendKind::Elasticsearch | BackendKind::Redis => {
            value.to_string()
        }
    }
}
